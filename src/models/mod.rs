//! Text-region segmentation networks.
//!
//! Both networks map a page image to a single-channel logit map of the same
//! spatial size. They are built on candle modules and can additionally trace
//! themselves into an ONNX graph (see [`crate::onnx::Traceable`]).

pub mod geometry;
pub mod layers;
pub mod pretrained;
pub mod resnet;
pub mod segmentation;

pub use geometry::{Pad2, Resolution, UpsampleGeometry};
pub use pretrained::{PretrainedConfig, PretrainedTextDetector};
pub use resnet::{BackboneFeatures, ResNet34};
pub use segmentation::{SegmentationConfig, SegmentationTextDetector};

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::info;

use crate::core::{Architecture, BackboneMode, DetectorError, DetectorResult};
use crate::onnx::Traceable;

/// A network that turns `[N, C, H, W]` pages into `[N, 1, H, W]` text logits.
pub trait TextDetector: Traceable + Send + Sync {
    /// Short architecture name used in logs.
    fn name(&self) -> &'static str;

    fn input_channels(&self) -> usize;

    /// The resolution the network was constructed for.
    fn resolution(&self) -> Resolution;

    /// Runs the network. Inputs of any other shape than
    /// [`TextDetector::input_dims`] (up to the batch size) are rejected.
    fn forward(&self, x: &Tensor) -> DetectorResult<Tensor>;

    fn input_dims(&self, batch: usize) -> [usize; 4] {
        let r = self.resolution();
        [batch, self.input_channels(), r.height, r.width]
    }

    fn output_dims(&self, batch: usize) -> [usize; 4] {
        let r = self.resolution();
        [batch, 1, r.height, r.width]
    }

    /// Rejects inputs that do not match the configured channels and resolution.
    fn check_input(&self, x: &Tensor) -> DetectorResult<()> {
        let dims = x.dims();
        let batch = dims.first().copied().unwrap_or(0);
        let expected = self.input_dims(batch);
        if dims != expected || batch == 0 {
            return Err(DetectorError::shape_mismatch(
                format!("{} network input", self.name()),
                &expected,
                dims,
            ));
        }
        Ok(())
    }
}

/// Builds the requested architecture with weights from `vb`.
pub fn build_detector(
    architecture: Architecture,
    resolution: Resolution,
    mode: BackboneMode,
    vb: VarBuilder,
) -> DetectorResult<Box<dyn TextDetector>> {
    info!(%resolution, ?architecture, ?mode, "building text detector");
    Ok(match architecture {
        Architecture::Pretrained => Box::new(PretrainedTextDetector::load(
            PretrainedConfig { resolution, mode },
            vb,
        )?),
        Architecture::Segmentation => Box::new(SegmentationTextDetector::load(
            SegmentationConfig::new(resolution),
            vb,
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_build_detector_channels() -> DetectorResult<()> {
        // the two networks share parameter names with different shapes
        let (seg_vars, pre_vars) = (VarMap::new(), VarMap::new());
        let r = Resolution::new(64, 64);
        let vb = VarBuilder::from_varmap(&seg_vars, DType::F32, &Device::Cpu);
        let seg = build_detector(Architecture::Segmentation, r, BackboneMode::Frozen, vb)?;
        assert_eq!(seg.input_dims(2), [2, 1, 64, 64]);
        let vb = VarBuilder::from_varmap(&pre_vars, DType::F32, &Device::Cpu);
        let pre = build_detector(Architecture::Pretrained, r, BackboneMode::Frozen, vb)?;
        assert_eq!(pre.input_dims(1), [1, 3, 64, 64]);
        assert_eq!(pre.output_dims(1), [1, 1, 64, 64]);
        Ok(())
    }

    #[test]
    fn test_check_input_rejects_empty_batch() -> DetectorResult<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let detector = build_detector(
            Architecture::Segmentation,
            Resolution::new(32, 32),
            BackboneMode::Frozen,
            vb,
        )?;
        let x = Tensor::zeros((0, 1, 32, 32), DType::F32, &Device::Cpu)?;
        assert!(detector.check_input(&x).is_err());
        Ok(())
    }
}
