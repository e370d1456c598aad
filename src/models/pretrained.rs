//! Text detector with a ResNet-34 encoder.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;
use tracing::debug;

use super::TextDetector;
use super::geometry::{Pad2, Resolution, UpsampleGeometry};
use super::layers::{Conv2d, ConvBlock, ConvSpec, ConvTranspose2d, concat_skip, trace_concat};
use super::resnet::{BackboneFeatures, FEATURE_CHANNELS, ResNet34};
use crate::core::{BackboneMode, DetectorError, DetectorResult};
use crate::onnx::{GraphBuilder, Traceable};

/// (block in, block out, deconv out) for `conv_k` / `deconv_k`, k = 1..=5.
const DECODER: [(usize, usize, usize); 5] = [
    (512, 512, 256),
    (512, 256, 128),
    (256, 128, 64),
    (128, 64, 32),
    (96, 64, 32),
];

/// Smallest side the five stride-2 stages can reduce to a non-empty map.
pub const MIN_SIDE: usize = 32;

/// Construction parameters of [`PretrainedTextDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PretrainedConfig {
    pub resolution: Resolution,
    pub mode: BackboneMode,
}

impl Default for PretrainedConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::DEFAULT,
            mode: BackboneMode::Frozen,
        }
    }
}

/// ResNet-34 features upsampled back to a full-resolution text logit map.
///
/// Each decoder stage is a double 3x3 convolution block followed by a stride-2
/// transposed convolution; its output is concatenated with the next shallower
/// backbone feature map. The transposed convolutions' output padding is derived
/// from the configured resolution so that every concatenation lines up and the
/// output matches the input size.
#[derive(Debug, Clone)]
pub struct PretrainedTextDetector {
    config: PretrainedConfig,
    resnet: ResNet34,
    blocks: Vec<ConvBlock>,
    deconvs: Vec<ConvTranspose2d>,
    conv_6: ConvBlock,
    out_conv: Conv2d,
}

impl PretrainedTextDetector {
    pub const INPUT_CHANNELS: usize = 3;

    /// Upsampling geometry of `deconv_1..deconv_5` for a resolution.
    pub fn decoder_geometry(resolution: Resolution) -> DetectorResult<[UpsampleGeometry; 5]> {
        if resolution.height < MIN_SIDE || resolution.width < MIN_SIDE {
            return Err(DetectorError::config(format!(
                "resolution {resolution} is below the {MIN_SIDE}x{MIN_SIDE} minimum of the backbone"
            )));
        }
        let [stem, s1, s2, s3, s4] = ResNet34::feature_resolutions(resolution)?;
        Ok([
            UpsampleGeometry::fit(s4, s3, Pad2::ONE)?,
            UpsampleGeometry::fit(s3, s2, Pad2::ONE)?,
            UpsampleGeometry::fit(s2, s1, Pad2::ONE)?,
            UpsampleGeometry::fit(s1, stem, Pad2::ONE)?,
            UpsampleGeometry::fit(stem, resolution, Pad2::ONE)?,
        ])
    }

    pub fn load(config: PretrainedConfig, vb: VarBuilder) -> DetectorResult<Self> {
        let geometry = Self::decoder_geometry(config.resolution)?;
        debug!(
            resolution = %config.resolution,
            output_padding = ?geometry.iter().map(|g| (g.output_padding.h, g.output_padding.w)).collect::<Vec<_>>(),
            "pretrained decoder geometry"
        );

        let resnet = ResNet34::load(Self::INPUT_CHANNELS, vb.pp("resnet"))?;
        let mut blocks = Vec::with_capacity(DECODER.len());
        let mut deconvs = Vec::with_capacity(DECODER.len());
        for (i, (&(c_in, c_mid, c_out), g)) in DECODER.iter().zip(geometry).enumerate() {
            let k = i + 1;
            blocks.push(ConvBlock::load(
                c_in,
                c_mid,
                ConvSpec::SAME_3X3,
                ConvSpec::SAME_3X3,
                vb.pp(format!("conv_{k}")),
            )?);
            deconvs.push(ConvTranspose2d::load(c_mid, c_out, g, vb.pp(format!("deconv_{k}")))?);
        }
        let conv_6 = ConvBlock::load(32, 16, ConvSpec::SAME_3X3, ConvSpec::SAME_3X3, vb.pp("conv_6"))?;
        let out_conv = Conv2d::load(16, 1, ConvSpec::SAME_3X3, 1, true, vb.pp("out_conv"))?;

        Ok(Self {
            config,
            resnet,
            blocks,
            deconvs,
            conv_6,
            out_conv,
        })
    }

    pub fn mode(&self) -> BackboneMode {
        self.config.mode
    }

    /// Backbone features for `x`; cut out of the gradient graph when frozen.
    pub fn encode(&self, x: &Tensor) -> DetectorResult<BackboneFeatures> {
        let features = self.resnet.forward(x)?;
        Ok(match self.config.mode {
            BackboneMode::Finetune => features,
            BackboneMode::Frozen => features.detach(),
        })
    }

    fn decode(&self, features: BackboneFeatures) -> DetectorResult<Tensor> {
        let skips = [
            &features.stage3,
            &features.stage2,
            &features.stage1,
            &features.stem,
        ];
        let mut x = features.stage4.clone();
        for (i, (block, deconv)) in self.blocks.iter().zip(&self.deconvs).enumerate() {
            x = block.forward(&x)?;
            x = deconv.forward(&x)?;
            if let Some(skip) = skips.get(i) {
                x = concat_skip(&x, skip, deconv.name())?;
            }
        }
        let x = self.conv_6.forward(&x)?;
        Ok(self.out_conv.forward(&x)?)
    }
}

impl TextDetector for PretrainedTextDetector {
    fn name(&self) -> &'static str {
        "pretrained"
    }

    fn input_channels(&self) -> usize {
        Self::INPUT_CHANNELS
    }

    fn resolution(&self) -> Resolution {
        self.config.resolution
    }

    fn forward(&self, x: &Tensor) -> DetectorResult<Tensor> {
        self.check_input(x)?;
        let features = self.encode(x)?;
        self.decode(features)
    }
}

impl Traceable for PretrainedTextDetector {
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> DetectorResult<String> {
        let [stem, s1, s2, s3, mut x] = self.resnet.trace_features(graph, input)?;
        let skips = [s3, s2, s1, stem];
        for (i, (block, deconv)) in self.blocks.iter().zip(&self.deconvs).enumerate() {
            x = block.trace(graph, &x)?;
            x = deconv.trace(graph, &x)?;
            if let Some(skip) = skips.get(i) {
                x = trace_concat(graph, "", &x, skip);
            }
        }
        let x = self.conv_6.trace(graph, &x)?;
        self.out_conv.trace(graph, &x)
    }

    fn parameters(&self, out: &mut Vec<(String, Tensor)>) {
        self.resnet.parameters(out);
        for (block, deconv) in self.blocks.iter().zip(&self.deconvs) {
            block.parameters(out);
            deconv.parameters(out);
        }
        self.conv_6.parameters(out);
        self.out_conv.parameters(out);
    }
}

// Skip inputs must line up with the backbone's channel layout.
const _: () = assert!(DECODER[0].0 == FEATURE_CHANNELS[4]);
const _: () = assert!(DECODER[4].0 == DECODER[3].2 + FEATURE_CHANNELS[0]);

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn random_detector(resolution: Resolution, mode: BackboneMode) -> DetectorResult<PretrainedTextDetector> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        PretrainedTextDetector::load(PretrainedConfig { resolution, mode }, vb)
    }

    #[test]
    fn test_default_geometry_matches_trained_paddings() -> DetectorResult<()> {
        let geometry = PretrainedTextDetector::decoder_geometry(Resolution::DEFAULT)?;
        let output_padding: Vec<(usize, usize)> = geometry
            .iter()
            .map(|g| (g.output_padding.h, g.output_padding.w))
            .collect();
        assert_eq!(output_padding, vec![(1, 1), (0, 1), (1, 0), (1, 1), (1, 1)]);
        assert!(geometry.iter().all(|g| g.padding == Pad2::ONE));
        Ok(())
    }

    #[test]
    fn test_multiples_of_32_restore_input_size() -> DetectorResult<()> {
        for (h, w) in [(32, 32), (64, 96), (256, 160), (1184, 832)] {
            let r = Resolution::new(h, w);
            let geometry = PretrainedTextDetector::decoder_geometry(r)?;
            let [stem, ..] = ResNet34::feature_resolutions(r)?;
            assert_eq!(geometry[4].output(stem), r);
            assert!(geometry.iter().all(|g| g.output_padding == Pad2::ONE));
        }
        Ok(())
    }

    #[test]
    fn test_forward_output_matches_input() -> DetectorResult<()> {
        let detector = random_detector(Resolution::new(64, 96), BackboneMode::Frozen)?;
        let x = Tensor::rand(0f32, 1f32, (1, 3, 64, 96), &Device::Cpu)?;
        assert_eq!(detector.forward(&x)?.dims(), &[1, 1, 64, 96]);
        Ok(())
    }

    #[test]
    fn test_odd_resolution_forward() -> DetectorResult<()> {
        let detector = random_detector(Resolution::new(70, 50), BackboneMode::Finetune)?;
        let x = Tensor::rand(0f32, 1f32, (1, 3, 70, 50), &Device::Cpu)?;
        assert_eq!(detector.forward(&x)?.dims(), &[1, 1, 70, 50]);
        Ok(())
    }

    #[test]
    fn test_rejects_other_resolution() -> DetectorResult<()> {
        let detector = random_detector(Resolution::new(64, 64), BackboneMode::Frozen)?;
        let x = Tensor::rand(0f32, 1f32, (1, 3, 96, 96), &Device::Cpu)?;
        assert!(matches!(
            detector.forward(&x),
            Err(DetectorError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_rejects_tiny_resolution() {
        assert!(random_detector(Resolution::new(16, 64), BackboneMode::Frozen).is_err());
    }

    #[test]
    fn test_frozen_backbone_is_detached() -> DetectorResult<()> {
        let r = Resolution::new(32, 32);
        let x = Tensor::rand(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu)?;

        let frozen = random_detector(r, BackboneMode::Frozen)?.encode(&x)?;
        for level in [&frozen.stem, &frozen.stage1, &frozen.stage2, &frozen.stage3, &frozen.stage4] {
            assert!(!level.track_op());
        }

        let finetune = random_detector(r, BackboneMode::Finetune)?.encode(&x)?;
        for level in [&finetune.stem, &finetune.stage1, &finetune.stage2, &finetune.stage3, &finetune.stage4] {
            assert!(level.track_op());
        }
        Ok(())
    }

    #[test]
    fn test_modes_agree_on_values() -> DetectorResult<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let r = Resolution::new(32, 64);
        let frozen = PretrainedTextDetector::load(PretrainedConfig { resolution: r, mode: BackboneMode::Frozen }, vb.clone())?;
        let finetune = PretrainedTextDetector::load(PretrainedConfig { resolution: r, mode: BackboneMode::Finetune }, vb)?;
        let x = Tensor::rand(0f32, 1f32, (1, 3, 32, 64), &Device::Cpu)?;
        let diff = (frozen.forward(&x)? - finetune.forward(&x)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
