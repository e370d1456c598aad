//! ResNet-34 trunk used as the encoder of [`super::PretrainedTextDetector`].
//!
//! Only the parts the detector consumes are built: the 7x7 stem convolution, the
//! stem max pool and the four residual stages. The stem convolution feeds the max
//! pool directly (no stem batch norm / ReLU), which is how the production
//! checkpoints were trained; their state dicts carry no `resnet.bn1.*` entries.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::geometry::{Pad2, Resolution};
use super::layers::{BatchNorm2d, Conv2d, ConvSpec, MaxPool2d};
use crate::core::DetectorResult;
use crate::onnx::{GraphBuilder, Traceable};

/// (channels, blocks, stride) of `layer1..layer4`.
const STAGES: [(usize, usize, usize); 4] = [(64, 3, 1), (128, 4, 2), (256, 6, 2), (512, 3, 2)];

/// Channels of the five exposed feature maps.
pub const FEATURE_CHANNELS: [usize; 5] = [64, 64, 128, 256, 512];

/// Two 3x3 convolutions with an identity (or 1x1 projected) shortcut.
#[derive(Debug, Clone)]
struct BasicBlock {
    name: String,
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    downsample: Option<(Conv2d, BatchNorm2d)>,
}

impl BasicBlock {
    fn load(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let conv1 = Conv2d::load(in_channels, out_channels, ConvSpec::SAME_3X3, stride, false, vb.pp("conv1"))?;
        let bn1 = BatchNorm2d::load(out_channels, vb.pp("bn1"))?;
        let conv2 = Conv2d::load(out_channels, out_channels, ConvSpec::SAME_3X3, 1, false, vb.pp("conv2"))?;
        let bn2 = BatchNorm2d::load(out_channels, vb.pp("bn2"))?;
        let downsample = if stride != 1 || in_channels != out_channels {
            let ds = vb.pp("downsample");
            Some((
                Conv2d::load(in_channels, out_channels, ConvSpec::POINTWISE, stride, false, ds.pp("0"))?,
                BatchNorm2d::load(out_channels, ds.pp("1"))?,
            ))
        } else {
            None
        };
        Ok(Self {
            name: vb.prefix(),
            conv1,
            bn1,
            conv2,
            bn2,
            downsample,
        })
    }
}

impl Module for BasicBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.bn1.forward(&self.conv1.forward(x)?)?.relu()?;
        let out = self.bn2.forward(&self.conv2.forward(&out)?)?;
        let shortcut = match &self.downsample {
            Some((conv, bn)) => bn.forward(&conv.forward(x)?)?,
            None => x.clone(),
        };
        (out + shortcut)?.relu()
    }
}

impl Traceable for BasicBlock {
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> DetectorResult<String> {
        let out = self.conv1.trace(graph, input)?;
        let out = self.bn1.trace(graph, &out)?;
        let out = graph.node(&self.name, "Relu", &[&out], vec![]);
        let out = self.conv2.trace(graph, &out)?;
        let out = self.bn2.trace(graph, &out)?;
        let shortcut = match &self.downsample {
            Some((conv, bn)) => {
                let s = conv.trace(graph, input)?;
                bn.trace(graph, &s)?
            }
            None => input.to_string(),
        };
        let sum = graph.node(&self.name, "Add", &[&out, &shortcut], vec![]);
        Ok(graph.node(&self.name, "Relu", &[&sum], vec![]))
    }

    fn parameters(&self, out: &mut Vec<(String, Tensor)>) {
        self.conv1.parameters(out);
        self.bn1.parameters(out);
        self.conv2.parameters(out);
        self.bn2.parameters(out);
        if let Some((conv, bn)) = &self.downsample {
            conv.parameters(out);
            bn.parameters(out);
        }
    }
}

/// The five feature maps handed to the decoder, shallowest first.
#[derive(Debug, Clone)]
pub struct BackboneFeatures {
    /// Stem convolution output (1/2 resolution).
    pub stem: Tensor,
    /// `layer1` output (1/4).
    pub stage1: Tensor,
    /// `layer2` output (1/8).
    pub stage2: Tensor,
    /// `layer3` output (1/16).
    pub stage3: Tensor,
    /// `layer4` output (1/32).
    pub stage4: Tensor,
}

impl BackboneFeatures {
    /// Cuts every feature map out of the gradient graph.
    pub fn detach(self) -> Self {
        Self {
            stem: self.stem.detach(),
            stage1: self.stage1.detach(),
            stage2: self.stage2.detach(),
            stage3: self.stage3.detach(),
            stage4: self.stage4.detach(),
        }
    }
}

/// ResNet-34 feature extractor.
#[derive(Debug, Clone)]
pub struct ResNet34 {
    conv1: Conv2d,
    maxpool: MaxPool2d,
    layers: Vec<Vec<BasicBlock>>,
}

impl ResNet34 {
    pub fn load(in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv1 = Conv2d::load(
            in_channels,
            64,
            ConvSpec::new((7, 7), Pad2::new(3, 3)),
            2,
            false,
            vb.pp("conv1"),
        )?;
        let maxpool = MaxPool2d::new(format!("{}.maxpool", vb.prefix()), 3, 2, 1);

        let mut layers = Vec::with_capacity(STAGES.len());
        let mut channels = 64;
        for (i, &(out_channels, blocks, stride)) in STAGES.iter().enumerate() {
            let vb_layer = vb.pp(format!("layer{}", i + 1));
            let mut layer = Vec::with_capacity(blocks);
            for b in 0..blocks {
                let block_stride = if b == 0 { stride } else { 1 };
                layer.push(BasicBlock::load(channels, out_channels, block_stride, vb_layer.pp(b.to_string()))?);
                channels = out_channels;
            }
            layers.push(layer);
        }
        Ok(Self {
            conv1,
            maxpool,
            layers,
        })
    }

    /// Spatial sizes of the five feature maps for a given input.
    pub fn feature_resolutions(input: Resolution) -> DetectorResult<[Resolution; 5]> {
        let stem = input.after_window(7, 2, 3)?;
        let stage1 = stem.after_window(3, 2, 1)?;
        let stage2 = stage1.after_window(3, 2, 1)?;
        let stage3 = stage2.after_window(3, 2, 1)?;
        let stage4 = stage3.after_window(3, 2, 1)?;
        Ok([stem, stage1, stage2, stage3, stage4])
    }

    pub fn forward(&self, x: &Tensor) -> Result<BackboneFeatures> {
        let stem = self.conv1.forward(x)?;
        let mut x = self.maxpool.forward(&stem)?;
        let mut outputs = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            for block in layer {
                x = block.forward(&x)?;
            }
            outputs.push(x.clone());
        }
        let [stage1, stage2, stage3, stage4]: [Tensor; 4] = outputs
            .try_into()
            .map_err(|_| candle_core::Error::Msg("resnet34 must have four stages".to_string()))?;
        Ok(BackboneFeatures {
            stem,
            stage1,
            stage2,
            stage3,
            stage4,
        })
    }

    /// Emits the trunk, returning the value names of the five feature maps.
    pub fn trace_features(&self, graph: &mut GraphBuilder, input: &str) -> DetectorResult<[String; 5]> {
        let stem = self.conv1.trace(graph, input)?;
        let mut x = self.maxpool.trace(graph, &stem)?;
        let mut names = vec![stem];
        for layer in &self.layers {
            for block in layer {
                x = block.trace(graph, &x)?;
            }
            names.push(x.clone());
        }
        names
            .try_into()
            .map_err(|_| crate::core::DetectorError::graph("resnet34 must expose five feature maps"))
    }

    pub fn parameters(&self, out: &mut Vec<(String, Tensor)>) {
        self.conv1.parameters(out);
        for block in self.layers.iter().flatten() {
            block.parameters(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_feature_resolutions_default_page() -> DetectorResult<()> {
        let r = ResNet34::feature_resolutions(Resolution::DEFAULT)?;
        assert_eq!(
            r,
            [
                Resolution::new(588, 414),
                Resolution::new(294, 207),
                Resolution::new(147, 104),
                Resolution::new(74, 52),
                Resolution::new(37, 26),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_forward_feature_shapes() -> DetectorResult<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let resnet = ResNet34::load(3, vb.pp("resnet"))?;
        let x = Tensor::rand(0f32, 1f32, (1, 3, 64, 96), &Device::Cpu)?;
        let f = resnet.forward(&x)?;
        assert_eq!(f.stem.dims(), &[1, 64, 32, 48]);
        assert_eq!(f.stage1.dims(), &[1, 64, 16, 24]);
        assert_eq!(f.stage2.dims(), &[1, 128, 8, 12]);
        assert_eq!(f.stage3.dims(), &[1, 256, 4, 6]);
        assert_eq!(f.stage4.dims(), &[1, 512, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_parameter_names_follow_torchvision() -> DetectorResult<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let resnet = ResNet34::load(3, vb.pp("resnet"))?;
        let mut params = Vec::new();
        resnet.parameters(&mut params);
        let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names[0], "resnet.conv1.weight");
        assert!(names.contains(&"resnet.layer2.0.downsample.0.weight"));
        assert!(names.contains(&"resnet.layer4.2.bn2.running_mean"));
        assert!(!names.contains(&"resnet.layer1.0.downsample.0.weight"));
        assert!(!names.iter().any(|n| n.starts_with("resnet.bn1")));
        // 1 stem conv + 16 blocks * (2 convs + 2 BN * 4) + 3 downsamples * (1 + 4)
        assert_eq!(params.len(), 1 + 16 * 10 + 3 * 5);
        Ok(())
    }
}
