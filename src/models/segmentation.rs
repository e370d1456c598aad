//! Self-contained single-channel text detector.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;
use tracing::debug;

use super::TextDetector;
use super::geometry::{Pad2, Resolution, UpsampleGeometry, window_output};
use super::layers::{Conv2d, ConvBlock, ConvSpec, ConvTranspose2d, concat_skip, trace_concat};
use crate::core::{DetectorError, DetectorResult};
use crate::onnx::proto::attr_ints;
use crate::onnx::{GraphBuilder, Traceable};

/// Encoder widths of `conv_block_1..conv_block_4`.
const ENCODER_CHANNELS: [usize; 4] = [16, 32, 64, 128];

/// Construction parameters of [`SegmentationTextDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentationConfig {
    pub resolution: Resolution,
    /// Kernel and padding of the first convolution in every block.
    pub block_conv: ConvSpec,
    /// Padding of `deconv_1..deconv_3`; the output padding is always derived.
    /// `None` picks, per axis, 1 for an even skip size and 0 for an odd one.
    pub upsample_padding: Option<[Pad2; 3]>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::DEFAULT,
            block_conv: ConvSpec::SAME_3X3,
            upsample_padding: None,
        }
    }
}

impl SegmentationConfig {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            ..Default::default()
        }
    }
}

/// Padding under which a stride-2 upsample of `input` can reach `target`.
fn natural_padding(input: Resolution, target: Resolution) -> Pad2 {
    let axis = |n: usize, want: usize| if want == 2 * n + 1 { 0 } else { 1 };
    Pad2::new(axis(input.height, target.height), axis(input.width, target.width))
}

/// Four-stage encoder/decoder over a grayscale page.
///
/// Encoder blocks are `conv(k) -> BN -> ReLU -> conv 1x1 -> BN -> ReLU`, with 2x2
/// max pooling after the first three. Each of the three decoder steps upsamples,
/// concatenates the encoder map of the same size (encoder first), and reduces
/// channels; the last step ends in a single 3x3 convolution producing raw logits.
#[derive(Debug, Clone)]
pub struct SegmentationTextDetector {
    config: SegmentationConfig,
    encoder: Vec<ConvBlock>,
    deconvs: Vec<ConvTranspose2d>,
    conv_filter_1: Conv2d,
    conv_block_5: ConvBlock,
    conv_filter_2: Conv2d,
    conv_block_6: ConvBlock,
    conv_block_7: Conv2d,
}

impl SegmentationTextDetector {
    pub const INPUT_CHANNELS: usize = 1;

    /// Encoder resolutions: the block outputs `c1`, `c2`, `c3` and the bottleneck.
    pub fn encoder_resolutions(config: &SegmentationConfig) -> DetectorResult<[Resolution; 4]> {
        let block = |r: Resolution| block_output(config.block_conv, r);
        let c1 = block(config.resolution)?;
        let c2 = block(c1.halved())?;
        let c3 = block(c2.halved())?;
        let bottom = block(c3.halved())?;
        if bottom.height == 0 || bottom.width == 0 {
            return Err(DetectorError::config(format!(
                "resolution {} is too small for three pooling stages",
                config.resolution
            )));
        }
        Ok([c1, c2, c3, bottom])
    }

    /// Upsampling geometry of `deconv_1..deconv_3`.
    pub fn decoder_geometry(config: &SegmentationConfig) -> DetectorResult<[UpsampleGeometry; 3]> {
        let [c1, c2, c3, bottom] = Self::encoder_resolutions(config)?;
        // deconv_2 and deconv_3 start from the output of conv_block_5 / conv_block_6
        let steps = [
            (bottom, c3),
            (block_output(config.block_conv, c3)?, c2),
            (block_output(config.block_conv, c2)?, c1),
        ];
        let mut geometry = Vec::with_capacity(steps.len());
        for (i, &(input, target)) in steps.iter().enumerate() {
            let padding = match config.upsample_padding {
                Some(paddings) => paddings[i],
                None => natural_padding(input, target),
            };
            geometry.push(UpsampleGeometry::fit(input, target, padding)?);
        }
        geometry
            .try_into()
            .map_err(|_| DetectorError::config("segmentation decoder has three upsampling stages"))
    }

    pub fn load(config: SegmentationConfig, vb: VarBuilder) -> DetectorResult<Self> {
        let geometry = Self::decoder_geometry(&config)?;
        debug!(
            resolution = %config.resolution,
            padding = ?geometry.iter().map(|g| (g.padding.h, g.padding.w)).collect::<Vec<_>>(),
            output_padding = ?geometry.iter().map(|g| (g.output_padding.h, g.output_padding.w)).collect::<Vec<_>>(),
            "segmentation decoder geometry"
        );

        let spec = config.block_conv;
        let mut encoder = Vec::with_capacity(ENCODER_CHANNELS.len());
        let mut c_in = Self::INPUT_CHANNELS;
        for (i, &c_out) in ENCODER_CHANNELS.iter().enumerate() {
            encoder.push(ConvBlock::load(
                c_in,
                c_out,
                spec,
                ConvSpec::POINTWISE,
                vb.pp(format!("conv_block_{}", i + 1)),
            )?);
            c_in = c_out;
        }

        let [g1, g2, g3] = geometry;
        let deconvs = vec![
            ConvTranspose2d::load(128, 64, g1, vb.pp("deconv_1"))?,
            ConvTranspose2d::load(64, 32, g2, vb.pp("deconv_2"))?,
            ConvTranspose2d::load(32, 16, g3, vb.pp("deconv_3"))?,
        ];

        Ok(Self {
            config,
            encoder,
            deconvs,
            conv_filter_1: Conv2d::load(128, 64, ConvSpec::POINTWISE, 1, true, vb.pp("conv_filter_1"))?,
            conv_block_5: ConvBlock::load(64, 64, spec, ConvSpec::POINTWISE, vb.pp("conv_block_5"))?,
            conv_filter_2: Conv2d::load(64, 32, ConvSpec::POINTWISE, 1, true, vb.pp("conv_filter_2"))?,
            conv_block_6: ConvBlock::load(32, 32, spec, ConvSpec::POINTWISE, vb.pp("conv_block_6"))?,
            conv_block_7: Conv2d::load(32, 1, ConvSpec::SAME_3X3, 1, true, vb.pp("conv_block_7"))?,
        })
    }
}

/// Spatial size after a block's first convolution (the 1x1 keeps it).
fn block_output(spec: ConvSpec, r: Resolution) -> DetectorResult<Resolution> {
    Ok(Resolution::new(
        window_output(r.height, spec.kernel.0, 1, spec.padding.h)?,
        window_output(r.width, spec.kernel.1, 1, spec.padding.w)?,
    ))
}

impl TextDetector for SegmentationTextDetector {
    fn name(&self) -> &'static str {
        "segmentation"
    }

    fn input_channels(&self) -> usize {
        Self::INPUT_CHANNELS
    }

    fn resolution(&self) -> Resolution {
        self.config.resolution
    }

    fn forward(&self, x: &Tensor) -> DetectorResult<Tensor> {
        self.check_input(x)?;
        let c1 = self.encoder[0].forward(x)?;
        let c2 = self.encoder[1].forward(&c1.max_pool2d(2)?)?;
        let c3 = self.encoder[2].forward(&c2.max_pool2d(2)?)?;
        let x = self.encoder[3].forward(&c3.max_pool2d(2)?)?;

        let x = self.deconvs[0].forward(&x)?;
        let x = concat_skip(&c3, &x, self.deconvs[0].name())?;
        let x = self.conv_filter_1.forward(&x)?;
        let x = self.conv_block_5.forward(&x)?;

        let x = self.deconvs[1].forward(&x)?;
        let x = concat_skip(&c2, &x, self.deconvs[1].name())?;
        let x = self.conv_filter_2.forward(&x)?;
        let x = self.conv_block_6.forward(&x)?;

        let x = self.deconvs[2].forward(&x)?;
        let x = concat_skip(&c1, &x, self.deconvs[2].name())?;
        Ok(self.conv_block_7.forward(&x)?)
    }
}

impl Traceable for SegmentationTextDetector {
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> DetectorResult<String> {
        let pool = |graph: &mut GraphBuilder, scope: &str, x: &str| {
            graph.node(
                scope,
                "MaxPool",
                &[x],
                vec![
                    attr_ints("kernel_shape", &[2, 2]),
                    attr_ints("strides", &[2, 2]),
                ],
            )
        };
        let c1 = self.encoder[0].trace(graph, input)?;
        let x = pool(graph, "max_pool_1", &c1);
        let c2 = self.encoder[1].trace(graph, &x)?;
        let x = pool(graph, "max_pool_2", &c2);
        let c3 = self.encoder[2].trace(graph, &x)?;
        let x = pool(graph, "max_pool_3", &c3);
        let x = self.encoder[3].trace(graph, &x)?;

        let x = self.deconvs[0].trace(graph, &x)?;
        let x = trace_concat(graph, "", &c3, &x);
        let x = self.conv_filter_1.trace(graph, &x)?;
        let x = self.conv_block_5.trace(graph, &x)?;

        let x = self.deconvs[1].trace(graph, &x)?;
        let x = trace_concat(graph, "", &c2, &x);
        let x = self.conv_filter_2.trace(graph, &x)?;
        let x = self.conv_block_6.trace(graph, &x)?;

        let x = self.deconvs[2].trace(graph, &x)?;
        let x = trace_concat(graph, "", &c1, &x);
        self.conv_block_7.trace(graph, &x)
    }

    fn parameters(&self, out: &mut Vec<(String, Tensor)>) {
        for block in &self.encoder {
            block.parameters(out);
        }
        self.deconvs[0].parameters(out);
        self.conv_filter_1.parameters(out);
        self.conv_block_5.parameters(out);
        self.deconvs[1].parameters(out);
        self.conv_filter_2.parameters(out);
        self.conv_block_6.parameters(out);
        self.deconvs[2].parameters(out);
        self.conv_block_7.parameters(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn random_detector(config: SegmentationConfig) -> DetectorResult<SegmentationTextDetector> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        SegmentationTextDetector::load(config, vb)
    }

    #[test]
    fn test_multiples_of_16_restore_input_size() -> DetectorResult<()> {
        for (h, w) in [(64, 64), (96, 48), (128, 80)] {
            let detector = random_detector(SegmentationConfig::new(Resolution::new(h, w)))?;
            let x = Tensor::rand(0f32, 1f32, (1, 1, h, w), &Device::Cpu)?;
            assert_eq!(detector.forward(&x)?.dims(), &[1, 1, h, w]);
        }
        Ok(())
    }

    #[test]
    fn test_default_page_geometry() -> DetectorResult<()> {
        let geometry = SegmentationTextDetector::decoder_geometry(&SegmentationConfig::default())?;
        // 1176x828 pools to 588x414, 294x207, 147x103; 207 is odd
        let padding: Vec<Pad2> = geometry.iter().map(|g| g.padding).collect();
        let output_padding: Vec<Pad2> = geometry.iter().map(|g| g.output_padding).collect();
        assert_eq!(padding, vec![Pad2::new(1, 0), Pad2::ONE, Pad2::ONE]);
        assert_eq!(output_padding, vec![Pad2::new(1, 0), Pad2::ONE, Pad2::ONE]);
        assert_eq!(geometry[0].output(Resolution::new(147, 103)), Resolution::new(294, 207));
        Ok(())
    }

    #[test]
    fn test_uniform_padding_cannot_reach_default_page() {
        let config = SegmentationConfig {
            upsample_padding: Some([Pad2::ONE; 3]),
            ..Default::default()
        };
        assert!(SegmentationTextDetector::decoder_geometry(&config).is_err());
    }

    #[test]
    fn test_asymmetric_deconv_padding_on_odd_width() -> DetectorResult<()> {
        // deconv_3 with padding (1, 0) / output padding (1, 0) needs an odd width
        let config = SegmentationConfig {
            resolution: Resolution::new(64, 65),
            upsample_padding: Some([Pad2::ONE, Pad2::ONE, Pad2::new(1, 0)]),
            ..Default::default()
        };
        let geometry = SegmentationTextDetector::decoder_geometry(&config)?;
        assert_eq!(geometry[2].output_padding, Pad2::new(1, 0));
        let detector = random_detector(config)?;
        let x = Tensor::rand(0f32, 1f32, (1, 1, 64, 65), &Device::Cpu)?;
        assert_eq!(detector.forward(&x)?.dims(), &[1, 1, 64, 65]);
        Ok(())
    }

    #[test]
    fn test_incompatible_padding_fails_at_construction() {
        let config = SegmentationConfig {
            resolution: Resolution::new(64, 64),
            upsample_padding: Some([Pad2::ONE, Pad2::ONE, Pad2::new(1, 0)]),
            ..Default::default()
        };
        assert!(matches!(
            random_detector(config),
            Err(DetectorError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_rejects_rgb_input() -> DetectorResult<()> {
        let detector = random_detector(SegmentationConfig::new(Resolution::new(32, 32)))?;
        let x = Tensor::rand(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu)?;
        assert!(matches!(
            detector.forward(&x),
            Err(DetectorError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_parameter_count() -> DetectorResult<()> {
        let detector = random_detector(SegmentationConfig::new(Resolution::new(32, 32)))?;
        let mut params = Vec::new();
        detector.parameters(&mut params);
        // 6 blocks * 12 + 3 deconvs * 2 + 2 filters * 2 + final conv 2
        assert_eq!(params.len(), 6 * 12 + 3 * 2 + 2 * 2 + 2);
        assert!(params.iter().any(|(n, _)| n == "conv_block_7.weight"));
        Ok(())
    }
}
