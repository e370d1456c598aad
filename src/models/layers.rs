//! Building blocks shared by both detector networks.
//!
//! Parameters are looked up with PyTorch state-dict names so that checkpoints
//! trained elsewhere bind without renaming. Every layer can run on candle
//! tensors and emit itself into an ONNX graph.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, VarBuilder, init};

use super::geometry::{Pad2, UpsampleGeometry};
use crate::core::{DetectorError, DetectorResult};
use crate::onnx::proto::{attr_float, attr_int, attr_ints};
use crate::onnx::{GraphBuilder, Traceable};

/// Uniform bias initialization in `±1/sqrt(fan_in)`, as torch does. Only used
/// when a layer is created fresh rather than bound to a checkpoint.
fn bias_init(fan_in: usize) -> Init {
    let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Kernel size and per-axis padding of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSpec {
    pub kernel: (usize, usize),
    pub padding: Pad2,
}

impl ConvSpec {
    /// 3x3 convolution keeping the spatial size.
    pub const SAME_3X3: ConvSpec = ConvSpec {
        kernel: (3, 3),
        padding: Pad2::ONE,
    };
    /// 1x1 channel mixing.
    pub const POINTWISE: ConvSpec = ConvSpec {
        kernel: (1, 1),
        padding: Pad2::ZERO,
    };

    pub const fn new(kernel: (usize, usize), padding: Pad2) -> Self {
        Self { kernel, padding }
    }
}

/// 2D convolution with optional bias and independent height/width padding.
#[derive(Debug, Clone)]
pub struct Conv2d {
    name: String,
    weight: Tensor,
    bias: Option<Tensor>,
    stride: usize,
    padding: Pad2,
}

impl Conv2d {
    pub fn load(
        in_channels: usize,
        out_channels: usize,
        spec: ConvSpec,
        stride: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (kh, kw) = spec.kernel;
        let weight = vb.get_with_hints(
            (out_channels, in_channels, kh, kw),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = if bias {
            Some(vb.get_with_hints(out_channels, "bias", bias_init(in_channels * kh * kw))?)
        } else {
            None
        };
        Ok(Self {
            name: vb.prefix(),
            weight,
            bias,
            stride,
            padding: spec.padding,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn kernel(&self) -> (usize, usize) {
        let dims = self.weight.dims();
        (dims[2], dims[3])
    }
}

impl Module for Conv2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = if self.padding.is_symmetric() {
            x.conv2d(&self.weight, self.padding.h, self.stride, 1, 1)?
        } else {
            x.pad_with_zeros(2, self.padding.h, self.padding.h)?
                .pad_with_zeros(3, self.padding.w, self.padding.w)?
                .conv2d(&self.weight, 0, self.stride, 1, 1)?
        };
        match &self.bias {
            Some(bias) => {
                let c = bias.dim(0)?;
                x.broadcast_add(&bias.reshape((1, c, 1, 1))?)
            }
            None => Ok(x),
        }
    }
}

impl Traceable for Conv2d {
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> DetectorResult<String> {
        let weight = graph.initializer(&format!("{}.weight", self.name), &self.weight)?;
        let mut inputs = vec![input.to_string(), weight];
        if let Some(bias) = &self.bias {
            inputs.push(graph.initializer(&format!("{}.bias", self.name), bias)?);
        }
        let (kh, kw) = self.kernel();
        let (ph, pw) = (self.padding.h as i64, self.padding.w as i64);
        let s = self.stride as i64;
        let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();
        Ok(graph.node(
            &self.name,
            "Conv",
            &inputs,
            vec![
                attr_ints("dilations", &[1, 1]),
                attr_int("group", 1),
                attr_ints("kernel_shape", &[kh as i64, kw as i64]),
                attr_ints("pads", &[ph, pw, ph, pw]),
                attr_ints("strides", &[s, s]),
            ],
        ))
    }

    fn parameters(&self, out: &mut Vec<(String, Tensor)>) {
        out.push((format!("{}.weight", self.name), self.weight.clone()));
        if let Some(bias) = &self.bias {
            out.push((format!("{}.bias", self.name), bias.clone()));
        }
    }
}

/// Batch normalization in inference mode, using the running statistics.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    name: String,
    weight: Tensor,
    bias: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    eps: f64,
}

impl BatchNorm2d {
    pub const EPS: f64 = 1e-5;

    pub fn load(channels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        let running_mean = vb.get_with_hints(channels, "running_mean", Init::Const(0.0))?;
        let running_var = vb.get_with_hints(channels, "running_var", Init::Const(1.0))?;
        Ok(Self {
            name: vb.prefix(),
            weight,
            bias,
            running_mean,
            running_var,
            eps: Self::EPS,
        })
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // y = (x - mean) / sqrt(var + eps) * weight + bias
        let (_, c, _, _) = x.dims4()?;
        let mean = self.running_mean.reshape((1, c, 1, 1))?;
        let var = self.running_var.reshape((1, c, 1, 1))?;
        let weight = self.weight.reshape((1, c, 1, 1))?;
        let bias = self.bias.reshape((1, c, 1, 1))?;

        let std = (var + self.eps)?.sqrt()?;
        x.broadcast_sub(&mean)?
            .broadcast_div(&std)?
            .broadcast_mul(&weight)?
            .broadcast_add(&bias)
    }
}

impl Traceable for BatchNorm2d {
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> DetectorResult<String> {
        let scale = graph.initializer(&format!("{}.weight", self.name), &self.weight)?;
        let bias = graph.initializer(&format!("{}.bias", self.name), &self.bias)?;
        let mean = graph.initializer(&format!("{}.running_mean", self.name), &self.running_mean)?;
        let var = graph.initializer(&format!("{}.running_var", self.name), &self.running_var)?;
        Ok(graph.node(
            &self.name,
            "BatchNormalization",
            &[input, &scale, &bias, &mean, &var],
            vec![attr_float("epsilon", self.eps as f32)],
        ))
    }

    fn parameters(&self, out: &mut Vec<(String, Tensor)>) {
        out.push((format!("{}.weight", self.name), self.weight.clone()));
        out.push((format!("{}.bias", self.name), self.bias.clone()));
        out.push((format!("{}.running_mean", self.name), self.running_mean.clone()));
        out.push((format!("{}.running_var", self.name), self.running_var.clone()));
    }
}

/// Stride-2 transposed convolution with per-axis padding and output padding.
///
/// candle only supports symmetric padding, so the transposed convolution is
/// computed unpadded and the result is cropped (or zero-extended) per axis before
/// the bias is added.
#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    name: String,
    weight: Tensor,
    bias: Tensor,
    geometry: UpsampleGeometry,
}

impl ConvTranspose2d {
    pub fn load(
        in_channels: usize,
        out_channels: usize,
        geometry: UpsampleGeometry,
        vb: VarBuilder,
    ) -> Result<Self> {
        let k = geometry.kernel;
        let weight = vb.get_with_hints(
            (in_channels, out_channels, k, k),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(out_channels, "bias", bias_init(out_channels * k * k))?;
        Ok(Self {
            name: vb.prefix(),
            weight,
            bias,
            geometry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> UpsampleGeometry {
        self.geometry
    }

    fn fit_axis(x: Tensor, dim: usize, padding: usize, output_padding: usize) -> Result<Tensor> {
        let full = x.dim(dim)?;
        let want = full + output_padding - 2 * padding;
        let available = full - padding;
        if want <= available {
            x.narrow(dim, padding, want)
        } else {
            x.narrow(dim, padding, available)?
                .pad_with_zeros(dim, 0, want - available)
        }
    }
}

impl Module for ConvTranspose2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let g = self.geometry;
        let full = x.conv_transpose2d(&self.weight, 0, 0, g.stride, 1)?;
        let y = Self::fit_axis(full, 2, g.padding.h, g.output_padding.h)?;
        let y = Self::fit_axis(y, 3, g.padding.w, g.output_padding.w)?;
        let c = self.bias.dim(0)?;
        y.broadcast_add(&self.bias.reshape((1, c, 1, 1))?)
    }
}

impl Traceable for ConvTranspose2d {
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> DetectorResult<String> {
        let weight = graph.initializer(&format!("{}.weight", self.name), &self.weight)?;
        let bias = graph.initializer(&format!("{}.bias", self.name), &self.bias)?;
        let g = self.geometry;
        let k = g.kernel as i64;
        let s = g.stride as i64;
        let (ph, pw) = (g.padding.h as i64, g.padding.w as i64);
        Ok(graph.node(
            &self.name,
            "ConvTranspose",
            &[input, &weight, &bias],
            vec![
                attr_ints("dilations", &[1, 1]),
                attr_int("group", 1),
                attr_ints("kernel_shape", &[k, k]),
                attr_ints(
                    "output_padding",
                    &[g.output_padding.h as i64, g.output_padding.w as i64],
                ),
                attr_ints("pads", &[ph, pw, ph, pw]),
                attr_ints("strides", &[s, s]),
            ],
        ))
    }

    fn parameters(&self, out: &mut Vec<(String, Tensor)>) {
        out.push((format!("{}.weight", self.name), self.weight.clone()));
        out.push((format!("{}.bias", self.name), self.bias.clone()));
    }
}

/// `conv -> BN -> ReLU -> conv -> BN -> ReLU`, stored like an `nn.Sequential`
/// (parameter indices 0, 1, 3, 4).
#[derive(Debug, Clone)]
pub struct ConvBlock {
    name: String,
    conv_a: Conv2d,
    bn_a: BatchNorm2d,
    conv_b: Conv2d,
    bn_b: BatchNorm2d,
}

impl ConvBlock {
    pub fn load(
        in_channels: usize,
        out_channels: usize,
        first: ConvSpec,
        second: ConvSpec,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            name: vb.prefix(),
            conv_a: Conv2d::load(in_channels, out_channels, first, 1, true, vb.pp("0"))?,
            bn_a: BatchNorm2d::load(out_channels, vb.pp("1"))?,
            conv_b: Conv2d::load(out_channels, out_channels, second, 1, true, vb.pp("3"))?,
            bn_b: BatchNorm2d::load(out_channels, vb.pp("4"))?,
        })
    }
}

impl Module for ConvBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.bn_a.forward(&self.conv_a.forward(x)?)?.relu()?;
        self.bn_b.forward(&self.conv_b.forward(&x)?)?.relu()
    }
}

impl Traceable for ConvBlock {
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> DetectorResult<String> {
        let x = self.conv_a.trace(graph, input)?;
        let x = self.bn_a.trace(graph, &x)?;
        let x = graph.node(&format!("{}.2", self.name), "Relu", &[&x], vec![]);
        let x = self.conv_b.trace(graph, &x)?;
        let x = self.bn_b.trace(graph, &x)?;
        Ok(graph.node(&format!("{}.5", self.name), "Relu", &[&x], vec![]))
    }

    fn parameters(&self, out: &mut Vec<(String, Tensor)>) {
        self.conv_a.parameters(out);
        self.bn_a.parameters(out);
        self.conv_b.parameters(out);
        self.bn_b.parameters(out);
    }
}

/// Max pooling with square window, stride and padding.
///
/// Padding uses `-inf`, so padded cells never win the max.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    name: String,
    kernel: usize,
    stride: usize,
    padding: usize,
}

impl MaxPool2d {
    pub fn new(name: impl Into<String>, kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            name: name.into(),
            kernel,
            stride,
            padding,
        }
    }

    fn pad_neg_inf(x: &Tensor, dim: usize, pad: usize) -> Result<Tensor> {
        let mut dims = x.dims().to_vec();
        dims[dim] = pad;
        let fill = Tensor::full(f32::NEG_INFINITY, dims.as_slice(), x.device())?.to_dtype(x.dtype())?;
        Tensor::cat(&[&fill, x, &fill], dim)
    }
}

impl Module for MaxPool2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = if self.padding > 0 {
            let x = Self::pad_neg_inf(x, 2, self.padding)?;
            Self::pad_neg_inf(&x, 3, self.padding)?
        } else {
            x.clone()
        };
        x.max_pool2d_with_stride(self.kernel, self.stride)
    }
}

impl Traceable for MaxPool2d {
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> DetectorResult<String> {
        let k = self.kernel as i64;
        let s = self.stride as i64;
        let p = self.padding as i64;
        Ok(graph.node(
            &self.name,
            "MaxPool",
            &[input],
            vec![
                attr_ints("kernel_shape", &[k, k]),
                attr_ints("pads", &[p, p, p, p]),
                attr_ints("strides", &[s, s]),
            ],
        ))
    }

    fn parameters(&self, _out: &mut Vec<(String, Tensor)>) {}
}

/// Concatenates two feature maps along channels after checking that batch and
/// spatial sizes agree.
pub fn concat_skip(first: &Tensor, second: &Tensor, stage: &str) -> DetectorResult<Tensor> {
    let (n1, _, h1, w1) = first.dims4()?;
    let (n2, _, h2, w2) = second.dims4()?;
    if (n1, h1, w1) != (n2, h2, w2) {
        return Err(DetectorError::shape_mismatch(
            format!("{stage} skip connection"),
            first.dims(),
            second.dims(),
        ));
    }
    Ok(Tensor::cat(&[first, second], 1)?)
}

/// Emits the channel concatenation of two values.
pub fn trace_concat(graph: &mut GraphBuilder, scope: &str, first: &str, second: &str) -> String {
    graph.node(scope, "Concat", &[first, second], vec![attr_int("axis", 1)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::geometry::Resolution;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn var_builder(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_asymmetric_padding_conv_shape() -> DetectorResult<()> {
        let varmap = VarMap::new();
        let vb = var_builder(&varmap);
        let conv = Conv2d::load(1, 4, ConvSpec::new((3, 3), Pad2::new(1, 0)), 1, true, vb.pp("c"))?;
        let x = Tensor::zeros((1, 1, 10, 12), DType::F32, &Device::Cpu)?;
        assert_eq!(conv.forward(&x)?.dims(), &[1, 4, 10, 10]);
        Ok(())
    }

    #[test]
    fn test_fresh_layers_are_not_zero() -> DetectorResult<()> {
        let varmap = VarMap::new();
        let vb = var_builder(&varmap);
        let conv = Conv2d::load(8, 4, ConvSpec::SAME_3X3, 1, true, vb.pp("c"))?;
        let geometry = UpsampleGeometry::fit(Resolution::new(4, 4), Resolution::new(8, 8), Pad2::ONE)?;
        let deconv = ConvTranspose2d::load(4, 2, geometry, vb.pp("d"))?;
        let x = Tensor::rand(0f32, 1f32, (1, 8, 4, 4), &Device::Cpu)?;
        let y = deconv.forward(&conv.forward(&x)?.relu()?)?;
        assert!(conv.weight.abs()?.max_all()?.to_scalar::<f32>()? > 0.0);
        assert!(deconv.weight.abs()?.max_all()?.to_scalar::<f32>()? > 0.0);
        assert!(y.abs()?.max_all()?.to_scalar::<f32>()? > 0.0);
        Ok(())
    }

    #[test]
    fn test_conv_transpose_matches_geometry() -> DetectorResult<()> {
        let varmap = VarMap::new();
        let vb = var_builder(&varmap);
        let input = Resolution::new(147, 104);
        let target = Resolution::new(294, 207);
        let geometry = UpsampleGeometry::fit(input, target, Pad2::ONE)?;
        let deconv = ConvTranspose2d::load(4, 2, geometry, vb.pp("deconv"))?;
        let x = Tensor::randn(0f32, 1f32, (1, 4, 147, 104), &Device::Cpu)?;
        assert_eq!(deconv.forward(&x)?.dims(), &[1, 2, 294, 207]);
        Ok(())
    }

    #[test]
    fn test_conv_transpose_crop_matches_padded_kernel() -> DetectorResult<()> {
        // With symmetric padding and no output padding the crop must agree with
        // candle's own padded transposed convolution.
        let varmap = VarMap::new();
        let vb = var_builder(&varmap);
        let geometry = UpsampleGeometry {
            kernel: 3,
            stride: 2,
            padding: Pad2::ONE,
            output_padding: Pad2::ZERO,
        };
        let deconv = ConvTranspose2d::load(3, 2, geometry, vb.pp("d"))?;
        let x = Tensor::randn(0f32, 1f32, (1, 3, 5, 6), &Device::Cpu)?;
        let ours = deconv.forward(&x)?;
        let reference = x
            .conv_transpose2d(&deconv.weight, 1, 0, 2, 1)?
            .broadcast_add(&deconv.bias.reshape((1, 2, 1, 1))?)?;
        let diff = (ours - reference)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "max diff {diff}");
        Ok(())
    }

    #[test]
    fn test_conv_transpose_output_padding_beyond_crop() -> DetectorResult<()> {
        // output padding larger than padding zero-extends the border before the bias
        let varmap = VarMap::new();
        let vb = var_builder(&varmap);
        let geometry = UpsampleGeometry {
            kernel: 3,
            stride: 2,
            padding: Pad2::ZERO,
            output_padding: Pad2::ONE,
        };
        let deconv = ConvTranspose2d::load(1, 1, geometry, vb.pp("d"))?;
        let x = Tensor::ones((1, 1, 2, 2), DType::F32, &Device::Cpu)?;
        let y = deconv.forward(&x)?;
        assert_eq!(y.dims(), &[1, 1, 6, 6]);
        let bias = deconv.bias.to_vec1::<f32>()?[0];
        let corner = y.flatten_all()?.to_vec1::<f32>()?[35];
        assert!((corner - bias).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_batch_norm_defaults_are_identity() -> DetectorResult<()> {
        let varmap = VarMap::new();
        let bn = BatchNorm2d::load(3, var_builder(&varmap).pp("bn"))?;
        let x = Tensor::randn(0f32, 1f32, (2, 3, 4, 4), &Device::Cpu)?;
        let diff = (bn.forward(&x)? - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }

    #[test]
    fn test_max_pool_padding_ignores_border() -> DetectorResult<()> {
        let pool = MaxPool2d::new("maxpool", 3, 2, 1);
        let x = Tensor::full(-5f32, (1, 1, 4, 4), &Device::Cpu)?;
        let y = pool.forward(&x)?;
        assert_eq!(y.dims(), &[1, 1, 2, 2]);
        assert_eq!(y.max_all()?.to_scalar::<f32>()?, -5.0);
        Ok(())
    }

    #[test]
    fn test_conv_block_parameter_names() -> DetectorResult<()> {
        let varmap = VarMap::new();
        let block = ConvBlock::load(
            1,
            16,
            ConvSpec::SAME_3X3,
            ConvSpec::POINTWISE,
            var_builder(&varmap).pp("conv_block_1"),
        )?;
        let mut params = Vec::new();
        block.parameters(&mut params);
        let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names[0], "conv_block_1.0.weight");
        assert!(names.contains(&"conv_block_1.1.running_var"));
        assert!(names.contains(&"conv_block_1.3.bias"));
        assert_eq!(names.len(), 12);
        Ok(())
    }

    #[test]
    fn test_concat_skip_rejects_spatial_mismatch() -> DetectorResult<()> {
        let a = Tensor::zeros((1, 2, 8, 8), DType::F32, &Device::Cpu)?;
        let b = Tensor::zeros((1, 3, 8, 7), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            concat_skip(&a, &b, "deconv_1"),
            Err(DetectorError::ShapeMismatch { .. })
        ));
        let c = Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu)?;
        assert_eq!(concat_skip(&a, &c, "deconv_1")?.dims(), &[1, 5, 8, 8]);
        Ok(())
    }
}
