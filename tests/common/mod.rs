#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;
use std::path::Path;

use mangai_detect::core::{Architecture, BackboneMode, DetectorResult};
use mangai_detect::models::{Resolution, TextDetector, build_detector};
use mangai_detect::runtime::OnnxRunner;

/// A detector with freshly initialized weights, plus the variables behind it.
///
/// Convolutions start from Kaiming-normal weights; batch norms get random
/// affine parameters and running statistics so that none of them is an identity.
pub fn random_detector(
    architecture: Architecture,
    resolution: Resolution,
) -> DetectorResult<(VarMap, Box<dyn TextDetector>)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let detector = build_detector(architecture, resolution, BackboneMode::Finetune, vb)?;
    randomize_batch_norms(&varmap)?;
    Ok((varmap, detector))
}

/// Replaces the identity batch-norm parameters of a fresh network with random
/// ones so that normalization actually changes values.
pub fn randomize_batch_norms(varmap: &VarMap) -> DetectorResult<()> {
    let data = varmap.data().lock().expect("varmap lock");
    let prefixes: Vec<&str> = data
        .keys()
        .filter_map(|name| name.strip_suffix(".running_mean"))
        .collect();
    for prefix in prefixes {
        let ranges = [
            ("weight", 0.5f32, 1.5f32),
            ("bias", -0.1, 0.1),
            ("running_mean", -0.5, 0.5),
            ("running_var", 0.5, 2.0),
        ];
        for (suffix, lo, up) in ranges {
            let var = &data[&format!("{prefix}.{suffix}")];
            var.set(&Tensor::rand(lo, up, var.dims().to_vec(), &Device::Cpu)?)?;
        }
    }
    Ok(())
}

/// Largest absolute value of a buffer.
pub fn max_abs(values: &[f32]) -> f32 {
    values.iter().fold(0f32, |m, v| m.max(v.abs()))
}

/// Writes the detector's parameters as a safetensors checkpoint.
pub fn save_checkpoint(detector: &dyn TextDetector, path: &Path) -> DetectorResult<()> {
    let mut params = Vec::new();
    detector.parameters(&mut params);
    let tensors: HashMap<String, Tensor> = params.into_iter().collect();
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

/// Deterministic input in `[0, 1)` for a detector.
pub fn sample_input(detector: &dyn TextDetector) -> DetectorResult<(Vec<f32>, Tensor)> {
    let dims = detector.input_dims(1);
    let len: usize = dims.iter().product();
    let values: Vec<f32> = (0..len).map(|i| ((i * 7919) % 1000) as f32 / 1000.0).collect();
    let tensor = Tensor::from_vec(values.clone(), dims.to_vec(), &Device::Cpu)?;
    Ok((values, tensor))
}

/// Largest absolute difference, relative to the magnitude of `expected`.
pub fn relative_error(expected: &[f32], actual: &[f32]) -> f32 {
    assert_eq!(expected.len(), actual.len());
    let scale = max_abs(expected).max(1e-6);
    let diff = expected
        .iter()
        .zip(actual)
        .fold(0f32, |m, (a, b)| m.max((a - b).abs()));
    diff / scale
}

/// Runs the candle network and the ONNX file on the same input and returns the
/// relative error between them.
pub fn compare_with_runtime(detector: &dyn TextDetector, onnx: &Path) -> DetectorResult<f32> {
    let (values, input) = sample_input(detector)?;
    let expected = detector.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(max_abs(&expected) > 1e-6, "network output is identically zero");
    assert!(expected.iter().all(|v| v.is_finite()));
    let runner = OnnxRunner::from_path(onnx, None)?;
    let (shape, actual) = runner.run(&values)?;
    assert_eq!(shape, detector.output_dims(1).to_vec());
    Ok(relative_error(&expected, &actual))
}
