//! Running exported graphs with tract.
//!
//! Used to check exported graphs against the candle networks, to time
//! inference in `mangai-bench` and to detect text on whole pages by tiling
//! them into network-sized windows ([`tiles`]).

pub mod tiles;

pub use tiles::{DEFAULT_THRESHOLD, PageScores, Tile, TileGrid};

use indicatif::ProgressBar;
use std::path::Path;
use std::time::{Duration, Instant};
use tract_onnx::pb::ModelProto;
use tract_onnx::prelude::*;
use tracing::{debug, info};

use crate::core::{DetectorError, DetectorResult, ProcessingStage};
use crate::models::Resolution;
use crate::onnx::{proto::value_dims, read_model};

type Plan = TypedRunnableModel<TypedModel>;

fn runtime_error(context: impl Into<String>) -> impl FnOnce(TractError) -> DetectorError {
    let context = context.into();
    move |e| DetectorError::processing(ProcessingStage::Runtime, context, e)
}

/// An optimized, runnable ONNX graph with a fixed input shape.
pub struct OnnxRunner {
    plan: Plan,
    input_shape: Vec<usize>,
}

impl std::fmt::Debug for OnnxRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxRunner")
            .field("input_shape", &self.input_shape)
            .finish_non_exhaustive()
    }
}

impl OnnxRunner {
    /// Prepares `model` for execution. `input_shape` overrides the shape
    /// declared by the graph input, which is required if that one is symbolic.
    pub fn from_model(model: &ModelProto, input_shape: Option<&[usize]>) -> DetectorResult<Self> {
        let declared = model
            .graph
            .as_ref()
            .and_then(|g| g.input.first())
            .and_then(value_dims);
        let input_shape = match (input_shape, declared) {
            (Some(shape), _) => shape.to_vec(),
            (None, Some(shape)) => shape,
            (None, None) => {
                return Err(DetectorError::invalid_input(
                    "graph input has no fixed shape; pass one explicitly",
                ));
            }
        };

        info!(shape = ?input_shape, "creating inference session with tract");
        let plan = onnx()
            .model_for_proto_model(model)
            .map_err(runtime_error("load graph"))?
            .with_input_fact(0, f32::fact(input_shape.clone()).into())
            .map_err(runtime_error("set input shape"))?
            .into_optimized()
            .map_err(runtime_error("optimize graph"))?
            .into_runnable()
            .map_err(runtime_error("build plan"))?;
        Ok(Self { plan, input_shape })
    }

    pub fn from_path(path: impl AsRef<Path>, input_shape: Option<&[usize]>) -> DetectorResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "reading onnx model");
        Self::from_model(&read_model(path)?, input_shape)
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// Runs the graph on a row-major buffer of [`OnnxRunner::input_shape`].
    /// Returns the first output's shape and values.
    pub fn run(&self, input: &[f32]) -> DetectorResult<(Vec<usize>, Vec<f32>)> {
        let expected: usize = self.input_shape.iter().product();
        if input.len() != expected {
            return Err(DetectorError::shape_mismatch(
                "runtime input",
                &self.input_shape,
                &[input.len()],
            ));
        }
        let tensor = Tensor::from_shape(&self.input_shape, input).map_err(runtime_error("wrap input"))?;
        let outputs = self
            .plan
            .run(tvec!(tensor.into_tvalue()))
            .map_err(runtime_error("run graph"))?;
        let output = outputs
            .first()
            .ok_or_else(|| DetectorError::graph("graph produced no output"))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(runtime_error("read output"))?;
        Ok((view.shape().to_vec(), view.iter().copied().collect()))
    }

    /// Runs on uniform random input in `[0, 1)`.
    pub fn run_random(&self) -> DetectorResult<Vec<usize>> {
        let input = random_input(self.input_shape.iter().product())?;
        Ok(self.run(&input)?.0)
    }
}

/// Uniform random values in `[0, 1)`.
fn random_input(len: usize) -> DetectorResult<Vec<f32>> {
    let values = candle_core::Tensor::rand(0f32, 1f32, len, &candle_core::Device::Cpu)?;
    Ok(values.to_vec1::<f32>()?)
}

/// A random grayscale page for [`OnnxRunner::detect_page`].
pub fn random_page(page: Resolution) -> DetectorResult<Vec<f32>> {
    random_input(page.height * page.width)
}

/// Timing of repeated inference runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchReport {
    pub iterations: usize,
    pub total: Duration,
}

impl BenchReport {
    pub fn average(&self) -> Duration {
        if self.iterations == 0 {
            Duration::ZERO
        } else {
            self.total / self.iterations as u32
        }
    }
}

/// Runs the graph `iterations` times on the same random input. The first run
/// is timed like every other. `progress` advances once per run.
pub fn bench(runner: &OnnxRunner, iterations: usize, progress: &ProgressBar) -> DetectorResult<BenchReport> {
    if iterations == 0 {
        return Err(DetectorError::invalid_input("iterations must be at least 1"));
    }
    let input = random_input(runner.input_shape().iter().product())?;
    progress.set_length(iterations as u64);
    let start = Instant::now();
    for i in 0..iterations {
        runner.run(&input)?;
        progress.inc(1);
        debug!(iteration = i + 1, elapsed = ?start.elapsed(), "inference");
    }
    progress.finish();
    Ok(BenchReport {
        iterations,
        total: start.elapsed(),
    })
}
