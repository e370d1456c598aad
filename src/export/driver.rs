//! Checkpoint to ONNX export.
//!
//! The flow is load -> synthetic forward pass -> trace -> atomic write. Nothing
//! is written unless the first three stages succeed, and the write itself goes
//! through a temporary file so an interrupted export never leaves a partial graph.

use candle_core::{DType, Device, Tensor};
use std::path::{Path, PathBuf};
use tract_onnx::pb::ModelProto;
use tracing::{debug, info};

use super::checkpoint::Checkpoint;
use crate::core::{Architecture, BackboneMode, DEFAULT_OPSET, DetectorError, DetectorResult, ProcessingStage};
use crate::models::{Resolution, TextDetector, build_detector};
use crate::onnx::{GraphBuilder, GraphSpec, INPUT_NAME, encode_model};
use crate::utils::write_atomic;

/// Name of the exported graph.
pub const GRAPH_NAME: &str = "main_graph";

/// Everything needed to export one checkpoint.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub checkpoint: PathBuf,
    pub architecture: Architecture,
    pub resolution: Resolution,
    pub opset: i64,
    /// Defaults to the checkpoint path with an `onnx` extension.
    pub output: Option<PathBuf>,
    pub device: Device,
}

impl ExportOptions {
    pub fn new(checkpoint: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint: checkpoint.into(),
            architecture: Architecture::default(),
            resolution: Resolution::DEFAULT,
            opset: DEFAULT_OPSET,
            output: None,
            device: Device::Cpu,
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| default_output_path(&self.checkpoint))
    }
}

/// Summary of a finished export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub output: PathBuf,
    pub nodes: usize,
    pub initializers: usize,
    pub bytes: usize,
}

/// `weights.pth` -> `weights.onnx`.
pub fn default_output_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_extension("onnx")
}

/// Runs the network once on uniform random input and checks the output shape.
pub fn check_forward(detector: &dyn TextDetector, device: &Device) -> DetectorResult<()> {
    let input_dims = detector.input_dims(1);
    let x = Tensor::rand(0f32, 1f32, input_dims.to_vec(), device)?;
    let y = detector.forward(&x)?;
    let expected = detector.output_dims(1);
    if y.dims() != expected {
        return Err(DetectorError::shape_mismatch(
            format!("{} network output", detector.name()),
            &expected,
            y.dims(),
        ));
    }
    debug!(input = ?input_dims, output = ?y.dims(), "synthetic forward pass");
    Ok(())
}

/// Walks the network into an ONNX model with a fixed batch of one.
pub fn trace_model(detector: &dyn TextDetector, opset: i64) -> DetectorResult<ModelProto> {
    let mut graph = GraphBuilder::new();
    let output = detector.trace(&mut graph, INPUT_NAME).map_err(|e| {
        DetectorError::processing(ProcessingStage::Trace, format!("trace {}", detector.name()), e)
    })?;
    debug!(
        nodes = graph.node_count(),
        initializers = graph.initializer_count(),
        "traced {}",
        detector.name()
    );
    graph.build(
        &output,
        &GraphSpec {
            graph_name: GRAPH_NAME.to_string(),
            input_dims: detector.input_dims(1).to_vec(),
            output_dims: detector.output_dims(1).to_vec(),
            opset,
        },
    )
}

/// Checks, traces and writes an already constructed network.
pub fn export_model(
    detector: &dyn TextDetector,
    output: &Path,
    opset: i64,
    device: &Device,
) -> DetectorResult<ExportReport> {
    check_forward(detector, device)?;
    let model = trace_model(detector, opset)?;
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| DetectorError::graph("traced model has no graph"))?;
    let (nodes, initializers) = (graph.node.len(), graph.initializer.len());
    let bytes = encode_model(&model);
    write_atomic(output, &bytes).map_err(|e| {
        DetectorError::processing(ProcessingStage::Serialize, format!("write {}", output.display()), e)
    })?;
    info!(path = %output.display(), nodes, initializers, bytes = bytes.len(), "wrote onnx model");
    Ok(ExportReport {
        output: output.to_path_buf(),
        nodes,
        initializers,
        bytes: bytes.len(),
    })
}

/// Loads a checkpoint into the selected network and exports it.
///
/// The backbone is always built in fine-tuning mode; both modes trace to the
/// same graph.
pub fn export_checkpoint(options: &ExportOptions) -> DetectorResult<ExportReport> {
    info!(
        checkpoint = %options.checkpoint.display(),
        architecture = ?options.architecture,
        resolution = %options.resolution,
        opset = options.opset,
        "exporting"
    );
    let checkpoint = Checkpoint::load(&options.checkpoint, &options.device)?;
    let vb = checkpoint.var_builder(DType::F32, &options.device);
    let detector = build_detector(options.architecture, options.resolution, BackboneMode::Finetune, vb)
        .map_err(|e| match e {
            DetectorError::Candle(source) => DetectorError::processing(
                ProcessingStage::Checkpoint,
                format!("bind {}", options.checkpoint.display()),
                source,
            ),
            other => other,
        })?;

    let mut consumed = Vec::new();
    detector.parameters(&mut consumed);
    checkpoint.check_keys(&consumed)?;

    export_model(detector.as_ref(), &options.output_path(), options.opset, &options.device)
}
