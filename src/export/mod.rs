//! Checkpoint loading and ONNX export.

pub mod checkpoint;
pub mod driver;

pub use checkpoint::{Checkpoint, CheckpointFormat};
pub use driver::{
    ExportOptions, ExportReport, GRAPH_NAME, check_forward, default_output_path, export_checkpoint,
    export_model, trace_model,
};
