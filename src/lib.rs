//! # mangai-detect
//!
//! Text-region detection networks for Japanese comic pages, with ONNX export
//! and a small ONNX graph optimizer.
//!
//! ## Features
//!
//! - Two encoder/decoder networks producing a single-channel text logit map
//!   at the input resolution
//! - Checkpoint loading from safetensors or PyTorch pickles, keyed by state-dict name
//! - ONNX export by tracing the candle network layer by layer
//! - onnxoptimizer-compatible rewrite passes
//! - Inference and timing of exported graphs with tract, including tiled
//!   detection of pages larger than the network input
//!
//! ## Modules
//!
//! * [`core`] - Error handling and configuration
//! * [`models`] - The segmentation and ResNet-34 backbone networks
//! * [`onnx`] - Graph building and protobuf helpers
//! * [`export`] - Checkpoint to ONNX export
//! * [`optimize`] - Named graph rewrite passes
//! * [`runtime`] - Running exported graphs
//! * [`utils`] - Logging setup, device selection and atomic writes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mangai_detect::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut options = ExportOptions::new("runs/best.pth");
//! options.resolution = Resolution::new(1176, 828);
//! let report = export_checkpoint(&options)?;
//!
//! let optimized = optimize_file(&report.output, &[Pass::FuseBnIntoConv], true)?;
//! let runner = OnnxRunner::from_path(&optimized, None)?;
//! println!("{:?}", runner.run_random()?);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod export;
pub mod models;
pub mod onnx;
pub mod optimize;
pub mod runtime;
pub mod utils;

/// Prelude module for convenient imports.
///
/// ```rust
/// use mangai_detect::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{Architecture, BackboneMode, DetectorConfig, DetectorError, DetectorResult};
    pub use crate::export::{ExportOptions, ExportReport, export_checkpoint, export_model};
    pub use crate::models::{
        PretrainedTextDetector, Resolution, SegmentationTextDetector, TextDetector, build_detector,
    };
    pub use crate::optimize::{Pass, optimize, optimize_file};
    pub use crate::runtime::{DEFAULT_THRESHOLD, OnnxRunner, PageScores, bench};
}
