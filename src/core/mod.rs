//! Core types shared by the networks, the exporter and the optimizer.
//!
//! - Error handling ([`DetectorError`], [`DetectorResult`])
//! - Export configuration ([`DetectorConfig`])

pub mod config;
pub mod errors;

pub use config::{Architecture, BackboneMode, DEFAULT_OPSET, DetectorConfig};
pub use errors::{DetectorError, DetectorResult, ProcessingStage};
