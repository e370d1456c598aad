//! Error types for model construction, export and graph optimization.
//!
//! Every failure in this crate is fatal to the caller; the variants exist so that
//! callers and tests can tell which stage failed and what shape or name was involved.

use std::path::PathBuf;
use thiserror::Error;

/// Stage of the export / optimization flow an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Reading or binding checkpoint tensors.
    Checkpoint,
    /// Running a network forward pass.
    Forward,
    /// Walking a network into an ONNX graph.
    Trace,
    /// Encoding or writing a serialized graph.
    Serialize,
    /// Rewriting a serialized graph.
    Optimize,
    /// Executing a serialized graph with the inference runtime.
    Runtime,
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStage::Checkpoint => write!(f, "checkpoint"),
            ProcessingStage::Forward => write!(f, "forward pass"),
            ProcessingStage::Trace => write!(f, "graph trace"),
            ProcessingStage::Serialize => write!(f, "serialization"),
            ProcessingStage::Optimize => write!(f, "graph optimization"),
            ProcessingStage::Runtime => write!(f, "inference runtime"),
        }
    }
}

/// Errors produced by the detector networks and the ONNX tooling around them.
#[derive(Error, Debug)]
pub enum DetectorError {
    /// A stage failed because of an underlying library error.
    #[error("{kind} failed: {context}")]
    Processing {
        /// The stage where the error occurred.
        kind: ProcessingStage,
        /// What was being done.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Two tensors that must agree in shape did not.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// The shape that was required.
        expected: Vec<usize>,
        /// The shape that was found.
        actual: Vec<usize>,
    },

    /// The checkpoint does not match the network's declared parameters.
    #[error("checkpoint {}: {message}", path.display())]
    Checkpoint {
        /// Checkpoint file.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// Invalid input supplied by the caller.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// A message describing the invalid input.
        message: String,
    },

    /// Invalid configuration (resolution, geometry, device, file format).
    #[error("configuration: {message}")]
    ConfigError {
        /// A message describing the configuration error.
        message: String,
    },

    /// A serialized graph is malformed or cannot be rewritten.
    #[error("graph: {message}")]
    Graph {
        /// A message describing the problem.
        message: String,
    },

    /// An optimization pass name that is not implemented.
    #[error("unknown optimization pass '{name}' (supported: {supported})")]
    UnknownPass {
        /// The requested name.
        name: String,
        /// Comma separated list of supported names.
        supported: String,
    },

    /// Error from candle tensor operations.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// Protobuf decoding failed.
    #[error("onnx decode")]
    Decode(#[from] prost::DecodeError),

    /// IO error.
    #[error("io")]
    Io(#[from] std::io::Error),
}

impl DetectorError {
    /// Wraps an underlying error with its stage and context.
    pub fn processing(
        kind: ProcessingStage,
        context: impl Into<String>,
        error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Processing {
            kind,
            context: context.into(),
            source: error.into(),
        }
    }

    /// Creates a shape mismatch error.
    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Creates a graph error.
    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph {
            message: message.into(),
        }
    }

    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

/// Result alias used across the crate.
pub type DetectorResult<T> = Result<T, DetectorError>;
