//! Export configuration.
//!
//! [`DetectorConfig`] is what the export binary reads from an optional JSON file
//! before applying command-line overrides. Every field has a default so an empty
//! object (or no file at all) describes the production export: the backbone
//! network at 1176x828, fine-tuned, opset 12.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::errors::{DetectorError, DetectorResult};
use crate::models::geometry::Resolution;

/// Default ONNX operator set version of exported graphs.
pub const DEFAULT_OPSET: i64 = 12;

/// Which network an export targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// ResNet-34 backbone with the five-stage decoder.
    #[default]
    Pretrained,
    /// Self-contained single-channel encoder/decoder.
    Segmentation,
}

impl std::str::FromStr for Architecture {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretrained" | "resnet34" => Ok(Architecture::Pretrained),
            "segmentation" | "unet" => Ok(Architecture::Segmentation),
            other => Err(DetectorError::config(format!(
                "unknown architecture '{other}', expected 'pretrained' or 'segmentation'"
            ))),
        }
    }
}

/// How the pretrained backbone takes part in the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackboneMode {
    /// Backbone features stay attached to the gradient graph.
    Finetune,
    /// Backbone is a fixed feature extractor; its outputs are detached.
    #[default]
    Frozen,
}

/// Export configuration file.
///
/// Carries no backbone mode: export always binds the fine-tuning network, and
/// both modes trace to the same graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Network architecture.
    pub architecture: Architecture,
    /// Input height in pixels.
    pub height: usize,
    /// Input width in pixels.
    pub width: usize,
    /// ONNX operator set version.
    pub opset: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::default(),
            height: Resolution::DEFAULT.height,
            width: Resolution::DEFAULT.width,
            opset: DEFAULT_OPSET,
        }
    }
}

impl DetectorConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> DetectorResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            DetectorError::config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// The configured input resolution.
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.height, self.width)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> DetectorResult<()> {
        if self.height == 0 || self.width == 0 {
            return Err(DetectorError::config(format!(
                "resolution must be non-zero, got {}x{}",
                self.height, self.width
            )));
        }
        // Opset 9 is the first with a ConvTranspose output_padding that runtimes agree on.
        if !(9..=21).contains(&self.opset) {
            return Err(DetectorError::config(format!(
                "unsupported opset {}, expected 9..=21",
                self.opset
            )));
        }
        Ok(())
    }
}
