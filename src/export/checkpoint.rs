//! Trained weight sets keyed by PyTorch state-dict names.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::{DetectorError, DetectorResult};

/// Buffers PyTorch stores in batch-norm state dicts that inference never reads.
const IGNORED_SUFFIXES: [&str; 1] = ["num_batches_tracked"];

/// On-disk encoding of a checkpoint, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Safetensors,
    /// `torch.save` pickle (`.pt`, `.pth`, `.ckpt`, `.bin`).
    Pickle,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> DetectorResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "safetensors" => Ok(Self::Safetensors),
            "pt" | "pth" | "ckpt" | "bin" => Ok(Self::Pickle),
            _ => Err(DetectorError::config(format!(
                "unsupported checkpoint extension '{ext}' for {} (expected safetensors, pt, pth, ckpt or bin)",
                path.display()
            ))),
        }
    }
}

/// An immutable set of named parameter tensors.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
    tensors: HashMap<String, Tensor>,
}

impl Checkpoint {
    /// Reads every tensor of the checkpoint at `path` onto `device`.
    pub fn load(path: impl AsRef<Path>, device: &Device) -> DetectorResult<Self> {
        let path = path.as_ref();
        let format = CheckpointFormat::from_path(path)?;
        let read_error = |e: candle_core::Error| DetectorError::Checkpoint {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        let tensors: HashMap<String, Tensor> = match format {
            CheckpointFormat::Safetensors => {
                candle_core::safetensors::load(path, device).map_err(read_error)?
            }
            CheckpointFormat::Pickle => {
                let mut entries = candle_core::pickle::read_all_with_key(path, None).map_err(read_error)?;
                if entries.is_empty() {
                    // Lightning-style checkpoints nest the weights
                    entries = candle_core::pickle::read_all_with_key(path, Some("state_dict"))
                        .map_err(read_error)?;
                }
                entries
                    .into_iter()
                    .map(|(name, t)| Ok((name, t.to_device(device)?)))
                    .collect::<candle_core::Result<_>>()
                    .map_err(read_error)?
            }
        };
        if tensors.is_empty() {
            return Err(DetectorError::Checkpoint {
                path: path.to_path_buf(),
                message: "no tensors found".to_string(),
            });
        }
        info!(path = %path.display(), ?format, tensors = tensors.len(), "loaded checkpoint");
        Ok(Self {
            path: path.to_path_buf(),
            tensors,
        })
    }

    /// Wraps tensors that are already in memory.
    pub fn from_tensors(path: impl Into<PathBuf>, tensors: HashMap<String, Tensor>) -> Self {
        Self {
            path: path.into(),
            tensors,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// A variable builder over the checkpoint. Missing names and shape
    /// mismatches surface when a network pulls its parameters.
    pub fn var_builder(&self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_tensors(self.tensors.clone(), dtype, device)
    }

    /// Fails if the checkpoint holds parameters the network never consumed.
    pub fn check_keys(&self, consumed: &[(String, Tensor)]) -> DetectorResult<()> {
        let mut unexpected: Vec<&str> = self
            .tensors
            .keys()
            .map(String::as_str)
            .filter(|name| !IGNORED_SUFFIXES.iter().any(|s| name.ends_with(s)))
            .filter(|name| !consumed.iter().any(|(c, _)| c == name))
            .collect();
        if unexpected.is_empty() {
            debug!(consumed = consumed.len(), "every checkpoint tensor is used");
            return Ok(());
        }
        unexpected.sort_unstable();
        Err(DetectorError::Checkpoint {
            path: self.path.clone(),
            message: format!("unexpected keys in state dict: {}", unexpected.join(", ")),
        })
    }
}
