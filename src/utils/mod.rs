//! Utility functions: logging setup, device selection and atomic file writes.

use candle_core::Device;
use std::io::Write;
use std::path::Path;

use crate::core::{DetectorError, DetectorResult};

/// Installs a `tracing` subscriber filtered by `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Parses `cpu`, `cuda` (alias `gpu`, ordinal 0) or `cuda:N` into a candle device.
///
/// CUDA devices are only available when built with the `cuda` feature.
pub fn parse_device(name: &str) -> DetectorResult<Device> {
    let name = name.trim().to_ascii_lowercase();
    let ordinal = match name.as_str() {
        "cpu" => return Ok(Device::Cpu),
        "cuda" | "gpu" => 0,
        other => other
            .strip_prefix("cuda:")
            .ok_or_else(|| {
                DetectorError::config(format!("unknown device '{other}', expected cpu, cuda or cuda:N"))
            })?
            .parse::<usize>()
            .map_err(|_| DetectorError::config(format!("bad CUDA ordinal in '{other}'")))?,
    };
    cuda_device(ordinal)
}

#[cfg(feature = "cuda")]
fn cuda_device(ordinal: usize) -> DetectorResult<Device> {
    Device::new_cuda(ordinal).map_err(|e| DetectorError::config(format!("cannot open cuda:{ordinal}: {e}")))
}

#[cfg(not(feature = "cuda"))]
fn cuda_device(ordinal: usize) -> DetectorResult<Device> {
    Err(DetectorError::config(format!(
        "cuda:{ordinal} requested but CUDA support is not compiled in (enable the `cuda` feature)"
    )))
}

/// Writes `bytes` to `path` through a temporary file in the same directory.
///
/// The destination either keeps its previous content or receives the full new
/// content; an existing file is replaced. Shared with the glyph harvester, hence
/// the plain `io::Result`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
