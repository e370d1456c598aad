//! Exports a trained checkpoint to ONNX.
//!
//! # Usage
//!
//! ```bash
//! mangai-export runs/best.pth
//! mangai-export runs/best.safetensors --arch segmentation --height 1176 --width 828 -o detector.onnx
//! ```
//!
//! Options given on the command line override the values of `--config`.

use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

use mangai_detect::core::{Architecture, DetectorConfig};
use mangai_detect::export::{ExportOptions, export_checkpoint};
use mangai_detect::utils::{init_tracing, parse_device};

/// Command-line arguments for the exporter
#[derive(Parser)]
#[command(name = "mangai-export")]
#[command(about = "Export a text detector checkpoint to ONNX")]
struct Args {
    /// Trained weights (.safetensors, .pt, .pth, .ckpt or .bin)
    checkpoint: PathBuf,

    /// Network architecture: pretrained or segmentation
    #[arg(long)]
    arch: Option<Architecture>,

    /// Input height in pixels
    #[arg(long)]
    height: Option<usize>,

    /// Input width in pixels
    #[arg(long)]
    width: Option<usize>,

    /// ONNX operator set version
    #[arg(long)]
    opset: Option<i64>,

    /// Output file (default: the checkpoint path with an .onnx extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Device to run the shape check on: cpu, cuda or cuda:N
    #[arg(short, long, default_value = "cpu")]
    device: String,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DetectorConfig::from_path(path)?,
        None => DetectorConfig::default(),
    };
    if let Some(arch) = args.arch {
        config.architecture = arch;
    }
    if let Some(height) = args.height {
        config.height = height;
    }
    if let Some(width) = args.width {
        config.width = width;
    }
    if let Some(opset) = args.opset {
        config.opset = opset;
    }
    config.validate()?;

    let device = parse_device(&args.device)?;
    info!("Using device: {:?}", device);

    let options = ExportOptions {
        checkpoint: args.checkpoint,
        architecture: config.architecture,
        resolution: config.resolution(),
        opset: config.opset,
        output: args.output,
        device,
    };
    println!("Saving model to {}", options.output_path().display());

    let start = Instant::now();
    let report = export_checkpoint(&options)?;
    info!(
        "Exported {} nodes and {} initializers in {:.2}s",
        report.nodes,
        report.initializers,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
