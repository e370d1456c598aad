//! Applies named rewrite passes to an ONNX model.
//!
//! # Usage
//!
//! ```bash
//! mangai-optimize detector.onnx --pass eliminate_identity --pass fuse_bn_into_conv --fixed-point
//! ```
//!
//! The result is written next to the input as `<name>_opt.onnx`.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use mangai_detect::optimize::{optimize_file, parse_passes};
use mangai_detect::utils::init_tracing;

/// Command-line arguments for the optimizer
#[derive(Parser)]
#[command(name = "mangai-optimize")]
#[command(about = "Rewrite an ONNX model with onnxoptimizer-style passes")]
struct Args {
    /// Model to optimize
    model: PathBuf,

    /// Pass to apply; repeat to run several in order
    #[arg(short, long = "pass")]
    passes: Vec<String>,

    /// Repeat the pass list until the graph stops changing
    #[arg(long)]
    fixed_point: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let passes = parse_passes(&args.passes)?;
    info!("Passes: {:?}", args.passes);

    let out = optimize_file(&args.model, &passes, args.fixed_point)?;
    println!("Saving model to {}", out.display());
    Ok(())
}
