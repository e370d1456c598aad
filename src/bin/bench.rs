//! Times inference of an ONNX model on random input.
//!
//! # Usage
//!
//! ```bash
//! mangai-bench detector.onnx -n 10
//! mangai-bench detector.onnx --page 2352,1656 --threshold 0.0005
//! ```
//!
//! With `--page` a random grayscale page of that size is detected window by
//! window instead, and the share of text pixels is reported.

use clap::Parser;
use indicatif::ProgressBar;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

use mangai_detect::models::Resolution;
use mangai_detect::runtime::{DEFAULT_THRESHOLD, OnnxRunner, bench, random_page};
use mangai_detect::utils::init_tracing;

/// Command-line arguments for the benchmark
#[derive(Parser)]
#[command(name = "mangai-bench")]
#[command(about = "Average inference time of an ONNX model")]
struct Args {
    /// Model to run
    model: PathBuf,

    /// Number of timed runs
    #[arg(short = 'n', long, default_value = "2")]
    iterations: usize,

    /// Input shape, e.g. 1,3,1176,828 (default: the shape declared by the model)
    #[arg(long, value_delimiter = ',')]
    shape: Option<Vec<usize>>,

    /// Detect a whole page of HEIGHT,WIDTH pixels by tiling
    #[arg(long, value_delimiter = ',', num_args = 2)]
    page: Option<Vec<usize>>,

    /// Score above which a pixel is text
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let runner = OnnxRunner::from_path(&args.model, args.shape.as_deref())?;
    info!("Input shape: {:?}", runner.input_shape());

    if let Some([height, width]) = args.page.as_deref().map(<[usize; 2]>::try_from).transpose()? {
        let page = Resolution::new(height, width);
        let pixels = random_page(page)?;
        let start = Instant::now();
        let scores = runner.detect_page(&pixels, page, &ProgressBar::new(0))?;
        println!("Page inference time: {}s", start.elapsed().as_secs_f64());
        println!("Text pixels: {:.4}", scores.text_fraction(args.threshold));
        return Ok(());
    }

    let report = bench(&runner, args.iterations, &ProgressBar::new(0))?;
    println!("Average inference time: {}s", report.average().as_secs_f64());
    Ok(())
}
