//! Crawls the dddfont.com listing and downloads every glyph SVG.
//!
//! Runs with no arguments: the page cache goes to `pagecache.json` and the
//! glyphs to `svg/` in the working directory. Re-running resumes where the
//! previous run stopped.

use clap::Parser;
use mangai_detect::utils::init_tracing;
use std::path::PathBuf;
use tracing::info;

use mangai_fonts::site::{DEFAULT_BASE_URL, DEFAULT_FIRST_PAGE, DEFAULT_LAST_PAGE};
use mangai_fonts::{Crawler, DEFAULT_CACHE_FILE, GlyphCache, HttpFetcher, SiteConfig};

/// Command-line arguments for the downloader
#[derive(Parser)]
#[command(name = "ddd-download")]
#[command(about = "Download glyph SVGs from dddfont.com")]
struct Args {
    /// Site root
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// First listing page
    #[arg(long, default_value_t = DEFAULT_FIRST_PAGE)]
    first_page: u32,

    /// Last listing page (inclusive)
    #[arg(long, default_value_t = DEFAULT_LAST_PAGE)]
    last_page: u32,

    /// Page cache file
    #[arg(long, default_value = DEFAULT_CACHE_FILE)]
    cache: PathBuf,

    /// Output directory for the SVG files
    #[arg(long, default_value = "svg")]
    out_dir: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let site = SiteConfig {
        base_url: args.base_url,
        first_page: args.first_page,
        last_page: args.last_page,
    };
    let mut cache = GlyphCache::load(&args.cache)?;
    info!("Pages: {}", site.pages().count());
    info!("Cached pages: {}", cache.len());

    let crawler = Crawler::new(HttpFetcher::new()?, site)?.with_progress(true);
    let discovered = crawler.discover(&mut cache)?;
    info!("Discovered {} new pages", discovered.fetched);

    let downloaded = crawler.download(&cache, &args.out_dir)?;
    info!(
        "Downloaded {} SVGs ({} already present)",
        downloaded.downloaded, downloaded.existing
    );
    Ok(())
}
