//! # mangai-fonts
//!
//! Harvests vector glyphs from the dddfont.com listing: a paginated crawl
//! collects glyph ids into a persistent page cache, then every glyph's SVG is
//! downloaded once.
//!
//! ```rust,no_run
//! use mangai_fonts::{Crawler, GlyphCache, HttpFetcher, SiteConfig};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cache = GlyphCache::load("pagecache.json")?;
//! let crawler = Crawler::new(HttpFetcher::new()?, SiteConfig::default())?;
//! crawler.discover(&mut cache)?;
//! crawler.download(&cache, Path::new("svg"))?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod crawl;
pub mod error;
pub mod fetch;
pub mod site;

pub use cache::{DEFAULT_CACHE_FILE, GlyphCache};
pub use crawl::{Crawler, DiscoverReport, DownloadReport, glyph_id_from_href, parse_glyph_ids, svg_path};
pub use error::{FontsError, FontsResult};
pub use fetch::{Fetcher, HttpFetcher};
pub use site::SiteConfig;
