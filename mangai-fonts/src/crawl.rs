//! Listing discovery and SVG download.

use indicatif::ProgressBar;
use kuchiki::traits::*;
use mangai_detect::utils::write_atomic;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cache::GlyphCache;
use crate::error::{FontsError, FontsResult};
use crate::fetch::Fetcher;
use crate::site::SiteConfig;

/// Glyph id of a listing link: the second-to-last `/`-separated segment,
/// e.g. `https://dddfont.com/m/1234-5/` -> `1234-5`.
pub fn glyph_id_from_href(href: &str) -> FontsResult<String> {
    let segments: Vec<&str> = href.split('/').collect();
    let invalid = || FontsError::InvalidHref {
        href: href.to_string(),
    };
    if segments.len() < 2 {
        return Err(invalid());
    }
    let id = segments[segments.len() - 2];
    if id.is_empty() || id == "." || id == ".." {
        return Err(invalid());
    }
    Ok(id.to_string())
}

/// Glyph ids of every link inside `ul#entry`, in document order.
pub fn parse_glyph_ids(html: &str, url: &str) -> FontsResult<Vec<String>> {
    let document = kuchiki::parse_html().one(html);
    let entries = document
        .select_first("ul#entry")
        .map_err(|_| FontsError::MissingEntryList { url: url.to_string() })?;
    let anchors = entries
        .as_node()
        .select("a")
        .map_err(|_| FontsError::MissingEntryList { url: url.to_string() })?;

    let mut ids = Vec::new();
    for anchor in anchors {
        let attributes = anchor.attributes.borrow();
        let href = attributes.get("href").ok_or_else(|| FontsError::InvalidHref {
            href: String::new(),
        })?;
        ids.push(glyph_id_from_href(href)?);
    }
    Ok(ids)
}

/// Counts of a discovery run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverReport {
    pub fetched: usize,
    pub cached: usize,
}

/// Counts of a download run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub existing: usize,
}

/// Walks the listing and fetches glyph files.
#[derive(Debug, Clone)]
pub struct Crawler<F> {
    fetcher: F,
    site: SiteConfig,
    progress: bool,
}

impl<F: Fetcher> Crawler<F> {
    pub fn new(fetcher: F, site: SiteConfig) -> FontsResult<Self> {
        site.validate()?;
        Ok(Self {
            fetcher,
            site,
            progress: false,
        })
    }

    /// Draws a progress bar on stderr for each phase.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if self.progress {
            ProgressBar::new(len as u64)
        } else {
            ProgressBar::hidden()
        }
    }

    pub fn site(&self) -> &SiteConfig {
        &self.site
    }

    /// Fetches every listing page missing from `cache`, recording each one as
    /// soon as it is parsed. Stops at the first failure.
    pub fn discover(&self, cache: &mut GlyphCache) -> FontsResult<DiscoverReport> {
        let mut report = DiscoverReport::default();
        let progress = self.progress_bar(self.site.pages().count());
        for page in self.site.pages() {
            progress.inc(1);
            if cache.contains(page) {
                debug!(page, "page cached");
                report.cached += 1;
                continue;
            }
            let url = self.site.page_url(page);
            let html = self.fetcher.get_text(&url)?;
            let ids = parse_glyph_ids(&html, &url)?;
            info!(page, ids = ids.len(), "discovered page");
            cache.record(page, ids)?;
            report.fetched += 1;
        }
        progress.finish();
        Ok(report)
    }

    /// Downloads `<id>.svg` for every cached glyph not already in `out_dir`.
    pub fn download(&self, cache: &GlyphCache, out_dir: &Path) -> FontsResult<DownloadReport> {
        std::fs::create_dir_all(out_dir)?;
        let mut report = DownloadReport::default();
        let progress = self.progress_bar(cache.glyph_ids().count());
        for id in cache.glyph_ids() {
            progress.inc(1);
            let path = svg_path(out_dir, id);
            if path.exists() {
                debug!(id, "svg present");
                report.existing += 1;
                continue;
            }
            let svg = self.fetcher.get_text(&self.site.svg_url(id))?;
            write_atomic(&path, svg.as_bytes())?;
            debug!(id, path = %path.display(), "saved svg");
            report.downloaded += 1;
        }
        progress.finish();
        info!(downloaded = report.downloaded, existing = report.existing, "downloaded svgs");
        Ok(report)
    }
}

pub fn svg_path(out_dir: &Path, glyph_id: &str) -> PathBuf {
    out_dir.join(format!("{glyph_id}.svg"))
}
