//! Persistent page -> glyph id cache.
//!
//! The cache is rewritten after every newly discovered page, through a temporary
//! file and a rename, so an interrupted crawl leaves exactly the pages that were
//! fully processed.

use mangai_detect::utils::write_atomic;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{FontsError, FontsResult};

pub const DEFAULT_CACHE_FILE: &str = "pagecache.json";

/// Glyph ids seen on each listing page, keyed by page number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlyphCache {
    path: PathBuf,
    pages: BTreeMap<u32, Vec<String>>,
}

impl GlyphCache {
    /// Opens the cache at `path`; a missing file is an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> FontsResult<Self> {
        let path = path.into();
        let pages = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| FontsError::Cache {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, pages })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page: u32) -> bool {
        self.pages.contains_key(&page)
    }

    pub fn page(&self, page: u32) -> Option<&[String]> {
        self.pages.get(&page).map(Vec::as_slice)
    }

    /// Stores the ids of a page and writes the whole cache back to disk.
    pub fn record(&mut self, page: u32, ids: Vec<String>) -> FontsResult<()> {
        self.pages.insert(page, ids);
        self.persist()
    }

    /// All glyph ids, in page order.
    pub fn glyph_ids(&self) -> impl Iterator<Item = &str> {
        self.pages.values().flatten().map(String::as_str)
    }

    fn persist(&self) -> FontsResult<()> {
        let json = serde_json::to_vec(&self.pages).map_err(|source| FontsError::Cache {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &json)?;
        debug!(path = %self.path.display(), pages = self.pages.len(), "saved page cache");
        Ok(())
    }
}
