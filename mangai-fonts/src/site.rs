//! Where the listing lives and how its URLs are formed.

use serde::{Deserialize, Serialize};

use crate::error::{FontsError, FontsResult};

pub const DEFAULT_BASE_URL: &str = "https://dddfont.com";
pub const DEFAULT_FIRST_PAGE: u32 = 1;
pub const DEFAULT_LAST_PAGE: u32 = 155;

/// Base URL and inclusive page range of the listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub base_url: String,
    pub first_page: u32,
    pub last_page: u32,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            first_page: DEFAULT_FIRST_PAGE,
            last_page: DEFAULT_LAST_PAGE,
        }
    }
}

impl SiteConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> FontsResult<()> {
        if self.first_page > self.last_page {
            return Err(FontsError::InvalidConfig {
                message: format!("first page {} is after last page {}", self.first_page, self.last_page),
            });
        }
        if self.base_url.is_empty() {
            return Err(FontsError::InvalidConfig {
                message: "base URL is empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn pages(&self) -> std::ops::RangeInclusive<u32> {
        self.first_page..=self.last_page
    }

    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn page_url(&self, page: u32) -> String {
        format!("{}/page/{page}/", self.base())
    }

    /// Glyph `1234-5` is served as `/m/1234/1234_0.svg`.
    pub fn svg_url(&self, glyph_id: &str) -> String {
        let number = glyph_id.split('-').next().unwrap_or(glyph_id);
        format!("{}/m/{number}/{number}_0.svg", self.base())
    }
}
