//! Error type of the glyph harvester.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while crawling the listing or writing glyphs.
#[derive(Debug, Error)]
pub enum FontsError {
    /// Transport failure or a non-2xx response.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The page cache file exists but cannot be parsed or written.
    #[error("page cache {}: {source}", path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A listing page without the `ul#entry` container.
    #[error("no entry list on {url}")]
    MissingEntryList { url: String },

    /// A listing link whose href carries no glyph id.
    #[error("cannot take a glyph id from href '{href}'")]
    InvalidHref { href: String },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

pub type FontsResult<T> = Result<T, FontsError>;
