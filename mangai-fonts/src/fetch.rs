//! HTTP access, behind a trait so the crawl can run against any source.

use reqwest::blocking::Client;
use std::time::Duration;
use tracing::debug;

use crate::error::FontsResult;

/// Something that can fetch a URL as text.
pub trait Fetcher {
    /// Returns the body of a 2xx response; any other status is an error.
    fn get_text(&self, url: &str) -> FontsResult<String>;
}

/// Blocking HTTP client reused across every request of a run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub const TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> FontsResult<Self> {
        let client = Client::builder()
            .timeout(Self::TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn get_text(&self, url: &str) -> FontsResult<String> {
        debug!(url, "GET");
        let resp = self.client.get(url).send()?.error_for_status()?;
        Ok(resp.text()?)
    }
}
