//! Manifest and segment fetching.
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ORIGIN, REFERER};

use crate::error::{Error, Result};

/// Origin sent with stream requests when the config names none.
pub const DEFAULT_ORIGIN: &str = "https://www.udio.com";

/// Source of manifest and segment bytes.
pub trait Fetcher {
    /// Fetch the whole body at `url`.
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

impl<T: Fetcher + ?Sized> Fetcher for &T {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        (**self).fetch(url)
    }
}

/// Blocking HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, origin: Option<&str>, user_agent: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(origin) = origin {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| Error::Config(format!("Invalid origin {}: {}", origin, e)))?;
            headers.insert(ORIGIN, value.clone());
            headers.insert(REFERER, value);
        }

        let mut builder = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .default_headers(headers);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder
            .build()
            .map_err(|e| Error::Fetch(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        trace!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::Fetch(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("{}: HTTP {}", url, status)));
        }
        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| Error::Fetch(format!("{}: {}", url, e)))
    }
}
