//! Readable content fetcher.
//!
//! Fetches a page and reduces it to plain text capped at a configured
//! length. Non-HTTP schemes and private or loopback hosts are refused.

use std::net::IpAddr;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument, warn};
use url::Url;

use tenderscout_shared::{FetchConfig, Result, TenderScoutError};

use crate::{http_client, preview, readable};

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Readable text of `url`, or `None` when the page is unavailable or empty.
    async fn fetch_readable(&self, url: &str) -> Result<Option<String>>;
}

pub struct HttpFetcher {
    client: Client,
    max_chars: usize,
    /// Allow localhost/private IPs (for tests with mock servers).
    allow_localhost: bool,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            max_chars: config.max_chars,
            allow_localhost: false,
        })
    }

    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    #[instrument(skip_all, fields(url = %url))]
    async fn fetch_readable(&self, url: &str) -> Result<Option<String>> {
        let Ok(parsed) = Url::parse(url) else {
            debug!("unparseable URL, skipping");
            return Ok(None);
        };

        if !self.allow_localhost && is_ssrf_target(&parsed) {
            warn!("SSRF protection: blocked");
            return Ok(None);
        }

        let response = self
            .client
            .get(parsed.as_str())
            .send()
            .await
            .map_err(|e| TenderScoutError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            debug!(%status, "page unavailable");
            return Ok(None);
        }

        let is_plain = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/plain"));

        let body = response
            .text()
            .await
            .map_err(|e| TenderScoutError::Network(format!("{url}: body read failed: {e}")))?;

        let text = if is_plain {
            body.trim().to_string()
        } else {
            readable::html_to_text(&body)?
        };

        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(preview(&text, self.max_chars).to_string()))
    }
}

// ---------------------------------------------------------------------------
// SSRF guard
// ---------------------------------------------------------------------------

pub(crate) fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(ip)) => is_private_ip(&IpAddr::V4(ip)),
        Some(url::Host::Ipv6(ip)) => is_private_ip(&IpAddr::V6(ip)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
