//! Concrete collaborators consumed by the pipeline.
//!
//! Every collaborator sits behind an `async_trait` seam so the pipeline can
//! be driven by scripted doubles in tests:
//! - [`CompletionProvider`]: ordered chain of chat-completion endpoints
//! - [`WebSearch`]: Serper with a keyless DuckDuckGo fallback
//! - [`ContentFetcher`]: readable plain text of a web page
//! - [`MarketplaceSession`] / [`MarketplaceContext`]: the scraping bridge

pub mod bridge;
pub mod completion;
pub mod fetch;
pub mod marketplace;
pub mod readable;
pub mod search;

use std::time::Duration;

use reqwest::Client;
use tenderscout_shared::{Result, TenderScoutError};

pub use bridge::ScraperBridge;
pub use completion::{
    ChatMessage, Completion, CompletionProvider, CompletionRequest, ProviderChain, Role,
};
pub use fetch::{ContentFetcher, HttpFetcher};
pub use marketplace::{ListingDetails, ListingSummary, MarketplaceContext, MarketplaceSession};
pub use search::{DuckDuckGoSearch, FallbackSearch, SearchHit, SerperSearch, WebSearch};

/// User-Agent string for outbound requests.
pub(crate) const USER_AGENT: &str = concat!("TenderScout/", env!("CARGO_PKG_VERSION"));

/// Build the shared HTTP client with a per-request timeout.
pub fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| TenderScoutError::Network(format!("failed to build HTTP client: {e}")))
}

/// First `max` characters of `text`, on a char boundary.
pub(crate) fn preview(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
