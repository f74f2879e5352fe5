//! Marketplace scraping seam.
//!
//! A [`MarketplaceSession`] is the job-wide resource (one headless browser);
//! each item acquires its own [`MarketplaceContext`] and closes it when done.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tenderscout_shared::Result;

/// One row of a marketplace search results page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub title: String,
    pub price: f64,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Detail page data of one listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_cost: Option<f64>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller_reputation: Option<String>,
}

/// An isolated browsing context owned by one item.
///
/// Any call may fail with [`TenderScoutError::Blocked`](tenderscout_shared::TenderScoutError::Blocked),
/// which aborts the owning item.
#[async_trait]
pub trait MarketplaceContext: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ListingSummary>>;

    /// Detail page of `link`, with shipping quoted to `destination` when given.
    async fn fetch_details(&self, link: &str, destination: Option<&str>) -> Result<ListingDetails>;

    async fn close(&self) -> Result<()>;
}

/// Job-wide marketplace resource shared by every worker.
#[async_trait]
pub trait MarketplaceSession: Send + Sync {
    async fn open_context(&self) -> Result<Box<dyn MarketplaceContext>>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
