//! Core domain types for the procurement pipeline.
//!
//! Listings move through three records, each adding fields to the previous
//! one: [`RawListing`] (Searcher) → [`EnrichedListing`] (Enrichment) →
//! [`JudgedCandidate`] (Judge).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Critical specs at or above this weight must be proven before a listing
/// can skip enrichment.
pub const HIGH_WEIGHT: f64 = 0.8;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// One line of a tender: what to buy and the ceiling unit price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderItem {
    pub id: String,
    pub description: String,
    /// Maximum unit price accepted by the tender.
    pub max_price: f64,
    /// Units requested. Informs extraction and the report's total.
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Spec extraction
// ---------------------------------------------------------------------------

/// A distinguishing requirement extracted from the description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSpec {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl KillSpec {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            weight: None,
        }
    }

    pub fn weighted(text: impl Into<String>, weight: f64) -> Self {
        Self {
            text: text.into(),
            weight: Some(weight.clamp(0.0, 1.0)),
        }
    }

    /// Whether the spec carries a high weight.
    pub fn is_critical(&self) -> bool {
        self.weight.is_some_and(|w| w >= HIGH_WEIGHT)
    }
}

/// How much investigation an item deserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Complexity {
    /// Commodity item: skip Scout/Validator and search generically.
    Low,
    High,
}

/// Output of the Spec Extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecExtraction {
    pub kill_specs: Vec<KillSpec>,
    #[serde(default)]
    pub critical_specs: Vec<KillSpec>,
    pub marketplace_term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_anchor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price_estimate: Option<f64>,
    pub complexity: Complexity,
    /// Provider that served the extraction, or `"fallback"`.
    pub source: String,
}

impl SpecExtraction {
    /// Kill-spec texts in order.
    pub fn spec_texts(&self) -> Vec<String> {
        self.kill_specs.iter().map(|s| s.text.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// A manufacturer/model candidate found by the Scout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredIdentity {
    pub name: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub matched_specs: Vec<String>,
    #[serde(default)]
    pub missing_specs: Vec<String>,
    /// In `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub source_url: String,
    /// Page text the identity was discovered on, reused by the Validator.
    #[serde(skip)]
    pub evidence: Option<String>,
}

impl DiscoveredIdentity {
    /// `"<manufacturer> <name>"`, or just the name when the manufacturer is
    /// unknown or already part of it.
    pub fn display_name(&self) -> String {
        let manufacturer = self.manufacturer.trim();
        if manufacturer.is_empty()
            || self
                .name
                .to_lowercase()
                .contains(&manufacturer.to_lowercase())
        {
            self.name.trim().to_string()
        } else {
            format!("{manufacturer} {}", self.name.trim())
        }
    }
}

/// Verdict for one kill-spec against manufacturer-side evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    Confirmed,
    Mismatch,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecEvidence {
    pub spec: String,
    pub status: SpecStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

/// An accessory that must be bought separately to meet the requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitComponent {
    pub item: String,
    pub search_query: String,
}

/// An identity confirmed against independent evidence, or the generic
/// fallback when nothing could be confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldIdentity {
    #[serde(flatten)]
    pub identity: DiscoveredIdentity,
    #[serde(default)]
    pub validated_specs: Vec<SpecEvidence>,
    #[serde(default)]
    pub search_queries: Vec<String>,
    #[serde(default)]
    pub kit_components: Vec<KitComponent>,
    pub is_generic: bool,
}

impl GoldIdentity {
    /// Fallback identity equal to the raw marketplace search term.
    pub fn generic(term: &str) -> Self {
        Self {
            identity: DiscoveredIdentity {
                name: term.to_string(),
                manufacturer: String::new(),
                matched_specs: Vec::new(),
                missing_specs: Vec::new(),
                confidence: 0.0,
                source_url: String::new(),
                evidence: None,
            },
            validated_specs: Vec::new(),
            search_queries: vec![term.to_string()],
            kit_components: Vec::new(),
            is_generic: true,
        }
    }

    /// Promote a discovered identity after validation.
    pub fn validated(
        identity: DiscoveredIdentity,
        validated_specs: Vec<SpecEvidence>,
        kit_components: Vec<KitComponent>,
    ) -> Self {
        let mut search_queries = vec![identity.display_name()];
        let bare = identity.name.trim().to_string();
        if !search_queries.contains(&bare) {
            search_queries.push(bare);
        }
        Self {
            identity,
            validated_specs,
            search_queries,
            kit_components,
            is_generic: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

/// Why a listing's price looks implausible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceAnomaly {
    NonPositive,
    FarBelowPeers,
    FarAboveBudget,
}

/// A marketplace listing as collected by the Searcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub title: String,
    pub price: f64,
    #[serde(default)]
    pub shipping_cost: f64,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller_reputation: Option<String>,
    /// Search strategy that produced the listing.
    pub source_strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_anomaly: Option<PriceAnomaly>,
}

impl RawListing {
    pub fn total_price(&self) -> f64 {
        self.price + self.shipping_cost
    }

    /// Title, attributes, and description joined for text matching.
    pub fn full_text(&self) -> String {
        let mut text = self.title.clone();
        for (key, value) in &self.attributes {
            text.push('\n');
            text.push_str(key);
            text.push_str(": ");
            text.push_str(value);
        }
        if !self.description.is_empty() {
            text.push('\n');
            text.push_str(&self.description);
        }
        text
    }
}

/// Answer of the knowledge source for one property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Truth {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecAnswer {
    pub spec: String,
    pub value: Truth,
}

/// Evidence gathered from the external knowledge source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentEvidence {
    pub answers: Vec<SpecAnswer>,
    pub confidence: f64,
    #[serde(default)]
    pub source: String,
    pub provider: String,
}

/// A listing after the enrichment pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedListing {
    #[serde(flatten)]
    pub listing: RawListing,
    /// Share of kill-specs provable from the listing's own text.
    pub spec_coverage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<EnrichmentEvidence>,
}

impl EnrichedListing {
    /// Wrap a listing that was not enriched.
    pub fn plain(listing: RawListing, spec_coverage: f64) -> Self {
        Self {
            listing,
            spec_coverage,
            enrichment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchStatus {
    Approved,
    Rejected,
    Uncertain,
}

/// The Judge's decision for one listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: MatchStatus,
    /// In `[0, 10]`.
    pub risk_score: u8,
    pub reasoning: String,
}

impl Verdict {
    pub fn new(status: MatchStatus, risk_score: u8, reasoning: impl Into<String>) -> Self {
        Self {
            status,
            risk_score: risk_score.min(10),
            reasoning: reasoning.into(),
        }
    }
}

/// A listing with its final verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgedCandidate {
    #[serde(flatten)]
    pub listing: EnrichedListing,
    /// Always `price + shipping_cost`.
    pub total_price: f64,
    pub risk_score: u8,
    pub match_status: MatchStatus,
    pub reasoning: String,
}

impl JudgedCandidate {
    pub fn new(listing: EnrichedListing, verdict: Verdict) -> Self {
        let total_price = listing.listing.total_price();
        Self {
            listing,
            total_price,
            risk_score: verdict.risk_score,
            match_status: verdict.status,
            reasoning: verdict.reasoning,
        }
    }

    pub fn raw(&self) -> &RawListing {
        &self.listing.listing
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// The winning listing as narrated in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerSummary {
    pub index: usize,
    pub title: String,
    pub link: String,
    pub total_price: f64,
    pub risk_score: u8,
    pub status: MatchStatus,
    pub reasoning: String,
    /// `false` for a best-effort pick among unqualified candidates.
    pub endorsed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitLine {
    pub item: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitSummary {
    pub components: Vec<KitLine>,
    /// Winner total plus every priced component.
    pub total_kit_price: f64,
}

/// Audit snapshot of the decision chain, written once at completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefenseReport {
    pub item_id: String,
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_source: Option<String>,
    pub identity_generic: bool,
    pub kill_specs: Vec<String>,
    #[serde(default)]
    pub validated_specs: Vec<SpecEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<WinnerSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kit: Option<KitSummary>,
    pub methodology: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Result handed back to the job system for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub item_id: String,
    pub winner_index: Option<usize>,
    pub candidates: Vec<JudgedCandidate>,
    pub gold_identity: Option<GoldIdentity>,
    pub defense_report: DefenseReport,
    /// The identity came from the cache.
    pub cache_hit: bool,
    /// Stage transitions taken by the state machine.
    pub transitions: u32,
}

impl PipelineOutcome {
    pub fn winner(&self) -> Option<&JudgedCandidate> {
        self.winner_index.and_then(|i| self.candidates.get(i))
    }
}
