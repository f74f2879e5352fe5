//! Sufficiency Assessor: decide whether the listings justify moving on.

use tracing::debug;

use tenderscout_shared::{PipelineLimits, RawListing, SpecExtraction};

use crate::state::LoopCounter;
use crate::text::{first_words, same_text, word_count};

const MIN_TEXT_WORDS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum Assessment {
    Sufficient,
    /// Search again with these never-tried queries.
    Retry(Vec<String>),
    /// Not sufficient, but no retry is possible; move on anyway.
    Exhausted,
}

/// Listing with real text, a plausible price and no anomaly flag.
pub fn is_promising(listing: &RawListing, budget: f64, limits: &PipelineLimits) -> bool {
    let low = limits.promising_min_ratio * budget;
    let high = limits.promising_max_ratio * budget;
    word_count(&listing.full_text()) >= MIN_TEXT_WORDS
        && listing.price >= low
        && listing.price <= high
        && listing.price_anomaly.is_none()
}

pub fn assess(
    listings: &[RawListing],
    budget: f64,
    extraction: &SpecExtraction,
    tried: &[String],
    elastic: &LoopCounter,
    limits: &PipelineLimits,
) -> Assessment {
    let promising = listings
        .iter()
        .filter(|l| is_promising(l, budget, limits))
        .count();
    debug!(promising, total = listings.len(), "listings assessed");

    if promising >= limits.min_promising {
        return Assessment::Sufficient;
    }
    if !elastic.can_advance() {
        return Assessment::Exhausted;
    }

    let queries = alternative_queries(extraction, tried, limits.elastic_queries);
    if queries.is_empty() {
        Assessment::Exhausted
    } else {
        Assessment::Retry(queries)
    }
}

/// Never-tried queries: the anchor, the term head with each kill-spec, then
/// the shortened term.
pub fn alternative_queries(extraction: &SpecExtraction, tried: &[String], max: usize) -> Vec<String> {
    let term = extraction.marketplace_term.trim();
    let head = first_words(term, 2);

    let mut candidates: Vec<String> = Vec::new();
    if let Some(anchor) = &extraction.search_anchor {
        candidates.push(anchor.clone());
    }
    for spec in extraction.spec_texts() {
        candidates.push(format!("{head} {spec}"));
    }
    if head != term {
        candidates.push(head.clone());
    }

    let mut queries: Vec<String> = Vec::new();
    for q in candidates {
        let q = q.trim().to_string();
        if q.is_empty()
            || tried.iter().any(|t| same_text(t, &q))
            || queries.iter().any(|existing| same_text(existing, &q))
        {
            continue;
        }
        queries.push(q);
        if queries.len() == max {
            break;
        }
    }
    queries
}
