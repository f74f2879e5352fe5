//! Collaborators borrowed by every stage of one item's run.

use tenderscout_providers::{CompletionProvider, ContentFetcher, MarketplaceContext, WebSearch};
use tenderscout_shared::PipelineLimits;

use crate::tracer::PipelineTracer;

#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    /// Extraction, discovery, validation and matching calls.
    pub completion: &'a dyn CompletionProvider,
    /// External knowledge source for enrichment.
    pub knowledge: &'a dyn CompletionProvider,
    pub search: &'a dyn WebSearch,
    pub fetcher: &'a dyn ContentFetcher,
    /// Isolated marketplace context owned by this item.
    pub market: &'a dyn MarketplaceContext,
    pub tracer: &'a dyn PipelineTracer,
    pub limits: &'a PipelineLimits,
    /// Postal code for shipping quotes.
    pub destination: Option<&'a str>,
}
