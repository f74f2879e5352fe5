//! Pipeline state record and bounded loop counters.

use std::fmt;

use serde::{Deserialize, Serialize};

use tenderscout_shared::{
    DiscoveredIdentity, EnrichedListing, GoldIdentity, JudgedCandidate, KitLine, PipelineLimits,
    RawListing, SpecExtraction,
};

/// Stage tag of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Scout,
    Validate,
    Search,
    Assess,
    Enrich,
    Judge,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Scout => "scout",
            Self::Validate => "validate",
            Self::Search => "search",
            Self::Assess => "assess",
            Self::Enrich => "enrich",
            Self::Judge => "judge",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monotonically increasing counter with a fixed ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopCounter {
    value: u8,
    max: u8,
}

impl LoopCounter {
    pub fn new(max: u8) -> Self {
        Self { value: 0, max }
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn can_advance(&self) -> bool {
        self.value < self.max
    }

    /// Increment unless the ceiling is reached. Returns whether it moved.
    pub fn try_advance(&mut self) -> bool {
        if self.can_advance() {
            self.value += 1;
            true
        } else {
            false
        }
    }
}

/// The winner chosen by the Judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinnerPick {
    pub index: usize,
    /// `false` for a best-effort pick among unqualified candidates.
    pub endorsed: bool,
}

/// Everything one item's run accumulates. Owned by a single run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub stage: Stage,
    pub relaxation: LoopCounter,
    pub validation_retries: LoopCounter,
    pub elastic_retries: LoopCounter,
    /// Extraction as first produced, before any relaxation.
    pub base_extraction: Option<SpecExtraction>,
    /// Extraction at the current relaxation level.
    pub extraction: Option<SpecExtraction>,
    pub identities: Vec<DiscoveredIdentity>,
    pub gold: Option<GoldIdentity>,
    /// Marketplace queries already issued.
    pub tried_queries: Vec<String>,
    /// Queries queued by the Assessor for the next search pass.
    pub pending_queries: Vec<String>,
    pub listings: Vec<RawListing>,
    pub kit_lines: Vec<KitLine>,
    pub kit_searched: bool,
    pub enriched: Vec<EnrichedListing>,
    pub candidates: Vec<JudgedCandidate>,
    pub winner: Option<WinnerPick>,
    pub cache_hit: bool,
    pub transitions: u32,
    /// Narrative lines collected for the defense report.
    pub methodology: Vec<String>,
}

impl PipelineState {
    pub fn new(limits: &PipelineLimits) -> Self {
        Self {
            stage: Stage::Extract,
            relaxation: LoopCounter::new(limits.max_relaxation),
            validation_retries: LoopCounter::new(limits.max_validation_retries),
            elastic_retries: LoopCounter::new(limits.max_elastic_retries),
            base_extraction: None,
            extraction: None,
            identities: Vec::new(),
            gold: None,
            tried_queries: Vec::new(),
            pending_queries: Vec::new(),
            listings: Vec::new(),
            kit_lines: Vec::new(),
            kit_searched: false,
            enriched: Vec::new(),
            candidates: Vec::new(),
            winner: None,
            cache_hit: false,
            transitions: 0,
            methodology: Vec::new(),
        }
    }

    pub fn note(&mut self, line: impl Into<String>) {
        self.methodology.push(line.into());
    }
}

/// Upper bound on stage transitions for one run.
///
/// Each relaxation or validation retry replays at most Extract → Scout →
/// Validate → Extract; each elastic retry replays Search → Assess → Search;
/// the forward path is at most eight transitions.
pub fn transition_budget(limits: &PipelineLimits) -> u32 {
    let backward_scout = u32::from(limits.max_relaxation) + u32::from(limits.max_validation_retries);
    let elastic = u32::from(limits.max_elastic_retries);
    8 + 3 * (backward_scout + 1) + 2 * (elastic + 1)
}
