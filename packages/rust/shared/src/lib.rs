//! Shared types, error model, and configuration for TenderScout.
//!
//! This crate is the foundation depended on by all other TenderScout crates.
//! It provides:
//! - [`TenderScoutError`]: the unified error type
//! - Domain types ([`TenderItem`], [`GoldIdentity`], [`JudgedCandidate`], [`DefenseReport`])
//! - Configuration ([`AppConfig`], [`PipelineLimits`], provider descriptors, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, Credential, DefaultsConfig, FetchConfig, PipelineLimits, ProviderApi,
    ProviderDescriptor, ProviderEntry, ProviderSet, ScraperConfig, SearchConfig, config_dir,
    config_file_path, expand_home, init_config, load_config, load_config_from,
    validate_api_keys,
};
pub use error::{Result, TenderScoutError};
pub use types::{
    Complexity, DefenseReport, DiscoveredIdentity, EnrichedListing, EnrichmentEvidence,
    GoldIdentity, HIGH_WEIGHT, JudgedCandidate, KillSpec, KitComponent,
    KitLine, KitSummary, MatchStatus, PipelineOutcome, PriceAnomaly, RawListing, SpecAnswer,
    SpecEvidence, SpecExtraction, SpecStatus, TenderItem, Truth, Verdict, WinnerSummary,
};
