//! Core pipeline orchestration and domain logic for TenderScout.
//!
//! This crate drives one tender item through extraction, model discovery,
//! manufacturer validation, marketplace search, enrichment, and judging,
//! and runs batches of items with bounded concurrency.

pub mod agent;
pub mod assessor;
pub mod cache;
pub mod context;
pub mod enrichment;
pub mod extractor;
pub mod jobs;
pub mod judge;
pub mod parse;
pub mod pipeline;
pub mod report;
pub mod scout;
pub mod searcher;
pub mod state;
pub mod text;
pub mod tracer;
pub mod validator;

#[cfg(test)]
mod testing;

pub use cache::{CachedIdentity, IdentityCache, MemoryIdentityCache, StorageIdentityCache, ttl_days};
pub use jobs::{ItemResult, JobProgress, JobRunner, SilentProgress};
pub use pipeline::Pipeline;
pub use report::render_markdown;
pub use state::Stage;
pub use tracer::{LogTracer, NoopTracer, PipelineTracer, RecordingTracer, TeeTracer, TraceEvent};
