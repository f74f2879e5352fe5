//! Task-tagged structured calls to a completion provider.

use serde::de::DeserializeOwned;
use tracing::debug;

use tenderscout_providers::{Completion, CompletionProvider, CompletionRequest};
use tenderscout_shared::Result;

use crate::parse::parse_structured;
use crate::tracer::PipelineTracer;

/// Kinds of AI calls the pipeline makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTask {
    SpecExtraction,
    EntityDiscovery,
    SpecValidation,
    KitDetection,
    KnowledgeLookup,
    CandidateMatch,
}

impl AgentTask {
    /// Tag used in traces and request metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpecExtraction => "spec_extraction",
            Self::EntityDiscovery => "entity_discovery",
            Self::SpecValidation => "spec_validation",
            Self::KitDetection => "kit_detection",
            Self::KnowledgeLookup => "knowledge_lookup",
            Self::CandidateMatch => "candidate_match",
        }
    }
}

/// Send one prompt and parse the structured answer into `T`.
///
/// The exchange is traced whether or not it succeeds. Provider failures and
/// unparseable output are returned as errors for the caller's fallback.
pub async fn ask<T: DeserializeOwned>(
    provider: &dyn CompletionProvider,
    tracer: &dyn PipelineTracer,
    task: AgentTask,
    system: &str,
    user: String,
    max_tokens: u32,
) -> Result<(T, Completion)> {
    let request = CompletionRequest::new(task.as_str(), system, user).max_tokens(max_tokens);
    let prompt = request.user_text();

    let completion = match provider.complete(&request).await {
        Ok(c) => c,
        Err(e) => {
            tracer.ai_exchange(task.as_str(), None, &prompt, &format!("error: {e}"));
            return Err(e);
        }
    };
    tracer.ai_exchange(
        task.as_str(),
        Some(&completion.provider),
        &prompt,
        &completion.text,
    );

    let value = parse_structured::<T>(&completion.text).inspect_err(|e| {
        debug!(task = task.as_str(), provider = %completion.provider, error = %e, "unparseable model output");
    })?;
    Ok((value, completion))
}
