//! Audit tracing of pipeline runs.
//!
//! A [`PipelineTracer`] observes stage transitions, AI exchanges, and the
//! final ranking. Every method defaults to a no-op and returns nothing, so a
//! tracer can never change an outcome.

use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tenderscout_shared::{JudgedCandidate, MatchStatus};

use crate::state::Stage;

/// One ranked candidate as recorded in the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub title: String,
    pub total_price: f64,
    pub risk_score: u8,
    pub status: MatchStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    Stage {
        from: Stage,
        to: Stage,
        reason: String,
    },
    AiExchange {
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        prompt: String,
        response: String,
    },
    Ranking {
        candidates: Vec<RankingEntry>,
        winner_index: Option<usize>,
    },
    Note {
        stage: Stage,
        message: String,
    },
}

impl TraceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stage { .. } => "stage",
            Self::AiExchange { .. } => "ai_exchange",
            Self::Ranking { .. } => "ranking",
            Self::Note { .. } => "note",
        }
    }
}

pub trait PipelineTracer: Send + Sync {
    fn stage(&self, _from: Stage, _to: Stage, _reason: &str) {}

    /// `provider` is `None` when no provider answered.
    fn ai_exchange(&self, _task: &str, _provider: Option<&str>, _prompt: &str, _response: &str) {}

    fn ranking(&self, _candidates: &[JudgedCandidate], _winner_index: Option<usize>) {}

    fn note(&self, _stage: Stage, _message: &str) {}
}

/// Discards everything.
pub struct NoopTracer;

impl PipelineTracer for NoopTracer {}

/// Forwards events to `tracing`.
pub struct LogTracer;

impl PipelineTracer for LogTracer {
    fn stage(&self, from: Stage, to: Stage, reason: &str) {
        info!(%from, %to, reason, "stage transition");
    }

    fn ai_exchange(&self, task: &str, provider: Option<&str>, prompt: &str, response: &str) {
        debug!(
            task,
            provider = provider.unwrap_or("-"),
            prompt_len = prompt.len(),
            response_len = response.len(),
            "ai exchange"
        );
    }

    fn ranking(&self, candidates: &[JudgedCandidate], winner_index: Option<usize>) {
        info!(candidates = candidates.len(), ?winner_index, "final ranking");
    }

    fn note(&self, stage: Stage, message: &str) {
        debug!(%stage, message, "pipeline note");
    }
}

/// Buffers events in memory for later persistence.
#[derive(Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<(i64, TraceEvent)>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: TraceEvent) {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        events.push((Utc::now().timestamp(), event));
    }

    /// Events with their unix timestamps, in emission order.
    pub fn timed_events(&self) -> Vec<(i64, TraceEvent)> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.timed_events().into_iter().map(|(_, e)| e).collect()
    }
}

impl PipelineTracer for RecordingTracer {
    fn stage(&self, from: Stage, to: Stage, reason: &str) {
        self.push(TraceEvent::Stage {
            from,
            to,
            reason: reason.to_string(),
        });
    }

    fn ai_exchange(&self, task: &str, provider: Option<&str>, prompt: &str, response: &str) {
        self.push(TraceEvent::AiExchange {
            task: task.to_string(),
            provider: provider.map(str::to_string),
            prompt: prompt.to_string(),
            response: response.to_string(),
        });
    }

    fn ranking(&self, candidates: &[JudgedCandidate], winner_index: Option<usize>) {
        self.push(TraceEvent::Ranking {
            candidates: candidates
                .iter()
                .map(|c| RankingEntry {
                    title: c.raw().title.clone(),
                    total_price: c.total_price,
                    risk_score: c.risk_score,
                    status: c.match_status,
                })
                .collect(),
            winner_index,
        });
    }

    fn note(&self, stage: Stage, message: &str) {
        self.push(TraceEvent::Note {
            stage,
            message: message.to_string(),
        });
    }
}

/// Fans events out to two tracers.
pub struct TeeTracer<'a> {
    pub first: &'a dyn PipelineTracer,
    pub second: &'a dyn PipelineTracer,
}

impl PipelineTracer for TeeTracer<'_> {
    fn stage(&self, from: Stage, to: Stage, reason: &str) {
        self.first.stage(from, to, reason);
        self.second.stage(from, to, reason);
    }

    fn ai_exchange(&self, task: &str, provider: Option<&str>, prompt: &str, response: &str) {
        self.first.ai_exchange(task, provider, prompt, response);
        self.second.ai_exchange(task, provider, prompt, response);
    }

    fn ranking(&self, candidates: &[JudgedCandidate], winner_index: Option<usize>) {
        self.first.ranking(candidates, winner_index);
        self.second.ranking(candidates, winner_index);
    }

    fn note(&self, stage: Stage, message: &str) {
        self.first.note(stage, message);
        self.second.note(stage, message);
    }
}
