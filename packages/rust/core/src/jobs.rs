//! Job runner: processes a batch of tender items with bounded concurrency.
//!
//! Each item gets its own marketplace context, opened before the pipeline
//! starts and closed after it ends, whatever the outcome. Results come back
//! in input order.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use tenderscout_providers::MarketplaceSession;
use tenderscout_shared::{PipelineOutcome, Result, TenderItem, TenderScoutError};
use tenderscout_storage::{Storage, TraceRow};

use crate::pipeline::Pipeline;
use crate::tracer::{LogTracer, RecordingTracer, TeeTracer};

/// Observer for batch progress.
pub trait JobProgress: Send + Sync {
    fn item_started(&self, item: &TenderItem);
    fn item_finished(&self, result: &ItemResult, done: usize, total: usize);
}

/// No-op progress for headless/test usage.
pub struct SilentProgress;

impl JobProgress for SilentProgress {
    fn item_started(&self, _item: &TenderItem) {}
    fn item_finished(&self, _result: &ItemResult, _done: usize, _total: usize) {}
}

/// Result of one item. A failed item never fails the batch.
#[derive(Debug)]
pub struct ItemResult {
    pub item_id: String,
    pub run_id: String,
    pub outcome: Result<PipelineOutcome>,
}

impl ItemResult {
    pub fn status(&self) -> &'static str {
        match &self.outcome {
            Ok(o) if o.winner_index.is_some() => "completed",
            Ok(_) => "no_winner",
            Err(TenderScoutError::Cancelled) => "cancelled",
            Err(e) if e.is_fatal() => "blocked",
            Err(_) => "failed",
        }
    }
}

pub struct JobRunner {
    pipeline: Arc<Pipeline>,
    market: Arc<dyn MarketplaceSession>,
    storage: Option<Arc<Storage>>,
    concurrency: usize,
}

impl JobRunner {
    pub fn new(pipeline: Arc<Pipeline>, market: Arc<dyn MarketplaceSession>, concurrency: usize) -> Self {
        Self {
            pipeline,
            market,
            storage: None,
            concurrency: concurrency.max(1),
        }
    }

    /// Persist run history and traces to `storage`.
    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Process `items`; at most `concurrency` run at once. Items not yet
    /// started when `cancel` fires finish with [`TenderScoutError::Cancelled`].
    #[instrument(skip_all, fields(items = items.len(), concurrency = self.concurrency))]
    pub async fn run(
        &self,
        items: Vec<TenderItem>,
        cancel: CancellationToken,
        progress: &dyn JobProgress,
    ) -> Vec<ItemResult> {
        let total = items.len();
        let mut done = 0usize;

        let mut indexed: Vec<(usize, ItemResult)> = futures::stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let cancel = cancel.clone();
                async move { (index, self.run_item(item, &cancel, progress).await) }
            })
            .buffer_unordered(self.concurrency)
            .inspect(|(_, result)| {
                done += 1;
                progress.item_finished(result, done, total);
            })
            .collect()
            .await;

        indexed.sort_by_key(|(index, _)| *index);
        let results: Vec<ItemResult> = indexed.into_iter().map(|(_, r)| r).collect();
        let failed = results.iter().filter(|r| r.outcome.is_err()).count();
        info!(total, failed, "job finished");
        results
    }

    async fn run_item(
        &self,
        item: TenderItem,
        cancel: &CancellationToken,
        progress: &dyn JobProgress,
    ) -> ItemResult {
        let run_id = Uuid::now_v7().to_string();
        if cancel.is_cancelled() {
            return ItemResult {
                item_id: item.id,
                run_id,
                outcome: Err(TenderScoutError::Cancelled),
            };
        }
        progress.item_started(&item);

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.insert_run(&run_id, &item.id, &item.description).await {
                warn!(item_id = %item.id, error = %e, "could not record run start");
            }
        }

        let recorder = RecordingTracer::new();
        let outcome = self.run_in_context(&item, &recorder).await;
        if let Err(e) = &outcome {
            warn!(item_id = %item.id, error = %e, "item failed");
        }

        let result = ItemResult {
            item_id: item.id,
            run_id,
            outcome,
        };
        self.persist(&result, &recorder).await;
        result
    }

    async fn run_in_context(&self, item: &TenderItem, recorder: &RecordingTracer) -> Result<PipelineOutcome> {
        let context = self.market.open_context().await?;
        let tracer = TeeTracer {
            first: &LogTracer,
            second: recorder,
        };
        let outcome = self.pipeline.run(item, context.as_ref(), &tracer).await;
        if let Err(e) = context.close().await {
            warn!(item_id = %item.id, error = %e, "failed to close marketplace context");
        }
        outcome
    }

    /// Store the run's final state and trace. Failures are logged only.
    async fn persist(&self, result: &ItemResult, recorder: &RecordingTracer) {
        let Some(storage) = &self.storage else { return };

        let rows: Vec<TraceRow> = recorder
            .timed_events()
            .into_iter()
            .enumerate()
            .filter_map(|(seq, (at, event))| {
                let payload_json = serde_json::to_string(&event).ok()?;
                Some(TraceRow {
                    seq: u32::try_from(seq).ok()?,
                    kind: event.kind().to_string(),
                    payload_json,
                    at,
                })
            })
            .collect();
        if let Err(e) = storage.insert_trace_events(&result.run_id, &rows).await {
            warn!(run_id = %result.run_id, error = %e, "could not store trace");
        }

        let (winner_json, report_json, error) = match &result.outcome {
            Ok(outcome) => (
                outcome.winner().and_then(|w| serde_json::to_string(w).ok()),
                serde_json::to_string(&outcome.defense_report).ok(),
                None,
            ),
            Err(e) => (None, None, Some(e.to_string())),
        };
        if let Err(e) = storage
            .finish_run(
                &result.run_id,
                result.status(),
                winner_json.as_deref(),
                report_json.as_deref(),
                error.as_deref(),
            )
            .await
        {
            warn!(run_id = %result.run_id, error = %e, "could not record run end");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenderscout_shared::PipelineLimits;

    use crate::testing::{ScriptedCompletion, StaticFetch, StaticMarketplace, StaticSearch, summary};

    fn pipeline() -> Arc<Pipeline> {
        let completion = Arc::new(ScriptedCompletion::new());
        Arc::new(Pipeline::new(
            completion.clone(),
            completion,
            Arc::new(StaticSearch::new()),
            Arc::new(StaticFetch::new()),
            PipelineLimits::default(),
        ))
    }

    fn items(n: usize) -> Vec<TenderItem> {
        (0..n)
            .map(|i| TenderItem {
                id: format!("item-{i}"),
                description: format!("Sirene escolar com {} músicas", 10 + i),
                max_price: 400.0,
                quantity: 1,
            })
            .collect()
    }

    #[tokio::test]
    async fn results_keep_input_order_and_contexts_close() {
        let market = Arc::new(StaticMarketplace::new().on(
            "sirene",
            vec![summary("Sirene escolar digital programável", 300.0, "https://m/1")],
        ));
        let runner = JobRunner::new(pipeline(), market.clone(), 2);

        let results = runner.run(items(4), CancellationToken::new(), &SilentProgress).await;

        let ids: Vec<_> = results.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, ["item-0", "item-1", "item-2", "item-3"]);
        assert!(results.iter().all(|r| r.outcome.is_ok()));
        assert_eq!(market.opened(), 4);
        assert_eq!(market.closed(), 4);
    }

    #[tokio::test]
    async fn cancelled_job_skips_pending_items() {
        let market = Arc::new(StaticMarketplace::new());
        let runner = JobRunner::new(pipeline(), market.clone(), 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = runner.run(items(3), cancel, &SilentProgress).await;
        assert!(results.iter().all(|r| matches!(r.outcome, Err(TenderScoutError::Cancelled))));
        assert_eq!(results[0].status(), "cancelled");
        assert_eq!(market.opened(), 0);
    }

    #[tokio::test]
    async fn blocked_item_does_not_fail_batch_and_is_persisted() {
        let path = std::env::temp_dir().join(format!("ts_jobs_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&path).await.unwrap());
        let market = Arc::new(StaticMarketplace::new().blocked());
        let runner = JobRunner::new(pipeline(), market.clone(), 2).with_storage(Arc::clone(&storage));

        let results = runner.run(items(2), CancellationToken::new(), &SilentProgress).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status() == "blocked"));
        assert_eq!(market.closed(), 2);

        let runs = storage.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == "blocked" && r.error.is_some()));
        let trace = storage.list_trace_events(&results[0].run_id).await.unwrap();
        assert!(trace.iter().any(|row| row.kind == "stage"));

        let _ = std::fs::remove_file(&path);
    }
}
