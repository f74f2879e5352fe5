//! The Orchestrator: a single driving loop over the stage machine.
//!
//! Every backward edge (Scout → Extract, Validate → Extract,
//! Assess → Search) is taken only after its loop counter advances, and the
//! total number of transitions is capped by [`transition_budget`].

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use tenderscout_providers::{
    CompletionProvider, ContentFetcher, FallbackSearch, HttpFetcher, MarketplaceContext,
    ProviderChain, WebSearch,
};
use tenderscout_shared::{
    AppConfig, Complexity, GoldIdentity, PipelineLimits, PipelineOutcome, ProviderSet, Result,
    SpecExtraction, TenderItem, TenderScoutError,
};

use crate::assessor::{Assessment, assess};
use crate::cache::{CachedIdentity, IdentityCache};
use crate::context::StageContext;
use crate::enrichment::enrich_listings;
use crate::extractor::{extract_specs, relax_extraction};
use crate::judge::{judge_candidates, select_winner};
use crate::report::build_report;
use crate::scout::{ScoutOutcome, scout};
use crate::searcher::{search_kit, search_marketplace};
use crate::state::{PipelineState, Stage, transition_budget};
use crate::text::description_key;
use crate::tracer::PipelineTracer;
use crate::validator::{Validation, validate_identity};

const COMPLETION_TIMEOUT_SECS: u64 = 60;

/// Pipeline collaborators shared by every item of a job.
pub struct Pipeline {
    completion: Arc<dyn CompletionProvider>,
    knowledge: Arc<dyn CompletionProvider>,
    search: Arc<dyn WebSearch>,
    fetcher: Arc<dyn ContentFetcher>,
    cache: Option<Arc<dyn IdentityCache>>,
    limits: PipelineLimits,
    destination: Option<String>,
}

impl Pipeline {
    pub fn new(
        completion: Arc<dyn CompletionProvider>,
        knowledge: Arc<dyn CompletionProvider>,
        search: Arc<dyn WebSearch>,
        fetcher: Arc<dyn ContentFetcher>,
        limits: PipelineLimits,
    ) -> Self {
        Self {
            completion,
            knowledge,
            search,
            fetcher,
            cache: None,
            limits,
            destination: None,
        }
    }

    /// Build the HTTP collaborators from configuration. `providers`
    /// replaces the configured provider chains when given.
    pub fn from_config(config: &AppConfig, providers: Option<ProviderSet>) -> Result<Self> {
        let providers = providers.unwrap_or_else(|| ProviderSet::from(config));
        let knowledge_descriptors = if providers.knowledge.is_empty() {
            providers.completion.clone()
        } else {
            providers.knowledge
        };

        let completion = ProviderChain::new(providers.completion, COMPLETION_TIMEOUT_SECS)?;
        if !completion.has_available() {
            warn!("no completion provider has a credential; deterministic fallbacks only");
        }
        let knowledge = ProviderChain::new(knowledge_descriptors, COMPLETION_TIMEOUT_SECS)?;

        Ok(Self::new(
            Arc::new(completion),
            Arc::new(knowledge),
            Arc::new(FallbackSearch::from_config(&config.search)?),
            Arc::new(HttpFetcher::new(&config.fetch)?),
            config.limits.clone(),
        )
        .with_destination(config.defaults.destination.clone()))
    }

    pub fn with_cache(mut self, cache: Arc<dyn IdentityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_destination(mut self, destination: Option<String>) -> Self {
        self.destination = destination;
        self
    }

    pub fn limits(&self) -> &PipelineLimits {
        &self.limits
    }

    /// Run the pipeline for one item inside its own marketplace context.
    ///
    /// Only fatal errors (a blocked portal) and invalid input surface;
    /// every other failure is absorbed by a stage fallback.
    #[instrument(skip_all, fields(item_id = %item.id))]
    pub async fn run(
        &self,
        item: &TenderItem,
        market: &dyn MarketplaceContext,
        tracer: &dyn PipelineTracer,
    ) -> Result<PipelineOutcome> {
        if item.description.trim().is_empty() {
            return Err(TenderScoutError::validation("item description is empty"));
        }
        if !(item.max_price.is_finite() && item.max_price > 0.0) {
            return Err(TenderScoutError::validation(format!(
                "item {} has no positive maximum price",
                item.id
            )));
        }

        let ctx = StageContext {
            completion: self.completion.as_ref(),
            knowledge: self.knowledge.as_ref(),
            search: self.search.as_ref(),
            fetcher: self.fetcher.as_ref(),
            market,
            tracer,
            limits: &self.limits,
            destination: self.destination.as_deref(),
        };
        let cache_key = description_key(&item.description);
        let budget = transition_budget(&self.limits);
        let mut state = PipelineState::new(&self.limits);

        if let Some(entry) = self.cached_identity(&cache_key).await {
            info!(identity = %entry.gold.identity.display_name(), "identity cache hit");
            state.base_extraction = Some(entry.extraction.clone());
            state.extraction = Some(entry.extraction);
            state.gold = Some(entry.gold);
            state.cache_hit = true;
            advance(&mut state, Stage::Search, "identity cache hit", tracer, budget)?;
        }

        loop {
            let (next, reason) = match state.stage {
                Stage::Extract => self.on_extract(&ctx, item, &mut state).await,
                Stage::Scout => on_scout(&ctx, &mut state).await,
                Stage::Validate => self.on_validate(&ctx, item, &cache_key, &mut state).await,
                Stage::Search => on_search(&ctx, item, &mut state).await?,
                Stage::Assess => on_assess(&ctx, item, &mut state),
                Stage::Enrich => on_enrich(&ctx, item, &mut state).await,
                Stage::Judge => on_judge(&ctx, item, &mut state).await,
                Stage::Done => break,
            };
            advance(&mut state, next, &reason, tracer, budget)?;
        }

        let defense_report = build_report(item, &state);
        info!(
            winner = ?state.winner.map(|w| w.index),
            candidates = state.candidates.len(),
            transitions = state.transitions,
            "pipeline finished"
        );

        Ok(PipelineOutcome {
            item_id: item.id.clone(),
            winner_index: state.winner.map(|w| w.index),
            candidates: state.candidates,
            gold_identity: state.gold,
            defense_report,
            cache_hit: state.cache_hit,
            transitions: state.transitions,
        })
    }

    async fn cached_identity(&self, key: &str) -> Option<CachedIdentity> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "identity cache read failed, treating as miss");
                None
            }
        }
    }

    async fn on_extract(
        &self,
        ctx: &StageContext<'_>,
        item: &TenderItem,
        state: &mut PipelineState,
    ) -> (Stage, String) {
        let level = state.relaxation.value();
        let extraction = match &state.base_extraction {
            Some(base) => relax_extraction(base, level),
            None => {
                let base = extract_specs(ctx.completion, ctx.tracer, item).await;
                state.base_extraction = Some(base.clone());
                base
            }
        };
        let low = extraction.complexity == Complexity::Low && level == 0;
        let term = extraction.marketplace_term.clone();
        state.extraction = Some(extraction);

        if low {
            state.gold = Some(GoldIdentity::generic(&term));
            state.note(format!(
                "Item de baixa complexidade; investigação de modelo dispensada, busca por \"{term}\"."
            ));
            return (Stage::Search, "low complexity item".into());
        }
        (Stage::Scout, format!("relaxation level {level}"))
    }

    async fn on_validate(
        &self,
        ctx: &StageContext<'_>,
        item: &TenderItem,
        cache_key: &str,
        state: &mut PipelineState,
    ) -> (Stage, String) {
        let extraction = current_extraction(state, item);
        let identities = std::mem::take(&mut state.identities);

        for identity in &identities {
            match validate_identity(ctx, identity, &extraction).await {
                Validation::Validated(gold) => {
                    state.note(format!(
                        "{} confirmada com confiança {:.2} após {} tentativa(s) de validação.",
                        gold.identity.display_name(),
                        identity.confidence,
                        state.validation_retries.value() + 1
                    ));
                    let base = state.base_extraction.as_ref().unwrap_or(&extraction);
                    self.remember(cache_key, item, &gold, base).await;
                    let reason = format!("validated {}", gold.identity.display_name());
                    state.gold = Some(gold);
                    return (Stage::Search, reason);
                }
                Validation::Rejected(reason) => {
                    debug!(identity = %identity.display_name(), %reason, "identity rejected");
                    state.note(format!("{} descartada: {reason}.", identity.display_name()));
                }
            }
        }

        if state.validation_retries.can_advance() && state.relaxation.can_advance() {
            state.validation_retries.try_advance();
            state.relaxation.try_advance();
            return (
                Stage::Extract,
                format!(
                    "no identity validated, retry {} at relaxation {}",
                    state.validation_retries.value(),
                    state.relaxation.value()
                ),
            );
        }
        fall_back_to_generic(state, item);
        (Stage::Search, "no identity validated, generic search".into())
    }

    /// Cache a validated identity. Failures only cost a future cache miss.
    async fn remember(
        &self,
        key: &str,
        item: &TenderItem,
        gold: &GoldIdentity,
        extraction: &SpecExtraction,
    ) {
        let Some(cache) = &self.cache else { return };
        let entry = CachedIdentity {
            gold: gold.clone(),
            extraction: extraction.clone(),
        };
        if let Err(e) = cache.put(key, &item.description, &entry).await {
            warn!(error = %e, "identity cache write failed");
        }
    }
}

/// Move to `to`, enforcing the transition budget.
fn advance(
    state: &mut PipelineState,
    to: Stage,
    reason: &str,
    tracer: &dyn PipelineTracer,
    budget: u32,
) -> Result<()> {
    state.transitions += 1;
    if state.transitions > budget {
        return Err(TenderScoutError::validation(format!(
            "stage transition budget of {budget} exceeded at {}",
            state.stage
        )));
    }
    debug!(from = %state.stage, %to, reason, "transition");
    tracer.stage(state.stage, to, reason);
    state.stage = to;
    Ok(())
}

fn current_extraction(state: &PipelineState, item: &TenderItem) -> SpecExtraction {
    state
        .extraction
        .clone()
        .unwrap_or_else(|| crate::extractor::fallback_extraction(&item.description))
}

fn fall_back_to_generic(state: &mut PipelineState, item: &TenderItem) {
    let term = current_extraction(state, item).marketplace_term;
    state.note(format!(
        "Nenhuma identidade validada após {} nível(is) de relaxamento; busca genérica por \"{term}\".",
        state.relaxation.value()
    ));
    state.gold = Some(GoldIdentity::generic(&term));
}

async fn on_scout(ctx: &StageContext<'_>, state: &mut PipelineState) -> (Stage, String) {
    let Some(extraction) = state.extraction.clone() else {
        return (Stage::Extract, "missing extraction".into());
    };
    let level = state.relaxation.value();

    match scout(ctx, &extraction, level).await {
        ScoutOutcome::Found(identities) => {
            let reason = format!("{} identities found", identities.len());
            state.identities = identities;
            (Stage::Validate, reason)
        }
        ScoutOutcome::Retry if state.relaxation.try_advance() => {
            state.note(format!(
                "Nenhum fabricante encontrado no nível {level}; especificações relaxadas."
            ));
            (
                Stage::Extract,
                format!("no identities, relaxing to level {}", state.relaxation.value()),
            )
        }
        ScoutOutcome::Retry | ScoutOutcome::Exhausted => {
            state.gold = Some(GoldIdentity::generic(&extraction.marketplace_term));
            state.note(format!(
                "Nenhum fabricante encontrado após {} nível(is) de relaxamento; busca genérica por \"{}\".",
                state.relaxation.value(),
                extraction.marketplace_term
            ));
            (Stage::Search, "scout exhausted, generic search".into())
        }
    }
}

async fn on_search(
    ctx: &StageContext<'_>,
    item: &TenderItem,
    state: &mut PipelineState,
) -> Result<(Stage, String)> {
    let extraction = current_extraction(state, item);
    let gold = state
        .gold
        .clone()
        .unwrap_or_else(|| GoldIdentity::generic(&extraction.marketplace_term));

    if !state.kit_searched && !gold.kit_components.is_empty() {
        state.kit_lines = search_kit(ctx, &gold.kit_components, &mut state.tried_queries).await?;
        state.kit_searched = true;
    }

    let pending = std::mem::take(&mut state.pending_queries);
    let added = search_marketplace(
        ctx,
        &gold,
        &extraction,
        &pending,
        item.max_price,
        &mut state.tried_queries,
        &mut state.listings,
    )
    .await?;

    Ok((
        Stage::Assess,
        format!("{added} new listings, {} total", state.listings.len()),
    ))
}

fn on_assess(ctx: &StageContext<'_>, item: &TenderItem, state: &mut PipelineState) -> (Stage, String) {
    let extraction = current_extraction(state, item);
    match assess(
        &state.listings,
        item.max_price,
        &extraction,
        &state.tried_queries,
        &state.elastic_retries,
        ctx.limits,
    ) {
        Assessment::Sufficient => (Stage::Enrich, "enough promising listings".into()),
        Assessment::Retry(queries) if state.elastic_retries.try_advance() => {
            state.note(format!(
                "Poucos anúncios promissores; nova busca com: {}.",
                queries.join("; ")
            ));
            let reason = format!("elastic retry {}", state.elastic_retries.value());
            state.pending_queries = queries;
            (Stage::Search, reason)
        }
        Assessment::Retry(_) | Assessment::Exhausted => {
            (Stage::Enrich, "moving on without enough promising listings".into())
        }
    }
}

async fn on_enrich(ctx: &StageContext<'_>, item: &TenderItem, state: &mut PipelineState) -> (Stage, String) {
    let extraction = current_extraction(state, item);
    state.enriched = enrich_listings(ctx, &state.listings, &extraction, item.max_price).await;
    let with_evidence = state
        .enriched
        .iter()
        .filter(|l| l.enrichment.is_some())
        .count();
    (Stage::Judge, format!("{with_evidence} listings enriched"))
}

async fn on_judge(ctx: &StageContext<'_>, item: &TenderItem, state: &mut PipelineState) -> (Stage, String) {
    let extraction = current_extraction(state, item);
    let gold = state
        .gold
        .clone()
        .unwrap_or_else(|| GoldIdentity::generic(&extraction.marketplace_term));
    let enriched = std::mem::take(&mut state.enriched);

    state.candidates = judge_candidates(ctx, enriched, &gold, &extraction, item.max_price).await;
    state.winner = select_winner(&state.candidates);
    ctx.tracer
        .ranking(&state.candidates, state.winner.map(|w| w.index));

    let reason = match state.winner {
        Some(w) if w.endorsed => format!("winner {}", w.index),
        Some(w) => format!("best-effort pick {}", w.index),
        None => "no candidates".to_string(),
    };
    (Stage::Done, reason)
}
