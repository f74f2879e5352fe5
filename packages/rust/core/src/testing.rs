//! In-crate doubles for every collaborator.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use tenderscout_providers::{
    Completion, CompletionProvider, CompletionRequest, ContentFetcher, ListingDetails,
    ListingSummary, MarketplaceContext, MarketplaceSession, SearchHit, WebSearch,
};
use tenderscout_shared::{PipelineLimits, Result, TenderScoutError};

use crate::context::StageContext;
use crate::text::fold;
use crate::tracer::RecordingTracer;

type Responder = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

enum Script {
    /// Replies in order; the last one repeats.
    Fixed(VecDeque<String>),
    /// Computed from the user prompt; `None` fails the call.
    Dynamic(Responder),
}

/// Completion provider answering from per-task scripts. Tasks without a
/// script fail with a provider error.
#[derive(Default)]
pub struct ScriptedCompletion {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, task: &str, text: &str) -> Self {
        {
            let mut scripts = self.scripts.lock().unwrap();
            let entry = scripts
                .entry(task.to_string())
                .or_insert_with(|| Script::Fixed(VecDeque::new()));
            if let Script::Dynamic(_) = entry {
                *entry = Script::Fixed(VecDeque::new());
            }
            if let Script::Fixed(queue) = entry {
                queue.push_back(text.to_string());
            }
        }
        self
    }

    pub fn respond(
        self,
        task: &str,
        responder: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task.to_string(), Script::Dynamic(Box::new(responder)));
        self
    }

    pub fn calls(&self, task: &str) -> usize {
        self.calls.lock().unwrap().get(task).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(request.task.clone())
            .or_default() += 1;

        let mut scripts = self.scripts.lock().unwrap();
        let text = match scripts.get_mut(&request.task) {
            Some(Script::Fixed(queue)) if queue.len() > 1 => queue.pop_front(),
            Some(Script::Fixed(queue)) => queue.front().cloned(),
            Some(Script::Dynamic(f)) => f(&request.user_text()),
            None => None,
        };
        text.map(|text| Completion {
            text,
            provider: "scripted".into(),
            model: "test".into(),
        })
        .ok_or_else(|| TenderScoutError::provider("scripted", format!("no script for {}", request.task)))
    }
}

/// Web search returning canned hits for queries containing a needle.
#[derive(Default)]
pub struct StaticSearch {
    rules: Vec<(String, Vec<SearchHit>)>,
    queries: Mutex<Vec<String>>,
}

impl StaticSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, needle: &str, hits: Vec<SearchHit>) -> Self {
        self.rules.push((fold(needle), hits));
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

pub fn hit(title: &str, link: &str, snippet: &str) -> SearchHit {
    SearchHit {
        title: title.into(),
        link: link.into(),
        snippet: snippet.into(),
    }
}

#[async_trait]
impl WebSearch for StaticSearch {
    fn name(&self) -> &str {
        "static"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.queries.lock().unwrap().push(query.to_string());
        let folded = fold(query);
        Ok(self
            .rules
            .iter()
            .find(|(needle, _)| folded.contains(needle.as_str()))
            .map(|(_, hits)| hits.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

/// Content fetcher serving fixed pages by URL.
#[derive(Default)]
pub struct StaticFetch {
    pages: HashMap<String, String>,
    fetched: Mutex<Vec<String>>,
}

impl StaticFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, text: &str) -> Self {
        self.pages.insert(url.to_string(), text.to_string());
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentFetcher for StaticFetch {
    async fn fetch_readable(&self, url: &str) -> Result<Option<String>> {
        self.fetched.lock().unwrap().push(url.to_string());
        Ok(self.pages.get(url).cloned())
    }
}

pub fn summary(title: &str, price: f64, link: &str) -> ListingSummary {
    ListingSummary {
        title: title.into(),
        price,
        link: link.into(),
        shipping_cost: None,
        condition: Some("new".into()),
    }
}

#[derive(Default)]
struct MarketState {
    rules: Vec<(String, Vec<ListingSummary>)>,
    details: HashMap<String, ListingDetails>,
    blocked: bool,
    queries: Mutex<Vec<String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Marketplace session whose contexts serve canned listings.
#[derive(Clone, Default)]
pub struct StaticMarketplace {
    state: Arc<MarketState>,
}

impl StaticMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_mut(&mut self) -> &mut MarketState {
        Arc::get_mut(&mut self.state).expect("configure before sharing")
    }

    pub fn on(mut self, needle: &str, listings: Vec<ListingSummary>) -> Self {
        self.state_mut().rules.push((fold(needle), listings));
        self
    }

    pub fn details(mut self, link: &str, details: ListingDetails) -> Self {
        self.state_mut().details.insert(link.to_string(), details);
        self
    }

    pub fn blocked(mut self) -> Self {
        self.state_mut().blocked = true;
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.queries.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> StaticContext {
        StaticContext {
            state: Arc::clone(&self.state),
        }
    }
}

pub struct StaticContext {
    state: Arc<MarketState>,
}

#[async_trait]
impl MarketplaceContext for StaticContext {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ListingSummary>> {
        self.state.queries.lock().unwrap().push(query.to_string());
        if self.state.blocked {
            return Err(TenderScoutError::Blocked("captcha".into()));
        }
        let folded = fold(query);
        Ok(self
            .state
            .rules
            .iter()
            .find(|(needle, _)| folded.contains(needle.as_str()))
            .map(|(_, listings)| listings.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_details(&self, link: &str, _destination: Option<&str>) -> Result<ListingDetails> {
        Ok(self.state.details.get(link).cloned().unwrap_or_default())
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MarketplaceSession for StaticMarketplace {
    async fn open_context(&self) -> Result<Box<dyn MarketplaceContext>> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.context()))
    }
}

/// Owned doubles plus the limits, lending a [`StageContext`].
pub struct Fixture {
    pub completion: ScriptedCompletion,
    pub knowledge: ScriptedCompletion,
    pub search: StaticSearch,
    pub fetch: StaticFetch,
    pub market: StaticMarketplace,
    pub tracer: RecordingTracer,
    pub limits: PipelineLimits,
    market_ctx: StaticContext,
}

impl Default for Fixture {
    fn default() -> Self {
        let market = StaticMarketplace::new();
        let market_ctx = market.context();
        Self {
            completion: ScriptedCompletion::new(),
            knowledge: ScriptedCompletion::new(),
            search: StaticSearch::new(),
            fetch: StaticFetch::new(),
            market,
            tracer: RecordingTracer::new(),
            limits: PipelineLimits::default(),
            market_ctx,
        }
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completion(mut self, completion: ScriptedCompletion) -> Self {
        self.completion = completion;
        self
    }

    pub fn knowledge(mut self, knowledge: ScriptedCompletion) -> Self {
        self.knowledge = knowledge;
        self
    }

    pub fn search(mut self, search: StaticSearch) -> Self {
        self.search = search;
        self
    }

    pub fn fetch(mut self, fetch: StaticFetch) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn market(mut self, market: StaticMarketplace) -> Self {
        self.market_ctx = market.context();
        self.market = market;
        self
    }

    pub fn ctx(&self) -> StageContext<'_> {
        StageContext {
            completion: &self.completion,
            knowledge: &self.knowledge,
            search: &self.search,
            fetcher: &self.fetch,
            market: &self.market_ctx,
            tracer: &self.tracer,
            limits: &self.limits,
            destination: None,
        }
    }
}
