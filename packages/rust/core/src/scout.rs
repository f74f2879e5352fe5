//! Scout: open-web search for manufacturer/model identities.

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use tenderscout_providers::SearchHit;
use tenderscout_shared::{DiscoveredIdentity, SpecExtraction};

use crate::agent::{AgentTask, ask};
use crate::context::StageContext;
use crate::state::Stage;
use crate::text::{fold, overlap_ratio, same_text, strip_query_operators, truncate_chars};

const HITS_PER_QUERY: usize = 10;
const PAGE_CHARS: usize = 6_000;

/// Hosts of marketplaces and social networks; never a manufacturer source.
const EXCLUDED_HOSTS: &[&str] = &[
    "mercadolivre", "mercadolibre", "amazon", "shopee", "magazineluiza", "magalu",
    "americanas", "aliexpress", "olx", "casasbahia", "kabum", "submarino", "shein",
    "facebook", "instagram", "youtube", "twitter", "x.com", "tiktok", "linkedin", "pinterest",
    "reddit",
];

const DATASHEET_SIGNALS: &[&str] = &[
    "ficha tecnica", "datasheet", "especificac", "manual", "catalogo", ".pdf",
];

const MAKER_SIGNALS: &[&str] = &["fabricante", "oficial", "industria", "produtos"];

const DISCOVERY_SYSTEM: &str = "\
Você identifica produtos em páginas web. Diga se a página identifica um \
fabricante e modelo específicos que atendem às especificações pedidas. \
Responda somente com JSON:
{\"found\": true, \"name\": \"modelo\", \"manufacturer\": \"fabricante\", \
\"matched_specs\": [\"...\"], \"missing_specs\": [\"...\"], \"confidence\": 0.0}";

#[derive(Debug, Clone, PartialEq)]
pub enum ScoutOutcome {
    /// Identities sorted by confidence, highest first.
    Found(Vec<DiscoveredIdentity>),
    /// Nothing usable; a looser relaxation level may help.
    Retry,
    /// Nothing usable at the last relaxation level.
    Exhausted,
}

#[derive(Debug, Deserialize)]
struct DiscoveryReply {
    #[serde(default)]
    found: bool,
    #[serde(default)]
    name: String,
    #[serde(default)]
    manufacturer: String,
    #[serde(default)]
    matched_specs: Vec<String>,
    #[serde(default)]
    missing_specs: Vec<String>,
    #[serde(default)]
    confidence: f64,
}

/// Queries for one Scout round at `level`.
pub fn scout_queries(extraction: &SpecExtraction, level: u8, max: usize) -> Vec<String> {
    let term = extraction.marketplace_term.trim();
    if level >= 3 {
        return vec![term.to_string()];
    }

    let specs = extraction.spec_texts();
    let mut candidates = Vec::new();
    if let Some(first) = specs.first() {
        candidates.push(format!("{term} \"{first}\""));
    }
    if let Some(anchor) = &extraction.search_anchor {
        candidates.push(anchor.clone());
    }
    let joined = specs.iter().take(3).cloned().collect::<Vec<_>>().join(" ");
    candidates.push(format!("{term} {joined} ficha técnica"));
    candidates.push(format!("{term} fabricante"));

    let mut queries: Vec<String> = Vec::new();
    for q in candidates {
        let q = if level >= 1 {
            strip_query_operators(&q)
        } else {
            crate::text::squash(&q)
        };
        if !q.is_empty() && !queries.iter().any(|existing| same_text(existing, &q)) {
            queries.push(q);
        }
    }
    queries.truncate(max);
    queries
}

/// Whether `link` points to a marketplace or social network, or is not a
/// web URL at all.
pub(crate) fn is_excluded_source(link: &str) -> bool {
    let Ok(url) = Url::parse(link) else {
        return true;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return true;
    }
    let host = url.host_str().unwrap_or_default().to_lowercase();
    EXCLUDED_HOSTS.iter().any(|h| host.contains(h))
}

/// Relevance of a hit as a manufacturer-side source.
fn page_score(hit: &SearchHit, specs: &str) -> f64 {
    let text = fold(&format!("{} {} {}", hit.title, hit.snippet, hit.link));
    let mut score = 2.0 * overlap_ratio(specs, &text);
    if DATASHEET_SIGNALS.iter().any(|s| text.contains(s)) {
        score += 1.0;
    }
    if MAKER_SIGNALS.iter().any(|s| text.contains(s)) {
        score += 0.5;
    }
    score
}

/// Run one Scout round.
#[instrument(skip_all, fields(relaxation = level))]
pub async fn scout(ctx: &StageContext<'_>, extraction: &SpecExtraction, level: u8) -> ScoutOutcome {
    let queries = scout_queries(extraction, level, ctx.limits.scout_queries);
    ctx.tracer
        .note(Stage::Scout, &format!("level {level}: {}", queries.join(" | ")));

    // --- Search ---
    let mut hits: Vec<SearchHit> = Vec::new();
    for query in &queries {
        match ctx.search.search(query, HITS_PER_QUERY).await {
            Ok(found) => {
                for hit in found {
                    if !hits.iter().any(|h| h.link == hit.link) {
                        hits.push(hit);
                    }
                }
            }
            Err(e) => warn!(%query, error = %e, "web search failed"),
        }
    }

    // --- Rank pages ---
    let specs = extraction.spec_texts().join(" ");
    let mut ranked: Vec<(f64, SearchHit)> = hits
        .into_iter()
        .filter(|h| !is_excluded_source(&h.link))
        .map(|h| (page_score(&h, &specs), h))
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    ranked.truncate(ctx.limits.scout_pages);
    debug!(pages = ranked.len(), "pages selected");

    // --- Extract identities ---
    let mut identities: Vec<DiscoveredIdentity> = Vec::new();
    for (_, hit) in &ranked {
        let text = match ctx.fetcher.fetch_readable(&hit.link).await {
            Ok(Some(text)) => text,
            Ok(None) => continue,
            Err(e) => {
                warn!(link = %hit.link, error = %e, "page fetch failed");
                continue;
            }
        };
        if let Some(identity) = discover(ctx, extraction, &hit.link, text).await {
            merge_identity(&mut identities, identity);
        }
    }

    identities.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    if identities.is_empty() {
        return if level < ctx.limits.max_relaxation {
            ScoutOutcome::Retry
        } else {
            ScoutOutcome::Exhausted
        };
    }

    info!(found = identities.len(), best = %identities[0].display_name(), "identities discovered");
    ScoutOutcome::Found(identities)
}

async fn discover(
    ctx: &StageContext<'_>,
    extraction: &SpecExtraction,
    link: &str,
    text: String,
) -> Option<DiscoveredIdentity> {
    let user = format!(
        "Especificações: {}\nProduto: {}\nURL: {link}\n\nConteúdo da página:\n{}",
        extraction.spec_texts().join("; "),
        extraction.marketplace_term,
        truncate_chars(&text, PAGE_CHARS)
    );

    let reply = match ask::<DiscoveryReply>(
        ctx.completion,
        ctx.tracer,
        AgentTask::EntityDiscovery,
        DISCOVERY_SYSTEM,
        user,
        400,
    )
    .await
    {
        Ok((reply, _)) => reply,
        Err(e) => {
            debug!(%link, error = %e, "entity discovery failed");
            return None;
        }
    };

    let confidence = reply.confidence.clamp(0.0, 1.0);
    if !reply.found || reply.name.trim().is_empty() || confidence < ctx.limits.min_entity_confidence {
        return None;
    }

    Some(DiscoveredIdentity {
        name: reply.name.trim().to_string(),
        manufacturer: reply.manufacturer.trim().to_string(),
        matched_specs: reply.matched_specs,
        missing_specs: reply.missing_specs,
        confidence,
        source_url: link.to_string(),
        evidence: Some(text),
    })
}

/// Keep one identity per display name, with the highest confidence.
fn merge_identity(identities: &mut Vec<DiscoveredIdentity>, identity: DiscoveredIdentity) {
    let name = identity.display_name();
    match identities
        .iter_mut()
        .find(|i| same_text(&i.display_name(), &name))
    {
        Some(existing) if existing.confidence < identity.confidence => *existing = identity,
        Some(_) => {}
        None => identities.push(identity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::fallback_extraction;
    use crate::testing::{Fixture, ScriptedCompletion, StaticFetch, StaticSearch, hit};

    fn extraction() -> SpecExtraction {
        fallback_extraction("Sirene escolar com 72 músicas pré-gravadas")
    }

    #[test]
    fn level_zero_queries() {
        let q = scout_queries(&extraction(), 0, 3);
        assert_eq!(q.len(), 3);
        assert_eq!(q[0], "Sirene escolar \"72 músicas pré-gravadas\"");
        assert!(q[1].ends_with("ficha técnica"));
    }

    #[test]
    fn relaxed_queries_lose_operators() {
        let q = scout_queries(&extraction(), 1, 3);
        assert!(q.iter().all(|q| !q.contains('"')));
        assert_eq!(scout_queries(&extraction(), 3, 3), vec!["Sirene escolar"]);
    }

    #[test]
    fn marketplaces_and_socials_are_excluded() {
        assert!(is_excluded_source("https://produto.mercadolivre.com.br/MLB-1"));
        assert!(is_excluded_source("https://www.youtube.com/watch?v=1"));
        assert!(is_excluded_source("not a url"));
        assert!(!is_excluded_source("https://acme.ind.br/sirene-se72"));
    }

    #[test]
    fn datasheets_rank_first() {
        let specs = "72 músicas";
        let plain = hit("Blog sobre escolas", "https://blog.example/a", "dicas");
        let sheet = hit(
            "Sirene SE-72 ficha técnica",
            "https://acme.example/se72.pdf",
            "72 músicas pré-gravadas",
        );
        assert!(page_score(&sheet, specs) > page_score(&plain, specs));
    }

    #[tokio::test]
    async fn discovers_and_sorts_identities() {
        let search = StaticSearch::new().on(
            "sirene",
            vec![
                hit("Acme SE-72 ficha técnica", "https://acme.example/se72", "72 músicas"),
                hit("Beta SB-9", "https://beta.example/sb9", "sirene"),
                hit("Loja", "https://www.mercadolivre.com.br/x", "sirene"),
            ],
        );
        let fetch = StaticFetch::new()
            .page("https://acme.example/se72", "Sirene Acme SE-72 com 72 músicas pré-gravadas")
            .page("https://beta.example/sb9", "Sirene Beta SB-9 com 36 músicas");
        let completion = ScriptedCompletion::new().respond("entity_discovery", |prompt| {
            if prompt.contains("acme.example") {
                Some(r#"{"found": true, "name": "SE-72", "manufacturer": "Acme", "confidence": 0.9}"#.into())
            } else {
                Some(r#"{"found": true, "name": "SB-9", "manufacturer": "Beta", "confidence": 0.3}"#.into())
            }
        });
        let fx = Fixture::new().search(search).fetch(fetch).completion(completion);

        let outcome = scout(&fx.ctx(), &extraction(), 0).await;
        let ScoutOutcome::Found(identities) = outcome else {
            panic!("expected identities, got {outcome:?}");
        };
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].display_name(), "Acme SE-72");
        assert!(identities[0].evidence.as_deref().unwrap().contains("72 músicas"));
        assert!(!fx.fetch.fetched().iter().any(|u| u.contains("mercadolivre")));
    }

    #[tokio::test]
    async fn empty_round_retries_until_last_level() {
        let fx = Fixture::new();
        assert_eq!(scout(&fx.ctx(), &extraction(), 0).await, ScoutOutcome::Retry);
        assert_eq!(scout(&fx.ctx(), &extraction(), 3).await, ScoutOutcome::Exhausted);
    }
}
