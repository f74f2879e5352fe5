//! Enrichment: fill spec evidence gaps from an external knowledge source.

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use tenderscout_shared::{
    EnrichedListing, EnrichmentEvidence, RawListing, SpecAnswer, SpecExtraction, Truth,
};

use crate::agent::{AgentTask, ask};
use crate::context::StageContext;
use crate::extractor::critical_specs_present;
use crate::judge::below_price_floor;
use crate::text::{fold, same_text, spec_present, truncate_chars};

const LISTING_CHARS: usize = 3_000;

const KNOWLEDGE_SYSTEM: &str = "\
Você consulta fontes técnicas sobre produtos. Para o produto anunciado, diga \
se ele possui cada propriedade (true, false ou null quando não souber), sua \
confiança entre 0 e 1 e a fonte. Responda somente com JSON:
{\"properties\": [{\"spec\": \"...\", \"value\": true}], \"confidence\": 0.0, \"source\": \"...\"}";

#[derive(Debug, Deserialize)]
struct PropertyReply {
    spec: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct KnowledgeReply {
    #[serde(default)]
    properties: Vec<PropertyReply>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    source: String,
}

/// Share of kill-specs stated by `text`; 1.0 when there are none.
pub fn spec_coverage(extraction: &SpecExtraction, text: &str) -> f64 {
    let specs = extraction.spec_texts();
    if specs.is_empty() {
        return 1.0;
    }
    let present = specs.iter().filter(|s| spec_present(s, text)).count();
    present as f64 / specs.len() as f64
}

fn truth(value: &serde_json::Value) -> Truth {
    match value {
        serde_json::Value::Bool(true) => Truth::True,
        serde_json::Value::Bool(false) => Truth::False,
        serde_json::Value::String(s) => match fold(s.trim()).as_str() {
            "true" | "sim" | "yes" => Truth::True,
            "false" | "nao" | "no" => Truth::False,
            _ => Truth::Unknown,
        },
        _ => Truth::Unknown,
    }
}

/// Wrap every listing, querying the knowledge source for those whose own
/// text cannot prove the kill-specs. Never fails.
#[instrument(skip_all, fields(listings = listings.len()))]
pub async fn enrich_listings(
    ctx: &StageContext<'_>,
    listings: &[RawListing],
    extraction: &SpecExtraction,
    budget: f64,
) -> Vec<EnrichedListing> {
    let mut calls = 0usize;
    let mut enriched = Vec::with_capacity(listings.len());

    for listing in listings {
        let text = listing.full_text();
        let coverage = spec_coverage(extraction, &text);

        let skip = below_price_floor(listing.price, budget, ctx.limits.price_floor_ratio)
            || listing.price_anomaly.is_some()
            || (coverage >= ctx.limits.enrichment_coverage
                && critical_specs_present(extraction, &text));
        if skip || calls >= ctx.limits.max_enrichment_calls {
            enriched.push(EnrichedListing::plain(listing.clone(), coverage));
            continue;
        }

        calls += 1;
        let evidence = lookup(ctx, listing, extraction).await;
        enriched.push(EnrichedListing {
            listing: listing.clone(),
            spec_coverage: coverage,
            enrichment: evidence,
        });
    }

    info!(calls, "enrichment done");
    enriched
}

async fn lookup(
    ctx: &StageContext<'_>,
    listing: &RawListing,
    extraction: &SpecExtraction,
) -> Option<EnrichmentEvidence> {
    let specs = extraction.spec_texts();
    let user = format!(
        "Produto anunciado: {}\nPropriedades:\n- {}\n\nAnúncio:\n{}",
        listing.title,
        specs.join("\n- "),
        truncate_chars(&listing.full_text(), LISTING_CHARS)
    );

    match ask::<KnowledgeReply>(
        ctx.knowledge,
        ctx.tracer,
        AgentTask::KnowledgeLookup,
        KNOWLEDGE_SYSTEM,
        user,
        500,
    )
    .await
    {
        Ok((reply, completion)) => {
            let answers = specs
                .iter()
                .map(|spec| SpecAnswer {
                    spec: spec.clone(),
                    value: reply
                        .properties
                        .iter()
                        .find(|p| same_text(&p.spec, spec))
                        .map_or(Truth::Unknown, |p| truth(&p.value)),
                })
                .collect();
            debug!(link = %listing.link, provider = %completion.provider, "listing enriched");
            Some(EnrichmentEvidence {
                answers,
                confidence: reply.confidence.clamp(0.0, 1.0),
                source: reply.source,
                provider: completion.provider,
            })
        }
        Err(e) => {
            warn!(link = %listing.link, error = %e, "enrichment failed, continuing without it");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenderscout_shared::{Complexity, KillSpec, PriceAnomaly};

    use crate::testing::{Fixture, ScriptedCompletion};

    fn extraction() -> SpecExtraction {
        SpecExtraction {
            kill_specs: vec![KillSpec::weighted("72 músicas", 0.9), KillSpec::new("relógio")],
            critical_specs: vec![KillSpec::weighted("72 músicas", 0.9)],
            marketplace_term: "sirene escolar".into(),
            search_anchor: None,
            max_price_estimate: None,
            complexity: Complexity::High,
            source: "fallback".into(),
        }
    }

    fn listing(title: &str, price: f64, n: usize) -> RawListing {
        RawListing {
            title: title.into(),
            price,
            shipping_cost: 0.0,
            link: format!("https://m/{n}"),
            condition: None,
            attributes: Default::default(),
            description: String::new(),
            seller_reputation: None,
            source_strategy: "term".into(),
            price_anomaly: None,
        }
    }

    #[test]
    fn coverage_share() {
        let e = extraction();
        assert_eq!(spec_coverage(&e, "Sirene 72 músicas com relógio"), 1.0);
        assert_eq!(spec_coverage(&e, "Sirene 72 músicas"), 0.5);
        let mut none = e.clone();
        none.kill_specs.clear();
        assert_eq!(spec_coverage(&none, "x"), 1.0);
    }

    #[tokio::test]
    async fn only_unproven_viable_listings_are_looked_up() {
        let knowledge = ScriptedCompletion::new().reply(
            "knowledge_lookup",
            r#"{"properties": [{"spec": "72 músicas", "value": true}, {"spec": "relógio", "value": "não"}], "confidence": 0.8, "source": "manual"}"#,
        );
        let fx = Fixture::new().knowledge(knowledge);
        let mut anomalous = listing("Sirene genérica", 300.0, 3);
        anomalous.price_anomaly = Some(PriceAnomaly::FarBelowPeers);
        let listings = vec![
            listing("Sirene 72 músicas com relógio", 300.0, 1),
            listing("Sirene escolar digital", 300.0, 2),
            anomalous,
            listing("Sirene barata", 10.0, 4),
        ];

        let out = enrich_listings(&fx.ctx(), &listings, &extraction(), 500.0).await;
        assert_eq!(out.len(), 4);
        assert!(out[0].enrichment.is_none());
        let evidence = out[1].enrichment.as_ref().unwrap();
        assert_eq!(evidence.answers[0].value, Truth::True);
        assert_eq!(evidence.answers[1].value, Truth::False);
        assert_eq!(evidence.provider, "scripted");
        assert!(out[2].enrichment.is_none());
        assert!(out[3].enrichment.is_none());
        assert_eq!(fx.knowledge.calls("knowledge_lookup"), 1);
    }

    #[tokio::test]
    async fn calls_are_bounded_and_failures_fail_open() {
        let fx = Fixture::new();
        let listings: Vec<RawListing> = (0..8)
            .map(|i| listing("Sirene escolar digital", 300.0, i))
            .collect();
        let out = enrich_listings(&fx.ctx(), &listings, &extraction(), 500.0).await;
        assert_eq!(out.len(), 8);
        assert!(out.iter().all(|l| l.enrichment.is_none()));
        assert_eq!(fx.knowledge.calls("knowledge_lookup"), 5);
    }
}
