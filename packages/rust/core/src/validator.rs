//! Identity Validator: confirm kill-specs against manufacturer-side content
//! and detect kits.

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use tenderscout_shared::{
    DiscoveredIdentity, GoldIdentity, KitComponent, SpecEvidence, SpecExtraction, SpecStatus,
};

use crate::agent::{AgentTask, ask};
use crate::context::StageContext;
use crate::scout::is_excluded_source;
use crate::text::{fold, overlap_ratio, same_text, truncate_chars};

const EVIDENCE_CHARS: usize = 8_000;
const FALLBACK_OVERLAP: f64 = 0.6;

const VALIDATION_SYSTEM: &str = "\
Você confere especificações técnicas. Para cada especificação, diga se o \
conteúdo do fabricante a confirma (confirmed), contradiz (mismatch) ou não \
menciona (not_found), citando o trecho. Responda somente com JSON:
{\"specs\": [{\"spec\": \"...\", \"status\": \"confirmed\", \"evidence\": \"...\"}]}";

const KIT_SYSTEM: &str = "\
Você analisa produtos. Diga se o produto é vendido completo para atender ao \
pedido ou se exige acessórios comprados à parte. Para cada item faltante, \
sugira uma busca. Responda somente com JSON:
{\"complete\": true, \"missing_items\": [{\"item\": \"...\", \"search_query\": \"...\"}]}";

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Validated(GoldIdentity),
    Rejected(String),
}

#[derive(Debug, Deserialize)]
struct SpecReplyItem {
    spec: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    evidence: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValidationReply {
    #[serde(default)]
    specs: Vec<SpecReplyItem>,
}

#[derive(Debug, Deserialize)]
struct KitReply {
    #[serde(default = "yes")]
    complete: bool,
    #[serde(default)]
    missing_items: Vec<KitComponent>,
}

fn yes() -> bool {
    true
}

fn parse_status(status: &str) -> SpecStatus {
    match fold(status.trim()).replace([' ', '-'], "_").as_str() {
        "confirmed" | "confirmado" | "ok" | "true" => SpecStatus::Confirmed,
        "mismatch" | "divergente" | "false" => SpecStatus::Mismatch,
        _ => SpecStatus::NotFound,
    }
}

/// Validate `identity` against the kill-specs of `extraction`.
#[instrument(skip_all, fields(identity = %identity.display_name()))]
pub async fn validate_identity(
    ctx: &StageContext<'_>,
    identity: &DiscoveredIdentity,
    extraction: &SpecExtraction,
) -> Validation {
    let Some((source_url, evidence)) = gather_evidence(ctx, identity).await else {
        return Validation::Rejected("no manufacturer-side evidence".into());
    };

    let specs = extraction.spec_texts();
    let verdicts = check_specs(ctx, identity, &specs, &evidence).await;

    if let Some(failed) = verdicts.iter().find(|v| v.status != SpecStatus::Confirmed) {
        let reason = format!("spec \"{}\" is {:?}", failed.spec, failed.status);
        debug!(%reason, "identity rejected");
        return Validation::Rejected(reason);
    }

    let kit = detect_kit(ctx, identity, extraction, &evidence).await;

    let mut identity = identity.clone();
    identity.source_url = source_url;
    identity.evidence = Some(evidence);
    info!(specs = verdicts.len(), kit = kit.len(), "identity validated");
    Validation::Validated(GoldIdentity::validated(identity, verdicts, kit))
}

/// Evidence text and its URL: cached page text, else the source page, else
/// an official product page found by search.
async fn gather_evidence(
    ctx: &StageContext<'_>,
    identity: &DiscoveredIdentity,
) -> Option<(String, String)> {
    if let Some(text) = identity.evidence.as_ref().filter(|t| !t.trim().is_empty()) {
        return Some((identity.source_url.clone(), text.clone()));
    }

    if !identity.source_url.is_empty() {
        match ctx.fetcher.fetch_readable(&identity.source_url).await {
            Ok(Some(text)) => return Some((identity.source_url.clone(), text)),
            Ok(None) => {}
            Err(e) => warn!(url = %identity.source_url, error = %e, "source page fetch failed"),
        }
    }

    let query = format!(
        "{} site oficial fabricante ficha técnica",
        identity.display_name()
    );
    let hits = match ctx.search.search(&query, 5).await {
        Ok(hits) => hits,
        Err(e) => {
            warn!(error = %e, "official page search failed");
            return None;
        }
    };
    let official = hits.into_iter().find(|h| !is_excluded_source(&h.link))?;
    match ctx.fetcher.fetch_readable(&official.link).await {
        Ok(Some(text)) => Some((official.link, text)),
        Ok(None) => None,
        Err(e) => {
            warn!(url = %official.link, error = %e, "official page fetch failed");
            None
        }
    }
}

async fn check_specs(
    ctx: &StageContext<'_>,
    identity: &DiscoveredIdentity,
    specs: &[String],
    evidence: &str,
) -> Vec<SpecEvidence> {
    if specs.is_empty() {
        return Vec::new();
    }

    let user = format!(
        "Produto: {}\nEspecificações:\n- {}\n\nConteúdo do fabricante:\n{}",
        identity.display_name(),
        specs.join("\n- "),
        truncate_chars(evidence, EVIDENCE_CHARS)
    );

    match ask::<ValidationReply>(
        ctx.completion,
        ctx.tracer,
        AgentTask::SpecValidation,
        VALIDATION_SYSTEM,
        user,
        800,
    )
    .await
    {
        Ok((reply, _)) => specs
            .iter()
            .map(|spec| {
                match reply.specs.iter().find(|r| same_text(&r.spec, spec)) {
                    Some(item) => SpecEvidence {
                        spec: spec.clone(),
                        status: parse_status(&item.status),
                        evidence: item.evidence.clone().filter(|e| !e.trim().is_empty()),
                    },
                    None => SpecEvidence {
                        spec: spec.clone(),
                        status: SpecStatus::NotFound,
                        evidence: None,
                    },
                }
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "spec validation call failed, using word overlap");
            overlap_verdicts(specs, evidence)
        }
    }
}

/// Deterministic per-spec check: more than 60% of the spec's words appear
/// in the evidence.
pub fn overlap_verdicts(specs: &[String], evidence: &str) -> Vec<SpecEvidence> {
    specs
        .iter()
        .map(|spec| SpecEvidence {
            spec: spec.clone(),
            status: if overlap_ratio(spec, evidence) > FALLBACK_OVERLAP {
                SpecStatus::Confirmed
            } else {
                SpecStatus::NotFound
            },
            evidence: None,
        })
        .collect()
}

/// Accessories to buy separately. Empty when the product is complete or
/// the call fails.
async fn detect_kit(
    ctx: &StageContext<'_>,
    identity: &DiscoveredIdentity,
    extraction: &SpecExtraction,
    evidence: &str,
) -> Vec<KitComponent> {
    let user = format!(
        "Pedido: {} ({})\nProduto: {}\n\nConteúdo do fabricante:\n{}",
        extraction.marketplace_term,
        extraction.spec_texts().join("; "),
        identity.display_name(),
        truncate_chars(evidence, EVIDENCE_CHARS)
    );

    match ask::<KitReply>(ctx.completion, ctx.tracer, AgentTask::KitDetection, KIT_SYSTEM, user, 400)
        .await
    {
        Ok((reply, _)) if !reply.complete => reply
            .missing_items
            .into_iter()
            .filter(|c| !c.item.trim().is_empty())
            .map(|c| {
                let search_query = if c.search_query.trim().is_empty() {
                    c.item.clone()
                } else {
                    c.search_query
                };
                KitComponent {
                    item: c.item,
                    search_query,
                }
            })
            .collect(),
        Ok(_) => Vec::new(),
        Err(e) => {
            debug!(error = %e, "kit detection failed, assuming complete product");
            Vec::new()
        }
    }
}
