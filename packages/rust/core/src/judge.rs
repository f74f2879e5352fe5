//! Cross-Referencer / Judge: price floor, identity matching, risk scoring
//! and winner selection.

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use tenderscout_shared::{
    EnrichedListing, GoldIdentity, JudgedCandidate, MatchStatus, SpecExtraction, Truth, Verdict,
};

use crate::agent::{AgentTask, ask};
use crate::context::StageContext;
use crate::state::WinnerPick;
use crate::text::{fold, overlap_ratio, truncate_chars};

const LISTING_CHARS: usize = 3_000;
const ENDORSED_MAX_RISK: u8 = 3;

const MATCH_SYSTEM: &str = "\
Você é o auditor de uma licitação. Compare o anúncio com o produto validado \
e as especificações exigidas. Responda somente com JSON:
{\"matches\": true, \"status\": \"APPROVED|REJECTED|UNCERTAIN\", \
\"risk_score\": 0, \"reasoning\": \"...\"}";

#[derive(Debug, Deserialize)]
struct MatchReply {
    #[serde(default)]
    matches: bool,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    risk_score: Option<f64>,
    #[serde(default)]
    reasoning: String,
}

/// A positive price under `ratio` of the budget.
pub fn below_price_floor(price: f64, budget: f64, ratio: f64) -> bool {
    price > 0.0 && price < ratio * budget
}

/// Verdict for a listing under the price floor.
pub fn price_floor_verdict(price: f64, budget: f64, ratio: f64) -> Verdict {
    let floor = ratio * budget;
    Verdict::new(
        MatchStatus::Rejected,
        10,
        format!(
            "PREÇO VIL: R${price:.2} abaixo do limite de R${floor:.2} ({}% do preço máximo R${budget:.2})",
            (ratio * 100.0).round() as u32
        ),
    )
}

/// Word-overlap verdict between the identity name and the listing title.
pub fn overlap_verdict(identity_name: &str, title: &str) -> Verdict {
    let ratio = overlap_ratio(identity_name, title);
    if ratio > 0.7 {
        Verdict::new(
            MatchStatus::Approved,
            2,
            format!("título corresponde a {identity_name} ({:.0}% das palavras)", ratio * 100.0),
        )
    } else if ratio > 0.4 {
        Verdict::new(
            MatchStatus::Uncertain,
            5,
            format!("correspondência parcial com {identity_name} ({:.0}% das palavras)", ratio * 100.0),
        )
    } else {
        Verdict::new(
            MatchStatus::Rejected,
            8,
            format!("título não corresponde a {identity_name}"),
        )
    }
}

fn parse_match_status(status: Option<&str>, matches: bool) -> MatchStatus {
    match status.map(|s| fold(s.trim())) {
        Some(s) if s.starts_with("approv") || s.starts_with("aprov") => MatchStatus::Approved,
        Some(s) if s.starts_with("reject") || s.starts_with("rejeit") => MatchStatus::Rejected,
        Some(s) if s.starts_with("uncert") || s.starts_with("incert") => MatchStatus::Uncertain,
        _ if matches => MatchStatus::Approved,
        _ => MatchStatus::Rejected,
    }
}

/// Judge every enriched listing. Candidate order follows listing order.
#[instrument(skip_all, fields(candidates = listings.len(), generic = gold.is_generic))]
pub async fn judge_candidates(
    ctx: &StageContext<'_>,
    listings: Vec<EnrichedListing>,
    gold: &GoldIdentity,
    extraction: &SpecExtraction,
    budget: f64,
) -> Vec<JudgedCandidate> {
    let mut calls = 0usize;
    let mut judged = Vec::with_capacity(listings.len());

    for listing in listings {
        let raw = &listing.listing;
        let verdict = if below_price_floor(raw.price, budget, ctx.limits.price_floor_ratio) {
            price_floor_verdict(raw.price, budget, ctx.limits.price_floor_ratio)
        } else if let Some(anomaly) = raw.price_anomaly {
            Verdict::new(
                MatchStatus::Uncertain,
                8,
                format!("preço anômalo ({anomaly:?}); revisão manual"),
            )
        } else if gold.is_generic {
            Verdict::new(
                MatchStatus::Uncertain,
                5,
                "identidade genérica; revisão manual recomendada",
            )
        } else if calls < ctx.limits.max_judge_calls {
            calls += 1;
            match_with_model(ctx, &listing, gold, extraction).await
        } else {
            overlap_verdict(gold.name(), &raw.title)
        };
        judged.push(JudgedCandidate::new(listing, verdict));
    }

    info!(calls, "candidates judged");
    judged
}

async fn match_with_model(
    ctx: &StageContext<'_>,
    listing: &EnrichedListing,
    gold: &GoldIdentity,
    extraction: &SpecExtraction,
) -> Verdict {
    let raw = &listing.listing;
    let mut user = format!(
        "Produto validado: {}\nEspecificações exigidas:\n- {}\n\nAnúncio: {}\nPreço: R$ {:.2}\n{}",
        gold.identity.display_name(),
        extraction.spec_texts().join("\n- "),
        raw.title,
        raw.total_price(),
        truncate_chars(&raw.full_text(), LISTING_CHARS)
    );
    if let Some(evidence) = &listing.enrichment {
        user.push_str("\n\nConsulta externa:");
        for answer in &evidence.answers {
            let value = match answer.value {
                Truth::True => "sim",
                Truth::False => "não",
                Truth::Unknown => "desconhecido",
            };
            user.push_str(&format!("\n- {}: {value}", answer.spec));
        }
    }

    match ask::<MatchReply>(ctx.completion, ctx.tracer, AgentTask::CandidateMatch, MATCH_SYSTEM, user, 400)
        .await
    {
        Ok((reply, _)) => {
            let status = parse_match_status(reply.status.as_deref(), reply.matches);
            let default_risk = match status {
                MatchStatus::Approved => 2.0,
                MatchStatus::Uncertain => 5.0,
                MatchStatus::Rejected => 8.0,
            };
            let risk = reply.risk_score.unwrap_or(default_risk).clamp(0.0, 10.0).round() as u8;
            Verdict::new(status, risk, reply.reasoning)
        }
        Err(e) => {
            warn!(link = %raw.link, error = %e, "match call failed, using word overlap");
            overlap_verdict(gold.name(), &raw.title)
        }
    }
}

/// Pick the winner: the lowest (risk, total price) among approved or
/// low-risk candidates, else the lowest-risk candidate unendorsed.
pub fn select_winner(candidates: &[JudgedCandidate]) -> Option<WinnerPick> {
    let endorsed = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.match_status == MatchStatus::Approved || c.risk_score <= ENDORSED_MAX_RISK)
        .min_by(|(ia, a), (ib, b)| {
            a.risk_score
                .cmp(&b.risk_score)
                .then(a.total_price.total_cmp(&b.total_price))
                .then(ia.cmp(ib))
        });
    if let Some((index, _)) = endorsed {
        return Some(WinnerPick {
            index,
            endorsed: true,
        });
    }

    let fallback = candidates
        .iter()
        .enumerate()
        .min_by(|(ia, a), (ib, b)| a.risk_score.cmp(&b.risk_score).then(ia.cmp(ib)))
        .map(|(index, _)| WinnerPick {
            index,
            endorsed: false,
        });
    debug!(?fallback, "no endorsed candidate");
    fallback
}
