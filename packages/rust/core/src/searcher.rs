//! Marketplace Searcher: strategy-ordered listing collection.

use tracing::{debug, info, instrument, warn};

use tenderscout_providers::{ListingDetails, ListingSummary};
use tenderscout_shared::{
    GoldIdentity, KitComponent, KitLine, PriceAnomaly, RawListing, Result, SpecExtraction,
};

use crate::context::StageContext;
use crate::text::same_text;

const LISTINGS_PER_QUERY: usize = 20;

/// Factors of the price anomaly rules.
const PEER_MEDIAN_RATIO: f64 = 0.4;
const BUDGET_CEILING_RATIO: f64 = 3.0;
const MIN_PRICED_PEERS: usize = 3;

/// Named search strategy with its queries, in priority order.
#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub name: &'static str,
    pub queries: Vec<String>,
}

/// Strategies for one pass. Pending elastic queries replace the regular
/// strategies.
pub fn plan_strategies(
    gold: &GoldIdentity,
    extraction: &SpecExtraction,
    pending: &[String],
) -> Vec<Strategy> {
    if !pending.is_empty() {
        return vec![Strategy {
            name: "elastic",
            queries: pending.to_vec(),
        }];
    }

    let mut strategies = Vec::new();
    if !gold.is_generic {
        strategies.push(Strategy {
            name: "model",
            queries: gold.search_queries.clone(),
        });
    }
    if let Some(anchor) = &extraction.search_anchor {
        strategies.push(Strategy {
            name: "anchor",
            queries: vec![anchor.clone()],
        });
    }
    strategies.push(Strategy {
        name: "term",
        queries: vec![extraction.marketplace_term.clone()],
    });
    strategies
}

/// Run one search pass, appending new listings to `listings`.
///
/// `budget` is the tender's unit ceiling; listings are compared against it
/// one unit at a time, and the quantity only scales the report's total.
///
/// Returns the number of listings added. A fatal marketplace error aborts
/// the pass; other failures skip the query.
#[instrument(skip_all, fields(identity = %gold.name(), elastic = !pending.is_empty()))]
pub async fn search_marketplace(
    ctx: &StageContext<'_>,
    gold: &GoldIdentity,
    extraction: &SpecExtraction,
    pending: &[String],
    budget: f64,
    tried: &mut Vec<String>,
    listings: &mut Vec<RawListing>,
) -> Result<usize> {
    let elastic = !pending.is_empty();
    let before = listings.len();

    for strategy in plan_strategies(gold, extraction, pending) {
        for query in &strategy.queries {
            if !elastic && listings.len() >= ctx.limits.min_candidates {
                break;
            }
            run_query(ctx, strategy.name, query, tried, listings).await?;
        }
    }

    if listings.is_empty() {
        debug!("no strategy produced listings, trying last resort");
        run_query(ctx, "last_resort", gold.name(), tried, listings).await?;
    }

    let added = listings.len() - before;
    attach_details(ctx, &mut listings[before..]).await?;
    flag_price_anomalies(listings, budget);

    info!(added, total = listings.len(), "search pass done");
    Ok(added)
}

async fn run_query(
    ctx: &StageContext<'_>,
    strategy: &'static str,
    query: &str,
    tried: &mut Vec<String>,
    listings: &mut Vec<RawListing>,
) -> Result<()> {
    let query = query.trim();
    if query.is_empty() || tried.iter().any(|t| same_text(t, query)) {
        return Ok(());
    }
    tried.push(query.to_string());

    let found = match ctx.market.search(query, LISTINGS_PER_QUERY).await {
        Ok(found) => found,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            warn!(%query, error = %e, "marketplace search failed");
            return Ok(());
        }
    };

    let mut added = 0usize;
    for summary in found {
        if summary.link.is_empty() || listings.iter().any(|l| l.link == summary.link) {
            continue;
        }
        listings.push(from_summary(summary, strategy));
        added += 1;
    }
    debug!(strategy, %query, added, "query done");
    Ok(())
}

fn from_summary(summary: ListingSummary, strategy: &str) -> RawListing {
    RawListing {
        title: summary.title,
        price: summary.price,
        shipping_cost: summary.shipping_cost.unwrap_or(0.0),
        link: summary.link,
        condition: summary.condition,
        attributes: Default::default(),
        description: String::new(),
        seller_reputation: None,
        source_strategy: strategy.to_string(),
        price_anomaly: None,
    }
}

/// Fetch detail pages for at most `max_detail_fetches` listings.
async fn attach_details(ctx: &StageContext<'_>, listings: &mut [RawListing]) -> Result<()> {
    for listing in listings.iter_mut().take(ctx.limits.max_detail_fetches) {
        match ctx.market.fetch_details(&listing.link, ctx.destination).await {
            Ok(details) => merge_details(listing, details),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(link = %listing.link, error = %e, "detail fetch failed"),
        }
    }
    Ok(())
}

fn merge_details(listing: &mut RawListing, details: ListingDetails) {
    if let Some(shipping) = details.shipping_cost {
        listing.shipping_cost = shipping.max(0.0);
    }
    listing.attributes.extend(details.attributes);
    if !details.description.is_empty() {
        listing.description = details.description;
    }
    if details.seller_reputation.is_some() {
        listing.seller_reputation = details.seller_reputation;
    }
}

/// Recompute price anomaly flags over the whole listing set.
pub fn flag_price_anomalies(listings: &mut [RawListing], budget: f64) {
    let mut priced: Vec<f64> = listings
        .iter()
        .map(|l| l.price)
        .filter(|p| *p > 0.0)
        .collect();
    priced.sort_by(f64::total_cmp);
    let median = (priced.len() >= MIN_PRICED_PEERS).then(|| {
        let mid = priced.len() / 2;
        if priced.len() % 2 == 0 {
            (priced[mid - 1] + priced[mid]) / 2.0
        } else {
            priced[mid]
        }
    });

    for listing in listings.iter_mut() {
        listing.price_anomaly = if listing.price <= 0.0 {
            Some(PriceAnomaly::NonPositive)
        } else if budget > 0.0 && listing.price > BUDGET_CEILING_RATIO * budget {
            Some(PriceAnomaly::FarAboveBudget)
        } else if median.is_some_and(|m| listing.price < PEER_MEDIAN_RATIO * m) {
            Some(PriceAnomaly::FarBelowPeers)
        } else {
            None
        };
    }
}

/// Price each kit component with the cheapest listing of its query.
#[instrument(skip_all, fields(components = components.len()))]
pub async fn search_kit(
    ctx: &StageContext<'_>,
    components: &[KitComponent],
    tried: &mut Vec<String>,
) -> Result<Vec<KitLine>> {
    let mut lines = Vec::with_capacity(components.len());
    for component in components {
        let query = component.search_query.trim();
        tried.push(query.to_string());
        let found = match ctx.market.search(query, LISTINGS_PER_QUERY).await {
            Ok(found) => found,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(%query, error = %e, "kit component search failed");
                Vec::new()
            }
        };
        let cheapest = found
            .into_iter()
            .filter(|l| l.price > 0.0)
            .min_by(|a, b| a.price.total_cmp(&b.price));
        lines.push(match cheapest {
            Some(l) => KitLine {
                item: component.item.clone(),
                title: Some(l.title),
                link: Some(l.link),
                price: Some(l.price + l.shipping_cost.unwrap_or(0.0)),
            },
            None => KitLine {
                item: component.item.clone(),
                title: None,
                link: None,
                price: None,
            },
        });
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use tenderscout_shared::{DiscoveredIdentity, TenderScoutError};

    use crate::extractor::fallback_extraction;
    use crate::testing::{Fixture, StaticMarketplace, summary};

    fn gold() -> GoldIdentity {
        GoldIdentity::validated(
            DiscoveredIdentity {
                name: "SE-72".into(),
                manufacturer: "Acme".into(),
                matched_specs: vec![],
                missing_specs: vec![],
                confidence: 0.9,
                source_url: String::new(),
                evidence: None,
            },
            vec![],
            vec![],
        )
    }

    fn extraction() -> SpecExtraction {
        fallback_extraction("Sirene escolar com 72 músicas pré-gravadas")
    }

    #[test]
    fn strategies_in_priority_order() {
        let mut e = extraction();
        e.search_anchor = Some("sirene para escola".into());
        let names: Vec<_> = plan_strategies(&gold(), &e, &[]).iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["model", "anchor", "term"]);

        let generic = GoldIdentity::generic("Sirene escolar");
        let names: Vec<_> = plan_strategies(&generic, &e, &[]).iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["anchor", "term"]);

        let pending = vec!["sirene 72".to_string()];
        assert_eq!(plan_strategies(&gold(), &e, &pending)[0].name, "elastic");
    }

    #[tokio::test]
    async fn stops_once_enough_candidates() {
        let market = StaticMarketplace::new()
            .on(
                "acme se-72",
                vec![
                    summary("Sirene Acme SE-72 escolar 72 músicas", 300.0, "https://m/1"),
                    summary("Sirene Acme SE-72 bivolt", 320.0, "https://m/2"),
                    summary("Sirene Acme SE-72 com relógio", 310.0, "https://m/3"),
                ],
            )
            .details(
                "https://m/1",
                ListingDetails {
                    shipping_cost: Some(25.0),
                    attributes: BTreeMap::from([("Modelo".into(), "SE-72".into())]),
                    description: "72 músicas".into(),
                    seller_reputation: Some("platinum".into()),
                },
            );
        let fx = Fixture::new().market(market);
        let mut tried = Vec::new();
        let mut listings = Vec::new();

        let added = search_marketplace(&fx.ctx(), &gold(), &extraction(), &[], 500.0, &mut tried, &mut listings)
            .await
            .unwrap();
        assert_eq!(added, 3);
        assert_eq!(fx.market.queries(), vec!["Acme SE-72"]);
        assert_eq!(listings[0].source_strategy, "model");
        assert_eq!(listings[0].total_price(), 325.0);
        assert_eq!(listings[0].attributes["Modelo"], "SE-72");
        assert_eq!(listings[1].shipping_cost, 0.0);
    }

    #[tokio::test]
    async fn falls_through_strategies_and_dedupes() {
        let market = StaticMarketplace::new()
            .on("se-72", vec![summary("Sirene SE-72", 300.0, "https://m/1")])
            .on(
                "sirene escolar",
                vec![
                    summary("Sirene SE-72", 300.0, "https://m/1"),
                    summary("Sirene escolar digital", 280.0, "https://m/4"),
                ],
            );
        let fx = Fixture::new().market(market);
        let mut tried = Vec::new();
        let mut listings = Vec::new();

        search_marketplace(&fx.ctx(), &gold(), &extraction(), &[], 500.0, &mut tried, &mut listings)
            .await
            .unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[1].source_strategy, "term");
        assert_eq!(tried, vec!["Acme SE-72", "SE-72", "Sirene escolar"]);
    }

    #[tokio::test]
    async fn last_resort_uses_identity_name() {
        let market = StaticMarketplace::new();
        let fx = Fixture::new().market(market);
        let mut tried = vec!["Acme SE-72".to_string(), "Sirene escolar".to_string()];
        let mut listings = Vec::new();
        let generic = GoldIdentity::generic("Sirene escolar digital");

        search_marketplace(&fx.ctx(), &generic, &extraction(), &[], 500.0, &mut tried, &mut listings)
            .await
            .unwrap();
        assert!(listings.is_empty());
        assert_eq!(fx.market.queries(), vec!["Sirene escolar digital"]);
    }

    #[tokio::test]
    async fn blocked_portal_propagates() {
        let fx = Fixture::new().market(StaticMarketplace::new().blocked());
        let mut tried = Vec::new();
        let mut listings = Vec::new();
        let err = search_marketplace(&fx.ctx(), &gold(), &extraction(), &[], 500.0, &mut tried, &mut listings)
            .await
            .unwrap_err();
        assert!(matches!(err, TenderScoutError::Blocked(_)));
    }

    #[test]
    fn anomalies() {
        let mut listings: Vec<RawListing> = [100.0, 110.0, 120.0, 30.0, 0.0, 2000.0]
            .iter()
            .enumerate()
            .map(|(i, p)| from_summary(summary("x", *p, &format!("https://m/{i}")), "term"))
            .collect();
        flag_price_anomalies(&mut listings, 500.0);
        assert_eq!(listings[0].price_anomaly, None);
        assert_eq!(listings[3].price_anomaly, Some(PriceAnomaly::FarBelowPeers));
        assert_eq!(listings[4].price_anomaly, Some(PriceAnomaly::NonPositive));
        assert_eq!(listings[5].price_anomaly, Some(PriceAnomaly::FarAboveBudget));
    }

    #[test]
    fn few_peers_never_flag_below_median() {
        let mut listings = vec![
            from_summary(summary("a", 10.0, "https://m/a"), "term"),
            from_summary(summary("b", 100.0, "https://m/b"), "term"),
        ];
        flag_price_anomalies(&mut listings, 500.0);
        assert!(listings.iter().all(|l| l.price_anomaly.is_none()));
    }

    #[tokio::test]
    async fn kit_components_take_cheapest() {
        let market = StaticMarketplace::new().on(
            "corneta",
            vec![
                summary("Corneta A", 80.0, "https://m/c1"),
                summary("Corneta B", 60.0, "https://m/c2"),
            ],
        );
        let fx = Fixture::new().market(market);
        let components = vec![
            KitComponent { item: "corneta".into(), search_query: "corneta para sirene".into() },
            KitComponent { item: "suporte".into(), search_query: "suporte parede".into() },
        ];
        let lines = search_kit(&fx.ctx(), &components, &mut Vec::new()).await.unwrap();
        assert_eq!(lines[0].price, Some(60.0));
        assert_eq!(lines[0].link.as_deref(), Some("https://m/c2"));
        assert_eq!(lines[1].price, None);
    }
}
