//! Defense report: the audit narrative written once per item.

use std::fmt::Write as _;

use chrono::Utc;

use tenderscout_shared::{
    DefenseReport, KitLine, KitSummary, MatchStatus, SpecStatus, TenderItem, WinnerSummary,
};

use crate::state::PipelineState;

fn status_label(status: MatchStatus) -> &'static str {
    match status {
        MatchStatus::Approved => "APROVADO",
        MatchStatus::Rejected => "REJEITADO",
        MatchStatus::Uncertain => "INCERTO",
    }
}

/// Winner total plus every priced component.
pub fn kit_summary(winner_total: Option<f64>, lines: &[KitLine]) -> KitSummary {
    let components_total: f64 = lines.iter().filter_map(|l| l.price).sum();
    KitSummary {
        components: lines.to_vec(),
        total_kit_price: winner_total.unwrap_or(0.0) + components_total,
    }
}

pub fn build_report(item: &TenderItem, state: &PipelineState) -> DefenseReport {
    let mut methodology = Vec::new();

    let (identity, identity_source, identity_generic, validated_specs) = match &state.gold {
        Some(gold) if !gold.is_generic => {
            let source = Some(gold.identity.source_url.clone()).filter(|s| !s.is_empty());
            methodology.push(match &source {
                Some(url) => format!(
                    "Identidade {} validada contra conteúdo do fabricante ({url}).",
                    gold.identity.display_name()
                ),
                None => format!("Identidade {} validada.", gold.identity.display_name()),
            });
            (
                gold.identity.display_name(),
                source,
                false,
                gold.validated_specs.clone(),
            )
        }
        Some(gold) => {
            methodology.push(format!(
                "Nenhum modelo foi validado; busca genérica pelo termo \"{}\".",
                gold.name()
            ));
            (gold.name().to_string(), None, true, Vec::new())
        }
        None => {
            methodology.push("Nenhuma identidade disponível.".to_string());
            (String::new(), None, true, Vec::new())
        }
    };

    if state.cache_hit {
        methodology.push("Identidade reaproveitada do cache.".to_string());
    }

    let kill_specs = state
        .base_extraction
        .as_ref()
        .or(state.extraction.as_ref())
        .map(|e| e.spec_texts())
        .unwrap_or_default();
    if !kill_specs.is_empty() {
        methodology.push(format!("Especificações verificadas: {}.", kill_specs.join("; ")));
    }
    let confirmed = validated_specs
        .iter()
        .filter(|s| s.status == SpecStatus::Confirmed)
        .count();
    if !validated_specs.is_empty() {
        methodology.push(format!(
            "{confirmed} de {} especificações confirmadas pelo fabricante.",
            validated_specs.len()
        ));
    }

    methodology.extend(state.methodology.iter().cloned());

    let rejected_floor = state
        .candidates
        .iter()
        .filter(|c| c.reasoning.starts_with("PREÇO VIL"))
        .count();
    if rejected_floor > 0 {
        methodology.push(format!("{rejected_floor} anúncio(s) rejeitado(s) por preço vil."));
    }

    let winner = state.winner.and_then(|pick| {
        state.candidates.get(pick.index).map(|c| WinnerSummary {
            index: pick.index,
            title: c.raw().title.clone(),
            link: c.raw().link.clone(),
            total_price: c.total_price,
            risk_score: c.risk_score,
            status: c.match_status,
            reasoning: c.reasoning.clone(),
            endorsed: pick.endorsed,
        })
    });
    methodology.push(match &winner {
        Some(w) if w.endorsed => format!(
            "Vencedor: {} por R$ {:.2} (risco {}/10, {}). {}",
            w.title,
            w.total_price,
            w.risk_score,
            status_label(w.status),
            w.reasoning
        ),
        Some(w) => format!(
            "Nenhum anúncio qualificado; melhor esforço: {} por R$ {:.2} (risco {}/10). Revisão manual necessária.",
            w.title, w.total_price, w.risk_score
        ),
        None => format!(
            "Nenhum anúncio encontrado entre {} avaliados.",
            state.candidates.len()
        ),
    });

    if let Some(w) = winner.as_ref().filter(|_| item.quantity > 1) {
        let quantity = f64::from(item.quantity);
        methodology.push(format!(
            "Quantidade licitada: {} unidades; total estimado R$ {:.2} para teto de R$ {:.2}.",
            item.quantity,
            w.total_price * quantity,
            item.max_price * quantity
        ));
    }

    let kit = (!state.kit_lines.is_empty()).then(|| {
        let summary = kit_summary(winner.as_ref().map(|w| w.total_price), &state.kit_lines);
        methodology.push(format!(
            "Kit com {} componente(s) adicional(is); preço total do kit R$ {:.2}.",
            summary.components.len(),
            summary.total_kit_price
        ));
        summary
    });

    DefenseReport {
        item_id: item.id.clone(),
        identity,
        identity_source,
        identity_generic,
        kill_specs,
        validated_specs,
        winner,
        kit,
        methodology,
        generated_at: Utc::now(),
    }
}

/// Markdown rendering for operators.
pub fn render_markdown(report: &DefenseReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Item {}\n", report.item_id);
    let _ = writeln!(
        out,
        "**Identidade:** {}{}",
        report.identity,
        if report.identity_generic { " (genérica)" } else { "" }
    );
    if let Some(source) = &report.identity_source {
        let _ = writeln!(out, "**Fonte:** {source}");
    }

    if !report.kill_specs.is_empty() {
        let _ = writeln!(out, "\n## Especificações\n");
        for spec in &report.kill_specs {
            let status = report
                .validated_specs
                .iter()
                .find(|v| &v.spec == spec)
                .map(|v| match v.status {
                    SpecStatus::Confirmed => " ✔",
                    SpecStatus::Mismatch => " ✘",
                    SpecStatus::NotFound => " ?",
                })
                .unwrap_or("");
            let _ = writeln!(out, "- {spec}{status}");
        }
    }

    let _ = writeln!(out, "\n## Vencedor\n");
    match &report.winner {
        Some(w) => {
            let _ = writeln!(out, "[{}]({})", w.title, w.link);
            let _ = writeln!(
                out,
                "\nR$ {:.2} · risco {}/10 · {}{}",
                w.total_price,
                w.risk_score,
                status_label(w.status),
                if w.endorsed { "" } else { " · não endossado" }
            );
        }
        None => {
            let _ = writeln!(out, "Nenhum.");
        }
    }

    if let Some(kit) = &report.kit {
        let _ = writeln!(out, "\n## Kit\n");
        for line in &kit.components {
            match (line.price, &line.title) {
                (Some(price), Some(title)) => {
                    let _ = writeln!(out, "- {}: {title} (R$ {price:.2})", line.item);
                }
                _ => {
                    let _ = writeln!(out, "- {}: não encontrado", line.item);
                }
            }
        }
        let _ = writeln!(out, "\n**Total do kit:** R$ {:.2}", kit.total_kit_price);
    }

    let _ = writeln!(out, "\n## Metodologia\n");
    for line in &report.methodology {
        let _ = writeln!(out, "- {line}");
    }
    out
}
