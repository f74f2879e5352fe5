//! Spec Extractor: kill-specs, marketplace term and complexity from a
//! free-text description.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use tenderscout_providers::CompletionProvider;
use tenderscout_shared::{Complexity, HIGH_WEIGHT, KillSpec, SpecExtraction, TenderItem};

use crate::agent::{AgentTask, ask};
use crate::text::{first_words, fold, overlap_ratio, squash, strip_numerals};
use crate::tracer::PipelineTracer;

const MAX_SPECS: usize = 6;
const MAX_TERM_WORDS: usize = 6;

/// Folded unit words that carry no meaning once their number is gone.
const UNIT_WORDS: &[&str] = &[
    "cm", "mm", "km", "kg", "mg", "ml", "kw", "kva", "va", "hz", "khz", "mhz", "ghz", "mah",
    "ah", "gb", "mb", "tb", "kb", "rpm", "btu", "btus", "dpi", "pol", "pols", "polegada",
    "polegadas", "watt", "watts", "volt", "volts", "ampere", "amperes", "litro", "litros",
    "metro", "metros", "grama", "gramas", "quilo", "quilos", "lumens", "bar", "psi", "m", "g",
    "l", "w", "v", "x",
];

const EXTRACTION_SYSTEM: &str = "\
Você é um analista de licitações. Extraia da descrição do item as \
especificações que eliminam produtos genéricos (kill_specs), as críticas com \
peso entre 0 e 1 (critical_specs), um termo curto para buscar no marketplace \
(marketplace_term), uma âncora funcional opcional (search_anchor), uma \
estimativa de preço máximo (max_price_estimate) e a complexidade (LOW para \
itens de consumo, HIGH para itens técnicos). Copie unidades por extenso como \
aparecem na descrição. Responda somente com JSON:
{\"kill_specs\": [\"...\"], \"critical_specs\": [{\"text\": \"...\", \"weight\": 0.9}], \
\"marketplace_term\": \"...\", \"search_anchor\": \"...\", \
\"max_price_estimate\": 0, \"complexity\": \"HIGH\"}";

/// Folded keywords that always mark an item as technical.
const HIGH_KEYWORDS: &[&str] = &[
    "eletron", "eletric", "digital", "sirene", "medic", "hospital", "cirurg", "laborat",
    "equipamento", "aparelho", "motor", "bomba", "sensor", "controlador", "computador",
    "notebook", "impressora", "monitor", "projetor", "camera", "microscop", "balanca",
    "gerador", "inversor", "amplificador", "roteador", "nobreak", "bateria", "software",
    "desfibrilador", "oximetro", "autoclave", "compressor", "transformador",
];

/// Folded keywords of commodity items.
const LOW_KEYWORDS: &[&str] = &[
    "caneta", "lapis", "papel", "borracha", "caderno", "grampeador", "grampo", "clipe",
    "envelope", "pasta", "cola", "tesoura", "regua", "detergente", "sabao", "desinfetante",
    "vassoura", "rodo", "pano", "esponja", "descartavel", "guardanapo", "saco de lixo",
    "agua sanitaria", "alcool", "limpador", "flanela",
];

static ABBREV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*(\p{L}{1,2})\b").expect("valid regex"));

static NUMERIC_UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+(?:[.,]\d+)?\s*[\p{L}%]+(?:-\p{L}+)*").expect("valid regex")
});

static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["“]([^"“”]{2,80})["”]"#).expect("valid regex"));

static COM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bcom\s+").expect("valid regex"));

static COM_STOP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[;()]|[,.]\s|\s+com\s+|\s+-\s+").expect("valid regex"));

static TERM_STOP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+com\s+|[,(;]|\s+-\s+").expect("valid regex"));

static GENERIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:\d+(?:[.,]\d+)?\s*v(?:olts?)?|bivolt|voltagem.*|tensao.*|novo|nova|lacrad[oa]|original|garantia.*|material.*|(?:em |de )?(?:aco|plastico|metal|madeira|aluminio|inox|ferro|vidro)(?: inox)?)$",
    )
    .expect("valid regex")
});

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpecItem {
    Text(String),
    Weighted {
        text: String,
        #[serde(default)]
        weight: Option<f64>,
    },
}

impl SpecItem {
    fn into_spec(self, default_weight: Option<f64>) -> KillSpec {
        match self {
            Self::Text(text) => KillSpec {
                text,
                weight: default_weight,
            },
            Self::Weighted { text, weight } => match weight.or(default_weight) {
                Some(w) => KillSpec::weighted(text, w),
                None => KillSpec::new(text),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExtractionReply {
    #[serde(default)]
    kill_specs: Vec<SpecItem>,
    #[serde(default)]
    critical_specs: Vec<SpecItem>,
    #[serde(default)]
    marketplace_term: Option<String>,
    #[serde(default)]
    search_anchor: Option<String>,
    #[serde(default)]
    max_price_estimate: Option<serde_json::Value>,
    #[serde(default)]
    complexity: Option<String>,
}

/// Extract kill-specs and search terms for `item`.
///
/// Never fails: a provider or parse failure switches to the deterministic
/// fallback, which always reports HIGH complexity.
#[instrument(skip_all, fields(item_id = %item.id))]
pub async fn extract_specs(
    provider: &dyn CompletionProvider,
    tracer: &dyn PipelineTracer,
    item: &TenderItem,
) -> SpecExtraction {
    let user = format!(
        "Descrição: {}\nPreço máximo unitário: R$ {:.2}\nQuantidade: {}",
        item.description, item.max_price, item.quantity
    );

    match ask::<ExtractionReply>(
        provider,
        tracer,
        AgentTask::SpecExtraction,
        EXTRACTION_SYSTEM,
        user,
        800,
    )
    .await
    {
        Ok((reply, completion)) => {
            let extraction = from_reply(reply, &item.description, &completion.provider);
            info!(
                provider = %completion.provider,
                specs = extraction.kill_specs.len(),
                complexity = ?extraction.complexity,
                "specs extracted"
            );
            extraction
        }
        Err(e) => {
            warn!(error = %e, "spec extraction failed, using fallback");
            fallback_extraction(&item.description)
        }
    }
}

fn from_reply(reply: ExtractionReply, description: &str, provider: &str) -> SpecExtraction {
    let mut kill_specs: Vec<KillSpec> = reply
        .kill_specs
        .into_iter()
        .map(|s| s.into_spec(None))
        .filter_map(|s| anchor_spec(s, description))
        .collect();
    let critical_specs: Vec<KillSpec> = reply
        .critical_specs
        .into_iter()
        .map(|s| s.into_spec(Some(0.9)))
        .filter_map(|s| anchor_spec(s, description))
        .collect();

    for critical in &critical_specs {
        match kill_specs.iter_mut().find(|k| same_spec(&k.text, &critical.text)) {
            Some(existing) => existing.weight = critical.weight,
            None => kill_specs.push(critical.clone()),
        }
    }
    dedupe_specs(&mut kill_specs);

    let fallback = fallback_extraction(description);
    let (kill_specs, critical_specs) = if kill_specs.is_empty() {
        debug!("no model spec survived validation, filling from fallback");
        (fallback.kill_specs.clone(), fallback.critical_specs.clone())
    } else {
        kill_specs.truncate(MAX_SPECS + 2);
        (kill_specs, critical_specs)
    };

    let marketplace_term = reply
        .marketplace_term
        .map(|t| squash(&t))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| fallback.marketplace_term.clone());

    let search_anchor = reply
        .search_anchor
        .map(|a| squash(&a))
        .filter(|a| !a.is_empty() && overlap_ratio(a, description) >= 0.5);

    let max_price_estimate = reply
        .max_price_estimate
        .and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.replace(',', ".").trim().parse().ok(),
            _ => None,
        })
        .filter(|p| *p > 0.0);

    let ai_complexity = match reply.complexity.as_deref().map(str::trim) {
        Some(c) if c.eq_ignore_ascii_case("low") => Complexity::Low,
        _ => Complexity::High,
    };

    SpecExtraction {
        kill_specs,
        critical_specs,
        marketplace_term,
        search_anchor,
        max_price_estimate,
        complexity: classify_complexity(description, ai_complexity),
        source: provider.to_string(),
    }
}

/// Keyword classification; technical keywords win over commodity ones, and
/// the model's answer decides when neither list matches.
pub fn classify_complexity(description: &str, model: Complexity) -> Complexity {
    let folded = fold(description);
    if HIGH_KEYWORDS.iter().any(|k| folded.contains(k)) {
        Complexity::High
    } else if LOW_KEYWORDS.iter().any(|k| folded.contains(k)) {
        Complexity::Low
    } else {
        model
    }
}

/// Check `spec` for truncated unit abbreviations ("72 m") and repair them
/// from the description. Returns `None` when the spec cannot be anchored.
pub fn anchor_spec(spec: KillSpec, description: &str) -> Option<KillSpec> {
    let text = squash(&spec.text);
    if text.is_empty() {
        return None;
    }

    let mut repaired = String::with_capacity(text.len());
    let mut last = 0;
    for caps in ABBREV_RE.captures_iter(&text) {
        let (Some(whole), Some(number), Some(abbrev)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        let word = full_unit_word(description, number.as_str(), abbrev.as_str())?;
        repaired.push_str(&text[last..whole.start()]);
        repaired.push_str(number.as_str());
        repaired.push(' ');
        repaired.push_str(&word);
        last = whole.end();
    }
    repaired.push_str(&text[last..]);

    Some(KillSpec {
        text: repaired,
        weight: spec.weight,
    })
}

/// The word that follows `number` in the description, if it confirms or
/// expands `abbrev`.
fn full_unit_word(description: &str, number: &str, abbrev: &str) -> Option<String> {
    let pattern = format!(
        r"(?:^|[^\d]){}\s*(\p{{L}}+(?:-\p{{L}}+)*)",
        regex::escape(number)
    );
    let re = Regex::new(&pattern).ok()?;
    let abbrev_folded = fold(abbrev);
    let first = abbrev_folded.chars().next()?;

    let mut expansion = None;
    for caps in re.captures_iter(description) {
        let Some(word) = caps.get(1) else { continue };
        let folded = fold(word.as_str());
        if folded == abbrev_folded {
            return Some(abbrev.to_string());
        }
        if expansion.is_none() && folded.starts_with(first) {
            expansion = Some(word.as_str().to_string());
        }
    }
    expansion
}

/// Regex-only extraction used when no provider answers.
pub fn fallback_extraction(description: &str) -> SpecExtraction {
    let mut specs: Vec<KillSpec> = Vec::new();

    for m in NUMERIC_UNIT_RE.find_iter(description) {
        specs.push(KillSpec::weighted(squash(m.as_str()), 0.9));
    }
    for caps in QUOTED_RE.captures_iter(description) {
        if let Some(inner) = caps.get(1) {
            specs.push(KillSpec::weighted(squash(inner.as_str()), 0.7));
        }
    }
    for m in COM_RE.find_iter(description) {
        let rest = &description[m.end()..];
        let end = COM_STOP_RE.find(rest).map_or(rest.len(), |s| s.start());
        let phrase = first_words(rest[..end].trim_end_matches(['.', ',']), 8);
        if !phrase.is_empty() {
            specs.push(KillSpec::weighted(phrase, 0.6));
        }
    }

    specs.retain(|s| !GENERIC_RE.is_match(fold(&s.text).trim()));
    dedupe_specs(&mut specs);
    absorb_contained(&mut specs);
    specs.truncate(MAX_SPECS);

    let critical_specs = specs.iter().filter(|s| s.is_critical()).cloned().collect();

    SpecExtraction {
        kill_specs: specs,
        critical_specs,
        marketplace_term: fallback_term(description),
        search_anchor: None,
        max_price_estimate: None,
        complexity: Complexity::High,
        source: "fallback".to_string(),
    }
}

/// Text before the first feature clause, at most six words.
pub fn fallback_term(description: &str) -> String {
    let head = TERM_STOP_RE
        .find(description)
        .map_or(description, |m| &description[..m.start()]);
    let term = first_words(head, MAX_TERM_WORDS);
    if term.is_empty() {
        first_words(description, MAX_TERM_WORDS)
    } else {
        term
    }
}

/// Specs at relaxation `level`: 1 strips numerals, 2 and above also keep
/// only the first two specs.
pub fn relax_specs(specs: &[KillSpec], level: u8) -> Vec<KillSpec> {
    if level == 0 {
        return specs.to_vec();
    }
    let mut relaxed: Vec<KillSpec> = specs
        .iter()
        .filter_map(|s| {
            anchored_remainder(&s.text).map(|text| KillSpec {
                text,
                weight: s.weight,
            })
        })
        .collect();
    dedupe_specs(&mut relaxed);
    if level >= 2 {
        relaxed.truncate(2);
    }
    relaxed
}

/// `spec` without its numerals and unit words, or `None` when nothing
/// distinctive is left ("60 cm", "30 W").
fn anchored_remainder(spec: &str) -> Option<String> {
    let stripped = strip_numerals(spec);
    let mut words: Vec<&str> = stripped
        .split_whitespace()
        .filter(|w| !is_unit_word(w))
        .collect();
    while words.first().is_some_and(|w| is_short_word(w)) {
        words.remove(0);
    }
    while words.last().is_some_and(|w| is_short_word(w)) {
        words.pop();
    }
    if words.iter().all(|w| is_short_word(w)) {
        return None;
    }
    Some(words.join(" "))
}

fn bare_word(word: &str) -> String {
    fold(word).trim_matches(|c: char| !c.is_alphanumeric()).to_string()
}

fn is_unit_word(word: &str) -> bool {
    let bare = bare_word(word);
    bare.is_empty() || UNIT_WORDS.contains(&bare.as_str())
}

fn is_short_word(word: &str) -> bool {
    bare_word(word).chars().count() <= 2
}

/// The base extraction relaxed to `level`.
pub fn relax_extraction(base: &SpecExtraction, level: u8) -> SpecExtraction {
    let kill_specs = relax_specs(&base.kill_specs, level);
    let critical_specs = relax_specs(&base.critical_specs, level)
        .into_iter()
        .filter(|c| kill_specs.iter().any(|k| same_spec(&k.text, &c.text)))
        .collect();
    SpecExtraction {
        kill_specs,
        critical_specs,
        ..base.clone()
    }
}

fn same_spec(a: &str, b: &str) -> bool {
    fold(&squash(a)) == fold(&squash(b))
}

fn dedupe_specs(specs: &mut Vec<KillSpec>) {
    let mut seen: Vec<String> = Vec::with_capacity(specs.len());
    specs.retain(|s| {
        let key = fold(&squash(&s.text));
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
}

/// Drop specs contained in a longer one; the longer spec keeps the higher
/// weight.
fn absorb_contained(specs: &mut Vec<KillSpec>) {
    let folded: Vec<String> = specs.iter().map(|s| fold(&s.text)).collect();
    let mut keep = vec![true; specs.len()];
    let mut boosts: Vec<(usize, f64)> = Vec::new();

    for i in 0..specs.len() {
        for j in 0..specs.len() {
            if i != j && folded[j].len() > folded[i].len() && folded[j].contains(&folded[i]) {
                keep[i] = false;
                if let Some(w) = specs[i].weight {
                    boosts.push((j, w));
                }
                break;
            }
        }
    }
    for (j, w) in boosts {
        if specs[j].weight.is_none_or(|current| current < w) {
            specs[j].weight = Some(w);
        }
    }
    let mut idx = 0;
    specs.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
}

/// Whether every high-weight spec is present in `text`.
pub fn critical_specs_present(extraction: &SpecExtraction, text: &str) -> bool {
    extraction
        .critical_specs
        .iter()
        .chain(extraction.kill_specs.iter())
        .filter(|s| s.weight.is_some_and(|w| w >= HIGH_WEIGHT))
        .all(|s| crate::text::spec_present(&s.text, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCompletion;
    use crate::tracer::NoopTracer;

    fn item(description: &str) -> TenderItem {
        TenderItem {
            id: "1".into(),
            description: description.into(),
            max_price: 500.0,
            quantity: 1,
        }
    }

    #[test]
    fn fallback_finds_numeric_unit_phrase() {
        let e = fallback_extraction("Sirene escolar com 72 músicas pré-gravadas");
        assert!(e.kill_specs.iter().any(|s| s.text.contains("72 músicas")));
        assert_eq!(e.complexity, Complexity::High);
        assert_eq!(e.source, "fallback");
        assert_eq!(e.marketplace_term, "Sirene escolar");
        assert!(!e.critical_specs.is_empty());
    }

    #[test]
    fn fallback_filters_generic_terms() {
        let e = fallback_extraction("Ventilador de parede 60 cm, 220 V, com grade em aço, novo");
        let texts = e.spec_texts();
        assert!(texts.iter().any(|t| t == "60 cm"));
        assert!(!texts.iter().any(|t| t.contains("220")));
        assert!(texts.iter().all(|t| !t.eq_ignore_ascii_case("novo")));
        assert!(texts.len() <= MAX_SPECS);
        assert_eq!(e.marketplace_term, "Ventilador de parede 60 cm");
    }

    #[test]
    fn fallback_reads_quoted_phrases() {
        let e = fallback_extraction(r#"Cabo de rede "categoria 6" azul"#);
        assert!(e.spec_texts().contains(&"categoria 6".to_string()));
    }

    #[test]
    fn fallback_is_deterministic() {
        let d = "Bomba d'água 1,5 cv com vazão de 3000 litros/hora";
        assert_eq!(fallback_extraction(d), fallback_extraction(d));
    }

    #[test]
    fn truncated_abbreviation_is_expanded() {
        let spec = anchor_spec(KillSpec::new("72 m"), "Sirene com 72 músicas").unwrap();
        assert_eq!(spec.text, "72 músicas");
    }

    #[test]
    fn real_abbreviation_is_kept() {
        let spec = anchor_spec(KillSpec::new("30 W"), "Amplificador 30 W RMS").unwrap();
        assert_eq!(spec.text, "30 W");
    }

    #[test]
    fn unanchored_abbreviation_is_dropped() {
        assert!(anchor_spec(KillSpec::new("72 m"), "Sirene com 72 toques").is_none());
        assert!(anchor_spec(KillSpec::new("40 cm"), "Mesa sem medida").is_none());
    }

    #[test]
    fn specs_without_abbreviations_pass() {
        let spec = anchor_spec(KillSpec::weighted("72 músicas", 0.9), "qualquer").unwrap();
        assert_eq!(spec.text, "72 músicas");
        assert!(spec.is_critical());
    }

    #[test]
    fn complexity_keywords() {
        assert_eq!(classify_complexity("Caneta esferográfica azul", Complexity::High), Complexity::Low);
        assert_eq!(classify_complexity("Sirene escolar digital", Complexity::Low), Complexity::High);
        assert_eq!(classify_complexity("Cadeira fixa", Complexity::Low), Complexity::Low);
        assert_eq!(classify_complexity("Cadeira fixa", Complexity::High), Complexity::High);
    }

    #[test]
    fn relaxation_ladder() {
        let specs = vec![
            KillSpec::new("72 músicas"),
            KillSpec::new("potência 30 W"),
            KillSpec::new("controle remoto"),
        ];
        let l1 = relax_specs(&specs, 1);
        assert_eq!(l1[0].text, "músicas");
        assert_eq!(l1.len(), 3);
        assert_eq!(l1[1].text, "potência");
        let l2 = relax_specs(&specs, 2);
        assert_eq!(l2.len(), 2);
        assert_eq!(relax_specs(&specs, 0), specs);
    }

    #[test]
    fn relaxation_drops_bare_units() {
        let specs = vec![
            KillSpec::new("60 cm"),
            KillSpec::new("30 W"),
            KillSpec::new("220 V"),
            KillSpec::new("1,5 kg de capacidade"),
            KillSpec::new("tela de 15,6 polegadas"),
        ];
        let relaxed: Vec<String> = relax_specs(&specs, 1).into_iter().map(|s| s.text).collect();
        assert_eq!(relaxed, ["capacidade", "tela"]);
        assert!(relaxed.iter().all(|t| t.chars().count() > 2));
    }

    #[tokio::test]
    async fn model_reply_is_validated() {
        let provider = ScriptedCompletion::new().reply(
            "spec_extraction",
            r#"```json
{"kill_specs": ["72 m", "relógio programável", "9 z"],
 "critical_specs": [{"text": "72 m", "weight": 0.95}],
 "marketplace_term": "sirene escolar",
 "search_anchor": "alarme para colégio",
 "max_price_estimate": "450,00",
 "complexity": "LOW"}
```"#,
        );
        let e = extract_specs(
            &provider,
            &NoopTracer,
            &item("Sirene escolar com 72 músicas e relógio programável"),
        )
        .await;
        assert_eq!(e.spec_texts(), vec!["72 músicas", "relógio programável"]);
        assert!(e.kill_specs[0].is_critical());
        assert_eq!(e.critical_specs[0].text, "72 músicas");
        assert_eq!(e.max_price_estimate, Some(450.0));
        assert_eq!(e.complexity, Complexity::High);
        assert_eq!(e.source, "scripted");
        assert!(e.search_anchor.is_none());
    }

    #[tokio::test]
    async fn provider_failure_uses_fallback() {
        let e = extract_specs(
            &ScriptedCompletion::new(),
            &NoopTracer,
            &item("Sirene escolar com 72 músicas pré-gravadas"),
        )
        .await;
        assert_eq!(e.source, "fallback");
        assert_eq!(e.complexity, Complexity::High);
    }
}
