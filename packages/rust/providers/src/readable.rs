//! HTML-to-readable-text conversion for product and datasheet pages.
//!
//! The main content container is located, spec tables are flattened into
//! one line per row, the HTML is converted with `htmd`, and a series of cleanup
//! passes strips links, images, and stray markup.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, instrument};

use tenderscout_shared::{Result, TenderScoutError};

/// Tags whose content never carries product information.
const SKIP_TAGS: [&str; 11] = [
    "script", "style", "nav", "header", "footer", "aside", "iframe", "noscript", "svg", "form",
    "button",
];

/// Content containers in priority order.
const CONTENT_SELECTORS: [&str; 10] = [
    "[itemtype*=\"schema.org/Product\"]",
    "#product-detail",
    ".product-detail",
    ".product-details",
    "#product",
    ".product",
    "[role=\"main\"]",
    "main",
    "article",
    ".content",
];

/// Convert an HTML page to readable text.
#[instrument(skip_all, fields(html_len = html.len()))]
pub fn html_to_text(html: &str) -> Result<String> {
    let content_html = extract_content_html(html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();

    let raw = converter
        .convert(&content_html)
        .map_err(|e| TenderScoutError::parse(format!("htmd conversion failed: {e}")))?;

    let text = run_cleanup(&raw);
    debug!(text_len = text.len(), "readable text extracted");
    Ok(text)
}

// ---------------------------------------------------------------------------
// Content location
// ---------------------------------------------------------------------------

/// Elements serialized without a closing tag.
const VOID_TAGS: [&str; 8] = ["br", "hr", "img", "input", "meta", "link", "source", "wbr"];

/// Inner HTML of the main content container, with tables already flattened.
fn extract_content_html(html: &str) -> String {
    let doc = Html::parse_document(html);

    for sel_str in &CONTENT_SELECTORS {
        if let Ok(selector) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&selector).next() {
                if !el.text().collect::<String>().trim().is_empty() {
                    return flatten_tables(el);
                }
            }
        }
    }

    if let Ok(body_sel) = Selector::parse("body") {
        if let Some(body) = doc.select(&body_sel).next() {
            return flatten_tables(body);
        }
    }

    html.to_string()
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Re-serialize `root`'s children, replacing each `<table>` with one line
/// per row.
///
/// Spec sheets are mostly two-column tables; one row per line keeps each
/// property next to its value.
fn flatten_tables(root: ElementRef) -> String {
    let mut out = String::new();
    serialize_children(root, &mut out);
    out
}

fn serialize_children(el: ElementRef, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(&html_escape(text)),
            Node::Element(element) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = element.name();
                if name == "table" {
                    let rows = table_rows(&child_el);
                    if !rows.is_empty() {
                        out.push_str("<p>");
                        out.push_str(&rows.join("<br>"));
                        out.push_str("</p>");
                    }
                    continue;
                }

                out.push('<');
                out.push_str(name);
                for (key, value) in element.attrs() {
                    out.push_str(&format!(" {key}=\"{}\"", value.replace('"', "&quot;")));
                }
                out.push('>');
                if VOID_TAGS.contains(&name) {
                    continue;
                }
                serialize_children(child_el, out);
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
            _ => {}
        }
    }
}

/// `"property: value"` for two-cell rows, `" | "`-joined cells otherwise.
fn table_rows(table: &ElementRef) -> Vec<String> {
    let (Ok(tr_sel), Ok(cell_sel)) = (Selector::parse("tr"), Selector::parse("th, td")) else {
        return Vec::new();
    };

    table
        .select(&tr_sel)
        .filter_map(|tr| {
            let cells: Vec<String> = tr
                .select(&cell_sel)
                .map(|c| collapse_spaces(&c.text().collect::<String>()))
                .filter(|c| !c.is_empty())
                .collect();
            match cells.len() {
                0 => None,
                2 => Some(html_escape(&format!("{}: {}", cells[0], cells[1]))),
                _ => Some(html_escape(&cells.join(" | "))),
            }
        })
        .collect()
}

fn collapse_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

// ---------------------------------------------------------------------------
// Cleanup passes
// ---------------------------------------------------------------------------

fn run_cleanup(md: &str) -> String {
    let mut result = strip_images(md);
    result = flatten_links(&result);
    result = strip_emphasis(&result);
    result = strip_leftover_html(&result);
    result = normalize_whitespace(&result);
    result = clean_blank_lines(&result);
    result.trim().to_string()
}

fn strip_images(md: &str) -> String {
    static IMG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("valid regex"));
    IMG_RE.replace_all(md, "").to_string()
}

/// `[text](url)` → `text`.
fn flatten_links(md: &str) -> String {
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("valid regex"));
    LINK_RE.replace_all(md, "$1").to_string()
}

fn strip_emphasis(md: &str) -> String {
    static EMPH_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*|__([^_]+)__").expect("valid regex"));
    EMPH_RE.replace_all(md, "$1$2").to_string()
}

fn strip_leftover_html(md: &str) -> String {
    static TAG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").expect("valid regex"));
    TAG_RE.replace_all(md, "").to_string()
}

fn normalize_whitespace(md: &str) -> String {
    md.lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapse runs of blank lines into one.
fn clean_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
    MULTI_BLANK_RE.replace_all(md, "\n\n").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_chrome_and_keeps_content() {
        let html = r#"<html><body>
            <header><a href="/">Loja</a></header>
            <nav><a href="/cat">Categorias</a></nav>
            <main><h1>Sirene Escolar SE-72</h1><p>Possui <strong>72 músicas</strong> pré-gravadas.</p></main>
            <footer><p>Copyright 2024</p></footer>
        </body></html>"#;

        let text = html_to_text(html).unwrap();
        assert!(text.contains("Sirene Escolar SE-72"));
        assert!(text.contains("72 músicas"));
        assert!(!text.contains("Copyright"));
        assert!(!text.contains("Categorias"));
    }

    #[test]
    fn prefers_product_container() {
        let html = r#"<html><body>
            <div class="sidebar">Ofertas relacionadas</div>
            <div class="product-detail"><h2>Ficha técnica</h2><p>Tensão: 220 V</p></div>
        </body></html>"#;

        let text = html_to_text(html).unwrap();
        assert!(text.contains("Tensão: 220 V"));
        assert!(!text.contains("Ofertas relacionadas"));
    }

    #[test]
    fn spec_tables_become_property_lines() {
        let html = r#"<html><body><main>
            <table>
                <tr><th>Característica</th><th>Valor</th></tr>
                <tr><td>Músicas</td><td>72</td></tr>
                <tr><td>Potência</td><td>  30 W </td></tr>
            </table>
        </main></body></html>"#;

        let text = html_to_text(html).unwrap();
        assert!(text.contains("Músicas: 72"), "got: {text}");
        assert!(text.contains("Potência: 30 W"), "got: {text}");
    }

    #[test]
    fn links_and_images_are_flattened() {
        let html = r#"<html><body><main>
            <p>Veja o <a href="https://acme.example/manual.pdf">manual</a>.</p>
            <img src="/foto.jpg" alt="foto">
        </main></body></html>"#;

        let text = html_to_text(html).unwrap();
        assert!(text.contains("Veja o manual."));
        assert!(!text.contains("https://"));
        assert!(!text.contains("foto.jpg"));
    }

    #[test]
    fn empty_page_yields_empty_text() {
        let text = html_to_text("<html><body></body></html>").unwrap();
        assert!(text.is_empty());
    }
}
