//! Web search providers.
//!
//! [`SerperSearch`] is the keyed primary; [`DuckDuckGoSearch`] scrapes the
//! keyless HTML endpoint. [`FallbackSearch`] tries the primary first and
//! falls back when it is unconfigured or fails.

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};
use url::Url;

use tenderscout_shared::{Credential, Result, SearchConfig, TenderScoutError};

use crate::{http_client, preview};

/// One organic search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub snippet: String,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Short provider name for logs and traces.
    fn name(&self) -> &str;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;
}

// ---------------------------------------------------------------------------
// Serper
// ---------------------------------------------------------------------------

pub struct SerperSearch {
    client: Client,
    base_url: String,
    credential: Credential,
}

impl SerperSearch {
    pub fn new(client: Client, base_url: &str, credential: Credential) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.credential.resolve().is_some()
    }
}

#[derive(Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperOrganic>,
}

#[derive(Deserialize)]
struct SerperOrganic {
    #[serde(default)]
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
}

#[async_trait]
impl WebSearch for SerperSearch {
    fn name(&self) -> &str {
        "serper"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let key = self
            .credential
            .resolve()
            .ok_or_else(|| TenderScoutError::provider("serper", "no API key configured"))?;

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .header("X-API-KEY", key)
            .json(&json!({ "q": query, "gl": "br", "hl": "pt-br", "num": limit }))
            .send()
            .await
            .map_err(|e| TenderScoutError::provider("serper", format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TenderScoutError::provider("serper", format!("body read failed: {e}")))?;
        if !status.is_success() {
            return Err(TenderScoutError::provider(
                "serper",
                format!("HTTP {status}: {}", preview(&body, 200)),
            ));
        }

        let parsed: SerperResponse = serde_json::from_str(&body)
            .map_err(|e| TenderScoutError::provider("serper", format!("invalid response: {e}")))?;

        Ok(parsed
            .organic
            .into_iter()
            .take(limit)
            .map(|o| SearchHit {
                title: o.title,
                link: o.link,
                snippet: o.snippet,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// DuckDuckGo HTML
// ---------------------------------------------------------------------------

pub struct DuckDuckGoSearch {
    client: Client,
    base_url: String,
}

impl DuckDuckGoSearch {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl WebSearch for DuckDuckGoSearch {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let response = self
            .client
            .get(format!("{}/html/", self.base_url))
            .query(&[("q", query), ("kl", "br-pt")])
            .send()
            .await
            .map_err(|e| TenderScoutError::provider("duckduckgo", format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TenderScoutError::provider(
                "duckduckgo",
                format!("HTTP {status}"),
            ));
        }

        let body = response.text().await.map_err(|e| {
            TenderScoutError::provider("duckduckgo", format!("body read failed: {e}"))
        })?;

        Ok(parse_duckduckgo_html(&body, limit))
    }
}

/// Extract organic results from a DuckDuckGo HTML results page. Ads are skipped.
pub(crate) fn parse_duckduckgo_html(html: &str, limit: usize) -> Vec<SearchHit> {
    let doc = Html::parse_document(html);
    let (Ok(result_sel), Ok(title_sel), Ok(snippet_sel)) = (
        Selector::parse(".result"),
        Selector::parse("a.result__a"),
        Selector::parse(".result__snippet"),
    ) else {
        return Vec::new();
    };

    let mut hits = Vec::new();
    for result in doc.select(&result_sel) {
        if result.value().classes().any(|c| c == "result--ad") {
            continue;
        }
        let Some(anchor) = result.select(&title_sel).next() else {
            continue;
        };
        let Some(link) = anchor.value().attr("href").and_then(decode_redirect) else {
            continue;
        };
        let title = anchor.text().collect::<String>().trim().to_string();
        let snippet = result
            .select(&snippet_sel)
            .next()
            .map(|s| s.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        hits.push(SearchHit {
            title,
            link,
            snippet,
        });
        if hits.len() >= limit {
            break;
        }
    }
    hits
}

/// Resolve DuckDuckGo's `/l/?uddg=<target>` redirect to the target URL.
fn decode_redirect(href: &str) -> Option<String> {
    let base = Url::parse("https://duckduckgo.com/").ok()?;
    let url = base.join(href).ok()?;

    if url.path().starts_with("/l/") {
        return url
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned());
    }
    match url.scheme() {
        "http" | "https" => Some(url.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Fallback composition
// ---------------------------------------------------------------------------

pub struct FallbackSearch {
    primary: Option<Box<dyn WebSearch>>,
    fallback: Box<dyn WebSearch>,
}

impl FallbackSearch {
    pub fn new(primary: Option<Box<dyn WebSearch>>, fallback: Box<dyn WebSearch>) -> Self {
        Self { primary, fallback }
    }

    /// Serper when its key resolves, DuckDuckGo always.
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let client = http_client(config.timeout_secs)?;
        let serper = SerperSearch::new(
            client.clone(),
            &config.serper_url,
            Credential::Env(config.serper_api_key_env.clone()),
        );
        let primary: Option<Box<dyn WebSearch>> = if serper.is_configured() {
            Some(Box::new(serper))
        } else {
            debug!("serper key not set, using keyless search only");
            None
        };
        Ok(Self::new(
            primary,
            Box::new(DuckDuckGoSearch::new(client, &config.duckduckgo_url)),
        ))
    }
}

#[async_trait]
impl WebSearch for FallbackSearch {
    fn name(&self) -> &str {
        self.primary
            .as_ref()
            .map_or_else(|| self.fallback.name(), |p| p.name())
    }

    #[instrument(skip_all, fields(query = %query))]
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        if let Some(primary) = &self.primary {
            match primary.search(query, limit).await {
                Ok(hits) => return Ok(hits),
                Err(e) => {
                    warn!(provider = primary.name(), error = %e, "primary search failed, falling back");
                }
            }
        }
        self.fallback.search(query, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DDG_PAGE: &str = r#"<html><body>
        <div class="result results_links result--ad">
            <a class="result__a" href="https://ads.example/x">Sponsored</a>
        </div>
        <div class="result results_links">
            <h2 class="result__title">
                <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Facme.example%2Fse-72&amp;rut=abc">Acme SE-72 Sirene</a>
            </h2>
            <a class="result__snippet">Sirene escolar com 72 músicas.</a>
        </div>
        <div class="result results_links">
            <a class="result__a" href="https://direct.example/page">Direct</a>
        </div>
    </body></html>"#;

    #[test]
    fn parses_duckduckgo_results() {
        let hits = parse_duckduckgo_html(DDG_PAGE, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Acme SE-72 Sirene");
        assert_eq!(hits[0].link, "https://acme.example/se-72");
        assert_eq!(hits[0].snippet, "Sirene escolar com 72 músicas.");
        assert_eq!(hits[1].link, "https://direct.example/page");
    }

    #[test]
    fn duckduckgo_respects_limit() {
        assert_eq!(parse_duckduckgo_html(DDG_PAGE, 1).len(), 1);
    }

    #[tokio::test]
    async fn serper_posts_query_with_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("X-API-KEY", "serper-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "organic": [
                    {"title": "Datasheet", "link": "https://acme.example/ds.pdf", "snippet": "72 músicas"},
                    {"title": "Loja", "link": "https://shop.example/p"}
                ]
            })))
            .mount(&server)
            .await;

        let serper = SerperSearch::new(
            Client::new(),
            &server.uri(),
            Credential::Inline("serper-key".into()),
        );
        let hits = serper.search("sirene escolar", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].link, "https://acme.example/ds.pdf");
        assert_eq!(hits[1].snippet, "");
    }

    #[tokio::test]
    async fn fallback_used_when_primary_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/html/"))
            .and(query_param("q", "sirene escolar"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DDG_PAGE))
            .mount(&server)
            .await;

        let search = FallbackSearch::new(
            Some(Box::new(SerperSearch::new(
                Client::new(),
                &server.uri(),
                Credential::Inline("k".into()),
            ))),
            Box::new(DuckDuckGoSearch::new(Client::new(), &server.uri())),
        );

        let hits = search.search("sirene escolar", 5).await.unwrap();
        assert_eq!(hits[0].link, "https://acme.example/se-72");
    }

    #[tokio::test]
    async fn unconfigured_primary_goes_straight_to_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/html/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DDG_PAGE))
            .expect(1)
            .mount(&server)
            .await;

        let config = SearchConfig {
            serper_url: server.uri(),
            serper_api_key_env: "TS_TEST_NONEXISTENT_SERPER_KEY".into(),
            duckduckgo_url: server.uri(),
            timeout_secs: 5,
        };
        let search = FallbackSearch::from_config(&config).unwrap();
        assert_eq!(search.name(), "duckduckgo");
        let hits = search.search("x", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
    }
}
