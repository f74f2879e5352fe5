//! Chat-completion provider chain.
//!
//! Descriptors are tried in priority order. A descriptor whose key cannot be
//! resolved is skipped; a descriptor whose call fails hands over to the next
//! one. The returned [`Completion`] names the descriptor that served it.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use tenderscout_shared::{ProviderApi, ProviderDescriptor, Result, TenderScoutError};

use crate::{http_client, preview};

const ANTHROPIC_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One completion call, tagged with the agent task that issued it.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Agent task tag (e.g. `spec_extraction`), used for tracing and test doubles.
    pub task: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    /// A system + user prompt pair with deterministic sampling.
    pub fn new(task: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            max_tokens: 1024,
            temperature: 0.0,
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Concatenated user content, for tracing.
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Text returned by a provider, attributed to the descriptor that served it.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub provider: String,
    pub model: String,
}

/// A source of chat completions.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

// ---------------------------------------------------------------------------
// Provider chain
// ---------------------------------------------------------------------------

/// Ordered list of HTTP completion endpoints.
pub struct ProviderChain {
    client: Client,
    providers: Vec<ProviderDescriptor>,
}

impl ProviderChain {
    pub fn new(providers: Vec<ProviderDescriptor>, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            providers,
        })
    }

    /// Whether any descriptor currently resolves a key.
    pub fn has_available(&self) -> bool {
        self.providers.iter().any(|p| p.credential.resolve().is_some())
    }

    async fn call(
        &self,
        provider: &ProviderDescriptor,
        key: &str,
        request: &CompletionRequest,
    ) -> Result<String> {
        match provider.api {
            ProviderApi::Openai => self.call_openai(provider, key, request).await,
            ProviderApi::Anthropic => self.call_anthropic(provider, key, request).await,
        }
    }

    async fn call_openai(
        &self,
        provider: &ProviderDescriptor,
        key: &str,
        request: &CompletionRequest,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", provider.base_url);
        let body = json!({
            "model": provider.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let mut builder = self.client.post(&url).json(&body);
        if !key.is_empty() {
            builder = builder.bearer_auth(key);
        }

        let response: OpenAiResponse = send_json(&provider.name, builder).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TenderScoutError::provider(&provider.name, "response has no choices"))
    }

    async fn call_anthropic(
        &self,
        provider: &ProviderDescriptor,
        key: &str,
        request: &CompletionRequest,
    ) -> Result<String> {
        let url = format!("{}/v1/messages", provider.base_url);

        let system = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let messages: Vec<&ChatMessage> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();

        let mut body = json!({
            "model": provider.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }

        let builder = self
            .client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

        let response: AnthropicResponse = send_json(&provider.name, builder).await?;
        let text: String = response
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(TenderScoutError::provider(
                &provider.name,
                "response has no text content",
            ));
        }
        Ok(text)
    }
}

#[async_trait]
impl CompletionProvider for ProviderChain {
    #[instrument(skip_all, fields(task = %request.task))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let mut last_error = None;

        for provider in &self.providers {
            let Some(key) = provider.credential.resolve() else {
                debug!(provider = %provider.name, "no credential, skipping provider");
                continue;
            };

            match self.call(provider, &key, request).await {
                Ok(text) if !text.trim().is_empty() => {
                    debug!(provider = %provider.name, model = %provider.model, "completion served");
                    return Ok(Completion {
                        text,
                        provider: provider.name.clone(),
                        model: provider.model.clone(),
                    });
                }
                Ok(_) => {
                    warn!(provider = %provider.name, "empty completion, trying next provider");
                    last_error = Some(TenderScoutError::provider(
                        &provider.name,
                        "empty completion",
                    ));
                }
                Err(e) => {
                    warn!(provider = %provider.name, error = %e, "completion failed, trying next provider");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TenderScoutError::provider("chain", "no completion provider has a credential")
        }))
    }
}

/// Send a request and decode a JSON body, mapping failures to provider errors.
async fn send_json<T: serde::de::DeserializeOwned>(
    provider: &str,
    builder: reqwest::RequestBuilder,
) -> Result<T> {
    let response = builder
        .send()
        .await
        .map_err(|e| TenderScoutError::provider(provider, format!("request failed: {e}")))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| TenderScoutError::provider(provider, format!("body read failed: {e}")))?;

    if !status.is_success() {
        return Err(TenderScoutError::provider(
            provider,
            format!("HTTP {status}: {}", preview(&text, 200)),
        ));
    }

    serde_json::from_str(&text).map_err(|e| {
        TenderScoutError::provider(
            provider,
            format!("invalid response: {e} (got: {})", preview(&text, 200)),
        )
    })
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenderscout_shared::Credential;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor(name: &str, api: ProviderApi, base_url: &str, credential: Credential) -> ProviderDescriptor {
        ProviderDescriptor {
            name: name.into(),
            api,
            base_url: base_url.into(),
            model: format!("{name}-model"),
            credential,
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("spec_extraction", "You extract specs.", "Sirene escolar")
    }

    #[tokio::test]
    async fn openai_dialect_with_bearer_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "primary-model"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"ok\":true}"}}]
            })))
            .mount(&server)
            .await;

        let chain = ProviderChain::new(
            vec![descriptor(
                "primary",
                ProviderApi::Openai,
                &server.uri(),
                Credential::Inline("sk-test".into()),
            )],
            5,
        )
        .unwrap();

        let completion = chain.complete(&request()).await.unwrap();
        assert_eq!(completion.text, "{\"ok\":true}");
        assert_eq!(completion.provider, "primary");
        assert_eq!(completion.model, "primary-model");
    }

    #[tokio::test]
    async fn falls_back_to_next_provider_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ak-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({"system": "You extract specs."})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "from anthropic"}]
            })))
            .mount(&server)
            .await;

        let chain = ProviderChain::new(
            vec![
                descriptor("openrouter", ProviderApi::Openai, &server.uri(), Credential::Inline("k".into())),
                descriptor("anthropic", ProviderApi::Anthropic, &server.uri(), Credential::Inline("ak-test".into())),
            ],
            5,
        )
        .unwrap();

        let completion = chain.complete(&request()).await.unwrap();
        assert_eq!(completion.text, "from anthropic");
        assert_eq!(completion.provider, "anthropic");
    }

    #[tokio::test]
    async fn skips_providers_without_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "second"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let chain = ProviderChain::new(
            vec![
                descriptor(
                    "missing",
                    ProviderApi::Openai,
                    &server.uri(),
                    Credential::Env("TS_TEST_NONEXISTENT_COMPLETION_KEY".into()),
                ),
                descriptor("local", ProviderApi::Openai, &server.uri(), Credential::None),
            ],
            5,
        )
        .unwrap();

        let completion = chain.complete(&request()).await.unwrap();
        assert_eq!(completion.provider, "local");
    }

    #[tokio::test]
    async fn exhausted_chain_reports_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let chain = ProviderChain::new(
            vec![descriptor("only", ProviderApi::Openai, &server.uri(), Credential::Inline("k".into()))],
            5,
        )
        .unwrap();

        let err = chain.complete(&request()).await.unwrap_err();
        assert!(err.to_string().contains("429"), "got: {err}");
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn empty_chain_is_an_error() {
        let chain = ProviderChain::new(vec![], 5).unwrap();
        assert!(!chain.has_available());
        let err = chain.complete(&request()).await.unwrap_err();
        assert!(err.to_string().contains("no completion provider"));
    }

    #[test]
    fn user_text_skips_system_prompt() {
        let req = request();
        assert_eq!(req.user_text(), "Sirene escolar");
    }
}
