//! Application configuration for TenderScout.
//!
//! User config lives at `~/.tenderscout/tenderscout.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TenderScoutError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "tenderscout.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".tenderscout";

// ---------------------------------------------------------------------------
// Config structs (matching tenderscout.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Completion providers, in priority order.
    #[serde(default = "default_completion_providers")]
    pub completion: Vec<ProviderEntry>,

    /// Knowledge-source providers used by enrichment, in priority order.
    #[serde(default = "default_knowledge_providers")]
    pub knowledge: Vec<ProviderEntry>,

    /// Web search settings.
    #[serde(default)]
    pub search: SearchConfig,

    /// Readable content fetch settings.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Marketplace scraper bridge settings.
    #[serde(default)]
    pub scraper: ScraperConfig,

    /// Loop bounds and scoring thresholds.
    #[serde(default)]
    pub limits: PipelineLimits,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            completion: default_completion_providers(),
            knowledge: default_knowledge_providers(),
            search: SearchConfig::default(),
            fetch: FetchConfig::default(),
            scraper: ScraperConfig::default(),
            limits: PipelineLimits::default(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Number of items processed side by side within one job.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Path of the libSQL database (identity cache + run history).
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Freshness window for cached identities, in days.
    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: u32,

    /// Destination postal code used when quoting shipping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            database_path: default_database_path(),
            cache_ttl_days: default_cache_ttl_days(),
            destination: None,
        }
    }
}

fn default_concurrency() -> usize {
    12
}
fn default_database_path() -> String {
    "~/.tenderscout/tenderscout.db".into()
}
fn default_cache_ttl_days() -> u32 {
    30
}

/// Wire dialect spoken by a completion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderApi {
    /// `POST {base_url}/chat/completions` (OpenAI, OpenRouter, Groq, Perplexity, ...).
    Openai,
    /// `POST {base_url}/v1/messages`.
    Anthropic,
}

/// `[[completion]]` / `[[knowledge]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Display name, reported back in traces.
    pub name: String,
    /// Wire dialect.
    pub api: ProviderApi,
    /// Endpoint root, without trailing slash.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Name of the env var holding the API key (never store the key itself).
    pub api_key_env: String,
}

fn default_completion_providers() -> Vec<ProviderEntry> {
    vec![
        ProviderEntry {
            name: "openrouter".into(),
            api: ProviderApi::Openai,
            base_url: "https://openrouter.ai/api/v1".into(),
            model: "openai/gpt-4o-mini".into(),
            api_key_env: "OPENROUTER_API_KEY".into(),
        },
        ProviderEntry {
            name: "anthropic".into(),
            api: ProviderApi::Anthropic,
            base_url: "https://api.anthropic.com".into(),
            model: "claude-3-5-haiku-latest".into(),
            api_key_env: "ANTHROPIC_API_KEY".into(),
        },
    ]
}

fn default_knowledge_providers() -> Vec<ProviderEntry> {
    vec![ProviderEntry {
        name: "perplexity".into(),
        api: ProviderApi::Openai,
        base_url: "https://api.perplexity.ai".into(),
        model: "sonar".into(),
        api_key_env: "PERPLEXITY_API_KEY".into(),
    }]
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Serper.dev endpoint (primary, keyed).
    #[serde(default = "default_serper_url")]
    pub serper_url: String,

    /// Env var holding the Serper key. Primary search is skipped when unset.
    #[serde(default = "default_serper_key_env")]
    pub serper_api_key_env: String,

    /// DuckDuckGo HTML endpoint (fallback, no key).
    #[serde(default = "default_duckduckgo_url")]
    pub duckduckgo_url: String,

    /// Per-request timeout.
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            serper_url: default_serper_url(),
            serper_api_key_env: default_serper_key_env(),
            duckduckgo_url: default_duckduckgo_url(),
            timeout_secs: default_search_timeout(),
        }
    }
}

fn default_serper_url() -> String {
    "https://google.serper.dev".into()
}
fn default_serper_key_env() -> String {
    "SERPER_API_KEY".into()
}
fn default_duckduckgo_url() -> String {
    "https://html.duckduckgo.com".into()
}
fn default_search_timeout() -> u64 {
    15
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Readable text is truncated to this many characters.
    #[serde(default = "default_fetch_max_chars")]
    pub max_chars: usize,

    /// Per-request timeout.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_chars: default_fetch_max_chars(),
            timeout_secs: default_fetch_timeout(),
        }
    }
}

fn default_fetch_max_chars() -> usize {
    15_000
}
fn default_fetch_timeout() -> u64 {
    20
}

/// `[scraper]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Bridge command (e.g., "node").
    #[serde(default = "default_bridge_cmd")]
    pub bridge_cmd: String,

    /// Bridge script path.
    #[serde(default = "default_bridge_script")]
    pub bridge_script: String,

    /// Working directory for the bridge subprocess.
    #[serde(default = "default_bridge_working_dir")]
    pub working_dir: String,

    /// Seconds to wait for the reply to one bridge request.
    #[serde(default = "default_bridge_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            bridge_cmd: default_bridge_cmd(),
            bridge_script: default_bridge_script(),
            working_dir: default_bridge_working_dir(),
            request_timeout_secs: default_bridge_timeout(),
        }
    }
}

fn default_bridge_cmd() -> String {
    "node".into()
}
fn default_bridge_script() -> String {
    "scraper/bridge.js".into()
}
fn default_bridge_working_dir() -> String {
    ".".into()
}
fn default_bridge_timeout() -> u64 {
    90
}

/// `[limits]` section: every loop bound and scoring threshold of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineLimits {
    /// Highest Scout relaxation level.
    pub max_relaxation: u8,
    /// Validator → Scout retries.
    pub max_validation_retries: u8,
    /// Assessor → Searcher retries.
    pub max_elastic_retries: u8,
    /// The Searcher stops trying strategies once this many listings are found.
    pub min_candidates: usize,
    /// Below this many promising listings the Assessor asks for another pass.
    pub min_promising: usize,
    /// Alternative queries generated per elastic retry.
    pub elastic_queries: usize,
    /// Knowledge-source calls per item.
    pub max_enrichment_calls: usize,
    /// AI judge calls per item; the rest use the deterministic matcher.
    pub max_judge_calls: usize,
    /// Listing details fetched per search pass.
    pub max_detail_fetches: usize,
    /// Web search queries per Scout round.
    pub scout_queries: usize,
    /// Pages fetched per Scout round.
    pub scout_pages: usize,
    /// Discovered identities below this confidence are discarded.
    pub min_entity_confidence: f64,
    /// Listings priced below this fraction of the tender price are rejected.
    pub price_floor_ratio: f64,
    /// Lower bound of the promising price band, as a fraction of budget.
    pub promising_min_ratio: f64,
    /// Upper bound of the promising price band, as a fraction of budget.
    pub promising_max_ratio: f64,
    /// Share of kill-specs a listing must prove on its own to skip enrichment.
    pub enrichment_coverage: f64,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            max_relaxation: 3,
            max_validation_retries: 2,
            max_elastic_retries: 3,
            min_candidates: 3,
            min_promising: 2,
            elastic_queries: 2,
            max_enrichment_calls: 5,
            max_judge_calls: 15,
            max_detail_fetches: 10,
            scout_queries: 3,
            scout_pages: 5,
            min_entity_confidence: 0.5,
            price_floor_ratio: 0.15,
            promising_min_ratio: 0.10,
            promising_max_ratio: 1.50,
            enrichment_coverage: 0.70,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider descriptors (runtime, resolved from config or supplied by caller)
// ---------------------------------------------------------------------------

/// How a provider's API key is obtained.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Read from the named environment variable at call time.
    Env(String),
    /// Supplied directly by the caller (e.g. a per-user key).
    Inline(String),
    /// The endpoint needs no key.
    None,
}

impl Credential {
    /// Resolve to a usable key. Keyless endpoints resolve to an empty string;
    /// a missing or empty key resolves to `None`.
    pub fn resolve(&self) -> Option<String> {
        match self {
            Self::Env(var) => std::env::var(var).ok().filter(|v| !v.is_empty()),
            Self::Inline(key) if !key.is_empty() => Some(key.clone()),
            Self::Inline(_) => None,
            Self::None => Some(String::new()),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env(var) => write!(f, "Env({var})"),
            Self::Inline(_) => write!(f, "Inline(<redacted>)"),
            Self::None => write!(f, "None"),
        }
    }
}

/// One entry of an ordered provider chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub name: String,
    pub api: ProviderApi,
    pub base_url: String,
    pub model: String,
    pub credential: Credential,
}

impl From<&ProviderEntry> for ProviderDescriptor {
    fn from(entry: &ProviderEntry) -> Self {
        Self {
            name: entry.name.clone(),
            api: entry.api,
            base_url: entry.base_url.trim_end_matches('/').to_string(),
            model: entry.model.clone(),
            credential: Credential::Env(entry.api_key_env.clone()),
        }
    }
}

/// Caller-supplied provider configuration for one job. When present it
/// replaces the chains from the config file.
#[derive(Debug, Clone, Default)]
pub struct ProviderSet {
    pub completion: Vec<ProviderDescriptor>,
    pub knowledge: Vec<ProviderDescriptor>,
}

impl From<&AppConfig> for ProviderSet {
    fn from(config: &AppConfig) -> Self {
        Self {
            completion: config.completion.iter().map(ProviderDescriptor::from).collect(),
            knowledge: config.knowledge.iter().map(ProviderDescriptor::from).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.tenderscout/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| TenderScoutError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.tenderscout/tenderscout.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TenderScoutError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        TenderScoutError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TenderScoutError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| TenderScoutError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TenderScoutError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Check that at least one completion provider has a key available.
///
/// The pipeline still runs without one (every agent has a deterministic
/// fallback), so callers treat this as a warning.
pub fn validate_api_keys(config: &AppConfig) -> Result<()> {
    let any = config
        .completion
        .iter()
        .any(|p| Credential::Env(p.api_key_env.clone()).resolve().is_some());
    if any {
        return Ok(());
    }

    let vars: Vec<&str> = config
        .completion
        .iter()
        .map(|p| p.api_key_env.as_str())
        .collect();
    Err(TenderScoutError::config(format!(
        "no completion provider API key found. Set one of: {}",
        vars.join(", ")
    )))
}
