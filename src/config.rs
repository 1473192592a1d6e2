//! Application configuration loading and validation.
//!
//! Reads `toolrelay.yaml` and resolves environment variables. The parsed
//! `AppConfig` is immutable after startup: server URLs, retry policies,
//! keyword tables and entity registries all come from here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::registry::Entity;
use crate::agent_core::types::Domain;
use crate::inference::SamplingParams;
use crate::transport::RetryPolicy;

/// Built-in configuration, used when no file is found on disk.
const BUILTIN_CONFIG: &str = include_str!("../config/toolrelay.yaml");

const CONFIG_FILE: &str = "toolrelay.yaml";
const CONFIG_ENV: &str = "TOOLRELAY_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },

    #[error("config file not found: {path}")]
    NotFound { path: PathBuf },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Where the tool server and the model server live.
#[derive(Debug, Clone, Deserialize)]
pub struct ServersConfig {
    #[serde(default = "default_tool_server_url")]
    pub tool_server_url: String,
    #[serde(default = "default_model_server_url")]
    pub model_server_url: String,
}

fn default_tool_server_url() -> String {
    "http://localhost:8001".into()
}
fn default_model_server_url() -> String {
    "http://localhost:11434/v1".into()
}

impl Default for ServersConfig {
    fn default() -> Self {
        Self {
            tool_server_url: default_tool_server_url(),
            model_server_url: default_model_server_url(),
        }
    }
}

/// Generation model and its default sampling parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub repeat_penalty: Option<f32>,
    /// Longest silence tolerated on an open generation stream.
    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,
}

fn default_model_name() -> String {
    "gemma3:12b-it-qat".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_stream_idle_timeout_ms() -> u64 {
    60_000
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: None,
            top_k: None,
            repeat_penalty: None,
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
        }
    }
}

impl ModelSettings {
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            top_k: self.top_k,
            repeat_penalty: self.repeat_penalty,
        }
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }
}

/// Retry policies: one default per server plus per-domain overrides for
/// tool calls.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub tool: RetryPolicy,
    #[serde(default)]
    pub model: RetryPolicy,
    #[serde(default)]
    pub domains: BTreeMap<Domain, RetryPolicy>,
}

impl RetryConfig {
    pub fn for_domain(&self, domain: Domain) -> &RetryPolicy {
        self.domains.get(&domain).unwrap_or(&self.tool)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Minimum confidence for a verdict to route to a tool.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Ask the model when keyword matching is inconclusive.
    #[serde(default)]
    pub model_fallback: bool,
}

fn default_threshold() -> f32 {
    0.6
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            model_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractorConfig {
    /// Time allowed for one model-assisted extraction call. Absent means
    /// model-assisted extraction is off.
    #[serde(default)]
    pub model_budget_ms: Option<u64>,
}

impl ExtractorConfig {
    pub fn model_budget(&self) -> Option<Duration> {
        self.model_budget_ms.map(Duration::from_millis)
    }
}

/// How tool output reaches the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Tool data becomes authoritative context for the model.
    #[default]
    Augment,
    /// The rendered tool result is the answer.
    Substitute,
}

/// What to do when a required argument could not be extracted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    /// Plain generation, with a note that no tool data was used.
    #[default]
    Fallback,
    /// Call the tool with the domain's `default_argument`.
    DefaultValue,
    /// Ask the caller for the missing argument.
    Clarify,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Wall-clock budget for classify + extract + tool call.
    #[serde(default = "default_tool_phase_budget_ms")]
    pub tool_phase_budget_ms: u64,
    #[serde(default)]
    pub merge_mode: MergeMode,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Upper bound on the rendered tool result injected into a prompt.
    #[serde(default = "default_render_limit")]
    pub render_limit_bytes: usize,
}

fn default_tool_phase_budget_ms() -> u64 {
    20_000
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Answer in the language of the user's question.".into()
}
fn default_render_limit() -> usize {
    4_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tool_phase_budget_ms: default_tool_phase_budget_ms(),
            merge_mode: MergeMode::default(),
            system_prompt: default_system_prompt(),
            render_limit_bytes: default_render_limit(),
        }
    }
}

impl OrchestratorConfig {
    pub fn tool_phase_budget(&self) -> Duration {
        Duration::from_millis(self.tool_phase_budget_ms)
    }
}

/// One tool domain: how to recognise it and which tool serves it.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    pub tool_name: String,
    /// Bilingual trigger phrases.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Argument name the extracted value is sent under.
    pub argument: String,
    /// Extra arguments sent with every call.
    #[serde(default)]
    pub static_arguments: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub on_unresolved: UnresolvedPolicy,
    #[serde(default)]
    pub default_argument: Option<String>,
    #[serde(default)]
    pub clarify_question: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistriesConfig {
    #[serde(default)]
    pub cities: Vec<Entity>,
    #[serde(default)]
    pub stocks: Vec<Entity>,
}

/// Top-level configuration (mirrors `toolrelay.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub servers: ServersConfig,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub domains: BTreeMap<Domain, DomainConfig>,
    #[serde(default)]
    pub registries: RegistriesConfig,
}

impl AppConfig {
    /// Parse a YAML document after environment interpolation, then validate.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        let config: AppConfig =
            serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// The configuration compiled into the binary.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml(BUILTIN_CONFIG)
    }

    pub fn domain(&self, domain: Domain) -> Option<&DomainConfig> {
        self.domains.get(&domain)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let policies = std::iter::once(("tool", &self.retry.tool))
            .chain(std::iter::once(("model", &self.retry.model)))
            .chain(self.retry.domains.iter().map(|(d, p)| (d.as_str(), p)));
        for (name, policy) in policies {
            if policy.max_attempts == 0 {
                return Err(invalid(format!("retry.{name}.max_attempts must be at least 1")));
            }
            if policy.backoff_multiplier < 1.0 {
                return Err(invalid(format!(
                    "retry.{name}.backoff_multiplier must be >= 1.0, got {}",
                    policy.backoff_multiplier
                )));
            }
            if policy.per_attempt_timeout.is_zero() {
                return Err(invalid(format!("retry.{name}.per_attempt_timeout_ms must be positive")));
            }
        }

        if !(0.0..=1.0).contains(&self.classifier.threshold) {
            return Err(invalid(format!(
                "classifier.threshold must be within 0..=1, got {}",
                self.classifier.threshold
            )));
        }

        if self.domains.is_empty() {
            return Err(invalid("at least one domain must be configured".into()));
        }
        for (domain, cfg) in &self.domains {
            if cfg.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(invalid(format!("domain '{domain}' has no keywords")));
            }
            if cfg.tool_name.trim().is_empty() {
                return Err(invalid(format!("domain '{domain}' has no tool_name")));
            }
            if cfg.on_unresolved == UnresolvedPolicy::DefaultValue && cfg.default_argument.is_none() {
                return Err(invalid(format!(
                    "domain '{domain}' uses default_value but sets no default_argument"
                )));
            }
        }

        Ok(())
    }
}

fn invalid(reason: String) -> ConfigError {
    ConfigError::Invalid { reason }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve the config path.
///
/// Checks `TOOLRELAY_CONFIG`, then searches upward from `start` for
/// `toolrelay.yaml` or `config/toolrelay.yaml`, then the platform config
/// directory. Returns `Ok(None)` when nothing is found.
pub fn find_config_path(start: &Path) -> Result<Option<PathBuf>, ConfigError> {
    // 1. Explicit env var must point at a real file
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
        return Err(ConfigError::NotFound { path: candidate });
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        for candidate in [dir.join(CONFIG_FILE), dir.join("config").join(CONFIG_FILE)] {
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }
        if !dir.pop() {
            break;
        }
    }

    // 3. Platform config dir
    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("toolrelay").join(CONFIG_FILE);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
    }

    Ok(None)
}

pub fn load_config_file(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    AppConfig::from_yaml(&raw)
}

/// Discover and load the configuration, falling back to the built-in copy.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match find_config_path(&cwd)? {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading configuration");
            load_config_file(&path)
        }
        None => {
            tracing::info!("no configuration file found, using built-in defaults");
            AppConfig::builtin()
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::Domain;

    const MINIMAL: &str = r#"
domains:
  weather:
    tool_name: get_weather
    argument: city
    keywords: ["weather", "날씨"]
"#;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLRELAY_UNSET_VAR__");
        let result = interpolate_env_vars("url: ${__TOOLRELAY_UNSET_VAR__:-http://fallback:1}");
        assert_eq!(result, "url: http://fallback:1");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLRELAY_TEST_URL__", "http://tools:9000");
        let result = interpolate_env_vars("${__TOOLRELAY_TEST_URL__:-http://fallback:1}");
        assert_eq!(result, "http://tools:9000");
        std::env::remove_var("__TOOLRELAY_TEST_URL__");
    }

    #[test]
    fn test_interpolate_leaves_plain_text() {
        let input = "plain: text with $dollar but no braces";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/toolrelay.yaml");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/toolrelay.yaml"));
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.classifier.threshold, 0.6);
        assert!(!config.classifier.model_fallback);
        assert_eq!(config.retry.tool.max_attempts, 3);
        assert_eq!(config.orchestrator.merge_mode, MergeMode::Augment);
        let weather = config.domain(Domain::Weather).unwrap();
        assert_eq!(weather.on_unresolved, UnresolvedPolicy::Fallback);
        assert!(config.extractor.model_budget().is_none());
    }

    #[test]
    fn test_domain_retry_override() {
        let yaml = format!(
            "{MINIMAL}\nretry:\n  tool: {{ max_attempts: 2 }}\n  domains:\n    weather: {{ max_attempts: 5, base_delay_ms: 50 }}\n"
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.retry.for_domain(Domain::Weather).max_attempts, 5);
        assert_eq!(
            config.retry.for_domain(Domain::Weather).base_delay,
            Duration::from_millis(50)
        );
        assert_eq!(config.retry.for_domain(Domain::Stock).max_attempts, 2);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let yaml = format!("{MINIMAL}\nretry:\n  tool: {{ max_attempts: 0 }}\n");
        let err = AppConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "got {err}");
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let yaml = format!("{MINIMAL}\nretry:\n  model: {{ backoff_multiplier: 0.5 }}\n");
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let yaml = format!("{MINIMAL}\nclassifier:\n  threshold: 1.5\n");
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_validate_rejects_domain_without_keywords() {
        let yaml = "domains:\n  stock:\n    tool_name: get_stock_info\n    argument: stock_code\n";
        let err = AppConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("stock"));
    }

    #[test]
    fn test_default_value_policy_needs_default_argument() {
        let yaml = "domains:\n  weather:\n    tool_name: get_weather\n    argument: city\n    keywords: [weather]\n    on_unresolved: default_value\n";
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = AppConfig::from_yaml("domains: [not, a, map").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_builtin_config_is_valid() {
        let config = AppConfig::builtin().unwrap();
        for domain in Domain::ALL {
            assert!(config.domain(domain).is_some(), "missing {domain}");
        }
        assert!(config.registries.cities.iter().any(|c| c.name == "Seoul"));
        assert!(config
            .registries
            .stocks
            .iter()
            .any(|s| s.code.as_deref() == Some("005930")));
    }

    #[test]
    fn test_load_config_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, MINIMAL).unwrap();
        let config = load_config_file(&path).unwrap();
        assert_eq!(config.domains.len(), 1);
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_file(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_find_config_searches_upward() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        let expected = dir.path().join("config").join(CONFIG_FILE);
        std::fs::write(&expected, MINIMAL).unwrap();

        std::env::remove_var(CONFIG_ENV);
        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, Some(expected));
    }
}
