use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::capabilities::{dota, my_ip};

/// Default Gemini model.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// API credentials.
    pub keys: KeysConfig,
    /// Bot behaviour.
    #[serde(default)]
    pub bot: BotConfig,
    /// Upstream API endpoints (Gemini, Telegram).
    #[serde(default)]
    pub api: ApiConfig,
    /// Endpoints used by the builtin capabilities.
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
}

/// API keys.  Each value is either the literal key or a `$ENV_VAR`
/// reference resolved at load time.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct KeysConfig {
    pub gemini: String,
    pub telegram: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BotConfig {
    /// System instruction sent with every conversational request.
    #[serde(default)]
    pub prompt: String,
    /// Gemini model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// Maximum turns retained per conversation.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Probability (0.0–1.0) of the alternating-case reply to an
    /// untriggered message.
    #[serde(default)]
    pub mock_chance: f64,
    /// Capability rounds allowed per turn before giving up.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// Timeout applied to each model call and capability call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Attempts per model call (transient failures only).
    #[serde(default = "default_model_retries")]
    pub model_retries: usize,
    /// Sender ids whose untriggered messages get a grammar check.
    #[serde(default)]
    pub unintelligible_ids: Vec<i64>,
    /// Instruction for the grammar check.
    #[serde(default)]
    pub unintelligible_prompt: String,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_history() -> usize {
    20
}

fn default_max_tool_iterations() -> usize {
    8
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_model_retries() -> usize {
    2
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: default_model(),
            max_history: default_max_history(),
            mock_chance: 0.0,
            max_tool_iterations: default_max_tool_iterations(),
            request_timeout_secs: default_request_timeout_secs(),
            model_retries: default_model_retries(),
            unintelligible_ids: Vec::new(),
            unintelligible_prompt: String::new(),
        }
    }
}

impl BotConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_gemini_url")]
    pub gemini_url: String,
    #[serde(default = "default_telegram_url")]
    pub telegram_url: String,
}

fn default_gemini_url() -> String {
    crate::models::gemini::DEFAULT_BASE_URL.to_string()
}

fn default_telegram_url() -> String {
    crate::telegram::DEFAULT_BASE_URL.to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            gemini_url: default_gemini_url(),
            telegram_url: default_telegram_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilitiesConfig {
    #[serde(default = "default_ipify_url")]
    pub ipify_url: String,
    #[serde(default = "default_opendota_url")]
    pub opendota_url: String,
}

fn default_ipify_url() -> String {
    my_ip::DEFAULT_URL.to_string()
}

fn default_opendota_url() -> String {
    dota::DEFAULT_URL.to_string()
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            ipify_url: default_ipify_url(),
            opendota_url: default_opendota_url(),
        }
    }
}

/// Resolve a key value: `$NAME` reads the environment variable `NAME`,
/// anything else is taken literally.  Unset variables resolve to `""`.
pub fn resolve_key(raw: &str) -> String {
    let raw = raw.trim();
    match raw.strip_prefix('$') {
        Some(var) => std::env::var(var).unwrap_or_default(),
        None => raw.to_string(),
    }
}

impl Config {
    /// Candidate locations searched when no explicit path is given, in
    /// priority order.
    pub fn search_paths() -> Vec<PathBuf> {
        vec![
            PathBuf::from("config.yaml"),
            crate::benebot_home().join("config.yaml"),
            PathBuf::from("/etc/benebot/config.yaml"),
        ]
    }

    /// Pick the configuration file: the explicit path when given, otherwise
    /// the first existing entry of [`Config::search_paths`].
    pub fn locate(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
        if let Some(p) = explicit {
            return Ok(p.to_path_buf());
        }
        let candidates = Self::search_paths();
        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .ok_or_else(|| {
                let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
                anyhow::anyhow!("no config file found (tried: {})", tried.join(", "))
            })
    }

    /// Read, parse, resolve, and validate a YAML configuration file.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_yaml(&contents)?;
        tracing::debug!(
            path = %path.display(),
            model = %config.bot.model,
            max_history = config.bot.max_history,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parse configuration from a YAML string, resolving `$ENV` key
    /// references and validating the result.
    pub fn from_yaml(contents: &str) -> anyhow::Result<Config> {
        let mut config: Config =
            serde_yaml_ng::from_str(contents).context("failed to parse config YAML")?;
        config.keys.gemini = resolve_key(&config.keys.gemini);
        config.keys.telegram = resolve_key(&config.keys.telegram);
        config.validate()?;
        Ok(config)
    }

    /// Validate semantic constraints that serde cannot enforce.
    fn validate(&self) -> anyhow::Result<()> {
        if self.keys.gemini.is_empty() {
            anyhow::bail!("config: keys.gemini is missing or resolves to an empty value");
        }
        if self.keys.telegram.is_empty() {
            anyhow::bail!("config: keys.telegram is missing or resolves to an empty value");
        }
        let bot = &self.bot;
        if bot.model.trim().is_empty() {
            anyhow::bail!("config: bot.model must not be empty");
        }
        if bot.max_history == 0 {
            anyhow::bail!("config: bot.max_history must be at least 1");
        }
        if bot.max_tool_iterations == 0 {
            anyhow::bail!("config: bot.max_tool_iterations must be at least 1");
        }
        if bot.request_timeout_secs == 0 {
            anyhow::bail!("config: bot.request_timeout_secs must be at least 1");
        }
        if !(0.0..=1.0).contains(&bot.mock_chance) {
            anyhow::bail!(
                "config: bot.mock_chance must be between 0.0 and 1.0 (got {})",
                bot.mock_chance
            );
        }
        if !bot.unintelligible_ids.is_empty() && bot.unintelligible_prompt.trim().is_empty() {
            anyhow::bail!("config: bot.unintelligible_ids is set but bot.unintelligible_prompt is empty");
        }
        Ok(())
    }
}
