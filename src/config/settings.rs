//! Settings snapshot held by each tree.

use std::collections::BTreeMap;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Idle time before the store client is restarted.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Idle time before a tree's resources may be torn down by a host.
pub const DEFAULT_TREE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

fn default_client_timeout() -> Duration {
    DEFAULT_CLIENT_TIMEOUT
}

fn default_tree_timeout() -> Duration {
    DEFAULT_TREE_TIMEOUT
}

fn default_secret() -> SecretString {
    SecretString::from(String::new())
}

fn default_logging_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_settings_id() -> String {
    Uuid::new_v4().to_string()
}

/// Model, store and feature-flag configuration for one tree.
///
/// Secrets are never serialized; everything else round-trips through the
/// tree's export format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Identity of this snapshot; regenerated whenever it is reconfigured.
    #[serde(default = "default_settings_id")]
    pub settings_id: String,

    /// The cheap/fast model used for decisions and short responses.
    pub base_model: Option<String>,
    pub base_provider: Option<String>,
    /// The heavy model used for complex generation.
    pub complex_model: Option<String>,
    pub complex_provider: Option<String>,
    /// Base URL override, required for local providers.
    pub model_api_base: Option<String>,

    /// Vector store endpoint.
    #[serde(default)]
    pub store_url: String,
    /// Vector store credential.
    #[serde(skip_serializing, default = "default_secret")]
    pub store_api_key: SecretString,

    /// Log filter directive (`error`..`trace`).
    #[serde(default = "default_logging_level")]
    pub logging_level: String,

    /// Enables in-context few-shot retrieval from the feedback collection.
    #[serde(default)]
    pub use_feedback: bool,
    /// Whether the base model emits an explicit reasoning field.
    #[serde(default = "default_true")]
    pub base_use_reasoning: bool,
    /// Whether the complex model emits an explicit reasoning field.
    #[serde(default = "default_true")]
    pub complex_use_reasoning: bool,

    /// Idle time before the store client is restarted.
    #[serde(with = "humantime_serde", default = "default_client_timeout")]
    pub client_timeout: Duration,
    /// Idle time before a tree's resources may be torn down.
    #[serde(with = "humantime_serde", default = "default_tree_timeout")]
    pub tree_timeout: Duration,

    /// Third-party API keys, keyed by their option name (e.g. `openai_apikey`).
    #[serde(skip, default)]
    pub api_keys: BTreeMap<String, SecretString>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            settings_id: default_settings_id(),
            base_model: None,
            base_provider: None,
            complex_model: None,
            complex_provider: None,
            model_api_base: None,
            store_url: String::new(),
            store_api_key: default_secret(),
            logging_level: default_logging_level(),
            use_feedback: false,
            base_use_reasoning: true,
            complex_use_reasoning: true,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            tree_timeout: DEFAULT_TREE_TIMEOUT,
            api_keys: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Apply a set of option overrides.
    ///
    /// Keys suffixed `_apikey`/`_api_key` are collected into the API-key
    /// map. Unknown keys are kept out of the snapshot but logged rather
    /// than silently dropped.
    pub fn configure(&mut self, options: BTreeMap<String, Value>) {
        self.settings_id = default_settings_id();
        for (key, value) in options {
            self.apply_option(&key, value);
        }
    }

    fn apply_option(&mut self, key: &str, value: Value) {
        let lower = key.to_ascii_lowercase();
        match lower.as_str() {
            "base_model" => self.base_model = value_to_string(value),
            "base_provider" => self.base_provider = value_to_string(value),
            "complex_model" => self.complex_model = value_to_string(value),
            "complex_provider" => self.complex_provider = value_to_string(value),
            "model_api_base" => self.model_api_base = value_to_string(value),
            "store_url" | "wcd_url" => {
                self.store_url = value_to_string(value).unwrap_or_default()
            }
            "store_api_key" | "wcd_api_key" => {
                self.store_api_key =
                    SecretString::from(value_to_string(value).unwrap_or_default())
            }
            "logging_level" => {
                self.logging_level = value_to_string(value).unwrap_or_else(default_logging_level)
            }
            "use_feedback" => self.use_feedback = value_to_bool(value),
            "base_use_reasoning" => self.base_use_reasoning = value_to_bool(value),
            "complex_use_reasoning" => self.complex_use_reasoning = value_to_bool(value),
            "client_timeout" => {
                if let Some(minutes) = value_to_minutes(&value) {
                    self.client_timeout = minutes;
                }
            }
            "tree_timeout" => {
                if let Some(minutes) = value_to_minutes(&value) {
                    self.tree_timeout = minutes;
                }
            }
            _ if lower.ends_with("_apikey") || lower.ends_with("_api_key") => {
                if let Some(secret) = value_to_string(value) {
                    self.api_keys.insert(lower, SecretString::from(secret));
                }
            }
            _ => warn!(option = key, "Ignoring unrecognised configuration option"),
        }
    }

    /// Verify that the base model is fully configured.
    pub fn ensure_base_lm(&self) -> Result<()> {
        ensure_lm(
            "base",
            &self.base_model,
            &self.base_provider,
            &self.model_api_base,
        )
    }

    /// Verify that the complex model is fully configured.
    pub fn ensure_complex_lm(&self) -> Result<()> {
        ensure_lm(
            "complex",
            &self.complex_model,
            &self.complex_provider,
            &self.model_api_base,
        )
    }

    /// Whether a store endpoint has been configured at all.
    pub fn has_store(&self) -> bool {
        !self.store_url.is_empty()
    }

    /// Look up a third-party API key.
    pub fn api_key(&self, name: &str) -> Option<&str> {
        self.api_keys
            .get(&name.to_ascii_lowercase())
            .map(|s| s.expose_secret())
    }

    /// Install a global tracing subscriber honouring `logging_level`.
    ///
    /// Later calls (or an already-installed subscriber) are a no-op.
    pub fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::try_new(&self.logging_level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

fn ensure_lm(
    role: &str,
    model: &Option<String>,
    provider: &Option<String>,
    api_base: &Option<String>,
) -> Result<()> {
    let model = model
        .as_deref()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::Config(format!("No {} model configured", role)))?;
    let provider = provider
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::Config(format!("No {} provider configured", role)))?;
    if matches!(provider, "ollama" | "local") && api_base.is_none() {
        return Err(Error::Config(format!(
            "Provider '{}' for {} model '{}' requires model_api_base",
            provider, role, model
        )));
    }
    Ok(())
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn value_to_bool(value: Value) -> bool {
    match value {
        Value::Bool(b) => b,
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

fn value_to_minutes(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => n.as_u64().map(|m| Duration::from_secs(m * 60)),
        Value::String(s) => s.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_configure_known_options() {
        let mut settings = Settings::default();
        settings.configure(BTreeMap::from([
            ("base_model".to_string(), json!("gpt-4o-mini")),
            ("base_provider".to_string(), json!("openai")),
            ("use_feedback".to_string(), json!(true)),
            ("client_timeout".to_string(), json!(5)),
        ]));
        assert_eq!(settings.base_model.as_deref(), Some("gpt-4o-mini"));
        assert!(settings.use_feedback);
        assert_eq!(settings.client_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_configure_collects_api_keys() {
        let mut settings = Settings::default();
        settings.configure(BTreeMap::from([
            ("OPENAI_APIKEY".to_string(), json!("sk-123")),
            ("cohere_api_key".to_string(), json!("co-456")),
        ]));
        assert_eq!(settings.api_key("openai_apikey"), Some("sk-123"));
        assert_eq!(settings.api_key("cohere_api_key"), Some("co-456"));
    }

    #[test]
    fn test_configure_unknown_key_is_ignored() {
        let mut settings = Settings::default();
        settings.configure(BTreeMap::from([("frobnicate".to_string(), json!(42))]));
        assert!(settings.base_model.is_none());
    }

    #[test]
    fn test_ensure_lm_requires_model_and_provider() {
        let mut settings = Settings::default();
        assert!(settings.ensure_base_lm().is_err());
        settings.base_model = Some("gpt-4o-mini".into());
        assert!(settings.ensure_base_lm().is_err());
        settings.base_provider = Some("openai".into());
        assert!(settings.ensure_base_lm().is_ok());
    }

    #[test]
    fn test_local_provider_requires_api_base() {
        let mut settings = Settings::default();
        settings.base_model = Some("llama3".into());
        settings.base_provider = Some("ollama".into());
        assert!(settings.ensure_base_lm().is_err());
        settings.model_api_base = Some("http://localhost:11434/v1".into());
        assert!(settings.ensure_base_lm().is_ok());
    }

    #[test]
    fn test_secrets_do_not_serialize() {
        let mut settings = Settings::default();
        settings.store_api_key = SecretString::from("secret".to_string());
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_settings_round_trip() {
        let mut settings = Settings::default();
        settings.base_model = Some("m".into());
        settings.store_url = "https://store.example".into();
        let json = serde_json::to_value(&settings).unwrap();
        let restored: Settings = serde_json::from_value(json).unwrap();
        assert_eq!(restored.base_model.as_deref(), Some("m"));
        assert_eq!(restored.store_url, "https://store.example");
        assert_eq!(restored.client_timeout, DEFAULT_CLIENT_TIMEOUT);
    }
}
