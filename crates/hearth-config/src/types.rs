//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [llm.primary]            # required to talk to a model
//! [llm.fallback]           # optional second provider
//! [resilience]             # retry, backoff and circuit breaker
//! [agent]                  # conversation loop settings
//! [pricing."gpt-4o-mini"]  # per-model token pricing
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Placeholder shown instead of secrets.
pub const REDACTED: &str = "********";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// Every section has defaults, so an empty file is a valid config until a
/// command needs a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HearthConfig {
    pub llm: LlmSection,
    pub resilience: ResilienceConfig,
    pub agent: AgentSection,
    /// Pricing per model id.
    pub pricing: HashMap<String, PricingEntry>,
}

impl HearthConfig {
    /// Create a config with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The primary provider, or an error if none is configured.
    pub fn primary(&self) -> Result<&ProviderConfig> {
        self.llm.primary.as_ref().ok_or(ConfigError::NoPrimaryLlm)
    }

    /// Check value ranges. Does not require a provider.
    pub fn validate(&self) -> Result<()> {
        let r = &self.resilience;
        if r.max_retries == 0 {
            return Err(ConfigError::invalid(
                "resilience.max_retries",
                "must be at least 1",
            ));
        }
        if r.backoff_ms.is_empty() {
            return Err(ConfigError::invalid(
                "resilience.backoff_ms",
                "must contain at least one delay",
            ));
        }
        if r.breaker_threshold == 0 {
            return Err(ConfigError::invalid(
                "resilience.breaker_threshold",
                "must be at least 1",
            ));
        }
        if self.agent.max_tool_iterations == 0 {
            return Err(ConfigError::invalid(
                "agent.max_tool_iterations",
                "must be at least 1",
            ));
        }
        for (name, provider) in self.llm.providers() {
            if provider.provider.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("llm.{}.provider", name),
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }

    /// A copy safe to print: inline API keys and header values are masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for provider in [&mut copy.llm.primary, &mut copy.llm.fallback]
            .into_iter()
            .flatten()
        {
            if provider.api_key.is_some() {
                provider.api_key = Some(REDACTED.to_string());
            }
            for value in provider.headers.values_mut() {
                *value = REDACTED.to_string();
            }
        }
        copy
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// The `[llm]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<ProviderConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<ProviderConfig>,
}

impl LlmSection {
    /// Configured providers with their section names.
    pub fn providers(&self) -> impl Iterator<Item = (&'static str, &ProviderConfig)> {
        [("primary", &self.primary), ("fallback", &self.fallback)]
            .into_iter()
            .filter_map(|(name, p)| p.as_ref().map(|p| (name, p)))
    }
}

/// One OpenAI-compatible provider, called directly or through a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider id. Also the circuit breaker key.
    pub provider: String,
    /// API base URL. Defaults to the provider's public endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Model to pin for this provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Inline API key (warns on load).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Request timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Extra headers for gateway-style proxies.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: None,
            model: None,
            api_key: None,
            api_key_env: None,
            timeout_secs: None,
            headers: BTreeMap::new(),
        }
    }
}

impl ProviderConfig {
    /// Create a provider entry.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    /// Returns true if an API key is stored directly in the config file.
    pub fn has_plaintext_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Environment variable consulted for the API key.
    ///
    /// Falls back to `<PROVIDER>_API_KEY`.
    pub fn effective_api_key_env(&self) -> String {
        self.api_key_env.clone().unwrap_or_else(|| {
            let id: String = self
                .provider
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect();
            format!("{}_API_KEY", id)
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resilience Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// The `[resilience]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Total attempts against the primary.
    pub max_retries: u32,
    /// Delays between primary attempts, in milliseconds.
    pub backoff_ms: Vec<u64>,
    /// Consecutive failures that open a circuit.
    pub breaker_threshold: u32,
    /// Seconds an open circuit waits before allowing a trial call.
    pub breaker_cooldown_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: vec![1000, 2000, 4000],
            breaker_threshold: 5,
            breaker_cooldown_secs: 60,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// The `[agent]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Model requested when the provider does not pin one.
    pub model: String,
    pub max_tool_iterations: u32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Read-only allow-list. Unset means the built-in list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only_tools: Option<Vec<String>>,
    pub tool_timeout_secs: u64,
    pub delegate_timeout_secs: u64,
    /// Reasoning marker pairs. Unset means the built-in pairs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_markers: Option<Vec<(String, String)>>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tool_iterations: 10,
            max_tokens: 4096,
            system_prompt: None,
            temperature: None,
            read_only_tools: None,
            tool_timeout_secs: 30,
            delegate_timeout_secs: 120,
            reasoning_markers: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pricing
// ─────────────────────────────────────────────────────────────────────────────

/// USD per million tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[llm.primary]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
timeout_secs = 90

[llm.fallback]
provider = "gateway"
base_url = "https://llm-gateway.internal/v1"
model = "gpt-4o-mini"
api_key = "gw-secret"

[llm.fallback.headers]
"X-Team" = "home"

[resilience]
max_retries = 4
backoff_ms = [500, 1000]
breaker_threshold = 3
breaker_cooldown_secs = 30

[agent]
max_tool_iterations = 6
temperature = 0.2
read_only_tools = ["get_entity_state", "energy_analyst"]
reasoning_markers = [["<think>", "</think>"]]

[pricing."gpt-4o-mini"]
input_per_million = 0.15
output_per_million = 0.6
"#;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = HearthConfig::from_toml("").unwrap();
        assert_eq!(config, HearthConfig::default());
        assert_eq!(config.resilience.max_retries, 3);
        assert_eq!(config.resilience.backoff_ms, vec![1000, 2000, 4000]);
        assert_eq!(config.resilience.breaker_threshold, 5);
        assert_eq!(config.resilience.breaker_cooldown_secs, 60);
        assert_eq!(config.agent.max_tool_iterations, 10);
        assert!(config.validate().is_ok());
        assert!(matches!(config.primary(), Err(ConfigError::NoPrimaryLlm)));
    }

    #[test]
    fn test_full_config() {
        let config = HearthConfig::from_toml(FULL).unwrap();
        let primary = config.primary().unwrap();
        assert_eq!(primary.timeout_secs, Some(90));

        let fallback = config.llm.fallback.as_ref().unwrap();
        assert_eq!(fallback.provider, "gateway");
        assert_eq!(fallback.headers.get("X-Team").map(String::as_str), Some("home"));

        assert_eq!(config.resilience.backoff_ms, vec![500, 1000]);
        assert_eq!(
            config.agent.reasoning_markers,
            Some(vec![("<think>".to_string(), "</think>".to_string())])
        );
        assert_eq!(config.pricing["gpt-4o-mini"].output_per_million, 0.6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = HearthConfig::from_toml(FULL).unwrap();
        let again = HearthConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(config, again);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = HearthConfig::default();
        config.resilience.max_retries = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "resilience.max_retries"
        ));

        let mut config = HearthConfig::default();
        config.resilience.backoff_ms.clear();
        assert!(config.validate().is_err());

        let mut config = HearthConfig::default();
        config.resilience.breaker_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = HearthConfig::default();
        config.agent.max_tool_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let config = HearthConfig::from_toml(FULL).unwrap().redacted();
        let fallback = config.llm.fallback.as_ref().unwrap();
        assert_eq!(fallback.api_key.as_deref(), Some(REDACTED));
        assert_eq!(fallback.headers["X-Team"], REDACTED);
        assert!(config.llm.primary.as_ref().unwrap().api_key.is_none());
    }

    #[test]
    fn test_effective_api_key_env() {
        assert_eq!(
            ProviderConfig::new("openai").effective_api_key_env(),
            "OPENAI_API_KEY"
        );
        assert_eq!(
            ProviderConfig::new("my-gateway").effective_api_key_env(),
            "MY_GATEWAY_API_KEY"
        );
        assert_eq!(
            ProviderConfig::new("x").with_api_key_env("CUSTOM").effective_api_key_env(),
            "CUSTOM"
        );
    }
}
