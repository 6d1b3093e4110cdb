//! API key resolution.
//!
//! Resolution order:
//! 1. `api_key` in the config file (with a load warning)
//! 2. Environment variable named by `api_key_env` (default `<PROVIDER>_API_KEY`)

use crate::{ConfigError, ProviderConfig, Result};

/// Result of API key resolution with provenance.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    /// The secret value.
    pub value: String,
    /// Where the secret was found.
    pub source: SecretSource,
}

impl std::fmt::Debug for ResolvedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecret")
            .field("value", &crate::REDACTED)
            .field("source", &self.source)
            .finish()
    }
}

/// Where a secret was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Config file (plaintext, not recommended).
    ConfigFile,
    /// Environment variable.
    EnvVar(String),
}

impl std::fmt::Display for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretSource::ConfigFile => write!(f, "config file (plaintext)"),
            SecretSource::EnvVar(var) => write!(f, "env var {}", var),
        }
    }
}

/// Resolve the API key for a provider from the process environment.
pub fn resolve_api_key(provider: &ProviderConfig) -> Option<ResolvedSecret> {
    resolve_api_key_with(provider, |var| std::env::var(var).ok())
}

/// Resolve the API key using a custom environment lookup.
pub fn resolve_api_key_with(
    provider: &ProviderConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<ResolvedSecret> {
    if let Some(ref key) = provider.api_key
        && !key.is_empty()
    {
        return Some(ResolvedSecret {
            value: key.clone(),
            source: SecretSource::ConfigFile,
        });
    }

    let env_var = provider.effective_api_key_env();
    lookup(&env_var)
        .filter(|v| !v.is_empty())
        .map(|value| ResolvedSecret {
            value,
            source: SecretSource::EnvVar(env_var),
        })
}

/// Like [`resolve_api_key`], but missing keys are an error.
pub fn require_api_key(provider: &ProviderConfig) -> Result<ResolvedSecret> {
    resolve_api_key(provider).ok_or_else(|| ConfigError::ApiKeyNotFound {
        provider: provider.provider.clone(),
        env_var: provider.effective_api_key_env(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
