//! Configuration system for the Hearth gateway.
//!
//! Provides TOML-based configuration with:
//! - Primary and fallback LLM providers (`[llm.primary]`, `[llm.fallback]`)
//! - Retry and circuit breaker tuning (`[resilience]`)
//! - Conversation loop settings (`[agent]`)
//! - Per-model pricing (`[pricing."<model>"]`)
//! - API key resolution (config file, then environment variable)

pub mod discovery;
pub mod error;
pub mod secrets;
pub mod types;

pub use discovery::{
    CONFIG_PATH_ENV, ConfigSearch, LoadedConfig, load_config, load_config_file, save_config,
    user_config_dir,
};
pub use error::{ConfigError, Result};
pub use secrets::{
    ResolvedSecret, SecretSource, require_api_key, resolve_api_key, resolve_api_key_with,
};
pub use types::*;
