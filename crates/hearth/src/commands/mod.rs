//! CLI command handlers.

use std::path::PathBuf;

use anyhow::Result;
use hearth_config::LoadedConfig;

pub mod ask;
pub mod config;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Config file given on the command line.
    pub config_path: Option<PathBuf>,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Discover and load configuration, logging any load warnings.
    pub fn load_config(&self) -> Result<LoadedConfig> {
        let loaded = hearth_config::load_config(self.config_path.as_deref())?;
        match loaded.source {
            Some(ref path) => tracing::debug!(path = %path.display(), "Loaded config"),
            None => tracing::debug!("No config file found, using defaults"),
        }
        for warning in &loaded.warnings {
            tracing::warn!("{}", warning);
        }
        Ok(loaded)
    }
}
