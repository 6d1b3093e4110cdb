//! Config file discovery.
//!
//! Resolution order (first existing file wins):
//! 1. Explicit path (CLI `--config`)
//! 2. `HEARTH_CONFIG` environment variable
//! 3. `./hearth.toml` (project-local)
//! 4. `<user config dir>/hearth/config.toml`
//! 5. Built-in defaults

use std::path::{Path, PathBuf};

use crate::{ConfigError, HearthConfig, Result};

/// Default config filename for project-local config.
const PROJECT_CONFIG_FILE: &str = "hearth.toml";

/// Default config filename within the user config directory.
const USER_CONFIG_FILE: &str = "config.toml";

/// Application name for user directory resolution.
const APP_NAME: &str = "hearth";

/// Environment variable naming a config file.
pub const CONFIG_PATH_ENV: &str = "HEARTH_CONFIG";

/// Where to look for a config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigSearch {
    pub explicit: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub user_config_dir: Option<PathBuf>,
}

impl ConfigSearch {
    /// Search locations for the current process.
    pub fn from_env(explicit: Option<&Path>) -> Self {
        Self {
            explicit: explicit.map(Path::to_path_buf),
            env_path: std::env::var(CONFIG_PATH_ENV)
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            working_dir: Some(PathBuf::from(".")),
            user_config_dir: user_config_dir(),
        }
    }

    /// Candidate files in precedence order.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        out.extend(self.explicit.clone());
        out.extend(self.env_path.clone());
        if let Some(ref dir) = self.working_dir {
            out.push(dir.join(PROJECT_CONFIG_FILE));
        }
        if let Some(ref dir) = self.user_config_dir {
            out.push(dir.join(USER_CONFIG_FILE));
        }
        out
    }

    /// Load the first candidate that exists.
    ///
    /// An explicit or env path that does not exist is an error; the implicit
    /// locations are simply skipped.
    pub fn load(&self) -> Result<LoadedConfig> {
        let named = [&self.explicit, &self.env_path];
        for path in named.into_iter().flatten() {
            if !path.is_file() {
                return Err(ConfigError::ReadFile {
                    path: path.display().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                });
            }
        }

        let found = self.candidates().into_iter().find(|p| p.is_file());
        let config = match found {
            Some(ref path) => load_config_file(path)?,
            None => HearthConfig::default(),
        };
        config.validate()?;

        let warnings = plaintext_key_warnings(&config);
        Ok(LoadedConfig {
            config,
            source: found,
            warnings,
        })
    }
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The loaded configuration.
    pub config: HearthConfig,
    /// The file it came from, or `None` for built-in defaults.
    pub source: Option<PathBuf>,
    /// Warnings generated during loading (e.g., plaintext API keys).
    pub warnings: Vec<String>,
}

/// Discover and load configuration for this process.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    ConfigSearch::from_env(explicit).load()
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<HearthConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    HearthConfig::from_toml(&contents)
}

/// Save configuration to a file.
///
/// Creates parent directories if they don't exist.
pub fn save_config(config: &HearthConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
            path: parent.display().to_string(),
            source: e,
        })?;
    }

    let contents = config.to_toml()?;
    std::fs::write(path, contents).map_err(|e| ConfigError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(())
}

/// The per-user config directory for hearth.
pub fn user_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

fn plaintext_key_warnings(config: &HearthConfig) -> Vec<String> {
    config
        .llm
        .providers()
        .filter(|(_, p)| p.has_plaintext_api_key())
        .map(|(name, _)| {
            format!(
                "[llm.{}] contains a plaintext API key. \
                 Consider using api_key_env and an environment variable instead.",
                name
            )
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn search(dir: &TempDir) -> ConfigSearch {
        ConfigSearch {
            explicit: None,
            env_path: None,
            working_dir: Some(dir.path().join("project")),
            user_config_dir: Some(dir.path().join("user")),
        }
    }

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_no_files_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = search(&dir).load().unwrap();
        assert!(loaded.source.is_none());
        assert_eq!(loaded.config, HearthConfig::default());
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn test_project_file_beats_user_file() {
        let dir = TempDir::new().unwrap();
        let s = search(&dir);
        write(
            &dir.path().join("project/hearth.toml"),
            "[agent]\nmax_tool_iterations = 4\n",
        );
        write(
            &dir.path().join("user/config.toml"),
            "[agent]\nmax_tool_iterations = 7\n",
        );

        let loaded = s.load().unwrap();
        assert_eq!(loaded.config.agent.max_tool_iterations, 4);
        assert_eq!(loaded.source, Some(dir.path().join("project/hearth.toml")));
    }

    #[test]
    fn test_user_file_used_when_no_project_file() {
        let dir = TempDir::new().unwrap();
        write(
            &dir.path().join("user/config.toml"),
            "[resilience]\nbreaker_threshold = 2\n",
        );
        let loaded = search(&dir).load().unwrap();
        assert_eq!(loaded.config.resilience.breaker_threshold, 2);
    }

    #[test]
    fn test_explicit_and_env_precedence() {
        let dir = TempDir::new().unwrap();
        let explicit = dir.path().join("explicit.toml");
        let env = dir.path().join("env.toml");
        write(&explicit, "[agent]\nmax_tokens = 100\n");
        write(&env, "[agent]\nmax_tokens = 200\n");

        let mut s = search(&dir);
        s.env_path = Some(env.clone());
        assert_eq!(s.load().unwrap().config.agent.max_tokens, 200);

        s.explicit = Some(explicit.clone());
        assert_eq!(s.load().unwrap().config.agent.max_tokens, 100);
        assert_eq!(s.candidates()[0], explicit);
        assert_eq!(s.candidates()[1], env);
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let dir = TempDir::new().unwrap();
        let mut s = search(&dir);
        s.explicit = Some(dir.path().join("nope.toml"));
        assert!(matches!(s.load(), Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("project/hearth.toml"), "[agent\nbroken");
        assert!(matches!(search(&dir).load(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        write(
            &dir.path().join("project/hearth.toml"),
            "[resilience]\nmax_retries = 0\n",
        );
        assert!(matches!(
            search(&dir).load(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_plaintext_key_warning() {
        let dir = TempDir::new().unwrap();
        write(
            &dir.path().join("project/hearth.toml"),
            "[llm.primary]\nprovider = \"openai\"\napi_key = \"sk-test\"\n",
        );
        let loaded = search(&dir).load().unwrap();
        assert_eq!(loaded.warnings.len(), 1);
        assert!(loaded.warnings[0].contains("[llm.primary]"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out/hearth.toml");
        let mut config = HearthConfig::default();
        config.agent.temperature = Some(0.5);
        config.llm.primary = Some(crate::ProviderConfig::new("openai").with_model("gpt-4o"));

        save_config(&config, &path).unwrap();
        assert_eq!(load_config_file(&path).unwrap(), config);
    }
}
