mod env;
mod types;


pub use types::*;

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("backend '{backend}' requires an API key ({hint})")]
    MissingApiKey { backend: String, hint: &'static str },

    #[error("unknown AI backend '{0}'")]
    UnknownBackend(String),

    #[error(transparent)]
    InvalidSafetyRule(#[from] pentra_tools::SafetyConfigError),
}

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str::<Self>(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Every backend id the configuration declares, `ollama` always included.
    #[must_use]
    pub fn backend_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if self.ai.claude.is_some() {
            ids.push("claude".to_owned());
        }
        if self.ai.openai.is_some() {
            ids.push("openai".to_owned());
        }
        ids.extend(self.ai.compatible.iter().map(|c| c.name.clone()));
        ids.push("ollama".to_owned());
        ids
    }
}

/// Config path from `--config`, then `PENTRA_CONFIG`, then `config/default.toml`.
#[must_use]
pub fn resolve_config_path(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_owned();
    }
    if let Ok(path) = std::env::var("PENTRA_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("config/default.toml")
}
