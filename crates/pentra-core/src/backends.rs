//! Configured AI backends keyed by id.

use pentra_llm::claude::ClaudeBackend;
use pentra_llm::compatible::CompatibleBackend;
use pentra_llm::gemini::GeminiBackend;
use pentra_llm::ollama::OllamaBackend;
use pentra_llm::openai::OpenAiBackend;
use pentra_llm::{AnyBackend, StatusTx};

use crate::config::{AiConfig, ConfigError};

/// Every backend the session can switch between, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct BackendSet {
    entries: Vec<(String, AnyBackend)>,
}

impl BackendSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the backend registered under `id`.
    pub fn insert(&mut self, id: impl Into<String>, backend: impl Into<AnyBackend>) {
        let id = id.into();
        let backend = backend.into();
        if let Some(entry) = self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            entry.1 = backend;
        } else {
            self.entries.push((id, backend));
        }
    }

    #[must_use]
    pub fn with(mut self, id: impl Into<String>, backend: impl Into<AnyBackend>) -> Self {
        self.insert(id, backend);
        self
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&AnyBackend> {
        self.entries.iter().find(|(existing, _)| existing == id).map(|(_, b)| b)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut AnyBackend> {
        self.entries
            .iter_mut()
            .find(|(existing, _)| existing == id)
            .map(|(_, b)| b)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Route rate-limit notices from every backend to `tx`.
    pub fn set_status_tx(&mut self, tx: &StatusTx) {
        for (_, backend) in &mut self.entries {
            backend.set_status_tx(tx.clone());
        }
    }

    /// Build every backend the `[ai]` section describes.
    ///
    /// Sections without credentials are skipped unless they are the active
    /// backend. `ollama` is always available.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingApiKey` when the active backend lacks a
    /// key, or `ConfigError::UnknownBackend` when the active id names nothing.
    pub fn from_config(config: &AiConfig) -> Result<Self, ConfigError> {
        let active = config.backend.as_str();
        let mut set = Self::new();

        if let Some(claude) = &config.claude {
            match &claude.api_key {
                Some(key) => set.insert(
                    "claude",
                    ClaudeBackend::new(key.expose().to_owned(), claude.model.clone(), claude.max_tokens),
                ),
                None if active == "claude" => {
                    return Err(ConfigError::MissingApiKey {
                        backend: "claude".into(),
                        hint: "set PENTRA_CLAUDE_API_KEY or ai.claude.api_key",
                    });
                }
                None => tracing::warn!("skipping claude backend: no API key"),
            }
        }

        if let Some(openai) = &config.openai {
            match &openai.api_key {
                Some(key) => set.insert(
                    "openai",
                    OpenAiBackend::new(
                        Some(key.expose().to_owned()),
                        openai.base_url.clone(),
                        openai.model.clone(),
                        openai.max_tokens,
                    ),
                ),
                None if active == "openai" => {
                    return Err(ConfigError::MissingApiKey {
                        backend: "openai".into(),
                        hint: "set PENTRA_OPENAI_API_KEY or ai.openai.api_key",
                    });
                }
                None => tracing::warn!("skipping openai backend: no API key"),
            }
        }

        if let Some(gemini) = &config.gemini {
            match &gemini.api_key {
                Some(key) => {
                    let mut backend =
                        GeminiBackend::new(key.expose().to_owned(), &gemini.model, gemini.max_tokens)
                            .with_base_url(gemini.base_url.clone());
                    if let Some(temperature) = gemini.temperature {
                        backend = backend.with_temperature(temperature);
                    }
                    set.insert("gemini", backend);
                }
                None if active == "gemini" => {
                    return Err(ConfigError::MissingApiKey {
                        backend: "gemini".into(),
                        hint: "set PENTRA_GEMINI_API_KEY, GEMINI_API_KEY or ai.gemini.api_key",
                    });
                }
                None => tracing::warn!("skipping gemini backend: no API key"),
            }
        }

        for entry in &config.compatible {
            set.insert(
                entry.name.clone(),
                CompatibleBackend::new(
                    entry.name.clone(),
                    entry.api_key.as_ref().map(|k| k.expose().to_owned()),
                    entry.base_url.clone(),
                    entry.model.clone(),
                    entry.max_tokens,
                    entry.context_window,
                ),
            );
        }

        let ollama_config = config.ollama.clone().unwrap_or_default();
        let mut ollama = OllamaBackend::new(&ollama_config.url, ollama_config.model.clone());
        if let Some(window) = ollama_config.context_window {
            ollama.set_context_window(window);
        }
        set.insert("ollama", ollama);

        if !set.contains(active) {
            return Err(ConfigError::UnknownBackend(active.to_owned()));
        }
        tracing::info!(backends = ?set.ids(), active, "AI backends configured");
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use pentra_llm::Backend;

    use super::*;
    use crate::config::{ClaudeConfig, CompatibleConfig, GeminiConfig, OpenAiConfig};
    use crate::secret::Secret;

    #[test]
    fn default_config_yields_ollama_only() {
        let set = BackendSet::from_config(&AiConfig::default()).unwrap();
        assert_eq!(set.ids(), vec!["ollama".to_owned()]);
        assert_eq!(set.get("ollama").unwrap().name(), "ollama");
    }

    #[test]
    fn keyed_sections_become_backends_in_order() {
        let config = AiConfig {
            backend: "lab".into(),
            claude: Some(ClaudeConfig {
                api_key: Some(Secret::new("sk-ant")),
                ..ClaudeConfig::default()
            }),
            openai: Some(OpenAiConfig {
                api_key: Some(Secret::new("sk")),
                ..OpenAiConfig::default()
            }),
            gemini: Some(GeminiConfig {
                model: "gemini-3".into(),
                api_key: Some(Secret::new("AIza")),
                ..GeminiConfig::default()
            }),
            compatible: vec![CompatibleConfig {
                name: "lab".into(),
                base_url: "http://127.0.0.1:8000/v1".into(),
                model: "qwen".into(),
                max_tokens: 1024,
                context_window: Some(32_768),
                api_key: None,
            }],
            ..AiConfig::default()
        };
        let set = BackendSet::from_config(&config).unwrap();
        assert_eq!(set.ids(), vec!["claude", "openai", "gemini", "lab", "ollama"]);
        let AnyBackend::Gemini(gemini) = set.get("gemini").unwrap() else {
            panic!("expected gemini backend");
        };
        assert_eq!(gemini.model(), "gemini-3-pro");
        assert_eq!(set.get("lab").unwrap().context_window(), Some(32_768));
        assert_eq!(set.get("lab").unwrap().name(), "lab");
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn inactive_keyless_section_is_skipped() {
        let config = AiConfig {
            claude: Some(ClaudeConfig::default()),
            ..AiConfig::default()
        };
        let set = BackendSet::from_config(&config).unwrap();
        assert!(!set.contains("claude"));
    }

    #[test]
    fn active_keyless_section_is_an_error() {
        let config = AiConfig {
            backend: "claude".into(),
            claude: Some(ClaudeConfig::default()),
            ..AiConfig::default()
        };
        let err = BackendSet::from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingApiKey { .. }));
        assert!(err.to_string().contains("PENTRA_CLAUDE_API_KEY"));
    }

    #[test]
    fn unknown_active_backend_is_an_error() {
        let config = AiConfig {
            backend: "mistral".into(),
            ..AiConfig::default()
        };
        let err = BackendSet::from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend(ref id) if id == "mistral"));
    }

    #[test]
    fn active_keyless_gemini_is_an_error() {
        let config = AiConfig {
            backend: "gemini".into(),
            gemini: Some(GeminiConfig::default()),
            ..AiConfig::default()
        };
        let err = BackendSet::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("PENTRA_GEMINI_API_KEY"));
    }

    #[test]
    fn insert_replaces_existing_id() {
        let mut set = BackendSet::new();
        set.insert("local", OllamaBackend::new("http://a:11434", "m1".into()));
        set.insert("local", OllamaBackend::new("http://b:11434", "m2".into()));
        assert_eq!(set.len(), 1);
        let AnyBackend::Ollama(b) = set.get("local").unwrap() else {
            panic!("expected ollama backend");
        };
        assert_eq!(b.model(), "m2");
    }
}
