use super::{ClaudeConfig, Config, GeminiConfig, OllamaConfig, OpenAiConfig};
use crate::secret::Secret;

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PENTRA_AI_BACKEND") {
            let v = v.trim();
            if v.is_empty() {
                tracing::warn!("ignoring empty PENTRA_AI_BACKEND");
            } else {
                self.ai.backend = v.to_owned();
            }
        }
        if let Ok(v) = std::env::var("PENTRA_AUTO_EXECUTE") {
            if let Ok(enabled) = v.parse::<bool>() {
                self.safety.auto_execute = enabled;
            } else {
                tracing::warn!("ignoring invalid PENTRA_AUTO_EXECUTE value: {v}");
            }
        }
        if let Ok(v) = std::env::var("PENTRA_RUNNER_TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                self.runner.timeout = secs;
            } else {
                tracing::warn!("ignoring invalid PENTRA_RUNNER_TIMEOUT value: {v}");
            }
        }
        if let Ok(v) = std::env::var("PENTRA_TARGET")
            && !v.trim().is_empty()
        {
            self.session.target = Some(v.trim().to_owned());
        }
        if let Ok(v) = std::env::var("PENTRA_LOG_LEVEL") {
            self.log.level = v;
        }
        self.apply_env_overrides_backends();
    }

    fn apply_env_overrides_backends(&mut self) {
        if let Ok(key) = std::env::var("PENTRA_CLAUDE_API_KEY") {
            self.ai.claude.get_or_insert_with(ClaudeConfig::default).api_key = Some(Secret::new(key));
        }
        if let Ok(key) = std::env::var("PENTRA_OPENAI_API_KEY") {
            self.ai.openai.get_or_insert_with(OpenAiConfig::default).api_key = Some(Secret::new(key));
        }
        if let Some(key) = ["PENTRA_GEMINI_API_KEY", "GEMINI_API_KEY", "GOOGLE_API_KEY"]
            .into_iter()
            .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
        {
            self.ai.gemini.get_or_insert_with(GeminiConfig::default).api_key = Some(Secret::new(key));
        }
        if let Ok(key) = std::env::var("PENTRA_COMPATIBLE_API_KEY") {
            for entry in self.ai.compatible.iter_mut().filter(|c| c.api_key.is_none()) {
                entry.api_key = Some(Secret::new(key.clone()));
            }
        }
        if let Ok(url) = std::env::var("PENTRA_OLLAMA_URL") {
            self.ai.ollama.get_or_insert_with(OllamaConfig::default).url = url;
        }
    }
}
