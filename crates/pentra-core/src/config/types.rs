use serde::Deserialize;

use pentra_tools::{AuditConfig, RunnerConfig, SafetyConfig};

use crate::secret::Secret;

fn default_true() -> bool {
    true
}

fn default_snapshot_path() -> String {
    "pentra-session.json".into()
}

fn default_backend() -> String {
    "ollama".into()
}

fn default_ai_timeout() -> u64 {
    120
}

fn default_timeout_attempts() -> u32 {
    3
}

fn default_max_auto_steps() -> u32 {
    3
}

fn default_history_window() -> usize {
    20
}

fn default_max_output_chars() -> usize {
    3000
}

fn default_max_findings() -> usize {
    50
}

fn default_claude_model() -> String {
    "claude-sonnet-4-5-20250929".into()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".into()
}

fn default_gemini_model() -> String {
    pentra_llm::gemini::DEFAULT_MODEL.into()
}

fn default_gemini_base_url() -> String {
    pentra_llm::gemini::DEFAULT_BASE_URL.into()
}

pub(crate) fn default_openai_base_url() -> String {
    pentra_llm::openai::DEFAULT_BASE_URL.into()
}

fn default_max_tokens() -> u32 {
    4096
}

pub(crate) fn default_ollama_url() -> String {
    pentra_llm::ollama::DEFAULT_URL.into()
}

fn default_ollama_model() -> String {
    "llama3.1:8b".into()
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Engagement target set at startup; can be changed at runtime.
    pub target: Option<String>,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    /// Write the snapshot after every finished turn.
    #[serde(default)]
    pub autosave: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target: None,
            snapshot_path: default_snapshot_path(),
            autosave: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    /// Id of the active backend: `claude`, `openai`, `gemini`, `ollama`, or a
    /// compatible entry name.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Per-call timeout in seconds.
    #[serde(default = "default_ai_timeout")]
    pub timeout_secs: u64,
    /// Consecutive timeouts tolerated before the turn reports the backend unavailable.
    #[serde(default = "default_timeout_attempts")]
    pub timeout_attempts: u32,
    #[serde(default = "default_max_auto_steps")]
    pub max_auto_steps: u32,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default = "default_max_findings")]
    pub max_findings: usize,
    pub claude: Option<ClaudeConfig>,
    pub openai: Option<OpenAiConfig>,
    pub gemini: Option<GeminiConfig>,
    #[serde(default)]
    pub compatible: Vec<CompatibleConfig>,
    pub ollama: Option<OllamaConfig>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            timeout_secs: default_ai_timeout(),
            timeout_attempts: default_timeout_attempts(),
            max_auto_steps: default_max_auto_steps(),
            streaming: true,
            history_window: default_history_window(),
            max_output_chars: default_max_output_chars(),
            max_findings: default_max_findings(),
            claude: None,
            openai: None,
            gemini: None,
            compatible: Vec::new(),
            ollama: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeConfig {
    #[serde(default = "default_claude_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub api_key: Option<Secret>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            model: default_claude_model(),
            max_tokens: default_max_tokens(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub api_key: Option<Secret>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            max_tokens: default_max_tokens(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiConfig {
    /// API model id, or a short alias such as `gemini-3`.
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub api_key: Option<Secret>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            model: default_gemini_model(),
            base_url: default_gemini_base_url(),
            max_tokens: default_max_tokens(),
            temperature: None,
            api_key: None,
        }
    }
}

/// An OpenAI-compatible server (vLLM, LM Studio, llama.cpp, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct CompatibleConfig {
    pub name: String,
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Context window in tokens, used to size the history sent to this server.
    pub context_window: Option<usize>,
    pub api_key: Option<Secret>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    pub context_window: Option<usize>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_ollama_model(),
            context_window: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
