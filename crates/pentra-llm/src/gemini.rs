use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::provider::{Backend, ChatStream, Message, Role, StatusTx};
use crate::retry::{MAX_RETRIES, send_with_retry};
use crate::sse::gemini_sse_to_stream;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Short names accepted in config, mapped to API model ids.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("gemini-3", "gemini-3-pro"),
    ("gemini-2", "gemini-2.0-pro"),
    ("gemini-2-pro", "gemini-2.0-pro"),
];

/// Resolve a configured model name to the id the API expects.
#[must_use]
pub fn resolve_model(model: &str) -> String {
    let lower = model.trim().to_lowercase();
    match MODEL_ALIASES.iter().find(|(alias, _)| *alias == lower) {
        Some((_, id)) => (*id).to_owned(),
        None => lower,
    }
}

/// Google Gemini over the `generateContent` REST API.
#[derive(Clone)]
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    pub(crate) status_tx: Option<StatusTx>,
}

impl fmt::Debug for GeminiBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiBackend")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("status_tx", &self.status_tx.is_some())
            .finish()
    }
}

impl GeminiBackend {
    #[must_use]
    pub fn new(api_key: String, model: &str, max_tokens: u32) -> Self {
        Self {
            client: crate::http::default_client(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_owned(),
            model: resolve_model(model),
            max_tokens,
            temperature: None,
            status_tx: None,
        }
    }

    /// Point the backend at a different API root (proxies, tests).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let mut url = url.into();
        while url.ends_with('/') {
            url.pop();
        }
        self.base_url = url;
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_status_tx(mut self, tx: StatusTx) -> Self {
        self.status_tx = Some(tx);
        self
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, messages: &[Message], stream: bool) -> reqwest::RequestBuilder {
        let (system_instruction, contents) = split_messages(messages);
        let body = GenerateRequest {
            system_instruction,
            contents,
            generation_config: GenerationConfig {
                max_output_tokens: self.max_tokens,
                temperature: self.temperature,
            },
        };
        let url = if stream {
            format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url, self.model)
        } else {
            format!("{}/models/{}:generateContent", self.base_url, self.model)
        };
        self.client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&body)
    }

    async fn send(&self, messages: &[Message], stream: bool) -> Result<reqwest::Response, BackendError> {
        send_with_retry("gemini", MAX_RETRIES, self.status_tx.as_ref(), || {
            self.build_request(messages, stream).send()
        })
        .await
    }
}

impl Backend for GeminiBackend {
    fn context_window(&self) -> Option<usize> {
        if self.model.starts_with("gemini-1.5")
            || self.model.starts_with("gemini-2")
            || self.model.starts_with("gemini-3")
        {
            Some(1_048_576)
        } else if self.model.starts_with("gemini-pro") {
            Some(32_768)
        } else {
            None
        }
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, BackendError> {
        let response = self.send(messages, false).await?;
        let text = response.text().await?;
        let resp: GenerateResponse = serde_json::from_str(&text)?;

        if let Some(usage) = &resp.usage_metadata {
            tracing::debug!(
                prompt_tokens = usage.prompt_token_count,
                output_tokens = usage.candidates_token_count,
                "Gemini API usage"
            );
        }
        if let Some(reason) = resp.block_reason() {
            tracing::warn!(reason, "Gemini refused the prompt");
        }

        let answer = resp.text();
        if answer.trim().is_empty() {
            return Err(BackendError::EmptyResponse {
                provider: "gemini".into(),
            });
        }
        Ok(answer)
    }

    async fn chat_stream(&self, messages: &[Message]) -> Result<ChatStream, BackendError> {
        let response = self.send(messages, true).await?;
        Ok(gemini_sse_to_stream(response))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

/// System messages become the system instruction; assistant turns use the
/// `model` role.
fn split_messages(messages: &[Message]) -> (Option<Content<'_>>, Vec<Content<'_>>) {
    let mut system = Vec::new();
    let mut contents = Vec::new();
    for msg in messages {
        let role = match msg.role {
            Role::System => {
                system.push(Part { text: &msg.content });
                continue;
            }
            Role::User => "user",
            Role::Assistant => "model",
        };
        contents.push(Content {
            role: Some(role),
            parts: vec![Part { text: &msg.content }],
        });
    }
    let system = (!system.is_empty()).then_some(Content {
        role: None,
        parts: system,
    });
    (system, contents)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

/// One `generateContent` answer, or one chunk of a streamed answer.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

impl GenerateResponse {
    /// Text of the first candidate, parts concatenated.
    pub(crate) fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| content.parts.iter().filter_map(|p| p.text.as_deref()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn block_reason(&self) -> Option<&str> {
        self.prompt_feedback.as_ref()?.block_reason.as_deref()
    }
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;
    use crate::retry::tests::spawn_mock_server;

    fn backend_at(port: u16) -> GeminiBackend {
        GeminiBackend::new("key".into(), "gemini-2.5-flash", 1024)
            .with_base_url(format!("http://127.0.0.1:{port}/v1beta/"))
    }

    #[test]
    fn aliases_resolve_to_api_ids() {
        assert_eq!(resolve_model("gemini-3"), "gemini-3-pro");
        assert_eq!(resolve_model("Gemini-2"), "gemini-2.0-pro");
        assert_eq!(resolve_model("gemini-2.5-flash"), "gemini-2.5-flash");
    }

    #[test]
    fn request_uses_system_instruction_and_model_role() {
        let messages = vec![
            Message::system("be terse"),
            Message::user("scan?"),
            Message::assistant("nmap"),
        ];
        let (system, contents) = split_messages(&messages);
        let body = GenerateRequest {
            system_instruction: system,
            contents,
            generation_config: GenerationConfig {
                max_output_tokens: 64,
                temperature: None,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be terse");
        assert!(json["systemInstruction"].get("role").is_none());
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 64);
        assert!(json["generationConfig"].get("temperature").is_none());
    }

    #[test]
    fn response_text_joins_first_candidate_parts() {
        let resp: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"**Command:** "},{"text":"nmap"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(resp.text(), "**Command:** nmap");

        let blocked: GenerateResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert_eq!(blocked.text(), "");
        assert_eq!(blocked.block_reason(), Some("SAFETY"));
    }

    #[test]
    fn context_window_for_known_models() {
        assert_eq!(
            GeminiBackend::new("k".into(), "gemini-3", 1).context_window(),
            Some(1_048_576)
        );
        assert!(GeminiBackend::new("k".into(), "custom", 1).context_window().is_none());
    }

    #[test]
    fn debug_redacts_api_key() {
        let backend = GeminiBackend::new("AIza-secret".into(), "gemini-3", 1);
        let debug = format!("{backend:?}");
        assert!(!debug.contains("AIza-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn chat_returns_candidate_text() {
        let (port, _handle) = spawn_mock_server(vec![
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 75\r\n\r\n{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"**Command:** nmap -sV x\"}]}}]}",
        ])
        .await;
        let text = backend_at(port).chat(&[Message::user("next?")]).await.unwrap();
        assert_eq!(text, "**Command:** nmap -sV x");
    }

    #[tokio::test]
    async fn chat_blocked_prompt_is_empty_response() {
        let (port, _handle) = spawn_mock_server(vec![
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 43\r\n\r\n{\"promptFeedback\":{\"blockReason\":\"SAFETY\"}}",
        ])
        .await;
        let err = backend_at(port).chat(&[Message::user("next?")]).await.unwrap_err();
        assert!(matches!(err, BackendError::EmptyResponse { .. }));
    }

    #[tokio::test]
    async fn chat_bad_key_is_unavailable() {
        let (port, _handle) =
            spawn_mock_server(vec!["HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n"]).await;
        let err = backend_at(port).chat(&[Message::user("next?")]).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[tokio::test]
    async fn chat_stream_yields_candidate_chunks() {
        let (port, _handle) = spawn_mock_server(vec![
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n\
data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n\
data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}]}\n\n",
        ])
        .await;
        let stream = backend_at(port).chat_stream(&[Message::user("hi")]).await.unwrap();
        let chunks: Vec<String> = stream.map(Result::unwrap).collect().await;
        assert_eq!(chunks.concat(), "Hello");
    }
}
