use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::provider::{Backend, ChatStream, Message, Role, StatusTx};
use crate::retry::{MAX_RETRIES, send_with_retry};
use crate::sse::claude_sse_to_stream;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct ClaudeBackend {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
    model: String,
    max_tokens: u32,
    pub(crate) status_tx: Option<StatusTx>,
}

impl fmt::Debug for ClaudeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaudeBackend")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("status_tx", &self.status_tx.is_some())
            .finish()
    }
}

impl ClaudeBackend {
    #[must_use]
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Self {
        Self {
            client: crate::http::default_client(),
            api_key,
            api_url: API_URL.to_owned(),
            model,
            max_tokens,
            status_tx: None,
        }
    }

    /// Point the backend at a different messages endpoint (proxies, tests).
    #[must_use]
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
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
        let (system, chat_messages) = split_messages(messages);

        let body = RequestBody {
            model: &self.model,
            max_tokens: self.max_tokens,
            system,
            messages: &chat_messages,
            stream,
        };

        self.client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
    }

    async fn send(&self, messages: &[Message], stream: bool) -> Result<reqwest::Response, BackendError> {
        send_with_retry("claude", MAX_RETRIES, self.status_tx.as_ref(), || {
            self.build_request(messages, stream).send()
        })
        .await
    }
}

impl Backend for ClaudeBackend {
    fn context_window(&self) -> Option<usize> {
        if self.model.contains("opus")
            || self.model.contains("sonnet")
            || self.model.contains("haiku")
        {
            Some(200_000)
        } else {
            None
        }
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, BackendError> {
        let response = self.send(messages, false).await?;
        let text = response.text().await?;
        let resp: ApiResponse = serde_json::from_str(&text)?;

        if let Some(usage) = resp.usage {
            tracing::debug!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Claude API usage"
            );
        }

        let answer: String = resp
            .content
            .into_iter()
            .filter(|c| c.block_type == "text")
            .map(|c| c.text)
            .collect();
        if answer.trim().is_empty() {
            return Err(BackendError::EmptyResponse {
                provider: "claude".into(),
            });
        }
        Ok(answer)
    }

    async fn chat_stream(&self, messages: &[Message]) -> Result<ChatStream, BackendError> {
        let response = self.send(messages, true).await?;
        Ok(claude_sse_to_stream(response))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "claude"
    }
}

fn split_messages(messages: &[Message]) -> (Option<String>, Vec<ApiMessage<'_>>) {
    let mut system_parts = Vec::new();
    let mut chat = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.as_str()),
            Role::User => chat.push(ApiMessage {
                role: "user",
                content: &msg.content,
            }),
            Role::Assistant => chat.push(ApiMessage {
                role: "assistant",
                content: &msg.content,
            }),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    (system, chat)
}

#[derive(Serialize)]
struct RequestBody<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: &'a [ApiMessage<'a>],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default = "text_type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

fn text_type() -> String {
    "text".to_owned()
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}
