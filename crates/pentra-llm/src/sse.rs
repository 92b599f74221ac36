use eventsource_stream::Eventsource;
use serde::Deserialize;
use tokio_stream::StreamExt;

use crate::error::BackendError;
use crate::gemini::GenerateResponse;
use crate::provider::ChatStream;

/// Convert a Claude streaming response into a `ChatStream`.
pub(crate) fn claude_sse_to_stream(response: reqwest::Response) -> ChatStream {
    let event_stream = response.bytes_stream().eventsource();
    let mapped = event_stream.filter_map(|event| match event {
        Ok(event) => parse_claude_sse_event(&event.data, &event.event),
        Err(e) => Some(Err(BackendError::SseParse(e.to_string()))),
    });
    Box::pin(mapped)
}

/// Convert an `OpenAI` streaming response into a `ChatStream`.
pub(crate) fn openai_sse_to_stream(response: reqwest::Response) -> ChatStream {
    let event_stream = response.bytes_stream().eventsource();
    let mapped = event_stream.filter_map(|event| match event {
        Ok(event) => parse_openai_sse_event(&event.data),
        Err(e) => Some(Err(BackendError::SseParse(e.to_string()))),
    });
    Box::pin(mapped)
}

/// Convert a Gemini `streamGenerateContent?alt=sse` response into a `ChatStream`.
pub(crate) fn gemini_sse_to_stream(response: reqwest::Response) -> ChatStream {
    let event_stream = response.bytes_stream().eventsource();
    let mapped = event_stream.filter_map(|event| match event {
        Ok(event) => parse_gemini_sse_event(&event.data),
        Err(e) => Some(Err(BackendError::SseParse(e.to_string()))),
    });
    Box::pin(mapped)
}

fn parse_claude_sse_event(data: &str, event_type: &str) -> Option<Result<String, BackendError>> {
    match event_type {
        "content_block_delta" => match serde_json::from_str::<ClaudeStreamEvent>(data) {
            Ok(event) => {
                if let Some(delta) = event.delta
                    && delta.delta_type == "text_delta"
                    && !delta.text.is_empty()
                {
                    return Some(Ok(delta.text));
                }
                None
            }
            Err(e) => Some(Err(BackendError::SseParse(format!(
                "failed to parse SSE data: {e}"
            )))),
        },
        "error" => {
            let message = serde_json::from_str::<ClaudeStreamEvent>(data)
                .ok()
                .and_then(|event| event.error)
                .map_or_else(
                    || format!("Claude stream error: {data}"),
                    |err| format!("Claude stream error ({}): {}", err.error_type, err.message),
                );
            if message.contains("overloaded") {
                Some(Err(BackendError::Unavailable(message)))
            } else {
                Some(Err(BackendError::SseParse(message)))
            }
        }
        _ => None,
    }
}

fn parse_openai_sse_event(data: &str) -> Option<Result<String, BackendError>> {
    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => {
            let content = chunk
                .choices
                .first()
                .and_then(|c| c.delta.content.as_deref())
                .unwrap_or_default();

            if content.is_empty() {
                None
            } else {
                Some(Ok(content.to_owned()))
            }
        }
        Err(e) => Some(Err(BackendError::SseParse(format!(
            "failed to parse SSE data: {e}"
        )))),
    }
}

fn parse_gemini_sse_event(data: &str) -> Option<Result<String, BackendError>> {
    match serde_json::from_str::<GenerateResponse>(data) {
        Ok(chunk) => {
            if let Some(reason) = chunk.block_reason() {
                return Some(Err(BackendError::Other(format!(
                    "Gemini blocked the prompt ({reason})"
                ))));
            }
            let text = chunk.text();
            if text.is_empty() { None } else { Some(Ok(text)) }
        }
        Err(e) => Some(Err(BackendError::SseParse(format!(
            "failed to parse SSE data: {e}"
        )))),
    }
}

#[derive(Deserialize)]
struct ClaudeStreamEvent {
    #[serde(default)]
    delta: Option<ClaudeDelta>,
    #[serde(default)]
    error: Option<ClaudeStreamError>,
}

#[derive(Deserialize)]
struct ClaudeDelta {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ClaudeStreamError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
}
