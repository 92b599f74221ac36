use std::future::Future;
use std::pin::Pin;

use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::context::TurnContext;
use crate::error::BackendError;
use crate::recommendation::{Recommendation, RecommendationStream};

/// Boxed stream of raw text chunks from a backend.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Sender for user-facing status messages such as rate-limit notices.
pub type StatusTx = tokio::sync::mpsc::UnboundedSender<String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One interchangeable AI reasoning provider.
pub trait Backend: Send + Sync {
    /// Send messages to the backend and return the assistant text.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached or the response is invalid.
    fn chat(&self, messages: &[Message]) -> impl Future<Output = Result<String, BackendError>> + Send;

    /// Send messages and receive the assistant text incrementally.
    ///
    /// # Errors
    ///
    /// Returns an error if the streaming request cannot be started.
    fn chat_stream(
        &self,
        messages: &[Message],
    ) -> impl Future<Output = Result<ChatStream, BackendError>> + Send;

    fn supports_streaming(&self) -> bool;

    /// Context window size in tokens, when known.
    fn context_window(&self) -> Option<usize> {
        None
    }

    fn name(&self) -> &str;
}

/// Ask the backend for the next step.
///
/// Returns `Ok(None)` when the backend answered with nothing usable.
///
/// # Errors
///
/// Returns `BackendError` when the backend is unavailable, rate limited past the
/// retry budget, timed out, or cancelled.
pub async fn complete<B: Backend>(
    backend: &B,
    context: &TurnContext,
) -> Result<Option<Recommendation>, BackendError> {
    match backend.chat(&context.to_messages()).await {
        Ok(text) => Ok(Recommendation::parse(&text)),
        Err(e) if e.is_no_recommendation() => {
            tracing::warn!(backend = backend.name(), "no recommendation: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Streaming variant of [`complete`].
///
/// Backends without streaming support yield their whole answer as one chunk.
///
/// # Errors
///
/// Returns `BackendError` if the request cannot be started.
pub async fn complete_streaming<B: Backend>(
    backend: &B,
    context: &TurnContext,
) -> Result<RecommendationStream, BackendError> {
    let messages = context.to_messages();
    let inner: ChatStream = if backend.supports_streaming() {
        backend.chat_stream(&messages).await?
    } else {
        let text = backend.chat(&messages).await?;
        Box::pin(tokio_stream::once(Ok::<_, BackendError>(text)))
    };
    Ok(RecommendationStream::new(inner))
}
