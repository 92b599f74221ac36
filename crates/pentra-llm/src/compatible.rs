use std::fmt;

use crate::error::BackendError;
use crate::openai::OpenAiBackend;
use crate::provider::{Backend, ChatStream, Message, StatusTx};
use crate::sse::openai_sse_to_stream;

/// A locally hosted or third-party server speaking the `OpenAI` chat completions API.
#[derive(Clone)]
pub struct CompatibleBackend {
    inner: OpenAiBackend,
    backend_name: String,
    context_window: Option<usize>,
}

impl CompatibleBackend {
    #[must_use]
    pub fn new(
        backend_name: String,
        api_key: Option<String>,
        base_url: String,
        model: String,
        max_tokens: u32,
        context_window: Option<usize>,
    ) -> Self {
        Self {
            inner: OpenAiBackend::new(api_key, base_url, model, max_tokens),
            backend_name,
            context_window,
        }
    }

    pub fn set_status_tx(&mut self, tx: StatusTx) {
        self.inner.status_tx = Some(tx);
    }
}

impl fmt::Debug for CompatibleBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompatibleBackend")
            .field("backend_name", &self.backend_name)
            .field("context_window", &self.context_window)
            .field("inner", &self.inner)
            .finish()
    }
}

impl Backend for CompatibleBackend {
    fn context_window(&self) -> Option<usize> {
        self.context_window
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, BackendError> {
        self.inner.chat_as(&self.backend_name, messages).await
    }

    async fn chat_stream(&self, messages: &[Message]) -> Result<ChatStream, BackendError> {
        let response = self.inner.send(&self.backend_name, messages, true).await?;
        Ok(openai_sse_to_stream(response))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.backend_name
    }
}
