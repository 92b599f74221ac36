use crate::claude::ClaudeBackend;
use crate::compatible::CompatibleBackend;
use crate::error::BackendError;
use crate::gemini::GeminiBackend;
#[cfg(feature = "mock")]
use crate::mock::MockBackend;
use crate::ollama::OllamaBackend;
use crate::openai::OpenAiBackend;
use crate::provider::{Backend, ChatStream, Message, StatusTx};

/// Generates a match over all `AnyBackend` variants, binding the inner backend
/// and evaluating the given expression for each arm.
macro_rules! delegate_backend {
    ($self:expr, |$p:ident| $expr:expr) => {
        match $self {
            AnyBackend::Claude($p) => $expr,
            AnyBackend::OpenAi($p) => $expr,
            AnyBackend::Compatible($p) => $expr,
            AnyBackend::Gemini($p) => $expr,
            AnyBackend::Ollama($p) => $expr,
            #[cfg(feature = "mock")]
            AnyBackend::Mock($p) => $expr,
        }
    };
}

#[derive(Debug, Clone)]
pub enum AnyBackend {
    Claude(ClaudeBackend),
    OpenAi(OpenAiBackend),
    Compatible(CompatibleBackend),
    Gemini(GeminiBackend),
    Ollama(OllamaBackend),
    #[cfg(feature = "mock")]
    Mock(MockBackend),
}

impl AnyBackend {
    /// Propagate a status sender to the inner backend (where supported).
    pub fn set_status_tx(&mut self, tx: StatusTx) {
        match self {
            Self::Claude(p) => {
                p.status_tx = Some(tx);
            }
            Self::OpenAi(p) => {
                p.status_tx = Some(tx);
            }
            Self::Compatible(p) => {
                p.set_status_tx(tx);
            }
            Self::Gemini(p) => {
                p.status_tx = Some(tx);
            }
            Self::Ollama(_) => {}
            #[cfg(feature = "mock")]
            Self::Mock(_) => {}
        }
    }
}

impl Backend for AnyBackend {
    fn context_window(&self) -> Option<usize> {
        delegate_backend!(self, |p| p.context_window())
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, BackendError> {
        delegate_backend!(self, |p| p.chat(messages).await)
    }

    async fn chat_stream(&self, messages: &[Message]) -> Result<ChatStream, BackendError> {
        delegate_backend!(self, |p| p.chat_stream(messages).await)
    }

    fn supports_streaming(&self) -> bool {
        delegate_backend!(self, |p| p.supports_streaming())
    }

    fn name(&self) -> &str {
        delegate_backend!(self, |p| p.name())
    }
}

impl From<ClaudeBackend> for AnyBackend {
    fn from(b: ClaudeBackend) -> Self {
        Self::Claude(b)
    }
}

impl From<OpenAiBackend> for AnyBackend {
    fn from(b: OpenAiBackend) -> Self {
        Self::OpenAi(b)
    }
}

impl From<CompatibleBackend> for AnyBackend {
    fn from(b: CompatibleBackend) -> Self {
        Self::Compatible(b)
    }
}

impl From<GeminiBackend> for AnyBackend {
    fn from(b: GeminiBackend) -> Self {
        Self::Gemini(b)
    }
}

impl From<OllamaBackend> for AnyBackend {
    fn from(b: OllamaBackend) -> Self {
        Self::Ollama(b)
    }
}

#[cfg(feature = "mock")]
impl From<MockBackend> for AnyBackend {
    fn from(b: MockBackend) -> Self {
        Self::Mock(b)
    }
}
