//! AI backend abstraction and backend implementations.

pub mod any;
pub mod claude;
pub mod compatible;
pub mod context;
pub mod error;
pub mod gemini;
pub(crate) mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod recommendation;
pub(crate) mod retry;
pub(crate) mod sse;

pub use any::AnyBackend;
pub use context::{HistoryEntry, SYSTEM_PROMPT, TurnContext};
pub use error::{BackendError, BackendErrorKind};
pub use provider::{Backend, ChatStream, Message, Role, StatusTx, complete, complete_streaming};
pub use recommendation::{Recommendation, RecommendationStream, StreamItem};
