//! Test-only scripted backend.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::BackendError;
use crate::provider::{Backend, ChatStream, Message};

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Unavailable,
    RateLimited,
    /// Never answers; the caller's timeout decides.
    Hang,
}

#[derive(Debug, Clone)]
pub struct MockBackend {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    calls: Arc<Mutex<Vec<Vec<Message>>>>,
    pub default_response: String,
    pub streaming: bool,
    pub context_window: Option<usize>,
    /// Milliseconds to sleep before answering.
    pub delay_ms: u64,
    name: String,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            default_response: "**Analysis:** mock analysis\n**Command:** none".into(),
            streaming: false,
            context_window: None,
            delay_ms: 0,
            name: "mock".into(),
        }
    }
}

impl MockBackend {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self::with_replies(responses.into_iter().map(MockReply::Text).collect())
    }

    #[must_use]
    pub fn with_replies(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            ..Self::default()
        }
    }

    /// Every call fails as unavailable.
    #[must_use]
    pub fn failing() -> Self {
        Self::with_replies(vec![MockReply::Unavailable; 64])
    }

    /// Every call hangs.
    #[must_use]
    pub fn hanging() -> Self {
        Self::with_replies(vec![MockReply::Hang; 64])
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    #[must_use]
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = Some(tokens);
        self
    }

    /// Every message list this backend has received, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn next_reply(&self, messages: &[Message]) -> MockReply {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages.to_vec());
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| MockReply::Text(self.default_response.clone()))
    }
}

impl Backend for MockBackend {
    fn context_window(&self) -> Option<usize> {
        self.context_window
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, BackendError> {
        let reply = self.next_reply(messages);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        match reply {
            MockReply::Text(text) if text.trim().is_empty() => Err(BackendError::EmptyResponse {
                provider: self.name.clone(),
            }),
            MockReply::Text(text) => Ok(text),
            MockReply::Unavailable => Err(BackendError::Unavailable("mock backend down".into())),
            MockReply::RateLimited => Err(BackendError::RateLimited),
            MockReply::Hang => std::future::pending().await,
        }
    }

    async fn chat_stream(&self, messages: &[Message]) -> Result<ChatStream, BackendError> {
        let response = self.chat(messages).await?;
        let chunks: Vec<Result<String, BackendError>> = response
            .split_inclusive(char::is_whitespace)
            .map(|c| Ok(c.to_owned()))
            .collect();
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;
    use crate::context::TurnContext;
    use crate::provider::{complete, complete_streaming};
    use crate::recommendation::StreamItem;

    #[tokio::test]
    async fn scripted_replies_then_default() {
        let mock = MockBackend::with_responses(vec!["first".into()]);
        assert_eq!(mock.chat(&[]).await.unwrap(), "first");
        assert!(mock.chat(&[]).await.unwrap().contains("mock analysis"));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn complete_parses_recommendation() {
        let mock = MockBackend::with_responses(vec![
            "**Analysis:** http open\n**Command:** nikto -h 127.0.0.1".into(),
        ]);
        let rec = complete(&mock, &TurnContext::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.command.as_deref(), Some("nikto -h 127.0.0.1"));
        let calls = mock.calls();
        assert_eq!(calls[0].len(), 2);
    }

    #[tokio::test]
    async fn complete_treats_empty_answer_as_none() {
        let mock = MockBackend::with_responses(vec![String::new()]);
        assert!(complete(&mock, &TurnContext::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_surfaces_unavailable() {
        let err = complete(&MockBackend::failing(), &TurnContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::BackendErrorKind::BackendUnavailable);
    }

    #[tokio::test]
    async fn hanging_backend_times_out() {
        let mock = MockBackend::hanging();
        let result =
            tokio::time::timeout(Duration::from_millis(20), mock.chat(&[Message::user("x")])).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn streaming_completion_ends_with_done() {
        let mock = MockBackend::with_responses(vec![
            "**Analysis:** ftp anon\n**Command:** ftp 10.0.0.5".into(),
        ])
        .with_streaming();
        let stream = complete_streaming(&mock, &TurnContext::default())
            .await
            .unwrap();
        let items: Vec<_> = stream.collect().await;
        assert!(items.len() > 2);
        match items.last() {
            Some(Ok(StreamItem::Done(Some(rec)))) => {
                assert_eq!(rec.command.as_deref(), Some("ftp 10.0.0.5"));
            }
            other => panic!("unexpected tail {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_streaming_backend_streams_one_chunk() {
        let mock = MockBackend::with_responses(vec!["plain answer".into()]);
        let items: Vec<_> = complete_streaming(&mock, &TurnContext::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Ok(StreamItem::Chunk(c)) if c == "plain answer"));
    }
}
