use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend call timed out")]
    Timeout,

    #[error("empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("SSE parse error: {0}")]
    SseParse(String),

    #[error("backend call cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Coarse classification the engine reports to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    BackendUnavailable,
    BackendRateLimited,
    BackendMalformedResponse,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BackendUnavailable => "BackendUnavailable",
            Self::BackendRateLimited => "BackendRateLimited",
            Self::BackendMalformedResponse => "BackendMalformedResponse",
        })
    }
}

impl BackendError {
    #[must_use]
    pub fn kind(&self) -> BackendErrorKind {
        match self {
            Self::RateLimited => BackendErrorKind::BackendRateLimited,
            Self::Json(_) | Self::EmptyResponse { .. } | Self::Malformed(_) | Self::SseParse(_) => {
                BackendErrorKind::BackendMalformedResponse
            }
            Self::Http(_)
            | Self::Unavailable(_)
            | Self::Timeout
            | Self::Cancelled
            | Self::Other(_) => BackendErrorKind::BackendUnavailable,
        }
    }

    /// Malformed or empty output means "no recommendation", not a failed turn.
    #[must_use]
    pub fn is_no_recommendation(&self) -> bool {
        self.kind() == BackendErrorKind::BackendMalformedResponse
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Unavailable(format!("connection failed: {e}"))
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Http(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        assert_eq!(
            BackendError::RateLimited.kind(),
            BackendErrorKind::BackendRateLimited
        );
        assert_eq!(
            BackendError::Unavailable("401".into()).kind(),
            BackendErrorKind::BackendUnavailable
        );
        assert_eq!(BackendError::Timeout.kind(), BackendErrorKind::BackendUnavailable);
        assert_eq!(
            BackendError::EmptyResponse {
                provider: "claude".into()
            }
            .kind(),
            BackendErrorKind::BackendMalformedResponse
        );
        assert!(BackendError::SseParse("bad".into()).is_no_recommendation());
        assert!(!BackendError::Cancelled.is_no_recommendation());
    }

    #[test]
    fn kind_display_names() {
        assert_eq!(
            BackendErrorKind::BackendUnavailable.to_string(),
            "BackendUnavailable"
        );
    }
}
