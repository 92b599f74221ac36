use std::fmt;

use serde::Serialize;

/// Decision loop state. `Cancelled` is transient and always returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Executing,
    Parsing,
    AwaitingAiResponse,
    AwaitingApproval,
    Cancelled,
}

impl EngineState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Executing => "executing",
            Self::Parsing => "parsing",
            Self::AwaitingAiResponse => "awaiting_ai_response",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the machine may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use EngineState::{AwaitingAiResponse, AwaitingApproval, Cancelled, Executing, Idle, Parsing};
        matches!(
            (self, next),
            (Idle, Executing | AwaitingApproval)
                | (Executing, Parsing | Idle | Cancelled)
                | (Parsing, AwaitingAiResponse | Idle | Cancelled)
                | (AwaitingAiResponse, AwaitingApproval | Idle | Cancelled)
                | (AwaitingApproval, Executing | Idle | Cancelled)
                | (Cancelled, Idle)
        )
    }

    /// A command is running or the turn is still being processed.
    #[must_use]
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Executing | Self::Parsing | Self::AwaitingAiResponse | Self::Cancelled)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
