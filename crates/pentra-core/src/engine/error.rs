use pentra_tools::RunnerError;

use crate::session::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A turn is in progress or a command is awaiting approval.
    #[error("engine is busy ({0})")]
    Busy(super::EngineState),

    #[error("no command is awaiting approval")]
    NothingPending,

    #[error("command is empty")]
    EmptyCommand,

    #[error("unknown AI backend '{0}'")]
    UnknownBackend(String),

    /// No process can be spawned at all; the session cannot continue.
    #[error(transparent)]
    Fatal(#[from] RunnerError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("engine task has stopped")]
    Closed,
}

impl EngineError {
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Closed)
    }
}
