//! Session state, AI context building, configuration, and the decision engine for Pentra.

pub mod backends;
pub mod config;
pub mod context;
pub mod engine;
pub mod external;
pub mod hints;
pub mod secret;
pub mod session;

pub use backends::BackendSet;
pub use config::{Config, ConfigError, resolve_config_path};
pub use context::{ContextBuilder, ContextSettings};
pub use engine::{
    CancelHandle, DecisionEngine, EngineError, EngineEvent, EngineHandle, EngineSettings,
    EngineState, PendingCommand, TurnOutcome, spawn_audit_writer,
};
pub use external::{PayloadGenerator, ReportBuilder, TargetInfo};
pub use secret::Secret;
pub use session::{CommandRecord, NewRecord, RecordId, RecordedFinding, Session, SessionError};
