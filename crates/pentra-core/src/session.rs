//! Engagement state: target, command history, findings, active backend.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pentra_tools::{CommandStatus, Finding, ToolInfo};

/// Snapshot format version written by [`Session::save`].
pub const SNAPSHOT_VERSION: u32 = 1;

pub type RecordId = u64;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("no command record with id {0}")]
    UnknownRecord(RecordId),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

/// One finalized command: text, raw output, timing, and terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: RecordId,
    pub command: String,
    /// Raw PTY output, escape sequences included.
    pub output: String,
    /// Target in effect when the command was issued.
    pub target: Option<String>,
    pub tool: Option<ToolInfo>,
    pub status: CommandStatus,
    pub issued_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CommandRecord {
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        u64::try_from((self.finished_at - self.issued_at).num_milliseconds()).unwrap_or(0)
    }
}

/// A finding tied to the command record whose output produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordedFinding {
    pub record_id: RecordId,
    #[serde(flatten)]
    pub finding: Finding,
}

impl fmt::Display for RecordedFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.record_id, self.finding)
    }
}

/// What a command produced before it became a record.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub command: String,
    pub output: String,
    pub tool: Option<ToolInfo>,
    pub status: CommandStatus,
    pub issued_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Append-only engagement state owned by the decision engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "default_version")]
    version: u32,
    target: Option<String>,
    active_backend: String,
    #[serde(default)]
    records: Vec<CommandRecord>,
    #[serde(default)]
    findings: Vec<RecordedFinding>,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Session {
    #[must_use]
    pub fn new(target: Option<String>, active_backend: impl Into<String>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            target,
            active_backend: active_backend.into(),
            records: Vec::new(),
            findings: Vec::new(),
        }
    }

    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        let target = target.into();
        tracing::info!(%target, "target set");
        self.target = Some(target);
    }

    #[must_use]
    pub fn active_backend(&self) -> &str {
        &self.active_backend
    }

    pub fn set_active_backend(&mut self, id: impl Into<String>) {
        self.active_backend = id.into();
    }

    #[must_use]
    pub fn records(&self) -> &[CommandRecord] {
        &self.records
    }

    #[must_use]
    pub fn record(&self, id: RecordId) -> Option<&CommandRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    #[must_use]
    pub fn findings(&self) -> &[RecordedFinding] {
        &self.findings
    }

    /// Findings produced by one record, in parse order.
    pub fn findings_for(&self, id: RecordId) -> impl Iterator<Item = &RecordedFinding> {
        self.findings.iter().filter(move |f| f.record_id == id)
    }

    /// Append a finalized command. The current target is stamped on the record.
    pub fn append_record(&mut self, record: NewRecord) -> RecordId {
        let id = self.records.last().map_or(1, |r| r.id + 1);
        tracing::debug!(id, command = %record.command, status = %record.status, "record appended");
        self.records.push(CommandRecord {
            id,
            command: record.command,
            output: record.output,
            target: self.target.clone(),
            tool: record.tool,
            status: record.status,
            issued_at: record.issued_at,
            finished_at: record.finished_at,
        });
        id
    }

    /// Attach parser findings to an existing record.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownRecord` if `record_id` was never appended.
    pub fn add_findings(
        &mut self,
        record_id: RecordId,
        findings: Vec<Finding>,
    ) -> Result<&[RecordedFinding], SessionError> {
        if self.record(record_id).is_none() {
            return Err(SessionError::UnknownRecord(record_id));
        }
        let start = self.findings.len();
        self.findings.extend(
            findings
                .into_iter()
                .map(|finding| RecordedFinding { record_id, finding }),
        );
        Ok(&self.findings[start..])
    }

    /// Write the snapshot as pretty JSON, replacing `path` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails.
    pub async fn save(&self, path: &Path) -> Result<(), SessionError> {
        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::info!(path = %path.display(), records = self.records.len(), "session saved");
        Ok(())
    }

    /// Read a snapshot written by [`Session::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or carries an
    /// unknown version.
    pub async fn load(path: &Path) -> Result<Self, SessionError> {
        let bytes = tokio::fs::read(path).await?;
        let session: Self = serde_json::from_slice(&bytes)?;
        if session.version != SNAPSHOT_VERSION {
            return Err(SessionError::UnsupportedVersion(session.version));
        }
        if let Some(orphan) = session
            .findings
            .iter()
            .find(|f| session.record(f.record_id).is_none())
        {
            return Err(SessionError::UnknownRecord(orphan.record_id));
        }
        tracing::info!(
            path = %path.display(),
            records = session.records.len(),
            findings = session.findings.len(),
            "session loaded"
        );
        Ok(session)
    }
}
