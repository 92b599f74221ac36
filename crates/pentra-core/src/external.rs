//! Seams for collaborators outside the core: report formatting and payload generation.

use std::collections::HashMap;

use crate::session::{CommandRecord, RecordedFinding, Session};

/// Renders findings and command history into a report in some format.
pub trait ReportBuilder {
    type Error: std::error::Error + Send + Sync + 'static;

    /// # Errors
    ///
    /// Returns the builder's error for unknown formats or rendering failures.
    fn build(
        &self,
        findings: &[RecordedFinding],
        records: &[CommandRecord],
        format_id: &str,
    ) -> Result<Vec<u8>, Self::Error>;
}

/// What a payload generator knows about the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInfo {
    pub target: Option<String>,
    /// Finding descriptions, oldest first.
    pub findings: Vec<String>,
}

impl TargetInfo {
    #[must_use]
    pub fn from_session(session: &Session) -> Self {
        Self {
            target: session.target().map(str::to_owned),
            findings: session
                .findings()
                .iter()
                .map(|f| f.finding.to_string())
                .collect(),
        }
    }
}

/// Produces payload text; a pure function from the engine's point of view.
pub trait PayloadGenerator {
    type Error: std::error::Error + Send + Sync + 'static;

    /// # Errors
    ///
    /// Returns the generator's error for unknown techniques or missing variables.
    fn generate(
        &self,
        technique_id: &str,
        variables: &HashMap<String, String>,
    ) -> Result<String, Self::Error>;

    /// # Errors
    ///
    /// Returns the generator's error when nothing fits the target.
    fn generate_for(&self, target: &TargetInfo) -> Result<String, Self::Error>;
}

impl Session {
    /// Hand the session's findings and records to `builder`.
    ///
    /// # Errors
    ///
    /// Propagates the builder's error.
    pub fn report<R: ReportBuilder>(&self, builder: &R, format_id: &str) -> Result<Vec<u8>, R::Error> {
        tracing::debug!(format_id, records = self.records().len(), "building report");
        builder.build(self.findings(), self.records(), format_id)
    }
}
