use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of a parser-derived observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    OpenPort,
    Service,
    Vulnerability,
    Credential,
    Misconfiguration,
    Other,
}

impl FindingKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenPort => "open_port",
            Self::Service => "service",
            Self::Vulnerability => "vulnerability",
            Self::Credential => "credential",
            Self::Misconfiguration => "misconfiguration",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much the producing parser trusts a finding.
///
/// Truncated or partially recognised output lowers confidence instead of
/// failing the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// One step lower, saturating at `Low`.
    #[must_use]
    pub fn degrade(self) -> Self {
        match self {
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }
}

/// A normalized observation extracted from tool output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub description: String,
    pub severity: Severity,
    pub confidence: Confidence,
    /// Name of the parser that produced the finding.
    pub source: String,
}

impl Finding {
    #[must_use]
    pub fn new(
        source: &str,
        kind: FindingKind,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            description: description.into(),
            severity,
            confidence: Confidence::High,
            source: source.to_owned(),
        }
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }

    /// Whether the finding came from incomplete or partially recognised output.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.confidence < Confidence::High
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.description)
    }
}
