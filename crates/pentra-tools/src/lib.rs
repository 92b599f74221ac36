//! Command execution, safety classification, and tool output parsing for Pentra.

pub mod audit;
pub mod config;
pub mod finding;
pub mod output;
pub mod parser;
pub mod runner;
pub mod safety;
pub mod tool;

pub use audit::{AuditEntry, AuditLogger, AuditResult};
pub use config::{AuditConfig, RuleMatchKind, RunnerConfig, SafetyConfig, SafetyRuleConfig};
pub use finding::{Confidence, Finding, FindingKind, Severity};
pub use output::{clean_output, strip_ansi, truncate_output};
pub use parser::{NullParser, ParserRegistry, ToolParser};
pub use runner::{CommandRunner, CommandStatus, Execution, ExecutionOutcome, RunnerError};
pub use safety::{SafetyConfigError, SafetyPolicy, SafetyRule, SafetyVerdict, Verdict};
pub use tool::{ToolCategory, ToolInfo, detect_tool, extract_last_command};
