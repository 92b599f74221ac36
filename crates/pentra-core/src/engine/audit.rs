use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use pentra_tools::{AuditEntry, AuditLogger, AuditResult, CommandStatus, SafetyVerdict, detect_tool};

use super::EngineEvent;

/// Write executed, blocked, and rejected commands to the audit log.
///
/// Runs as an independent subscriber; if it falls behind it loses events
/// instead of slowing the engine. Ends when the engine's event bus closes.
#[must_use]
pub fn spawn_audit_writer(
    mut events: broadcast::Receiver<EngineEvent>,
    logger: AuditLogger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(entry) = audit_entry(&event) {
                        logger.log(&entry).await;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "audit writer lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("audit writer stopped");
    })
}

fn refused(command: &str, result: AuditResult) -> AuditEntry {
    AuditEntry {
        timestamp: Utc::now().to_rfc3339(),
        command: command.to_owned(),
        tool: detect_tool(command).map(|t| t.name),
        target: None,
        result,
        duration_ms: 0,
    }
}

fn audit_entry(event: &EngineEvent) -> Option<AuditEntry> {
    match event {
        EngineEvent::CommandFinished(record) => {
            let result = match &record.status {
                CommandStatus::Exited { code: 0 } => AuditResult::Success,
                CommandStatus::Exited { code } => AuditResult::NonZeroExit { code: *code },
                CommandStatus::SpawnFailure { reason } => AuditResult::SpawnFailure {
                    reason: reason.clone(),
                },
                CommandStatus::TimedOut => AuditResult::Timeout,
                CommandStatus::Cancelled => AuditResult::Cancelled,
            };
            Some(AuditEntry {
                timestamp: record.finished_at.to_rfc3339(),
                command: record.command.clone(),
                tool: record.tool.as_ref().map(|t| t.name.clone()),
                target: record.target.clone(),
                result,
                duration_ms: record.duration_ms(),
            })
        }
        EngineEvent::Blocked {
            command,
            verdict: SafetyVerdict { rule, reason, .. },
        } => Some(refused(
            command,
            AuditResult::Blocked {
                rule: rule.clone(),
                reason: reason.clone(),
            },
        )),
        EngineEvent::Rejected { command } => Some(refused(command, AuditResult::Rejected)),
        _ => None,
    }
}
