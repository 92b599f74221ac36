use std::fmt::Write as _;
use std::path::PathBuf;

use pentra_core::{EngineEvent, Session};

pub const HELP: &str = "\
commands:
  <shell command>      run it through the loop
  /approve             run the pending command
  /reject              drop the pending command
  /cancel              stop the running command or backend call
  /target <host>       set the engagement target
  /backend <id>        switch AI backend
  /backends            list configured backends
  /findings            list findings
  /history             list executed commands
  /save [path]         write a session snapshot
  /help                this text
  /quit                exit";

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Run(String),
    Approve,
    Reject,
    Cancel,
    Target(String),
    Backend(String),
    Backends,
    Findings,
    History,
    Save(Option<PathBuf>),
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl Input {
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Run(line.to_owned());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match (name, arg) {
            ("approve" | "y", "") => Self::Approve,
            ("reject" | "n", "") => Self::Reject,
            ("cancel", "") => Self::Cancel,
            ("target", t) if !t.is_empty() => Self::Target(t.to_owned()),
            ("backend", id) if !id.is_empty() => Self::Backend(id.to_owned()),
            ("backend" | "backends", "") => Self::Backends,
            ("findings", "") => Self::Findings,
            ("history", "") => Self::History,
            ("save", "") => Self::Save(None),
            ("save", path) => Self::Save(Some(PathBuf::from(path))),
            ("help" | "?", "") => Self::Help,
            ("quit" | "exit" | "q", "") => Self::Quit,
            _ => Self::Unknown(line.to_owned()),
        }
    }
}

/// Text for an engine event, or `None` for events the terminal does not show.
///
/// Raw output and streamed recommendation text are returned without a
/// trailing newline.
#[must_use]
pub fn render_event(event: &EngineEvent) -> Option<String> {
    let text = match event {
        EngineEvent::StateChanged { .. } => return None,
        EngineEvent::OutputChunk(chunk) | EngineEvent::RecommendationChunk(chunk) => {
            return Some(chunk.clone());
        }
        EngineEvent::Status(message) => format!("[status] {message}"),
        EngineEvent::CommandStarted { command, tool } => match tool {
            Some(tool) => format!("$ {command}  [{} / {}]", tool.name, tool.category),
            None => format!("$ {command}"),
        },
        EngineEvent::CommandFinished(record) => {
            format!("\n[{}] in {} ms", record.status, record.duration_ms())
        }
        EngineEvent::FindingAdded(finding) => format!("+ {finding}"),
        EngineEvent::Recommendation(rec) => {
            let mut text = format!("\n> {}", rec.explanation);
            if let Some(rationale) = &rec.rationale {
                let _ = write!(text, "\n  why: {rationale}");
            }
            match &rec.command {
                Some(command) => {
                    let _ = write!(text, "\n  next: {command}");
                }
                None => text.push_str("\n  next: none"),
            }
            for alt in &rec.alternatives {
                let _ = write!(text, "\n  or:   {alt}");
            }
            text
        }
        EngineEvent::ApprovalRequired { command, verdict } => {
            format!("? {command}\n  {verdict}\n  /approve or /reject")
        }
        EngineEvent::Blocked { command, verdict } => {
            format!("! blocked: {command}\n  {} ({})", verdict.reason, verdict.rule)
        }
        EngineEvent::Rejected { command } => format!("- rejected: {command}"),
        EngineEvent::BackendFailed { kind, message } => format!("! {kind}: {message}"),
        EngineEvent::BackendChanged { id } => format!("backend: {id}"),
        EngineEvent::TargetChanged { target } => format!("target: {target}"),
    };
    Some(format!("{text}\n"))
}

#[must_use]
pub fn render_findings(session: &Session) -> String {
    if session.findings().is_empty() {
        return "no findings yet".to_owned();
    }
    session
        .findings()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[must_use]
pub fn render_history(session: &Session) -> String {
    if session.records().is_empty() {
        return "no commands yet".to_owned();
    }
    session
        .records()
        .iter()
        .map(|r| format!("#{} {} ({})", r.id, r.command, r.status))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use pentra_core::{EngineState, NewRecord};
    use pentra_tools::{CommandStatus, SafetyVerdict, Verdict};

    use super::*;

    #[test]
    fn plain_lines_run() {
        assert_eq!(Input::parse("  nmap -sV 10.0.0.5 "), Input::Run("nmap -sV 10.0.0.5".into()));
        assert_eq!(Input::parse("   "), Input::Empty);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(Input::parse("/approve"), Input::Approve);
        assert_eq!(Input::parse("/y"), Input::Approve);
        assert_eq!(Input::parse("/reject"), Input::Reject);
        assert_eq!(Input::parse("/target 10.0.0.5"), Input::Target("10.0.0.5".into()));
        assert_eq!(Input::parse("/backend claude"), Input::Backend("claude".into()));
        assert_eq!(Input::parse("/backend"), Input::Backends);
        assert_eq!(Input::parse("/save"), Input::Save(None));
        assert_eq!(Input::parse("/save out.json"), Input::Save(Some("out.json".into())));
        assert_eq!(Input::parse("/quit"), Input::Quit);
    }

    #[test]
    fn malformed_slash_commands_are_unknown() {
        assert_eq!(Input::parse("/target"), Input::Unknown("/target".into()));
        assert_eq!(Input::parse("/approve now"), Input::Unknown("/approve now".into()));
        assert_eq!(Input::parse("/frobnicate"), Input::Unknown("/frobnicate".into()));
    }

    #[test]
    fn state_changes_are_silent() {
        assert!(
            render_event(&EngineEvent::StateChanged {
                from: EngineState::Idle,
                to: EngineState::Executing,
            })
            .is_none()
        );
    }

    #[test]
    fn output_chunks_pass_through() {
        assert_eq!(render_event(&EngineEvent::OutputChunk("80/tcp".into())).unwrap(), "80/tcp");
    }

    #[test]
    fn blocked_event_names_rule() {
        let text = render_event(&EngineEvent::Blocked {
            command: "rm -rf /".into(),
            verdict: SafetyVerdict {
                verdict: Verdict::Block,
                rule: "root-deletion".into(),
                reason: "recursive deletion of the filesystem root".into(),
            },
        })
        .unwrap();
        assert!(text.contains("rm -rf /"));
        assert!(text.contains("root-deletion"));
    }

    #[test]
    fn history_lists_records() {
        let mut session = Session::new(None, "ollama");
        assert_eq!(render_history(&session), "no commands yet");
        let now = chrono::Utc::now();
        session.append_record(NewRecord {
            command: "whoami".into(),
            output: "root".into(),
            tool: None,
            status: CommandStatus::Exited { code: 0 },
            issued_at: now,
            finished_at: now,
        });
        assert_eq!(render_history(&session), "#1 whoami (exited with code 0)");
        assert_eq!(render_findings(&session), "no findings yet");
    }
}
