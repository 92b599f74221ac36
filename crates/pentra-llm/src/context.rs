use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::provider::Message;

pub const SYSTEM_PROMPT: &str = "\
You are a penetration testing assistant working alongside a human operator \
inside an authorized engagement. You are shown the target, the most recent \
commands with their (possibly truncated) output, and the findings extracted \
so far. Recommend exactly one next step.

Answer in this format:

**Analysis:** what the latest output shows and what it means for the engagement.
**Recommended Action:** the next step in one sentence.
**Command:** a single shell command to run next, or `none` if no command is needed.
**Explanation:** why this step follows from the evidence.
**Confidence:** low, medium, or high.
**Alternative Options:** optional bullet list of other approaches.

Never propose destructive commands against the local host. Prefer \
non-intrusive enumeration before exploitation.";

/// One prior command as presented to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub command: String,
    pub status: String,
    pub output: String,
}

/// Everything a backend sees for one turn, already truncated to its limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnContext {
    pub target: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub findings: Vec<String>,
    pub hints: Vec<String>,
    pub framing: String,
}

impl TurnContext {
    /// Render the user-facing prompt body.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let target = self.target.as_deref().unwrap_or("not set");
        let _ = writeln!(out, "Target: {target}");

        if !self.history.is_empty() {
            out.push_str("\nRecent commands:\n");
            for entry in &self.history {
                let _ = write!(
                    out,
                    "\n$ {}\n[{}]\n{}\n",
                    entry.command,
                    entry.status,
                    entry.output.trim_end()
                );
            }
        }

        if !self.findings.is_empty() {
            out.push_str("\nFindings so far:\n");
            for finding in &self.findings {
                let _ = writeln!(out, "- {finding}");
            }
        }

        if !self.hints.is_empty() {
            out.push_str("\nSuggested follow-ups:\n");
            for hint in &self.hints {
                let _ = writeln!(out, "- {hint}");
            }
        }

        if !self.framing.is_empty() {
            let _ = write!(out, "\n{}", self.framing);
        }
        out
    }

    #[must_use]
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(SYSTEM_PROMPT), Message::user(self.render())]
    }

    /// Size of the rendered prompt in chars, system prompt included.
    #[must_use]
    pub fn rendered_len(&self) -> usize {
        SYSTEM_PROMPT.chars().count() + self.render().chars().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Role;

    fn sample() -> TurnContext {
        TurnContext {
            target: Some("10.0.0.5".into()),
            history: vec![HistoryEntry {
                command: "nmap -sV 10.0.0.5".into(),
                status: "exit 0".into(),
                output: "80/tcp open http\n".into(),
            }],
            findings: vec!["[info] service: 80/tcp http".into()],
            hints: vec!["web server on 80: try nikto".into()],
            framing: "What should be done next?".into(),
        }
    }

    #[test]
    fn render_includes_all_sections_in_order() {
        let text = sample().render();
        let target = text.find("Target: 10.0.0.5").unwrap();
        let command = text.find("$ nmap -sV 10.0.0.5").unwrap();
        let finding = text.find("- [info] service").unwrap();
        let hint = text.find("- web server on 80").unwrap();
        let framing = text.find("What should be done next?").unwrap();
        assert!(target < command && command < finding && finding < hint && hint < framing);
    }

    #[test]
    fn render_without_target() {
        let text = TurnContext::default().render();
        assert!(text.starts_with("Target: not set"));
        assert!(!text.contains("Recent commands"));
    }

    #[test]
    fn messages_have_system_then_user() {
        let messages = sample().to_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("**Command:**"));
        assert_eq!(messages[1].role, Role::User);
    }
}
