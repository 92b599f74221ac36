//! Builds the per-turn AI context from the session, sized to the backend.

use pentra_llm::{HistoryEntry, SYSTEM_PROMPT, TurnContext};
use pentra_tools::{clean_output, truncate_output};

use crate::hints::{current_phase, follow_up_hints};
use crate::session::Session;

/// Token window assumed for backends that do not report one.
pub const DEFAULT_CONTEXT_WINDOW: usize = 8192;

const CHARS_PER_TOKEN: usize = 4;
/// Headers, target line, and separators the renderer adds around the sections.
const SECTION_OVERHEAD: usize = 128;
/// Separators the renderer adds around one history entry.
const ENTRY_OVERHEAD: usize = 8;
/// Slack for the marker `truncate_output` inserts.
const TRUNCATION_MARKER: usize = 48;
/// Smallest output slice worth keeping when the newest record must be cut down.
const MIN_OUTPUT_CHARS: usize = 64;

#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

/// Prompt budget in chars for a window of `context_window` tokens. Half the
/// window is left for the answer.
#[must_use]
pub fn char_budget(context_window: Option<usize>) -> usize {
    context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW) * CHARS_PER_TOKEN / 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSettings {
    /// Most recent records considered before the budget is applied.
    pub history_window: usize,
    /// Per-record output cap, head and tail kept.
    pub max_output_chars: usize,
    pub max_findings: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            history_window: 20,
            max_output_chars: 3000,
            max_findings: 50,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    settings: ContextSettings,
}

impl ContextBuilder {
    #[must_use]
    pub fn new(settings: ContextSettings) -> Self {
        Self { settings }
    }

    #[must_use]
    pub fn settings(&self) -> ContextSettings {
        self.settings
    }

    /// Snapshot the session into a context that fits `context_window`.
    ///
    /// Findings take at most a quarter of the budget, newest first. Records
    /// fill what is left, newest first, and are returned in chronological
    /// order. The newest record is cut down rather than dropped when it alone
    /// exceeds the budget.
    #[must_use]
    pub fn build(&self, session: &Session, context_window: Option<usize>) -> TurnContext {
        let budget = char_budget(context_window);
        let target = session.target().map(str::to_owned);
        let phase = current_phase(session.findings());
        let framing = match target.as_deref() {
            Some(t) => format!(
                "Current phase: {phase}. Recommend the single next step against {t}."
            ),
            None => format!(
                "Current phase: {phase}. No target is set yet; recommend how to establish one."
            ),
        };

        let fixed = SYSTEM_PROMPT.chars().count()
            + framing.chars().count()
            + target.as_deref().map_or(0, |t| t.chars().count())
            + SECTION_OVERHEAD;
        let mut remaining = budget.saturating_sub(fixed);

        let findings_cap = remaining / 4;
        let mut findings = Vec::new();
        let mut findings_used = 0;
        for f in session.findings().iter().rev().take(self.settings.max_findings) {
            let line = f.finding.to_string();
            let cost = line.chars().count() + 3;
            if findings_used + cost > findings_cap {
                break;
            }
            findings_used += cost;
            findings.push(line);
        }
        remaining -= findings_used;

        let mut hints = Vec::new();
        for hint in follow_up_hints(session.findings(), session.target()) {
            let cost = hint.chars().count() + 3;
            if cost > remaining / 2 {
                break;
            }
            remaining -= cost;
            hints.push(hint);
        }

        let mut history = Vec::new();
        for record in session.records().iter().rev().take(self.settings.history_window) {
            let status = record.status.to_string();
            let head_cost = record.command.chars().count() + status.chars().count() + ENTRY_OVERHEAD;
            let mut output = truncate_output(&clean_output(&record.output), self.settings.max_output_chars);
            let mut cost = head_cost + output.chars().count();

            if cost > remaining && history.is_empty() {
                let room = remaining.saturating_sub(head_cost + TRUNCATION_MARKER);
                if room < MIN_OUTPUT_CHARS {
                    break;
                }
                output = truncate_output(&output, room);
                cost = head_cost + output.chars().count();
            }
            if cost > remaining {
                break;
            }
            remaining -= cost;
            history.push(HistoryEntry {
                command: record.command.clone(),
                status,
                output,
            });
        }
        history.reverse();

        tracing::debug!(
            budget,
            records = history.len(),
            of = session.records().len(),
            findings = findings.len(),
            hints = hints.len(),
            "built turn context"
        );

        TurnContext {
            target,
            history,
            findings,
            hints,
            framing,
        }
    }
}
