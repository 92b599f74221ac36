use std::pin::Pin;
use std::sync::LazyLock;
use std::task::{Context, Poll};

use futures_core::Stream;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::provider::ChatStream;

static SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:#+\s*)?\*{0,2}\s*(analysis|recommended action|next step|command|explanation|rationale|confidence|alternative options|alternatives)\s*\*{0,2}\s*:\s*\*{0,2}\s*(.*)$",
    )
    .expect("valid section regex")
});

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*(bash|sh|shell|zsh|console)?[ \t]*\n(.*?)```").expect("valid fence regex")
});

/// An AI-proposed next step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub explanation: String,
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Analysis,
    Action,
    Command,
    Explanation,
    Confidence,
    Alternatives,
}

impl Section {
    fn from_label(label: &str) -> Self {
        match label.to_lowercase().as_str() {
            "analysis" => Self::Analysis,
            "recommended action" | "next step" => Self::Action,
            "command" => Self::Command,
            "explanation" | "rationale" => Self::Explanation,
            "confidence" => Self::Confidence,
            _ => Self::Alternatives,
        }
    }
}

#[derive(Default)]
struct Sections<'a> {
    preamble: Vec<&'a str>,
    analysis: Vec<&'a str>,
    action: Vec<&'a str>,
    command: Option<Vec<&'a str>>,
    explanation: Vec<&'a str>,
    confidence: Vec<&'a str>,
    alternatives: Vec<&'a str>,
}

impl<'a> Sections<'a> {
    fn bucket(&mut self, section: Option<Section>) -> &mut Vec<&'a str> {
        match section {
            None => &mut self.preamble,
            Some(Section::Analysis) => &mut self.analysis,
            Some(Section::Action) => &mut self.action,
            Some(Section::Command) => self.command.get_or_insert_with(Vec::new),
            Some(Section::Explanation) => &mut self.explanation,
            Some(Section::Confidence) => &mut self.confidence,
            Some(Section::Alternatives) => &mut self.alternatives,
        }
    }

    fn split(text: &'a str) -> (Self, bool) {
        let mut sections = Self::default();
        let mut current = None;
        let mut found_any = false;
        let mut in_fence = false;

        for line in text.lines() {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }
            if !in_fence
                && let Some(caps) = SECTION.captures(line)
                && let (Some(label), Some(rest)) = (caps.get(1), caps.get(2))
            {
                found_any = true;
                let section = Section::from_label(label.as_str());
                current = Some(section);
                let bucket = sections.bucket(current);
                if !rest.as_str().trim().is_empty() {
                    bucket.push(rest.as_str());
                }
                continue;
            }
            sections.bucket(current).push(line);
        }
        (sections, found_any)
    }
}

fn join_prose(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

fn is_placeholder(command: &str) -> bool {
    let lower = command.trim().trim_end_matches('.').to_lowercase();
    matches!(
        lower.as_str(),
        "" | "none" | "n/a" | "na" | "-" | "no command" | "nothing" | "[exact command to run]"
    ) || lower.starts_with("none ")
        || lower.starts_with("none,")
        || lower.starts_with("no command ")
}

fn first_command_line(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.strip_prefix("$ ").unwrap_or(l).trim().to_owned())
}

fn extract_command(lines: &[&str]) -> Option<String> {
    let joined = lines.join("\n");
    let candidate = if let Some(caps) = FENCE.captures(&joined) {
        first_command_line(caps.get(2).map_or("", |m| m.as_str()))?
    } else {
        let line = first_command_line(&joined)?;
        line.trim_matches('`').trim().to_owned()
    };
    if is_placeholder(&candidate) {
        None
    } else {
        Some(candidate)
    }
}

fn fenced_fallback(text: &str) -> Option<String> {
    FENCE
        .captures_iter(text)
        .filter_map(|caps| first_command_line(caps.get(2).map_or("", |m| m.as_str())))
        .find(|c| !is_placeholder(c))
}

impl Recommendation {
    /// Parse a free-text backend answer.
    ///
    /// Returns `None` for empty answers. Answers that ignore the section format
    /// still produce a recommendation: the whole text becomes the explanation
    /// and the first fenced shell block, if any, the command.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let (sections, structured) = Sections::split(text);
        if !structured {
            return Some(Self {
                explanation: text.to_owned(),
                command: fenced_fallback(text),
                ..Self::default()
            });
        }

        let mut explanation = join_prose(&sections.analysis);
        let action = join_prose(&sections.action);
        if !action.is_empty() {
            if !explanation.is_empty() {
                explanation.push_str("\n\n");
            }
            explanation.push_str(&action);
        }
        if explanation.is_empty() {
            explanation = join_prose(&sections.preamble);
        }

        let command = match &sections.command {
            Some(lines) => extract_command(lines),
            None => fenced_fallback(text),
        };

        let confidence = sections
            .confidence
            .first()
            .and_then(|l| l.split_whitespace().next())
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .and_then(non_empty);

        let alternatives = sections
            .alternatives
            .iter()
            .map(|l| l.trim())
            .filter_map(|l| {
                l.strip_prefix("- ")
                    .or_else(|| l.strip_prefix("• "))
                    .or_else(|| l.strip_prefix("* "))
            })
            .map(|l| l.trim().to_owned())
            .filter(|l| !l.is_empty())
            .collect();

        Some(Self {
            explanation,
            command,
            rationale: non_empty(join_prose(&sections.explanation)),
            confidence,
            alternatives,
        })
    }

    #[must_use]
    pub fn has_command(&self) -> bool {
        self.command.is_some()
    }
}

/// One element of a streaming completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Chunk(String),
    /// Terminal element; `None` when the answer held nothing usable.
    Done(Option<Recommendation>),
}

/// Finite, non-restartable stream of text chunks ending in one
/// [`StreamItem::Done`].
///
/// An error from the underlying backend stream ends the sequence without a
/// `Done` element.
pub struct RecommendationStream {
    inner: Option<ChatStream>,
    buffer: String,
}

impl RecommendationStream {
    #[must_use]
    pub fn new(inner: ChatStream) -> Self {
        Self {
            inner: Some(inner),
            buffer: String::new(),
        }
    }
}

impl std::fmt::Debug for RecommendationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecommendationStream")
            .field("finished", &self.inner.is_none())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl Stream for RecommendationStream {
    type Item = Result<StreamItem, BackendError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.buffer.push_str(&chunk);
                Poll::Ready(Some(Ok(StreamItem::Chunk(chunk))))
            }
            Poll::Ready(Some(Err(e))) => {
                this.inner = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.inner = None;
                let text = std::mem::take(&mut this.buffer);
                Poll::Ready(Some(Ok(StreamItem::Done(Recommendation::parse(&text)))))
            }
        }
    }
}
