//! Allow/confirm/block classification of candidate commands.

use std::fmt;

use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{RuleMatchKind, SafetyConfig, SafetyRuleConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Confirm,
    Block,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allow => "allow",
            Self::Confirm => "confirm",
            Self::Block => "block",
        })
    }
}

/// Classification result plus the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub verdict: Verdict,
    /// Id of the matching rule, or `default` when nothing matched.
    pub rule: String,
    pub reason: String,
}

impl SafetyVerdict {
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.verdict == Verdict::Block
    }
}

impl fmt::Display for SafetyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.verdict, self.rule, self.reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SafetyConfigError {
    #[error("safety rule '{id}' has an invalid regex: {source}")]
    InvalidRegex {
        id: String,
        #[source]
        source: regex::Error,
    },

    #[error("safety rule '{id}' has an invalid glob: {source}")]
    InvalidGlob {
        id: String,
        #[source]
        source: glob::PatternError,
    },
}

#[derive(Debug, Clone)]
enum RuleMatcher {
    Regex(Regex),
    Glob(Pattern),
    Substring(String),
}

impl RuleMatcher {
    fn matches_single(&self, normalized: &str, lowered: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(normalized),
            Self::Glob(pat) => pat.matches(lowered),
            Self::Substring(s) => lowered.contains(s.as_str()),
        }
    }
}

/// One ordered pattern rule.
#[derive(Debug, Clone)]
pub struct SafetyRule {
    pub id: String,
    pub description: String,
    pub verdict: Verdict,
    matcher: RuleMatcher,
}

impl SafetyRule {
    /// Build a regex rule. Patterns are matched case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns `SafetyConfigError::InvalidRegex` if `pattern` does not compile.
    pub fn regex(
        id: impl Into<String>,
        description: impl Into<String>,
        pattern: &str,
        verdict: Verdict,
    ) -> Result<Self, SafetyConfigError> {
        let id = id.into();
        let matcher = Regex::new(&format!("(?i){pattern}"))
            .map_err(|source| SafetyConfigError::InvalidRegex {
                id: id.clone(),
                source,
            })?;
        Ok(Self {
            id,
            description: description.into(),
            verdict,
            matcher: RuleMatcher::Regex(matcher),
        })
    }

    /// Build a rule from its config entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is not a valid regex or glob.
    pub fn from_config(config: &SafetyRuleConfig) -> Result<Self, SafetyConfigError> {
        let description = format!("matched configured rule '{}'", config.id);
        match config.match_kind {
            RuleMatchKind::Regex => {
                Self::regex(&config.id, description, &config.pattern, config.verdict)
            }
            RuleMatchKind::Glob => {
                let pattern = Pattern::new(&config.pattern.to_lowercase()).map_err(|source| {
                    SafetyConfigError::InvalidGlob {
                        id: config.id.clone(),
                        source,
                    }
                })?;
                Ok(Self {
                    id: config.id.clone(),
                    description,
                    verdict: config.verdict,
                    matcher: RuleMatcher::Glob(pattern),
                })
            }
            RuleMatchKind::Substring => Ok(Self {
                id: config.id.clone(),
                description,
                verdict: config.verdict,
                matcher: RuleMatcher::Substring(config.pattern.to_lowercase()),
            }),
        }
    }

    /// An `allow` rule must cover the whole command line; `confirm` and
    /// `block` rules also fire on any chained segment.
    fn matches(&self, normalized: &str, lowered: &str) -> bool {
        if self.matcher.matches_single(normalized, lowered) {
            return true;
        }
        if self.verdict == Verdict::Allow {
            return false;
        }
        split_segments(lowered)
            .zip(split_segments(normalized))
            .any(|(low, norm)| self.matcher.matches_single(norm, low))
    }
}

fn split_segments(command: &str) -> impl Iterator<Item = &str> {
    command
        .split(['&', ';', '|', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Collapse whitespace and drop shell quoting, so `rm -rf '/'` and
/// `rm -rf \/` read the same as `rm -rf /`.
fn normalize(command: &str) -> String {
    let mut unquoted = String::with_capacity(command.len());
    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {}
            '\\' => unquoted.extend(chars.next()),
            c => unquoted.push(c),
        }
    }
    unquoted.split_whitespace().collect::<Vec<_>>().join(" ")
}

const BLOCK_RULES: &[(&str, &str, &str)] = &[
    (
        "root-deletion",
        "recursive deletion of the filesystem root",
        r"\brm\s+(?:[^\s;&|]+\s+)*?(?:-[a-z]*r[a-z]*|--recursive)\s+(?:[^\s;&|]+\s+)*/+(?:(?:\*|\.{1,2})/*)*(?:\s|$|[;&|])",
    ),
    (
        "raw-device-write",
        "write to a raw block device",
        r"(?:\bdd\b[^;&|]*\bof=/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk|mapper/)|>\s*/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk)|\b(?:shred|wipefs)\b[^;&|]*/dev/)",
    ),
    (
        "fork-bomb",
        "fork bomb",
        r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;?\s*:",
    ),
    (
        "filesystem-format",
        "filesystem format invocation",
        r"\b(?:mkfs(?:\.\w+)?|mke2fs|mkswap|newfs)\b",
    ),
    (
        "recursive-root-permissions",
        "recursive ownership or permission change on the filesystem root",
        r"\bch(?:mod|own|grp)\s+(?:-\w+\s+)*-[a-z]*r[a-z]*\s+(?:-\w+\s+)*\S+\s+/(?:\s|$|[;&|])",
    ),
];

const CONFIRM_RULES: &[(&str, &str, &str)] = &[
    (
        "power-state",
        "changes the machine's power state",
        r"\b(?:shutdown|reboot|halt|poweroff)\b|\binit\s+[06]\b",
    ),
    (
        "home-deletion",
        "recursive deletion of a home directory",
        r"\brm\s+(?:-\S+\s+)*(?:~|\$home)/?(?:\s|$|[;&|])",
    ),
    (
        "firewall-flush",
        "flushes local firewall rules",
        r"\b(?:iptables|ip6tables|nft)\s+(?:-\S+\s+)*(?:-f\b|flush\b)",
    ),
    (
        "package-removal",
        "removes installed packages",
        r"\b(?:apt|apt-get|yum|dnf|pacman)\s+(?:-\S+\s+)*(?:remove|purge|autoremove|-r)\b",
    ),
    (
        "remote-script-exec",
        "pipes a downloaded script into a shell",
        r"\b(?:curl|wget)\b[^|;&]*\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b",
    ),
];

fn builtin(rules: &[(&str, &str, &str)], verdict: Verdict) -> Vec<SafetyRule> {
    rules
        .iter()
        .filter_map(|(id, description, pattern)| {
            SafetyRule::regex(*id, *description, pattern, verdict)
                .inspect_err(|e| tracing::error!("built-in safety rule rejected: {e}"))
                .ok()
        })
        .collect()
}

/// Ordered rule list evaluated first-match-wins.
///
/// Evaluation order is built-in `block` rules, then configured rules in file
/// order, then built-in `confirm` rules. Unmatched commands get `confirm`, or
/// `allow` in auto-execute mode. Auto-execute never relaxes a rule match.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    rules: Vec<SafetyRule>,
    auto_execute: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::new(false)
    }
}

impl SafetyPolicy {
    /// Policy with only the built-in rules.
    #[must_use]
    pub fn new(auto_execute: bool) -> Self {
        let mut rules = builtin(BLOCK_RULES, Verdict::Block);
        rules.extend(builtin(CONFIRM_RULES, Verdict::Confirm));
        Self {
            rules,
            auto_execute,
        }
    }

    /// Built-in rules with the configured rules spliced in after the block list.
    ///
    /// # Errors
    ///
    /// Returns `SafetyConfigError` for the first configured rule that fails to compile.
    pub fn from_config(config: &SafetyConfig) -> Result<Self, SafetyConfigError> {
        let mut rules = builtin(BLOCK_RULES, Verdict::Block);
        for rule in &config.rules {
            rules.push(SafetyRule::from_config(rule)?);
        }
        rules.extend(builtin(CONFIRM_RULES, Verdict::Confirm));
        Ok(Self {
            rules,
            auto_execute: config.auto_execute,
        })
    }

    #[must_use]
    pub fn auto_execute(&self) -> bool {
        self.auto_execute
    }

    pub fn set_auto_execute(&mut self, enabled: bool) {
        self.auto_execute = enabled;
    }

    #[must_use]
    pub fn rules(&self) -> &[SafetyRule] {
        &self.rules
    }

    #[must_use]
    pub fn classify(&self, command: &str) -> SafetyVerdict {
        let normalized = normalize(command);
        let lowered = normalized.to_lowercase();

        if let Some(rule) = self.rules.iter().find(|r| r.matches(&normalized, &lowered)) {
            tracing::debug!(rule = %rule.id, verdict = %rule.verdict, "safety rule matched");
            return SafetyVerdict {
                verdict: rule.verdict,
                rule: rule.id.clone(),
                reason: rule.description.clone(),
            };
        }

        if self.auto_execute {
            SafetyVerdict {
                verdict: Verdict::Allow,
                rule: "default".into(),
                reason: "no rule matched, auto-execute is on".into(),
            }
        } else {
            SafetyVerdict {
                verdict: Verdict::Confirm,
                rule: "default".into(),
                reason: "no rule matched, operator approval required".into(),
            }
        }
    }
}
