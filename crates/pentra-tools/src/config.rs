use serde::Deserialize;

use crate::safety::Verdict;

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    300
}

fn default_shell() -> String {
    "/bin/bash".into()
}

fn default_rows() -> u16 {
    30
}

fn default_cols() -> u16 {
    200
}

fn default_audit_destination() -> String {
    "stdout".into()
}

/// PTY runner configuration: shell, default timeout, and terminal geometry.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Default command timeout in seconds. `0` disables the timeout.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            timeout: default_timeout(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

/// How a configured safety rule pattern is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMatchKind {
    #[default]
    Regex,
    Glob,
    Substring,
}

/// One operator-supplied safety rule, evaluated in file order.
#[derive(Debug, Clone, Deserialize)]
pub struct SafetyRuleConfig {
    pub id: String,
    pub pattern: String,
    #[serde(default, rename = "match")]
    pub match_kind: RuleMatchKind,
    pub verdict: Verdict,
}

/// Safety gate configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SafetyConfig {
    /// Unmatched commands default to `allow` instead of `confirm`.
    #[serde(default)]
    pub auto_execute: bool,
    #[serde(default)]
    pub rules: Vec<SafetyRuleConfig>,
}

/// Command audit trail configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `stdout` routes entries through `tracing`, anything else is a JSONL file path.
    #[serde(default = "default_audit_destination")]
    pub destination: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            destination: default_audit_destination(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sections {
        #[serde(default)]
        runner: RunnerConfig,
        #[serde(default)]
        safety: SafetyConfig,
        #[serde(default)]
        audit: AuditConfig,
    }

    #[test]
    fn deserialize_omitted_fields_use_defaults() {
        let config: Sections = toml::from_str("").unwrap();
        assert_eq!(config.runner.timeout, 300);
        assert_eq!(config.runner.shell, "/bin/bash");
        assert_eq!((config.runner.rows, config.runner.cols), (30, 200));
        assert!(!config.safety.auto_execute);
        assert!(config.safety.rules.is_empty());
        assert!(config.audit.enabled);
        assert_eq!(config.audit.destination, "stdout");
    }

    #[test]
    fn deserialize_safety_rules_in_order() {
        let toml_str = r#"
            [safety]
            auto_execute = true

            [[safety.rules]]
            id = "no-msf-db-wipe"
            pattern = "msfdb\\s+delete"
            verdict = "block"

            [[safety.rules]]
            id = "recon"
            pattern = "nmap *"
            match = "glob"
            verdict = "allow"
        "#;
        let config: Sections = toml::from_str(toml_str).unwrap();
        assert!(config.safety.auto_execute);
        assert_eq!(config.safety.rules.len(), 2);
        assert_eq!(config.safety.rules[0].id, "no-msf-db-wipe");
        assert_eq!(config.safety.rules[0].match_kind, RuleMatchKind::Regex);
        assert_eq!(config.safety.rules[0].verdict, Verdict::Block);
        assert_eq!(config.safety.rules[1].match_kind, RuleMatchKind::Glob);
        assert_eq!(config.safety.rules[1].verdict, Verdict::Allow);
    }

    #[test]
    fn deserialize_runner_overrides() {
        let toml_str = r#"
            [runner]
            shell = "/bin/sh"
            timeout = 0
        "#;
        let config: Sections = toml::from_str(toml_str).unwrap();
        assert_eq!(config.runner.shell, "/bin/sh");
        assert_eq!(config.runner.timeout, 0);
        assert_eq!(config.runner.cols, 200);
    }

    #[test]
    fn unknown_verdict_rejected() {
        let toml_str = r#"
            [[safety.rules]]
            id = "x"
            pattern = "y"
            verdict = "maybe"
        "#;
        assert!(toml::from_str::<Sections>(toml_str).is_err());
    }
}
