use std::sync::LazyLock;

use regex::Regex;

use super::ToolParser;
use crate::finding::{Confidence, Finding, FindingKind, Severity};

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(OSVDB-\d+|CVE-\d{4}-\d+)").expect("valid reference regex"));

/// Keyword table, checked from most to least severe.
const SEVERITY_KEYWORDS: &[(Severity, &[&str])] = &[
    (
        Severity::Critical,
        &["sql injection", "command injection", "remote code execution", "rce"],
    ),
    (
        Severity::High,
        &[
            "authentication bypass",
            "directory traversal",
            "file inclusion",
            "arbitrary file",
            "default account",
            "password",
        ],
    ),
    (
        Severity::Medium,
        &[
            "xss",
            "cross-site scripting",
            "csrf",
            "information disclosure",
            "phpinfo",
            "put method",
            "'put'",
            "'delete'",
        ],
    ),
    (
        Severity::Low,
        &["outdated", "version disclosure", "banner", "etag", "inode"],
    ),
];

/// Metadata lines that describe the scan rather than the target.
const METADATA_PREFIXES: &[&str] = &[
    "Target IP:",
    "Target Hostname:",
    "Target Host:",
    "Target Port:",
    "Start Time:",
    "End Time:",
    "SSL Info:",
    "Platform:",
    "Scan terminated:",
    "No CGI Directories found",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct NiktoParser;

fn classify(content: &str) -> Severity {
    let lower = content.to_lowercase();
    SEVERITY_KEYWORDS
        .iter()
        .find(|(_, keywords)| {
            keywords.iter().any(|k| {
                // "rce" and similar short tokens must stand alone
                if k.len() <= 3 {
                    lower
                        .split(|c: char| !c.is_ascii_alphanumeric())
                        .any(|word| word == *k)
                } else {
                    lower.contains(k)
                }
            })
        })
        .map_or(Severity::Info, |(severity, _)| *severity)
}

fn is_header_issue(lower: &str) -> bool {
    lower.contains("header")
        && (lower.contains("not present")
            || lower.contains("not defined")
            || lower.contains("not set")
            || lower.contains("is missing"))
}

impl ToolParser for NiktoParser {
    fn name(&self) -> &'static str {
        "nikto"
    }

    fn recognizes(&self, output: &str) -> bool {
        output.contains("- Nikto v")
            || (output.contains("+ Target IP:") && output.contains("+ Target Port:"))
    }

    fn parse(&self, output: &str) -> Vec<Finding> {
        let mut findings = Vec::new();

        for line in output.lines() {
            let Some(content) = line.trim().strip_prefix('+') else {
                continue;
            };
            let content = content.trim();
            if content.is_empty() || METADATA_PREFIXES.iter().any(|p| content.starts_with(p)) {
                continue;
            }
            if content.ends_with("host(s) tested") || content.contains("requests:") {
                continue;
            }

            if let Some(server) = content.strip_prefix("Server:") {
                let server = server.trim();
                if server.is_empty() || server.eq_ignore_ascii_case("no banner retrieved") {
                    continue;
                }
                findings.push(Finding::new(
                    "nikto",
                    FindingKind::Service,
                    Severity::Info,
                    format!("web server {server}"),
                ));
                continue;
            }

            if let Some(methods) = content.strip_prefix("Allowed HTTP Methods:") {
                let methods = methods.trim();
                let risky = ["PUT", "DELETE", "TRACE"]
                    .iter()
                    .any(|m| methods.split(',').any(|x| x.trim() == *m));
                let (kind, severity) = if risky {
                    (FindingKind::Misconfiguration, Severity::Medium)
                } else {
                    (FindingKind::Other, Severity::Info)
                };
                findings.push(Finding::new(
                    "nikto",
                    kind,
                    severity,
                    format!("allowed HTTP methods: {methods}"),
                ));
                continue;
            }

            let lower = content.to_lowercase();
            let severity = classify(content);
            let has_reference = REFERENCE.is_match(content);
            let kind = if is_header_issue(&lower) {
                FindingKind::Misconfiguration
            } else if severity >= Severity::Medium || has_reference {
                FindingKind::Vulnerability
            } else {
                FindingKind::Other
            };
            let severity = if kind == FindingKind::Misconfiguration {
                severity.max(Severity::Low)
            } else {
                severity
            };

            // Lines nikto wraps mid-sentence lose their tail; keep them at reduced trust.
            let confidence = if content.ends_with('.') || content.ends_with(')') || has_reference {
                Confidence::High
            } else {
                Confidence::Medium
            };

            findings.push(
                Finding::new("nikto", kind, severity, content.to_owned()).with_confidence(confidence),
            );
        }

        findings
    }
}
