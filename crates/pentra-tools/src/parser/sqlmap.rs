use std::sync::LazyLock;

use regex::Regex;

use super::{ToolParser, strip_marker};
use crate::finding::{Confidence, Finding, FindingKind, Severity};

static PARAMETER_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Parameter:\s*(.+?)\s+\((.+?)\)\s*$").expect("valid parameter regex")
});

static VULNERABLE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\w+) parameter '([^']+)' (?:is|appears to be) .*(?:vulnerable|injectable)")
        .expect("valid vulnerable regex")
});

static BACKEND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)back-end DBMS:\s*(.+?)\s*$").expect("valid backend regex"));

static TIMESTAMP_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\d{2}:\d{2}:\d{2}\]\s*\[\w+\]\s*").expect("valid timestamp regex")
});

#[derive(Debug, Default, Clone, Copy)]
pub struct SqlmapParser;

struct Injection {
    parameter: String,
    place: String,
    techniques: Vec<String>,
    confirmed: bool,
}

impl Injection {
    fn into_finding(self) -> Finding {
        let techniques = if self.techniques.is_empty() {
            String::new()
        } else {
            format!("; techniques: {}", self.techniques.join(", "))
        };
        let confidence = if self.confirmed {
            Confidence::High
        } else {
            Confidence::Medium
        };
        Finding::new(
            "sqlmap",
            FindingKind::Vulnerability,
            Severity::Critical,
            format!(
                "SQL injection in {} parameter '{}'{techniques}",
                self.place, self.parameter
            ),
        )
        .with_confidence(confidence)
    }
}

impl ToolParser for SqlmapParser {
    fn name(&self) -> &'static str {
        "sqlmap"
    }

    fn recognizes(&self, output: &str) -> bool {
        output.contains("sqlmap.org") || output.contains("back-end DBMS") || output.contains("sqlmap identified")
    }

    fn parse(&self, output: &str) -> Vec<Finding> {
        let mut findings = Vec::new();
        let mut injections: Vec<Injection> = Vec::new();
        let mut in_databases = false;
        let mut databases: Vec<String> = Vec::new();

        for raw_line in output.lines() {
            let line = raw_line.trim();
            let message = TIMESTAMP_PREFIX.replace(line, "");
            let message = message.as_ref();

            if in_databases {
                if let Some(name) = line.strip_prefix("[*]") {
                    databases.push(name.trim().to_owned());
                    continue;
                }
                in_databases = false;
            }

            if let Some(caps) = PARAMETER_BLOCK.captures(line) {
                let parameter = caps[1].to_owned();
                let place = caps[2].to_owned();
                if let Some(existing) = injections
                    .iter_mut()
                    .find(|i| i.parameter == parameter && i.place == place)
                {
                    existing.confirmed = true;
                } else {
                    injections.push(Injection {
                        parameter,
                        place,
                        techniques: Vec::new(),
                        confirmed: true,
                    });
                }
                continue;
            }

            if let Some(technique) = line.strip_prefix("Type:") {
                if let Some(current) = injections.last_mut() {
                    let technique = technique.trim().to_owned();
                    if !current.techniques.contains(&technique) {
                        current.techniques.push(technique);
                    }
                }
                continue;
            }

            if let Some(caps) = VULNERABLE_LINE.captures(message) {
                let place = caps[1].to_owned();
                let parameter = caps[2].to_owned();
                if !injections
                    .iter()
                    .any(|i| i.parameter == parameter && i.place == place)
                {
                    injections.push(Injection {
                        parameter,
                        place,
                        techniques: Vec::new(),
                        confirmed: false,
                    });
                }
                continue;
            }

            if let Some(caps) = BACKEND.captures(message) {
                findings.push(Finding::new(
                    "sqlmap",
                    FindingKind::Service,
                    Severity::Info,
                    format!("back-end DBMS {}", &caps[1]),
                ));
                continue;
            }

            let lower = message.to_lowercase();
            if lower.starts_with("current user is dba:") {
                if lower.ends_with("true") {
                    findings.push(Finding::new(
                        "sqlmap",
                        FindingKind::Vulnerability,
                        Severity::High,
                        "database user has DBA privileges",
                    ));
                }
            } else if lower.starts_with("current user:") {
                let user = message["current user:".len()..].trim().trim_matches(['\'', '"']);
                findings.push(Finding::new(
                    "sqlmap",
                    FindingKind::Other,
                    Severity::Info,
                    format!("database current user {user}"),
                ));
            } else if lower.starts_with("web server operating system:") {
                let os = strip_marker(&message["web server operating system:".len()..]);
                findings.push(Finding::new(
                    "sqlmap",
                    FindingKind::Other,
                    Severity::Info,
                    format!("web server OS {}", os.trim()),
                ));
            } else if lower.starts_with("available databases") {
                in_databases = true;
            }
        }

        if !databases.is_empty() {
            findings.push(Finding::new(
                "sqlmap",
                FindingKind::Other,
                Severity::Info,
                format!("databases: {}", databases.join(", ")),
            ));
        }

        let mut result: Vec<Finding> = injections.into_iter().map(Injection::into_finding).collect();
        result.extend(findings);
        result
    }
}
