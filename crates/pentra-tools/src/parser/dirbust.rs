use std::sync::LazyLock;

use regex::Regex;

use super::ToolParser;
use crate::finding::{Finding, FindingKind, Severity};

static GOBUSTER_HIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(/\S*)\s+\(Status:\s*(\d{3})\)\s*\[Size:\s*(\d+)\](?:\s*\[-->\s*(\S+?)\])?")
        .expect("valid gobuster regex")
});

static DIRB_HIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\+\s+(\S+)\s+\(CODE:(\d{3})\|SIZE:(\d+)\)").expect("valid dirb regex")
});

static DIRB_DIRECTORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^==> DIRECTORY:\s+(\S+)").expect("valid dirb dir regex"));

static FFUF_HIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)\s+\[Status:\s*(\d{3}),\s*Size:\s*(\d+)").expect("valid ffuf regex")
});

static FEROX_HIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{3})\s+\w+\s+\d+l\s+\d+w\s+(\d+)c\s+(\S+)").expect("valid ferox regex")
});

static DNS_HIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Found:\s+(\S+\.\S+)\s*$").expect("valid dns regex"));

/// Paths whose mere presence leaks source, secrets, or backups.
const SENSITIVE: &[&str] = &[
    ".git", ".svn", ".env", ".htpasswd", ".ds_store", "backup", ".bak", ".old", ".sql", "dump",
    "config", "phpinfo", "web.config", "id_rsa",
];

const INTERESTING: &[&str] = &[
    "admin",
    "login",
    "upload",
    "api",
    "dashboard",
    "manager",
    "console",
    "phpmyadmin",
    "wp-admin",
    "private",
    "secret",
    "debug",
];

/// Parser shared by gobuster, dirb, ffuf, and feroxbuster.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirBustParser;

struct Hit<'a> {
    path: &'a str,
    status: u16,
    size: Option<&'a str>,
    redirect: Option<&'a str>,
}

fn finding_for(hit: &Hit<'_>) -> Finding {
    let lower = hit.path.to_lowercase();
    let size = hit.size.map(|s| format!(", size {s}")).unwrap_or_default();
    let redirect = hit.redirect.map(|r| format!(" -> {r}")).unwrap_or_default();
    let summary = format!("{} (status {}{size}){redirect}", hit.path, hit.status);
    let reachable = (200..400).contains(&hit.status);

    if reachable && SENSITIVE.iter().any(|s| lower.contains(s)) {
        return Finding::new(
            "dirbust",
            FindingKind::Misconfiguration,
            Severity::Medium,
            format!("exposed sensitive path {summary}"),
        );
    }
    if INTERESTING.iter().any(|s| lower.contains(s)) {
        return Finding::new(
            "dirbust",
            FindingKind::Other,
            Severity::Low,
            format!("interesting path {summary}"),
        );
    }
    let label = if matches!(hit.status, 401 | 403) {
        "restricted path"
    } else {
        "discovered path"
    };
    Finding::new(
        "dirbust",
        FindingKind::Other,
        Severity::Info,
        format!("{label} {summary}"),
    )
}

impl ToolParser for DirBustParser {
    fn name(&self) -> &'static str {
        "dirbust"
    }

    fn recognizes(&self, output: &str) -> bool {
        output.contains("Gobuster v")
            || output.contains("DIRB v")
            || output.contains("(Status: ")
            || output.contains("(CODE:")
            || output.contains("[Status: ")
            || output.contains("feroxbuster")
    }

    fn parse(&self, output: &str) -> Vec<Finding> {
        let mut findings = Vec::new();

        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let hit = if let Some(caps) = GOBUSTER_HIT.captures(line) {
                caps[2].parse().ok().map(|status| Hit {
                    path: caps.get(1).map_or("", |m| m.as_str()),
                    status,
                    size: caps.get(3).map(|m| m.as_str()),
                    redirect: caps.get(4).map(|m| m.as_str()),
                })
            } else if let Some(caps) = DIRB_HIT.captures(line) {
                caps[2].parse().ok().map(|status| Hit {
                    path: caps.get(1).map_or("", |m| m.as_str()),
                    status,
                    size: caps.get(3).map(|m| m.as_str()),
                    redirect: None,
                })
            } else if let Some(caps) = FFUF_HIT.captures(line) {
                caps[2].parse().ok().map(|status| Hit {
                    path: caps.get(1).map_or("", |m| m.as_str()),
                    status,
                    size: caps.get(3).map(|m| m.as_str()),
                    redirect: None,
                })
            } else if let Some(caps) = FEROX_HIT.captures(line) {
                caps[1].parse().ok().map(|status| Hit {
                    path: caps.get(3).map_or("", |m| m.as_str()),
                    status,
                    size: caps.get(2).map(|m| m.as_str()),
                    redirect: None,
                })
            } else {
                None
            };

            if let Some(hit) = hit {
                findings.push(finding_for(&hit));
                continue;
            }

            if let Some(caps) = DIRB_DIRECTORY.captures(line) {
                findings.push(finding_for(&Hit {
                    path: caps.get(1).map_or("", |m| m.as_str()),
                    status: 200,
                    size: None,
                    redirect: None,
                }));
            } else if let Some(caps) = DNS_HIT.captures(line) {
                findings.push(Finding::new(
                    "dirbust",
                    FindingKind::Other,
                    Severity::Info,
                    format!("subdomain {}", &caps[1]),
                ));
            }
        }

        findings
    }
}
