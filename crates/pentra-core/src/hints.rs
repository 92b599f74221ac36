//! Rule-based follow-up suggestions derived from findings.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use pentra_tools::{FindingKind, Severity};

use crate::session::RecordedFinding;

static PORT_SERVICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,5})/(?:tcp|udp)\s+(\S+)").expect("valid port service regex")
});

/// Coarse engagement phase used to frame the next-step request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Reconnaissance,
    Enumeration,
    Exploitation,
    PostExploitation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reconnaissance => "reconnaissance",
            Self::Enumeration => "enumeration",
            Self::Exploitation => "exploitation",
            Self::PostExploitation => "post-exploitation",
        })
    }
}

/// Phase implied by what has been found so far.
#[must_use]
pub fn current_phase(findings: &[RecordedFinding]) -> Phase {
    let mut phase = Phase::Reconnaissance;
    for f in findings {
        let reached = match f.finding.kind {
            FindingKind::Credential => Phase::PostExploitation,
            FindingKind::Vulnerability if f.finding.severity >= Severity::High => Phase::Exploitation,
            FindingKind::OpenPort | FindingKind::Service => Phase::Enumeration,
            _ => continue,
        };
        if f.finding.source == "metasploit" && f.finding.severity == Severity::Critical {
            return Phase::PostExploitation;
        }
        phase = phase.max(reached);
    }
    phase
}

fn web_scheme(port: u16, service: &str) -> &'static str {
    if matches!(port, 443 | 8443) || service.contains("https") || service.contains("ssl") {
        "https"
    } else {
        "http"
    }
}

fn port_hints(port: u16, service: &str, target: &str) -> Vec<String> {
    let service = service.trim_end_matches('?').to_lowercase();
    let web = matches!(port, 80 | 443 | 8000 | 8080 | 8443) || service.starts_with("http");
    if web {
        let scheme = web_scheme(port, &service);
        return vec![
            format!("nikto -h {scheme}://{target}:{port}"),
            format!(
                "gobuster dir -u {scheme}://{target}:{port} -w /usr/share/wordlists/dirb/common.txt"
            ),
        ];
    }
    match (port, service.as_str()) {
        (139 | 445, _) | (_, "microsoft-ds" | "netbios-ssn") => vec![
            format!("enum4linux -a {target}"),
            format!("smbclient -L //{target} -N"),
        ],
        (21, _) | (_, "ftp") => vec![format!("ftp {target} (try anonymous login)")],
        (22, _) | (_, "ssh") => vec![format!("ssh-audit {target}")],
        (3306, _) | (_, "mysql") => vec![format!(
            "nmap -p {port} --script mysql-info,mysql-empty-password {target}"
        )],
        _ => Vec::new(),
    }
}

/// Concrete follow-up commands for well-known ports and credentials, deduplicated.
#[must_use]
pub fn follow_up_hints(findings: &[RecordedFinding], target: Option<&str>) -> Vec<String> {
    let target = target.unwrap_or("<target>");
    let mut hints: Vec<String> = Vec::new();
    let mut push = |hint: String| {
        if !hints.contains(&hint) {
            hints.push(hint);
        }
    };

    for f in findings {
        match f.finding.kind {
            FindingKind::OpenPort | FindingKind::Service => {
                if let Some(caps) = PORT_SERVICE.captures(&f.finding.description)
                    && let Ok(port) = caps[1].parse::<u16>()
                {
                    for hint in port_hints(port, &caps[2], target) {
                        push(hint);
                    }
                }
            }
            FindingKind::Credential => {
                push("reuse the recovered credentials against other exposed services".to_owned());
            }
            _ => {}
        }
    }
    hints
}
