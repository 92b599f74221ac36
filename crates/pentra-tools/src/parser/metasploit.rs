use std::sync::LazyLock;

use regex::Regex;

use super::{ToolParser, strip_marker};
use crate::finding::{Finding, FindingKind, Severity};

static SESSION_OPENED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(meterpreter|command shell|shell)\s+session\s+(\d+)\s+opened(?:\s+\(([^)]*)\))?")
        .expect("valid session regex")
});

static HASHDUMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^:\s]+):(\d+):([0-9a-fA-F]{32}):([0-9a-fA-F]{32}):::$").expect("valid hashdump regex")
});

static CONSOLE_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(?:msf\d?|meterpreter)\s.*>").expect("valid prompt regex"));

/// Parser for msfconsole module and meterpreter output.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetasploitParser;

impl ToolParser for MetasploitParser {
    fn name(&self) -> &'static str {
        "metasploit"
    }

    fn recognizes(&self, output: &str) -> bool {
        CONSOLE_PROMPT.is_match(output)
            || output.contains("[*] Started reverse")
            || SESSION_OPENED.is_match(output)
    }

    fn parse(&self, output: &str) -> Vec<Finding> {
        let mut findings = Vec::new();

        for raw_line in output.lines() {
            let line = raw_line.trim();

            if let Some(caps) = SESSION_OPENED.captures(line) {
                let endpoints = caps
                    .get(3)
                    .map(|m| format!(" ({})", m.as_str()))
                    .unwrap_or_default();
                findings.push(Finding::new(
                    "metasploit",
                    FindingKind::Vulnerability,
                    Severity::Critical,
                    format!(
                        "exploit succeeded: {} session {} opened{endpoints}",
                        caps[1].to_lowercase(),
                        &caps[2]
                    ),
                ));
                continue;
            }

            if let Some(caps) = HASHDUMP.captures(line) {
                findings.push(Finding::new(
                    "metasploit",
                    FindingKind::Credential,
                    Severity::High,
                    format!("NTLM hash for {} (rid {}): {}", &caps[1], &caps[2], &caps[4]),
                ));
                continue;
            }

            if line.starts_with("[+]") {
                let message = strip_marker(line);
                let lower = message.to_lowercase();
                let (kind, severity) = if lower.contains("login successful")
                    || lower.contains("success:")
                    || lower.contains("credential")
                {
                    (FindingKind::Credential, Severity::High)
                } else if lower.contains("vulnerable") {
                    (FindingKind::Vulnerability, Severity::High)
                } else {
                    (FindingKind::Other, Severity::Low)
                };
                findings.push(Finding::new("metasploit", kind, severity, message.to_owned()));
                continue;
            }

            if line.starts_with("[-]") && line.contains("Exploit failed") {
                findings.push(Finding::new(
                    "metasploit",
                    FindingKind::Other,
                    Severity::Info,
                    strip_marker(line).to_owned(),
                ));
                continue;
            }

            if line.contains("no session was created") {
                findings.push(Finding::new(
                    "metasploit",
                    FindingKind::Other,
                    Severity::Info,
                    "exploit completed without a session",
                ));
            }
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_opened_is_critical() {
        let output = "\
msf6 exploit(unix/ftp/vsftpd_234_backdoor) > run
[*] 10.0.0.5:21 - Banner: 220 (vsFTPd 2.3.4)
[+] 10.0.0.5:21 - Backdoor service has been spawned, handling...
[*] Command shell session 1 opened (10.0.0.2:4444 -> 10.0.0.5:6200) at 2024-01-01 12:00:00 +0000
";
        let findings = MetasploitParser.parse(output);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].kind, FindingKind::Other);
        assert_eq!(findings[1].severity, Severity::Critical);
        assert_eq!(
            findings[1].description,
            "exploit succeeded: command shell session 1 opened (10.0.0.2:4444 -> 10.0.0.5:6200)"
        );
    }

    #[test]
    fn scanner_results() {
        let output = "\
[+] 10.0.0.9:445 - Host is likely VULNERABLE to MS17-010! - Windows 7 Professional
[+] 10.0.0.9:22 - Success: 'root:toor' 'uid=0(root)'
[-] 10.0.0.9:80 - Exploit failed [unreachable]: Rex::ConnectionRefused
[*] Exploit completed, but no session was created.
";
        let findings = MetasploitParser.parse(output);
        assert_eq!(findings.len(), 4);
        assert_eq!(findings[0].kind, FindingKind::Vulnerability);
        assert_eq!(findings[1].kind, FindingKind::Credential);
        assert_eq!(findings[2].severity, Severity::Info);
        assert_eq!(findings[3].description, "exploit completed without a session");
    }

    #[test]
    fn hashdump_lines() {
        let output = "Administrator:500:aad3b435b51404eeaad3b435b51404ee:31d6cfe0d16ae931b73c59d7e0c089c0:::";
        let findings = MetasploitParser.parse(output);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::Credential);
        assert!(findings[0].description.contains("Administrator"));
    }

    #[test]
    fn recognizes_prompts() {
        assert!(MetasploitParser.recognizes("msf6 > search vsftpd"));
        assert!(MetasploitParser.recognizes("meterpreter > sysinfo"));
        assert!(!MetasploitParser.recognizes("plain text"));
    }
}
