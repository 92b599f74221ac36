use std::sync::LazyLock;

use regex::Regex;

use super::ToolParser;
use crate::finding::{Confidence, Finding, FindingKind, Severity};

static PORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{1,5})/(tcp|udp|sctp)\s+(open\|filtered|open|filtered|closed|unfiltered)\s+(\S+)(?:\s+(.+?))?\s*$",
    )
    .expect("valid port regex")
});

static HOST_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Nmap scan report for (.+?)\s*$").expect("valid host regex"));

static OS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(Running|OS details|Service Info):\s*(.+?)\s*$").expect("valid os regex")
});

static MASSCAN_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Discovered open port (\d{1,5})/(tcp|udp) on (\S+)").expect("valid masscan regex")
});

static PORT_SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\d{1,5}/(?:tcp|udp|sctp)\s+(?:open|filtered|closed)\b")
        .expect("valid signature regex")
});

static CVE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CVE-\d{4}-\d{4,}").expect("valid cve regex"));

/// Service versions with well-known public exploits.
const KNOWN_VULNERABLE: &[(&str, Severity, &str)] = &[
    (
        "vsftpd 2.3.4",
        Severity::Critical,
        "vsftpd 2.3.4 backdoor command execution (CVE-2011-2523)",
    ),
    (
        "openssh 7.2",
        Severity::Medium,
        "OpenSSH 7.2 username enumeration (CVE-2016-6210)",
    ),
    (
        "samba smbd 3.0.20",
        Severity::Critical,
        "Samba 3.0.20 usermap_script command execution (CVE-2007-2447)",
    ),
    (
        "mysql 5.0",
        Severity::High,
        "MySQL 5.0 authentication bypass (CVE-2012-2122)",
    ),
];

/// Parser for nmap normal output and masscan discovery lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct NmapParser;

impl NmapParser {
    fn port_findings(
        port: &str,
        proto: &str,
        state: &str,
        service: &str,
        version: Option<&str>,
        host: Option<&str>,
        out: &mut Vec<Finding>,
    ) {
        if state != "open" && state != "open|filtered" {
            return;
        }
        let location = host.map(|h| format!(" on {h}")).unwrap_or_default();
        let guessed = service.ends_with('?');
        let service = service.trim_end_matches('?');

        if service == "unknown" || service == "tcpwrapped" || service.is_empty() {
            out.push(
                Finding::new(
                    "nmap",
                    FindingKind::OpenPort,
                    Severity::Info,
                    format!("{port}/{proto} {state}{location}"),
                )
                .with_confidence(Confidence::Medium),
            );
            return;
        }

        let version_text = version.map(|v| format!(" ({v})")).unwrap_or_default();
        let mut confidence = Confidence::High;
        if guessed {
            confidence = confidence.degrade();
        }
        if state == "open|filtered" {
            confidence = Confidence::Low;
        }
        out.push(
            Finding::new(
                "nmap",
                FindingKind::Service,
                Severity::Info,
                format!("{port}/{proto} {service}{version_text}{location}"),
            )
            .with_confidence(confidence),
        );

        if let Some(version) = version {
            let lower = version.to_lowercase();
            for (needle, severity, title) in KNOWN_VULNERABLE {
                if lower.contains(needle) {
                    out.push(Finding::new(
                        "nmap",
                        FindingKind::Vulnerability,
                        *severity,
                        format!("{title} at {port}/{proto}{location}"),
                    ));
                }
            }
        }
    }
}

impl ToolParser for NmapParser {
    fn name(&self) -> &'static str {
        "nmap"
    }

    fn recognizes(&self, output: &str) -> bool {
        output.contains("Nmap scan report for")
            || output.contains("Starting Nmap")
            || output.contains("Starting masscan")
            || PORT_SIGNATURE.is_match(output)
    }

    fn parse(&self, output: &str) -> Vec<Finding> {
        let mut findings = Vec::new();
        let mut host: Option<String> = None;
        let mut script: Option<String> = None;
        let mut awaiting_vuln_title = false;
        let mut last_vuln: Option<usize> = None;

        for raw_line in output.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(caps) = HOST_LINE.captures(line) {
                host = Some(caps[1].to_owned());
                script = None;
                continue;
            }

            if let Some(caps) = PORT_LINE.captures(line) {
                Self::port_findings(
                    &caps[1],
                    &caps[2],
                    &caps[3],
                    &caps[4],
                    caps.get(5).map(|m| m.as_str()),
                    host.as_deref(),
                    &mut findings,
                );
                script = None;
                last_vuln = None;
                continue;
            }

            if let Some(caps) = MASSCAN_LINE.captures(line) {
                findings.push(Finding::new(
                    "nmap",
                    FindingKind::OpenPort,
                    Severity::Info,
                    format!("{}/{} open on {}", &caps[1], &caps[2], &caps[3]),
                ));
                continue;
            }

            if let Some(caps) = OS_LINE.captures(line) {
                findings.push(Finding::new(
                    "nmap",
                    FindingKind::Other,
                    Severity::Info,
                    format!("{}: {}", &caps[1], &caps[2]),
                ));
                continue;
            }

            if let Some(body) = line.strip_prefix('|') {
                let body = body.trim_start_matches('_').trim();
                if awaiting_vuln_title && !body.is_empty() {
                    awaiting_vuln_title = false;
                    let location = host.as_deref().map(|h| format!(" on {h}")).unwrap_or_default();
                    let origin = script.as_deref().map(|s| format!(" [{s}]")).unwrap_or_default();
                    findings.push(Finding::new(
                        "nmap",
                        FindingKind::Vulnerability,
                        Severity::High,
                        format!("{body}{origin}{location}"),
                    ));
                    last_vuln = Some(findings.len() - 1);
                    continue;
                }
                if body.starts_with("VULNERABLE:") {
                    awaiting_vuln_title = true;
                    continue;
                }
                if let Some(idx) = last_vuln
                    && let Some(cve) = CVE_ID.find(body)
                    && !findings[idx].description.contains(cve.as_str())
                {
                    findings[idx].description.push_str(&format!(" ({})", cve.as_str()));
                    continue;
                }
                if let Some(name) = body.strip_suffix(':')
                    && !name.contains(' ')
                {
                    script = Some(name.to_owned());
                    last_vuln = None;
                }
            }
        }

        // A scan that announced itself but never printed its trailer was cut short.
        if output.contains("Starting Nmap") && !output.contains("Nmap done") {
            for finding in &mut findings {
                finding.confidence = finding.confidence.degrade();
            }
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_SCAN: &str = "\
Starting Nmap 7.94 ( https://nmap.org ) at 2024-01-01 12:00 UTC
Nmap scan report for target.local (10.0.0.5)
Host is up (0.0010s latency).
Not shown: 995 closed tcp ports (reset)
PORT     STATE    SERVICE     VERSION
21/tcp   open     ftp         vsftpd 2.3.4
22/tcp   open     ssh         OpenSSH 7.2p2 Ubuntu 4ubuntu2.10 (Ubuntu Linux; protocol 2.0)
80/tcp   open     http        Apache httpd 2.4.18 ((Ubuntu))
135/tcp  filtered msrpc
8081/tcp open     unknown
Service Info: OSs: Unix, Linux; CPE: cpe:/o:linux:linux_kernel
Nmap done: 1 IP address (1 host up) scanned in 12.34 seconds
";

    #[test]
    fn parses_service_lines() {
        let findings = NmapParser.parse(FULL_SCAN);
        let services: Vec<_> = findings
            .iter()
            .filter(|f| f.kind == FindingKind::Service)
            .collect();
        assert_eq!(services.len(), 3);
        assert!(services[0].description.starts_with("21/tcp ftp (vsftpd 2.3.4)"));
        assert!(services[2].description.contains("http"));
        assert!(services[2].description.contains("on target.local (10.0.0.5)"));
        assert!(services.iter().all(|f| f.severity == Severity::Info));
        assert!(services.iter().all(|f| f.confidence == Confidence::High));
    }

    #[test]
    fn filtered_ports_are_skipped_and_unknown_is_open_port() {
        let findings = NmapParser.parse(FULL_SCAN);
        assert!(!findings.iter().any(|f| f.description.contains("msrpc")));
        let open: Vec<_> = findings
            .iter()
            .filter(|f| f.kind == FindingKind::OpenPort)
            .collect();
        assert_eq!(open.len(), 1);
        assert!(open[0].description.starts_with("8081/tcp open"));
    }

    #[test]
    fn known_vulnerable_versions_flagged() {
        let findings = NmapParser.parse(FULL_SCAN);
        let vulns: Vec<_> = findings
            .iter()
            .filter(|f| f.kind == FindingKind::Vulnerability)
            .collect();
        assert_eq!(vulns.len(), 2);
        assert_eq!(vulns[0].severity, Severity::Critical);
        assert!(vulns[0].description.contains("CVE-2011-2523"));
        assert_eq!(vulns[1].severity, Severity::Medium);
    }

    #[test]
    fn service_info_is_other() {
        let findings = NmapParser.parse(FULL_SCAN);
        assert!(
            findings
                .iter()
                .any(|f| f.kind == FindingKind::Other && f.description.starts_with("Service Info"))
        );
    }

    #[test]
    fn minimal_stub_yields_single_service() {
        let findings = NmapParser.parse("80/tcp open http");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::Service);
        assert_eq!(findings[0].severity, Severity::Info);
        assert_eq!(findings[0].description, "80/tcp http");
    }

    #[test]
    fn truncated_scan_lowers_confidence() {
        let truncated = "Starting Nmap 7.94\nNmap scan report for 10.0.0.1\n22/tcp open ssh OpenSSH 8.9\n";
        let findings = NmapParser.parse(truncated);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].confidence, Confidence::Medium);
        assert!(findings[0].is_degraded());
    }

    #[test]
    fn guessed_service_is_medium_confidence() {
        let findings = NmapParser.parse("9999/tcp open abyss?");
        assert_eq!(findings[0].kind, FindingKind::Service);
        assert_eq!(findings[0].confidence, Confidence::Medium);
        assert!(findings[0].description.contains("abyss"));
    }

    #[test]
    fn nse_vulnerable_block() {
        let output = "\
Nmap scan report for 10.0.0.9
445/tcp open  microsoft-ds
Host script results:
| smb-vuln-ms17-010:
|   VULNERABLE:
|   Remote Code Execution vulnerability in Microsoft SMBv1 servers (ms17-010)
|     State: VULNERABLE
|     IDs:  CVE:CVE-2017-0143
|_    Risk factor: HIGH
";
        let findings = NmapParser.parse(output);
        let vuln = findings
            .iter()
            .find(|f| f.kind == FindingKind::Vulnerability)
            .unwrap();
        assert_eq!(vuln.severity, Severity::High);
        assert!(vuln.description.contains("ms17-010"));
        assert!(vuln.description.contains("[smb-vuln-ms17-010]"));
        assert!(vuln.description.contains("CVE-2017-0143"));
    }

    #[test]
    fn masscan_lines() {
        let findings = NmapParser.parse("Discovered open port 443/tcp on 192.168.1.4\n");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::OpenPort);
        assert_eq!(findings[0].description, "443/tcp open on 192.168.1.4");
    }

    #[test]
    fn garbage_input_yields_nothing() {
        assert!(NmapParser.parse("").is_empty());
        assert!(NmapParser.parse("999999/tcp open\n/tcp open http\n|||").is_empty());
    }

    #[test]
    fn recognizes_signatures() {
        assert!(NmapParser.recognizes("Nmap scan report for x"));
        assert!(NmapParser.recognizes("junk\n443/tcp open https\n"));
        assert!(!NmapParser.recognizes("GET / HTTP/1.1"));
    }

    proptest::proptest! {
        #[test]
        fn parse_is_deterministic(input in "(\\PC|\\n){0,400}") {
            proptest::prop_assert_eq!(NmapParser.parse(&input), NmapParser.parse(&input));
        }

        #[test]
        fn parse_never_panics_on_port_like_lines(port in 0u32..70000, svc in "[a-z?-]{0,12}") {
            let line = format!("{port}/tcp open {svc} x y\n");
            let _ = NmapParser.parse(&line);
        }
    }
}
