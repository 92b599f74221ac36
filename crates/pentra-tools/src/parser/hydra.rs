use std::sync::LazyLock;

use regex::Regex;

use super::ToolParser;
use crate::finding::{Confidence, Finding, FindingKind, Severity};

static CREDENTIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(\d+)\]\[([\w-]+)\]\s+host:\s*(\S+)(?:\s+login:\s*(\S+))?\s+password:\s*(.*?)\s*$")
        .expect("valid credential regex")
});

/// Parser for hydra (and medusa-style `ACCOUNT FOUND`) login brute-force output.
#[derive(Debug, Default, Clone, Copy)]
pub struct HydraParser;

impl ToolParser for HydraParser {
    fn name(&self) -> &'static str {
        "hydra"
    }

    fn recognizes(&self, output: &str) -> bool {
        output.contains("Hydra v") || output.contains("valid password found") || CREDENTIAL.is_match(output)
    }

    fn parse(&self, output: &str) -> Vec<Finding> {
        let finished = output.contains("target successfully completed")
            || output.contains("target completed")
            || output.contains("attack finished");

        output
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if let Some(caps) = CREDENTIAL.captures(line) {
                    let port = &caps[1];
                    let service = &caps[2];
                    let host = &caps[3];
                    let password = &caps[5];
                    let description = match caps.get(4) {
                        Some(login) => format!(
                            "valid {service} credentials on {host}:{port}: login '{}' password '{password}'",
                            login.as_str()
                        ),
                        None => format!("valid {service} password on {host}:{port}: '{password}'"),
                    };
                    let finding =
                        Finding::new("hydra", FindingKind::Credential, Severity::High, description);
                    // Hits printed before the run summary are real but the run may still be partial.
                    return Some(if finished {
                        finding
                    } else {
                        finding.with_confidence(Confidence::Medium)
                    });
                }
                let account = line.strip_prefix("ACCOUNT FOUND:")?;
                Some(Finding::new(
                    "hydra",
                    FindingKind::Credential,
                    Severity::High,
                    format!("valid credentials {}", account.trim()),
                ))
            })
            .collect()
    }
}
