//! Tool identity detection from a shell command line.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Recon,
    Web,
    Exploitation,
    Password,
    Smb,
    Wireless,
    Network,
    Other,
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Recon => "recon",
            Self::Web => "web",
            Self::Exploitation => "exploitation",
            Self::Password => "password",
            Self::Smb => "smb",
            Self::Wireless => "wireless",
            Self::Network => "network",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Detected tool identity of a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub category: ToolCategory,
}

const KNOWN_TOOLS: &[(&str, ToolCategory)] = &[
    ("nmap", ToolCategory::Recon),
    ("masscan", ToolCategory::Recon),
    ("rustscan", ToolCategory::Recon),
    ("amass", ToolCategory::Recon),
    ("subfinder", ToolCategory::Recon),
    ("dnsrecon", ToolCategory::Recon),
    ("dnsenum", ToolCategory::Recon),
    ("whatweb", ToolCategory::Recon),
    ("nikto", ToolCategory::Web),
    ("gobuster", ToolCategory::Web),
    ("dirb", ToolCategory::Web),
    ("ffuf", ToolCategory::Web),
    ("feroxbuster", ToolCategory::Web),
    ("wfuzz", ToolCategory::Web),
    ("wpscan", ToolCategory::Web),
    ("sqlmap", ToolCategory::Web),
    ("nuclei", ToolCategory::Web),
    ("msfconsole", ToolCategory::Exploitation),
    ("msfvenom", ToolCategory::Exploitation),
    ("searchsploit", ToolCategory::Exploitation),
    ("hydra", ToolCategory::Password),
    ("medusa", ToolCategory::Password),
    ("john", ToolCategory::Password),
    ("hashcat", ToolCategory::Password),
    ("enum4linux", ToolCategory::Smb),
    ("smbclient", ToolCategory::Smb),
    ("smbmap", ToolCategory::Smb),
    ("crackmapexec", ToolCategory::Smb),
    ("netexec", ToolCategory::Smb),
    ("aircrack-ng", ToolCategory::Wireless),
    ("airodump-ng", ToolCategory::Wireless),
    ("wifite", ToolCategory::Wireless),
    ("netcat", ToolCategory::Network),
    ("nc", ToolCategory::Network),
    ("curl", ToolCategory::Network),
    ("wget", ToolCategory::Network),
    ("tcpdump", ToolCategory::Network),
];

/// Prefixes that wrap the real executable.
const WRAPPERS: &[&str] = &[
    "run",
    "sudo",
    "doas",
    "env",
    "time",
    "nohup",
    "nice",
    "exec",
    "command",
    "proxychains",
    "proxychains4",
    "stdbuf",
    "timeout",
];

/// Extract the last command segment from compound shell expressions
/// like `cd /opt && nmap host` or `cmd1 ; cmd2`. Strips trailing pipes and
/// stderr redirections.
#[must_use]
pub fn extract_last_command(command: &str) -> Option<&str> {
    let last = command
        .rsplit("&&")
        .next()
        .and_then(|s| s.rsplit(';').next())?;
    let last = last.trim();
    if last == command.trim() {
        return None;
    }
    let last = last.split('|').next().unwrap_or(last);
    let last = last.split("2>").next().unwrap_or(last);
    let trimmed = last.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Name of the executable a single command segment invokes, lowercased,
/// with wrappers, env assignments, and directories removed.
#[must_use]
pub fn executable_name(segment: &str) -> Option<String> {
    let mut tokens = segment.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if token.contains('=') && !token.starts_with('-') && !token.starts_with('/') {
            continue;
        }
        let base = token.rsplit('/').next().unwrap_or(token).to_lowercase();
        if WRAPPERS.contains(&base.as_str()) {
            // options and the duration argument of wrappers such as `sudo -u root` or `timeout 60`
            while let Some(next) = tokens.peek() {
                if next.starts_with('-') || next.starts_with(|c: char| c.is_ascii_digit()) {
                    tokens.next();
                } else {
                    break;
                }
            }
            continue;
        }
        if base.is_empty() {
            return None;
        }
        return Some(base);
    }
    None
}

/// Detect the tool a command line runs. Compound commands resolve to their
/// last segment when that segment names a known tool, otherwise to the first.
#[must_use]
pub fn detect_tool(command: &str) -> Option<ToolInfo> {
    let first = command
        .split("&&")
        .next()
        .and_then(|s| s.split(';').next())
        .and_then(|s| s.split('|').next())
        .unwrap_or(command);

    let candidates = extract_last_command(command)
        .into_iter()
        .chain(std::iter::once(first));

    let mut fallback = None;
    for segment in candidates {
        let Some(name) = executable_name(segment) else {
            continue;
        };
        let name = normalize_alias(&name);
        if let Some((_, category)) = KNOWN_TOOLS.iter().find(|(tool, _)| *tool == name) {
            return Some(ToolInfo {
                name,
                category: *category,
            });
        }
        if fallback.is_none() {
            fallback = Some(name);
        }
    }

    fallback.map(|name| ToolInfo {
        name,
        category: ToolCategory::Other,
    })
}

fn normalize_alias(name: &str) -> String {
    match name {
        "metasploit" | "msfconsole.rb" => "msfconsole".into(),
        "enum4linux-ng" => "enum4linux".into(),
        "nxc" => "netexec".into(),
        other => other.strip_suffix(".py").unwrap_or(other).to_owned(),
    }
}
