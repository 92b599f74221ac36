//! Tool output parsers and the registry that routes raw output to them.

mod dirbust;
mod hydra;
mod metasploit;
mod nikto;
mod nmap;
mod sqlmap;

use std::collections::HashMap;
use std::sync::Arc;

use crate::finding::Finding;
use crate::output::clean_output;
use crate::tool::detect_tool;

pub use self::dirbust::DirBustParser;
pub use self::hydra::HydraParser;
pub use self::metasploit::MetasploitParser;
pub use self::nikto::NiktoParser;
pub use self::nmap::NmapParser;
pub use self::sqlmap::SqlmapParser;

/// Converts one tool's raw text output into normalized findings.
///
/// Implementations are stateless and total: malformed or truncated input
/// yields fewer or lower-confidence findings, never a panic or an error.
pub trait ToolParser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `output` carries this tool's content signature.
    fn recognizes(&self, output: &str) -> bool;

    /// Parse already-cleaned output (no ANSI escapes, `\n` line endings).
    fn parse(&self, output: &str) -> Vec<Finding>;
}

/// Parser for unrecognised output. Always yields no findings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullParser;

impl ToolParser for NullParser {
    fn name(&self) -> &'static str {
        "null"
    }

    fn recognizes(&self, _output: &str) -> bool {
        false
    }

    fn parse(&self, _output: &str) -> Vec<Finding> {
        Vec::new()
    }
}

/// Signature-keyed parser lookup with a content-sniffing fallback.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    by_signature: HashMap<String, Arc<dyn ToolParser>>,
    /// Distinct parsers in registration order, matched by content signature.
    sniff_order: Vec<Arc<dyn ToolParser>>,
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut signatures: Vec<&str> = self.by_signature.keys().map(String::as_str).collect();
        signatures.sort_unstable();
        f.debug_struct("ParserRegistry")
            .field("signatures", &signatures)
            .finish()
    }
}

impl ParserRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every built-in parser.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let nmap: Arc<dyn ToolParser> = Arc::new(NmapParser);
        registry.register("nmap", Arc::clone(&nmap));
        registry.register("masscan", nmap);
        registry.register("nikto", Arc::new(NiktoParser));
        let dirbust: Arc<dyn ToolParser> = Arc::new(DirBustParser);
        for signature in ["gobuster", "dirb", "ffuf", "feroxbuster"] {
            registry.register(signature, Arc::clone(&dirbust));
        }
        registry.register("sqlmap", Arc::new(SqlmapParser));
        registry.register("hydra", Arc::new(HydraParser));
        let msf: Arc<dyn ToolParser> = Arc::new(MetasploitParser);
        registry.register("msfconsole", Arc::clone(&msf));
        registry.register("metasploit", msf);
        registry
    }

    /// Bind `signature` (an executable name) to `parser`, replacing any
    /// previous binding for that signature.
    pub fn register(&mut self, signature: impl Into<String>, parser: Arc<dyn ToolParser>) {
        let signature = signature.into().to_lowercase();
        if !self.sniff_order.iter().any(|p| Arc::ptr_eq(p, &parser)) {
            self.sniff_order.push(Arc::clone(&parser));
        }
        tracing::debug!(signature, parser = parser.name(), "parser registered");
        self.by_signature.insert(signature, parser);
    }

    #[must_use]
    pub fn signatures(&self) -> Vec<&str> {
        let mut signatures: Vec<&str> = self.by_signature.keys().map(String::as_str).collect();
        signatures.sort_unstable();
        signatures
    }

    /// Pick the parser for `output`. The hint (an executable name or a full
    /// command line) is tried first, then content signatures in
    /// registration order, then the null parser.
    #[must_use]
    pub fn resolve(&self, output: &str, hint: Option<&str>) -> &dyn ToolParser {
        if let Some(parser) = hint.and_then(|h| self.lookup_hint(h)) {
            return parser;
        }
        self.sniff_order
            .iter()
            .find(|p| p.recognizes(output))
            .map_or(&NullParser as &dyn ToolParser, |p| p.as_ref())
    }

    fn lookup_hint(&self, hint: &str) -> Option<&dyn ToolParser> {
        let hint = hint.trim();
        let name = if hint.contains(char::is_whitespace) {
            detect_tool(hint)?.name
        } else {
            hint.rsplit('/').next().unwrap_or(hint).to_lowercase()
        };
        self.by_signature.get(&name).map(AsRef::as_ref)
    }

    /// Clean `raw_output` and run it through the resolved parser.
    #[must_use]
    pub fn dispatch(&self, raw_output: &str, hint: Option<&str>) -> Vec<Finding> {
        let cleaned = clean_output(raw_output);
        let parser = self.resolve(&cleaned, hint);
        let findings = parser.parse(&cleaned);
        tracing::debug!(
            parser = parser.name(),
            hint = hint.unwrap_or(""),
            findings = findings.len(),
            "dispatched tool output"
        );
        findings
    }
}

/// Strip a leading `[x]`-style status marker and whitespace.
pub(crate) fn strip_marker(line: &str) -> &str {
    let line = line.trim_start();
    if line.starts_with('[')
        && let Some(end) = line.find(']')
        && end <= 4
    {
        return line[end + 1..].trim_start();
    }
    line
}
