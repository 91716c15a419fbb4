//! Scrubs secrets from text before it is sent to the model.

use regex::Regex;
use std::sync::LazyLock;

const PATTERNS: &[(&str, &str)] = &[
    (
        r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----",
        "[REDACTED PRIVATE KEY]",
    ),
    (r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+", "Bearer [REDACTED]"),
    (
        r#"(?i)\b(password|passwd|token|secret|api[_-]?key|access[_-]?key|client[_-]?secret)(\s*[:=]\s*)("[^"]*"|'[^']*'|\S+)"#,
        "${1}${2}[REDACTED]",
    ),
    // base64 values under a Secret's data:
    (
        r"(?m)^(\s+[\w.-]+:\s+)[A-Za-z0-9+/]{20,}={0,2}\s*$",
        "${1}[REDACTED]",
    ),
];

static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    PATTERNS
        .iter()
        .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
            Ok(re) => Some((re, *replacement)),
            Err(e) => {
                tracing::error!("invalid redaction pattern {:?}: {}", pattern, e);
                None
            }
        })
        .collect()
});

pub fn redact(text: &str) -> String {
    SECRET_PATTERNS
        .iter()
        .fold(text.to_string(), |acc, (re, replacement)| {
            re.replace_all(&acc, *replacement).into_owned()
        })
}
