//! Secret redaction for anything that leaves a tool: outputs fed back to the
//! model, audit previews, and command logs shown to users.

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::policy::PolicyEngine;

/// What a redacted value is replaced with.
pub const REDACTED: &str = "[REDACTED]";

static PRIVATE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)-----BEGIN [A-Z0-9 ]*PRIVATE KEY-----.*?-----END [A-Z0-9 ]*PRIVATE KEY-----")
        .expect("private key pattern")
});

static BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9\-._~+/]+=*").expect("bearer pattern")
});

/// `name=value` / `"name": "value"` where the name mentions a credential.
static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)([A-Za-z0-9_\-]*(?:api[_-]?key|secret|token|password|passwd)[A-Za-z0-9_\-]*["']?\s*[:=]\s*["']?)[^\s"',;{}]{3,}"#,
    )
    .expect("assignment pattern")
});

/// Well-known credential shapes that appear without a name next to them.
static KNOWN_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:sk-[A-Za-z0-9_\-]{20,}|gh[pousr]_[A-Za-z0-9]{30,}|AKIA[0-9A-Z]{16}|xox[abpr]-[A-Za-z0-9\-]{10,})")
        .expect("token pattern")
});

/// Replace anything that looks like a credential with [`REDACTED`].
pub fn redact_secrets(text: &str) -> String {
    let text = PRIVATE_KEY.replace_all(text, "[REDACTED PRIVATE KEY]");
    let text = BEARER.replace_all(&text, "${1} [REDACTED]");
    let text = ASSIGNMENT.replace_all(&text, "${1}[REDACTED]");
    KNOWN_TOKENS.replace_all(&text, REDACTED).into_owned()
}

impl PolicyEngine {
    pub fn redact_secrets(&self, text: &str) -> String {
        redact_secrets(text)
    }
}
