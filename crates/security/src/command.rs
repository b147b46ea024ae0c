//! Command allowlisting for `run_command`.
//!
//! Commands are rejected in three passes, first failure wins:
//! - shell metacharacters (substitution, pipes, redirection, chaining, background)
//! - denied substrings, case-insensitive, anywhere in the command
//! - the base command (first token, path prefix stripped) must be allowlisted
//!
//! An empty allowlist permits nothing.

use crate::policy::{PolicyEngine, ValidationResult, Violation, ViolationKind};

impl PolicyEngine {
    pub fn validate_command(&self, command: &str) -> ValidationResult {
        self.check_command(command).into()
    }

    pub fn check_command(&self, command: &str) -> Result<(), Violation> {
        let policy = self.policy();
        check_command(command, &policy.allowed_commands, &policy.denied_commands)
    }
}

/// Validate a command against explicit allow and deny lists.
pub fn check_command(command: &str, allowed: &[String], denied: &[String]) -> Result<(), Violation> {
    let blocked = |reason: String| Violation::new(ViolationKind::CommandBlocked, reason);

    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(blocked("Empty command".into()));
    }

    if let Some(what) = find_metacharacter(trimmed) {
        return Err(blocked(format!("Shell metacharacter rejected: {what}")));
    }

    let lower = trimmed.to_lowercase();
    if let Some(pattern) = denied
        .iter()
        .find(|d| !d.is_empty() && lower.contains(&d.to_lowercase()))
    {
        return Err(blocked(format!("Command contains denied pattern '{pattern}'")));
    }

    if allowed.is_empty() {
        return Err(blocked("No commands are allowed by policy".into()));
    }

    let base = base_command(trimmed);
    if allowed.iter().any(|a| a == base) {
        Ok(())
    } else {
        Err(blocked(format!(
            "Command '{base}' is not in allowed commands ({})",
            allowed.join(", ")
        )))
    }
}

/// First whitespace-separated token with any directory prefix removed.
pub fn base_command(command: &str) -> &str {
    let first = command.split_whitespace().next().unwrap_or("");
    first.rsplit(['/', '\\']).next().unwrap_or(first)
}

/// Describe the first forbidden shell construct, checked in a fixed order.
fn find_metacharacter(command: &str) -> Option<&'static str> {
    if command.contains('`') {
        return Some("command substitution with backticks (`) is not allowed");
    }
    if command.contains("$(") {
        return Some("command substitution with $() is not allowed");
    }
    if command.contains("${") {
        return Some("variable expansion with ${} is not allowed");
    }
    if command.contains('|') {
        return Some("pipes (|) are not allowed");
    }
    if command.contains('>') {
        return Some("output redirection (>) is not allowed");
    }
    if command.contains('<') {
        return Some("input redirection (<) is not allowed");
    }
    if command.contains(';') {
        return Some("command chaining with semicolons (;) is not allowed");
    }
    if command.contains('\n') || command.contains('\r') {
        return Some("multi-line commands (newline) are not allowed");
    }
    if has_background_ampersand(command) {
        return Some("background execution (&) is not allowed");
    }
    None
}

/// An `&` not immediately followed by another `&`.
///
/// In `a && b` the second ampersand is followed by a space, so chaining with
/// `&&` is caught here as well.
fn has_background_ampersand(command: &str) -> bool {
    let bytes = command.as_bytes();
    bytes
        .iter()
        .enumerate()
        .any(|(i, &b)| b == b'&' && bytes.get(i + 1) != Some(&b'&'))
}
