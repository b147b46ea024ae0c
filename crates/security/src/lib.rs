//! Security layer for Sandcastle: the policy engine, secret redaction, and
//! audit recording.
//!
//! Provides:
//! - **Policy engine**: path sandboxing, command allowlisting, run limits
//! - **Redaction**: scrubbing credentials from tool output and logs
//! - **Audit logging**: the structured record of every run

pub mod audit;
pub mod command;
pub mod glob;
pub mod limits;
pub mod policy;
pub mod redact;

pub use audit::{AuditEntry, AuditEvent, AuditLog, AuditOutcome, AuditSink, TracingSink};
pub use command::base_command;
pub use glob::Glob;
pub use limits::{DiffStats, RuntimeStats};
pub use policy::{
    PolicyEngine, PolicyError, ResolvedPath, ValidationResult, Violation, ViolationKind,
    is_path_segment,
};
pub use redact::{REDACTED, redact_secrets};
