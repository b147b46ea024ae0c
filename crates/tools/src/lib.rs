//! Tool implementations for Sandcastle.
//!
//! These are the only ways an agent touches the machine:
//! - [`SandboxedFileOps`]: list, read, search, write, and patch files
//! - [`ProcessRunner`]: run allowlisted shell commands under supervision
//!
//! Both consult the [`sandcastle_security::PolicyEngine`] before acting.

pub mod file_ops;
pub mod patch;
pub mod runner;

pub use file_ops::{FileChange, SandboxedFileOps, SearchMatch};
pub use patch::Patch;
pub use runner::{CommandMetadata, CommandRequest, CommandResult, ProcessRunner};
