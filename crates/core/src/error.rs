//! Error types for the Sandcastle domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Errors are split by how far they are allowed to travel:
//! - [`ToolError`] stays inside a single tool call and is reported back to the model
//! - [`FatalError`] ends the current run as `Failed`
//! - [`Error`] is the catch-all for library callers

use thiserror::Error;

/// The top-level error type for all Sandcastle operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Loop-level errors ---
    #[error("Run error: {0}")]
    Fatal(#[from] FatalError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- I/O ---
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider script exhausted after {0} responses")]
    Exhausted(usize),
}

/// Failures local to one tool call.
///
/// These never end a run: the orchestrator turns them into a tool-result
/// string so the model can try something else.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("File not found: {path}")]
    NotFound { path: String },

    #[error("Path is a directory: {path}")]
    IsDirectory { path: String },

    #[error("Patch rejected: {0}")]
    PatchRejected(String),

    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl ToolError {
    /// Build an [`ToolError::Io`] from a std error and the path it concerns.
    pub fn io(path: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

/// Loop-level conditions that terminate a run as `Failed`.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Model response was truncated (length limit reached)")]
    ResponseTooLong,

    #[error("{0}")]
    RuntimeLimitExceeded(String),

    #[error("Maximum steps ({0}) reached")]
    StepLimitExceeded(u32),

    #[error("Audit recorder failed: {0}")]
    Audit(String),
}
