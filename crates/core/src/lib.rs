//! # Sandcastle Core
//!
//! Domain types, traits, and error definitions for the Sandcastle agent sandbox.
//! No I/O lives here: it defines the domain model that all other crates
//! implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (the LLM provider, the task store, the audit
//! recorder) is defined as a trait here. Implementations live in their
//! respective crates or in the host application. This enables:
//! - Swapping the model backend without touching the step loop
//! - Easy testing with scripted/in-memory implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod run;
pub mod task;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, FatalError, ProviderError, Result, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Message, MessageToolCall, Role, Transcript};
pub use provider::{FinishReason, Provider, ProviderRequest, ProviderResponse, ToolDefinition};
pub use run::{AuditRecorder, Run, RunEntry, RunFinalization, RunStatus};
pub use task::{Task, TaskComment, TaskStatus, TaskStore};
pub use tool::{AcceptanceResult, StopSignal, ToolCall, ToolExecutionResult, ToolInvocation};
