//! The Sandcastle agent: a bounded, audited step loop.
//!
//! 1. **Check** the task: it exists, is not human-only, has acceptance criteria
//! 2. **Start** a run with the audit recorder
//! 3. **Ask** the provider for the next action
//! 4. **Dispatch** each tool call through the policy-checked tool surface
//! 5. **Feed back** the redacted result and loop to step 3
//! 6. **Finish** on a terminal tool, a fatal error, a limit, or cancellation
//!
//! Every finished run leaves one comment on the task and one finalized run
//! record.

pub mod dispatch;
pub mod orchestrator;
pub mod prompt;
pub mod scripted;
pub mod task_store;

pub use dispatch::{Dispatched, ToolDispatcher};
pub use orchestrator::{AgentOrchestrator, COMMENT_AUTHOR, OrchestratorError, RunResult};
pub use scripted::{ScriptedProvider, ScriptedResponse};
pub use task_store::{InMemoryTaskStore, JsonTaskStore};
