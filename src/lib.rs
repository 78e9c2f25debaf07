//! Reviewflow Library
//!
//! Multi-step review workflow engine: routes submitted items through the
//! review steps of their collection, hands out pooled and claimed review
//! tasks to role groups, and refuses membership changes that would leave
//! an outstanding task without an eligible holder.

pub mod cli_style;
pub mod config;
pub mod sqlite_persistence;
pub mod workflow;

// Re-export commonly used types for convenience
pub use workflow::{
    ActionKind, ActionOutcome, NotificationSink, SafetyDecision, SqliteWorkflowStore,
    WorkflowEngine, WorkflowError, WorkflowEvent, WorkflowRegistry, WorkflowStore,
};
