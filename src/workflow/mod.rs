mod definition;
mod engine;
mod error;
mod events;
mod models;
mod safety;
mod sqlite_workflow_store;
mod store;

pub use definition::{
    ActionDefinition, ActionId, ActionKind, ActionOutcome, CollectionId, RoleName,
    StepDefinition, StepId, Workflow, WorkflowId, WorkflowRegistry, DEFAULT_WORKFLOW_ID,
};
pub use engine::WorkflowEngine;
pub use error::{DefinitionRef, PreconditionViolation, WorkflowError};
#[cfg(feature = "mock")]
pub use events::MockNotificationSink;
pub use events::{
    BroadcastNotificationSink, FanoutNotificationSink, NotificationSink, TracingNotificationSink,
    WorkflowEvent, WorkflowEventKind,
};
pub use models::{
    ClaimedTask, Identity, IdentityId, ItemId, ItemStatus, PoolTask, RoleGroup, RoleGroupId,
    TaskRecord, WorkItem,
};
pub use safety::{Blocker, DeleteConstraint, SafetyDecision, SafetyRefusal};
pub use sqlite_workflow_store::{SqliteWorkflowStore, DEFAULT_DB_FILE_NAME};
pub use store::{
    EventJournal, IdentityStore, ItemStore, RoleGroupStore, TaskStore, WorkflowStore,
    WorkflowTransaction,
};
