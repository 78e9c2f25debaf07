use super::definition::{ActionId, CollectionId, RoleName, StepId, WorkflowId};
use super::models::{IdentityId, ItemId, ItemStatus};
use super::safety::SafetyRefusal;
use std::fmt;
use thiserror::Error;

/// The piece of workflow configuration a lookup failed to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionRef {
    Collection(CollectionId),
    Step {
        workflow: WorkflowId,
        step: StepId,
    },
    Action {
        step: StepId,
        action: ActionId,
    },
    Role {
        collection: CollectionId,
        role: RoleName,
    },
}

impl fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionRef::Collection(collection) => {
                write!(f, "no workflow configured for collection {}", collection)
            }
            DefinitionRef::Step { workflow, step } => {
                write!(f, "workflow {} has no step {}", workflow, step)
            }
            DefinitionRef::Action { step, action } => {
                write!(f, "step {} has no action {}", step, action)
            }
            DefinitionRef::Role { collection, role } => write!(
                f,
                "the workflow of collection {} has no role {}",
                collection, role
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionViolation {
    #[error("work item {0} does not exist")]
    UnknownItem(ItemId),

    #[error("identity {0} does not exist")]
    UnknownIdentity(IdentityId),

    #[error("no identity has handle {0}")]
    UnknownHandle(String),

    #[error("identity handle {0} is already taken")]
    HandleTaken(String),

    #[error("identity handle cannot be empty")]
    EmptyHandle,

    #[error("work item {item_id} is {status}, not in review")]
    NotInReview { item_id: ItemId, status: ItemStatus },

    #[error("work item {item_id} is at step {current}, not at step {requested}")]
    WrongStep {
        item_id: ItemId,
        current: StepId,
        requested: StepId,
    },

    #[error("identity {identity} is not a member of the {role} group of collection {collection}")]
    NotInRole {
        identity: IdentityId,
        collection: CollectionId,
        role: RoleName,
    },

    #[error("work item {item_id} at step {step} is not claimed by identity {identity}")]
    NotClaimedByActor {
        item_id: ItemId,
        step: StepId,
        identity: IdentityId,
    },
}

/// Errors returned by the workflow engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Definition not found: {0}")]
    DefinitionNotFound(DefinitionRef),

    #[error("Precondition violated: {0}")]
    Precondition(#[from] PreconditionViolation),

    /// A claim found no pooled task: the item was never pooled at that step,
    /// or somebody else claimed it first.
    #[error("No pool task available for work item {item_id} at step {step}")]
    TaskUnavailable { item_id: ItemId, step: StepId },

    #[error("Refused: {0}")]
    Refused(SafetyRefusal),

    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Process exit code used by the admin CLI for this kind of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkflowError::Store(_) => 1,
            WorkflowError::Precondition(_) => 2,
            WorkflowError::Refused(_) => 3,
            WorkflowError::TaskUnavailable { .. } => 4,
            WorkflowError::DefinitionNotFound(_) => 5,
        }
    }

    pub fn is_refusal(&self) -> bool {
        matches!(self, WorkflowError::Refused(_))
    }
}
