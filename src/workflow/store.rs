use super::definition::{CollectionId, RoleName, StepId};
use super::events::WorkflowEvent;
use super::models::{
    Identity, IdentityId, ItemId, RoleGroup, RoleGroupId, TaskRecord, WorkItem,
};
use anyhow::Result;

pub trait IdentityStore {
    /// Creates a new identity and returns its id.
    /// Returns Err if the handle is already taken.
    fn create_identity(&self, handle: &str) -> Result<IdentityId>;

    /// Returns Ok(None) if the identity does not exist.
    fn get_identity(&self, identity: IdentityId) -> Result<Option<Identity>>;

    /// Returns Ok(None) if no identity has the given handle.
    fn find_identity(&self, handle: &str) -> Result<Option<Identity>>;

    fn list_identities(&self) -> Result<Vec<Identity>>;

    /// Deletes the identity and its group memberships.
    /// Returns false if the identity does not exist.
    fn delete_identity(&self, identity: IdentityId) -> Result<bool>;
}

pub trait RoleGroupStore {
    /// Returns the id of the (collection, role) group, creating it if needed.
    fn ensure_role_group(&self, collection: &CollectionId, role: &RoleName)
        -> Result<RoleGroupId>;

    /// Returns Ok(None) if the group was never provisioned.
    fn find_role_group(
        &self,
        collection: &CollectionId,
        role: &RoleName,
    ) -> Result<Option<RoleGroup>>;

    fn list_role_groups(&self) -> Result<Vec<RoleGroup>>;

    /// Returns false if the identity already was a member.
    fn add_member(&self, group: RoleGroupId, identity: IdentityId) -> Result<bool>;

    /// Returns false if the identity was not a member.
    fn remove_member(&self, group: RoleGroupId, identity: IdentityId) -> Result<bool>;

    /// All groups the identity is a member of.
    fn groups_of_identity(&self, identity: IdentityId) -> Result<Vec<RoleGroup>>;
}

/// Holds at most one task per work item: the one at its current step.
pub trait TaskStore {
    fn get_task(&self, item_id: ItemId) -> Result<Option<TaskRecord>>;

    /// Replaces whatever task the item had with a pooled one at `step`.
    fn put_pooled_task(
        &self,
        item_id: ItemId,
        collection: &CollectionId,
        step: &StepId,
    ) -> Result<()>;

    /// Sets the claim marker of the pooled task at (item, step).
    /// Returns false if there is no such task or it is already claimed.
    fn claim_task(&self, item_id: ItemId, step: &StepId, identity: IdentityId) -> Result<bool>;

    /// Returns the task at (item, step) to the pool.
    /// Returns false unless it was claimed by `identity`.
    fn release_task(&self, item_id: ItemId, step: &StepId, identity: IdentityId)
        -> Result<bool>;

    /// Returns false if the item had no task.
    fn delete_task(&self, item_id: ItemId) -> Result<bool>;

    fn tasks_in_collection(&self, collection: &CollectionId) -> Result<Vec<TaskRecord>>;

    fn claimed_tasks_of(&self, identity: IdentityId) -> Result<Vec<TaskRecord>>;
}

pub trait ItemStore {
    fn create_item(&self, collection: &CollectionId, submitter: Option<IdentityId>)
        -> Result<ItemId>;

    fn get_item(&self, item_id: ItemId) -> Result<Option<WorkItem>>;

    fn set_current_step(&self, item_id: ItemId, step: Option<&StepId>) -> Result<()>;

    /// Clears the current step and marks the item archived.
    fn mark_archived(&self, item_id: ItemId) -> Result<()>;

    /// Clears the current step and marks the item withdrawn.
    fn mark_withdrawn(&self, item_id: ItemId) -> Result<()>;

    fn clear_submitter(&self, item_id: ItemId) -> Result<()>;

    fn items_submitted_by(&self, identity: IdentityId) -> Result<Vec<ItemId>>;

    fn items_in_review(&self) -> Result<Vec<WorkItem>>;
}

pub trait EventJournal {
    fn append_event(&self, event: &WorkflowEvent) -> Result<()>;

    /// Events of the item, oldest first.
    fn item_events(&self, item_id: ItemId) -> Result<Vec<WorkflowEvent>>;
}

/// One atomic unit of work over the workflow state.
///
/// Nothing written through a transaction is visible to others until
/// [`WorkflowTransaction::commit`]; dropping it uncommitted discards every
/// write.
pub trait WorkflowTransaction:
    IdentityStore + RoleGroupStore + TaskStore + ItemStore + EventJournal
{
    fn commit(self: Box<Self>) -> Result<()>;
}

pub trait WorkflowStore: Send + Sync {
    /// Starts a transaction. Blocks while another transaction is open.
    fn begin(&self) -> Result<Box<dyn WorkflowTransaction + '_>>;
}
