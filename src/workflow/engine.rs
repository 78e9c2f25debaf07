use super::definition::{
    ActionId, ActionKind, ActionOutcome, CollectionId, RoleName, StepDefinition, StepId,
    WorkflowRegistry,
};
use super::error::{PreconditionViolation, WorkflowError};
use super::events::{NotificationSink, WorkflowEvent, WorkflowEventKind};
use super::models::{
    ClaimedTask, Identity, IdentityId, ItemId, PoolTask, RoleGroup, WorkItem,
};
use super::safety::{self, DeleteConstraint, SafetyDecision};
use super::store::{WorkflowStore, WorkflowTransaction};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Drives work items through their review steps and guards the role
/// groups that service them.
///
/// Every public operation runs in a single store transaction: checks and
/// writes either all apply or none do. Events are journaled in that same
/// transaction and handed to the notification sink after commit.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<WorkflowRegistry>,
    sink: Arc<dyn NotificationSink>,
}

impl WorkflowEngine {
    /// Creates the engine and provisions a role group for every role of
    /// every explicitly mapped collection.
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<WorkflowRegistry>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, WorkflowError> {
        let engine = WorkflowEngine {
            store,
            registry,
            sink,
        };
        engine.run(|tx, _| {
            for (collection, workflow) in engine.registry.collections() {
                for role in &workflow.roles {
                    tx.ensure_role_group(collection, role)?;
                }
            }
            Ok(())
        })?;
        Ok(engine)
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    fn run<T, F>(&self, f: F) -> Result<T, WorkflowError>
    where
        F: FnOnce(&dyn WorkflowTransaction, &mut Vec<WorkflowEvent>) -> Result<T, WorkflowError>,
    {
        let tx = self.store.begin()?;
        let mut events = vec![];
        let value = f(&*tx, &mut events)?;
        for event in &events {
            tx.append_event(event)?;
        }
        tx.commit()?;

        for event in &events {
            self.sink.notify(event);
        }
        Ok(value)
    }

    // =========================================================================
    // Identities
    // =========================================================================

    pub fn add_identity(&self, handle: &str) -> Result<IdentityId, WorkflowError> {
        let handle = handle.trim();
        if handle.is_empty() {
            return Err(PreconditionViolation::EmptyHandle.into());
        }
        let id = self.run(|tx, _| {
            if tx.find_identity(handle)?.is_some() {
                return Err(PreconditionViolation::HandleTaken(handle.to_string()).into());
            }
            Ok(tx.create_identity(handle)?)
        })?;
        info!(identity = id, "Created identity {}", handle);
        Ok(id)
    }

    pub fn find_identity(&self, handle: &str) -> Result<Option<Identity>, WorkflowError> {
        self.run(|tx, _| Ok(tx.find_identity(handle)?))
    }

    pub fn identity_by_handle(&self, handle: &str) -> Result<Identity, WorkflowError> {
        self.find_identity(handle)?
            .ok_or_else(|| PreconditionViolation::UnknownHandle(handle.to_string()).into())
    }

    pub fn list_identities(&self) -> Result<Vec<Identity>, WorkflowError> {
        self.run(|tx, _| Ok(tx.list_identities()?))
    }

    pub fn can_delete_identity(
        &self,
        identity: IdentityId,
    ) -> Result<SafetyDecision, WorkflowError> {
        self.run(|tx, _| {
            require_identity(tx, identity)?;
            safety::check_delete_identity(tx, &self.registry, identity)
        })
    }

    /// Deletes `identity` once nothing in review depends on it.
    ///
    /// Group memberships go with the identity; items it submitted stay, with
    /// their submitter cleared.
    pub fn delete_identity(&self, identity: IdentityId) -> Result<(), WorkflowError> {
        self.run(|tx, _| {
            require_identity(tx, identity)?;
            safety::check_delete_identity(tx, &self.registry, identity)?
                .into_result()
                .inspect_err(|e| warn!(identity, "Could not delete identity: {}", e))?;

            let submitted = tx.items_submitted_by(identity)?;
            for item_id in &submitted {
                tx.clear_submitter(*item_id)?;
            }
            tx.delete_identity(identity)?;
            info!(
                identity,
                cleared_submissions = submitted.len(),
                "Deleted identity"
            );
            Ok(())
        })
    }

    pub fn delete_constraints(
        &self,
        identity: IdentityId,
    ) -> Result<Vec<DeleteConstraint>, WorkflowError> {
        self.run(|tx, _| {
            require_identity(tx, identity)?;
            safety::delete_constraints(tx, &self.registry, identity)
        })
    }

    // =========================================================================
    // Role groups
    // =========================================================================

    /// Returns false if the identity already was a member.
    pub fn add_member(
        &self,
        collection: &CollectionId,
        role: &RoleName,
        identity: IdentityId,
    ) -> Result<bool, WorkflowError> {
        self.registry.resolve_role(collection, role)?;
        self.run(|tx, _| {
            require_identity(tx, identity)?;
            let group = tx.ensure_role_group(collection, role)?;
            let added = tx.add_member(group, identity)?;
            if added {
                info!(identity, %collection, %role, "Added role group member");
            }
            Ok(added)
        })
    }

    pub fn can_remove_member(
        &self,
        collection: &CollectionId,
        role: &RoleName,
        identity: IdentityId,
    ) -> Result<SafetyDecision, WorkflowError> {
        self.run(|tx, _| {
            safety::check_remove_member(tx, &self.registry, collection, role, identity)
        })
    }

    /// Removes `identity` from the (collection, role) group unless that would
    /// leave a task in review without anyone to handle it. Returns false if
    /// the identity was not a member.
    ///
    /// Claims the leaving member holds at steps the group services go back
    /// to the pool of the remaining members.
    pub fn remove_member(
        &self,
        collection: &CollectionId,
        role: &RoleName,
        identity: IdentityId,
    ) -> Result<bool, WorkflowError> {
        self.run(|tx, events| {
            safety::check_remove_member(tx, &self.registry, collection, role, identity)?
                .into_result()
                .inspect_err(|e| warn!(%collection, %role, "Could not remove member: {}", e))?;

            let Some(group) = tx.find_role_group(collection, role)? else {
                return Ok(false);
            };
            if !tx.remove_member(group.id, identity)? {
                return Ok(false);
            }
            info!(identity, %collection, %role, "Removed role group member");

            let workflow = self.registry.resolve_role(collection, role)?;
            for task in tx.claimed_tasks_of(identity)? {
                let serviced = &task.collection == collection
                    && workflow.steps_for_role(role).any(|s| s.id == task.step);
                if !serviced || !tx.release_task(task.item_id, &task.step, identity)? {
                    continue;
                }
                info!(
                    item_id = task.item_id,
                    identity,
                    step = %task.step,
                    "Claim of removed member released to the pool"
                );
                let released = WorkflowEvent::new(
                    task.item_id,
                    task.collection.clone(),
                    WorkflowEventKind::Released,
                );
                events.push(
                    released
                        .from_step(Some(&task.step))
                        .to_step(Some(&task.step))
                        .actor(identity),
                );
            }
            Ok(true)
        })
    }

    /// Every role group known to the store, members included.
    pub fn role_groups(&self) -> Result<Vec<RoleGroup>, WorkflowError> {
        self.run(|tx, _| Ok(tx.list_role_groups()?))
    }

    pub fn members(
        &self,
        collection: &CollectionId,
        role: &RoleName,
    ) -> Result<Vec<Identity>, WorkflowError> {
        self.registry.resolve_role(collection, role)?;
        self.run(|tx, _| {
            let Some(group) = tx.find_role_group(collection, role)? else {
                return Ok(vec![]);
            };
            let mut members = Vec::with_capacity(group.members.len());
            for id in group.members {
                if let Some(identity) = tx.get_identity(id)? {
                    members.push(identity);
                }
            }
            Ok(members)
        })
    }

    // =========================================================================
    // Work items
    // =========================================================================

    /// Puts a new item into review at the first step of its collection's
    /// workflow. A workflow without steps archives the item right away.
    pub fn submit(
        &self,
        collection: &CollectionId,
        submitter: Option<IdentityId>,
    ) -> Result<ItemId, WorkflowError> {
        let workflow = self.registry.get_workflow(collection)?;
        self.run(|tx, events| {
            if let Some(submitter) = submitter {
                require_identity(tx, submitter)?;
            }
            let item_id = tx.create_item(collection, submitter)?;
            let submitted =
                WorkflowEvent::new(item_id, collection.clone(), WorkflowEventKind::Submitted);

            match workflow.first_step() {
                Some(step) => {
                    enter_step(tx, events, item_id, collection, step, submitted)?;
                }
                None => {
                    tx.mark_archived(item_id)?;
                    events.push(submitted);
                    events.push(WorkflowEvent::new(
                        item_id,
                        collection.clone(),
                        WorkflowEventKind::Archived,
                    ));
                    info!(item_id, %collection, "Workflow has no steps, archived on submission");
                }
            }
            Ok(item_id)
        })
    }

    /// Executes `action_id` of step `step_id` on the item as `actor`.
    ///
    /// Claims fail with [`WorkflowError::TaskUnavailable`] when the task is not
    /// pooled; claiming again a task the actor already holds changes nothing.
    /// Completing and releasing require the actor's own claim.
    pub fn perform_action(
        &self,
        item_id: ItemId,
        actor: IdentityId,
        step_id: &StepId,
        action_id: &ActionId,
    ) -> Result<WorkItem, WorkflowError> {
        self.run(|tx, events| {
            let item = require_item(tx, item_id)?;
            let workflow = self.registry.get_workflow(&item.collection)?;
            let step = workflow.get_step(step_id)?;
            let action = step.get_action(action_id)?;

            let current = match (&item.current_step, item.is_in_review()) {
                (Some(current), true) => current,
                _ => {
                    return Err(PreconditionViolation::NotInReview {
                        item_id,
                        status: item.status,
                    }
                    .into())
                }
            };
            if current != step_id {
                return Err(PreconditionViolation::WrongStep {
                    item_id,
                    current: current.clone(),
                    requested: step_id.clone(),
                }
                .into());
            }

            let in_role = tx
                .find_role_group(&item.collection, &step.role)?
                .is_some_and(|g| g.is_member(actor));
            if !in_role {
                return Err(PreconditionViolation::NotInRole {
                    identity: actor,
                    collection: item.collection.clone(),
                    role: step.role.clone(),
                }
                .into());
            }

            let task = tx.get_task(item_id)?.filter(|t| &t.step == step_id);
            let holds_claim = task.as_ref().is_some_and(|t| t.claimed_by == Some(actor));
            let event =
                WorkflowEvent::new(item_id, item.collection.clone(), WorkflowEventKind::Claimed)
                    .from_step(Some(step_id))
                    .action(action_id)
                    .actor(actor);

            match &action.kind {
                ActionKind::Claim => {
                    if holds_claim {
                        debug!(item_id, actor, "Task already claimed by actor");
                    } else if tx.claim_task(item_id, step_id, actor)? {
                        info!(item_id, actor, step = %step_id, "Task claimed");
                        events.push(WorkflowEvent {
                            to_step: Some(step_id.clone()),
                            ..event
                        });
                    } else {
                        return Err(WorkflowError::TaskUnavailable {
                            item_id,
                            step: step_id.clone(),
                        });
                    }
                }
                ActionKind::Release => {
                    if !tx.release_task(item_id, step_id, actor)? {
                        return Err(not_claimed_by(item_id, step_id, actor));
                    }
                    info!(item_id, actor, step = %step_id, "Task released to the pool");
                    events.push(WorkflowEvent {
                        kind: WorkflowEventKind::Released,
                        to_step: Some(step_id.clone()),
                        ..event
                    });
                }
                ActionKind::Complete(outcome) => {
                    if !holds_claim {
                        return Err(not_claimed_by(item_id, step_id, actor));
                    }
                    tx.delete_task(item_id)?;

                    match outcome {
                        ActionOutcome::Advance => match workflow.next_step(step) {
                            Some(next) => {
                                let event = WorkflowEvent {
                                    kind: WorkflowEventKind::Advanced,
                                    ..event
                                };
                                enter_step(tx, events, item_id, &item.collection, next, event)?;
                            }
                            None => {
                                tx.mark_archived(item_id)?;
                                info!(item_id, collection = %item.collection, "Work item archived");
                                events.push(WorkflowEvent {
                                    kind: WorkflowEventKind::Archived,
                                    ..event
                                });
                            }
                        },
                        ActionOutcome::ReturnTo(target) => {
                            let target = workflow.get_step(target)?;
                            let event = WorkflowEvent {
                                kind: WorkflowEventKind::Returned,
                                ..event
                            };
                            enter_step(tx, events, item_id, &item.collection, target, event)?;
                        }
                        ActionOutcome::ReturnToSubmitter => {
                            tx.mark_withdrawn(item_id)?;
                            info!(item_id, actor, "Work item returned to its submitter");
                            events.push(WorkflowEvent {
                                kind: WorkflowEventKind::Withdrawn,
                                ..event
                            });
                        }
                    }
                }
            }

            require_item(tx, item_id)
        })
    }

    /// Takes an item out of review whatever the state of its task.
    pub fn abort(&self, item_id: ItemId) -> Result<WorkItem, WorkflowError> {
        self.run(|tx, events| {
            let item = require_item(tx, item_id)?;
            if !item.is_in_review() {
                return Err(PreconditionViolation::NotInReview {
                    item_id,
                    status: item.status,
                }
                .into());
            }
            tx.delete_task(item_id)?;
            tx.mark_withdrawn(item_id)?;
            info!(item_id, "Work item aborted");
            events.push(
                WorkflowEvent::new(item_id, item.collection, WorkflowEventKind::Withdrawn)
                    .from_step(item.current_step.as_ref()),
            );
            require_item(tx, item_id)
        })
    }

    pub fn get_item(&self, item_id: ItemId) -> Result<WorkItem, WorkflowError> {
        self.run(|tx, _| require_item(tx, item_id))
    }

    pub fn item_history(&self, item_id: ItemId) -> Result<Vec<WorkflowEvent>, WorkflowError> {
        self.run(|tx, _| {
            require_item(tx, item_id)?;
            Ok(tx.item_events(item_id)?)
        })
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// One pool task per current member of the role group servicing the
    /// item's step, or nothing if the task is claimed.
    pub fn pool_tasks_of_item(&self, item_id: ItemId) -> Result<Vec<PoolTask>, WorkflowError> {
        self.run(|tx, _| {
            let item = require_item(tx, item_id)?;
            let Some(task) = tx.get_task(item_id)?.filter(|t| t.is_pooled()) else {
                return Ok(vec![]);
            };
            let workflow = self.registry.get_workflow(&item.collection)?;
            let step = workflow.get_step(&task.step)?;
            let Some(group) = tx.find_role_group(&item.collection, &step.role)? else {
                return Ok(vec![]);
            };
            Ok(group
                .members
                .iter()
                .map(|member| PoolTask {
                    item_id,
                    collection: task.collection.clone(),
                    step: task.step.clone(),
                    role_group: group.id,
                    member: *member,
                })
                .collect())
        })
    }

    pub fn claimed_task_of_item(
        &self,
        item_id: ItemId,
    ) -> Result<Option<ClaimedTask>, WorkflowError> {
        self.run(|tx, _| {
            require_item(tx, item_id)?;
            Ok(tx
                .get_task(item_id)?
                .as_ref()
                .and_then(ClaimedTask::from_record))
        })
    }

    /// Pooled tasks `identity` could claim right now.
    pub fn pool_tasks_for(&self, identity: IdentityId) -> Result<Vec<PoolTask>, WorkflowError> {
        self.run(|tx, _| {
            require_identity(tx, identity)?;
            let mut tasks = vec![];
            for group in tx.groups_of_identity(identity)? {
                let Ok(workflow) = self.registry.resolve_role(&group.collection, &group.role)
                else {
                    continue;
                };
                let serviced: Vec<&StepId> =
                    workflow.steps_for_role(&group.role).map(|s| &s.id).collect();
                for task in tx.tasks_in_collection(&group.collection)? {
                    if task.is_pooled() && serviced.contains(&&task.step) {
                        tasks.push(PoolTask {
                            item_id: task.item_id,
                            collection: task.collection,
                            step: task.step,
                            role_group: group.id,
                            member: identity,
                        });
                    }
                }
            }
            tasks.sort_by_key(|t| t.item_id);
            Ok(tasks)
        })
    }

    pub fn claimed_tasks_of(
        &self,
        identity: IdentityId,
    ) -> Result<Vec<ClaimedTask>, WorkflowError> {
        self.run(|tx, _| {
            require_identity(tx, identity)?;
            Ok(tx
                .claimed_tasks_of(identity)?
                .iter()
                .filter_map(ClaimedTask::from_record)
                .collect())
        })
    }

    /// Items in review whose current step has nobody to handle it.
    pub fn parked_items(&self) -> Result<Vec<WorkItem>, WorkflowError> {
        self.run(|tx, _| {
            let mut parked = vec![];
            for item in tx.items_in_review()? {
                let Some(step_id) = &item.current_step else {
                    continue;
                };
                let Ok(step) = self
                    .registry
                    .get_workflow(&item.collection)
                    .and_then(|w| w.get_step(step_id))
                else {
                    debug!(item_id = item.id, "Skipping item at an unconfigured step");
                    continue;
                };
                if is_empty(tx.find_role_group(&item.collection, &step.role)?.as_ref()) {
                    parked.push(item);
                }
            }
            Ok(parked)
        })
    }
}

fn is_empty(group: Option<&RoleGroup>) -> bool {
    group.map_or(true, |g| g.members.is_empty())
}

fn not_claimed_by(item_id: ItemId, step: &StepId, identity: IdentityId) -> WorkflowError {
    PreconditionViolation::NotClaimedByActor {
        item_id,
        step: step.clone(),
        identity,
    }
    .into()
}

fn require_item(tx: &dyn WorkflowTransaction, item_id: ItemId) -> Result<WorkItem, WorkflowError> {
    tx.get_item(item_id)?
        .ok_or_else(|| PreconditionViolation::UnknownItem(item_id).into())
}

fn require_identity(
    tx: &dyn WorkflowTransaction,
    identity: IdentityId,
) -> Result<Identity, WorkflowError> {
    tx.get_identity(identity)?
        .ok_or_else(|| PreconditionViolation::UnknownIdentity(identity).into())
}

/// Moves the item to `step` with a fresh pooled task.
///
/// An empty role group does not stop the transition: the item stays parked
/// at the step until a member is added.
fn enter_step(
    tx: &dyn WorkflowTransaction,
    events: &mut Vec<WorkflowEvent>,
    item_id: ItemId,
    collection: &CollectionId,
    step: &StepDefinition,
    event: WorkflowEvent,
) -> Result<(), WorkflowError> {
    tx.set_current_step(item_id, Some(&step.id))?;
    tx.put_pooled_task(item_id, collection, &step.id)?;
    info!(item_id, %collection, step = %step.id, "Work item pooled at step");
    events.push(event.to_step(Some(&step.id)));

    if is_empty(tx.find_role_group(collection, &step.role)?.as_ref()) {
        warn!(
            item_id,
            %collection,
            step = %step.id,
            role = %step.role,
            "No member can claim the work item until the role group gets one"
        );
        events.push(
            WorkflowEvent::new(item_id, collection.clone(), WorkflowEventKind::Parked)
                .to_step(Some(&step.id)),
        );
    }
    Ok(())
}
