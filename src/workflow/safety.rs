//! Referential safety checks.
//!
//! A role group must never lose its last member while an item is waiting
//! at a step the group services, and an identity must never be deleted
//! while it holds a claim. The checks here only read: the engine runs them
//! inside the same transaction that applies the change, before any write.

use super::definition::{CollectionId, RoleName, StepId, WorkflowRegistry};
use super::error::WorkflowError;
use super::models::{IdentityId, ItemId};
use super::store::{RoleGroupStore, TaskStore};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Something that keeps a membership removal or identity deletion from
/// going ahead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Blocker {
    /// The identity is the only member able to claim a pooled task.
    PooledTask {
        collection: CollectionId,
        role: RoleName,
        step: StepId,
        item_id: ItemId,
    },
    /// The identity is the only member of the group authorizing a step it
    /// holds a claim at.
    ClaimedTask {
        collection: CollectionId,
        role: RoleName,
        step: StepId,
        item_id: ItemId,
    },
    /// The identity holds a claim, whatever the size of its groups.
    HeldClaim {
        collection: CollectionId,
        step: StepId,
        item_id: ItemId,
    },
}

impl Blocker {
    pub fn item_id(&self) -> ItemId {
        match self {
            Blocker::PooledTask { item_id, .. }
            | Blocker::ClaimedTask { item_id, .. }
            | Blocker::HeldClaim { item_id, .. } => *item_id,
        }
    }
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocker::PooledTask {
                collection,
                role,
                step,
                item_id,
            } => write!(
                f,
                "work item {} is pooled at step {} of collection {} and no other {} could claim it",
                item_id, step, collection, role
            ),
            Blocker::ClaimedTask {
                collection,
                role,
                step,
                item_id,
            } => write!(
                f,
                "work item {} is claimed at step {} of collection {}, which no other {} could take over",
                item_id, step, collection, role
            ),
            Blocker::HeldClaim {
                collection,
                step,
                item_id,
            } => write!(
                f,
                "work item {} is claimed at step {} of collection {}",
                item_id, step, collection
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyRefusal {
    pub identity: IdentityId,
    pub blockers: Vec<Blocker>,
}

impl fmt::Display for SafetyRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identity {} is still needed: ", self.identity)?;
        for (i, blocker) in self.blockers.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", blocker)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "decision", content = "refusal")]
pub enum SafetyDecision {
    Allowed,
    Refused(SafetyRefusal),
}

impl SafetyDecision {
    fn from_blockers(identity: IdentityId, blockers: Vec<Blocker>) -> Self {
        if blockers.is_empty() {
            SafetyDecision::Allowed
        } else {
            SafetyDecision::Refused(SafetyRefusal { identity, blockers })
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, SafetyDecision::Allowed)
    }

    pub fn into_result(self) -> Result<(), WorkflowError> {
        match self {
            SafetyDecision::Allowed => Ok(()),
            SafetyDecision::Refused(refusal) => Err(WorkflowError::Refused(refusal)),
        }
    }
}

/// Kinds of task references that keep an identity from being deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteConstraint {
    ClaimedTask,
    PoolTask,
}

impl DeleteConstraint {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteConstraint::ClaimedTask => "claimed_task",
            DeleteConstraint::PoolTask => "pool_task",
        }
    }
}

/// Blockers for removing `identity` from the (collection, role) group.
fn remove_member_blockers<T>(
    tx: &T,
    registry: &WorkflowRegistry,
    collection: &CollectionId,
    role: &RoleName,
    identity: IdentityId,
) -> Result<Vec<Blocker>, WorkflowError>
where
    T: RoleGroupStore + TaskStore + ?Sized,
{
    let workflow = registry.resolve_role(collection, role)?;

    let Some(group) = tx.find_role_group(collection, role)? else {
        return Ok(vec![]);
    };
    if !group.is_sole_member(identity) {
        return Ok(vec![]);
    }

    let serviced: Vec<&StepId> = workflow.steps_for_role(role).map(|s| &s.id).collect();
    if serviced.is_empty() {
        return Ok(vec![]);
    }

    let mut blockers = vec![];
    for task in tx.tasks_in_collection(collection)? {
        if !serviced.contains(&&task.step) {
            continue;
        }
        match task.claimed_by {
            None => blockers.push(Blocker::PooledTask {
                collection: collection.clone(),
                role: role.clone(),
                step: task.step,
                item_id: task.item_id,
            }),
            Some(holder) if holder == identity => blockers.push(Blocker::ClaimedTask {
                collection: collection.clone(),
                role: role.clone(),
                step: task.step,
                item_id: task.item_id,
            }),
            Some(_) => {}
        }
    }
    Ok(blockers)
}

/// Decides whether `identity` may leave the (collection, role) group.
///
/// Removing a member is always allowed while others remain in the group;
/// the engine hands any claim they hold at a serviced step back to the pool.
/// The last member is refused while the group services a step with a
/// pooled task, or a step where they hold the claim.
pub fn check_remove_member<T>(
    tx: &T,
    registry: &WorkflowRegistry,
    collection: &CollectionId,
    role: &RoleName,
    identity: IdentityId,
) -> Result<SafetyDecision, WorkflowError>
where
    T: RoleGroupStore + TaskStore + ?Sized,
{
    let blockers = remove_member_blockers(tx, registry, collection, role, identity)?;
    Ok(SafetyDecision::from_blockers(identity, blockers))
}

/// Decides whether `identity` may be deleted: every group it is in must
/// let it go, and it must not hold any claim.
pub fn check_delete_identity<T>(
    tx: &T,
    registry: &WorkflowRegistry,
    identity: IdentityId,
) -> Result<SafetyDecision, WorkflowError>
where
    T: RoleGroupStore + TaskStore + ?Sized,
{
    let mut blockers = vec![];
    for group in tx.groups_of_identity(identity)? {
        if registry
            .resolve_role(&group.collection, &group.role)
            .is_err()
        {
            // No workflow routes items to this group any more.
            debug!(
                collection = %group.collection,
                role = %group.role,
                "Skipping unconfigured role group"
            );
            continue;
        }
        blockers.extend(remove_member_blockers(
            tx,
            registry,
            &group.collection,
            &group.role,
            identity,
        )?);
    }

    for task in tx.claimed_tasks_of(identity)? {
        let already_reported = blockers.iter().any(|b| b.item_id() == task.item_id);
        if !already_reported {
            blockers.push(Blocker::HeldClaim {
                collection: task.collection,
                step: task.step,
                item_id: task.item_id,
            });
        }
    }

    Ok(SafetyDecision::from_blockers(identity, blockers))
}

/// Lists which kinds of tasks currently reference `identity`: claims it
/// holds, and pooled tasks it is eligible to claim.
pub fn delete_constraints<T>(
    tx: &T,
    registry: &WorkflowRegistry,
    identity: IdentityId,
) -> Result<Vec<DeleteConstraint>, WorkflowError>
where
    T: RoleGroupStore + TaskStore + ?Sized,
{
    let mut constraints = vec![];
    if !tx.claimed_tasks_of(identity)?.is_empty() {
        constraints.push(DeleteConstraint::ClaimedTask);
    }

    'groups: for group in tx.groups_of_identity(identity)? {
        let Ok(workflow) = registry.resolve_role(&group.collection, &group.role) else {
            continue;
        };
        let serviced: Vec<&StepId> = workflow.steps_for_role(&group.role).map(|s| &s.id).collect();
        for task in tx.tasks_in_collection(&group.collection)? {
            if task.is_pooled() && serviced.contains(&&task.step) {
                constraints.push(DeleteConstraint::PoolTask);
                break 'groups;
            }
        }
    }
    Ok(constraints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::sqlite_workflow_store::SqliteWorkflowStore;
    use crate::workflow::store::{IdentityStore, ItemStore, WorkflowStore};

    const WORKFLOWS: &str = r#"
        [[workflow]]
        id = "default"
        roles = ["reviewer", "editor"]
          [[workflow.step]]
          id = "reviewstep"
          role = "reviewer"
          actions = [{ id = "claim", kind = "claim" }, { id = "approve", kind = "complete" }]
          [[workflow.step]]
          id = "editstep"
          role = "editor"
          actions = [{ id = "claim", kind = "claim" }, { id = "approve", kind = "complete" }]
    "#;

    fn role(name: &str) -> RoleName {
        RoleName::parse(name).unwrap()
    }

    #[test]
    fn non_member_and_shared_group_are_allowed() {
        let registry = WorkflowRegistry::from_toml_str(WORKFLOWS).unwrap();
        let store = SqliteWorkflowStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let c = CollectionId::from("c1");

        let alice = tx.create_identity("alice").unwrap();
        let bob = tx.create_identity("bob").unwrap();
        let group = tx.ensure_role_group(&c, &role("reviewer")).unwrap();
        tx.add_member(group, alice).unwrap();
        tx.add_member(group, bob).unwrap();
        let item = tx.create_item(&c, None).unwrap();
        tx.put_pooled_task(item, &c, &StepId::from("reviewstep"))
            .unwrap();

        let decision = check_remove_member(&*tx, &registry, &c, &role("reviewer"), alice).unwrap();
        assert!(decision.is_allowed());

        let decision = check_remove_member(&*tx, &registry, &c, &role("editor"), alice).unwrap();
        assert!(decision.is_allowed());
    }

    #[test]
    fn sole_member_with_pooled_task_is_refused() {
        let registry = WorkflowRegistry::from_toml_str(WORKFLOWS).unwrap();
        let store = SqliteWorkflowStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let c = CollectionId::from("c1");

        let alice = tx.create_identity("alice").unwrap();
        let group = tx.ensure_role_group(&c, &role("reviewer")).unwrap();
        tx.add_member(group, alice).unwrap();
        let item = tx.create_item(&c, None).unwrap();
        tx.put_pooled_task(item, &c, &StepId::from("reviewstep"))
            .unwrap();

        let decision = check_remove_member(&*tx, &registry, &c, &role("reviewer"), alice).unwrap();
        let SafetyDecision::Refused(refusal) = decision else {
            panic!("expected a refusal");
        };
        assert_eq!(
            refusal.blockers,
            vec![Blocker::PooledTask {
                collection: c.clone(),
                role: role("reviewer"),
                step: StepId::from("reviewstep"),
                item_id: item,
            }]
        );

        // A pooled task in another collection does not matter
        let other = CollectionId::from("c2");
        let decision =
            check_remove_member(&*tx, &registry, &other, &role("reviewer"), alice).unwrap();
        assert!(decision.is_allowed());
    }

    #[test]
    fn held_claim_blocks_deletion_regardless_of_group_size() {
        let registry = WorkflowRegistry::from_toml_str(WORKFLOWS).unwrap();
        let store = SqliteWorkflowStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let c = CollectionId::from("c1");
        let step = StepId::from("reviewstep");

        let alice = tx.create_identity("alice").unwrap();
        let bob = tx.create_identity("bob").unwrap();
        let group = tx.ensure_role_group(&c, &role("reviewer")).unwrap();
        tx.add_member(group, alice).unwrap();
        tx.add_member(group, bob).unwrap();
        let item = tx.create_item(&c, None).unwrap();
        tx.put_pooled_task(item, &c, &step).unwrap();
        tx.claim_task(item, &step, alice).unwrap();

        assert!(check_remove_member(&*tx, &registry, &c, &role("reviewer"), alice)
            .unwrap()
            .is_allowed());

        let decision = check_delete_identity(&*tx, &registry, alice).unwrap();
        assert_eq!(
            decision,
            SafetyDecision::Refused(SafetyRefusal {
                identity: alice,
                blockers: vec![Blocker::HeldClaim {
                    collection: c.clone(),
                    step: step.clone(),
                    item_id: item,
                }],
            })
        );
        assert!(check_delete_identity(&*tx, &registry, bob)
            .unwrap()
            .is_allowed());
    }

    #[test]
    fn sole_holder_claim_is_reported_once() {
        let registry = WorkflowRegistry::from_toml_str(WORKFLOWS).unwrap();
        let store = SqliteWorkflowStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let c = CollectionId::from("c1");
        let step = StepId::from("reviewstep");

        let alice = tx.create_identity("alice").unwrap();
        let group = tx.ensure_role_group(&c, &role("reviewer")).unwrap();
        tx.add_member(group, alice).unwrap();
        let item = tx.create_item(&c, None).unwrap();
        tx.put_pooled_task(item, &c, &step).unwrap();
        tx.claim_task(item, &step, alice).unwrap();

        let SafetyDecision::Refused(refusal) =
            check_delete_identity(&*tx, &registry, alice).unwrap()
        else {
            panic!("expected a refusal");
        };
        assert_eq!(refusal.blockers.len(), 1);
        assert!(matches!(refusal.blockers[0], Blocker::ClaimedTask { .. }));
        assert!(refusal.to_string().contains("work item 1 is claimed at step reviewstep"));
    }

    #[test]
    fn reports_delete_constraints() {
        let registry = WorkflowRegistry::from_toml_str(WORKFLOWS).unwrap();
        let store = SqliteWorkflowStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let c = CollectionId::from("c1");
        let step = StepId::from("reviewstep");

        let alice = tx.create_identity("alice").unwrap();
        let group = tx.ensure_role_group(&c, &role("reviewer")).unwrap();
        tx.add_member(group, alice).unwrap();
        assert!(delete_constraints(&*tx, &registry, alice).unwrap().is_empty());

        let first = tx.create_item(&c, None).unwrap();
        let second = tx.create_item(&c, None).unwrap();
        tx.put_pooled_task(first, &c, &step).unwrap();
        tx.put_pooled_task(second, &c, &step).unwrap();
        assert_eq!(
            delete_constraints(&*tx, &registry, alice).unwrap(),
            vec![DeleteConstraint::PoolTask]
        );

        tx.claim_task(first, &step, alice).unwrap();
        assert_eq!(
            delete_constraints(&*tx, &registry, alice).unwrap(),
            vec![DeleteConstraint::ClaimedTask, DeleteConstraint::PoolTask]
        );
    }

    #[test]
    fn unknown_role_is_a_definition_error() {
        let registry = WorkflowRegistry::from_toml_str(WORKFLOWS).unwrap();
        let store = SqliteWorkflowStore::in_memory().unwrap();
        let tx = store.begin().unwrap();

        let err = check_remove_member(
            &*tx,
            &registry,
            &CollectionId::from("c1"),
            &role("curator"),
            1,
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }
}
