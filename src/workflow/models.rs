//! Workflow data models

use super::definition::{CollectionId, RoleName, StepId};
use serde::Serialize;
use std::fmt;
use std::time::SystemTime;

pub type IdentityId = usize;
pub type ItemId = usize;
pub type RoleGroupId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InReview,
    Archived,
    Withdrawn,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::InReview => "in_review",
            ItemStatus::Archived => "archived",
            ItemStatus::Withdrawn => "withdrawn",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "in_review" => Some(ItemStatus::InReview),
            "archived" => Some(ItemStatus::Archived),
            "withdrawn" => Some(ItemStatus::Withdrawn),
            _ => None,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submission going through (or done with) review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub collection: CollectionId,
    /// Cleared when the submitter's identity is deleted.
    pub submitter: Option<IdentityId>,
    /// None once the item is archived or withdrawn.
    pub current_step: Option<StepId>,
    pub status: ItemStatus,
    pub created: SystemTime,
}

impl WorkItem {
    pub fn is_in_review(&self) -> bool {
        self.status == ItemStatus::InReview
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: IdentityId,
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleGroup {
    pub id: RoleGroupId,
    pub collection: CollectionId,
    pub role: RoleName,
    pub members: Vec<IdentityId>,
}

impl RoleGroup {
    pub fn is_member(&self, identity: IdentityId) -> bool {
        self.members.contains(&identity)
    }

    pub fn is_sole_member(&self, identity: IdentityId) -> bool {
        self.members.len() == 1 && self.members[0] == identity
    }
}

/// The single task row of an item sitting at a step.
///
/// Pool tasks are not stored per member: a pooled record is visible to
/// whoever is a member of the step's role group at the time of asking, and
/// claiming it sets the claim marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub item_id: ItemId,
    pub collection: CollectionId,
    pub step: StepId,
    pub claimed_by: Option<IdentityId>,
}

impl TaskRecord {
    pub fn is_pooled(&self) -> bool {
        self.claimed_by.is_none()
    }
}

/// A pooled task as seen by one current member of the step's role group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolTask {
    pub item_id: ItemId,
    pub collection: CollectionId,
    pub step: StepId,
    pub role_group: RoleGroupId,
    pub member: IdentityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimedTask {
    pub item_id: ItemId,
    pub collection: CollectionId,
    pub step: StepId,
    pub owner: IdentityId,
}

impl ClaimedTask {
    pub fn from_record(record: &TaskRecord) -> Option<Self> {
        record.claimed_by.map(|owner| ClaimedTask {
            item_id: record.item_id,
            collection: record.collection.clone(),
            step: record.step.clone(),
            owner,
        })
    }
}
