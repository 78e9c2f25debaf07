//! Review workflow configuration.
//!
//! Workflows are loaded once from a TOML document into an immutable
//! [`WorkflowRegistry`] and shared by the engine. Every name used for
//! routing (collections, steps, actions, roles) is validated at load time,
//! so the engine only ever compares typed identifiers.

use super::error::{DefinitionRef, WorkflowError};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }
    };
}

string_id!(
    /// Handle of a collection, e.g. `123456789/2`.
    CollectionId
);
string_id!(WorkflowId);
string_id!(StepId);
string_id!(ActionId);

/// A validated role name. Only lowercase ASCII letters, digits, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleName(String);

impl RoleName {
    pub fn parse<T: AsRef<str>>(value: T) -> Result<Self> {
        let value = value.as_ref();
        if value.is_empty() {
            bail!("Role name cannot be empty");
        }
        if let Some(c) = value
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
        {
            bail!("Invalid character {:?} in role name {:?}", c, value);
        }
        Ok(RoleName(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoleName {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        RoleName::parse(value)
    }
}

impl From<RoleName> for String {
    fn from(value: RoleName) -> Self {
        value.0
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a completed step sends the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Move to the next step by position, archiving after the last one.
    Advance,
    /// Re-pool the item at another step of the same workflow.
    ReturnTo(StepId),
    /// Take the item out of review and hand it back to its submitter.
    ReturnToSubmitter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Claim,
    Release,
    Complete(ActionOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDefinition {
    pub id: ActionId,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDefinition {
    pub id: StepId,
    pub position: usize,
    pub role: RoleName,
    pub actions: Vec<ActionDefinition>,
}

impl StepDefinition {
    pub fn get_action(&self, action_id: &ActionId) -> Result<&ActionDefinition, WorkflowError> {
        self.actions
            .iter()
            .find(|a| &a.id == action_id)
            .ok_or_else(|| {
                WorkflowError::DefinitionNotFound(DefinitionRef::Action {
                    step: self.id.clone(),
                    action: action_id.clone(),
                })
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    pub id: WorkflowId,
    pub roles: Vec<RoleName>,
    /// Ordered by position.
    pub steps: Vec<StepDefinition>,
}

impl Workflow {
    pub fn get_step(&self, step_id: &StepId) -> Result<&StepDefinition, WorkflowError> {
        self.steps.iter().find(|s| &s.id == step_id).ok_or_else(|| {
            WorkflowError::DefinitionNotFound(DefinitionRef::Step {
                workflow: self.id.clone(),
                step: step_id.clone(),
            })
        })
    }

    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }

    pub fn next_step(&self, step: &StepDefinition) -> Option<&StepDefinition> {
        self.steps.get(step.position + 1)
    }

    /// Steps whose actions are performed by the given role.
    pub fn steps_for_role<'a>(
        &'a self,
        role: &'a RoleName,
    ) -> impl Iterator<Item = &'a StepDefinition> + 'a {
        self.steps.iter().filter(move |s| &s.role == role)
    }

    pub fn has_role(&self, role: &RoleName) -> bool {
        self.roles.contains(role)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowsFile {
    #[serde(default, rename = "workflow")]
    workflows: Vec<WorkflowEntry>,
    #[serde(default, rename = "collection")]
    collections: Vec<CollectionEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowEntry {
    id: String,
    roles: Vec<RoleName>,
    #[serde(default, rename = "step")]
    steps: Vec<StepEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StepEntry {
    id: String,
    role: RoleName,
    actions: Vec<ActionEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ActionEntry {
    id: String,
    kind: ActionKindEntry,
    outcome: Option<OutcomeEntry>,
    target: Option<String>,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum ActionKindEntry {
    Claim,
    Release,
    Complete,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum OutcomeEntry {
    Advance,
    ReturnTo,
    ReturnToSubmitter,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CollectionEntry {
    id: String,
    workflow: String,
}

/// Name of the workflow used by collections without an explicit mapping.
pub const DEFAULT_WORKFLOW_ID: &str = "default";

#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<WorkflowId, Workflow>,
    collections: HashMap<CollectionId, WorkflowId>,
}

impl WorkflowRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflows file: {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid workflows file: {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: WorkflowsFile = toml::from_str(content)?;

        let mut workflows = HashMap::new();
        for entry in file.workflows {
            let workflow = Self::build_workflow(entry)?;
            if workflows.contains_key(&workflow.id) {
                bail!("Workflow {} is defined more than once", workflow.id);
            }
            workflows.insert(workflow.id.clone(), workflow);
        }

        let mut collections = HashMap::new();
        for entry in file.collections {
            let workflow_id = WorkflowId(entry.workflow);
            if !workflows.contains_key(&workflow_id) {
                bail!(
                    "Collection {} references unknown workflow {}",
                    entry.id,
                    workflow_id
                );
            }
            if collections
                .insert(CollectionId(entry.id.clone()), workflow_id)
                .is_some()
            {
                bail!("Collection {} is mapped more than once", entry.id);
            }
        }

        Ok(WorkflowRegistry {
            workflows,
            collections,
        })
    }

    fn build_workflow(entry: WorkflowEntry) -> Result<Workflow> {
        let workflow_id = WorkflowId(entry.id);
        let mut seen_roles = HashSet::new();
        for role in &entry.roles {
            if !seen_roles.insert(role) {
                bail!("Workflow {} declares role {} twice", workflow_id, role);
            }
        }

        let step_ids: HashSet<&str> = entry.steps.iter().map(|s| s.id.as_str()).collect();
        if step_ids.len() != entry.steps.len() {
            bail!("Workflow {} has duplicate step ids", workflow_id);
        }

        let mut steps = Vec::with_capacity(entry.steps.len());
        for (position, step) in entry.steps.iter().enumerate() {
            if !entry.roles.contains(&step.role) {
                bail!(
                    "Step {} of workflow {} uses undeclared role {}",
                    step.id,
                    workflow_id,
                    step.role
                );
            }

            let mut actions: Vec<ActionDefinition> = Vec::with_capacity(step.actions.len());
            for action in &step.actions {
                let kind = Self::build_action_kind(action, &step_ids)
                    .with_context(|| format!("Invalid action {} of step {}", action.id, step.id))?;
                if actions.iter().any(|a| a.id.as_str() == action.id) {
                    bail!("Step {} defines action {} twice", step.id, action.id);
                }
                actions.push(ActionDefinition {
                    id: ActionId(action.id.clone()),
                    kind,
                });
            }

            if !actions.iter().any(|a| a.kind == ActionKind::Claim) {
                bail!("Step {} has no claim action", step.id);
            }
            if !actions
                .iter()
                .any(|a| matches!(a.kind, ActionKind::Complete(_)))
            {
                bail!("Step {} has no completing action", step.id);
            }

            steps.push(StepDefinition {
                id: StepId(step.id.clone()),
                position,
                role: step.role.clone(),
                actions,
            });
        }

        Ok(Workflow {
            id: workflow_id,
            roles: entry.roles,
            steps,
        })
    }

    fn build_action_kind(action: &ActionEntry, step_ids: &HashSet<&str>) -> Result<ActionKind> {
        let kind = match (action.kind, action.outcome) {
            (ActionKindEntry::Claim, None) => ActionKind::Claim,
            (ActionKindEntry::Release, None) => ActionKind::Release,
            (ActionKindEntry::Complete, None)
            | (ActionKindEntry::Complete, Some(OutcomeEntry::Advance)) => {
                ActionKind::Complete(ActionOutcome::Advance)
            }
            (ActionKindEntry::Complete, Some(OutcomeEntry::ReturnToSubmitter)) => {
                ActionKind::Complete(ActionOutcome::ReturnToSubmitter)
            }
            (ActionKindEntry::Complete, Some(OutcomeEntry::ReturnTo)) => {
                let target = action
                    .target
                    .as_deref()
                    .context("outcome return_to requires a target step")?;
                if !step_ids.contains(target) {
                    bail!("return_to target {} is not a step of this workflow", target);
                }
                return Ok(ActionKind::Complete(ActionOutcome::ReturnTo(StepId::from(
                    target,
                ))));
            }
            (_, Some(_)) => bail!("only complete actions can declare an outcome"),
        };
        if action.target.is_some() {
            bail!("target is only valid with outcome return_to");
        }
        Ok(kind)
    }

    /// Resolves the workflow that reviews submissions to `collection`.
    pub fn get_workflow(&self, collection: &CollectionId) -> Result<&Workflow, WorkflowError> {
        self.collections
            .get(collection)
            .or_else(|| {
                self.workflows
                    .get_key_value(&WorkflowId::from(DEFAULT_WORKFLOW_ID))
                    .map(|(id, _)| id)
            })
            .and_then(|workflow_id| self.workflows.get(workflow_id))
            .ok_or_else(|| {
                WorkflowError::DefinitionNotFound(DefinitionRef::Collection(collection.clone()))
            })
    }

    /// Checks that `role` is a role of the collection's workflow.
    pub fn resolve_role(
        &self,
        collection: &CollectionId,
        role: &RoleName,
    ) -> Result<&Workflow, WorkflowError> {
        let workflow = self.get_workflow(collection)?;
        if !workflow.has_role(role) {
            return Err(WorkflowError::DefinitionNotFound(DefinitionRef::Role {
                collection: collection.clone(),
                role: role.clone(),
            }));
        }
        Ok(workflow)
    }

    /// Collections with an explicit workflow mapping.
    pub fn collections(&self) -> impl Iterator<Item = (&CollectionId, &Workflow)> {
        self.collections
            .iter()
            .filter_map(|(collection, id)| self.workflows.get(id).map(|w| (collection, w)))
    }

    pub fn workflows(&self) -> impl Iterator<Item = &Workflow> {
        self.workflows.values()
    }
}
