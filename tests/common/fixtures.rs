//! Engine fixtures backed by a fresh database per test

use super::constants::*;
use reviewflow::workflow::{
    ActionId, BroadcastNotificationSink, CollectionId, IdentityId, ItemId, RoleName,
    SqliteWorkflowStore, StepId, WorkItem, WorkflowEngine, WorkflowError, WorkflowEvent,
    WorkflowRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub struct TestEngine {
    pub engine: Arc<WorkflowEngine>,
    pub sink: Arc<BroadcastNotificationSink>,
    pub db_path: PathBuf,
    // Keeps the database directory alive for the test duration
    _dir: TempDir,
}

impl TestEngine {
    /// Engine over an empty on-disk database and the three-step workflow.
    pub fn spawn() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = dir.path().join("reviewflow.db");
        let sink = Arc::new(BroadcastNotificationSink::new(1024));
        let engine = open_engine(&db_path, sink.clone());
        TestEngine {
            engine: Arc::new(engine),
            sink,
            db_path,
            _dir: dir,
        }
    }

    /// A second engine over the same database file.
    pub fn reopen(&self) -> WorkflowEngine {
        open_engine(&self.db_path, Arc::new(BroadcastNotificationSink::new(16)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sink.subscribe()
    }

    pub fn identity(&self, handle: &str) -> IdentityId {
        self.engine
            .add_identity(handle)
            .expect("Failed to add identity")
    }

    pub fn join(&self, collection: &str, role_name: &str, identity: IdentityId) {
        self.engine
            .add_member(&CollectionId::from(collection), &role(role_name), identity)
            .expect("Failed to add member");
    }

    pub fn submit(&self, collection: &str) -> ItemId {
        self.engine
            .submit(&CollectionId::from(collection), None)
            .expect("Failed to submit item")
    }

    pub fn act(
        &self,
        item_id: ItemId,
        actor: IdentityId,
        step_id: &str,
        action_id: &str,
    ) -> Result<WorkItem, WorkflowError> {
        self.engine
            .perform_action(item_id, actor, &StepId::from(step_id), &ActionId::from(action_id))
    }

    /// Claims and approves the task at `step_id`.
    pub fn claim_and_approve(&self, item_id: ItemId, actor: IdentityId, step_id: &str) -> WorkItem {
        self.act(item_id, actor, step_id, CLAIM)
            .expect("Failed to claim");
        self.act(item_id, actor, step_id, APPROVE)
            .expect("Failed to approve")
    }

    pub fn remove(
        &self,
        collection: &str,
        role_name: &str,
        identity: IdentityId,
    ) -> Result<bool, WorkflowError> {
        self.engine
            .remove_member(&CollectionId::from(collection), &role(role_name), identity)
    }

    pub fn can_remove(&self, collection: &str, role_name: &str, identity: IdentityId) -> bool {
        self.engine
            .can_remove_member(&CollectionId::from(collection), &role(role_name), identity)
            .expect("Failed to check removal")
            .is_allowed()
    }

    pub fn can_delete(&self, identity: IdentityId) -> bool {
        self.engine
            .can_delete_identity(identity)
            .expect("Failed to check deletion")
            .is_allowed()
    }
}

pub fn role(name: &str) -> RoleName {
    RoleName::parse(name).expect("Invalid role name")
}

fn open_engine(db_path: &Path, sink: Arc<BroadcastNotificationSink>) -> WorkflowEngine {
    let registry =
        WorkflowRegistry::from_toml_str(WORKFLOWS_TOML).expect("Failed to parse workflows");
    let store = SqliteWorkflowStore::new(db_path).expect("Failed to open store");
    WorkflowEngine::new(Arc::new(store), Arc::new(registry), sink)
        .expect("Failed to create engine")
}

/// Writes the workflows file next to a database path for CLI runs.
pub fn create_cli_workspace() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let workflows_path = dir.path().join("workflows.toml");
    std::fs::write(&workflows_path, WORKFLOWS_TOML).expect("Failed to write workflows");
    let db_path = dir.path().join("reviewflow.db");
    (dir, db_path, workflows_path)
}
