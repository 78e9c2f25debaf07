use super::definition::{ActionId, CollectionId, RoleName, StepId};
use super::events::{WorkflowEvent, WorkflowEventKind};
use super::models::{
    Identity, IdentityId, ItemId, ItemStatus, RoleGroup, RoleGroupId, TaskRecord, WorkItem,
};
use super::store::{
    EventJournal, IdentityStore, ItemStore, RoleGroupStore, TaskStore, WorkflowStore,
    WorkflowTransaction,
};
use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema, BASE_DB_VERSION,
    DEFAULT_TIMESTAMP,
};
use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info};

pub const DEFAULT_DB_FILE_NAME: &str = "reviewflow.db";

/// V 0
const IDENTITY_TABLE_V_0: Table = Table {
    name: "identity",
    columns: &[
        sqlite_column!(
            "id",
            &SqlType::Integer,
            is_primary_key = true,
            is_unique = true
        ),
        sqlite_column!("handle", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    unique_constraints: &[],
    indices: &[("idx_identity_handle", "handle")],
};
const ROLE_GROUP_TABLE_V_0: Table = Table {
    name: "role_group",
    columns: &[
        sqlite_column!(
            "id",
            &SqlType::Integer,
            is_primary_key = true,
            is_unique = true
        ),
        sqlite_column!("collection", &SqlType::Text, non_null = true),
        sqlite_column!("role", &SqlType::Text, non_null = true),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    unique_constraints: &[&["collection", "role"]],
    indices: &[],
};
const ROLE_GROUP_MEMBER_TABLE_V_0: Table = Table {
    name: "role_group_member",
    columns: &[
        sqlite_column!(
            "group_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "role_group",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!(
            "identity_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "identity",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    unique_constraints: &[&["group_id", "identity_id"]],
    indices: &[("idx_role_group_member_identity_id", "identity_id")],
};
const WORK_ITEM_TABLE_V_0: Table = Table {
    name: "work_item",
    columns: &[
        sqlite_column!(
            "id",
            &SqlType::Integer,
            is_primary_key = true,
            is_unique = true
        ),
        sqlite_column!("collection", &SqlType::Text, non_null = true),
        sqlite_column!(
            "submitter_id",
            &SqlType::Integer,
            foreign_key = Some(&ForeignKey {
                foreign_table: "identity",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::SetNull,
            })
        ),
        sqlite_column!("current_step", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    unique_constraints: &[],
    indices: &[
        ("idx_work_item_submitter_id", "submitter_id"),
        ("idx_work_item_status", "status"),
    ],
};
const WORKFLOW_TASK_TABLE_V_0: Table = Table {
    name: "workflow_task",
    columns: &[
        sqlite_column!(
            "item_id",
            &SqlType::Integer,
            non_null = true,
            is_unique = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "work_item",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("collection", &SqlType::Text, non_null = true),
        sqlite_column!("step", &SqlType::Text, non_null = true),
        // NULL while pooled. An identity holding a claim cannot be deleted.
        sqlite_column!(
            "claimed_by",
            &SqlType::Integer,
            foreign_key = Some(&ForeignKey {
                foreign_table: "identity",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Restrict,
            })
        ),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    unique_constraints: &[],
    indices: &[
        ("idx_workflow_task_collection", "collection"),
        ("idx_workflow_task_claimed_by", "claimed_by"),
    ],
};

/// V 1
const WORKFLOW_EVENT_TABLE_V_1: Table = Table {
    name: "workflow_event",
    columns: &[
        sqlite_column!(
            "id",
            &SqlType::Integer,
            is_primary_key = true,
            is_unique = true
        ),
        sqlite_column!(
            "item_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "work_item",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("collection", &SqlType::Text, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("from_step", &SqlType::Text),
        sqlite_column!("to_step", &SqlType::Text),
        sqlite_column!("action", &SqlType::Text),
        // Not a foreign key: the journal outlives deleted identities.
        sqlite_column!("actor_id", &SqlType::Integer),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    unique_constraints: &[],
    indices: &[("idx_workflow_event_item_id", "item_id")],
};

pub const VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[
            IDENTITY_TABLE_V_0,
            ROLE_GROUP_TABLE_V_0,
            ROLE_GROUP_MEMBER_TABLE_V_0,
            WORK_ITEM_TABLE_V_0,
            WORKFLOW_TASK_TABLE_V_0,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[
            IDENTITY_TABLE_V_0,
            ROLE_GROUP_TABLE_V_0,
            ROLE_GROUP_MEMBER_TABLE_V_0,
            WORK_ITEM_TABLE_V_0,
            WORKFLOW_TASK_TABLE_V_0,
            WORKFLOW_EVENT_TABLE_V_1,
        ],
        migration: Some(|conn: &Connection| {
            WORKFLOW_EVENT_TABLE_V_1.create(conn)?;
            Ok(())
        }),
    },
];

fn latest_schema() -> Result<&'static VersionedSchema> {
    VERSIONED_SCHEMAS.last().context("No schema defined")
}

fn system_time_from_column_result(value: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(value.max(0) as u64)
}

#[derive(Clone)]
pub struct SqliteWorkflowStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWorkflowStore {
    pub fn new<T: AsRef<Path>>(db_path: T) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = if db_path.exists() {
            Connection::open_with_flags(
                db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_context(|| format!("Failed to open database {:?}", db_path))?
        } else {
            info!("Creating new workflow database at {:?}", db_path);
            let conn = Connection::open(db_path)
                .with_context(|| format!("Failed to create database {:?}", db_path))?;
            latest_schema()?.create(&conn)?;
            conn
        };

        // Read the database version
        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "Database version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        if version >= VERSIONED_SCHEMAS.len() {
            bail!("Database version {} is too new", version);
        }
        VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;
        Self::from_connection(conn)
    }

    /// A fresh database that lives as long as the store.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        latest_schema()?.create(&conn)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // Foreign keys are per connection and off by default.
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        Ok(SqliteWorkflowStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn infer_path() -> Option<PathBuf> {
        let db_data_dir = PathBuf::from("/data/db").join(DEFAULT_DB_FILE_NAME);
        if db_data_dir.exists() {
            return Some(db_data_dir);
        }

        let mut current_dir = std::env::current_dir().ok()?;
        loop {
            let candidate = current_dir.join(DEFAULT_DB_FILE_NAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if let Some(parent) = current_dir.parent() {
                current_dir = parent.to_path_buf();
            } else {
                break;
            }
        }

        None
    }

    fn migrate_if_needed(conn: &Connection, version: usize) -> Result<()> {
        let mut latest_from = version;
        for schema in VERSIONED_SCHEMAS.iter().skip(version + 1) {
            if let Some(migration_fn) = schema.migration {
                info!(
                    "Migrating db from version {} to {}",
                    latest_from, schema.version
                );
                migration_fn(conn)?;
                latest_from = schema.version;
            }
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest_from),
            [],
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Workflow database connection lock is poisoned"))
    }
}

impl WorkflowStore for SqliteWorkflowStore {
    fn begin(&self) -> Result<Box<dyn WorkflowTransaction + '_>> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE;")
            .context("Failed to begin transaction")?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }
}

/// Holds the connection lock for its whole lifetime, so transactions never
/// interleave.
pub struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Rolling back uncommitted workflow transaction");
            if let Err(e) = self.conn.execute_batch("ROLLBACK;") {
                tracing::error!("Failed to roll back transaction: {}", e);
            }
        }
    }
}

impl WorkflowTransaction for SqliteTransaction<'_> {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn
            .execute_batch("COMMIT;")
            .context("Failed to commit transaction")?;
        self.finished = true;
        Ok(())
    }
}

fn identity_from_row(row: &Row) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: row.get(0)?,
        handle: row.get(1)?,
    })
}

fn work_item_from_row(row: &Row) -> rusqlite::Result<WorkItem> {
    let status: String = row.get(4)?;
    let status = ItemStatus::from_str(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown item status {}", status).into(),
        )
    })?;
    Ok(WorkItem {
        id: row.get(0)?,
        collection: CollectionId(row.get(1)?),
        submitter: row.get(2)?,
        current_step: row.get::<_, Option<String>>(3)?.map(StepId),
        status,
        created: system_time_from_column_result(row.get(5)?),
    })
}

fn task_from_row(row: &Row) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        item_id: row.get(0)?,
        collection: CollectionId(row.get(1)?),
        step: StepId(row.get(2)?),
        claimed_by: row.get(3)?,
    })
}

fn event_from_row(row: &Row) -> rusqlite::Result<WorkflowEvent> {
    let kind: String = row.get(2)?;
    let kind = WorkflowEventKind::from_str(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown event kind {}", kind).into(),
        )
    })?;
    Ok(WorkflowEvent {
        item_id: row.get(0)?,
        collection: CollectionId(row.get(1)?),
        kind,
        from_step: row.get::<_, Option<String>>(3)?.map(StepId),
        to_step: row.get::<_, Option<String>>(4)?.map(StepId),
        action: row.get::<_, Option<String>>(5)?.map(ActionId),
        actor: row.get(6)?,
    })
}

const TASK_COLUMNS: &str = "item_id, collection, step, claimed_by";
const ITEM_COLUMNS: &str = "id, collection, submitter_id, current_step, status, created";

impl SqliteTransaction<'_> {
    fn load_role_group(
        &self,
        id: RoleGroupId,
        collection: String,
        role: String,
    ) -> Result<RoleGroup> {
        let role = RoleName::parse(&role)
            .with_context(|| format!("Role group {} has an invalid role name", id))?;
        let mut stmt = self.conn.prepare(
            "SELECT identity_id FROM role_group_member WHERE group_id = ?1 ORDER BY identity_id",
        )?;
        let members = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<Result<Vec<IdentityId>, _>>()?;
        Ok(RoleGroup {
            id,
            collection: CollectionId(collection),
            role,
            members,
        })
    }

    fn set_final_status(&self, item_id: ItemId, status: ItemStatus) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE work_item SET current_step = NULL, status = ?2 WHERE id = ?1",
            params![item_id, status.as_str()],
        )?;
        if updated == 0 {
            bail!("Work item {} does not exist", item_id);
        }
        Ok(())
    }
}

impl IdentityStore for SqliteTransaction<'_> {
    fn create_identity(&self, handle: &str) -> Result<IdentityId> {
        self.conn
            .execute("INSERT INTO identity (handle) VALUES (?1)", params![handle])
            .with_context(|| format!("Failed to create identity {}", handle))?;
        Ok(self.conn.last_insert_rowid() as IdentityId)
    }

    fn get_identity(&self, identity: IdentityId) -> Result<Option<Identity>> {
        self.conn
            .query_row(
                "SELECT id, handle FROM identity WHERE id = ?1",
                params![identity],
                identity_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to read identity {}", identity))
    }

    fn find_identity(&self, handle: &str) -> Result<Option<Identity>> {
        self.conn
            .query_row(
                "SELECT id, handle FROM identity WHERE handle = ?1",
                params![handle],
                identity_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to look up identity {}", handle))
    }

    fn list_identities(&self) -> Result<Vec<Identity>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, handle FROM identity ORDER BY id")?;
        let identities = stmt
            .query_map([], identity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(identities)
    }

    fn delete_identity(&self, identity: IdentityId) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM identity WHERE id = ?1", params![identity])
            .with_context(|| format!("Failed to delete identity {}", identity))?;
        Ok(deleted > 0)
    }
}

impl RoleGroupStore for SqliteTransaction<'_> {
    fn ensure_role_group(
        &self,
        collection: &CollectionId,
        role: &RoleName,
    ) -> Result<RoleGroupId> {
        self.conn.execute(
            "INSERT OR IGNORE INTO role_group (collection, role) VALUES (?1, ?2)",
            params![collection.as_str(), role.as_str()],
        )?;
        let id = self
            .conn
            .query_row(
                "SELECT id FROM role_group WHERE collection = ?1 AND role = ?2",
                params![collection.as_str(), role.as_str()],
                |row| row.get(0),
            )
            .with_context(|| {
                format!("Failed to provision role group {}/{}", collection, role)
            })?;
        Ok(id)
    }

    fn find_role_group(
        &self,
        collection: &CollectionId,
        role: &RoleName,
    ) -> Result<Option<RoleGroup>> {
        let id: Option<RoleGroupId> = self
            .conn
            .query_row(
                "SELECT id FROM role_group WHERE collection = ?1 AND role = ?2",
                params![collection.as_str(), role.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => Ok(Some(self.load_role_group(
                id,
                collection.0.clone(),
                role.as_str().to_string(),
            )?)),
            None => Ok(None),
        }
    }

    fn list_role_groups(&self) -> Result<Vec<RoleGroup>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, collection, role FROM role_group ORDER BY collection, role")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<(RoleGroupId, String, String)>, _>>()?;
        rows.into_iter()
            .map(|(id, collection, role)| self.load_role_group(id, collection, role))
            .collect()
    }

    fn add_member(&self, group: RoleGroupId, identity: IdentityId) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO role_group_member (group_id, identity_id) VALUES (?1, ?2)",
                params![group, identity],
            )
            .with_context(|| format!("Failed to add identity {} to group {}", identity, group))?;
        Ok(inserted > 0)
    }

    fn remove_member(&self, group: RoleGroupId, identity: IdentityId) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM role_group_member WHERE group_id = ?1 AND identity_id = ?2",
                params![group, identity],
            )
            .with_context(|| {
                format!("Failed to remove identity {} from group {}", identity, group)
            })?;
        Ok(deleted > 0)
    }

    fn groups_of_identity(&self, identity: IdentityId) -> Result<Vec<RoleGroup>> {
        let mut stmt = self.conn.prepare(
            "SELECT g.id, g.collection, g.role FROM role_group g \
             JOIN role_group_member m ON m.group_id = g.id \
             WHERE m.identity_id = ?1 ORDER BY g.collection, g.role",
        )?;
        let rows = stmt
            .query_map(params![identity], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<(RoleGroupId, String, String)>, _>>()?;
        rows.into_iter()
            .map(|(id, collection, role)| self.load_role_group(id, collection, role))
            .collect()
    }
}

impl TaskStore for SqliteTransaction<'_> {
    fn get_task(&self, item_id: ItemId) -> Result<Option<TaskRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM workflow_task WHERE item_id = ?1", TASK_COLUMNS),
                params![item_id],
                task_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to read task of work item {}", item_id))
    }

    fn put_pooled_task(
        &self,
        item_id: ItemId,
        collection: &CollectionId,
        step: &StepId,
    ) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO workflow_task (item_id, collection, step, claimed_by) \
                     VALUES (?1, ?2, ?3, NULL) \
                     ON CONFLICT(item_id) DO UPDATE SET \
                     collection = excluded.collection, step = excluded.step, \
                     claimed_by = NULL, created = {}",
                    DEFAULT_TIMESTAMP
                ),
                params![item_id, collection.as_str(), step.as_str()],
            )
            .with_context(|| {
                format!("Failed to pool work item {} at step {}", item_id, step)
            })?;
        Ok(())
    }

    fn claim_task(&self, item_id: ItemId, step: &StepId, identity: IdentityId) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE workflow_task SET claimed_by = ?3 \
                 WHERE item_id = ?1 AND step = ?2 AND claimed_by IS NULL",
                params![item_id, step.as_str(), identity],
            )
            .with_context(|| format!("Failed to claim work item {}", item_id))?;
        Ok(updated == 1)
    }

    fn release_task(
        &self,
        item_id: ItemId,
        step: &StepId,
        identity: IdentityId,
    ) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE workflow_task SET claimed_by = NULL \
                 WHERE item_id = ?1 AND step = ?2 AND claimed_by = ?3",
                params![item_id, step.as_str(), identity],
            )
            .with_context(|| format!("Failed to release work item {}", item_id))?;
        Ok(updated == 1)
    }

    fn delete_task(&self, item_id: ItemId) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM workflow_task WHERE item_id = ?1",
                params![item_id],
            )
            .with_context(|| format!("Failed to delete task of work item {}", item_id))?;
        Ok(deleted > 0)
    }

    fn tasks_in_collection(&self, collection: &CollectionId) -> Result<Vec<TaskRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM workflow_task WHERE collection = ?1 ORDER BY item_id",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![collection.as_str()], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn claimed_tasks_of(&self, identity: IdentityId) -> Result<Vec<TaskRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM workflow_task WHERE claimed_by = ?1 ORDER BY item_id",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![identity], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }
}

impl ItemStore for SqliteTransaction<'_> {
    fn create_item(
        &self,
        collection: &CollectionId,
        submitter: Option<IdentityId>,
    ) -> Result<ItemId> {
        self.conn
            .execute(
                "INSERT INTO work_item (collection, submitter_id, status) VALUES (?1, ?2, ?3)",
                params![
                    collection.as_str(),
                    submitter,
                    ItemStatus::InReview.as_str()
                ],
            )
            .with_context(|| format!("Failed to create work item in {}", collection))?;
        Ok(self.conn.last_insert_rowid() as ItemId)
    }

    fn get_item(&self, item_id: ItemId) -> Result<Option<WorkItem>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM work_item WHERE id = ?1", ITEM_COLUMNS),
                params![item_id],
                work_item_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to read work item {}", item_id))
    }

    fn set_current_step(&self, item_id: ItemId, step: Option<&StepId>) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE work_item SET current_step = ?2 WHERE id = ?1",
            params![item_id, step.map(StepId::as_str)],
        )?;
        if updated == 0 {
            bail!("Work item {} does not exist", item_id);
        }
        Ok(())
    }

    fn mark_archived(&self, item_id: ItemId) -> Result<()> {
        self.set_final_status(item_id, ItemStatus::Archived)
    }

    fn mark_withdrawn(&self, item_id: ItemId) -> Result<()> {
        self.set_final_status(item_id, ItemStatus::Withdrawn)
    }

    fn clear_submitter(&self, item_id: ItemId) -> Result<()> {
        self.conn.execute(
            "UPDATE work_item SET submitter_id = NULL WHERE id = ?1",
            params![item_id],
        )?;
        Ok(())
    }

    fn items_submitted_by(&self, identity: IdentityId) -> Result<Vec<ItemId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM work_item WHERE submitter_id = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![identity], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn items_in_review(&self) -> Result<Vec<WorkItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM work_item WHERE status = ?1 ORDER BY id",
            ITEM_COLUMNS
        ))?;
        let items = stmt
            .query_map(params![ItemStatus::InReview.as_str()], work_item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }
}

impl EventJournal for SqliteTransaction<'_> {
    fn append_event(&self, event: &WorkflowEvent) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO workflow_event \
                 (item_id, collection, kind, from_step, to_step, action, actor_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.item_id,
                    event.collection.as_str(),
                    event.kind.as_str(),
                    event.from_step.as_ref().map(StepId::as_str),
                    event.to_step.as_ref().map(StepId::as_str),
                    event.action.as_ref().map(ActionId::as_str),
                    event.actor,
                ],
            )
            .with_context(|| format!("Failed to journal event for work item {}", event.item_id))?;
        Ok(())
    }

    fn item_events(&self, item_id: ItemId) -> Result<Vec<WorkflowEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT item_id, collection, kind, from_step, to_step, action, actor_id \
             FROM workflow_event WHERE item_id = ?1 ORDER BY id",
        )?;
        let events = stmt
            .query_map(params![item_id], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_tmp_store() -> (SqliteWorkflowStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let temp_file_path = temp_dir.path().join("test.db");
        let store = SqliteWorkflowStore::new(&temp_file_path).unwrap();
        (store, temp_dir)
    }

    fn reviewer() -> RoleName {
        RoleName::parse("reviewer").unwrap()
    }

    #[test]
    fn test_create_identity() {
        let (store, _temp_dir) = create_tmp_store();
        let tx = store.begin().unwrap();

        let id = tx.create_identity("alice").unwrap();
        assert_eq!(id, 1);
        assert!(tx.create_identity("alice").is_err());

        assert_eq!(tx.find_identity("alice").unwrap().unwrap().id, id);
        assert!(tx.get_identity(42).unwrap().is_none());
    }

    #[test]
    fn uncommitted_writes_are_rolled_back() {
        let (store, _temp_dir) = create_tmp_store();
        {
            let tx = store.begin().unwrap();
            tx.create_identity("alice").unwrap();
        }
        let tx = store.begin().unwrap();
        assert!(tx.find_identity("alice").unwrap().is_none());
        tx.create_identity("bob").unwrap();
        tx.commit().unwrap();

        let tx = store.begin().unwrap();
        assert!(tx.find_identity("bob").unwrap().is_some());
    }

    #[test]
    fn data_survives_reopening() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");
        {
            let store = SqliteWorkflowStore::new(&path).unwrap();
            let tx = store.begin().unwrap();
            tx.create_identity("alice").unwrap();
            tx.commit().unwrap();
        }
        let store = SqliteWorkflowStore::new(&path).unwrap();
        let tx = store.begin().unwrap();
        assert_eq!(tx.list_identities().unwrap().len(), 1);
    }

    #[test]
    fn role_group_membership() {
        let store = SqliteWorkflowStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let collection = CollectionId::from("c1");

        let group = tx.ensure_role_group(&collection, &reviewer()).unwrap();
        assert_eq!(tx.ensure_role_group(&collection, &reviewer()).unwrap(), group);

        let alice = tx.create_identity("alice").unwrap();
        let bob = tx.create_identity("bob").unwrap();
        assert!(tx.add_member(group, alice).unwrap());
        assert!(!tx.add_member(group, alice).unwrap());
        assert!(tx.add_member(group, bob).unwrap());

        let loaded = tx.find_role_group(&collection, &reviewer()).unwrap().unwrap();
        assert_eq!(loaded.members, vec![alice, bob]);
        assert_eq!(tx.groups_of_identity(bob).unwrap().len(), 1);

        assert!(tx.remove_member(group, alice).unwrap());
        assert!(!tx.remove_member(group, alice).unwrap());
        assert!(tx
            .find_role_group(&collection, &reviewer())
            .unwrap()
            .unwrap()
            .is_sole_member(bob));
    }

    #[test]
    fn deleting_identity_drops_memberships() {
        let store = SqliteWorkflowStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let collection = CollectionId::from("c1");
        let group = tx.ensure_role_group(&collection, &reviewer()).unwrap();
        let alice = tx.create_identity("alice").unwrap();
        tx.add_member(group, alice).unwrap();

        assert!(tx.delete_identity(alice).unwrap());
        assert!(!tx.delete_identity(alice).unwrap());
        let loaded = tx.find_role_group(&collection, &reviewer()).unwrap().unwrap();
        assert!(loaded.members.is_empty());
    }

    #[test]
    fn claim_marker_is_exclusive() {
        let store = SqliteWorkflowStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let collection = CollectionId::from("c1");
        let step = StepId::from("reviewstep");
        let alice = tx.create_identity("alice").unwrap();
        let bob = tx.create_identity("bob").unwrap();
        let item = tx.create_item(&collection, None).unwrap();

        assert!(!tx.claim_task(item, &step, alice).unwrap());

        tx.put_pooled_task(item, &collection, &step).unwrap();
        assert!(tx.get_task(item).unwrap().unwrap().is_pooled());
        assert!(!tx.claim_task(item, &StepId::from("editstep"), alice).unwrap());
        assert!(tx.claim_task(item, &step, alice).unwrap());
        assert!(!tx.claim_task(item, &step, bob).unwrap());
        assert_eq!(tx.claimed_tasks_of(alice).unwrap().len(), 1);

        assert!(!tx.release_task(item, &step, bob).unwrap());
        assert!(tx.release_task(item, &step, alice).unwrap());
        assert!(tx.claim_task(item, &step, bob).unwrap());

        // Re-pooling replaces the claimed row
        tx.put_pooled_task(item, &collection, &StepId::from("editstep"))
            .unwrap();
        let task = tx.get_task(item).unwrap().unwrap();
        assert_eq!(task.step, StepId::from("editstep"));
        assert!(task.claimed_by.is_none());
        assert_eq!(tx.tasks_in_collection(&collection).unwrap().len(), 1);
    }

    #[test]
    fn claim_holder_cannot_be_deleted() {
        let store = SqliteWorkflowStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let collection = CollectionId::from("c1");
        let step = StepId::from("reviewstep");
        let alice = tx.create_identity("alice").unwrap();
        let item = tx.create_item(&collection, None).unwrap();
        tx.put_pooled_task(item, &collection, &step).unwrap();
        tx.claim_task(item, &step, alice).unwrap();

        assert!(tx.delete_identity(alice).is_err());
    }

    #[test]
    fn item_lifecycle() {
        let store = SqliteWorkflowStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let collection = CollectionId::from("c1");
        let alice = tx.create_identity("alice").unwrap();

        let item = tx.create_item(&collection, Some(alice)).unwrap();
        tx.set_current_step(item, Some(&StepId::from("reviewstep")))
            .unwrap();
        let loaded = tx.get_item(item).unwrap().unwrap();
        assert_eq!(loaded.status, ItemStatus::InReview);
        assert_eq!(loaded.submitter, Some(alice));
        assert_eq!(loaded.current_step, Some(StepId::from("reviewstep")));
        assert_eq!(tx.items_submitted_by(alice).unwrap(), vec![item]);
        assert_eq!(tx.items_in_review().unwrap().len(), 1);

        tx.mark_archived(item).unwrap();
        let loaded = tx.get_item(item).unwrap().unwrap();
        assert_eq!(loaded.status, ItemStatus::Archived);
        assert!(loaded.current_step.is_none());
        assert_eq!(loaded.submitter, Some(alice));
        assert!(tx.items_in_review().unwrap().is_empty());

        tx.clear_submitter(item).unwrap();
        assert!(tx.get_item(item).unwrap().unwrap().submitter.is_none());

        assert!(tx.mark_withdrawn(99).is_err());
    }

    #[test]
    fn journal_keeps_event_order() {
        let store = SqliteWorkflowStore::in_memory().unwrap();
        let tx = store.begin().unwrap();
        let collection = CollectionId::from("c1");
        let item = tx.create_item(&collection, None).unwrap();

        let submitted = WorkflowEvent::new(item, collection.clone(), WorkflowEventKind::Submitted)
            .to_step(Some(&StepId::from("reviewstep")));
        let claimed = WorkflowEvent::new(item, collection.clone(), WorkflowEventKind::Claimed)
            .from_step(Some(&StepId::from("reviewstep")))
            .action(&ActionId::from("claim"))
            .actor(5);
        tx.append_event(&submitted).unwrap();
        tx.append_event(&claimed).unwrap();

        assert_eq!(tx.item_events(item).unwrap(), vec![submitted, claimed]);
    }

    #[test]
    fn test_migration_v0_to_v1() {
        let temp_dir = TempDir::new().unwrap();
        let temp_file_path = temp_dir.path().join("test_migration.db");

        {
            let conn = Connection::open(&temp_file_path).unwrap();
            VERSIONED_SCHEMAS[0].create(&conn).unwrap();
            conn.execute(
                "INSERT INTO work_item (collection, status) VALUES ('c1', 'in_review')",
                [],
            )
            .unwrap();

            let db_version: i64 = conn
                .query_row("PRAGMA user_version;", [], |row| row.get(0))
                .unwrap();
            assert_eq!(db_version, BASE_DB_VERSION as i64);
        }

        let store = SqliteWorkflowStore::new(&temp_file_path).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            let db_version: i64 = conn
                .query_row("PRAGMA user_version;", [], |row| row.get(0))
                .unwrap();
            assert_eq!(db_version, BASE_DB_VERSION as i64 + 1);
            VERSIONED_SCHEMAS[1].validate(&conn).unwrap();
        }

        let tx = store.begin().unwrap();
        let event = WorkflowEvent::new(1, CollectionId::from("c1"), WorkflowEventKind::Archived);
        tx.append_event(&event).unwrap();
        assert_eq!(tx.item_events(1).unwrap(), vec![event]);
    }

    #[test]
    fn rejects_foreign_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("other.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("CREATE TABLE something (id INTEGER)", [])
                .unwrap();
        }
        assert!(SqliteWorkflowStore::new(&path).is_err());
    }
}
