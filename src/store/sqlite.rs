//! SQLite store
//!
//! Holds connections, field mappings, cross-references, sync jobs and the
//! three internal entity tables. Statements run on the blocking pool against
//! a single mutex-guarded connection, so async callers never block a worker.

use super::models::{
    ApplyOutcome, Connection, EntityFields, EntityRecord, EntityType, FieldMapping, JobStatus,
    JobType, MappingType, NewConnection, SyncJob, SyncMapping, SyncResult,
};
use crate::mapping::Transform;
use crate::{Result, SyncError};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::task;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    org_url TEXT NOT NULL,
    project TEXT NOT NULL,
    access_token_enc TEXT NOT NULL,
    refresh_token_enc TEXT,
    token_expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS field_mappings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
    entity_type TEXT NOT NULL,
    external_field TEXT NOT NULL,
    internal_field TEXT NOT NULL,
    mapping_type TEXT NOT NULL,
    transform_spec TEXT,
    direction TEXT NOT NULL DEFAULT 'bidirectional',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (connection_id, entity_type, external_field)
);

CREATE TABLE IF NOT EXISTS sync_mappings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
    entity_type TEXT NOT NULL,
    internal_entity_id INTEGER NOT NULL,
    external_item_id INTEGER NOT NULL,
    external_item_type TEXT NOT NULL,
    last_synced_at TEXT NOT NULL,
    UNIQUE (connection_id, entity_type, external_item_id),
    UNIQUE (connection_id, entity_type, internal_entity_id)
);

CREATE TABLE IF NOT EXISTS sync_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    items_synced INTEGER NOT NULL DEFAULT 0,
    errors TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS workstreams (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    status TEXT,
    owner TEXT,
    progress INTEGER,
    notes TEXT,
    due_date TEXT,
    deleted_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS risks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    title TEXT NOT NULL,
    status TEXT,
    severity TEXT,
    owner TEXT,
    description TEXT,
    due_date TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    title TEXT NOT NULL,
    status TEXT,
    owner TEXT,
    progress INTEGER,
    description TEXT,
    due_date TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_connections_tenant ON connections(tenant_id);
CREATE INDEX IF NOT EXISTS idx_sync_jobs_connection ON sync_jobs(connection_id, status);
CREATE INDEX IF NOT EXISTS idx_workstreams_tenant ON workstreams(tenant_id);
CREATE INDEX IF NOT EXISTS idx_risks_tenant ON risks(tenant_id);
CREATE INDEX IF NOT EXISTS idx_actions_tenant ON actions(tenant_id);
"#;

const CONNECTION_COLUMNS: &str = "id, tenant_id, org_url, project, access_token_enc, \
     refresh_token_enc, token_expires_at, created_at, updated_at";

const FIELD_MAPPING_COLUMNS: &str = "id, connection_id, entity_type, external_field, \
     internal_field, mapping_type, transform_spec, direction";

const SYNC_MAPPING_COLUMNS: &str = "id, connection_id, entity_type, internal_entity_id, \
     external_item_id, external_item_type, last_synced_at";

const JOB_COLUMNS: &str = "id, connection_id, job_type, status, created_by, created_at, \
     started_at, completed_at, items_synced, errors";

/// SQLite-backed persistence for the sync engine
pub struct Store {
    conn: Arc<Mutex<rusqlite::Connection>>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create a store database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "Opening sync database");

        let conn = rusqlite::Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// In-memory store, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?, None)
    }

    fn init(conn: rusqlite::Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Database path, if file-backed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool
    async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| SyncError::Storage("Database lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| SyncError::Storage(format!("Database task failed: {}", e)))?
    }

    // ============ Connections ============

    pub async fn insert_connection(&self, new: &NewConnection) -> Result<Connection> {
        let new = new.clone();
        self.run_blocking(move |conn| {
            let now = ts(Utc::now());
            conn.execute(
                r#"
                INSERT INTO connections (
                    tenant_id, org_url, project, access_token_enc, refresh_token_enc,
                    token_expires_at, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                "#,
                params![
                    new.tenant_id,
                    new.org_url,
                    new.project,
                    new.access_token_enc,
                    new.refresh_token_enc,
                    ts(new.token_expires_at),
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();
            tracing::info!(connection_id = id, tenant_id = %new.tenant_id, "Connection created");
            get_connection_in(conn, id)
        })
        .await
    }

    pub async fn get_connection(&self, id: i64) -> Result<Connection> {
        self.run_blocking(move |conn| get_connection_in(conn, id)).await
    }

    pub async fn list_connections(&self, tenant_id: &str) -> Result<Vec<Connection>> {
        let tenant_id = tenant_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM connections WHERE tenant_id = ?1 ORDER BY id",
                CONNECTION_COLUMNS
            ))?;
            let rows = stmt.query_map([tenant_id], connection_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Persist re-encrypted tokens after a refresh
    ///
    /// A `None` refresh token keeps the stored one.
    pub async fn update_connection_tokens(
        &self,
        id: i64,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let access_token_enc = access_token_enc.to_string();
        let refresh_token_enc = refresh_token_enc.map(str::to_string);
        self.run_blocking(move |conn| {
            let changed = conn.execute(
                r#"
                UPDATE connections
                SET access_token_enc = ?2,
                    refresh_token_enc = COALESCE(?3, refresh_token_enc),
                    token_expires_at = ?4,
                    updated_at = ?5
                WHERE id = ?1
                "#,
                params![id, access_token_enc, refresh_token_enc, ts(expires_at), ts(Utc::now())],
            )?;
            if changed == 0 {
                return Err(SyncError::ConnectionNotFound(id));
            }
            Ok(())
        })
        .await
    }

    /// Delete a connection and, by cascade, its mappings, cross-references and jobs
    pub async fn delete_connection(&self, id: i64) -> Result<bool> {
        self.run_blocking(move |conn| {
            let changed = conn.execute("DELETE FROM connections WHERE id = ?1", [id])?;
            if changed > 0 {
                tracing::info!(connection_id = id, "Connection deleted");
            }
            Ok(changed > 0)
        })
        .await
    }

    // ============ Field mappings ============

    pub async fn field_mappings(&self, connection_id: i64) -> Result<Vec<FieldMapping>> {
        self.run_blocking(move |conn| field_mappings_in(conn, connection_id))
            .await
    }

    /// Insert `defaults` for a connection that has no mappings yet
    ///
    /// Returns the number of rows inserted (zero if mappings already existed).
    pub async fn insert_default_mappings(
        &self,
        connection_id: i64,
        defaults: &[FieldMapping],
    ) -> Result<usize> {
        let defaults = defaults.to_vec();
        self.run_blocking(move |conn| {
            get_connection_in(conn, connection_id)?;

            let tx = conn.transaction()?;
            let existing: i64 = tx.query_row(
                "SELECT COUNT(*) FROM field_mappings WHERE connection_id = ?1",
                [connection_id],
                |row| row.get(0),
            )?;
            if existing > 0 {
                return Ok(0);
            }

            let now = ts(Utc::now());
            for mapping in &defaults {
                mapping.validate()?;
                tx.execute(
                    r#"
                    INSERT INTO field_mappings (
                        connection_id, entity_type, external_field, internal_field,
                        mapping_type, transform_spec, direction, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                    "#,
                    params![
                        connection_id,
                        mapping.entity_type.as_str(),
                        mapping.external_field,
                        mapping.internal_field,
                        mapping.mapping_type.as_str(),
                        transform_spec(mapping)?,
                        mapping.direction.as_str(),
                        now,
                    ],
                )?;
            }
            tx.commit()?;

            tracing::info!(
                connection_id,
                count = defaults.len(),
                "Inserted default field mappings"
            );
            Ok(defaults.len())
        })
        .await
    }

    /// Insert or replace the mapping keyed on (connection, entity type, external field)
    pub async fn upsert_field_mapping(&self, mapping: &FieldMapping) -> Result<FieldMapping> {
        mapping.validate()?;
        let mapping = mapping.clone();
        self.run_blocking(move |conn| {
            get_connection_in(conn, mapping.connection_id)?;

            let now = ts(Utc::now());
            conn.execute(
                r#"
                INSERT INTO field_mappings (
                    connection_id, entity_type, external_field, internal_field,
                    mapping_type, transform_spec, direction, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                ON CONFLICT (connection_id, entity_type, external_field) DO UPDATE SET
                    internal_field = excluded.internal_field,
                    mapping_type = excluded.mapping_type,
                    transform_spec = excluded.transform_spec,
                    direction = excluded.direction,
                    updated_at = excluded.updated_at
                "#,
                params![
                    mapping.connection_id,
                    mapping.entity_type.as_str(),
                    mapping.external_field,
                    mapping.internal_field,
                    mapping.mapping_type.as_str(),
                    transform_spec(&mapping)?,
                    mapping.direction.as_str(),
                    now,
                ],
            )?;

            let stored = conn.query_row(
                &format!(
                    "SELECT {} FROM field_mappings \
                     WHERE connection_id = ?1 AND entity_type = ?2 AND external_field = ?3",
                    FIELD_MAPPING_COLUMNS
                ),
                params![
                    mapping.connection_id,
                    mapping.entity_type.as_str(),
                    mapping.external_field
                ],
                field_mapping_from_row,
            )?;
            Ok(stored)
        })
        .await
    }

    pub async fn delete_field_mapping(
        &self,
        connection_id: i64,
        entity_type: EntityType,
        external_field: &str,
    ) -> Result<bool> {
        let external_field = external_field.to_string();
        self.run_blocking(move |conn| {
            let changed = conn.execute(
                "DELETE FROM field_mappings \
                 WHERE connection_id = ?1 AND entity_type = ?2 AND external_field = ?3",
                params![connection_id, entity_type.as_str(), external_field],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    // ============ Cross-references ============

    /// Plain insert; a second row for an already-mapped pairing fails on the
    /// unique constraint
    pub async fn insert_sync_mapping(
        &self,
        connection_id: i64,
        entity_type: EntityType,
        internal_entity_id: i64,
        external_item_id: i64,
        external_item_type: &str,
    ) -> Result<SyncMapping> {
        let external_item_type = external_item_type.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                r#"
                INSERT INTO sync_mappings (
                    connection_id, entity_type, internal_entity_id, external_item_id,
                    external_item_type, last_synced_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    connection_id,
                    entity_type.as_str(),
                    internal_entity_id,
                    external_item_id,
                    external_item_type,
                    ts(Utc::now()),
                ],
            )?;
            find_by_external_in(conn, connection_id, entity_type, external_item_id)?
                .ok_or_else(|| SyncError::Storage("Inserted sync mapping vanished".to_string()))
        })
        .await
    }

    /// Atomic insert-or-refresh keyed on the tracker item
    pub async fn upsert_sync_mapping(
        &self,
        connection_id: i64,
        entity_type: EntityType,
        internal_entity_id: i64,
        external_item_id: i64,
        external_item_type: &str,
    ) -> Result<SyncMapping> {
        let external_item_type = external_item_type.to_string();
        self.run_blocking(move |conn| {
            upsert_sync_mapping_in(
                conn,
                connection_id,
                entity_type,
                internal_entity_id,
                external_item_id,
                &external_item_type,
            )
        })
        .await
    }

    pub async fn find_by_external(
        &self,
        connection_id: i64,
        entity_type: EntityType,
        external_item_id: i64,
    ) -> Result<Option<SyncMapping>> {
        self.run_blocking(move |conn| {
            find_by_external_in(conn, connection_id, entity_type, external_item_id)
        })
        .await
    }

    pub async fn find_by_internal(
        &self,
        connection_id: i64,
        entity_type: EntityType,
        internal_entity_id: i64,
    ) -> Result<Option<SyncMapping>> {
        self.run_blocking(move |conn| {
            let mapping = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM sync_mappings \
                         WHERE connection_id = ?1 AND entity_type = ?2 AND internal_entity_id = ?3",
                        SYNC_MAPPING_COLUMNS
                    ),
                    params![connection_id, entity_type.as_str(), internal_entity_id],
                    sync_mapping_from_row,
                )
                .optional()?;
            Ok(mapping)
        })
        .await
    }

    /// Refresh `last_synced_at` after a successful sync of the pairing
    pub async fn touch_sync_mapping(&self, id: i64) -> Result<()> {
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE sync_mappings SET last_synced_at = ?2 WHERE id = ?1",
                params![id, ts(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn count_sync_mappings(
        &self,
        connection_id: i64,
        entity_type: EntityType,
    ) -> Result<usize> {
        self.run_blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sync_mappings WHERE connection_id = ?1 AND entity_type = ?2",
                params![connection_id, entity_type.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    /// Apply a mapped tracker item to the internal store
    ///
    /// The cross-reference lookup, the entity create/update and the
    /// cross-reference write happen in one transaction, so two concurrent
    /// syncs of the same item cannot both create an entity.
    pub async fn apply_external_item(
        &self,
        connection_id: i64,
        tenant_id: &str,
        entity_type: EntityType,
        external_item_id: i64,
        external_item_type: &str,
        fields: &EntityFields,
    ) -> Result<ApplyOutcome> {
        let tenant_id = tenant_id.to_string();
        let external_item_type = external_item_type.to_string();
        let fields = fields.clone();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;

            let existing = find_by_external_in(&tx, connection_id, entity_type, external_item_id)?;
            let outcome = match existing {
                Some(mapping) => {
                    if !update_entity_in(&tx, entity_type, mapping.internal_entity_id, &fields)? {
                        return Err(SyncError::Storage(format!(
                            "{} {} mapped to work item {} no longer exists",
                            entity_type, mapping.internal_entity_id, external_item_id
                        )));
                    }
                    tx.execute(
                        "UPDATE sync_mappings SET last_synced_at = ?2 WHERE id = ?1",
                        params![mapping.id, ts(Utc::now())],
                    )?;
                    ApplyOutcome::Updated(mapping.internal_entity_id)
                }
                None => {
                    let entity_id = create_entity_in(&tx, &tenant_id, entity_type, &fields)?;
                    upsert_sync_mapping_in(
                        &tx,
                        connection_id,
                        entity_type,
                        entity_id,
                        external_item_id,
                        &external_item_type,
                    )?;
                    ApplyOutcome::Created(entity_id)
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    // ============ Sync jobs ============

    pub async fn create_job(
        &self,
        connection_id: i64,
        job_type: JobType,
        created_by: &str,
    ) -> Result<SyncJob> {
        let created_by = created_by.to_string();
        self.run_blocking(move |conn| {
            get_connection_in(conn, connection_id)?;
            conn.execute(
                r#"
                INSERT INTO sync_jobs (connection_id, job_type, status, created_by, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    connection_id,
                    job_type.as_str(),
                    JobStatus::Pending.as_str(),
                    created_by,
                    ts(Utc::now()),
                ],
            )?;
            let id = conn.last_insert_rowid();
            get_job_in(conn, id)?.ok_or(SyncError::JobNotFound(id))
        })
        .await
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<SyncJob>> {
        self.run_blocking(move |conn| get_job_in(conn, id)).await
    }

    /// Move a job to `status`, stamping timestamps and the result
    ///
    /// Terminal jobs are immutable; an illegal transition is a validation error.
    pub async fn transition_job(
        &self,
        id: i64,
        status: JobStatus,
        result: Option<&SyncResult>,
    ) -> Result<SyncJob> {
        let result = result.cloned();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;

            let job = get_job_in(&tx, id)?.ok_or(SyncError::JobNotFound(id))?;
            if !job.status.can_transition_to(status) {
                return Err(SyncError::Validation(format!(
                    "Job {} cannot move from {} to {}",
                    id,
                    job.status.as_str(),
                    status.as_str()
                )));
            }

            let now = ts(Utc::now());
            match status {
                JobStatus::Running => {
                    tx.execute(
                        "UPDATE sync_jobs SET status = ?2, started_at = ?3 WHERE id = ?1",
                        params![id, status.as_str(), now],
                    )?;
                }
                _ => {
                    tx.execute(
                        "UPDATE sync_jobs SET status = ?2, completed_at = ?3 WHERE id = ?1",
                        params![id, status.as_str(), now],
                    )?;
                    if let Some(result) = &result {
                        tx.execute(
                            "UPDATE sync_jobs SET items_synced = ?2, errors = ?3 WHERE id = ?1",
                            params![
                                id,
                                result.items_synced,
                                serde_json::to_string(&result.errors)?
                            ],
                        )?;
                    }
                }
            }

            let updated = get_job_in(&tx, id)?.ok_or(SyncError::JobNotFound(id))?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    pub async fn list_jobs(&self, connection_id: i64, limit: usize) -> Result<Vec<SyncJob>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sync_jobs WHERE connection_id = ?1 ORDER BY id DESC LIMIT ?2",
                JOB_COLUMNS
            ))?;
            let rows = stmt.query_map(params![connection_id, limit as i64], job_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Most recent completed job, the watermark for incremental syncs
    pub async fn last_completed_job(&self, connection_id: i64) -> Result<Option<SyncJob>> {
        self.run_blocking(move |conn| {
            let job = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM sync_jobs WHERE connection_id = ?1 AND status = 'completed' \
                         ORDER BY completed_at DESC LIMIT 1",
                        JOB_COLUMNS
                    ),
                    [connection_id],
                    job_from_row,
                )
                .optional()?;
            Ok(job)
        })
        .await
    }

    // ============ Internal entities ============

    pub async fn create_entity(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        fields: &EntityFields,
    ) -> Result<i64> {
        let tenant_id = tenant_id.to_string();
        let fields = fields.clone();
        self.run_blocking(move |conn| create_entity_in(conn, &tenant_id, entity_type, &fields))
            .await
    }

    /// Merge `fields` into an entity; untouched columns keep their values
    pub async fn update_entity(
        &self,
        entity_type: EntityType,
        id: i64,
        fields: &EntityFields,
    ) -> Result<bool> {
        let fields = fields.clone();
        self.run_blocking(move |conn| update_entity_in(conn, entity_type, id, &fields))
            .await
    }

    pub async fn get_entity(&self, entity_type: EntityType, id: i64) -> Result<Option<EntityRecord>> {
        self.run_blocking(move |conn| {
            let sql = format!(
                "SELECT id, tenant_id, {}, updated_at FROM {} WHERE id = ?1",
                entity_type.columns().join(", "),
                entity_type.table()
            );
            let record = conn
                .query_row(&sql, [id], |row| entity_from_row(row, entity_type))
                .optional()?;
            Ok(record)
        })
        .await
    }

    /// Entities of one type for a tenant, excluding soft-deleted workstreams
    pub async fn list_entities(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EntityRecord>> {
        let tenant_id = tenant_id.to_string();
        self.run_blocking(move |conn| {
            let mut sql = format!(
                "SELECT id, tenant_id, {}, updated_at FROM {} WHERE tenant_id = ?1",
                entity_type.columns().join(", "),
                entity_type.table()
            );
            if entity_type.soft_deletes() {
                sql.push_str(" AND deleted_at IS NULL");
            }
            let mut args: Vec<SqlValue> = vec![SqlValue::Text(tenant_id)];
            if let Some(since) = updated_since {
                sql.push_str(" AND updated_at >= ?2");
                args.push(SqlValue::Text(ts(since)));
            }
            sql.push_str(" ORDER BY id");

            let mut stmt = conn.prepare(&sql)?;
            let rows =
                stmt.query_map(params_from_iter(args), |row| entity_from_row(row, entity_type))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn soft_delete_workstream(&self, id: i64) -> Result<bool> {
        self.run_blocking(move |conn| {
            let now = ts(Utc::now());
            let changed = conn.execute(
                "UPDATE workstreams SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
            Ok(changed > 0)
        })
        .await
    }
}

// Helpers operating on a borrowed connection or transaction

fn get_connection_in(conn: &rusqlite::Connection, id: i64) -> Result<Connection> {
    conn.query_row(
        &format!("SELECT {} FROM connections WHERE id = ?1", CONNECTION_COLUMNS),
        [id],
        connection_from_row,
    )
    .optional()?
    .ok_or(SyncError::ConnectionNotFound(id))
}

fn field_mappings_in(conn: &rusqlite::Connection, connection_id: i64) -> Result<Vec<FieldMapping>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM field_mappings WHERE connection_id = ?1 ORDER BY entity_type, id",
        FIELD_MAPPING_COLUMNS
    ))?;
    let rows = stmt.query_map([connection_id], field_mapping_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn find_by_external_in(
    conn: &rusqlite::Connection,
    connection_id: i64,
    entity_type: EntityType,
    external_item_id: i64,
) -> Result<Option<SyncMapping>> {
    let mapping = conn
        .query_row(
            &format!(
                "SELECT {} FROM sync_mappings \
                 WHERE connection_id = ?1 AND entity_type = ?2 AND external_item_id = ?3",
                SYNC_MAPPING_COLUMNS
            ),
            params![connection_id, entity_type.as_str(), external_item_id],
            sync_mapping_from_row,
        )
        .optional()?;
    Ok(mapping)
}

fn upsert_sync_mapping_in(
    conn: &rusqlite::Connection,
    connection_id: i64,
    entity_type: EntityType,
    internal_entity_id: i64,
    external_item_id: i64,
    external_item_type: &str,
) -> Result<SyncMapping> {
    conn.execute(
        r#"
        INSERT INTO sync_mappings (
            connection_id, entity_type, internal_entity_id, external_item_id,
            external_item_type, last_synced_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT (connection_id, entity_type, external_item_id)
        DO UPDATE SET last_synced_at = excluded.last_synced_at
        "#,
        params![
            connection_id,
            entity_type.as_str(),
            internal_entity_id,
            external_item_id,
            external_item_type,
            ts(Utc::now()),
        ],
    )?;

    let mapping = find_by_external_in(conn, connection_id, entity_type, external_item_id)?
        .ok_or_else(|| SyncError::Storage("Upserted sync mapping vanished".to_string()))?;
    if mapping.internal_entity_id != internal_entity_id {
        return Err(SyncError::Validation(format!(
            "Work item {} is already paired with {} {}",
            external_item_id, entity_type, mapping.internal_entity_id
        )));
    }
    Ok(mapping)
}

fn get_job_in(conn: &rusqlite::Connection, id: i64) -> Result<Option<SyncJob>> {
    let job = conn
        .query_row(
            &format!("SELECT {} FROM sync_jobs WHERE id = ?1", JOB_COLUMNS),
            [id],
            job_from_row,
        )
        .optional()?;
    Ok(job)
}

/// Keep only columns the entity type owns, in declaration order
fn writable_fields(entity_type: EntityType, fields: &EntityFields) -> Vec<(&'static str, SqlValue)> {
    entity_type
        .columns()
        .iter()
        .filter_map(|column| fields.get(*column).map(|v| (*column, to_sql_value(v))))
        .collect()
}

fn create_entity_in(
    conn: &rusqlite::Connection,
    tenant_id: &str,
    entity_type: EntityType,
    fields: &EntityFields,
) -> Result<i64> {
    let title_column = entity_type.title_column();
    let has_title = fields
        .get(title_column)
        .and_then(Value::as_str)
        .is_some_and(|t| !t.trim().is_empty());
    if !has_title {
        return Err(SyncError::Validation(format!(
            "Cannot create {} without '{}'",
            entity_type, title_column
        )));
    }

    let values = writable_fields(entity_type, fields);
    let now = ts(Utc::now());
    let mut columns = vec!["tenant_id", "created_at", "updated_at"];
    let mut args = vec![
        SqlValue::Text(tenant_id.to_string()),
        SqlValue::Text(now.clone()),
        SqlValue::Text(now),
    ];
    for (column, value) in values {
        columns.push(column);
        args.push(value);
    }
    let placeholders = (1..=args.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");

    conn.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES ({})",
            entity_type.table(),
            columns.join(", "),
            placeholders
        ),
        params_from_iter(args),
    )?;
    let id = conn.last_insert_rowid();
    tracing::debug!(entity_type = %entity_type, entity_id = id, "Created internal entity");
    Ok(id)
}

fn update_entity_in(
    conn: &rusqlite::Connection,
    entity_type: EntityType,
    id: i64,
    fields: &EntityFields,
) -> Result<bool> {
    let values = writable_fields(entity_type, fields);
    let mut assignments = vec!["updated_at = ?1".to_string()];
    let mut args = vec![SqlValue::Text(ts(Utc::now()))];
    for (column, value) in values {
        args.push(value);
        assignments.push(format!("{} = ?{}", column, args.len()));
    }
    args.push(SqlValue::Integer(id));

    let changed = conn.execute(
        &format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            entity_type.table(),
            assignments.join(", "),
            args.len()
        ),
        params_from_iter(args),
    )?;
    Ok(changed > 0)
}

// Row decoding

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<Connection> {
    Ok(Connection {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        org_url: row.get(2)?,
        project: row.get(3)?,
        access_token_enc: row.get(4)?,
        refresh_token_enc: row.get(5)?,
        token_expires_at: get_ts(row, 6)?,
        created_at: get_ts(row, 7)?,
        updated_at: get_ts(row, 8)?,
    })
}

fn field_mapping_from_row(row: &Row<'_>) -> rusqlite::Result<FieldMapping> {
    let mapping_type: MappingType = parse_column(row, 5)?;
    let spec: Option<String> = row.get(6)?;
    let (transform, custom_spec) = match mapping_type {
        MappingType::Transform => {
            let spec = spec.unwrap_or_default();
            let transform: Transform = serde_json::from_str(&spec)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
            (Some(transform), None)
        }
        MappingType::Custom => (None, spec),
        MappingType::Direct => (None, None),
    };

    Ok(FieldMapping {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        entity_type: parse_column(row, 2)?,
        external_field: row.get(3)?,
        internal_field: row.get(4)?,
        mapping_type,
        transform,
        custom_spec,
        direction: parse_column(row, 7)?,
    })
}

fn sync_mapping_from_row(row: &Row<'_>) -> rusqlite::Result<SyncMapping> {
    Ok(SyncMapping {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        entity_type: parse_column(row, 2)?,
        internal_entity_id: row.get(3)?,
        external_item_id: row.get(4)?,
        external_item_type: row.get(5)?,
        last_synced_at: get_ts(row, 6)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<SyncJob> {
    let errors: String = row.get(9)?;
    let errors: Vec<String> = serde_json::from_str(&errors)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;
    Ok(SyncJob {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        job_type: parse_column(row, 2)?,
        status: parse_column(row, 3)?,
        created_by: row.get(4)?,
        created_at: get_ts(row, 5)?,
        started_at: get_opt_ts(row, 6)?,
        completed_at: get_opt_ts(row, 7)?,
        items_synced: row.get(8)?,
        errors,
    })
}

fn entity_from_row(row: &Row<'_>, entity_type: EntityType) -> rusqlite::Result<EntityRecord> {
    let columns = entity_type.columns();
    let mut fields = EntityFields::new();
    for (offset, column) in columns.iter().enumerate() {
        fields.insert(column.to_string(), from_sql_ref(row.get_ref(2 + offset)?));
    }
    Ok(EntityRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        entity_type,
        fields,
        updated_at: get_ts(row, 2 + columns.len())?,
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = SyncError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: SyncError| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// Type conversion helpers

/// Fixed-width RFC 3339 so text comparison orders chronologically
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn transform_spec(mapping: &FieldMapping) -> Result<Option<String>> {
    match mapping.mapping_type {
        MappingType::Transform => Ok(mapping
            .transform
            .map(|t| serde_json::to_string(&t))
            .transpose()?),
        MappingType::Custom => Ok(mapping.custom_spec.clone()),
        MappingType::Direct => Ok(None),
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}
