//! Job lifecycle and per-entity-type reconciliation

use crate::config::SyncConfig;
use crate::devops::models::{fields_from_ops, split_creation_fields};
use crate::devops::WorkItemTracker;
use crate::mapping::{
    map_external_to_internal, map_internal_to_external, outbound_changes, MappingEngine,
};
use crate::store::{
    ApplyOutcome, Connection, EntityRecord, EntityType, FieldMapping, JobStatus, JobType, Store,
    SyncJob, SyncResult,
};
use crate::{Result, SyncError};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Which way data flows during a reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Tracker -> internal store
    ExternalToInternal,
    /// Internal store -> tracker
    InternalToExternal,
    Bidirectional,
}

impl SyncDirection {
    pub fn includes_inbound(&self) -> bool {
        matches!(self, SyncDirection::ExternalToInternal | SyncDirection::Bidirectional)
    }

    pub fn includes_outbound(&self) -> bool {
        matches!(self, SyncDirection::InternalToExternal | SyncDirection::Bidirectional)
    }
}

/// Everything one reconciliation pass needs about its connection
struct SyncContext {
    connection: Connection,
    tenant_id: String,
    mappings: Vec<FieldMapping>,
    since: Option<DateTime<Utc>>,
}

/// Runs sync jobs for connections
pub struct SyncOrchestrator {
    store: Arc<Store>,
    tracker: Arc<dyn WorkItemTracker>,
    mappings: MappingEngine,
    work_item_types: HashMap<EntityType, Vec<String>>,
    job_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<Store>,
        tracker: Arc<dyn WorkItemTracker>,
        mappings: MappingEngine,
        work_item_types: HashMap<EntityType, Vec<String>>,
    ) -> Self {
        Self {
            store,
            tracker,
            mappings,
            work_item_types,
            job_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(
        config: &SyncConfig,
        store: Arc<Store>,
        tracker: Arc<dyn WorkItemTracker>,
    ) -> Self {
        let mappings = MappingEngine::new(Arc::clone(&store), config.default_mappings.clone());
        Self::new(store, tracker, mappings, config.work_item_types.clone())
    }

    pub fn mappings(&self) -> &MappingEngine {
        &self.mappings
    }

    /// Insert a pending job, returning its id
    pub async fn create_job(
        &self,
        connection_id: i64,
        job_type: JobType,
        actor_id: &str,
    ) -> Result<i64> {
        let job = self.store.create_job(connection_id, job_type, actor_id).await?;
        info!(
            job_id = job.id,
            connection_id,
            job_type = job_type.as_str(),
            "Created sync job"
        );
        Ok(job.id)
    }

    pub async fn update_job(
        &self,
        job_id: i64,
        status: JobStatus,
        result: Option<&SyncResult>,
    ) -> Result<SyncJob> {
        let job = self.store.transition_job(job_id, status, result).await?;
        debug!(job_id, status = status.as_str(), "Job transitioned");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: i64) -> Result<SyncJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))
    }

    /// Create a job and run it in the background, returning the id for polling
    pub async fn start_job(
        self: &Arc<Self>,
        connection_id: i64,
        job_type: JobType,
        actor_id: &str,
    ) -> Result<i64> {
        let job_id = self.create_job(connection_id, job_type, actor_id).await?;

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run_job(job_id).await {
                error!(job_id, error = %e, "Sync job could not be recorded");
            }
        });

        Ok(job_id)
    }

    /// Drive a pending job to a terminal state
    ///
    /// Item-level failures end up in the job's errors and the job still
    /// completes. Only a fatal error (credentials, missing connection) fails it.
    /// The returned error covers the job record itself being unusable.
    pub async fn run_job(&self, job_id: i64) -> Result<SyncJob> {
        let job = self.get_job(job_id).await?;

        let lock = self.job_lock(job.connection_id).await;
        let _guard = lock.lock().await;

        let job = self.update_job(job_id, JobStatus::Running, None).await?;
        info!(job_id, connection_id = job.connection_id, "Sync job started");

        match self.execute(&job).await {
            Ok(result) => {
                info!(
                    job_id,
                    items_synced = result.items_synced,
                    errors = result.errors.len(),
                    "Sync job completed"
                );
                self.update_job(job_id, JobStatus::Completed, Some(&result))
                    .await
            }
            Err(e) => {
                error!(job_id, error = %e, "Sync job failed");
                let mut message = e.to_string();
                if e.is_fatal() {
                    message.push_str("; reconnect the tracker connection");
                }
                let result = SyncResult {
                    items_synced: 0,
                    errors: vec![message],
                };
                self.update_job(job_id, JobStatus::Failed, Some(&result))
                    .await
            }
        }
    }

    /// Reconcile one entity type for a connection over all open items
    pub async fn sync_entity_type(
        &self,
        connection_id: i64,
        entity_type: EntityType,
        direction: SyncDirection,
        tenant_id: &str,
    ) -> Result<SyncResult> {
        let connection = self.store.get_connection(connection_id).await?;
        let context = SyncContext {
            connection,
            tenant_id: tenant_id.to_string(),
            mappings: self.mappings.get_mappings(connection_id).await?,
            since: None,
        };
        self.reconcile(&context, entity_type, direction).await
    }

    async fn execute(&self, job: &SyncJob) -> Result<SyncResult> {
        let connection = self.store.get_connection(job.connection_id).await?;
        self.tracker.ensure_authorized(connection.id).await?;

        self.mappings.ensure_default_mappings(connection.id).await?;
        let mappings = self.mappings.get_mappings(connection.id).await?;

        let since = match job.job_type {
            JobType::IncrementalSync => self
                .store
                .last_completed_job(connection.id)
                .await?
                .and_then(|previous| previous.completed_at),
            JobType::FullSync | JobType::ManualSync => None,
        };
        if let Some(since) = since {
            debug!(job_id = job.id, %since, "Incremental sync watermark");
        }

        let context = SyncContext {
            tenant_id: connection.tenant_id.clone(),
            connection,
            mappings,
            since,
        };

        let passes = EntityType::ALL
            .iter()
            .map(|entity_type| self.reconcile(&context, *entity_type, SyncDirection::Bidirectional));
        let outcomes = join_all(passes).await;

        let mut total = SyncResult::default();
        for (entity_type, outcome) in EntityType::ALL.iter().zip(outcomes) {
            match outcome {
                Ok(result) => total.merge(result),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(job_id = job.id, entity_type = %entity_type, error = %e, "Entity type pass aborted");
                    total.errors.push(format!("{}: {}", entity_type, e));
                }
            }
        }

        Ok(total)
    }

    async fn reconcile(
        &self,
        context: &SyncContext,
        entity_type: EntityType,
        direction: SyncDirection,
    ) -> Result<SyncResult> {
        let mut result = SyncResult::default();
        if direction.includes_inbound() {
            result.merge(self.sync_inbound(context, entity_type).await?);
        }
        if direction.includes_outbound() {
            result.merge(self.sync_outbound(context, entity_type).await?);
        }
        Ok(result)
    }

    async fn sync_inbound(
        &self,
        context: &SyncContext,
        entity_type: EntityType,
    ) -> Result<SyncResult> {
        let mut result = SyncResult::default();
        let item_types = self.item_types(entity_type);
        if item_types.is_empty() {
            return Ok(result);
        }

        let connection_id = context.connection.id;
        let query = inbound_query(&context.connection.project, item_types, context.since);

        let items = match self.query_and_fetch(connection_id, &query).await {
            Ok(items) => items,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(connection_id, entity_type = %entity_type, error = %e, "Inbound query failed");
                result
                    .errors
                    .push(format!("{} inbound query: {}", entity_type, e));
                return Ok(result);
            }
        };
        debug!(connection_id, entity_type = %entity_type, count = items.len(), "Fetched work items");

        for item in items {
            let fields = map_external_to_internal(&item, entity_type, &context.mappings);
            let item_type = item.work_item_type().unwrap_or(item_types[0].as_str());

            let applied = self
                .store
                .apply_external_item(
                    connection_id,
                    &context.tenant_id,
                    entity_type,
                    item.id,
                    item_type,
                    &fields,
                )
                .await;
            match applied {
                Ok(outcome) => {
                    result.items_synced += 1;
                    match outcome {
                        ApplyOutcome::Created(id) => {
                            debug!(work_item = item.id, entity_id = id, "Created {}", entity_type)
                        }
                        ApplyOutcome::Updated(id) => {
                            debug!(work_item = item.id, entity_id = id, "Updated {}", entity_type)
                        }
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(work_item = item.id, entity_type = %entity_type, error = %e, "Inbound item failed");
                    result
                        .errors
                        .push(format!("{} work item {}: {}", entity_type, item.id, e));
                }
            }
        }

        Ok(result)
    }

    async fn sync_outbound(
        &self,
        context: &SyncContext,
        entity_type: EntityType,
    ) -> Result<SyncResult> {
        let mut result = SyncResult::default();
        let entities = self
            .store
            .list_entities(&context.tenant_id, entity_type, context.since)
            .await?;

        for entity in &entities {
            match self.push_entity(context, entity_type, entity).await {
                Ok(()) => result.items_synced += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(entity_id = entity.id, entity_type = %entity_type, error = %e, "Outbound item failed");
                    result
                        .errors
                        .push(format!("{} {}: {}", entity_type, entity.id, e));
                }
            }
        }

        Ok(result)
    }

    async fn push_entity(
        &self,
        context: &SyncContext,
        entity_type: EntityType,
        entity: &EntityRecord,
    ) -> Result<()> {
        let connection_id = context.connection.id;
        let ops = map_internal_to_external(&entity.fields, entity_type, &context.mappings);

        if let Some(mapping) = self
            .store
            .find_by_internal(connection_id, entity_type, entity.id)
            .await?
        {
            let work_item = mapping.external_item_id;
            if !ops.is_empty() {
                let current = self.tracker.fetch_one(connection_id, work_item).await?;
                let (ops, finished) =
                    outbound_changes(&current, ops, entity_type, &context.mappings);

                if !finished.is_empty() {
                    self.store
                        .update_entity(entity_type, entity.id, &finished)
                        .await?;
                    info!(
                        entity_id = entity.id,
                        work_item,
                        "Work item finished in tracker; {} marked closed",
                        entity_type
                    );
                }
                if ops.is_empty() {
                    debug!(entity_id = entity.id, work_item, "Work item already up to date");
                } else {
                    self.tracker.update(connection_id, work_item, &ops).await?;
                    debug!(
                        entity_id = entity.id,
                        work_item,
                        changes = ops.len(),
                        "Pushed {}",
                        entity_type
                    );
                }
            }
            self.store.touch_sync_mapping(mapping.id).await?;
            return Ok(());
        }

        let item_type = self.item_types(entity_type).first().ok_or_else(|| {
            SyncError::Validation(format!("No work item type configured for {}", entity_type))
        })?;
        let fields = fields_from_ops(&ops);
        let created = self.tracker.create(connection_id, item_type, &fields).await?;

        // Pair before the follow-up patch so a failed patch never leads to a second create
        self.store
            .upsert_sync_mapping(connection_id, entity_type, entity.id, created.id, item_type)
            .await?;

        let (_, remaining) = split_creation_fields(&fields);
        if !remaining.is_empty() {
            self.tracker.update(connection_id, created.id, &remaining).await?;
        }

        info!(entity_id = entity.id, work_item = created.id, "Created work item for {}", entity_type);
        Ok(())
    }

    async fn query_and_fetch(
        &self,
        connection_id: i64,
        query: &str,
    ) -> Result<Vec<crate::devops::WorkItem>> {
        let ids = self.tracker.query_ids(connection_id, query).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.tracker.fetch_by_ids(connection_id, &ids).await
    }

    fn item_types(&self, entity_type: EntityType) -> &[String] {
        self.work_item_types
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    async fn job_lock(&self, connection_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.job_locks.lock().await;
        Arc::clone(
            locks
                .entry(connection_id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Query for open items of the given types, optionally changed since a watermark
pub fn inbound_query(project: &str, item_types: &[String], since: Option<DateTime<Utc>>) -> String {
    let types = item_types
        .iter()
        .map(|t| quote(t))
        .collect::<Vec<_>>()
        .join(", ");

    let mut query = format!(
        "SELECT [System.Id] FROM WorkItems \
         WHERE [System.TeamProject] = {} \
         AND [System.WorkItemType] IN ({}) \
         AND [System.State] NOT IN ('Closed', 'Removed')",
        quote(project),
        types
    );
    if let Some(since) = since {
        query.push_str(&format!(
            " AND [System.ChangedDate] >= '{}'",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }
    query.push_str(" ORDER BY [System.ChangedDate] DESC");
    query
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devops::models::{STATE_FIELD, TITLE_FIELD, WORK_ITEM_TYPE_FIELD};
    use crate::devops::{PatchOperation, WorkItem};
    use crate::store::{EntityFields, NewConnection};
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::{json, Map, Value};
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex as StdMutex;

    /// In-memory tracker
    #[derive(Default)]
    struct FakeTracker {
        items: StdMutex<BTreeMap<i64, WorkItem>>,
        queries: StdMutex<Vec<String>>,
        creates: StdMutex<Vec<Map<String, Value>>>,
        updates: StdMutex<Vec<(i64, Vec<PatchOperation>)>>,
        conflict_on: HashSet<i64>,
        auth_error: bool,
        query_error: bool,
    }

    impl FakeTracker {
        fn with_items(items: Vec<WorkItem>) -> Self {
            let tracker = Self::default();
            {
                let mut stored = tracker.items.lock().unwrap();
                for item in items {
                    stored.insert(item.id, item);
                }
            }
            tracker
        }

        fn create_count(&self) -> usize {
            self.creates.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl WorkItemTracker for FakeTracker {
        async fn ensure_authorized(&self, connection_id: i64) -> Result<()> {
            if self.auth_error {
                return Err(SyncError::RefreshUnavailable(connection_id));
            }
            Ok(())
        }

        async fn query_ids(&self, _connection_id: i64, query: &str) -> Result<Vec<i64>> {
            self.queries.lock().unwrap().push(query.to_string());
            if self.query_error {
                return Err(SyncError::Query {
                    status: 400,
                    body: "bad query".to_string(),
                });
            }
            let open_only = query.contains("NOT IN ('Closed', 'Removed')");
            let items = self.items.lock().unwrap();
            Ok(items
                .values()
                .filter(|item| {
                    item.work_item_type()
                        .map(|t| query.contains(&format!("'{}'", t)))
                        .unwrap_or(false)
                })
                .filter(|item| {
                    let state = item.field(STATE_FIELD).and_then(Value::as_str);
                    !(open_only && matches!(state, Some("Closed") | Some("Removed")))
                })
                .map(|item| item.id)
                .collect())
        }

        async fn fetch_by_ids(&self, _connection_id: i64, ids: &[i64]) -> Result<Vec<WorkItem>> {
            let items = self.items.lock().unwrap();
            ids.iter()
                .map(|id| {
                    items.get(id).cloned().ok_or(SyncError::Fetch {
                        status: 404,
                        body: format!("missing {}", id),
                    })
                })
                .collect()
        }

        async fn fetch_one(&self, connection_id: i64, id: i64) -> Result<WorkItem> {
            let mut items = self.fetch_by_ids(connection_id, &[id]).await?;
            Ok(items.remove(0))
        }

        async fn create(
            &self,
            _connection_id: i64,
            item_type: &str,
            fields: &Map<String, Value>,
        ) -> Result<WorkItem> {
            self.creates.lock().unwrap().push(fields.clone());
            let mut items = self.items.lock().unwrap();
            let id = items.keys().next_back().copied().unwrap_or(1000) + 1;
            let (create_ops, _) = split_creation_fields(fields);
            let mut stored = fields_from_ops(&create_ops);
            stored.insert(WORK_ITEM_TYPE_FIELD.to_string(), json!(item_type));
            let item = WorkItem {
                id,
                rev: 1,
                fields: stored,
                url: None,
            };
            items.insert(id, item.clone());
            Ok(item)
        }

        async fn update(
            &self,
            _connection_id: i64,
            id: i64,
            ops: &[PatchOperation],
        ) -> Result<WorkItem> {
            if self.conflict_on.contains(&id) {
                return Err(SyncError::ConcurrencyConflict { id, rev: 7 });
            }
            self.updates.lock().unwrap().push((id, ops.to_vec()));
            let mut items = self.items.lock().unwrap();
            let item = items.entry(id).or_insert_with(|| WorkItem {
                id,
                rev: 0,
                fields: Map::new(),
                url: None,
            });
            item.rev += 1;
            item.fields.extend(fields_from_ops(ops));
            Ok(item.clone())
        }

        async fn revisions_since(
            &self,
            connection_id: i64,
            id: i64,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<WorkItem>> {
            Ok(vec![self.fetch_one(connection_id, id).await?])
        }
    }

    fn risk_item(id: i64, title: &str, state: &str) -> WorkItem {
        WorkItem {
            id,
            rev: 3,
            fields: json!({
                TITLE_FIELD: title,
                STATE_FIELD: state,
                WORK_ITEM_TYPE_FIELD: "Risk",
                "Microsoft.VSTS.Common.Severity": "2 - Medium"
            })
            .as_object()
            .cloned()
            .unwrap(),
            url: None,
        }
    }

    fn set_state(tracker: &FakeTracker, id: i64, state: &str) {
        let mut items = tracker.items.lock().unwrap();
        if let Some(item) = items.get_mut(&id) {
            item.fields.insert(STATE_FIELD.to_string(), json!(state));
        }
    }

    fn tracker_state(tracker: &FakeTracker, id: i64) -> Value {
        tracker.items.lock().unwrap()[&id].fields[STATE_FIELD].clone()
    }

    fn fields(value: Value) -> EntityFields {
        value.as_object().cloned().unwrap()
    }

    async fn setup(tracker: FakeTracker) -> (Arc<SyncOrchestrator>, Arc<Store>, Arc<FakeTracker>, i64) {
        crate::logging::init_test();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let connection = store
            .insert_connection(&NewConnection {
                tenant_id: "t1".to_string(),
                org_url: "https://dev.azure.com/contoso".to_string(),
                project: "Apollo".to_string(),
                access_token_enc: "n:t:c".to_string(),
                refresh_token_enc: None,
                token_expires_at: Utc::now() + Duration::hours(1),
            })
            .await
            .unwrap();

        let tracker = Arc::new(tracker);
        let config = SyncConfig::new("client", "https://app.example.com/oauth/callback");
        let orchestrator = Arc::new(SyncOrchestrator::from_config(
            &config,
            Arc::clone(&store),
            tracker.clone(),
        ));
        orchestrator
            .mappings()
            .ensure_default_mappings(connection.id)
            .await
            .unwrap();
        (orchestrator, store, tracker, connection.id)
    }

    #[test]
    fn test_direction_flags() {
        assert!(SyncDirection::Bidirectional.includes_inbound());
        assert!(SyncDirection::Bidirectional.includes_outbound());
        assert!(!SyncDirection::ExternalToInternal.includes_outbound());
        assert!(!SyncDirection::InternalToExternal.includes_inbound());
    }

    #[test]
    fn test_inbound_query() {
        let types = vec!["Epic".to_string(), "Feature".to_string()];
        let query = inbound_query("Bob's Project", &types, None);
        assert!(query.contains("[System.TeamProject] = 'Bob''s Project'"));
        assert!(query.contains("IN ('Epic', 'Feature')"));
        assert!(query.contains("NOT IN ('Closed', 'Removed')"));
        assert!(!query.contains(">="));

        let since = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let query = inbound_query("Apollo", &types, Some(since));
        assert!(query.contains("[System.ChangedDate] >= '2024-03-01T10:00:00Z'"));
    }

    #[tokio::test]
    async fn test_inbound_resync_is_idempotent() {
        let tracker = FakeTracker::with_items(vec![risk_item(101, "Vendor slip", "Active")]);
        let (orchestrator, store, _, conn) = setup(tracker).await;

        for _ in 0..2 {
            let result = orchestrator
                .sync_entity_type(conn, EntityType::Risk, SyncDirection::ExternalToInternal, "t1")
                .await
                .unwrap();
            assert_eq!(result.items_synced, 1);
            assert!(result.errors.is_empty());
        }

        assert_eq!(store.count_sync_mappings(conn, EntityType::Risk).await.unwrap(), 1);
        let risks = store.list_entities("t1", EntityType::Risk, None).await.unwrap();
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].fields["title"], json!("Vendor slip"));
        assert_eq!(risks[0].fields["status"], json!("MITIGATING"));
        assert_eq!(risks[0].fields["severity"], json!("MEDIUM"));
    }

    #[tokio::test]
    async fn test_outbound_item_failure_is_isolated() {
        let mut tracker =
            FakeTracker::with_items((101..=105).map(|id| risk_item(id, "stale", "New")).collect());
        tracker.conflict_on.insert(103);
        let (orchestrator, store, tracker, conn) = setup(tracker).await;

        for external_id in 101..=105 {
            let id = store
                .create_entity(
                    "t1",
                    EntityType::Risk,
                    &fields(json!({"title": format!("Risk {}", external_id), "status": "OPEN"})),
                )
                .await
                .unwrap();
            store
                .upsert_sync_mapping(conn, EntityType::Risk, id, external_id, "Risk")
                .await
                .unwrap();
        }

        let result = orchestrator
            .sync_entity_type(conn, EntityType::Risk, SyncDirection::InternalToExternal, "t1")
            .await
            .unwrap();
        assert_eq!(result.items_synced, 4);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("103"));
        assert_eq!(tracker.updates.lock().unwrap().len(), 4);
        assert_eq!(tracker.create_count(), 0);
    }

    #[tokio::test]
    async fn test_job_completes_with_item_errors() {
        // Closed upstream, so only the outbound pass sees them
        let mut tracker =
            FakeTracker::with_items((101..=105).map(|id| risk_item(id, "stale", "Closed")).collect());
        tracker.conflict_on.insert(103);
        let (orchestrator, store, _, conn) = setup(tracker).await;

        for external_id in 101..=105 {
            let id = store
                .create_entity("t1", EntityType::Risk, &fields(json!({"title": "r"})))
                .await
                .unwrap();
            store
                .upsert_sync_mapping(conn, EntityType::Risk, id, external_id, "Risk")
                .await
                .unwrap();
        }

        let job_id = orchestrator
            .create_job(conn, JobType::FullSync, "alice")
            .await
            .unwrap();
        let job = orchestrator.run_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.items_synced, 4);
        assert_eq!(job.errors.len(), 1);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_outbound_create_pairs_once() {
        let (orchestrator, store, tracker, conn) = setup(FakeTracker::default()).await;
        let action = store
            .create_entity(
                "t1",
                EntityType::Action,
                &fields(json!({"title": "Ship it", "status": "DONE", "owner": "Jane Doe"})),
            )
            .await
            .unwrap();

        let result = orchestrator
            .sync_entity_type(conn, EntityType::Action, SyncDirection::InternalToExternal, "t1")
            .await
            .unwrap();
        assert_eq!(result.items_synced, 1);
        assert_eq!(tracker.create_count(), 1);

        let mapping = store
            .find_by_internal(conn, EntityType::Action, action)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.external_item_type, "Task");

        // State is applied after creation
        let created = tracker.items.lock().unwrap()[&mapping.external_item_id].clone();
        assert_eq!(created.fields[TITLE_FIELD], json!("Ship it"));
        assert_eq!(created.fields[STATE_FIELD], json!("Closed"));
        assert!(!tracker.creates.lock().unwrap()[0].contains_key("System.AssignedTo"));

        // A second pass neither creates again nor patches an unchanged item
        orchestrator
            .sync_entity_type(conn, EntityType::Action, SyncDirection::InternalToExternal, "t1")
            .await
            .unwrap();
        assert_eq!(tracker.create_count(), 1);
        assert_eq!(tracker.updates.lock().unwrap().len(), 1);
        assert_eq!(store.count_sync_mappings(conn, EntityType::Action).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_item_closed_in_tracker_stays_closed() {
        let tracker = FakeTracker::with_items(vec![risk_item(101, "Vendor slip", "Active")]);
        let (orchestrator, store, tracker, conn) = setup(tracker).await;

        orchestrator
            .sync_entity_type(conn, EntityType::Risk, SyncDirection::ExternalToInternal, "t1")
            .await
            .unwrap();
        set_state(&tracker, 101, "Closed");

        let result = orchestrator
            .sync_entity_type(conn, EntityType::Risk, SyncDirection::Bidirectional, "t1")
            .await
            .unwrap();
        assert!(result.errors.is_empty());
        assert_eq!(tracker_state(&tracker, 101), json!("Closed"));
        assert!(tracker.updates.lock().unwrap().is_empty());

        // The closure reaches the internal record instead
        let risks = store.list_entities("t1", EntityType::Risk, None).await.unwrap();
        assert_eq!(risks[0].fields["status"], json!("CLOSED"));
    }

    #[tokio::test]
    async fn test_unchanged_sync_keeps_tracker_states() {
        let tracker = FakeTracker::with_items(vec![
            risk_item(101, "Vendor slip", "Resolved"),
            risk_item(102, "Budget cut", "Committed"),
        ]);
        let (orchestrator, _, tracker, conn) = setup(tracker).await;

        for _ in 0..2 {
            let result = orchestrator
                .sync_entity_type(conn, EntityType::Risk, SyncDirection::Bidirectional, "t1")
                .await
                .unwrap();
            assert!(result.errors.is_empty());
        }

        assert_eq!(tracker_state(&tracker, 101), json!("Resolved"));
        assert_eq!(tracker_state(&tracker, 102), json!("Committed"));
        assert!(tracker.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_internal_edit_still_pushed() {
        let tracker = FakeTracker::with_items(vec![risk_item(101, "Vendor slip", "New")]);
        let (orchestrator, store, tracker, conn) = setup(tracker).await;

        orchestrator
            .sync_entity_type(conn, EntityType::Risk, SyncDirection::ExternalToInternal, "t1")
            .await
            .unwrap();
        let risk = store.list_entities("t1", EntityType::Risk, None).await.unwrap()[0].id;
        store
            .update_entity(EntityType::Risk, risk, &fields(json!({"status": "MITIGATING"})))
            .await
            .unwrap();

        orchestrator
            .sync_entity_type(conn, EntityType::Risk, SyncDirection::InternalToExternal, "t1")
            .await
            .unwrap();
        let updates = tracker.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].1,
            vec![PatchOperation::replace_field(STATE_FIELD, json!("Active"))]
        );
        assert_eq!(tracker_state(&tracker, 101), json!("Active"));
    }

    #[tokio::test]
    async fn test_fatal_error_fails_job() {
        let tracker = FakeTracker {
            auth_error: true,
            ..Default::default()
        };
        let (orchestrator, _, _, conn) = setup(tracker).await;

        let job_id = orchestrator
            .create_job(conn, JobType::ManualSync, "alice")
            .await
            .unwrap();
        let job = orchestrator.run_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.items_synced, 0);
        assert!(job.errors[0].contains("reconnect"));

        // Terminal jobs cannot be rerun
        assert!(orchestrator.run_job(job_id).await.is_err());
    }

    #[tokio::test]
    async fn test_query_error_is_soft() {
        let tracker = FakeTracker {
            query_error: true,
            ..Default::default()
        };
        let (orchestrator, _, _, conn) = setup(tracker).await;

        let job_id = orchestrator
            .create_job(conn, JobType::FullSync, "alice")
            .await
            .unwrap();
        let job = orchestrator.run_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.errors.len(), 3);
    }

    #[tokio::test]
    async fn test_incremental_job_uses_watermark() {
        let tracker = FakeTracker::with_items(vec![risk_item(101, "Vendor slip", "New")]);
        let (orchestrator, store, tracker, conn) = setup(tracker).await;

        let first = orchestrator
            .create_job(conn, JobType::FullSync, "alice")
            .await
            .unwrap();
        orchestrator.run_job(first).await.unwrap();
        assert!(tracker
            .queries
            .lock()
            .unwrap()
            .iter()
            .all(|q| !q.contains("System.ChangedDate] >=")));

        let second = orchestrator
            .create_job(conn, JobType::IncrementalSync, "alice")
            .await
            .unwrap();
        let job = orchestrator.run_job(second).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(tracker
            .queries
            .lock()
            .unwrap()
            .iter()
            .any(|q| q.contains("System.ChangedDate] >=")));
        assert_eq!(store.count_sync_mappings(conn, EntityType::Risk).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_start_job_runs_in_background() {
        let tracker = FakeTracker::with_items(vec![risk_item(101, "Vendor slip", "Active")]);
        let (orchestrator, _, _, conn) = setup(tracker).await;

        let job_id = orchestrator
            .start_job(conn, JobType::FullSync, "alice")
            .await
            .unwrap();

        let mut job = orchestrator.get_job(job_id).await.unwrap();
        for _ in 0..100 {
            if job.status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            job = orchestrator.get_job(job_id).await.unwrap();
        }
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.items_synced >= 1);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (orchestrator, _, _, _) = setup(FakeTracker::default()).await;
        assert!(matches!(
            orchestrator.run_job(999).await,
            Err(SyncError::JobNotFound(999))
        ));
    }
}
