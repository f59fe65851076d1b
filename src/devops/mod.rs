//! Remote work-item client
//!
//! [`WorkItemTracker`] is the seam the sync orchestrator talks to;
//! [`DevOpsClient`] implements it over the tracker's REST API.

mod client;
pub mod models;
pub mod retry;

pub use client::DevOpsClient;
pub use models::{PatchOp, PatchOperation, WorkItem};

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Per-call id limit of the batch fetch endpoint
pub const MAX_BATCH_IDS: usize = 200;

/// Operations the orchestrator needs from a work-item tracker
#[async_trait]
pub trait WorkItemTracker: Send + Sync {
    /// Resolve usable credentials for the connection, refreshing if needed
    async fn ensure_authorized(&self, connection_id: i64) -> Result<()>;

    /// Run a structured query, returning matching item ids
    async fn query_ids(&self, connection_id: i64, query: &str) -> Result<Vec<i64>>;

    /// Fetch items by id in batches; every requested id is returned or the call fails
    async fn fetch_by_ids(&self, connection_id: i64, ids: &[i64]) -> Result<Vec<WorkItem>>;

    async fn fetch_one(&self, connection_id: i64, id: i64) -> Result<WorkItem>;

    /// Create an item from tracker field values, title first
    ///
    /// Fields the tracker refuses on creation are left out; see
    /// [`models::split_creation_fields`].
    async fn create(
        &self,
        connection_id: i64,
        item_type: &str,
        fields: &Map<String, Value>,
    ) -> Result<WorkItem>;

    /// Patch an item guarded by its current revision
    async fn update(
        &self,
        connection_id: i64,
        id: i64,
        ops: &[PatchOperation],
    ) -> Result<WorkItem>;

    /// Revisions of one item, optionally only those changed at or after `since`
    async fn revisions_since(
        &self,
        connection_id: i64,
        id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<WorkItem>>;
}
