//! Work-item REST client
//!
//! Every call resolves the connection's organization, project and a valid
//! access token through the credential vault, so a token that expires during a
//! long job is refreshed between calls.

use super::models::{
    split_creation_fields, ListResponse, PatchOperation, WiqlRequest, WiqlResponse, WorkItem,
    TITLE_FIELD,
};
use super::retry::{with_retry, RetryPolicy};
use super::{WorkItemTracker, MAX_BATCH_IDS};
use crate::vault::CredentialVault;
use crate::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, IF_MATCH, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Per-request timeout for structured queries (large result sets)
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-request timeout for item fetches
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-request timeout for create/update operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

const JSON_PATCH: &str = "application/json-patch+json";

/// Resolved endpoint and credentials for one connection
struct Target {
    base: String,
    token: String,
}

/// Which error variant a failed read maps to
#[derive(Clone, Copy)]
enum ReadKind {
    Query,
    Fetch,
}

/// REST client for the tracker's work-item endpoints
pub struct DevOpsClient {
    http: Client,
    vault: Arc<CredentialVault>,
    api_version: String,
    retry: RetryPolicy,
}

impl DevOpsClient {
    pub fn new(vault: Arc<CredentialVault>, api_version: impl Into<String>) -> Result<Self> {
        let http = Client::builder().timeout(QUERY_TIMEOUT).build()?;
        Ok(Self {
            http,
            vault,
            api_version: api_version.into(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn target(&self, connection_id: i64) -> Result<Target> {
        let connection = self.vault.store().get_connection(connection_id).await?;
        let token = self.vault.get_access_token(connection_id).await?;
        Ok(Target {
            base: format!(
                "{}/{}/_apis/wit",
                connection.org_url.trim_end_matches('/'),
                urlencoding::encode(&connection.project)
            ),
            token,
        })
    }

    async fn query_once(&self, target: &Target, query: &str) -> Result<Vec<i64>> {
        let url = format!("{}/wiql", target.base);
        let response = self
            .http
            .post(&url)
            .query(&[
                ("api-version", self.api_version.as_str()),
                ("timePrecision", "true"),
            ])
            .bearer_auth(&target.token)
            .json(&WiqlRequest { query })
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let result: WiqlResponse = response.json().await?;
                Ok(result.work_items.into_iter().map(|r| r.id).collect())
            }
            _ => Err(read_error(response, ReadKind::Query).await),
        }
    }

    async fn fetch_batch_once(&self, target: &Target, ids: &[i64]) -> Result<Vec<WorkItem>> {
        let url = format!("{}/workitems", target.base);
        let joined = ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let response = self
            .http
            .get(&url)
            .query(&[
                ("ids", joined.as_str()),
                ("$expand", "all"),
                ("api-version", self.api_version.as_str()),
            ])
            .bearer_auth(&target.token)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let batch: ListResponse<WorkItem> = response.json().await?;
                Ok(batch.value)
            }
            _ => Err(read_error(response, ReadKind::Fetch).await),
        }
    }

    async fn fetch_one_once(&self, target: &Target, id: i64) -> Result<WorkItem> {
        let url = format!("{}/workitems/{}", target.base, id);
        let response = self
            .http
            .get(&url)
            .query(&[("$expand", "all"), ("api-version", self.api_version.as_str())])
            .bearer_auth(&target.token)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            _ => Err(read_error(response, ReadKind::Fetch).await),
        }
    }

    async fn revisions_once(&self, target: &Target, id: i64) -> Result<Vec<WorkItem>> {
        let url = format!("{}/workitems/{}/revisions", target.base, id);
        let response = self
            .http
            .get(&url)
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(&target.token)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let revisions: ListResponse<WorkItem> = response.json().await?;
                Ok(revisions.value)
            }
            _ => Err(read_error(response, ReadKind::Fetch).await),
        }
    }
}

/// Map a failed read to Query/Fetch, or RateLimited on 429
async fn read_error(response: Response, kind: ReadKind) -> SyncError {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        return SyncError::RateLimited(retry_after);
    }

    let body = response.text().await.unwrap_or_default();
    match kind {
        ReadKind::Query => SyncError::Query {
            status: status.as_u16(),
            body,
        },
        ReadKind::Fetch => SyncError::Fetch {
            status: status.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl WorkItemTracker for DevOpsClient {
    async fn ensure_authorized(&self, connection_id: i64) -> Result<()> {
        self.vault.get_access_token(connection_id).await.map(|_| ())
    }

    async fn query_ids(&self, connection_id: i64, query: &str) -> Result<Vec<i64>> {
        let target = self.target(connection_id).await?;
        debug!(connection_id, "Running work-item query");

        let ids = with_retry(&self.retry, "wiql_query", || self.query_once(&target, query)).await?;

        debug!(connection_id, count = ids.len(), "Work-item query complete");
        Ok(ids)
    }

    async fn fetch_by_ids(&self, connection_id: i64, ids: &[i64]) -> Result<Vec<WorkItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let target = self.target(connection_id).await?;

        let mut items = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_BATCH_IDS) {
            debug!(connection_id, batch = chunk.len(), "Fetching work-item batch");
            let batch = with_retry(&self.retry, "fetch_batch", || {
                self.fetch_batch_once(&target, chunk)
            })
            .await?;
            items.extend(batch);
        }

        let returned: HashSet<i64> = items.iter().map(|item| item.id).collect();
        let missing: Vec<i64> = ids.iter().copied().filter(|id| !returned.contains(id)).collect();
        if !missing.is_empty() {
            return Err(SyncError::Fetch {
                status: StatusCode::NOT_FOUND.as_u16(),
                body: format!("Work items not returned: {:?}", missing),
            });
        }

        Ok(items)
    }

    async fn fetch_one(&self, connection_id: i64, id: i64) -> Result<WorkItem> {
        let target = self.target(connection_id).await?;
        debug!(connection_id, work_item_id = id, "Fetching work item");
        with_retry(&self.retry, "fetch_one", || self.fetch_one_once(&target, id)).await
    }

    async fn create(
        &self,
        connection_id: i64,
        item_type: &str,
        fields: &Map<String, Value>,
    ) -> Result<WorkItem> {
        let (ops, _deferred) = split_creation_fields(fields);
        if ops.first().and_then(PatchOperation::field_name) != Some(TITLE_FIELD) {
            return Err(SyncError::Validation(format!(
                "Cannot create a {} without {}",
                item_type, TITLE_FIELD
            )));
        }

        let target = self.target(connection_id).await?;
        let url = format!("{}/workitems/${}", target.base, urlencoding::encode(item_type));

        let response = self
            .http
            .post(&url)
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(&target.token)
            .header(CONTENT_TYPE, JSON_PATCH)
            .body(serde_json::to_vec(&ops)?)
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let item: WorkItem = response.json().await?;
                info!(
                    connection_id,
                    work_item_id = item.id,
                    item_type = %item_type,
                    "Created work item"
                );
                Ok(item)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SyncError::Fetch {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    async fn update(
        &self,
        connection_id: i64,
        id: i64,
        ops: &[PatchOperation],
    ) -> Result<WorkItem> {
        let target = self.target(connection_id).await?;
        let current =
            with_retry(&self.retry, "fetch_one", || self.fetch_one_once(&target, id)).await?;

        let url = format!("{}/workitems/{}", target.base, id);
        let response = self
            .http
            .patch(&url)
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(&target.token)
            .header(CONTENT_TYPE, JSON_PATCH)
            .header(IF_MATCH, current.rev.to_string())
            .body(serde_json::to_vec(ops)?)
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let item: WorkItem = response.json().await?;
                debug!(
                    connection_id,
                    work_item_id = id,
                    rev = item.rev,
                    ops = ops.len(),
                    "Updated work item"
                );
                Ok(item)
            }
            StatusCode::PRECONDITION_FAILED => Err(SyncError::ConcurrencyConflict {
                id,
                rev: current.rev,
            }),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SyncError::Fetch {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    async fn revisions_since(
        &self,
        connection_id: i64,
        id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<WorkItem>> {
        let target = self.target(connection_id).await?;
        let revisions =
            with_retry(&self.retry, "revisions", || self.revisions_once(&target, id)).await?;

        Ok(match since {
            Some(since) => revisions
                .into_iter()
                .filter(|rev| rev.changed_date().is_some_and(|changed| changed >= since))
                .collect(),
            None => revisions,
        })
    }
}
