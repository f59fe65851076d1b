//! HTTP server for trackersync
//!
//! Exposes the authorize flow, connection and mapping administration, and
//! sync job triggering over a small JSON API.
//!
//! # Routes
//!
//! - `GET /health` - Liveness probe
//! - `GET /oauth/authorize?org_url=..&project=..` - Redirect to the tracker's consent page
//! - `GET /oauth/callback?code=..&state=..` - Finish authorization, create the connection
//! - `GET /connections` - List the requester's connections
//! - `DELETE /connections/{id}` - Remove a connection and everything hanging off it
//! - `GET /connections/{id}/mappings` - Field mappings for a connection
//! - `PUT /connections/{id}/mappings` - Upsert field mappings
//! - `POST /connections/{id}/sync` - Start a sync job (body: `{"job_type": "full_sync"}`)
//! - `GET /jobs/{id}` - Poll a sync job
//!
//! The requester is identified by the `x-tenant-id` and `x-actor-id` headers,
//! set by the gateway in front of this service.

use crate::store::{Connection, ConnectionSummary, FieldMapping, JobType, Store};
use crate::sync::SyncOrchestrator;
use crate::vault::{CredentialVault, Requester};
use crate::{Result, SyncError};
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const ACTOR_HEADER: &str = "x-actor-id";

/// Request body limit; mapping sets are small
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Shared server state
struct AppState {
    vault: Arc<CredentialVault>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    fn store(&self) -> &Arc<Store> {
        self.vault.store()
    }

    /// Load a connection and check the requester may manage it
    async fn authorized_connection(
        &self,
        requester: &Requester,
        connection_id: i64,
    ) -> Result<Connection> {
        let connection = self.store().get_connection(connection_id).await?;
        self.vault
            .authorize_requester(requester, &connection.tenant_id)?;
        Ok(connection)
    }
}

/// HTTP server for the sync engine
pub struct SyncServer {
    state: Arc<AppState>,
}

impl SyncServer {
    pub fn new(vault: Arc<CredentialVault>, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            state: Arc::new(AppState {
                vault,
                orchestrator,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/oauth/authorize", get(authorize))
            .route("/oauth/callback", get(callback))
            .route("/connections", get(list_connections))
            .route("/connections/{id}", axum::routing::delete(delete_connection))
            .route("/connections/{id}/mappings", get(get_mappings).put(put_mappings))
            .route("/connections/{id}/sync", post(start_sync))
            .route("/jobs/{id}", get(get_job))
            .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_SIZE))
            .with_state(Arc::clone(&self.state))
    }

    /// Run the server on the given address
    pub async fn run(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SyncError::Config(format!("Cannot bind {}: {}", addr, e)))?;

        tracing::info!(addr = addr, "Sync server listening");

        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

// ============================================================================
// Errors and extractors
// ============================================================================

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// A [`SyncError`] rendered as a JSON response
#[derive(Debug)]
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let (status, hint) = match &err {
            SyncError::ConnectionNotFound(_) | SyncError::JobNotFound(_) => {
                (StatusCode::NOT_FOUND, None)
            }
            SyncError::Validation(_) => (StatusCode::BAD_REQUEST, None),
            SyncError::Forbidden(_) => (StatusCode::FORBIDDEN, None),
            SyncError::OAuthExchange { .. }
            | SyncError::OAuthRefresh { .. }
            | SyncError::RefreshUnavailable(_)
            | SyncError::Decryption(_) => (
                StatusCode::UNAUTHORIZED,
                Some("reconnect the tracker connection".to_string()),
            ),
            SyncError::ConcurrencyConflict { .. } => (StatusCode::CONFLICT, None),
            SyncError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, None),
            SyncError::Query { .. } | SyncError::Fetch { .. } => (StatusCode::BAD_GATEWAY, None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "Request failed");
            "Internal server error".to_string()
        } else {
            tracing::warn!(status = status.as_u16(), error = %err, "Request rejected");
            err.to_string()
        };

        (status, Json(ErrorResponse { error, hint })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

impl<S: Send + Sync> FromRequestParts<S> for Requester {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> ApiResult<Self> {
        let value_of = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        match (value_of(TENANT_HEADER), value_of(ACTOR_HEADER)) {
            (Some(tenant), Some(actor)) => Ok(Requester::new(tenant, actor)),
            _ => Err(ApiError(SyncError::Forbidden(format!(
                "{} and {} headers are required",
                TENANT_HEADER, ACTOR_HEADER
            )))),
        }
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    pub org_url: String,
    pub project: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    #[serde(default = "default_job_type")]
    pub job_type: JobType,
}

fn default_job_type() -> JobType {
    JobType::FullSync
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartedJob {
    pub job_id: i64,
    pub status: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn authorize(
    State(state): State<Arc<AppState>>,
    requester: Requester,
    Query(params): Query<AuthorizeParams>,
) -> ApiResult<Response> {
    state
        .vault
        .authorize_requester(&requester, &requester.tenant_id)?;
    let url = state
        .vault
        .build_authorization_url(&params.org_url, &params.project, &requester)?;
    Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
}

async fn callback(
    State(state): State<Arc<AppState>>,
    requester: Requester,
    Query(params): Query<CallbackParams>,
) -> ApiResult<Json<ConnectionSummary>> {
    let connection = state
        .vault
        .complete_authorization(&params.code, &params.state, &requester)
        .await?;
    state
        .orchestrator
        .mappings()
        .ensure_default_mappings(connection.id)
        .await?;
    Ok(Json(ConnectionSummary::from(&connection)))
}

async fn list_connections(
    State(state): State<Arc<AppState>>,
    requester: Requester,
) -> ApiResult<Json<Vec<ConnectionSummary>>> {
    let connections = state.store().list_connections(&requester.tenant_id).await?;
    Ok(Json(connections.iter().map(ConnectionSummary::from).collect()))
}

async fn delete_connection(
    State(state): State<Arc<AppState>>,
    requester: Requester,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.authorized_connection(&requester, id).await?;
    state.store().delete_connection(id).await?;
    tracing::info!(connection_id = id, actor = %requester.actor_id, "Connection deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn get_mappings(
    State(state): State<Arc<AppState>>,
    requester: Requester,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<FieldMapping>>> {
    state.authorized_connection(&requester, id).await?;
    let mappings = state.orchestrator.mappings().get_mappings(id).await?;
    Ok(Json(mappings))
}

async fn put_mappings(
    State(state): State<Arc<AppState>>,
    requester: Requester,
    Path(id): Path<i64>,
    Json(mappings): Json<Vec<FieldMapping>>,
) -> ApiResult<Json<Vec<FieldMapping>>> {
    state.authorized_connection(&requester, id).await?;
    for mapping in &mappings {
        mapping.validate()?;
    }
    let saved = state.orchestrator.mappings().save_mappings(id, &mappings).await?;
    Ok(Json(saved))
}

async fn start_sync(
    State(state): State<Arc<AppState>>,
    requester: Requester,
    Path(id): Path<i64>,
    Json(req): Json<SyncRequest>,
) -> ApiResult<(StatusCode, Json<StartedJob>)> {
    state.authorized_connection(&requester, id).await?;
    let job_id = state
        .orchestrator
        .start_job(id, req.job_type, &requester.actor_id)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartedJob {
            job_id,
            status: "pending".to_string(),
        }),
    ))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    requester: Requester,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let job = state.orchestrator.get_job(id).await?;
    state.authorized_connection(&requester, job.connection_id).await?;
    Ok(Json(job).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Secrets, SyncConfig};
    use crate::devops::retry::RetryPolicy;
    use crate::devops::DevOpsClient;
    use crate::store::{EntityType, NewConnection};
    use crate::vault::crypto;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{Duration, Utc};
    use tower::ServiceExt;

    struct Harness {
        server: SyncServer,
        vault: Arc<CredentialVault>,
    }

    fn harness() -> Harness {
        let config = SyncConfig::new("app-id", "https://sync.example.com/oauth/callback");
        let secrets = Secrets {
            encryption_key: crypto::generate_key(),
            client_secret: "assertion".to_string(),
        };
        let store = Arc::new(Store::open_in_memory().unwrap());
        let vault =
            Arc::new(CredentialVault::from_config(&config, &secrets, Arc::clone(&store)).unwrap());
        let client = DevOpsClient::new(Arc::clone(&vault), "7.0")
            .unwrap()
            .with_retry(RetryPolicy::disabled());
        let orchestrator = Arc::new(SyncOrchestrator::from_config(
            &config,
            store,
            Arc::new(client),
        ));
        Harness {
            server: SyncServer::new(Arc::clone(&vault), orchestrator),
            vault,
        }
    }

    async fn connection(vault: &CredentialVault, tenant: &str) -> Connection {
        vault
            .store()
            .insert_connection(&NewConnection {
                tenant_id: tenant.to_string(),
                org_url: "http://127.0.0.1:9/contoso".to_string(),
                project: "Apollo".to_string(),
                access_token_enc: vault.encrypt("at-1").unwrap(),
                refresh_token_enc: None,
                token_expires_at: Utc::now() + Duration::hours(1),
            })
            .await
            .unwrap()
    }

    fn request(method: &str, uri: &str, tenant: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(TENANT_HEADER, tenant)
            .header(ACTOR_HEADER, "alice")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let h = harness();
        let response = h
            .server
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_authorize_redirects() {
        let h = harness();
        let response = h
            .server
            .router()
            .oneshot(
                request(
                    "GET",
                    "/oauth/authorize?org_url=https%3A%2F%2Fdev.azure.com%2Fcontoso&project=Apollo",
                    "t1",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.contains("response_type=Assertion"));
        assert!(location.contains("state="));
    }

    #[tokio::test]
    async fn test_missing_identity_is_forbidden() {
        let h = harness();
        let response = h
            .server
            .router()
            .oneshot(Request::builder().uri("/connections").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_bad_org_url_is_bad_request() {
        let h = harness();
        let response = h
            .server
            .router()
            .oneshot(
                request("GET", "/oauth/authorize?org_url=contoso&project=Apollo", "t1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("http"));
    }

    #[tokio::test]
    async fn test_list_connections_hides_tokens_and_other_tenants() {
        let h = harness();
        connection(&h.vault, "t1").await;
        connection(&h.vault, "t2").await;

        let response = h
            .server
            .router()
            .oneshot(request("GET", "/connections", "t1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let list = body.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["tenant_id"], "t1");
        assert!(list[0].get("access_token_enc").is_none());
    }

    #[tokio::test]
    async fn test_other_tenant_cannot_touch_connection() {
        let h = harness();
        let conn = connection(&h.vault, "t1").await;

        let response = h
            .server
            .router()
            .oneshot(
                request("DELETE", &format!("/connections/{}", conn.id), "t2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(h.vault.store().get_connection(conn.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_unknown_connection() {
        let h = harness();
        let response = h
            .server
            .router()
            .oneshot(request("DELETE", "/connections/42", "t1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_mappings_validates() {
        let h = harness();
        let conn = connection(&h.vault, "t1").await;
        let uri = format!("/connections/{}/mappings", conn.id);

        // Forward-only transform declared bidirectional
        let bad = serde_json::json!([{
            "entity_type": "risk",
            "external_field": "System.AssignedTo",
            "internal_field": "owner",
            "mapping_type": "transform",
            "transform": {"type": "extract_display_name"},
            "direction": "bidirectional"
        }]);
        let response = h
            .server
            .router()
            .oneshot(
                request("PUT", &uri, "t1")
                    .header("Content-Type", "application/json")
                    .body(Body::from(bad.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let good = serde_json::json!([{
            "entity_type": "risk",
            "external_field": "Custom.Impact",
            "internal_field": "description",
            "mapping_type": "direct"
        }]);
        let response = h
            .server
            .router()
            .oneshot(
                request("PUT", &uri, "t1")
                    .header("Content-Type", "application/json")
                    .body(Body::from(good.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let saved = body_json(response).await;
        assert_eq!(saved.as_array().unwrap().len(), 1);
        assert_eq!(saved[0]["entity_type"], serde_json::json!(EntityType::Risk));
    }

    #[tokio::test]
    async fn test_start_sync_returns_accepted() {
        let h = harness();
        let conn = connection(&h.vault, "t1").await;

        let response = h
            .server
            .router()
            .oneshot(
                request("POST", &format!("/connections/{}/sync", conn.id), "t1")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"job_type":"manual_sync"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let started: StartedJob = serde_json::from_value(body_json(response).await).unwrap();

        let response = h
            .server
            .router()
            .oneshot(
                request("GET", &format!("/jobs/{}", started.job_id), "t1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job = body_json(response).await;
        assert_eq!(job["job_type"], "manual_sync");
        assert_eq!(job["created_by"], "alice");
    }

    #[tokio::test]
    async fn test_fatal_error_maps_to_unauthorized() {
        let response = ApiError(SyncError::RefreshUnavailable(1)).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: ErrorResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert!(body.hint.unwrap().contains("reconnect"));
    }

    #[tokio::test]
    async fn test_internal_errors_are_opaque() {
        let response = ApiError(SyncError::Storage("disk on fire".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal server error");
    }
}
