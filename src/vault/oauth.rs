//! OAuth2 client for the tracker's authorization server
//!
//! Initial exchange uses the JWT-bearer assertion grant (the authorization code
//! is the assertion, the client secret is the client assertion); renewal uses
//! the refresh-token grant against the same endpoint.

use crate::config::OAuthSettings;
use crate::{Result, SyncError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

const TOKEN_TIMEOUT: Duration = Duration::from_secs(15);

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const REFRESH_GRANT: &str = "refresh_token";

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Token endpoint response
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "number_or_string")]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::seconds(self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS))
    }
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish_non_exhaustive()
    }
}

/// The token endpoint sends `expires_in` as either `3599` or `"3599"`
fn number_or_string<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Context carried through the authorize redirect in the `state` parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    pub tenant_id: String,
    pub actor_id: String,
    pub org_url: String,
    pub project: String,
    pub issued_at: DateTime<Utc>,
}

/// Identity of the caller of an OAuth or admin operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub tenant_id: String,
    pub actor_id: String,
}

impl Requester {
    pub fn new(tenant_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor_id: actor_id.into(),
        }
    }
}

/// Decides whether a requester may manage a tenant's connections
pub trait AccessPolicy: Send + Sync {
    fn can_manage_connections(&self, requester: &Requester, tenant_id: &str) -> bool;
}

/// Requesters may only manage their own tenant's connections
#[derive(Debug, Clone, Copy, Default)]
pub struct SameTenantPolicy;

impl AccessPolicy for SameTenantPolicy {
    fn can_manage_connections(&self, requester: &Requester, tenant_id: &str) -> bool {
        !requester.tenant_id.is_empty() && requester.tenant_id == tenant_id
    }
}

/// HTTP client for the authorize and token endpoints
pub struct OAuthClient {
    http: Client,
    settings: OAuthSettings,
    client_secret: String,
}

impl OAuthClient {
    pub fn new(settings: OAuthSettings, client_secret: impl Into<String>) -> Result<Self> {
        let http = Client::builder().timeout(TOKEN_TIMEOUT).build()?;
        Ok(Self {
            http,
            settings,
            client_secret: client_secret.into(),
        })
    }

    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }

    /// Authorize URL the user is redirected to
    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&response_type=Assertion&state={}&scope={}&redirect_uri={}",
            self.settings.authorize_url,
            urlencoding::encode(&self.settings.client_id),
            urlencoding::encode(state),
            urlencoding::encode(&self.settings.scope),
            urlencoding::encode(&self.settings.redirect_uri),
        )
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        debug!(url = %self.settings.token_url, "Exchanging authorization code");
        self.request_token(JWT_BEARER_GRANT, code)
            .await
            .map_err(|(status, body)| SyncError::OAuthExchange { status, body })
    }

    /// Exchange a refresh token for a new access token
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        debug!(url = %self.settings.token_url, "Refreshing access token");
        self.request_token(REFRESH_GRANT, refresh_token)
            .await
            .map_err(|(status, body)| SyncError::OAuthRefresh { status, body })
    }

    /// Upstream failures come back as (status, body); transport failures as status 0
    async fn request_token(
        &self,
        grant_type: &str,
        assertion: &str,
    ) -> std::result::Result<TokenResponse, (u16, String)> {
        let form = [
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", self.client_secret.as_str()),
            ("grant_type", grant_type),
            ("assertion", assertion),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
        ];

        let response = self
            .http
            .post(&self.settings.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| (0, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, grant_type = %grant_type, "Token endpoint rejected request");
            return Err((status.as_u16(), body));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| (status.as_u16(), format!("Malformed token response: {}", e)))
    }
}

impl fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> OAuthClient {
        let mut settings = SyncConfig::new("app-id", "https://sync.example.com/oauth/callback").oauth;
        settings.token_url = format!("{}/oauth2/token", server.uri());
        OAuthClient::new(settings, "client-assertion").unwrap()
    }

    #[test]
    fn test_expires_in_number_or_string() {
        let numeric: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":3599}"#).unwrap();
        assert_eq!(numeric.expires_in, Some(3599));

        let text: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":"3599","refresh_token":"r"}"#)
                .unwrap();
        assert_eq!(text.expires_in, Some(3599));

        let missing: TokenResponse = serde_json::from_str(r#"{"access_token":"a"}"#).unwrap();
        let now = Utc::now();
        assert_eq!(missing.expires_at(now), now + ChronoDuration::hours(1));
    }

    #[test]
    fn test_debug_hides_tokens() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token":"secret-a","refresh_token":"secret-r"}"#)
                .unwrap();
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("secret-a"));
        assert!(!rendered.contains("secret-r"));
    }

    #[test]
    fn test_same_tenant_policy() {
        let policy = SameTenantPolicy;
        assert!(policy.can_manage_connections(&Requester::new("t1", "u1"), "t1"));
        assert!(!policy.can_manage_connections(&Requester::new("t2", "u1"), "t1"));
        assert!(!policy.can_manage_connections(&Requester::new("", "u1"), ""));
    }

    #[tokio::test]
    async fn test_authorize_url_encodes_parameters() {
        let server = MockServer::start().await;
        let url = client(&server).authorize_url("abc+/=");
        assert!(url.starts_with("https://app.vssps.visualstudio.com/oauth2/authorize?client_id=app-id"));
        assert!(url.contains("response_type=Assertion"));
        assert!(url.contains("state=abc%2B%2F%3D"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fsync.example.com%2Foauth%2Fcallback"));
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("assertion=the-code"))
            .and(body_string_contains("client_assertion=client-assertion"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-1",
                "refresh_token": "rt-1",
                "expires_in": "3599",
                "token_type": "jwt-bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = client(&server).exchange_code("the-code").await.unwrap();
        assert_eq!(token.access_token, "at-1");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-1"));
    }

    #[tokio::test]
    async fn test_exchange_failure_surfaces_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let err = client(&server).exchange_code("stale").await.unwrap_err();
        match err {
            SyncError::OAuthExchange { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "invalid_grant");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let err = client(&server).refresh("old").await.unwrap_err();
        assert!(matches!(err, SyncError::OAuthRefresh { status: 400, .. }));
        assert!(err.is_fatal());
    }
}
