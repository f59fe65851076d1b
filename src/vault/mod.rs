//! Credential vault
//!
//! Owns the OAuth token lifecycle for tracker connections:
//! - tokens are encrypted at rest with [`TokenCipher`]
//! - the authorize redirect carries an encrypted, expiring `state`
//! - access tokens are refreshed transparently inside a safety margin, with
//!   at most one refresh in flight per connection

pub mod crypto;
pub mod oauth;

pub use crypto::TokenCipher;
pub use oauth::{AccessPolicy, AuthState, OAuthClient, Requester, SameTenantPolicy, TokenResponse};

use crate::config::{Secrets, SyncConfig};
use crate::store::{Connection, NewConnection, Store};
use crate::{Result, SyncError};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Authorization states older than this are rejected
const STATE_TTL_MINUTES: i64 = 15;

/// Encrypts, issues and refreshes tracker credentials
pub struct CredentialVault {
    cipher: TokenCipher,
    oauth: OAuthClient,
    store: Arc<Store>,
    refresh_margin: Duration,
    policy: Arc<dyn AccessPolicy>,
    refresh_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl CredentialVault {
    pub fn new(
        cipher: TokenCipher,
        oauth: OAuthClient,
        store: Arc<Store>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            cipher,
            oauth,
            store,
            refresh_margin,
            policy: Arc::new(SameTenantPolicy),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SyncConfig, secrets: &Secrets, store: Arc<Store>) -> Result<Self> {
        let oauth = OAuthClient::new(config.oauth.clone(), secrets.client_secret.clone())?;
        Ok(Self::new(
            TokenCipher::new(&secrets.encryption_key),
            oauth,
            store,
            Duration::seconds(config.refresh_margin_secs as i64),
        ))
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        self.cipher.encrypt(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        self.cipher.decrypt(ciphertext)
    }

    /// Fails with [`SyncError::Forbidden`] unless the policy allows `requester`
    /// to manage `tenant_id`'s connections
    pub fn authorize_requester(&self, requester: &Requester, tenant_id: &str) -> Result<()> {
        if self.policy.can_manage_connections(requester, tenant_id) {
            Ok(())
        } else {
            Err(SyncError::Forbidden(format!(
                "{} may not manage connections for tenant {}",
                requester.actor_id, tenant_id
            )))
        }
    }

    // ============ Authorization flow ============

    /// Authorize URL with the tenant/org/project context sealed into `state`
    pub fn build_authorization_url(
        &self,
        org_url: &str,
        project: &str,
        requester: &Requester,
    ) -> Result<String> {
        let org_url = org_url.trim().trim_end_matches('/');
        if !(org_url.starts_with("https://") || org_url.starts_with("http://")) {
            return Err(SyncError::Validation(format!(
                "Organization URL must be http(s): {}",
                org_url
            )));
        }
        if project.trim().is_empty() {
            return Err(SyncError::Validation("Project name is required".to_string()));
        }
        if requester.tenant_id.trim().is_empty() {
            return Err(SyncError::Validation("Tenant id is required".to_string()));
        }

        let state = self.encode_state(&AuthState {
            tenant_id: requester.tenant_id.clone(),
            actor_id: requester.actor_id.clone(),
            org_url: org_url.to_string(),
            project: project.trim().to_string(),
            issued_at: Utc::now(),
        })?;
        Ok(self.oauth.authorize_url(&state))
    }

    pub(crate) fn encode_state(&self, state: &AuthState) -> Result<String> {
        let sealed = self.cipher.encrypt(&serde_json::to_string(state)?)?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Recover the authorize context; tampered, foreign or stale states are
    /// validation errors
    pub fn decode_state(&self, state: &str) -> Result<AuthState> {
        let malformed = || SyncError::Validation("Malformed authorization state".to_string());

        let sealed = URL_SAFE_NO_PAD.decode(state.trim()).map_err(|_| malformed())?;
        let sealed = String::from_utf8(sealed).map_err(|_| malformed())?;
        let json = self.cipher.decrypt(&sealed).map_err(|_| {
            SyncError::Validation("Authorization state failed verification".to_string())
        })?;
        let context: AuthState = serde_json::from_str(&json).map_err(|_| malformed())?;

        if Utc::now() - context.issued_at > Duration::minutes(STATE_TTL_MINUTES) {
            return Err(SyncError::Validation(
                "Authorization state expired; start the connection again".to_string(),
            ));
        }
        Ok(context)
    }

    /// Decode `state` and exchange `code` for tokens
    pub async fn exchange_code_for_token(
        &self,
        code: &str,
        state: &str,
    ) -> Result<(AuthState, TokenResponse)> {
        let context = self.decode_state(state)?;
        let tokens = self.exchange_code(code).await?;
        Ok((context, tokens))
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        if code.trim().is_empty() {
            return Err(SyncError::Validation("Authorization code is required".to_string()));
        }
        self.oauth.exchange_code(code).await
    }

    /// Finish the callback: check the requester, exchange the code and
    /// persist a new connection
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: &str,
        requester: &Requester,
    ) -> Result<Connection> {
        let context = self.decode_state(state)?;
        self.authorize_requester(requester, &context.tenant_id)?;

        let tokens = self.exchange_code(code).await?;
        let new = NewConnection {
            tenant_id: context.tenant_id.clone(),
            org_url: context.org_url.clone(),
            project: context.project.clone(),
            access_token_enc: self.encrypt(&tokens.access_token)?,
            refresh_token_enc: tokens
                .refresh_token
                .as_deref()
                .map(|t| self.encrypt(t))
                .transpose()?,
            token_expires_at: tokens.expires_at(Utc::now()),
        };
        let connection = self.store.insert_connection(&new).await?;

        info!(
            connection_id = connection.id,
            tenant_id = %connection.tenant_id,
            org_url = %connection.org_url,
            project = %connection.project,
            "Connection authorized"
        );
        Ok(connection)
    }

    // ============ Token lifecycle ============

    /// Access token valid for at least the refresh margin
    pub async fn get_access_token(&self, connection_id: i64) -> Result<String> {
        let connection = self.store.get_connection(connection_id).await?;
        if !self.needs_refresh(&connection.token_expires_at) {
            return self.decrypt(&connection.access_token_enc);
        }

        let lock = self.refresh_lock(connection_id).await;
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited
        let connection = self.store.get_connection(connection_id).await?;
        if !self.needs_refresh(&connection.token_expires_at) {
            debug!(connection_id, "Token already refreshed by a concurrent caller");
            return self.decrypt(&connection.access_token_enc);
        }

        self.refresh_locked(&connection).await
    }

    /// Force a refresh regardless of the stored expiry
    pub async fn refresh_access_token(&self, connection_id: i64) -> Result<String> {
        let lock = self.refresh_lock(connection_id).await;
        let _guard = lock.lock().await;

        let connection = self.store.get_connection(connection_id).await?;
        self.refresh_locked(&connection).await
    }

    fn needs_refresh(&self, expires_at: &DateTime<Utc>) -> bool {
        *expires_at - self.refresh_margin <= Utc::now()
    }

    async fn refresh_lock(&self, connection_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        Arc::clone(
            locks
                .entry(connection_id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Caller must hold the connection's refresh lock
    async fn refresh_locked(&self, connection: &Connection) -> Result<String> {
        let refresh_enc = connection
            .refresh_token_enc
            .as_deref()
            .ok_or(SyncError::RefreshUnavailable(connection.id))?;
        let refresh_token = self.decrypt(refresh_enc)?;

        let tokens = self.oauth.refresh(&refresh_token).await?;
        let expires_at = tokens.expires_at(Utc::now());

        let access_enc = self.encrypt(&tokens.access_token)?;
        let refresh_enc = tokens
            .refresh_token
            .as_deref()
            .map(|t| self.encrypt(t))
            .transpose()?;
        self.store
            .update_connection_tokens(connection.id, &access_enc, refresh_enc.as_deref(), expires_at)
            .await?;

        info!(
            connection_id = connection.id,
            expires_at = %expires_at,
            rotated_refresh_token = refresh_enc.is_some(),
            "Access token refreshed"
        );
        Ok(tokens.access_token)
    }
}
