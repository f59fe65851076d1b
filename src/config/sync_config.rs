//! Sync engine configuration file

use crate::mapping::Transform;
use crate::store::{EntityType, FieldMapping};
use crate::vault::crypto::{self, KEY_LEN};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Default environment variable holding the base64 encryption key
pub const DEFAULT_ENCRYPTION_KEY_ENV: &str = "TRACKERSYNC_ENCRYPTION_KEY";

/// Default environment variable holding the OAuth client secret
pub const DEFAULT_CLIENT_SECRET_ENV: &str = "TRACKERSYNC_CLIENT_SECRET";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// SQLite database path
    #[serde(default = "default_database")]
    pub database: PathBuf,

    #[serde(default)]
    pub server: ServerSettings,

    pub oauth: OAuthSettings,

    /// Environment variable holding the base64 AES-256 key
    #[serde(default = "default_encryption_key_env")]
    pub encryption_key_env: String,

    /// Refresh tokens this many seconds before they expire
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,

    /// Tracker REST api-version
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Work-item types mirrored per entity type; the first is used for creation
    #[serde(default = "default_work_item_types")]
    pub work_item_types: HashMap<EntityType, Vec<String>>,

    /// Mapping set installed on a connection's first sync
    #[serde(default = "default_field_mappings")]
    pub default_mappings: Vec<FieldMapping>,

    #[serde(default)]
    pub retry: RetrySettings,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// OAuth application registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthSettings {
    pub client_id: String,

    /// Environment variable holding the client secret (the JWT assertion)
    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,

    pub redirect_uri: String,

    #[serde(default = "default_scope")]
    pub scope: String,

    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,

    #[serde(default = "default_token_url")]
    pub token_url: String,
}

/// Read retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
        }
    }
}

/// Secrets read from the environment at startup
#[derive(Clone)]
pub struct Secrets {
    pub encryption_key: [u8; KEY_LEN],
    pub client_secret: String,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("encryption_key", &"<redacted>")
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

fn default_database() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("trackersync");
    path.push("sync.db");
    path
}

fn default_bind() -> String {
    "127.0.0.1:8087".to_string()
}

fn default_encryption_key_env() -> String {
    DEFAULT_ENCRYPTION_KEY_ENV.to_string()
}

fn default_client_secret_env() -> String {
    DEFAULT_CLIENT_SECRET_ENV.to_string()
}

fn default_scope() -> String {
    "vso.work_write".to_string()
}

fn default_authorize_url() -> String {
    "https://app.vssps.visualstudio.com/oauth2/authorize".to_string()
}

fn default_token_url() -> String {
    "https://app.vssps.visualstudio.com/oauth2/token".to_string()
}

fn default_refresh_margin() -> u64 {
    300
}

fn default_api_version() -> String {
    "7.0".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_work_item_types() -> HashMap<EntityType, Vec<String>> {
    HashMap::from([
        (
            EntityType::Workstream,
            vec!["Epic".to_string(), "Feature".to_string()],
        ),
        (EntityType::Risk, vec!["Risk".to_string()]),
        (EntityType::Action, vec!["Task".to_string()]),
    ])
}

/// Canonical default mapping set, one group per entity type
pub fn default_field_mappings() -> Vec<FieldMapping> {
    use EntityType::*;

    vec![
        // Workstreams
        FieldMapping::direct(Workstream, "System.Title", "name"),
        FieldMapping::transformed(Workstream, "System.State", "status", Transform::StateToStatus),
        FieldMapping::transformed(
            Workstream,
            "System.AssignedTo",
            "owner",
            Transform::ExtractDisplayName,
        ),
        FieldMapping::direct(Workstream, "Custom.Progress", "progress"),
        FieldMapping::direct(Workstream, "System.Description", "notes"),
        FieldMapping::direct(Workstream, "Microsoft.VSTS.Scheduling.TargetDate", "due_date"),
        // Risks
        FieldMapping::direct(Risk, "System.Title", "title"),
        FieldMapping::transformed(Risk, "System.State", "status", Transform::StateToRiskStatus),
        FieldMapping::transformed(
            Risk,
            "Microsoft.VSTS.Common.Severity",
            "severity",
            Transform::SeverityMapping,
        ),
        FieldMapping::transformed(Risk, "System.AssignedTo", "owner", Transform::ExtractDisplayName),
        FieldMapping::direct(Risk, "System.Description", "description"),
        FieldMapping::direct(Risk, "Microsoft.VSTS.Scheduling.TargetDate", "due_date"),
        // Actions
        FieldMapping::direct(Action, "System.Title", "title"),
        FieldMapping::transformed(Action, "System.State", "status", Transform::StateToActionStatus),
        FieldMapping::transformed(
            Action,
            "System.AssignedTo",
            "owner",
            Transform::ExtractDisplayName,
        ),
        FieldMapping::direct(Action, "Custom.Progress", "progress"),
        FieldMapping::direct(Action, "System.Description", "description"),
        FieldMapping::direct(Action, "Microsoft.VSTS.Scheduling.DueDate", "due_date"),
    ]
}

impl SyncConfig {
    /// Minimal configuration for an OAuth application
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            database: default_database(),
            server: ServerSettings::default(),
            oauth: OAuthSettings {
                client_id: client_id.into(),
                client_secret_env: default_client_secret_env(),
                redirect_uri: redirect_uri.into(),
                scope: default_scope(),
                authorize_url: default_authorize_url(),
                token_url: default_token_url(),
            },
            encryption_key_env: default_encryption_key_env(),
            refresh_margin_secs: default_refresh_margin(),
            api_version: default_api_version(),
            work_item_types: default_work_item_types(),
            default_mappings: default_field_mappings(),
            retry: RetrySettings::default(),
        }
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(SyncError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading trackersync configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            database = %config.database.display(),
            mappings = config.default_mappings.len(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving trackersync configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("trackersync");
        path.push("config.yaml");
        path
    }

    /// Read the encryption key and client secret from the environment
    ///
    /// The key is mandatory: without it, previously stored tokens could
    /// never be decrypted again, so startup fails instead.
    pub fn resolve_secrets(&self) -> Result<Secrets> {
        self.resolve_secrets_with(|name| std::env::var(name).ok())
    }

    /// Same as [`resolve_secrets`](Self::resolve_secrets) with an injectable lookup
    pub fn resolve_secrets_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<Secrets> {
        let key = lookup(&self.encryption_key_env).ok_or_else(|| {
            SyncError::Config(format!(
                "Encryption key not set: export {} (generate one with `trackersync gen-key`)",
                self.encryption_key_env
            ))
        })?;
        let encryption_key = crypto::decode_key(&key)?;

        let client_secret = lookup(&self.oauth.client_secret_env)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                SyncError::Config(format!(
                    "OAuth client secret not set: export {}",
                    self.oauth.client_secret_env
                ))
            })?;

        Ok(Secrets {
            encryption_key,
            client_secret,
        })
    }

    /// Work-item types mirrored for an entity type
    pub fn work_item_types_for(&self, entity_type: EntityType) -> &[String] {
        self.work_item_types
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
