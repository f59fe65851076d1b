//! Configuration system
//!
//! Loads ~/.config/trackersync/config.yaml with:
//! - OAuth application registration
//! - Names of the environment variables carrying secrets
//! - Work-item types and the default field-mapping set per entity type
//! - Server, retry and token-refresh settings

mod sync_config;
pub mod validation;

pub use sync_config::{
    default_field_mappings, OAuthSettings, RetrySettings, Secrets, ServerSettings, SyncConfig,
    DEFAULT_CLIENT_SECRET_ENV, DEFAULT_ENCRYPTION_KEY_ENV,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
