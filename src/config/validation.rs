//! Configuration validation
//!
//! Collects every problem in a configuration rather than stopping at the first:
//! - OAuth registration is complete and URLs are http(s)
//! - Refresh margin is non-zero
//! - Every entity type has at least one work-item type
//! - Default mappings are well formed

use super::sync_config::SyncConfig;
use crate::store::EntityType;
use crate::SyncError;
use std::collections::HashSet;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub context: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref ctx) = self.context {
            write!(f, "[{}] {}: {}", ctx, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a sync configuration
pub fn validate_config(config: &SyncConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.oauth.client_id.trim().is_empty() {
        errors.push(ValidationError::new(
            "oauth.client_id",
            "Client id cannot be empty",
        ));
    }

    for (field, url) in [
        ("oauth.redirect_uri", &config.oauth.redirect_uri),
        ("oauth.authorize_url", &config.oauth.authorize_url),
        ("oauth.token_url", &config.oauth.token_url),
    ] {
        if !is_http_url(url) {
            errors.push(ValidationError::new(field, format!("Invalid URL: {}", url)));
        }
    }

    if config.oauth.client_secret_env.trim().is_empty() {
        errors.push(ValidationError::new(
            "oauth.client_secret_env",
            "Client secret variable name cannot be empty",
        ));
    }

    if config.encryption_key_env.trim().is_empty() {
        errors.push(ValidationError::new(
            "encryption_key_env",
            "Encryption key variable name cannot be empty",
        ));
    }

    if config.refresh_margin_secs == 0 {
        errors.push(ValidationError::new(
            "refresh_margin_secs",
            "Refresh margin must be greater than 0",
        ));
    }

    for entity_type in EntityType::ALL {
        let types = config.work_item_types_for(entity_type);
        if types.iter().all(|t| t.trim().is_empty()) {
            errors.push(
                ValidationError::new("work_item_types", "At least one work-item type is required")
                    .with_context(entity_type.as_str()),
            );
        }
    }

    let mut seen = HashSet::new();
    for mapping in &config.default_mappings {
        let context = format!("{}:{}", mapping.entity_type, mapping.external_field);
        if !seen.insert((mapping.entity_type, mapping.external_field.as_str())) {
            errors.push(
                ValidationError::new("default_mappings", "Duplicate external field")
                    .with_context(&context),
            );
        }
        if let Err(e) = mapping.validate() {
            errors.push(ValidationError::new("default_mappings", e.to_string()).with_context(&context));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

/// Validate configuration and return a Result
pub fn validate_config_result(config: &SyncConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        SyncError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}
