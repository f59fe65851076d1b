//! Wiring of the store, vault, tracker client and orchestrator

use crate::config::{validate_config_result, Secrets, SyncConfig};
use crate::devops::retry::RetryPolicy;
use crate::devops::{DevOpsClient, WorkItemTracker};
use crate::server::SyncServer;
use crate::store::Store;
use crate::sync::SyncOrchestrator;
use crate::vault::CredentialVault;
use crate::Result;
use std::sync::Arc;

/// Fully assembled sync engine
pub struct App {
    pub config: SyncConfig,
    pub store: Arc<Store>,
    pub vault: Arc<CredentialVault>,
    pub tracker: Arc<dyn WorkItemTracker>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl App {
    /// Open the configured database and build every component
    pub fn build(config: SyncConfig, secrets: &Secrets) -> Result<Self> {
        let store = Arc::new(Store::open(&config.database)?);
        Self::with_store(config, secrets, store)
    }

    /// Build on an already opened store
    pub fn with_store(config: SyncConfig, secrets: &Secrets, store: Arc<Store>) -> Result<Self> {
        validate_config_result(&config)?;

        let vault = Arc::new(CredentialVault::from_config(
            &config,
            secrets,
            Arc::clone(&store),
        )?);
        let retry = RetryPolicy::from_settings(
            config.retry.max_retries,
            config.retry.initial_backoff_ms,
        );
        let tracker: Arc<dyn WorkItemTracker> = Arc::new(
            DevOpsClient::new(Arc::clone(&vault), config.api_version.clone())?.with_retry(retry),
        );
        let orchestrator = Arc::new(SyncOrchestrator::from_config(
            &config,
            Arc::clone(&store),
            Arc::clone(&tracker),
        ));

        tracing::debug!(database = ?store.path(), "Sync engine assembled");

        Ok(Self {
            config,
            store,
            vault,
            tracker,
            orchestrator,
        })
    }

    pub fn server(&self) -> SyncServer {
        SyncServer::new(Arc::clone(&self.vault), Arc::clone(&self.orchestrator))
    }
}
