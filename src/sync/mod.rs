//! Sync orchestrator
//!
//! Drives sync jobs through `pending -> running -> completed | failed`,
//! reconciling workstreams, risks and actions against the tracker.

mod orchestrator;

pub use orchestrator::{inbound_query, SyncDirection, SyncOrchestrator};
