//! trackersync - Bidirectional sync between an internal status tracker and
//! Azure DevOps work items
//!
//! Workstreams, risks and actions kept in a local SQLite store are mirrored
//! to and from tracker work items. Each tracker organization/project pair is a
//! *connection* whose OAuth tokens are encrypted at rest and refreshed on
//! demand.
//!
//! # Architecture
//!
//! - **vault**: OAuth authorize flow, token encryption and refresh
//! - **devops**: Work-item REST client (query, batch fetch, create, patch, revisions)
//! - **mapping**: Declarative field mappings and value transforms
//! - **sync**: Job lifecycle and per-entity-type reconciliation
//! - **store**: SQLite persistence for connections, mappings, jobs and entities
//! - **server**: HTTP API over the above
//! - **config**: YAML configuration and secret resolution

pub mod app;
pub mod config;
pub mod devops;
pub mod error;
pub mod logging;
pub mod mapping;
pub mod server;
pub mod store;
pub mod sync;
pub mod vault;

pub use error::{Result, SyncError};
