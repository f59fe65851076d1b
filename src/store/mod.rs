//! Persistence layer
//!
//! SQLite-backed storage for connections, field mappings, cross-references,
//! sync jobs and the internal workstream/risk/action tables.

pub mod models;
mod sqlite;

pub use models::{
    ApplyOutcome, Connection, ConnectionSummary, EntityFields, EntityRecord, EntityType,
    FieldMapping, JobStatus, JobType, MappingDirection, MappingType, NewConnection, SyncJob,
    SyncMapping, SyncResult,
};
pub use sqlite::Store;
