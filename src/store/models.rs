//! Persisted records
//!
//! Connection, FieldMapping, SyncMapping and SyncJob rows plus the enums
//! stored in their text columns.

use crate::mapping::Transform;
use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Internal entity fields keyed by column name
pub type EntityFields = Map<String, Value>;

/// Tracked domain object mirrored to/from the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Workstream,
    Risk,
    Action,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Workstream, EntityType::Risk, EntityType::Action];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Workstream => "workstream",
            EntityType::Risk => "risk",
            EntityType::Action => "action",
        }
    }

    /// Backing table for this entity type
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Workstream => "workstreams",
            EntityType::Risk => "risks",
            EntityType::Action => "actions",
        }
    }

    /// Writable columns, title column first
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            EntityType::Workstream => &["name", "status", "owner", "progress", "notes", "due_date"],
            EntityType::Risk => &[
                "title",
                "status",
                "severity",
                "owner",
                "description",
                "due_date",
            ],
            EntityType::Action => &[
                "title",
                "status",
                "owner",
                "progress",
                "description",
                "due_date",
            ],
        }
    }

    /// Column holding the human-readable title
    pub fn title_column(&self) -> &'static str {
        self.columns()[0]
    }

    /// Only workstreams carry a soft-delete marker
    pub fn soft_deletes(&self) -> bool {
        matches!(self, EntityType::Workstream)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "workstream" => Ok(EntityType::Workstream),
            "risk" => Ok(EntityType::Risk),
            "action" => Ok(EntityType::Action),
            other => Err(SyncError::Validation(format!("Unknown entity type: {}", other))),
        }
    }
}

/// How a field mapping converts values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    /// Copy the value unchanged
    Direct,
    /// Apply a named [`Transform`]
    Transform,
    /// Admin-defined; the spec is kept for the UI and the value is copied
    Custom,
}

impl MappingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingType::Direct => "direct",
            MappingType::Transform => "transform",
            MappingType::Custom => "custom",
        }
    }
}

impl FromStr for MappingType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(MappingType::Direct),
            "transform" => Ok(MappingType::Transform),
            "custom" => Ok(MappingType::Custom),
            other => Err(SyncError::Validation(format!("Unknown mapping type: {}", other))),
        }
    }
}

/// Which sync directions a field mapping participates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingDirection {
    #[default]
    Bidirectional,
    /// Tracker -> internal only; never written back
    InboundOnly,
}

impl MappingDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingDirection::Bidirectional => "bidirectional",
            MappingDirection::InboundOnly => "inbound_only",
        }
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self, MappingDirection::Bidirectional)
    }
}

impl FromStr for MappingDirection {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bidirectional" => Ok(MappingDirection::Bidirectional),
            "inbound_only" => Ok(MappingDirection::InboundOnly),
            other => Err(SyncError::Validation(format!("Unknown direction: {}", other))),
        }
    }
}

/// A tenant's authorized link to one tracker project
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: i64,
    pub tenant_id: String,
    pub org_url: String,
    pub project: String,
    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,
    pub token_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a connection
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub tenant_id: String,
    pub org_url: String,
    pub project: String,
    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,
    pub token_expires_at: DateTime<Utc>,
}

/// Connection without token material, for listings
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: i64,
    pub tenant_id: String,
    pub org_url: String,
    pub project: String,
    pub token_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Connection> for ConnectionSummary {
    fn from(c: &Connection) -> Self {
        Self {
            id: c.id,
            tenant_id: c.tenant_id.clone(),
            org_url: c.org_url.clone(),
            project: c.project.clone(),
            token_expires_at: c.token_expires_at,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

/// Declarative rule converting one tracker field to/from one internal field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub connection_id: i64,
    pub entity_type: EntityType,
    pub external_field: String,
    pub internal_field: String,
    pub mapping_type: MappingType,
    /// Set exactly when `mapping_type` is `Transform`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    /// Opaque spec carried by `Custom` mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_spec: Option<String>,
    #[serde(default)]
    pub direction: MappingDirection,
}

impl FieldMapping {
    pub fn direct(
        entity_type: EntityType,
        external_field: impl Into<String>,
        internal_field: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            connection_id: 0,
            entity_type,
            external_field: external_field.into(),
            internal_field: internal_field.into(),
            mapping_type: MappingType::Direct,
            transform: None,
            custom_spec: None,
            direction: MappingDirection::Bidirectional,
        }
    }

    pub fn transformed(
        entity_type: EntityType,
        external_field: impl Into<String>,
        internal_field: impl Into<String>,
        transform: Transform,
    ) -> Self {
        let direction = if transform.is_reversible() {
            MappingDirection::Bidirectional
        } else {
            MappingDirection::InboundOnly
        };
        Self {
            mapping_type: MappingType::Transform,
            transform: Some(transform),
            direction,
            ..Self::direct(entity_type, external_field, internal_field)
        }
    }

    pub fn with_direction(mut self, direction: MappingDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Check the mapping's shape before it is stored
    pub fn validate(&self) -> Result<()> {
        if self.external_field.trim().is_empty() || self.internal_field.trim().is_empty() {
            return Err(SyncError::Validation(
                "Field mapping requires both external and internal field names".to_string(),
            ));
        }
        if !self.entity_type.columns().contains(&self.internal_field.as_str()) {
            return Err(SyncError::Validation(format!(
                "'{}' is not a {} field",
                self.internal_field, self.entity_type
            )));
        }
        match (self.mapping_type, self.transform) {
            (MappingType::Transform, None) => Err(SyncError::Validation(format!(
                "Mapping for {} has type 'transform' but no transform",
                self.external_field
            ))),
            (MappingType::Direct | MappingType::Custom, Some(t)) => {
                Err(SyncError::Validation(format!(
                    "Mapping for {} carries transform '{}' but has type '{}'",
                    self.external_field,
                    t,
                    self.mapping_type.as_str()
                )))
            }
            (_, Some(t)) if !t.is_reversible() && self.direction.is_outbound() => {
                Err(SyncError::Validation(format!(
                    "Transform '{}' has no reverse; mapping for {} must be inbound_only",
                    t, self.external_field
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Persistent pairing between one internal entity and one tracker item
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMapping {
    pub id: i64,
    pub connection_id: i64,
    pub entity_type: EntityType,
    pub internal_entity_id: i64,
    pub external_item_id: i64,
    pub external_item_type: String,
    pub last_synced_at: DateTime<Utc>,
}

/// Kind of sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FullSync,
    IncrementalSync,
    ManualSync,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullSync => "full_sync",
            JobType::IncrementalSync => "incremental_sync",
            JobType::ManualSync => "manual_sync",
        }
    }
}

impl FromStr for JobType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full_sync" | "full" => Ok(JobType::FullSync),
            "incremental_sync" | "incremental" => Ok(JobType::IncrementalSync),
            "manual_sync" | "manual" => Ok(JobType::ManualSync),
            other => Err(SyncError::Validation(format!("Unknown job type: {}", other))),
        }
    }
}

/// Sync job lifecycle: pending -> running -> completed | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl FromStr for JobStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(SyncError::Validation(format!("Unknown job status: {}", other))),
        }
    }
}

/// One execution of the reconciliation process
#[derive(Debug, Clone, Serialize)]
pub struct SyncJob {
    pub id: i64,
    pub connection_id: i64,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items_synced: u32,
    pub errors: Vec<String>,
}

/// Aggregated outcome of reconciling one or more entity types
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub items_synced: u32,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Sum item counts and concatenate errors
    pub fn merge(&mut self, other: SyncResult) {
        self.items_synced += other.items_synced;
        self.errors.extend(other.errors);
    }
}

/// An internal workstream, risk or action
#[derive(Debug, Clone, Serialize)]
pub struct EntityRecord {
    pub id: i64,
    pub tenant_id: String,
    pub entity_type: EntityType,
    pub fields: EntityFields,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of applying a tracker item to the internal store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created(i64),
    Updated(i64),
}

impl ApplyOutcome {
    pub fn entity_id(&self) -> i64 {
        match self {
            ApplyOutcome::Created(id) | ApplyOutcome::Updated(id) => *id,
        }
    }
}
