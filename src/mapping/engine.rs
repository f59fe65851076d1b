//! Field mapping engine
//!
//! Converts tracker work items into partial internal entities and internal
//! entities into JSON-patch operations, driven by a connection's field
//! mappings.

use super::Transform;
use crate::devops::{PatchOperation, WorkItem};
use crate::store::{EntityFields, EntityType, FieldMapping, MappingType, Store};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Loads and seeds per-connection field mappings
pub struct MappingEngine {
    store: Arc<Store>,
    defaults: Vec<FieldMapping>,
}

impl MappingEngine {
    pub fn new(store: Arc<Store>, defaults: Vec<FieldMapping>) -> Self {
        Self { store, defaults }
    }

    pub async fn get_mappings(&self, connection_id: i64) -> Result<Vec<FieldMapping>> {
        self.store.field_mappings(connection_id).await
    }

    /// Install the default mapping set if the connection has none
    ///
    /// Returns how many mappings were inserted.
    pub async fn ensure_default_mappings(&self, connection_id: i64) -> Result<usize> {
        let inserted = self
            .store
            .insert_default_mappings(connection_id, &self.defaults)
            .await?;
        if inserted > 0 {
            info!(connection_id, inserted, "Seeded default field mappings");
        }
        Ok(inserted)
    }

    /// Upsert admin-edited mappings, returning the connection's full set
    pub async fn save_mappings(
        &self,
        connection_id: i64,
        mappings: &[FieldMapping],
    ) -> Result<Vec<FieldMapping>> {
        for mapping in mappings {
            let mut mapping = mapping.clone();
            mapping.connection_id = connection_id;
            self.store.upsert_field_mapping(&mapping).await?;
        }
        debug!(connection_id, count = mappings.len(), "Saved field mappings");
        self.get_mappings(connection_id).await
    }
}

/// Tracker item -> partial internal entity
///
/// Only mapped fields that are present (and survive their transform) appear
/// in the result; callers merge it into existing records.
pub fn map_external_to_internal(
    item: &WorkItem,
    entity_type: EntityType,
    mappings: &[FieldMapping],
) -> EntityFields {
    let mut fields = EntityFields::new();

    for mapping in mappings.iter().filter(|m| m.entity_type == entity_type) {
        let Some(value) = item.field(&mapping.external_field) else {
            continue;
        };
        if let Some(mapped) = forward(mapping, value) {
            fields.insert(mapping.internal_field.clone(), mapped);
        }
    }

    fields
}

/// Changes still worth sending for a paired item, given its current fields
///
/// An operation is dropped when the item's current value already means the
/// same internal value, so lossy reverse transforms never rewrite the tracker
/// (`Resolved` stays `Resolved`). A workflow state the tracker has finished is
/// never reopened: that operation is dropped and the finished status is
/// returned as internal fields to merge back into the entity.
pub fn outbound_changes(
    item: &WorkItem,
    ops: Vec<PatchOperation>,
    entity_type: EntityType,
    mappings: &[FieldMapping],
) -> (Vec<PatchOperation>, EntityFields) {
    let mut pending = Vec::with_capacity(ops.len());
    let mut pulled = EntityFields::new();

    for op in ops {
        let Some(name) = op.field_name() else {
            pending.push(op);
            continue;
        };
        let mapping = mappings.iter().find(|m| {
            m.entity_type == entity_type && m.direction.is_outbound() && m.external_field == name
        });
        let (Some(mapping), Some(current)) = (mapping, item.field(name)) else {
            pending.push(op);
            continue;
        };

        let current_internal = forward(mapping, current);
        if *current == op.value
            || (current_internal.is_some() && current_internal == forward(mapping, &op.value))
        {
            continue;
        }

        let finished = mapping
            .transform
            .map(|t| t.is_terminal_state(current))
            .unwrap_or(false);
        if finished {
            if let Some(status) = current_internal {
                pulled.insert(mapping.internal_field.clone(), status);
            }
            continue;
        }

        pending.push(op);
    }

    (pending, pulled)
}

fn forward(mapping: &FieldMapping, value: &Value) -> Option<Value> {
    match (mapping.mapping_type, mapping.transform) {
        (MappingType::Transform, Some(transform)) => transform.forward(value),
        (MappingType::Transform, None) => None,
        (MappingType::Direct | MappingType::Custom, _) => Some(value.clone()),
    }
}

/// Internal entity -> replace operations against tracker fields
///
/// Inbound-only mappings are skipped, as are null values and values with no
/// reverse transform.
pub fn map_internal_to_external(
    entity: &EntityFields,
    entity_type: EntityType,
    mappings: &[FieldMapping],
) -> Vec<PatchOperation> {
    mappings
        .iter()
        .filter(|m| m.entity_type == entity_type && m.direction.is_outbound())
        .filter_map(|mapping| {
            let value = entity
                .get(&mapping.internal_field)
                .filter(|v| !v.is_null())?;
            let mapped = match (mapping.mapping_type, mapping.transform) {
                (MappingType::Transform, Some(transform)) => reverse(transform, value)?,
                (MappingType::Transform, None) => return None,
                (MappingType::Direct | MappingType::Custom, _) => value.clone(),
            };
            Some(PatchOperation::replace_field(&mapping.external_field, mapped))
        })
        .collect()
}

fn reverse(transform: Transform, value: &Value) -> Option<Value> {
    if !transform.is_reversible() {
        return None;
    }
    transform.reverse(value)
}
