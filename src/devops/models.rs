//! Work-item REST payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const TITLE_FIELD: &str = "System.Title";
pub const STATE_FIELD: &str = "System.State";
pub const WORK_ITEM_TYPE_FIELD: &str = "System.WorkItemType";
pub const CHANGED_DATE_FIELD: &str = "System.ChangedDate";

/// Fields the tracker refuses on creation; applied as a follow-up patch
const DEFERRED_CREATE_FIELDS: [&str; 1] = [STATE_FIELD];

/// A tracker work item (or one revision of it)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub rev: i64,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl WorkItem {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn work_item_type(&self) -> Option<&str> {
        self.field(WORK_ITEM_TYPE_FIELD).and_then(Value::as_str)
    }

    pub fn changed_date(&self) -> Option<DateTime<Utc>> {
        self.field(CHANGED_DATE_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// `{"count": n, "value": [...]}` envelope used by list endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default)]
    pub count: usize,
    pub value: Vec<T>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WiqlRequest<'a> {
    pub query: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WiqlResponse {
    #[serde(rename = "workItems", default)]
    pub work_items: Vec<WorkItemReference>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WorkItemReference {
    pub id: i64,
}

/// JSON-patch operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
}

/// One JSON-patch operation against a work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl PatchOperation {
    pub fn add_field(name: &str, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path: field_path(name),
            value,
        }
    }

    pub fn replace_field(name: &str, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path: field_path(name),
            value,
        }
    }

    /// Field name for `/fields/<name>` paths
    pub fn field_name(&self) -> Option<&str> {
        self.path.strip_prefix("/fields/")
    }
}

fn field_path(name: &str) -> String {
    format!("/fields/{}", name)
}

/// Split tracker fields into the creation patch and the remaining follow-up patch
///
/// The creation list starts with the title and carries every other non-null
/// field except those the tracker rejects on creation (the workflow state).
pub fn split_creation_fields(
    fields: &Map<String, Value>,
) -> (Vec<PatchOperation>, Vec<PatchOperation>) {
    let mut create = Vec::with_capacity(fields.len());
    let mut remaining = Vec::new();

    if let Some(title) = fields.get(TITLE_FIELD).filter(|v| !v.is_null()) {
        create.push(PatchOperation::add_field(TITLE_FIELD, title.clone()));
    }

    for (name, value) in fields {
        if name == TITLE_FIELD || value.is_null() {
            continue;
        }
        if DEFERRED_CREATE_FIELDS.contains(&name.as_str()) {
            remaining.push(PatchOperation::replace_field(name, value.clone()));
        } else {
            create.push(PatchOperation::add_field(name, value.clone()));
        }
    }

    (create, remaining)
}

/// Collapse `/fields/*` operations back into a field map
pub fn fields_from_ops(ops: &[PatchOperation]) -> Map<String, Value> {
    ops.iter()
        .filter_map(|op| op.field_name().map(|name| (name.to_string(), op.value.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_creation_fields_title_first_state_deferred() {
        let fields = json!({
            "Microsoft.VSTS.Common.Severity": 2,
            "System.State": "Active",
            "System.Description": null,
            "System.Title": "Vendor slip",
        });
        let (create, remaining) = split_creation_fields(fields.as_object().unwrap());

        assert_eq!(create[0], PatchOperation::add_field(TITLE_FIELD, json!("Vendor slip")));
        assert_eq!(create.len(), 2);
        assert!(create.iter().all(|op| op.op == PatchOp::Add));
        assert!(!create.iter().any(|op| op.field_name() == Some(STATE_FIELD)));
        assert_eq!(
            remaining,
            vec![PatchOperation::replace_field(STATE_FIELD, json!("Active"))]
        );
    }

    #[test]
    fn test_patch_serialization() {
        let op = PatchOperation::replace_field("System.Title", json!("x"));
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"op": "replace", "path": "/fields/System.Title", "value": "x"})
        );
        let add = serde_json::to_value(PatchOperation::add_field("System.State", json!("New"))).unwrap();
        assert_eq!(add, json!({"op": "add", "path": "/fields/System.State", "value": "New"}));
    }

    #[test]
    fn test_work_item_accessors() {
        let item: WorkItem = serde_json::from_value(json!({
            "id": 12,
            "rev": 3,
            "fields": {
                "System.WorkItemType": "Risk",
                "System.ChangedDate": "2026-03-01T10:00:00.123Z",
                "System.Description": null
            }
        }))
        .unwrap();
        assert_eq!(item.work_item_type(), Some("Risk"));
        assert!(item.changed_date().is_some());
        assert!(item.field("System.Description").is_none());
    }

    #[test]
    fn test_fields_from_ops() {
        let ops = vec![
            PatchOperation::replace_field("System.Title", json!("A")),
            PatchOperation::add_field("System.State", json!("New")),
        ];
        let fields = fields_from_ops(&ops);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["System.State"], json!("New"));
    }
}
