//! Named field transforms
//!
//! A closed set of pure value conversions between tracker field values and
//! internal field values. Each kind knows its own forward and reverse
//! direction; kinds without a safe reverse report it through
//! [`Transform::is_reversible`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Transform applied by a `transform` field mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    /// Workflow state -> workstream status
    StateToStatus,
    /// Workflow state -> risk status
    StateToRiskStatus,
    /// Workflow state -> action status
    StateToActionStatus,
    /// Ordinal 1/2/3 <-> LOW/MEDIUM/HIGH
    SeverityMapping,
    /// Identity object -> display name (forward only)
    ExtractDisplayName,
}

/// Coarse position of a workflow state in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateBucket {
    Initial,
    Active,
    Terminal,
}

/// Internal status names for one entity type, by bucket
struct StatusSet {
    initial: &'static str,
    active: &'static str,
    terminal: &'static str,
}

const WORKSTREAM_STATUSES: StatusSet = StatusSet {
    initial: "NOT_STARTED",
    active: "IN_PROGRESS",
    terminal: "COMPLETED",
};

const RISK_STATUSES: StatusSet = StatusSet {
    initial: "OPEN",
    active: "MITIGATING",
    terminal: "CLOSED",
};

const ACTION_STATUSES: StatusSet = StatusSet {
    initial: "OPEN",
    active: "IN_PROGRESS",
    terminal: "DONE",
};

/// Tracker states written back for each bucket
const EXTERNAL_INITIAL_STATE: &str = "New";
const EXTERNAL_ACTIVE_STATE: &str = "Active";
const EXTERNAL_TERMINAL_STATE: &str = "Closed";

const SEVERITIES: [&str; 3] = ["LOW", "MEDIUM", "HIGH"];

impl Transform {
    pub const ALL: [Transform; 5] = [
        Transform::StateToStatus,
        Transform::StateToRiskStatus,
        Transform::StateToActionStatus,
        Transform::SeverityMapping,
        Transform::ExtractDisplayName,
    ];

    /// Stable name used in configuration and transform specs
    pub fn name(&self) -> &'static str {
        match self {
            Transform::StateToStatus => "state_to_status",
            Transform::StateToRiskStatus => "state_to_risk_status",
            Transform::StateToActionStatus => "state_to_action_status",
            Transform::SeverityMapping => "severity_mapping",
            Transform::ExtractDisplayName => "extract_display_name",
        }
    }

    /// Whether internal values can be converted back into tracker values
    pub fn is_reversible(&self) -> bool {
        !matches!(self, Transform::ExtractDisplayName)
    }

    /// Whether `value` is a workflow state the tracker treats as finished
    pub fn is_terminal_state(&self, value: &Value) -> bool {
        match self {
            Transform::StateToStatus
            | Transform::StateToRiskStatus
            | Transform::StateToActionStatus => value
                .as_str()
                .map(|state| bucket_state(state) == StateBucket::Terminal)
                .unwrap_or(false),
            Transform::SeverityMapping | Transform::ExtractDisplayName => false,
        }
    }

    /// Tracker value -> internal value. `None` means the field is omitted.
    pub fn forward(&self, value: &Value) -> Option<Value> {
        match self {
            Transform::StateToStatus => state_to(value, &WORKSTREAM_STATUSES),
            Transform::StateToRiskStatus => state_to(value, &RISK_STATUSES),
            Transform::StateToActionStatus => state_to(value, &ACTION_STATUSES),
            Transform::SeverityMapping => {
                let ordinal = match value {
                    Value::Number(n) => n.as_i64()?,
                    // "2 - High" style picklist values
                    Value::String(s) => s.trim().chars().next()?.to_digit(10)? as i64,
                    _ => return None,
                };
                let index = usize::try_from(ordinal.checked_sub(1)?).ok()?;
                SEVERITIES.get(index).map(|s| Value::String(s.to_string()))
            }
            Transform::ExtractDisplayName => match value {
                Value::Object(identity) => identity
                    .get("displayName")
                    .and_then(Value::as_str)
                    .map(|name| Value::String(name.to_string())),
                Value::String(s) => Some(Value::String(strip_identity_suffix(s).to_string())),
                _ => None,
            },
        }
    }

    /// Internal value -> tracker value. `None` means nothing is written back.
    pub fn reverse(&self, value: &Value) -> Option<Value> {
        match self {
            Transform::StateToStatus => status_to_state(value, &WORKSTREAM_STATUSES),
            Transform::StateToRiskStatus => status_to_state(value, &RISK_STATUSES),
            Transform::StateToActionStatus => status_to_state(value, &ACTION_STATUSES),
            Transform::SeverityMapping => {
                let name = value.as_str()?.trim().to_ascii_uppercase();
                SEVERITIES
                    .iter()
                    .position(|s| *s == name)
                    .map(|index| Value::from(index as i64 + 1))
            }
            Transform::ExtractDisplayName => None,
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transform {
    type Err = crate::SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Transform::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| crate::SyncError::Validation(format!("Unknown transform: {}", s)))
    }
}

fn bucket_state(state: &str) -> StateBucket {
    let state = state.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| state.contains(*w));

    if has(&["closed", "done", "complete", "removed", "resolved"]) {
        StateBucket::Terminal
    } else if has(&["not started", "new", "proposed", "to do", "backlog"]) {
        StateBucket::Initial
    } else if has(&["active", "progress", "committed", "doing", "review", "started", "mitigat"]) {
        StateBucket::Active
    } else {
        StateBucket::Initial
    }
}

fn state_to(value: &Value, statuses: &StatusSet) -> Option<Value> {
    let status = match bucket_state(value.as_str()?) {
        StateBucket::Initial => statuses.initial,
        StateBucket::Active => statuses.active,
        StateBucket::Terminal => statuses.terminal,
    };
    Some(Value::String(status.to_string()))
}

fn status_to_state(value: &Value, statuses: &StatusSet) -> Option<Value> {
    let status = value.as_str()?.trim().to_ascii_uppercase();
    let state = if status == statuses.initial {
        EXTERNAL_INITIAL_STATE
    } else if status == statuses.active {
        EXTERNAL_ACTIVE_STATE
    } else if status == statuses.terminal {
        EXTERNAL_TERMINAL_STATE
    } else {
        return None;
    };
    Some(Value::String(state.to_string()))
}

/// "Jane Doe <jane@example.com>" -> "Jane Doe"
fn strip_identity_suffix(s: &str) -> &str {
    match s.find(" <") {
        Some(pos) if s.ends_with('>') => &s[..pos],
        _ => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_states() {
        let t = Transform::StateToRiskStatus;
        assert!(t.is_terminal_state(&json!("Closed")));
        assert!(t.is_terminal_state(&json!("Resolved")));
        assert!(t.is_terminal_state(&json!("Removed")));
        assert!(!t.is_terminal_state(&json!("Active")));
        assert!(!t.is_terminal_state(&json!("Committed")));
        assert!(!t.is_terminal_state(&json!(3)));
        assert!(!Transform::SeverityMapping.is_terminal_state(&json!("Closed")));
    }

    #[test]
    fn test_severity_round_trip() {
        for (ordinal, name) in [(1, "LOW"), (2, "MEDIUM"), (3, "HIGH")] {
            let forward = Transform::SeverityMapping.forward(&json!(ordinal)).unwrap();
            assert_eq!(forward, json!(name));
            let back = Transform::SeverityMapping.reverse(&forward).unwrap();
            assert_eq!(back, json!(ordinal));
        }
    }

    #[test]
    fn test_severity_picklist_strings() {
        assert_eq!(
            Transform::SeverityMapping.forward(&json!("3 - High")),
            Some(json!("HIGH"))
        );
        assert_eq!(Transform::SeverityMapping.forward(&json!(0)), None);
        assert_eq!(Transform::SeverityMapping.forward(&json!(4)), None);
        assert_eq!(Transform::SeverityMapping.forward(&json!("n/a")), None);
        assert_eq!(Transform::SeverityMapping.reverse(&json!("urgent")), None);
    }

    #[test]
    fn test_state_bucketing() {
        let t = Transform::StateToStatus;
        assert_eq!(t.forward(&json!("New")), Some(json!("NOT_STARTED")));
        assert_eq!(t.forward(&json!("Proposed")), Some(json!("NOT_STARTED")));
        assert_eq!(t.forward(&json!("Not Started")), Some(json!("NOT_STARTED")));
        assert_eq!(t.forward(&json!("Active")), Some(json!("IN_PROGRESS")));
        assert_eq!(t.forward(&json!("In Progress")), Some(json!("IN_PROGRESS")));
        assert_eq!(t.forward(&json!("Resolved")), Some(json!("COMPLETED")));
        assert_eq!(t.forward(&json!("Closed")), Some(json!("COMPLETED")));

        assert_eq!(
            Transform::StateToRiskStatus.forward(&json!("Committed")),
            Some(json!("MITIGATING"))
        );
        assert_eq!(
            Transform::StateToActionStatus.forward(&json!("Done")),
            Some(json!("DONE"))
        );
        assert_eq!(t.forward(&json!(42)), None);
    }

    #[test]
    fn test_status_reverse() {
        assert_eq!(
            Transform::StateToStatus.reverse(&json!("COMPLETED")),
            Some(json!("Closed"))
        );
        assert_eq!(
            Transform::StateToRiskStatus.reverse(&json!("open")),
            Some(json!("New"))
        );
        assert_eq!(
            Transform::StateToActionStatus.reverse(&json!("IN_PROGRESS")),
            Some(json!("Active"))
        );
        assert_eq!(Transform::StateToActionStatus.reverse(&json!("BLOCKED")), None);
    }

    #[test]
    fn test_extract_display_name_is_forward_only() {
        let identity = json!({
            "displayName": "Jane Doe",
            "uniqueName": "jane@example.com"
        });
        let t = Transform::ExtractDisplayName;
        assert_eq!(t.forward(&identity), Some(json!("Jane Doe")));
        assert_eq!(
            t.forward(&json!("Jane Doe <jane@example.com>")),
            Some(json!("Jane Doe"))
        );
        assert!(!t.is_reversible());
        assert_eq!(t.reverse(&json!("Jane Doe")), None);
    }

    #[test]
    fn test_transforms_are_deterministic() {
        let input = json!("In Review");
        for t in Transform::ALL {
            assert_eq!(t.forward(&input), t.forward(&input));
        }
    }

    #[test]
    fn test_serde_tagging() {
        let json = serde_json::to_string(&Transform::SeverityMapping).unwrap();
        assert_eq!(json, r#"{"type":"severity_mapping"}"#);
        let parsed: Transform = serde_json::from_str(r#"{"type":"state_to_status"}"#).unwrap();
        assert_eq!(parsed, Transform::StateToStatus);
        assert_eq!(
            "extract_display_name".parse::<Transform>().unwrap(),
            Transform::ExtractDisplayName
        );
        assert!("eval".parse::<Transform>().is_err());
    }
}
