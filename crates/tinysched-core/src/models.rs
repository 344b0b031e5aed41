use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

/// On-disk record asserting ownership of a task by a local supervisor
/// process. One file per in-flight task, named `task_<task_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub task_id: String,
    pub agent: String,
    pub pid: u32,
    pub recipe: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub heartbeat: OffsetDateTime,
    pub host: String,
    pub state: LeaseState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Transient view of a task as returned by the task service. Never persisted
/// locally. Fields absent in the remote JSON fall back to defaults; ids may
/// arrive as JSON strings or numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(deserialize_with = "id_from_repr")]
    pub id: String,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub queue_name: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub recipe: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, deserialize_with = "opt_id_from_repr")]
    pub blocked_by_task_id: Option<String>,
    #[serde(default)]
    pub is_currently_blocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Working,
    Complete,
}

/// Lifecycle transition reported back to the task service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateUpdate {
    Idle,
    Working,
    Completed,
    Failed,
}

impl StateUpdate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StateUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Num(i64),
}

impl From<IdRepr> for String {
    fn from(repr: IdRepr) -> Self {
        match repr {
            IdRepr::Text(s) => s,
            IdRepr::Num(n) => n.to_string(),
        }
    }
}

fn id_from_repr<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    IdRepr::deserialize(deserializer).map(String::from)
}

fn opt_id_from_repr<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<IdRepr>::deserialize(deserializer)?.map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample_lease() -> Lease {
        Lease {
            task_id: "1234".to_string(),
            agent: "architect".to_string(),
            pid: 48291,
            recipe: "architect.yaml".to_string(),
            started_at: datetime!(2025-01-28 14:32:11 UTC),
            heartbeat: datetime!(2025-01-28 14:34:02 UTC),
            host: "example-01".to_string(),
            state: LeaseState::Running,
        }
    }

    #[test]
    fn test_lease_roundtrip() {
        let lease = sample_lease();
        let json = serde_json::to_string(&lease).unwrap();
        let parsed: Lease = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, lease);
    }

    #[test]
    fn test_lease_timestamps_are_rfc3339() {
        let json = serde_json::to_string(&sample_lease()).unwrap();
        assert!(json.contains("2025-01-28T14:32:11Z"));
        assert!(json.contains("\"state\": \"running\"") || json.contains("\"state\":\"running\""));
    }

    #[test]
    fn test_task_defaults() {
        let task: Task = serde_json::from_str(r#"{"id":"101","status":"idle"}"#).unwrap();
        assert_eq!(task.id, "101");
        assert_eq!(task.priority, 0);
        assert!(!task.is_currently_blocked);
        assert_eq!(task.blocked_by_task_id, None);
        assert_eq!(task.recipe, None);
    }

    #[test]
    fn test_task_numeric_ids() {
        let task: Task = serde_json::from_str(
            r#"{"id":101,"status":"idle","blocked_by_task_id":77,"priority":5}"#,
        )
        .unwrap();
        assert_eq!(task.id, "101");
        assert_eq!(task.blocked_by_task_id.as_deref(), Some("77"));
        assert_eq!(task.priority, 5);
    }

    #[test]
    fn test_task_explicit_null_blocker() {
        let task: Task =
            serde_json::from_str(r#"{"id":"101","status":"idle","blocked_by_task_id":null}"#)
                .unwrap();
        assert_eq!(task.blocked_by_task_id, None);
    }

    #[test]
    fn test_state_update_wire_names() {
        assert_eq!(
            serde_json::to_string(&StateUpdate::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(StateUpdate::Idle.to_string(), "idle");
    }
}
