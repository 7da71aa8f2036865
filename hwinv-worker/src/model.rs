//! Registry records and the per-(resource, worker) task.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Opaque, worker-owned memory carried between `process` invocations.
pub type StateDetails = Map<String, Value>;

/// A managed physical or virtual asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: i64,
    pub uuid: Uuid,
    /// Selects which workers apply.
    pub resource_type: String,
    pub name: String,
    /// Desired-state payload.
    pub properties: Map<String, Value>,
    pub deleted: bool,
    pub suspended: bool,
    /// Bumped on every property, window or deletion change.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// Look up a string property.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

/// Input for registering a new resource.
#[derive(Debug, Clone)]
pub struct NewResource {
    pub uuid: Uuid,
    pub resource_type: String,
    pub name: String,
    pub properties: Map<String, Value>,
}

impl NewResource {
    pub fn new(resource_type: &str, name: &str, properties: Map<String, Value>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            properties,
        }
    }
}

/// A desired time range during which a resource should be reservable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationWindow {
    pub uuid: Uuid,
    pub resource_uuid: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReservationWindow {
    pub fn new(resource_uuid: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            resource_uuid,
            start,
            end,
        }
    }
}

/// Convergence state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    InProgress,
    Steady,
    Error,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::InProgress => "IN_PROGRESS",
            TaskState::Steady => "STEADY",
            TaskState::Error => "ERROR",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskState::Pending),
            "IN_PROGRESS" => Ok(TaskState::InProgress),
            "STEADY" => Ok(TaskState::Steady),
            "ERROR" => Ok(TaskState::Error),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Persisted convergence state for one (resource, worker) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub resource_id: i64,
    pub worker_name: String,
    pub state: TaskState,
    /// Owned by the worker; the manager only merges and passes it through.
    pub state_details: StateDetails,
    pub last_error: Option<String>,
    pub defer_reason: Option<String>,
    pub defer_count: u32,
    /// Resource revision the last attempt ran against.
    pub observed_revision: i64,
    pub next_check_at: Option<DateTime<Utc>>,
    /// Compare-and-set token.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Merge a worker payload into `state_details`.
    ///
    /// Keys are overwritten; a `null` value removes the key.
    pub fn merge_details(&mut self, payload: StateDetails) {
        merge_details(&mut self.state_details, payload);
    }
}

pub fn merge_details(details: &mut StateDetails, payload: StateDetails) {
    for (key, value) in payload {
        if value.is_null() {
            details.remove(&key);
        } else {
            details.insert(key, value);
        }
    }
}

/// Timestamp encoding used at rest. Fixed width so text comparison orders correctly.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}
