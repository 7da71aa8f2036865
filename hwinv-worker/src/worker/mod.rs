//! Workers converge one external service's view of a resource.
//!
//! A worker is registered under a unique name, applies to one or more
//! resource types and declares the properties it consumes. The manager
//! calls [`Worker::process`] whenever the (resource, worker) task is due and
//! interprets the returned [`WorkerResult`].

pub mod fleet;
pub mod patch;
pub mod provisioning;
pub mod reservation;
pub mod tunnel;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{ReservationWindow, Resource, StateDetails};
use crate::store::Registry;

/// Placeholder shown instead of sensitive property values.
pub const MASKED_VALUE: &str = "************";

/// Outcome of a convergence attempt.
///
/// Errors are the third, implicit outcome and are returned as `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResult {
    /// External state matches desired state.
    Success { payload: StateDetails },
    /// Blocked on a transient condition; retry soon.
    Defer { payload: StateDetails, reason: String },
}

impl WorkerResult {
    pub fn success(payload: StateDetails) -> Self {
        WorkerResult::Success { payload }
    }

    pub fn defer(reason: impl Into<String>) -> Self {
        WorkerResult::Defer {
            payload: StateDetails::new(),
            reason: reason.into(),
        }
    }

    pub fn defer_with(payload: StateDetails, reason: impl Into<String>) -> Self {
        WorkerResult::Defer {
            payload,
            reason: reason.into(),
        }
    }

    pub fn payload(&self) -> &StateDetails {
        match self {
            WorkerResult::Success { payload } | WorkerResult::Defer { payload, .. } => payload,
        }
    }

    pub fn into_payload(self) -> StateDetails {
        match self {
            WorkerResult::Success { payload } | WorkerResult::Defer { payload, .. } => payload,
        }
    }

    pub fn is_defer(&self) -> bool {
        matches!(self, WorkerResult::Defer { .. })
    }

    pub fn defer_reason(&self) -> Option<&str> {
        match self {
            WorkerResult::Defer { reason, .. } => Some(reason),
            WorkerResult::Success { .. } => None,
        }
    }
}

/// Build a state-details payload from a JSON object literal.
pub fn payload(value: Value) -> StateDetails {
    match value {
        Value::Object(map) => map,
        _ => StateDetails::new(),
    }
}

/// Registration data for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    pub name: String,
    pub resource_types: Vec<String>,
    /// Whether `process` needs the resource's reservation windows.
    pub consumes_windows: bool,
}

/// Small typed schema for resource properties.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSchema {
    String,
    Number,
    Integer,
    Boolean,
    Uuid,
    /// TCP/UDP port number.
    Port,
    /// A hostname or an IP address.
    Host,
    Enum(Vec<&'static str>),
    Array {
        items: Box<FieldSchema>,
        min_items: usize,
    },
    Object {
        properties: Vec<(&'static str, FieldSchema)>,
        required: Vec<&'static str>,
        additional: bool,
    },
}

impl FieldSchema {
    pub fn array(items: FieldSchema) -> Self {
        FieldSchema::Array {
            items: Box::new(items),
            min_items: 0,
        }
    }

    /// A closed object: unknown keys are rejected.
    pub fn object(properties: Vec<(&'static str, FieldSchema)>, required: Vec<&'static str>) -> Self {
        FieldSchema::Object {
            properties,
            required,
            additional: false,
        }
    }

    /// Render as a JSON Schema fragment.
    pub fn to_json_schema(&self) -> Value {
        match self {
            FieldSchema::String => json!({"type": "string"}),
            FieldSchema::Number => json!({"type": "number"}),
            FieldSchema::Integer => json!({"type": "integer"}),
            FieldSchema::Boolean => json!({"type": "boolean"}),
            FieldSchema::Uuid => json!({"type": "string", "format": "uuid"}),
            FieldSchema::Port => json!({"type": "integer", "minimum": 1, "maximum": 65535}),
            FieldSchema::Host => json!({"oneOf": [
                {"type": "string", "format": "hostname"},
                {"type": "string", "format": "ipv4"},
                {"type": "string", "format": "ipv6"}
            ]}),
            FieldSchema::Enum(values) => json!({"type": "string", "enum": values}),
            FieldSchema::Array { items, min_items } => {
                let mut schema = json!({"type": "array", "items": items.to_json_schema()});
                if *min_items > 0 {
                    schema["minItems"] = json!(min_items);
                }
                schema
            }
            FieldSchema::Object {
                properties,
                required,
                additional,
            } => {
                let props: Map<String, Value> = properties
                    .iter()
                    .map(|(name, schema)| (name.to_string(), schema.to_json_schema()))
                    .collect();
                json!({
                    "type": "object",
                    "properties": props,
                    "required": required,
                    "additionalProperties": additional,
                })
            }
        }
    }

    /// Check `value` against the schema. The error is a human-readable reason
    /// that names the offending path below `path`.
    pub fn validate(&self, path: &str, value: &Value) -> std::result::Result<(), String> {
        match self {
            FieldSchema::String => expect(value.is_string(), path, "a string"),
            FieldSchema::Number => expect(value.is_number(), path, "a number"),
            FieldSchema::Integer => expect(value.is_i64() || value.is_u64(), path, "an integer"),
            FieldSchema::Boolean => expect(value.is_boolean(), path, "a boolean"),
            FieldSchema::Uuid => expect(
                value.as_str().is_some_and(|s| Uuid::parse_str(s).is_ok()),
                path,
                "a UUID",
            ),
            FieldSchema::Port => expect(
                value.as_u64().is_some_and(|p| (1..=65535).contains(&p)),
                path,
                "a port between 1 and 65535",
            ),
            FieldSchema::Host => expect(
                value.as_str().is_some_and(is_host_or_ip),
                path,
                "a hostname or IP address",
            ),
            FieldSchema::Enum(values) => match value.as_str() {
                Some(s) if values.contains(&s) => Ok(()),
                _ => Err(format!("{path} must be one of: {}", values.join(", "))),
            },
            FieldSchema::Array { items, min_items } => {
                let Some(array) = value.as_array() else {
                    return Err(format!("{path} must be an array"));
                };
                if array.len() < *min_items {
                    return Err(format!("{path} needs at least {min_items} item(s)"));
                }
                for (i, item) in array.iter().enumerate() {
                    items.validate(&format!("{path}[{i}]"), item)?;
                }
                Ok(())
            }
            FieldSchema::Object {
                properties,
                required,
                additional,
            } => {
                let Some(object) = value.as_object() else {
                    return Err(format!("{path} must be an object"));
                };
                for name in required {
                    if object.get(*name).is_none_or(Value::is_null) {
                        return Err(format!("{path}.{name} is required"));
                    }
                }
                for (key, item) in object {
                    // null means "unset" inside property objects
                    if item.is_null() {
                        continue;
                    }
                    match properties.iter().find(|(name, _)| *name == key.as_str()) {
                        Some((_, schema)) => schema.validate(&format!("{path}.{key}"), item)?,
                        None if *additional => {}
                        None => return Err(format!("{path}.{key} is not allowed")),
                    }
                }
                Ok(())
            }
        }
    }
}

fn expect(ok: bool, path: &str, what: &str) -> std::result::Result<(), String> {
    if ok {
        Ok(())
    } else {
        Err(format!("{path} must be {what}"))
    }
}

fn is_host_or_ip(s: &str) -> bool {
    if s.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }
    !s.is_empty()
        && s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// A resource property a worker supports or requires.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerField {
    pub name: &'static str,
    pub schema: FieldSchema,
    pub default: Option<Value>,
    pub required: bool,
    /// Hidden from unprivileged readers.
    pub private: bool,
    /// Masked whenever properties are displayed.
    pub sensitive: bool,
    pub description: &'static str,
}

impl WorkerField {
    pub fn new(name: &'static str, schema: FieldSchema) -> Self {
        Self {
            name,
            schema,
            default: None,
            required: false,
            private: false,
            sensitive: false,
            description: "",
        }
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }
}

/// A pre-existing external object discovered by [`Worker::import_existing`].
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedResource {
    /// `None` when the external object does not carry the resource identity.
    pub uuid: Option<Uuid>,
    pub name: Option<String>,
    pub properties: Map<String, Value>,
}

/// Per-invocation context handed to workers.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<dyn Registry>,
    /// Forwarded to external services as `X-Request-ID`.
    pub request_id: String,
}

impl WorkerContext {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            request_id: format!("req-{}", Uuid::new_v4()),
        }
    }
}

/// The capability set every integration implements.
#[async_trait]
pub trait Worker: Send + Sync {
    fn register_options(&self) -> WorkerOptions;

    fn fields(&self) -> Vec<WorkerField>;

    /// JSON Schema validating the properties this worker consumes.
    fn json_schema(&self) -> Value {
        let fields = self.fields();
        let properties: Map<String, Value> = fields
            .iter()
            .map(|f| (f.name.to_string(), f.schema.to_json_schema()))
            .collect();
        let required: Vec<&str> = fields.iter().filter(|f| f.required).map(|f| f.name).collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Converge external state for `resource`.
    ///
    /// Must be idempotent, and `state_details` is the only memory carried
    /// between invocations.
    async fn process(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
        windows: &[ReservationWindow],
        state_details: &StateDetails,
    ) -> Result<WorkerResult>;

    /// Upper bound on how long one `process` call can take, if the worker
    /// waits on the external service. The claim lease must outlast it.
    fn max_run_time(&self) -> Option<Duration> {
        None
    }

    /// Discover external objects that should be brought under management.
    fn import_existing<'a>(
        &'a self,
        _ctx: &'a WorkerContext,
    ) -> BoxStream<'a, Result<ImportedResource>> {
        Box::pin(futures::stream::empty())
    }
}

/// Workers available to this process, keyed by name.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) -> Result<()> {
        let name = worker.register_options().name;
        if self.workers.contains_key(&name) {
            return Err(Error::Configuration(format!(
                "worker '{name}' is registered twice"
            )));
        }
        self.workers.insert(name, worker);
        Ok(())
    }

    /// Keep only the named workers. An empty list keeps everything.
    pub fn retain_enabled(&mut self, enabled: &[String]) -> Result<()> {
        if enabled.is_empty() {
            return Ok(());
        }
        if let Some(unknown) = enabled.iter().find(|n| !self.workers.contains_key(*n)) {
            return Err(Error::Configuration(format!("unknown worker '{unknown}'")));
        }
        self.workers.retain(|name, _| enabled.contains(name));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Worker>)> {
        self.workers.iter()
    }

    /// Whether the named worker is enabled for `resource_type`.
    pub fn applies_to(&self, name: &str, resource_type: &str) -> bool {
        self.workers.get(name).is_some_and(|w| {
            w.register_options()
                .resource_types
                .iter()
                .any(|t| t == resource_type)
        })
    }

    /// Names of the enabled workers for `resource_type`, in name order.
    pub fn names_for(&self, resource_type: &str) -> Vec<String> {
        self.workers
            .keys()
            .filter(|name| self.applies_to(name, resource_type))
            .cloned()
            .collect()
    }

    pub fn for_resource_type(&self, resource_type: &str) -> Vec<Arc<dyn Worker>> {
        self.workers
            .iter()
            .filter(|(name, _)| self.applies_to(name, resource_type))
            .map(|(_, w)| Arc::clone(w))
            .collect()
    }

    /// Every resource type some enabled worker applies to.
    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .workers
            .values()
            .flat_map(|w| w.register_options().resource_types)
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Check `properties` against the fields of every worker applying to
    /// `resource_type`.
    pub fn validate_properties(
        &self,
        resource_type: &str,
        properties: &Map<String, Value>,
    ) -> Result<()> {
        for worker in self.for_resource_type(resource_type) {
            for field in worker.fields() {
                match properties.get(field.name) {
                    None | Some(Value::Null) => {
                        if field.required && field.default.is_none() {
                            return Err(Error::MissingProperty(field.name.to_string()));
                        }
                    }
                    Some(value) => {
                        field.schema.validate(field.name, value).map_err(|reason| {
                            Error::InvalidProperty {
                                field: field.name.to_string(),
                                reason,
                            }
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy of `properties` with sensitive values masked, for display.
    pub fn redact(&self, resource_type: &str, properties: &Map<String, Value>) -> Map<String, Value> {
        let mut redacted = properties.clone();
        for worker in self.for_resource_type(resource_type) {
            for field in worker.fields().iter().filter(|f| f.sensitive) {
                if let Some(value) = redacted.get_mut(field.name) {
                    if !value.is_null() {
                        *value = Value::String(MASKED_VALUE.to_string());
                    }
                }
            }
        }
        redacted
    }
}

/// String property, or the field default.
pub(crate) fn prop_or<'a>(resource: &'a Resource, key: &str, default: &'a str) -> &'a str {
    resource.property_str(key).unwrap_or(default)
}
