//! Reservation service integration.
//!
//! Each resource is mirrored as one reservable record (a physical host or a
//! device) plus one lease per reservation window. Leases are named after the
//! window so they can be matched back on every pass; anything carrying the
//! lease prefix and referencing this resource that no longer corresponds to
//! a window is removed.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use futures::stream::BoxStream;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    FieldSchema, ImportedResource, Worker, WorkerContext, WorkerField, WorkerOptions,
    WorkerResult, payload, prop_or,
};
use crate::client::{ApiRequest, ServiceClient};
use crate::error::{Error, Result};
use crate::model::{ReservationWindow, Resource, StateDetails};

pub const SERVICE_NAME: &str = "Blazar";
pub const IDENTITY_SERVICE_NAME: &str = "Keystone";
pub const API_VERSION_HEADER: &str = "OpenStack-API-Version";
pub const DEFAULT_API_VERSION: &str = "reservation 1.0";

/// Leases managed here are recognised by this name prefix.
pub const LEASE_PREFIX: &str = "availability_window_";
/// The service keeps lease boundaries at minute precision.
const LEASE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

const EXTERNAL_ID: &str = "external_id";
const LEASES_DEFERRED: &str = "one or more leases failed to update";
const ACTIVE_LEASES: &str = "active leases exist for resource";

/// What kind of reservable record a resource is mirrored as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservableKind {
    PhysicalHost,
    Device,
}

impl ReservableKind {
    pub fn worker_name(&self) -> &'static str {
        match self {
            ReservableKind::PhysicalHost => "reservation.physical_host",
            ReservableKind::Device => "reservation.device",
        }
    }

    pub fn resource_type(&self) -> &'static str {
        match self {
            ReservableKind::PhysicalHost => "baremetal",
            ReservableKind::Device => "device",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            ReservableKind::PhysicalHost => "/os-hosts",
            ReservableKind::Device => "/devices",
        }
    }

    /// Key wrapping a single record in responses.
    fn body_key(&self) -> &'static str {
        match self {
            ReservableKind::PhysicalHost => "host",
            ReservableKind::Device => "device",
        }
    }

    /// Key wrapping the record list in responses.
    fn list_key(&self) -> &'static str {
        match self {
            ReservableKind::PhysicalHost => "hosts",
            ReservableKind::Device => "devices",
        }
    }

    /// Request key identifying the resource when creating its record.
    fn create_key(&self) -> &'static str {
        match self {
            ReservableKind::PhysicalHost => "name",
            ReservableKind::Device => "uid",
        }
    }

    /// Response key holding the resource UUID on an existing record.
    fn identity_key(&self) -> &'static str {
        match self {
            ReservableKind::PhysicalHost => "hypervisor_hostname",
            ReservableKind::Device => "uid",
        }
    }

    fn reservation_clause(&self, resource_uuid: &Uuid) -> Value {
        let resource_properties = format!(r#"["==","$uid","{resource_uuid}"]"#);
        match self {
            ReservableKind::PhysicalHost => json!({
                "resource_type": "physical:host",
                "min": 1,
                "max": 1,
                "hypervisor_properties": "",
                "resource_properties": resource_properties,
            }),
            ReservableKind::Device => json!({
                "resource_type": "device",
                "min": 1,
                "max": 1,
                "resource_properties": resource_properties,
            }),
        }
    }

    fn extend_state(&self, resource: &Resource, state: &mut Map<String, Value>) {
        let props = &resource.properties;
        match self {
            ReservableKind::PhysicalHost => {
                if !resource.name.is_empty() {
                    state.insert("node_name".to_string(), json!(resource.name));
                }
                for key in ["node_type", "cpu_arch", "su_factor"] {
                    if let Some(value) = props.get(key).filter(|v| is_truthy(v)) {
                        state.insert(key.to_string(), value.clone());
                    }
                }
                for key in ["node", "rack"] {
                    if let Some(value) = props
                        .get("placement")
                        .and_then(|p| p.get(key))
                        .filter(|v| is_truthy(v))
                    {
                        state.insert(format!("placement.{key}"), value.clone());
                    }
                }
            }
            ReservableKind::Device => {
                state.insert("name".to_string(), json!(resource.name));
                state.insert(
                    "device_driver".to_string(),
                    json!(prop_or(resource, "device_driver", "k8s")),
                );
            }
        }
    }

    fn fields(&self) -> Vec<WorkerField> {
        match self {
            ReservableKind::PhysicalHost => vec![
                WorkerField::new("node_type", FieldSchema::String)
                    .description("A high-level classification of the type of node."),
                WorkerField::new(
                    "placement",
                    FieldSchema::object(
                        vec![("rack", FieldSchema::String), ("node", FieldSchema::String)],
                        vec![],
                    ),
                )
                .description("Information about the physical placement of the node."),
                WorkerField::new("su_factor", FieldSchema::Number)
                    .default_value(json!(1.0))
                    .description("The service unit (SU) hourly cost of the resource."),
            ],
            ReservableKind::Device => vec![
                WorkerField::new("device_driver", FieldSchema::String)
                    .required()
                    .default_value(json!("k8s"))
                    .description("Device driver plugin used to make the device reservable."),
            ],
        }
    }

    /// Properties recoverable from an existing record.
    fn imported_properties(&self, record: &Value) -> Map<String, Value> {
        let mut props = Map::new();
        if let Some(projects) = record
            .get("authorized_projects")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            let projects: Vec<&str> = projects.split(',').map(str::trim).collect();
            props.insert("authorized_projects".to_string(), json!(projects));
        }
        if let Some(reason) = record.get("restricted_reason").filter(|v| is_truthy(v)) {
            props.insert("authorized_projects_reason".to_string(), reason.clone());
        }
        match self {
            ReservableKind::PhysicalHost => {
                for key in ["node_type", "su_factor"] {
                    if let Some(value) = record.get(key).filter(|v| is_truthy(v)) {
                        props.insert(key.to_string(), value.clone());
                    }
                }
                let mut placement = Map::new();
                for key in ["node", "rack"] {
                    if let Some(value) = record.get(format!("placement.{key}")).filter(|v| is_truthy(v)) {
                        placement.insert(key.to_string(), value.clone());
                    }
                }
                if !placement.is_empty() {
                    props.insert("placement".to_string(), Value::Object(placement));
                }
            }
            ReservableKind::Device => {
                if let Some(driver) = record.get("device_driver").filter(|v| is_truthy(v)) {
                    props.insert("device_driver".to_string(), driver.clone());
                }
            }
        }
        props
    }

    fn imported_name(&self, record: &Value) -> Option<String> {
        let key = match self {
            ReservableKind::PhysicalHost => "node_name",
            ReservableKind::Device => "name",
        };
        record.get(key).and_then(Value::as_str).map(String::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseStep {
    Applied,
    Deferred,
}

pub struct ReservationWorker {
    kind: ReservableKind,
    client: ServiceClient,
    identity: Option<ServiceClient>,
}

impl ReservationWorker {
    pub fn new(kind: ReservableKind, client: ServiceClient) -> Self {
        Self {
            kind,
            client,
            identity: None,
        }
    }

    /// Resolve authorized project names through the identity service.
    pub fn with_identity(mut self, identity: ServiceClient) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn kind(&self) -> ReservableKind {
        self.kind
    }

    async fn expected_state(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
    ) -> Result<Map<String, Value>> {
        let mut state = Map::new();
        if let Some(projects) = resource
            .properties
            .get("authorized_projects")
            .and_then(Value::as_array)
        {
            let mut ids = Vec::with_capacity(projects.len());
            for project in projects.iter().filter_map(Value::as_str) {
                match self.resolve_project(ctx, project).await? {
                    Some(id) => ids.push(id),
                    None => warn!("Failed to look up authorized project '{}' by name", project),
                }
            }
            state.insert("authorized_projects".to_string(), json!(ids.join(",")));
        }
        if let Some(reason) = resource.property_str("authorized_projects_reason") {
            state.insert("restricted_reason".to_string(), json!(reason));
        }
        self.kind.extend_state(resource, &mut state);
        Ok(state)
    }

    async fn resolve_project(&self, ctx: &WorkerContext, project: &str) -> Result<Option<String>> {
        if Uuid::parse_str(project).is_ok() {
            return Ok(Some(project.to_string()));
        }
        let Some(identity) = &self.identity else {
            return Ok(None);
        };
        let response = identity
            .call(
                &ctx.request_id,
                ApiRequest::get(format!("/projects?name={}", urlencoding::encode(project))),
            )
            .await?
            .into_value();
        Ok(response
            .pointer("/projects/0/id")
            .and_then(Value::as_str)
            .map(String::from))
    }

    async fn create_resource(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
        expected: &Map<String, Value>,
    ) -> Result<WorkerResult> {
        let identity = resource.uuid.to_string();
        let mut body = expected.clone();
        body.insert(self.kind.create_key().to_string(), json!(identity));

        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::post(self.kind.path(), Value::Object(body)).allow(&[404, 409]),
            )
            .await?;
        match response.status {
            404 => Ok(WorkerResult::defer(
                "cannot make resource reservable: the underlying entity was not found",
            )),
            409 => match self.find_record(ctx, &identity).await? {
                Some(existing) => {
                    let id = id_of(&existing);
                    info!("Adopting existing {} {:?} for {}", self.kind.body_key(), id, identity);
                    Ok(WorkerResult::defer_with(
                        payload(json!({ EXTERNAL_ID: id })),
                        "resource already registered; adopted its id",
                    ))
                }
                None => Err(Error::Inconsistent(format!(
                    "{SERVICE_NAME} returned 409 creating {identity} but lists no matching {}",
                    self.kind.body_key()
                ))),
            },
            _ => {
                let record = response.into_value();
                let record = record.get(self.kind.body_key()).cloned().unwrap_or(Value::Null);
                info!("Created {} {:?} for {}", self.kind.body_key(), id_of(&record), identity);
                Ok(WorkerResult::success(payload(json!({
                    EXTERNAL_ID: id_of(&record),
                    "resource_created_at": record.get("created_at"),
                }))))
            }
        }
    }

    async fn update_resource(
        &self,
        ctx: &WorkerContext,
        external_id: &str,
        expected: &Map<String, Value>,
    ) -> Result<WorkerResult> {
        let path = format!("{}/{external_id}", self.kind.path());
        let response = self
            .client
            .call(&ctx.request_id, ApiRequest::get(&path).allow(&[404]))
            .await?;
        if response.status == 404 {
            return Ok(stale_id());
        }
        let existing = response.into_value();
        let existing = existing.get(self.kind.body_key()).cloned().unwrap_or(Value::Null);
        if expected.iter().all(|(k, v)| existing.get(k) == Some(v)) {
            return Ok(WorkerResult::success(StateDetails::new()));
        }

        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::put(&path, Value::Object(expected.clone())).allow(&[404, 409]),
            )
            .await?;
        match response.status {
            404 => Ok(stale_id()),
            // The record is referenced by a lease that has started.
            409 => Ok(WorkerResult::defer(ACTIVE_LEASES)),
            _ => {
                let record = response.into_value();
                let record = record.get(self.kind.body_key()).cloned().unwrap_or(Value::Null);
                info!("Updated {} {}", self.kind.body_key(), external_id);
                Ok(WorkerResult::success(payload(json!({
                    EXTERNAL_ID: id_of(&record).unwrap_or_else(|| external_id.to_string()),
                    "resource_updated_at": record.get("updated_at"),
                }))))
            }
        }
    }

    async fn delete_resource(&self, ctx: &WorkerContext, external_id: &str) -> Result<WorkerResult> {
        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::delete(format!("{}/{external_id}", self.kind.path())).allow(&[404, 409]),
            )
            .await?;
        match response.status {
            409 => Ok(WorkerResult::defer(ACTIVE_LEASES)),
            status => {
                if status != 404 {
                    info!("Deleted {} {}", self.kind.body_key(), external_id);
                }
                Ok(WorkerResult::success(payload(json!({
                    EXTERNAL_ID: null,
                    "resource_created_at": null,
                    "resource_deleted_at": Utc::now().to_rfc3339(),
                }))))
            }
        }
    }

    /// The record whose identity key holds `identity`, from the full listing.
    async fn find_record(&self, ctx: &WorkerContext, identity: &str) -> Result<Option<Value>> {
        let records = self.list_records(ctx).await?;
        Ok(records
            .into_iter()
            .find(|r| r.get(self.kind.identity_key()).and_then(Value::as_str) == Some(identity)))
    }

    async fn list_records(&self, ctx: &WorkerContext) -> Result<Vec<Value>> {
        let response = self
            .client
            .call(&ctx.request_id, ApiRequest::get(self.kind.path()))
            .await?
            .into_value();
        Ok(response
            .get(self.kind.list_key())
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Leases carrying the prefix whose reservations mention this resource.
    async fn list_leases(&self, ctx: &WorkerContext, resource: &Resource) -> Result<Vec<Value>> {
        let response = self
            .client
            .call(&ctx.request_id, ApiRequest::get("/leases"))
            .await?
            .into_value();
        let uuid = resource.uuid.to_string();
        Ok(response
            .get("leases")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|lease| {
                let named = lease
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|n| n.starts_with(LEASE_PREFIX));
                named
                    && lease
                        .get("reservations")
                        .is_some_and(|r| r.to_string().contains(&uuid))
            })
            .cloned()
            .collect())
    }

    fn lease_body(&self, window: &ReservationWindow) -> Value {
        json!({
            "name": lease_name(window),
            "start_date": window.start.format(LEASE_DATE_FORMAT).to_string(),
            "end_date": window.end.format(LEASE_DATE_FORMAT).to_string(),
            "reservations": [self.kind.reservation_clause(&window.resource_uuid)],
        })
    }

    /// Converge the resource's leases onto `windows`.
    ///
    /// Returns whether any individual lease operation deferred.
    async fn reconcile_leases(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
        windows: &[ReservationWindow],
    ) -> Result<bool> {
        let mut leases_to_check = self.list_leases(ctx, resource).await?;
        let mut steps = Vec::new();
        let now = Utc::now();

        for window in windows {
            let desired = self.lease_body(window);
            let name = lease_name(window);
            let Some(index) = leases_to_check
                .iter()
                .position(|l| l.get("name").and_then(Value::as_str) == Some(name.as_str()))
            else {
                steps.push(self.create_lease(ctx, &desired).await?);
                continue;
            };
            let existing = leases_to_check.remove(index);
            let lease_id = lease_id(&existing)?;

            let start = to_minute(window.start);
            let end = to_minute(window.end);
            let existing_start = existing.get("start_date").and_then(Value::as_str).and_then(parse_lease_time);
            let existing_end = existing.get("end_date").and_then(Value::as_str).and_then(parse_lease_time);
            if existing_start == Some(start) && existing_end == Some(end) {
                continue;
            }

            match existing_start {
                // A started lease cannot have its start moved forward.
                Some(existing_start) if existing_start < now && start > existing_start => {
                    debug!(lease = %lease_id, "recreating started lease with a later start");
                    let step = self.delete_lease(ctx, &lease_id).await?;
                    steps.push(step);
                    if step == LeaseStep::Applied {
                        steps.push(self.create_lease(ctx, &desired).await?);
                    }
                }
                _ => {
                    let update = json!({
                        "name": name,
                        "start_date": desired["start_date"],
                        "end_date": desired["end_date"],
                    });
                    steps.push(self.update_lease(ctx, &lease_id, update).await?);
                }
            }
        }

        for lease in &leases_to_check {
            steps.push(self.delete_lease(ctx, &lease_id(lease)?).await?);
        }

        Ok(steps.contains(&LeaseStep::Deferred))
    }

    async fn create_lease(&self, ctx: &WorkerContext, body: &Value) -> Result<LeaseStep> {
        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::post("/leases", body.clone()).allow(&[404, 409]),
            )
            .await?;
        let name = body.get("name").and_then(Value::as_str).unwrap_or_default();
        match response.status {
            404 | 409 => {
                warn!("Could not create lease {}: HTTP {}", name, response.status);
                Ok(LeaseStep::Deferred)
            }
            _ => {
                info!("Created lease {}", name);
                Ok(LeaseStep::Applied)
            }
        }
    }

    async fn update_lease(&self, ctx: &WorkerContext, lease_id: &str, body: Value) -> Result<LeaseStep> {
        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::put(format!("/leases/{lease_id}"), body).allow(&[404, 409]),
            )
            .await?;
        match response.status {
            404 | 409 => {
                warn!("Could not update lease {}: HTTP {}", lease_id, response.status);
                Ok(LeaseStep::Deferred)
            }
            _ => {
                info!("Updated lease {}", lease_id);
                Ok(LeaseStep::Applied)
            }
        }
    }

    async fn delete_lease(&self, ctx: &WorkerContext, lease_id: &str) -> Result<LeaseStep> {
        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::delete(format!("/leases/{lease_id}")).allow(&[404, 409]),
            )
            .await?;
        match response.status {
            409 => {
                warn!("Could not delete lease {}: HTTP 409", lease_id);
                Ok(LeaseStep::Deferred)
            }
            _ => {
                info!("Deleted lease {}", lease_id);
                Ok(LeaseStep::Applied)
            }
        }
    }

    async fn teardown(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
        external_id: Option<String>,
    ) -> Result<WorkerResult> {
        let Some(external_id) = external_id else {
            debug!(resource = %resource.uuid, "no reservable record to remove");
            return Ok(WorkerResult::success(payload(json!({
                "resource_deleted_at": Utc::now().to_rfc3339(),
            }))));
        };

        // Leases go first; the record cannot be removed while they reference it.
        if self.reconcile_leases(ctx, resource, &[]).await? {
            return Ok(WorkerResult::defer(LEASES_DEFERRED));
        }
        self.delete_resource(ctx, &external_id).await
    }
}

#[async_trait]
impl Worker for ReservationWorker {
    fn register_options(&self) -> WorkerOptions {
        WorkerOptions {
            name: self.kind.worker_name().to_string(),
            resource_types: vec![self.kind.resource_type().to_string()],
            consumes_windows: true,
        }
    }

    fn fields(&self) -> Vec<WorkerField> {
        let mut fields = vec![
            WorkerField::new("authorized_projects", FieldSchema::array(FieldSchema::String))
                .description(
                    "Only users in these projects may reserve the resource. Names or IDs.",
                ),
            WorkerField::new("authorized_projects_reason", FieldSchema::String)
                .description("Displayed reason for restricting the resource to certain projects."),
        ];
        fields.extend(self.kind.fields());
        fields
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
        windows: &[ReservationWindow],
        state_details: &StateDetails,
    ) -> Result<WorkerResult> {
        let external_id = state_details.get(EXTERNAL_ID).and_then(id_value);

        if resource.deleted {
            return self.teardown(ctx, resource, external_id).await;
        }

        let expected = self.expected_state(ctx, resource).await?;
        let result = match external_id {
            Some(id) => self.update_resource(ctx, &id, &expected).await?,
            None => self.create_resource(ctx, resource, &expected).await?,
        };
        if result.is_defer() {
            return Ok(result);
        }

        if self.reconcile_leases(ctx, resource, windows).await? {
            return Ok(WorkerResult::defer_with(result.into_payload(), LEASES_DEFERRED));
        }
        Ok(result)
    }

    fn import_existing<'a>(
        &'a self,
        ctx: &'a WorkerContext,
    ) -> BoxStream<'a, Result<ImportedResource>> {
        Box::pin(async_stream::stream! {
            let records = match self.list_records(ctx).await {
                Ok(records) => records,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            for record in records {
                let uuid = record
                    .get(self.kind.identity_key())
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok());
                if uuid.is_none() {
                    warn!(
                        "{} {:?} does not reference a resource UUID; a new one will be assigned",
                        self.kind.body_key(),
                        id_of(&record)
                    );
                }
                yield Ok(ImportedResource {
                    uuid,
                    name: self.kind.imported_name(&record),
                    properties: self.kind.imported_properties(&record),
                });
            }
        })
    }
}

fn stale_id() -> WorkerResult {
    WorkerResult::defer_with(payload(json!({ EXTERNAL_ID: null })), "resource not found")
}

fn lease_name(window: &ReservationWindow) -> String {
    format!("{LEASE_PREFIX}{}", window.uuid)
}

fn lease_id(lease: &Value) -> Result<String> {
    id_of(lease).ok_or_else(|| Error::Inconsistent(format!("{SERVICE_NAME} listed a lease without an id")))
}

/// Identifiers come back as strings or integers depending on the record type.
fn id_of(record: &Value) -> Option<String> {
    record.get("id").and_then(id_value)
}

fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn to_minute(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time)
}

/// Lease timestamps are UTC, with or without an offset and fraction.
fn parse_lease_time(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Some(to_minute(time.with_timezone(&Utc)));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", LEASE_DATE_FORMAT]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| to_minute(naive.and_utc()))
}
