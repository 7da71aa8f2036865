//! Device-fleet integration.
//!
//! Registers each device with the fleet service under the fleet its device
//! type maps to, hands the device its cloud credential through service
//! environment variables, and generates a device API key on first
//! registration. The key is written back to the resource so the device
//! owner can read it from the registry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::info;

use super::{FieldSchema, Worker, WorkerContext, WorkerField, WorkerOptions, WorkerResult, payload};
use crate::client::{ApiRequest, ServiceClient};
use crate::error::{Error, Result, ServiceError};
use crate::model::{ReservationWindow, Resource, StateDetails};

pub const WORKER_NAME: &str = "fleet";
pub const RESOURCE_TYPE: &str = "device";
pub const SERVICE_NAME: &str = "Balena";
pub const DEFAULT_CREDENTIAL_SERVICE: &str = "coordinator";

/// Device types the fleet service knows how to run.
pub const DEVICE_TYPES: [&str; 3] = ["jetson-nano", "raspberrypi3-64", "raspberrypi4-64"];

const DEVICE_API_KEY: &str = "device_api_key";
const CREDENTIAL_VARS: [(&str, &str); 2] = [
    ("OS_APPLICATION_CREDENTIAL_ID", "application_credential_id"),
    ("OS_APPLICATION_CREDENTIAL_SECRET", "application_credential_secret"),
];
const SERVICE_VARS: &str = "/v6/device_service_environment_variable";

pub struct FleetWorker {
    client: ServiceClient,
    /// Device type to fleet name.
    fleets: BTreeMap<String, String>,
    credential_service: String,
}

impl FleetWorker {
    pub fn new(client: ServiceClient, fleets: BTreeMap<String, String>) -> Self {
        Self {
            client,
            fleets,
            credential_service: DEFAULT_CREDENTIAL_SERVICE.to_string(),
        }
    }

    /// Name of the fleet service that receives the credential variables.
    pub fn with_credential_service(mut self, name: impl Into<String>) -> Self {
        self.credential_service = name.into();
        self
    }

    async fn find_device(&self, ctx: &WorkerContext, device_uuid: &str) -> Result<Option<Value>> {
        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::get(format!(
                    "{}?$expand=belongs_to__application,is_of__device_type",
                    device_path(device_uuid)
                )),
            )
            .await?
            .into_value();
        Ok(first_record(&response))
    }

    /// Device type slug to its numeric ID.
    async fn device_types(&self, ctx: &WorkerContext) -> Result<BTreeMap<String, i64>> {
        let response = self
            .client
            .call(&ctx.request_id, ApiRequest::get("/v6/device_type?$select=id,slug"))
            .await?
            .into_value();
        Ok(records(&response)
            .iter()
            .filter_map(|t| Some((t.get("slug")?.as_str()?.to_string(), t.get("id")?.as_i64()?)))
            .collect())
    }

    async fn fleet_id(&self, ctx: &WorkerContext, fleet: &str) -> Result<i64> {
        let filter = format!("app_name eq '{fleet}'");
        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::get(format!(
                    "/v6/application?$filter={}",
                    urlencoding::encode(&filter)
                )),
            )
            .await?
            .into_value();
        first_record(&response)
            .and_then(|app| app.get("id").and_then(Value::as_i64))
            .ok_or_else(|| Error::Configuration(format!("fleet '{fleet}' does not exist")))
    }

    /// The device record, registered or corrected as needed.
    async fn register_device(&self, ctx: &WorkerContext, resource: &Resource) -> Result<Value> {
        let device_uuid = device_uuid(resource);
        let device_type = resource
            .property_str("device_type")
            .ok_or_else(|| Error::MissingProperty("device_type".to_string()))?;
        let type_id = *self.device_types(ctx).await?.get(device_type).ok_or_else(|| {
            Error::InvalidProperty {
                field: "device_type".to_string(),
                reason: format!("{SERVICE_NAME} does not know device type '{device_type}'"),
            }
        })?;

        if let Some(device) = self.find_device(ctx, &device_uuid).await? {
            let mut changes = serde_json::Map::new();
            if device.get("device_name").and_then(Value::as_str) != Some(resource.name.as_str()) {
                changes.insert("device_name".to_string(), json!(resource.name));
            }
            if device.pointer("/is_of__device_type/0/id").and_then(Value::as_i64) != Some(type_id) {
                changes.insert("is_of__device_type".to_string(), json!(type_id));
            }
            if changes.is_empty() {
                return Ok(device);
            }
            self.client
                .call(
                    &ctx.request_id,
                    ApiRequest::patch(device_path(&device_uuid), Value::Object(changes)),
                )
                .await?;
            info!("Updated device {} for {}", device_uuid, resource.uuid);
        } else {
            let fleet = self.fleets.get(device_type).ok_or_else(|| {
                Error::Configuration(format!("no fleet is configured for device type '{device_type}'"))
            })?;
            let fleet_id = self.fleet_id(ctx, fleet).await?;
            self.client
                .call(
                    &ctx.request_id,
                    ApiRequest::post(
                        "/v6/device",
                        json!({
                            "belongs_to__application": fleet_id,
                            "uuid": device_uuid,
                            "is_of__device_type": type_id,
                            "device_name": resource.name,
                        }),
                    ),
                )
                .await?;
            info!("Registered device {} in fleet {} for {}", device_uuid, fleet, resource.uuid);
        }

        // The create and update responses leave out the expanded relations.
        self.find_device(ctx, &device_uuid).await?.ok_or_else(|| {
            Error::Inconsistent(format!(
                "{SERVICE_NAME} does not list device {device_uuid} after registering it"
            ))
        })
    }

    async fn sync_credential_vars(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
        device_id: i64,
    ) -> Result<()> {
        let filter = format!("service_install/device eq {device_id}");
        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::get(format!("{SERVICE_VARS}?$filter={}", urlencoding::encode(&filter))),
            )
            .await?
            .into_value();
        let existing = records(&response);

        for (var, property) in CREDENTIAL_VARS {
            let value = resource
                .property_str(property)
                .ok_or_else(|| Error::MissingProperty(property.to_string()))?;
            let current = existing
                .iter()
                .find(|v| v.get("name").and_then(Value::as_str) == Some(var));
            match current {
                Some(current) if current.get("value").and_then(Value::as_str) == Some(value) => {}
                Some(current) => {
                    let var_id = current.get("id").and_then(Value::as_i64).ok_or_else(|| {
                        malformed(format!("variable {var} has no id"))
                    })?;
                    self.client
                        .call(
                            &ctx.request_id,
                            ApiRequest::patch(
                                format!("{SERVICE_VARS}({var_id})"),
                                json!({"value": value}),
                            ),
                        )
                        .await?;
                    info!("Updated device variable {} for {}", var, resource.uuid);
                }
                None => {
                    self.client
                        .call(
                            &ctx.request_id,
                            ApiRequest::post(
                                SERVICE_VARS,
                                json!({
                                    "device": device_id,
                                    "service_name": self.credential_service,
                                    "name": var,
                                    "value": value,
                                }),
                            ),
                        )
                        .await?;
                    info!("Created device variable {} for {}", var, resource.uuid);
                }
            }
        }
        Ok(())
    }

    /// Generate a device API key and store it on the resource.
    async fn issue_device_key(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
        device_id: i64,
    ) -> Result<()> {
        let key = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::post(format!("/api-key/device/{device_id}/device-key"), json!({})),
            )
            .await?
            .into_value();
        let key = key
            .as_str()
            .ok_or_else(|| malformed("device key is not a string".to_string()))?;

        // Re-read so a concurrent property edit is not overwritten.
        let current = ctx
            .registry
            .get_resource(resource.id)
            .await?
            .ok_or_else(|| Error::Inconsistent(format!("resource {} vanished", resource.uuid)))?;
        let mut properties = current.properties;
        properties.insert(DEVICE_API_KEY.to_string(), json!(key));
        ctx.registry
            .update_resource_properties(resource.id, properties)
            .await?;
        info!("Generated device API key for {}", resource.uuid);
        Ok(())
    }
}

#[async_trait]
impl Worker for FleetWorker {
    fn register_options(&self) -> WorkerOptions {
        WorkerOptions {
            name: WORKER_NAME.to_string(),
            resource_types: vec![RESOURCE_TYPE.to_string()],
            consumes_windows: false,
        }
    }

    fn fields(&self) -> Vec<WorkerField> {
        vec![
            WorkerField::new("device_type", FieldSchema::Enum(DEVICE_TYPES.to_vec()))
                .required()
                .description("The type of device; selects the fleet it is registered in."),
            WorkerField::new("application_credential_id", FieldSchema::String)
                .required()
                .private()
                .description(
                    "ID of the application credential the device uses to query cloud APIs. \
                     It should be scoped to the project that enrolled the device.",
                ),
            WorkerField::new("application_credential_secret", FieldSchema::String)
                .required()
                .private()
                .sensitive()
                .description("Secret of the application credential."),
            WorkerField::new(DEVICE_API_KEY, FieldSchema::String)
                .private()
                .sensitive()
                .description("Generated when the device is first registered; configure the device OS with it."),
        ]
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
        _windows: &[ReservationWindow],
        _state_details: &StateDetails,
    ) -> Result<WorkerResult> {
        if resource.deleted {
            let device_uuid = device_uuid(resource);
            let response = self
                .client
                .call(
                    &ctx.request_id,
                    ApiRequest::delete(device_path(&device_uuid)).allow(&[404]),
                )
                .await?;
            if response.status != 404 {
                info!("Deleted device {} for {}", device_uuid, resource.uuid);
            }
            return Ok(WorkerResult::success(payload(json!({
                "device_id": null,
                "fleet_id": null,
                "last_seen": null,
            }))));
        }

        let device = self.register_device(ctx, resource).await?;
        let device_id = device
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| malformed("device has no id".to_string()))?;
        self.sync_credential_vars(ctx, resource, device_id).await?;

        if resource
            .properties
            .get(DEVICE_API_KEY)
            .is_none_or(Value::is_null)
        {
            self.issue_device_key(ctx, resource, device_id).await?;
        }

        let last_seen = if device.get("is_online").and_then(Value::as_bool).unwrap_or(false) {
            json!(Utc::now().to_rfc3339())
        } else {
            device.get("last_connectivity_event").cloned().unwrap_or(Value::Null)
        };
        Ok(WorkerResult::success(payload(json!({
            "device_id": device_id,
            "fleet_id": device.pointer("/belongs_to__application/0/id"),
            "last_seen": last_seen,
        }))))
    }
}

/// The fleet service identifies devices by the resource UUID without dashes.
fn device_uuid(resource: &Resource) -> String {
    resource.uuid.simple().to_string()
}

fn device_path(device_uuid: &str) -> String {
    format!("/v6/device(uuid='{device_uuid}')")
}

/// Records of an OData collection response.
fn records(response: &Value) -> Vec<Value> {
    response
        .get("d")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn first_record(response: &Value) -> Option<Value> {
    records(response).into_iter().next()
}

fn malformed(text: String) -> Error {
    Error::Service(ServiceError::MalformedResponse {
        service: SERVICE_NAME.to_string(),
        text,
    })
}
