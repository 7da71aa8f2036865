//! Bare-metal provisioning integration.
//!
//! Keeps one node per resource in the provisioning service, including its
//! network ports. Nodes move through `enroll -> manageable -> available`
//! only via explicit transition requests which complete asynchronously, so
//! every transition is followed by polling until the target state is seen.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::patch::normalize_nested;
use super::{
    FieldSchema, ImportedResource, Worker, WorkerContext, WorkerField, WorkerOptions,
    WorkerResult, payload, prop_or,
};
use crate::client::{ApiRequest, ServiceClient};
use crate::error::{Error, Result, ServiceError};
use crate::model::{ReservationWindow, Resource, StateDetails};

pub const WORKER_NAME: &str = "provisioning";
pub const RESOURCE_TYPE: &str = "baremetal";
pub const SERVICE_NAME: &str = "Ironic";
pub const API_VERSION_HEADER: &str = "X-OpenStack-Ironic-API-Version";
pub const DEFAULT_API_VERSION: &str = "1.51";

const DEFAULT_STATE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
const TRANSITIONS_PER_PASS: u32 = 4;

/// Provision states this worker drives nodes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Manageable,
    Available,
}

impl ProvisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionState::Manageable => "manageable",
            ProvisionState::Available => "available",
        }
    }

    /// Transition verb that leads to this state.
    pub fn verb(&self) -> &'static str {
        match self {
            ProvisionState::Manageable => "manage",
            ProvisionState::Available => "provide",
        }
    }
}

pub struct ProvisioningWorker {
    client: ServiceClient,
    state_timeout: Duration,
    poll_interval: Duration,
}

impl ProvisioningWorker {
    pub fn new(client: ServiceClient) -> Self {
        Self {
            client,
            state_timeout: DEFAULT_STATE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_polling(mut self, timeout: Duration, interval: Duration) -> Self {
        self.state_timeout = timeout;
        self.poll_interval = interval;
        self
    }

    /// Longest a single pass can wait on transitions: a new node goes
    /// through `manage` and `provide`, and a port change repeats both.
    pub fn worst_case_run(&self) -> Duration {
        self.poll_interval
            .saturating_mul(self.poll_budget())
            .saturating_mul(TRANSITIONS_PER_PASS)
    }

    /// Number of polls allowed after a transition request.
    pub fn poll_budget(&self) -> u32 {
        let interval = self.poll_interval.as_millis().max(1);
        let polls = self.state_timeout.as_millis().div_ceil(interval);
        u32::try_from(polls).unwrap_or(u32::MAX).max(1)
    }

    /// Drive `node_uuid` into `target`, waiting for the service to get there.
    pub async fn ensure_provision_state(
        &self,
        ctx: &WorkerContext,
        node_uuid: &str,
        target: ProvisionState,
    ) -> Result<()> {
        let node = self.get_node(ctx, node_uuid).await?;
        if provision_state(&node) == Some(target.as_str()) {
            return Ok(());
        }

        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::put(
                    format!("/nodes/{node_uuid}/states/provision"),
                    json!({"target": target.verb()}),
                )
                .allow(&[400]),
            )
            .await?;
        if response.status == 400 {
            return Err(Error::InvalidStateTransition {
                node: node_uuid.to_string(),
                state: target.as_str().to_string(),
            });
        }

        for poll in 1..=self.poll_budget() {
            tokio::time::sleep(self.poll_interval).await;
            let node = self.get_node(ctx, node_uuid).await?;
            let state = provision_state(&node);
            debug!(node = %node_uuid, poll, state = ?state, wanted = target.as_str(), "polled provision state");
            if state == Some(target.as_str()) {
                return Ok(());
            }
        }

        Err(Error::ProvisionTimeout {
            node: node_uuid.to_string(),
            state: target.as_str().to_string(),
        })
    }

    async fn get_node(&self, ctx: &WorkerContext, node_uuid: &str) -> Result<Value> {
        let response = self
            .client
            .call(&ctx.request_id, ApiRequest::get(format!("/nodes/{node_uuid}")))
            .await?;
        Ok(response.into_value())
    }

    /// The node, or `None` if the service does not know it.
    async fn find_node(&self, ctx: &WorkerContext, node_uuid: &str) -> Result<Option<Value>> {
        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::get(format!("/nodes/{node_uuid}")).allow(&[404]),
            )
            .await?;
        let node = response.into_value();
        // A 404 carries an error document instead; a real node always has a uuid.
        Ok(node.get("uuid").and_then(Value::as_str).is_some().then_some(node))
    }

    async fn create_node(&self, ctx: &WorkerContext, desired: Value) -> Result<Value> {
        let node = self
            .client
            .call(&ctx.request_id, ApiRequest::post("/nodes", desired))
            .await?
            .into_value();
        let node_uuid = required_str(&node, "uuid")?;
        info!("Created node {}", node_uuid);

        // enroll -> manageable runs verification on the service side.
        self.ensure_provision_state(ctx, &node_uuid, ProvisionState::Manageable)
            .await?;
        self.ensure_provision_state(ctx, &node_uuid, ProvisionState::Available)
            .await?;
        Ok(node)
    }

    async fn update_node(&self, ctx: &WorkerContext, node: Value, mut desired: Value) -> Result<Value> {
        let node_uuid = required_str(&node, "uuid")?;

        let mut existing = Value::Object(
            desired
                .as_object()
                .map(|d| {
                    d.keys()
                        .map(|k| (k.clone(), node.get(k).cloned().unwrap_or(Value::Null)))
                        .collect()
                })
                .unwrap_or_default(),
        );
        normalize_nested(&mut existing, &mut desired, "driver_info");
        normalize_nested(&mut existing, &mut desired, "properties");

        let patch = json_patch::diff(&existing, &desired);
        if patch.0.is_empty() {
            return Ok(node);
        }

        info!("Updating node {} ({} change(s))", node_uuid, patch.0.len());
        // Driver changes are only accepted while the node is manageable.
        if provision_state(&node) != Some(ProvisionState::Manageable.as_str()) {
            self.ensure_provision_state(ctx, &node_uuid, ProvisionState::Manageable)
                .await?;
        }
        let updated = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::patch(format!("/nodes/{node_uuid}"), json!(patch)),
            )
            .await?
            .into_value();
        self.ensure_provision_state(ctx, &node_uuid, ProvisionState::Available)
            .await?;
        Ok(updated)
    }

    async fn list_ports(&self, ctx: &WorkerContext, node_uuid: &str) -> Result<Vec<Value>> {
        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::get(format!("/ports?node={node_uuid}&detail=True")),
            )
            .await?;
        Ok(array_at(&response.into_value(), "ports"))
    }

    /// Make the node's ports match the enabled interfaces, keyed by MAC address.
    async fn reconcile_ports(
        &self,
        ctx: &WorkerContext,
        node_uuid: &str,
        interfaces: &[Value],
    ) -> Result<()> {
        let ports = self.list_ports(ctx, node_uuid).await?;
        let ports_by_mac: BTreeMap<String, &Value> = ports
            .iter()
            .filter_map(|p| Some((p.get("address")?.as_str()?.to_lowercase(), p)))
            .collect();

        let mut ifaces_by_mac: BTreeMap<String, &Value> = BTreeMap::new();
        for iface in interfaces {
            let mac = iface
                .get("mac_address")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidProperty {
                    field: "interfaces".to_string(),
                    reason: "every interface needs a mac_address".to_string(),
                })?;
            ifaces_by_mac.insert(mac.to_lowercase(), iface);
        }
        let desired: BTreeSet<&String> = ifaces_by_mac
            .iter()
            .filter(|(_, iface)| iface.get("enabled").and_then(Value::as_bool).unwrap_or(true))
            .map(|(mac, _)| mac)
            .collect();

        let to_add: Vec<&Value> = desired
            .iter()
            .filter(|mac| !ports_by_mac.contains_key(mac.as_str()))
            .map(|mac| ifaces_by_mac[mac.as_str()])
            .collect();
        let mut to_update = Vec::new();
        for mac in desired.iter().filter(|mac| ports_by_mac.contains_key(mac.as_str())) {
            let port = ports_by_mac[mac.as_str()];
            let patch = port_patch(port, ifaces_by_mac[mac.as_str()]);
            if !patch.0.is_empty() {
                to_update.push((required_str(port, "uuid")?, patch));
            }
        }
        let mut to_remove = Vec::new();
        for (mac, port) in &ports_by_mac {
            if !desired.contains(mac) {
                to_remove.push(required_str(port, "uuid")?);
            }
        }

        if to_add.is_empty() && to_update.is_empty() && to_remove.is_empty() {
            return Ok(());
        }

        // Port topology only changes while the node is unprovisioned.
        self.ensure_provision_state(ctx, node_uuid, ProvisionState::Manageable)
            .await?;

        for iface in to_add {
            let mut body = desired_port(iface);
            body["node_uuid"] = json!(node_uuid);
            body["address"] = iface["mac_address"].clone();
            let port = self
                .client
                .call(&ctx.request_id, ApiRequest::post("/ports", body))
                .await?
                .into_value();
            let port_uuid = port.get("uuid").and_then(Value::as_str).unwrap_or("?");
            info!("Created port {} for node {}", port_uuid, node_uuid);
        }

        for (port_uuid, patch) in to_update {
            self.client
                .call(
                    &ctx.request_id,
                    ApiRequest::patch(format!("/ports/{port_uuid}"), json!(patch)),
                )
                .await?;
            info!("Updated port {} for node {}", port_uuid, node_uuid);
        }

        for port_uuid in to_remove {
            self.client
                .call(&ctx.request_id, ApiRequest::delete(format!("/ports/{port_uuid}")))
                .await?;
            info!("Deleted port {} for node {}", port_uuid, node_uuid);
        }

        self.ensure_provision_state(ctx, node_uuid, ProvisionState::Available)
            .await
    }

    /// Bring an unprovisioned node the rest of the way to `available`.
    ///
    /// A transition that timed out on an earlier pass leaves the node in
    /// `enroll` or `manageable` with nothing left to patch. Deployed or
    /// otherwise busy nodes are not touched.
    async fn finish_provide(&self, ctx: &WorkerContext, node_uuid: &str) -> Result<()> {
        let node = self.get_node(ctx, node_uuid).await?;
        match provision_state(&node) {
            Some("enroll") => {
                self.ensure_provision_state(ctx, node_uuid, ProvisionState::Manageable)
                    .await?;
                self.ensure_provision_state(ctx, node_uuid, ProvisionState::Available)
                    .await
            }
            Some("manageable") => {
                self.ensure_provision_state(ctx, node_uuid, ProvisionState::Available)
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn teardown(&self, ctx: &WorkerContext, resource: &Resource) -> Result<WorkerResult> {
        let node_uuid = resource.uuid.to_string();
        // The service removes a node's ports together with the node.
        let response = self
            .client
            .call(
                &ctx.request_id,
                ApiRequest::delete(format!("/nodes/{node_uuid}")).allow(&[404]),
            )
            .await?;
        if response.status != 404 {
            info!("Deleted node {}", node_uuid);
        }
        Ok(WorkerResult::success(payload(json!({
            "node_uuid": null,
            "created_at": null,
            "deleted_at": Utc::now().to_rfc3339(),
        }))))
    }

    async fn converge(&self, ctx: &WorkerContext, resource: &Resource) -> Result<WorkerResult> {
        if resource.deleted {
            return self.teardown(ctx, resource).await;
        }

        let desired = desired_node(resource)?;
        let interfaces = resource
            .properties
            .get("interfaces")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| Error::MissingProperty("interfaces".to_string()))?;
        let node_uuid = resource.uuid.to_string();

        let node = match self.find_node(ctx, &node_uuid).await? {
            None => self.create_node(ctx, desired).await?,
            Some(node) => {
                if node.get("maintenance").and_then(Value::as_bool).unwrap_or(false) {
                    // Never mutate a node an operator has put in maintenance.
                    return Ok(WorkerResult::defer(
                        "node is in maintenance mode; take it out of maintenance to apply this update",
                    ));
                }
                self.update_node(ctx, node, desired).await?
            }
        };

        self.reconcile_ports(ctx, &node_uuid, &interfaces).await?;
        self.finish_provide(ctx, &node_uuid).await?;

        Ok(WorkerResult::success(success_payload(&node)))
    }

    async fn imported_node(&self, ctx: &WorkerContext, node: &Value) -> Result<Option<ImportedResource>> {
        let node_uuid = required_str(node, "uuid")?;
        let empty = Map::new();
        let driver_info = node.get("driver_info").and_then(Value::as_object).unwrap_or(&empty);
        let node_props = node.get("properties").and_then(Value::as_object).unwrap_or(&empty);

        if driver_info
            .get("ipmi_password")
            .and_then(Value::as_str)
            .is_some_and(is_masked)
        {
            warn!(
                "Node {} has a masked IPMI password; allow the service to show secrets to admin requests",
                node_uuid
            );
            return Ok(None);
        }

        let interfaces: Vec<Value> = self
            .list_ports(ctx, &node_uuid)
            .await?
            .iter()
            .map(|port| {
                let llc = port.get("local_link_connection").cloned().unwrap_or(json!({}));
                json!({
                    "name": port
                        .pointer("/extra/name")
                        .cloned()
                        .unwrap_or_else(|| port.get("uuid").cloned().unwrap_or(Value::Null)),
                    "mac_address": port.get("address"),
                    "switch_id": llc.get("switch_id"),
                    "switch_port_id": llc.get("port_id"),
                    "switch_info": llc.get("switch_info"),
                })
            })
            .collect();

        let properties = payload(json!({
            "baremetal_driver": node.get("driver"),
            "baremetal_resource_class": node.get("resource_class"),
            "baremetal_deploy_kernel_image": driver_info.get("deploy_kernel"),
            "baremetal_deploy_ramdisk_image": driver_info.get("deploy_ramdisk"),
            "baremetal_capabilities": node_props.get("capabilities").map(parse_capabilities),
            "cpu_arch": node_props.get("cpu_arch"),
            "management_address": driver_info.get("ipmi_address"),
            "interfaces": interfaces,
            "ipmi_username": driver_info.get("ipmi_username"),
            "ipmi_password": driver_info.get("ipmi_password"),
            "ipmi_port": driver_info.get("ipmi_port"),
            "ipmi_terminal_port": driver_info.get("ipmi_terminal_port"),
        }));

        Ok(Some(ImportedResource {
            uuid: Uuid::parse_str(&node_uuid).ok(),
            name: node.get("name").and_then(Value::as_str).map(String::from),
            properties,
        }))
    }
}

#[async_trait]
impl Worker for ProvisioningWorker {
    fn register_options(&self) -> WorkerOptions {
        WorkerOptions {
            name: WORKER_NAME.to_string(),
            resource_types: vec![RESOURCE_TYPE.to_string()],
            consumes_windows: false,
        }
    }

    fn fields(&self) -> Vec<WorkerField> {
        vec![
            WorkerField::new("management_address", FieldSchema::Host)
                .required()
                .private()
                .description("The out-of-band address, e.g. IPMI."),
            WorkerField::new("interfaces", interfaces_schema())
                .required()
                .description("Network interfaces installed on the node."),
            WorkerField::new("cpu_arch", FieldSchema::Enum(vec!["x86_64", "aarch64"]))
                .required()
                .default_value(json!("x86_64"))
                .description("The CPU architecture."),
            WorkerField::new("baremetal_driver", FieldSchema::Enum(vec!["ipmi"]))
                .default_value(json!("ipmi"))
                .private()
                .description("Hardware driver controlling the node. Only 'ipmi' is supported."),
            WorkerField::new("baremetal_resource_class", FieldSchema::String)
                .default_value(json!("baremetal"))
                .private()
                .description("Resource class used to map instance requests onto nodes."),
            WorkerField::new("baremetal_deploy_kernel_image", FieldSchema::Uuid)
                .private()
                .description("Image UUID of the deploy kernel."),
            WorkerField::new("baremetal_deploy_ramdisk_image", FieldSchema::Uuid)
                .private()
                .description("Image UUID of the deploy ramdisk."),
            WorkerField::new(
                "baremetal_capabilities",
                FieldSchema::object(
                    vec![
                        ("boot_option", FieldSchema::Enum(vec!["local", "netboot", "ramdisk", "kickstart"])),
                        ("boot_mode", FieldSchema::Enum(vec!["bios", "uefi"])),
                        ("secure_boot", FieldSchema::Enum(vec!["true", "false"])),
                        ("trusted_boot", FieldSchema::Enum(vec!["true", "false"])),
                        ("disk_label", FieldSchema::Enum(vec!["msdos", "gpt"])),
                    ],
                    vec![],
                ),
            )
            .private()
            .description("Additional capabilities to set on the node."),
            WorkerField::new("ipmi_username", FieldSchema::String)
                .private()
                .description("IPMI username."),
            WorkerField::new("ipmi_password", FieldSchema::String)
                .private()
                .sensitive()
                .description("IPMI password."),
            WorkerField::new("ipmi_port", FieldSchema::Port)
                .private()
                .description("Remote IPMI RMCP port (623 when unset)."),
            WorkerField::new("ipmi_terminal_port", FieldSchema::Port)
                .private()
                .description("Local port serving the node's remote console; unique per node."),
        ]
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
        _windows: &[ReservationWindow],
        _state_details: &StateDetails,
    ) -> Result<WorkerResult> {
        match self.converge(ctx, resource).await {
            Ok(result) => Ok(result),
            Err(err) => match deferral(&err) {
                Some(reason) => {
                    debug!(resource = %resource.uuid, error = %err, "deferring provisioning");
                    Ok(WorkerResult::defer(reason))
                }
                None => Err(err),
            },
        }
    }

    fn max_run_time(&self) -> Option<Duration> {
        Some(self.worst_case_run())
    }

    fn import_existing<'a>(
        &'a self,
        ctx: &'a WorkerContext,
    ) -> BoxStream<'a, Result<ImportedResource>> {
        Box::pin(async_stream::stream! {
            let nodes = match self
                .client
                .call(&ctx.request_id, ApiRequest::get("/nodes?detail=True"))
                .await
            {
                Ok(response) => array_at(&response.into_value(), "nodes"),
                Err(e) => {
                    yield Err(Error::from(e));
                    return;
                }
            };

            for node in nodes {
                match self.imported_node(ctx, &node).await {
                    Ok(Some(item)) => yield Ok(item),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        })
    }
}

/// Conditions that block convergence only temporarily.
fn deferral(err: &Error) -> Option<&'static str> {
    match err {
        Error::ProvisionTimeout { .. } => Some("failed to change provisioning state"),
        Error::InvalidStateTransition { .. } => Some("invalid state transition"),
        Error::Service(ServiceError::Api { code: 409, .. }) => Some("node is locked"),
        _ => None,
    }
}

fn interfaces_schema() -> FieldSchema {
    FieldSchema::Array {
        items: Box::new(FieldSchema::object(
            vec![
                ("name", FieldSchema::String),
                ("enabled", FieldSchema::Boolean),
                ("mac_address", FieldSchema::String),
                ("vendor", FieldSchema::String),
                ("model", FieldSchema::String),
                ("switch_id", FieldSchema::String),
                ("switch_port_id", FieldSchema::String),
                ("switch_info", FieldSchema::String),
                ("pxe_enabled", FieldSchema::Boolean),
            ],
            vec!["name", "mac_address"],
        )),
        min_items: 1,
    }
}

/// The node as the provisioning service should hold it.
fn desired_node(resource: &Resource) -> Result<Value> {
    let props = &resource.properties;
    let management_address = resource
        .property_str("management_address")
        .ok_or_else(|| Error::MissingProperty("management_address".to_string()))?;

    let capabilities = props
        .get("baremetal_capabilities")
        .and_then(Value::as_object)
        .filter(|caps| !caps.is_empty())
        .map(|caps| {
            caps.iter()
                .map(|(k, v)| match v.as_str() {
                    Some(s) => format!("{k}:{s}"),
                    None => format!("{k}:{v}"),
                })
                .collect::<Vec<_>>()
                .join(",")
        });

    Ok(json!({
        "uuid": resource.uuid.to_string(),
        "name": resource.name,
        "driver": prop_or(resource, "baremetal_driver", "ipmi"),
        "driver_info": {
            "ipmi_address": management_address,
            "ipmi_username": props.get("ipmi_username"),
            "ipmi_password": props.get("ipmi_password"),
            "ipmi_port": props.get("ipmi_port"),
            "ipmi_terminal_port": props.get("ipmi_terminal_port"),
            "deploy_kernel": props.get("baremetal_deploy_kernel_image"),
            "deploy_ramdisk": props.get("baremetal_deploy_ramdisk_image"),
        },
        "resource_class": prop_or(resource, "baremetal_resource_class", "baremetal"),
        "properties": {
            "capabilities": capabilities,
            "cpu_arch": prop_or(resource, "cpu_arch", "x86_64"),
        },
    }))
}

fn desired_port(iface: &Value) -> Value {
    let mut body = json!({
        "extra": {"name": iface.get("name")},
        "local_link_connection": {},
        "pxe_enabled": iface.get("pxe_enabled").and_then(Value::as_bool).unwrap_or(true),
    });

    let switch_id = iface.get("switch_id").and_then(Value::as_str).filter(|s| !s.is_empty());
    let port_id = iface
        .get("switch_port_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    if let (Some(switch_id), Some(port_id)) = (switch_id, port_id) {
        body["local_link_connection"] = json!({
            "switch_id": switch_id,
            "port_id": port_id,
            "switch_info": iface.get("switch_info").cloned().unwrap_or(json!("")),
        });
    }
    body
}

fn port_patch(port: &Value, iface: &Value) -> json_patch::Patch {
    let mut existing = Map::new();
    for key in ["extra", "local_link_connection", "pxe_enabled"] {
        existing.insert(key.to_string(), port.get(key).cloned().unwrap_or(Value::Null));
    }
    let mut existing = Value::Object(existing);
    let mut desired = desired_port(iface);
    normalize_nested(&mut existing, &mut desired, "extra");
    normalize_nested(&mut existing, &mut desired, "local_link_connection");
    json_patch::diff(&existing, &desired)
}

fn success_payload(node: &Value) -> StateDetails {
    payload(json!({
        "node_uuid": node.get("uuid"),
        "created_at": node.get("created_at"),
    }))
}

fn provision_state(node: &Value) -> Option<&str> {
    node.get("provision_state").and_then(Value::as_str)
}

fn required_str(value: &Value, key: &str) -> Result<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| Error::Service(ServiceError::MalformedResponse {
            service: SERVICE_NAME.to_string(),
            text: format!("missing '{key}'"),
        }))
}

fn array_at(value: &Value, key: &str) -> Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// The service shows secrets as a run of asterisks unless configured otherwise.
fn is_masked(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c == '*')
}

/// "k:v,k:v" back into an object.
fn parse_capabilities(value: &Value) -> Value {
    let Some(text) = value.as_str() else {
        return value.clone();
    };
    let mut caps = Map::new();
    for pair in text.split(',').filter(|p| !p.is_empty()) {
        if let Some((k, v)) = pair.split_once(':') {
            caps.insert(k.to_string(), json!(v));
        }
    }
    Value::Object(caps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use futures::StreamExt;

    use crate::client::{ApiVersion, Method, RawResponse};
    use crate::test_util::{FakeTransport, context, count_calls, resource};

    /// In-process stand-in for the provisioning service.
    #[derive(Default)]
    struct FakeIronic {
        nodes: BTreeMap<String, Value>,
        ports: Vec<Value>,
        /// Transition requests are accepted but never complete.
        stuck: bool,
        /// Transition requests fail with 409.
        locked: bool,
        /// Transition requests fail with 400.
        refuse: bool,
        next_port: u32,
    }

    impl FakeIronic {
        fn handle(&mut self, req: &ApiRequest) -> RawResponse {
            let (path, query) = req.path.split_once('?').unwrap_or((req.path.as_str(), ""));
            let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
            match (req.method, segments.as_slice()) {
                (Method::Get, ["nodes"]) => {
                    RawResponse::json(200, &json!({"nodes": self.nodes.values().collect::<Vec<_>>()}))
                }
                (Method::Get, ["nodes", uuid]) => match self.nodes.get(*uuid) {
                    Some(node) => RawResponse::json(200, node),
                    None => RawResponse::json(404, &json!({"error_message": "not found"})),
                },
                (Method::Post, ["nodes"]) => {
                    let mut node = req.body.clone().unwrap();
                    node["provision_state"] = json!("enroll");
                    node["maintenance"] = json!(false);
                    node["created_at"] = json!("2026-01-01T00:00:00+00:00");
                    let uuid = node["uuid"].as_str().unwrap().to_string();
                    self.nodes.insert(uuid, node.clone());
                    RawResponse::json(201, &node)
                }
                (Method::Patch, ["nodes", uuid]) => {
                    let node = self.nodes.get_mut(*uuid).unwrap();
                    apply_patch(node, req.body.as_ref().unwrap());
                    RawResponse::json(200, node)
                }
                (Method::Delete, ["nodes", uuid]) => match self.nodes.remove(*uuid) {
                    Some(_) => {
                        self.ports.retain(|p| p["node_uuid"] != json!(uuid));
                        RawResponse::empty(204)
                    }
                    None => RawResponse::json(404, &json!({"error_message": "not found"})),
                },
                (Method::Put, ["nodes", uuid, "states", "provision"]) => {
                    if self.locked {
                        return RawResponse::json(409, &json!({"error_message": "Node is locked"}));
                    }
                    if self.refuse {
                        return RawResponse::json(400, &json!({"error_message": "bad transition"}));
                    }
                    if !self.stuck {
                        let state = match req.body.as_ref().unwrap()["target"].as_str().unwrap() {
                            "manage" => "manageable",
                            "provide" => "available",
                            other => panic!("unexpected verb {other}"),
                        };
                        self.nodes.get_mut(*uuid).unwrap()["provision_state"] = json!(state);
                    }
                    RawResponse::empty(202)
                }
                (Method::Get, ["ports"]) => {
                    let node = query
                        .split('&')
                        .find_map(|kv| kv.strip_prefix("node="))
                        .unwrap_or_default();
                    let ports: Vec<&Value> = self
                        .ports
                        .iter()
                        .filter(|p| p["node_uuid"] == json!(node))
                        .collect();
                    RawResponse::json(200, &json!({"ports": ports}))
                }
                (Method::Post, ["ports"]) => {
                    self.next_port += 1;
                    let mut port = req.body.clone().unwrap();
                    port["uuid"] = json!(format!("port-{}", self.next_port));
                    self.ports.push(port.clone());
                    RawResponse::json(201, &port)
                }
                (Method::Patch, ["ports", uuid]) => {
                    let port = self
                        .ports
                        .iter_mut()
                        .find(|p| p["uuid"] == json!(uuid))
                        .unwrap();
                    apply_patch(port, req.body.as_ref().unwrap());
                    RawResponse::json(200, port)
                }
                (Method::Delete, ["ports", uuid]) => {
                    self.ports.retain(|p| p["uuid"] != json!(uuid));
                    RawResponse::empty(204)
                }
                other => panic!("unexpected request {other:?}"),
            }
        }
    }

    fn apply_patch(target: &mut Value, ops: &Value) {
        for op in ops.as_array().unwrap() {
            let path = op["path"].as_str().unwrap();
            let (parent, key) = path.rsplit_once('/').unwrap();
            let container = target.pointer_mut(parent).unwrap().as_object_mut().unwrap();
            match op["op"].as_str().unwrap() {
                "add" | "replace" => {
                    container.insert(key.to_string(), op["value"].clone());
                }
                "remove" => {
                    container.remove(key);
                }
                other => panic!("unexpected op {other}"),
            }
        }
    }

    fn setup() -> (ProvisioningWorker, Arc<FakeTransport>, Arc<Mutex<FakeIronic>>) {
        let ironic = Arc::new(Mutex::new(FakeIronic::default()));
        let state = Arc::clone(&ironic);
        let transport = FakeTransport::new(move |req| state.lock().unwrap().handle(req));
        let client = ServiceClient::new(SERVICE_NAME, transport.clone())
            .with_api_version(ApiVersion::new(API_VERSION_HEADER, DEFAULT_API_VERSION));
        (ProvisioningWorker::new(client), transport, ironic)
    }

    /// Registry first, then a paused clock so polling sleeps finish instantly.
    async fn paused_context() -> WorkerContext {
        let ctx = context().await;
        tokio::time::pause();
        ctx
    }

    fn node_resource() -> Resource {
        resource(
            RESOURCE_TYPE,
            "node-1",
            json!({
                "management_address": "10.0.0.10",
                "ipmi_username": "admin",
                "ipmi_password": "secret",
                "cpu_arch": "x86_64",
                "interfaces": [
                    {
                        "name": "eth0",
                        "mac_address": "AA:BB:CC:00:00:01",
                        "switch_id": "sw-1",
                        "switch_port_id": "Ethernet1/1",
                    },
                    {"name": "eth1", "mac_address": "aa:bb:cc:00:00:02", "enabled": false},
                ],
            }),
        )
    }

    async fn run(worker: &ProvisioningWorker, ctx: &WorkerContext, resource: &Resource) -> WorkerResult {
        worker
            .process(ctx, resource, &[], &StateDetails::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_idempotent() {
        let (worker, transport, ironic) = setup();
        let ctx = paused_context().await;
        let node = node_resource();
        let uuid = node.uuid.to_string();

        let result = run(&worker, &ctx, &node).await;
        match &result {
            WorkerResult::Success { payload } => {
                assert_eq!(payload["node_uuid"], json!(uuid));
                assert!(payload.contains_key("created_at"));
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(
            transport.mutating_calls(),
            vec![
                "POST /nodes".to_string(),
                format!("PUT /nodes/{uuid}/states/provision"),
                format!("PUT /nodes/{uuid}/states/provision"),
                format!("PUT /nodes/{uuid}/states/provision"),
                "POST /ports".to_string(),
                format!("PUT /nodes/{uuid}/states/provision"),
            ]
        );
        {
            let ironic = ironic.lock().unwrap();
            assert_eq!(ironic.nodes[&uuid]["provision_state"], "available");
            assert_eq!(ironic.nodes[&uuid]["driver"], "ipmi");
            assert_eq!(ironic.nodes[&uuid]["resource_class"], "baremetal");
            // Disabled interfaces get no port.
            assert_eq!(ironic.ports.len(), 1);
            assert_eq!(
                ironic.ports[0]["local_link_connection"],
                json!({"switch_id": "sw-1", "port_id": "Ethernet1/1", "switch_info": ""})
            );
        }
        assert!(
            transport
                .calls()
                .iter()
                .all(|c| c.headers.contains(&(API_VERSION_HEADER.to_string(), "1.51".to_string())))
        );

        transport.clear();
        let again = run(&worker, &ctx, &node).await;
        assert!(matches!(again, WorkerResult::Success { .. }));
        assert!(transport.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_provide_is_finished_later() {
        let (worker, transport, ironic) = setup();
        let ctx = paused_context().await;
        let node = node_resource();
        let uuid = node.uuid.to_string();
        run(&worker, &ctx, &node).await;

        // A previous pass patched the node, then its provide timed out.
        ironic.lock().unwrap().nodes.get_mut(&uuid).unwrap()["provision_state"] =
            json!("manageable");
        transport.clear();

        let result = run(&worker, &ctx, &node).await;
        assert!(matches!(result, WorkerResult::Success { .. }));
        assert_eq!(
            ironic.lock().unwrap().nodes[&uuid]["provision_state"],
            "available"
        );
        assert_eq!(
            transport.mutating_calls(),
            vec![format!("PUT /nodes/{uuid}/states/provision")]
        );
        let verbs: Vec<Value> = transport
            .calls()
            .into_iter()
            .filter(|c| c.method == Method::Put)
            .map(|c| c.body.unwrap()["target"].clone())
            .collect();
        assert_eq!(verbs, vec![json!("provide")]);

        // Stuck in enroll: manage first, then provide.
        ironic.lock().unwrap().nodes.get_mut(&uuid).unwrap()["provision_state"] = json!("enroll");
        transport.clear();
        run(&worker, &ctx, &node).await;
        assert_eq!(transport.mutating_calls().len(), 2);
        assert_eq!(
            ironic.lock().unwrap().nodes[&uuid]["provision_state"],
            "available"
        );
    }

    #[tokio::test]
    async fn test_deployed_node_left_alone() {
        let (worker, transport, ironic) = setup();
        let ctx = paused_context().await;
        let node = node_resource();
        let uuid = node.uuid.to_string();
        run(&worker, &ctx, &node).await;

        ironic.lock().unwrap().nodes.get_mut(&uuid).unwrap()["provision_state"] = json!("active");
        transport.clear();

        let result = run(&worker, &ctx, &node).await;
        assert!(matches!(result, WorkerResult::Success { .. }));
        assert!(transport.mutating_calls().is_empty());
        assert_eq!(ironic.lock().unwrap().nodes[&uuid]["provision_state"], "active");
    }

    #[test]
    fn test_worst_case_run_covers_every_transition() {
        let client = ServiceClient::new(SERVICE_NAME, FakeTransport::new(|_| RawResponse::empty(204)));
        let worker = ProvisioningWorker::new(client)
            .with_polling(Duration::from_secs(50), Duration::from_secs(15));
        // Four polls of 15s per transition, four transitions.
        assert_eq!(worker.worst_case_run(), Duration::from_secs(240));
    }

    #[tokio::test]
    async fn test_maintenance_guard() {
        let (worker, transport, ironic) = setup();
        let ctx = paused_context().await;
        let mut node = node_resource();
        run(&worker, &ctx, &node).await;

        ironic.lock().unwrap().nodes.get_mut(&node.uuid.to_string()).unwrap()["maintenance"] =
            json!(true);
        node.properties
            .insert("ipmi_username".to_string(), json!("root"));
        transport.clear();

        let result = run(&worker, &ctx, &node).await;
        assert!(result.defer_reason().unwrap().contains("maintenance"));
        assert!(transport.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_sends_minimal_patch() {
        let (worker, transport, _ironic) = setup();
        let ctx = paused_context().await;
        let mut node = node_resource();
        let uuid = node.uuid.to_string();
        run(&worker, &ctx, &node).await;

        node.properties
            .insert("ipmi_username".to_string(), json!("root"));
        transport.clear();
        let result = run(&worker, &ctx, &node).await;
        assert!(matches!(result, WorkerResult::Success { .. }));

        assert_eq!(
            transport.mutating_calls(),
            vec![
                format!("PUT /nodes/{uuid}/states/provision"),
                format!("PATCH /nodes/{uuid}"),
                format!("PUT /nodes/{uuid}/states/provision"),
            ]
        );
        let patch = transport
            .calls()
            .into_iter()
            .find(|c| c.method == Method::Patch)
            .unwrap();
        assert_eq!(
            patch.body.unwrap(),
            json!([{"op": "replace", "path": "/driver_info/ipmi_username", "value": "root"}])
        );
    }

    #[tokio::test]
    async fn test_port_changes() {
        let (worker, transport, ironic) = setup();
        let ctx = paused_context().await;
        let mut node = node_resource();
        run(&worker, &ctx, &node).await;

        // A stray port, a renamed interface and a newly enabled one.
        ironic.lock().unwrap().ports.push(json!({
            "uuid": "port-stray",
            "node_uuid": node.uuid.to_string(),
            "address": "aa:bb:cc:00:00:99",
            "extra": {},
            "local_link_connection": {},
            "pxe_enabled": true,
        }));
        node.properties.insert(
            "interfaces".to_string(),
            json!([
                {"name": "eno1", "mac_address": "aa:bb:cc:00:00:01",
                 "switch_id": "sw-1", "switch_port_id": "Ethernet1/1"},
                {"name": "eth1", "mac_address": "aa:bb:cc:00:00:02"},
            ]),
        );
        transport.clear();

        run(&worker, &ctx, &node).await;
        let uuid = node.uuid.to_string();
        assert_eq!(
            transport.mutating_calls(),
            vec![
                format!("PUT /nodes/{uuid}/states/provision"),
                "POST /ports".to_string(),
                "PATCH /ports/port-1".to_string(),
                "DELETE /ports/port-stray".to_string(),
                format!("PUT /nodes/{uuid}/states/provision"),
            ]
        );
        let ironic = ironic.lock().unwrap();
        assert_eq!(ironic.ports.len(), 2);
        assert_eq!(ironic.ports[0]["extra"]["name"], "eno1");
    }

    #[tokio::test]
    async fn test_timeout_budget() {
        let (worker, transport, ironic) = setup();
        let worker = worker.with_polling(Duration::from_secs(50), Duration::from_secs(15));
        assert_eq!(worker.poll_budget(), 4);
        let ctx = paused_context().await;

        let uuid = Uuid::new_v4().to_string();
        ironic.lock().unwrap().nodes.insert(
            uuid.clone(),
            json!({"uuid": uuid, "provision_state": "enroll"}),
        );
        ironic.lock().unwrap().stuck = true;

        let err = worker
            .ensure_provision_state(&ctx, &uuid, ProvisionState::Manageable)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProvisionTimeout { .. }));
        // One read before the transition request, then exactly the budget.
        assert_eq!(
            count_calls(&transport, Method::Get, &format!("/nodes/{uuid}")),
            1 + 4
        );
        assert_eq!(transport.mutating_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_already_in_target_state() {
        let (worker, transport, ironic) = setup();
        let ctx = paused_context().await;
        let uuid = Uuid::new_v4().to_string();
        ironic.lock().unwrap().nodes.insert(
            uuid.clone(),
            json!({"uuid": uuid, "provision_state": "available"}),
        );

        worker
            .ensure_provision_state(&ctx, &uuid, ProvisionState::Available)
            .await
            .unwrap();
        assert!(transport.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_transition_failures_defer() {
        let ctx = paused_context().await;

        let (worker, _transport, ironic) = setup();
        ironic.lock().unwrap().stuck = true;
        let result = run(&worker, &ctx, &node_resource()).await;
        assert_eq!(result.defer_reason(), Some("failed to change provisioning state"));

        let (worker, _transport, ironic) = setup();
        ironic.lock().unwrap().locked = true;
        let result = run(&worker, &ctx, &node_resource()).await;
        assert_eq!(result.defer_reason(), Some("node is locked"));

        let (worker, _transport, ironic) = setup();
        ironic.lock().unwrap().refuse = true;
        let result = run(&worker, &ctx, &node_resource()).await;
        assert_eq!(result.defer_reason(), Some("invalid state transition"));
    }

    #[tokio::test]
    async fn test_missing_management_address_is_an_error() {
        let (worker, transport, _ironic) = setup();
        let ctx = paused_context().await;
        let node = resource(RESOURCE_TYPE, "node-1", json!({"interfaces": []}));

        let err = worker
            .process(&ctx, &node, &[], &StateDetails::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingProperty(ref f) if f == "management_address"));
        assert!(!err.is_retryable());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_service_error_propagates() {
        let transport = FakeTransport::new(|_| RawResponse::new(500, "boom"));
        let worker = ProvisioningWorker::new(ServiceClient::new(SERVICE_NAME, transport));
        let ctx = paused_context().await;

        let err = worker
            .process(&ctx, &node_resource(), &[], &StateDetails::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(500));
    }

    #[tokio::test]
    async fn test_deleted_resource_removes_node() {
        let (worker, transport, ironic) = setup();
        let ctx = paused_context().await;
        let mut node = node_resource();
        run(&worker, &ctx, &node).await;

        node.deleted = true;
        transport.clear();
        let result = run(&worker, &ctx, &node).await;
        match result {
            WorkerResult::Success { payload } => {
                assert_eq!(payload["node_uuid"], Value::Null);
                assert!(payload["deleted_at"].is_string());
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(
            transport.mutating_calls(),
            vec![format!("DELETE /nodes/{}", node.uuid)]
        );
        assert!(ironic.lock().unwrap().nodes.is_empty());

        // Already gone: still converged.
        let again = run(&worker, &ctx, &node).await;
        assert!(matches!(again, WorkerResult::Success { .. }));
    }

    #[tokio::test]
    async fn test_import_skips_masked_passwords() {
        let (worker, _transport, ironic) = setup();
        let ctx = paused_context().await;
        let visible = Uuid::new_v4().to_string();
        let masked = Uuid::new_v4().to_string();
        {
            let mut ironic = ironic.lock().unwrap();
            for (uuid, password) in [(&visible, "secret"), (&masked, "******")] {
                ironic.nodes.insert(
                    uuid.clone(),
                    json!({
                        "uuid": uuid,
                        "name": format!("node-{password}"),
                        "driver": "ipmi",
                        "resource_class": "baremetal",
                        "driver_info": {
                            "ipmi_address": "10.0.0.10",
                            "ipmi_username": "admin",
                            "ipmi_password": password,
                        },
                        "properties": {"cpu_arch": "x86_64", "capabilities": "boot_mode:uefi"},
                    }),
                );
            }
            ironic.ports.push(json!({
                "uuid": "port-1",
                "node_uuid": visible,
                "address": "aa:bb:cc:00:00:01",
                "extra": {"name": "eth0"},
                "local_link_connection": {"switch_id": "sw-1", "port_id": "Ethernet1/1"},
                "pxe_enabled": true,
            }));
        }

        let items: Vec<ImportedResource> = worker
            .import_existing(&ctx)
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.uuid.unwrap().to_string(), visible);
        assert_eq!(item.name.as_deref(), Some("node-secret"));
        assert_eq!(item.properties["management_address"], "10.0.0.10");
        assert_eq!(item.properties["baremetal_capabilities"], json!({"boot_mode": "uefi"}));
        assert_eq!(item.properties["interfaces"][0]["name"], "eth0");
        assert_eq!(item.properties["interfaces"][0]["switch_port_id"], "Ethernet1/1");
    }

    #[test]
    fn test_fields_cover_desired_node() {
        let transport = FakeTransport::new(|_| RawResponse::empty(204));
        let worker = ProvisioningWorker::new(ServiceClient::new(SERVICE_NAME, transport));
        let schema = worker.json_schema();
        assert_eq!(schema["required"], json!(["management_address", "interfaces", "cpu_arch"]));
        assert!(schema["properties"]["ipmi_password"].is_object());

        let node = node_resource();
        let desired = desired_node(&node).unwrap();
        assert_eq!(desired["driver_info"]["ipmi_address"], "10.0.0.10");
        assert_eq!(desired["properties"]["capabilities"], Value::Null);
    }

    #[test]
    fn test_capabilities_string() {
        let mut node = node_resource();
        node.properties.insert(
            "baremetal_capabilities".to_string(),
            json!({"boot_mode": "uefi", "disk_label": "gpt"}),
        );
        let desired = desired_node(&node).unwrap();
        assert_eq!(desired["properties"]["capabilities"], "boot_mode:uefi,disk_label:gpt");
    }
}
