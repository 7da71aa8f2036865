//! Tunnel-broker integration.
//!
//! Every entry of a device's `channels` property becomes one broker
//! channel. The channel name to UUID mapping lives in state details under
//! `channels`. Channels cannot be modified in place, so a channel whose
//! type or key changed is deleted and created again.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::{FieldSchema, Worker, WorkerContext, WorkerField, WorkerOptions, WorkerResult, payload};
use crate::client::{ApiRequest, ServiceClient};
use crate::error::{Error, Result, ServiceError};
use crate::model::{ReservationWindow, Resource, StateDetails};

pub const WORKER_NAME: &str = "tunnel";
pub const RESOURCE_TYPE: &str = "device";
pub const SERVICE_NAME: &str = "Tunelo";

const CHANNELS: &str = "channels";
const CHANNEL_TYPES: [&str; 1] = ["wireguard"];

/// A channel as the resource asks for it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChannelSpec {
    channel_type: String,
    public_key: Option<String>,
}

impl ChannelSpec {
    fn parse(name: &str, value: &Value) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidProperty {
            field: CHANNELS.to_string(),
            reason,
        };
        let channel_type = value
            .get("channel_type")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(format!("channel '{name}' needs a channel_type")))?;
        if !CHANNEL_TYPES.contains(&channel_type) {
            return Err(invalid(format!(
                "channel '{name}' has unsupported type '{channel_type}'"
            )));
        }
        Ok(Self {
            channel_type: channel_type.to_string(),
            public_key: value.get("public_key").and_then(Value::as_str).map(String::from),
        })
    }

    /// Whether the broker's channel no longer matches this spec.
    fn differs(&self, channel: &Value) -> bool {
        channel.get("channel_type").and_then(Value::as_str) != Some(self.channel_type.as_str())
            || channel.pointer("/properties/public_key").and_then(Value::as_str)
                != self.public_key.as_deref()
    }
}

pub struct TunnelWorker {
    client: ServiceClient,
    project_id: Option<String>,
}

impl TunnelWorker {
    pub fn new(client: ServiceClient) -> Self {
        Self {
            client,
            project_id: None,
        }
    }

    /// Project that owns the channels created here.
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Existing channels by UUID.
    async fn list_channels(&self, ctx: &WorkerContext) -> Result<BTreeMap<String, Value>> {
        let response = self
            .client
            .call(&ctx.request_id, ApiRequest::get("/channels"))
            .await?
            .into_value();
        Ok(response
            .get("channels")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|c| Some((c.get("uuid")?.as_str()?.to_string(), c.clone())))
            .collect())
    }

    async fn create_channel(&self, ctx: &WorkerContext, spec: &ChannelSpec) -> Result<String> {
        let mut body = json!({
            "channel_type": spec.channel_type,
            "properties": {"public_key": spec.public_key},
        });
        if let Some(project_id) = &self.project_id {
            body["project_id"] = json!(project_id);
        }
        let channel = self
            .client
            .call(&ctx.request_id, ApiRequest::post("/channels", body))
            .await?
            .into_value();
        channel
            .get("uuid")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| {
                Error::Service(ServiceError::MalformedResponse {
                    service: SERVICE_NAME.to_string(),
                    text: "created channel has no 'uuid'".to_string(),
                })
            })
    }

    async fn delete_channel(&self, ctx: &WorkerContext, uuid: &str) -> Result<()> {
        self.client
            .call(
                &ctx.request_id,
                ApiRequest::delete(format!("/channels/{uuid}")).allow(&[404]),
            )
            .await?;
        Ok(())
    }

    /// Apply `desired` on top of the `known` name to UUID mapping. Progress is
    /// recorded in `channels` as it happens so a failure part-way through
    /// still reports what exists.
    async fn sync_channels(
        &self,
        ctx: &WorkerContext,
        desired: &BTreeMap<String, ChannelSpec>,
        known: &BTreeMap<String, String>,
        channels: &mut Map<String, Value>,
    ) -> Result<()> {
        let existing = self.list_channels(ctx).await?;

        for (name, spec) in desired {
            if let Some(uuid) = known.get(name) {
                match existing.get(uuid) {
                    Some(channel) if !spec.differs(channel) => continue,
                    Some(_) => {
                        self.delete_channel(ctx, uuid).await?;
                        channels.remove(name);
                        info!("Channel {} changed, re-creating {}", name, uuid);
                    }
                    None => {
                        channels.remove(name);
                        info!("Channel {} ({}) no longer exists, re-creating", name, uuid);
                    }
                }
            }
            let uuid = self.create_channel(ctx, spec).await?;
            info!("Created {} channel {}", name, uuid);
            channels.insert(name.clone(), json!(uuid));
        }

        for (name, uuid) in known {
            if desired.contains_key(name) {
                continue;
            }
            if existing.contains_key(uuid) {
                self.delete_channel(ctx, uuid).await?;
                info!("Deleted channel {} ({})", name, uuid);
            }
            channels.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for TunnelWorker {
    fn register_options(&self) -> WorkerOptions {
        WorkerOptions {
            name: WORKER_NAME.to_string(),
            resource_types: vec![RESOURCE_TYPE.to_string()],
            consumes_windows: false,
        }
    }

    fn fields(&self) -> Vec<WorkerField> {
        vec![
            WorkerField::new(
                CHANNELS,
                FieldSchema::Object {
                    properties: vec![],
                    required: vec![],
                    additional: true,
                },
            )
            .required()
            .private()
            .description(
                "Communication channels of the device by name, each with a channel_type \
                 and an optional public_key.",
            ),
        ]
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
        _windows: &[ReservationWindow],
        state_details: &StateDetails,
    ) -> Result<WorkerResult> {
        let known: BTreeMap<String, String> = state_details
            .get(CHANNELS)
            .and_then(Value::as_object)
            .into_iter()
            .flatten()
            .filter_map(|(name, uuid)| Some((name.clone(), uuid.as_str()?.to_string())))
            .collect();

        if resource.deleted {
            for (name, uuid) in &known {
                self.delete_channel(ctx, uuid).await?;
                info!("Deleted channel {} ({}) of {}", name, uuid, resource.uuid);
            }
            return Ok(WorkerResult::success(payload(json!({"channels": null}))));
        }

        let desired: BTreeMap<String, ChannelSpec> = resource
            .properties
            .get(CHANNELS)
            .and_then(Value::as_object)
            .ok_or_else(|| Error::MissingProperty(CHANNELS.to_string()))?
            .iter()
            .map(|(name, value)| Ok((name.clone(), ChannelSpec::parse(name, value)?)))
            .collect::<Result<_>>()?;

        let mut channels: Map<String, Value> = known
            .iter()
            .map(|(name, uuid)| (name.clone(), json!(uuid)))
            .collect();
        match self.sync_channels(ctx, &desired, &known, &mut channels).await {
            Ok(()) => Ok(WorkerResult::success(payload(json!({"channels": channels})))),
            Err(e) if e.is_retryable() => {
                debug!(resource = %resource.uuid, error = %e, "channel sync interrupted");
                Ok(WorkerResult::defer_with(
                    payload(json!({"channels": channels})),
                    format!("channel sync interrupted: {e}"),
                ))
            }
            Err(e) => Err(e),
        }
    }
}
