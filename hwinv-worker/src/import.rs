//! Bootstrap the registry from objects that already exist externally.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::NewResource;
use crate::store::{Registry, TaskSeed};
use crate::worker::{WorkerContext, WorkerRegistry};

/// One external object, merged across every worker that reported it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportRecord {
    pub uuid: Uuid,
    pub resource_type: String,
    pub name: String,
    pub properties: Map<String, Value>,
    /// Whether a registry resource was created for it.
    pub created: bool,
}

/// Collect what every enabled worker can see for `resource_types` and,
/// unless `dry_run`, register it.
///
/// Items are merged by UUID; later workers' properties overlay earlier
/// ones. Imported resources start out STEADY since they already exist
/// externally. UUIDs that are already registered are left alone.
pub async fn import_existing(
    workers: &WorkerRegistry,
    registry: Arc<dyn Registry>,
    resource_types: &[String],
    dry_run: bool,
) -> Result<Vec<ImportRecord>> {
    let ctx = WorkerContext::new(Arc::clone(&registry));
    let mut records: Vec<ImportRecord> = Vec::new();

    for resource_type in resource_types {
        let mut index: HashMap<Uuid, usize> = HashMap::new();
        let first = records.len();

        for worker in workers.for_resource_type(resource_type) {
            let name = worker.register_options().name;
            let mut items = worker.import_existing(&ctx);
            let mut count = 0usize;
            while let Some(item) = items.next().await {
                let item = item?;
                count += 1;
                let uuid = item.uuid.unwrap_or_else(Uuid::new_v4);
                let properties: Map<String, Value> = item
                    .properties
                    .into_iter()
                    .filter(|(_, v)| !v.is_null())
                    .collect();

                match index.get(&uuid) {
                    Some(&i) => {
                        let record = &mut records[i];
                        record.properties.extend(properties);
                        if let Some(name) = item.name {
                            record.name = name;
                        }
                    }
                    None => {
                        index.insert(uuid, records.len());
                        records.push(ImportRecord {
                            uuid,
                            resource_type: resource_type.clone(),
                            name: item.name.unwrap_or_else(|| uuid.to_string()),
                            properties,
                            created: false,
                        });
                    }
                }
            }
            info!(worker = %name, resource_type = %resource_type, count, "collected existing objects");
        }

        if dry_run {
            continue;
        }

        let worker_names = workers.names_for(resource_type);
        for record in &mut records[first..] {
            if registry.get_resource_by_uuid(record.uuid).await?.is_some() {
                info!(uuid = %record.uuid, "already registered, skipping");
                continue;
            }
            if let Err(e) = workers.validate_properties(&record.resource_type, &record.properties) {
                warn!(uuid = %record.uuid, error = %e, "imported properties are invalid, skipping");
                continue;
            }

            let resource = NewResource {
                uuid: record.uuid,
                resource_type: record.resource_type.clone(),
                name: record.name.clone(),
                properties: record.properties.clone(),
            };
            // Due right away so the first pass records each worker's state.
            registry
                .create_resource(resource, &worker_names, TaskSeed::steady(Utc::now()))
                .await?;
            record.created = true;
            info!(uuid = %record.uuid, name = %record.name, "imported resource");
        }
    }

    Ok(records)
}
