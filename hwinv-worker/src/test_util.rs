//! Test utilities: an in-process fake for external services.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::client::{ApiRequest, RawResponse, Transport};
use crate::store::SqliteRegistry;
use crate::worker::WorkerContext;

type Handler = Box<dyn Fn(&ApiRequest) -> Result<RawResponse, String> + Send + Sync>;

/// Scripted transport that records every request it sees.
pub struct FakeTransport {
    handler: Handler,
    calls: Mutex<Vec<ApiRequest>>,
}

impl FakeTransport {
    /// Answer every request with `handler`.
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&ApiRequest) -> RawResponse + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(move |req| Ok(handler(req))),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Fail every request at the transport level.
    pub fn failing(message: &str) -> Arc<Self> {
        let message = message.to_string();
        Arc::new(Self {
            handler: Box::new(move |_| Err(message.clone())),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Requests other than GET, as "METHOD path" strings.
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.method.is_mutating())
            .map(|c| format!("{} {}", c.method, c.path))
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: &ApiRequest) -> Result<RawResponse, String> {
        self.calls.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }
}

/// Build a resource record without going through a store.
pub fn resource(
    resource_type: &str,
    name: &str,
    properties: serde_json::Value,
) -> crate::model::Resource {
    let now = chrono::Utc::now();
    crate::model::Resource {
        id: 1,
        uuid: uuid::Uuid::new_v4(),
        resource_type: resource_type.to_string(),
        name: name.to_string(),
        properties: properties.as_object().cloned().unwrap_or_default(),
        deleted: false,
        suspended: false,
        revision: 1,
        created_at: now,
        updated_at: now,
    }
}

/// Worker context backed by a throwaway in-memory registry.
pub async fn context() -> WorkerContext {
    let registry = SqliteRegistry::in_memory().await.unwrap();
    WorkerContext::new(Arc::new(registry))
}

/// Count of recorded requests with the given method and exact path.
pub fn count_calls(transport: &FakeTransport, method: crate::client::Method, path: &str) -> usize {
    transport
        .calls()
        .iter()
        .filter(|c| c.method == method && c.path == path)
        .count()
}
