use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::GatewayError;

// Binding of a public model id to its upstream endpoint and credentials
#[derive(Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelRoute {
    pub id: String,
    pub model: String,
    pub url: String,
    pub api_key: String,
    // send the key raw in this header instead of `Authorization: Bearer`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_header: Option<String>,
}

impl fmt::Debug for ModelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRoute")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("url", &self.url)
            .field("api_key", &"[redacted]")
            .field("api_key_header", &self.api_key_header)
            .finish()
    }
}

/// Source of model routes. Looked up on every request; implementations
/// decide on caching, the gateway never holds on to a route.
#[async_trait]
pub trait RouteStore: Send + Sync {
    async fn resolve(&self, id: &str) -> Result<Option<ModelRoute>, GatewayError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRouteStore {
    routes: DashMap<String, ModelRoute>,
}

impl InMemoryRouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_routes(routes: impl IntoIterator<Item = ModelRoute>) -> Self {
        let store = Self::new();
        for route in routes {
            store.insert(route);
        }
        store
    }

    // Routes file is a JSON array of {id, model, url, apiKey[, apiKeyHeader]}
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let routes: Vec<ModelRoute> = serde_json::from_str(&raw)?;
        for route in &routes {
            if route.id.is_empty() || route.url.is_empty() {
                anyhow::bail!("route entries need a non-empty id and url");
            }
        }
        Ok(Self::from_routes(routes))
    }

    pub fn insert(&self, route: ModelRoute) -> Option<ModelRoute> {
        self.routes.insert(route.id.clone(), route)
    }

    pub fn remove(&self, id: &str) -> Option<ModelRoute> {
        self.routes.remove(id).map(|(_, route)| route)
    }

    pub fn list(&self) -> Vec<ModelRoute> {
        let mut routes: Vec<ModelRoute> = self.routes.iter().map(|r| r.value().clone()).collect();
        routes.sort_by(|a, b| a.id.cmp(&b.id));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl RouteStore for InMemoryRouteStore {
    async fn resolve(&self, id: &str) -> Result<Option<ModelRoute>, GatewayError> {
        Ok(self.routes.get(id).map(|r| r.value().clone()))
    }
}
