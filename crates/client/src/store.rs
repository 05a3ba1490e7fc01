//! The store interface every backend implements.

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor_domain::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Equality filters: property name → required value.
pub type Filters = BTreeMap<String, Value>;

/// One persisted object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: Uuid,
    pub properties: Value,
}

/// Abstraction over the external vector database.
///
/// Collections are flat namespaces of JSON objects addressed by UUID.
/// `query` and `aggregate` exist for the built-in tools; their result
/// shapes are backend-defined JSON.
#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if it does not exist.
    async fn ensure_collection(&self, name: &str) -> Result<()>;

    async fn collection_exists(&self, name: &str) -> Result<bool>;

    async fn delete_collection(&self, name: &str) -> Result<()>;

    async fn insert(&self, collection: &str, id: Uuid, properties: Value) -> Result<()>;

    async fn update(&self, collection: &str, id: Uuid, properties: Value) -> Result<()>;

    /// Insert or overwrite.
    async fn upsert(&self, collection: &str, id: Uuid, properties: Value) -> Result<()>;

    /// Fetch by id; `Ok(None)` when absent.
    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<StoredObject>>;

    async fn delete(&self, collection: &str, id: Uuid) -> Result<()>;

    /// Fetch objects whose properties equal every filter entry.
    async fn fetch_where(
        &self,
        collection: &str,
        filters: &Filters,
        limit: usize,
    ) -> Result<Vec<StoredObject>>;

    async fn count(&self, collection: &str) -> Result<u64>;

    /// Relevance search used by the `query` tool.
    async fn query(&self, collection: &str, text: &str, limit: usize)
        -> Result<Vec<StoredObject>>;

    /// Aggregation used by the `aggregate` tool: total count, optionally
    /// grouped by one property.
    async fn aggregate(&self, collection: &str, group_by: Option<&str>) -> Result<Value>;
}

pub type SharedStore = Arc<dyn VectorStore>;

/// Convenience for single-property filters.
pub fn filter(key: impl Into<String>, value: impl Into<Value>) -> Filters {
    let mut f = Filters::new();
    f.insert(key.into(), value.into());
    f
}
