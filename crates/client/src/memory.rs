//! In-memory [`VectorStore`] used by tests.
//!
//! Relevance search is a naive substring match over the serialized
//! properties, which is all the engine tests need.

use std::collections::BTreeMap;

use arbor_domain::error::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::store::{Filters, StoredObject, VectorStore};

type Collection = BTreeMap<Uuid, Value>;

#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<BTreeMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_collection<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Collection) -> T,
    ) -> Result<T> {
        let mut collections = self.collections.lock();
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("collection `{name}`")))?;
        Ok(f(collection))
    }
}

#[async_trait::async_trait]
impl VectorStore for MemoryStore {
    async fn ensure_collection(&self, name: &str) -> Result<()> {
        self.collections
            .lock()
            .entry(name.to_owned())
            .or_default();
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.collections.lock().contains_key(name))
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.collections.lock().remove(name);
        Ok(())
    }

    async fn insert(&self, collection: &str, id: Uuid, properties: Value) -> Result<()> {
        self.with_collection(collection, |c| {
            if c.contains_key(&id) {
                return Err(Error::Config(format!("object {id} already exists")));
            }
            c.insert(id, properties);
            Ok(())
        })?
    }

    async fn update(&self, collection: &str, id: Uuid, properties: Value) -> Result<()> {
        self.with_collection(collection, |c| {
            match c.get_mut(&id) {
                Some(slot) => {
                    *slot = properties;
                    Ok(())
                }
                None => Err(Error::NotFound(format!("object {id}"))),
            }
        })?
    }

    async fn upsert(&self, collection: &str, id: Uuid, properties: Value) -> Result<()> {
        self.with_collection(collection, |c| {
            c.insert(id, properties);
        })
    }

    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<StoredObject>> {
        self.with_collection(collection, |c| {
            c.get(&id).map(|props| StoredObject {
                id,
                properties: props.clone(),
            })
        })
    }

    async fn delete(&self, collection: &str, id: Uuid) -> Result<()> {
        self.with_collection(collection, |c| {
            c.remove(&id);
        })
    }

    async fn fetch_where(
        &self,
        collection: &str,
        filters: &Filters,
        limit: usize,
    ) -> Result<Vec<StoredObject>> {
        self.with_collection(collection, |c| {
            c.iter()
                .filter(|(_, props)| {
                    filters
                        .iter()
                        .all(|(key, expected)| props.get(key) == Some(expected))
                })
                .take(limit)
                .map(|(id, props)| StoredObject {
                    id: *id,
                    properties: props.clone(),
                })
                .collect()
        })
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        self.with_collection(collection, |c| c.len() as u64)
    }

    async fn query(
        &self,
        collection: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<StoredObject>> {
        let needle = text.to_lowercase();
        self.with_collection(collection, |c| {
            c.iter()
                .filter(|(_, props)| props.to_string().to_lowercase().contains(&needle))
                .take(limit)
                .map(|(id, props)| StoredObject {
                    id: *id,
                    properties: props.clone(),
                })
                .collect()
        })
    }

    async fn aggregate(&self, collection: &str, group_by: Option<&str>) -> Result<Value> {
        self.with_collection(collection, |c| {
            let mut out = serde_json::json!({ "count": c.len() });
            if let Some(field) = group_by {
                let mut groups: BTreeMap<String, u64> = BTreeMap::new();
                for props in c.values() {
                    let key = props
                        .get(field)
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .unwrap_or_else(|| "(missing)".to_owned());
                    *groups.entry(key).or_default() += 1;
                }
                out["groups"] = serde_json::to_value(groups).unwrap_or_default();
            }
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::filter;
    use serde_json::json;

    #[tokio::test]
    async fn object_lifecycle() {
        let store = MemoryStore::new();
        store.ensure_collection("things").await.unwrap();
        let id = Uuid::new_v4();

        store
            .insert("things", id, json!({ "name": "widget" }))
            .await
            .unwrap();
        assert!(store.insert("things", id, json!({})).await.is_err());

        let obj = store.get("things", id).await.unwrap().unwrap();
        assert_eq!(obj.properties["name"], "widget");

        store
            .upsert("things", id, json!({ "name": "gadget" }))
            .await
            .unwrap();
        let obj = store.get("things", id).await.unwrap().unwrap();
        assert_eq!(obj.properties["name"], "gadget");

        store.delete("things", id).await.unwrap();
        assert!(store.get("things", id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_where_matches_all_filters() {
        let store = MemoryStore::new();
        store.ensure_collection("c").await.unwrap();
        store
            .insert("c", Uuid::new_v4(), json!({ "user": "u1", "kind": "a" }))
            .await
            .unwrap();
        store
            .insert("c", Uuid::new_v4(), json!({ "user": "u1", "kind": "b" }))
            .await
            .unwrap();

        let mut filters = filter("user", "u1");
        filters.insert("kind".into(), json!("b"));
        let hits = store.fetch_where("c", &filters, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].properties["kind"], "b");
    }

    #[tokio::test]
    async fn aggregate_groups_by_field() {
        let store = MemoryStore::new();
        store.ensure_collection("c").await.unwrap();
        for kind in ["a", "a", "b"] {
            store
                .insert("c", Uuid::new_v4(), json!({ "kind": kind }))
                .await
                .unwrap();
        }
        let agg = store.aggregate("c", Some("kind")).await.unwrap();
        assert_eq!(agg["count"], 3);
        assert_eq!(agg["groups"]["a"], 2);
        assert_eq!(agg["groups"]["b"], 1);
    }

    #[tokio::test]
    async fn missing_collection_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.count("ghost").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
