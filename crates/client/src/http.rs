//! REST implementation of [`VectorStore`].
//!
//! Wraps a `reqwest::Client` and translates every trait method into the
//! corresponding HTTP call against the destination database, with automatic
//! retry + exponential back-off on transient (5xx / timeout) failures.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use arbor_domain::error::{Error, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use uuid::Uuid;

use crate::store::{Filters, StoredObject, VectorStore};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 2;

/// A REST-based client for the destination vector database.
///
/// Created lazily by the pool and reused until idle restart or key
/// rotation; the underlying `reqwest::Client` maintains a connection pool.
#[derive(Debug, Clone)]
pub struct HttpStore {
    http: Client,
    base_url: String,
    api_key: String,
    /// Third-party keys forwarded so backend modules can call out on the
    /// user's behalf (header `X-<Provider>-Api-Key`).
    extra_headers: BTreeMap<String, String>,
}

impl HttpStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        provider_keys: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        let base_url: String = base_url.into();

        let mut extra_headers = BTreeMap::new();
        for (name, key) in provider_keys {
            if name == "wcd_api_key" || key.is_empty() {
                continue;
            }
            // "openai_api_key" → "X-Openai-Api-Key"
            let header = format!(
                "X-{}-Api-Key",
                capitalize(name.trim_end_matches("_api_key"))
            );
            extra_headers.insert(header, key.clone());
        }

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            extra_headers,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn decorate(&self, rb: RequestBuilder) -> RequestBuilder {
        let mut rb = rb.header("Authorization", format!("Bearer {}", self.api_key));
        for (header, value) in &self.extra_headers {
            rb = rb.header(header, value);
        }
        rb
    }

    /// Execute a request with retry + exponential back-off on transient
    /// errors. Retries 5xx and timeouts; 4xx is permanent. A 404 is
    /// returned to the caller, who decides whether it means "absent".
    async fn execute_with_retry(
        &self,
        endpoint: &str,
        build_request: impl Fn() -> RequestBuilder,
    ) -> Result<Response> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }

            let start = Instant::now();
            let result = self.decorate(build_request()).send().await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    tracing::trace!(endpoint, status = status.as_u16(), duration_ms, "store call");

                    if status.is_server_error() {
                        let body = resp.text().await.unwrap_or_default();
                        last_err = Some(Error::Upstream(format!(
                            "{endpoint} returned {status}: {body}"
                        )));
                        continue;
                    }
                    if status.is_client_error() && status != StatusCode::NOT_FOUND {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(Error::Upstream(format!(
                            "{endpoint} returned {status}: {body}"
                        )));
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    tracing::trace!(endpoint, error = %e, duration_ms, "store call failed");
                    last_err = Some(Error::Http(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::Upstream(format!("{endpoint}: all retries exhausted"))))
    }

    async fn json_body(resp: Response, endpoint: &str) -> Result<Value> {
        resp.json()
            .await
            .map_err(|e| Error::Upstream(format!("{endpoint}: invalid response body: {e}")))
    }

    fn parse_objects(value: &Value) -> Vec<StoredObject> {
        value["objects"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|obj| {
                        let id = obj["id"].as_str()?.parse().ok()?;
                        Some(StoredObject {
                            id,
                            properties: obj["properties"].clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait::async_trait]
impl VectorStore for HttpStore {
    async fn ensure_collection(&self, name: &str) -> Result<()> {
        if self.collection_exists(name).await? {
            return Ok(());
        }
        let url = self.url("/v1/collections");
        let body = serde_json::json!({ "name": name });
        self.execute_with_retry("create_collection", || self.http.post(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let url = self.url(&format!("/v1/collections/{name}"));
        let resp = self
            .execute_with_retry("collection_exists", || self.http.get(&url))
            .await?;
        Ok(resp.status() != StatusCode::NOT_FOUND)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let url = self.url(&format!("/v1/collections/{name}"));
        self.execute_with_retry("delete_collection", || self.http.delete(&url))
            .await?;
        Ok(())
    }

    async fn insert(&self, collection: &str, id: Uuid, properties: Value) -> Result<()> {
        let url = self.url(&format!("/v1/collections/{collection}/objects"));
        let body = serde_json::json!({ "id": id, "properties": properties });
        let resp = self
            .execute_with_retry("insert", || self.http.post(&url).json(&body))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("collection `{collection}`")));
        }
        Ok(())
    }

    async fn update(&self, collection: &str, id: Uuid, properties: Value) -> Result<()> {
        let url = self.url(&format!("/v1/collections/{collection}/objects/{id}"));
        let body = serde_json::json!({ "properties": properties });
        let resp = self
            .execute_with_retry("update", || self.http.put(&url).json(&body))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("object {id} in `{collection}`")));
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, id: Uuid, properties: Value) -> Result<()> {
        match self.update(collection, id, properties.clone()).await {
            Ok(()) => Ok(()),
            Err(Error::NotFound(_)) => self.insert(collection, id, properties).await,
            Err(e) => Err(e),
        }
    }

    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<StoredObject>> {
        let url = self.url(&format!("/v1/collections/{collection}/objects/{id}"));
        let resp = self
            .execute_with_retry("get", || self.http.get(&url))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = Self::json_body(resp, "get").await?;
        Ok(Some(StoredObject {
            id,
            properties: value["properties"].clone(),
        }))
    }

    async fn delete(&self, collection: &str, id: Uuid) -> Result<()> {
        let url = self.url(&format!("/v1/collections/{collection}/objects/{id}"));
        self.execute_with_retry("delete", || self.http.delete(&url))
            .await?;
        Ok(())
    }

    async fn fetch_where(
        &self,
        collection: &str,
        filters: &Filters,
        limit: usize,
    ) -> Result<Vec<StoredObject>> {
        let url = self.url(&format!("/v1/collections/{collection}/query"));
        let body = serde_json::json!({ "filters": filters, "limit": limit });
        let resp = self
            .execute_with_retry("fetch_where", || self.http.post(&url).json(&body))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let value = Self::json_body(resp, "fetch_where").await?;
        Ok(Self::parse_objects(&value))
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let value = self.aggregate(collection, None).await?;
        Ok(value["count"].as_u64().unwrap_or(0))
    }

    async fn query(
        &self,
        collection: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<StoredObject>> {
        let url = self.url(&format!("/v1/collections/{collection}/query"));
        let body = serde_json::json!({ "text": text, "limit": limit });
        let resp = self
            .execute_with_retry("query", || self.http.post(&url).json(&body))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("collection `{collection}`")));
        }
        let value = Self::json_body(resp, "query").await?;
        Ok(Self::parse_objects(&value))
    }

    async fn aggregate(&self, collection: &str, group_by: Option<&str>) -> Result<Value> {
        let url = self.url(&format!("/v1/collections/{collection}/aggregate"));
        let body = serde_json::json!({ "group_by": group_by });
        let resp = self
            .execute_with_retry("aggregate", || self.http.post(&url).json(&body))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("collection `{collection}`")));
        }
        Self::json_body(resp, "aggregate").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_keys_become_forward_headers() {
        let mut keys = BTreeMap::new();
        keys.insert("openai_api_key".to_owned(), "sk-x".to_owned());
        keys.insert("wcd_api_key".to_owned(), "ignored".to_owned());
        keys.insert("gemini_api_key".to_owned(), String::new());

        let store = HttpStore::new("https://db/", "key", &keys).unwrap();
        assert_eq!(store.extra_headers.len(), 1);
        assert_eq!(store.extra_headers["X-Openai-Api-Key"], "sk-x");
        assert_eq!(store.base_url, "https://db");
    }
}
