//! The per-user client pool.
//!
//! Owns at most one store handle, opened lazily on first acquisition and
//! shared by every concurrent caller. Maintenance operations (`reset_keys`,
//! `restart_client`, `close_clients`) take the exclusive write path, so no
//! new acquisition can race a reopen; in-flight callers hold an `Arc` to
//! the old handle and complete against it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_domain::error::{Error, Result};
use arbor_domain::settings::Settings;
use tokio::sync::RwLock;

use crate::http::HttpStore;
use crate::store::SharedStore;

/// How a pool opens its handle.
enum Backend {
    /// Build an [`HttpStore`] from the pooled credentials.
    Http,
    /// Hand out a pre-built store (tests).
    Injected(SharedStore),
}

struct PoolInner {
    wcd_url: String,
    wcd_api_key: String,
    provider_keys: BTreeMap<String, String>,
    handle: Option<SharedStore>,
    last_used: Instant,
    closed: bool,
}

pub struct ClientPool {
    inner: RwLock<PoolInner>,
    backend: Backend,
    client_timeout: Duration,
}

impl ClientPool {
    /// A pool over the given destination credentials. `client_timeout` is
    /// the idle window in minutes before the handle is dropped.
    pub fn new(
        wcd_url: impl Into<String>,
        wcd_api_key: impl Into<String>,
        provider_keys: BTreeMap<String, String>,
        client_timeout_minutes: u64,
    ) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                wcd_url: wcd_url.into(),
                wcd_api_key: wcd_api_key.into(),
                provider_keys,
                handle: None,
                last_used: Instant::now(),
                closed: false,
            }),
            backend: Backend::Http,
            client_timeout: Duration::from_secs(client_timeout_minutes * 60),
        }
    }

    /// A pool seeded from a settings record.
    pub fn from_settings(settings: &Settings, client_timeout_minutes: u64) -> Self {
        Self::new(
            settings.wcd_url.clone(),
            settings.wcd_api_key().to_owned(),
            settings.api_keys.clone(),
            client_timeout_minutes,
        )
    }

    /// A pool that hands out a pre-built store regardless of credentials
    /// (tests). Credentials are set to placeholders so `is_client` is true.
    pub fn with_store(store: SharedStore, client_timeout_minutes: u64) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                wcd_url: "memory://".into(),
                wcd_api_key: "memory".into(),
                provider_keys: BTreeMap::new(),
                handle: None,
                last_used: Instant::now(),
                closed: false,
            }),
            backend: Backend::Injected(store),
            client_timeout: Duration::from_secs(client_timeout_minutes * 60),
        }
    }

    /// True iff credentials are complete and non-empty.
    pub async fn is_client(&self) -> bool {
        let inner = self.inner.read().await;
        !inner.wcd_url.is_empty() && !inner.wcd_api_key.is_empty()
    }

    /// Acquire the shared handle, opening it if necessary.
    ///
    /// The returned `Arc` is the scoped acquisition: it stays valid for the
    /// caller even if the pool swaps or closes the handle underneath, and
    /// releases on drop.
    pub async fn acquire(&self) -> Result<SharedStore> {
        // Fast path: handle already open.
        {
            let inner = self.inner.read().await;
            if inner.closed {
                return Err(Error::Upstream("client pool is closed".into()));
            }
            if let Some(handle) = &inner.handle {
                let handle = handle.clone();
                drop(inner);
                self.touch().await;
                return Ok(handle);
            }
        }

        // Slow path: open under the write lock.
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(Error::Upstream("client pool is closed".into()));
        }
        let handle = match &inner.handle {
            Some(handle) => handle.clone(),
            None => {
                let handle = self.open(&inner)?;
                tracing::debug!(url = %inner.wcd_url, "client handle opened");
                inner.handle = Some(handle.clone());
                handle
            }
        };
        inner.last_used = Instant::now();
        Ok(handle)
    }

    fn open(&self, inner: &PoolInner) -> Result<SharedStore> {
        match &self.backend {
            Backend::Injected(store) => Ok(store.clone()),
            Backend::Http => {
                if inner.wcd_url.is_empty() || inner.wcd_api_key.is_empty() {
                    return Err(Error::Config(
                        "destination credentials not configured; set WCD_URL and WCD_API_KEY"
                            .into(),
                    ));
                }
                Ok(Arc::new(HttpStore::new(
                    inner.wcd_url.clone(),
                    inner.wcd_api_key.clone(),
                    &inner.provider_keys,
                )?))
            }
        }
    }

    async fn touch(&self) {
        self.inner.write().await.last_used = Instant::now();
    }

    /// Close the current handle and swap in new credentials. The next
    /// acquisition reopens against them.
    pub async fn reset_keys(
        &self,
        wcd_url: impl Into<String>,
        wcd_api_key: impl Into<String>,
        provider_keys: BTreeMap<String, String>,
    ) {
        let mut inner = self.inner.write().await;
        inner.wcd_url = wcd_url.into();
        inner.wcd_api_key = wcd_api_key.into();
        inner.provider_keys = provider_keys;
        inner.handle = None;
        tracing::debug!(url = %inner.wcd_url, "client credentials rotated");
    }

    /// Drop the handle if it has been idle longer than the client timeout.
    /// The next acquisition reopens.
    pub async fn restart_client(&self) {
        let mut inner = self.inner.write().await;
        if inner.handle.is_some() && inner.last_used.elapsed() > self.client_timeout {
            inner.handle = None;
            tracing::debug!(url = %inner.wcd_url, "idle client handle closed");
        }
    }

    /// Terminal close at shutdown. Idempotent; later acquisitions fail.
    pub async fn close_clients(&self) {
        let mut inner = self.inner.write().await;
        inner.handle = None;
        inner.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn acquire_opens_lazily_and_shares() {
        let pool = ClientPool::with_store(Arc::new(MemoryStore::new()), 3);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn is_client_requires_credentials() {
        let pool = ClientPool::new("", "", BTreeMap::new(), 3);
        assert!(!pool.is_client().await);

        let pool = ClientPool::new("https://db", "key", BTreeMap::new(), 3);
        assert!(pool.is_client().await);
    }

    #[tokio::test]
    async fn acquire_without_credentials_fails() {
        let pool = ClientPool::new("", "", BTreeMap::new(), 3);
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn restart_client_only_drops_idle_handles() {
        let pool = ClientPool::with_store(Arc::new(MemoryStore::new()), 3);
        pool.acquire().await.unwrap();
        // Just used, so not idle: the handle survives.
        pool.restart_client().await;
        assert!(pool.inner.read().await.handle.is_some());
    }

    #[tokio::test]
    async fn reset_keys_drops_the_handle() {
        let pool = ClientPool::with_store(Arc::new(MemoryStore::new()), 3);
        pool.acquire().await.unwrap();
        pool.reset_keys("https://new", "new-key", BTreeMap::new())
            .await;
        assert!(pool.inner.read().await.handle.is_none());
        assert_eq!(pool.inner.read().await.wcd_url, "https://new");
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let pool = ClientPool::with_store(Arc::new(MemoryStore::new()), 3);
        let held = pool.acquire().await.unwrap();
        pool.close_clients().await;
        pool.close_clients().await;
        assert!(pool.acquire().await.is_err());
        // An in-flight acquisition still works against its Arc.
        assert!(held.collection_exists("anything").await.is_ok());
    }
}
