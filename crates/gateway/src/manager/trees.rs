//! Per-user tree management.
//!
//! Owns the user's current [`Config`] and the map of live conversations.
//! Structural mutations (add/remove tree, config changes) go through the
//! interior locks; reads hand out `Arc<TreeHandle>` clones so runs never
//! hold the map lock.

use std::collections::HashMap;
use std::sync::Arc;

use arbor_client::ClientPool;
use arbor_domain::config::{BranchInit, Config};
use arbor_domain::error::{Error, Result};
use arbor_domain::settings::{ConfigScope, Settings};
use arbor_tree::{snapshot, Tree, TreeHandle};
use parking_lot::Mutex;
use serde_json::{Map, Value};

pub struct TreeManager {
    user_id: String,
    config: Mutex<Config>,
    trees: Mutex<HashMap<String, Arc<TreeHandle>>>,
}

impl TreeManager {
    pub fn new(user_id: impl Into<String>, config: Config) -> Self {
        Self {
            user_id: user_id.into(),
            config: Mutex::new(config),
            trees: Mutex::new(HashMap::new()),
        }
    }

    // ── config ───────────────────────────────────────────────────────

    pub fn config(&self) -> Config {
        self.config.lock().clone()
    }

    pub fn settings(&self) -> Settings {
        self.config.lock().settings.clone()
    }

    /// Replace the whole config (loading a saved one).
    pub fn set_config(&self, config: Config) {
        *self.config.lock() = config;
    }

    /// Apply a user-scoped partial update. Settings changes propagate to
    /// live trees that inherited the user's settings; persona fields only
    /// affect trees created afterwards.
    pub fn update_config(
        &self,
        settings: Option<&Map<String, Value>>,
        style: Option<&str>,
        agent_description: Option<&str>,
        end_goal: Option<&str>,
        branch_initialisation: Option<BranchInit>,
    ) -> Result<Settings> {
        let updated = {
            let mut config = self.config.lock();
            if let Some(partial) = settings {
                config.settings.configure(partial, ConfigScope::User)?;
            }
            if let Some(style) = style {
                config.style = style.to_owned();
            }
            if let Some(desc) = agent_description {
                config.agent_description = desc.to_owned();
            }
            if let Some(goal) = end_goal {
                config.end_goal = goal.to_owned();
            }
            if let Some(init) = branch_initialisation {
                config.branch_initialisation = init;
            }
            config.settings.clone()
        };

        if settings.is_some() {
            let trees = self.trees.lock();
            for handle in trees.values() {
                if let Ok(mut tree) = handle.tree.try_lock() {
                    tree.settings = updated.clone();
                } else {
                    tracing::debug!(
                        user_id = %self.user_id,
                        "tree busy during settings cascade; it keeps its current settings until idle"
                    );
                }
            }
        }

        Ok(updated)
    }

    // ── tree lifecycle ───────────────────────────────────────────────

    pub fn tree_exists(&self, conversation_id: &str) -> bool {
        self.trees.lock().contains_key(conversation_id)
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.trees.lock().keys().cloned().collect()
    }

    /// Create a tree (idempotent). Settings default to the user's config;
    /// an explicit record pins the tree to its own settings.
    pub fn add_tree(
        &self,
        conversation_id: &str,
        low_memory: bool,
        settings: Option<Settings>,
    ) -> Result<Arc<TreeHandle>> {
        {
            let trees = self.trees.lock();
            if let Some(handle) = trees.get(conversation_id) {
                return Ok(handle.clone());
            }
        }

        let config = self.config();
        let tree = match settings {
            Some(settings) => Tree::with_settings(
                conversation_id,
                self.user_id.clone(),
                settings,
                &config,
                low_memory,
            )?,
            None => Tree::from_config(conversation_id, self.user_id.clone(), &config, low_memory)?,
        };
        let handle = Arc::new(TreeHandle::new(tree));

        let mut trees = self.trees.lock();
        // A racing add wins; return whichever handle landed.
        Ok(trees
            .entry(conversation_id.to_owned())
            .or_insert(handle)
            .clone())
    }

    /// Adopt an already-built tree (snapshot restore).
    pub fn adopt_tree(&self, tree: Tree) -> Arc<TreeHandle> {
        let conversation_id = tree.conversation_id.clone();
        let handle = Arc::new(TreeHandle::new(tree));
        self.trees
            .lock()
            .entry(conversation_id)
            .or_insert(handle)
            .clone()
    }

    pub fn get_tree(&self, conversation_id: &str) -> Result<Arc<TreeHandle>> {
        self.trees
            .lock()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("conversation `{conversation_id}`")))
    }

    pub fn delete_tree_local(&self, conversation_id: &str) {
        self.trees.lock().remove(conversation_id);
    }

    // ── timeout sweep ────────────────────────────────────────────────

    /// Evict trees idle beyond `timeout_minutes`. When `save_trees` is set
    /// and the save pool is connectable, each evictee is snapshotted first.
    /// Trees with a run in flight are skipped and caught by a later sweep.
    pub async fn check_all_trees_timeout(
        &self,
        timeout_minutes: u64,
        save_trees: bool,
        save_pool: &ClientPool,
    ) {
        let timeout = std::time::Duration::from_secs(timeout_minutes * 60);

        let expired: Vec<(String, Arc<TreeHandle>)> = {
            let trees = self.trees.lock();
            trees
                .iter()
                .filter(|(_, handle)| handle.is_idle() && handle.idle_for() > timeout)
                .map(|(id, handle)| (id.clone(), handle.clone()))
                .collect()
        };

        for (conversation_id, handle) in expired {
            if save_trees && save_pool.is_client().await {
                match save_pool.acquire().await {
                    Ok(store) => {
                        let tree = handle.tree.lock().await;
                        if let Err(e) = snapshot::save(store.as_ref(), &tree).await {
                            tracing::warn!(
                                user_id = %self.user_id,
                                conversation_id = %conversation_id,
                                error = %e,
                                "snapshot before eviction failed; evicting anyway"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "save pool unavailable during eviction");
                    }
                }
            }

            // Do not evict a tree that started a run while we snapshotted.
            let mut trees = self.trees.lock();
            if let Some(current) = trees.get(&conversation_id) {
                if current.is_idle() && current.idle_for() > timeout {
                    trees.remove(&conversation_id);
                    tracing::info!(
                        user_id = %self.user_id,
                        conversation_id = %conversation_id,
                        "tree evicted after idle timeout"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_client::MemoryStore;

    fn manager() -> TreeManager {
        TreeManager::new("u1", Config::default())
    }

    #[test]
    fn add_tree_is_idempotent() {
        let mgr = manager();
        let a = mgr.add_tree("c1", false, None).unwrap();
        let b = mgr.add_tree("c1", false, None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(mgr.tree_exists("c1"));
    }

    #[test]
    fn get_missing_tree_is_not_found() {
        let mgr = manager();
        assert!(matches!(
            mgr.get_tree("ghost"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn update_config_cascades_settings_to_idle_trees() {
        let mgr = manager();
        mgr.add_tree("c1", false, None).unwrap();

        let partial = serde_json::json!({ "BASE_MODEL": "new-model" });
        mgr.update_config(partial.as_object(), Some("terse"), None, None, None)
            .unwrap();

        let handle = mgr.get_tree("c1").unwrap();
        let tree = handle.tree.try_lock().unwrap();
        assert_eq!(tree.settings.base_model, "new-model");
        // Persona changes do not retroactively apply.
        assert_ne!(tree.style, "terse");
        assert_eq!(mgr.config().style, "terse");
    }

    #[tokio::test]
    async fn timeout_sweep_keeps_fresh_and_busy_trees() {
        let mgr = manager();
        mgr.add_tree("fresh", false, None).unwrap();
        let busy = mgr.add_tree("busy", false, None).unwrap();
        let _permit = busy
            .acquire_latch(std::time::Duration::from_millis(50))
            .await
            .unwrap();

        let pool = ClientPool::with_store(Arc::new(MemoryStore::new()), 3);
        // Zero timeout: everything idle is "expired".
        mgr.check_all_trees_timeout(0, false, &pool).await;

        assert!(!mgr.tree_exists("fresh"));
        assert!(mgr.tree_exists("busy"));
    }

    #[tokio::test]
    async fn timeout_sweep_snapshots_before_eviction() {
        let mgr = manager();
        mgr.add_tree("c1", false, None).unwrap();
        let store = Arc::new(MemoryStore::new());
        let pool = ClientPool::with_store(store.clone(), 3);

        mgr.check_all_trees_timeout(0, true, &pool).await;

        assert!(!mgr.tree_exists("c1"));
        assert!(snapshot::exists(store.as_ref(), "u1", "c1").await.unwrap());
    }
}
