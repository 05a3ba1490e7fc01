//! The process-wide user registry.
//!
//! Owns every [`User`]: their tree manager, client pools, and frontend
//! config. Prompt dispatch ([`UserManager::process`]) resolves the user and
//! tree (restoring it from its snapshot when it was evicted) and
//! streams the engine's envelopes, snapshotting afterwards when the user's
//! policy asks for it.
//!
//! Nothing here initialises at import time: the composition root builds
//! one registry explicitly, and tests build their own.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_client::{ClientPool, HttpStore, SharedStore};
use arbor_domain::config::{BranchInit, Config, FrontendConfig};
use arbor_domain::envelope::Envelope;
use arbor_domain::error::{Error, Result};
use arbor_domain::secrets::SecretBox;
use arbor_lm::LmHandle;
use arbor_tree::{engine, snapshot, RunRequest};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::manager::trees::TreeManager;

/// One registered user.
pub struct User {
    pub user_id: String,
    pub trees: TreeManager,
    /// Pool over the user's own destination credentials (tool queries).
    pub pool: Arc<ClientPool>,
    /// Pool over the frontend config's save location (snapshots, configs).
    pub save_pool: Arc<ClientPool>,
    pub frontend_config: Mutex<FrontendConfig>,
    last_request: Mutex<Instant>,
}

impl User {
    pub fn touch(&self) {
        *self.last_request.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_request.lock().elapsed()
    }

    fn has_busy_tree(&self) -> bool {
        self.trees
            .conversation_ids()
            .iter()
            .any(|id| match self.trees.get_tree(id) {
                Ok(handle) => !handle.is_idle(),
                Err(_) => false,
            })
    }
}

/// A prompt submission from the streaming protocol.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub user_id: String,
    pub conversation_id: String,
    pub query_id: String,
    pub query: String,
    pub collection_names: Vec<String>,
    pub training_route: Option<String>,
}

/// Fields accepted by a user-scoped config update.
#[derive(Debug, Default)]
pub struct ConfigUpdate {
    pub settings: Option<Map<String, Value>>,
    pub style: Option<String>,
    pub agent_description: Option<String>,
    pub end_goal: Option<String>,
    pub branch_initialisation: Option<BranchInit>,
}

pub struct UserManager {
    users: RwLock<HashMap<String, Arc<User>>>,
    /// Minutes; 0 disables user eviction.
    user_timeout: u64,
    data_dir: PathBuf,
    secrets: SecretBox,
    /// Pre-resolved model handles for tests; production resolves from each
    /// tree's settings.
    lm_override: Mutex<Option<(LmHandle, LmHandle)>>,
}

impl UserManager {
    pub fn new(user_timeout_minutes: u64, data_dir: PathBuf, secrets: SecretBox) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            user_timeout: user_timeout_minutes,
            data_dir,
            secrets,
            lm_override: Mutex::new(None),
        }
    }

    pub fn secrets(&self) -> &SecretBox {
        &self.secrets
    }

    /// Route every run through fixed model handles instead of resolving
    /// from settings. Test seam.
    pub fn set_lm_override(&self, handles: (LmHandle, LmHandle)) {
        *self.lm_override.lock() = Some(handles);
    }

    // ── registry ─────────────────────────────────────────────────────

    pub fn user_exists(&self, user_id: &str) -> bool {
        self.users.read().contains_key(user_id)
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.users.read().keys().cloned().collect()
    }

    /// Create a user (idempotent). The frontend config is loaded from its
    /// per-user file; settings default to environment smart setup unless a
    /// config is supplied.
    pub fn add_user(&self, user_id: &str, config: Option<Config>) -> Arc<User> {
        self.add_user_with_pools(user_id, config, None, None)
    }

    /// `add_user` with explicit pools, used by tests to point a user at
    /// an in-memory store.
    pub fn add_user_with_pools(
        &self,
        user_id: &str,
        config: Option<Config>,
        pool: Option<Arc<ClientPool>>,
        save_pool: Option<Arc<ClientPool>>,
    ) -> Arc<User> {
        {
            let users = self.users.read();
            if let Some(user) = users.get(user_id) {
                return user.clone();
            }
        }

        let frontend_config =
            FrontendConfig::load_from_file(&self.data_dir, user_id, &self.secrets);
        let config = config.unwrap_or_else(Config::from_smart_setup);

        let pool = pool.unwrap_or_else(|| {
            Arc::new(ClientPool::from_settings(
                &config.settings,
                frontend_config.client_timeout,
            ))
        });
        let save_pool = save_pool.unwrap_or_else(|| {
            Arc::new(ClientPool::new(
                frontend_config.save_location_wcd_url.clone(),
                frontend_config.save_location_wcd_api_key.clone(),
                Default::default(),
                frontend_config.client_timeout,
            ))
        });

        let user = Arc::new(User {
            user_id: user_id.to_owned(),
            trees: TreeManager::new(user_id, config),
            pool,
            save_pool,
            frontend_config: Mutex::new(frontend_config),
            last_request: Mutex::new(Instant::now()),
        });

        let mut users = self.users.write();
        users.entry(user_id.to_owned()).or_insert(user).clone()
    }

    /// Look up a user, refreshing their idle clock.
    pub fn get_user(&self, user_id: &str) -> Result<Arc<User>> {
        let users = self.users.read();
        let user = users
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("user `{user_id}`")))?;
        user.touch();
        Ok(user)
    }

    // ── configuration ────────────────────────────────────────────────

    /// Apply a user-scoped config update and rotate the user's pool onto
    /// the (possibly new) credentials.
    pub async fn update_config(&self, user_id: &str, update: ConfigUpdate) -> Result<Config> {
        let user = self.get_user(user_id)?;
        let settings = user.trees.update_config(
            update.settings.as_ref(),
            update.style.as_deref(),
            update.agent_description.as_deref(),
            update.end_goal.as_deref(),
            update.branch_initialisation,
        )?;

        user.pool
            .reset_keys(
                settings.wcd_url.clone(),
                settings.wcd_api_key().to_owned(),
                settings.api_keys.clone(),
            )
            .await;

        Ok(user.trees.config())
    }

    /// Replace the user's config wholesale (loading a saved config).
    pub async fn apply_loaded_config(&self, user_id: &str, config: Config) -> Result<Config> {
        let user = self.get_user(user_id)?;
        let settings = config.settings.clone();
        user.trees.set_config(config);
        user.pool
            .reset_keys(
                settings.wcd_url.clone(),
                settings.wcd_api_key().to_owned(),
                settings.api_keys.clone(),
            )
            .await;
        Ok(user.trees.config())
    }

    /// Apply a frontend-config update, rotating the save pool when the
    /// save location changed, and persist the file.
    pub async fn update_frontend_config(
        &self,
        user_id: &str,
        partial: &Map<String, Value>,
    ) -> Result<FrontendConfig> {
        let user = self.get_user(user_id)?;
        let (updated, credentials_changed) = {
            let mut frontend_config = user.frontend_config.lock();
            let changed = frontend_config.configure(partial)?;
            (frontend_config.clone(), changed)
        };

        if credentials_changed {
            user.save_pool
                .reset_keys(
                    updated.save_location_wcd_url.clone(),
                    updated.save_location_wcd_api_key.clone(),
                    Default::default(),
                )
                .await;
        }

        updated.save_to_file(&self.data_dir, user_id, &self.secrets)?;
        Ok(updated)
    }

    // ── store access ─────────────────────────────────────────────────

    /// The store snapshots go to: explicit credentials when given,
    /// otherwise the user's save pool.
    pub async fn snapshot_store(
        &self,
        user: &User,
        wcd_url: Option<&str>,
        wcd_api_key: Option<&str>,
    ) -> Result<SharedStore> {
        match (wcd_url, wcd_api_key) {
            (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => Ok(Arc::new(
                HttpStore::new(url, key, &Default::default())?,
            )),
            _ => user.save_pool.acquire().await,
        }
    }

    // ── snapshots ────────────────────────────────────────────────────

    pub async fn save_tree(
        &self,
        user_id: &str,
        conversation_id: &str,
        wcd_url: Option<&str>,
        wcd_api_key: Option<&str>,
    ) -> Result<()> {
        let user = self.get_user(user_id)?;
        let handle = user.trees.get_tree(conversation_id)?;
        let store = self.snapshot_store(&user, wcd_url, wcd_api_key).await?;
        let tree = handle.tree.lock().await;
        snapshot::save(store.as_ref(), &tree).await
    }

    pub async fn tree_exists_in_store(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<bool> {
        let user = self.get_user(user_id)?;
        if !user.save_pool.is_client().await {
            return Ok(false);
        }
        let store = user.save_pool.acquire().await?;
        snapshot::exists(store.as_ref(), user_id, conversation_id).await
    }

    /// Load a saved tree into memory and return its envelope list for the
    /// client to re-render.
    pub async fn load_tree(
        &self,
        user_id: &str,
        conversation_id: &str,
        wcd_url: Option<&str>,
        wcd_api_key: Option<&str>,
    ) -> Result<Vec<Envelope>> {
        let user = self.get_user(user_id)?;
        let store = self.snapshot_store(&user, wcd_url, wcd_api_key).await?;
        let record = snapshot::load(store.as_ref(), user_id, conversation_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("saved conversation `{conversation_id}`"))
            })?;
        let envelopes = record.frontend_payloads.clone();
        let tree = snapshot::restore(record, &user.trees.config(), false)?;
        user.trees.adopt_tree(tree);
        Ok(envelopes)
    }

    pub async fn delete_tree(
        &self,
        user_id: &str,
        conversation_id: &str,
        wcd_url: Option<&str>,
        wcd_api_key: Option<&str>,
    ) -> Result<()> {
        let user = self.get_user(user_id)?;
        if let Ok(store) = self.snapshot_store(&user, wcd_url, wcd_api_key).await {
            snapshot::delete(store.as_ref(), user_id, conversation_id).await?;
        }
        user.trees.delete_tree_local(conversation_id);
        Ok(())
    }

    pub async fn get_saved_trees(&self, user_id: &str) -> Result<Value> {
        let user = self.get_user(user_id)?;
        if !user.save_pool.is_client().await {
            return Ok(Value::Object(Default::default()));
        }
        let store = user.save_pool.acquire().await?;
        snapshot::list(store.as_ref(), user_id).await
    }

    // ── prompt dispatch ──────────────────────────────────────────────

    /// Dispatch a prompt. The returned receiver yields the run's envelopes;
    /// timeout conditions surface as a single dedicated envelope.
    pub async fn process(&self, req: ProcessRequest) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(64);

        let user = match self.get_user(&req.user_id) {
            Ok(user) => user,
            Err(_) => {
                let _ = tx
                    .send(Envelope::user_timeout(
                        &req.user_id,
                        &req.conversation_id,
                        &req.query_id,
                    ))
                    .await;
                return rx;
            }
        };

        // Resolve the tree, restoring from its snapshot when evicted.
        let handle = match user.trees.get_tree(&req.conversation_id) {
            Ok(handle) => handle,
            Err(_) => {
                match self
                    .restore_evicted_tree(&user, &req.conversation_id)
                    .await
                {
                    Ok(Some(handle)) => handle,
                    Ok(None) => {
                        let _ = tx
                            .send(Envelope::tree_timeout(
                                &req.user_id,
                                &req.conversation_id,
                                &req.query_id,
                            ))
                            .await;
                        return rx;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Envelope::error(
                                &req.user_id,
                                &req.conversation_id,
                                &req.query_id,
                                e.to_string(),
                            ))
                            .await;
                        return rx;
                    }
                }
            }
        };

        // Entity spans go out ahead of the run, and into the tree's log;
        // restore reads the user prompts back out of these frames.
        let ner_envelope = Envelope::new(
            arbor_domain::envelope::EnvelopeKind::Ner,
            &req.user_id,
            &req.conversation_id,
            &req.query_id,
            crate::ner::named_entity_recognition(&req.query),
        );
        if let Ok(mut tree) = handle.tree.try_lock() {
            tree.record_envelope(&ner_envelope);
        }
        let _ = tx.send(ner_envelope).await;

        let run_req = RunRequest {
            user_id: req.user_id.clone(),
            conversation_id: req.conversation_id.clone(),
            query_id: req.query_id.clone(),
            prompt: req.query.clone(),
            collection_names: req.collection_names.clone(),
            training_route: req.training_route.clone(),
        };
        let lm_override = self.lm_override.lock().clone();
        let mut engine_rx =
            engine::run_with_handles(handle.clone(), user.pool.clone(), run_req, lm_override);

        // Relay: refresh the user's idle clock per envelope, snapshot after
        // the run when the policy asks for it.
        let save_trees = user.frontend_config.lock().save_trees_to_destination;
        let save_pool = user.save_pool.clone();
        let relay_user = user.clone();
        tokio::spawn(async move {
            while let Some(envelope) = engine_rx.recv().await {
                relay_user.touch();
                if tx.send(envelope).await.is_err() {
                    // Consumer hung up; dropping engine_rx cancels the run.
                    break;
                }
            }
            drop(engine_rx);

            if save_trees && save_pool.is_client().await {
                if let Ok(store) = save_pool.acquire().await {
                    // The run has released the latch by the time its channel
                    // closes; this lock does not contend with it.
                    let tree = handle.tree.lock().await;
                    if let Err(e) = snapshot::save(store.as_ref(), &tree).await {
                        tracing::warn!(
                            conversation_id = %tree.conversation_id,
                            error = %e,
                            "post-run snapshot failed"
                        );
                    }
                }
            }
        });

        rx
    }

    async fn restore_evicted_tree(
        &self,
        user: &Arc<User>,
        conversation_id: &str,
    ) -> Result<Option<Arc<arbor_tree::TreeHandle>>> {
        if !user.save_pool.is_client().await {
            return Ok(None);
        }
        let store = user.save_pool.acquire().await?;
        let Some(record) = snapshot::load(store.as_ref(), &user.user_id, conversation_id).await?
        else {
            return Ok(None);
        };
        let tree = snapshot::restore(record, &user.trees.config(), false)?;
        Ok(Some(user.trees.adopt_tree(tree)))
    }

    // ── scheduler entry points ───────────────────────────────────────

    /// Sweep every user's trees against their own tree timeout.
    pub async fn check_all_trees_timeout(&self) {
        let users: Vec<Arc<User>> = self.users.read().values().cloned().collect();
        for user in users {
            let (timeout, save_trees) = {
                let frontend_config = user.frontend_config.lock();
                (
                    frontend_config.tree_timeout,
                    frontend_config.save_trees_to_destination,
                )
            };
            user.trees
                .check_all_trees_timeout(timeout, save_trees, &user.save_pool)
                .await;
        }
    }

    /// Evict users idle beyond the user timeout. A timeout of zero disables
    /// eviction; users with a run in flight are never evicted.
    pub async fn check_all_users_timeout(&self) {
        if self.user_timeout == 0 {
            return;
        }
        let timeout = Duration::from_secs(self.user_timeout * 60);

        let expired: Vec<String> = {
            let users = self.users.read();
            users
                .iter()
                .filter(|(_, user)| user.idle_for() > timeout && !user.has_busy_tree())
                .map(|(id, _)| id.clone())
                .collect()
        };

        for user_id in expired {
            let removed = {
                let mut users = self.users.write();
                match users.get(&user_id) {
                    Some(user) if user.idle_for() > timeout && !user.has_busy_tree() => {
                        users.remove(&user_id)
                    }
                    _ => None,
                }
            };
            if let Some(user) = removed {
                user.pool.close_clients().await;
                user.save_pool.close_clients().await;
                tracing::info!(user_id = %user_id, "user evicted after idle timeout");
            }
        }
    }

    /// Drop idle client handles across all users.
    pub async fn check_restart_clients(&self) {
        let users: Vec<Arc<User>> = self.users.read().values().cloned().collect();
        for user in users {
            user.pool.restart_client().await;
            user.save_pool.restart_client().await;
        }
    }

    /// Terminal close of every pool, at process shutdown.
    pub async fn close_all_clients(&self) {
        let users: Vec<Arc<User>> = self.users.read().values().cloned().collect();
        for user in users {
            user.pool.close_clients().await;
            user.save_pool.close_clients().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_domain::envelope::EnvelopeKind;

    fn manager() -> UserManager {
        let dir = tempfile::tempdir().unwrap();
        UserManager::new(20, dir.path().to_path_buf(), SecretBox::ephemeral())
    }

    fn request(user_id: &str, conversation_id: &str) -> ProcessRequest {
        ProcessRequest {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            query_id: "q1".into(),
            query: "hello".into(),
            collection_names: vec![],
            training_route: None,
        }
    }

    #[test]
    fn add_user_is_idempotent() {
        let mgr = manager();
        let a = mgr.add_user("u1", None);
        let b = mgr.add_user("u1", None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.user_count(), 1);
    }

    #[test]
    fn get_user_refreshes_idle_clock() {
        let mgr = manager();
        mgr.add_user("u1", None);
        let user = mgr.get_user("u1").unwrap();
        assert!(user.idle_for() < Duration::from_secs(1));
        assert!(matches!(mgr.get_user("ghost"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn process_for_unknown_user_yields_user_timeout() {
        let mgr = manager();
        let mut rx = mgr.process(request("nobody", "c1")).await;
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::UserTimeoutError);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn process_for_unknown_tree_without_snapshot_yields_tree_timeout() {
        let mgr = manager();
        mgr.add_user("u1", None);
        let mut rx = mgr.process(request("u1", "missing")).await;
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::TreeTimeoutError);
    }

    #[tokio::test]
    async fn user_timeout_zero_disables_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = UserManager::new(0, dir.path().to_path_buf(), SecretBox::ephemeral());
        mgr.add_user("u1", None);
        mgr.check_all_users_timeout().await;
        assert!(mgr.user_exists("u1"));
    }

    #[tokio::test]
    async fn active_users_are_never_evicted() {
        // A one-minute timeout against a just-created user: idle_for is far
        // below the threshold, so the sweep must keep them.
        let dir = tempfile::tempdir().unwrap();
        let mgr = UserManager::new(1, dir.path().to_path_buf(), SecretBox::ephemeral());
        mgr.add_user("u1", None);
        mgr.check_all_users_timeout().await;
        assert!(mgr.user_exists("u1"));
    }
}
