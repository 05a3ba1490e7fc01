//! Tree snapshots in the external database.
//!
//! A snapshot is the ordered list of envelopes a tree emitted over its
//! lifetime, which is exactly what a client needs to re-render the conversation,
//! plus addressing and the title. Restoring seeds the visible history from
//! the envelope log (`ner` frames carry the user prompts, `response`
//! frames the assistant messages); the environment rehydrates lazily as
//! tools run again.

use arbor_domain::collections::TREES;
use arbor_domain::config::Config;
use arbor_domain::envelope::{Envelope, EnvelopeKind};
use arbor_domain::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use arbor_client::{filter, VectorStore};

use crate::tree::Tree;

/// Deterministic object id for a tree: uuid-v5 of `user_id/conversation_id`,
/// so every save of the same conversation lands on the same object.
pub fn tree_object_id(user_id: &str, conversation_id: &str) -> Uuid {
    let name = format!("{user_id}/{conversation_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// The persisted payload of one tree.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub user_id: String,
    pub conversation_id: String,
    pub config_id: String,
    pub title: String,
    pub last_update_time: DateTime<Utc>,
    pub frontend_payloads: Vec<Envelope>,
}

impl SnapshotRecord {
    pub fn from_tree(tree: &Tree) -> Self {
        Self {
            user_id: tree.user_id.clone(),
            conversation_id: tree.conversation_id.clone(),
            config_id: tree.config_id.clone(),
            title: tree.title.clone().unwrap_or_default(),
            last_update_time: Utc::now(),
            frontend_payloads: tree.envelope_log.clone(),
        }
    }

    fn to_properties(&self) -> Result<Value> {
        Ok(serde_json::json!({
            "user_id": self.user_id,
            "conversation_id": self.conversation_id,
            "config_id": self.config_id,
            "title": self.title,
            "last_update_time": self.last_update_time.to_rfc3339(),
            "frontend_payloads": serde_json::to_value(&self.frontend_payloads)?,
        }))
    }

    fn from_properties(properties: &Value) -> Result<Self> {
        let get = |key: &str| -> String {
            properties
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        let last_update_time = properties
            .get("last_update_time")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let frontend_payloads = properties
            .get("frontend_payloads")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            user_id: get("user_id"),
            conversation_id: get("conversation_id"),
            config_id: get("config_id"),
            title: get("title"),
            last_update_time,
            frontend_payloads,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn save(store: &dyn VectorStore, tree: &Tree) -> Result<()> {
    let record = SnapshotRecord::from_tree(tree);
    store.ensure_collection(TREES).await?;
    store
        .upsert(
            TREES,
            tree_object_id(&record.user_id, &record.conversation_id),
            record.to_properties()?,
        )
        .await?;
    tracing::debug!(
        conversation_id = %record.conversation_id,
        envelopes = record.frontend_payloads.len(),
        "tree snapshot saved"
    );
    Ok(())
}

pub async fn exists(
    store: &dyn VectorStore,
    user_id: &str,
    conversation_id: &str,
) -> Result<bool> {
    if !store.collection_exists(TREES).await? {
        return Ok(false);
    }
    Ok(store
        .get(TREES, tree_object_id(user_id, conversation_id))
        .await?
        .is_some())
}

pub async fn load(
    store: &dyn VectorStore,
    user_id: &str,
    conversation_id: &str,
) -> Result<Option<SnapshotRecord>> {
    if !store.collection_exists(TREES).await? {
        return Ok(None);
    }
    match store
        .get(TREES, tree_object_id(user_id, conversation_id))
        .await?
    {
        Some(object) => Ok(Some(SnapshotRecord::from_properties(&object.properties)?)),
        None => Ok(None),
    }
}

pub async fn delete(
    store: &dyn VectorStore,
    user_id: &str,
    conversation_id: &str,
) -> Result<()> {
    if !store.collection_exists(TREES).await? {
        return Ok(());
    }
    store
        .delete(TREES, tree_object_id(user_id, conversation_id))
        .await
}

/// Saved trees for a user: conversation id → `{title, last_update_time}`.
pub async fn list(store: &dyn VectorStore, user_id: &str) -> Result<Value> {
    if !store.collection_exists(TREES).await? {
        return Ok(Value::Object(Default::default()));
    }
    let objects = store
        .fetch_where(TREES, &filter("user_id", user_id), 10_000)
        .await?;

    let mut out = serde_json::Map::new();
    for object in objects {
        let conversation_id = object
            .properties
            .get("conversation_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        out.insert(
            conversation_id,
            serde_json::json!({
                "title": object.properties.get("title").cloned().unwrap_or_default(),
                "last_update_time": object
                    .properties
                    .get("last_update_time")
                    .cloned()
                    .unwrap_or_default(),
            }),
        );
    }
    Ok(Value::Object(out))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Restore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rebuild a live tree from a snapshot, under the user's current config.
///
/// The envelope log is restored verbatim; the visible history is seeded
/// from it. The environment starts empty and repopulates as tools run;
/// the next snapshot simply extends the same log.
pub fn restore(record: SnapshotRecord, config: &Config, low_memory: bool) -> Result<Tree> {
    if record.conversation_id.is_empty() {
        return Err(Error::Config("snapshot has no conversation_id".into()));
    }
    let mut tree = Tree::from_config(
        record.conversation_id.clone(),
        record.user_id.clone(),
        config,
        low_memory,
    )?;
    if !record.config_id.is_empty() {
        tree.config_id = record.config_id.clone();
    }
    if !record.title.is_empty() {
        tree.title = Some(record.title.clone());
    }

    for envelope in &record.frontend_payloads {
        match envelope.kind {
            EnvelopeKind::Ner => {
                if let Some(text) = envelope.payload.get("text").and_then(Value::as_str) {
                    tree.history.push_user(text);
                }
            }
            EnvelopeKind::Response => {
                if let Some(text) = envelope.payload.get("text").and_then(Value::as_str) {
                    tree.history.push_assistant(text);
                }
            }
            EnvelopeKind::Completed => {
                tree.runs_completed += 1;
            }
            _ => {}
        }
    }
    tree.envelope_log = record.frontend_payloads;

    tracing::debug!(
        conversation_id = %tree.conversation_id,
        messages = tree.history.len(),
        runs = tree.runs_completed,
        "tree restored from snapshot"
    );
    Ok(tree)
}
