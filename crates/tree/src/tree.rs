//! Per-conversation state.
//!
//! A [`Tree`] owns everything one conversation accumulates: its settings
//! (inherited from the user's config at creation), its decision graph and
//! tool registry, the environment, the visible history, the tasks ledger,
//! and the ordered log of every envelope it has emitted (the snapshot
//! payload). A [`TreeHandle`] wraps the tree with its completion latch and
//! idle clock for the managers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_domain::config::{BranchInit, Config};
use arbor_domain::envelope::{Envelope, EnvelopeKind};
use arbor_domain::error::{Error, Result};
use arbor_domain::settings::{ConfigScope, Settings};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::environment::Environment;
use crate::graph::TreeGraph;
use crate::history::ConversationHistory;
use crate::tasks::TasksCompleted;
use crate::tool::{SharedTool, ToolRegistry};
use crate::tools::builtin_registry;

pub struct Tree {
    pub conversation_id: String,
    pub user_id: String,
    pub settings: Settings,
    pub style: String,
    pub agent_description: String,
    pub end_goal: String,
    pub branch_initialisation: BranchInit,
    /// Id of the config this tree inherited from.
    pub config_id: String,
    pub graph: TreeGraph,
    pub registry: ToolRegistry,
    pub environment: Environment,
    pub history: ConversationHistory,
    pub tasks_completed: TasksCompleted,
    /// End-to-end prompt runs finished on this tree.
    pub runs_completed: u32,
    /// Title generated after the first run.
    pub title: Option<String>,
    /// Every recordable envelope emitted over the tree's lifetime.
    pub envelope_log: Vec<Envelope>,
    pub low_memory: bool,
}

impl Tree {
    /// Build a tree from a user's config.
    pub fn from_config(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        config: &Config,
        low_memory: bool,
    ) -> Result<Self> {
        Self::with_settings(
            conversation_id,
            user_id,
            config.settings.clone(),
            config,
            low_memory,
        )
    }

    /// Build a tree from a config but with explicitly supplied settings.
    pub fn with_settings(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        settings: Settings,
        config: &Config,
        low_memory: bool,
    ) -> Result<Self> {
        let registry = builtin_registry();
        let graph = TreeGraph::from_template(config.branch_initialisation, &registry.descriptors())?;

        Ok(Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            settings,
            style: config.style.clone(),
            agent_description: config.agent_description.clone(),
            end_goal: config.end_goal.clone(),
            branch_initialisation: config.branch_initialisation,
            config_id: config.id.clone(),
            graph,
            registry,
            environment: Environment::new(),
            history: ConversationHistory::new(),
            tasks_completed: TasksCompleted::new(),
            runs_completed: 0,
            title: None,
            envelope_log: Vec::new(),
            low_memory,
        })
    }

    // ── tool management ──────────────────────────────────────────────

    /// Register a tool implementation and attach its node to the graph.
    pub fn add_tool(
        &mut self,
        tool: SharedTool,
        parent_branch_id: &str,
        from_tool_ids: Option<&[String]>,
    ) -> Result<()> {
        let node = tool.node();
        self.graph.add_tool(node, parent_branch_id, from_tool_ids)?;
        self.registry.register(tool);
        Ok(())
    }

    /// Attach an already-registered tool (by name) somewhere else in the
    /// graph; the control-surface path.
    pub fn add_tool_by_name(
        &mut self,
        name: &str,
        parent_branch_id: &str,
        from_tool_ids: Option<&[String]>,
    ) -> Result<()> {
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("tool `{name}`")))?
            .clone();
        self.graph
            .add_tool(tool.node(), parent_branch_id, from_tool_ids)
    }

    /// Detach a tool node. The implementation stays registered: the same
    /// tool may still be attached elsewhere in the graph.
    pub fn remove_tool(
        &mut self,
        tool_id: &str,
        parent_branch_id: &str,
        from_tool_ids: Option<&[String]>,
    ) -> Result<()> {
        self.graph
            .remove_tool(tool_id, parent_branch_id, from_tool_ids)
    }

    // ── configuration ────────────────────────────────────────────────

    /// Apply a tree-scoped partial settings update. Credential keys and the
    /// destination URL are stripped before application.
    pub fn configure_settings(&mut self, partial: &Map<String, Value>) -> Result<()> {
        self.settings.configure(partial, ConfigScope::Tree)
    }

    /// Re-template the graph. Only allowed before the first run; a live
    /// conversation keeps the graph it started with.
    pub fn change_branch_initialisation(&mut self, init: BranchInit) -> Result<()> {
        if self.runs_completed > 0 {
            return Err(Error::Config(
                "cannot re-template a conversation that has already run".into(),
            ));
        }
        self.graph = TreeGraph::from_template(init, &self.registry.descriptors())?;
        self.branch_initialisation = init;
        Ok(())
    }

    // ── envelope log ─────────────────────────────────────────────────

    /// Append a frame to the lifetime log. Heartbeats are skipped; in
    /// low-memory mode the heavyweight `result` frames are dropped too, so
    /// long conversations hold only their lightweight transcript.
    pub fn record_envelope(&mut self, envelope: &Envelope) {
        if !envelope.is_recordable() {
            return;
        }
        if self.low_memory && envelope.kind == EnvelopeKind::Result {
            return;
        }
        self.envelope_log.push(envelope.clone());
    }

    /// Export shape returned by the init endpoint.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "conversation_id": self.conversation_id,
            "user_id": self.user_id,
            "config_id": self.config_id,
            "branch_initialisation": self.branch_initialisation.as_str(),
            "title": self.title,
            "runs_completed": self.runs_completed,
            "tree": self.graph.to_json(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TreeHandle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tree plus its run coordination state.
///
/// The completion latch is a one-permit semaphore: holding the permit means
/// a run is in flight. `Semaphore` hands permits out FIFO, so a queued
/// second run proceeds as soon as the first releases.
pub struct TreeHandle {
    pub tree: Mutex<Tree>,
    latch: Arc<Semaphore>,
    last_request: parking_lot::Mutex<Instant>,
}

impl TreeHandle {
    pub fn new(tree: Tree) -> Self {
        Self {
            tree: Mutex::new(tree),
            latch: Arc::new(Semaphore::new(1)),
            last_request: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Wait for the completion latch, up to `wait`. `Err(Timeout)` means
    /// another run held it for the whole window.
    pub async fn acquire_latch(&self, wait: Duration) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(wait, self.latch.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::Upstream("conversation closed".into())),
            Err(_) => Err(Error::Upstream("conversation busy".into())),
        }
    }

    /// True when no run is in flight.
    pub fn is_idle(&self) -> bool {
        self.latch.available_permits() > 0
    }

    pub fn touch(&self) {
        *self.last_request.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_request.lock().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn from_config_builds_one_branch_template() {
        let tree = Tree::from_config("c1", "u1", &config(), false).unwrap();
        let root = tree.graph.root();
        let ids: Vec<&str> = root.options.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["query", "aggregate", "text_response"]);
        assert!(tree.registry.contains("summarize"));
        assert_eq!(tree.runs_completed, 0);
    }

    #[test]
    fn retemplating_is_blocked_after_a_run() {
        let mut tree = Tree::from_config("c1", "u1", &config(), false).unwrap();
        tree.change_branch_initialisation(BranchInit::MultiBranch).unwrap();
        assert!(tree.graph.root().child("search").is_some());

        tree.runs_completed = 1;
        assert!(tree
            .change_branch_initialisation(BranchInit::OneBranch)
            .is_err());
    }

    #[test]
    fn envelope_log_skips_heartbeats() {
        let mut tree = Tree::from_config("c1", "u1", &config(), false).unwrap();
        tree.record_envelope(&Envelope::heartbeat());
        tree.record_envelope(&Envelope::error("u1", "c1", "q1", "x"));
        assert_eq!(tree.envelope_log.len(), 1);
    }

    #[test]
    fn low_memory_drops_result_frames_from_the_log() {
        let mut tree = Tree::from_config("c1", "u1", &config(), true).unwrap();
        let result = Envelope::new(
            EnvelopeKind::Result,
            "u1",
            "c1",
            "q1",
            serde_json::json!({ "objects": [] }),
        );
        let status = Envelope::new(
            EnvelopeKind::Status,
            "u1",
            "c1",
            "q1",
            serde_json::json!({ "text": "..." }),
        );
        tree.record_envelope(&result);
        tree.record_envelope(&status);
        assert_eq!(tree.envelope_log.len(), 1);
        assert_eq!(tree.envelope_log[0].kind, EnvelopeKind::Status);
    }

    #[tokio::test]
    async fn latch_blocks_second_acquisition() {
        let handle = TreeHandle::new(Tree::from_config("c1", "u1", &config(), false).unwrap());
        assert!(handle.is_idle());

        let permit = handle.acquire_latch(Duration::from_millis(50)).await.unwrap();
        assert!(!handle.is_idle());

        let err = handle
            .acquire_latch(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("busy"));

        drop(permit);
        assert!(handle.is_idle());
        handle.acquire_latch(Duration::from_millis(50)).await.unwrap();
    }
}
