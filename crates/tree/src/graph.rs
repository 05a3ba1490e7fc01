//! The decision graph: branches (choice points) and tool leaves.
//!
//! Nodes are owned by their parent, so the structure is a tree by
//! construction and cycles cannot arise; linkage is by id, never by
//! pointer. Tool nodes may themselves carry options: a tool reachable
//! only after another tool has run sits under that tool's node.
//!
//! Every mutation validates all its preconditions before touching the
//! graph, so a failed operation leaves the structure unchanged.

use arbor_domain::config::BranchInit;
use arbor_domain::error::{Error, Result};
use arbor_domain::schema::InputSchema;
use serde_json::Value;

/// The id of the fallback tool every graph must be able to reach.
pub const TEXT_RESPONSE: &str = "text_response";

/// The default root branch id used by the templates.
pub const ROOT_BRANCH: &str = "base";

const ROOT_INSTRUCTION: &str =
    "Choose the next action that brings you closest to satisfying the user's \
     request. Prefer gathering information before responding.";

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Branch {
        /// Guidance shown to the selector at this choice point.
        instruction: String,
    },
    Tool {
        inputs: InputSchema,
        terminal: bool,
    },
}

/// One node in the graph. `options` is ordered: selectors see children in
/// insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub description: String,
    pub status: String,
    pub options: Vec<Node>,
}

impl Node {
    pub fn branch(
        id: impl Into<String>,
        instruction: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Branch {
                instruction: instruction.into(),
            },
            description: description.into(),
            status: String::new(),
            options: Vec::new(),
        }
    }

    pub fn tool(
        id: impl Into<String>,
        description: impl Into<String>,
        status: impl Into<String>,
        inputs: InputSchema,
        terminal: bool,
    ) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Tool { inputs, terminal },
            description: description.into(),
            status: status.into(),
            options: Vec::new(),
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.kind, NodeKind::Branch { .. })
    }

    pub fn is_tool(&self) -> bool {
        matches!(self.kind, NodeKind::Tool { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, NodeKind::Tool { terminal: true, .. })
    }

    pub fn child(&self, id: &str) -> Option<&Node> {
        self.options.iter().find(|n| n.id == id)
    }

    fn child_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.options.iter_mut().find(|n| n.id == id)
    }

    /// Depth-first search for a node anywhere below (or at) this one.
    fn find(&self, id: &str) -> Option<&Node> {
        if self.id == id {
            return Some(self);
        }
        self.options.iter().find_map(|n| n.find(id))
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Node> {
        if self.id == id {
            return Some(self);
        }
        self.options.iter_mut().find_map(|n| n.find_mut(id))
    }

    /// Export shape used by the control surface: options keyed by id.
    pub fn to_json(&self) -> Value {
        let mut node = serde_json::json!({
            "id": self.id,
            "description": self.description,
            "status": self.status,
        });
        match &self.kind {
            NodeKind::Branch { instruction } => {
                node["branch"] = Value::Bool(true);
                node["instruction"] = Value::String(instruction.clone());
            }
            NodeKind::Tool { inputs, terminal } => {
                node["branch"] = Value::Bool(false);
                node["terminal"] = Value::Bool(*terminal);
                node["inputs"] = serde_json::to_value(inputs).unwrap_or_default();
            }
        }
        let mut options = serde_json::Map::new();
        for child in &self.options {
            options.insert(child.id.clone(), child.to_json());
        }
        node["options"] = Value::Object(options);
        node
    }
}

/// The mutable decision graph of one tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeGraph {
    root: Node,
}

impl TreeGraph {
    /// Build a graph from one of the templates. Tool nodes reference the
    /// built-in descriptors supplied by the caller.
    pub fn from_template(init: BranchInit, descriptors: &[Node]) -> Result<Self> {
        let tool = |id: &str| -> Result<Node> {
            descriptors
                .iter()
                .find(|d| d.id == id)
                .cloned()
                .ok_or_else(|| Error::Config(format!("unknown built-in tool `{id}`")))
        };

        let mut root = Node::branch(
            ROOT_BRANCH,
            ROOT_INSTRUCTION,
            "The starting point of the decision tree.",
        );

        match init {
            BranchInit::OneBranch => {
                root.options.push(tool("query")?);
                root.options.push(tool("aggregate")?);
                root.options.push(tool(TEXT_RESPONSE)?);
            }
            BranchInit::MultiBranch => {
                let mut search = Node::branch(
                    "search",
                    "Choose how to interrogate the collections: retrieve \
                     individual objects, or compute statistics over them.",
                    "Search the collections for relevant information.",
                );
                search.options.push(tool("query")?);
                search.options.push(tool("aggregate")?);
                root.options.push(search);
                root.options.push(tool(TEXT_RESPONSE)?);
            }
            BranchInit::Empty => {}
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn find(&self, id: &str) -> Option<&Node> {
        self.root.find(id)
    }

    pub fn to_json(&self) -> Value {
        self.root.to_json()
    }

    // ── mutation API ─────────────────────────────────────────────────

    /// Attach a tool node under `parent_branch_id`, or, when
    /// `from_tool_ids` is given, under each of those tool nodes within
    /// that branch.
    pub fn add_tool(
        &mut self,
        tool: Node,
        parent_branch_id: &str,
        from_tool_ids: Option<&[String]>,
    ) -> Result<()> {
        if !tool.is_tool() {
            return Err(Error::Config(format!("`{}` is not a tool node", tool.id)));
        }
        self.attach(tool, parent_branch_id, from_tool_ids)
    }

    /// Remove a tool node from under `parent_branch_id` (or from under the
    /// named tool nodes within it). The node's sub-options are removed with
    /// it.
    pub fn remove_tool(
        &mut self,
        tool_id: &str,
        parent_branch_id: &str,
        from_tool_ids: Option<&[String]>,
    ) -> Result<()> {
        let parents = self.resolve_parents(parent_branch_id, from_tool_ids)?;
        // Validate before mutating: the tool must exist under every parent.
        {
            let branch = self
                .root
                .find(parent_branch_id)
                .ok_or_else(|| not_found(parent_branch_id))?;
            for pid in &parents {
                let parent = branch.find(pid).ok_or_else(|| not_found(pid))?;
                if parent.child(tool_id).is_none() {
                    return Err(Error::NotFound(format!(
                        "tool `{tool_id}` under `{pid}`"
                    )));
                }
            }
        }
        let branch = self
            .root
            .find_mut(parent_branch_id)
            .ok_or_else(|| not_found(parent_branch_id))?;
        for pid in &parents {
            if let Some(parent) = branch.find_mut(pid) {
                parent.options.retain(|n| n.id != tool_id);
            }
        }
        Ok(())
    }

    /// Add a branch. With `root: true` the branch becomes the tree's entry,
    /// which is only allowed while the current root has no children (the
    /// `empty` template).
    pub fn add_branch(
        &mut self,
        branch: Node,
        parent_branch_id: Option<&str>,
        from_tool_ids: Option<&[String]>,
        root: bool,
    ) -> Result<()> {
        if !branch.is_branch() {
            return Err(Error::Config(format!("`{}` is not a branch node", branch.id)));
        }
        if root {
            if !self.root.options.is_empty() {
                return Err(Error::Config(
                    "cannot replace the root of a populated graph".into(),
                ));
            }
            self.root = branch;
            return Ok(());
        }
        let parent = parent_branch_id.ok_or_else(|| {
            Error::Config("add_branch requires a parent branch id (or root=true)".into())
        })?;
        self.attach(branch, parent, from_tool_ids)
    }

    /// Remove a branch and its entire sub-graph. The root cannot be removed.
    pub fn remove_branch(&mut self, id: &str) -> Result<()> {
        if id == self.root.id {
            return Err(Error::Config("cannot remove the root branch".into()));
        }
        if self.root.find(id).map(Node::is_branch) != Some(true) {
            return Err(not_found(id));
        }
        remove_anywhere(&mut self.root, id);
        Ok(())
    }

    // ── helpers ──────────────────────────────────────────────────────

    /// Resolve the concrete parent node ids for an attach/detach, validating
    /// every precondition without mutating.
    fn resolve_parents(
        &self,
        parent_branch_id: &str,
        from_tool_ids: Option<&[String]>,
    ) -> Result<Vec<String>> {
        let branch = self
            .root
            .find(parent_branch_id)
            .ok_or_else(|| not_found(parent_branch_id))?;
        if !branch.is_branch() {
            return Err(Error::Config(format!(
                "`{parent_branch_id}` is not a branch"
            )));
        }

        match from_tool_ids {
            None | Some([]) => Ok(vec![parent_branch_id.to_owned()]),
            Some(tool_ids) => {
                let mut parents = Vec::with_capacity(tool_ids.len());
                for tid in tool_ids {
                    let node = branch
                        .find(tid)
                        .ok_or_else(|| Error::NotFound(format!(
                            "tool `{tid}` under branch `{parent_branch_id}`"
                        )))?;
                    if !node.is_tool() {
                        return Err(Error::Config(format!("`{tid}` is not a tool")));
                    }
                    parents.push(tid.clone());
                }
                Ok(parents)
            }
        }
    }

    fn attach(
        &mut self,
        node: Node,
        parent_branch_id: &str,
        from_tool_ids: Option<&[String]>,
    ) -> Result<()> {
        let parents = self.resolve_parents(parent_branch_id, from_tool_ids)?;
        // Uniqueness within each parent, checked before any mutation. All
        // parent lookups are scoped to the named branch: ids are only
        // unique within their parent, so a global search could land on a
        // namesake elsewhere in the graph.
        {
            let branch = self
                .root
                .find(parent_branch_id)
                .ok_or_else(|| not_found(parent_branch_id))?;
            for pid in &parents {
                let parent = branch.find(pid).ok_or_else(|| not_found(pid))?;
                if parent.child(&node.id).is_some() {
                    return Err(Error::Config(format!(
                        "`{pid}` already has a child `{}`",
                        node.id
                    )));
                }
            }
        }
        let branch = self
            .root
            .find_mut(parent_branch_id)
            .ok_or_else(|| not_found(parent_branch_id))?;
        for pid in &parents {
            if let Some(parent) = branch.find_mut(pid) {
                parent.options.push(node.clone());
            }
        }
        Ok(())
    }
}

fn not_found(id: &str) -> Error {
    Error::NotFound(format!("node `{id}`"))
}

fn remove_anywhere(node: &mut Node, id: &str) {
    node.options.retain(|n| n.id != id);
    for child in &mut node.options {
        remove_anywhere(child, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors() -> Vec<Node> {
        vec![
            Node::tool("query", "Search a collection.", "Querying...", InputSchema::new(), false),
            Node::tool("aggregate", "Aggregate a collection.", "Aggregating...", InputSchema::new(), false),
            Node::tool(TEXT_RESPONSE, "Respond to the user.", "Responding...", InputSchema::new(), true),
        ]
    }

    fn one_branch() -> TreeGraph {
        TreeGraph::from_template(BranchInit::OneBranch, &descriptors()).unwrap()
    }

    #[test]
    fn one_branch_template_has_expected_children() {
        let graph = one_branch();
        let ids: Vec<&str> = graph.root().options.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["query", "aggregate", "text_response"]);
    }

    #[test]
    fn multi_branch_template_nests_search() {
        let graph = TreeGraph::from_template(BranchInit::MultiBranch, &descriptors()).unwrap();
        let search = graph.root().child("search").unwrap();
        assert!(search.is_branch());
        assert!(search.child("query").is_some());
        assert!(search.child("aggregate").is_some());
        assert!(graph.root().child("text_response").is_some());
    }

    #[test]
    fn empty_template_has_bare_root() {
        let graph = TreeGraph::from_template(BranchInit::Empty, &descriptors()).unwrap();
        assert!(graph.root().options.is_empty());
    }

    #[test]
    fn add_tool_under_another_tool() {
        let mut graph = one_branch();
        let joke = Node::tool("tell_a_joke", "Tell a joke.", "Joking...", InputSchema::new(), false);
        graph
            .add_tool(joke, ROOT_BRANCH, Some(&["query".to_owned()]))
            .unwrap();

        let exported = graph.to_json();
        assert!(exported["options"]["query"]["options"]["tell_a_joke"].is_object());
    }

    #[test]
    fn add_then_remove_restores_prior_shape() {
        let mut graph = one_branch();
        let before = graph.clone();

        let joke = Node::tool("tell_a_joke", "Tell a joke.", "Joking...", InputSchema::new(), false);
        graph
            .add_tool(joke, ROOT_BRANCH, Some(&["query".to_owned()]))
            .unwrap();
        assert_ne!(graph, before);

        graph
            .remove_tool("tell_a_joke", ROOT_BRANCH, Some(&["query".to_owned()]))
            .unwrap();
        assert_eq!(graph, before);
    }

    #[test]
    fn duplicate_child_id_is_rejected_atomically() {
        let mut graph = one_branch();
        let before = graph.clone();
        let dup = Node::tool("query", "Another query.", "", InputSchema::new(), false);
        assert!(graph.add_tool(dup, ROOT_BRANCH, None).is_err());
        assert_eq!(graph, before);
    }

    #[test]
    fn attach_to_missing_parent_leaves_graph_unchanged() {
        let mut graph = one_branch();
        let before = graph.clone();
        let tool = Node::tool("x", "", "", InputSchema::new(), false);
        assert!(graph.add_tool(tool, "nowhere", None).is_err());
        assert_eq!(graph, before);
    }

    #[test]
    fn add_branch_and_remove_subgraph() {
        let mut graph = one_branch();
        let extra = Node::branch("extras", "Pick an extra action.", "Extra actions.");
        graph.add_branch(extra, Some(ROOT_BRANCH), None, false).unwrap();
        let joke = Node::tool("tell_a_joke", "", "", InputSchema::new(), false);
        graph.add_tool(joke, "extras", None).unwrap();

        graph.remove_branch("extras").unwrap();
        assert!(graph.find("extras").is_none());
        assert!(graph.find("tell_a_joke").is_none());
    }

    #[test]
    fn root_branch_cannot_be_removed() {
        let mut graph = one_branch();
        assert!(graph.remove_branch(ROOT_BRANCH).is_err());
    }

    #[test]
    fn root_replacement_only_on_empty_graph() {
        let mut graph = one_branch();
        let fresh = Node::branch("entry", "Start here.", "");
        assert!(graph.add_branch(fresh.clone(), None, None, true).is_err());

        let mut empty = TreeGraph::from_template(BranchInit::Empty, &descriptors()).unwrap();
        empty.add_branch(fresh, None, None, true).unwrap();
        assert_eq!(empty.root().id, "entry");
    }

    #[test]
    fn removing_missing_tool_is_not_found() {
        let mut graph = one_branch();
        assert!(matches!(
            graph.remove_tool("ghost", ROOT_BRANCH, None),
            Err(Error::NotFound(_))
        ));
    }
}
