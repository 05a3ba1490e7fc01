//! Graph mutation over the control surface.
//!
//! Tools are addressed by name against the tree's registry; branches are
//! created from the request body. Every response carries the updated graph
//! so the client can re-render immediately.

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use arbor_tree::{Node, TreeHandle};

use crate::api::{api_error, api_ok};
use crate::state::AppState;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct ToolMutationBody {
    pub tool_id: String,
    pub parent_branch_id: String,
    #[serde(default)]
    pub from_tool_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct AddBranchBody {
    pub id: String,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parent_branch_id: Option<String>,
    #[serde(default)]
    pub from_tool_ids: Option<Vec<String>>,
    #[serde(default)]
    pub root: bool,
}

#[derive(Debug, Deserialize)]
pub struct RemoveBranchBody {
    pub id: String,
}

async fn resolve_tree(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
) -> Result<Arc<TreeHandle>, arbor_domain::Error> {
    let user = state.users.get_user(user_id)?;
    user.trees.get_tree(conversation_id)
}

/// POST /tree/:user_id/:conversation_id/tool/add
pub async fn add_tool_to_tree(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, String)>,
    Json(body): Json<ToolMutationBody>,
) -> Response {
    let zeroed = json!({ "tree": {} });
    let handle = match resolve_tree(&state, &user_id, &conversation_id).await {
        Ok(handle) => handle,
        Err(e) => return api_error(e, zeroed),
    };

    let mut tree = handle.tree.lock().await;
    if let Err(e) = tree.add_tool_by_name(
        &body.tool_id,
        &body.parent_branch_id,
        body.from_tool_ids.as_deref(),
    ) {
        return api_error(e, zeroed);
    }

    tracing::debug!(
        conversation_id = %conversation_id,
        tool = %body.tool_id,
        parent = %body.parent_branch_id,
        "tool attached"
    );
    api_ok(json!({ "tree": tree.graph.to_json() }))
}

/// POST /tree/:user_id/:conversation_id/tool/remove
pub async fn remove_tool_from_tree(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, String)>,
    Json(body): Json<ToolMutationBody>,
) -> Response {
    let zeroed = json!({ "tree": {} });
    let handle = match resolve_tree(&state, &user_id, &conversation_id).await {
        Ok(handle) => handle,
        Err(e) => return api_error(e, zeroed),
    };

    let mut tree = handle.tree.lock().await;
    if let Err(e) = tree.remove_tool(
        &body.tool_id,
        &body.parent_branch_id,
        body.from_tool_ids.as_deref(),
    ) {
        return api_error(e, zeroed);
    }

    api_ok(json!({ "tree": tree.graph.to_json() }))
}

/// POST /tree/:user_id/:conversation_id/branch/add
pub async fn add_branch_to_tree(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, String)>,
    Json(body): Json<AddBranchBody>,
) -> Response {
    let zeroed = json!({ "tree": {} });
    let handle = match resolve_tree(&state, &user_id, &conversation_id).await {
        Ok(handle) => handle,
        Err(e) => return api_error(e, zeroed),
    };

    let branch = Node::branch(&body.id, &body.instruction, &body.description);
    let mut tree = handle.tree.lock().await;
    if let Err(e) = tree.graph.add_branch(
        branch,
        body.parent_branch_id.as_deref(),
        body.from_tool_ids.as_deref(),
        body.root,
    ) {
        return api_error(e, zeroed);
    }

    api_ok(json!({ "tree": tree.graph.to_json() }))
}

/// POST /tree/:user_id/:conversation_id/branch/remove
pub async fn remove_branch_from_tree(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, String)>,
    Json(body): Json<RemoveBranchBody>,
) -> Response {
    let zeroed = json!({ "tree": {} });
    let handle = match resolve_tree(&state, &user_id, &conversation_id).await {
        Ok(handle) => handle,
        Err(e) => return api_error(e, zeroed),
    };

    let mut tree = handle.tree.lock().await;
    if let Err(e) = tree.graph.remove_branch(&body.id) {
        return api_error(e, zeroed);
    }

    api_ok(json!({ "tree": tree.graph.to_json() }))
}
