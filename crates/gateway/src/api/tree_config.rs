//! Tree-scoped configuration endpoints.
//!
//! Tree-scope updates cannot touch credentials or the destination: those
//! keys are stripped by [`ConfigScope::Tree`] before application.
//!
//! [`ConfigScope::Tree`]: arbor_domain::settings::ConfigScope

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use arbor_domain::collections::CONFIGS;
use arbor_domain::config::{BranchInit, Config};
use arbor_domain::error::Error;

use crate::api::user_config::ChangeConfigBody;
use crate::api::{api_error, api_ok};
use crate::state::AppState;

/// PATCH /tree/config/:user_id/:conversation_id: partial update of one
/// tree's settings and persona.
pub async fn change_config_tree(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, String)>,
    Json(body): Json<ChangeConfigBody>,
) -> Response {
    let zeroed = json!({ "config": {} });

    let user = match state.users.get_user(&user_id) {
        Ok(user) => user,
        Err(e) => return api_error(e, zeroed),
    };
    let handle = match user.trees.get_tree(&conversation_id) {
        Ok(handle) => handle,
        Err(e) => return api_error(e, zeroed),
    };

    let mut tree = handle.tree.lock().await;

    if let Some(partial) = &body.settings {
        if let Err(e) = tree.configure_settings(partial) {
            return api_error(e, zeroed);
        }
    }
    if let Some(style) = &body.style {
        tree.style = style.clone();
    }
    if let Some(desc) = &body.agent_description {
        tree.agent_description = desc.clone();
    }
    if let Some(goal) = &body.end_goal {
        tree.end_goal = goal.clone();
    }
    if let Some(raw) = body.branch_initialisation.as_deref() {
        let init = match BranchInit::parse(raw) {
            Ok(init) => init,
            Err(e) => return api_error(e, zeroed),
        };
        if let Err(e) = tree.change_branch_initialisation(init) {
            return api_error(e, zeroed);
        }
    }

    tracing::debug!(
        user_id = %user_id,
        conversation_id = %conversation_id,
        "tree config updated"
    );

    match tree_config_json(&tree, &state) {
        Ok(config) => api_ok(json!({ "config": config })),
        Err(e) => api_error(e, zeroed),
    }
}

/// POST /tree/config/:user_id/:conversation_id/load/:config_id: apply a
/// saved config to one tree, at tree scope.
pub async fn load_config_tree(
    State(state): State<AppState>,
    Path((user_id, conversation_id, config_id)): Path<(String, String, String)>,
) -> Response {
    let zeroed = json!({ "config": {} });

    let user = match state.users.get_user(&user_id) {
        Ok(user) => user,
        Err(e) => return api_error(e, zeroed),
    };
    let handle = match user.trees.get_tree(&conversation_id) {
        Ok(handle) => handle,
        Err(e) => return api_error(e, zeroed),
    };
    let store = match user.save_pool.acquire().await {
        Ok(store) => store,
        Err(e) => return api_error(e, zeroed),
    };

    let object_id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{user_id}/{config_id}").as_bytes(),
    );
    let object = match store.get(CONFIGS, object_id).await {
        Ok(Some(object)) => object,
        Ok(None) => {
            return api_error(Error::NotFound(format!("config `{config_id}`")), zeroed)
        }
        Err(e) => return api_error(e, zeroed),
    };
    let config = match Config::from_json(
        object.properties.get("config").unwrap_or(&Value::Null),
        &state.secrets,
    ) {
        Ok(config) => config,
        Err(e) => return api_error(e, zeroed),
    };

    let mut tree = handle.tree.lock().await;

    // Settings go through tree scope, so the saved config's credentials
    // and destination are stripped.
    let settings_json = match config.settings.to_json(&state.secrets) {
        Ok(value) => value,
        Err(e) => return api_error(e, zeroed),
    };
    // Re-encrypted keys cannot be applied at tree scope anyway; strip the
    // map before configure sees it.
    let mut partial = settings_json.as_object().cloned().unwrap_or_default();
    partial.remove("API_KEYS");
    if let Err(e) = tree.configure_settings(&partial) {
        return api_error(e, zeroed);
    }

    tree.style = config.style.clone();
    tree.agent_description = config.agent_description.clone();
    tree.end_goal = config.end_goal.clone();
    tree.config_id = config.id.clone();
    if tree.runs_completed == 0 {
        if let Err(e) = tree.change_branch_initialisation(config.branch_initialisation) {
            return api_error(e, zeroed);
        }
    }

    match tree_config_json(&tree, &state) {
        Ok(config) => api_ok(json!({ "config": config })),
        Err(e) => api_error(e, zeroed),
    }
}

fn tree_config_json(
    tree: &arbor_tree::Tree,
    state: &AppState,
) -> arbor_domain::Result<Value> {
    Ok(json!({
        "settings": tree.settings.to_json(&state.secrets)?,
        "style": tree.style,
        "agent_description": tree.agent_description,
        "end_goal": tree.end_goal,
        "branch_initialisation": tree.branch_initialisation.as_str(),
    }))
}
