//! User and tree initialisation endpoints.

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use arbor_client::filter;
use arbor_domain::collections::CONFIGS;
use arbor_domain::config::Config;

use crate::api::{api_error, api_ok};
use crate::state::AppState;

/// POST /init/user/:user_id: create or retrieve a user.
///
/// On first creation, if the save location holds a default config for this
/// user it is loaded and applied before the response is built.
pub async fn init_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    let zeroed = json!({
        "user_exists": Value::Null,
        "config": {},
        "frontend_config": {},
        "correct_settings": false,
    });

    let user_exists = state.users.user_exists(&user_id);
    state.users.add_user(&user_id, None);

    if !user_exists {
        if let Err(e) = apply_saved_default(&state, &user_id).await {
            tracing::warn!(user_id = %user_id, error = %e, "could not load saved default config");
        }
    }

    let user = match state.users.get_user(&user_id) {
        Ok(user) => user,
        Err(e) => return api_error(e, zeroed),
    };

    let config = user.trees.config();
    let correct_settings = config.settings.check();
    let config_json = match config.to_json(&state.secrets) {
        Ok(value) => value,
        Err(e) => return api_error(e, zeroed),
    };
    let frontend_config_json = {
        let frontend_config = user.frontend_config.lock();
        match frontend_config.to_json(&state.secrets) {
            Ok(value) => value,
            Err(e) => return api_error(e, zeroed),
        }
    };

    tracing::debug!(
        user_id = %user_id,
        user_exists,
        correct_settings,
        "user initialised"
    );

    api_ok(json!({
        "user_exists": user_exists,
        "config": config_json,
        "frontend_config": frontend_config_json,
        "correct_settings": correct_settings,
    }))
}

/// Load and apply the user's saved default config, if one exists.
async fn apply_saved_default(
    state: &AppState,
    user_id: &str,
) -> arbor_domain::Result<()> {
    let user = state.users.get_user(user_id)?;
    if !user.save_pool.is_client().await {
        return Ok(());
    }
    let store = user.save_pool.acquire().await?;
    if !store.collection_exists(CONFIGS).await? {
        return Ok(());
    }

    let mut filters = filter("user_id", user_id);
    filters.insert("default".into(), json!(true));
    let hits = store.fetch_where(CONFIGS, &filters, 1).await?;
    let Some(object) = hits.into_iter().next() else {
        return Ok(());
    };

    let config = Config::from_json(
        object
            .properties
            .get("config")
            .unwrap_or(&Value::Null),
        &state.secrets,
    )?;
    state.users.apply_loaded_config(user_id, config).await?;
    tracing::debug!(user_id = %user_id, "saved default config applied");
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
pub struct InitTreeBody {
    #[serde(default)]
    pub low_memory: bool,
}

/// POST /init/tree/:user_id/:conversation_id: create or retrieve a tree.
pub async fn init_tree(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, String)>,
    body: Option<Json<InitTreeBody>>,
) -> Response {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let zeroed = json!({ "conversation_id": conversation_id, "tree": "" });

    let user = match state.users.get_user(&user_id) {
        Ok(user) => user,
        Err(e) => return api_error(e, zeroed),
    };

    let handle = match user.trees.add_tree(&conversation_id, body.low_memory, None) {
        Ok(handle) => handle,
        Err(e) => return api_error(e, zeroed),
    };

    let tree_json = {
        let tree = handle.tree.lock().await;
        tree.graph.to_json()
    };

    tracing::debug!(
        user_id = %user_id,
        conversation_id = %conversation_id,
        low_memory = body.low_memory,
        "tree initialised"
    );

    api_ok(json!({
        "conversation_id": conversation_id,
        "tree": tree_json,
    }))
}
