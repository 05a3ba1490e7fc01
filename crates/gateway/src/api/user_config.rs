//! User-scoped configuration endpoints.
//!
//! Saved configs live in the destination database under the user's save
//! location; the live config is held by the user's tree manager and
//! cascades to trees as described on [`TreeManager::update_config`].
//!
//! [`TreeManager::update_config`]: crate::manager::TreeManager::update_config

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use arbor_client::filter;
use arbor_domain::collections::CONFIGS;
use arbor_domain::config::{BranchInit, Config};
use arbor_domain::error::{Error, Result};
use arbor_domain::settings::ConfigScope;

use crate::api::{api_error, api_ok};
use crate::manager::users::ConfigUpdate;
use crate::state::AppState;

/// Deterministic persisted-object id for a config.
fn config_object_id(user_id: &str, config_id: &str) -> Uuid {
    let name = format!("{user_id}/{config_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

#[derive(Debug, Deserialize, Default)]
pub struct ChangeConfigBody {
    #[serde(default)]
    pub settings: Option<Map<String, Value>>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub agent_description: Option<String>,
    #[serde(default)]
    pub end_goal: Option<String>,
    #[serde(default)]
    pub branch_initialisation: Option<String>,
    #[serde(default)]
    pub frontend_config: Option<Map<String, Value>>,
}

/// GET /user/config/:user_id: the user's current config.
pub async fn get_user_config(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    let zeroed = json!({ "config": {} });
    let user = match state.users.get_user(&user_id) {
        Ok(user) => user,
        Err(e) => return api_error(e, zeroed),
    };
    match user.trees.config().to_json(&state.secrets) {
        Ok(config) => api_ok(json!({ "config": config })),
        Err(e) => api_error(e, zeroed),
    }
}

/// PATCH /user/config/:user_id: apply a partial config update.
pub async fn change_config_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<ChangeConfigBody>,
) -> Response {
    let zeroed = json!({ "config": {}, "frontend_config": {}, "warnings": [] });

    let branch_initialisation = match body.branch_initialisation.as_deref() {
        Some(raw) => match BranchInit::parse(raw) {
            Ok(init) => Some(init),
            Err(e) => return api_error(e, zeroed),
        },
        None => None,
    };

    let update = ConfigUpdate {
        settings: body.settings,
        style: body.style,
        agent_description: body.agent_description,
        end_goal: body.end_goal,
        branch_initialisation,
    };
    let config = match state.users.update_config(&user_id, update).await {
        Ok(config) => config,
        Err(e) => return api_error(e, zeroed),
    };

    let frontend_config = match body.frontend_config {
        Some(partial) => {
            match state.users.update_frontend_config(&user_id, &partial).await {
                Ok(updated) => updated,
                Err(e) => return api_error(e, zeroed),
            }
        }
        None => match state.users.get_user(&user_id) {
            Ok(user) => user.frontend_config.lock().clone(),
            Err(e) => return api_error(e, zeroed),
        },
    };

    let mut warnings: Vec<String> = Vec::new();
    if (frontend_config.save_trees_to_destination
        || frontend_config.save_configs_to_destination)
        && !frontend_config.has_save_location()
    {
        warnings.push(
            "saving is enabled but no valid save destination is configured"
                .to_owned(),
        );
    }

    let config_json = match config.to_json(&state.secrets) {
        Ok(value) => value,
        Err(e) => return api_error(e, zeroed),
    };
    let frontend_json = match frontend_config.to_json(&state.secrets) {
        Ok(value) => value,
        Err(e) => return api_error(e, zeroed),
    };

    api_ok(json!({
        "config": config_json,
        "frontend_config": frontend_json,
        "warnings": warnings,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SaveConfigBody {
    #[serde(default)]
    pub config_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub default: bool,
    pub config: Map<String, Value>,
    #[serde(default)]
    pub frontend_config: Option<Map<String, Value>>,
}

/// Build a [`Config`] from the caller-supplied (plaintext) record.
fn config_from_body(config_id: &str, name: &str, body: &Map<String, Value>) -> Result<Config> {
    let mut config = Config::default();
    config.id = config_id.to_owned();
    config.name = name.to_owned();

    if let Some(settings) = body.get("settings").and_then(Value::as_object) {
        config.settings.configure(settings, ConfigScope::User)?;
    }
    if let Some(style) = body.get("style").and_then(Value::as_str) {
        config.style = style.to_owned();
    }
    if let Some(desc) = body.get("agent_description").and_then(Value::as_str) {
        config.agent_description = desc.to_owned();
    }
    if let Some(goal) = body.get("end_goal").and_then(Value::as_str) {
        config.end_goal = goal.to_owned();
    }
    if let Some(init) = body.get("branch_initialisation").and_then(Value::as_str) {
        config.branch_initialisation = BranchInit::parse(init)?;
    }
    Ok(config)
}

/// POST /user/config/:user_id/save: persist a config to the destination.
///
/// With `default: true`, any previously-default config for the user loses
/// the flag first, so at most one default exists per user.
pub async fn save_config(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<SaveConfigBody>,
) -> Response {
    let zeroed = json!({ "config": {} });

    let user = match state.users.get_user(&user_id) {
        Ok(user) => user,
        Err(e) => return api_error(e, zeroed),
    };
    if !user.save_pool.is_client().await {
        return api_error(
            "no valid save destination configured; update the save location first",
            zeroed,
        );
    }

    let config_id = body
        .config_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let config = match config_from_body(&config_id, &body.name, &body.config) {
        Ok(config) => config,
        Err(e) => return api_error(e, zeroed),
    };
    let config_json = match config.to_json(&state.secrets) {
        Ok(value) => value,
        Err(e) => return api_error(e, zeroed),
    };

    let store = match user.save_pool.acquire().await {
        Ok(store) => store,
        Err(e) => return api_error(e, zeroed),
    };

    let result: Result<()> = async {
        store.ensure_collection(CONFIGS).await?;

        if body.default {
            let mut filters = filter("user_id", &*user_id);
            filters.insert("default".into(), json!(true));
            for object in store.fetch_where(CONFIGS, &filters, 100).await? {
                let mut properties = object.properties.clone();
                properties["default"] = json!(false);
                store.update(CONFIGS, object.id, properties).await?;
            }
        }

        store
            .upsert(
                CONFIGS,
                config_object_id(&user_id, &config_id),
                json!({
                    "config_id": config_id,
                    "user_id": user_id,
                    "name": body.name,
                    "default": body.default,
                    "config": config_json,
                }),
            )
            .await
    }
    .await;
    if let Err(e) = result {
        return api_error(e, zeroed);
    }

    if let Some(partial) = &body.frontend_config {
        if let Err(e) = state.users.update_frontend_config(&user_id, partial).await {
            return api_error(e, zeroed);
        }
    }

    tracing::debug!(user_id = %user_id, default = body.default, "config saved");

    match config.to_json(&state.secrets) {
        Ok(value) => api_ok(json!({ "config": value })),
        Err(e) => api_error(e, zeroed),
    }
}

/// POST /user/config/:user_id/load/:config_id: load a saved config and
/// make it the user's live config.
pub async fn load_config_user(
    State(state): State<AppState>,
    Path((user_id, config_id)): Path<(String, String)>,
) -> Response {
    let zeroed = json!({ "config": {} });

    let user = match state.users.get_user(&user_id) {
        Ok(user) => user,
        Err(e) => return api_error(e, zeroed),
    };
    let store = match user.save_pool.acquire().await {
        Ok(store) => store,
        Err(e) => return api_error(e, zeroed),
    };

    let object = match store
        .get(CONFIGS, config_object_id(&user_id, &config_id))
        .await
    {
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

    let applied = match state.users.apply_loaded_config(&user_id, config).await {
        Ok(applied) => applied,
        Err(e) => return api_error(e, zeroed),
    };

    match applied.to_json(&state.secrets) {
        Ok(value) => api_ok(json!({ "config": value })),
        Err(e) => api_error(e, zeroed),
    }
}

/// GET /user/config/:user_id/list: saved configs for the user.
pub async fn list_configs(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    let zeroed = json!({ "configs": [] });

    let user = match state.users.get_user(&user_id) {
        Ok(user) => user,
        Err(e) => return api_error(e, zeroed),
    };
    if !user.save_pool.is_client().await {
        tracing::warn!(
            user_id = %user_id,
            "no valid config destination; returning an empty config list"
        );
        return api_ok(json!({ "configs": [] }));
    }
    let store = match user.save_pool.acquire().await {
        Ok(store) => store,
        Err(e) => return api_error(e, zeroed),
    };
    if !store.collection_exists(CONFIGS).await.unwrap_or(false) {
        return api_ok(json!({ "configs": [] }));
    }

    match store
        .fetch_where(CONFIGS, &filter("user_id", &*user_id), 10_000)
        .await
    {
        Ok(objects) => {
            let configs: Vec<Value> = objects
                .into_iter()
                .map(|object| {
                    json!({
                        "config_id": object.properties.get("config_id").cloned().unwrap_or_default(),
                        "name": object.properties.get("name").cloned().unwrap_or_default(),
                        "default": object.properties.get("default").cloned().unwrap_or(json!(false)),
                    })
                })
                .collect();
            api_ok(json!({ "configs": configs }))
        }
        Err(e) => api_error(e, zeroed),
    }
}

/// DELETE /user/config/:user_id/:config_id: remove a saved config.
pub async fn delete_config(
    State(state): State<AppState>,
    Path((user_id, config_id)): Path<(String, String)>,
) -> Response {
    let zeroed = json!({});
    let user = match state.users.get_user(&user_id) {
        Ok(user) => user,
        Err(e) => return api_error(e, zeroed),
    };
    let store = match user.save_pool.acquire().await {
        Ok(store) => store,
        Err(e) => return api_error(e, zeroed),
    };
    match store
        .delete(CONFIGS, config_object_id(&user_id, &config_id))
        .await
    {
        Ok(()) => api_ok(json!({})),
        Err(e) => api_error(e, zeroed),
    }
}

/// POST /user/config/:user_id/new: replace the user's live config with a
/// fresh default. Saved configs (including a saved default) are untouched.
pub async fn new_user_config(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    let zeroed = json!({ "config": {} });

    let fresh = Config::from_smart_setup();
    let applied = match state.users.apply_loaded_config(&user_id, fresh).await {
        Ok(applied) => applied,
        Err(e) => return api_error(e, zeroed),
    };

    match applied.to_json(&state.secrets) {
        Ok(value) => api_ok(json!({ "config": value })),
        Err(e) => api_error(e, zeroed),
    }
}
