//! Feedback endpoints.
//!
//! One record per `(user_id, conversation_id, query_id)`: re-submitting
//! overwrites the earlier value. Records live in the feedback collection
//! at the user's save location.

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use arbor_client::filter;
use arbor_domain::collections::FEEDBACK;
use arbor_domain::feedback::{feedback_object_id, Feedback};

use crate::api::{api_error, api_ok};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AddFeedbackBody {
    pub user_id: String,
    pub conversation_id: String,
    pub query_id: String,
    /// -1 or +1.
    pub feedback: i8,
}

#[derive(Debug, Deserialize)]
pub struct RemoveFeedbackBody {
    pub user_id: String,
    pub conversation_id: String,
    pub query_id: String,
}

/// POST /feedback/add
pub async fn add_feedback(
    State(state): State<AppState>,
    Json(body): Json<AddFeedbackBody>,
) -> Response {
    let zeroed = json!({});

    let record = match Feedback::new(
        &body.user_id,
        &body.conversation_id,
        &body.query_id,
        body.feedback,
    ) {
        Ok(record) => record,
        Err(e) => return api_error(e, zeroed),
    };

    let user = match state.users.get_user(&body.user_id) {
        Ok(user) => user,
        Err(e) => return api_error(e, zeroed),
    };
    let store = match user.save_pool.acquire().await {
        Ok(store) => store,
        Err(e) => return api_error(e, zeroed),
    };

    if let Err(e) = store.ensure_collection(FEEDBACK).await {
        return api_error(e, zeroed);
    }
    let properties = match serde_json::to_value(&record) {
        Ok(value) => value,
        Err(e) => return api_error(e, zeroed),
    };
    if let Err(e) = store.upsert(FEEDBACK, record.object_id(), properties).await {
        return api_error(e, zeroed);
    }

    tracing::debug!(
        user_id = %body.user_id,
        query_id = %body.query_id,
        value = body.feedback,
        "feedback recorded"
    );
    api_ok(json!({}))
}

/// POST /feedback/remove
pub async fn remove_feedback(
    State(state): State<AppState>,
    Json(body): Json<RemoveFeedbackBody>,
) -> Response {
    let zeroed = json!({});

    let user = match state.users.get_user(&body.user_id) {
        Ok(user) => user,
        Err(e) => return api_error(e, zeroed),
    };
    let store = match user.save_pool.acquire().await {
        Ok(store) => store,
        Err(e) => return api_error(e, zeroed),
    };
    if !store.collection_exists(FEEDBACK).await.unwrap_or(false) {
        return api_ok(json!({}));
    }

    let object_id =
        feedback_object_id(&body.user_id, &body.conversation_id, &body.query_id);
    match store.delete(FEEDBACK, object_id).await {
        Ok(()) => api_ok(json!({})),
        Err(e) => api_error(e, zeroed),
    }
}

/// GET /feedback/metadata/:user_id: totals for a user's feedback.
pub async fn feedback_metadata(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    let zeroed = json!({ "total": 0, "positive": 0, "negative": 0 });

    let user = match state.users.get_user(&user_id) {
        Ok(user) => user,
        Err(e) => return api_error(e, zeroed),
    };
    let store = match user.save_pool.acquire().await {
        Ok(store) => store,
        Err(e) => return api_error(e, zeroed),
    };
    if !store.collection_exists(FEEDBACK).await.unwrap_or(false) {
        return api_ok(zeroed);
    }

    match store
        .fetch_where(FEEDBACK, &filter("user_id", &*user_id), 10_000)
        .await
    {
        Ok(objects) => {
            let mut positive = 0u64;
            let mut negative = 0u64;
            for object in &objects {
                match object.properties.get("value").and_then(|v| v.as_i64()) {
                    Some(v) if v > 0 => positive += 1,
                    Some(_) => negative += 1,
                    None => {}
                }
            }
            api_ok(json!({
                "total": objects.len(),
                "positive": positive,
                "negative": negative,
            }))
        }
        Err(e) => api_error(e, zeroed),
    }
}
