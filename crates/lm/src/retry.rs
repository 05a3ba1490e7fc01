//! Retry helpers for language-model calls.
//!
//! Two policies live here:
//! - [`chat_with_backoff`]: one retry with a short backoff on transient
//!   upstream failures.
//! - [`chat_structured`]: call, parse, and on a parse failure re-ask with
//!   the parser's complaint appended to the conversation. Bounded tries.

use std::time::Duration;

use arbor_domain::error::{Error, Result};

use crate::registry::LmHandle;
use crate::traits::{ChatMessage, ChatRequest, ChatResponse};

const BACKOFF: Duration = Duration::from_millis(500);

/// One retry with backoff on a transient failure; permanent failures
/// surface immediately.
pub async fn chat_with_backoff(lm: &LmHandle, req: ChatRequest) -> Result<ChatResponse> {
    match lm.chat(req.clone()).await {
        Ok(resp) => Ok(resp),
        Err(e) if e.is_transient() => {
            tracing::warn!(model = %lm.model(), error = %e, "transient LM failure, retrying once");
            tokio::time::sleep(BACKOFF).await;
            lm.chat(req).await
        }
        Err(e) => Err(e),
    }
}

/// Call the model and parse its response, re-asking with feedback when the
/// parse fails. Each failed attempt appends the model's answer and the
/// parser's complaint so the next attempt can correct itself.
pub async fn chat_structured<T>(
    lm: &LmHandle,
    req: ChatRequest,
    max_tries: u32,
    parse: impl Fn(&str) -> Result<T>,
) -> Result<T> {
    let mut req = req;
    let mut last_err: Option<Error> = None;

    for attempt in 0..max_tries {
        let resp = chat_with_backoff(lm, req.clone()).await?;
        match parse(&resp.content) {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!(
                    model = %lm.model(),
                    attempt,
                    error = %e,
                    "structured response failed to parse"
                );
                req.messages.push(ChatMessage::assistant(resp.content));
                req.messages.push(ChatMessage::user(format!(
                    "Your previous answer was invalid: {e}. \
                     Answer again, following the required format exactly."
                )));
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Upstream("no attempts made".into())))
}

/// Strip a markdown code fence from a model answer, if present, and parse
/// the remainder as JSON.
pub fn parse_json_block(content: &str) -> Result<serde_json::Value> {
    let trimmed = content.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    serde_json::from_str(inner)
        .map_err(|e| Error::Config(format!("response is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::ScriptedLm;
    use crate::registry::LmHandle;
    use std::sync::Arc;

    fn handle(lm: Arc<ScriptedLm>) -> LmHandle {
        LmHandle::new(lm, "scripted-model")
    }

    #[tokio::test]
    async fn structured_retries_with_feedback() {
        let lm = Arc::new(ScriptedLm::new(vec![
            "not json at all".into(),
            r#"{"answer": 42}"#.into(),
        ]));
        let req = ChatRequest {
            messages: vec![ChatMessage::user("pick a number")],
            ..Default::default()
        };
        let value = chat_structured(&handle(lm.clone()), req, 3, parse_json_block)
            .await
            .unwrap();
        assert_eq!(value["answer"], 42);

        // The second request carried the feedback turn.
        let calls = lm.requests();
        assert_eq!(calls.len(), 2);
        assert!(calls[1]
            .messages
            .iter()
            .any(|m| m.content.contains("previous answer was invalid")));
    }

    #[tokio::test]
    async fn structured_gives_up_after_max_tries() {
        let lm = Arc::new(ScriptedLm::new(vec!["nope".into(), "still nope".into()]));
        let req = ChatRequest {
            messages: vec![ChatMessage::user("json please")],
            ..Default::default()
        };
        let err = chat_structured(&handle(lm), req, 2, parse_json_block)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[tokio::test]
    async fn backoff_retries_transient_errors_once() {
        let lm = Arc::new(ScriptedLm::failing_then(vec!["recovered".into()]));
        let req = ChatRequest {
            messages: vec![ChatMessage::user("hello")],
            ..Default::default()
        };
        let resp = chat_with_backoff(&handle(lm), req).await.unwrap();
        assert_eq!(resp.content, "recovered");
    }

    #[test]
    fn json_block_strips_fences() {
        let value = parse_json_block("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(value["a"], 1);
        let value = parse_json_block("{\"a\": 2}").unwrap();
        assert_eq!(value["a"], 2);
        assert!(parse_json_block("plain prose").is_err());
    }
}
