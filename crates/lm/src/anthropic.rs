//! Anthropic messages-API adapter.
//!
//! The messages API differs from the chat completions contract in three
//! ways that matter here: the system prompt is a top-level field, auth uses
//! `x-api-key` + `anthropic-version`, and `max_tokens` is mandatory.

use arbor_domain::error::{Error, Result};
use serde_json::Value;

use crate::traits::{ChatRequest, ChatResponse, ChatRole, LmClient};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    id: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            id: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        for m in &req.messages {
            match m.role {
                ChatRole::System => system_parts.push(&m.content),
                ChatRole::User => messages.push(serde_json::json!({
                    "role": "user", "content": m.content,
                })),
                ChatRole::Assistant => messages.push(serde_json::json!({
                    "role": "assistant", "content": m.content,
                })),
            }
        }

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        // No native JSON mode: lean on the prompt, which already demands
        // bare JSON whenever the caller sets json_mode.
        body
    }
}

#[async_trait::async_trait]
impl LmClient for AnthropicClient {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/messages", self.base_url);
        let body = self.build_body(req);

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("anthropic: {e}")))?;

        let status = resp.status();
        let raw: Value = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("anthropic: invalid response body: {e}")))?;

        if !status.is_success() {
            let message = raw["error"]["message"]
                .as_str()
                .unwrap_or("request failed")
                .to_owned();
            return Err(Error::Upstream(format!(
                "anthropic returned {status}: {message}"
            )));
        }

        let content = raw["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let model = raw["model"].as_str().unwrap_or(&req.model).to_owned();

        tracing::debug!(provider = %self.id, model = %model, chars = content.len(), "chat completion");

        Ok(ChatResponse { content, model })
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
