//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, OpenRouter, and Google's OpenAI-compatible Gemini
//! endpoint: anything that follows the chat completions contract.

use arbor_domain::error::{Error, Result};
use serde_json::Value;

use crate::traits::{ChatRequest, ChatResponse, ChatRole, LmClient};

/// An adapter for any OpenAI-compatible chat completions endpoint.
pub struct OpenAiCompatClient {
    id: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        let base_url: String = base_url.into();
        Ok(Self {
            id: id.into(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": role_str(m.role),
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
        });
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if req.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

#[async_trait::async_trait]
impl LmClient for OpenAiCompatClient {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(req);

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("{}: {e}", self.id)))?;

        let status = resp.status();
        let raw: Value = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("{}: invalid response body: {e}", self.id)))?;

        if !status.is_success() {
            let message = raw["error"]["message"]
                .as_str()
                .unwrap_or("request failed")
                .to_owned();
            return Err(Error::Upstream(format!(
                "{} returned {status}: {message}",
                self.id
            )));
        }

        let content = raw["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_owned();
        let model = raw["model"].as_str().unwrap_or(&req.model).to_owned();

        tracing::debug!(provider = %self.id, model = %model, chars = content.len(), "chat completion");

        Ok(ChatResponse { content, model })
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ChatMessage;

    #[test]
    fn body_includes_json_mode_and_temperature() {
        let client = OpenAiCompatClient::new("openai", "https://api.openai.com/v1/", "sk").unwrap();
        let req = ChatRequest {
            messages: vec![ChatMessage::system("s"), ChatMessage::user("u")],
            model: "gpt-4.1-mini".into(),
            temperature: Some(0.2),
            max_tokens: Some(64),
            json_mode: true,
        };
        let body = client.build_body(&req);
        assert_eq!(body["model"], "gpt-4.1-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 64);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = OpenAiCompatClient::new("x", "https://host/v1/", "k").unwrap();
        assert_eq!(client.base_url, "https://host/v1");
    }
}
