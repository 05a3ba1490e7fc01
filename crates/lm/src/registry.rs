//! Resolving Settings into callable model handles.
//!
//! A tree run needs two handles: the base model (selector, input builder,
//! end-goal evaluator) and the complex model (synthesiser, title). Both are
//! resolved here from the tree's [`Settings`], picking the right adapter
//! and wire-level model id for each provider.

use std::sync::Arc;

use arbor_domain::error::{Error, Result};
use arbor_domain::settings::Settings;

use crate::anthropic::AnthropicClient;
use crate::openai_compat::OpenAiCompatClient;
use crate::traits::{ChatRequest, ChatResponse, SharedLm};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// A model bound to its adapter: the unit the engine calls.
#[derive(Clone)]
pub struct LmHandle {
    client: SharedLm,
    model: String,
}

impl std::fmt::Debug for LmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmHandle").field("model", &self.model).finish()
    }
}

impl LmHandle {
    pub fn new(client: SharedLm, model: impl Into<String>) -> Self {
        Self { client, model: model.into() }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_id(&self) -> &str {
        self.client.provider_id()
    }

    /// Send a request through the bound model.
    pub async fn chat(&self, mut req: ChatRequest) -> Result<ChatResponse> {
        req.model = self.model.clone();
        self.client.chat(&req).await
    }
}

/// Build the (base, complex) handle pair from settings.
pub fn resolve_handles(settings: &Settings) -> Result<(LmHandle, LmHandle)> {
    let base = resolve_one(settings, &settings.base_provider, &settings.base_model)?;
    let complex = resolve_one(settings, &settings.complex_provider, &settings.complex_model)?;
    Ok((base, complex))
}

fn resolve_one(settings: &Settings, provider: &str, model: &str) -> Result<LmHandle> {
    if provider.is_empty() || model.is_empty() {
        return Err(Error::Config(
            "model or provider not configured; set BASE_MODEL/COMPLEX_MODEL \
             and their providers first"
                .into(),
        ));
    }

    let api_key = |name: &str| -> Result<String> {
        settings
            .api_keys
            .get(name)
            .filter(|k| !k.is_empty())
            .cloned()
            .ok_or_else(|| Error::Config(format!("provider `{provider}` requires `{name}`")))
    };

    let (client, wire_model): (SharedLm, String) = match provider {
        "openai" => (
            Arc::new(OpenAiCompatClient::new("openai", OPENAI_BASE_URL, api_key("openai_api_key")?)?),
            model.to_owned(),
        ),
        "anthropic" => (
            Arc::new(AnthropicClient::new(api_key("anthropic_api_key")?)?),
            model.to_owned(),
        ),
        "gemini" => (
            Arc::new(OpenAiCompatClient::new("gemini", GEMINI_BASE_URL, api_key("gemini_api_key")?)?),
            model.to_owned(),
        ),
        // OpenRouter namespaces model ids by upstream vendor.
        "openrouter/openai" | "openrouter/anthropic" | "openrouter/google" => {
            let vendor = provider.trim_start_matches("openrouter/");
            (
                Arc::new(OpenAiCompatClient::new(
                    "openrouter",
                    OPENROUTER_BASE_URL,
                    api_key("openrouter_api_key")?,
                )?),
                format!("{vendor}/{model}"),
            )
        }
        other => {
            return Err(Error::Config(format!("unknown provider `{other}`")));
        }
    };

    Ok(LmHandle::new(client, wire_model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings_with(provider: &str, key_name: &str) -> Settings {
        let mut s = Settings::new();
        s.configure(
            json!({
                "BASE_MODEL": "m1",
                "COMPLEX_MODEL": "m2",
                "BASE_PROVIDER": provider,
                "COMPLEX_PROVIDER": provider,
                key_name: "sk-x",
            })
            .as_object()
            .unwrap(),
            arbor_domain::settings::ConfigScope::User,
        )
        .unwrap();
        s
    }

    #[test]
    fn resolves_openai_pair() {
        let settings = settings_with("openai", "openai_api_key");
        let (base, complex) = resolve_handles(&settings).unwrap();
        assert_eq!(base.model(), "m1");
        assert_eq!(complex.model(), "m2");
        assert_eq!(base.provider_id(), "openai");
    }

    #[test]
    fn openrouter_prefixes_the_vendor() {
        let settings = settings_with("openrouter/anthropic", "openrouter_api_key");
        let (base, _) = resolve_handles(&settings).unwrap();
        assert_eq!(base.model(), "anthropic/m1");
        assert_eq!(base.provider_id(), "openrouter");
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let mut settings = settings_with("openai", "openai_api_key");
        settings.api_keys.clear();
        let err = resolve_handles(&settings).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let settings = settings_with("mystery", "openai_api_key");
        assert!(resolve_handles(&settings).is_err());
    }
}
