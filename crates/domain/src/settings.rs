//! Per-user (and per-tree) model, provider, and credential settings.
//!
//! Scalar fields are addressed by upper-cased names (`BASE_MODEL`,
//! `WCD_URL`, …); API keys live in the `API_KEYS` map under lower-cased
//! names (`openai_api_key`, `wcd_api_key`, …). In memory keys are held in
//! plaintext; every serialized form keeps them encrypted.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models;
use crate::secrets::SecretBox;

/// Who is applying a partial configuration.
///
/// Tree-scoped configuration cannot touch credentials or the destination:
/// those keys are silently stripped. User-scoped configuration rejects
/// unknown keys outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    User,
    Tree,
}

const SCALAR_KEYS: &[&str] = &[
    "BASE_MODEL",
    "COMPLEX_MODEL",
    "BASE_PROVIDER",
    "COMPLEX_PROVIDER",
    "WCD_URL",
];

/// Known provider API keys and the env vars they hydrate from.
const ENV_API_KEYS: &[(&str, &str)] = &[
    ("openai_api_key", "OPENAI_API_KEY"),
    ("anthropic_api_key", "ANTHROPIC_API_KEY"),
    ("gemini_api_key", "GEMINI_API_KEY"),
    ("openrouter_api_key", "OPENROUTER_API_KEY"),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub base_model: String,
    pub complex_model: String,
    pub base_provider: String,
    pub complex_provider: String,
    pub wcd_url: String,
    /// Lower-cased key name → plaintext secret. Includes `wcd_api_key`.
    pub api_keys: BTreeMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// The destination API key, if set.
    pub fn wcd_api_key(&self) -> &str {
        self.api_keys
            .get("wcd_api_key")
            .map(String::as_str)
            .unwrap_or("")
    }

    // ── configure ────────────────────────────────────────────────────

    /// Merge a partial record of settings.
    ///
    /// Keys matching `*_api_key` (any case) or exactly `WCD_API_KEY` are
    /// routed into the `API_KEYS` map under their lower-cased name; other
    /// known keys set scalar fields under their upper-cased name. Behaviour
    /// on unknown or credential keys depends on the scope (see
    /// [`ConfigScope`]).
    pub fn configure(&mut self, partial: &Map<String, Value>, scope: ConfigScope) -> Result<()> {
        for (key, value) in partial {
            let lower = key.to_lowercase();
            let upper = key.to_uppercase();

            if lower.ends_with("_api_key") || upper == "WCD_API_KEY" {
                if scope == ConfigScope::Tree {
                    tracing::debug!(key = %lower, "stripping credential key at tree scope");
                    continue;
                }
                let secret = value_as_string(value)?;
                self.api_keys.insert(lower, secret);
                continue;
            }

            if upper == "API_KEYS" {
                if scope == ConfigScope::Tree {
                    continue;
                }
                let map = value.as_object().ok_or_else(|| {
                    Error::Config("API_KEYS must be an object".into())
                })?;
                for (name, secret) in map {
                    self.api_keys
                        .insert(name.to_lowercase(), value_as_string(secret)?);
                }
                continue;
            }

            if SCALAR_KEYS.contains(&upper.as_str()) {
                if upper == "WCD_URL" && scope == ConfigScope::Tree {
                    tracing::debug!("stripping WCD_URL at tree scope");
                    continue;
                }
                let text = value_as_string(value)?;
                match upper.as_str() {
                    "BASE_MODEL" => self.base_model = text,
                    "COMPLEX_MODEL" => self.complex_model = text,
                    "BASE_PROVIDER" => self.base_provider = text,
                    "COMPLEX_PROVIDER" => self.complex_provider = text,
                    "WCD_URL" => self.wcd_url = text,
                    _ => unreachable!(),
                }
                continue;
            }

            match scope {
                ConfigScope::User => {
                    return Err(Error::Config(format!("unknown settings key `{key}`")))
                }
                ConfigScope::Tree => {
                    tracing::debug!(key = %key, "ignoring unknown settings key at tree scope");
                }
            }
        }
        Ok(())
    }

    // ── environment hydration ────────────────────────────────────────

    /// Re-hydrate every known provider key plus the destination URL and key
    /// from the process environment. Empty env vars do not clear values.
    pub fn set_api_keys_from_env(&mut self) {
        for (name, env) in ENV_API_KEYS {
            if let Ok(v) = std::env::var(env) {
                if !v.is_empty() {
                    self.api_keys.insert((*name).into(), v);
                }
            }
        }
        if let Ok(v) = std::env::var("WCD_URL") {
            if !v.is_empty() {
                self.wcd_url = v;
            }
        }
        if let Ok(v) = std::env::var("WCD_API_KEY") {
            if !v.is_empty() {
                self.api_keys.insert("wcd_api_key".into(), v);
            }
        }
    }

    /// Hydrate from the environment, then pick a provider/model pair for
    /// whichever API keys turned out to be present. Never overwrites a
    /// model or provider that is already set.
    pub fn smart_setup(&mut self) {
        self.set_api_keys_from_env();
        self.pick_models(false);
    }

    /// Reset models/providers to the preferred choice for the currently
    /// configured keys, overwriting the current selection.
    pub fn default_models(&mut self) {
        self.pick_models(true);
    }

    fn pick_models(&mut self, overwrite: bool) {
        let chosen = models::PROVIDERS.iter().find(|p| {
            self.api_keys
                .get(p.api_key)
                .map(|k| !k.is_empty())
                .unwrap_or(false)
        });
        let Some(provider) = chosen else {
            return;
        };
        let Some((base, complex)) = models::default_pair(provider.name) else {
            return;
        };

        if overwrite || self.base_provider.is_empty() {
            self.base_provider = provider.name.into();
        }
        if overwrite || self.complex_provider.is_empty() {
            self.complex_provider = provider.name.into();
        }
        if overwrite || self.base_model.is_empty() {
            self.base_model = base.into();
        }
        if overwrite || self.complex_model.is_empty() {
            self.complex_model = complex.into();
        }
    }

    // ── validation ───────────────────────────────────────────────────

    /// True iff both models, both providers, the destination URL and key,
    /// and the API key each chosen provider requires are all non-empty.
    pub fn check(&self) -> bool {
        if self.base_model.is_empty()
            || self.complex_model.is_empty()
            || self.base_provider.is_empty()
            || self.complex_provider.is_empty()
            || self.wcd_url.is_empty()
            || self.wcd_api_key().is_empty()
        {
            return false;
        }

        for provider in [&self.base_provider, &self.complex_provider] {
            let Some(required) = models::required_api_key(provider) else {
                return false;
            };
            let has_key = self
                .api_keys
                .get(required)
                .map(|k| !k.is_empty())
                .unwrap_or(false);
            if !has_key {
                return false;
            }
        }
        true
    }

    // ── serialization ────────────────────────────────────────────────

    /// Serialize with every API key encrypted. This is the only serialized
    /// form; persisted objects and HTTP responses both carry ciphertext.
    pub fn to_json(&self, secrets: &SecretBox) -> Result<Value> {
        let mut keys = Map::new();
        for (name, plaintext) in &self.api_keys {
            keys.insert(name.clone(), Value::String(secrets.encrypt(plaintext)?));
        }
        Ok(serde_json::json!({
            "BASE_MODEL": self.base_model,
            "COMPLEX_MODEL": self.complex_model,
            "BASE_PROVIDER": self.base_provider,
            "COMPLEX_PROVIDER": self.complex_provider,
            "WCD_URL": self.wcd_url,
            "API_KEYS": Value::Object(keys),
        }))
    }

    /// Rebuild from the serialized form, decrypting API keys.
    pub fn from_json(value: &Value, secrets: &SecretBox) -> Result<Self> {
        let get = |key: &str| -> String {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };

        let mut api_keys = BTreeMap::new();
        if let Some(map) = value.get("API_KEYS").and_then(Value::as_object) {
            for (name, encoded) in map {
                let encoded = encoded.as_str().ok_or_else(|| {
                    Error::Config(format!("API_KEYS.{name} is not a string"))
                })?;
                api_keys.insert(name.to_lowercase(), secrets.decrypt(encoded)?);
            }
        }

        Ok(Self {
            base_model: get("BASE_MODEL"),
            complex_model: get("COMPLEX_MODEL"),
            base_provider: get("BASE_PROVIDER"),
            complex_provider: get("COMPLEX_PROVIDER"),
            wcd_url: get("WCD_URL"),
            api_keys,
        })
    }
}

fn value_as_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        other => Err(Error::Config(format!(
            "expected a string value, got `{other}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn partial(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn complete_settings() -> Settings {
        let mut s = Settings::new();
        s.configure(
            &partial(json!({
                "BASE_MODEL": "gpt-4.1-mini",
                "COMPLEX_MODEL": "gpt-4.1",
                "BASE_PROVIDER": "openai",
                "COMPLEX_PROVIDER": "openai",
                "WCD_URL": "https://db.example",
                "WCD_API_KEY": "wcd-secret",
                "openai_api_key": "sk-test",
            })),
            ConfigScope::User,
        )
        .unwrap();
        s
    }

    #[test]
    fn configure_routes_keys_and_scalars() {
        let s = complete_settings();
        assert_eq!(s.base_model, "gpt-4.1-mini");
        assert_eq!(s.wcd_url, "https://db.example");
        assert_eq!(s.api_keys["openai_api_key"], "sk-test");
        assert_eq!(s.wcd_api_key(), "wcd-secret");
    }

    #[test]
    fn configure_accepts_lowercase_scalar_names() {
        let mut s = Settings::new();
        s.configure(&partial(json!({ "base_model": "m" })), ConfigScope::User)
            .unwrap();
        assert_eq!(s.base_model, "m");
    }

    #[test]
    fn configure_partial_leaves_other_fields_untouched() {
        let mut s = complete_settings();
        s.configure(
            &partial(json!({ "BASE_MODEL": "claude-3-5-haiku-20241022" })),
            ConfigScope::User,
        )
        .unwrap();
        assert_eq!(s.base_model, "claude-3-5-haiku-20241022");
        assert_eq!(s.complex_model, "gpt-4.1");
        assert_eq!(s.wcd_api_key(), "wcd-secret");
    }

    #[test]
    fn unknown_key_errors_at_user_scope() {
        let mut s = Settings::new();
        let err = s
            .configure(&partial(json!({ "FAVOURITE_COLOUR": "red" })), ConfigScope::User)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn tree_scope_strips_credentials_and_unknowns() {
        let mut s = complete_settings();
        s.configure(
            &partial(json!({
                "BASE_MODEL": "gpt-4.1-nano",
                "openai_api_key": "sk-evil",
                "WCD_API_KEY": "stolen",
                "wcd_url": "https://elsewhere",
                "bogus": "x",
            })),
            ConfigScope::Tree,
        )
        .unwrap();
        assert_eq!(s.base_model, "gpt-4.1-nano");
        assert_eq!(s.api_keys["openai_api_key"], "sk-test");
        assert_eq!(s.wcd_api_key(), "wcd-secret");
        assert_eq!(s.wcd_url, "https://db.example");
    }

    #[test]
    fn check_requires_provider_key() {
        let mut s = complete_settings();
        assert!(s.check());
        s.api_keys.remove("openai_api_key");
        assert!(!s.check());
    }

    #[test]
    fn check_requires_destination() {
        let mut s = complete_settings();
        s.wcd_url.clear();
        assert!(!s.check());
    }

    #[test]
    fn default_models_overwrites_from_available_keys() {
        let mut s = complete_settings();
        s.base_model = "something-odd".into();
        s.default_models();
        assert_eq!(s.base_model, "gpt-4.1-mini");
        assert_eq!(s.base_provider, "openai");
    }

    #[test]
    fn pick_models_prefers_openai_over_gemini() {
        let mut s = Settings::new();
        s.api_keys.insert("gemini_api_key".into(), "g".into());
        s.api_keys.insert("openai_api_key".into(), "o".into());
        s.pick_models(false);
        assert_eq!(s.base_provider, "openai");
    }

    #[test]
    fn pick_models_never_overwrites_set_fields() {
        let mut s = Settings::new();
        s.base_model = "my-model".into();
        s.api_keys.insert("openai_api_key".into(), "o".into());
        s.pick_models(false);
        assert_eq!(s.base_model, "my-model");
        assert_eq!(s.complex_model, "gpt-4.1");
    }

    #[test]
    fn json_round_trip_keeps_secrets_encrypted() {
        let secrets = SecretBox::ephemeral();
        let s = complete_settings();

        let serialized = s.to_json(&secrets).unwrap();
        let raw = serialized.to_string();
        assert!(!raw.contains("sk-test"));
        assert!(!raw.contains("wcd-secret"));

        let back = Settings::from_json(&serialized, &secrets).unwrap();
        assert_eq!(back, s);
    }
}
