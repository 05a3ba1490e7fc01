//! User-level configuration records.
//!
//! A [`Config`] bundles the settings with the agent's persona (style,
//! description, end goal) and the tree template to initialise conversations
//! with. A [`FrontendConfig`] is the per-user policy record: save flags,
//! idle timeouts, and the snapshot save location. Frontend configs persist
//! to a local JSON file per user; configs persist to the vector database.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::secrets::SecretBox;
use crate::settings::{ConfigScope, Settings};

/// Which template a new tree's graph starts from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchInit {
    #[default]
    OneBranch,
    MultiBranch,
    Empty,
}

impl BranchInit {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchInit::OneBranch => "one_branch",
            BranchInit::MultiBranch => "multi_branch",
            BranchInit::Empty => "empty",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "one_branch" | "default" => Ok(BranchInit::OneBranch),
            "multi_branch" => Ok(BranchInit::MultiBranch),
            "empty" => Ok(BranchInit::Empty),
            other => Err(Error::Config(format!(
                "unknown branch_initialisation `{other}`"
            ))),
        }
    }
}

pub const DEFAULT_STYLE: &str = "Informative, polite and friendly.";

pub const DEFAULT_AGENT_DESCRIPTION: &str =
    "You search and query the connected collections to satisfy the user's \
     request, providing a concise summary of the results and communicating \
     with the user in a friendly and engaging manner.";

pub const DEFAULT_END_GOAL: &str =
    "You have satisfied the user's request, and provided a concise summary \
     of the results. Or, you have exhausted all options available, or asked \
     the user for clarification.";

/// A named, persistable configuration. At most one config per user carries
/// the `default` flag in the persisted store.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub id: String,
    pub name: String,
    pub settings: Settings,
    pub style: String,
    pub agent_description: String,
    pub end_goal: String,
    pub branch_initialisation: BranchInit,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: "New Config".into(),
            settings: Settings::new(),
            style: DEFAULT_STYLE.into(),
            agent_description: DEFAULT_AGENT_DESCRIPTION.into(),
            end_goal: DEFAULT_END_GOAL.into(),
            branch_initialisation: BranchInit::OneBranch,
        }
    }
}

impl Config {
    /// A fresh config with settings hydrated from the environment.
    pub fn from_smart_setup() -> Self {
        let mut config = Self::default();
        config.settings.smart_setup();
        config
    }

    pub fn to_json(&self, secrets: &SecretBox) -> Result<Value> {
        Ok(serde_json::json!({
            "id": self.id,
            "name": self.name,
            "settings": self.settings.to_json(secrets)?,
            "style": self.style,
            "agent_description": self.agent_description,
            "end_goal": self.end_goal,
            "branch_initialisation": self.branch_initialisation.as_str(),
        }))
    }

    pub fn from_json(value: &Value, secrets: &SecretBox) -> Result<Self> {
        let get = |key: &str| -> String {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        let settings = value
            .get("settings")
            .map(|v| Settings::from_json(v, secrets))
            .transpose()?
            .unwrap_or_default();
        let branch = value
            .get("branch_initialisation")
            .and_then(Value::as_str)
            .map(BranchInit::parse)
            .transpose()?
            .unwrap_or_default();

        let id = match get("id") {
            s if s.is_empty() => uuid::Uuid::new_v4().to_string(),
            s => s,
        };
        let defaults = Config::default();
        Ok(Self {
            id,
            name: non_empty_or(get("name"), &defaults.name),
            settings,
            style: non_empty_or(get("style"), &defaults.style),
            agent_description: non_empty_or(get("agent_description"), &defaults.agent_description),
            end_goal: non_empty_or(get("end_goal"), &defaults.end_goal),
            branch_initialisation: branch,
        })
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_owned()
    } else {
        value
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frontend config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-user policy record: snapshot save flags, idle timeouts (minutes),
/// and the destination credentials snapshots are written to.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontendConfig {
    pub save_trees_to_destination: bool,
    pub save_configs_to_destination: bool,
    /// Tree idle timeout in minutes.
    pub tree_timeout: u64,
    /// Client handle idle timeout in minutes.
    pub client_timeout: u64,
    pub save_location_wcd_url: String,
    pub save_location_wcd_api_key: String,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            save_trees_to_destination: true,
            save_configs_to_destination: true,
            tree_timeout: env_minutes("TREE_TIMEOUT", 10),
            client_timeout: env_minutes("CLIENT_TIMEOUT", 3),
            save_location_wcd_url: std::env::var("WCD_URL").unwrap_or_default(),
            save_location_wcd_api_key: std::env::var("WCD_API_KEY").unwrap_or_default(),
        }
    }
}

fn env_minutes(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl FrontendConfig {
    /// Apply a partial update. Returns true when the save-location
    /// credentials changed (the caller must rotate the save-location pool).
    pub fn configure(&mut self, partial: &Map<String, Value>) -> Result<bool> {
        let mut credentials_changed = false;
        for (key, value) in partial {
            match key.as_str() {
                "save_trees_to_destination" => {
                    self.save_trees_to_destination = value_as_bool(key, value)?
                }
                "save_configs_to_destination" => {
                    self.save_configs_to_destination = value_as_bool(key, value)?
                }
                "tree_timeout" => self.tree_timeout = value_as_u64(key, value)?,
                "client_timeout" => self.client_timeout = value_as_u64(key, value)?,
                "save_location_wcd_url" => {
                    self.save_location_wcd_url = value_as_str(key, value)?;
                    credentials_changed = true;
                }
                "save_location_wcd_api_key" => {
                    self.save_location_wcd_api_key = value_as_str(key, value)?;
                    credentials_changed = true;
                }
                other => {
                    return Err(Error::Config(format!(
                        "unknown frontend config key `{other}`"
                    )))
                }
            }
        }
        Ok(credentials_changed)
    }

    /// True when the save location has usable credentials.
    pub fn has_save_location(&self) -> bool {
        !self.save_location_wcd_url.is_empty() && !self.save_location_wcd_api_key.is_empty()
    }

    pub fn to_json(&self, secrets: &SecretBox) -> Result<Value> {
        let encrypted_key = if self.save_location_wcd_api_key.is_empty() {
            String::new()
        } else {
            secrets.encrypt(&self.save_location_wcd_api_key)?
        };
        Ok(serde_json::json!({
            "save_trees_to_destination": self.save_trees_to_destination,
            "save_configs_to_destination": self.save_configs_to_destination,
            "tree_timeout": self.tree_timeout,
            "client_timeout": self.client_timeout,
            "save_location_wcd_url": self.save_location_wcd_url,
            "save_location_wcd_api_key": encrypted_key,
        }))
    }

    pub fn from_json(value: &Value, secrets: &SecretBox) -> Result<Self> {
        let defaults = Self::default();
        let encrypted_key = value
            .get("save_location_wcd_api_key")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let save_location_wcd_api_key = if encrypted_key.is_empty() {
            String::new()
        } else {
            secrets.decrypt(encrypted_key)?
        };

        Ok(Self {
            save_trees_to_destination: value
                .get("save_trees_to_destination")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.save_trees_to_destination),
            save_configs_to_destination: value
                .get("save_configs_to_destination")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.save_configs_to_destination),
            tree_timeout: value
                .get("tree_timeout")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.tree_timeout),
            client_timeout: value
                .get("client_timeout")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.client_timeout),
            save_location_wcd_url: value
                .get("save_location_wcd_url")
                .and_then(Value::as_str)
                .unwrap_or(&defaults.save_location_wcd_url)
                .to_owned(),
            save_location_wcd_api_key,
        })
    }

    // ── file persistence ─────────────────────────────────────────────

    pub fn file_path(data_dir: &Path, user_id: &str) -> PathBuf {
        data_dir.join(format!("frontend_config_{user_id}.json"))
    }

    /// Load the per-user frontend config file, falling back to defaults when
    /// the file is missing or unreadable. A corrupt file is logged and
    /// ignored rather than blocking user creation.
    pub fn load_from_file(data_dir: &Path, user_id: &str, secrets: &SecretBox) -> Self {
        let path = Self::file_path(data_dir, user_id);
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(&path)
            .map_err(Error::Io)
            .and_then(|raw| serde_json::from_str::<Value>(&raw).map_err(Error::Json))
            .and_then(|value| Self::from_json(&value, secrets))
        {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load frontend config");
                Self::default()
            }
        }
    }

    pub fn save_to_file(&self, data_dir: &Path, user_id: &str, secrets: &SecretBox) -> Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let path = Self::file_path(data_dir, user_id);
        let json = serde_json::to_string_pretty(&self.to_json(secrets)?)?;
        std::fs::write(&path, json)?;
        Ok(())
    }
}

fn value_as_bool(key: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::Config(format!("`{key}` must be a boolean")))
}

fn value_as_u64(key: &str, value: &Value) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| Error::Config(format!("`{key}` must be a non-negative integer")))
}

fn value_as_str(key: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| Error::Config(format!("`{key}` must be a string")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn branch_init_parses_all_variants() {
        assert_eq!(BranchInit::parse("one_branch").unwrap(), BranchInit::OneBranch);
        assert_eq!(BranchInit::parse("multi_branch").unwrap(), BranchInit::MultiBranch);
        assert_eq!(BranchInit::parse("empty").unwrap(), BranchInit::Empty);
        assert_eq!(BranchInit::parse("default").unwrap(), BranchInit::OneBranch);
        assert!(BranchInit::parse("three_branch").is_err());
    }

    #[test]
    fn config_round_trips() {
        let secrets = SecretBox::ephemeral();
        let mut config = Config::default();
        config.name = "cfg".into();
        config
            .settings
            .configure(
                &json!({ "BASE_MODEL": "m", "openai_api_key": "sk-x" })
                    .as_object()
                    .cloned()
                    .unwrap(),
                ConfigScope::User,
            )
            .unwrap();

        let serialized = config.to_json(&secrets).unwrap();
        assert!(!serialized.to_string().contains("sk-x"));
        let back = Config::from_json(&serialized, &secrets).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn config_from_partial_json_fills_defaults() {
        let secrets = SecretBox::ephemeral();
        let back = Config::from_json(&json!({ "name": "only-name" }), &secrets).unwrap();
        assert_eq!(back.name, "only-name");
        assert_eq!(back.style, DEFAULT_STYLE);
        assert_eq!(back.branch_initialisation, BranchInit::OneBranch);
        assert!(!back.id.is_empty());
    }

    #[test]
    fn frontend_config_configure_flags_credential_change() {
        let mut fc = FrontendConfig::default();
        let changed = fc
            .configure(
                json!({ "save_trees_to_destination": false, "tree_timeout": 5 })
                    .as_object()
                    .unwrap(),
            )
            .unwrap();
        assert!(!changed);
        assert!(!fc.save_trees_to_destination);
        assert_eq!(fc.tree_timeout, 5);

        let changed = fc
            .configure(
                json!({ "save_location_wcd_url": "https://db" })
                    .as_object()
                    .unwrap(),
            )
            .unwrap();
        assert!(changed);
    }

    #[test]
    fn frontend_config_rejects_unknown_keys() {
        let mut fc = FrontendConfig::default();
        assert!(fc
            .configure(json!({ "save_everything": true }).as_object().unwrap())
            .is_err());
    }

    #[test]
    fn frontend_config_file_round_trip() {
        let secrets = SecretBox::ephemeral();
        let dir = tempfile::tempdir().unwrap();

        let mut fc = FrontendConfig::default();
        fc.tree_timeout = 42;
        fc.save_location_wcd_url = "https://db".into();
        fc.save_location_wcd_api_key = "super-secret".into();
        fc.save_to_file(dir.path(), "u1", &secrets).unwrap();

        let raw = std::fs::read_to_string(FrontendConfig::file_path(dir.path(), "u1")).unwrap();
        assert!(!raw.contains("super-secret"));

        let back = FrontendConfig::load_from_file(dir.path(), "u1", &secrets);
        assert_eq!(back, fc);
    }

    #[test]
    fn missing_frontend_config_file_yields_defaults() {
        let secrets = SecretBox::ephemeral();
        let dir = tempfile::tempdir().unwrap();
        let fc = FrontendConfig::load_from_file(dir.path(), "ghost", &secrets);
        assert!(fc.save_trees_to_destination);
    }
}
