//! Defaults and persistence behaviour of the shared config types, through
//! the public API only.

use arbor_domain::config::{BranchInit, Config, FrontendConfig};
use arbor_domain::secrets::SecretBox;
use arbor_domain::settings::{ConfigScope, Settings};
use serde_json::json;

#[test]
fn default_config_is_complete_and_unconfigured() {
    let config = Config::default();
    assert_eq!(config.name, "New Config");
    assert_eq!(config.branch_initialisation, BranchInit::OneBranch);
    assert!(!config.style.is_empty());
    assert!(!config.agent_description.is_empty());
    assert!(!config.end_goal.is_empty());
    // A config with no credentials cannot pass the settings check.
    assert!(!config.settings.check());
}

#[test]
fn settings_check_needs_models_providers_and_keys() {
    let mut settings = Settings::new();
    settings
        .configure(
            json!({
                "BASE_MODEL": "gpt-4.1-mini",
                "COMPLEX_MODEL": "gpt-4.1",
                "BASE_PROVIDER": "openai",
                "COMPLEX_PROVIDER": "openai",
                "WCD_URL": "https://db.example",
                "WCD_API_KEY": "wcd",
                "openai_api_key": "sk",
            })
            .as_object()
            .unwrap(),
            ConfigScope::User,
        )
        .unwrap();
    assert!(settings.check());

    // Mixed providers each need their own key.
    settings
        .configure(
            json!({ "COMPLEX_PROVIDER": "anthropic" }).as_object().unwrap(),
            ConfigScope::User,
        )
        .unwrap();
    assert!(!settings.check());
    settings
        .configure(
            json!({ "anthropic_api_key": "sk-ant" }).as_object().unwrap(),
            ConfigScope::User,
        )
        .unwrap();
    assert!(settings.check());
}

#[test]
fn config_survives_encrypted_round_trip() {
    let secrets = SecretBox::ephemeral();
    let mut config = Config::default();
    config
        .settings
        .configure(
            json!({ "openai_api_key": "sk-round-trip", "BASE_MODEL": "m" })
                .as_object()
                .unwrap(),
            ConfigScope::User,
        )
        .unwrap();

    let value = config.to_json(&secrets).unwrap();
    assert!(!value.to_string().contains("sk-round-trip"));
    let restored = Config::from_json(&value, &secrets).unwrap();
    assert_eq!(restored, config);
}

#[test]
fn frontend_config_defaults_enable_saving() {
    let frontend_config = FrontendConfig::default();
    assert!(frontend_config.save_trees_to_destination);
    assert!(frontend_config.save_configs_to_destination);
    assert!(frontend_config.tree_timeout >= 1);
    assert!(frontend_config.client_timeout >= 1);
}
