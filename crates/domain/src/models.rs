//! The provider → model catalogue.
//!
//! Used by smart setup to pick sensible defaults for whichever API keys are
//! present, and by config validation to name the key a provider requires.

/// Accuracy tier of a model within its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Fast,
    Medium,
    High,
}

/// A single catalogue entry.
#[derive(Debug, Clone, Copy)]
pub struct CatalogueModel {
    pub name: &'static str,
    pub tier: Tier,
}

/// A provider with its required API key and known models.
#[derive(Debug, Clone, Copy)]
pub struct CatalogueProvider {
    pub name: &'static str,
    /// The lower-cased `API_KEYS` entry this provider authenticates with.
    pub api_key: &'static str,
    pub models: &'static [CatalogueModel],
}

/// Providers in smart-setup preference order.
pub const PROVIDERS: &[CatalogueProvider] = &[
    CatalogueProvider {
        name: "openai",
        api_key: "openai_api_key",
        models: &[
            CatalogueModel { name: "gpt-4.1", tier: Tier::High },
            CatalogueModel { name: "gpt-4.1-mini", tier: Tier::Medium },
            CatalogueModel { name: "gpt-4.1-nano", tier: Tier::Fast },
        ],
    },
    CatalogueProvider {
        name: "anthropic",
        api_key: "anthropic_api_key",
        models: &[
            CatalogueModel { name: "claude-sonnet-4-20250514", tier: Tier::High },
            CatalogueModel { name: "claude-3-7-sonnet-20250219", tier: Tier::Medium },
            CatalogueModel { name: "claude-3-5-haiku-20241022", tier: Tier::Fast },
        ],
    },
    CatalogueProvider {
        name: "gemini",
        api_key: "gemini_api_key",
        models: &[
            CatalogueModel { name: "gemini-2.5-pro", tier: Tier::High },
            CatalogueModel { name: "gemini-2.5-flash", tier: Tier::Medium },
            CatalogueModel { name: "gemini-2.5-flash-lite", tier: Tier::Fast },
        ],
    },
    CatalogueProvider {
        name: "openrouter/openai",
        api_key: "openrouter_api_key",
        models: &[
            CatalogueModel { name: "gpt-4.1", tier: Tier::High },
            CatalogueModel { name: "gpt-4.1-mini", tier: Tier::Medium },
            CatalogueModel { name: "gpt-4.1-nano", tier: Tier::Fast },
        ],
    },
    CatalogueProvider {
        name: "openrouter/anthropic",
        api_key: "openrouter_api_key",
        models: &[
            CatalogueModel { name: "claude-sonnet-4", tier: Tier::High },
            CatalogueModel { name: "claude-3-7-sonnet", tier: Tier::Medium },
            CatalogueModel { name: "claude-3-5-haiku", tier: Tier::Fast },
        ],
    },
    CatalogueProvider {
        name: "openrouter/google",
        api_key: "openrouter_api_key",
        models: &[
            CatalogueModel { name: "gemini-2.5-pro", tier: Tier::High },
            CatalogueModel { name: "gemini-2.5-flash", tier: Tier::Medium },
            CatalogueModel { name: "gemini-2.5-flash-lite", tier: Tier::Fast },
        ],
    },
];

/// Look up a provider by name.
pub fn provider(name: &str) -> Option<&'static CatalogueProvider> {
    PROVIDERS.iter().find(|p| p.name == name)
}

/// The API key name a provider requires, if the provider is known.
pub fn required_api_key(provider_name: &str) -> Option<&'static str> {
    provider(provider_name).map(|p| p.api_key)
}

/// Pick the (base, complex) model pair for a provider: the fastest
/// medium-or-below model for base, the highest-accuracy model for complex.
pub fn default_pair(provider_name: &str) -> Option<(&'static str, &'static str)> {
    let p = provider(provider_name)?;
    let complex = p
        .models
        .iter()
        .find(|m| m.tier == Tier::High)
        .or_else(|| p.models.first())?;
    let base = p
        .models
        .iter()
        .find(|m| m.tier == Tier::Medium)
        .or_else(|| p.models.iter().find(|m| m.tier == Tier::Fast))
        .or_else(|| p.models.first())?;
    Some((base.name, complex.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preference_order_starts_with_openai() {
        assert_eq!(PROVIDERS[0].name, "openai");
        assert_eq!(PROVIDERS[1].name, "anthropic");
        assert_eq!(PROVIDERS[2].name, "gemini");
    }

    #[test]
    fn default_pair_picks_medium_and_high() {
        let (base, complex) = default_pair("openai").unwrap();
        assert_eq!(base, "gpt-4.1-mini");
        assert_eq!(complex, "gpt-4.1");
    }

    #[test]
    fn openrouter_variants_share_a_key() {
        assert_eq!(required_api_key("openrouter/openai"), Some("openrouter_api_key"));
        assert_eq!(required_api_key("openrouter/google"), Some("openrouter_api_key"));
        assert_eq!(required_api_key("nope"), None);
    }
}
