use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Static relay configuration. Everything here has a sane default so the
/// gateway boots with an empty config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Static Claude-model -> Gemini-model mapping, lowest precedence after
    /// per-caller and global dynamic mappings.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default = "default_target_model")]
    pub default_target_model: String,
    #[serde(default = "default_sticky_ttl_seconds")]
    pub sticky_ttl_seconds: u64,
    /// Sticky TTL is re-armed on a hit only while the remaining TTL is below
    /// this threshold. The default equals the full TTL, so every hit renews.
    #[serde(default = "default_sticky_ttl_seconds")]
    pub sticky_renewal_threshold_seconds: u64,
    #[serde(default = "default_rate_limit_minutes")]
    pub rate_limit_minutes: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_allow_api_accounts")]
    pub allow_api_accounts: bool,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
}

impl Default for RelayConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(Default::default()))
            .expect("empty relay config")
    }
}

impl RelayConfig {
    /// Models already in the target provider's namespace pass through the
    /// mapping chain untouched.
    pub fn is_native_model(model: &str) -> bool {
        model.starts_with("gemini-") || model.starts_with("models/gemini-")
    }
}

/// How a target model family expresses extended reasoning. This is config
/// input, not hard-coded policy; new families get a rule, not a code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingStyle {
    /// Qualitative LOW/MEDIUM/HIGH setting.
    Level,
    /// Numeric token budget, capped.
    Budget,
    /// The field must never be sent to this family.
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapabilityRule {
    /// Substring match against the resolved target model name.
    pub model_contains: String,
    pub style: ThinkingStyle,
    /// Mandatory extended reasoning: thinkingConfig is sent even when the
    /// request carries no thinking/reasoning directive.
    #[serde(default)]
    pub mandatory_thinking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default = "default_capability_rules")]
    pub rules: Vec<ModelCapabilityRule>,
    #[serde(default = "default_thinking_style")]
    pub default_style: ThinkingStyle,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            rules: default_capability_rules(),
            default_style: default_thinking_style(),
        }
    }
}

impl ModelCapabilities {
    fn rule_for(&self, model: &str) -> Option<&ModelCapabilityRule> {
        self.rules
            .iter()
            .find(|rule| model.contains(&rule.model_contains))
    }

    pub fn thinking_style(&self, model: &str) -> ThinkingStyle {
        self.rule_for(model)
            .map(|rule| rule.style)
            .unwrap_or(self.default_style)
    }

    pub fn requires_thinking(&self, model: &str) -> bool {
        self.rule_for(model)
            .map(|rule| rule.mandatory_thinking)
            .unwrap_or(false)
    }
}

fn default_capability_rules() -> Vec<ModelCapabilityRule> {
    vec![
        ModelCapabilityRule {
            model_contains: "gemini-3".to_string(),
            style: ThinkingStyle::Level,
            mandatory_thinking: true,
        },
        ModelCapabilityRule {
            model_contains: "gemini-1.5".to_string(),
            style: ThinkingStyle::Unsupported,
            mandatory_thinking: false,
        },
    ]
}

fn default_thinking_style() -> ThinkingStyle {
    ThinkingStyle::Budget
}

fn default_target_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_sticky_ttl_seconds() -> u64 {
    3600
}

fn default_rate_limit_minutes() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout_ms() -> u64 {
    600_000
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_allow_api_accounts() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = RelayConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.sticky_ttl_seconds, 3600);
        assert!(config.allow_api_accounts);
    }

    #[test]
    fn capability_rules_match_by_substring() {
        let caps = ModelCapabilities::default();
        assert_eq!(
            caps.thinking_style("gemini-3-pro-preview"),
            ThinkingStyle::Level
        );
        assert!(caps.requires_thinking("gemini-3-pro-preview"));
        assert_eq!(
            caps.thinking_style("gemini-2.5-flash"),
            ThinkingStyle::Budget
        );
        assert!(!caps.requires_thinking("gemini-2.5-flash"));
        assert_eq!(
            caps.thinking_style("gemini-1.5-pro"),
            ThinkingStyle::Unsupported
        );
    }

    #[test]
    fn native_model_detection() {
        assert!(RelayConfig::is_native_model("gemini-2.5-pro"));
        assert!(!RelayConfig::is_native_model("claude-sonnet-4"));
    }
}
