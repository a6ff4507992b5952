use async_trait::async_trait;
use dashmap::DashMap;

use crate::claude::SystemPromptOverride;

/// Per-caller and global runtime overrides. Per-caller values win over the
/// global ones; static config (RelayConfig) sits below both.
#[async_trait]
pub trait CallerConfigStore: Send + Sync {
    async fn caller_model_mapping(&self, caller_id: &str, model: &str) -> Option<String>;
    async fn global_model_mapping(&self, model: &str) -> Option<String>;
    async fn caller_system_prompt(&self, caller_id: &str) -> Option<SystemPromptOverride>;
    async fn global_system_prompt(&self) -> Option<SystemPromptOverride>;
}

#[derive(Debug, Default)]
pub struct MemoryCallerConfig {
    caller_mappings: DashMap<(String, String), String>,
    global_mappings: DashMap<String, String>,
    caller_prompts: DashMap<String, SystemPromptOverride>,
    global_prompt: DashMap<(), SystemPromptOverride>,
}

impl MemoryCallerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_caller_mapping(&self, caller_id: &str, from: &str, to: &str) {
        self.caller_mappings
            .insert((caller_id.to_string(), from.to_string()), to.to_string());
    }

    pub fn set_global_mapping(&self, from: &str, to: &str) {
        self.global_mappings
            .insert(from.to_string(), to.to_string());
    }

    pub fn set_caller_prompt(&self, caller_id: &str, prompt: SystemPromptOverride) {
        self.caller_prompts.insert(caller_id.to_string(), prompt);
    }

    pub fn set_global_prompt(&self, prompt: SystemPromptOverride) {
        self.global_prompt.insert((), prompt);
    }
}

#[async_trait]
impl CallerConfigStore for MemoryCallerConfig {
    async fn caller_model_mapping(&self, caller_id: &str, model: &str) -> Option<String> {
        self.caller_mappings
            .get(&(caller_id.to_string(), model.to_string()))
            .map(|v| v.clone())
    }

    async fn global_model_mapping(&self, model: &str) -> Option<String> {
        self.global_mappings.get(model).map(|v| v.clone())
    }

    async fn caller_system_prompt(&self, caller_id: &str) -> Option<SystemPromptOverride> {
        self.caller_prompts.get(caller_id).map(|v| v.clone())
    }

    async fn global_system_prompt(&self) -> Option<SystemPromptOverride> {
        self.global_prompt.get(&()).map(|v| v.clone())
    }
}
