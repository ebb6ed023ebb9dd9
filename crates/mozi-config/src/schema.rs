// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The configuration document's schema (spec §3): `ModelSpec`, `AgentConfig`,
//! `SandboxConfig`, `CapabilityProfile`, and the `Config` document they live
//! under. Grounded on `sven-config/src/schema.rs`'s style: named `default_*`
//! functions paired with `#[serde(default = "...")]`, full custom
//! `impl Default` rather than `#[derive(Default)]` where a field needs a
//! non-zero default.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// One of spec.md §3's five accepted input modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Audio,
    Video,
    File,
}

fn default_input_modalities() -> Vec<Modality> {
    vec![Modality::Text]
}

fn default_context_window() -> u32 {
    128_000
}

fn default_max_output_tokens() -> u32 {
    4096
}

/// A model endpoint: which provider, which model, under which API family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub provider_id: String,
    pub model_id: String,
    /// Wire API family this model speaks, e.g. "openai" | "anthropic" |
    /// "google". Distinct from `provider_id` because a gateway provider
    /// (OpenRouter, LiteLLM) can front models that speak any of these.
    pub api: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of a secret registered with the Secret Broker, resolved at
    /// dispatch time rather than stored here.
    #[serde(default)]
    pub credentials_handle: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default = "default_input_modalities")]
    pub input_modalities: Vec<Modality>,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for ModelSpec {
    fn default() -> Self {
        ModelSpec {
            provider_id: "openai".into(),
            model_id: "gpt-4o".into(),
            api: "openai".into(),
            base_url: None,
            credentials_handle: None,
            headers: HashMap::new(),
            reasoning: false,
            input_modalities: default_input_modalities(),
            context_window: default_context_window(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// Sandbox backend selection (spec §3 `SandboxConfig`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    Off,
    Docker,
    AppleVm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceAccess {
    None,
    Ro,
    Rw,
}

/// External vibebox bridge binary: exec requests are handed to this process
/// rather than run directly (spec §4.J).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VibeboxBridge {
    pub binary_path: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub mode: SandboxMode,
    #[serde(default)]
    pub vibebox: Option<VibeboxBridge>,
    pub workspace_access: WorkspaceAccess,
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub auto_bootstrap: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            mode: SandboxMode::Off,
            vibebox: None,
            workspace_access: WorkspaceAccess::None,
            mounts: Vec::new(),
            env: HashMap::new(),
            network: false,
            image: None,
            auto_bootstrap: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    Low,
    Medium,
    High,
}

/// Context-pruning knobs (spec §4.G); mirrors that section's defaults
/// exactly so a bare `{}` in config produces the spec-mandated behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PruningKnobs {
    #[serde(default = "default_soft_trim_ratio")]
    pub soft_trim_ratio: f64,
    #[serde(default = "default_hard_clear_ratio")]
    pub hard_clear_ratio: f64,
    #[serde(default = "default_keep_last_assistants")]
    pub keep_last_assistants: usize,
    #[serde(default = "default_min_prunable_chars")]
    pub min_prunable_chars: usize,
}

fn default_soft_trim_ratio() -> f64 {
    0.5
}
fn default_hard_clear_ratio() -> f64 {
    0.7
}
fn default_keep_last_assistants() -> usize {
    3
}
fn default_min_prunable_chars() -> usize {
    20_000
}

impl Default for PruningKnobs {
    fn default() -> Self {
        PruningKnobs {
            soft_trim_ratio: default_soft_trim_ratio(),
            hard_clear_ratio: default_hard_clear_ratio(),
            keep_last_assistants: default_keep_last_assistants(),
            min_prunable_chars: default_min_prunable_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    /// Whether this is the agent chosen when a session names no explicit
    /// `agentId` (spec §4.L step 1). At most one entry should set this.
    #[serde(default)]
    pub main: bool,
    pub home_dir: String,
    pub workspace_dir: String,
    #[serde(default)]
    pub base_system_prompt: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub subagent_allowlist: Vec<String>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub exec_allowlist: Vec<String>,
    #[serde(default)]
    pub allowed_secrets: Vec<String>,
    #[serde(default)]
    pub heartbeat: Option<HeartbeatConfig>,
    #[serde(default = "default_thinking_level")]
    pub thinking_level: ThinkingLevel,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub pruning: PruningKnobs,
    #[serde(default)]
    pub lifecycle_control_model: Option<String>,
    #[serde(default)]
    pub lifecycle_fallback_models: Vec<String>,
    pub primary_response_model: String,
    #[serde(default)]
    pub fallback_response_models: Vec<String>,
    #[serde(default)]
    pub image_model: Option<String>,
}

fn default_thinking_level() -> ThinkingLevel {
    ThinkingLevel::Medium
}
fn default_timeout_ms() -> u64 {
    120_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Channel,
    Provider,
    Policy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModalityLimits {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub max_bytes: Option<u64>,
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
    #[serde(default)]
    pub accepted_mime_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub id: String,
    pub kind: CapabilityKind,
    #[serde(default)]
    pub input: HashMap<Modality, ModalityLimits>,
    #[serde(default)]
    pub output: HashMap<Modality, ModalityLimits>,
}

/// `runtime.auth.defaultScope` — Open Question 3, resolved to `"agent"`
/// (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultSecretScope {
    Global,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_secret_scope")]
    pub default_scope: DefaultSecretScope,
}

fn default_secret_scope() -> DefaultSecretScope {
    DefaultSecretScope::Agent
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            default_scope: default_secret_scope(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default)]
    pub base_dir: Option<String>,
}

/// The full on-disk config document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: HashMap<String, ModelSpec>,
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    #[serde(default)]
    pub capabilities: Vec<CapabilityProfile>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_spec_default_modality_is_text() {
        let spec = ModelSpec::default();
        assert_eq!(spec.input_modalities, vec![Modality::Text]);
    }

    #[test]
    fn pruning_defaults_match_spec() {
        let p = PruningKnobs::default();
        assert_eq!(p.soft_trim_ratio, 0.5);
        assert_eq!(p.hard_clear_ratio, 0.7);
        assert_eq!(p.keep_last_assistants, 3);
        assert_eq!(p.min_prunable_chars, 20_000);
    }

    #[test]
    fn runtime_default_scope_is_agent() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.auth.default_scope, DefaultSecretScope::Agent);
    }

    #[test]
    fn config_deserializes_from_empty_object() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert!(cfg.models.is_empty());
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn sandbox_config_defaults_to_off() {
        let sandbox = SandboxConfig::default();
        assert_eq!(sandbox.mode, SandboxMode::Off);
        assert_eq!(sandbox.workspace_access, WorkspaceAccess::None);
    }
}
