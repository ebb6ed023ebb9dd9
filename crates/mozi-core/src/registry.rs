// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent Registry (spec §4.L): per-session agent bindings, model resolution
//! and switching, tool selection, prompt assembly, context restoration,
//! Gemini schema sanitization, and context metrics. Grounded on
//! `sven-core/src/agent.rs`'s `Agent::set_model` context-window capture and
//! `sven-tools/src/registry.rs`'s sort-and-filter `ToolRegistry` shape.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::Mutex;

use mozi_config::schema::ThinkingLevel;
use mozi_model::{estimate_messages_tokens, sanitize_transcript, InputModality, Message, Role, TranscriptPolicy};

use crate::prompts::{assemble_prompt, PromptInputs, PromptMode};
use crate::pruner::{prune_context_messages, PrunerSettings};

/// Tools every agent gets unless it declares its own list.
pub const DEFAULT_TOOL_NAMES: &[&str] = &["read_file", "write_file", "edit_file", "create_file", "exec"];

/// Below this, a model is rejected outright.
pub const MIN_CONTEXT_WINDOW_TOKENS: u64 = 16_000;
/// Below this (but above the hard floor), a model is accepted with a warning.
pub const WARN_CONTEXT_WINDOW_TOKENS: u64 = 32_000;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no agent configured")]
    NoAgentConfigured,
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("model context window too small: {0} tokens")]
    ContextWindowTooSmall(u64),
    #[error("no candidate model passed context window validation")]
    NoViableModel,
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A declared agent's static configuration, as read from the Config Store.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub agent_id: String,
    pub main: bool,
    pub primary_model: String,
    pub fallback_models: Vec<String>,
    pub tools: Option<Vec<String>>,
    pub base_system_prompt: Option<String>,
    pub home_dir: String,
    pub workspace_dir: String,
    pub workspace_access: String,
    pub thinking_level: ThinkingLevel,
    /// Modality-specific primary model for image input (spec §4.L "model
    /// routing for modality"). Tried before the ordinary fallback chain.
    pub image_model: Option<String>,
}

/// A live binding of a session to an instantiated agent + model.
#[derive(Debug, Clone)]
pub struct AgentBinding {
    pub agent_id: String,
    pub model_ref: String,
    pub system_prompt: String,
    pub context_window_tokens: u64,
    pub sanitize_tools: bool,
    pub tools: Vec<String>,
    pub messages: Vec<Message>,
    pub thinking_level: ThinkingLevel,
}

#[derive(Debug, Clone, Default)]
struct ModelOverrides {
    runtime_override: Option<String>,
    persisted_model: Option<String>,
    sanitize_tool_schema_override: Option<bool>,
    thinking_level_override: Option<ThinkingLevel>,
}

pub struct DispatchResult {
    pub binding: AgentBinding,
    pub agent_id: String,
    pub system_prompt: String,
    pub model_ref: String,
}

/// One in-memory map `sessionKey -> agentBinding`, per spec.md §4.L.
#[derive(Default)]
pub struct AgentRegistry {
    bindings: Mutex<HashMap<String, AgentBinding>>,
    overrides: Mutex<HashMap<String, ModelOverrides>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    pub async fn binding(&self, session_key: &str) -> Option<AgentBinding> {
        self.bindings.lock().await.get(session_key).cloned()
    }

    /// Resolve (and if needed instantiate or switch) the binding for a
    /// session. `context_window_of` looks up a model id's advertised context
    /// window via the catalog collaborator. On a fresh binding, `persisted_context`
    /// (if any) is limited, pruned and sanitized before being installed as the
    /// binding's message list.
    pub async fn dispatch<F>(
        &self,
        session_key: &str,
        agents: &[AgentEntry],
        explicit_agent_id: Option<&str>,
        context_window_of: F,
        persisted_context: &[Message],
    ) -> RegistryResult<DispatchResult>
    where
        F: Fn(&str) -> Option<u64>,
    {
        let agent_id = resolve_agent_id(agents, explicit_agent_id)?;
        let agent = agents
            .iter()
            .find(|a| a.agent_id == agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.clone()))?;

        let mut overrides_guard = self.overrides.lock().await;
        let overrides = overrides_guard.entry(session_key.to_string()).or_default();

        let existing = self.bindings.lock().await.get(session_key).cloned();
        let model_ref = resolve_model_ref_with_fallback(agent, overrides, &context_window_of)?;

        let needs_rebuild = match &existing {
            Some(b) => b.agent_id != agent_id || b.model_ref != model_ref,
            None => true,
        };

        let binding = if needs_rebuild {
            let context_window_tokens = context_window_of(&model_ref).unwrap_or(0);
            if context_window_tokens < MIN_CONTEXT_WINDOW_TOKENS {
                return Err(RegistryError::ContextWindowTooSmall(context_window_tokens));
            }
            if context_window_tokens < WARN_CONTEXT_WINDOW_TOKENS {
                tracing::warn!(
                    model = %model_ref,
                    context_window_tokens,
                    "model context window is small; compaction will trigger often"
                );
            }
            let sanitize_tools = should_sanitize_tools(&model_ref, overrides.sanitize_tool_schema_override);
            let tools = resolve_tool_allow_list(agent.tools.as_deref(), &[], &["exec"]);

            let assembled = assemble_prompt(PromptInputs {
                mode: PromptMode::Main,
                home_dir: PathBuf::from(&agent.home_dir),
                workspace_dir: PathBuf::from(&agent.workspace_dir),
                base_system_prompt: agent.base_system_prompt.as_deref(),
                workspace_files: &[],
                enabled_tools: &tools,
                workspace_access: &agent.workspace_access,
                skills_listing: None,
            });

            let messages = if persisted_context.is_empty() {
                Vec::new()
            } else {
                let (pruned, stats) = prune_context_messages(
                    persisted_context,
                    context_window_tokens as usize,
                    &PrunerSettings::default(),
                );
                let policy = transcript_policy_for(&model_ref);
                let sanitized = sanitize_transcript(pruned, &policy);
                tracing::debug!(
                    session_key,
                    before = persisted_context.len(),
                    after = sanitized.len(),
                    chars_saved = stats.chars_saved,
                    "restored persisted context into new binding"
                );
                sanitized
            };

            let thinking_level = resolve_thinking_level(overrides.thinking_level_override, agent.thinking_level);

            let binding = AgentBinding {
                agent_id: agent_id.clone(),
                model_ref: model_ref.clone(),
                system_prompt: assembled.text,
                context_window_tokens,
                sanitize_tools,
                tools,
                messages,
                thinking_level,
            };
            self.bindings
                .lock()
                .await
                .insert(session_key.to_string(), binding.clone());
            binding
        } else {
            existing.expect("existing checked above")
        };

        Ok(DispatchResult {
            system_prompt: binding.system_prompt.clone(),
            model_ref: binding.model_ref.clone(),
            agent_id: binding.agent_id.clone(),
            binding,
        })
    }

    /// Switch the session's model. If `persist` is true the new model is
    /// recorded as `currentModel` and any runtime override cleared;
    /// otherwise it becomes a transient runtime override. If the switch
    /// changes `shouldSanitizeTools`, the binding is disposed so the next
    /// `dispatch` rebuilds it from scratch; otherwise the binding is rebound
    /// in place.
    pub async fn set_session_model(&self, session_key: &str, model_ref: &str, persist: bool) {
        let mut overrides_guard = self.overrides.lock().await;
        let overrides = overrides_guard.entry(session_key.to_string()).or_default();

        let old_model = overrides
            .runtime_override
            .clone()
            .or_else(|| overrides.persisted_model.clone());

        if persist {
            overrides.persisted_model = Some(model_ref.to_string());
            overrides.runtime_override = None;
        } else {
            overrides.runtime_override = Some(model_ref.to_string());
        }

        let old_sanitize = old_model
            .as_deref()
            .map(|m| should_sanitize_tools(m, overrides.sanitize_tool_schema_override))
            .unwrap_or(false);
        let new_sanitize = should_sanitize_tools(model_ref, overrides.sanitize_tool_schema_override);

        let mut bindings = self.bindings.lock().await;
        if old_sanitize != new_sanitize {
            bindings.remove(session_key);
        } else if let Some(binding) = bindings.get_mut(session_key) {
            binding.model_ref = model_ref.to_string();
        }
    }

    /// Set (or clear) a per-session thinking-level override. This disposes
    /// the binding so the next `dispatch` rebuilds it with the new
    /// resolution, mirroring `set_session_model`'s rebuild-on-change shape.
    pub async fn set_thinking_level_override(&self, session_key: &str, level: Option<ThinkingLevel>) {
        let mut overrides_guard = self.overrides.lock().await;
        let overrides = overrides_guard.entry(session_key.to_string()).or_default();
        overrides.thinking_level_override = level;
        drop(overrides_guard);
        self.bindings.lock().await.remove(session_key);
    }

    pub async fn evict(&self, session_key: &str) {
        self.bindings.lock().await.remove(session_key);
        self.overrides.lock().await.remove(session_key);
    }
}

/// Resolve which agent handles a session: explicit id, else the configured
/// `main` agent, else the first declared agent.
pub fn resolve_agent_id(agents: &[AgentEntry], explicit: Option<&str>) -> RegistryResult<String> {
    if let Some(id) = explicit {
        return if agents.iter().any(|a| a.agent_id == id) {
            Ok(id.to_string())
        } else {
            Err(RegistryError::UnknownAgent(id.to_string()))
        };
    }
    if let Some(main) = agents.iter().find(|a| a.main) {
        return Ok(main.agent_id.clone());
    }
    agents
        .first()
        .map(|a| a.agent_id.clone())
        .ok_or(RegistryError::NoAgentConfigured)
}

fn resolve_model_ref_with_fallback<F>(
    agent: &AgentEntry,
    overrides: &ModelOverrides,
    context_window_of: &F,
) -> RegistryResult<String>
where
    F: Fn(&str) -> Option<u64>,
{
    let mut candidates: Vec<String> = Vec::new();
    if let Some(m) = &overrides.runtime_override {
        candidates.push(m.clone());
    }
    if let Some(m) = &overrides.persisted_model {
        candidates.push(m.clone());
    }
    candidates.push(agent.primary_model.clone());
    candidates.extend(agent.fallback_models.iter().cloned());

    for candidate in &candidates {
        match context_window_of(candidate) {
            Some(window) if window >= MIN_CONTEXT_WINDOW_TOKENS => return Ok(candidate.clone()),
            _ => continue,
        }
    }
    // No candidate validated against the catalog (e.g. in tests with no
    // catalog wired up): fall back to the first preference rather than fail.
    candidates.into_iter().next().ok_or(RegistryError::NoViableModel)
}

/// Gemini models need JSON-Schema sanitization unless explicitly disabled.
pub fn should_sanitize_tools(model_id: &str, sanitize_override: Option<bool>) -> bool {
    if sanitize_override == Some(false) {
        return false;
    }
    model_id.to_lowercase().contains("gemini")
}

/// Infer a transcript sanitization policy from a model ref alone. `dispatch`
/// only carries `modelRef`, not the `(api, provider)` pair `TranscriptPolicy::resolve`
/// was designed around, so this mirrors `should_sanitize_tools`'s
/// substring-matching idiom instead of threading more context through the
/// registry's generic closure.
fn transcript_policy_for(model_ref: &str) -> TranscriptPolicy {
    let lower = model_ref.to_lowercase();
    if lower.contains("gemini") {
        TranscriptPolicy::resolve(model_ref, "", "google")
    } else if lower.contains("claude") || lower.contains("anthropic") {
        TranscriptPolicy::resolve(model_ref, "anthropic", "anthropic")
    } else {
        TranscriptPolicy::none()
    }
}

/// Resolve the effective thinking level for a dispatch: per-session override
/// wins, else the agent's configured level. Config has no `agents.defaults`
/// construct to fall back to further (see DESIGN.md) — every `AgentConfig`
/// already carries a concrete default, so that third tier collapses here.
pub fn resolve_thinking_level(session_override: Option<ThinkingLevel>, agent_level: ThinkingLevel) -> ThinkingLevel {
    session_override.unwrap_or(agent_level)
}

/// Union of an agent's configured tools (or the defaults) with the tools the
/// runtime always requires (e.g. `exec`).
pub fn resolve_tool_allow_list(
    agent_tools: Option<&[String]>,
    default_tools: &[String],
    required_tools: &[&str],
) -> Vec<String> {
    let mut set: HashSet<String> = match agent_tools {
        Some(tools) => tools.iter().cloned().collect(),
        None if !default_tools.is_empty() => default_tools.iter().cloned().collect(),
        None => DEFAULT_TOOL_NAMES.iter().map(|s| s.to_string()).collect(),
    };
    for tool in required_tools {
        set.insert(tool.to_string());
    }
    let mut list: Vec<String> = set.into_iter().collect();
    list.sort();
    list
}

const UNSUPPORTED_SCHEMA_KEYWORDS: &[&str] = &[
    "$schema",
    "$id",
    "examples",
    "default",
    "minLength",
    "maxLength",
    "pattern",
    "minimum",
    "maximum",
    "multipleOf",
    "minItems",
    "maxItems",
    "uniqueItems",
    "minProperties",
    "maxProperties",
    "if",
    "then",
    "else",
    "not",
    "oneOf",
];

/// Rewrite a JSON Schema for Gemini's reduced schema dialect: `anyOf` of
/// `const` branches becomes `enum` (or is dropped if any branch isn't a bare
/// const); a single-pattern `patternProperties` covering everything becomes
/// `additionalProperties` (dropped otherwise); keywords Gemini rejects are
/// stripped. Recurses into `properties`, `items`, and `additionalProperties`.
pub fn sanitize_schema_for_gemini(schema: &Value) -> Value {
    let Value::Object(map) = schema else {
        return schema.clone();
    };

    let mut out = serde_json::Map::new();
    for (key, value) in map {
        if UNSUPPORTED_SCHEMA_KEYWORDS.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "anyOf" => {
                if let Some(enum_values) = any_of_all_const(value) {
                    out.insert(
                        "type".to_string(),
                        Value::String("string".to_string()),
                    );
                    out.insert("enum".to_string(), Value::Array(enum_values));
                }
                // Mixed anyOf has no Gemini equivalent; drop it with a warning.
                else {
                    tracing::warn!("dropping unsupported mixed anyOf from tool schema");
                }
            }
            "patternProperties" => {
                if let Value::Object(patterns) = value {
                    if patterns.len() == 1 {
                        if let Some((pattern, inner)) = patterns.iter().next() {
                            if pattern == "^.*$" || pattern == "^(.*)$" {
                                out.insert(
                                    "additionalProperties".to_string(),
                                    sanitize_schema_for_gemini(inner),
                                );
                            }
                        }
                    }
                    // Multi-pattern maps have no single-keyword equivalent; drop.
                }
            }
            "properties" => {
                if let Value::Object(props) = value {
                    let mut new_props = serde_json::Map::new();
                    for (name, prop_schema) in props {
                        new_props.insert(name.clone(), sanitize_schema_for_gemini(prop_schema));
                    }
                    out.insert("properties".to_string(), Value::Object(new_props));
                }
            }
            "items" => {
                out.insert("items".to_string(), sanitize_schema_for_gemini(value));
            }
            "additionalProperties" => match value {
                Value::Bool(_) => {
                    out.insert(key.clone(), value.clone());
                }
                _ => {
                    out.insert(key.clone(), sanitize_schema_for_gemini(value));
                }
            },
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(out)
}

fn any_of_all_const(value: &Value) -> Option<Vec<Value>> {
    let arr = value.as_array()?;
    let mut consts = Vec::with_capacity(arr.len());
    for branch in arr {
        let obj = branch.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        consts.push(obj.get("const")?.clone());
    }
    Some(consts)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextUsage {
    pub used_tokens: usize,
    pub total_tokens: u64,
    pub percentage: f64,
    pub message_count: usize,
}

pub fn get_context_usage(messages: &[Message], total_tokens: u64) -> ContextUsage {
    let used = estimate_messages_tokens(messages);
    let percentage = if total_tokens == 0 {
        0.0
    } else {
        (used as f64 / total_tokens as f64) * 100.0
    };
    ContextUsage {
        used_tokens: used,
        total_tokens,
        percentage,
        message_count: messages.len(),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextBreakdown {
    pub user_tokens: usize,
    pub assistant_tokens: usize,
    pub tool_result_tokens: usize,
    pub bash_execution_tokens: usize,
}

pub fn get_context_breakdown(messages: &[Message]) -> ContextBreakdown {
    let mut breakdown = ContextBreakdown::default();
    for message in messages {
        let tokens = estimate_messages_tokens(std::slice::from_ref(message));
        match message.role {
            Role::User => breakdown.user_tokens += tokens,
            Role::Assistant => breakdown.assistant_tokens += tokens,
            Role::ToolResult => breakdown.tool_result_tokens += tokens,
            Role::BashExecution => breakdown.bash_execution_tokens += tokens,
        }
    }
    breakdown
}

/// Outcome of [`ensure_session_model_for_input`]'s candidate search.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSwitchOutcome {
    /// `model_ref` can serve the input; `switched` says whether it differs
    /// from the model the session was already bound to.
    Ready { model_ref: String, switched: bool },
    /// No candidate in the chain supports the required modality.
    NoViableModel { candidates: Vec<String> },
}

/// Which model should serve the next input, given its modality requirement
/// (spec §4.L "model routing for modality"). Text-only input (`None`) always
/// keeps the current binding. For any other modality, if the current model
/// doesn't support it, try the agent's modality-specific primary
/// (`image_model`, for `Image`), then its primary model, then its ordinary
/// fallback chain, in declared order, returning the first that supports it.
pub fn ensure_session_model_for_input(
    agent: &AgentEntry,
    current_model: &str,
    required_modality: Option<InputModality>,
    supports_modality: impl Fn(&str, InputModality) -> bool,
) -> ModelSwitchOutcome {
    let Some(modality) = required_modality else {
        return ModelSwitchOutcome::Ready {
            model_ref: current_model.to_string(),
            switched: false,
        };
    };
    if supports_modality(current_model, modality) {
        return ModelSwitchOutcome::Ready {
            model_ref: current_model.to_string(),
            switched: false,
        };
    }

    let mut candidates: Vec<String> = Vec::new();
    if modality == InputModality::Image {
        candidates.extend(agent.image_model.clone());
    }
    candidates.push(agent.primary_model.clone());
    candidates.extend(agent.fallback_models.iter().cloned());
    candidates.retain(|c| c != current_model);

    for candidate in &candidates {
        if supports_modality(candidate, modality) {
            return ModelSwitchOutcome::Ready {
                model_ref: candidate.clone(),
                switched: true,
            };
        }
    }
    ModelSwitchOutcome::NoViableModel { candidates }
}
