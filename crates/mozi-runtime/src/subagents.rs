// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Subagent Registry (spec §4.M): bounded fan-out of a parent session into
//! child turns, plus the event-driven announcer that narrates a finished
//! run back to the parent. Grounded on `sven-core/src/task_tool.rs`'s
//! depth-bounded sub-agent spawn (there: an `AtomicUsize` depth counter and
//! a throwaway `ToolRegistry`), generalized from the teacher's single
//! process-local counter to a per-parent-session registry with persisted
//! state, since spec.md §4.M tracks named, resumable runs rather than a
//! transient recursion guard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use mozi_core::registry::{AgentEntry, AgentRegistry};
use mozi_core::PromptMode;
use tokio::sync::Mutex;

use crate::bus::{BusEvent, EventData, LifecyclePhase};
use crate::collaborators::TurnRunner;

/// Per-parent-session cap on in-flight subagent runs (spec.md §4.M).
pub const MAX_CONCURRENT_SUBAGENTS: usize = 2;

/// How long an announced (terminal) run is kept before the sweep deletes
/// it, in seconds.
pub const ANNOUNCED_RUN_RETENTION_SECS: u64 = 60 * 60;

/// How often the sweep runs, in seconds.
pub const SWEEP_INTERVAL_SECS: u64 = 5 * 60;

#[derive(Debug, thiserror::Error)]
pub enum SubagentError {
    #[error("subagent concurrency cap ({0}) reached for this parent session")]
    ConcurrencyCapReached(usize),
    #[error("agent {0} is not in the parent's subagent allowlist")]
    NotAllowed(String),
    #[error("agent {0} is the primary agent and cannot be run as a subagent")]
    IsPrimaryAgent(String),
    #[error(transparent)]
    Registry(#[from] mozi_core::registry::RegistryError),
    #[error(transparent)]
    Turn(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SubagentRunRequest {
    pub parent_session_key: String,
    pub parent_agent_id: String,
    pub agent_id: Option<String>,
    pub label: Option<String>,
    pub prompt: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubagentStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubagentRun {
    pub child_session_key: String,
    pub parent_session_key: String,
    pub label: String,
    pub status: SubagentStatus,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub result_text: Option<String>,
    pub error: Option<String>,
    pub announced: bool,
}

/// The on-disk shape persisted to `subagent-runs.json` (spec.md §6).
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct SubagentRunsFile {
    pub runs: Vec<SubagentRun>,
}

fn primary_agent_id(agents: &[AgentEntry]) -> Option<String> {
    agents.iter().find(|a| a.main).map(|a| a.agent_id.clone())
}

/// Tracks live and recently-finished subagent runs for every parent
/// session, and enforces the concurrency cap.
pub struct SubagentRegistry {
    runs: Mutex<HashMap<String, SubagentRun>>,
    in_flight: Mutex<HashMap<String, usize>>,
    ephemeral_counter: AtomicU64,
}

impl Default for SubagentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubagentRegistry {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            ephemeral_counter: AtomicU64::new(0),
        }
    }

    async fn acquire_slot(&self, parent_session_key: &str) -> Result<(), SubagentError> {
        let mut in_flight = self.in_flight.lock().await;
        let count = in_flight.entry(parent_session_key.to_string()).or_insert(0);
        if *count >= MAX_CONCURRENT_SUBAGENTS {
            return Err(SubagentError::ConcurrencyCapReached(MAX_CONCURRENT_SUBAGENTS));
        }
        *count += 1;
        Ok(())
    }

    async fn release_slot(&self, parent_session_key: &str) {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(count) = in_flight.get_mut(parent_session_key) {
            *count = count.saturating_sub(1);
        }
    }

    /// Run one subagent turn to completion, respecting the per-parent
    /// concurrency cap, and record its result.
    pub async fn run<F>(
        &self,
        request: SubagentRunRequest,
        subagent_allowlist: &[String],
        agents: &[AgentEntry],
        agent_registry: &AgentRegistry,
        turn_runner: &dyn TurnRunner,
        context_window_of: F,
        now: &str,
    ) -> Result<SubagentRun, SubagentError>
    where
        F: Fn(&str) -> Option<u64>,
    {
        self.acquire_slot(&request.parent_session_key).await?;
        let result = self
            .run_inner(request, subagent_allowlist, agents, agent_registry, turn_runner, context_window_of, now)
            .await;
        result
    }

    async fn run_inner<F>(
        &self,
        request: SubagentRunRequest,
        subagent_allowlist: &[String],
        agents: &[AgentEntry],
        agent_registry: &AgentRegistry,
        turn_runner: &dyn TurnRunner,
        context_window_of: F,
        now: &str,
    ) -> Result<SubagentRun, SubagentError>
    where
        F: Fn(&str) -> Option<u64>,
    {
        let (child_session_key, dispatch_agent_id) = match &request.agent_id {
            Some(agent_id) => {
                if !subagent_allowlist.iter().any(|a| a == agent_id) {
                    self.release_slot(&request.parent_session_key).await;
                    return Err(SubagentError::NotAllowed(agent_id.clone()));
                }
                if primary_agent_id(agents).as_deref() == Some(agent_id.as_str()) {
                    self.release_slot(&request.parent_session_key).await;
                    return Err(SubagentError::IsPrimaryAgent(agent_id.clone()));
                }
                (format!("{agent_id}::{}", request.parent_session_key), agent_id.clone())
            }
            None => {
                let n = self.ephemeral_counter.fetch_add(1, Ordering::Relaxed);
                let key = format!(
                    "{}-sub-{n}::{}",
                    request.parent_agent_id, request.parent_session_key
                );
                (key, request.parent_agent_id.clone())
            }
        };

        let dispatch = agent_registry
            .dispatch(&child_session_key, agents, Some(&dispatch_agent_id), &context_window_of, &[])
            .await;

        let dispatch = match dispatch {
            Ok(d) => d,
            Err(e) => {
                self.release_slot(&request.parent_session_key).await;
                return Err(e.into());
            }
        };

        if let Some(model) = &request.model {
            agent_registry.set_session_model(&child_session_key, model, false).await;
        }

        let label = request.label.clone().unwrap_or_else(|| "subagent task".to_string());
        let mut run = SubagentRun {
            child_session_key: child_session_key.clone(),
            parent_session_key: request.parent_session_key.clone(),
            label,
            status: SubagentStatus::Running,
            started_at: Some(now.to_string()),
            ended_at: None,
            result_text: None,
            error: None,
            announced: false,
        };
        self.runs.lock().await.insert(child_session_key.clone(), run.clone());

        let turn_result = turn_runner
            .run_turn(&dispatch.system_prompt, &dispatch.model_ref, PromptMode::SubagentMinimal, &request.prompt)
            .await;

        self.release_slot(&request.parent_session_key).await;

        match turn_result {
            Ok(messages) => {
                let text = messages
                    .iter()
                    .rev()
                    .find(|m| matches!(m.role, mozi_model::Role::Assistant))
                    .map(|m| m.content.as_text());
                run.status = SubagentStatus::Completed;
                run.result_text = text;
                run.ended_at = Some(now.to_string());
            }
            Err(e) => {
                run.status = SubagentStatus::Failed;
                run.error = Some(e.to_string());
                run.ended_at = Some(now.to_string());
            }
        }

        self.runs.lock().await.insert(child_session_key, run.clone());
        Ok(run)
    }

    pub async fn get(&self, child_session_key: &str) -> Option<SubagentRun> {
        self.runs.lock().await.get(child_session_key).cloned()
    }

    pub async fn snapshot(&self) -> SubagentRunsFile {
        SubagentRunsFile {
            runs: self.runs.lock().await.values().cloned().collect(),
        }
    }

    /// Apply one lifecycle-bus event to whichever tracked run it targets,
    /// returning the run if that event made it terminal. Used by the
    /// announcer so it never needs to reach into this registry's locking.
    pub async fn apply_lifecycle_event(&self, event: &crate::bus::BusEvent, now: &str) -> Option<SubagentRun> {
        let mut runs = self.runs.lock().await;
        handle_lifecycle_event(&mut runs, event, now)
    }

    pub async fn mark_announced(&self, child_session_key: &str) {
        if let Some(run) = self.runs.lock().await.get_mut(child_session_key) {
            run.announced = true;
        }
    }

    /// Delete announced runs whose `endedAt` is older than
    /// [`ANNOUNCED_RUN_RETENTION_SECS`]. `age_secs` is supplied by the
    /// caller (a clock is a runtime collaborator, not this registry's
    /// concern) and maps `childSessionKey -> age in seconds`.
    pub async fn sweep<F>(&self, age_secs: F)
    where
        F: Fn(&SubagentRun) -> Option<u64>,
    {
        let mut runs = self.runs.lock().await;
        runs.retain(|_, run| {
            if !run.announced {
                return true;
            }
            match age_secs(run) {
                Some(age) => age < ANNOUNCED_RUN_RETENTION_SECS,
                None => true,
            }
        });
    }
}

/// Build the parent-facing trigger message spec.md §4.M specifies for a
/// terminal lifecycle event on a registered child session.
pub fn build_trigger_message(run: &SubagentRun, runtime_label: &str) -> String {
    let status_phrase = match run.status {
        SubagentStatus::Completed => "completed",
        SubagentStatus::Failed => "failed",
        SubagentStatus::Running => "is still running",
    };
    let findings = run.result_text.as_deref().unwrap_or("(no output)");
    format!(
        "A background task \"{}\" just {status_phrase}.\n\n\
Findings:\n{findings}\n\n\
Stats: runtime {runtime_label} • sessionKey {}\n\n\
Summarize this naturally for the user. Keep it brief (1-2 sentences).\n\
You can respond with NO_REPLY if no announcement is needed.",
        run.label, run.child_session_key
    )
}

/// Listens to the Lifecycle Bus and updates subagent run records when a
/// registered child session reaches a terminal lifecycle phase.
pub fn handle_lifecycle_event(registry_runs: &mut HashMap<String, SubagentRun>, event: &BusEvent, now: &str) -> Option<SubagentRun> {
    let EventData::Lifecycle { phase, error, .. } = &event.data else {
        return None;
    };
    let run = registry_runs.get_mut(&event.session_key)?;
    match phase {
        LifecyclePhase::Start => {
            run.status = SubagentStatus::Running;
            run.started_at.get_or_insert_with(|| now.to_string());
            None
        }
        LifecyclePhase::End => {
            run.status = SubagentStatus::Completed;
            run.ended_at = Some(now.to_string());
            Some(run.clone())
        }
        LifecyclePhase::Error => {
            run.status = SubagentStatus::Failed;
            run.error = error.clone();
            run.ended_at = Some(now.to_string());
            Some(run.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mozi_model::Message;

    struct StubRunner {
        reply: String,
    }

    #[async_trait]
    impl TurnRunner for StubRunner {
        async fn run_turn(
            &self,
            _system_prompt: &str,
            _model_ref: &str,
            _prompt_mode: PromptMode,
            prompt: &str,
        ) -> anyhow::Result<Vec<Message>> {
            Ok(vec![Message::assistant(format!("{}: {prompt}", self.reply), "t", None)])
        }
    }

    fn agents() -> Vec<AgentEntry> {
        vec![
            AgentEntry {
                agent_id: "main".into(),
                main: true,
                primary_model: "m1".into(),
                fallback_models: vec![],
                tools: None,
                base_system_prompt: Some("main prompt".into()),
                home_dir: String::new(),
                workspace_dir: String::new(),
                workspace_access: "rw".into(),
                thinking_level: mozi_config::schema::ThinkingLevel::Medium,
                image_model: None,
            },
            AgentEntry {
                agent_id: "researcher".into(),
                main: false,
                primary_model: "m1".into(),
                fallback_models: vec![],
                tools: None,
                base_system_prompt: Some("researcher prompt".into()),
                home_dir: String::new(),
                workspace_dir: String::new(),
                workspace_access: "rw".into(),
                thinking_level: mozi_config::schema::ThinkingLevel::Medium,
                image_model: None,
            },
        ]
    }

    fn ctx_window(_m: &str) -> Option<u64> {
        Some(200_000)
    }

    #[tokio::test]
    async fn named_agent_not_in_allowlist_is_rejected() {
        let registry = SubagentRegistry::new();
        let agent_registry = AgentRegistry::new();
        let runner = StubRunner { reply: "done".into() };
        let request = SubagentRunRequest {
            parent_session_key: "agent:main:telegram:dm:u1".into(),
            parent_agent_id: "main".into(),
            agent_id: Some("researcher".into()),
            label: None,
            prompt: "investigate".into(),
            model: None,
        };
        let result = registry.run(request, &[], &agents(), &agent_registry, &runner, ctx_window, "t0").await;
        assert!(matches!(result, Err(SubagentError::NotAllowed(_))));
    }

    #[tokio::test]
    async fn primary_agent_cannot_be_used_as_subagent() {
        let registry = SubagentRegistry::new();
        let agent_registry = AgentRegistry::new();
        let runner = StubRunner { reply: "done".into() };
        let request = SubagentRunRequest {
            parent_session_key: "agent:main:telegram:dm:u1".into(),
            parent_agent_id: "main".into(),
            agent_id: Some("main".into()),
            label: None,
            prompt: "investigate".into(),
            model: None,
        };
        let result = registry
            .run(request, &["main".to_string()], &agents(), &agent_registry, &runner, ctx_window, "t0")
            .await;
        assert!(matches!(result, Err(SubagentError::IsPrimaryAgent(_))));
    }

    #[tokio::test]
    async fn named_subagent_run_completes_and_extracts_text() {
        let registry = SubagentRegistry::new();
        let agent_registry = AgentRegistry::new();
        let runner = StubRunner { reply: "result".into() };
        let request = SubagentRunRequest {
            parent_session_key: "agent:main:telegram:dm:u1".into(),
            parent_agent_id: "main".into(),
            agent_id: Some("researcher".into()),
            label: Some("dig into logs".into()),
            prompt: "why did it crash".into(),
            model: None,
        };
        let run = registry
            .run(request, &["researcher".to_string()], &agents(), &agent_registry, &runner, ctx_window, "t0")
            .await
            .unwrap();
        assert_eq!(run.status, SubagentStatus::Completed);
        assert!(run.result_text.unwrap().contains("why did it crash"));
        assert_eq!(run.child_session_key, "researcher::agent:main:telegram:dm:u1");
    }

    #[tokio::test]
    async fn ephemeral_subagent_uses_derived_key() {
        let registry = SubagentRegistry::new();
        let agent_registry = AgentRegistry::new();
        let runner = StubRunner { reply: "result".into() };
        let request = SubagentRunRequest {
            parent_session_key: "agent:main:telegram:dm:u1".into(),
            parent_agent_id: "main".into(),
            agent_id: None,
            label: None,
            prompt: "scratch task".into(),
            model: None,
        };
        let run = registry
            .run(request, &[], &agents(), &agent_registry, &runner, ctx_window, "t0")
            .await
            .unwrap();
        assert!(run.child_session_key.starts_with("main-sub-0::agent:main:telegram:dm:u1"));
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_a_third_concurrent_run() {
        let registry = SubagentRegistry::new();
        registry.in_flight.lock().await.insert("p".to_string(), MAX_CONCURRENT_SUBAGENTS);
        let agent_registry = AgentRegistry::new();
        let runner = StubRunner { reply: "result".into() };
        let request = SubagentRunRequest {
            parent_session_key: "p".into(),
            parent_agent_id: "main".into(),
            agent_id: None,
            label: None,
            prompt: "x".into(),
            model: None,
        };
        let result = registry.run(request, &[], &agents(), &agent_registry, &runner, ctx_window, "t0").await;
        assert!(matches!(result, Err(SubagentError::ConcurrencyCapReached(_))));
    }

    #[test]
    fn trigger_message_includes_label_findings_and_key() {
        let run = SubagentRun {
            child_session_key: "researcher::agent:main:telegram:dm:u1".into(),
            parent_session_key: "agent:main:telegram:dm:u1".into(),
            label: "dig into logs".into(),
            status: SubagentStatus::Completed,
            started_at: Some("t0".into()),
            ended_at: Some("t1".into()),
            result_text: Some("found a null pointer".into()),
            error: None,
            announced: false,
        };
        let message = build_trigger_message(&run, "12s");
        assert!(message.contains("dig into logs"));
        assert!(message.contains("found a null pointer"));
        assert!(message.contains("researcher::agent:main:telegram:dm:u1"));
        assert!(message.contains("NO_REPLY"));
    }

    #[tokio::test]
    async fn sweep_removes_only_old_announced_runs() {
        let registry = SubagentRegistry::new();
        let mut old = SubagentRun {
            child_session_key: "old".into(),
            parent_session_key: "p".into(),
            label: "l".into(),
            status: SubagentStatus::Completed,
            started_at: None,
            ended_at: None,
            result_text: None,
            error: None,
            announced: true,
        };
        let mut recent = old.clone();
        recent.child_session_key = "recent".into();
        recent.announced = true;
        let mut unannounced = old.clone();
        unannounced.child_session_key = "unannounced".into();
        unannounced.announced = false;
        old.child_session_key = "old".into();

        {
            let mut runs = registry.runs.lock().await;
            runs.insert("old".to_string(), old);
            runs.insert("recent".to_string(), recent);
            runs.insert("unannounced".to_string(), unannounced);
        }

        registry
            .sweep(|run| match run.child_session_key.as_str() {
                "old" => Some(ANNOUNCED_RUN_RETENTION_SECS + 1),
                "recent" => Some(10),
                _ => None,
            })
            .await;

        let runs = registry.runs.lock().await;
        assert!(!runs.contains_key("old"));
        assert!(runs.contains_key("recent"));
        assert!(runs.contains_key("unannounced"));
    }
}
