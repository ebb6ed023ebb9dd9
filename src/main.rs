// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, ConfigCommands};
use mozi_config::ops::ConfigOp;
use mozi_config::schema::{AgentConfig, Config, SandboxMode};
use mozi_config::store::LoadOutcome;
use mozi_config::StoreError;
use mozi_tools::sandbox::container::{ContainerConfig, ContainerExec};
use mozi_tools::sandbox::host::HostExec;
use mozi_tools::sandbox::SandboxBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let home = resolve_home_dir(cli.home.clone());
    std::fs::create_dir_all(&home).with_context(|| format!("creating {}", home.display()))?;
    let config_path = home.join("config.jsonc");

    let exit_code = if cli.doctor {
        run_doctor(&config_path, &home).await?
    } else {
        match cli.command {
            Some(Commands::Config { command }) => run_config_command(&config_path, command)?,
            Some(Commands::Serve) => {
                run_serve(&config_path, &home).await?;
                0
            }
            None => run_doctor(&config_path, &home).await?,
        }
    };

    std::process::exit(exit_code);
}

fn resolve_home_dir(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir;
    }
    if let Ok(dir) = std::env::var("MOZI_HOME") {
        return PathBuf::from(dir);
    }
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("mozi")
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

// ── `--doctor` ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckStatus {
    Ok,
    Warn,
    Error,
}

impl CheckStatus {
    fn label(self) -> &'static str {
        match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Error => "error",
        }
    }
}

struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

fn check(name: impl Into<String>, status: CheckStatus, detail: impl Into<String>) -> CheckResult {
    CheckResult { name: name.into(), status, detail: detail.into() }
}

/// `--doctor`: validates runnable state without starting anything (spec.md
/// §6). Blocking issues (config fails to parse/validate, an agent
/// references an undeclared model) are distinct from warnings (missing
/// credentials, an unreachable sandbox backend, no declared main agent).
async fn run_doctor(config_path: &Path, home: &Path) -> anyhow::Result<i32> {
    let mut results = Vec::new();

    let snapshot = mozi_config::snapshot(config_path)?;
    results.push(check(
        "config.snapshot",
        CheckStatus::Ok,
        format!(
            "{} ({} bytes, hash {}…)",
            snapshot.path.display(),
            snapshot.raw.len(),
            &snapshot.raw_hash[..12.min(snapshot.raw_hash.len())]
        ),
    ));

    let config = match &snapshot.load_result {
        LoadOutcome::Success(cfg) => {
            results.push(check("config.load", CheckStatus::Ok, "parses and validates against the schema"));
            Some(cfg.as_ref())
        }
        LoadOutcome::Failure(errors) => {
            results.push(check("config.load", CheckStatus::Error, errors.join("; ")));
            None
        }
    };

    if let Some(cfg) = config {
        check_agents(cfg, &mut results);
        check_sandboxes(cfg, &mut results).await;
        check_secrets(cfg, home, &mut results);
    }

    print_doctor_report(&results);
    let has_error = results.iter().any(|r| r.status == CheckStatus::Error);
    Ok(if has_error { 1 } else { 0 })
}

fn check_agents(cfg: &Config, results: &mut Vec<CheckResult>) {
    if cfg.agents.is_empty() {
        results.push(check("agents.declared", CheckStatus::Error, "no agents declared"));
        return;
    }

    let main_count = cfg.agents.values().filter(|a| a.main).count();
    if main_count > 1 {
        results.push(check("agents.main", CheckStatus::Warn, format!("{main_count} agents set main=true; the first encountered wins")));
    } else if main_count == 0 {
        results.push(check("agents.main", CheckStatus::Warn, "no agent has main=true; falls back to the first declared agent"));
    } else {
        results.push(check("agents.main", CheckStatus::Ok, "exactly one main agent"));
    }

    for (id, agent) in &cfg.agents {
        if cfg.models.contains_key(&agent.primary_response_model) {
            results.push(check(format!("agent.{id}.primary_response_model"), CheckStatus::Ok, &agent.primary_response_model));
        } else {
            results.push(check(
                format!("agent.{id}.primary_response_model"),
                CheckStatus::Error,
                format!("references undeclared model '{}'", agent.primary_response_model),
            ));
        }

        for fallback in &agent.fallback_response_models {
            if !cfg.models.contains_key(fallback) {
                results.push(check(
                    format!("agent.{id}.fallback_response_models"),
                    CheckStatus::Warn,
                    format!("references undeclared model '{fallback}'"),
                ));
            }
        }

        for subagent_id in &agent.subagent_allowlist {
            if !cfg.agents.contains_key(subagent_id) {
                results.push(check(
                    format!("agent.{id}.subagent_allowlist"),
                    CheckStatus::Warn,
                    format!("allows undeclared agent '{subagent_id}' as a subagent"),
                ));
            }
        }

        if !Path::new(&agent.workspace_dir).exists() {
            results.push(check(format!("agent.{id}.workspace_dir"), CheckStatus::Warn, format!("{} does not exist yet", agent.workspace_dir)));
        }
    }
}

async fn check_sandboxes(cfg: &Config, results: &mut Vec<CheckResult>) {
    for (id, agent) in &cfg.agents {
        match agent.sandbox.mode {
            SandboxMode::Off => {
                let backend = HostExec::new(agent.workspace_dir.clone(), None);
                let probe = backend.probe().await;
                results.push(check(format!("agent.{id}.sandbox"), if probe.ok { CheckStatus::Ok } else { CheckStatus::Error }, probe.message));
            }
            SandboxMode::Docker => {
                let backend = ContainerExec::new(container_config_for(agent));
                let probe = backend.probe().await;
                results.push(check(format!("agent.{id}.sandbox"), if probe.ok { CheckStatus::Ok } else { CheckStatus::Warn }, probe.message));
            }
            SandboxMode::AppleVm => {
                if agent.sandbox.vibebox.is_none() {
                    results.push(check(
                        format!("agent.{id}.sandbox"),
                        CheckStatus::Error,
                        "sandbox.mode=apple-vm requires sandbox.vibebox to be configured",
                    ));
                } else {
                    results.push(check(
                        format!("agent.{id}.sandbox"),
                        CheckStatus::Warn,
                        "vibebox bridge configured; not probed by --doctor",
                    ));
                }
            }
        }
    }
}

fn workspace_access_label(access: mozi_config::schema::WorkspaceAccess) -> String {
    match access {
        mozi_config::schema::WorkspaceAccess::None => "none",
        mozi_config::schema::WorkspaceAccess::Ro => "ro",
        mozi_config::schema::WorkspaceAccess::Rw => "rw",
    }
    .to_string()
}

fn container_config_for(agent: &AgentConfig) -> ContainerConfig {
    ContainerConfig {
        image: agent.sandbox.image.clone(),
        container_name: format!("mozi-{}", agent.agent_id),
        workspace_mount: agent.workspace_dir.clone(),
        workspace_readonly: agent.sandbox.workspace_access == mozi_config::schema::WorkspaceAccess::Ro,
        network: agent.sandbox.network,
        env: agent.sandbox.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    }
}

fn check_secrets(cfg: &Config, home: &Path, results: &mut Vec<CheckResult>) {
    let secrets_path = home.join("secrets.json");
    let broker = match mozi_secrets::SecretBroker::open(secrets_path, mozi_secrets::DEFAULT_MASTER_KEY_ENV) {
        Ok(b) => Some(b),
        Err(e) => {
            results.push(check("secrets.broker", CheckStatus::Warn, format!("could not open secret store ({e}); credential checks skipped")));
            None
        }
    };

    let Some(broker) = broker else { return };

    for (model_id, model) in &cfg.models {
        let Some(handle) = &model.credentials_handle else { continue };
        let used_by: Vec<&str> = cfg
            .agents
            .values()
            .filter(|a| &a.primary_response_model == model_id || a.fallback_response_models.contains(model_id))
            .map(|a| a.agent_id.as_str())
            .collect();
        let agent_id = used_by.first().copied().unwrap_or("");
        if broker.check(handle, agent_id, None) {
            results.push(check(format!("model.{model_id}.credentials"), CheckStatus::Ok, format!("'{handle}' resolves")));
        } else {
            results.push(check(
                format!("model.{model_id}.credentials"),
                CheckStatus::Error,
                format!("credentialsHandle '{handle}' has no resolvable secret"),
            ));
        }
    }
}

fn print_doctor_report(results: &[CheckResult]) {
    let name_w = results.iter().map(|r| r.name.len()).max().unwrap_or(10).max(10);
    for r in results {
        println!("[{:>5}] {:<name_w$}  {}", r.status.label(), r.name, r.detail, name_w = name_w);
    }
    let ok = results.iter().filter(|r| r.status == CheckStatus::Ok).count();
    let warn = results.iter().filter(|r| r.status == CheckStatus::Warn).count();
    let error = results.iter().filter(|r| r.status == CheckStatus::Error).count();
    println!("\n{ok} ok, {warn} warning(s), {error} error(s)");
}

// ── `mozi config ...` ───────────────────────────────────────────────────

fn run_config_command(config_path: &Path, command: ConfigCommands) -> anyhow::Result<i32> {
    match command {
        ConfigCommands::Snapshot { json } => {
            let snapshot = mozi_config::snapshot(config_path)?;
            if json {
                #[derive(Serialize)]
                struct Out<'a> {
                    path: String,
                    exists: bool,
                    #[serde(rename = "rawHash")]
                    raw_hash: &'a str,
                }
                println!(
                    "{}",
                    serde_json::to_string(&Out { path: snapshot.path.display().to_string(), exists: snapshot.exists, raw_hash: &snapshot.raw_hash })?
                );
            } else {
                println!("path:   {}", snapshot.path.display());
                println!("exists: {}", snapshot.exists);
                println!("hash:   {}", snapshot.raw_hash);
                match &snapshot.load_result {
                    LoadOutcome::Success(cfg) => println!("\n{}", serde_json::to_string_pretty(cfg.as_ref())?),
                    LoadOutcome::Failure(errors) => {
                        for e in errors {
                            eprintln!("error: {e}");
                        }
                    }
                }
            }
            Ok(0)
        }
        ConfigCommands::Set { path, value, expected_hash } => {
            let parsed = serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value.clone()));
            report_store_result(mozi_config::set(config_path, &path, parsed, expected_hash.as_deref()))
        }
        ConfigCommands::Unset { path, expected_hash } => report_store_result(mozi_config::unset(config_path, &path, expected_hash.as_deref())),
        ConfigCommands::Patch { file, expected_hash } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let value: Value = serde_json::from_str(&raw).with_context(|| format!("parsing {} as JSON", file.display()))?;
            report_store_result(mozi_config::patch(config_path, value, expected_hash.as_deref()))
        }
        ConfigCommands::Apply { file, expected_hash } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let ops = parse_apply_ops(&raw).with_context(|| format!("parsing {} as an operations batch", file.display()))?;
            report_store_result(mozi_config::apply(config_path, &ops, expected_hash.as_deref()))
        }
    }
}

/// JSON shape accepted by `mozi config apply -f ops.json`:
/// `[{"op":"set","path":"...","value":...}, {"op":"unset","path":"..."}, {"op":"patch","value":{...}}]`
#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum ApplyOpJson {
    Set { path: String, value: Value },
    Unset { path: String },
    Patch { value: Value },
}

fn parse_apply_ops(raw: &str) -> anyhow::Result<Vec<ConfigOp>> {
    let ops: Vec<ApplyOpJson> = serde_json::from_str(raw)?;
    Ok(ops
        .into_iter()
        .map(|op| match op {
            ApplyOpJson::Set { path, value } => ConfigOp::Set { path, value },
            ApplyOpJson::Unset { path } => ConfigOp::Unset { path },
            ApplyOpJson::Patch { value } => ConfigOp::Patch { value },
        })
        .collect())
}

/// Maps the store's outcome onto the exit codes spec.md §6 mandates:
/// `2` for `ConfigConflict`, `1` for any other validation/write failure.
fn report_store_result(result: mozi_config::StoreResult<String>) -> anyhow::Result<i32> {
    match result {
        Ok(new_hash) => {
            println!("{{\"rawHash\":\"{new_hash}\"}}");
            Ok(0)
        }
        Err(StoreError::ConfigConflict { expected, actual }) => {
            eprintln!("error: config changed since snapshot (expected {expected}, found {actual})");
            Ok(2)
        }
        Err(e) => {
            eprintln!("error: {e}");
            Ok(1)
        }
    }
}

// ── `mozi serve` ────────────────────────────────────────────────────────

/// One NDJSON inbound event line accepted by `serve`.
#[derive(Debug, Deserialize)]
struct InboundEvent {
    #[serde(rename = "sessionKey")]
    session_key: String,
    #[serde(rename = "agentId")]
    agent_id: Option<String>,
    text: String,
}

#[derive(Debug, Serialize)]
struct OutboundEvent<'a> {
    #[serde(rename = "sessionKey")]
    session_key: &'a str,
    phase: &'a str,
    text: Option<String>,
    error: Option<String>,
}

/// Minimal runtime harness: channel adapters (Telegram, Slack, …) are out of
/// scope here, so `serve` reads one inbound NDJSON event per stdin line,
/// dispatches it through the Agent Registry, runs a single model turn, and
/// writes lifecycle events to stdout as NDJSON. No concrete `ModelTransport`
/// implementation ships in this workspace, so turns run against
/// [`mozi_model::MockProvider`] — enough to exercise dispatch, persistence,
/// and lifecycle events end to end.
async fn run_serve(config_path: &Path, home: &Path) -> anyhow::Result<()> {
    let snapshot = mozi_config::snapshot(config_path)?;
    let config = match snapshot.load_result {
        LoadOutcome::Success(cfg) => *cfg,
        LoadOutcome::Failure(errors) => anyhow::bail!("config is not runnable: {}", errors.join("; ")),
    };

    let agents: Vec<mozi_core::registry::AgentEntry> = config
        .agents
        .values()
        .map(|a| mozi_core::registry::AgentEntry {
            agent_id: a.agent_id.clone(),
            main: a.main,
            primary_model: a.primary_response_model.clone(),
            fallback_models: a.fallback_response_models.clone(),
            tools: if a.tools.is_empty() { None } else { Some(a.tools.clone()) },
            base_system_prompt: a.base_system_prompt.clone(),
            home_dir: a.home_dir.clone(),
            workspace_dir: a.workspace_dir.clone(),
            workspace_access: workspace_access_label(a.sandbox.workspace_access),
            thinking_level: a.thinking_level,
            image_model: a.image_model.clone(),
        })
        .collect();

    if agents.is_empty() {
        anyhow::bail!("no agents declared in {}", config_path.display());
    }

    let registry = Arc::new(mozi_core::registry::AgentRegistry::new());
    let sessions = mozi_core::segment_store::SessionStore::new(home.join("sessions"));
    let bus = mozi_runtime::LifecycleBus::new();

    let context_window: HashMap<String, u64> = config.models.iter().map(|(id, spec)| (id.clone(), spec.context_window as u64)).collect();

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let event: InboundEvent = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                write_outbound(&mut stdout, "", "error", None, Some(format!("malformed NDJSON event: {e}")))?;
                continue;
            }
        };

        let run_id = bus.next_run_id();
        bus.publish(mozi_runtime::BusEvent {
            run_id,
            session_key: event.session_key.clone(),
            data: mozi_runtime::EventData::Lifecycle { phase: mozi_runtime::LifecyclePhase::Start, started_at: None, ended_at: None, error: None },
        })
        .await;

        match handle_inbound(&registry, &sessions, &agents, &context_window, &event).await {
            Ok(reply) => {
                bus.publish(mozi_runtime::BusEvent {
                    run_id,
                    session_key: event.session_key.clone(),
                    data: mozi_runtime::EventData::Lifecycle { phase: mozi_runtime::LifecyclePhase::End, started_at: None, ended_at: None, error: None },
                })
                .await;
                write_outbound(&mut stdout, &event.session_key, "end", Some(reply), None)?;
            }
            Err(e) => {
                bus.publish(mozi_runtime::BusEvent {
                    run_id,
                    session_key: event.session_key.clone(),
                    data: mozi_runtime::EventData::Lifecycle {
                        phase: mozi_runtime::LifecyclePhase::Error,
                        started_at: None,
                        ended_at: None,
                        error: Some(e.to_string()),
                    },
                })
                .await;
                write_outbound(&mut stdout, &event.session_key, "error", None, Some(e.to_string()))?;
            }
        }
    }

    Ok(())
}

/// Stand-in [`mozi_core::compact::SummaryGenerator`]: no concrete
/// `ModelTransport` ships in this workspace, so summarization runs against
/// [`mozi_model::MockProvider`] the same way turn completion does.
struct MockSummaryGenerator;

#[async_trait::async_trait]
impl mozi_core::compact::SummaryGenerator for MockSummaryGenerator {
    async fn generate_summary(&self, dropped: &[mozi_model::Message], _instruction: &str) -> anyhow::Result<String> {
        let provider = mozi_model::MockProvider::new(
            "mock-summarizer",
            format!("[Summarized {} earlier message(s)]", dropped.len()),
        );
        use mozi_model::ModelTransport;
        let mut stream = provider
            .complete(mozi_model::CompletionRequest {
                messages: dropped.to_vec(),
                system_prompt: None,
                max_output_tokens: None,
            })
            .await?;
        let mut summary = String::new();
        while let Some(chunk) = stream.next().await {
            if let mozi_model::ResponseEvent::TextDelta(text) = chunk? {
                summary.push_str(&text);
            }
        }
        Ok(summary)
    }
}

async fn handle_inbound(
    registry: &mozi_core::registry::AgentRegistry,
    sessions: &mozi_core::segment_store::SessionStore,
    agents: &[mozi_core::registry::AgentEntry],
    context_window: &HashMap<String, u64>,
    event: &InboundEvent,
) -> anyhow::Result<String> {
    let parts = mozi_core::session::parse_session_key(&event.session_key)?;
    let session = sessions.get_or_create(&event.session_key, &parts.agent_id)?;

    let dispatch = registry
        .dispatch(
            &event.session_key,
            agents,
            event.agent_id.as_deref(),
            |model_id| context_window.get(model_id).copied(),
            &session.context,
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    tracing::info!(session_key = %event.session_key, agent_id = %dispatch.agent_id, model = %dispatch.model_ref, "dispatched inbound event");

    let user_message = mozi_model::Message::user(event.text.clone(), now_iso());

    let provider = mozi_model::MockProvider::new(dispatch.model_ref.clone(), format!("echo: {}", event.text));
    use mozi_model::ModelTransport;
    let mut stream = provider
        .complete(mozi_model::CompletionRequest {
            messages: vec![user_message.clone()],
            system_prompt: Some(dispatch.system_prompt.clone()),
            max_output_tokens: None,
        })
        .await?;

    let mut reply = String::new();
    while let Some(chunk) = stream.next().await {
        if let mozi_model::ResponseEvent::TextDelta(text) = chunk? {
            reply.push_str(&text);
        }
    }

    let assistant_message = mozi_model::Message::assistant(reply.clone(), now_iso(), Some(mozi_model::StopReason::EndTurn));

    let mut turn_context = dispatch.binding.messages.clone();
    turn_context.push(user_message);
    turn_context.push(assistant_message);

    let context_window_tokens = dispatch.binding.context_window_tokens as usize;
    let final_context = match mozi_core::compact::compact_messages(&turn_context, context_window_tokens, 0.5, &MockSummaryGenerator).await {
        Some(result) => {
            tracing::info!(
                session_key = %event.session_key,
                dropped = result.dropped_count,
                tokens_reclaimed = result.tokens_reclaimed,
                "compacted session history"
            );
            let mut messages = vec![mozi_core::compact::create_summary_message(&result.summary, now_iso())];
            messages.extend(result.kept_messages);
            messages
        }
        None => turn_context,
    };

    sessions.update(
        &event.session_key,
        mozi_core::session::SessionChanges {
            context: Some(final_context),
            ..Default::default()
        },
    )?;

    Ok(reply)
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn write_outbound(out: &mut impl Write, session_key: &str, phase: &str, text: Option<String>, error: Option<String>) -> anyhow::Result<()> {
    let record = OutboundEvent { session_key, phase, text, error };
    writeln!(out, "{}", serde_json::to_string(&record)?)?;
    out.flush()?;
    Ok(())
}
