// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Trait boundaries for collaborators spec.md §6 names but puts out of
//! scope: `ChannelPlugin`, `SkillLoader`, `MemoryManager`,
//! `ExtensionRegistry`, and the turn-execution loop a subagent run
//! delegates to. `ModelTransport` itself lives in `mozi-model` and is
//! re-exported here rather than duplicated.

use async_trait::async_trait;
use mozi_core::PromptMode;
use mozi_model::Message;

pub use mozi_model::ModelTransport;

/// One outbound-delivery channel (Telegram, Slack, …). Concrete wire
/// protocols are out of scope; this is the seam the runtime calls through.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    async fn send(&self, peer_id: &str, text: Option<&str>, attachments: &[String]) -> anyhow::Result<()>;
}

/// Loads and formats the skill index consumed by the prompt assembler's
/// `# Skills` section.
#[async_trait]
pub trait SkillLoader: Send + Sync {
    async fn load_all(&self) -> anyhow::Result<()>;
    fn format_for_prompt(&self, names: Option<&[String]>) -> String;
}

#[derive(Debug, Clone)]
pub struct MemorySearchHit {
    pub path: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryReadOptions {
    pub from: Option<usize>,
    pub lines: Option<usize>,
}

/// Long-term memory search/read surface used outside the fixed `MEMORY.md`
/// identity file the prompt assembler loads wholesale.
#[async_trait]
pub trait MemoryManager: Send + Sync {
    async fn search(&self, query: &str, opts: MemoryReadOptions) -> anyhow::Result<Vec<MemorySearchHit>>;
    async fn read_file(&self, rel_path: &str, opts: MemoryReadOptions) -> anyhow::Result<String>;
}

/// Plugin-contributed tools and skill directories, per spec.md §6.
#[async_trait]
pub trait ExtensionRegistry: Send + Sync {
    fn collect_tools(&self) -> Vec<String>;
    fn collect_skill_dirs(&self) -> Vec<String>;
    async fn notify_reload(&self, previous_ids: &[String]) -> anyhow::Result<()>;
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Runs one model turn to completion and returns the resulting transcript
/// tail (spec.md §4.M's "prompt; extract last assistant message's text").
/// The turn-execution loop itself — tool-call iteration, streaming — is an
/// ambient concern assembled elsewhere; this crate depends only on the
/// boundary.
#[async_trait]
pub trait TurnRunner: Send + Sync {
    async fn run_turn(
        &self,
        system_prompt: &str,
        model_ref: &str,
        prompt_mode: PromptMode,
        prompt: &str,
    ) -> anyhow::Result<Vec<Message>>;
}
