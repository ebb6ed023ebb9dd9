// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Prompt Assembler (spec §4.I): builds the system prompt in a fixed
//! section order, loading identity/persona/project files from an agent's
//! home and workspace directories. Grounded on `sven-core/src/prompts.rs`'s
//! `PromptContext`/`system_prompt` shape (mode dispatch, section-by-section
//! string assembly, blank-if-absent subsections) restructured to spec.md
//! §4.I's 7 fixed sections and 3 prompt modes.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Which variant of the prompt to build. `Main` includes every section;
/// `ResetGreeting` keeps identity/persona but drops MEMORY.md and
/// HEARTBEAT.md; `SubagentMinimal` drops identity/persona/memory entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Main,
    ResetGreeting,
    SubagentMinimal,
}

#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub name: String,
    pub chars: usize,
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub text: String,
    pub mode: PromptMode,
    pub home_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub loaded_files: Vec<LoadedFile>,
    pub skipped_files: Vec<SkippedFile>,
    pub prompt_hash: String,
}

/// Everything the assembler needs to build one prompt. Workspace file
/// contents are passed in pre-read (the caller owns directory listing and
/// any size limits) rather than globbed here.
pub struct PromptInputs<'a> {
    pub mode: PromptMode,
    pub home_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub base_system_prompt: Option<&'a str>,
    pub workspace_files: &'a [(String, String)],
    pub enabled_tools: &'a [String],
    pub workspace_access: &'a str,
    pub skills_listing: Option<&'a str>,
}

const CORE_CONSTRAINTS: &str = "You are a work assistant, not a chatbot.\n\
If no outbound reply is needed, return the exact token NO_REPLY.\n\
Silent token: NO_REPLY";

const PROMPT_PRECEDENCE: &str = "1. Core Constraints\n\
2. Identity & Persona (SOUL.md, IDENTITY.md, USER.md, MEMORY.md)\n\
3. Project & Workspace Rules\n\
4. Runtime Context\n\
5. Skills";

/// Strip ASCII control characters (except `\n`/`\t`) and Unicode
/// bidirectional-override characters from text before it is embedded in a
/// prompt, so no channel/workspace literal can smuggle terminal escapes or
/// right-to-left override tricks into the system prompt.
pub fn sanitize_literal(input: &str) -> String {
    input
        .chars()
        .filter(|&c| {
            if c == '\n' || c == '\t' {
                return true;
            }
            if c.is_control() {
                return false;
            }
            !matches!(
                c,
                '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'
            )
        })
        .collect()
}

fn read_home_file(
    home_dir: &Path,
    name: &str,
    loaded: &mut Vec<LoadedFile>,
    skipped: &mut Vec<SkippedFile>,
) -> Option<String> {
    let path = home_dir.join(name);
    match std::fs::read_to_string(&path) {
        Ok(raw) => {
            let sanitized = sanitize_literal(&raw);
            loaded.push(LoadedFile {
                name: name.to_string(),
                chars: sanitized.chars().count(),
            });
            Some(sanitized)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            skipped.push(SkippedFile {
                name: name.to_string(),
                reason: e.to_string(),
            });
            None
        }
    }
}

fn is_bootstrap_mode(home_dir: &Path) -> bool {
    home_dir.join("BOOTSTRAP.md").is_file()
}

fn prompt_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// Build the system prompt per spec.md §4.I's fixed section order,
/// omitting sections/subsections the current `mode` excludes.
pub fn assemble_prompt(inputs: PromptInputs<'_>) -> AssembledPrompt {
    let mut loaded = Vec::new();
    let mut skipped = Vec::new();
    let mut sections: Vec<String> = Vec::new();

    sections.push(format!("# Core Constraints\n{CORE_CONSTRAINTS}"));
    sections.push(format!("# Prompt Precedence\n{PROMPT_PRECEDENCE}"));

    if let Some(base) = inputs.base_system_prompt {
        let trimmed = base.trim();
        if !trimmed.is_empty() {
            sections.push(format!("# Runtime Base Prompt\n{}", sanitize_literal(trimmed)));
        }
    }

    {
        let mut block = String::new();
        if let Some(agents_md) = read_home_file(&inputs.home_dir, "AGENTS.md", &mut loaded, &mut skipped) {
            block.push_str("## AGENTS.md\n");
            block.push_str(&agents_md);
            block.push('\n');
        }
        for (name, content) in inputs.workspace_files {
            let sanitized = sanitize_literal(content);
            loaded.push(LoadedFile {
                name: name.clone(),
                chars: sanitized.chars().count(),
            });
            block.push_str(&format!("## {name}\n{sanitized}\n"));
        }
        if inputs.mode != PromptMode::ResetGreeting {
            if let Some(heartbeat) = read_home_file(&inputs.home_dir, "HEARTBEAT.md", &mut loaded, &mut skipped) {
                block.push_str("## HEARTBEAT.md\n");
                block.push_str(&heartbeat);
                block.push('\n');
            }
        }
        if !block.trim().is_empty() {
            sections.push(format!("# Project & Workspace Rules\n{}", block.trim_end()));
        }
    }

    if inputs.mode != PromptMode::SubagentMinimal {
        let mut block = String::new();
        for name in ["SOUL.md", "IDENTITY.md", "USER.md"] {
            if let Some(content) = read_home_file(&inputs.home_dir, name, &mut loaded, &mut skipped) {
                block.push_str(&format!("## {name}\n{content}\n"));
            }
        }
        if inputs.mode == PromptMode::Main {
            if let Some(memory) = read_home_file(&inputs.home_dir, "MEMORY.md", &mut loaded, &mut skipped) {
                block.push_str("## MEMORY.md\n");
                block.push_str(&memory);
                block.push('\n');
            }
        }
        if !block.trim().is_empty() {
            sections.push(format!("# Identity & Persona\n{}", block.trim_end()));
        }
    }

    {
        let mut block = String::new();
        if is_bootstrap_mode(&inputs.home_dir) {
            block.push_str("## Bootstrap Mode\nThis agent has not completed first-run setup.\n\n");
        }
        block.push_str("## Tools\n");
        if inputs.enabled_tools.is_empty() {
            block.push_str("(none enabled)\n\n");
        } else {
            for tool in inputs.enabled_tools {
                block.push_str(&format!("- {tool}\n"));
            }
            block.push('\n');
        }
        block.push_str(&format!(
            "## Sandbox\nWorkspace: `{}`\nAccess: {}",
            inputs.workspace_dir.display(),
            inputs.workspace_access
        ));
        sections.push(format!("# Runtime Context\n{block}"));
    }

    {
        let mut block = String::new();
        block.push_str("Scan the available skills below and use the most relevant one.\n");
        block.push_str("Before using a skill, check for local experience notes in home/skills/<skill>.md if present.\n");
        if inputs.enabled_tools.iter().any(|t| t == "skills_note") {
            block.push_str("After using a skill, record key learnings with the skills_note tool.\n");
        }
        if let Some(listing) = inputs.skills_listing {
            block.push('\n');
            block.push_str(listing);
        }
        sections.push(format!("# Skills\n{}", block.trim_end()));
    }

    let text = sections.join("\n\n");
    let hash = prompt_hash(&text);

    AssembledPrompt {
        text,
        mode: inputs.mode,
        home_dir: inputs.home_dir,
        workspace_dir: inputs.workspace_dir,
        loaded_files: loaded,
        skipped_files: skipped,
        prompt_hash: hash,
    }
}

/// `# Channel Context` block appended once per session on first inbound
/// message (spec.md §4.I). All string fields are sanitized.
#[derive(Debug, Clone, Default)]
pub struct ChannelContext {
    pub channel: String,
    pub peer_type: String,
    pub peer_id: String,
    pub account_id: Option<String>,
    pub thread_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub timestamp: String,
}

pub fn build_channel_context_section(ctx: &ChannelContext) -> String {
    let mut lines = vec![
        format!("channel: {}", sanitize_literal(&ctx.channel)),
        format!("peerType: {}", sanitize_literal(&ctx.peer_type)),
        format!("peerId: {}", sanitize_literal(&ctx.peer_id)),
    ];
    if let Some(account_id) = &ctx.account_id {
        lines.push(format!("accountId: {}", sanitize_literal(account_id)));
    }
    if let Some(thread_id) = &ctx.thread_id {
        lines.push(format!("threadId: {}", sanitize_literal(thread_id)));
    }
    if let Some(sender_id) = &ctx.sender_id {
        lines.push(format!("senderId: {}", sanitize_literal(sender_id)));
    }
    if let Some(sender_name) = &ctx.sender_name {
        lines.push(format!("senderName: {}", sanitize_literal(sender_name)));
    }
    lines.push(format!("timestamp: {}", sanitize_literal(&ctx.timestamp)));
    format!("# Channel Context\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    fn base_inputs(home_dir: PathBuf, workspace_dir: PathBuf) -> PromptInputs<'static> {
        PromptInputs {
            mode: PromptMode::Main,
            home_dir,
            workspace_dir,
            base_system_prompt: None,
            workspace_files: &[],
            enabled_tools: &[],
            workspace_access: "rw",
            skills_listing: None,
        }
    }

    // ── Section order and presence ──

    #[test]
    fn core_constraints_and_precedence_always_present() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let assembled = assemble_prompt(base_inputs(home.path().to_path_buf(), ws.path().to_path_buf()));
        assert!(assembled.text.starts_with("# Core Constraints"));
        assert!(assembled.text.contains("# Prompt Precedence"));
    }

    #[test]
    fn omits_runtime_base_prompt_when_absent() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let assembled = assemble_prompt(base_inputs(home.path().to_path_buf(), ws.path().to_path_buf()));
        assert!(!assembled.text.contains("# Runtime Base Prompt"));
    }

    #[test]
    fn includes_trimmed_runtime_base_prompt_when_present() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let mut inputs = base_inputs(home.path().to_path_buf(), ws.path().to_path_buf());
        inputs.base_system_prompt = Some("  be concise  \n");
        let assembled = assemble_prompt(inputs);
        assert!(assembled.text.contains("# Runtime Base Prompt\nbe concise"));
    }

    // ── Identity & Persona ──

    #[test]
    fn loads_identity_files_in_order() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        write(home.path(), "SOUL.md", "soul content");
        write(home.path(), "IDENTITY.md", "identity content");
        write(home.path(), "MEMORY.md", "memory content");
        let assembled = assemble_prompt(base_inputs(home.path().to_path_buf(), ws.path().to_path_buf()));
        let soul_pos = assembled.text.find("soul content").unwrap();
        let identity_pos = assembled.text.find("identity content").unwrap();
        let memory_pos = assembled.text.find("memory content").unwrap();
        assert!(soul_pos < identity_pos);
        assert!(identity_pos < memory_pos);
    }

    #[test]
    fn reset_greeting_excludes_memory_and_heartbeat() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        write(home.path(), "SOUL.md", "soul content");
        write(home.path(), "MEMORY.md", "memory content");
        write(home.path(), "HEARTBEAT.md", "heartbeat content");
        let mut inputs = base_inputs(home.path().to_path_buf(), ws.path().to_path_buf());
        inputs.mode = PromptMode::ResetGreeting;
        let assembled = assemble_prompt(inputs);
        assert!(assembled.text.contains("soul content"));
        assert!(!assembled.text.contains("memory content"));
        assert!(!assembled.text.contains("heartbeat content"));
    }

    #[test]
    fn subagent_minimal_excludes_identity_entirely() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        write(home.path(), "SOUL.md", "soul content");
        write(home.path(), "USER.md", "user content");
        let mut inputs = base_inputs(home.path().to_path_buf(), ws.path().to_path_buf());
        inputs.mode = PromptMode::SubagentMinimal;
        let assembled = assemble_prompt(inputs);
        assert!(!assembled.text.contains("# Identity & Persona"));
        assert!(!assembled.text.contains("soul content"));
    }

    // ── Project & Workspace Rules ──

    #[test]
    fn project_section_includes_agents_md_and_workspace_files() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        write(home.path(), "AGENTS.md", "repo rules");
        let mut inputs = base_inputs(home.path().to_path_buf(), ws.path().to_path_buf());
        let files = vec![("notes.md".to_string(), "project notes".to_string())];
        inputs.workspace_files = &files;
        let assembled = assemble_prompt(inputs);
        assert!(assembled.text.contains("## AGENTS.md\nrepo rules"));
        assert!(assembled.text.contains("## notes.md\nproject notes"));
    }

    // ── Bootstrap detection ──

    #[test]
    fn bootstrap_mode_detected_from_marker_file() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        write(home.path(), "BOOTSTRAP.md", "");
        let assembled = assemble_prompt(base_inputs(home.path().to_path_buf(), ws.path().to_path_buf()));
        assert!(assembled.text.contains("## Bootstrap Mode"));
    }

    #[test]
    fn no_bootstrap_marker_means_no_bootstrap_section() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let assembled = assemble_prompt(base_inputs(home.path().to_path_buf(), ws.path().to_path_buf()));
        assert!(!assembled.text.contains("## Bootstrap Mode"));
    }

    // ── Skills section ──

    #[test]
    fn skills_note_line_present_only_when_tool_enabled() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let mut inputs = base_inputs(home.path().to_path_buf(), ws.path().to_path_buf());
        let tools = vec!["skills_note".to_string()];
        inputs.enabled_tools = &tools;
        let assembled = assemble_prompt(inputs);
        assert!(assembled.text.contains("record key learnings with the skills_note tool"));
    }

    #[test]
    fn skills_note_line_absent_without_tool() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let assembled = assemble_prompt(base_inputs(home.path().to_path_buf(), ws.path().to_path_buf()));
        assert!(!assembled.text.contains("record key learnings"));
    }

    // ── Sanitization ──

    #[test]
    fn strips_control_and_bidi_override_characters() {
        let dirty = "hello\u{202E}world\u{0007}";
        let clean = sanitize_literal(dirty);
        assert_eq!(clean, "helloworld");
    }

    #[test]
    fn preserves_newlines_and_tabs() {
        let input = "line one\n\tindented";
        assert_eq!(sanitize_literal(input), input);
    }

    // ── Hash and metadata ──

    #[test]
    fn prompt_hash_is_twelve_lowercase_hex_chars() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let assembled = assemble_prompt(base_inputs(home.path().to_path_buf(), ws.path().to_path_buf()));
        assert_eq!(assembled.prompt_hash.len(), 12);
        assert!(assembled.prompt_hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn same_inputs_produce_same_hash() {
        let home = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let a = assemble_prompt(base_inputs(home.path().to_path_buf(), ws.path().to_path_buf()));
        let b = assemble_prompt(base_inputs(home.path().to_path_buf(), ws.path().to_path_buf()));
        assert_eq!(a.prompt_hash, b.prompt_hash);
    }

    // ── Channel context ──

    #[test]
    fn channel_context_section_includes_required_fields() {
        let ctx = ChannelContext {
            channel: "telegram".to_string(),
            peer_type: "dm".to_string(),
            peer_id: "user1".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            ..Default::default()
        };
        let section = build_channel_context_section(&ctx);
        assert!(section.starts_with("# Channel Context"));
        assert!(section.contains("channel: telegram"));
        assert!(section.contains("peerId: user1"));
    }
}
