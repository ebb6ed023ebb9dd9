// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context Pruner (spec §4.G): soft-trims then hard-clears tool-result
//! content to keep a transcript under its context-window char budget,
//! protecting the most recent turns and a configurable set of tools whose
//! output must never be touched.

use std::collections::HashSet;

use mozi_model::{ContentBlock, Message, MessageContent, Role};

#[derive(Debug, Clone)]
pub struct SoftTrimSettings {
    pub max_chars: usize,
    pub head_chars: usize,
    pub tail_chars: usize,
}

impl Default for SoftTrimSettings {
    fn default() -> Self {
        Self {
            max_chars: 4000,
            head_chars: 1500,
            tail_chars: 1500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrunerSettings {
    pub soft_trim_ratio: f64,
    pub hard_clear_ratio: f64,
    pub keep_last_assistants: usize,
    pub min_prunable_chars: usize,
    pub soft_trim: SoftTrimSettings,
    pub hard_clear_placeholder: String,
    pub protected_tools: HashSet<String>,
}

impl Default for PrunerSettings {
    fn default() -> Self {
        Self {
            soft_trim_ratio: 0.5,
            hard_clear_ratio: 0.7,
            keep_last_assistants: 3,
            min_prunable_chars: 20_000,
            soft_trim: SoftTrimSettings::default(),
            hard_clear_placeholder: "[Tool result cleared for context space]".to_string(),
            protected_tools: ["read_file", "write_file", "edit_file", "create_file"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneStats {
    pub soft_trim_count: usize,
    pub hard_clear_count: usize,
    pub chars_before: usize,
    pub chars_after: usize,
    pub chars_saved: usize,
    pub ratio: f64,
}

fn message_chars(message: &Message) -> usize {
    match &message.content {
        MessageContent::Text(s) => s.chars().count(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.chars().count(),
                ContentBlock::Thinking { thinking, .. } => thinking.chars().count(),
                ContentBlock::ToolCall { arguments, .. } => arguments.to_string().chars().count(),
                ContentBlock::ToolResult { content, .. } => content.chars().count(),
                ContentBlock::Image { .. } => 0,
            })
            .sum(),
    }
}

fn total_chars(messages: &[Message]) -> usize {
    messages.iter().map(message_chars).sum()
}

fn has_image(message: &Message) -> bool {
    matches!(&message.content, MessageContent::Blocks(blocks) if blocks.iter().any(ContentBlock::is_image))
}

/// The tool name of a tool-result message's sole (or first) `toolResult`
/// block, if any.
fn tool_name_of(message: &Message) -> Option<String> {
    match &message.content {
        MessageContent::Blocks(blocks) => blocks.iter().find_map(|b| match b {
            ContentBlock::ToolResult { tool_name, .. } => Some(tool_name.clone()),
            _ => None,
        }),
        MessageContent::Text(_) => None,
    }
}

fn is_prunable_tool_result(message: &Message, settings: &PrunerSettings) -> bool {
    if message.role != Role::ToolResult || has_image(message) {
        return false;
    }
    match tool_name_of(message) {
        Some(name) => !settings.protected_tools.contains(&name),
        None => true,
    }
}

fn soft_trim_text(text: &str, settings: &SoftTrimSettings) -> String {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let head: String = chars.iter().take(settings.head_chars).collect();
    let tail_start = total.saturating_sub(settings.tail_chars);
    let tail: String = chars[tail_start..].iter().collect();
    format!("{head}\n...\n{tail}\n\n[Trimmed: kept first {} and last {} of {total} chars]", settings.head_chars, settings.tail_chars)
}

fn replace_tool_result_text(message: &Message, new_text: String) -> Message {
    let mut m = message.clone();
    if let MessageContent::Blocks(blocks) = &mut m.content {
        for block in blocks.iter_mut() {
            if let ContentBlock::ToolResult { content, .. } = block {
                *content = new_text;
                return m;
            }
        }
    }
    m
}

fn hard_clear(message: &Message, placeholder: &str) -> Message {
    let mut m = message.clone();
    m.content = MessageContent::Text(placeholder.to_string());
    m
}

/// Index of the `keepLastAssistants`-th-from-last assistant message, or 0
/// if fewer assistant messages exist than that (nothing is prunable then).
fn cutoff_index(messages: &[Message], keep_last_assistants: usize) -> usize {
    let assistant_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::Assistant)
        .map(|(i, _)| i)
        .collect();
    if assistant_indices.len() >= keep_last_assistants && keep_last_assistants > 0 {
        assistant_indices[assistant_indices.len() - keep_last_assistants]
    } else if keep_last_assistants == 0 {
        messages.len()
    } else {
        0
    }
}

fn first_user_index(messages: &[Message]) -> usize {
    messages.iter().position(|m| m.role == Role::User).unwrap_or(0)
}

/// Soft-trim then, if still over budget, hard-clear tool-result content.
/// Returns the pruned message list plus stats describing what changed.
pub fn prune_context_messages(
    messages: &[Message],
    context_window_tokens: usize,
    settings: &PrunerSettings,
) -> (Vec<Message>, PruneStats) {
    let char_window = (context_window_tokens * 4).max(1);
    let chars_before = total_chars(messages);

    let ratio_before = chars_before as f64 / char_window as f64;
    if ratio_before < settings.soft_trim_ratio {
        return (
            messages.to_vec(),
            PruneStats {
                chars_before,
                chars_after: chars_before,
                ratio: ratio_before,
                ..Default::default()
            },
        );
    }

    let cutoff = cutoff_index(messages, settings.keep_last_assistants);
    let first_user = first_user_index(messages);

    let mut out = messages.to_vec();
    let mut soft_trim_count = 0usize;
    for idx in first_user..cutoff.min(out.len()) {
        let m = &out[idx];
        if !is_prunable_tool_result(m, settings) {
            continue;
        }
        let text = message_chars(m);
        if text <= settings.soft_trim.max_chars {
            continue;
        }
        let current_text = match &m.content {
            MessageContent::Blocks(blocks) => blocks.iter().find_map(|b| match b {
                ContentBlock::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            }),
            MessageContent::Text(_) => None,
        };
        if let Some(current_text) = current_text {
            let trimmed = soft_trim_text(&current_text, &settings.soft_trim);
            out[idx] = replace_tool_result_text(m, trimmed);
            soft_trim_count += 1;
        }
    }

    let mut ratio = total_chars(&out) as f64 / char_window as f64;
    let mut hard_clear_count = 0usize;

    if ratio >= settings.hard_clear_ratio {
        let prunable_chars: usize = (first_user..cutoff.min(out.len()))
            .filter(|&i| is_prunable_tool_result(&out[i], settings))
            .map(|i| message_chars(&out[i]))
            .sum();

        if prunable_chars >= settings.min_prunable_chars {
            for idx in first_user..cutoff.min(out.len()) {
                if ratio < settings.hard_clear_ratio {
                    break;
                }
                if !is_prunable_tool_result(&out[idx], settings) {
                    continue;
                }
                out[idx] = hard_clear(&out[idx], &settings.hard_clear_placeholder);
                hard_clear_count += 1;
                ratio = total_chars(&out) as f64 / char_window as f64;
            }
        }
    }

    let chars_after = total_chars(&out);
    (
        out,
        PruneStats {
            soft_trim_count,
            hard_clear_count,
            chars_before,
            chars_after,
            chars_saved: chars_before.saturating_sub(chars_after),
            ratio,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mozi_model::Message;

    fn tool_result(tool_name: &str, content: &str) -> Message {
        Message {
            role: Role::ToolResult,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_call_id: "id1".to_string(),
                tool_name: tool_name.to_string(),
                content: content.to_string(),
                is_error: false,
            }]),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            stop_reason: None,
        }
    }

    fn assistant(text: &str) -> Message {
        Message::assistant(text, "2026-01-01T00:00:00Z", Some(mozi_model::StopReason::EndTurn))
    }

    // ── Ratio gate ──

    #[test]
    fn below_soft_trim_ratio_returns_unchanged() {
        let messages = vec![Message::user("hi", "2026-01-01T00:00:00Z")];
        let (out, stats) = prune_context_messages(&messages, 1_000_000, &PrunerSettings::default());
        assert_eq!(out, messages);
        assert_eq!(stats.soft_trim_count, 0);
        assert_eq!(stats.hard_clear_count, 0);
    }

    // ── Soft trim ──

    #[test]
    fn soft_trims_oversized_prunable_tool_result() {
        let big = "x".repeat(5000);
        let messages = vec![
            Message::user("go", "2026-01-01T00:00:00Z"),
            tool_result("search", &big),
            assistant("ok"),
            assistant("ok2"),
            assistant("ok3"),
        ];
        // char_window small enough to trigger soft trim but not hard clear on its own.
        let settings = PrunerSettings::default();
        let (out, stats) = prune_context_messages(&messages, 2000, &settings);
        assert_eq!(stats.soft_trim_count, 1);
        let trimmed_text = match &out[1].content {
            MessageContent::Blocks(b) => match &b[0] {
                ContentBlock::ToolResult { content, .. } => content.clone(),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        assert!(trimmed_text.contains("[Trimmed: kept first"));
    }

    #[test]
    fn protected_tool_is_never_soft_trimmed() {
        let big = "x".repeat(5000);
        let messages = vec![
            Message::user("go", "2026-01-01T00:00:00Z"),
            tool_result("read_file", &big),
            assistant("ok"),
            assistant("ok2"),
            assistant("ok3"),
        ];
        let (out, stats) = prune_context_messages(&messages, 2000, &PrunerSettings::default());
        assert_eq!(stats.soft_trim_count, 0);
        assert_eq!(out[1], messages[1]);
    }

    #[test]
    fn recent_turns_after_cutoff_are_protected() {
        let big = "x".repeat(5000);
        let messages = vec![
            Message::user("go", "2026-01-01T00:00:00Z"),
            assistant("a1"),
            assistant("a2"),
            assistant("a3"),
            tool_result("search", &big),
        ];
        // Only 3 assistants exist and keepLastAssistants=3 -> cutoff at index 1,
        // so the trailing tool-result (index 4) sits after cutoff and is protected.
        let (out, stats) = prune_context_messages(&messages, 2000, &PrunerSettings::default());
        assert_eq!(stats.soft_trim_count, 0);
        assert_eq!(out[4], messages[4]);
    }

    // ── Hard clear ──

    #[test]
    fn hard_clears_when_still_over_ratio_after_soft_trim() {
        // Soft-trim always settles each tool result to roughly
        // head+tail+notice (~3060 chars) regardless of original size, so
        // reaching `minPrunableChars=20000` post-trim needs several of them.
        let huge = "x".repeat(30_000);
        let mut messages = vec![Message::user("go", "2026-01-01T00:00:00Z")];
        for _ in 0..8 {
            messages.push(tool_result("search", &huge));
        }
        messages.push(assistant("ok"));
        messages.push(assistant("ok2"));
        messages.push(assistant("ok3"));

        let (out, stats) = prune_context_messages(&messages, 2000, &PrunerSettings::default());
        assert!(stats.hard_clear_count >= 1);
        let cleared = out.iter().any(|m| match &m.content {
            MessageContent::Text(t) => t == "[Tool result cleared for context space]",
            _ => false,
        });
        assert!(cleared);
    }

    #[test]
    fn hard_clear_stops_once_below_threshold() {
        let huge = "x".repeat(30_000);
        let messages = vec![
            Message::user("go", "2026-01-01T00:00:00Z"),
            tool_result("search", &huge),
            tool_result("search", &huge),
            tool_result("search", &huge),
            assistant("ok"),
            assistant("ok2"),
            assistant("ok3"),
        ];
        let (_out, stats) = prune_context_messages(&messages, 40_000, &PrunerSettings::default());
        assert!(stats.ratio < PrunerSettings::default().hard_clear_ratio || stats.hard_clear_count < 3);
    }

    #[test]
    fn stats_report_char_savings() {
        let huge = "x".repeat(30_000);
        let messages = vec![
            Message::user("go", "2026-01-01T00:00:00Z"),
            tool_result("search", &huge),
            assistant("ok"),
            assistant("ok2"),
            assistant("ok3"),
        ];
        let (_out, stats) = prune_context_messages(&messages, 2000, &PrunerSettings::default());
        assert!(stats.chars_saved > 0);
        assert_eq!(stats.chars_before - stats.chars_after, stats.chars_saved);
    }
}
