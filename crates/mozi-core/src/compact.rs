// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Compactor (spec §4.H): token-share chunking, adaptive ratio, and
//! summary-driven history compaction. Grounded on the chunking/
//! adaptive-ratio/oversized-detection shape of `sven-core/src/compact.rs`,
//! restated against spec.md's exact function names and thresholds.

use async_trait::async_trait;
use mozi_model::tokens::{estimate_messages_tokens, estimate_tokens};
use mozi_model::{ContentBlock, Message, MessageContent, Role};

const BASE_CHUNK_RATIO: f64 = 0.4;
const MIN_CHUNK_RATIO: f64 = 0.15;
const SAFETY_MARGIN: f64 = 1.2;

/// Greedily pack `messages` into at most `parts` chunks by token share; the
/// last chunk absorbs whatever remains.
pub fn split_messages_by_token_share(messages: &[Message], parts: usize) -> Vec<Vec<Message>> {
    if messages.is_empty() || parts == 0 {
        return vec![messages.to_vec()];
    }
    let total_tokens: usize = messages.iter().map(estimate_tokens).sum();
    let target = (total_tokens as f64 / parts as f64).ceil().max(1.0) as usize;

    let mut chunks: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens = 0usize;

    for message in messages {
        let tokens = estimate_tokens(message);
        if !current.is_empty() && current_tokens + tokens > target && chunks.len() + 1 < parts {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(message.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Greedily pack `messages` so no chunk exceeds `max_tokens`; a single
/// message that alone exceeds `max_tokens` is isolated in its own chunk.
pub fn chunk_messages_by_max_tokens(messages: &[Message], max_tokens: usize) -> Vec<Vec<Message>> {
    let mut chunks: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens = 0usize;

    for message in messages {
        let tokens = estimate_tokens(message);
        if tokens > max_tokens {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            chunks.push(vec![message.clone()]);
            continue;
        }
        if !current.is_empty() && current_tokens + tokens > max_tokens {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(message.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// `base=0.4`, floor `0.15`. When the average message is large relative to
/// the context window (average × safety margin exceeds 10% of the window),
/// scale the ratio down proportionally to how far over that threshold the
/// average sits, clamped to the floor.
pub fn compute_adaptive_chunk_ratio(messages: &[Message], context_window: usize) -> f64 {
    if messages.is_empty() || context_window == 0 {
        return BASE_CHUNK_RATIO;
    }
    let total_tokens: usize = messages.iter().map(estimate_tokens).sum();
    let avg_tokens = total_tokens as f64 / messages.len() as f64;
    let share = (avg_tokens * SAFETY_MARGIN) / context_window as f64;
    if share > 0.1 {
        let scale = 0.1 / share;
        (BASE_CHUNK_RATIO * scale).max(MIN_CHUNK_RATIO)
    } else {
        BASE_CHUNK_RATIO
    }
}

/// True iff a single message's estimated tokens, inflated by the safety
/// margin, would alone consume more than half the context window.
pub fn is_oversized_for_summary(message: &Message, context_window: usize) -> bool {
    (estimate_tokens(message) as f64 * SAFETY_MARGIN) > (0.5 * context_window as f64)
}

fn assistant_tool_call_ids(messages: &[Message]) -> std::collections::HashSet<String> {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls())
        .filter_map(|block| block.tool_call_id().map(str::to_string))
        .collect()
}

fn tool_result_id(message: &Message) -> Option<String> {
    match &message.content {
        MessageContent::Blocks(blocks) => blocks.iter().find_map(|b| match b {
            ContentBlock::ToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        }),
        MessageContent::Text(_) => None,
    }
}

/// Drop any `toolResult` message whose id has no matching assistant
/// tool-use call among `messages`. Independent of the payload sanitizer's
/// pairing-repair stage, but applies the identical policy.
pub fn repair_tool_use_result_pairing(messages: &[Message]) -> Vec<Message> {
    let call_ids = assistant_tool_call_ids(messages);
    messages
        .iter()
        .filter(|m| {
            if m.role != Role::ToolResult {
                return true;
            }
            match tool_result_id(m) {
                Some(id) => call_ids.contains(&id),
                None => true,
            }
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone)]
pub struct PruneHistoryResult {
    pub kept: Vec<Message>,
    pub dropped: Vec<Message>,
    pub chunks_dropped: usize,
    pub tokens_reclaimed: usize,
}

/// Iteratively drop the oldest token-share chunk (size `parts`) until the
/// remaining history fits within `maxContextTokens * maxHistoryShare`,
/// re-repairing tool-use/result pairing after each drop.
pub fn prune_history_for_context_share(
    messages: &[Message],
    max_context_tokens: usize,
    max_history_share: f64,
    parts: usize,
) -> PruneHistoryResult {
    let budget = (max_context_tokens as f64 * max_history_share) as usize;
    let mut remaining = messages.to_vec();
    let mut dropped: Vec<Message> = Vec::new();
    let mut chunks_dropped = 0usize;
    let tokens_before = estimate_messages_tokens(&remaining);

    while estimate_messages_tokens(&remaining) > budget && !remaining.is_empty() {
        let chunks = split_messages_by_token_share(&remaining, parts);
        if chunks.is_empty() {
            break;
        }
        let (oldest, rest) = chunks.split_first().unwrap();
        if oldest.is_empty() && rest.is_empty() {
            break;
        }
        dropped.extend(oldest.iter().cloned());
        remaining = rest.concat();
        remaining = repair_tool_use_result_pairing(&remaining);
        chunks_dropped += 1;
        if oldest.is_empty() {
            // split_messages_by_token_share never returns an empty first
            // chunk for non-empty input; guard against infinite loops.
            break;
        }
    }

    let tokens_after = estimate_messages_tokens(&remaining);
    PruneHistoryResult {
        kept: remaining,
        dropped,
        chunks_dropped,
        tokens_reclaimed: tokens_before.saturating_sub(tokens_after),
    }
}

/// Collaborator the Compactor calls to turn dropped history into prose.
/// Analogous to `ModelTransport` (mozi_model::provider) but scoped to a
/// single summarization call.
#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    async fn generate_summary(&self, dropped: &[Message], instruction: &str) -> anyhow::Result<String>;
}

const SUMMARY_INSTRUCTION: &str = "Preserve: decisions made and their rationale, TODO items and \
     open questions, key constraints and requirements, file paths and important code references, \
     error patterns and solutions found.";

#[derive(Debug, Clone)]
pub struct CompactResult {
    pub summary: String,
    pub kept_messages: Vec<Message>,
    pub dropped_count: usize,
    pub tokens_reclaimed: usize,
}

/// Run `pruneHistoryForContextShare`; if nothing was dropped, the caller's
/// messages are unchanged (`None`). Otherwise summarize the dropped portion
/// and return the kept messages plus the summary to prepend.
pub async fn compact_messages(
    messages: &[Message],
    context_window_tokens: usize,
    max_history_share: f64,
    generator: &dyn SummaryGenerator,
) -> Option<CompactResult> {
    let pruned = prune_history_for_context_share(messages, context_window_tokens, max_history_share, 2);
    if pruned.dropped.is_empty() {
        return None;
    }

    let dropped_count = pruned.dropped.len();
    let summary = match generator.generate_summary(&pruned.dropped, SUMMARY_INSTRUCTION).await {
        Ok(s) => s,
        Err(_) => format!(
            "[Previous conversation with {dropped_count} messages was compacted. Details unavailable due to summarization error.]"
        ),
    };

    Some(CompactResult {
        summary,
        kept_messages: pruned.kept,
        dropped_count,
        tokens_reclaimed: pruned.tokens_reclaimed,
    })
}

/// Wrap a summary string as the user-role message that replaces dropped
/// history in the transcript.
pub fn create_summary_message(summary: &str, timestamp: impl Into<String>) -> Message {
    Message::user(format!("[Previous conversation summary]\n\n{summary}"), timestamp)
}
