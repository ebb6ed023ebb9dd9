// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-provider payload sanitization (spec §4.F).
//!
//! An 8-stage pipeline gated by a [`TranscriptPolicy`] derived from
//! `(modelRef, api, provider)`. Grounded on `sven-model/src/sanitize.rs`'s
//! collapse-to-`Text` idiom, expanded from that file's single stage (strip
//! unsupported images) to the full repair pipeline providers actually need.
//!
//! The message model here is strongly typed (closed-sum [`ContentBlock`]),
//! so stage 1 (stripping request-level keys leaked into message objects) has
//! nothing to do by construction — those keys have no field to leak into.
//! It stays as a documented no-op so the stage numbering in this file lines
//! up with the spec.

use std::collections::HashMap;

use crate::types::{ContentBlock, Message, MessageContent, Role, StopReason};

/// Tool-call id normalization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallIdMode {
    Off,
    Strict,
    Strict9,
}

/// Flags gating which sanitizer stages run, derived from the target model.
#[derive(Debug, Clone, Copy)]
pub struct TranscriptPolicy {
    pub sanitize_tool_call_ids: ToolCallIdMode,
    pub sanitize_thinking_signatures: bool,
    pub repair_tool_use_result_pairing: bool,
    pub allow_synthetic_tool_results: bool,
    pub apply_google_turn_ordering: bool,
    pub validate_gemini_turns: bool,
    pub validate_anthropic_turns: bool,
}

impl TranscriptPolicy {
    /// A policy with every stage disabled — the pipeline becomes the
    /// identity function on the input.
    pub fn none() -> Self {
        TranscriptPolicy {
            sanitize_tool_call_ids: ToolCallIdMode::Off,
            sanitize_thinking_signatures: false,
            repair_tool_use_result_pairing: false,
            allow_synthetic_tool_results: false,
            apply_google_turn_ordering: false,
            validate_gemini_turns: false,
            validate_anthropic_turns: false,
        }
    }

    /// Resolve the policy for a `(modelRef, api, provider)` triple.
    pub fn resolve(model_ref: &str, api: &str, provider: &str) -> Self {
        if is_gemini_like(model_ref) || provider.eq_ignore_ascii_case("google") {
            return TranscriptPolicy {
                sanitize_tool_call_ids: ToolCallIdMode::Strict9,
                sanitize_thinking_signatures: true,
                repair_tool_use_result_pairing: true,
                allow_synthetic_tool_results: true,
                apply_google_turn_ordering: true,
                validate_gemini_turns: true,
                validate_anthropic_turns: false,
            };
        }
        if api.eq_ignore_ascii_case("anthropic") || provider.eq_ignore_ascii_case("anthropic") {
            return TranscriptPolicy {
                sanitize_tool_call_ids: ToolCallIdMode::Strict,
                sanitize_thinking_signatures: false,
                repair_tool_use_result_pairing: true,
                allow_synthetic_tool_results: false,
                apply_google_turn_ordering: false,
                validate_gemini_turns: false,
                validate_anthropic_turns: true,
            };
        }
        TranscriptPolicy::none()
    }
}

/// Iff `modelRef` lowercases to contain "gemini".
pub fn is_gemini_like(model_ref: &str) -> bool {
    model_ref.to_lowercase().contains("gemini")
}

/// Run the full sanitizer pipeline. Returns the input unchanged (by value,
/// since we don't have a reference-counted transcript type) when the policy
/// has every stage disabled.
pub fn sanitize_transcript(messages: Vec<Message>, policy: &TranscriptPolicy) -> Vec<Message> {
    let mut messages = messages;
    // Stage 1: no-op, see module docs.
    messages = normalize_tool_call_ids(messages, policy.sanitize_tool_call_ids);
    if policy.sanitize_thinking_signatures {
        messages = strip_invalid_thinking_signatures(messages);
    }
    messages = repair_tool_call_inputs(messages);
    if policy.repair_tool_use_result_pairing {
        messages = repair_pairing(messages, policy.allow_synthetic_tool_results);
    }
    if policy.apply_google_turn_ordering {
        messages = apply_google_turn_ordering(messages);
    }
    if policy.validate_gemini_turns {
        messages = merge_consecutive(messages, Role::Assistant);
    }
    if policy.validate_anthropic_turns {
        messages = merge_consecutive(messages, Role::User);
    }
    messages
}

fn is_valid_tool_call_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn strict9(base: &str) -> String {
    let alnum: String = base.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if alnum.len() >= 9 {
        alnum.chars().take(9).collect()
    } else {
        let mut s = alnum;
        while s.len() < 9 {
            s.push('0');
        }
        s
    }
}

/// Stage 2: normalize tool-call ids (when enabled). A stable map ensures a
/// `toolResult.toolCallId` rewrites to the same value as its originating
/// call.
fn normalize_tool_call_ids(messages: Vec<Message>, mode: ToolCallIdMode) -> Vec<Message> {
    if mode == ToolCallIdMode::Off {
        return messages;
    }
    let mut map: HashMap<String, String> = HashMap::new();
    let mut seq: usize = 0;

    let mut normalize = |id: &str, map: &mut HashMap<String, String>| -> String {
        if let Some(existing) = map.get(id) {
            return existing.clone();
        }
        let base = if id.is_empty() {
            let generated = format!("toolcall_{seq}");
            seq += 1;
            generated
        } else {
            id.to_string()
        };
        let normalized = match mode {
            ToolCallIdMode::Off => unreachable!(),
            ToolCallIdMode::Strict => {
                if is_valid_tool_call_id(&base) {
                    base.clone()
                } else {
                    let filtered: String = base
                        .chars()
                        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                        .collect();
                    if filtered.is_empty() {
                        let generated = format!("toolcall_{seq}");
                        seq += 1;
                        generated
                    } else {
                        filtered
                    }
                }
            }
            ToolCallIdMode::Strict9 => strict9(&base),
        };
        map.insert(id.to_string(), normalized.clone());
        normalized
    };

    messages
        .into_iter()
        .map(|mut msg| {
            if let MessageContent::Blocks(blocks) = &mut msg.content {
                for block in blocks.iter_mut() {
                    match block {
                        ContentBlock::ToolCall { id, .. } => {
                            *id = normalize(id, &mut map);
                        }
                        ContentBlock::ToolResult { tool_call_id, .. } => {
                            *tool_call_id = normalize(tool_call_id, &mut map);
                        }
                        _ => {}
                    }
                }
            }
            msg
        })
        .collect()
}

fn is_base64_like(s: &str) -> bool {
    !s.is_empty()
        && s.len() % 4 == 0
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

/// Stage 3: drop thinking blocks whose signature isn't well-formed base64;
/// drop assistant messages that become empty as a result.
fn strip_invalid_thinking_signatures(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .filter_map(|mut msg| {
            if let MessageContent::Blocks(blocks) = &mut msg.content {
                blocks.retain(|b| match b {
                    ContentBlock::Thinking {
                        thinking_signature, ..
                    } => thinking_signature
                        .as_deref()
                        .map(is_base64_like)
                        .unwrap_or(true),
                    _ => true,
                });
                if matches!(msg.role, Role::Assistant) && blocks.is_empty() {
                    return None;
                }
            }
            Some(msg)
        })
        .collect()
}

/// Stage 4: drop tool-call blocks with no arguments; drop the message if it
/// becomes empty.
fn repair_tool_call_inputs(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .filter_map(|mut msg| {
            if let MessageContent::Blocks(blocks) = &mut msg.content {
                blocks.retain(|b| !matches!(b, ContentBlock::ToolCall { arguments, .. } if arguments.is_null()));
                if matches!(msg.role, Role::Assistant) && blocks.is_empty() {
                    return None;
                }
            }
            Some(msg)
        })
        .collect()
}

fn placeholder_result(call_id: &str, tool_name: &str) -> ContentBlock {
    ContentBlock::ToolResult {
        tool_call_id: call_id.to_string(),
        tool_name: tool_name.to_string(),
        content: format!("[no result received for tool call {call_id}]"),
        is_error: true,
    }
}

/// Stage 5: repair tool-use / tool-result pairing.
fn repair_pairing(messages: Vec<Message>, allow_synthetic: bool) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        if matches!(msg.role, Role::Assistant) && msg.pairing_eligible() {
            let calls: Vec<(String, String)> = msg
                .tool_calls()
                .into_iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolCall { id, name, .. } => Some((id.clone(), name.clone())),
                    _ => None,
                })
                .collect();
            out.push(msg.clone());
            i += 1;

            if calls.is_empty() {
                continue;
            }

            let mut results: HashMap<String, Message> = HashMap::new();
            let mut remainder: Vec<Message> = Vec::new();
            while i < messages.len() && !matches!(messages[i].role, Role::Assistant) {
                let next = &messages[i];
                let ids: Vec<String> = match &next.content {
                    MessageContent::Blocks(blocks) => blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::ToolResult { tool_call_id, .. } => {
                                Some(tool_call_id.clone())
                            }
                            _ => None,
                        })
                        .collect(),
                    MessageContent::Text(_) => vec![],
                };
                if matches!(next.role, Role::ToolResult) && ids.len() == 1 {
                    let id = ids.into_iter().next().unwrap();
                    if calls.iter().any(|(call_id, _)| call_id == &id) {
                        results.entry(id).or_insert_with(|| next.clone());
                    }
                    // duplicate or orphan: dropped silently either way
                } else {
                    remainder.push(next.clone());
                }
                i += 1;
            }

            for (call_id, tool_name) in &calls {
                if let Some(result_msg) = results.remove(call_id) {
                    out.push(result_msg);
                } else if allow_synthetic {
                    out.push(Message::tool_result(
                        MessageContent::Blocks(vec![placeholder_result(call_id, tool_name)]),
                        messages[i.saturating_sub(1)].timestamp.clone(),
                    ));
                }
            }
            out.extend(remainder);
        } else {
            out.push(msg.clone());
            i += 1;
        }
    }
    out
}

/// Stage 6: if the transcript opens with an assistant turn, prepend a
/// synthetic user bootstrap message. Idempotent.
fn apply_google_turn_ordering(mut messages: Vec<Message>) -> Vec<Message> {
    match messages.first() {
        Some(first) if matches!(first.role, Role::Assistant) => {
            let ts = first.timestamp.clone();
            messages.insert(0, Message::user("(session bootstrap)", ts));
            messages
        }
        _ => messages,
    }
}

/// Stages 7/8: merge consecutive same-role turns, keeping the later
/// message's `stopReason`.
fn merge_consecutive(messages: Vec<Message>, role: Role) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for msg in messages {
        if msg.role == role {
            if let Some(last) = out.last_mut() {
                if last.role == role {
                    let mut merged = last.blocks();
                    merged.extend(msg.blocks());
                    last.content = MessageContent::Blocks(merged);
                    last.stop_reason = msg.stop_reason;
                    continue;
                }
            }
        }
        out.push(msg);
    }
    out
}

impl Message {
    fn blocks(&self) -> Vec<ContentBlock> {
        self.content.blocks()
    }
}

/// Structural shape checks exposed separately from the pipeline for
/// assertions. The typed model rules out unknown roles and leaked
/// request-level keys by construction, so this mostly flags emptiness.
pub fn validate_message_structure(msg: &Message) -> Vec<String> {
    let mut issues = Vec::new();
    if msg.content.is_empty() {
        issues.push("empty content".to_string());
    }
    if matches!(msg.role, Role::Assistant)
        && msg
            .tool_calls()
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolCall { arguments, .. } if arguments.is_null()))
    {
        issues.push("tool call missing arguments".to_string());
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_call(id: &str) -> ContentBlock {
        ContentBlock::ToolCall {
            id: id.into(),
            name: "exec".into(),
            arguments: serde_json::json!({"cmd": "ls"}),
        }
    }

    fn tool_result(id: &str) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_call_id: id.into(),
            tool_name: "exec".into(),
            content: "ok".into(),
            is_error: false,
        }
    }

    #[test]
    fn unflagged_policy_is_identity() {
        let messages = vec![Message::user("hi", "t")];
        let out = sanitize_transcript(messages.clone(), &TranscriptPolicy::none());
        assert_eq!(out, messages);
    }

    #[test]
    fn is_gemini_like_matches_case_insensitively() {
        assert!(is_gemini_like("models/Gemini-1.5-Pro"));
        assert!(!is_gemini_like("gpt-4o"));
    }

    #[test]
    fn strict9_pads_short_ids() {
        assert_eq!(strict9("ab"), "ab0000000");
        assert_eq!(strict9("abcdefghijk"), "abcdefghi");
    }

    #[test]
    fn normalize_tool_call_ids_strict_keeps_valid_ids() {
        let messages = vec![Message::assistant(
            MessageContent::Blocks(vec![tool_call("call-123")]),
            "t",
            Some(StopReason::ToolUse),
        )];
        let out = normalize_tool_call_ids(messages, ToolCallIdMode::Strict);
        match &out[0].content {
            MessageContent::Blocks(b) => assert!(matches!(&b[0], ContentBlock::ToolCall{id, ..} if id == "call-123")),
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn thinking_signature_must_be_base64_like() {
        let messages = vec![Message::assistant(
            MessageContent::Blocks(vec![ContentBlock::Thinking {
                thinking: "reasoning".into(),
                thinking_signature: Some("not valid!!".into()),
            }]),
            "t",
            Some(StopReason::EndTurn),
        )];
        let out = strip_invalid_thinking_signatures(messages);
        assert!(out.is_empty());
    }

    #[test]
    fn tool_call_missing_arguments_is_dropped() {
        let messages = vec![Message::assistant(
            MessageContent::Blocks(vec![ContentBlock::ToolCall {
                id: "1".into(),
                name: "n".into(),
                arguments: serde_json::Value::Null,
            }]),
            "t",
            Some(StopReason::ToolUse),
        )];
        let out = repair_tool_call_inputs(messages);
        assert!(out.is_empty());
    }

    #[test]
    fn pairing_repair_attaches_matching_results_in_order() {
        let messages = vec![
            Message::assistant(
                MessageContent::Blocks(vec![tool_call("a"), tool_call("b")]),
                "t",
                Some(StopReason::ToolUse),
            ),
            Message::tool_result(MessageContent::Blocks(vec![tool_result("b")]), "t"),
            Message::tool_result(MessageContent::Blocks(vec![tool_result("a")]), "t"),
        ];
        let out = repair_pairing(messages, false);
        // assistant, then result for "a", then result for "b" (call order)
        assert_eq!(out.len(), 3);
        let MessageContent::Blocks(b1) = &out[1].content else { panic!() };
        assert!(matches!(&b1[0], ContentBlock::ToolResult{tool_call_id, ..} if tool_call_id == "a"));
    }

    #[test]
    fn pairing_repair_synthesizes_missing_result_when_allowed() {
        let messages = vec![Message::assistant(
            MessageContent::Blocks(vec![tool_call("a")]),
            "t",
            Some(StopReason::ToolUse),
        )];
        let out = repair_pairing(messages, true);
        assert_eq!(out.len(), 2);
        let MessageContent::Blocks(b) = &out[1].content else { panic!() };
        assert!(matches!(&b[0], ContentBlock::ToolResult{is_error, ..} if *is_error));
    }

    #[test]
    fn pairing_repair_drops_orphan_results() {
        let messages = vec![
            Message::assistant("hi", "t", Some(StopReason::EndTurn)),
            Message::tool_result(MessageContent::Blocks(vec![tool_result("ghost")]), "t"),
        ];
        let out = repair_pairing(messages, false);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn google_turn_ordering_prepends_bootstrap_once() {
        let messages = vec![Message::assistant("hi", "t", Some(StopReason::EndTurn))];
        let out = apply_google_turn_ordering(messages);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::User);
        let again = apply_google_turn_ordering(out);
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn merge_consecutive_assistant_turns_keeps_later_stop_reason() {
        let messages = vec![
            Message::assistant("a", "t", Some(StopReason::ToolUse)),
            Message::assistant("b", "t", Some(StopReason::EndTurn)),
        ];
        let out = merge_consecutive(messages, Role::Assistant);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stop_reason, Some(StopReason::EndTurn));
        assert_eq!(out[0].content.as_text(), "a\nb");
    }

    #[test]
    fn merge_consecutive_user_turns() {
        let messages = vec![Message::user("a", "t"), Message::user("b", "t")];
        let out = merge_consecutive(messages, Role::User);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn validate_message_structure_flags_empty_content() {
        let msg = Message::user("", "t");
        assert!(!validate_message_structure(&msg).is_empty());
    }
}
