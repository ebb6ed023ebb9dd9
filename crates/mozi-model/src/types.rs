// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Closed-sum message and content-block types (spec §3 Data Model).
//!
//! Messages are a closed sum over `{User, Assistant, ToolResult,
//! BashExecution}`; content blocks are a closed sum over `{Text, Image,
//! Thinking, ToolCall, ToolResult}`. Every match on `role` or block `type`
//! must be exhaustive — the compiler enforces it, unlike the duck-typed
//! original.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role discriminator for a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
    BashExecution,
}

/// Why an assistant turn stopped. Used by the payload sanitizer's tool-use /
/// tool-result pairing repair (`stopReason ∉ {error, aborted}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Error,
    Aborted,
}

/// A single content block within a message's content list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        image_url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none", alias = "signature", alias = "thought_signature")]
        thinking_signature: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        ContentBlock::Text { text: s.into() }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ContentBlock::Image { .. })
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self, ContentBlock::ToolCall { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, ContentBlock::ToolResult { .. })
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            ContentBlock::ToolCall { id, .. } => Some(id),
            ContentBlock::ToolResult { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    /// Approximate token cost of this block alone (spec §4.A).
    pub fn approx_tokens(&self) -> usize {
        match self {
            ContentBlock::Text { text } => char_tokens(text),
            ContentBlock::Image { .. } => 2000,
            ContentBlock::Thinking { thinking, .. } => char_tokens(thinking),
            ContentBlock::ToolCall { arguments, .. } => char_tokens(&arguments.to_string()),
            ContentBlock::ToolResult { content, .. } => char_tokens(content),
        }
    }
}

/// A message's content payload: either plain text, or an ordered list of
/// content blocks. Untagged — plain strings and block arrays are
/// distinguished structurally by serde, mirroring how providers actually
/// emit either shape depending on whether tool use occurred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(s) => vec![ContentBlock::text(s.clone())],
            MessageContent::Blocks(b) => b.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Blocks(b) => b.is_empty(),
        }
    }

    /// Collapse a single-block list back to plain text, matching the
    /// single-part-collapse optimization providers' own SDKs use.
    pub fn collapse(blocks: Vec<ContentBlock>) -> Self {
        if let [ContentBlock::Text { text }] = blocks.as_slice() {
            MessageContent::Text(text.clone())
        } else {
            MessageContent::Blocks(blocks)
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// A transcript message. Carries a role discriminator, a content payload,
/// and a timestamp (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl Message {
    pub fn user(content: impl Into<MessageContent>, timestamp: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: timestamp.into(),
            stop_reason: None,
        }
    }

    pub fn assistant(
        content: impl Into<MessageContent>,
        timestamp: impl Into<String>,
        stop_reason: Option<StopReason>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: timestamp.into(),
            stop_reason,
        }
    }

    pub fn tool_result(content: impl Into<MessageContent>, timestamp: impl Into<String>) -> Self {
        Self {
            role: Role::ToolResult,
            content: content.into(),
            timestamp: timestamp.into(),
            stop_reason: None,
        }
    }

    pub fn bash_execution(command: &str, output: &str, timestamp: impl Into<String>) -> Self {
        Self {
            role: Role::BashExecution,
            content: MessageContent::Blocks(vec![ContentBlock::text(format!(
                "$ {command}\n{output}"
            ))]),
            timestamp: timestamp.into(),
            stop_reason: None,
        }
    }

    /// All tool-call blocks in emission order.
    pub fn tool_calls(&self) -> Vec<&ContentBlock> {
        match &self.content {
            MessageContent::Blocks(b) => b.iter().filter(|c| c.is_tool_call()).collect(),
            MessageContent::Text(_) => vec![],
        }
    }

    /// Whether this assistant message's stop reason permits pairing repair
    /// (spec §4.F stage 5: `stopReason ∉ {error, aborted}`).
    pub fn pairing_eligible(&self) -> bool {
        !matches!(self.stop_reason, Some(StopReason::Error) | Some(StopReason::Aborted))
    }
}

fn char_tokens(s: &str) -> usize {
    (s.chars().count() as f64 / 4.0).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_roundtrips_through_json() {
        let m = Message::user("hello", "2026-01-01T00:00:00Z");
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn content_collapse_single_text_block() {
        let c = MessageContent::collapse(vec![ContentBlock::text("hi")]);
        assert_eq!(c, MessageContent::Text("hi".to_string()));
    }

    #[test]
    fn content_collapse_multi_block_stays_blocks() {
        let c = MessageContent::collapse(vec![
            ContentBlock::text("hi"),
            ContentBlock::Image {
                image_url: "data:...".into(),
                detail: None,
            },
        ]);
        assert!(matches!(c, MessageContent::Blocks(_)));
    }

    #[test]
    fn tool_call_block_token_cost_is_json_char_based() {
        let b = ContentBlock::ToolCall {
            id: "1".into(),
            name: "exec".into(),
            arguments: serde_json::json!({"command": "ls"}),
        };
        assert!(b.approx_tokens() > 0);
    }

    #[test]
    fn image_block_costs_2000_tokens() {
        let b = ContentBlock::Image {
            image_url: "x".into(),
            detail: None,
        };
        assert_eq!(b.approx_tokens(), 2000);
    }

    #[test]
    fn pairing_eligible_false_for_error_stop_reason() {
        let m = Message::assistant("oops", "t", Some(StopReason::Error));
        assert!(!m.pairing_eligible());
    }

    #[test]
    fn pairing_eligible_true_for_tool_use() {
        let m = Message::assistant("ok", "t", Some(StopReason::ToolUse));
        assert!(m.pairing_eligible());
    }

    #[test]
    fn as_text_joins_text_blocks_only() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::text("a"),
            ContentBlock::ToolCall {
                id: "1".into(),
                name: "n".into(),
                arguments: serde_json::json!({}),
            },
            ContentBlock::text("b"),
        ]);
        assert_eq!(content.as_text(), "a\nb");
    }
}
