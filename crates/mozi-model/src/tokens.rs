// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Token estimation (spec §4.A).
//!
//! `ceil(chars / 4)` for text, +2000 tokens per image block. No provider
//! tokenizer is consulted — this is a fast, provider-agnostic estimate used
//! for budget decisions, not a billing figure.

use crate::types::{ContentBlock, Message, MessageContent};

const CHARS_PER_TOKEN: f64 = 4.0;
const IMAGE_BLOCK_TOKENS: usize = 2000;

fn ceil_div(chars: usize) -> usize {
    (chars as f64 / CHARS_PER_TOKEN).ceil() as usize
}

/// Token estimate for a single content block.
pub fn estimate_block_tokens(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => ceil_div(text.chars().count()),
        ContentBlock::Image { .. } => IMAGE_BLOCK_TOKENS,
        ContentBlock::Thinking { thinking, .. } => ceil_div(thinking.chars().count()),
        ContentBlock::ToolCall { arguments, .. } => {
            ceil_div(arguments.to_string().chars().count())
        }
        ContentBlock::ToolResult { content, .. } => ceil_div(content.chars().count()),
    }
}

/// Token estimate for one message. Messages without a usable content block
/// (e.g. malformed records) fall back to a JSON serialization of the whole
/// message.
pub fn estimate_tokens(message: &Message) -> usize {
    match &message.content {
        MessageContent::Text(s) => ceil_div(s.chars().count()),
        MessageContent::Blocks(blocks) if !blocks.is_empty() => {
            blocks.iter().map(estimate_block_tokens).sum()
        }
        MessageContent::Blocks(_) => match serde_json::to_string(message) {
            Ok(s) => ceil_div(s.chars().count()),
            Err(_) => 0,
        },
    }
}

/// Token estimate for a whole transcript: sum over messages.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_tokens).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StopReason;

    #[test]
    fn text_tokens_round_up() {
        let m = Message::user("a".repeat(5), "t");
        assert_eq!(estimate_tokens(&m), 2);
    }

    #[test]
    fn empty_text_is_zero_tokens() {
        let m = Message::user("", "t");
        assert_eq!(estimate_tokens(&m), 0);
    }

    #[test]
    fn image_block_adds_2000() {
        let m = Message::assistant(
            MessageContent::Blocks(vec![ContentBlock::Image {
                image_url: "x".into(),
                detail: None,
            }]),
            "t",
            Some(StopReason::EndTurn),
        );
        assert_eq!(estimate_tokens(&m), 2000);
    }

    #[test]
    fn sum_over_messages() {
        let msgs = vec![Message::user("a".repeat(4), "t"), Message::user("b".repeat(4), "t")];
        assert_eq!(estimate_messages_tokens(&msgs), 2);
    }

    #[test]
    fn tool_call_arguments_counted_as_json() {
        let m = Message::assistant(
            MessageContent::Blocks(vec![ContentBlock::ToolCall {
                id: "1".into(),
                name: "n".into(),
                arguments: serde_json::json!({"a": 1}),
            }]),
            "t",
            Some(StopReason::ToolUse),
        );
        assert!(estimate_tokens(&m) > 0);
    }
}
