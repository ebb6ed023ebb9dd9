// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod compact;
pub mod error;
pub mod prompts;
pub mod pruner;
pub mod registry;
pub mod segment_store;
pub mod session;

pub use compact::{
    chunk_messages_by_max_tokens, compact_messages, compute_adaptive_chunk_ratio,
    create_summary_message, is_oversized_for_summary, prune_history_for_context_share,
    repair_tool_use_result_pairing, split_messages_by_token_share, CompactResult,
    PruneHistoryResult, SummaryGenerator,
};
pub use error::{CoreError, CoreResult};
pub use prompts::{
    assemble_prompt, build_channel_context_section, sanitize_literal, AssembledPrompt,
    ChannelContext, LoadedFile, PromptInputs, PromptMode, SkippedFile,
};
pub use pruner::{prune_context_messages, PruneStats, PrunerSettings, SoftTrimSettings};
pub use registry::{
    ensure_session_model_for_input, get_context_breakdown, get_context_usage, resolve_agent_id,
    resolve_thinking_level, resolve_tool_allow_list, sanitize_schema_for_gemini,
    should_sanitize_tools, AgentBinding, AgentEntry, AgentRegistry, ContextBreakdown,
    ContextUsage, DispatchResult, ModelSwitchOutcome, RegistryError, RegistryResult,
    DEFAULT_TOOL_NAMES, MIN_CONTEXT_WINDOW_TOKENS, WARN_CONTEXT_WINDOW_TOKENS,
};
pub use segment_store::SessionStore;
pub use session::{
    extract_dm_peer_id, is_dm_session_key, parse_session_key, HeaderKind, MessageRecord,
    MessageRecordKind, PeerType, SegmentRecord, SessionChanges, SessionHeader, SessionKeyParts,
    SessionRecord, SessionState, TranscriptLine,
};
