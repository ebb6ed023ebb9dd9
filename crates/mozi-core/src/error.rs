// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Error taxonomy for the session lifecycle and context-management pipeline.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid session key: {0}")]
    InvalidSessionKey(String),

    #[error("session {0} has no previous segment to revert to")]
    NoPreviousSegment(String),

    #[error("segment {0} is archived and cannot be rewritten")]
    ArchivedSegment(String),

    #[error("context window too small for a single message")]
    ContextWindowTooSmall,

    #[error("context overflow")]
    ContextOverflow,

    #[error("compaction failed: {0}")]
    CompactionFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
