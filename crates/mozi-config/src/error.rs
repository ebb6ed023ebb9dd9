// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Typed error taxonomy for the config store (spec §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config file not found: {0}")]
    ConfigNotFound(String),

    #[error("failed to parse JSONC at {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("schema validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("optimistic concurrency conflict: expected hash {expected}, found {actual}")]
    ConfigConflict { expected: String, actual: String },

    #[error("redaction sentinel used for '{field}' but no prior value exists on disk")]
    MissingSensitive { field: String },

    #[error("unknown path segment: {0}")]
    UnknownPath(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
