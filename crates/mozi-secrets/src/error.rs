// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("master key env var {0} is not set")]
    MissingMasterKey(String),
    #[error("no secret named {0} in scope {1}")]
    NotFound(String, String),
    #[error("decryption failed for secret {0} (wrong master key or corrupted record)")]
    DecryptionFailed(String),
    #[error("auth ref {0} is not in the agent's allowedSecrets list")]
    NotAllowed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type SecretResult<T> = Result<T, SecretError>;
