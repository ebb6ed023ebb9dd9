// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Secret Broker (spec §4.K): scoped, AEAD-encrypted credential storage.
//! Grounded on `sven-node/src/crypto/token.rs`'s atomic-0600-write and
//! hex-serde idiom, but reversible — `getValue` must recover plaintext, so
//! values are encrypted (XChaCha20-Poly1305) rather than one-way hashed.

mod broker;
mod error;

pub use broker::{SecretBroker, SecretMeta, SecretScope};
pub use error::{SecretError, SecretResult};

/// Environment variable holding the broker's master key, unless the agent
/// config overrides the name via `masterKeyEnv`.
pub const DEFAULT_MASTER_KEY_ENV: &str = "MOZI_MASTER_KEY";
