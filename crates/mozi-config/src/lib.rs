// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod error;
pub mod ops;
pub mod schema;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use ops::{apply, patch, set, unset, ConfigOp};
pub use schema::{
    AgentConfig, AuthConfig, CapabilityKind, CapabilityProfile, Config, DefaultSecretScope,
    HeartbeatConfig, Modality, ModalityLimits, ModelSpec, PruningKnobs, SandboxConfig, SandboxMode,
    ThinkingLevel, VibeboxBridge, WorkspaceAccess,
};
pub use store::{load, load_str, raw_hash, snapshot, LoadOutcome, Snapshot, REDACTION_SENTINEL};
