// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sandbox Executor (spec §4.J): three backends sharing one trait, plus the
//! vibebox bridge. Grounded on `sven-tools/src/builtin/shell.rs`'s
//! subprocess idiom (`tokio::process::Command`, `Stdio::null()`,
//! `kill_on_drop`, unix `pre_exec`/`setsid`, `tokio::time::timeout`).

pub mod container;
pub mod host;
pub mod vibebox;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Default subprocess timeout: 120 seconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
/// Default combined stdout+stderr buffer: 4 MiB.
pub const DEFAULT_BUFFER_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMode {
    Off,
    Docker,
    AppleVm,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub ok: bool,
    pub mode: ProbeMode,
    pub message: String,
    pub hints: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("cwd {0} escapes the workspace directory")]
    CwdEscapesWorkspace(String),
    #[error("env key {0} is not permitted to override the sandbox environment")]
    EnvShadowDenied(String),
    #[error("command segment not in allowlist: {0}")]
    CommandNotAllowed(String),
    #[error("output exceeded the {0}-byte exec buffer")]
    OutputBufferExceeded(usize),
    #[error("timeout after {0}ms")]
    Timeout(u64),
    #[error("spawn error: {0}")]
    Spawn(String),
    #[error("vibebox bridge returned an unparseable response: {0}")]
    VibeboxProtocol(String),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// One backend that can execute a command and be probed for health.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn exec(&self, request: &ExecRequest) -> SandboxResult<ExecResult>;
    async fn probe(&self) -> ProbeResult;
    /// JSON-serializable key used to reuse an already-prepared executor
    /// instance (spec.md §4.J's cache key scheme).
    fn cache_key(&self) -> serde_json::Value;
}

/// Environment variable names a command-override must never shadow, since
/// doing so could redirect dynamic linking or module loading inside the
/// sandboxed process.
pub const SHADOW_PROTECTED_ENV_KEYS: &[&str] = &[
    "PATH",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "NODE_OPTIONS",
];
