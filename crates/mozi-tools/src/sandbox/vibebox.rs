// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Vibebox bridge (`mode=docker|apple-vm` with `apple.vibebox.enabled=true`
//! or `apple.backend="vibebox"`): spawns an external `vibebox` binary with
//! `probe`/`exec` subcommands and parses its JSON response. New relative to
//! the teacher, reusing `sandbox::host`'s subprocess-spawning idiom.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{ExecRequest, ExecResult, ProbeMode, ProbeResult, SandboxBackend, SandboxError, SandboxResult, DEFAULT_TIMEOUT_MS};

#[derive(Debug, Clone)]
pub struct VibeboxBridge {
    pub bin_path: String,
    pub provider: String,
    pub project_root: String,
}

impl Default for VibeboxBridge {
    fn default() -> Self {
        Self {
            bin_path: "vibebox".to_string(),
            provider: String::new(),
            project_root: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VibeboxResponse {
    ok: bool,
    error: Option<String>,
    #[allow(dead_code)]
    selected: Option<String>,
    #[serde(default)]
    diagnostics: Vec<String>,
    stdout: Option<String>,
    stderr: Option<String>,
    #[serde(rename = "exitCode")]
    exit_code: Option<i32>,
}

impl VibeboxBridge {
    async fn invoke(&self, subcommand: &str, request: &ExecRequest) -> SandboxResult<VibeboxResponse> {
        let mut cmd = Command::new(&self.bin_path);
        cmd.arg(subcommand);
        cmd.arg("--json");
        cmd.args(["--provider", &self.provider]);
        cmd.args(["--project-root", &self.project_root]);
        if subcommand == "exec" {
            cmd.args(["--command", &request.command]);
            if let Some(cwd) = &request.cwd {
                cmd.args(["--cwd", cwd]);
            }
            for (key, value) in &request.env {
                cmd.arg("--env").arg(format!("{key}={value}"));
            }
            cmd.args(["--timeout", &request.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS).to_string()]);
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| SandboxError::Spawn(e.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(&stdout).map_err(|_| SandboxError::VibeboxProtocol(stdout.into_owned()))
    }
}

#[async_trait]
impl SandboxBackend for VibeboxBridge {
    async fn exec(&self, request: &ExecRequest) -> SandboxResult<ExecResult> {
        let response = self.invoke("exec", request).await?;
        if !response.ok {
            let mut message = response.error.unwrap_or_else(|| "vibebox exec failed".to_string());
            if !response.diagnostics.is_empty() {
                message.push_str(&format!(" (hints: {})", response.diagnostics.join("; ")));
            }
            return Err(SandboxError::VibeboxProtocol(message));
        }
        Ok(ExecResult {
            stdout: response.stdout.unwrap_or_default(),
            stderr: response.stderr.unwrap_or_default(),
            exit_code: response.exit_code.unwrap_or(-1),
        })
    }

    async fn probe(&self) -> ProbeResult {
        let empty_request = ExecRequest::default();
        match self.invoke("probe", &empty_request).await {
            Ok(response) => ProbeResult {
                ok: response.ok,
                mode: ProbeMode::Docker,
                message: response.error.unwrap_or_else(|| "vibebox reachable".to_string()),
                hints: response.diagnostics,
            },
            Err(e) => ProbeResult {
                ok: false,
                mode: ProbeMode::Docker,
                message: e.to_string(),
                hints: vec!["is the vibebox binary installed and on PATH?".to_string()],
            },
        }
    }

    fn cache_key(&self) -> serde_json::Value {
        serde_json::json!({
            "mode": "vibebox",
            "bin_path": self.bin_path,
            "provider": self.provider,
            "project_root": self.project_root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_identifies_vibebox_mode() {
        let bridge = VibeboxBridge { bin_path: "vibebox".into(), provider: "apple".into(), project_root: "/p".into() };
        let key = bridge.cache_key();
        assert_eq!(key["mode"], "vibebox");
        assert_eq!(key["provider"], "apple");
    }

    #[tokio::test]
    async fn probe_reports_unreachable_binary_with_hint() {
        let bridge = VibeboxBridge { bin_path: "/nonexistent/vibebox-binary".into(), provider: "apple".into(), project_root: "/p".into() };
        let probe = bridge.probe().await;
        assert!(!probe.ok);
        assert!(!probe.hints.is_empty());
    }
}
