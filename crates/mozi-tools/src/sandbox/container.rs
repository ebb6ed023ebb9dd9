// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Container exec backend (`mode=docker|apple-vm`, native backend): mounts
//! the workspace, starts the container if needed, execs the command inside
//! it. New relative to the teacher (which has no container concept), but
//! reuses the same `tokio::process::Command` + `timeout` idiom as
//! `sandbox::host`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{
    ExecRequest, ExecResult, ProbeMode, ProbeResult, SandboxBackend, SandboxError, SandboxResult,
    DEFAULT_TIMEOUT_MS,
};

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: Option<String>,
    pub container_name: String,
    pub workspace_mount: String,
    pub workspace_readonly: bool,
    pub network: bool,
    pub env: Vec<(String, String)>,
}

pub struct ContainerExec {
    pub config: ContainerConfig,
}

impl ContainerExec {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    async fn is_running(&self) -> bool {
        let output = Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", &self.config.container_name])
            .stdin(Stdio::null())
            .output()
            .await;
        matches!(output, Ok(o) if o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "true")
    }

    async fn start(&self) -> SandboxResult<()> {
        let Some(image) = &self.config.image else {
            return Err(SandboxError::Spawn("no image configured for container mode".to_string()));
        };
        let mount_mode = if self.config.workspace_readonly { "ro" } else { "rw" };
        let mut cmd = Command::new("docker");
        cmd.args([
            "run",
            "-d",
            "--name",
            &self.config.container_name,
            "-v",
            &format!("{}:/workspace:{}", self.config.workspace_mount, mount_mode),
        ]);
        if !self.config.network {
            cmd.args(["--network", "none"]);
        }
        for (key, value) in &self.config.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(image);
        cmd.arg("sleep").arg("infinity");
        cmd.stdin(Stdio::null());
        let output = cmd.output().await.map_err(|e| SandboxError::Spawn(e.to_string()))?;
        if !output.status.success() {
            return Err(SandboxError::Spawn(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for ContainerExec {
    async fn exec(&self, request: &ExecRequest) -> SandboxResult<ExecResult> {
        if !self.is_running().await {
            self.start().await?;
        }

        let mut cmd = Command::new("docker");
        cmd.args(["exec"]);
        if let Some(cwd) = &request.cwd {
            cmd.args(["-w", cwd]);
        }
        for (key, value) in &request.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(&self.config.container_name);
        cmd.args(["bash", "-c", &request.command]);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let timeout_ms = request.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        let result = tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), cmd.output()).await;

        match result {
            Ok(Ok(output)) => Ok(ExecResult {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
            }),
            Ok(Err(e)) => Err(SandboxError::Spawn(e.to_string())),
            Err(_) => Err(SandboxError::Timeout(timeout_ms)),
        }
    }

    async fn probe(&self) -> ProbeResult {
        if self.config.image.is_none() {
            return ProbeResult {
                ok: false,
                mode: ProbeMode::Docker,
                message: "no image configured".to_string(),
                hints: vec!["set sandbox.image in agent config".to_string()],
            };
        }
        let docker_ok = Command::new("docker").arg("version").output().await.map(|o| o.status.success()).unwrap_or(false);
        ProbeResult {
            ok: docker_ok,
            mode: ProbeMode::Docker,
            message: if docker_ok { "docker available".to_string() } else { "docker daemon unreachable".to_string() },
            hints: if docker_ok { Vec::new() } else { vec!["is the docker daemon running?".to_string()] },
        }
    }

    fn cache_key(&self) -> serde_json::Value {
        serde_json::json!({
            "mode": "docker",
            "image": self.config.image,
            "container_name": self.config.container_name,
            "workspace_mount": self.config.workspace_mount,
            "workspace_readonly": self.config.workspace_readonly,
            "network": self.config.network,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ContainerConfig {
        ContainerConfig {
            image: Some("alpine:latest".to_string()),
            container_name: "mozi-test".to_string(),
            workspace_mount: "/tmp/ws".to_string(),
            workspace_readonly: false,
            network: false,
            env: vec![],
        }
    }

    #[test]
    fn cache_key_captures_full_container_config() {
        let exec = ContainerExec::new(config());
        let key = exec.cache_key();
        assert_eq!(key["mode"], "docker");
        assert_eq!(key["image"], "alpine:latest");
    }

    #[tokio::test]
    async fn probe_without_image_is_not_ok() {
        let mut cfg = config();
        cfg.image = None;
        let exec = ContainerExec::new(cfg);
        let probe = exec.probe().await;
        assert!(!probe.ok);
        assert_eq!(probe.mode, ProbeMode::Docker);
    }
}
