// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `HostExec` backend (`mode=off`): runs commands directly via a shell,
//! enforcing workspace containment, env-shadow prevention, and an optional
//! command allowlist. Grounded on `sven-tools/src/builtin/shell.rs`'s
//! subprocess-spawning idiom.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use super::{
    ExecRequest, ExecResult, ProbeMode, ProbeResult, SandboxBackend, SandboxError, SandboxResult,
    DEFAULT_BUFFER_BYTES, DEFAULT_TIMEOUT_MS, SHADOW_PROTECTED_ENV_KEYS,
};

pub struct HostExec {
    pub workspace_dir: PathBuf,
    pub allowlist: Option<Vec<String>>,
    pub buffer_bytes: usize,
}

impl HostExec {
    pub fn new(workspace_dir: impl Into<PathBuf>, allowlist: Option<Vec<String>>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            allowlist,
            buffer_bytes: DEFAULT_BUFFER_BYTES,
        }
    }

    fn resolve_cwd(&self, cwd: Option<&str>) -> SandboxResult<PathBuf> {
        let requested = match cwd {
            Some(c) => {
                let p = Path::new(c);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    self.workspace_dir.join(p)
                }
            }
            None => self.workspace_dir.clone(),
        };
        let workspace_canon = dunce_canonicalize(&self.workspace_dir);
        let requested_canon = dunce_canonicalize(&requested);
        if !requested_canon.starts_with(&workspace_canon) {
            return Err(SandboxError::CwdEscapesWorkspace(requested.display().to_string()));
        }
        Ok(requested)
    }

    fn check_env_shadow(&self, env: &HashMap<String, String>) -> SandboxResult<()> {
        for key in env.keys() {
            if SHADOW_PROTECTED_ENV_KEYS
                .iter()
                .any(|protected| protected.eq_ignore_ascii_case(key))
            {
                return Err(SandboxError::EnvShadowDenied(key.clone()));
            }
        }
        Ok(())
    }

    fn check_allowlist(&self, command: &str) -> SandboxResult<()> {
        let Some(allowlist) = &self.allowlist else {
            return Ok(());
        };
        for segment in split_command_segments(command) {
            let Some(binary) = leading_binary_basename(&segment) else {
                continue;
            };
            if !allowlist.iter().any(|a| a == &binary) {
                return Err(SandboxError::CommandNotAllowed(binary));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for HostExec {
    async fn exec(&self, request: &ExecRequest) -> SandboxResult<ExecResult> {
        self.check_env_shadow(&request.env)?;
        self.check_allowlist(&request.command)?;
        let cwd = self.resolve_cwd(request.cwd.as_deref())?;

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&request.command);
        cmd.current_dir(&cwd);
        cmd.envs(&request.env);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let timeout_ms = request.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            cmd.output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                if output.stdout.len() + output.stderr.len() > self.buffer_bytes {
                    return Err(SandboxError::OutputBufferExceeded(self.buffer_bytes));
                }
                Ok(ExecResult {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code().unwrap_or(-1),
                })
            }
            Ok(Err(e)) => Err(SandboxError::Spawn(e.to_string())),
            Err(_) => Err(SandboxError::Timeout(timeout_ms)),
        }
    }

    async fn probe(&self) -> ProbeResult {
        ProbeResult {
            ok: true,
            mode: ProbeMode::Off,
            message: "host execution, no sandbox".to_string(),
            hints: Vec::new(),
        }
    }

    fn cache_key(&self) -> serde_json::Value {
        serde_json::json!({
            "mode": "off",
            "allowlist": self.allowlist,
        })
    }
}

fn dunce_canonicalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Split a shell command into segments on `;`, `&&`, `||`, `|`, and
/// newlines. This is a lexical split for allowlist checking, not a full
/// shell parse: it does not account for quoting around these operators.
fn split_command_segments(command: &str) -> Vec<String> {
    let re = Regex::new(r"&&|\|\||[;|\n]").expect("static regex is valid");
    re.split(command)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Strip leading `KEY=VALUE` env-assignment prefixes from a command segment
/// and return the basename of the first remaining token.
fn leading_binary_basename(segment: &str) -> Option<String> {
    let assignment = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=\S*$").expect("static regex is valid");
    let mut tokens = segment.split_whitespace();
    let mut token = tokens.next()?;
    loop {
        if assignment.is_match(token) {
            token = tokens.next()?;
            continue;
        }
        break;
    }
    Path::new(token)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Command segment splitting ──

    #[test]
    fn splits_on_all_separators() {
        let segments = split_command_segments("echo a; echo b && echo c || echo d | echo e\necho f");
        assert_eq!(segments, vec!["echo a", "echo b", "echo c", "echo d", "echo e", "echo f"]);
    }

    #[test]
    fn strips_env_prefix_before_binary_name() {
        assert_eq!(leading_binary_basename("FOO=bar /usr/bin/git status"), Some("git".to_string()));
    }

    #[test]
    fn strips_multiple_env_prefixes() {
        assert_eq!(leading_binary_basename("A=1 B=2 ls -la"), Some("ls".to_string()));
    }

    #[test]
    fn plain_command_has_no_env_prefix_to_strip() {
        assert_eq!(leading_binary_basename("cat file.txt"), Some("cat".to_string()));
    }

    // ── Allowlist enforcement ──

    #[tokio::test]
    async fn allowlisted_command_segment_is_permitted() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), Some(vec!["echo".to_string()]));
        assert!(host.check_allowlist("echo hi").is_ok());
    }

    #[tokio::test]
    async fn non_allowlisted_segment_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), Some(vec!["echo".to_string()]));
        assert!(matches!(
            host.check_allowlist("rm -rf /"),
            Err(SandboxError::CommandNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn every_chained_segment_must_be_allowlisted() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), Some(vec!["echo".to_string()]));
        assert!(host.check_allowlist("echo a && rm b").is_err());
    }

    #[tokio::test]
    async fn no_allowlist_permits_anything() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), None);
        assert!(host.check_allowlist("rm -rf /").is_ok());
    }

    // ── Env shadow prevention ──

    #[test]
    fn rejects_path_override() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), None);
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/evil".to_string());
        assert!(matches!(host.check_env_shadow(&env), Err(SandboxError::EnvShadowDenied(_))));
    }

    #[test]
    fn rejects_ld_preload_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), None);
        let mut env = HashMap::new();
        env.insert("ld_preload".to_string(), "/evil.so".to_string());
        assert!(host.check_env_shadow(&env).is_err());
    }

    #[test]
    fn permits_unrelated_env_keys() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), None);
        let mut env = HashMap::new();
        env.insert("MY_VAR".to_string(), "1".to_string());
        assert!(host.check_env_shadow(&env).is_ok());
    }

    // ── Cwd containment ──

    #[test]
    fn cwd_inside_workspace_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let host = HostExec::new(dir.path(), None);
        assert!(host.resolve_cwd(Some("sub")).is_ok());
    }

    #[test]
    fn cwd_escaping_workspace_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), None);
        assert!(matches!(
            host.resolve_cwd(Some("/etc")),
            Err(SandboxError::CwdEscapesWorkspace(_))
        ));
    }

    #[test]
    fn absent_cwd_defaults_to_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), None);
        let resolved = host.resolve_cwd(None).unwrap();
        assert_eq!(dunce_canonicalize(&resolved), dunce_canonicalize(dir.path()));
    }

    // ── Execution ──

    #[tokio::test]
    async fn executes_echo_and_returns_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), None);
        let result = host
            .exec(&ExecRequest {
                command: "echo hello".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_errored() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), None);
        let result = host
            .exec(&ExecRequest {
                command: "exit 3".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), None);
        let result = host
            .exec(&ExecRequest {
                command: "sleep 5".to_string(),
                timeout_ms: Some(50),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(SandboxError::Timeout(_))));
    }

    #[tokio::test]
    async fn probe_is_always_ok_for_host_mode() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostExec::new(dir.path(), None);
        let probe = host.probe().await;
        assert!(probe.ok);
        assert_eq!(probe.mode, ProbeMode::Off);
    }
}
