// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod policy;
pub mod sandbox;

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use mozi_secrets::{SecretBroker, SecretScope};
use sandbox::{ExecRequest, ExecResult, SandboxBackend, SandboxError};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecToolArgs {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default, rename = "authRefs")]
    pub auth_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecToolError {
    #[error("env key {0} looks like a direct API key and is rejected")]
    DirectApiKeyRejected(String),
    #[error("auth ref {0} is not in this agent's allowedSecrets")]
    AuthRefNotAllowed(String),
    #[error("AUTH_MISSING {0}")]
    AuthMissing(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

fn api_key_pattern() -> Regex {
    Regex::new(r"^[A-Z][A-Z0-9_]*_API_KEY$").expect("static regex is valid")
}

/// The `exec` tool surface agents call into (spec.md §4.J). Rejects direct
/// API-key-shaped env overrides, resolves `authRefs` through the Secret
/// Broker (each ref must be in the agent's `allowedSecrets`), and injects
/// the resolved values as additional env before delegating to the sandbox
/// backend.
pub struct ExecTool {
    pub backend: Arc<dyn SandboxBackend>,
    pub secrets: Arc<SecretBroker>,
    pub agent_id: String,
    pub allowed_secrets: Vec<String>,
}

impl ExecTool {
    fn normalize_ref(r: &str) -> String {
        r.trim().to_uppercase()
    }

    pub async fn execute(&self, args: ExecToolArgs) -> Result<ExecToolOutput, ExecToolError> {
        let pattern = api_key_pattern();
        for key in args.env.keys() {
            if pattern.is_match(key) {
                return Err(ExecToolError::DirectApiKeyRejected(key.clone()));
            }
        }

        let allowed: Vec<String> = self.allowed_secrets.iter().map(|s| Self::normalize_ref(s)).collect();
        let mut env = args.env.clone();
        for auth_ref in &args.auth_refs {
            let normalized = Self::normalize_ref(auth_ref);
            if !allowed.contains(&normalized) {
                return Err(ExecToolError::AuthRefNotAllowed(auth_ref.clone()));
            }
            let value = self
                .secrets
                .get_value(&normalized, &self.agent_id, None)
                .map_err(|_| ExecToolError::AuthMissing(normalized.clone()))?;
            env.insert(normalized, value);
        }

        let result: ExecResult = self
            .backend
            .exec(&ExecRequest {
                command: args.command,
                cwd: args.cwd,
                env,
                timeout_ms: None,
            })
            .await?;

        Ok(ExecToolOutput {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sandbox::{ProbeMode, ProbeResult, SandboxResult};

    struct EchoBackend;

    #[async_trait]
    impl SandboxBackend for EchoBackend {
        async fn exec(&self, request: &ExecRequest) -> SandboxResult<ExecResult> {
            Ok(ExecResult {
                stdout: format!("ran: {} env-keys: {:?}", request.command, {
                    let mut keys: Vec<&String> = request.env.keys().collect();
                    keys.sort();
                    keys
                }),
                stderr: String::new(),
                exit_code: 0,
            })
        }
        async fn probe(&self) -> ProbeResult {
            ProbeResult { ok: true, mode: ProbeMode::Off, message: String::new(), hints: vec![] }
        }
        fn cache_key(&self) -> serde_json::Value {
            serde_json::json!({"mode": "echo"})
        }
    }

    fn broker_in(dir: &std::path::Path) -> Arc<SecretBroker> {
        std::env::set_var("MOZI_EXEC_TEST_KEY", "passphrase");
        Arc::new(SecretBroker::open(dir.join("secrets.json"), "MOZI_EXEC_TEST_KEY").unwrap())
    }

    #[tokio::test]
    async fn direct_api_key_env_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool {
            backend: Arc::new(EchoBackend),
            secrets: broker_in(dir.path()),
            agent_id: "a".to_string(),
            allowed_secrets: vec![],
        };
        let mut env = std::collections::HashMap::new();
        env.insert("OPENAI_API_KEY".to_string(), "sk-leak".to_string());
        let result = tool.execute(ExecToolArgs { command: "echo hi".into(), env, ..Default::default() }).await;
        assert!(matches!(result, Err(ExecToolError::DirectApiKeyRejected(_))));
    }

    #[tokio::test]
    async fn auth_ref_not_in_allowlist_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool {
            backend: Arc::new(EchoBackend),
            secrets: broker_in(dir.path()),
            agent_id: "a".to_string(),
            allowed_secrets: vec!["GITHUB_TOKEN".to_string()],
        };
        let result = tool
            .execute(ExecToolArgs { command: "echo hi".into(), auth_refs: vec!["AWS_SECRET".into()], ..Default::default() })
            .await;
        assert!(matches!(result, Err(ExecToolError::AuthRefNotAllowed(_))));
    }

    #[tokio::test]
    async fn missing_secret_value_reports_auth_missing() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool {
            backend: Arc::new(EchoBackend),
            secrets: broker_in(dir.path()),
            agent_id: "a".to_string(),
            allowed_secrets: vec!["GITHUB_TOKEN".to_string()],
        };
        let result = tool
            .execute(ExecToolArgs { command: "echo hi".into(), auth_refs: vec!["GITHUB_TOKEN".into()], ..Default::default() })
            .await;
        assert!(matches!(result, Err(ExecToolError::AuthMissing(_))));
    }

    #[tokio::test]
    async fn resolved_auth_ref_is_injected_as_env() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = broker_in(dir.path());
        secrets.set("GITHUB_TOKEN", "ghp_abc", SecretScope::Agent { agent_id: "a".into() }, None).unwrap();
        let tool = ExecTool {
            backend: Arc::new(EchoBackend),
            secrets,
            agent_id: "a".to_string(),
            allowed_secrets: vec!["GITHUB_TOKEN".to_string()],
        };
        let output = tool
            .execute(ExecToolArgs { command: "echo hi".into(), auth_refs: vec!["github_token".into()], ..Default::default() })
            .await
            .unwrap();
        assert!(output.stdout.contains("GITHUB_TOKEN"));
    }

    #[tokio::test]
    async fn plain_command_without_auth_refs_executes() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool {
            backend: Arc::new(EchoBackend),
            secrets: broker_in(dir.path()),
            agent_id: "a".to_string(),
            allowed_secrets: vec![],
        };
        let output = tool.execute(ExecToolArgs { command: "echo hi".into(), ..Default::default() }).await.unwrap();
        assert!(output.stdout.contains("echo hi"));
        assert_eq!(output.exit_code, 0);
    }
}
