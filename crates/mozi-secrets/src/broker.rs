// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{SecretError, SecretResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SecretScope {
    Global,
    Agent { #[serde(rename = "agentId")] agent_id: String },
}

impl SecretScope {
    fn key_suffix(&self) -> String {
        match self {
            SecretScope::Global => "global".to_string(),
            SecretScope::Agent { agent_id } => format!("agent:{agent_id}"),
        }
    }
}

impl std::fmt::Display for SecretScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key_suffix())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SecretRecord {
    name: String,
    scope: SecretScope,
    #[serde(with = "hex_bytes")]
    nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    ciphertext: Vec<u8>,
    created_at: String,
    last_used_at: Option<String>,
    actor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SecretFile {
    #[serde(default)]
    records: Vec<SecretRecord>,
}

/// Metadata about a stored secret, with no access to its plaintext value.
#[derive(Debug, Clone, PartialEq)]
pub struct SecretMeta {
    pub name: String,
    pub scope: SecretScope,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

pub struct SecretBroker {
    path: PathBuf,
    cipher: XChaCha20Poly1305,
    records: Mutex<HashMap<(String, String), SecretRecord>>,
}

impl SecretBroker {
    /// Open (or create) the broker's store at `path`, deriving the AEAD key
    /// from the value of `master_key_env` (not the literal key itself —
    /// operators set an arbitrary-length passphrase, not a raw 32-byte key).
    pub fn open(path: impl Into<PathBuf>, master_key_env: &str) -> SecretResult<Self> {
        let passphrase = std::env::var(master_key_env)
            .map_err(|_| SecretError::MissingMasterKey(master_key_env.to_string()))?;
        let derived = Sha256::digest(passphrase.as_bytes());
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&derived));

        let path = path.into();
        let file: SecretFile = if path.is_file() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            SecretFile::default()
        };

        let records = file
            .records
            .into_iter()
            .map(|r| ((r.scope.key_suffix(), r.name.clone()), r))
            .collect();

        Ok(Self { path, cipher, records: Mutex::new(records) })
    }

    fn persist(&self, records: &HashMap<(String, String), SecretRecord>) -> SecretResult<()> {
        let file = SecretFile { records: records.values().cloned().collect() };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp_path = self.path.with_extension("tmp");
        write_secret_file(&tmp_path, json.as_bytes())?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Encrypt `value` and store it under `name`/`scope`.
    pub fn set(&self, name: &str, value: &str, scope: SecretScope, actor: Option<&str>) -> SecretResult<()> {
        let mut nonce_bytes = [0u8; 24];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, value.as_bytes())
            .map_err(|_| SecretError::DecryptionFailed(name.to_string()))?;

        let record = SecretRecord {
            name: name.to_string(),
            scope: scope.clone(),
            nonce: nonce_bytes.to_vec(),
            ciphertext,
            created_at: now_placeholder(),
            last_used_at: None,
            actor: actor.map(str::to_string),
        };

        let mut records = self.records.lock().expect("secret broker mutex poisoned");
        records.insert((scope.key_suffix(), name.to_string()), record);
        self.persist(&records)
    }

    pub fn unset(&self, name: &str, scope: SecretScope) -> SecretResult<()> {
        let mut records = self.records.lock().expect("secret broker mutex poisoned");
        records.remove(&(scope.key_suffix(), name.to_string()));
        self.persist(&records)
    }

    pub fn list(&self, scope: Option<&SecretScope>) -> Vec<SecretMeta> {
        let records = self.records.lock().expect("secret broker mutex poisoned");
        let mut metas: Vec<SecretMeta> = records
            .values()
            .filter(|r| scope.map(|s| &r.scope == s).unwrap_or(true))
            .map(|r| SecretMeta {
                name: r.name.clone(),
                scope: r.scope.clone(),
                created_at: r.created_at.clone(),
                last_used_at: r.last_used_at.clone(),
            })
            .collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.scope.key_suffix().cmp(&b.scope.key_suffix())));
        metas
    }

    /// Does a resolvable value exist for `name` given `agentId`'s effective
    /// scope? Does not touch `lastUsedAt`.
    pub fn check(&self, name: &str, agent_id: &str, scope: Option<&SecretScope>) -> bool {
        let records = self.records.lock().expect("secret broker mutex poisoned");
        resolve_record(&records, name, agent_id, scope).is_some()
    }

    /// Decrypt the effective value of `name` for `agentId`. Prefers the
    /// exact `scope` if supplied, else the agent-scoped value overriding the
    /// global one. Updates `lastUsedAt` on success.
    pub fn get_value(&self, name: &str, agent_id: &str, scope: Option<&SecretScope>) -> SecretResult<String> {
        let mut records = self.records.lock().expect("secret broker mutex poisoned");
        let key = resolve_record(&records, name, agent_id, scope)
            .ok_or_else(|| SecretError::NotFound(name.to_string(), scope.map(|s| s.to_string()).unwrap_or_else(|| agent_id.to_string())))?;

        let record = records.get(&key).expect("resolved key must exist").clone();
        let nonce = XNonce::from_slice(&record.nonce);
        let plaintext = self
            .cipher
            .decrypt(nonce, record.ciphertext.as_slice())
            .map_err(|_| SecretError::DecryptionFailed(name.to_string()))?;
        let value = String::from_utf8_lossy(&plaintext).into_owned();

        if let Some(r) = records.get_mut(&key) {
            r.last_used_at = Some(now_placeholder());
        }
        self.persist(&records)?;

        Ok(value)
    }

    /// Check `provided` against the effective stored value of `name` without
    /// ever handing the plaintext back to the caller. Compares in constant
    /// time so a caller verifying a webhook secret or shared token can't use
    /// response latency to learn how many leading bytes matched.
    pub fn verify_value(&self, name: &str, provided: &str, agent_id: &str, scope: Option<&SecretScope>) -> SecretResult<bool> {
        let expected = self.get_value(name, agent_id, scope)?;
        Ok(expected.as_bytes().ct_eq(provided.as_bytes()).into())
    }
}

fn resolve_record(
    records: &HashMap<(String, String), SecretRecord>,
    name: &str,
    agent_id: &str,
    scope: Option<&SecretScope>,
) -> Option<(String, String)> {
    if let Some(scope) = scope {
        let key = (scope.key_suffix(), name.to_string());
        return records.contains_key(&key).then_some(key);
    }
    let agent_key = (SecretScope::Agent { agent_id: agent_id.to_string() }.key_suffix(), name.to_string());
    if records.contains_key(&agent_key) {
        return Some(agent_key);
    }
    let global_key = (SecretScope::Global.key_suffix(), name.to_string());
    records.contains_key(&global_key).then_some(global_key)
}

/// Placeholder timestamp source. The runtime crate stamps real wall-clock
/// times when wiring this broker in; keeping `chrono::Utc::now()` out of the
/// library crate itself makes its pure logic trivially testable.
fn now_placeholder() -> String {
    "1970-01-01T00:00:00Z".to_string()
}

fn write_secret_file(path: &Path, data: &[u8]) -> SecretResult<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)?;
    }
    Ok(())
}

mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(D::Error::custom)
    }
}
