// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Atomic JSONC config store (spec §4.C). Grounded on
//! `sven-config/src/loader.rs`'s merge-recursion and search idiom, extended
//! with `$include` array concatenation, hash-based optimistic concurrency,
//! backup rotation, and the redaction sentinel the teacher's plain-YAML
//! loader never needed.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{StoreError, StoreResult};
use crate::schema::Config;

/// Literal substituted back in for a field whose patch value is the
/// redaction sentinel (spec §4.C).
pub const REDACTION_SENTINEL: &str = "<__mozi_redacted__>";

const MAX_INCLUDE_DEPTH: usize = 8;
const MAX_BACKUPS: usize = 5;

/// Names ending in any of these suffixes (case-insensitive) are treated as
/// sensitive and are eligible for sentinel substitution.
const SENSITIVE_SUFFIXES: &[&str] = &["apikey", "bottoken", "secret"];

pub(crate) fn is_sensitive_field(name: &str) -> bool {
    let lower = name.to_lowercase();
    SENSITIVE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

/// `snapshot(path)` result: on-disk bytes plus a fully loaded config, without
/// mutating anything.
pub struct Snapshot {
    pub path: PathBuf,
    pub exists: bool,
    pub raw: String,
    pub raw_hash: String,
    pub load_result: LoadOutcome,
}

#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Success(Box<Config>),
    Failure(Vec<String>),
}

pub fn raw_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

/// `snapshot(path)` (spec §4.C).
pub fn snapshot(path: &Path) -> StoreResult<Snapshot> {
    let exists = path.is_file();
    let raw = if exists {
        fs::read_to_string(path)?
    } else {
        String::new()
    };
    let raw_hash = raw_hash(raw.as_bytes());
    let load_result = if exists {
        load(path)
    } else {
        LoadOutcome::Failure(vec!["config file does not exist".to_string()])
    };
    Ok(Snapshot {
        path: path.to_path_buf(),
        exists,
        raw,
        raw_hash,
        load_result,
    })
}

/// `load(path)` (spec §4.C): parse JSONC, resolve `$include`, substitute env
/// vars, apply defaults, validate. Never mutates the file.
pub fn load(path: &Path) -> LoadOutcome {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => return LoadOutcome::Failure(vec![format!("reading {}: {e}", path.display())]),
    };
    load_str(&raw, path.parent().unwrap_or_else(|| Path::new(".")))
}

pub fn load_str(raw: &str, base_dir: &Path) -> LoadOutcome {
    let parsed = match parse_jsonc(raw) {
        Ok(v) => v,
        Err(e) => return LoadOutcome::Failure(vec![e]),
    };
    let included = match resolve_includes(parsed, base_dir, 0) {
        Ok(v) => v,
        Err(e) => return LoadOutcome::Failure(vec![e]),
    };
    let substituted = substitute_env_refs(included);
    let defaulted = apply_defaults(substituted);

    match serde_json::from_value::<Config>(defaulted) {
        Ok(config) => match validate(&config) {
            Ok(()) => LoadOutcome::Success(Box::new(config)),
            Err(errors) => LoadOutcome::Failure(errors),
        },
        Err(e) => LoadOutcome::Failure(vec![format!("schema mismatch: {e}")]),
    }
}

fn parse_jsonc(text: &str) -> Result<Value, String> {
    if text.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    jsonc_parser::parse_to_serde_value(text, &jsonc_parser::ParseOptions::default())
        .map_err(|e| format!("JSONC parse error: {e}"))?
        .ok_or_else(|| "empty JSONC document".to_string())
}

/// Depth-limited deep merge of `$include` directives: arrays concatenate,
/// objects merge key-wise, scalars are overwritten by the including
/// document. This is the one place mozi's merge semantics diverge from the
/// teacher's `merge_yaml`, which only ever overwrites scalars.
fn resolve_includes(value: Value, base_dir: &Path, depth: usize) -> Result<Value, String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err("$include depth limit exceeded".to_string());
    }
    match value {
        Value::Object(mut map) => {
            let include_paths: Vec<String> = match map.remove("$include") {
                Some(Value::String(s)) => vec![s],
                Some(Value::Array(items)) => items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect(),
                Some(_) => return Err("$include must be a string or array of strings".to_string()),
                None => Vec::new(),
            };

            let mut merged = Value::Object(serde_json::Map::new());
            for include_path in include_paths {
                let full_path = base_dir.join(&include_path);
                let included_raw = fs::read_to_string(&full_path)
                    .map_err(|e| format!("reading $include {}: {e}", full_path.display()))?;
                let included_value = parse_jsonc(&included_raw)?;
                let included_resolved = resolve_includes(
                    included_value,
                    full_path.parent().unwrap_or(base_dir),
                    depth + 1,
                )?;
                deep_merge(&mut merged, included_resolved);
            }

            deep_merge(&mut merged, Value::Object(map));
            // Recurse into nested objects/arrays for nested $include use.
            if let Value::Object(ref mut m) = merged {
                for (_, v) in m.iter_mut() {
                    *v = resolve_includes(v.take(), base_dir, depth + 1)?;
                }
            }
            Ok(merged)
        }
        Value::Array(items) => {
            let resolved: Result<Vec<Value>, String> = items
                .into_iter()
                .map(|v| resolve_includes(v, base_dir, depth + 1))
                .collect();
            Ok(Value::Array(resolved?))
        }
        other => Ok(other),
    }
}

/// Deep-merge `src` into `dst` in place: objects merge key-wise, arrays
/// concatenate, scalars are overwritten by `src`.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (Value::Array(d), Value::Array(s)) => d.extend(s),
        (dst, src) => *dst = src,
    }
}

/// Substitute `${ENV_VAR}` references in string leaves. Unresolved
/// references are left verbatim rather than failing the load — a missing
/// credential should surface when the value is actually used, not here.
fn substitute_env_refs(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_env_string(&s)),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute_env_refs(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(substitute_env_refs).collect()),
        other => other,
    }
}

fn substitute_env_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var_name = &after[..end];
                if let Ok(value) = std::env::var(var_name) {
                    out.push_str(&value);
                } else {
                    out.push_str(&rest[start..start + 2 + end + 1]);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand `~` in `paths.baseDir` and fill in `logging.level` when absent.
/// Most defaults are handled by `#[serde(default)]` at deserialize time;
/// this covers the handful that need runtime context (home directory).
fn apply_defaults(mut value: Value) -> Value {
    if let Value::Object(ref mut root) = value {
        if let Some(Value::Object(paths)) = root.get_mut("paths") {
            if let Some(Value::String(base_dir)) = paths.get_mut("baseDir").or_else(|| paths.get_mut("base_dir")) {
                if let Some(stripped) = base_dir.strip_prefix('~') {
                    if let Some(home) = dirs::home_dir() {
                        *base_dir = home.join(stripped.trim_start_matches('/')).display().to_string();
                    }
                }
            }
        }
    }
    value
}

fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    for (key, agent) in &config.agents {
        if agent.agent_id.is_empty() {
            errors.push(format!("agents.{key}: agentId must not be empty"));
        }
        if agent.primary_response_model.is_empty() {
            errors.push(format!("agents.{key}: primaryResponseModel must not be empty"));
        }
    }
    for (key, model) in &config.models {
        if model.provider_id.is_empty() {
            errors.push(format!("models.{key}: providerId must not be empty"));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// `writeRawAtomic(path, newText, {expectedRawHash?})` (spec §4.C).
pub fn write_raw_atomic(path: &Path, new_text: &str, expected_raw_hash: Option<&str>) -> StoreResult<String> {
    let current_raw = if path.is_file() {
        fs::read_to_string(path)?
    } else {
        String::new()
    };
    let current_hash = raw_hash(current_raw.as_bytes());

    if let Some(expected) = expected_raw_hash {
        if expected != current_hash {
            return Err(StoreError::ConfigConflict {
                expected: expected.to_string(),
                actual: current_hash,
            });
        }
    }

    if path.is_file() {
        backup_and_prune(path)?;
    }

    let tmp_path = append_suffix(path, ".tmp");
    fs::write(&tmp_path, new_text)?;
    fs::rename(&tmp_path, path)?;

    Ok(raw_hash(new_text.as_bytes()))
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn backup_and_prune(path: &Path) -> StoreResult<()> {
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let backup_path = append_suffix(path, &format!(".bak.{timestamp}"));
    fs::copy(path, &backup_path)?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default().to_string();
    let prefix = format!("{file_name}.bak.");

    let mut backups: Vec<PathBuf> = fs::read_dir(parent)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix))
                .unwrap_or(false)
        })
        .collect();
    backups.sort();

    while backups.len() > MAX_BACKUPS {
        let oldest = backups.remove(0);
        let _ = fs::remove_file(oldest);
    }
    Ok(())
}

/// Apply the redaction sentinel: wherever a sensitive field in `new_value`
/// holds [`REDACTION_SENTINEL`], substitute the value currently on disk at
/// the same path. Fails the whole write if no prior value exists.
pub fn apply_redaction_sentinel(new_value: &mut Value, current_value: &Value) -> StoreResult<()> {
    apply_redaction_sentinel_at(new_value, current_value, "")
}

fn apply_redaction_sentinel_at(new_value: &mut Value, current_value: &Value, path: &str) -> StoreResult<()> {
    if let Value::Object(map) = new_value {
        for (key, val) in map.iter_mut() {
            let field_path = if path.is_empty() {
                key.clone()
            } else {
                format!("{path}.{key}")
            };
            if let Value::String(s) = val {
                if is_sensitive_field(key) && s == REDACTION_SENTINEL {
                    let existing = current_value.pointer(&format!("/{}", field_path.replace('.', "/")));
                    match existing {
                        Some(Value::String(prior)) => {
                            *s = prior.clone();
                        }
                        _ => {
                            return Err(StoreError::MissingSensitive { field: field_path });
                        }
                    }
                    continue;
                }
            }
            apply_redaction_sentinel_at(val, current_value, &field_path)?;
        }
    }
    Ok(())
}

/// Navigate to `path` (dot-separated object keys) and set it to `value`,
/// creating intermediate objects as needed.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    set_path_segments(root, &segments, value);
}

fn set_path_segments(root: &mut Value, segments: &[&str], value: Value) {
    match segments {
        [] => *root = value,
        [head, rest @ ..] => {
            if !root.is_object() {
                *root = Value::Object(serde_json::Map::new());
            }
            let map = root.as_object_mut().expect("just ensured object");
            let entry = map.entry(head.to_string()).or_insert(Value::Object(serde_json::Map::new()));
            set_path_segments(entry, rest, value);
        }
    }
}

/// Remove `path` (dot-separated object keys). No-op if the path doesn't
/// exist.
pub fn unset_path(root: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    unset_path_segments(root, &segments);
}

fn unset_path_segments(root: &mut Value, segments: &[&str]) {
    match segments {
        [] => {}
        [only] => {
            if let Value::Object(map) = root {
                map.remove(*only);
            }
        }
        [head, rest @ ..] => {
            if let Value::Object(map) = root {
                if let Some(child) = map.get_mut(*head) {
                    unset_path_segments(child, rest);
                }
            }
        }
    }
}
