// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `set` / `unset` / `patch` / `apply` (spec §4.C): deep-clone the parsed
//! in-memory representation, apply the mutation, validate with schema,
//! write atomically. Every mutation is transactional — on any failure the
//! on-disk file is untouched.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{self, LoadOutcome};

/// One step of a `apply(operations[])` batch.
#[derive(Debug, Clone)]
pub enum ConfigOp {
    Set { path: String, value: Value },
    Unset { path: String },
    Patch { value: Value },
}

fn read_current(path: &Path) -> StoreResult<(String, Value)> {
    let raw = if path.is_file() {
        std::fs::read_to_string(path)?
    } else {
        "{}".to_string()
    };
    let parsed = if raw.trim().is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        jsonc_parser::parse_to_serde_value(&raw, &jsonc_parser::ParseOptions::default())
            .map_err(|e| StoreError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    };
    Ok((raw, parsed))
}

fn validate_and_serialize(candidate: &Value) -> StoreResult<String> {
    let load = crate::store::load_str(&serde_json::to_string(candidate).unwrap_or_default(), Path::new("."));
    match load {
        LoadOutcome::Success(_) => {}
        LoadOutcome::Failure(errors) => return Err(StoreError::Validation(errors)),
    }
    serde_json::to_string_pretty(candidate).map_err(|e| StoreError::Validation(vec![e.to_string()]))
}

fn apply_one(candidate: &mut Value, current_on_disk: &Value, op: &ConfigOp) -> StoreResult<()> {
    match op {
        ConfigOp::Set { path, value } => {
            let mut value = value.clone();
            let leaf_key = path.rsplit('.').next().unwrap_or(path);
            if let Value::String(s) = &value {
                if store::is_sensitive_field(leaf_key) && s == store::REDACTION_SENTINEL {
                    let pointer = format!("/{}", path.replace('.', "/"));
                    match current_on_disk.pointer(&pointer) {
                        Some(Value::String(prior)) => value = Value::String(prior.clone()),
                        _ => {
                            return Err(StoreError::MissingSensitive {
                                field: path.clone(),
                            })
                        }
                    }
                }
            }
            store::set_path(candidate, path, value);
            Ok(())
        }
        ConfigOp::Unset { path } => {
            store::unset_path(candidate, path);
            Ok(())
        }
        ConfigOp::Patch { value } => {
            let mut patch = value.clone();
            store::apply_redaction_sentinel(&mut patch, current_on_disk)?;
            merge_patch(candidate, patch);
            Ok(())
        }
    }
}

fn merge_patch(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(existing) => merge_patch(existing, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Apply a batch of operations left-to-right. Aborts on the first error,
/// leaving the on-disk file untouched.
pub fn apply(path: &Path, operations: &[ConfigOp], expected_raw_hash: Option<&str>) -> StoreResult<String> {
    let (raw, current) = read_current(path)?;
    let current_hash = store::raw_hash(raw.as_bytes());
    if let Some(expected) = expected_raw_hash {
        if expected != current_hash {
            return Err(StoreError::ConfigConflict {
                expected: expected.to_string(),
                actual: current_hash,
            });
        }
    }

    let mut candidate = current.clone();
    for op in operations {
        apply_one(&mut candidate, &current, op)?;
    }

    let new_text = validate_and_serialize(&candidate)?;
    debug!(path = %path.display(), ops = operations.len(), "writing config");
    store::write_raw_atomic(path, &new_text, expected_raw_hash)
}

pub fn set(path: &Path, field_path: &str, value: Value, expected_raw_hash: Option<&str>) -> StoreResult<String> {
    apply(path, &[ConfigOp::Set { path: field_path.to_string(), value }], expected_raw_hash)
}

pub fn unset(path: &Path, field_path: &str, expected_raw_hash: Option<&str>) -> StoreResult<String> {
    apply(path, &[ConfigOp::Unset { path: field_path.to_string() }], expected_raw_hash)
}

pub fn patch(path: &Path, value: Value, expected_raw_hash: Option<&str>) -> StoreResult<String> {
    apply(path, &[ConfigOp::Patch { value }], expected_raw_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn set_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.jsonc");
        fs::write(&path, "{}").unwrap();
        set(&path, "logging.level", serde_json::json!("debug"), None).unwrap();
        match crate::store::load(&path) {
            LoadOutcome::Success(cfg) => assert_eq!(cfg.logging.level, "debug"),
            LoadOutcome::Failure(errs) => panic!("{errs:?}"),
        }
    }

    #[test]
    fn apply_aborts_whole_batch_on_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.jsonc");
        fs::write(&path, "{}").unwrap();
        let before = fs::read_to_string(&path).unwrap();

        let ops = vec![
            ConfigOp::Set {
                path: "logging.level".to_string(),
                value: serde_json::json!("debug"),
            },
            ConfigOp::Patch {
                value: serde_json::json!({"models": {"m": {"apiKey": store::REDACTION_SENTINEL}}}),
            },
        ];
        let result = apply(&path, &ops, None);
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn unset_removes_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.jsonc");
        fs::write(&path, r#"{"paths": {"baseDir": "/tmp/x"}}"#).unwrap();
        unset(&path, "paths.baseDir", None).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("baseDir"));
    }

    #[test]
    fn set_rejects_stale_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.jsonc");
        fs::write(&path, "{}").unwrap();
        let result = set(&path, "logging.level", serde_json::json!("debug"), Some("stale"));
        assert!(matches!(result, Err(StoreError::ConfigConflict { .. })));
    }
}
