// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session Store (spec §4.D): keyed session state persisted via a manifest
//! file (`sessions.json`) and per-segment JSONL transcript files under
//! `{baseDir}/sessions/{agentId}/{sessionId}.jsonl`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs4::fs_std::FileExt;
use mozi_model::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::session::{
    HeaderKind, MessageRecord, MessageRecordKind, SegmentRecord, SessionChanges, SessionHeader,
    SessionRecord, SessionState, TranscriptLine,
};

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// `sessions.json` shape: an object keyed by `sessionKey`.
type Manifest = HashMap<String, SessionRecord>;

/// Owns the on-disk manifest and per-segment transcript files, plus an
/// in-memory cache of parsed session state. One instance should be shared
/// per process; the Agent Registry is responsible for serializing
/// concurrent turns for the same `sessionKey`.
pub struct SessionStore {
    base_dir: PathBuf,
    cache: Mutex<HashMap<String, SessionState>>,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.base_dir.join("sessions").join("sessions.json")
    }

    fn segment_path(&self, agent_id: &str, session_id: &str) -> PathBuf {
        self.base_dir
            .join("sessions")
            .join(agent_id)
            .join(format!("{session_id}.jsonl"))
    }

    /// Read the manifest, taking a shared lock so we never observe a
    /// half-written rename from another process.
    fn read_manifest(&self) -> CoreResult<Manifest> {
        let path = self.manifest_path();
        if !path.is_file() {
            return Ok(Manifest::new());
        }
        let file = File::open(&path)?;
        FileExt::lock_shared(&file)?;
        let raw = fs::read_to_string(&path)?;
        FileExt::unlock(&file)?;
        if raw.trim().is_empty() {
            return Ok(Manifest::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write the manifest atomically: serialize to a temp file in the same
    /// directory, take an exclusive lock on the destination, then rename.
    fn write_manifest(&self, manifest: &Manifest) -> CoreResult<()> {
        let path = self.manifest_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = {
            let mut p = path.clone().into_os_string();
            p.push(".tmp");
            PathBuf::from(p)
        };
        let body = serde_json::to_string_pretty(manifest)?;
        fs::write(&tmp_path, body)?;

        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        FileExt::lock_exclusive(&lock_file)?;
        let result = fs::rename(&tmp_path, &path);
        FileExt::unlock(&lock_file)?;
        result?;
        Ok(())
    }

    fn read_segment_messages(&self, path: &Path) -> CoreResult<Vec<Message>> {
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut messages = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if idx == 0 {
                // Header line; validated separately when needed.
                continue;
            }
            match serde_json::from_str::<TranscriptLine>(&line) {
                Ok(TranscriptLine::Message(MessageRecord { message, .. })) => messages.push(message),
                Ok(TranscriptLine::Header(_)) => {
                    warn!(path = %path.display(), line = idx, "unexpected header mid-file");
                }
                Err(e) => warn!(path = %path.display(), line = idx, error = %e, "skipping unparsable transcript line"),
            }
        }
        Ok(messages)
    }

    /// Rewrite a segment file in full as `[header, ...messages]`. Refuses
    /// to touch archived segments.
    fn write_segment_file(
        &self,
        path: &Path,
        header: &SessionHeader,
        messages: &[Message],
    ) -> CoreResult<()> {
        if header.archived == Some(true) {
            return Err(CoreError::ArchivedSegment(header.session_id.clone()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = String::new();
        out.push_str(&serde_json::to_string(&TranscriptLine::Header(header.clone()))?);
        out.push('\n');
        for message in messages {
            let record = TranscriptLine::Message(MessageRecord {
                kind: MessageRecordKind::Message,
                message: message.clone(),
            });
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
        }
        let tmp_path = {
            let mut p = path.as_os_str().to_owned();
            p.push(".tmp");
            PathBuf::from(p)
        };
        fs::write(&tmp_path, out)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn header_for(&self, record: &SessionRecord, segment: &SegmentRecord) -> SessionHeader {
        SessionHeader {
            kind: HeaderKind::Session,
            session_id: segment.id.clone(),
            session_key: record.session_key.clone(),
            agent_id: record.agent_id.clone(),
            created_at: segment.created_at.clone(),
            updated_at: Some(segment.updated_at.clone()),
            archived: Some(segment.archived),
            prev_session_id: segment.prev_session_id.clone(),
            next_session_id: segment.next_session_id.clone(),
            model: record.model.clone(),
            metadata: if record.metadata.is_null() {
                None
            } else {
                Some(record.metadata.clone())
            },
        }
    }

    /// In-memory lookup only; does not touch disk.
    pub fn get(&self, session_key: &str) -> Option<SessionState> {
        self.cache.lock().unwrap().get(session_key).cloned()
    }

    /// Return the cached state if present, otherwise load it from disk (or
    /// create it if the manifest has no record for this key either).
    pub fn get_or_create(&self, session_key: &str, agent_id: &str) -> CoreResult<SessionState> {
        if let Some(state) = self.get(session_key) {
            return Ok(state);
        }

        let mut manifest = self.read_manifest()?;
        let state = if let Some(record) = manifest.get(session_key).cloned() {
            let latest = record
                .segments
                .get(&record.latest_session_id)
                .cloned()
                .ok_or_else(|| CoreError::InvalidSessionKey(session_key.to_string()))?;
            let path = self.segment_path(&record.agent_id, &latest.id);
            let context = self.read_segment_messages(&path)?;
            SessionState { record, context }
        } else {
            let now = now_iso();
            let segment_id = Uuid::new_v4().to_string();
            let segment = SegmentRecord {
                id: segment_id.clone(),
                archived: false,
                created_at: now.clone(),
                updated_at: now.clone(),
                prev_session_id: None,
                next_session_id: None,
                summary: None,
            };
            let mut segments = HashMap::new();
            segments.insert(segment_id.clone(), segment.clone());
            let record = SessionRecord {
                session_key: session_key.to_string(),
                agent_id: agent_id.to_string(),
                created_at: now.clone(),
                updated_at: now,
                model: None,
                metadata: serde_json::Value::Null,
                latest_session_id: segment_id.clone(),
                history_session_ids: Vec::new(),
                segments,
            };

            let header = self.header_for(&record, &segment);
            let path = self.segment_path(agent_id, &segment_id);
            self.write_segment_file(&path, &header, &[])?;

            manifest.insert(session_key.to_string(), record.clone());
            self.write_manifest(&manifest)?;
            debug!(session_key, segment_id, "created new session");
            SessionState {
                record,
                context: Vec::new(),
            }
        };

        self.cache
            .lock()
            .unwrap()
            .insert(session_key.to_string(), state.clone());
        Ok(state)
    }

    /// Merge `changes` into cached state; if `context` is set, rewrite the
    /// latest segment file. Always stamps `updatedAt`.
    pub fn update(&self, session_key: &str, changes: SessionChanges) -> CoreResult<SessionState> {
        let mut cache = self.cache.lock().unwrap();
        let state = cache
            .get_mut(session_key)
            .ok_or_else(|| CoreError::InvalidSessionKey(session_key.to_string()))?;

        let now = now_iso();
        if let Some(model) = changes.model {
            state.record.model = Some(model);
        }
        if let Some(metadata) = changes.metadata {
            state.record.metadata = metadata;
        }
        state.record.updated_at = now.clone();

        let latest_id = state.record.latest_session_id.clone();
        if let Some(segment) = state.record.segments.get_mut(&latest_id) {
            segment.updated_at = now;
        }

        if let Some(context) = changes.context {
            state.context = context;
            let segment = state
                .record
                .segments
                .get(&latest_id)
                .cloned()
                .ok_or_else(|| CoreError::InvalidSessionKey(session_key.to_string()))?;
            let header = self.header_for(&state.record, &segment);
            let path = self.segment_path(&state.record.agent_id, &latest_id);
            self.write_segment_file(&path, &header, &state.context)?;
        }

        let mut manifest = self.read_manifest()?;
        manifest.insert(session_key.to_string(), state.record.clone());
        self.write_manifest(&manifest)?;

        Ok(state.clone())
    }

    /// Archive the current latest segment, create a fresh one, link
    /// `prev↔next`, and clear the in-memory context.
    pub fn rotate_segment(&self, session_key: &str, agent_id: &str) -> CoreResult<SessionState> {
        let mut cache = self.cache.lock().unwrap();
        let state = cache
            .get_mut(session_key)
            .ok_or_else(|| CoreError::InvalidSessionKey(session_key.to_string()))?;

        let now = now_iso();
        let old_id = state.record.latest_session_id.clone();
        let new_id = Uuid::new_v4().to_string();
        if new_id == old_id {
            return Err(CoreError::InvalidSessionKey(session_key.to_string()));
        }

        {
            let old_segment = state
                .record
                .segments
                .get_mut(&old_id)
                .ok_or_else(|| CoreError::InvalidSessionKey(session_key.to_string()))?;
            old_segment.archived = true;
            old_segment.next_session_id = Some(new_id.clone());
            old_segment.updated_at = now.clone();
            let header = self.header_for(
                &SessionRecord {
                    session_key: state.record.session_key.clone(),
                    agent_id: state.record.agent_id.clone(),
                    created_at: state.record.created_at.clone(),
                    updated_at: now.clone(),
                    model: state.record.model.clone(),
                    metadata: state.record.metadata.clone(),
                    latest_session_id: old_id.clone(),
                    history_session_ids: state.record.history_session_ids.clone(),
                    segments: state.record.segments.clone(),
                },
                old_segment,
            );
            let path = self.segment_path(agent_id, &old_id);
            // Archived segments are never rewritten again after this point;
            // this final write stamps `archived=true` on the header.
            self.write_segment_file_archiving(&path, &header, &state.context)?;
        }

        let new_segment = SegmentRecord {
            id: new_id.clone(),
            archived: false,
            created_at: now.clone(),
            updated_at: now.clone(),
            prev_session_id: Some(old_id.clone()),
            next_session_id: None,
            summary: None,
        };
        state.record.segments.insert(new_id.clone(), new_segment.clone());
        state.record.history_session_ids.push(old_id);
        state.record.latest_session_id = new_id.clone();
        state.record.updated_at = now.clone();
        state.context = Vec::new();

        let header = self.header_for(&state.record, &new_segment);
        let new_path = self.segment_path(agent_id, &new_id);
        self.write_segment_file(&new_path, &header, &[])?;

        let mut manifest = self.read_manifest()?;
        manifest.insert(session_key.to_string(), state.record.clone());
        self.write_manifest(&manifest)?;

        debug!(session_key, old_segment = %new_id, "rotated segment");
        Ok(state.clone())
    }

    /// Internal helper: the one write a segment file takes after becoming
    /// archived, distinct from `write_segment_file` which refuses archived
    /// targets (every subsequent call must be rejected).
    fn write_segment_file_archiving(
        &self,
        path: &Path,
        header: &SessionHeader,
        messages: &[Message],
    ) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = String::new();
        out.push_str(&serde_json::to_string(&TranscriptLine::Header(header.clone()))?);
        out.push('\n');
        for message in messages {
            let record = TranscriptLine::Message(MessageRecord {
                kind: MessageRecordKind::Message,
                message: message.clone(),
            });
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
        }
        let tmp_path = {
            let mut p = path.as_os_str().to_owned();
            p.push(".tmp");
            PathBuf::from(p)
        };
        fs::write(&tmp_path, out)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Requires the latest segment to have a `prevSessionId`. Concatenates
    /// the previous segment's messages with the current latest's into the
    /// previous segment's file, archives the current latest, and makes the
    /// previous segment the new latest (clearing its `nextSessionId`).
    pub fn revert_to_previous_segment(
        &self,
        session_key: &str,
        agent_id: &str,
    ) -> CoreResult<SessionState> {
        let mut cache = self.cache.lock().unwrap();
        let state = cache
            .get_mut(session_key)
            .ok_or_else(|| CoreError::InvalidSessionKey(session_key.to_string()))?;

        let latest_id = state.record.latest_session_id.clone();
        let prev_id = state
            .record
            .segments
            .get(&latest_id)
            .and_then(|s| s.prev_session_id.clone())
            .ok_or_else(|| CoreError::NoPreviousSegment(session_key.to_string()))?;

        let prev_path = self.segment_path(agent_id, &prev_id);
        let mut combined = self.read_segment_messages(&prev_path)?;
        combined.extend(state.context.clone());

        let now = now_iso();

        // Archive the current latest in place before handing its in-memory
        // content to the previous segment.
        {
            let latest_segment = state
                .record
                .segments
                .get_mut(&latest_id)
                .ok_or_else(|| CoreError::InvalidSessionKey(session_key.to_string()))?;
            latest_segment.archived = true;
            latest_segment.updated_at = now.clone();
        }
        {
            let latest_segment = state.record.segments.get(&latest_id).cloned().unwrap();
            let header = self.header_for(&state.record, &latest_segment);
            let path = self.segment_path(agent_id, &latest_id);
            self.write_segment_file_archiving(&path, &header, &state.context)?;
        }

        {
            let prev_segment = state
                .record
                .segments
                .get_mut(&prev_id)
                .ok_or_else(|| CoreError::InvalidSessionKey(session_key.to_string()))?;
            prev_segment.archived = false;
            prev_segment.next_session_id = None;
            prev_segment.updated_at = now.clone();
        }

        state.record.latest_session_id = prev_id.clone();
        state.record.updated_at = now.clone();
        state.context = combined.clone();

        let prev_segment = state.record.segments.get(&prev_id).cloned().unwrap();
        let header = self.header_for(&state.record, &prev_segment);
        self.write_segment_file(&prev_path, &header, &combined)?;

        let mut manifest = self.read_manifest()?;
        manifest.insert(session_key.to_string(), state.record.clone());
        self.write_manifest(&manifest)?;

        debug!(session_key, reverted_to = %prev_id, "reverted to previous segment");
        Ok(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mozi_model::Message;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        (dir, store)
    }

    // ── getOrCreate ──

    #[test]
    fn get_or_create_makes_empty_segment_then_reuses_it() {
        let (_dir, store) = store();
        let key = "agent:mozi:telegram:dm:user1";
        let first = store.get_or_create(key, "mozi").unwrap();
        assert!(first.context.is_empty());
        let second = store.get_or_create(key, "mozi").unwrap();
        assert_eq!(first.record.latest_session_id, second.record.latest_session_id);
    }

    #[test]
    fn get_is_in_memory_only_until_get_or_create_runs() {
        let (_dir, store) = store();
        let key = "agent:mozi:telegram:dm:user1";
        assert!(store.get(key).is_none());
        store.get_or_create(key, "mozi").unwrap();
        assert!(store.get(key).is_some());
    }

    // ── update ──

    #[test]
    fn update_rewrites_latest_segment_and_matches_in_memory_context() {
        let (_dir, store) = store();
        let key = "agent:mozi:telegram:dm:user1";
        store.get_or_create(key, "mozi").unwrap();
        let messages = vec![Message::user("hello", "2026-01-01T00:00:00Z")];
        let state = store
            .update(
                key,
                SessionChanges {
                    context: Some(messages.clone()),
                    ..Default::default()
                },
            )
            .unwrap();

        let path = store.segment_path("mozi", &state.record.latest_session_id);
        let on_disk = store.read_segment_messages(&path).unwrap();
        assert_eq!(on_disk.len(), state.context.len());
        assert_eq!(state.context.len(), messages.len());
    }

    // ── rotateSegment ──

    #[test]
    fn rotate_produces_distinct_id_and_archives_previous() {
        let (_dir, store) = store();
        let key = "agent:mozi:telegram:dm:user1";
        let before = store.get_or_create(key, "mozi").unwrap();
        let old_id = before.record.latest_session_id.clone();

        let after = store.rotate_segment(key, "mozi").unwrap();
        assert_ne!(after.record.latest_session_id, old_id);
        assert!(after.record.history_session_ids.contains(&old_id));
        assert!(after.context.is_empty());

        let old_segment = after.record.segments.get(&old_id).unwrap();
        assert!(old_segment.archived);
        assert_eq!(old_segment.next_session_id.as_deref(), Some(after.record.latest_session_id.as_str()));

        let new_segment = after.record.segments.get(&after.record.latest_session_id).unwrap();
        assert_eq!(new_segment.prev_session_id.as_deref(), Some(old_id.as_str()));
    }

    #[test]
    fn archived_segment_file_is_byte_immutable_after_rotation() {
        let (_dir, store) = store();
        let key = "agent:mozi:telegram:dm:user1";
        let before = store.get_or_create(key, "mozi").unwrap();
        store
            .update(
                key,
                SessionChanges {
                    context: Some(vec![Message::user("before rotation", "2026-01-01T00:00:00Z")]),
                    ..Default::default()
                },
            )
            .unwrap();
        let old_id = before.record.latest_session_id.clone();
        let old_path = store.segment_path("mozi", &old_id);
        let before_bytes = fs::read(&old_path).unwrap();

        store.rotate_segment(key, "mozi").unwrap();
        store
            .update(
                key,
                SessionChanges {
                    context: Some(vec![Message::user("after rotation", "2026-01-01T00:00:01Z")]),
                    ..Default::default()
                },
            )
            .unwrap();

        let after_bytes = fs::read(&old_path).unwrap();
        assert_eq!(before_bytes, after_bytes);
    }

    #[test]
    fn repeated_rotation_keeps_chain_integrity() {
        let (_dir, store) = store();
        let key = "agent:mozi:telegram:dm:user1";
        store.get_or_create(key, "mozi").unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let state = store.rotate_segment(key, "mozi").unwrap();
            ids.push(state.record.latest_session_id.clone());
        }
        assert_eq!(ids.iter().collect::<std::collections::HashSet<_>>().len(), 3);
        let final_state = store.get(key).unwrap();
        for (i, id) in final_state.record.history_session_ids.iter().enumerate() {
            if i + 1 < final_state.record.history_session_ids.len() {
                let seg = final_state.record.segments.get(id).unwrap();
                assert_eq!(
                    seg.next_session_id.as_deref(),
                    Some(final_state.record.history_session_ids[i + 1].as_str())
                );
            }
        }
    }

    // ── revertToPreviousSegment ──

    #[test]
    fn revert_requires_prev_session_id() {
        let (_dir, store) = store();
        let key = "agent:mozi:telegram:dm:user1";
        store.get_or_create(key, "mozi").unwrap();
        let result = store.revert_to_previous_segment(key, "mozi");
        assert!(matches!(result, Err(CoreError::NoPreviousSegment(_))));
    }

    #[test]
    fn revert_concatenates_messages_and_clears_next_id() {
        let (_dir, store) = store();
        let key = "agent:mozi:telegram:dm:user1";
        store.get_or_create(key, "mozi").unwrap();
        store
            .update(
                key,
                SessionChanges {
                    context: Some(vec![Message::user("first segment", "2026-01-01T00:00:00Z")]),
                    ..Default::default()
                },
            )
            .unwrap();
        let s1 = store.get(key).unwrap();
        let s1_id = s1.record.latest_session_id.clone();

        store.rotate_segment(key, "mozi").unwrap();
        store
            .update(
                key,
                SessionChanges {
                    context: Some(vec![Message::user("second segment", "2026-01-01T00:00:01Z")]),
                    ..Default::default()
                },
            )
            .unwrap();

        let reverted = store.revert_to_previous_segment(key, "mozi").unwrap();
        assert_eq!(reverted.record.latest_session_id, s1_id);
        assert_eq!(reverted.context.len(), 2);
        let seg = reverted.record.segments.get(&s1_id).unwrap();
        assert_eq!(seg.next_session_id, None);
        assert!(!seg.archived);
    }
}
