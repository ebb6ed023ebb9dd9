// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session key grammar and the in-memory/on-disk session shapes (spec §3,
//! §4.D). A session is identified by a composite key
//! `agent:{agentId}:{channelId}[:{accountId}]:{peerType}:{peerId}[:thread:{threadId}]`
//! and consists of an archived segment chain plus one active "latest"
//! segment. Segments are the unit of rotation and revert.

use std::collections::HashMap;

use mozi_model::Message;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// `dm` or `group`, the peer-type component of a session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    Dm,
    Group,
}

impl PeerType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "dm" => Some(Self::Dm),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Parsed view of a `sessionKey` string. The canonical form is always the
/// original string; this is a read-only decomposition of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyParts {
    pub agent_id: String,
    pub channel_id: String,
    pub account_id: Option<String>,
    pub peer_type: PeerType,
    pub peer_id: String,
    pub thread_id: Option<String>,
}

/// Parse a `sessionKey` into its components.
///
/// Grammar: `agent:{agentId}:{channelId}[:{accountId}]:{peerType}:{peerId}[:thread:{threadId}]`.
/// The optional `accountId` segment is disambiguated from `peerType` by
/// checking whether the next-but-one segment is a recognized peer type.
pub fn parse_session_key(key: &str) -> CoreResult<SessionKeyParts> {
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() < 5 || parts[0] != "agent" {
        return Err(CoreError::InvalidSessionKey(key.to_string()));
    }
    let agent_id = parts[1].to_string();
    let channel_id = parts[2].to_string();

    // parts[3] is either accountId (parts[4] is peerType) or peerType itself.
    let (account_id, peer_type_idx) = if PeerType::parse(parts[3]).is_some() {
        (None, 3)
    } else if parts.len() > 4 && PeerType::parse(parts[4]).is_some() {
        (Some(parts[3].to_string()), 4)
    } else {
        return Err(CoreError::InvalidSessionKey(key.to_string()));
    };

    let peer_type = PeerType::parse(parts[peer_type_idx])
        .ok_or_else(|| CoreError::InvalidSessionKey(key.to_string()))?;
    let peer_id_idx = peer_type_idx + 1;
    if peer_id_idx >= parts.len() {
        return Err(CoreError::InvalidSessionKey(key.to_string()));
    }

    // A trailing `:thread:{threadId}` may follow the peer id, and the peer
    // id itself may never contain a literal "thread" marker segment.
    let rest = &parts[peer_id_idx..];
    let (peer_id, thread_id) = match rest.iter().position(|s| *s == "thread") {
        Some(pos) if pos > 0 && pos + 1 < rest.len() => {
            (rest[..pos].join(":"), Some(rest[pos + 1..].join(":")))
        }
        _ => (rest.join(":"), None),
    };

    Ok(SessionKeyParts {
        agent_id,
        channel_id,
        account_id,
        peer_type,
        peer_id,
        thread_id,
    })
}

/// `:dm:` substring check, per spec.
pub fn is_dm_session_key(key: &str) -> bool {
    key.contains(":dm:")
}

/// Segment after `:dm:`, stripped of any trailing `:thread:…`.
pub fn extract_dm_peer_id(key: &str) -> Option<String> {
    let idx = key.find(":dm:")?;
    let rest = &key[idx + ":dm:".len()..];
    let peer = rest.split(":thread:").next().unwrap_or(rest);
    if peer.is_empty() {
        None
    } else {
        Some(peer.to_string())
    }
}

/// Line 1 of every segment transcript file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    #[serde(rename = "type")]
    pub kind: HeaderKind,
    pub session_id: String,
    pub session_key: String,
    pub agent_id: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderKind {
    Session,
}

/// Line 2..N of a segment transcript file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(rename = "type")]
    pub kind: MessageRecordKind,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRecordKind {
    Message,
}

/// A transcript line is either the header or a message record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TranscriptLine {
    Header(SessionHeader),
    Message(MessageRecord),
}

/// Per-segment bookkeeping kept in the manifest (everything except the
/// message content, which lives in the segment's own `.jsonl` file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: String,
    pub archived: bool,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// One manifest (`sessions.json`) entry: keyed session metadata plus the
/// ordered history of prior segment ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_key: String,
    pub agent_id: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub latest_session_id: String,
    #[serde(default)]
    pub history_session_ids: Vec<String>,
    #[serde(default)]
    pub segments: HashMap<String, SegmentRecord>,
}

/// The full in-memory session state returned by `getOrCreate`/`update`:
/// manifest metadata plus the parsed transcript of the latest segment.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub record: SessionRecord,
    pub context: Vec<Message>,
}

impl SessionState {
    pub fn latest_segment(&self) -> Option<&SegmentRecord> {
        self.record.segments.get(&self.record.latest_session_id)
    }
}

/// A subset of `SessionRecord` fields an `update()` call may change, plus
/// the optional new transcript content.
#[derive(Debug, Clone, Default)]
pub struct SessionChanges {
    pub model: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub context: Option<Vec<Message>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Session key grammar ──

    #[test]
    fn parses_dm_key_without_account() {
        let parts = parse_session_key("agent:mozi:telegram:dm:user1").unwrap();
        assert_eq!(parts.agent_id, "mozi");
        assert_eq!(parts.channel_id, "telegram");
        assert_eq!(parts.account_id, None);
        assert_eq!(parts.peer_type, PeerType::Dm);
        assert_eq!(parts.peer_id, "user1");
        assert_eq!(parts.thread_id, None);
    }

    #[test]
    fn parses_group_key_with_account_and_thread() {
        let parts = parse_session_key("agent:mozi:slack:acct1:group:chan1:thread:t9").unwrap();
        assert_eq!(parts.account_id, Some("acct1".to_string()));
        assert_eq!(parts.peer_type, PeerType::Group);
        assert_eq!(parts.peer_id, "chan1");
        assert_eq!(parts.thread_id, Some("t9".to_string()));
    }

    #[test]
    fn rejects_malformed_key() {
        assert!(parse_session_key("not-a-session-key").is_err());
        assert!(parse_session_key("agent:mozi:telegram:bogus:user1").is_err());
    }

    #[test]
    fn is_dm_session_key_checks_substring() {
        assert!(is_dm_session_key("agent:mozi:telegram:dm:user1"));
        assert!(!is_dm_session_key("agent:mozi:slack:group:chan1"));
    }

    #[test]
    fn extract_dm_peer_id_strips_thread_suffix() {
        assert_eq!(
            extract_dm_peer_id("agent:mozi:telegram:dm:user1:thread:t9"),
            Some("user1".to_string())
        );
        assert_eq!(
            extract_dm_peer_id("agent:mozi:telegram:dm:user1"),
            Some("user1".to_string())
        );
        assert_eq!(extract_dm_peer_id("agent:mozi:slack:group:chan1"), None);
    }
}
