// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Lifecycle Bus (spec §4.N): a process-wide pub-sub publisher for
//! lifecycle and tool events. Grounded on `sven-core/src/events.rs`'s
//! `AgentEvent` tagged-enum shape and `sven-tools/src/events.rs`'s
//! `ToolEvent`, generalized from per-agent mpsc channels (the teacher's
//! model) to a shared in-process subscriber registry, since spec.md §4.N
//! is explicitly cross-session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

/// Phase of a session turn's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
}

/// Status of a single tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Called,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
pub enum EventData {
    Lifecycle {
        phase: LifecyclePhase,
        started_at: Option<String>,
        ended_at: Option<String>,
        error: Option<String>,
    },
    Tool {
        tool_name: String,
        status: ToolStatus,
        result: Option<Value>,
    },
}

impl EventData {
    pub fn stream(&self) -> &'static str {
        match self {
            EventData::Lifecycle { .. } => "lifecycle",
            EventData::Tool { .. } => "tool",
        }
    }
}

/// One published event: the `{stream, runId, sessionKey, data}` envelope
/// spec.md §4.N describes.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub run_id: u64,
    pub session_key: String,
    pub data: EventData,
}

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// An unsubscribe handle. Dropping it does not unsubscribe; call
/// [`LifecycleBus::unsubscribe`] explicitly, mirroring the teacher's
/// explicit-channel-close idiom rather than RAII-on-drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Process-wide singleton publisher (spec.md §4.N). Subscribers are
/// invoked sequentially, in the publisher's emission order, on whichever
/// task calls [`LifecycleBus::publish`].
#[derive(Default)]
pub struct LifecycleBus {
    subscribers: Mutex<HashMap<u64, Handler>>,
    next_subscription_id: AtomicU64,
    next_run_id: AtomicU64,
}

impl LifecycleBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            next_run_id: AtomicU64::new(1),
        }
    }

    /// Allocate a `runId` for a new turn; callers attach it to every event
    /// they publish for that turn.
    pub fn next_run_id(&self) -> u64 {
        self.next_run_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().await.insert(id, Arc::new(handler));
        SubscriptionId(id)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().await.remove(&id.0);
    }

    pub async fn remove_all_listeners(&self) {
        self.subscribers.lock().await.clear();
    }

    /// Deliver `event` to every current subscriber, in registration order.
    /// Stream filtering is left to each subscriber.
    pub async fn publish(&self, event: BusEvent) {
        let subscribers = self.subscribers.lock().await;
        let mut ids: Vec<&u64> = subscribers.keys().collect();
        ids.sort();
        for id in ids {
            (subscribers[id])(&event);
        }
    }
}
