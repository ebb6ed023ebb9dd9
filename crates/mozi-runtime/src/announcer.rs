// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Event-driven announcer (spec §4.M): subscribes to the Lifecycle Bus and,
//! when a registered subagent's child session reaches a terminal phase,
//! narrates the result back into the parent session as a synthetic user
//! turn. Grounded on the teacher's `tracing` structured-logging idiom for
//! the trigger text (`sven-core/src/task_tool.rs`'s `debug!` call sites)
//! generalized into a user-facing message rather than a log line.

use std::sync::Arc;

use crate::bus::{BusEvent, LifecycleBus};
use crate::subagents::{build_trigger_message, SubagentRegistry, SubagentRun};

/// A trigger message ready to be injected into the parent session as the
/// next turn's synthetic input.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub parent_session_key: String,
    pub message: String,
}

/// Subscribes to a [`LifecycleBus`] and turns terminal lifecycle events for
/// tracked child sessions into [`Announcement`]s, delivered through a
/// caller-supplied sink (the channel delivery path is out of scope here).
pub struct Announcer {
    runs: Arc<SubagentRegistry>,
    sink: Arc<dyn Fn(Announcement) + Send + Sync>,
}

impl Announcer {
    pub fn new<F>(runs: Arc<SubagentRegistry>, sink: F) -> Self
    where
        F: Fn(Announcement) + Send + Sync + 'static,
    {
        Self { runs, sink: Arc::new(sink) }
    }

    /// Attach this announcer to `bus`; every lifecycle event for a tracked
    /// child session is turned into an announcement once terminal.
    pub async fn attach(self: &Arc<Self>, bus: &LifecycleBus) -> crate::bus::SubscriptionId {
        let this = self.clone();
        bus.subscribe(move |event: &BusEvent| {
            let this = this.clone();
            let event = event.clone();
            tokio::spawn(async move {
                this.handle(&event, &now_placeholder()).await;
            });
        })
        .await
    }

    async fn handle(&self, event: &BusEvent, now: &str) {
        let Some(run) = self.runs.apply_lifecycle_event(event, now).await else { return };
        self.announce(&run).await;
    }

    async fn announce(&self, run: &SubagentRun) {
        let runtime_label = match (&run.started_at, &run.ended_at) {
            (Some(_), Some(_)) => "n/a".to_string(),
            _ => "unknown".to_string(),
        };
        let message = build_trigger_message(run, &runtime_label);
        self.runs.mark_announced(&run.child_session_key).await;
        (self.sink)(Announcement {
            parent_session_key: run.parent_session_key.clone(),
            message,
        });
    }
}

/// Placeholder wall-clock stamp, consistent with `mozi-secrets`'s choice to
/// keep pure logic deterministic and push real timestamping to the
/// top-level runtime wiring.
fn now_placeholder() -> String {
    "1970-01-01T00:00:00Z".to_string()
}
