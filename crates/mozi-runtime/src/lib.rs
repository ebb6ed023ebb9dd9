// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod announcer;
pub mod bus;
pub mod capability;
pub mod collaborators;
pub mod subagents;

pub use announcer::{Announcement, Announcer};
pub use bus::{BusEvent, EventData, LifecycleBus, LifecyclePhase, SubscriptionId, ToolStatus};
pub use capability::{negotiate, DeliveryPlan, InputPart, MappedPart, RuntimeLimits, TransformStep};
pub use collaborators::{ChannelPlugin, ExtensionRegistry, MemoryManager, MemoryReadOptions, MemorySearchHit, ModelTransport, SkillLoader, TurnRunner};
pub use subagents::{
    build_trigger_message, SubagentError, SubagentRegistry, SubagentRun, SubagentRunRequest, SubagentRunsFile,
    SubagentStatus, ANNOUNCED_RUN_RETENTION_SECS, MAX_CONCURRENT_SUBAGENTS, SWEEP_INTERVAL_SECS,
};
