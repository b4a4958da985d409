//! # ACD Engine
//!
//! A call-queue engine for telephony platforms: inbound callers wait in
//! ordered lines and are dispatched to members (agents identified by a
//! dialable interface) according to configurable ring strategies, penalty
//! rules, and availability predicates. The engine places parallel
//! outbound attempts, races the answers, bridges the winner to the
//! caller, and records statistics.
//!
//! ## Overview
//!
//! The hard core is the dispatch subsystem:
//!
//! - **Waiting lists** with priority-based insertion and live position
//!   renumbering
//! - **Ring strategies** (ring-all, linear, round robin, random, weighted
//!   random, fewest calls, least recent) computed as per-member metrics
//! - **Concurrent outbound attempts** raced against the caller's own
//!   events, honoring forwards, party updates, and advice of charge
//! - **Shared device state** with reservation and active counters so the
//!   engine's own commitments reconcile with the driver's view
//! - **Penalty rules** that widen a caller's member-acceptance window as
//!   its wait grows
//!
//! Channel I/O, prompt playback, dial-plan evaluation, and the persistent
//! key/value store stay outside, consumed through the narrow traits in
//! [`transport`]. The engine is agnostic to the underlying telephony
//! stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐
//! │   Admin API     │   │  Event Bus      │   │   Audit Log     │
//! └────────┬────────┘   └────────▲────────┘   └────────▲────────┘
//!          │                     │                     │
//!          ▼                     │                     │
//! ┌──────────────────────────────┴─────────────────────┴────────┐
//! │                         Dispatcher                          │
//! │  join → wait turn → ring (selector + attempts + mux) →      │
//! │  bridge → complete                                          │
//! └───────┬──────────────┬──────────────┬───────────────────────┘
//!         │              │              │
//! ┌───────▼──────┐ ┌─────▼───────┐ ┌────▼────────┐
//! │ QueueRegistry│ │DeviceRegistry│ │RulesRegistry│
//! └──────────────┘ └─────────────┘ └─────────────┘
//!         │
//! ┌───────▼─────────────────────────┐
//! │ Transport / PromptPlayer /      │  (external collaborators)
//! │ Dialplan / KvStore traits       │
//! └─────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use acd_engine::prelude::*;
//!
//! let dispatcher = DispatcherBuilder::new(transport, prompts)
//!     .config(EngineConfig::default())
//!     .build();
//!
//! dispatcher.queues().create("support", QueueConfig::default())?;
//!
//! let admin = Admin::new(dispatcher.clone());
//! admin.add_member("support", MemberSpec::dynamic("PJSIP/alice")).await?;
//!
//! // One task per inbound caller.
//! let outcome = dispatcher
//!     .run(DispatchRequest::new(caller_channel, "support"))
//!     .await?;
//! ```
//!
//! ## Key Modules
//!
//! - [`dispatch`]: the orchestrator, ring selector, attempts, event race
//! - [`queue`]: queues, waiting lists, per-queue statistics
//! - [`member`]: members, provenance precedence, the roster
//! - [`device`]: shared device records and the status fan-out registry
//! - [`rules`]: penalty rule sets and caller cursors
//! - [`events`]: the typed broadcast event bus
//! - [`audit`]: the line-oriented audit log
//! - [`persist`]: dynamic-member persistence over the key/value store
//! - [`api`]: the management surface
//! - [`transport`]: the external collaborator traits
//! - [`config`]: queue and engine configuration
//! - [`error`]: error types and the crate [`Result`]

pub mod audit;
pub mod caller;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod member;
pub mod persist;
pub mod queue;
pub mod rules;
pub mod transport;

pub mod api;

pub use config::{EngineConfig, QueueConfig, Strategy};
pub use dispatch::{DispatchOutcome, DispatchRequest, Dispatcher, DispatcherBuilder};
pub use error::{AcdError, Result};

/// Engine-wide statistics snapshot
///
/// A cheap cross-queue summary for dashboards and health checks.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Number of configured queues
    pub queues: usize,
    /// Callers waiting across every queue
    pub waiting_callers: usize,
    /// Members across every queue
    pub members: usize,
    /// Live shared device records
    pub devices: usize,
}

/// Commonly used types for embedding the engine
///
/// ```
/// use acd_engine::prelude::*;
/// ```
pub mod prelude {
    //! One import for the types most embeddings touch.

    pub use crate::api::{Admin, MemberSummary, QueueSummary};
    pub use crate::audit::{AuditLog, AuditSink, AuditTag, MemorySink};
    pub use crate::caller::CallerOptions;
    pub use crate::config::{
        AnnounceConfig, AutopausePolicy, EmptyCheck, EmptyConditions, EngineConfig, QueueConfig,
        Strategy,
    };
    pub use crate::device::{DeviceRegistry, DeviceStatus};
    pub use crate::dispatch::{
        DispatchOutcome, DispatchRequest, Dispatcher, DispatcherBuilder,
    };
    pub use crate::error::{AcdError, Result};
    pub use crate::events::{EventBus, QueueEvent, QueueEventKind};
    pub use crate::member::{MemberSpec, Provenance};
    pub use crate::persist::{MemberStore, MemoryKv};
    pub use crate::queue::{QueueRegistry, QueueStats};
    pub use crate::rules::{PenaltyRule, PenaltyWindow, RuleSet};
    pub use crate::transport::{
        BridgeEnd, BridgeOptions, BridgeOutcome, ChannelId, ControlKind, Dialplan, Frame,
        Indication, KvStore, PartyInfo, PromptPlayer, RequestFailure, Transport, WaitResult,
    };
    pub use crate::EngineStats;

    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;
}
