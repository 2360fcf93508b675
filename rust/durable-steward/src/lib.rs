//! Durable policy orchestration engine.
//!
//! This crate provides:
//! - A versioned [`PolicyStore`] with compare-and-swap on the "current version" pointer
//! - A step-wise [`WorkflowEngine`] with per-step SLA timers, human approval gates
//!   and saga-style compensation
//! - An append-only, gap-free [`AuditLog`] with in-memory and SQLite backends
//! - An [`EventFanOut`] publish/subscribe bus for external collaborators
//! - A [`RollbackWatcher`] that reverts a policy when its failure rate spikes
//!
//! # Architecture
//!
//! ```text
//! Steward
//! ├─> PolicyStore ──────────┐
//! ├─> WorkflowEngine ───────┤
//! │    ├─> TimerService     ├─> Journal ─┬─> AuditLog (append-only)
//! │    └─> ActorRegistry    │            └─> EventFanOut (topics)
//! └─> RollbackWatcher ──────┘
//! ```
//!
//! Workflow instances are pinned to the policy version that was current when
//! they started. Publishing or rolling back a policy only affects instances
//! created afterwards.
//!
//! # Usage
//!
//! ```rust,ignore
//! use durable_steward::prelude::*;
//!
//! let steward = Steward::builder().start().await?;
//!
//! let version = steward
//!     .policies
//!     .publish("refund", vec![StepSpec::new("draft", "clerk", Duration::from_secs(7200))], None)
//!     .await?;
//!
//! let instance = steward
//!     .engine
//!     .start_workflow("refund", serde_json::json!({"amount": 40}))
//!     .await?;
//! assert_eq!(instance.pinned_version(), version);
//! ```

pub mod actors;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod journal;
pub mod policy;
pub mod runtime;
pub mod storage;
pub mod timer;
pub mod watcher;

// Re-exports
pub use actors::{Actor, ActorOutcome, ActorRegistry, ActorRequest};
pub use audit::{AuditEntry, AuditEventType, AuditLog, InMemoryAuditLog, NewAuditEntry};
pub use config::{EngineConfig, WatcherConfig};
pub use engine::{
    EngineParts, EngineStats, EscalationNotice, InstanceStatus, InstanceView, LocalTicketSurface,
    Ticket, TicketResolution, TicketStatus, TicketSurface, Transition, WorkflowEngine,
    WorkflowInstance,
};
pub use error::{EntityKind, StewardError, StewardResult};
pub use fanout::{EventEnvelope, EventFanOut, Subscription, TopicPattern};
pub use journal::Journal;
pub use policy::{
    EscalationHop, PolicyDefinition, PolicyStatus, PolicyStore, RollbackOrigin, StepSpec, Version,
};
pub use runtime::{Steward, StewardBuilder};
pub use storage::{MemoryStateStore, PolicyHead, StateStore};
pub use timer::TimerService;
pub use watcher::{RollbackDecision, RollbackWatcher};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::actors::{Actor, ActorOutcome, ActorRegistry, ActorRequest};
    pub use crate::audit::{AuditEventType, AuditLog};
    pub use crate::engine::{
        InstanceStatus, TicketResolution, TicketStatus, Transition, WorkflowEngine,
    };
    pub use crate::error::{StewardError, StewardResult};
    pub use crate::fanout::{EventEnvelope, EventFanOut};
    pub use crate::policy::{EscalationHop, PolicyStore, StepSpec};
    pub use crate::runtime::Steward;
    pub use std::time::Duration;
}
