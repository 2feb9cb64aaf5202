//! Convenience re-exports for common `strata` types.
//!
//! Meant to be glob-imported by code that drives an engine:
//!
//! ```ignore
//! use strata::prelude::*;
//! ```
//!
//! This pulls in the facade, its configuration, item types, errors and
//! event handlers. Component internals (tier assignment, entanglement
//! snapshots, prompt builders) are left out; import those from
//! [`context`](crate::context) when needed.

// ── Facade ──────────────────────────────────────────────────────────
pub use crate::engine::{CompressionOutcome, ContextEngine, EngineStats, MaintenanceReport};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::{DomainProfile, EngineConfig, ImportanceWeights};

// ── Data model ──────────────────────────────────────────────────────
pub use crate::item::{
    CompressionLevel, ContextItem, ItemDraft, ItemId, ItemKind, SubGoalStatus, TaskState, Tier,
};

// ── Window and requests ─────────────────────────────────────────────
pub use crate::context::{
    CompressionRequest, PackedItem, PackedWindow, RequestId, RequestKind, RequestStatus, Section,
};

// ── Checkpoints ─────────────────────────────────────────────────────
pub use crate::checkpoint::{Checkpoint, CheckpointId, CheckpointStore};

// ── Errors and events ───────────────────────────────────────────────
pub use crate::error::{EngineError, EngineWarning};
pub use crate::events::{EngineEvent, EventHandler, EventObserver, LoggingHandler, NoopHandler};

// ── Driver ──────────────────────────────────────────────────────────
pub use crate::driver::{DriverConfig, FnGenerator, Generator, drive_requests};
