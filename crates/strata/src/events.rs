//! Lifecycle events emitted by the [`ContextEngine`](crate::engine::ContextEngine).
//!
//! The engine reports what it does through [`EngineEvent`] variants: items
//! arriving, compression requests going out and coming back, truncation,
//! forced retention, checkpoints and packing. Callers implement
//! [`EventHandler`] to observe them; the engine never logs through a global.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or silent sessions |
//! | [`LoggingHandler`] | Structured logging via `tracing` (the default) |
//! | [`EventObserver`] | Quick closures for simple callbacks |
//! | Custom `impl EventHandler` | Metrics, dashboards, persistence hooks |

use crate::checkpoint::CheckpointId;
use crate::context::compression::{RequestId, RequestKind};
use crate::context::packer::PackedWindow;
use crate::item::{CompressionLevel, ItemId, ItemKind, Tier};
use tracing::{debug, info, warn};

/// Events emitted by the engine.
#[derive(Debug)]
pub enum EngineEvent<'a> {
    /// A new item was registered.
    ItemAdded {
        id: ItemId,
        kind: ItemKind,
        tokens: usize,
        step: u64,
        /// Entanglement edges created on registration.
        edges: usize,
    },
    /// An item moved from L0 to L1.
    Masked {
        id: ItemId,
        /// Whether a placeholder replaced part of the content.
        replaced: bool,
        tokens_freed: usize,
    },
    /// A batch is waiting on external generation.
    CompressionRequested {
        id: RequestId,
        kind: RequestKind,
        items: &'a [ItemId],
    },
    /// Generated text was applied.
    CompressionCompleted {
        id: RequestId,
        level: CompressionLevel,
        retired: usize,
        tokens_saved: usize,
    },
    /// Generation failed or its text was rejected.
    CompressionFailed {
        id: RequestId,
        items: &'a [ItemId],
        reason: &'a str,
    },
    /// A packed item was hard-truncated to fit.
    Truncated {
        /// `None` for the task state block.
        id: Option<ItemId>,
        tokens: usize,
        ceiling: usize,
        tier: Option<Tier>,
    },
    /// An item was kept for an entangled partner.
    ForceRetained {
        kept: ItemId,
        tier: Tier,
        displaced: &'a [ItemId],
    },
    /// Entanglement edges dropped by decay or the edge cap.
    EdgesPruned { count: usize, remaining: usize },
    /// A checkpoint was captured.
    CheckpointTaken { id: CheckpointId, step: u64 },
    /// State was replaced from a checkpoint.
    Restored {
        id: CheckpointId,
        step: u64,
        /// Pending requests invalidated by the restore.
        dropped_requests: usize,
    },
    /// A window was packed.
    Packed { window: &'a PackedWindow },
}

/// Handler for engine events.
///
/// # Example
///
/// ```ignore
/// struct CountCompressions(AtomicUsize);
///
/// impl EventHandler for CountCompressions {
///     fn on_event(&self, event: &EngineEvent<'_>) {
///         if let EngineEvent::CompressionCompleted { .. } = event {
///             self.0.fetch_add(1, Ordering::Relaxed);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called for each event. The default implementation ignores it.
    fn on_event(&self, event: &EngineEvent<'_>) {
        let _ = event;
    }
}

/// A handler that ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// Wrapper that adapts a closure into an [`EventHandler`].
///
/// ```ignore
/// let handler = EventObserver::new(|event| {
///     if let EngineEvent::Packed { window } = event {
///         println!("{}", window.to_log_string());
///     }
/// });
/// ```
pub struct EventObserver<F>(F)
where
    F: Fn(&EngineEvent<'_>) + Send + Sync;

impl<F> EventObserver<F>
where
    F: Fn(&EngineEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for EventObserver<F>
where
    F: Fn(&EngineEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent<'_>) {
        (self.0)(event);
    }
}

/// An event handler that logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &EngineEvent<'_>) {
        match event {
            EngineEvent::ItemAdded {
                id,
                kind,
                tokens,
                step,
                edges,
            } => {
                debug!("Added {id} ({kind}, ~{tokens} tokens) at step {step}, {edges} new edge(s)");
            }
            EngineEvent::Masked {
                id,
                replaced,
                tokens_freed,
            } => {
                if *replaced {
                    debug!("Masked {id}, freed ~{tokens_freed} tokens");
                } else {
                    debug!("{id} advanced to L1");
                }
            }
            EngineEvent::CompressionRequested { id, kind, items } => {
                info!("Requested {kind:?} {id} for {} item(s)", items.len());
            }
            EngineEvent::CompressionCompleted {
                id,
                level,
                retired,
                tokens_saved,
            } => {
                info!("Completed {id}: now {level}, {retired} item(s) retired, ~{tokens_saved} tokens saved");
            }
            EngineEvent::CompressionFailed { id, items, reason } => {
                warn!("{id} failed for {} item(s): {reason}", items.len());
            }
            EngineEvent::Truncated {
                id,
                tokens,
                ceiling,
                tier,
            } => {
                let who = id.map_or_else(|| "task state".to_string(), |id| id.to_string());
                let tier = tier.map_or("pinned", |t| t.as_str());
                if *ceiling == 0 {
                    warn!("Excluded {who} ({tokens} tokens): no room left in the window");
                } else {
                    warn!("Truncated {who} ({tokens} tokens) to the {tier} ceiling of {ceiling}");
                }
            }
            EngineEvent::ForceRetained {
                kept,
                tier,
                displaced,
            } => {
                debug!(
                    "Kept {kept} in {tier} for an entangled partner, displacing {} item(s)",
                    displaced.len()
                );
            }
            EngineEvent::EdgesPruned { count, remaining } => {
                debug!("Pruned {count} entanglement edge(s), {remaining} remain");
            }
            EngineEvent::CheckpointTaken { id, step } => {
                debug!("Checkpoint {id} taken at step {step}");
            }
            EngineEvent::Restored {
                id,
                step,
                dropped_requests,
            } => {
                info!(
                    "Restored {id} (step {step}), {dropped_requests} pending request(s) dropped"
                );
            }
            EngineEvent::Packed { window } => {
                debug!("{}", window.to_log_string());
            }
        }
    }
}
