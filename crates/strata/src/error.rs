//! Error and warning types for the context engine.
//!
//! [`EngineError`] is returned through `Result`; only configuration
//! validation is fatal. Everything the engine can absorb by degrading data
//! (truncating an oversized item, leaving a batch uncompressed) is reported
//! as an [`EngineWarning`] instead, alongside normal output.

use crate::checkpoint::CheckpointId;
use crate::context::compression::{RequestId, RequestStatus};
use crate::item::{ItemId, Tier};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by engine operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// An internal invariant check failed. Recover with
    /// `checkpoint_before()` + `restore()`.
    #[error("corrupt state: {0}")]
    CorruptState(String),

    /// No live item with this id.
    #[error("unknown item: {0}")]
    UnknownItem(ItemId),

    /// No compression request with this id.
    #[error("unknown compression request: {0}")]
    UnknownRequest(RequestId),

    /// The request was already resolved.
    #[error("compression request {id} is not pending (status: {status:?})")]
    RequestNotPending {
        /// The request that was addressed.
        id: RequestId,
        /// Its current status.
        status: RequestStatus,
    },

    /// No retained checkpoint with this id.
    #[error("unknown checkpoint: {0}")]
    UnknownCheckpoint(CheckpointId),

    /// Checkpoint persistence failed.
    #[error("checkpoint i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot or config (de)serialization failed.
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Non-fatal conditions surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineWarning {
    /// A single item did not fit its tier ceiling and was hard-truncated in
    /// the packed window to `ceiling` tokens. A `ceiling` of 0 means no room
    /// was left at all and the item was excluded. `id` is `None` for the
    /// task state block.
    ItemTooLarge {
        id: Option<ItemId>,
        tokens: usize,
        ceiling: usize,
        tier: Option<Tier>,
    },
    /// External generation failed or produced unusable text. The listed
    /// items stay at their current compression level.
    CompressionFailed {
        request_id: RequestId,
        items: Vec<ItemId>,
        reason: String,
    },
}

impl std::fmt::Display for EngineWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineWarning::ItemTooLarge {
                id,
                tokens,
                ceiling,
                tier,
            } => {
                let who = id.map_or_else(|| "task state".to_string(), |id| id.to_string());
                let tier = tier.map_or("pinned", |t| t.as_str());
                if *ceiling == 0 {
                    write!(f, "{who} ({tokens} tokens) does not fit; no room left, excluded")
                } else {
                    write!(
                        f,
                        "{who} ({tokens} tokens) exceeds {tier} ceiling of {ceiling} tokens; truncated"
                    )
                }
            }
            EngineWarning::CompressionFailed {
                request_id,
                items,
                reason,
            } => write!(
                f,
                "{request_id} failed for {} item(s): {reason}",
                items.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_display_names_the_item() {
        let w = EngineWarning::ItemTooLarge {
            id: Some(ItemId(7)),
            tokens: 900,
            ceiling: 400,
            tier: Some(Tier::Warm),
        };
        let s = w.to_string();
        assert!(s.contains("item-7"));
        assert!(s.contains("warm"));
        assert!(s.contains("400"));
    }

    #[test]
    fn task_state_warning_has_no_tier() {
        let w = EngineWarning::ItemTooLarge {
            id: None,
            tokens: 50,
            ceiling: 10,
            tier: None,
        };
        assert!(w.to_string().starts_with("task state"));
    }

    #[test]
    fn io_errors_convert() {
        let err: EngineError = std::io::Error::other("disk full").into();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
