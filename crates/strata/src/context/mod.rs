//! Context hierarchy components, leaves first.
//!
//! 1. **[`tokens`]**: deterministic token estimates and truncation.
//!
//! 2. **[`entities`]**: pattern-based extraction of paths, symbols, quoted
//!    identifiers and similar names from item content.
//!
//! 3. **[`entanglement`]**: weighted co-reference graph over items. Strong
//!    edges veto evicting one half of a related pair.
//!
//! 4. **[`importance`]**: six-factor retention score per item.
//!
//! 5. **[`compression`]**: the L0 -> L3 state machine. Masking is local;
//!    summaries and digests are request/completion pairs.
//!
//! 6. **[`tiers`]**: hot/warm/cold classification and per-tier ceilings.
//!
//! 7. **[`packer`]**: the ordered, budget-respecting window.
//!
//! The [`ContextEngine`](crate::engine::ContextEngine) wires these together;
//! each can also be used on its own.

pub mod compression;
pub mod entanglement;
pub mod entities;
pub mod importance;
pub mod packer;
pub mod tiers;
pub mod tokens;

// Re-export commonly used items at the module level.
pub use compression::{
    CompressionPipeline, CompressionRequest, DigestUpdate, RequestId, RequestKind, RequestStatus,
    parse_digest,
};
pub use entanglement::{EntanglementEdge, EntanglementIndex, GraphSnapshot, MissingPartner};
pub use entities::extract_entities;
pub use importance::{GoalTerms, ImportanceScorer, ScoreBreakdown};
pub use packer::{PackedItem, PackedWindow, Section, TierTotals, WindowPacker};
pub use tiers::{TierAssignment, TierBudgets, TierManager};
pub use tokens::{DEFAULT_CHARS_PER_TOKEN, TokenAccountant, estimate_tokens, truncate_to_tokens};
