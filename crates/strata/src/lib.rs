//! Tiered, budget-constrained context memory for long-running agent loops.
//!
//! `strata` decides, at every step of a conversation or task loop, which
//! pieces of accumulated history occupy a fixed-size context window. History
//! grows without bound; the window does not. The core abstraction is the
//! [`ContextEngine`](engine::ContextEngine), one exclusive instance per
//! session, which:
//!
//! - scores every item on six factors (recency, goal relevance, causal
//!   weight, reference frequency, outcome correlation, domain weight),
//! - ages items through four compression levels (verbatim, masked,
//!   summarized, digest),
//! - classifies them into hot, warm and cold tiers with their own ceilings,
//! - refuses to silently separate items that reference the same entities,
//! - and packs an ordered window that never exceeds `budget - reservation`.
//!
//! # Getting started
//!
//! ```ignore
//! use strata::prelude::*;
//!
//! let mut engine = ContextEngine::new(EngineConfig::default().with_model_window(128_000))?;
//! engine.set_goal("Fix the 401 returned by auth.py on login");
//! engine.add_item(ItemKind::System, "You are a careful coding agent.", 0);
//! engine.add_item(ItemKind::UserMessage, "Login fails with 401", 1);
//! engine.add(
//!     ItemDraft::new(ItemKind::ToolResult, tool_output).with_tool("read_file"),
//!     2,
//! );
//!
//! let report = engine.maintain(2);
//! for request in &report.requests {
//!     // Generate text for request.system_prompt / request.user_prompt, then:
//!     // engine.complete_compression(request.id, &text)?;
//! }
//!
//! let window = engine.pack_window();
//! for item in &window.items {
//!     println!("{:?} {}", item.section, item.content);
//! }
//! ```
//!
//! # Where to find things
//!
//! - **The facade and its operations:** [`engine::ContextEngine`].
//! - **Tuning:** [`config::EngineConfig`] and its nested sections. Every
//!   field has a default; configs load from JSON and validate up front.
//! - **Item and task state types:** [`item`].
//! - **Individual components:** [`context`], leaves first.
//! - **Snapshots and persistence:** [`checkpoint`].
//! - **Observing what the engine does:** [`events::EventHandler`].
//! - **Running compression requests asynchronously:** [`driver`].
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`engine`] | [`ContextEngine`](engine::ContextEngine) facade, stats, maintenance reports |
//! | [`context`] | Token accounting, entity extraction, entanglement, importance, compression, tiers, packing |
//! | [`checkpoint`] | In-memory checkpoint ring and on-disk JSON store |
//! | [`config`] | [`EngineConfig`](config::EngineConfig) and validation |
//! | [`item`] | [`ContextItem`](item::ContextItem), [`TaskState`](item::TaskState) |
//! | [`events`] | Lifecycle events and handlers |
//! | [`driver`] | Concurrent, timeout-bounded request generation |
//! | [`error`] | [`EngineError`](error::EngineError) and [`EngineWarning`](error::EngineWarning) |
//!
//! # Design principles
//!
//! 1. **History is degraded, never lost.** Pressure truncates or compresses;
//!    a failed compression leaves items exactly as they were.
//!
//! 2. **The core never blocks.** Summaries and digests are requests the
//!    caller fulfils whenever it likes; until then packing uses whatever
//!    level items hold.
//!
//! 3. **Budgets are recomputed, not tracked.** Every pack sums token costs
//!    from scratch.
//!
//! 4. **Observability over magic.** Every decision the engine makes is
//!    reported as an [`EngineEvent`](events::EngineEvent).

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod item;
pub mod prelude;

// Re-export schemars for downstream crates that embed the config schema.
pub use schemars;
