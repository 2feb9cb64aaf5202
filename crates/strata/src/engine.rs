//! The [`ContextEngine`] facade: one exclusive instance per session.
//!
//! The engine owns every item, the task state, the entanglement graph, the
//! compression outbox and the checkpoint ring. All mutating operations are
//! synchronous and must be called in sequence; the only thing that happens
//! "later" is external text generation, which the engine hands out as
//! [`CompressionRequest`]s and takes back through
//! [`complete_compression`](ContextEngine::complete_compression) or
//! [`fail_compression`](ContextEngine::fail_compression).
//!
//! A typical step:
//!
//! ```ignore
//! let mut engine = ContextEngine::new(EngineConfig::default())?;
//! engine.set_goal("Fix the 401 in auth.py");
//! engine.add_item(ItemKind::UserMessage, "Login returns 401", step);
//! let report = engine.maintain(step);
//! for request in &report.requests {
//!     // run request.system_prompt / request.user_prompt somewhere
//! }
//! let window = engine.pack_window();
//! ```

use crate::checkpoint::{Checkpoint, CheckpointId, Checkpointer, EngineSnapshot};
use crate::config::EngineConfig;
use crate::context::compression::{
    self, CompressionPipeline, CompressionRequest, DigestOutcome, MergeOutcome, RequestId,
    RequestKind, RequestStatus,
};
use crate::context::entanglement::EntanglementIndex;
use crate::context::importance::{GoalTerms, ImportanceScorer, ScoreBreakdown};
use crate::context::packer::{PackedWindow, Section, WindowPacker};
use crate::context::tiers::{TierBudgets, TierManager};
use crate::context::tokens::TokenAccountant;
use crate::error::{EngineError, EngineWarning};
use crate::events::{EngineEvent, EventHandler, LoggingHandler};
use crate::item::{CompressionLevel, ContextItem, ItemDraft, ItemId, ItemKind, TaskState, Tier};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// What one [`maintain`](ContextEngine::maintain) pass did.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub step: u64,
    /// Newly emitted requests; older pending ones are not repeated.
    pub requests: Vec<CompressionRequest>,
    /// Items advanced from L0 to L1.
    pub masked: usize,
    /// Entanglement edges removed by decay or the edge cap.
    pub pruned_edges: usize,
    /// Automatic checkpoint, when one was due.
    pub checkpoint: Option<CheckpointId>,
}

/// Result of applying generated text to a request.
#[derive(Debug, Clone, PartialEq)]
pub enum CompressionOutcome {
    /// An L2 batch was merged into its anchor item.
    Merged(MergeOutcome),
    /// An L3 batch was folded into the task state and retired.
    Digested(DigestOutcome),
    /// The text was unusable; the request counts as failed and the items
    /// keep their level.
    Rejected(EngineWarning),
}

/// Token use of one tier against its nominal ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TierUtilization {
    pub tier: Tier,
    pub items: usize,
    pub tokens: usize,
    pub ceiling: usize,
}

impl TierUtilization {
    pub fn ratio(&self) -> f64 {
        if self.ceiling == 0 {
            0.0
        } else {
            self.tokens as f64 / self.ceiling as f64
        }
    }
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub step: u64,
    pub live_items: usize,
    /// Per tier, from the last pack. Ceilings are nominal: the configured
    /// window budget split by tier ratios, before the pinned section.
    pub tiers: Vec<TierUtilization>,
    /// Items per compression level. L3 counts items already retired into
    /// the task state.
    pub levels: Vec<(CompressionLevel, usize)>,
    pub pending_requests: usize,
    pub edge_count: usize,
    pub checkpoint_count: usize,
    pub current_tokens: usize,
    pub raw_tokens: usize,
    pub token_spend: u64,
}

impl EngineStats {
    pub fn level_count(&self, level: CompressionLevel) -> usize {
        self.levels
            .iter()
            .find(|(l, _)| *l == level)
            .map_or(0, |(_, n)| *n)
    }

    pub fn tier(&self, tier: Tier) -> Option<&TierUtilization> {
        self.tiers.iter().find(|t| t.tier == tier)
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        let tiers: Vec<String> = self
            .tiers
            .iter()
            .map(|t| format!("{} {}/{}", t.tier, t.tokens, t.ceiling))
            .collect();
        let levels: Vec<String> = self
            .levels
            .iter()
            .map(|(l, n)| format!("{l}={n}"))
            .collect();
        format!(
            "step {}: {} items, ~{} of {} raw tokens [{}] [{}], {} pending, {} edges, {} checkpoints",
            self.step,
            self.live_items,
            self.current_tokens,
            self.raw_tokens,
            tiers.join(", "),
            levels.join(" "),
            self.pending_requests,
            self.edge_count,
            self.checkpoint_count,
        )
    }
}

/// Items and tokens per tier in `window`. Pinned items carry the hot tier;
/// the rendered task state is not an item and is left out.
fn usage_by_tier(window: &PackedWindow) -> [(usize, usize); 3] {
    let mut usage = [(0, 0); 3];
    for packed in &window.items {
        let tier = match packed.section {
            Section::Pinned if packed.id.is_none() => continue,
            Section::Pinned | Section::Hot => Tier::Hot,
            Section::Warm => Tier::Warm,
            Section::Cold => Tier::Cold,
        };
        let slot = &mut usage[tier.index()];
        slot.0 += 1;
        slot.1 += packed.tokens;
    }
    usage
}

pub struct ContextEngine {
    config: EngineConfig,
    accountant: TokenAccountant,
    scorer: ImportanceScorer,
    pipeline: CompressionPipeline,
    tiers: TierManager,
    graph: EntanglementIndex,
    checkpoints: Checkpointer,
    items: BTreeMap<ItemId, ContextItem>,
    task_state: TaskState,
    goal: GoalTerms,
    /// Goal text `goal` was built from.
    goal_source: String,
    step: u64,
    next_item_id: u64,
    digested: usize,
    /// Warnings not yet handed out by `pack`.
    warnings: Vec<EngineWarning>,
    /// (items, tokens) per tier in the last packed window.
    packed_usage: [(usize, usize); 3],
    handler: Box<dyn EventHandler>,
}

impl std::fmt::Debug for ContextEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextEngine")
            .field("step", &self.step)
            .field("items", &self.items.len())
            .field("edges", &self.graph.edge_count())
            .field("pending", &self.pipeline.pending_count())
            .field("checkpoints", &self.checkpoints.len())
            .finish()
    }
}

impl ContextEngine {
    /// Create an engine. Fails only if `config` is invalid.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            accountant: TokenAccountant::with_calibration(config.chars_per_token),
            scorer: ImportanceScorer::new(config.importance.clone(), &config.domain),
            pipeline: CompressionPipeline::new(config.compression.clone(), config.domain.clone()),
            tiers: TierManager::new(config.tiers.clone(), config.compression.thresholds),
            graph: EntanglementIndex::new(config.entanglement.clone()),
            checkpoints: Checkpointer::new(
                config.checkpoints.max_retained,
                config.checkpoints.every_n_steps,
            ),
            items: BTreeMap::new(),
            task_state: TaskState::default(),
            goal: GoalTerms::default(),
            goal_source: String::new(),
            step: 0,
            next_item_id: 1,
            digested: 0,
            warnings: Vec::new(),
            packed_usage: [(0, 0); 3],
            handler: Box::new(LoggingHandler),
            config,
        })
    }

    /// Rebuild an engine from a (typically persisted) checkpoint.
    pub fn from_checkpoint(config: EngineConfig, checkpoint: Checkpoint) -> Result<Self, EngineError> {
        let mut engine = Self::new(config)?;
        engine.apply_snapshot(&checkpoint.snapshot);
        engine.checkpoints.adopt(checkpoint);
        Ok(engine)
    }

    /// Replace the default [`LoggingHandler`].
    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    fn emit(&self, event: EngineEvent<'_>) {
        self.handler.on_event(&event);
    }

    // ── Accessors ─────────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Latest step seen by any operation.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn item(&self, id: ItemId) -> Option<&ContextItem> {
        self.items.get(&id)
    }

    /// Live items, by id.
    pub fn items(&self) -> impl Iterator<Item = &ContextItem> {
        self.items.values()
    }

    pub fn task_state(&self) -> &TaskState {
        &self.task_state
    }

    pub fn task_state_mut(&mut self) -> &mut TaskState {
        &mut self.task_state
    }

    pub fn graph(&self) -> &EntanglementIndex {
        &self.graph
    }

    pub fn accountant(&self) -> &TokenAccountant {
        &self.accountant
    }

    pub fn checkpoints(&self) -> &Checkpointer {
        &self.checkpoints
    }

    pub fn request(&self, id: RequestId) -> Option<&CompressionRequest> {
        self.pipeline.get(id)
    }

    pub fn pending_requests(&self) -> impl Iterator<Item = &CompressionRequest> {
        self.pipeline.pending()
    }

    // ── Goal and items ────────────────────────────────────────────

    pub fn set_goal(&mut self, text: impl Into<String>) {
        self.task_state.goal = text.into();
        self.sync_goal();
    }

    /// Rebuild goal terms if the goal text changed, including edits made
    /// through `task_state_mut`.
    fn sync_goal(&mut self) {
        if self.goal_source == self.task_state.goal {
            return;
        }
        self.goal = GoalTerms::new(&self.task_state.goal);
        self.goal_source = self.task_state.goal.clone();
        for item in self.items.values_mut() {
            item.importance_stale = true;
        }
    }

    pub fn add_item(&mut self, kind: ItemKind, content: impl Into<String>, step: u64) -> ItemId {
        self.add(ItemDraft::new(kind, content), step)
    }

    /// Register a new item at L0. Existing items sharing entities with it
    /// count as referenced at `step`.
    pub fn add(&mut self, draft: ItemDraft, step: u64) -> ItemId {
        self.step = self.step.max(step);
        let id = ItemId(self.next_item_id);
        self.next_item_id += 1;
        let tokens = self.accountant.estimate(&draft.content);
        let item = ContextItem::from_draft(id, draft, tokens, step);
        let registration = self.graph.register(id, &item.content, step);

        let partners: Vec<ItemId> = self.graph.partners(id).map(|(other, _)| other).collect();
        for other in partners {
            if let Some(it) = self.items.get_mut(&other) {
                it.reference_count = it.reference_count.saturating_add(1);
                it.last_referenced_step = it.last_referenced_step.max(step);
                it.importance_stale = true;
            }
        }

        self.task_state.token_spend += tokens as u64;
        self.emit(EngineEvent::ItemAdded {
            id,
            kind: item.kind,
            tokens,
            step,
            edges: registration.edges_created,
        });
        if registration.edges_pruned > 0 {
            self.emit(EngineEvent::EdgesPruned {
                count: registration.edges_pruned,
                remaining: self.graph.edge_count(),
            });
        }
        self.items.insert(id, item);
        id
    }

    /// Record that `id` was referenced at `step`.
    pub fn mark_reference(&mut self, id: ItemId, step: u64) -> Result<(), EngineError> {
        let item = self.items.get_mut(&id).ok_or(EngineError::UnknownItem(id))?;
        item.reference_count = item.reference_count.saturating_add(1);
        item.last_referenced_step = item.last_referenced_step.max(step);
        item.importance_stale = true;
        self.step = self.step.max(step);
        self.graph.reinforce(id, step);
        Ok(())
    }

    /// Attribute the outcome of `step` to every item referenced within the
    /// outcome window before it. Returns how many items were credited.
    pub fn mark_outcome(&mut self, step: u64, success: bool) -> usize {
        let window = self.scorer.config().outcome_window;
        let mut credited = 0;
        for item in self.items.values_mut() {
            let last = item.last_referenced_step;
            if last > step || step - last > window {
                continue;
            }
            if success {
                item.outcome_successes += 1;
            } else {
                item.outcome_failures += 1;
            }
            item.importance_stale = true;
            credited += 1;
        }
        self.step = self.step.max(step);
        credited
    }

    /// Per-factor importance of one item, as of the current step.
    pub fn importance_breakdown(&mut self, id: ItemId) -> Result<ScoreBreakdown, EngineError> {
        self.sync_goal();
        let item = self.items.get(&id).ok_or(EngineError::UnknownItem(id))?;
        Ok(self.scorer.breakdown(item, &self.goal, self.step))
    }

    fn refresh_importance(&mut self, all: bool) {
        self.sync_goal();
        for item in self.items.values_mut() {
            if all || item.importance_stale {
                item.importance = self.scorer.score(item, &self.goal, self.step);
                item.importance_stale = false;
            }
        }
    }

    fn mask_due(&mut self, now: u64) -> usize {
        let mut outcomes = Vec::new();
        for item in self.items.values_mut() {
            if let Some(out) = self.pipeline.mask_if_due(item, now, &self.accountant) {
                if out.replaced {
                    item.importance_stale = true;
                }
                outcomes.push(out);
            }
        }
        for out in &outcomes {
            self.emit(EngineEvent::Masked {
                id: out.id,
                replaced: out.replaced,
                tokens_freed: out.tokens_freed,
            });
        }
        outcomes.len()
    }

    // ── Maintenance ───────────────────────────────────────────────

    /// Periodic upkeep: age-driven compression, edge decay, bulk importance
    /// refresh and the automatic checkpoint.
    pub fn maintain(&mut self, step: u64) -> MaintenanceReport {
        self.step = self.step.max(step);
        let now = self.step;
        let mut report = MaintenanceReport {
            step: now,
            ..MaintenanceReport::default()
        };

        report.masked = self.mask_due(now);
        report.requests = self.pipeline.plan(&mut self.items, &self.task_state, now);
        for r in &report.requests {
            self.emit(EngineEvent::CompressionRequested {
                id: r.id,
                kind: r.kind,
                items: &r.items,
            });
        }

        report.pruned_edges = self.graph.decay(now);
        if report.pruned_edges > 0 {
            self.emit(EngineEvent::EdgesPruned {
                count: report.pruned_edges,
                remaining: self.graph.edge_count(),
            });
        }

        self.refresh_importance(true);

        if self.checkpoints.due(now) {
            report.checkpoint = Some(self.checkpoint());
        }
        report
    }

    // ── Compression completions ───────────────────────────────────

    fn pending_request(&self, id: RequestId) -> Result<CompressionRequest, EngineError> {
        let request = self.pipeline.get(id).ok_or(EngineError::UnknownRequest(id))?;
        if request.status != RequestStatus::Pending {
            return Err(EngineError::RequestNotPending {
                id,
                status: request.status,
            });
        }
        Ok(request.clone())
    }

    /// Apply generated text to a pending request.
    pub fn complete_compression(
        &mut self,
        id: RequestId,
        text: &str,
    ) -> Result<CompressionOutcome, EngineError> {
        let request = self.pending_request(id)?;
        match request.kind {
            RequestKind::Summarize => {
                let mut entities: BTreeSet<String> = BTreeSet::new();
                for member in &request.items {
                    entities.extend(self.graph.entities_of(*member).cloned());
                }
                match compression::merge_summary(&mut self.items, &request, text, &self.accountant)
                {
                    Ok(out) => {
                        for retired in &out.retired {
                            self.graph.retire(*retired);
                        }
                        let reg = self.graph.register_entities(out.anchor, entities, self.step);
                        if reg.edges_pruned > 0 {
                            self.emit(EngineEvent::EdgesPruned {
                                count: reg.edges_pruned,
                                remaining: self.graph.edge_count(),
                            });
                        }
                        self.task_state.token_spend += out.tokens as u64;
                        self.pipeline.mark_completed(id);
                        self.emit(EngineEvent::CompressionCompleted {
                            id,
                            level: CompressionLevel::Summarized,
                            retired: out.retired.len(),
                            tokens_saved: out.tokens_saved,
                        });
                        Ok(CompressionOutcome::Merged(out))
                    }
                    Err(reason) => Ok(CompressionOutcome::Rejected(self.fail(&request, reason))),
                }
            }
            RequestKind::Digest => {
                match compression::apply_digest(
                    &mut self.items,
                    &mut self.task_state,
                    &request,
                    text,
                    &self.accountant,
                    self.step,
                ) {
                    Ok(out) => {
                        for retired in &out.retired {
                            self.graph.retire(*retired);
                        }
                        self.digested += out.retired.len();
                        self.task_state.token_spend += out.tokens as u64;
                        self.pipeline.mark_completed(id);
                        self.emit(EngineEvent::CompressionCompleted {
                            id,
                            level: CompressionLevel::Digest,
                            retired: out.retired.len(),
                            tokens_saved: out.tokens_saved,
                        });
                        Ok(CompressionOutcome::Digested(out))
                    }
                    Err(reason) => Ok(CompressionOutcome::Rejected(self.fail(&request, reason))),
                }
            }
        }
    }

    /// Mark a pending request failed. Its items keep their level and become
    /// eligible again until they run out of attempts.
    pub fn fail_compression(
        &mut self,
        id: RequestId,
        reason: impl Into<String>,
    ) -> Result<EngineWarning, EngineError> {
        let request = self.pending_request(id)?;
        Ok(self.fail(&request, reason.into()))
    }

    fn fail(&mut self, request: &CompressionRequest, reason: String) -> EngineWarning {
        for member in &request.items {
            if let Some(it) = self.items.get_mut(member)
                && it.pending_request == Some(request.id)
            {
                it.compression_attempts += 1;
                it.pending_request = None;
            }
        }
        self.emit(EngineEvent::CompressionFailed {
            id: request.id,
            items: &request.items,
            reason: &reason,
        });
        self.pipeline.mark_failed(request.id, reason.clone());
        let warning = EngineWarning::CompressionFailed {
            request_id: request.id,
            items: request.items.clone(),
            reason,
        };
        self.warnings.push(warning.clone());
        warning
    }

    // ── Packing ───────────────────────────────────────────────────

    /// Assemble the window for `budget - reservation` tokens at the current
    /// step. Warnings accumulated since the previous pack are included.
    pub fn pack(&mut self, budget: usize, reservation: usize) -> PackedWindow {
        let now = self.step;
        self.mask_due(now);
        self.refresh_importance(false);

        let packer = WindowPacker {
            tiers: &self.tiers,
            graph: &self.graph,
            accountant: &self.accountant,
            profile: &self.config.domain,
        };
        let mut window = packer.pack(&mut self.items, &self.task_state, budget, reservation, now);

        for w in &window.warnings {
            if let EngineWarning::ItemTooLarge {
                id,
                tokens,
                ceiling,
                tier,
            } = w
            {
                self.emit(EngineEvent::Truncated {
                    id: *id,
                    tokens: *tokens,
                    ceiling: *ceiling,
                    tier: *tier,
                });
            }
        }
        for fr in &window.force_retained {
            self.emit(EngineEvent::ForceRetained {
                kept: fr.kept,
                tier: fr.tier,
                displaced: &fr.displaced,
            });
        }

        let mut warnings = std::mem::take(&mut self.warnings);
        warnings.append(&mut window.warnings);
        window.warnings = warnings;
        self.packed_usage = usage_by_tier(&window);
        self.emit(EngineEvent::Packed { window: &window });
        window
    }

    /// Pack with the configured window budget and output reservation.
    pub fn pack_window(&mut self) -> PackedWindow {
        self.pack(self.config.window_budget(), self.config.output_reservation)
    }

    // ── Checkpoints ───────────────────────────────────────────────

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            step: self.step,
            next_item_id: self.next_item_id,
            goal: self.task_state.goal.clone(),
            items: self.items.values().cloned().collect(),
            task_state: self.task_state.clone(),
            graph: self.graph.snapshot(),
            digested: self.digested,
        }
    }

    /// Capture the current state.
    pub fn checkpoint(&mut self) -> CheckpointId {
        let id = self.checkpoints.capture(self.snapshot());
        self.emit(EngineEvent::CheckpointTaken {
            id,
            step: self.step,
        });
        id
    }

    /// Replace all in-memory state with checkpoint `id`. Pending requests
    /// are failed; their completions would refer to replaced items.
    pub fn restore(&mut self, id: CheckpointId) -> Result<(), EngineError> {
        let snapshot = self
            .checkpoints
            .get(id)
            .map(|c| c.snapshot.clone())
            .ok_or(EngineError::UnknownCheckpoint(id))?;
        let dropped = self.pipeline.drop_pending("superseded by restore");
        self.apply_snapshot(&snapshot);
        self.checkpoints.rewind_to(snapshot.step);
        self.emit(EngineEvent::Restored {
            id,
            step: snapshot.step,
            dropped_requests: dropped.len(),
        });
        Ok(())
    }

    fn apply_snapshot(&mut self, snapshot: &EngineSnapshot) {
        self.items = snapshot.items.iter().map(|it| (it.id, it.clone())).collect();
        for item in self.items.values_mut() {
            item.pending_request = None;
        }
        self.task_state = snapshot.task_state.clone();
        self.graph = EntanglementIndex::from_snapshot(self.config.entanglement.clone(), &snapshot.graph);
        self.step = snapshot.step;
        self.next_item_id = snapshot.next_item_id;
        self.digested = snapshot.digested;
        self.packed_usage = [(0, 0); 3];
        // Restored scores were computed against the restored goal.
        self.goal = GoalTerms::new(&self.task_state.goal);
        self.goal_source = self.task_state.goal.clone();
    }

    /// Most recent retained checkpoint taken at or before `step`.
    pub fn checkpoint_before(&self, step: u64) -> Option<CheckpointId> {
        self.checkpoints.latest_at_or_before(step).map(|c| c.id)
    }

    /// Restore the latest checkpoint at or before `step`.
    pub fn recover(&mut self, step: u64) -> Result<CheckpointId, EngineError> {
        let id = self.checkpoint_before(step).ok_or_else(|| {
            EngineError::CorruptState(format!("no checkpoint at or before step {step}"))
        })?;
        self.restore(id)?;
        Ok(id)
    }

    // ── Inspection ────────────────────────────────────────────────

    pub fn stats(&self) -> EngineStats {
        let nominal = self
            .config
            .window_budget()
            .saturating_sub(self.config.output_reservation);
        let ceilings = TierBudgets::split(nominal, &self.config.tiers.ratios);
        let tiers = Tier::ALL
            .iter()
            .map(|tier| {
                let (items, tokens) = self.packed_usage[tier.index()];
                TierUtilization {
                    tier: *tier,
                    items,
                    tokens,
                    ceiling: ceilings.ceiling(*tier),
                }
            })
            .collect();
        let levels = CompressionLevel::ALL
            .iter()
            .map(|level| {
                let live = self
                    .items
                    .values()
                    .filter(|it| it.compression_level == *level)
                    .count();
                let retired = if *level == CompressionLevel::Digest {
                    self.digested
                } else {
                    0
                };
                (*level, live + retired)
            })
            .collect();
        EngineStats {
            step: self.step,
            live_items: self.items.len(),
            tiers,
            levels,
            pending_requests: self.pipeline.pending_count(),
            edge_count: self.graph.edge_count(),
            checkpoint_count: self.checkpoints.len(),
            current_tokens: self.items.values().map(|it| it.current_token_count).sum(),
            raw_tokens: self.items.values().map(|it| it.raw_token_count).sum(),
            token_spend: self.task_state.token_spend,
        }
    }

    /// Check the engine's invariants. On `Err`, recover with
    /// [`recover`](Self::recover).
    pub fn verify(&self) -> Result<(), EngineError> {
        let corrupt = |msg: String| -> Result<(), EngineError> {
            Err(EngineError::CorruptState(msg))
        };
        for (key, item) in &self.items {
            if *key != item.id {
                return corrupt(format!("{} stored under {key}", item.id));
            }
            if item.id.0 >= self.next_item_id {
                return corrupt(format!("{} is ahead of the id counter", item.id));
            }
            if item.current_token_count > item.raw_token_count {
                return corrupt(format!(
                    "{} costs {} tokens, more than its raw {}",
                    item.id, item.current_token_count, item.raw_token_count
                ));
            }
            if !(0.0..=1.0).contains(&item.importance) {
                return corrupt(format!("{} has importance {}", item.id, item.importance));
            }
            if item.is_pinned() && item.compression_level != CompressionLevel::Verbatim {
                return corrupt(format!("pinned {} was compressed", item.id));
            }
            if let Some(r) = item.pending_request
                && !self.pipeline.is_pending(r)
            {
                return corrupt(format!("{} waits on {r}, which is not pending", item.id));
            }
            if !self.graph.contains(item.id) {
                return corrupt(format!("{} is missing from the entanglement graph", item.id));
            }
        }
        if self.graph.node_count() != self.items.len() {
            return corrupt(format!(
                "graph tracks {} items, engine holds {}",
                self.graph.node_count(),
                self.items.len()
            ));
        }
        self.graph
            .check_consistency()
            .map_err(EngineError::CorruptState)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventObserver, NoopHandler};
    use std::sync::{Arc, Mutex};

    fn engine() -> ContextEngine {
        ContextEngine::new(EngineConfig::default())
            .unwrap()
            .with_event_handler(NoopHandler)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = ContextEngine::new(EngineConfig::default().with_tier_ratios(0.5, 0.5, 0.5))
            .unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }

    #[test]
    fn add_item_tracks_tokens_and_spend() {
        let mut e = engine();
        let id = e.add_item(ItemKind::UserMessage, "x".repeat(35), 0);
        let it = e.item(id).unwrap();
        assert_eq!(it.raw_token_count, 10);
        assert_eq!(it.current_token_count, 10);
        assert_eq!(it.compression_level, CompressionLevel::Verbatim);
        assert_eq!(e.task_state().token_spend, 10);
    }

    #[test]
    fn shared_entities_count_as_references() {
        let mut e = engine();
        let a = e.add_item(ItemKind::ToolResult, "auth.py raised 401 at login", 0);
        e.add_item(ItemKind::AssistantMessage, "the 401 in auth.py is a stale token", 3);
        let it = e.item(a).unwrap();
        assert_eq!(it.reference_count, 1);
        assert_eq!(it.last_referenced_step, 3);
    }

    #[test]
    fn mark_reference_unknown_item() {
        let mut e = engine();
        assert!(matches!(
            e.mark_reference(ItemId(42), 1),
            Err(EngineError::UnknownItem(ItemId(42)))
        ));
    }

    #[test]
    fn mark_reference_invalidates_importance() {
        let mut e = engine();
        let id = e.add_item(ItemKind::UserMessage, "hello", 0);
        e.maintain(1);
        assert!(!e.item(id).unwrap().importance_stale);
        e.mark_reference(id, 2).unwrap();
        let it = e.item(id).unwrap();
        assert!(it.importance_stale);
        assert_eq!(it.reference_count, 1);
    }

    #[test]
    fn outcome_credits_recent_items_only() {
        let mut e = engine();
        let old = e.add_item(ItemKind::UserMessage, "old", 0);
        let recent = e.add_item(ItemKind::UserMessage, "recent", 18);
        assert_eq!(e.mark_outcome(20, true), 1);
        assert_eq!(e.item(recent).unwrap().outcome_successes, 1);
        assert_eq!(e.item(old).unwrap().outcome_successes, 0);
    }

    #[test]
    fn goal_edits_through_task_state_are_picked_up() {
        let mut e = engine();
        let id = e.add_item(ItemKind::UserMessage, "refactor the parser module", 0);
        let before = e.importance_breakdown(id).unwrap().relevance;
        e.task_state_mut().goal = "refactor parser".into();
        let after = e.importance_breakdown(id).unwrap().relevance;
        assert_eq!(before, 0.0);
        assert!(after > 0.0);
    }

    #[test]
    fn failed_compression_keeps_level_and_warns() {
        let mut e = engine();
        let id = e.add_item(ItemKind::ToolResult, "grep output line", 0);
        e.maintain(11);
        let report = e.maintain(60);
        assert_eq!(report.requests.len(), 1);
        let req = report.requests[0].id;
        assert_eq!(e.item(id).unwrap().pending_request, Some(req));

        let warning = e.fail_compression(req, "provider down").unwrap();
        assert!(matches!(warning, EngineWarning::CompressionFailed { .. }));
        let it = e.item(id).unwrap();
        assert_eq!(it.compression_level, CompressionLevel::Masked);
        assert_eq!(it.pending_request, None);
        assert_eq!(it.compression_attempts, 1);
        assert!(matches!(
            e.fail_compression(req, "again"),
            Err(EngineError::RequestNotPending { .. })
        ));

        let window = e.pack(10_000, 0);
        assert_eq!(window.warnings, vec![warning]);
        assert!(e.pack(10_000, 0).warnings.is_empty());

        // Eligible again on the next pass.
        assert_eq!(e.maintain(61).requests.len(), 1);
    }

    #[test]
    fn oversized_summary_is_rejected() {
        let mut e = engine();
        let id = e.add_item(ItemKind::AssistantMessage, "short", 0);
        e.maintain(11);
        let req = e.maintain(60).requests[0].id;
        let outcome = e
            .complete_compression(req, &"much longer than the original ".repeat(10))
            .unwrap();
        assert!(matches!(outcome, CompressionOutcome::Rejected(_)));
        assert_eq!(e.item(id).unwrap().compression_level, CompressionLevel::Masked);
        assert_eq!(e.request(req).map(|r| r.status), Some(RequestStatus::Failed));
    }

    #[test]
    fn merge_retires_members_and_keeps_anchor_entities() {
        let mut e = engine();
        let a = e.add_item(ItemKind::ToolResult, "read src/lib.rs: 400 lines", 0);
        let b = e.add_item(ItemKind::AssistantMessage, "config.toml needs a [server] section", 1);
        let c = e.add_item(ItemKind::System, "Project settings live in config.toml", 1);
        e.maintain(12);
        let report = e.maintain(60);
        assert_eq!(report.requests.len(), 1);
        assert_eq!(report.requests[0].items, vec![a, b]);

        let outcome = e
            .complete_compression(report.requests[0].id, "Read src/lib.rs; config.toml edit")
            .unwrap();
        let CompressionOutcome::Merged(out) = outcome else {
            panic!("expected a merge");
        };
        assert_eq!(out.anchor, a);
        assert_eq!(out.retired, vec![b]);
        assert!(e.item(b).is_none());
        let anchor = e.item(a).unwrap();
        assert_eq!(anchor.compression_level, CompressionLevel::Summarized);
        assert_eq!(anchor.merged_from, vec![b]);
        // The anchor inherits b's link to c.
        assert!(e.graph().edge(a, c).is_some());
        e.verify().unwrap();
    }

    #[test]
    fn digest_folds_into_task_state() {
        let mut e = engine();
        let id = e.add_item(ItemKind::AssistantMessage, "decided to use serde", 0);
        e.maintain(11);
        let req = e.maintain(51).requests[0].id;
        let merged = e.complete_compression(req, "Chose serde").unwrap();
        assert!(matches!(merged, CompressionOutcome::Merged(_)));
        let req = e.maintain(251).requests[0].id;
        let text = "DECISIONS:\n- use serde | derive support\nPROGRESS: 40\n";
        let outcome = e.complete_compression(req, text).unwrap();
        assert!(matches!(outcome, CompressionOutcome::Digested(_)));
        assert!(e.item(id).is_none());
        assert_eq!(e.task_state().progress, 40);
        assert_eq!(e.task_state().decisions[0].decision, "use serde");
        let stats = e.stats();
        assert_eq!(stats.level_count(CompressionLevel::Digest), 1);
        assert_eq!(stats.live_items, 0);
        e.verify().unwrap();
    }

    #[test]
    fn unknown_request_and_checkpoint() {
        let mut e = engine();
        assert!(matches!(
            e.complete_compression(RequestId(9), "x"),
            Err(EngineError::UnknownRequest(_))
        ));
        assert!(matches!(
            e.restore(CheckpointId(9)),
            Err(EngineError::UnknownCheckpoint(_))
        ));
        assert!(e.checkpoint_before(100).is_none());
        assert!(matches!(e.recover(100), Err(EngineError::CorruptState(_))));
    }

    #[test]
    fn restore_drops_pending_requests() {
        let mut e = engine();
        let id = e.add_item(ItemKind::ToolResult, "ls output", 0);
        e.maintain(11);
        let cp = e.checkpoint();
        let req = e.maintain(60).requests[0].id;
        e.restore(cp).unwrap();
        assert_eq!(e.request(req).map(|r| r.status), Some(RequestStatus::Failed));
        assert_eq!(e.item(id).unwrap().pending_request, None);
        assert_eq!(e.step(), 11);
        assert!(matches!(
            e.complete_compression(req, "late summary"),
            Err(EngineError::RequestNotPending { .. })
        ));
    }

    #[test]
    fn verify_detects_corruption_and_recover_fixes_it() {
        let mut e = engine();
        let id = e.add_item(ItemKind::UserMessage, "some content here", 5);
        let cp = e.checkpoint();
        e.verify().unwrap();

        if let Some(it) = e.items.get_mut(&id) {
            it.current_token_count = it.raw_token_count + 1;
        }
        assert!(matches!(e.verify(), Err(EngineError::CorruptState(_))));
        assert_eq!(e.recover(5).unwrap(), cp);
        e.verify().unwrap();
    }

    #[test]
    fn automatic_checkpoints_follow_interval() {
        let mut e = ContextEngine::new(EngineConfig::default().with_checkpoint_interval(10))
            .unwrap()
            .with_event_handler(NoopHandler);
        assert!(e.maintain(5).checkpoint.is_none());
        assert!(e.maintain(10).checkpoint.is_some());
        assert!(e.maintain(15).checkpoint.is_none());
        assert!(e.maintain(20).checkpoint.is_some());
        assert_eq!(e.stats().checkpoint_count, 2);
    }

    #[test]
    fn checkpoint_interval_restarts_after_restore() {
        let mut e = ContextEngine::new(EngineConfig::default().with_checkpoint_interval(10))
            .unwrap()
            .with_event_handler(NoopHandler);
        e.add_item(ItemKind::UserMessage, "start", 1);
        let cp = e.maintain(10).checkpoint.unwrap();
        assert!(e.maintain(100).checkpoint.is_some());

        e.restore(cp).unwrap();
        assert_eq!(e.step(), 10);
        let taken: Vec<u64> = (11..=60)
            .filter(|step| e.maintain(*step).checkpoint.is_some())
            .collect();
        assert_eq!(taken, vec![20, 30, 40, 50, 60]);
    }

    #[test]
    fn events_reach_the_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let mut e = ContextEngine::new(EngineConfig::default())
            .unwrap()
            .with_event_handler(EventObserver::new(move |event| {
                let name = match event {
                    EngineEvent::ItemAdded { .. } => "added",
                    EngineEvent::CheckpointTaken { .. } => "checkpoint",
                    EngineEvent::Packed { .. } => "packed",
                    _ => return,
                };
                sink.lock().unwrap().push(name);
            }));
        e.add_item(ItemKind::UserMessage, "hi", 0);
        e.checkpoint();
        e.pack(1_000, 0);
        assert_eq!(*log.lock().unwrap(), vec!["added", "checkpoint", "packed"]);
    }

    #[test]
    fn stats_report_levels_and_tiers() {
        let mut e = engine();
        e.add_item(ItemKind::System, "You are careful.", 0);
        e.add_item(ItemKind::UserMessage, "first", 0);
        e.add_item(ItemKind::UserMessage, "second", 20);
        e.maintain(20);
        e.pack_window();
        let stats = e.stats();
        assert_eq!(stats.live_items, 3);
        assert_eq!(stats.level_count(CompressionLevel::Verbatim), 2);
        assert_eq!(stats.level_count(CompressionLevel::Masked), 1);
        let hot = stats.tier(Tier::Hot).unwrap();
        assert!(hot.items >= 2);
        assert!(hot.ceiling > 0);
        assert!(stats.to_log_string().contains("3 items"));
    }

    #[test]
    fn tier_usage_counts_only_packed_items() {
        let mut e = engine();
        for _ in 0..20 {
            e.add_item(ItemKind::UserMessage, "m".repeat(700), 0);
        }
        let window = e.pack(1000, 0);
        assert!(!window.excluded.is_empty());

        let stats = e.stats();
        let counted: usize = stats.tiers.iter().map(|t| t.items).sum();
        let packed = window.items.iter().filter(|p| p.id.is_some()).count();
        assert_eq!(counted, packed);
        assert!(counted < 20);

        let cold = stats.tier(Tier::Cold).unwrap();
        assert_eq!(cold.tokens, window.tier_totals.cold);
        assert!(cold.tokens <= window.ceilings.ceiling(Tier::Cold));
    }
}
