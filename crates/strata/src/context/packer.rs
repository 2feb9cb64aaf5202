//! Window packer: assembles the ordered, budget-respecting context window.
//!
//! The window is laid out in four sections, in this fixed order:
//!
//! 1. **Pinned**: system items, the rendered task state, then any other
//!    preserved items. Never compressed, never tiered out.
//! 2. **Warm**: compressed mid-history, by descending priority.
//! 3. **Cold**: long-tail items, by descending priority.
//! 4. **Hot**: recent turns in chronological order, most recent last.
//!
//! Stable background material sits at the edges and volatile recent turns
//! sit last, where retrieval bias is strongest. The token total is
//! recomputed from scratch on every pack and never exceeds
//! `budget - reservation`.

use crate::config::DomainProfile;
use crate::context::entanglement::{EntanglementIndex, MissingPartner, Scored};
use crate::context::tiers::{ForceRetained, TierBudgets, TierCandidate, TierManager};
use crate::context::tokens::TokenAccountant;
use crate::error::EngineWarning;
use crate::item::{CompressionLevel, ContextItem, ItemId, ItemKind, TaskState, Tier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Window section an entry was packed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Pinned,
    Warm,
    Cold,
    Hot,
}

impl Section {
    fn of(tier: Tier) -> Self {
        match tier {
            Tier::Hot => Section::Hot,
            Tier::Warm => Section::Warm,
            Tier::Cold => Section::Cold,
        }
    }
}

/// One entry of the packed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedItem {
    /// `None` for the rendered task state.
    pub id: Option<ItemId>,
    pub kind: ItemKind,
    pub section: Section,
    /// `None` for the rendered task state.
    pub level: Option<CompressionLevel>,
    pub content: String,
    pub tokens: usize,
    pub truncated: bool,
    pub created_step: u64,
}

/// Tokens packed per section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTotals {
    pub pinned: usize,
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
}

impl TierTotals {
    pub fn total(&self) -> usize {
        self.pinned + self.hot + self.warm + self.cold
    }

    fn add(&mut self, section: Section, tokens: usize) {
        match section {
            Section::Pinned => self.pinned += tokens,
            Section::Hot => self.hot += tokens,
            Section::Warm => self.warm += tokens,
            Section::Cold => self.cold += tokens,
        }
    }
}

/// Output of one packing pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackedWindow {
    pub items: Vec<PackedItem>,
    pub tier_totals: TierTotals,
    /// Tier ceilings used for this pass, after the pinned section.
    pub ceilings: TierBudgets,
    /// `budget - reservation`.
    pub budget: usize,
    pub truncated_ids: Vec<ItemId>,
    /// Entangled partners of packed items that were left out.
    pub broken_pairs: Vec<MissingPartner>,
    /// Items retained for a partner, and what they displaced.
    pub force_retained: Vec<ForceRetained>,
    /// Live items that did not make it into the window.
    pub excluded: Vec<ItemId>,
    pub warnings: Vec<EngineWarning>,
}

impl PackedWindow {
    pub fn total_tokens(&self) -> usize {
        self.items.iter().map(|i| i.tokens).sum()
    }

    /// Ids of packed items, in window order.
    pub fn ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.items.iter().filter_map(|i| i.id)
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.ids().any(|i| i == id)
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        let t = &self.tier_totals;
        format!(
            "window: {} items, ~{} of {} tokens (pinned {}, warm {}, cold {}, hot {}), {} excluded, {} truncated",
            self.items.len(),
            t.total(),
            self.budget,
            t.pinned,
            t.warm,
            t.cold,
            t.hot,
            self.excluded.len(),
            self.truncated_ids.len(),
        )
    }
}

/// Borrowed view over the engine components packing needs.
pub struct WindowPacker<'a> {
    pub tiers: &'a TierManager,
    pub graph: &'a EntanglementIndex,
    pub accountant: &'a TokenAccountant,
    pub profile: &'a DomainProfile,
}

struct PinnedEntry<'a> {
    id: Option<ItemId>,
    kind: ItemKind,
    level: Option<CompressionLevel>,
    content: &'a str,
    tokens: usize,
    created_step: u64,
}

impl<'a> PinnedEntry<'a> {
    fn of(it: &'a ContextItem) -> Self {
        Self {
            id: Some(it.id),
            kind: it.kind,
            level: Some(it.compression_level),
            content: it.content.as_str(),
            tokens: it.current_token_count,
            created_step: it.created_step,
        }
    }
}

impl WindowPacker<'_> {
    /// Pack `items` into `budget - reservation` tokens. Item tiers and
    /// `truncated` flags are written back; content is never modified.
    pub fn pack(
        &self,
        items: &mut BTreeMap<ItemId, ContextItem>,
        task_state: &TaskState,
        budget: usize,
        reservation: usize,
        now: u64,
    ) -> PackedWindow {
        let effective = budget.saturating_sub(reservation);
        let mut window = PackedWindow {
            budget: effective,
            ..PackedWindow::default()
        };

        // ── Pinned section ──
        let rendered = task_state.render();
        let mut pinned: Vec<PinnedEntry<'_>> = Vec::new();
        let mut preserved: Vec<&ContextItem> =
            items.values().filter(|it| self.profile.preserves(it)).collect();
        preserved.sort_by_key(|it| (it.kind != ItemKind::System, it.created_step, it.id));
        let split = preserved
            .iter()
            .position(|it| it.kind != ItemKind::System)
            .unwrap_or(preserved.len());
        pinned.extend(preserved.iter().copied().take(split).map(PinnedEntry::of));
        if !rendered.is_empty() {
            pinned.push(PinnedEntry {
                id: None,
                kind: ItemKind::TaskState,
                level: None,
                content: &rendered,
                tokens: self.accountant.estimate(&rendered),
                created_step: now,
            });
        }
        pinned.extend(preserved.iter().copied().skip(split).map(PinnedEntry::of));

        let mut remaining = effective;
        let mut pinned_ids: Vec<ItemId> = Vec::new();
        let mut pinned_truncated: Vec<ItemId> = Vec::new();
        for entry in pinned {
            if let Some(id) = entry.id {
                pinned_ids.push(id);
            }
            if entry.tokens <= remaining {
                remaining -= entry.tokens;
                window.tier_totals.add(Section::Pinned, entry.tokens);
                window.items.push(PackedItem {
                    id: entry.id,
                    kind: entry.kind,
                    section: Section::Pinned,
                    level: entry.level,
                    content: entry.content.to_string(),
                    tokens: entry.tokens,
                    truncated: false,
                    created_step: entry.created_step,
                });
                continue;
            }
            window.warnings.push(EngineWarning::ItemTooLarge {
                id: entry.id,
                tokens: entry.tokens,
                ceiling: remaining,
                tier: None,
            });
            let cut = self.accountant.truncate_to(entry.content, remaining);
            let tokens = self.accountant.estimate(&cut);
            if cut.is_empty() || tokens > remaining {
                if let Some(id) = entry.id {
                    window.excluded.push(id);
                }
                continue;
            }
            remaining -= tokens;
            if let Some(id) = entry.id {
                window.truncated_ids.push(id);
                pinned_truncated.push(id);
            }
            window.tier_totals.add(Section::Pinned, tokens);
            window.items.push(PackedItem {
                id: entry.id,
                kind: entry.kind,
                section: Section::Pinned,
                level: entry.level,
                content: cut,
                tokens,
                truncated: true,
                created_step: entry.created_step,
            });
        }
        for id in &pinned_ids {
            if let Some(it) = items.get_mut(id) {
                it.tier = Tier::Hot;
                it.truncated = pinned_truncated.contains(id);
            }
        }

        // ── Tiered sections ──
        let ceilings = TierBudgets::split(remaining, &self.tiers.config().ratios);
        window.ceilings = ceilings;

        let tiered: Vec<&ContextItem> = items
            .values()
            .filter(|it| !self.profile.preserves(it))
            .collect();
        let mut scored: Vec<Scored> = tiered
            .iter()
            .map(|it| Scored {
                id: it.id,
                priority: it.importance,
            })
            .collect();
        self.graph.boost(&mut scored);
        let candidates: Vec<TierCandidate> = tiered
            .iter()
            .zip(&scored)
            .map(|(it, s)| TierCandidate {
                id: it.id,
                tier: self.tiers.classify(it, now),
                priority: s.priority,
                tokens: it.current_token_count,
                created_step: it.created_step,
            })
            .collect();

        let assignment = self.tiers.assign(candidates, &ceilings, self.graph);
        window.warnings.extend(assignment.warnings.iter().cloned());
        window.force_retained = assignment.force_retained.clone();

        let mut placed = assignment.placed.clone();
        placed.sort_by(|a, b| {
            let rank = |t: Tier| match t {
                Tier::Warm => 0,
                Tier::Cold => 1,
                Tier::Hot => 2,
            };
            rank(a.tier).cmp(&rank(b.tier)).then_with(|| match a.tier {
                Tier::Hot => a
                    .candidate
                    .created_step
                    .cmp(&b.candidate.created_step)
                    .then(a.candidate.id.cmp(&b.candidate.id)),
                Tier::Warm | Tier::Cold => b
                    .candidate
                    .priority
                    .total_cmp(&a.candidate.priority)
                    .then(a.candidate.created_step.cmp(&b.candidate.created_step))
                    .then(a.candidate.id.cmp(&b.candidate.id)),
            })
        });

        for p in &placed {
            let Some(item) = items.get_mut(&p.candidate.id) else {
                continue;
            };
            item.tier = p.tier;
            let section = Section::of(p.tier);
            let (content, tokens, truncated) = match p.truncated_to {
                Some(limit) => {
                    item.truncated = true;
                    window.truncated_ids.push(item.id);
                    let cut = self.accountant.truncate_to(&item.content, limit);
                    let tokens = self.accountant.estimate(&cut);
                    (cut, tokens, true)
                }
                None => {
                    item.truncated = false;
                    (item.content.clone(), item.current_token_count, false)
                }
            };
            window.tier_totals.add(section, tokens);
            window.items.push(PackedItem {
                id: Some(item.id),
                kind: item.kind,
                section,
                level: Some(item.compression_level),
                content,
                tokens,
                truncated,
                created_step: item.created_step,
            });
        }
        for id in &assignment.excluded {
            if let Some(it) = items.get_mut(id) {
                it.tier = Tier::Cold;
                it.truncated = false;
            }
            window.excluded.push(*id);
        }

        let included: HashSet<ItemId> = window.ids().collect();
        window.broken_pairs = self
            .graph
            .missing_partners(&included, self.graph.config().retain_threshold);
        debug_assert!(window.total_tokens() <= effective);
        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionThresholds, EntanglementConfig, TierConfig};
    use crate::item::ItemDraft;

    struct Fixture {
        tiers: TierManager,
        graph: EntanglementIndex,
        accountant: TokenAccountant,
        profile: DomainProfile,
        items: BTreeMap<ItemId, ContextItem>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tiers: TierManager::new(TierConfig::default(), CompressionThresholds::default()),
                graph: EntanglementIndex::new(EntanglementConfig::default()),
                accountant: TokenAccountant::default(),
                profile: DomainProfile::default(),
                items: BTreeMap::new(),
            }
        }

        fn add(&mut self, id: u64, kind: ItemKind, content: &str, step: u64, importance: f64) {
            let tokens = self.accountant.estimate(content);
            let mut it =
                ContextItem::from_draft(ItemId(id), ItemDraft::new(kind, content), tokens, step);
            it.importance = importance;
            it.importance_stale = false;
            self.graph.register(it.id, content, step);
            self.items.insert(it.id, it);
        }

        fn pack(&mut self, state: &TaskState, budget: usize, reserve: usize, now: u64) -> PackedWindow {
            let packer = WindowPacker {
                tiers: &self.tiers,
                graph: &self.graph,
                accountant: &self.accountant,
                profile: &self.profile,
            };
            packer.pack(&mut self.items, state, budget, reserve, now)
        }
    }

    #[test]
    fn sections_follow_fixed_order() {
        let mut f = Fixture::new();
        f.add(1, ItemKind::System, "You are a careful agent.", 0, 0.0);
        f.add(2, ItemKind::UserMessage, "old question about parsing", 0, 0.9);
        f.add(3, ItemKind::AssistantMessage, "old low value chatter", 1, 0.1);
        f.add(4, ItemKind::UserMessage, "recent one", 98, 0.5);
        f.add(5, ItemKind::UserMessage, "most recent", 99, 0.5);
        let state = TaskState {
            goal: "ship the parser".into(),
            ..TaskState::default()
        };
        let w = f.pack(&state, 10_000, 0, 100);

        let sections: Vec<Section> = w.items.iter().map(|i| i.section).collect();
        assert_eq!(
            sections,
            vec![
                Section::Pinned,
                Section::Pinned,
                Section::Warm,
                Section::Cold,
                Section::Hot,
                Section::Hot
            ]
        );
        assert_eq!(w.items[0].id, Some(ItemId(1)));
        assert_eq!(w.items[1].kind, ItemKind::TaskState);
        assert_eq!(w.items[1].id, None);
        assert_eq!(w.items[4].id, Some(ItemId(4)));
        assert_eq!(w.items[5].id, Some(ItemId(5)));
        assert_eq!(f.items[&ItemId(3)].tier, Tier::Cold);
        assert_eq!(f.items[&ItemId(1)].tier, Tier::Hot);
    }

    #[test]
    fn budget_minus_reservation_is_respected() {
        let mut f = Fixture::new();
        for i in 0..40 {
            f.add(i, ItemKind::UserMessage, &"lorem ipsum ".repeat(20), i, 0.5);
        }
        for (budget, reserve) in [(500, 100), (1_000, 0), (50, 10), (10, 10)] {
            let w = f.pack(&TaskState::default(), budget, reserve, 40);
            assert!(w.total_tokens() <= budget - reserve);
            assert_eq!(w.tier_totals.total(), w.total_tokens());
        }
    }

    #[test]
    fn each_item_appears_at_most_once() {
        let mut f = Fixture::new();
        for i in 0..20 {
            f.add(i, ItemKind::ToolResult, &format!("`shared.rs` result {i}"), i, 0.4);
        }
        let w = f.pack(&TaskState::default(), 300, 0, 25);
        let mut seen = HashSet::new();
        for id in w.ids() {
            assert!(seen.insert(id));
        }
        for id in &w.excluded {
            assert!(!seen.contains(id));
        }
        assert_eq!(seen.len() + w.excluded.len(), 20);
    }

    #[test]
    fn oversized_item_is_truncated_not_dropped() {
        let mut f = Fixture::new();
        f.add(1, ItemKind::ToolResult, &"z".repeat(4_000), 0, 0.5);
        let w = f.pack(&TaskState::default(), 400, 0, 1);
        assert!(w.contains(ItemId(1)));
        assert_eq!(w.truncated_ids, vec![ItemId(1)]);
        assert!(w.total_tokens() <= 400);
        assert!(f.items[&ItemId(1)].truncated);
        assert_eq!(f.items[&ItemId(1)].content.len(), 4_000);
        assert!(matches!(w.warnings[0], EngineWarning::ItemTooLarge { .. }));
    }

    #[test]
    fn tiny_window_keeps_a_non_empty_cut() {
        let mut f = Fixture::new();
        f.add(1, ItemKind::AssistantMessage, &"q".repeat(3_500), 0, 0.5);
        let w = f.pack(&TaskState::default(), 20, 0, 0);
        let packed = w.items.iter().find(|p| p.id == Some(ItemId(1))).unwrap();
        assert!(packed.truncated);
        assert!(!packed.content.is_empty());
        assert!(packed.tokens > 0);
        assert!(w.total_tokens() <= 20);
    }

    #[test]
    fn truncated_flag_reflects_the_latest_pack() {
        let mut f = Fixture::new();
        f.add(1, ItemKind::ToolResult, &"z".repeat(700), 0, 0.5);
        f.pack(&TaskState::default(), 100, 0, 1);
        assert!(f.items[&ItemId(1)].truncated);

        let w = f.pack(&TaskState::default(), 2_000, 0, 1);
        assert!(w.truncated_ids.is_empty());
        assert!(!f.items[&ItemId(1)].truncated);
    }

    #[test]
    fn oversized_task_state_is_truncated_with_warning() {
        let mut f = Fixture::new();
        let state = TaskState {
            goal: "g".repeat(2_000),
            ..TaskState::default()
        };
        let w = f.pack(&state, 100, 0, 0);
        assert!(w.total_tokens() <= 100);
        assert!(w.items[0].truncated);
        assert!(matches!(
            w.warnings[0],
            EngineWarning::ItemTooLarge { id: None, tier: None, .. }
        ));
    }

    #[test]
    fn broken_pairs_are_reported() {
        let mut f = Fixture::new();
        let shared = "`auth.py` `401` `refresh` ";
        f.add(1, ItemKind::ToolResult, &format!("{shared}{}", "a".repeat(70)), 250, 0.5);
        f.add(2, ItemKind::System, &format!("{shared}rules"), 0, 0.0);
        f.add(3, ItemKind::UserMessage, &"x".repeat(140), 250, 0.95);
        f.add(4, ItemKind::UserMessage, &"y".repeat(98), 0, 0.99);
        f.add(5, ItemKind::UserMessage, &"h".repeat(168), 295, 0.5);
        let w = f.pack(&TaskState::default(), 130, 0, 300);
        assert!(w.contains(ItemId(2)));
        assert!(!w.contains(ItemId(1)));
        assert_eq!(w.excluded, vec![ItemId(1)]);
        assert_eq!(w.broken_pairs.len(), 1);
        assert_eq!(w.broken_pairs[0].missing, ItemId(1));
        assert_eq!(w.broken_pairs[0].present_partner, ItemId(2));
    }

    #[test]
    fn log_string_mentions_budget() {
        let mut f = Fixture::new();
        f.add(1, ItemKind::UserMessage, "hi", 0, 0.5);
        let w = f.pack(&TaskState::default(), 1_000, 24, 0);
        let log = w.to_log_string();
        assert!(log.contains("window: 1 items"));
        assert!(log.contains("976"));
    }
}
