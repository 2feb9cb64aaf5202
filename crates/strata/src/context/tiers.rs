//! Tier manager: classifies items into hot/warm/cold and enforces per-tier
//! token ceilings.
//!
//! Acceptance runs tier by tier, hot first. Whatever a tier cannot hold
//! overflows into the next one; whatever cold cannot hold competes for the
//! surplus left under every ceiling, which expands the hot tier. Items that
//! still do not fit are excluded from the window (and parked in cold).
//!
//! Two exceptions to "stop when full":
//!
//! 1. An item larger than its tier's entire ceiling (and every later
//!    tier's) is hard-truncated into the room left, with an
//!    [`EngineWarning::ItemTooLarge`].
//! 2. An item with a strong entangled partner already accepted is
//!    force-kept; the lowest-priority items in the same tier are displaced
//!    into the next tier instead.

use crate::config::{CompressionThresholds, TierConfig, TierRatios};
use crate::context::entanglement::EntanglementIndex;
use crate::error::EngineWarning;
use crate::item::{ContextItem, ItemId, Tier};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Token ceilings for one packing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBudgets {
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    /// Rounding remainder; joins the surplus phase.
    pub remainder: usize,
}

impl TierBudgets {
    /// Split `total` by `ratios`, rounding each tier down.
    pub fn split(total: usize, ratios: &TierRatios) -> Self {
        let share = |r: f64| ((total as f64) * r).floor() as usize;
        let hot = share(ratios.hot).min(total);
        let warm = share(ratios.warm).min(total - hot);
        let cold = share(ratios.cold).min(total - hot - warm);
        Self {
            hot,
            warm,
            cold,
            remainder: total - hot - warm - cold,
        }
    }

    pub fn ceiling(&self, tier: Tier) -> usize {
        match tier {
            Tier::Hot => self.hot,
            Tier::Warm => self.warm,
            Tier::Cold => self.cold,
        }
    }

    pub fn total(&self) -> usize {
        self.hot + self.warm + self.cold + self.remainder
    }
}

/// An item competing for a place in the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierCandidate {
    pub id: ItemId,
    /// Tier from classification, before overflow.
    pub tier: Tier,
    /// Importance after the entanglement boost.
    pub priority: f64,
    pub tokens: usize,
    pub created_step: u64,
}

/// Where an accepted item ended up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub candidate: TierCandidate,
    pub tier: Tier,
    /// Tokens charged against the tier.
    pub tokens: usize,
    /// Set when content must be cut to this many tokens.
    pub truncated_to: Option<usize>,
    /// Kept because of an entangled partner.
    pub forced: bool,
}

/// An item kept for its partner at the expense of others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceRetained {
    pub kept: ItemId,
    pub tier: Tier,
    pub displaced: Vec<ItemId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierAssignment {
    pub placed: Vec<Placement>,
    pub excluded: Vec<ItemId>,
    pub force_retained: Vec<ForceRetained>,
    pub warnings: Vec<EngineWarning>,
}

impl TierAssignment {
    /// Tokens accepted into `tier`.
    pub fn used(&self, tier: Tier) -> usize {
        self.placed
            .iter()
            .filter(|p| p.tier == tier)
            .map(|p| p.tokens)
            .sum()
    }

    pub fn total(&self) -> usize {
        self.placed.iter().map(|p| p.tokens).sum()
    }
}

/// Importance desc; then newest first in hot, oldest first elsewhere; then id.
fn queue_order(tier: Tier, a: &TierCandidate, b: &TierCandidate) -> Ordering {
    let by_priority = b.priority.total_cmp(&a.priority);
    match tier {
        Tier::Hot => by_priority
            .then(b.created_step.cmp(&a.created_step))
            .then(b.id.cmp(&a.id)),
        Tier::Warm | Tier::Cold => by_priority
            .then(a.created_step.cmp(&b.created_step))
            .then(a.id.cmp(&b.id)),
    }
}

#[derive(Debug, Clone)]
pub struct TierManager {
    config: TierConfig,
    thresholds: CompressionThresholds,
}

impl TierManager {
    pub fn new(config: TierConfig, thresholds: CompressionThresholds) -> Self {
        Self { config, thresholds }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    /// Tier eligibility: recent items are hot; older ones are cold when
    /// they are long-tail (digest age) or unimportant, warm otherwise.
    pub fn classify(&self, item: &ContextItem, now: u64) -> Tier {
        let age = item.age(now);
        if item.is_pinned() || age < self.config.hot_recency_cutoff {
            Tier::Hot
        } else if age >= self.thresholds.digest
            || item.importance < self.config.cold_importance_floor
        {
            Tier::Cold
        } else {
            Tier::Warm
        }
    }

    /// Place candidates into tiers under `budgets`.
    pub fn assign(
        &self,
        candidates: Vec<TierCandidate>,
        budgets: &TierBudgets,
        graph: &EntanglementIndex,
    ) -> TierAssignment {
        let mut out = TierAssignment::default();
        let mut active: HashSet<ItemId> = HashSet::new();
        let mut by_tier: [Vec<TierCandidate>; 3] = Default::default();
        for c in candidates {
            by_tier[c.tier.index()].push(c);
        }

        let mut overflow: Vec<TierCandidate> = Vec::new();
        let mut used_total = 0;
        for tier in Tier::ALL {
            let mut queue = std::mem::take(&mut by_tier[tier.index()]);
            queue.append(&mut overflow);
            queue.sort_by(|a, b| queue_order(tier, a, b));

            let ceiling = budgets.ceiling(tier);
            let floor = self.config.min_truncated_tokens.min(ceiling);
            // Truncate only what no remaining tier could hold whole.
            let largest_remaining = Tier::ALL
                .iter()
                .filter(|t| t.index() >= tier.index())
                .map(|t| budgets.ceiling(*t))
                .max()
                .unwrap_or(ceiling);
            let mut used = 0;
            let mut accepted: Vec<Placement> = Vec::new();

            for c in queue {
                let allowance = ceiling - used;
                if c.tokens <= allowance {
                    used += c.tokens;
                    active.insert(c.id);
                    accepted.push(Placement {
                        candidate: c,
                        tier,
                        tokens: c.tokens,
                        truncated_to: None,
                        forced: false,
                    });
                    continue;
                }

                if c.tokens > largest_remaining && allowance > 0 && allowance >= floor {
                    out.warnings.push(EngineWarning::ItemTooLarge {
                        id: Some(c.id),
                        tokens: c.tokens,
                        ceiling,
                        tier: Some(tier),
                    });
                    used += allowance;
                    active.insert(c.id);
                    accepted.push(Placement {
                        candidate: c,
                        tier,
                        tokens: allowance,
                        truncated_to: Some(allowance),
                        forced: false,
                    });
                    continue;
                }

                if graph.should_retain(c.id, &active)
                    && let Some(victims) = pick_victims(&accepted, &c, c.tokens - allowance, graph)
                {
                    let mut displaced = Vec::with_capacity(victims.len());
                    accepted.retain(|p| {
                        if victims.contains(&p.candidate.id) {
                            used -= p.tokens;
                            active.remove(&p.candidate.id);
                            displaced.push(p.candidate.id);
                            overflow.push(p.candidate);
                            false
                        } else {
                            true
                        }
                    });
                    used += c.tokens;
                    active.insert(c.id);
                    accepted.push(Placement {
                        candidate: c,
                        tier,
                        tokens: c.tokens,
                        truncated_to: None,
                        forced: true,
                    });
                    out.force_retained.push(ForceRetained {
                        kept: c.id,
                        tier,
                        displaced,
                    });
                    continue;
                }

                overflow.push(c);
            }
            used_total += used;
            out.placed.extend(accepted);
        }

        // Surplus under every ceiling goes to the hot tier: recent items
        // first (newest first), then the rest by priority.
        let largest_ceiling = Tier::ALL
            .iter()
            .map(|t| budgets.ceiling(*t))
            .max()
            .unwrap_or(0);
        let mut surplus = budgets.total().saturating_sub(used_total);
        overflow.sort_by(|a, b| {
            let hot_a = a.tier == Tier::Hot;
            let hot_b = b.tier == Tier::Hot;
            hot_b.cmp(&hot_a).then_with(|| {
                if hot_a && hot_b {
                    queue_order(Tier::Hot, a, b)
                } else {
                    queue_order(Tier::Warm, a, b)
                }
            })
        });
        let mut left_out: Vec<TierCandidate> = Vec::new();
        for c in overflow {
            if c.tokens <= surplus {
                surplus -= c.tokens;
                out.placed.push(Placement {
                    candidate: c,
                    tier: Tier::Hot,
                    tokens: c.tokens,
                    truncated_to: None,
                    forced: false,
                });
            } else {
                left_out.push(c);
            }
        }

        // Items larger than every ceiling take whatever room is still left,
        // however small, before anything is excluded.
        for c in left_out {
            if c.tokens <= largest_ceiling {
                out.excluded.push(c.id);
                continue;
            }
            out.warnings.push(EngineWarning::ItemTooLarge {
                id: Some(c.id),
                tokens: c.tokens,
                ceiling: surplus,
                tier: Some(Tier::Hot),
            });
            if surplus == 0 {
                out.excluded.push(c.id);
                continue;
            }
            out.placed.push(Placement {
                candidate: c,
                tier: Tier::Hot,
                tokens: surplus,
                truncated_to: Some(surplus),
                forced: false,
            });
            surplus = 0;
        }
        out
    }
}

/// Lowest-priority accepted items whose removal frees at least `need`
/// tokens. Forced and truncated items are never displaced, nor are the
/// keeper's own strong partners.
fn pick_victims(
    accepted: &[Placement],
    keeper: &TierCandidate,
    need: usize,
    graph: &EntanglementIndex,
) -> Option<Vec<ItemId>> {
    let threshold = graph.config().retain_threshold;
    let mut pool: Vec<&Placement> = accepted
        .iter()
        .filter(|p| !p.forced && p.truncated_to.is_none())
        .filter(|p| graph.strength(keeper.id, p.candidate.id) < threshold)
        .collect();
    pool.sort_by(|a, b| {
        a.candidate
            .priority
            .total_cmp(&b.candidate.priority)
            .then(a.candidate.created_step.cmp(&b.candidate.created_step))
            .then(a.candidate.id.cmp(&b.candidate.id))
    });
    let mut freed = 0;
    let mut victims = Vec::new();
    for p in pool {
        if freed >= need {
            break;
        }
        freed += p.tokens;
        victims.push(p.candidate.id);
    }
    (freed >= need).then_some(victims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntanglementConfig;
    use crate::item::{ItemDraft, ItemKind};

    fn manager() -> TierManager {
        TierManager::new(TierConfig::default(), CompressionThresholds::default())
    }

    fn cand(id: u64, tier: Tier, priority: f64, tokens: usize, step: u64) -> TierCandidate {
        TierCandidate {
            id: ItemId(id),
            tier,
            priority,
            tokens,
            created_step: step,
        }
    }

    fn graph() -> EntanglementIndex {
        EntanglementIndex::new(EntanglementConfig::default())
    }

    fn tier_of(a: &TierAssignment, id: u64) -> Option<Tier> {
        a.placed
            .iter()
            .find(|p| p.candidate.id == ItemId(id))
            .map(|p| p.tier)
    }

    #[test]
    fn split_rounds_down_and_keeps_remainder() {
        let b = TierBudgets::split(101, &TierRatios::default());
        assert_eq!((b.hot, b.warm, b.cold), (40, 35, 25));
        assert_eq!(b.remainder, 1);
        assert_eq!(b.total(), 101);
    }

    #[test]
    fn classify_by_age_and_importance() {
        let m = manager();
        let mut it = ContextItem::from_draft(
            ItemId(1),
            ItemDraft::new(ItemKind::UserMessage, "hi"),
            1,
            0,
        );
        it.importance = 0.5;
        assert_eq!(m.classify(&it, 9), Tier::Hot);
        assert_eq!(m.classify(&it, 10), Tier::Warm);
        it.importance = 0.1;
        assert_eq!(m.classify(&it, 10), Tier::Cold);
        it.importance = 0.9;
        assert_eq!(m.classify(&it, 250), Tier::Cold);
    }

    #[test]
    fn hot_keeps_most_recent_and_overflows_to_warm() {
        let ratios = TierRatios {
            hot: 0.6,
            warm: 0.4,
            cold: 0.0,
        };
        let budgets = TierBudgets::split(250, &ratios);
        assert_eq!(budgets.hot, 150);
        let a = manager().assign(
            vec![
                cand(1, Tier::Hot, 0.5, 100, 5),
                cand(2, Tier::Hot, 0.5, 100, 5),
                cand(3, Tier::Hot, 0.5, 100, 5),
            ],
            &budgets,
            &graph(),
        );
        assert_eq!(tier_of(&a, 3), Some(Tier::Hot));
        assert_eq!(tier_of(&a, 1), Some(Tier::Warm));
        assert_eq!(a.excluded, vec![ItemId(2)]);
        assert!(a.used(Tier::Hot) <= 150);
        assert!(a.total() <= budgets.total());
    }

    #[test]
    fn oversized_item_is_truncated_into_its_tier() {
        let budgets = TierBudgets::split(100, &TierRatios::default());
        let a = manager().assign(vec![cand(1, Tier::Warm, 0.5, 500, 0)], &budgets, &graph());
        let p = a.placed[0];
        assert_eq!(p.tier, Tier::Warm);
        assert_eq!(p.truncated_to, Some(35));
        assert!(matches!(
            a.warnings[0],
            EngineWarning::ItemTooLarge { ceiling: 35, .. }
        ));
    }

    #[test]
    fn entangled_partner_displaces_lower_priority_item() {
        let mut g = graph();
        let shared: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        g.register_entities(ItemId(1), shared.clone(), 0);
        g.register_entities(ItemId(2), shared, 0);
        let budgets = TierBudgets {
            hot: 0,
            warm: 100,
            cold: 0,
            remainder: 0,
        };
        let a = manager().assign(
            vec![
                cand(1, Tier::Warm, 0.9, 50, 0),
                cand(3, Tier::Warm, 0.3, 50, 1),
                cand(2, Tier::Warm, 0.2, 50, 2),
            ],
            &budgets,
            &g,
        );
        assert_eq!(tier_of(&a, 1), Some(Tier::Warm));
        assert_eq!(tier_of(&a, 2), Some(Tier::Warm));
        assert_eq!(tier_of(&a, 3), None);
        assert_eq!(a.excluded, vec![ItemId(3)]);
        assert_eq!(a.force_retained[0].displaced, vec![ItemId(3)]);
    }

    #[test]
    fn no_displacement_without_strong_partner() {
        let budgets = TierBudgets {
            hot: 0,
            warm: 100,
            cold: 0,
            remainder: 0,
        };
        let a = manager().assign(
            vec![
                cand(1, Tier::Warm, 0.9, 50, 0),
                cand(3, Tier::Warm, 0.2, 50, 1),
                cand(2, Tier::Warm, 0.3, 50, 2),
            ],
            &budgets,
            &graph(),
        );
        assert_eq!(a.excluded, vec![ItemId(2)]);
        assert!(a.force_retained.is_empty());
    }

    #[test]
    fn surplus_expands_hot_tier() {
        let budgets = TierBudgets {
            hot: 10,
            warm: 100,
            cold: 0,
            remainder: 0,
        };
        let a = manager().assign(
            vec![cand(1, Tier::Hot, 0.5, 40, 9), cand(2, Tier::Hot, 0.5, 40, 8)],
            &budgets,
            &graph(),
        );
        // Both overflow into warm, which holds them.
        assert_eq!(tier_of(&a, 1), Some(Tier::Warm));
        assert_eq!(tier_of(&a, 2), Some(Tier::Warm));

        let tight = TierBudgets {
            hot: 40,
            warm: 0,
            cold: 0,
            remainder: 45,
        };
        let a = manager().assign(
            vec![cand(1, Tier::Hot, 0.5, 40, 9), cand(2, Tier::Hot, 0.5, 40, 8)],
            &tight,
            &graph(),
        );
        assert_eq!(tier_of(&a, 1), Some(Tier::Hot));
        assert_eq!(tier_of(&a, 2), Some(Tier::Hot));
        assert!(a.excluded.is_empty());
        assert_eq!(a.total(), 80);
    }

    #[test]
    fn oversized_item_takes_leftover_room_below_the_floor() {
        let budgets = TierBudgets::split(1_000, &TierRatios::default());
        assert_eq!((budgets.hot, budgets.warm, budgets.cold), (400, 350, 250));
        let a = manager().assign(
            vec![
                cand(1, Tier::Hot, 0.9, 390, 9),
                cand(2, Tier::Hot, 0.5, 1_000, 8),
                cand(3, Tier::Warm, 0.5, 345, 2),
                cand(4, Tier::Cold, 0.6, 245, 1),
            ],
            &budgets,
            &graph(),
        );
        assert!(a.excluded.is_empty());
        let p = a.placed.iter().find(|p| p.candidate.id == ItemId(2)).unwrap();
        assert_eq!(p.truncated_to, Some(20));
        assert_eq!(p.tier, Tier::Hot);
        assert_eq!(a.total(), 1_000);
        assert!(a.warnings.iter().any(|w| matches!(
            w,
            EngineWarning::ItemTooLarge { id: Some(ItemId(2)), ceiling: 20, .. }
        )));
    }

    #[test]
    fn oversized_item_without_any_room_is_reported() {
        let budgets = TierBudgets {
            hot: 100,
            warm: 0,
            cold: 0,
            remainder: 0,
        };
        let a = manager().assign(
            vec![cand(1, Tier::Hot, 0.9, 100, 9), cand(2, Tier::Hot, 0.5, 500, 8)],
            &budgets,
            &graph(),
        );
        assert_eq!(a.excluded, vec![ItemId(2)]);
        assert!(a.warnings.iter().any(|w| matches!(
            w,
            EngineWarning::ItemTooLarge { id: Some(ItemId(2)), ceiling: 0, .. }
        )));
    }
}
