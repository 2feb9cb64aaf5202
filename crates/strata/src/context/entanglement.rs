//! Entanglement index: a weighted co-reference graph over items.
//!
//! Two items are entangled when their content names the same entities. The
//! edge strength grows with the number of shared entities
//! (`min(1.0, 0.25 × shared)`), and the tier manager uses strong edges to
//! veto evicting one half of a pair that only makes sense together.
//!
//! The graph keeps three views that must agree:
//!
//! 1. item -> entities (what each node mentions)
//! 2. entity -> items (inverted index, used at registration)
//! 3. undirected edges keyed by `(min_id, max_id)`, plus an adjacency list
//!
//! Edge eviction (decay below the floor, or the edge cap) is the only lossy
//! operation.

use crate::config::EntanglementConfig;
use crate::context::entities::extract_entities;
use crate::item::ItemId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Upper bound on entities tracked per item.
const MAX_ENTITIES_PER_ITEM: usize = 64;

/// Strength contributed by each shared entity.
const STRENGTH_PER_ENTITY: f64 = 0.25;

/// Edge strength for a given number of shared entities.
pub fn strength_for(shared: usize) -> f64 {
    (STRENGTH_PER_ENTITY * shared as f64).min(1.0)
}

/// Undirected weighted relation between two items. `a < b` always.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntanglementEdge {
    pub a: ItemId,
    pub b: ItemId,
    pub shared: Vec<String>,
    pub strength: f64,
    pub last_reinforced: u64,
}

impl EntanglementEdge {
    /// The endpoint that is not `id`.
    pub fn other(&self, id: ItemId) -> ItemId {
        if self.a == id { self.b } else { self.a }
    }
}

/// A candidate's priority, as adjusted by [`EntanglementIndex::boost`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub id: ItemId,
    pub priority: f64,
}

/// An included item whose entangled partner was left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingPartner {
    pub missing: ItemId,
    pub present_partner: ItemId,
    pub strength: f64,
}

/// Result of registering an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registration {
    pub entities: usize,
    pub edges_created: usize,
    pub edges_pruned: usize,
}

/// Per-node entity list in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntities {
    pub id: ItemId,
    pub entities: Vec<String>,
}

/// Plain edge-list form of the graph, used by checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeEntities>,
    pub edges: Vec<EntanglementEdge>,
}

#[derive(Debug, Clone)]
pub struct EntanglementIndex {
    config: EntanglementConfig,
    entities: BTreeMap<ItemId, BTreeSet<String>>,
    inverted: BTreeMap<String, BTreeSet<ItemId>>,
    edges: BTreeMap<(ItemId, ItemId), EntanglementEdge>,
    adjacency: BTreeMap<ItemId, BTreeSet<ItemId>>,
}

fn key(a: ItemId, b: ItemId) -> (ItemId, ItemId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl EntanglementIndex {
    pub fn new(config: EntanglementConfig) -> Self {
        Self {
            config,
            entities: BTreeMap::new(),
            inverted: BTreeMap::new(),
            edges: BTreeMap::new(),
            adjacency: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &EntanglementConfig {
        &self.config
    }

    // ── Registration ──────────────────────────────────────────────

    /// Extract entities from `content` and link `id` to every item sharing
    /// at least one of them.
    pub fn register(&mut self, id: ItemId, content: &str, step: u64) -> Registration {
        self.register_entities(id, extract_entities(content), step)
    }

    /// Register `id` with a precomputed entity list. Re-registering an id
    /// replaces its previous node.
    pub fn register_entities(
        &mut self,
        id: ItemId,
        entities: impl IntoIterator<Item = String>,
        step: u64,
    ) -> Registration {
        if self.entities.contains_key(&id) {
            self.retire(id);
        }
        let mut mine: BTreeSet<String> = BTreeSet::new();
        for e in entities {
            if mine.len() >= MAX_ENTITIES_PER_ITEM {
                break;
            }
            mine.insert(e);
        }

        // Each touched neighbour is visited once per shared entity.
        let mut shared: BTreeMap<ItemId, Vec<String>> = BTreeMap::new();
        for entity in &mine {
            if let Some(holders) = self.inverted.get(entity) {
                for other in holders {
                    if *other != id {
                        shared.entry(*other).or_default().push(entity.clone());
                    }
                }
            }
        }

        let mut created = 0;
        for (other, names) in shared {
            let strength = strength_for(names.len());
            if strength < self.config.min_strength {
                continue;
            }
            let (a, b) = key(id, other);
            self.edges.insert(
                (a, b),
                EntanglementEdge {
                    a,
                    b,
                    shared: names,
                    strength,
                    last_reinforced: step,
                },
            );
            self.adjacency.entry(id).or_default().insert(other);
            self.adjacency.entry(other).or_default().insert(id);
            created += 1;
        }

        for entity in &mine {
            self.inverted.entry(entity.clone()).or_default().insert(id);
        }
        let count = mine.len();
        self.entities.insert(id, mine);

        Registration {
            entities: count,
            edges_created: created,
            edges_pruned: self.prune_to_cap(),
        }
    }

    /// Remove a node and every edge touching it.
    pub fn retire(&mut self, id: ItemId) {
        if let Some(mine) = self.entities.remove(&id) {
            for entity in mine {
                if let Some(holders) = self.inverted.get_mut(&entity) {
                    holders.remove(&id);
                    if holders.is_empty() {
                        self.inverted.remove(&entity);
                    }
                }
            }
        }
        if let Some(partners) = self.adjacency.remove(&id) {
            for other in partners {
                self.edges.remove(&key(id, other));
                self.unlink(other, id);
            }
        }
    }

    fn unlink(&mut self, from: ItemId, to: ItemId) {
        if let Some(set) = self.adjacency.get_mut(&from) {
            set.remove(&to);
            if set.is_empty() {
                self.adjacency.remove(&from);
            }
        }
    }

    fn remove_edge(&mut self, k: (ItemId, ItemId)) {
        if self.edges.remove(&k).is_some() {
            self.unlink(k.0, k.1);
            self.unlink(k.1, k.0);
        }
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn edge(&self, a: ItemId, b: ItemId) -> Option<&EntanglementEdge> {
        self.edges.get(&key(a, b))
    }

    /// Edge strength, or 0.0 when the items are not entangled.
    pub fn strength(&self, a: ItemId, b: ItemId) -> f64 {
        self.edge(a, b).map_or(0.0, |e| e.strength)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node_count(&self) -> usize {
        self.entities.len()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn entities_of(&self, id: ItemId) -> impl Iterator<Item = &String> {
        self.entities.get(&id).into_iter().flatten()
    }

    /// Partners of `id` with their edge strengths.
    pub fn partners(&self, id: ItemId) -> impl Iterator<Item = (ItemId, f64)> + '_ {
        self.adjacency
            .get(&id)
            .into_iter()
            .flatten()
            .map(move |other| (*other, self.strength(id, *other)))
    }

    // ── Retention policy ──────────────────────────────────────────

    /// Raise each candidate's priority by up to `strength × boost_factor`
    /// for its strongest partner that is also a candidate. Bonuses are
    /// computed from the unboosted set, take the single strongest partner
    /// rather than a sum, and the result is clamped to 1.0.
    pub fn boost(&self, candidates: &mut [Scored]) {
        let included: HashSet<ItemId> = candidates.iter().map(|c| c.id).collect();
        let bonuses: Vec<f64> = candidates
            .iter()
            .map(|c| {
                self.partners(c.id)
                    .filter(|(other, _)| included.contains(other))
                    .map(|(_, s)| s * self.config.boost_factor)
                    .fold(0.0, f64::max)
            })
            .collect();
        for (c, bonus) in candidates.iter_mut().zip(bonuses) {
            c.priority = (c.priority + bonus).min(1.0);
        }
    }

    /// Whether `id` has an edge at least `retain_threshold` strong to any
    /// item in `active`.
    pub fn should_retain(&self, id: ItemId, active: &HashSet<ItemId>) -> bool {
        self.partners(id)
            .any(|(other, s)| s >= self.config.retain_threshold && active.contains(&other))
    }

    /// Pairs broken by `included`: partners of included items, at least
    /// `min_strength` strong, that were left out. Strongest first.
    pub fn missing_partners(
        &self,
        included: &HashSet<ItemId>,
        min_strength: f64,
    ) -> Vec<MissingPartner> {
        let mut out: Vec<MissingPartner> = self
            .edges
            .values()
            .filter(|e| e.strength >= min_strength)
            .filter_map(|e| match (included.contains(&e.a), included.contains(&e.b)) {
                (true, false) => Some(MissingPartner {
                    missing: e.b,
                    present_partner: e.a,
                    strength: e.strength,
                }),
                (false, true) => Some(MissingPartner {
                    missing: e.a,
                    present_partner: e.b,
                    strength: e.strength,
                }),
                _ => None,
            })
            .collect();
        out.sort_by(|x, y| {
            y.strength
                .total_cmp(&x.strength)
                .then(x.missing.cmp(&y.missing))
                .then(x.present_partner.cmp(&y.present_partner))
        });
        out
    }

    // ── Maintenance ───────────────────────────────────────────────

    /// Mark every edge of `id` as freshly used.
    pub fn reinforce(&mut self, id: ItemId, step: u64) {
        let Some(partners) = self.adjacency.get(&id) else {
            return;
        };
        for other in partners {
            if let Some(edge) = self.edges.get_mut(&key(id, *other)) {
                edge.last_reinforced = edge.last_reinforced.max(step);
            }
        }
    }

    /// Weaken edges idle for longer than `decay_after_steps` and drop the
    /// ones that fall below `min_strength`. Returns the number removed.
    pub fn decay(&mut self, now: u64) -> usize {
        let mut dead = Vec::new();
        for (k, edge) in &mut self.edges {
            if now.saturating_sub(edge.last_reinforced) > self.config.decay_after_steps {
                edge.strength *= self.config.decay_rate;
                if edge.strength < self.config.min_strength {
                    dead.push(*k);
                }
            }
        }
        let removed = dead.len();
        for k in dead {
            self.remove_edge(k);
        }
        removed + self.prune_to_cap()
    }

    /// Drop the weakest edges (oldest first among equals) until the edge
    /// count is within `max_edges`.
    pub fn prune_to_cap(&mut self) -> usize {
        let excess = self.edges.len().saturating_sub(self.config.max_edges);
        if excess == 0 {
            return 0;
        }
        let mut ranked: Vec<(f64, u64, (ItemId, ItemId))> = self
            .edges
            .iter()
            .map(|(k, e)| (e.strength, e.last_reinforced, *k))
            .collect();
        ranked.sort_by(|x, y| {
            x.0.total_cmp(&y.0)
                .then(x.1.cmp(&y.1))
                .then(x.2.cmp(&y.2))
        });
        for (_, _, k) in ranked.into_iter().take(excess) {
            self.remove_edge(k);
        }
        excess
    }

    // ── Snapshots ─────────────────────────────────────────────────

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self
                .entities
                .iter()
                .map(|(id, ents)| NodeEntities {
                    id: *id,
                    entities: ents.iter().cloned().collect(),
                })
                .collect(),
            edges: self.edges.values().cloned().collect(),
        }
    }

    /// Rebuild an index from a snapshot. The inverted index and adjacency
    /// are derived; edges are taken as stored.
    pub fn from_snapshot(config: EntanglementConfig, snapshot: &GraphSnapshot) -> Self {
        let mut index = Self::new(config);
        for node in &snapshot.nodes {
            let ents: BTreeSet<String> = node.entities.iter().cloned().collect();
            for e in &ents {
                index.inverted.entry(e.clone()).or_default().insert(node.id);
            }
            index.entities.insert(node.id, ents);
        }
        for edge in &snapshot.edges {
            let k = key(edge.a, edge.b);
            index.adjacency.entry(k.0).or_default().insert(k.1);
            index.adjacency.entry(k.1).or_default().insert(k.0);
            index.edges.insert(k, edge.clone());
        }
        index
    }

    /// Check that the three views agree and every strength is in [0, 1].
    pub fn check_consistency(&self) -> Result<(), String> {
        for ((a, b), edge) in &self.edges {
            if !(0.0..=1.0).contains(&edge.strength) {
                return Err(format!("edge {a}-{b} has strength {}", edge.strength));
            }
            if edge.a != *a || edge.b != *b || a >= b {
                return Err(format!("edge {a}-{b} is stored under the wrong key"));
            }
            if !self.contains(*a) || !self.contains(*b) {
                return Err(format!("edge {a}-{b} touches an unregistered item"));
            }
            let linked = |x: &ItemId, y: &ItemId| {
                self.adjacency.get(x).is_some_and(|s| s.contains(y))
            };
            if !linked(a, b) || !linked(b, a) {
                return Err(format!("edge {a}-{b} missing from adjacency"));
            }
        }
        let adjacency_links: usize = self.adjacency.values().map(BTreeSet::len).sum();
        if adjacency_links != self.edges.len() * 2 {
            return Err(format!(
                "adjacency holds {adjacency_links} links for {} edges",
                self.edges.len()
            ));
        }
        for (id, ents) in &self.entities {
            for e in ents {
                if !self.inverted.get(e).is_some_and(|s| s.contains(id)) {
                    return Err(format!("entity '{e}' of {id} missing from inverted index"));
                }
            }
        }
        for (e, holders) in &self.inverted {
            for id in holders {
                if !self.entities.get(id).is_some_and(|s| s.contains(e)) {
                    return Err(format!("inverted index lists {id} for unknown entity '{e}'"));
                }
            }
        }
        Ok(())
    }
}
