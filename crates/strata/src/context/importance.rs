//! Importance scoring: a composite retention score per item.
//!
//! The score is a weighted sum of six sub-scores, each in [0, 1]:
//!
//! | Sub-score | Signal |
//! |-----------|--------|
//! | recency | `exp(-λ · steps since last reference)` |
//! | relevance | share of goal terms that the item mentions |
//! | causal | the item records a decision or an error |
//! | reference | saturating function of `reference_count` |
//! | outcome | Laplace-smoothed success ratio of steps it contributed to |
//! | domain | profile bonus or penalty for the item's tags |
//!
//! Weights come from [`ImportanceConfig`]; nothing is hard-coded per kind
//! beyond the causal markers. Scoring never touches item content.

use crate::config::{DomainProfile, ImportanceConfig};
use crate::context::entities::extract_entities;
use crate::item::{ContextItem, ItemKind};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// Half-saturation point of the reference sub-score.
const REFERENCE_HALF_SATURATION: f64 = 2.0;

/// Causal weight of a plain user instruction.
const USER_CAUSAL_WEIGHT: f64 = 0.25;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "then", "than", "are", "was",
    "were", "will", "would", "should", "could", "have", "has", "had", "not", "but", "all", "any",
    "can", "its", "our", "your", "their", "about", "after", "before", "when", "what", "which",
    "while", "make", "sure", "also", "them", "they", "there", "here", "use", "using",
];

static ERROR_MARKERS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|failed|failure|exception|panic(?:ked)?|traceback|fatal|denied)\b").ok()
});

static DECISION_MARKERS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(decided|decision|i will|we will|going with|chose|choosing|plan:|instead of)\b")
        .ok()
});

fn matches(re: &LazyLock<Option<Regex>>, text: &str) -> bool {
    re.as_ref().is_some_and(|r| r.is_match(text))
}

/// Lowercased keyword and entity set of a text.
fn terms(text: &str) -> BTreeSet<String> {
    let mut out: BTreeSet<String> = text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect();
    out.extend(extract_entities(text).into_iter().map(|e| e.to_lowercase()));
    out
}

/// Precomputed terms of the current goal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GoalTerms {
    terms: BTreeSet<String>,
}

impl GoalTerms {
    pub fn new(goal: &str) -> Self {
        Self { terms: terms(goal) }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// Fraction of goal terms present in `text`.
    pub fn overlap(&self, text: &str) -> f64 {
        if self.terms.is_empty() {
            return 0.0;
        }
        let other = terms(text);
        let hits = self.terms.intersection(&other).count();
        hits as f64 / self.terms.len() as f64
    }
}

/// Individual sub-scores and their weighted total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub recency: f64,
    pub relevance: f64,
    pub causal: f64,
    pub reference: f64,
    pub outcome: f64,
    pub domain: f64,
    pub total: f64,
}

#[derive(Debug, Clone)]
pub struct ImportanceScorer {
    config: ImportanceConfig,
    tag_weights: BTreeMap<String, f64>,
}

impl ImportanceScorer {
    pub fn new(config: ImportanceConfig, profile: &DomainProfile) -> Self {
        Self {
            config,
            tag_weights: profile.tag_weights.clone(),
        }
    }

    pub fn config(&self) -> &ImportanceConfig {
        &self.config
    }

    /// Composite score in [0, 1].
    pub fn score(&self, item: &ContextItem, goal: &GoalTerms, now: u64) -> f64 {
        self.breakdown(item, goal, now).total
    }

    pub fn breakdown(&self, item: &ContextItem, goal: &GoalTerms, now: u64) -> ScoreBreakdown {
        let w = &self.config.weights;
        let recency = self.recency(item, now);
        let relevance = goal.overlap(&item.content);
        let causal = causal_weight(item);
        let reference = reference_score(item.reference_count);
        let outcome = outcome_score(item.outcome_successes, item.outcome_failures);
        let domain = self.domain_score(item);
        let total = w.recency * recency
            + w.relevance * relevance
            + w.causal * causal
            + w.reference * reference
            + w.outcome * outcome
            + w.domain * domain;
        ScoreBreakdown {
            recency,
            relevance,
            causal,
            reference,
            outcome,
            domain,
            total: total.clamp(0.0, 1.0),
        }
    }

    fn recency(&self, item: &ContextItem, now: u64) -> f64 {
        let idle = now.saturating_sub(item.last_referenced_step) as f64;
        (-self.config.recency_lambda * idle).exp()
    }

    /// 0.5 is neutral; tag weights shift it by up to ±0.5.
    fn domain_score(&self, item: &ContextItem) -> f64 {
        let sum: f64 = item
            .domain_tags
            .iter()
            .filter_map(|t| self.tag_weights.get(t))
            .sum();
        (1.0 + sum.clamp(-1.0, 1.0)) / 2.0
    }
}

/// Decisions and errors carry the most causal weight.
pub fn causal_weight(item: &ContextItem) -> f64 {
    match item.kind {
        ItemKind::ToolResult if matches(&ERROR_MARKERS, &item.content) => 1.0,
        ItemKind::AssistantMessage
            if matches(&DECISION_MARKERS, &item.content)
                || matches(&ERROR_MARKERS, &item.content) =>
        {
            1.0
        }
        ItemKind::System | ItemKind::TaskState => 0.5,
        ItemKind::UserMessage => USER_CAUSAL_WEIGHT,
        _ => 0.0,
    }
}

/// `n / (n + 2)`: 0 for unreferenced items, 0.5 at two references.
pub fn reference_score(count: u32) -> f64 {
    let n = count as f64;
    n / (n + REFERENCE_HALF_SATURATION)
}

/// Laplace-smoothed success ratio; 0.5 with no outcomes recorded.
pub fn outcome_score(successes: u32, failures: u32) -> f64 {
    (successes as f64 + 1.0) / (successes as f64 + failures as f64 + 2.0)
}
