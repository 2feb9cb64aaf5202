//! Configuration for a [`ContextEngine`](crate::engine::ContextEngine).
//!
//! Every knob has a default, so a session can start from
//! `EngineConfig::default()` and override only what it needs. Configs are
//! plain serde data: they load from JSON with missing fields filled in from
//! the defaults, and `strata schema` prints their JSON Schema.
//!
//! # Examples
//!
//! ```ignore
//! let config = EngineConfig::default()
//!     .with_model_window(128_000)
//!     .with_output_reservation(8_192)
//!     .with_tier_ratios(0.5, 0.3, 0.2)
//!     .with_checkpoint_interval(10);
//! config.validate()?;
//! ```
//!
//! Overriding a nested section:
//!
//! ```ignore
//! let config = EngineConfig {
//!     domain: DomainProfile::named("coding")
//!         .with_tool_mask_chars("read_file", 4_000)
//!         .with_tag_weight("tests", 0.5),
//!     ..EngineConfig::default()
//! };
//! ```

use crate::context::tokens::DEFAULT_CHARS_PER_TOKEN;
use crate::error::EngineError;
use crate::item::{ContextItem, ItemKind};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const SUM_TOLERANCE: f64 = 1e-6;

// ── Tiers ──────────────────────────────────────────────────────────

/// Share of the tier budget given to each tier. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TierRatios {
    pub hot: f64,
    pub warm: f64,
    pub cold: f64,
}

impl Default for TierRatios {
    fn default() -> Self {
        Self {
            hot: 0.40,
            warm: 0.35,
            cold: 0.25,
        }
    }
}

/// Tier classification and enforcement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TierConfig {
    pub ratios: TierRatios,
    /// Items younger than this many steps are hot.
    pub hot_recency_cutoff: u64,
    /// Items scoring below this importance are classified cold.
    pub cold_importance_floor: f64,
    /// An oversized item is truncated only into a remaining allowance of at
    /// least this many tokens (or the whole ceiling, if smaller).
    pub min_truncated_tokens: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            ratios: TierRatios::default(),
            hot_recency_cutoff: 10,
            cold_importance_floor: 0.30,
            min_truncated_tokens: 16,
        }
    }
}

// ── Compression ────────────────────────────────────────────────────

/// Item ages (in steps) at which each compression level applies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CompressionThresholds {
    pub masked: u64,
    pub summarized: u64,
    pub digest: u64,
}

impl Default for CompressionThresholds {
    fn default() -> Self {
        Self {
            masked: 11,
            summarized: 51,
            digest: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CompressionConfig {
    pub thresholds: CompressionThresholds,
    /// Maximum items per summarization or digest request.
    pub batch_size: usize,
    /// Failed attempts after which an item stays at its level for good.
    pub max_attempts: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            thresholds: CompressionThresholds::default(),
            batch_size: 8,
            max_attempts: 3,
        }
    }
}

// ── Checkpoints ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Take a checkpoint automatically during `maintain` every N steps.
    /// Zero disables automatic checkpoints.
    pub every_n_steps: u64,
    /// Ring size; the oldest checkpoint is dropped past this.
    pub max_retained: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every_n_steps: 25,
            max_retained: 10,
        }
    }
}

// ── Importance ─────────────────────────────────────────────────────

/// Weights of the six importance sub-scores. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ImportanceWeights {
    pub recency: f64,
    pub relevance: f64,
    pub causal: f64,
    pub reference: f64,
    pub outcome: f64,
    pub domain: f64,
}

impl Default for ImportanceWeights {
    fn default() -> Self {
        Self {
            recency: 0.25,
            relevance: 0.25,
            causal: 0.20,
            reference: 0.10,
            outcome: 0.10,
            domain: 0.10,
        }
    }
}

impl ImportanceWeights {
    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }

    fn as_array(&self) -> [f64; 6] {
        [
            self.recency,
            self.relevance,
            self.causal,
            self.reference,
            self.outcome,
            self.domain,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ImportanceConfig {
    pub weights: ImportanceWeights,
    /// Decay rate of the recency sub-score per step.
    pub recency_lambda: f64,
    /// Steps before an outcome that count as contributing to it.
    pub outcome_window: u64,
}

impl Default for ImportanceConfig {
    fn default() -> Self {
        Self {
            weights: ImportanceWeights::default(),
            recency_lambda: 0.05,
            outcome_window: 5,
        }
    }
}

// ── Entanglement ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EntanglementConfig {
    /// Edges decayed below this strength are pruned.
    pub min_strength: f64,
    /// Edge cap; the weakest edges go first once exceeded.
    pub max_edges: usize,
    /// Edges at least this strong veto eviction of a partner.
    pub retain_threshold: f64,
    /// Maximum priority bonus per unit of edge strength.
    pub boost_factor: f64,
    /// Edges not reinforced for this many steps start decaying.
    pub decay_after_steps: u64,
    /// Multiplier applied to an idle edge's strength per maintenance pass.
    pub decay_rate: f64,
}

impl Default for EntanglementConfig {
    fn default() -> Self {
        Self {
            min_strength: 0.25,
            max_edges: 10_000,
            retain_threshold: 0.6,
            boost_factor: 0.4,
            decay_after_steps: 50,
            decay_rate: 0.9,
        }
    }
}

// ── Domain profile ─────────────────────────────────────────────────

/// Per-domain preserve and compress rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DomainProfile {
    pub name: String,
    /// Item kinds that are never compressed and always packed.
    pub preserve_kinds: BTreeSet<ItemKind>,
    /// Items carrying any of these tags are never compressed and always packed.
    pub preserve_tags: BTreeSet<String>,
    /// Characters of tool output kept verbatim when masking.
    pub default_mask_chars: usize,
    /// Per-tool overrides of `default_mask_chars`.
    pub tool_mask_chars: BTreeMap<String, usize>,
    /// Importance bonus (positive) or penalty (negative) per tag, in [-1, 1].
    pub tag_weights: BTreeMap<String, f64>,
}

impl Default for DomainProfile {
    fn default() -> Self {
        Self {
            name: "general".to_string(),
            preserve_kinds: BTreeSet::new(),
            preserve_tags: BTreeSet::new(),
            default_mask_chars: 2_000,
            tool_mask_chars: BTreeMap::new(),
            tag_weights: BTreeMap::new(),
        }
    }
}

impl DomainProfile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn preserve_kind(mut self, kind: ItemKind) -> Self {
        self.preserve_kinds.insert(kind);
        self
    }

    pub fn preserve_tag(mut self, tag: impl Into<String>) -> Self {
        self.preserve_tags.insert(tag.into());
        self
    }

    pub fn with_tool_mask_chars(mut self, tool: impl Into<String>, chars: usize) -> Self {
        self.tool_mask_chars.insert(tool.into(), chars);
        self
    }

    pub fn with_tag_weight(mut self, tag: impl Into<String>, weight: f64) -> Self {
        self.tag_weights.insert(tag.into(), weight);
        self
    }

    /// Mask limit for output of `tool` (or the default when unknown).
    pub fn mask_chars_for(&self, tool: Option<&str>) -> usize {
        tool.and_then(|t| self.tool_mask_chars.get(t).copied())
            .unwrap_or(self.default_mask_chars)
    }

    /// Whether this profile keeps `item` out of compression and tiering.
    pub fn preserves(&self, item: &ContextItem) -> bool {
        item.kind.is_pinned()
            || self.preserve_kinds.contains(&item.kind)
            || item.domain_tags.iter().any(|t| self.preserve_tags.contains(t))
    }
}

// ── Engine config ──────────────────────────────────────────────────

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    /// Context window of the downstream model, in tokens.
    pub model_window_tokens: usize,
    /// Share of the model window the packed context may occupy.
    pub budget_ratio: f64,
    /// Tokens held back for the model's response.
    pub output_reservation: usize,
    pub chars_per_token: f64,
    pub tiers: TierConfig,
    pub compression: CompressionConfig,
    pub checkpoints: CheckpointConfig,
    pub importance: ImportanceConfig,
    pub entanglement: EntanglementConfig,
    pub domain: DomainProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_window_tokens: 200_000,
            budget_ratio: 0.9,
            output_reservation: 4_096,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            tiers: TierConfig::default(),
            compression: CompressionConfig::default(),
            checkpoints: CheckpointConfig::default(),
            importance: ImportanceConfig::default(),
            entanglement: EntanglementConfig::default(),
            domain: DomainProfile::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_window(mut self, tokens: usize) -> Self {
        self.model_window_tokens = tokens;
        self
    }

    pub fn with_budget_ratio(mut self, ratio: f64) -> Self {
        self.budget_ratio = ratio;
        self
    }

    pub fn with_output_reservation(mut self, tokens: usize) -> Self {
        self.output_reservation = tokens;
        self
    }

    pub fn with_chars_per_token(mut self, cpt: f64) -> Self {
        self.chars_per_token = cpt;
        self
    }

    pub fn with_tier_ratios(mut self, hot: f64, warm: f64, cold: f64) -> Self {
        self.tiers.ratios = TierRatios { hot, warm, cold };
        self
    }

    pub fn with_hot_recency_cutoff(mut self, steps: u64) -> Self {
        self.tiers.hot_recency_cutoff = steps;
        self
    }

    pub fn with_thresholds(mut self, masked: u64, summarized: u64, digest: u64) -> Self {
        self.compression.thresholds = CompressionThresholds {
            masked,
            summarized,
            digest,
        };
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.compression.batch_size = n;
        self
    }

    /// Set the automatic checkpoint interval (0 disables).
    pub fn with_checkpoint_interval(mut self, steps: u64) -> Self {
        self.checkpoints.every_n_steps = steps;
        self
    }

    pub fn with_max_checkpoints(mut self, n: usize) -> Self {
        self.checkpoints.max_retained = n;
        self
    }

    pub fn with_importance_weights(mut self, weights: ImportanceWeights) -> Self {
        self.importance.weights = weights;
        self
    }

    pub fn with_max_edges(mut self, n: usize) -> Self {
        self.entanglement.max_edges = n;
        self
    }

    pub fn with_domain(mut self, profile: DomainProfile) -> Self {
        self.domain = profile;
        self
    }

    /// Token budget of the packed window derived from the model window.
    pub fn window_budget(&self) -> usize {
        (self.model_window_tokens as f64 * self.budget_ratio).floor() as usize
    }

    /// Load a config from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.model_window_tokens == 0 {
            return invalid("model_window_tokens must be positive");
        }
        if !(self.budget_ratio > 0.0 && self.budget_ratio <= 1.0) {
            return invalid(format!(
                "budget_ratio must be in (0, 1], got {}",
                self.budget_ratio
            ));
        }
        if !(self.chars_per_token > 0.0) || !self.chars_per_token.is_finite() {
            return invalid(format!(
                "chars_per_token must be positive, got {}",
                self.chars_per_token
            ));
        }
        if self.output_reservation >= self.window_budget() {
            return invalid(format!(
                "output_reservation ({}) leaves no room in a {}-token window budget",
                self.output_reservation,
                self.window_budget()
            ));
        }

        let r = &self.tiers.ratios;
        check_shares("tier ratios", &[r.hot, r.warm, r.cold])?;
        check_unit("cold_importance_floor", self.tiers.cold_importance_floor)?;

        let t = &self.compression.thresholds;
        if !(t.masked < t.summarized && t.summarized < t.digest) {
            return invalid(format!(
                "compression thresholds must be strictly increasing, got {}/{}/{}",
                t.masked, t.summarized, t.digest
            ));
        }
        if self.compression.batch_size == 0 {
            return invalid("compression batch_size must be positive");
        }
        if self.checkpoints.max_retained == 0 {
            return invalid("checkpoints.max_retained must be positive");
        }

        check_shares("importance weights", &self.importance.weights.as_array())?;
        if !(self.importance.recency_lambda >= 0.0) {
            return invalid("importance.recency_lambda must be non-negative");
        }

        let e = &self.entanglement;
        check_unit("entanglement.min_strength", e.min_strength)?;
        check_unit("entanglement.retain_threshold", e.retain_threshold)?;
        check_unit("entanglement.boost_factor", e.boost_factor)?;
        check_unit("entanglement.decay_rate", e.decay_rate)?;

        for (tag, w) in &self.domain.tag_weights {
            if !(-1.0..=1.0).contains(w) {
                return invalid(format!("tag weight for '{tag}' must be in [-1, 1], got {w}"));
            }
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> Result<(), EngineError> {
    Err(EngineError::ConfigInvalid(msg.into()))
}

fn check_shares(what: &str, shares: &[f64]) -> Result<(), EngineError> {
    if shares.iter().any(|s| !(*s >= 0.0) || !s.is_finite()) {
        return invalid(format!("{what} must be non-negative, got {shares:?}"));
    }
    let sum: f64 = shares.iter().sum();
    if (sum - 1.0).abs() > SUM_TOLERANCE {
        return invalid(format!("{what} must sum to 1.0, got {sum}"));
    }
    Ok(())
}

fn check_unit(what: &str, value: f64) -> Result<(), EngineError> {
    if !(0.0..=1.0).contains(&value) {
        return invalid(format!("{what} must be in [0, 1], got {value}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn default_window_budget() {
        assert_eq!(EngineConfig::default().window_budget(), 180_000);
    }

    #[test]
    fn tier_ratios_must_sum_to_one() {
        let cfg = EngineConfig::default().with_tier_ratios(0.5, 0.5, 0.5);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
        assert!(err.to_string().contains("tier ratios"));
    }

    #[test]
    fn negative_ratio_rejected() {
        let cfg = EngineConfig::default().with_tier_ratios(1.2, -0.2, 0.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn weights_must_sum_to_one() {
        let cfg = EngineConfig::default().with_importance_weights(ImportanceWeights {
            recency: 0.5,
            ..ImportanceWeights::default()
        });
        assert!(cfg.validate().unwrap_err().to_string().contains("importance"));
    }

    #[test]
    fn non_positive_budget_rejected() {
        assert!(EngineConfig::default().with_model_window(0).validate().is_err());
        assert!(EngineConfig::default().with_budget_ratio(0.0).validate().is_err());
        assert!(EngineConfig::default().with_budget_ratio(1.5).validate().is_err());
        assert!(
            EngineConfig::default()
                .with_chars_per_token(0.0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn reservation_must_leave_room() {
        let cfg = EngineConfig::default()
            .with_model_window(1_000)
            .with_budget_ratio(1.0)
            .with_output_reservation(1_000);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn thresholds_must_increase() {
        let cfg = EngineConfig::default().with_thresholds(11, 11, 200);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_retention_rejected() {
        assert!(EngineConfig::default().with_max_checkpoints(0).validate().is_err());
        assert!(EngineConfig::default().with_batch_size(0).validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"model_window_tokens": 32000, "tiers": {"hot_recency_cutoff": 4}}"#)
                .unwrap();
        assert_eq!(cfg.model_window_tokens, 32_000);
        assert_eq!(cfg.tiers.hot_recency_cutoff, 4);
        assert_eq!(cfg.tiers.ratios, TierRatios::default());
        assert_eq!(cfg.compression.thresholds.summarized, 51);
    }

    #[test]
    fn from_json_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"tiers": {"ratios": {"hot": 0.9, "warm": 0.9, "cold": 0.0}}}"#)
            .unwrap();
        assert!(matches!(
            EngineConfig::from_json_file(&path),
            Err(EngineError::ConfigInvalid(_))
        ));

        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"output_reservation": 1024}"#).unwrap();
        let cfg = EngineConfig::from_json_file(&good).unwrap();
        assert_eq!(cfg.output_reservation, 1024);
    }

    #[test]
    fn mask_chars_fall_back_to_default() {
        let p = DomainProfile::named("coding").with_tool_mask_chars("read_file", 500);
        assert_eq!(p.mask_chars_for(Some("read_file")), 500);
        assert_eq!(p.mask_chars_for(Some("grep")), 2_000);
        assert_eq!(p.mask_chars_for(None), 2_000);
    }

    #[test]
    fn bad_tag_weight_rejected() {
        let cfg = EngineConfig::default()
            .with_domain(DomainProfile::default().with_tag_weight("noise", -2.0));
        assert!(cfg.validate().is_err());
    }
}
