//! Data model: context items, tiers, compression levels, and task state.
//!
//! A [`ContextItem`] is one unit of accumulated history. Its `content` is
//! mutated by compression, but `raw_token_count` always records the cost of
//! what was originally registered, so `current_token_count <= raw_token_count`
//! holds for every live item.
//!
//! [`TaskState`] is the per-session singleton that is always packed first,
//! verbatim. It is never tiered and never compressed; digest compression
//! writes into it instead.

use crate::context::compression::RequestId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ── Identifiers & enums ────────────────────────────────────────────

/// Stable identifier of a context item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item-{}", self.0)
    }
}

/// What an item represents in the conversation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    System,
    TaskState,
    UserMessage,
    AssistantMessage,
    ToolResult,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::System => "system",
            ItemKind::TaskState => "task_state",
            ItemKind::UserMessage => "user_message",
            ItemKind::AssistantMessage => "assistant_message",
            ItemKind::ToolResult => "tool_result",
        }
    }

    /// Pinned kinds are packed ahead of every tier and never compressed.
    pub fn is_pinned(&self) -> bool {
        matches!(self, ItemKind::System | ItemKind::TaskState)
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retention tier. Every live item is in exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    /// Tiers in acceptance order: overflow cascades hot -> warm -> cold.
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Tier::Hot => 0,
            Tier::Warm => 1,
            Tier::Cold => 2,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How aggressively an item's content has been shrunk.
///
/// Declaration order is the level order: L0 < L1 < L2 < L3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// L0: content exactly as registered.
    Verbatim,
    /// L1: observational output beyond a size limit replaced by a placeholder.
    Masked,
    /// L2: merged into an externally generated summary.
    Summarized,
    /// L3: folded into the task state digest.
    Digest,
}

impl CompressionLevel {
    pub const ALL: [CompressionLevel; 4] = [
        CompressionLevel::Verbatim,
        CompressionLevel::Masked,
        CompressionLevel::Summarized,
        CompressionLevel::Digest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionLevel::Verbatim => "L0",
            CompressionLevel::Masked => "L1",
            CompressionLevel::Summarized => "L2",
            CompressionLevel::Digest => "L3",
        }
    }

}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── ContextItem ────────────────────────────────────────────────────

/// An atomic unit of history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: ItemId,
    pub kind: ItemKind,
    /// Current payload; rewritten by compression.
    pub content: String,
    /// Cost of the content as originally registered (summed for merged items).
    pub raw_token_count: usize,
    /// Cost of `content` as it stands now.
    pub current_token_count: usize,
    pub created_step: u64,
    pub last_referenced_step: u64,
    pub reference_count: u32,
    pub tier: Tier,
    pub compression_level: CompressionLevel,
    /// Last computed composite retention score in [0, 1].
    pub importance: f64,
    /// Set when `importance` must be recomputed before use.
    #[serde(default)]
    pub importance_stale: bool,
    #[serde(default)]
    pub domain_tags: BTreeSet<String>,
    /// Producing tool, for tool results. Drives tool-specific mask limits.
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Whether the most recent pack had to hard-truncate this item.
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub outcome_successes: u32,
    #[serde(default)]
    pub outcome_failures: u32,
    /// Ids retired into this item by summarization.
    #[serde(default)]
    pub merged_from: Vec<ItemId>,
    /// Outstanding compression request covering this item.
    #[serde(default)]
    pub pending_request: Option<RequestId>,
    /// Failed compression attempts at the current level.
    #[serde(default)]
    pub compression_attempts: u32,
}

impl ContextItem {
    pub(crate) fn from_draft(id: ItemId, draft: ItemDraft, tokens: usize, step: u64) -> Self {
        Self {
            id,
            kind: draft.kind,
            content: draft.content,
            raw_token_count: tokens,
            current_token_count: tokens,
            created_step: step,
            last_referenced_step: step,
            reference_count: 0,
            tier: Tier::Hot,
            compression_level: CompressionLevel::Verbatim,
            importance: 0.0,
            importance_stale: true,
            domain_tags: draft.tags,
            tool_name: draft.tool_name,
            truncated: false,
            outcome_successes: 0,
            outcome_failures: 0,
            merged_from: Vec::new(),
            pending_request: None,
            compression_attempts: 0,
        }
    }

    /// Steps since the item was created.
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_step)
    }

    pub fn is_pinned(&self) -> bool {
        self.kind.is_pinned()
    }

    /// Replace the content, clamping the recorded cost to the raw cost.
    pub(crate) fn replace_content(&mut self, content: String, tokens: usize) {
        self.content = content;
        self.current_token_count = tokens.min(self.raw_token_count);
    }

    /// Tokens freed by compression so far.
    pub fn tokens_saved(&self) -> usize {
        self.raw_token_count.saturating_sub(self.current_token_count)
    }
}

/// Builder for a new item before it is registered with the engine.
///
/// ```ignore
/// let id = engine.add(
///     ItemDraft::new(ItemKind::ToolResult, output)
///         .with_tool("read_file")
///         .with_tag("rust"),
///     step,
/// );
/// ```
#[derive(Debug, Clone)]
pub struct ItemDraft {
    pub kind: ItemKind,
    pub content: String,
    pub tool_name: Option<String>,
    pub tags: BTreeSet<String>,
}

impl ItemDraft {
    pub fn new(kind: ItemKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tool_name: None,
            tags: BTreeSet::new(),
        }
    }

    /// Record the tool that produced this result.
    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    /// Attach a domain tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Attach several domain tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

// ── TaskState ──────────────────────────────────────────────────────

/// Status of a sub-goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubGoalStatus {
    Pending,
    InProgress,
    Done,
    Blocked,
}

impl SubGoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubGoalStatus::Pending => "pending",
            SubGoalStatus::InProgress => "in progress",
            SubGoalStatus::Done => "done",
            SubGoalStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubGoal {
    pub description: String,
    pub status: SubGoalStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    pub rationale: String,
    pub step: u64,
}

/// A known error and, once found, how it was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error: String,
    pub resolution: Option<String>,
    pub step: u64,
}

/// Session-wide working state, always packed verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub goal: String,
    pub subgoals: Vec<SubGoal>,
    pub decisions: Vec<Decision>,
    /// Active named entities and their status.
    pub entities: BTreeMap<String, String>,
    /// Percentage, 0-100.
    pub progress: u8,
    pub errors: Vec<ErrorRecord>,
    /// Tool name -> times seen in digests.
    pub tools_used: BTreeMap<String, u32>,
    pub lessons: Vec<String>,
    /// Raw tokens registered plus tokens of generated summaries and digests.
    pub token_spend: u64,
}

impl TaskState {
    /// Append a sub-goal and return its index.
    pub fn add_subgoal(&mut self, description: impl Into<String>) -> usize {
        self.subgoals.push(SubGoal {
            description: description.into(),
            status: SubGoalStatus::Pending,
        });
        self.subgoals.len() - 1
    }

    /// Returns `false` if no sub-goal has this index.
    pub fn set_subgoal_status(&mut self, index: usize, status: SubGoalStatus) -> bool {
        match self.subgoals.get_mut(index) {
            Some(goal) => {
                goal.status = status;
                true
            }
            None => false,
        }
    }

    pub fn record_decision(
        &mut self,
        decision: impl Into<String>,
        rationale: impl Into<String>,
        step: u64,
    ) {
        self.decisions.push(Decision {
            decision: decision.into(),
            rationale: rationale.into(),
            step,
        });
    }

    pub fn set_entity_status(&mut self, name: impl Into<String>, status: impl Into<String>) {
        self.entities.insert(name.into(), status.into());
    }

    /// Record an open error. Duplicate open errors are not repeated.
    pub fn record_error(&mut self, error: impl Into<String>, step: u64) {
        let error = error.into();
        if self
            .errors
            .iter()
            .any(|e| e.error == error && e.resolution.is_none())
        {
            return;
        }
        self.errors.push(ErrorRecord {
            error,
            resolution: None,
            step,
        });
    }

    /// Attach a resolution to the most recent open record of `error`.
    /// Returns `false` if there is no such open error.
    pub fn resolve_error(&mut self, error: &str, resolution: impl Into<String>) -> bool {
        match self
            .errors
            .iter_mut()
            .rev()
            .find(|e| e.error == error && e.resolution.is_none())
        {
            Some(record) => {
                record.resolution = Some(resolution.into());
                true
            }
            None => false,
        }
    }

    pub fn set_progress(&mut self, percent: u8) {
        self.progress = percent.min(100);
    }

    /// Errors that have no resolution yet.
    pub fn open_errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.errors.iter().filter(|e| e.resolution.is_none())
    }

    pub fn is_empty(&self) -> bool {
        self.goal.is_empty()
            && self.subgoals.is_empty()
            && self.decisions.is_empty()
            && self.entities.is_empty()
            && self.progress == 0
            && self.errors.is_empty()
            && self.tools_used.is_empty()
            && self.lessons.is_empty()
    }

    /// Render the packed representation. Empty sections are omitted; an
    /// empty state renders as an empty string.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from("[task state]\n");
        if !self.goal.is_empty() {
            out.push_str(&format!("goal: {}\n", self.goal));
        }
        out.push_str(&format!("progress: {}%\n", self.progress));
        if !self.subgoals.is_empty() {
            out.push_str("subgoals:\n");
            for g in &self.subgoals {
                out.push_str(&format!("  - [{}] {}\n", g.status.as_str(), g.description));
            }
        }
        if !self.decisions.is_empty() {
            out.push_str("decisions:\n");
            for d in &self.decisions {
                if d.rationale.is_empty() {
                    out.push_str(&format!("  - step {}: {}\n", d.step, d.decision));
                } else {
                    out.push_str(&format!(
                        "  - step {}: {} (why: {})\n",
                        d.step, d.decision, d.rationale
                    ));
                }
            }
        }
        if !self.entities.is_empty() {
            out.push_str("entities:\n");
            for (name, status) in &self.entities {
                out.push_str(&format!("  - {name}: {status}\n"));
            }
        }
        if !self.errors.is_empty() {
            out.push_str("errors:\n");
            for e in &self.errors {
                match &e.resolution {
                    Some(r) => out.push_str(&format!("  - {} => {}\n", e.error, r)),
                    None => out.push_str(&format!("  - open: {}\n", e.error)),
                }
            }
        }
        if !self.tools_used.is_empty() {
            let tools: Vec<String> = self
                .tools_used
                .iter()
                .map(|(name, n)| format!("{name} x{n}"))
                .collect();
            out.push_str(&format!("tools: {}\n", tools.join(", ")));
        }
        if !self.lessons.is_empty() {
            out.push_str("lessons:\n");
            for l in &self.lessons {
                out.push_str(&format!("  - {l}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_levels_are_ordered() {
        assert!(CompressionLevel::Verbatim < CompressionLevel::Masked);
        assert!(CompressionLevel::Masked < CompressionLevel::Summarized);
        assert!(CompressionLevel::Summarized < CompressionLevel::Digest);
    }

    #[test]
    fn pinned_kinds() {
        assert!(ItemKind::System.is_pinned());
        assert!(ItemKind::TaskState.is_pinned());
        assert!(!ItemKind::ToolResult.is_pinned());
        assert!(!ItemKind::UserMessage.is_pinned());
    }

    #[test]
    fn draft_builder_collects_tags() {
        let d = ItemDraft::new(ItemKind::ToolResult, "out")
            .with_tool("grep")
            .with_tag("rust")
            .with_tags(["auth", "rust"]);
        assert_eq!(d.tool_name.as_deref(), Some("grep"));
        assert_eq!(d.tags.len(), 2);
    }

    #[test]
    fn replace_content_never_exceeds_raw() {
        let mut item = ContextItem::from_draft(
            ItemId(1),
            ItemDraft::new(ItemKind::UserMessage, "hello"),
            10,
            0,
        );
        item.replace_content("a much longer replacement".into(), 50);
        assert_eq!(item.current_token_count, 10);
        assert!(item.current_token_count <= item.raw_token_count);
    }

    #[test]
    fn empty_task_state_renders_nothing() {
        assert_eq!(TaskState::default().render(), "");
    }

    #[test]
    fn task_state_render_lists_sections() {
        let mut ts = TaskState {
            goal: "fix login".into(),
            ..Default::default()
        };
        let idx = ts.add_subgoal("reproduce 401");
        ts.set_subgoal_status(idx, SubGoalStatus::Done);
        ts.record_decision("patch auth.py", "token expiry bug", 12);
        ts.record_error("401 on refresh", 10);
        ts.set_progress(140);

        let r = ts.render();
        assert!(r.contains("goal: fix login"));
        assert!(r.contains("[done] reproduce 401"));
        assert!(r.contains("step 12: patch auth.py (why: token expiry bug)"));
        assert!(r.contains("open: 401 on refresh"));
        assert!(r.contains("progress: 100%"));
    }

    #[test]
    fn resolve_error_targets_open_record() {
        let mut ts = TaskState::default();
        ts.record_error("timeout", 1);
        ts.record_error("timeout", 2);
        assert_eq!(ts.errors.len(), 1);
        assert!(ts.resolve_error("timeout", "raised limit"));
        assert!(!ts.resolve_error("timeout", "again"));
        assert_eq!(ts.open_errors().count(), 0);
    }

    #[test]
    fn set_subgoal_status_rejects_bad_index() {
        let mut ts = TaskState::default();
        assert!(!ts.set_subgoal_status(3, SubGoalStatus::Done));
    }
}
