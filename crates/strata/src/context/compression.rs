//! Compression pipeline: the four-level state machine that shrinks aged items.
//!
//! | Level | Age (default) | How |
//! |-------|---------------|-----|
//! | L0 Verbatim | 0-10 | untouched |
//! | L1 Masked | 11-50 | tool output past a size limit replaced by a placeholder, locally |
//! | L2 Summarized | 51-199 | batch merged into one externally generated summary |
//! | L3 Digest | 200+ | summaries folded into [`TaskState`], then retired |
//!
//! L1 needs no outside help. L2 and L3 are request/completion pairs: the
//! pipeline emits a [`CompressionRequest`] carrying a ready-made prompt and
//! never blocks on it. The caller runs the generation however it likes and
//! hands the text back through the engine; until then the items keep their
//! current level. A failed or rejected request leaves them exactly as they
//! were.

use crate::config::{CompressionConfig, DomainProfile};
use crate::context::tokens::TokenAccountant;
use crate::item::{CompressionLevel, ContextItem, ItemId, ItemKind, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Prefix of every masking placeholder.
///
/// Both the placeholder writer and the "already masked?" check reference
/// this constant so they can't drift out of sync.
pub const MASKED_PREFIX: &str = "[Masked:";

/// Resolved requests kept around for inspection.
const MAX_RESOLVED_REQUESTS: usize = 256;

const SUMMARIZATION_PROMPT: &str = "\
Summarize the following context items into one concise, factual summary. Focus on:
- What was accomplished (completed subtasks, files modified)
- Key findings and decisions, with their rationale
- Failed approaches and the errors they produced
- File paths, symbols and identifiers mentioned

Rules:
- Only include facts explicitly stated in the items. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- The summary replaces the items entirely and must be shorter than them.";

const DIGEST_PROMPT: &str = "\
Fold the following summaries into the running task state. Reply using exactly \
these sections, one entry per line starting with \"- \", omitting empty sections:

DECISIONS:
- <decision> | <rationale>
TOOLS:
- <tool name>
ERRORS:
- <error> => <resolution, or leave out \"=>\" if still open>
ENTITIES:
- <name>: <status>
LESSONS:
- <lesson learned>
PROGRESS: <overall completion, 0-100>

Rules:
- Keep only goals, decisions, outcomes and lessons. Drop narration.
- Do not repeat entries already present in the current task state.";

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Completed,
    Failed,
}

/// Which transition a request drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// L1 -> L2: merge the batch into one summary item.
    Summarize,
    /// L2 -> L3: fold the batch into the task state.
    Digest,
}

impl RequestKind {
    pub fn target_level(&self) -> CompressionLevel {
        match self {
            RequestKind::Summarize => CompressionLevel::Summarized,
            RequestKind::Digest => CompressionLevel::Digest,
        }
    }
}

/// A unit of work that needs external text generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    /// Target items, oldest first.
    pub items: Vec<ItemId>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub status: RequestStatus,
    pub created_step: u64,
    /// Why the request failed, once it has.
    pub failure: Option<String>,
}

// ── Masking ────────────────────────────────────────────────────────

/// What masking did to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskOutcome {
    pub id: ItemId,
    /// Whether a placeholder replaced part of the content.
    pub replaced: bool,
    pub tokens_freed: usize,
}

// ── Digest parsing ─────────────────────────────────────────────────

/// Structured content of an L3 digest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DigestUpdate {
    pub decisions: Vec<(String, String)>,
    pub tools: Vec<String>,
    pub errors: Vec<(String, Option<String>)>,
    pub entities: Vec<(String, String)>,
    pub lessons: Vec<String>,
    pub progress: Option<u8>,
}

impl DigestUpdate {
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
            && self.tools.is_empty()
            && self.errors.is_empty()
            && self.entities.is_empty()
            && self.lessons.is_empty()
            && self.progress.is_none()
    }

    /// Merge into `state`. Open errors reported again with a resolution are
    /// resolved in place.
    pub fn apply_to(&self, state: &mut TaskState, step: u64) {
        for (decision, rationale) in &self.decisions {
            state.record_decision(decision.clone(), rationale.clone(), step);
        }
        for tool in &self.tools {
            *state.tools_used.entry(tool.clone()).or_insert(0) += 1;
        }
        for (error, resolution) in &self.errors {
            match resolution {
                Some(r) => {
                    if !state.resolve_error(error, r.clone()) {
                        state.record_error(error.clone(), step);
                        state.resolve_error(error, r.clone());
                    }
                }
                None => state.record_error(error.clone(), step),
            }
        }
        for (name, status) in &self.entities {
            state.set_entity_status(name.clone(), status.clone());
        }
        for lesson in &self.lessons {
            if !state.lessons.contains(lesson) {
                state.lessons.push(lesson.clone());
            }
        }
        if let Some(p) = self.progress {
            state.set_progress(p);
        }
    }
}

#[derive(Clone, Copy)]
enum Section {
    Decisions,
    Tools,
    Errors,
    Entities,
    Lessons,
}

/// Parse the line-oriented digest format. Returns `None` when nothing
/// recognizable is found.
pub fn parse_digest(text: &str) -> Option<DigestUpdate> {
    let mut update = DigestUpdate::default();
    let mut section: Option<Section> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((head, rest)) = line.split_once(':') {
            let head_upper = head.trim().to_ascii_uppercase();
            let header = match head_upper.as_str() {
                "DECISIONS" => Some(Section::Decisions),
                "TOOLS" => Some(Section::Tools),
                "ERRORS" => Some(Section::Errors),
                "ENTITIES" => Some(Section::Entities),
                "LESSONS" => Some(Section::Lessons),
                "PROGRESS" => {
                    let digits: String = rest
                        .trim()
                        .trim_end_matches('%')
                        .chars()
                        .take_while(|c| c.is_ascii_digit())
                        .collect();
                    if let Ok(p) = digits.parse::<u32>() {
                        update.progress = Some(p.min(100) as u8);
                    }
                    section = None;
                    continue;
                }
                _ => None,
            };
            if header.is_some() {
                section = header;
                continue;
            }
        }

        let Some(entry) = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
            .map(str::trim)
        else {
            continue;
        };
        if entry.is_empty() {
            continue;
        }
        match section {
            Some(Section::Decisions) => {
                let (d, r) = entry.split_once('|').unwrap_or((entry, ""));
                update.decisions.push((d.trim().to_string(), r.trim().to_string()));
            }
            Some(Section::Tools) => update.tools.push(entry.to_string()),
            Some(Section::Errors) => match entry.split_once("=>") {
                Some((e, r)) if !r.trim().is_empty() => {
                    update
                        .errors
                        .push((e.trim().to_string(), Some(r.trim().to_string())));
                }
                Some((e, _)) => update.errors.push((e.trim().to_string(), None)),
                None => update.errors.push((entry.to_string(), None)),
            },
            Some(Section::Entities) => {
                let (n, s) = entry.split_once(':').unwrap_or((entry, "active"));
                update
                    .entities
                    .push((n.trim().to_string(), s.trim().to_string()));
            }
            Some(Section::Lessons) => update.lessons.push(entry.to_string()),
            None => {}
        }
    }

    (!update.is_empty()).then_some(update)
}

// ── Completion results ─────────────────────────────────────────────

/// Result of merging a summarized batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The surviving item, now at L2.
    pub anchor: ItemId,
    /// Batch members folded into the anchor.
    pub retired: Vec<ItemId>,
    pub tokens: usize,
    pub tokens_saved: usize,
}

/// Result of folding a batch into the task state.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestOutcome {
    pub retired: Vec<ItemId>,
    pub tokens: usize,
    pub tokens_saved: usize,
}

// ── Pipeline ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompressionPipeline {
    config: CompressionConfig,
    profile: DomainProfile,
    requests: BTreeMap<RequestId, CompressionRequest>,
    resolved: VecDeque<RequestId>,
    next_id: u64,
}

impl CompressionPipeline {
    pub fn new(config: CompressionConfig, profile: DomainProfile) -> Self {
        Self {
            config,
            profile,
            requests: BTreeMap::new(),
            resolved: VecDeque::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    // ── L1 ────────────────────────────────────────────────────────

    /// Advance `item` from L0 to L1 if it is old enough. Tool output beyond
    /// the profile's limit is replaced by a placeholder; every other kind
    /// keeps its content.
    pub fn mask_if_due(
        &self,
        item: &mut ContextItem,
        now: u64,
        accountant: &TokenAccountant,
    ) -> Option<MaskOutcome> {
        if item.compression_level != CompressionLevel::Verbatim
            || item.age(now) < self.config.thresholds.masked
            || self.profile.preserves(item)
        {
            return None;
        }
        item.compression_level = CompressionLevel::Masked;
        let mut outcome = MaskOutcome {
            id: item.id,
            replaced: false,
            tokens_freed: 0,
        };
        if item.kind != ItemKind::ToolResult || item.content.starts_with(MASKED_PREFIX) {
            return Some(outcome);
        }

        let limit = self.profile.mask_chars_for(item.tool_name.as_deref());
        let total_chars = item.content.chars().count();
        if total_chars <= limit {
            return Some(outcome);
        }
        let cut = item
            .content
            .char_indices()
            .nth(limit)
            .map_or(item.content.len(), |(i, _)| i);
        let kept = item.content.get(..cut).unwrap_or("");
        let placeholder = format!(
            "{MASKED_PREFIX} {} output, {total_chars} chars, {limit} kept, step {}]",
            item.tool_name.as_deref().unwrap_or("tool"),
            item.created_step,
        );
        let masked = if kept.is_empty() {
            placeholder
        } else {
            format!("{kept}\n{placeholder}")
        };
        let tokens = accountant.estimate(&masked);
        if tokens < item.current_token_count {
            outcome.replaced = true;
            outcome.tokens_freed = item.current_token_count - tokens;
            item.replace_content(masked, tokens);
        }
        Some(outcome)
    }

    // ── L2 / L3 planning ──────────────────────────────────────────

    fn eligible(&self, item: &ContextItem, level: CompressionLevel, min_age: u64, now: u64) -> bool {
        item.compression_level == level
            && item.age(now) >= min_age
            && item.pending_request.is_none()
            && item.compression_attempts < self.config.max_attempts
            && !self.profile.preserves(item)
    }

    /// Emit requests for every batch of items due for L2 or L3 and mark the
    /// items pending. Items already covered by a pending request are skipped.
    pub fn plan(
        &mut self,
        items: &mut BTreeMap<ItemId, ContextItem>,
        task_state: &TaskState,
        now: u64,
    ) -> Vec<CompressionRequest> {
        let t = self.config.thresholds;
        let mut plans: Vec<(RequestKind, Vec<ItemId>)> = Vec::new();
        for (kind, level, min_age) in [
            (RequestKind::Summarize, CompressionLevel::Masked, t.summarized),
            (RequestKind::Digest, CompressionLevel::Summarized, t.digest),
        ] {
            let mut due: Vec<&ContextItem> = items
                .values()
                .filter(|it| self.eligible(it, level, min_age, now))
                .collect();
            due.sort_by_key(|it| (it.created_step, it.id));
            for chunk in due.chunks(self.config.batch_size) {
                plans.push((kind, chunk.iter().map(|it| it.id).collect()));
            }
        }

        let mut out = Vec::with_capacity(plans.len());
        for (kind, ids) in plans {
            let members: Vec<&ContextItem> = ids.iter().filter_map(|id| items.get(id)).collect();
            let (system_prompt, user_prompt) = match kind {
                RequestKind::Summarize => build_summary_prompt(&members),
                RequestKind::Digest => build_digest_prompt(&members, task_state),
            };
            let id = RequestId(self.next_id);
            self.next_id += 1;
            let request = CompressionRequest {
                id,
                kind,
                items: ids,
                system_prompt,
                user_prompt,
                status: RequestStatus::Pending,
                created_step: now,
                failure: None,
            };
            for item_id in &request.items {
                if let Some(item) = items.get_mut(item_id) {
                    item.pending_request = Some(id);
                }
            }
            self.requests.insert(id, request.clone());
            out.push(request);
        }
        out
    }

    // ── Request bookkeeping ───────────────────────────────────────

    pub fn get(&self, id: RequestId) -> Option<&CompressionRequest> {
        self.requests.get(&id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &CompressionRequest> {
        self.requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.get(id).is_some_and(|r| r.status == RequestStatus::Pending)
    }

    fn resolve(&mut self, id: RequestId, status: RequestStatus, failure: Option<String>) {
        if let Some(r) = self.requests.get_mut(&id) {
            r.status = status;
            r.failure = failure;
            self.resolved.push_back(id);
        }
        while self.resolved.len() > MAX_RESOLVED_REQUESTS {
            if let Some(old) = self.resolved.pop_front() {
                self.requests.remove(&old);
            }
        }
    }

    pub fn mark_completed(&mut self, id: RequestId) {
        self.resolve(id, RequestStatus::Completed, None);
    }

    pub fn mark_failed(&mut self, id: RequestId, reason: impl Into<String>) {
        self.resolve(id, RequestStatus::Failed, Some(reason.into()));
    }

    /// Fail every pending request. Used when in-memory state is replaced.
    pub fn drop_pending(&mut self, reason: &str) -> Vec<RequestId> {
        let ids: Vec<RequestId> = self.pending().map(|r| r.id).collect();
        for id in &ids {
            self.mark_failed(*id, reason);
        }
        ids
    }
}

// ── Prompt builders ────────────────────────────────────────────────

fn format_items(out: &mut String, members: &[&ContextItem]) {
    for item in members {
        out.push_str(&format!(
            "[{} {} step {}]: {}\n\n",
            item.id, item.kind, item.created_step, item.content
        ));
    }
}

/// Build the (system, user) prompt pair for an L2 summary.
pub fn build_summary_prompt(members: &[&ContextItem]) -> (String, String) {
    let mut content = String::from("=== ITEMS TO SUMMARIZE ===\n");
    format_items(&mut content, members);
    (SUMMARIZATION_PROMPT.to_string(), content)
}

/// Build the (system, user) prompt pair for an L3 digest.
pub fn build_digest_prompt(members: &[&ContextItem], state: &TaskState) -> (String, String) {
    let mut content = String::new();
    let rendered = state.render();
    if !rendered.is_empty() {
        content.push_str("=== CURRENT TASK STATE ===\n");
        content.push_str(&rendered);
        content.push('\n');
    }
    content.push_str("=== SUMMARIES TO DIGEST ===\n");
    format_items(&mut content, members);
    (DIGEST_PROMPT.to_string(), content)
}

// ── Applying completions ───────────────────────────────────────────

/// Check that every member of `request` is still live and waiting on it.
fn check_members(
    items: &BTreeMap<ItemId, ContextItem>,
    request: &CompressionRequest,
) -> Result<(), String> {
    for id in &request.items {
        match items.get(id) {
            Some(it) if it.pending_request == Some(request.id) => {}
            Some(_) => return Err(format!("{id} is no longer waiting on {}", request.id)),
            None => return Err(format!("{id} no longer exists")),
        }
    }
    Ok(())
}

/// Merge a summarized batch into its oldest member. On `Err` nothing has
/// been modified.
pub fn merge_summary(
    items: &mut BTreeMap<ItemId, ContextItem>,
    request: &CompressionRequest,
    text: &str,
    accountant: &TokenAccountant,
) -> Result<MergeOutcome, String> {
    check_members(items, request)?;
    let summary = text.trim();
    if summary.is_empty() {
        return Err("summary text is empty".to_string());
    }
    let raw_sum: usize = request
        .items
        .iter()
        .filter_map(|id| items.get(id))
        .map(|it| it.raw_token_count)
        .sum();
    let current_sum: usize = request
        .items
        .iter()
        .filter_map(|id| items.get(id))
        .map(|it| it.current_token_count)
        .sum();
    let tokens = accountant.estimate(summary);
    if tokens > raw_sum {
        return Err(format!(
            "summary costs {tokens} tokens, more than the {raw_sum} it replaces"
        ));
    }

    let Some((&anchor_id, rest)) = request.items.split_first() else {
        return Err("request has no items".to_string());
    };
    let mut retired = Vec::with_capacity(rest.len());
    let mut absorbed: Vec<ContextItem> = Vec::with_capacity(rest.len());
    for id in rest {
        if let Some(it) = items.remove(id) {
            retired.push(*id);
            absorbed.push(it);
        }
    }
    let Some(anchor) = items.get_mut(&anchor_id) else {
        return Err(format!("{anchor_id} no longer exists"));
    };

    let mut tools: BTreeSet<Option<String>> = BTreeSet::new();
    tools.insert(anchor.tool_name.clone());
    for it in absorbed {
        anchor.reference_count = anchor.reference_count.saturating_add(it.reference_count);
        anchor.outcome_successes += it.outcome_successes;
        anchor.outcome_failures += it.outcome_failures;
        anchor.last_referenced_step = anchor.last_referenced_step.max(it.last_referenced_step);
        anchor.domain_tags.extend(it.domain_tags);
        anchor.merged_from.push(it.id);
        anchor.merged_from.extend(it.merged_from);
        tools.insert(it.tool_name);
    }
    if tools.len() > 1 {
        anchor.tool_name = None;
    }
    anchor.raw_token_count = raw_sum;
    anchor.replace_content(summary.to_string(), tokens);
    anchor.compression_level = CompressionLevel::Summarized;
    anchor.pending_request = None;
    anchor.compression_attempts = 0;
    anchor.truncated = false;
    anchor.importance_stale = true;

    Ok(MergeOutcome {
        anchor: anchor_id,
        retired,
        tokens,
        tokens_saved: current_sum.saturating_sub(tokens),
    })
}

/// Fold a digested batch into `state` and retire its items. On `Err`
/// nothing has been modified.
pub fn apply_digest(
    items: &mut BTreeMap<ItemId, ContextItem>,
    state: &mut TaskState,
    request: &CompressionRequest,
    text: &str,
    accountant: &TokenAccountant,
    now: u64,
) -> Result<DigestOutcome, String> {
    check_members(items, request)?;
    let Some(update) = parse_digest(text) else {
        return Err("digest contained no recognizable sections".to_string());
    };
    update.apply_to(state, now);
    let mut freed = 0;
    let mut retired = Vec::with_capacity(request.items.len());
    for id in &request.items {
        if let Some(it) = items.remove(id) {
            freed += it.current_token_count;
            retired.push(*id);
        }
    }
    Ok(DigestOutcome {
        retired,
        tokens: accountant.estimate(text),
        tokens_saved: freed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemDraft;

    fn acc() -> TokenAccountant {
        TokenAccountant::default()
    }

    fn add(
        items: &mut BTreeMap<ItemId, ContextItem>,
        id: u64,
        kind: ItemKind,
        content: &str,
        step: u64,
    ) {
        let tokens = acc().estimate(content);
        let it = ContextItem::from_draft(ItemId(id), ItemDraft::new(kind, content), tokens, step);
        items.insert(ItemId(id), it);
    }

    fn pipeline() -> CompressionPipeline {
        CompressionPipeline::new(CompressionConfig::default(), DomainProfile::default())
    }

    #[test]
    fn masking_replaces_long_tool_output() {
        let p = CompressionPipeline::new(
            CompressionConfig::default(),
            DomainProfile::default().with_tool_mask_chars("read_file", 10),
        );
        let body = "x".repeat(500);
        let mut it = ContextItem::from_draft(
            ItemId(1),
            ItemDraft::new(ItemKind::ToolResult, body.clone()).with_tool("read_file"),
            acc().estimate(&body),
            0,
        );
        assert!(p.mask_if_due(&mut it, 10, &acc()).is_none());
        let out = p.mask_if_due(&mut it, 11, &acc()).unwrap();
        assert!(out.replaced);
        assert_eq!(it.compression_level, CompressionLevel::Masked);
        assert!(it.content.starts_with("xxxxxxxxxx\n[Masked: read_file output, 500 chars"));
        assert_eq!(it.current_token_count, acc().estimate(&it.content));
        assert!(it.current_token_count < it.raw_token_count);
        // Already L1: no second pass.
        assert!(p.mask_if_due(&mut it, 30, &acc()).is_none());
    }

    #[test]
    fn conversation_items_are_never_masked() {
        let p = pipeline();
        let body = "I decided to rewrite the parser. ".repeat(200);
        let mut it = ContextItem::from_draft(
            ItemId(1),
            ItemDraft::new(ItemKind::AssistantMessage, body.clone()),
            acc().estimate(&body),
            0,
        );
        let out = p.mask_if_due(&mut it, 20, &acc()).unwrap();
        assert!(!out.replaced);
        assert_eq!(it.content, body);
        assert_eq!(it.compression_level, CompressionLevel::Masked);
    }

    #[test]
    fn preserved_items_are_skipped() {
        let p = CompressionPipeline::new(
            CompressionConfig::default(),
            DomainProfile::default().preserve_tag("keep"),
        );
        let mut it = ContextItem::from_draft(
            ItemId(1),
            ItemDraft::new(ItemKind::ToolResult, "y".repeat(5_000)).with_tag("keep"),
            1_429,
            0,
        );
        assert!(p.mask_if_due(&mut it, 100, &acc()).is_none());
        let mut sys = ContextItem::from_draft(
            ItemId(2),
            ItemDraft::new(ItemKind::System, "rules"),
            2,
            0,
        );
        assert!(p.mask_if_due(&mut sys, 100, &acc()).is_none());
    }

    #[test]
    fn plan_batches_due_items_once() {
        let mut p = CompressionPipeline::new(
            CompressionConfig {
                batch_size: 2,
                ..CompressionConfig::default()
            },
            DomainProfile::default(),
        );
        let mut items = BTreeMap::new();
        for i in 1..=3 {
            add(&mut items, i, ItemKind::UserMessage, "please look at it", i);
            items.get_mut(&ItemId(i)).unwrap().compression_level = CompressionLevel::Masked;
        }
        let reqs = p.plan(&mut items, &TaskState::default(), 60);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].items, vec![ItemId(1), ItemId(2)]);
        assert_eq!(reqs[1].items, vec![ItemId(3)]);
        assert!(reqs[0].user_prompt.contains("item-1"));
        assert!(reqs[0].system_prompt.contains("Summarize"));
        assert_eq!(p.pending_count(), 2);
        // Everything is pending now.
        assert!(p.plan(&mut items, &TaskState::default(), 61).is_empty());
    }

    #[test]
    fn merge_keeps_anchor_and_sums_costs() {
        let mut p = pipeline();
        let mut items = BTreeMap::new();
        add(&mut items, 1, ItemKind::ToolResult, &"alpha ".repeat(50), 1);
        add(&mut items, 2, ItemKind::UserMessage, &"beta ".repeat(50), 2);
        items.get_mut(&ItemId(2)).unwrap().reference_count = 3;
        for it in items.values_mut() {
            it.compression_level = CompressionLevel::Masked;
        }
        let raw: usize = items.values().map(|i| i.raw_token_count).sum();
        let req = p.plan(&mut items, &TaskState::default(), 80).remove(0);

        let out = merge_summary(&mut items, &req, "alpha then beta", &acc()).unwrap();
        assert_eq!(out.anchor, ItemId(1));
        assert_eq!(out.retired, vec![ItemId(2)]);
        let anchor = &items[&ItemId(1)];
        assert_eq!(items.len(), 1);
        assert_eq!(anchor.compression_level, CompressionLevel::Summarized);
        assert_eq!(anchor.raw_token_count, raw);
        assert_eq!(anchor.current_token_count, acc().estimate("alpha then beta"));
        assert_eq!(anchor.reference_count, 3);
        assert_eq!(anchor.merged_from, vec![ItemId(2)]);
        assert!(anchor.pending_request.is_none());
        assert!(anchor.tool_name.is_none());
    }

    #[test]
    fn oversized_summary_is_rejected_untouched() {
        let mut p = pipeline();
        let mut items = BTreeMap::new();
        add(&mut items, 1, ItemKind::UserMessage, "short", 1);
        items.get_mut(&ItemId(1)).unwrap().compression_level = CompressionLevel::Masked;
        let req = p.plan(&mut items, &TaskState::default(), 60).remove(0);
        let before = items.clone();
        let err = merge_summary(&mut items, &req, &"much longer text ".repeat(10), &acc());
        assert!(err.is_err());
        assert_eq!(items, before);
        assert!(merge_summary(&mut items, &req, "   ", &acc()).is_err());
    }

    #[test]
    fn parse_full_digest() {
        let text = "\
DECISIONS:
- use sqlite | fewer moving parts
TOOLS:
- read_file
- grep
ERRORS:
- 401 on refresh => rotate token
- flaky test
ENTITIES:
- src/auth.py: patched
LESSONS:
* check token expiry first
PROGRESS: 60%";
        let d = parse_digest(text).unwrap();
        assert_eq!(d.decisions, vec![("use sqlite".into(), "fewer moving parts".into())]);
        assert_eq!(d.tools, vec!["read_file".to_string(), "grep".to_string()]);
        assert_eq!(d.errors[0], ("401 on refresh".into(), Some("rotate token".into())));
        assert_eq!(d.errors[1], ("flaky test".into(), None));
        assert_eq!(d.entities, vec![("src/auth.py".into(), "patched".into())]);
        assert_eq!(d.lessons, vec!["check token expiry first".to_string()]);
        assert_eq!(d.progress, Some(60));
    }

    #[test]
    fn unparseable_digest_is_none() {
        assert!(parse_digest("I could not do that.").is_none());
        assert!(parse_digest("").is_none());
    }

    #[test]
    fn digest_updates_task_state_and_retires() {
        let mut p = pipeline();
        let mut items = BTreeMap::new();
        add(&mut items, 4, ItemKind::AssistantMessage, "summary of early work", 0);
        items.get_mut(&ItemId(4)).unwrap().compression_level = CompressionLevel::Summarized;
        let mut state = TaskState::default();
        state.record_error("401 on refresh", 3);
        let req = p.plan(&mut items, &state, 250).remove(0);
        assert_eq!(req.kind, RequestKind::Digest);
        assert!(req.user_prompt.contains("CURRENT TASK STATE"));

        let out = apply_digest(
            &mut items,
            &mut state,
            &req,
            "ERRORS:\n- 401 on refresh => rotate token\nTOOLS:\n- grep\nPROGRESS: 30",
            &acc(),
            250,
        )
        .unwrap();
        assert_eq!(out.retired, vec![ItemId(4)]);
        assert!(items.is_empty());
        assert_eq!(state.open_errors().count(), 0);
        assert_eq!(state.tools_used.get("grep"), Some(&1));
        assert_eq!(state.progress, 30);
    }

    #[test]
    fn drop_pending_fails_everything_outstanding() {
        let mut p = pipeline();
        let mut items = BTreeMap::new();
        add(&mut items, 1, ItemKind::UserMessage, "x", 0);
        items.get_mut(&ItemId(1)).unwrap().compression_level = CompressionLevel::Masked;
        let req = p.plan(&mut items, &TaskState::default(), 60).remove(0);
        let dropped = p.drop_pending("superseded");
        assert_eq!(dropped, vec![req.id]);
        assert_eq!(p.get(req.id).unwrap().status, RequestStatus::Failed);
        assert_eq!(p.get(req.id).unwrap().failure.as_deref(), Some("superseded"));
    }
}
