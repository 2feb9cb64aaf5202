//! Lightweight entity extraction for co-reference tracking.
//!
//! Pulls identifier-like strings out of item content with a fixed set of
//! patterns:
//!
//! 1. Path-like tokens (`src/auth.py`, `Cargo.toml`)
//! 2. Code symbols (`auth::refresh`, `login()`)
//! 3. Backticked, double-quoted, single-quoted and bracketed identifiers
//! 4. Capitalized multi-word spans (`Token Refresh Service`)
//! 5. `key=value` tokens (`retries=3`)
//!
//! No semantic understanding is attempted. Output is ordered by first
//! occurrence and deduplicated.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

struct Rule {
    re: Regex,
    /// Use capture group 1 instead of the whole match.
    inner: bool,
}

const RULES: &[(&str, bool)] = &[
    // Paths with at least one separator.
    (r"(?:[\w.-]+/)+[\w.-]+", false),
    // Bare file names with a short extension.
    (r"\b[\w-]+\.[A-Za-z][A-Za-z0-9]{0,7}\b", false),
    (r"\b[A-Za-z_]\w*(?:::[A-Za-z_]\w*)+", false),
    (r"\b[A-Za-z_]\w*\(\)", false),
    (r"`([^`\n]{1,80})`", true),
    (r#""([^"\n]{1,80})""#, true),
    (r"'([A-Za-z_][\w./-]{0,79})'", true),
    (r"\[([^\[\]\n]{1,80})\]", true),
    (r"\b[A-Z][a-z]+(?:[ \t]+[A-Z][a-z]+)+\b", false),
    (r"\b[A-Za-z_][\w.-]*=[^\s,;]+", false),
];

static PATTERNS: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    RULES
        .iter()
        .filter_map(|(src, inner)| {
            Regex::new(src).ok().map(|re| Rule {
                re,
                inner: *inner,
            })
        })
        .collect()
});

/// Extract entities from `text` in order of first occurrence.
pub fn extract_entities(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut found: Vec<(usize, String)> = Vec::new();
    for rule in PATTERNS.iter() {
        for caps in rule.re.captures_iter(text) {
            let m = if rule.inner { caps.get(1) } else { caps.get(0) };
            let Some(m) = m else { continue };
            let entity = normalize(m.as_str());
            if !entity.is_empty() {
                found.push((m.start(), entity.to_string()));
            }
        }
    }
    found.sort_by_key(|(pos, _)| *pos);

    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter_map(|(_, e)| seen.insert(e.clone()).then_some(e))
        .collect()
}

/// Strip sentence punctuation that path patterns pick up at the end.
fn normalize(raw: &str) -> &str {
    raw.trim()
        .trim_end_matches(['.', '-', ':'])
        .trim_start_matches(['.', '-'])
}
