//! Token accounting: deterministic cost estimates for arbitrary text.
//!
//! Estimates are character based (bytes / chars-per-token, rounded up), so
//! they are monotonic in text length and never zero for non-empty text. The
//! ratio can be calibrated per session from observed provider usage.

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; 3.5 sits in the middle.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Estimates the token cost of text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenAccountant {
    chars_per_token: f64,
}

impl Default for TokenAccountant {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl TokenAccountant {
    /// Use a calibrated chars-per-token ratio. Non-positive or non-finite
    /// values fall back to the default.
    pub fn with_calibration(chars_per_token: f64) -> Self {
        let cpt = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self {
            chars_per_token: cpt,
        }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Estimated tokens for `text`.
    pub fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        ((text.len() as f64 / self.chars_per_token).ceil() as usize).max(1)
    }

    /// Largest byte length whose estimate stays within `tokens`.
    pub fn max_bytes_for(&self, tokens: usize) -> usize {
        (tokens as f64 * self.chars_per_token).floor() as usize
    }

    /// Cut `text` so its estimate fits `max_tokens`, appending a marker that
    /// records how much was kept. Returns the text unchanged if it already
    /// fits. When the marker itself does not fit, the result is a bare
    /// prefix; it is empty only for a zero budget.
    pub fn truncate_to(&self, text: &str, max_tokens: usize) -> String {
        let total = self.estimate(text);
        if total <= max_tokens {
            return text.to_string();
        }
        // `kept` only ever shrinks, so this terminates.
        let mut kept = max_tokens;
        loop {
            let marker = format!("\n[truncated: {kept} of {total} tokens kept]");
            let marker_tokens = self.estimate(&marker);
            if marker_tokens >= max_tokens {
                return self.bare_prefix(text, max_tokens);
            }
            let room = max_tokens - marker_tokens;
            if kept > room {
                kept = room;
                continue;
            }
            let prefix = prefix_at_char_boundary(text, self.max_bytes_for(kept));
            let candidate = format!("{prefix}{marker}");
            if self.estimate(&candidate) <= max_tokens {
                return candidate;
            }
            if kept == 0 {
                return self.bare_prefix(text, max_tokens);
            }
            kept -= 1;
        }
    }

    fn bare_prefix(&self, text: &str, max_tokens: usize) -> String {
        prefix_at_char_boundary(text, self.max_bytes_for(max_tokens)).to_string()
    }
}

/// Estimate with the default ratio.
pub fn estimate_tokens(text: &str) -> usize {
    TokenAccountant::default().estimate(text)
}

/// Truncate with the default ratio.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    TokenAccountant::default().truncate_to(text, max_tokens)
}

/// Longest prefix of `text` no longer than `max_bytes` that ends on a char
/// boundary.
pub(crate) fn prefix_at_char_boundary(text: &str, max_bytes: usize) -> &str {
    if max_bytes >= text.len() {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text.get(..end).unwrap_or("")
}
