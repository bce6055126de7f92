//! Conversation-history importance scoring, budget-bounded filtering, and
//! compression — the pure logic behind the ContextManager's "smart
//! context assembly".

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Cheap token estimate: roughly four characters per token, matching
    /// the order of magnitude most tokenizers produce for English prose.
    pub fn approx_tokens(&self) -> u32 {
        (self.content.len() as u32 / 4).max(1)
    }
}

const CONTENT_CUE_WEIGHTS: &[(&str, i32)] = &[
    ("step complete", 25),
    ("step blocked", 20),
    ("error", 15),
    ("failed", 15),
    ("exception", 15),
    ("create", 10),
    ("write", 10),
    ("implement", 10),
    ("decide", 15),
    ("decision", 15),
    ("chose", 15),
];

const VAGUE_FILLER: &[&str] = &["ok", "okay", "sure", "got it", "sounds good", "noted"];

const LONG_CONTENT_THRESHOLD: usize = 4_000;

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid regex"))
}

/// Score a single message in `[0, 100]`, given its position in the full
/// history.
pub fn importance_score(message: &Message, index: usize, total: usize) -> u8 {
    let mut score: i32 = 0;

    if total > 1 {
        let recency = index as f64 / (total - 1) as f64;
        score += (recency * 30.0).round() as i32;
    } else {
        score += 30;
    }

    score += match message.role {
        Role::System => 20,
        Role::User => 10,
        Role::Assistant => 0,
    };

    let lowered = message.content.to_ascii_lowercase();
    for (cue, weight) in CONTENT_CUE_WEIGHTS {
        if lowered.contains(cue) {
            score += weight;
        }
    }

    let normalized = whitespace_re().replace_all(lowered.trim(), " ").to_string();
    if VAGUE_FILLER.contains(&normalized.as_str()) {
        score -= 20;
    }
    if message.content.len() > LONG_CONTENT_THRESHOLD {
        score -= 10;
    }

    score.clamp(0, 100) as u8
}

/// Always keep the first message and the last three; greedily admit the
/// highest-scoring remaining messages whose token cost fits `budget`,
/// preserving original order in the output.
pub fn filter_by_importance(history: &[Message], budget_tokens: u32) -> Vec<Message> {
    if history.is_empty() {
        return Vec::new();
    }
    let total = history.len();
    let mandatory_start = 0usize;
    let mandatory_tail_from = total.saturating_sub(3);

    let mut kept_indices: Vec<usize> = (mandatory_start..total.min(1))
        .chain(mandatory_tail_from..total)
        .collect();
    kept_indices.sort_unstable();
    kept_indices.dedup();

    let mut spent: u32 = kept_indices.iter().map(|&i| history[i].approx_tokens()).sum();

    let mut candidates: Vec<(usize, u8)> = (0..total)
        .filter(|i| !kept_indices.contains(i))
        .map(|i| (i, importance_score(&history[i], i, total)))
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    for (index, _) in candidates {
        let cost = history[index].approx_tokens();
        if spent + cost > budget_tokens {
            continue;
        }
        spent += cost;
        kept_indices.push(index);
    }

    kept_indices.sort_unstable();
    kept_indices.into_iter().map(|i| history[i].clone()).collect()
}

fn step_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)step\s+([\d.]+)\s+complete").expect("valid regex"))
}

fn file_op_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:created|wrote|updated|modified)\s+([\w./\-]+\.\w+)").expect("valid regex"))
}

fn error_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(error[:\s][^\n]{0,80})").expect("valid regex"))
}

fn decision_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(decided|chose)\s+to\s+([^\n.]{0,80})").expect("valid regex"))
}

/// Extract a flat list of "key points" from a batch of messages: completed
/// step numbers, file operations, the first error, and decisions.
fn extract_key_points(batch: &[Message]) -> Vec<String> {
    let mut points = Vec::new();
    let mut emitted_error = false;

    for message in batch {
        for cap in step_number_re().captures_iter(&message.content) {
            points.push(format!("step {} completed", &cap[1]));
        }
        for cap in file_op_re().captures_iter(&message.content) {
            points.push(format!("touched {}", &cap[1]));
        }
        if !emitted_error
            && let Some(cap) = error_re().captures(&message.content)
        {
            points.push(cap[1].trim().to_string());
            emitted_error = true;
        }
        for cap in decision_re().captures_iter(&message.content) {
            points.push(format!("decided to {}", cap[2].trim()));
        }
    }
    points
}

/// Fold all but the most recent `keep_recent` messages into a single
/// synthetic system message of semicolon-separated key points.
pub fn compress_history(history: &[Message], keep_recent: usize) -> Vec<Message> {
    if history.len() <= keep_recent {
        return history.to_vec();
    }
    let split_at = history.len() - keep_recent;
    let (old, recent) = history.split_at(split_at);

    let key_points = extract_key_points(old);
    let summary = Message {
        role: Role::System,
        content: if key_points.is_empty() {
            "(no notable events in compressed history)".to_string()
        } else {
            key_points.join("; ")
        },
    };

    let mut out = vec![summary];
    out.extend_from_slice(recent);
    out
}

/// A labeled trend over recent vs. older rolling-average token usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenTrend {
    Increasing,
    Stable,
    Decreasing,
}

/// Bounded history of per-turn `(tokens_in, tokens_out)` pairs with
/// rolling totals and trend detection.
#[derive(Debug, Clone, Default)]
pub struct TokenTracker {
    turns: Vec<(u32, u32)>,
    capacity: usize,
}

impl TokenTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: Vec::new(),
            capacity,
        }
    }

    pub fn record(&mut self, tokens_in: u32, tokens_out: u32) {
        self.turns.push((tokens_in, tokens_out));
        if self.turns.len() > self.capacity {
            self.turns.remove(0);
        }
    }

    pub fn total(&self) -> u64 {
        self.turns.iter().map(|(i, o)| (*i + *o) as u64).sum()
    }

    pub fn rolling_average(&self) -> f64 {
        if self.turns.is_empty() {
            return 0.0;
        }
        self.total() as f64 / self.turns.len() as f64
    }

    /// Compares the average of the most recent half of the window to the
    /// average of the older half.
    pub fn trend(&self) -> TokenTrend {
        if self.turns.len() < 4 {
            return TokenTrend::Stable;
        }
        let mid = self.turns.len() / 2;
        let (older, recent) = self.turns.split_at(mid);
        let avg = |slice: &[(u32, u32)]| -> f64 {
            slice.iter().map(|(i, o)| (*i + *o) as f64).sum::<f64>() / slice.len() as f64
        };
        let older_avg = avg(older);
        let recent_avg = avg(recent);
        if older_avg == 0.0 {
            return TokenTrend::Stable;
        }
        let ratio = recent_avg / older_avg;
        if ratio > 1.1 {
            TokenTrend::Increasing
        } else if ratio < 0.9 {
            TokenTrend::Decreasing
        } else {
            TokenTrend::Stable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> Message {
        Message {
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn content_cues_raise_the_score() {
        let total = 10;
        let plain = msg(Role::Assistant, "working on it");
        let signal = msg(Role::Assistant, "STEP COMPLETE: done with the migration");
        assert!(importance_score(&signal, 5, total) > importance_score(&plain, 5, total));
    }

    #[test]
    fn vague_filler_is_penalized() {
        let filler = msg(Role::User, "ok");
        assert!(importance_score(&filler, 1, 5) < 30);
    }

    #[test]
    fn filter_by_importance_always_keeps_first_and_last_three() {
        let history: Vec<Message> = (0..10)
            .map(|i| msg(Role::Assistant, &format!("message {i}")))
            .collect();
        let filtered = filter_by_importance(&history, 1);
        assert_eq!(filtered.first().unwrap().content, "message 0");
        let tail: Vec<&str> = filtered.iter().rev().take(3).map(|m| m.content.as_str()).collect();
        assert!(tail.contains(&"message 9"));
        assert!(tail.contains(&"message 8"));
        assert!(tail.contains(&"message 7"));
    }

    #[test]
    fn filter_by_importance_preserves_original_order() {
        let history: Vec<Message> = (0..6)
            .map(|i| msg(Role::Assistant, &format!("message {i}")))
            .collect();
        let filtered = filter_by_importance(&history, 1_000);
        let indices: Vec<usize> = filtered
            .iter()
            .map(|m| m.content.strip_prefix("message ").unwrap().parse().unwrap())
            .collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }

    #[test]
    fn compress_history_keeps_recent_tail_verbatim() {
        let history = vec![
            msg(Role::Assistant, "STEP COMPLETE: created src/lib.rs"),
            msg(Role::Assistant, "error: build failed"),
            msg(Role::User, "please retry"),
            msg(Role::Assistant, "decided to use a different crate"),
            msg(Role::Assistant, "still working"),
        ];
        let compressed = compress_history(&history, 2);
        assert_eq!(compressed.len(), 3);
        assert_eq!(compressed[0].role, Role::System);
        assert!(compressed[0].content.contains("step 1 completed") || compressed[0].content.contains("touched"));
        assert_eq!(compressed[1].content, "decided to use a different crate");
    }

    #[test]
    fn token_tracker_detects_increasing_and_decreasing_trends() {
        let mut increasing = TokenTracker::new(10);
        for tokens in [100, 100, 400, 400] {
            increasing.record(tokens, 0);
        }
        assert_eq!(increasing.trend(), TokenTrend::Increasing);

        let mut decreasing = TokenTracker::new(10);
        for tokens in [400, 400, 100, 100] {
            decreasing.record(tokens, 0);
        }
        assert_eq!(decreasing.trend(), TokenTrend::Decreasing);
    }
}
