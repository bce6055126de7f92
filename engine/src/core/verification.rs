//! Pure completion-claim verification logic (Verifier Layers 1 and 2).
//!
//! Layer 1 parses a claimed-completion response into an [`Evidence`]
//! record and judges whether it is sufficient to even attempt Layer 2.
//! Layer 2 classifies a caller-supplied list of `(path, metadata)` pairs
//! into verified/empty/missing and decides pass/fail. Neither layer
//! touches the filesystem or a subprocess — the `io` layer does the
//! `fs::metadata` calls and command execution and hands the results here.

use std::sync::OnceLock;

use regex::Regex;

/// Phrases inside the original request/response that mark a task as
/// read-only analysis rather than one that must produce artifacts.
const READ_ONLY_TASK_PHRASES: &[&str] = &[
    "analyze",
    "analyse",
    "investigate",
    "review",
    "research",
    "read-only",
    "understand",
    "explain",
    "summarize",
    "summarise",
    "count the",
];

/// Substrings that disqualify an otherwise path-shaped match.
const FALSE_POSITIVE_PATTERNS: &[&str] = &["http://", "https://", "example.com", "placeholder"];

fn backticked_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([\w./\-]+\.\w+)`").expect("valid regex"))
}

fn relative_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b((?:\./|[\w\-]+/)[\w./\-]*\.\w+)\b").expect("valid regex"))
}

fn verb_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:created|wrote|updated|modified|added)\s+([\w./\-]+\.\w+)").expect("valid regex")
    })
}

fn version_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.\d+(\.\d+)?$").expect("valid regex"))
}

fn drive_letter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z]:\\").expect("valid regex"))
}

fn test_command_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*`?((?:npm|cargo|pytest|go|make)\s+(?:test|check)[^`\n]*)`?\s*$").expect("valid regex")
    })
}

fn build_command_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*`?((?:npm|cargo|make)\s+(?:build|run)[^`\n]*)`?\s*$").expect("valid regex")
    })
}

fn checked_box_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*[-*]\s*\[[xX]\]").expect("valid regex"))
}

fn fenced_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[\w]*\n(.*?)```").expect("valid regex"))
}

const SNIPPET_PREFIX_LEN: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evidence {
    pub files: Vec<String>,
    pub test_commands: Vec<String>,
    pub build_commands: Vec<String>,
    pub checked_boxes: usize,
    pub snippets: Vec<String>,
}

fn is_false_positive(candidate: &str) -> bool {
    FALSE_POSITIVE_PATTERNS.iter().any(|p| candidate.contains(p))
        || version_number_re().is_match(candidate)
        || drive_letter_re().is_match(candidate)
}

/// Parse a claimed-completion response into an [`Evidence`] record.
pub fn parse_evidence(response: &str) -> Evidence {
    let mut files = Vec::new();
    for re in [backticked_path_re(), relative_path_re(), verb_path_re()] {
        for cap in re.captures_iter(response) {
            let path = cap[1].to_string();
            if !is_false_positive(&path) && !files.contains(&path) {
                files.push(path);
            }
        }
    }

    let test_commands = test_command_re()
        .captures_iter(response)
        .map(|c| c[1].trim().to_string())
        .collect();
    let build_commands = build_command_re()
        .captures_iter(response)
        .map(|c| c[1].trim().to_string())
        .collect();
    let checked_boxes = checked_box_re().find_iter(response).count();
    let snippets = fenced_code_re()
        .captures_iter(response)
        .map(|c| c[1].chars().take(SNIPPET_PREFIX_LEN).collect())
        .collect();

    Evidence {
        files,
        test_commands,
        build_commands,
        checked_boxes,
        snippets,
    }
}

/// Whether `original_request` reads as a read-only/analysis task rather
/// than one expected to produce file artifacts.
pub fn is_read_only_task(original_request: &str) -> bool {
    let lowered = original_request.to_ascii_lowercase();
    READ_ONLY_TASK_PHRASES.iter().any(|p| lowered.contains(p))
}

/// Layer 1 sufficiency check: does `evidence` contain enough to attempt
/// Layer 2/3, given whether the underlying task is read-only?
pub fn is_sufficient(evidence: &Evidence, is_read_only: bool) -> bool {
    if is_read_only {
        return !evidence.snippets.is_empty() || evidence.checked_boxes > 0;
    }
    !evidence.files.is_empty()
        && (!evidence.snippets.is_empty() || !evidence.test_commands.is_empty() || !evidence.build_commands.is_empty())
}

/// Layer 2 classification of a single claimed artifact, given its
/// filesystem metadata (`None` if it does not exist).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    Verified,
    Empty,
    Missing,
}

pub fn classify_artifact(metadata: Option<u64>) -> ArtifactStatus {
    match metadata {
        None => ArtifactStatus::Missing,
        Some(0) => ArtifactStatus::Empty,
        Some(_) => ArtifactStatus::Verified,
    }
}

/// Layer 2 pass/fail over a full set of claimed-artifact classifications.
/// Fails when: nothing verified while something was claimed; the missing
/// fraction exceeds half; or more artifacts are empty than verified.
pub fn layer2_passes(statuses: &[ArtifactStatus]) -> bool {
    if statuses.is_empty() {
        return true;
    }
    let verified = statuses.iter().filter(|s| **s == ArtifactStatus::Verified).count();
    let empty = statuses.iter().filter(|s| **s == ArtifactStatus::Empty).count();
    let missing = statuses.iter().filter(|s| **s == ArtifactStatus::Missing).count();

    if verified == 0 {
        return false;
    }
    if missing as f64 / statuses.len() as f64 > 0.5 {
        return false;
    }
    if empty > verified {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backticked_and_verb_phrase_paths() {
        let response = "I created `src/lib.rs` and updated src/main.rs with the fix.";
        let evidence = parse_evidence(response);
        assert!(evidence.files.iter().any(|f| f == "src/lib.rs"));
        assert!(evidence.files.iter().any(|f| f == "src/main.rs"));
    }

    #[test]
    fn rejects_urls_and_version_numbers_as_paths() {
        let response = "See https://example.com/docs.html and bumped to 1.2.3.";
        let evidence = parse_evidence(response);
        assert!(evidence.files.is_empty());
    }

    #[test]
    fn counts_checked_boxes_and_commands() {
        let response = "\
- [x] endpoint implemented
- [x] tests pass
Run `cargo test` to verify.
Run `cargo build` to compile.
";
        let evidence = parse_evidence(response);
        assert_eq!(evidence.checked_boxes, 2);
        assert!(!evidence.test_commands.is_empty());
        assert!(!evidence.build_commands.is_empty());
    }

    #[test]
    fn read_only_task_is_sufficient_with_just_a_snippet_or_checkbox() {
        let evidence = Evidence {
            snippets: vec!["some output".to_string()],
            ..Default::default()
        };
        assert!(is_sufficient(&evidence, true));
        assert!(!is_sufficient(&Evidence::default(), true));
    }

    #[test]
    fn non_read_only_task_requires_a_file_and_supporting_evidence() {
        let files_only = Evidence {
            files: vec!["a.rs".to_string()],
            ..Default::default()
        };
        assert!(!is_sufficient(&files_only, false));

        let file_and_test = Evidence {
            files: vec!["a.rs".to_string()],
            test_commands: vec!["cargo test".to_string()],
            ..Default::default()
        };
        assert!(is_sufficient(&file_and_test, false));
    }

    #[test]
    fn layer2_fails_when_nothing_verified() {
        assert!(!layer2_passes(&[ArtifactStatus::Missing, ArtifactStatus::Empty]));
    }

    #[test]
    fn layer2_fails_when_missing_fraction_exceeds_half() {
        let statuses = vec![ArtifactStatus::Verified, ArtifactStatus::Missing, ArtifactStatus::Missing];
        assert!(!layer2_passes(&statuses));
    }

    #[test]
    fn layer2_fails_when_more_empty_than_verified() {
        let statuses = vec![ArtifactStatus::Verified, ArtifactStatus::Empty, ArtifactStatus::Empty];
        assert!(!layer2_passes(&statuses));
    }

    #[test]
    fn layer2_passes_the_happy_path() {
        let statuses = vec![ArtifactStatus::Verified, ArtifactStatus::Verified];
        assert!(layer2_passes(&statuses));
    }
}
