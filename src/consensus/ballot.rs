//! Ballot parsing and validation
//!
//! Model output for rankings is messy. The parser accepts the formats seen
//! in practice (a marked ranking line, `Response X` sequences, numbered
//! lists, bare separator-joined labels) and then validates the result
//! strictly: anything that is not a full permutation of the expected label
//! set is rejected. A missing label is never guessed.

use std::sync::OnceLock;

use regex::Regex;

/// Error type for ballot validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BallotError {
    #[error("no ranking found in ballot text")]
    Empty,

    #[error("ballot is not a permutation of the expected labels (missing {missing:?}, unexpected {extra:?})")]
    NotAPermutation { missing: Vec<char>, extra: Vec<char> },
}

fn response_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Response\s+([A-Z])\b").expect("valid regex"))
}

fn numbered_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*\d+[.)]\s*(?:Response\s+)?([A-Z])\b").expect("valid regex"))
}

fn bare_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Z])\b").expect("valid regex"))
}

/// Extract a ranking from free-form ballot text.
///
/// Returns labels in stated order, first mention wins on repeats. The
/// result is unvalidated; callers must pass it through [`validate_ballot`].
pub fn parse_ranking(text: &str) -> Vec<char> {
    let section = ranking_section(text);

    for candidates in [
        extract(response_label_re(), section),
        extract(numbered_label_re(), section),
        extract(response_label_re(), text),
        extract(bare_label_re(), section),
    ] {
        if !candidates.is_empty() {
            return candidates;
        }
    }

    Vec::new()
}

/// Narrow to the text after the last ranking marker, when one exists.
fn ranking_section(text: &str) -> &str {
    for marker in ["FINAL RANKING:", "Final Ranking:", "Ranking:"] {
        if let Some(pos) = text.rfind(marker) {
            return &text[pos + marker.len()..];
        }
    }
    text
}

fn extract(re: &Regex, text: &str) -> Vec<char> {
    let mut seen = Vec::new();
    for capture in re.captures_iter(text) {
        let label = capture[1].chars().next().expect("single capture char");
        if !seen.contains(&label) {
            seen.push(label);
        }
    }
    seen
}

/// Validate a parsed ranking against the expected label set.
///
/// The ballot must contain exactly the expected labels, no more and no fewer.
pub fn validate_ballot(parsed: &[char], expected: &[char]) -> Result<Vec<char>, BallotError> {
    if parsed.is_empty() {
        return Err(BallotError::Empty);
    }

    let missing: Vec<char> = expected
        .iter()
        .copied()
        .filter(|l| !parsed.contains(l))
        .collect();
    let extra: Vec<char> = parsed
        .iter()
        .copied()
        .filter(|l| !expected.contains(l))
        .collect();

    if !missing.is_empty() || !extra.is_empty() {
        return Err(BallotError::NotAPermutation { missing, extra });
    }

    Ok(parsed.to_vec())
}

/// Extract the single winner label from a chairman's reply.
///
/// The reply is accepted as label-only; surrounding prose is ignored. The
/// first mentioned candidate label wins. Returns `None` when no candidate
/// label appears.
pub fn parse_winner_label(text: &str, candidates: &[char]) -> Option<char> {
    for capture in response_label_re().captures_iter(text) {
        let label = capture[1].chars().next()?;
        if candidates.contains(&label) {
            return Some(label);
        }
    }
    for capture in bare_label_re().captures_iter(text) {
        let label = capture[1].chars().next()?;
        if candidates.contains(&label) {
            return Some(label);
        }
    }
    None
}
