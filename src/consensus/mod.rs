//! Consensus over peer rankings
//!
//! Two strategies decide the winning draft: Borda-Count sums rank positions
//! across ballots (lower wins), and Chairman-Cut narrows to the Borda top-3
//! before the chairman picks a single label. Ballots are validated on
//! ingest; quorum is ⌈N/2⌉ valid ballots.

pub mod ballot;

pub use ballot::{parse_ranking, parse_winner_label, validate_ballot, BallotError};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Error type for consensus computation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("insufficient valid ballots: got {got}, need {need}")]
    InsufficientBallots { got: usize, need: usize },

    #[error("no labels to rank")]
    NoLabels,
}

impl ConsensusError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientBallots { .. } => "insufficient_ballots",
            Self::NoLabels => "insufficient_ballots",
        }
    }
}

/// Strategy used to fold peer rankings into a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStrategy {
    #[default]
    BordaCount,
    ChairmanCut,
}

impl std::fmt::Display for ConsensusStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BordaCount => write!(f, "borda_count"),
            Self::ChairmanCut => write!(f, "chairman_cut"),
        }
    }
}

/// Which rule broke a first-place tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Lower mean rank position across ballots.
    MeanPosition,
    /// Stable label order.
    BallotOrder,
}

/// A validated peer ranking from one council member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    /// Model id of the voter.
    pub voter: String,
    /// Labels in preference order, best first. Excludes the voter's own
    /// label.
    pub ordering: Vec<char>,
}

/// Outcome of a consensus computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub winner_label: char,
    /// All labels, best first.
    pub ordering: Vec<char>,
    /// Summed rank positions per label (lower is better).
    pub per_label_scores: BTreeMap<char, f64>,
    /// Mean rank position per label across the ballots that ranked it.
    pub per_label_mean_position: BTreeMap<char, f64>,
    /// How many ballots ranked each label.
    pub per_label_votes: BTreeMap<char, u32>,
    /// Set when the first place needed a tie-break.
    pub ties_broken_by: Option<TieBreak>,
}

/// Number of valid ballots (or drafts) required to proceed: ⌈n/2⌉.
pub fn quorum(n: usize) -> usize {
    n.div_ceil(2)
}

/// Compute the Borda-Count outcome over validated ballots.
///
/// Each label's score is the sum of its 1-based rank positions across all
/// ballots that ranked it; the lowest score wins. A label no ballot ranked
/// has no standing and sorts behind every ranked label. First-place ties
/// break by lower mean position, then by stable label order.
pub fn borda_count(ballots: &[Ballot], labels: &[char]) -> Result<ConsensusOutcome, ConsensusError> {
    if labels.is_empty() {
        return Err(ConsensusError::NoLabels);
    }

    let mut scores: BTreeMap<char, f64> = labels.iter().map(|l| (*l, 0.0)).collect();
    let mut votes: BTreeMap<char, u32> = labels.iter().map(|l| (*l, 0)).collect();

    for ballot in ballots {
        for (index, label) in ballot.ordering.iter().enumerate() {
            if let Some(score) = scores.get_mut(label) {
                *score += (index + 1) as f64;
                *votes.get_mut(label).expect("same key set") += 1;
            }
        }
    }

    let mean_positions: BTreeMap<char, f64> = labels
        .iter()
        .map(|l| {
            let count = votes[l];
            let mean = if count == 0 {
                // Unranked labels sort last.
                f64::from(u32::try_from(labels.len()).unwrap_or(u32::MAX)) + 1.0
            } else {
                scores[l] / f64::from(count)
            };
            (*l, mean)
        })
        .collect();

    let mut ordering: Vec<char> = labels.to_vec();
    ordering.sort_by(|a, b| {
        // An unranked label keeps the zero score it started with; it must
        // never beat a label the ballots actually placed.
        (votes[a] == 0)
            .cmp(&(votes[b] == 0))
            .then_with(|| {
                scores[a]
                    .partial_cmp(&scores[b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                mean_positions[a]
                    .partial_cmp(&mean_positions[b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.cmp(b))
    });

    let winner = ordering[0];
    let ties_broken_by = ordering.get(1).and_then(|runner_up| {
        if scores[&winner] != scores[runner_up] {
            None
        } else if mean_positions[&winner] != mean_positions[runner_up] {
            Some(TieBreak::MeanPosition)
        } else {
            Some(TieBreak::BallotOrder)
        }
    });

    Ok(ConsensusOutcome {
        winner_label: winner,
        ordering,
        per_label_scores: scores,
        per_label_mean_position: mean_positions,
        per_label_votes: votes,
        ties_broken_by,
    })
}

/// The top `k` labels of an outcome, best first.
pub fn top_labels(outcome: &ConsensusOutcome, k: usize) -> Vec<char> {
    outcome.ordering.iter().copied().take(k).collect()
}

/// Validate raw ballots, discarding malformed ones, and enforce quorum.
///
/// `expected_for` maps each voter to the label set their ballot must cover
/// (all labels minus their own). Returns the surviving ballots and the count
/// of discarded ones.
pub fn collect_ballots(
    raw: &[(String, Vec<char>)],
    expected_for: impl Fn(&str) -> Vec<char>,
    member_count: usize,
) -> Result<(Vec<Ballot>, u32), ConsensusError> {
    let mut valid = Vec::new();
    let mut discarded = 0u32;

    for (voter, parsed) in raw {
        let expected = expected_for(voter);
        match validate_ballot(parsed, &expected) {
            Ok(ordering) => valid.push(Ballot {
                voter: voter.clone(),
                ordering,
            }),
            Err(_) => discarded += 1,
        }
    }

    let need = quorum(member_count);
    if valid.len() < need {
        return Err(ConsensusError::InsufficientBallots {
            got: valid.len(),
            need,
        });
    }

    Ok((valid, discarded))
}
