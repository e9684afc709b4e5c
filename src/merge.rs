//! Join first- and third-person score streams with ground-truth labels.
//!
//! The join key is `index`. An index is paired only when both streams hold a
//! score for it and a label exists; everything else is skipped, logged, and
//! reported back in [`MergeOutcome::skipped`]. Missing scores are never
//! filled in.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::prompts::Polarity;
use crate::records::{JudgmentResult, Label, PairedJudgment};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("duplicate index {index} in {stream} stream")]
    DuplicateIndex { stream: Stream, index: usize },
    #[error("{stream} stream mixes polarities ({expected:?} and {found:?} at index {index})")]
    MixedPolarity {
        stream: Stream,
        index: usize,
        expected: Polarity,
        found: Polarity,
    },
    #[error("polarity mismatch: first-person scores are {first:?}, third-person scores are {third:?}")]
    PolarityMismatch { first: Polarity, third: Polarity },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    First,
    Third,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::First => f.write_str("first-person"),
            Stream::Third => f.write_str("third-person"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingFirst,
    MissingThird,
    FailedFirst,
    FailedThird,
    MissingLabel,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingFirst => "no first-person result",
            SkipReason::MissingThird => "no third-person result",
            SkipReason::FailedFirst => "first-person scoring failed",
            SkipReason::FailedThird => "third-person scoring failed",
            SkipReason::MissingLabel => "no label",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedPair {
    pub index: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Paired judgments in ascending index order.
    pub pairs: Vec<PairedJudgment>,
    pub skipped: Vec<SkippedPair>,
}

impl MergeOutcome {
    pub fn skipped_indices(&self) -> Vec<usize> {
        self.skipped.iter().map(|s| s.index).collect()
    }
}

/// Pair the two streams on `index` and attach labels.
pub fn merge_perspectives(
    first: &[JudgmentResult],
    third: &[JudgmentResult],
    labels: &BTreeMap<usize, Label>,
) -> Result<MergeOutcome, MergeError> {
    let first_polarity = stream_polarity(Stream::First, first)?;
    let third_polarity = stream_polarity(Stream::Third, third)?;
    if let (Some(f), Some(t)) = (first_polarity, third_polarity) {
        if f != t {
            return Err(MergeError::PolarityMismatch { first: f, third: t });
        }
    }

    let first_by_index = index_stream(Stream::First, first)?;
    let third_by_index = index_stream(Stream::Third, third)?;

    let all_indices: BTreeSet<usize> = first_by_index
        .keys()
        .chain(third_by_index.keys())
        .chain(labels.keys())
        .copied()
        .collect();

    let mut outcome = MergeOutcome::default();
    for index in all_indices {
        let pair = pair_at(
            index,
            first_by_index.get(&index).copied(),
            third_by_index.get(&index).copied(),
            labels.get(&index).copied(),
        );
        match pair {
            Ok(p) => outcome.pairs.push(p),
            Err(reason) => {
                warn!(index, reason = reason.as_str(), "skipping unpaired index");
                outcome.skipped.push(SkippedPair { index, reason });
            }
        }
    }

    info!(
        paired = outcome.pairs.len(),
        skipped = outcome.skipped.len(),
        "merge finished"
    );
    Ok(outcome)
}

fn pair_at(
    index: usize,
    first: Option<&JudgmentResult>,
    third: Option<&JudgmentResult>,
    label: Option<Label>,
) -> Result<PairedJudgment, SkipReason> {
    let first = first.ok_or(SkipReason::MissingFirst)?;
    let third = third.ok_or(SkipReason::MissingThird)?;
    let f = first.score.ok_or(SkipReason::FailedFirst)?;
    let t = third.score.ok_or(SkipReason::FailedThird)?;
    let label = label.ok_or(SkipReason::MissingLabel)?;
    Ok(PairedJudgment::new(index, f, t, label))
}

fn stream_polarity(
    stream: Stream,
    results: &[JudgmentResult],
) -> Result<Option<Polarity>, MergeError> {
    let Some(head) = results.first() else {
        return Ok(None);
    };
    for r in results {
        if r.polarity != head.polarity {
            return Err(MergeError::MixedPolarity {
                stream,
                index: r.index,
                expected: head.polarity,
                found: r.polarity,
            });
        }
    }
    Ok(Some(head.polarity))
}

fn index_stream(
    stream: Stream,
    results: &[JudgmentResult],
) -> Result<HashMap<usize, &JudgmentResult>, MergeError> {
    let mut by_index = HashMap::with_capacity(results.len());
    for r in results {
        if by_index.insert(r.index, r).is_some() {
            return Err(MergeError::DuplicateIndex {
                stream,
                index: r.index,
            });
        }
    }
    Ok(by_index)
}
