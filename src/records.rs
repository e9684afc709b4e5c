//! Record types shared across the pipeline, plus JSONL I/O.
//!
//! Every stream is keyed by `index`, the 0-based position of the scenario in
//! its source dataset. Results are written one JSON object per line.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::prompts::Polarity;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: malformed record: {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RecordError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// =============================================================================
// Inputs
// =============================================================================

/// One scenario to be scored or rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub index: usize,
    pub text: String,
    /// Side context for the excuse-reasonableness variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excuse: Option<String>,
}

impl ScenarioRecord {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            excuse: None,
        }
    }

    pub fn with_excuse(mut self, excuse: impl Into<String>) -> Self {
        self.excuse = Some(excuse.into());
        self
    }
}

/// Binary ground-truth label. Serialised as the integer `0` or `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Label {
    Negative,
    Positive,
}

impl Label {
    pub fn as_u8(self) -> u8 {
        match self {
            Label::Negative => 0,
            Label::Positive => 1,
        }
    }

    pub fn from_prediction(positive: bool) -> Self {
        if positive {
            Label::Positive
        } else {
            Label::Negative
        }
    }
}

impl TryFrom<i64> for Label {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Label::Negative),
            1 => Ok(Label::Positive),
            other => Err(format!("label must be 0 or 1, got {other}")),
        }
    }
}

impl From<Label> for i64 {
    fn from(label: Label) -> Self {
        i64::from(label.as_u8())
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl std::str::FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let value: i64 = match trimmed.parse() {
            Ok(v) => v,
            // Some exports write labels as floats ("1.0").
            Err(_) => match trimmed.parse::<f64>() {
                Ok(f) if f.fract() == 0.0 => f as i64,
                _ => return Err(format!("label must be 0 or 1, got {trimmed:?}")),
            },
        };
        Label::try_from(value)
    }
}

// =============================================================================
// Agent outputs
// =============================================================================

/// Category of a per-item failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Transport,
    EmptyResponse,
    Parse,
    Refused,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::EmptyResponse => "empty_response",
            ErrorKind::Parse => "parse",
            ErrorKind::Refused => "refused",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-item failure, recorded on the result instead of aborting the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of scoring one scenario. `score` is `None` exactly when `error`
/// is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentResult {
    pub index: usize,
    pub score: Option<f64>,
    pub polarity: Polarity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl JudgmentResult {
    pub fn scored(index: usize, score: f64, polarity: Polarity) -> Self {
        Self {
            index,
            score: Some(score),
            polarity,
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(index: usize, polarity: Polarity, error: ItemError) -> Self {
        Self {
            index,
            score: None,
            polarity,
            error: Some(error.message),
            error_kind: Some(error.kind),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.score.is_some()
    }
}

/// Outcome of rewriting one scenario. On failure `rewritten` holds the
/// original text so downstream scoring always has something to score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteResult {
    pub index: usize,
    pub rewritten: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl RewriteResult {
    pub fn rewritten(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            rewritten: text.into(),
            error: None,
            error_kind: None,
        }
    }

    pub fn fallback(index: usize, original: impl Into<String>, error: ItemError) -> Self {
        Self {
            index,
            rewritten: original.into(),
            error: Some(error.message),
            error_kind: Some(error.kind),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.error.is_some()
    }

    /// Feed the rewritten text back in as a scenario for third-person scoring.
    pub fn to_scenario(&self) -> ScenarioRecord {
        ScenarioRecord::new(self.index, self.rewritten.clone())
    }
}

// =============================================================================
// Paired judgments
// =============================================================================

/// First- and third-person scores for one scenario, with its label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairedJudgment {
    pub index: usize,
    pub first_perspective_score: f64,
    pub third_perspective_score: f64,
    pub label: Label,
}

impl PairedJudgment {
    pub fn new(index: usize, first: f64, third: f64, label: Label) -> Self {
        Self {
            index,
            first_perspective_score: first,
            third_perspective_score: third,
            label,
        }
    }
}

// =============================================================================
// JSONL I/O
// =============================================================================

/// Read a JSONL file. Blank lines are skipped; any other line that does not
/// decode is fatal and reported with its 1-based line number.
pub fn read_jsonl<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>, RecordError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| RecordError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| RecordError::io(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).map_err(|e| RecordError::Malformed {
            path: path.to_path_buf(),
            line: i + 1,
            message: e.to_string(),
        })?;
        out.push(value);
    }
    Ok(out)
}

pub fn write_jsonl<T: Serialize>(
    path: impl AsRef<Path>,
    records: &[T],
) -> Result<(), RecordError> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| RecordError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        let line = serde_json::to_string(record)?;
        writeln!(writer, "{line}").map_err(|e| RecordError::io(path, e))?;
    }
    writer.flush().map_err(|e| RecordError::io(path, e))?;
    Ok(())
}

pub fn write_json_pretty<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    value: &T,
) -> Result<(), RecordError> {
    let path = path.as_ref();
    let raw = serde_json::to_string_pretty(value)?;
    std::fs::write(path, format!("{raw}\n")).map_err(|e| RecordError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_accepts_only_zero_and_one() {
        assert_eq!(serde_json::from_str::<Label>("1").unwrap(), Label::Positive);
        assert_eq!(serde_json::from_str::<Label>("0").unwrap(), Label::Negative);
        assert!(serde_json::from_str::<Label>("2").is_err());
        assert_eq!(serde_json::to_string(&Label::Positive).unwrap(), "1");
    }

    #[test]
    fn label_parses_csv_cells() {
        assert_eq!(" 1 ".parse::<Label>().unwrap(), Label::Positive);
        assert_eq!("0.0".parse::<Label>().unwrap(), Label::Negative);
        assert!("yes".parse::<Label>().is_err());
        assert!("0.5".parse::<Label>().is_err());
    }

    #[test]
    fn failed_judgment_keeps_null_score() {
        let r = JudgmentResult::failed(
            3,
            Polarity::Wrongdoing,
            ItemError::new(ErrorKind::Parse, "not a number: \"maybe\""),
        );
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["index"], 3);
        assert!(v["score"].is_null());
        assert_eq!(v["error_kind"], "parse");
        assert_eq!(v["polarity"], "wrongdoing");
    }

    #[test]
    fn successful_judgment_omits_error_fields() {
        let r = JudgmentResult::scored(0, 0.25, Polarity::Reasonableness);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["score"], 0.25);
        assert!(v.get("error").is_none());
        assert!(v.get("error_kind").is_none());
    }

    #[test]
    fn rewrite_fallback_carries_original_text() {
        let r = RewriteResult::fallback(
            1,
            "I lied to my friend.",
            ItemError::new(ErrorKind::Timeout, "timeout after 500s"),
        );
        assert!(r.is_fallback());
        assert_eq!(r.to_scenario().text, "I lied to my friend.");
    }

    #[test]
    fn paired_judgment_uses_long_field_names() {
        let p = PairedJudgment::new(0, 0.7, 0.6, Label::Positive);
        let v = serde_json::to_value(p).unwrap();
        assert_eq!(v["first_perspective_score"], 0.7);
        assert_eq!(v["third_perspective_score"], 0.6);
        assert_eq!(v["label"], 1);
    }
}
