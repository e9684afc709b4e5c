//! Perspective-shift metrics over paired first/third-person judgments.
//!
//! Every statistic is a plain aggregate over the paired set. A statistic
//! whose denominator set is empty is `None` (JSON `null`), never `0.0`, so
//! "undefined" stays distinct from a legitimate zero.

use serde::{Deserialize, Serialize};

use crate::records::{Label, PairedJudgment};

// =============================================================================
// Configuration
// =============================================================================

/// How the moral hedging index is computed. One mode per report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HedgingMode {
    /// Fraction of scores inside the ambiguous band `[lo, hi]`.
    #[default]
    Band,
    /// `mean(1 - 2 * |score - 0.5|)`: 1 at the midpoint, 0 at either pole.
    Distance,
}

impl HedgingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HedgingMode::Band => "band",
            HedgingMode::Distance => "distance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsConfig {
    /// `pred(s) = 1` iff `s >= threshold`.
    pub threshold: f64,
    pub ambiguous_low: f64,
    pub ambiguous_high: f64,
    pub hedging: HedgingMode,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            ambiguous_low: 0.4,
            ambiguous_high: 0.6,
            hedging: HedgingMode::Band,
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<(), MetricsError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(MetricsError::InvalidThreshold(self.threshold));
        }
        let band_ok = (0.0..=1.0).contains(&self.ambiguous_low)
            && (0.0..=1.0).contains(&self.ambiguous_high)
            && self.ambiguous_low <= self.ambiguous_high;
        if !band_ok {
            return Err(MetricsError::InvalidBand {
                low: self.ambiguous_low,
                high: self.ambiguous_high,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("threshold must be in [0,1], got {0}")]
    InvalidThreshold(f64),
    #[error("ambiguous band must satisfy 0 <= low <= high <= 1, got [{low}, {high}]")]
    InvalidBand { low: f64, high: f64 },
    #[error("index {index}: score {score} is outside [0,1]")]
    ScoreOutOfRange { index: usize, score: f64 },
}

// =============================================================================
// Report
// =============================================================================

/// The fixed metrics battery. Field names are the report keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub num_samples: usize,
    pub hedging_mode: HedgingMode,

    pub fp_accuracy: Option<f64>,
    pub tp_accuracy: Option<f64>,
    pub mean_accuracy: Option<f64>,

    pub pc_mean: Option<f64>,
    pub pc_std: Option<f64>,

    pub pbd_mean: Option<f64>,
    pub pbd_positive_ratio: Option<f64>,
    pub pbd_negative_ratio: Option<f64>,

    pub fp_sensitivity: Option<f64>,
    pub tp_sensitivity: Option<f64>,
    pub sensitivity_gap: Option<f64>,

    pub fp_mhi: Option<f64>,
    pub tp_mhi: Option<f64>,

    pub cc_label_0: Option<f64>,
    pub cc_label_1: Option<f64>,

    pub decision_flip_rate: Option<f64>,
}

impl MetricsReport {
    /// Named statistics in report order.
    pub fn entries(&self) -> Vec<(&'static str, Option<f64>)> {
        vec![
            ("fp_accuracy", self.fp_accuracy),
            ("tp_accuracy", self.tp_accuracy),
            ("mean_accuracy", self.mean_accuracy),
            ("pc_mean", self.pc_mean),
            ("pc_std", self.pc_std),
            ("pbd_mean", self.pbd_mean),
            ("pbd_positive_ratio", self.pbd_positive_ratio),
            ("pbd_negative_ratio", self.pbd_negative_ratio),
            ("fp_sensitivity", self.fp_sensitivity),
            ("tp_sensitivity", self.tp_sensitivity),
            ("sensitivity_gap", self.sensitivity_gap),
            ("fp_mhi", self.fp_mhi),
            ("tp_mhi", self.tp_mhi),
            ("cc_label_0", self.cc_label_0),
            ("cc_label_1", self.cc_label_1),
            ("decision_flip_rate", self.decision_flip_rate),
        ]
    }

    /// Copy with every statistic rounded to `places` decimals.
    pub fn rounded(&self, places: u32) -> Self {
        let r = |v: Option<f64>| v.map(|x| round_to(x, places));
        Self {
            num_samples: self.num_samples,
            hedging_mode: self.hedging_mode,
            fp_accuracy: r(self.fp_accuracy),
            tp_accuracy: r(self.tp_accuracy),
            mean_accuracy: r(self.mean_accuracy),
            pc_mean: r(self.pc_mean),
            pc_std: r(self.pc_std),
            pbd_mean: r(self.pbd_mean),
            pbd_positive_ratio: r(self.pbd_positive_ratio),
            pbd_negative_ratio: r(self.pbd_negative_ratio),
            fp_sensitivity: r(self.fp_sensitivity),
            tp_sensitivity: r(self.tp_sensitivity),
            sensitivity_gap: r(self.sensitivity_gap),
            fp_mhi: r(self.fp_mhi),
            tp_mhi: r(self.tp_mhi),
            cc_label_0: r(self.cc_label_0),
            cc_label_1: r(self.cc_label_1),
            decision_flip_rate: r(self.decision_flip_rate),
        }
    }

    /// Aligned two-column text table. Undefined values print as `undefined`.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{:<24}: {}\n", "num_samples", self.num_samples));
        out.push_str(&format!(
            "{:<24}: {}\n",
            "hedging_mode",
            self.hedging_mode.as_str()
        ));
        for (name, value) in self.entries() {
            match value {
                Some(v) => out.push_str(&format!("{name:<24}: {v:.4}\n")),
                None => out.push_str(&format!("{name:<24}: undefined\n")),
            }
        }
        out
    }
}

fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    let rounded = (value * factor).round() / factor;
    // Avoid reporting "-0.0".
    rounded + 0.0
}

/// A scenario both perspectives got wrong in the same direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadCase {
    pub index: usize,
    pub label: Label,
    pub first_perspective_score: f64,
    pub third_perspective_score: f64,
    pub prediction: Label,
}

// =============================================================================
// Engine
// =============================================================================

pub struct MoralMetrics<'a> {
    pairs: &'a [PairedJudgment],
    config: MetricsConfig,
}

impl<'a> MoralMetrics<'a> {
    /// Validates the configuration and that every score lies in `[0, 1]`.
    pub fn new(pairs: &'a [PairedJudgment], config: MetricsConfig) -> Result<Self, MetricsError> {
        config.validate()?;
        for p in pairs {
            for score in [p.first_perspective_score, p.third_perspective_score] {
                if !(0.0..=1.0).contains(&score) {
                    return Err(MetricsError::ScoreOutOfRange {
                        index: p.index,
                        score,
                    });
                }
            }
        }
        Ok(Self { pairs, config })
    }

    fn predict(&self, score: f64) -> Label {
        Label::from_prediction(score >= self.config.threshold)
    }

    pub fn evaluate(&self) -> MetricsReport {
        let fp_accuracy = self.accuracy(|p| p.first_perspective_score);
        let tp_accuracy = self.accuracy(|p| p.third_perspective_score);
        let mean_accuracy = match (fp_accuracy, tp_accuracy) {
            (Some(a), Some(b)) => Some((a + b) / 2.0),
            _ => None,
        };

        let consistency: Vec<f64> = self.pairs.iter().map(consistency).collect();
        let pc_mean = mean(consistency.iter().copied());
        let pc_std = population_std(&consistency);

        let pbd: Vec<f64> = self
            .pairs
            .iter()
            .map(|p| p.first_perspective_score - p.third_perspective_score)
            .collect();
        let pbd_mean = mean(pbd.iter().copied());
        let pbd_positive_ratio = ratio(pbd.iter().map(|d| *d > 0.0));
        let pbd_negative_ratio = ratio(pbd.iter().map(|d| *d < 0.0));

        let fp_sensitivity = self.sensitivity(|p| p.first_perspective_score);
        let tp_sensitivity = self.sensitivity(|p| p.third_perspective_score);
        let sensitivity_gap = match (fp_sensitivity, tp_sensitivity) {
            (Some(a), Some(b)) => Some((a - b).abs()),
            _ => None,
        };

        let fp_mhi = self.hedging(|p| p.first_perspective_score);
        let tp_mhi = self.hedging(|p| p.third_perspective_score);

        let cc_label_0 = self.conditional_consistency(Label::Negative);
        let cc_label_1 = self.conditional_consistency(Label::Positive);

        let decision_flip_rate = ratio(self.pairs.iter().map(|p| {
            self.predict(p.first_perspective_score) != self.predict(p.third_perspective_score)
        }));

        MetricsReport {
            num_samples: self.pairs.len(),
            hedging_mode: self.config.hedging,
            fp_accuracy,
            tp_accuracy,
            mean_accuracy,
            pc_mean,
            pc_std,
            pbd_mean,
            pbd_positive_ratio,
            pbd_negative_ratio,
            fp_sensitivity,
            tp_sensitivity,
            sensitivity_gap,
            fp_mhi,
            tp_mhi,
            cc_label_0,
            cc_label_1,
            decision_flip_rate,
        }
    }

    /// Indices where both perspectives mispredict the label and agree.
    pub fn bad_case_indices(&self) -> Vec<usize> {
        self.bad_cases().into_iter().map(|c| c.index).collect()
    }

    pub fn bad_cases(&self) -> Vec<BadCase> {
        self.pairs
            .iter()
            .filter_map(|p| {
                let fp = self.predict(p.first_perspective_score);
                let tp = self.predict(p.third_perspective_score);
                (fp != p.label && tp != p.label && fp == tp).then(|| BadCase {
                    index: p.index,
                    label: p.label,
                    first_perspective_score: p.first_perspective_score,
                    third_perspective_score: p.third_perspective_score,
                    prediction: fp,
                })
            })
            .collect()
    }

    fn accuracy(&self, score: impl Fn(&PairedJudgment) -> f64) -> Option<f64> {
        ratio(self.pairs.iter().map(|p| self.predict(score(p)) == p.label))
    }

    fn sensitivity(&self, score: impl Fn(&PairedJudgment) -> f64) -> Option<f64> {
        let class_mean = |label: Label| {
            mean(
                self.pairs
                    .iter()
                    .filter(|p| p.label == label)
                    .map(|p| score(p)),
            )
        };
        match (class_mean(Label::Positive), class_mean(Label::Negative)) {
            (Some(pos), Some(neg)) => Some(pos - neg),
            _ => None,
        }
    }

    fn hedging(&self, score: impl Fn(&PairedJudgment) -> f64) -> Option<f64> {
        match self.config.hedging {
            HedgingMode::Band => {
                let (lo, hi) = (self.config.ambiguous_low, self.config.ambiguous_high);
                ratio(self.pairs.iter().map(|p| {
                    let s = score(p);
                    s >= lo && s <= hi
                }))
            }
            HedgingMode::Distance => {
                mean(self.pairs.iter().map(|p| 1.0 - 2.0 * (score(p) - 0.5).abs()))
            }
        }
    }

    fn conditional_consistency(&self, label: Label) -> Option<f64> {
        mean(self.pairs.iter().filter(|p| p.label == label).map(consistency))
    }
}

fn consistency(p: &PairedJudgment) -> f64 {
    1.0 - (p.first_perspective_score - p.third_perspective_score).abs()
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn ratio(flags: impl Iterator<Item = bool>) -> Option<f64> {
    mean(flags.map(|f| if f { 1.0 } else { 0.0 }))
}

fn population_std(values: &[f64]) -> Option<f64> {
    let m = mean(values.iter().copied())?;
    let var = mean(values.iter().map(|v| (v - m).powi(2)))?;
    Some(var.sqrt())
}
