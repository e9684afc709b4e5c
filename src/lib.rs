#![forbid(unsafe_code)]

//! # perspective-harness
//!
//! Measures how the grammatical perspective of a narrative shifts a language
//! model's moral judgment.
//!
//! First-person scenarios ("I did X") are rewritten into the third person
//! ("Nick did X"). Both versions are scored by the model on a fixed `[0, 1]`
//! scale, the two score streams are joined with ground-truth labels, and a
//! fixed battery of statistics (accuracy, perspective consistency, bias
//! direction, moral sensitivity, hedging) is computed over the pairs.
//!
//! Backend calls go through [`gateway::ChatGateway`]; every agent yields
//! exactly one result per input even when individual requests fail.

pub mod agent;
pub mod dataset;
pub mod experiment;
pub mod gateway;
pub mod merge;
pub mod metrics;
pub mod pacing;
pub mod prompts;
pub mod records;
pub mod telemetry;
pub mod trace;

pub use agent::{AgentConfig, AgentError, RewriteAgent, ScoringAgent};
pub use dataset::{load_csv, Dataset, DatasetError, DatasetOptions};
pub use experiment::{Experiment, ExperimentConfig, ExperimentError, ExperimentOutput};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use merge::{merge_perspectives, MergeError, MergeOutcome};
pub use metrics::{HedgingMode, MetricsConfig, MetricsReport, MoralMetrics};
pub use pacing::{FixedInterval, RateLimiter, TokenBucket, Unthrottled};
pub use prompts::{Perspective, Polarity, PromptTemplate, ScoringVariant};
pub use records::{
    ErrorKind, JudgmentResult, Label, PairedJudgment, RewriteResult, ScenarioRecord,
};
pub use trace::{CallTrace, JsonlTraceSink, TraceError, TraceSink, TraceWorker};
