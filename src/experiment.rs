//! End-to-end perspective-shift experiment.
//!
//! rewrite (first person -> third person) -> score both versions -> merge
//! with labels -> metrics. Each stage's output is kept so a run can be
//! written out and inspected stage by stage.

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::agent::{AgentConfig, AgentError, RewriteAgent, ScoringAgent, DEFAULT_MODEL};
use crate::dataset::Dataset;
use crate::gateway::ChatGateway;
use crate::merge::{merge_perspectives, MergeError, MergeOutcome};
use crate::metrics::{BadCase, MetricsConfig, MetricsError, MetricsReport, MoralMetrics};
use crate::pacing::RateLimiter;
use crate::prompts::{Polarity, ScoringVariant};
use crate::records::{
    write_json_pretty, write_jsonl, JudgmentResult, RecordError, RewriteResult, ScenarioRecord,
};
use crate::trace::TraceSink;

pub const REWRITES_FILE: &str = "rewrites.jsonl";
pub const FIRST_SCORES_FILE: &str = "first_scores.jsonl";
pub const THIRD_SCORES_FILE: &str = "third_scores.jsonl";
pub const MERGED_FILE: &str = "merged.jsonl";
pub const SKIPPED_FILE: &str = "skipped.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const BAD_CASES_FILE: &str = "bad_cases.json";

/// Decimal places in written reports.
pub const REPORT_PRECISION: u32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("dataset has no labels; a label column is required to compute metrics")]
    MissingLabels,
    #[error("first-person variant judges {first:?} but third-person variant judges {third:?}")]
    PolarityMismatch { first: Polarity, third: Polarity },
    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub first_variant: ScoringVariant,
    pub third_variant: ScoringVariant,
    pub rewrite: AgentConfig,
    pub scoring: AgentConfig,
    pub metrics: MetricsConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            first_variant: ScoringVariant::NarratorFirstPerson,
            third_variant: ScoringVariant::ThirdPerson,
            rewrite: AgentConfig::rewrite(DEFAULT_MODEL),
            scoring: AgentConfig::scoring(DEFAULT_MODEL),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentOutput {
    pub run_id: Uuid,
    pub rewrites: Vec<RewriteResult>,
    pub first_scores: Vec<JudgmentResult>,
    pub third_scores: Vec<JudgmentResult>,
    pub merge: MergeOutcome,
    /// Unrounded; [`ExperimentOutput::write_to`] rounds on the way out.
    pub report: MetricsReport,
    pub bad_cases: Vec<BadCase>,
}

impl ExperimentOutput {
    pub fn write_to(&self, dir: impl AsRef<Path>) -> Result<(), ExperimentError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| ExperimentError::OutputDir {
            path: dir.display().to_string(),
            source,
        })?;

        write_jsonl(dir.join(REWRITES_FILE), &self.rewrites)?;
        write_jsonl(dir.join(FIRST_SCORES_FILE), &self.first_scores)?;
        write_jsonl(dir.join(THIRD_SCORES_FILE), &self.third_scores)?;
        write_jsonl(dir.join(MERGED_FILE), &self.merge.pairs)?;
        write_json_pretty(dir.join(SKIPPED_FILE), &self.merge.skipped)?;
        write_json_pretty(dir.join(METRICS_FILE), &self.report.rounded(REPORT_PRECISION))?;
        write_json_pretty(dir.join(BAD_CASES_FILE), &self.bad_cases)?;

        info!(dir = %dir.display(), "experiment outputs written");
        Ok(())
    }
}

pub struct Experiment {
    gateway: Arc<dyn ChatGateway>,
    limiter: Arc<dyn RateLimiter>,
    config: ExperimentConfig,
    run_id: Uuid,
    trace: Option<Arc<dyn TraceSink>>,
}

impl Experiment {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        limiter: Arc<dyn RateLimiter>,
        config: ExperimentConfig,
    ) -> Self {
        Self {
            gateway,
            limiter,
            config,
            run_id: Uuid::new_v4(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn run(&self, dataset: &Dataset) -> Result<ExperimentOutput, ExperimentError> {
        let first = self.config.first_variant.polarity();
        let third = self.config.third_variant.polarity();
        if first != third {
            return Err(ExperimentError::PolarityMismatch { first, third });
        }
        if dataset.labels.is_empty() {
            return Err(ExperimentError::MissingLabels);
        }

        info!(
            run_id = %self.run_id,
            scenarios = dataset.len(),
            first_variant = self.config.first_variant.slug(),
            third_variant = self.config.third_variant.slug(),
            "experiment started"
        );

        let rewrites = self.rewrite_agent().rewrite_all(&dataset.scenarios).await?;

        let first_scores = self
            .scoring_agent(self.config.first_variant)
            .score_all(&dataset.scenarios)
            .await?;

        // Rewritten texts lose the excuse column; carry it over by index.
        let third_inputs: Vec<ScenarioRecord> = rewrites
            .iter()
            .zip(&dataset.scenarios)
            .map(|(rewrite, source)| {
                let mut scenario = rewrite.to_scenario();
                scenario.excuse = source.excuse.clone();
                scenario
            })
            .collect();
        let third_scores = self
            .scoring_agent(self.config.third_variant)
            .score_all(&third_inputs)
            .await?;

        let merge = merge_perspectives(&first_scores, &third_scores, &dataset.labels)?;
        let engine = MoralMetrics::new(&merge.pairs, self.config.metrics)?;
        let report = engine.evaluate();
        let bad_cases = engine.bad_cases();

        info!(
            run_id = %self.run_id,
            paired = merge.pairs.len(),
            skipped = merge.skipped.len(),
            bad_cases = bad_cases.len(),
            "experiment finished"
        );

        Ok(ExperimentOutput {
            run_id: self.run_id,
            rewrites,
            first_scores,
            third_scores,
            merge,
            report,
            bad_cases,
        })
    }

    fn rewrite_agent(&self) -> RewriteAgent {
        let agent = RewriteAgent::new(
            self.gateway.clone(),
            self.limiter.clone(),
            self.config.rewrite.clone(),
        )
        .with_run_id(self.run_id);
        match &self.trace {
            Some(trace) => agent.with_trace(trace.clone()),
            None => agent,
        }
    }

    fn scoring_agent(&self, variant: ScoringVariant) -> ScoringAgent {
        let agent = ScoringAgent::new(
            self.gateway.clone(),
            self.limiter.clone(),
            variant,
            self.config.scoring.clone(),
        )
        .with_run_id(self.run_id);
        match &self.trace {
            Some(trace) => agent.with_trace(trace.clone()),
            None => agent,
        }
    }
}
