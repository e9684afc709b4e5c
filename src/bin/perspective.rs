#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::Level;

use perspective_harness::agent::{AgentConfig, RewriteAgent, ScoringAgent, DEFAULT_MODEL};
use perspective_harness::dataset::{load_csv, DatasetOptions};
use perspective_harness::experiment::{Experiment, ExperimentConfig};
use perspective_harness::gateway::openai::OpenAiCompatAdapter;
use perspective_harness::gateway::{
    BreakerConfig, ChatGateway, GatewayConfig, ProviderGateway, TracingUsageSink,
};
use perspective_harness::merge::merge_perspectives;
use perspective_harness::metrics::{HedgingMode, MetricsConfig, MoralMetrics};
use perspective_harness::pacing::{FixedInterval, RateLimiter, Unthrottled};
use perspective_harness::prompts::ScoringVariant;
use perspective_harness::records::{
    read_jsonl, write_json_pretty, write_jsonl, JudgmentResult, PairedJudgment, RewriteResult,
    ScenarioRecord,
};
use perspective_harness::telemetry::init_tracing;
use perspective_harness::trace::{JsonlTraceSink, TraceSink, TraceWorker};

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(
    name = "perspective",
    version,
    about = "Measure how narrative perspective shifts LLM moral judgments"
)]
struct Cli {
    /// Emit logs as newline-delimited JSON
    #[arg(long, global = true)]
    log_json: bool,
    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite first-person scenarios into the third person
    Rewrite {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[command(flatten)]
        dataset: DatasetArgs,
        #[command(flatten)]
        backend: BackendArgs,
    },
    /// Score scenarios from a CSV dataset or a rewrite JSONL file
    Score {
        /// CSV dataset; with --rewrites, only its excuse column is used
        #[arg(long)]
        input: Option<PathBuf>,
        /// Output of `rewrite`
        #[arg(long)]
        rewrites: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "narrator-first-person")]
        variant: VariantArg,
        #[arg(long)]
        out: PathBuf,
        #[command(flatten)]
        dataset: DatasetArgs,
        #[command(flatten)]
        backend: BackendArgs,
    },
    /// Join first- and third-person scores with dataset labels
    Merge {
        #[arg(long)]
        first: PathBuf,
        #[arg(long)]
        third: PathBuf,
        /// CSV dataset holding the labels
        #[arg(long)]
        labels: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Write the indices left unpaired, with reasons, as JSON
        #[arg(long)]
        skipped: Option<PathBuf>,
        #[command(flatten)]
        dataset: DatasetArgs,
    },
    /// Compute the metrics battery over merged judgments (no network)
    Metrics {
        #[arg(long)]
        input: PathBuf,
        /// Write the rounded report as JSON
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        bad_cases: Option<PathBuf>,
        #[command(flatten)]
        metrics: MetricsArgs,
    },
    /// Full pipeline: rewrite, score both perspectives, merge, metrics
    Run {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long, value_enum, default_value = "narrator-first-person")]
        first_variant: VariantArg,
        #[arg(long, value_enum, default_value = "third-person")]
        third_variant: VariantArg,
        /// Per-request timeout for rewrites in seconds [default: 500]
        #[arg(long)]
        rewrite_timeout_secs: Option<u64>,
        #[command(flatten)]
        dataset: DatasetArgs,
        #[command(flatten)]
        backend: BackendArgs,
        #[command(flatten)]
        metrics: MetricsArgs,
    },
}

#[derive(Args)]
struct DatasetArgs {
    #[arg(long, default_value = "input")]
    text_column: String,
    #[arg(long, default_value = "label")]
    label_column: String,
    #[arg(long)]
    excuse_column: Option<String>,
    /// Use only the first N rows
    #[arg(long)]
    limit: Option<usize>,
}

impl DatasetArgs {
    fn options(&self, with_labels: bool) -> DatasetOptions {
        DatasetOptions {
            text_column: self.text_column.clone(),
            label_column: with_labels.then(|| self.label_column.clone()),
            excuse_column: self.excuse_column.clone(),
            limit: self.limit,
        }
    }
}

#[derive(Args)]
struct BackendArgs {
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(long, default_value_t = 0.0)]
    temperature: f32,
    /// Per-request timeout in seconds [default: 60 for scoring, 500 for rewriting]
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Minimum spacing between requests in milliseconds (0 disables pacing)
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
    /// Retries per request after the first attempt
    #[arg(long, default_value_t = 2)]
    max_retries: u32,
    /// Consecutive failures that open the circuit breaker (0 disables it)
    #[arg(long, default_value_t = 10)]
    breaker_threshold: u32,
    #[arg(long, default_value_t = 30)]
    breaker_cooldown_secs: u64,
    /// Write one JSONL trace line per backend call
    #[arg(long)]
    trace: Option<PathBuf>,
}

impl BackendArgs {
    fn gateway(&self) -> CliResult<Arc<dyn ChatGateway>> {
        let provider = OpenAiCompatAdapter::from_env()?;
        let config = GatewayConfig {
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_secs(1),
            breaker: (self.breaker_threshold > 0).then(|| BreakerConfig {
                threshold: self.breaker_threshold,
                cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            }),
        };
        Ok(Arc::new(ProviderGateway::with_config(
            provider,
            Arc::new(TracingUsageSink),
            config,
        )))
    }

    fn limiter(&self) -> Arc<dyn RateLimiter> {
        if self.interval_ms == 0 {
            Arc::new(Unthrottled)
        } else {
            Arc::new(FixedInterval::new(Duration::from_millis(self.interval_ms)))
        }
    }

    fn agent_config(&self, base: AgentConfig) -> AgentConfig {
        base.with_temperature(self.temperature)
            .with_concurrency(self.concurrency)
    }

    fn scoring_config(&self) -> AgentConfig {
        let config = self.agent_config(AgentConfig::scoring(&self.model));
        match self.timeout_secs {
            Some(secs) => config.with_timeout(Duration::from_secs(secs)),
            None => config,
        }
    }

    fn rewrite_config(&self, timeout_secs: Option<u64>) -> AgentConfig {
        let config = self.agent_config(AgentConfig::rewrite(&self.model));
        match timeout_secs {
            Some(secs) => config.with_timeout(Duration::from_secs(secs)),
            None => config,
        }
    }
}

#[derive(Args)]
struct MetricsArgs {
    #[arg(long, default_value_t = 0.5)]
    threshold: f64,
    #[arg(long, default_value_t = 0.4)]
    ambiguous_low: f64,
    #[arg(long, default_value_t = 0.6)]
    ambiguous_high: f64,
    #[arg(long, value_enum, default_value = "band")]
    hedging: HedgingArg,
}

impl MetricsArgs {
    fn config(&self) -> MetricsConfig {
        MetricsConfig {
            threshold: self.threshold,
            ambiguous_low: self.ambiguous_low,
            ambiguous_high: self.ambiguous_high,
            hedging: self.hedging.into(),
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum VariantArg {
    NarratorFirstPerson,
    DirectFirstPerson,
    ThirdPerson,
    ExcuseReasonableness,
}

impl From<VariantArg> for ScoringVariant {
    fn from(v: VariantArg) -> Self {
        match v {
            VariantArg::NarratorFirstPerson => ScoringVariant::NarratorFirstPerson,
            VariantArg::DirectFirstPerson => ScoringVariant::DirectFirstPerson,
            VariantArg::ThirdPerson => ScoringVariant::ThirdPerson,
            VariantArg::ExcuseReasonableness => ScoringVariant::ExcuseReasonableness,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum HedgingArg {
    Band,
    Distance,
}

impl From<HedgingArg> for HedgingMode {
    fn from(h: HedgingArg) -> Self {
        match h {
            HedgingArg::Band => HedgingMode::Band,
            HedgingArg::Distance => HedgingMode::Distance,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_json, cli.log_level);

    match cli.command {
        Commands::Rewrite {
            input,
            out,
            dataset,
            backend,
        } => {
            let ds = load_csv(&input, &dataset.options(false))?;
            let config = backend.rewrite_config(backend.timeout_secs);
            let (trace, worker) = open_trace(backend.trace.as_deref())?;

            let results = {
                let mut agent = RewriteAgent::new(backend.gateway()?, backend.limiter(), config);
                if let Some(trace) = trace {
                    agent = agent.with_trace(trace);
                }
                agent.rewrite_all(&ds.scenarios).await?
            };
            write_jsonl(&out, &results)?;
            close_trace(worker)?;

            let fallbacks = results.iter().filter(|r| r.is_fallback()).count();
            println!(
                "rewrote {} scenarios ({} kept original text)",
                results.len(),
                fallbacks
            );
        }
        Commands::Score {
            input,
            rewrites,
            variant,
            out,
            dataset,
            backend,
        } => {
            let variant = ScoringVariant::from(variant);
            let scenarios = score_inputs(input.as_deref(), rewrites.as_deref(), &dataset)?;
            let (trace, worker) = open_trace(backend.trace.as_deref())?;

            let results = {
                let mut agent = ScoringAgent::new(
                    backend.gateway()?,
                    backend.limiter(),
                    variant,
                    backend.scoring_config(),
                );
                if let Some(trace) = trace {
                    agent = agent.with_trace(trace);
                }
                agent.score_all(&scenarios).await?
            };
            write_jsonl(&out, &results)?;
            close_trace(worker)?;

            let failed = results.iter().filter(|r| !r.is_ok()).count();
            println!(
                "scored {} scenarios with {} ({} failed; 1.0 = {})",
                results.len(),
                variant.slug(),
                failed,
                variant.polarity().high_pole()
            );
        }
        Commands::Merge {
            first,
            third,
            labels,
            out,
            skipped,
            dataset,
        } => {
            let first: Vec<JudgmentResult> = read_jsonl(&first)?;
            let third: Vec<JudgmentResult> = read_jsonl(&third)?;
            let ds = load_csv(&labels, &dataset.options(true))?;

            let outcome = merge_perspectives(&first, &third, &ds.labels)?;
            write_jsonl(&out, &outcome.pairs)?;
            if let Some(path) = skipped {
                write_json_pretty(&path, &outcome.skipped)?;
            }
            println!(
                "paired {} scenarios (skipped {})",
                outcome.pairs.len(),
                outcome.skipped.len()
            );
        }
        Commands::Metrics {
            input,
            out,
            bad_cases,
            metrics,
        } => {
            let pairs: Vec<PairedJudgment> = read_jsonl(&input)?;
            if pairs.is_empty() {
                return Err(format!("{}: no paired judgments", input.display()).into());
            }
            let engine = MoralMetrics::new(&pairs, metrics.config())?;
            let report = engine.evaluate().rounded(4);

            print!("{}", report.render_table());
            if let Some(path) = out {
                write_json_pretty(&path, &report)?;
            }
            if let Some(path) = bad_cases {
                write_json_pretty(&path, &engine.bad_cases())?;
            }
        }
        Commands::Run {
            input,
            out_dir,
            first_variant,
            third_variant,
            rewrite_timeout_secs,
            dataset,
            backend,
            metrics,
        } => {
            let ds = load_csv(&input, &dataset.options(true))?;
            let config = ExperimentConfig {
                first_variant: first_variant.into(),
                third_variant: third_variant.into(),
                rewrite: backend.rewrite_config(rewrite_timeout_secs),
                scoring: backend.scoring_config(),
                metrics: metrics.config(),
            };
            let (trace, worker) = open_trace(backend.trace.as_deref())?;

            let output = {
                let mut experiment = Experiment::new(backend.gateway()?, backend.limiter(), config);
                if let Some(trace) = trace {
                    experiment = experiment.with_trace(trace);
                }
                experiment.run(&ds).await?
            };
            output.write_to(&out_dir)?;
            close_trace(worker)?;

            print!("{}", output.report.rounded(4).render_table());
            println!("outputs written to {}", out_dir.display());
        }
    }

    Ok(())
}

/// Scenarios for `score`: dataset rows, or rewrites with excuses joined in
/// from the dataset by index.
fn score_inputs(
    input: Option<&Path>,
    rewrites: Option<&Path>,
    dataset: &DatasetArgs,
) -> CliResult<Vec<ScenarioRecord>> {
    match (input, rewrites) {
        (Some(csv), None) => Ok(load_csv(csv, &dataset.options(false))?.scenarios),
        (csv, Some(path)) => {
            let rewrites: Vec<RewriteResult> = read_jsonl(path)?;
            let mut scenarios: Vec<ScenarioRecord> =
                rewrites.iter().map(RewriteResult::to_scenario).collect();
            if let Some(csv) = csv {
                let ds = load_csv(csv, &dataset.options(false))?;
                for scenario in &mut scenarios {
                    scenario.excuse = ds
                        .scenarios
                        .iter()
                        .find(|s| s.index == scenario.index)
                        .and_then(|s| s.excuse.clone());
                }
            }
            if scenarios.is_empty() {
                return Err(format!("{}: no rewrites", path.display()).into());
            }
            Ok(scenarios)
        }
        (None, None) => Err("score requires --input and/or --rewrites".into()),
    }
}

fn open_trace(
    path: Option<&Path>,
) -> CliResult<(Option<Arc<dyn TraceSink>>, Option<TraceWorker>)> {
    match path {
        Some(path) => {
            let (sink, worker) = JsonlTraceSink::new(path)?;
            Ok((Some(Arc::new(sink)), Some(worker)))
        }
        None => Ok((None, None)),
    }
}

/// Every sink handle must be dropped before this is called.
fn close_trace(worker: Option<TraceWorker>) -> CliResult<()> {
    if let Some(worker) = worker {
        worker.join()?;
    }
    Ok(())
}
