//! Scalar moral scoring of scenarios.
//!
//! Implements the contract between free-text model replies and typed
//! [`JudgmentResult`] records: a reply must be a single number in `[0, 1]`,
//! anything else is recorded as a failure on that item.

use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::{Attribution, ChatGateway, ChatRequest, ChatResponse};
use crate::pacing::RateLimiter;
use crate::prompts::ScoringVariant;
use crate::records::{ErrorKind, ItemError, JudgmentResult, ScenarioRecord};
use crate::trace::{now_epoch_ms, text_hash, CallTrace, TraceSink};

use super::{
    emit_trace, provider_item_error, run_ordered, validate_items, AgentConfig, AgentError,
};

// =============================================================================
// Reply parsing
// =============================================================================

/// Optional sign, digits, optional fractional part. No exponent, no words.
static SCORE_GRAMMAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)$").expect("Invalid score grammar regex")
});

/// Longest reply excerpt kept in an error message.
const EXCERPT_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoreParseError {
    #[error("empty response")]
    Empty,
    #[error("not a number: {0:?}")]
    NotANumber(String),
    #[error("score out of range [0,1]: {0}")]
    OutOfRange(f64),
}

impl ScoreParseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScoreParseError::Empty => ErrorKind::EmptyResponse,
            ScoreParseError::NotANumber(_) | ScoreParseError::OutOfRange(_) => ErrorKind::Parse,
        }
    }
}

/// Parse a model reply into a score in `[0, 1]`.
///
/// Surrounding whitespace is ignored. The reply must otherwise match the
/// numeric grammar exactly: `"0.7"`, `".5"`, `"1."` and `"+0"` parse, while
/// `"0.7 because..."`, `"7e-1"` and `"NaN"` do not.
pub fn parse_score(raw: &str) -> Result<f64, ScoreParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ScoreParseError::Empty);
    }
    if !SCORE_GRAMMAR.is_match(trimmed) {
        return Err(ScoreParseError::NotANumber(excerpt(trimmed)));
    }
    let value: f64 = trimmed
        .parse()
        .map_err(|_| ScoreParseError::NotANumber(excerpt(trimmed)))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ScoreParseError::OutOfRange(value));
    }
    // "-0" is in range; normalise the sign.
    Ok(value + 0.0)
}

fn excerpt(s: &str) -> String {
    if s.chars().count() <= EXCERPT_CHARS {
        s.to_string()
    } else {
        let head: String = s.chars().take(EXCERPT_CHARS).collect();
        format!("{head}...")
    }
}

// =============================================================================
// Agent
// =============================================================================

/// Scores scenarios with one prompt variant.
pub struct ScoringAgent {
    gateway: Arc<dyn ChatGateway>,
    limiter: Arc<dyn RateLimiter>,
    variant: ScoringVariant,
    config: AgentConfig,
    run_id: Uuid,
    trace: Option<Arc<dyn TraceSink>>,
}

impl ScoringAgent {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        limiter: Arc<dyn RateLimiter>,
        variant: ScoringVariant,
        config: AgentConfig,
    ) -> Self {
        Self {
            gateway,
            limiter,
            variant,
            config,
            run_id: Uuid::new_v4(),
            trace: None,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Score every item. The output has one result per input, in input order.
    ///
    /// Returns an error only for input problems found before any request is
    /// made: duplicate indices, or a missing excuse when the
    /// variant needs one.
    pub async fn score_all(
        &self,
        items: &[ScenarioRecord],
    ) -> Result<Vec<JudgmentResult>, AgentError> {
        validate_items(items)?;
        if self.variant.requires_excuse() {
            if let Some(item) = items.iter().find(|item| {
                item.excuse
                    .as_deref()
                    .map(|e| e.trim().is_empty())
                    .unwrap_or(true)
            }) {
                return Err(AgentError::MissingExcuse {
                    index: item.index,
                    variant: self.variant.slug(),
                });
            }
        }

        info!(
            variant = self.variant.slug(),
            items = items.len(),
            concurrency = self.config.concurrency,
            "scoring started"
        );

        let results =
            run_ordered(items, self.config.concurrency, |item| self.score_one(item)).await;

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        info!(
            variant = self.variant.slug(),
            scored = results.len() - failed,
            failed,
            "scoring finished"
        );
        Ok(results)
    }

    async fn score_one(&self, item: &ScenarioRecord) -> JudgmentResult {
        let polarity = self.variant.polarity();
        let template = self.variant.template();
        let prompt = template.render(&item.text, item.excuse.as_deref());

        let mut req = ChatRequest::new(
            self.config.model.clone(),
            prompt.to_messages(),
            Attribution::new("agent::score")
                .with_run(self.run_id)
                .with_item(item.index),
        )
        .temperature(self.config.temperature)
        .timeout(self.config.timeout);
        if let Some(max) = self.config.max_tokens {
            req = req.max_tokens(max);
        }

        self.limiter.acquire().await;
        let started = Instant::now();
        let outcome = self.gateway.chat(req).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (result, response) = match outcome {
            Ok(resp) => {
                debug!(index = item.index, content = %resp.content, "score reply");
                let result = match parse_score(&resp.content) {
                    Ok(score) => JudgmentResult::scored(item.index, score, polarity),
                    Err(err) => JudgmentResult::failed(
                        item.index,
                        polarity,
                        ItemError::new(err.kind(), err.to_string()),
                    ),
                };
                (result, Some(resp))
            }
            Err(err) => (
                JudgmentResult::failed(item.index, polarity, provider_item_error(&err)),
                None,
            ),
        };

        if let (Some(kind), Some(error)) = (result.error_kind, result.error.as_deref()) {
            warn!(index = item.index, kind = %kind, error, "scoring failed for item");
        }

        if let Some(trace) = self.trace.as_deref() {
            emit_trace(
                trace,
                self.trace_event(item, &result, response.as_ref(), latency_ms),
            );
        }

        result
    }

    fn trace_event(
        &self,
        item: &ScenarioRecord,
        result: &JudgmentResult,
        response: Option<&ChatResponse>,
        latency_ms: u64,
    ) -> CallTrace {
        let template = self.variant.template();
        CallTrace {
            timestamp_ms: now_epoch_ms(),
            run_id: self.run_id,
            index: item.index,
            stage: "score",
            prompt_template_slug: template.slug.to_string(),
            template_hash: template.hash(),
            text_hash: text_hash(&item.text),
            model: self.config.model.model_id().to_string(),
            response: response.map(|r| r.content.clone()),
            score: result.score,
            fallback: false,
            error_kind: result.error_kind,
            error: result.error.clone(),
            latency_ms,
            input_tokens: response.map(|r| r.input_tokens).unwrap_or(0),
            output_tokens: response.map(|r| r.output_tokens).unwrap_or(0),
        }
    }
}
