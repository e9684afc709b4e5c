//! First-person to third-person rewriting.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::{Attribution, ChatGateway, ChatRequest, ChatResponse};
use crate::pacing::RateLimiter;
use crate::prompts::PERSPECTIVE_REWRITE;
use crate::records::{ErrorKind, ItemError, RewriteResult, ScenarioRecord};
use crate::trace::{now_epoch_ms, text_hash, CallTrace, TraceSink};

use super::{emit_trace, provider_item_error, run_ordered, validate_items, AgentConfig, AgentError};

/// Rewrites first-person scenarios into the third person. A failed item
/// keeps its original text so the scoring stage never sees a hole.
pub struct RewriteAgent {
    gateway: Arc<dyn ChatGateway>,
    limiter: Arc<dyn RateLimiter>,
    config: AgentConfig,
    run_id: Uuid,
    trace: Option<Arc<dyn TraceSink>>,
}

impl RewriteAgent {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        limiter: Arc<dyn RateLimiter>,
        config: AgentConfig,
    ) -> Self {
        Self {
            gateway,
            limiter,
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

    pub async fn rewrite_all(
        &self,
        items: &[ScenarioRecord],
    ) -> Result<Vec<RewriteResult>, AgentError> {
        validate_items(items)?;
        info!(
            items = items.len(),
            concurrency = self.config.concurrency,
            "rewrite started"
        );

        let results =
            run_ordered(items, self.config.concurrency, |item| self.rewrite_one(item)).await;

        let fallbacks = results.iter().filter(|r| r.is_fallback()).count();
        info!(
            rewritten = results.len() - fallbacks,
            fallbacks, "rewrite finished"
        );
        Ok(results)
    }

    async fn rewrite_one(&self, item: &ScenarioRecord) -> RewriteResult {
        let prompt = PERSPECTIVE_REWRITE.render(&item.text, None);
        let mut req = ChatRequest::new(
            self.config.model.clone(),
            prompt.to_messages(),
            Attribution::new("agent::rewrite")
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
                let text = resp.content.trim();
                let result = if text.is_empty() {
                    RewriteResult::fallback(
                        item.index,
                        item.text.clone(),
                        ItemError::new(ErrorKind::EmptyResponse, "empty response"),
                    )
                } else {
                    debug!(index = item.index, rewritten = text, "rewrite reply");
                    RewriteResult::rewritten(item.index, text)
                };
                (result, Some(resp))
            }
            Err(err) => (
                RewriteResult::fallback(item.index, item.text.clone(), provider_item_error(&err)),
                None,
            ),
        };

        if let (Some(kind), Some(error)) = (result.error_kind, result.error.as_deref()) {
            warn!(
                index = item.index,
                kind = %kind,
                error,
                "rewrite failed, keeping original text"
            );
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
        result: &RewriteResult,
        response: Option<&ChatResponse>,
        latency_ms: u64,
    ) -> CallTrace {
        CallTrace {
            timestamp_ms: now_epoch_ms(),
            run_id: self.run_id,
            index: item.index,
            stage: "rewrite",
            prompt_template_slug: PERSPECTIVE_REWRITE.slug.to_string(),
            template_hash: PERSPECTIVE_REWRITE.hash(),
            text_hash: text_hash(&item.text),
            model: self.config.model.model_id().to_string(),
            response: response.map(|r| r.content.clone()),
            score: None,
            fallback: result.is_fallback(),
            error_kind: result.error_kind,
            error: result.error.clone(),
            latency_ms,
            input_tokens: response.map(|r| r.input_tokens).unwrap_or(0),
            output_tokens: response.map(|r| r.output_tokens).unwrap_or(0),
        }
    }
}
