//! Gateway for OpenAI-compatible chat completions.

pub mod breaker;
pub mod error;
pub mod openai;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::warn;

use openai::{ChatProvider, OpenAiCompatAdapter};
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// The single backend call every agent makes.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// `None` disables the circuit breaker.
    pub breaker: Option<BreakerConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            breaker: Some(BreakerConfig::default()),
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    provider: OpenAiCompatAdapter,
    usage_sink: Arc<U>,
    config: GatewayConfig,
    breaker: Option<CircuitBreaker>,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let provider = OpenAiCompatAdapter::from_env()?;
        Ok(Self::with_config(
            provider,
            usage_sink,
            GatewayConfig::default(),
        ))
    }

    pub fn with_config(
        provider: OpenAiCompatAdapter,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        let breaker = config.breaker.map(CircuitBreaker::new);
        Self {
            provider,
            usage_sink,
            config,
            breaker,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            if let Some(breaker) = &self.breaker {
                if let Err(err) = breaker.check() {
                    self.record_usage(
                        &req,
                        &ChatResponse::failed(Duration::ZERO),
                        attempt,
                        Some(err.code()),
                    )
                    .await;
                    return Err(err);
                }
            }

            let started = Instant::now();
            match self.provider.chat(&req).await {
                Ok(resp) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    self.record_usage(&req, &resp, attempt, None).await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.record_usage(
                        &req,
                        &ChatResponse::failed(started.elapsed()),
                        attempt,
                        Some(err.code()),
                    )
                    .await;
                    if counts_against_backend(&err) {
                        if let Some(breaker) = &self.breaker {
                            breaker.record_failure();
                        }
                    }

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying backend call"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider("gateway", "unknown error", false)))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        attempt: u32,
        error_code: Option<&str>,
    ) {
        let record = ProviderCallRecord::new(
            "chat/completions",
            req.model.model_id(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens, resp.output_tokens)
        .run(req.attribution.run_id)
        .item(req.attribution.item_index)
        .attempt(attempt)
        .latency(resp.latency.as_millis() as u64);

        let record = match error_code {
            Some(code) => record.error(code),
            None => record,
        };

        self.usage_sink.record(record).await;
    }
}

/// Content-level rejections say nothing about backend health.
fn counts_against_backend(err: &ProviderError) -> bool {
    !matches!(
        err,
        ProviderError::Refused { .. }
            | ProviderError::InvalidRequest { .. }
            | ProviderError::CircuitOpen { .. }
    )
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    let delay = base * multiplier;
    let jitter_cap = (delay.as_millis() as u64) / 4;
    if jitter_cap == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
}
