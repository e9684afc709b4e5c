//! Prompted agents: one backend request per input item.
//!
//! Both agents share the same protocol. Items are processed in input order,
//! each item yields exactly one result, and a failing item is recorded on
//! its own result while the rest of the batch continues.

pub mod rewrite;
pub mod scoring;

use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::gateway::{ChatModel, ProviderError};
use crate::records::{ErrorKind, ItemError, ScenarioRecord};
use crate::trace::{CallTrace, TraceSink};

pub use rewrite::RewriteAgent;
pub use scoring::{parse_score, ScoreParseError, ScoringAgent};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_SCORING_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_REWRITE_TIMEOUT: Duration = Duration::from_secs(500);

/// Per-agent request settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: ChatModel,
    pub temperature: f32,
    /// Upper bound on a single backend request.
    pub timeout: Duration,
    pub max_tokens: Option<u32>,
    /// Requests in flight at once. 1 = strictly sequential.
    pub concurrency: usize,
}

impl AgentConfig {
    pub fn scoring(model: impl Into<String>) -> Self {
        Self {
            model: ChatModel::new(model),
            temperature: 0.0,
            timeout: DEFAULT_SCORING_TIMEOUT,
            max_tokens: Some(16),
            concurrency: 1,
        }
    }

    pub fn rewrite(model: impl Into<String>) -> Self {
        Self {
            model: ChatModel::new(model),
            temperature: 0.0,
            timeout: DEFAULT_REWRITE_TIMEOUT,
            max_tokens: None,
            concurrency: 1,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Fatal problems with an agent's input, detected before any request.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("item {index}: variant {variant} requires an excuse")]
    MissingExcuse { index: usize, variant: &'static str },
    #[error("duplicate index {index} in input")]
    DuplicateIndex { index: usize },
}

/// Map a gateway failure onto the per-item error categories.
pub fn classify_provider_error(err: &ProviderError) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }
    match err {
        ProviderError::Refused { .. } => ErrorKind::Refused,
        _ => ErrorKind::Transport,
    }
}

pub(crate) fn provider_item_error(err: &ProviderError) -> ItemError {
    ItemError::new(classify_provider_error(err), err.to_string())
}

/// Reject inputs whose results could not be joined back by index. Blank
/// text is sent like any other item.
pub(crate) fn validate_items(items: &[ScenarioRecord]) -> Result<(), AgentError> {
    let mut seen = std::collections::HashSet::with_capacity(items.len());
    for item in items {
        if !seen.insert(item.index) {
            return Err(AgentError::DuplicateIndex { index: item.index });
        }
    }
    Ok(())
}

/// Run `work` over every item with at most `concurrency` in flight, returning
/// results in input order.
pub(crate) async fn run_ordered<'a, T, R, F, Fut>(
    items: &'a [T],
    concurrency: usize,
    work: F,
) -> Vec<R>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = R>,
{
    stream::iter(items.iter().map(work))
        .buffered(concurrency.max(1))
        .collect()
        .await
}

/// Trace failures are logged and never fail the item.
pub(crate) fn emit_trace(sink: &dyn TraceSink, event: CallTrace) {
    if let Err(err) = sink.record(event) {
        warn!(error = %err, "failed to record call trace");
    }
}
