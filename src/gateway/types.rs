//! Core types for the chat gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for usage accounting and debugging.
///
/// Every request through the gateway carries attribution so we know:
/// - Which experiment run it belongs to (run_id)
/// - Which input item triggered it (item_index)
/// - Which code path triggered it (caller)
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Experiment run this request is part of.
    pub run_id: Option<Uuid>,
    /// Index of the scenario being processed.
    pub item_index: Option<usize>,
    /// Which code path made this call, e.g. "agent::score" or "agent::rewrite".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_item(mut self, index: usize) -> Self {
        self.item_index = Some(index);
        self
    }
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Chat model identifier as understood by the backend, e.g. "deepseek-v3".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatModel(String);

impl ChatModel {
    pub fn new(model_id: impl Into<String>) -> Self {
        ChatModel(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        &self.0
    }
}

/// Request for chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model to use.
    pub model: ChatModel,
    /// Messages in the conversation.
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Bounded wait for this single request. Falls back to the client-wide cap.
    pub timeout: Option<Duration>,
    /// Attribution for usage accounting.
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            temperature: 0.0,
            max_tokens: None,
            timeout: None,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Response from chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Generated text. Empty when the backend produced no content.
    pub content: String,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Time taken for the request.
    pub latency: Duration,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    /// Placeholder for an attempt that produced no response.
    pub(crate) fn failed(latency: Duration) -> Self {
        Self {
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            latency,
            finish_reason: FinishReason::Unknown("error".to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_defaults() {
        let req = ChatRequest::new(
            ChatModel::new("deepseek-v3"),
            vec![Message::user("hi")],
            Attribution::new("test"),
        );
        assert_eq!(req.temperature, 0.0);
        assert!(req.max_tokens.is_none());
        assert!(req.timeout.is_none());
    }

    #[test]
    fn request_builder_overrides() {
        let req = ChatRequest::new(
            ChatModel::new("deepseek-v3"),
            vec![Message::user("hi")],
            Attribution::new("test").with_item(3),
        )
        .temperature(0.7)
        .max_tokens(16)
        .timeout(Duration::from_secs(60));
        assert_eq!(req.max_tokens, Some(16));
        assert_eq!(req.timeout, Some(Duration::from_secs(60)));
        assert_eq!(req.attribution.item_index, Some(3));
    }

    #[test]
    fn finish_reason_parsing() {
        assert_eq!(FinishReason::from(Some("stop".into())), FinishReason::Stop);
        assert_eq!(
            FinishReason::from(None),
            FinishReason::Unknown("none".into())
        );
    }
}
