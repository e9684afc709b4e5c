use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use perspective_harness::gateway::openai::OpenAiCompatAdapter;
use perspective_harness::gateway::{ChatGateway, GatewayConfig, NoopUsageSink, ProviderGateway};
use perspective_harness::pacing::{RateLimiter, Unthrottled};
use perspective_harness::{
    AgentConfig, AgentError, ErrorKind, Polarity, RewriteAgent, ScenarioRecord, ScoringAgent,
    ScoringVariant,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn gateway(server: &MockServer) -> Arc<dyn ChatGateway> {
    let adapter =
        OpenAiCompatAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None)
            .unwrap();
    Arc::new(ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
            breaker: None,
        },
    ))
}

fn agent(server: &MockServer, variant: ScoringVariant, timeout: Duration) -> ScoringAgent {
    ScoringAgent::new(
        gateway(server),
        Arc::new(Unthrottled),
        variant,
        AgentConfig::scoring("gpt-4o-mini").with_timeout(timeout),
    )
}

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 40, "completion_tokens": 2 }
    }))
}

fn user_prompt(request: &Request) -> String {
    let parsed: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or_default();
    parsed["messages"]
        .as_array()
        .and_then(|messages| {
            messages
                .iter()
                .find(|m| m["role"] == "user")
                .and_then(|m| m["content"].as_str())
        })
        .unwrap_or("")
        .to_string()
}

/// Replies by looking up a marker word from the scenario text.
struct ScriptedJudge {
    slow_marker: Option<&'static str>,
}

impl Respond for ScriptedJudge {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let prompt = user_prompt(request);
        if let Some(marker) = self.slow_marker {
            if prompt.contains(marker) {
                return completion("0.5").set_delay(Duration::from_secs(3));
            }
        }
        if prompt.contains("STOLE") {
            completion("0.95")
        } else if prompt.contains("HELPED") {
            completion(" 0.05\n")
        } else if prompt.contains("VAGUE") {
            completion("It depends, maybe 0.5")
        } else if prompt.contains("SILENT") {
            completion("")
        } else {
            completion("0.5")
        }
    }
}

fn scenarios(texts: &[&str]) -> Vec<ScenarioRecord> {
    texts
        .iter()
        .enumerate()
        .map(|(i, t)| ScenarioRecord::new(i, *t))
        .collect()
}

#[tokio::test]
async fn scores_every_item_in_order_with_polarity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ScriptedJudge { slow_marker: None })
        .mount(&server)
        .await;

    let items = scenarios(&["I STOLE a bike.", "I HELPED my neighbour.", "I waited."]);
    let results = agent(&server, ScoringVariant::NarratorFirstPerson, Duration::from_secs(5))
        .score_all(&items)
        .await
        .unwrap();

    let scores: Vec<Option<f64>> = results.iter().map(|r| r.score).collect();
    assert_eq!(scores, vec![Some(0.95), Some(0.05), Some(0.5)]);
    assert!(results.iter().all(|r| r.polarity == Polarity::Wrongdoing));
    assert!(results.iter().all(|r| r.error.is_none()));
    assert_eq!(
        results.iter().map(|r| r.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
}

#[tokio::test]
async fn one_timeout_in_five_only_fails_that_item() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ScriptedJudge {
            slow_marker: Some("SLOW"),
        })
        .mount(&server)
        .await;

    let items = scenarios(&[
        "I STOLE a pen.",
        "I HELPED a child.",
        "I was SLOW to answer my mother.",
        "I STOLE a bike.",
        "I HELPED a friend move.",
    ]);
    let results = agent(
        &server,
        ScoringVariant::DirectFirstPerson,
        Duration::from_millis(200),
    )
    .score_all(&items)
    .await
    .unwrap();

    assert_eq!(results.len(), 5);
    for (i, r) in results.iter().enumerate() {
        assert_eq!(r.index, i);
        if i == 2 {
            assert_eq!(r.score, None);
            assert_eq!(r.error_kind, Some(ErrorKind::Timeout));
            assert!(r.error.is_some());
        } else {
            assert!(r.score.is_some(), "item {i} should have a score");
            assert!(r.error.is_none());
        }
    }
}

#[tokio::test]
async fn total_backend_failure_still_yields_one_result_per_item() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let items = scenarios(&["a", "b", "c", "d"]);
    let results = agent(&server, ScoringVariant::ThirdPerson, Duration::from_secs(5))
        .score_all(&items)
        .await
        .unwrap();

    assert_eq!(results.len(), items.len());
    assert!(results.iter().all(|r| r.score.is_none()));
    assert!(results
        .iter()
        .all(|r| r.error_kind == Some(ErrorKind::Transport)));
}

#[tokio::test]
async fn unparseable_and_empty_replies_are_typed_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ScriptedJudge { slow_marker: None })
        .mount(&server)
        .await;

    let items = scenarios(&["I gave a VAGUE answer.", "I stayed SILENT."]);
    let results = agent(&server, ScoringVariant::NarratorFirstPerson, Duration::from_secs(5))
        .score_all(&items)
        .await
        .unwrap();

    assert_eq!(results[0].error_kind, Some(ErrorKind::Parse));
    assert_eq!(results[0].score, None);
    assert_eq!(results[1].error_kind, Some(ErrorKind::EmptyResponse));
    assert_eq!(results[1].score, None);
}

#[tokio::test]
async fn excuse_variant_sends_excuse_and_reports_reasonableness() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("0.8"))
        .mount(&server)
        .await;

    let items = vec![ScenarioRecord::new(0, "Could you take out the trash?")
        .with_excuse("No, because I took it out this morning.")];
    let results = agent(
        &server,
        ScoringVariant::ExcuseReasonableness,
        Duration::from_secs(5),
    )
    .score_all(&items)
    .await
    .unwrap();

    assert_eq!(results[0].score, Some(0.8));
    assert_eq!(results[0].polarity, Polarity::Reasonableness);

    let received = server.received_requests().await.unwrap();
    let prompt = user_prompt(&received[0]);
    assert!(prompt.contains("Excuse: No, because I took it out this morning."));
}

#[tokio::test]
async fn missing_excuse_is_rejected_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("0.8"))
        .expect(0)
        .mount(&server)
        .await;

    let items = vec![
        ScenarioRecord::new(0, "Could you feed the cat?").with_excuse("No, the cat is asleep."),
        ScenarioRecord::new(1, "Could you water the plants?"),
    ];
    let err = agent(
        &server,
        ScoringVariant::ExcuseReasonableness,
        Duration::from_secs(5),
    )
    .score_all(&items)
    .await
    .unwrap_err();

    assert!(matches!(err, AgentError::MissingExcuse { index: 1, .. }));
}

#[tokio::test]
async fn concurrent_scoring_keeps_input_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ScriptedJudge { slow_marker: None })
        .mount(&server)
        .await;

    let texts: Vec<String> = (0..12)
        .map(|i| {
            if i % 2 == 0 {
                format!("{i}: I STOLE it.")
            } else {
                format!("{i}: I HELPED.")
            }
        })
        .collect();
    let items: Vec<ScenarioRecord> = texts
        .iter()
        .enumerate()
        .map(|(i, t)| ScenarioRecord::new(i, t.as_str()))
        .collect();

    let agent = ScoringAgent::new(
        gateway(&server),
        Arc::new(Unthrottled),
        ScoringVariant::NarratorFirstPerson,
        AgentConfig::scoring("gpt-4o-mini").with_concurrency(4),
    );
    let results = agent.score_all(&items).await.unwrap();

    for (i, r) in results.iter().enumerate() {
        assert_eq!(r.index, i);
        let expected = if i % 2 == 0 { 0.95 } else { 0.05 };
        assert_eq!(r.score, Some(expected));
    }
}

#[derive(Default)]
struct CountingLimiter {
    permits: AtomicUsize,
}

#[async_trait]
impl RateLimiter for CountingLimiter {
    async fn acquire(&self) {
        self.permits.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn blank_text_is_sent_and_gets_exactly_one_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("0.3"))
        .expect(3)
        .mount(&server)
        .await;

    let items = vec![
        ScenarioRecord::new(0, "I lied."),
        ScenarioRecord::new(1, " "),
        ScenarioRecord::new(2, "I helped."),
    ];
    let results = agent(&server, ScoringVariant::NarratorFirstPerson, Duration::from_secs(5))
        .score_all(&items)
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(
        results.iter().map(|r| r.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(results.iter().all(|r| r.score == Some(0.3)));
}

#[tokio::test]
async fn blank_text_is_rewritten_like_any_other_item() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("Nick said nothing."))
        .expect(2)
        .mount(&server)
        .await;

    let items = vec![ScenarioRecord::new(0, "I said nothing."), ScenarioRecord::new(1, "")];
    let results = RewriteAgent::new(
        gateway(&server),
        Arc::new(Unthrottled),
        AgentConfig::rewrite("gpt-4o-mini"),
    )
    .rewrite_all(&items)
    .await
    .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.rewritten == "Nick said nothing."));
}

#[tokio::test]
async fn one_request_and_one_permit_per_item() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ScriptedJudge { slow_marker: None })
        .expect(4)
        .mount(&server)
        .await;

    let limiter = Arc::new(CountingLimiter::default());
    let items = scenarios(&["I STOLE a pen.", "I HELPED.", "I gave a VAGUE answer.", "I waited."]);
    let results = ScoringAgent::new(
        gateway(&server),
        limiter.clone(),
        ScoringVariant::ThirdPerson,
        AgentConfig::scoring("gpt-4o-mini").with_concurrency(2),
    )
    .score_all(&items)
    .await
    .unwrap();

    assert_eq!(results.len(), 4);
    assert_eq!(limiter.permits.load(Ordering::SeqCst), 4);
    // A parse failure is still one request, never a retry.
    assert_eq!(results[2].error_kind, Some(ErrorKind::Parse));
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}
