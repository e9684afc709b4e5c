use std::sync::Arc;
use std::time::Duration;

use perspective_harness::gateway::openai::OpenAiCompatAdapter;
use perspective_harness::gateway::{ChatGateway, GatewayConfig, NoopUsageSink, ProviderGateway};
use perspective_harness::pacing::Unthrottled;
use perspective_harness::{
    AgentConfig, ErrorKind, RewriteAgent, ScenarioRecord, ScoringAgent, ScoringVariant,
};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

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

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 4 }
    }))
}

#[tokio::test]
async fn failed_rewrites_fall_back_and_still_get_scored() {
    let server = MockServer::start().await;

    // Every rewrite request fails; every scoring request succeeds.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("Rewrite the following text"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("his or her behavior"))
        .respond_with(completion("0.7"))
        .mount(&server)
        .await;

    let items = vec![
        ScenarioRecord::new(0, "I borrowed my sister's car without asking."),
        ScenarioRecord::new(1, "I returned the wallet I found."),
    ];

    let gw = gateway(&server);
    let rewrites = RewriteAgent::new(
        gw.clone(),
        Arc::new(Unthrottled),
        AgentConfig::rewrite("gpt-4o-mini"),
    )
    .rewrite_all(&items)
    .await
    .unwrap();

    assert_eq!(rewrites.len(), 2);
    for (rewrite, item) in rewrites.iter().zip(&items) {
        assert!(rewrite.is_fallback());
        assert_eq!(rewrite.rewritten, item.text);
        assert_eq!(rewrite.error_kind, Some(ErrorKind::Transport));
    }

    let inputs: Vec<ScenarioRecord> = rewrites.iter().map(|r| r.to_scenario()).collect();
    let scores = ScoringAgent::new(
        gw,
        Arc::new(Unthrottled),
        ScoringVariant::ThirdPerson,
        AgentConfig::scoring("gpt-4o-mini"),
    )
    .score_all(&inputs)
    .await
    .unwrap();

    assert_eq!(scores.len(), 2);
    assert!(scores.iter().all(|s| s.score == Some(0.7)));
    assert_eq!(scores[1].index, 1);
}

#[tokio::test]
async fn successful_rewrite_is_trimmed_and_replaces_the_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("  Nick borrowed his sister's car without asking.\n"))
        .mount(&server)
        .await;

    let items = vec![ScenarioRecord::new(
        4,
        "I borrowed my sister's car without asking.",
    )];
    let rewrites = RewriteAgent::new(
        gateway(&server),
        Arc::new(Unthrottled),
        AgentConfig::rewrite("gpt-4o-mini"),
    )
    .rewrite_all(&items)
    .await
    .unwrap();

    assert_eq!(rewrites[0].index, 4);
    assert!(!rewrites[0].is_fallback());
    assert_eq!(
        rewrites[0].rewritten,
        "Nick borrowed his sister's car without asking."
    );
    assert_eq!(rewrites[0].error, None);
}
