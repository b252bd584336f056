use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use valuate::gateway::{
    Attribution, ChatGateway, ChatProvider, ChatRequest, FinishReason, GatewayConfig, Message,
    NoopUsageSink, OpenAiAdapter, ProviderError, ProviderGateway,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn request() -> ChatRequest {
    ChatRequest::new(
        "gpt-4",
        vec![Message::system("be brief"), Message::user("hi")],
        Attribution::new("test"),
    )
}

fn adapter(server: &MockServer) -> OpenAiAdapter {
    OpenAiAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn parses_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "hello" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request()).await.unwrap();
    assert_eq!(resp.content, "hello");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
    assert_eq!(
        resp.cost_nanodollars,
        valuate::gateway::chat_cost("gpt-4", 10, 20)
    );
}

#[tokio::test]
async fn sends_model_messages_and_temperature() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(|req: &Request| {
            let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
            assert_eq!(body["model"], "gpt-4");
            assert_eq!(body["temperature"], 0.0);
            assert_eq!(body["messages"][0]["role"], "system");
            assert_eq!(body["messages"][1]["content"], "hi");
            assert!(body.get("max_tokens").is_none());
            ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "ok" }, "finish_reason": "stop" }]
            }))
        })
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request()).await.unwrap();
    assert_eq!(resp.content, "ok");
    assert_eq!(resp.input_tokens, 0);
}

#[tokio::test]
async fn rejected_credential_is_unauthorized_and_fatal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "Incorrect API key provided", "code": "invalid_api_key" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
        },
    );
    let err = gateway.chat(request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Unauthorized { .. }));
    assert!(err.is_fatal());
    assert!(!err.is_retryable());
}

struct FailThenSucceed {
    calls: AtomicUsize,
}

impl Respond for FailThenSucceed {
    fn respond(&self, _req: &Request) -> ResponseTemplate {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            ResponseTemplate::new(503).set_body_string("upstream overloaded")
        } else {
            ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "recovered" }, "finish_reason": "stop" }]
            }))
        }
    }
}

#[tokio::test]
async fn gateway_retries_server_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FailThenSucceed {
            calls: AtomicUsize::new(0),
        })
        .expect(2)
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
        },
    );
    let resp = gateway.chat(request()).await.unwrap();
    assert_eq!(resp.content, "recovered");
}

#[tokio::test]
async fn content_filter_is_a_refusal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "" }, "finish_reason": "content_filter" }]
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }));
}
