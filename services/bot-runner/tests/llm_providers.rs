//! Provider clients against a local mock server

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bot_runner::llm::{parse_reply, AnthropicClient, GeminiClient, LlmClient, LlmError, OpenAiClient};
use bot_runner::signal::SignalAction;

const REPLY: &str = r#"{"action":"SELL","confidence":0.72,"reasoning":"lower highs"}"#;

#[tokio::test]
async fn test_openai_chat_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "response_format": { "type": "json_object" },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": REPLY } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiClient::new("sk-test").unwrap().with_base_url(&server.uri());
    let raw = client.complete("gpt-4o-mini", "system", "prompt").await.unwrap();
    let reply = parse_reply(&raw).unwrap();
    assert_eq!(reply.action, SignalAction::Sell);
    assert!((reply.confidence - 0.72).abs() < 1e-9);
}

#[tokio::test]
async fn test_anthropic_messages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "ak-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({ "system": "be terse" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                { "type": "text", "text": "Here you go: " },
                { "type": "text", "text": REPLY }
            ]
        })))
        .mount(&server)
        .await;

    let client = AnthropicClient::new("ak-test").unwrap().with_base_url(&server.uri());
    let raw = client
        .complete("claude-3-5-haiku-latest", "be terse", "prompt")
        .await
        .unwrap();
    assert_eq!(parse_reply(&raw).unwrap().action, SignalAction::Sell);
}

#[tokio::test]
async fn test_gemini_generate_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
        .and(query_param("key", "g-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "content": { "parts": [{ "text": REPLY }] } }]
        })))
        .mount(&server)
        .await;

    let client = GeminiClient::new("g-test").unwrap().with_base_url(&server.uri());
    let raw = client
        .complete("gemini-1.5-flash", "system", "prompt")
        .await
        .unwrap();
    assert_eq!(parse_reply(&raw).unwrap().action, SignalAction::Sell);
}

#[tokio::test]
async fn test_api_error_carries_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let client = OpenAiClient::new("sk-test").unwrap().with_base_url(&server.uri());
    match client.complete("gpt-4o-mini", "s", "p").await {
        Err(LlmError::Api { provider, status, body }) => {
            assert_eq!(provider, "openai");
            assert_eq!(status, 429);
            assert_eq!(body, "rate limited");
        }
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_empty_reply_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "candidates": [] })))
        .mount(&server)
        .await;

    let client = GeminiClient::new("g-test").unwrap().with_base_url(&server.uri());
    assert!(matches!(
        client.complete("gemini-1.5-flash", "s", "p").await,
        Err(LlmError::EmptyResponse)
    ));
}
