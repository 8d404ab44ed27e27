//! HTTP-level tests for the Anthropic client against a local mock server.

use devflow::error::find_pipeline_error;
use devflow::io::config::{ApiKey, LlmConfig};
use devflow::io::llm::{AnthropicClient, LlmClient, LlmRequest};
use mockito::Matcher;
use serde_json::json;

fn config(server: &mockito::Server, max_retries: u32) -> LlmConfig {
    LlmConfig {
        api_url: format!("{}/v1/messages", server.url()),
        request_timeout_secs: 10,
        max_retries,
        retry_backoff_ms: 1,
    }
}

fn request() -> LlmRequest {
    LlmRequest {
        model: "claude-test".to_string(),
        system: "You edit files.".to_string(),
        prompt: "# Task\n\nCreate a.txt".to_string(),
        max_tokens: 512,
        temperature: None,
    }
}

/// Verifies headers, request body and the concatenation of text blocks.
#[test]
fn successful_call_returns_text_and_usage() {
    let mut server = mockito::Server::new();
    let body = json!({
        "id": "msg_1",
        "type": "message",
        "model": "claude-test",
        "content": [
            {"type": "text", "text": "Hello "},
            {"type": "tool_use", "id": "t", "name": "x", "input": {}},
            {"type": "text", "text": "world"}
        ],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 12, "output_tokens": 3}
    });
    let mock = server
        .mock("POST", "/v1/messages")
        .match_header("x-api-key", "test-key")
        .match_header("anthropic-version", "2023-06-01")
        .match_body(Matcher::PartialJson(json!({
            "model": "claude-test",
            "max_tokens": 512,
            "system": "You edit files.",
            "messages": [{"role": "user", "content": "# Task\n\nCreate a.txt"}]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .expect(1)
        .create();

    let client = AnthropicClient::new(&config(&server, 2), ApiKey::new("test-key")).expect("client");
    let reply = client.complete(&request()).expect("reply");

    mock.assert();
    assert_eq!(reply.text, "Hello world");
    assert_eq!(reply.model, "claude-test");
    assert_eq!(reply.usage.input_tokens, 12);
    assert_eq!(reply.usage.output_tokens, 3);
    assert_eq!(reply.stop_reason.as_deref(), Some("end_turn"));
}

/// Verifies server errors are retried up to the bound, then surface as LlmCall.
#[test]
fn server_errors_are_retried_then_fail() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/v1/messages")
        .with_status(529)
        .with_body(r#"{"type":"error","error":{"type":"overloaded_error"}}"#)
        .expect(3)
        .create();

    let client = AnthropicClient::new(&config(&server, 2), ApiKey::new("k")).expect("client");
    let err = client.complete(&request()).expect_err("should fail");

    mock.assert();
    let pipeline_err = find_pipeline_error(&err).expect("typed error");
    assert_eq!(pipeline_err.kind(), "LlmCall");
    assert!(err.to_string().contains("529"));
}

/// Verifies client errors other than 429 are not retried.
#[test]
fn unauthorized_is_not_retried() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/v1/messages")
        .with_status(401)
        .with_body(r#"{"type":"error","error":{"type":"authentication_error"}}"#)
        .expect(1)
        .create();

    let client = AnthropicClient::new(&config(&server, 2), ApiKey::new("bad")).expect("client");
    let err = client.complete(&request()).expect_err("should fail");

    mock.assert();
    assert_eq!(find_pipeline_error(&err).map(|e| e.kind()), Some("LlmCall"));
}

/// Verifies a 429 counts as transient.
#[test]
fn rate_limit_is_retried() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/v1/messages")
        .with_status(429)
        .expect(2)
        .create();

    let client = AnthropicClient::new(&config(&server, 1), ApiKey::new("k")).expect("client");
    client.complete(&request()).expect_err("should fail");

    mock.assert();
}

/// Verifies the API key never shows up in debug output.
#[test]
fn api_key_debug_is_redacted() {
    let key = ApiKey::new("sk-secret-value");
    assert!(!format!("{key:?}").contains("sk-secret-value"));
}
