//! Integration tests for the chat-completions decision client

use std::sync::Arc;

use httpmock::prelude::*;
use serde_json::json;

use ui_verdict::action::{Action, parse_response};
use ui_verdict::conversation::{Content, Conversation};
use ui_verdict::retry::RetryPolicy;
use ui_verdict::vlm::{ChatClient, DecisionService, Retrying, VlmConfig, VlmError, check_health};

fn conversation() -> Conversation {
    let mut conversation = Conversation::new("You are a professional web testing robot.", 6);
    conversation.push_user(Content::TextWithImage {
        text: "Interactive elements on the page:\n[0] <button> Start\n".to_string(),
        png: Arc::new(vec![0x89, b'P', b'N', b'G']),
    });
    conversation
}

fn client(server: &MockServer) -> ChatClient {
    ChatClient::new(
        VlmConfig::new(format!("{}/v1", server.base_url()))
            .api_key("test-key")
            .model("gpt-4o-mini")
            .max_tokens(256)
            .request_timeout(5),
    )
    .expect("client should build")
}

#[tokio::test]
async fn test_client_sends_multimodal_request() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer test-key")
            .json_body_includes(
                json!({
                    "model": "gpt-4o-mini",
                    "max_tokens": 256,
                })
                .to_string(),
            );
        then.status(200).json_body(json!({
            "choices": [{
                "message": {"content": "Thought: start it\nAction: Click [0]"},
                "finish_reason": "stop"
            }]
        }));
    });

    let reply = client(&server).complete(&conversation()).await.unwrap();

    mock.assert_calls(1);
    assert_eq!(parse_response(&reply), Some(Action::Click { label: 0 }));
}

#[tokio::test]
async fn test_server_errors_are_retried_up_to_ceiling() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(500).body("upstream exploded");
    });

    let service = Retrying::new(client(&server), RetryPolicy::immediate(3));
    let err = service.complete(&conversation()).await.unwrap_err();

    mock.assert_calls(3);
    assert!(matches!(err, VlmError::Status { status: 500, .. }));
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(401).json_body(json!({"error": {"message": "invalid api key"}}));
    });

    let service = Retrying::new(client(&server), RetryPolicy::immediate(3));
    let err = service.complete(&conversation()).await.unwrap_err();

    mock.assert_calls(1);
    match err {
        VlmError::Status { status, body } => {
            assert_eq!(status, 401);
            assert!(body.contains("invalid api key"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_empty_reply_is_invalid_response() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(json!({"choices": [{"message": {"content": "   "}}]}));
    });

    let err = client(&server).complete(&conversation()).await.unwrap_err();
    assert!(matches!(err, VlmError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_health_check() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/v1/models");
        then.status(404);
    });

    let base = format!("{}/v1", server.base_url());
    assert!(check_health(&base, std::time::Duration::from_secs(2)).await);
    assert!(!check_health("http://127.0.0.1:1/v1", std::time::Duration::from_secs(2)).await);
}
