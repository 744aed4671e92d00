// HTTP provider against a wiremock server
//
// Run with: cargo test --test http_provider

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use masterpiece::provider::{
    AuthConfig, CapabilityProvider, HttpConfig, HttpProvider, ProviderBridge, ProviderError,
    ProviderState,
};
use masterpiece::{CapabilityRegistry, MasterpieceError, ReplacePolicy};

const TOKEN: &str = "secret-token";

fn config(url: &str) -> HttpConfig {
    let mut config = HttpConfig::new("design", url);
    config.auth = Some(AuthConfig::Bearer {
        token: TOKEN.to_string(),
    });
    config.call_timeout_secs = 2;
    config
}

async fn server_with_catalog() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/capabilities"))
        .and(header("authorization", format!("Bearer {}", TOKEN).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "capabilities": [
                {
                    "name": "mockup",
                    "description": "Render a screen mockup",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "screen": { "type": "string" } },
                        "required": ["screen"]
                    },
                    "output": "string"
                }
            ]
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_discover_and_call_with_bearer_token() {
    let server = server_with_catalog().await;
    Mock::given(method("POST"))
        .and(path("/invoke"))
        .and(header("authorization", format!("Bearer {}", TOKEN).as_str()))
        .and(body_json(json!({"capability": "mockup", "args": {"screen": "login"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "login.png"})))
        .expect(1)
        .mount(&server)
        .await;

    let registry = Arc::new(CapabilityRegistry::new(ReplacePolicy::Strict));
    let bridge = ProviderBridge::new(registry.clone(), None);
    bridge
        .add(Arc::new(HttpProvider::new(config(&server.uri()), None).unwrap()))
        .await
        .unwrap();

    let names = bridge.start("design").await.unwrap();
    assert_eq!(names, vec!["provider:design/mockup"]);

    let result = registry
        .invoke("provider:design/mockup", json!({"screen": "login"}))
        .await
        .unwrap();
    assert_eq!(result, json!("login.png"));

    // Parameters came from the JSON schema
    let err = registry
        .invoke("provider:design/mockup", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, MasterpieceError::InvalidArguments { .. }));
}

#[tokio::test]
async fn test_non_2xx_is_execution_error_with_payload() {
    let server = server_with_catalog().await;
    Mock::given(method("POST"))
        .and(path("/invoke"))
        .respond_with(ResponseTemplate::new(422).set_body_string("screen not supported"))
        .mount(&server)
        .await;

    let provider = HttpProvider::new(config(&server.uri()), None).unwrap();
    provider.start().await.unwrap();
    provider.discover().await.unwrap();

    let err = provider
        .call("mockup", json!({"screen": "settings"}))
        .await
        .unwrap_err();
    match &err {
        ProviderError::Execution { message, .. } => {
            assert!(message.contains("422"));
            assert!(message.contains("screen not supported"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    // The service answered, so it is still considered healthy
    assert_eq!(provider.state(), ProviderState::Ready);
}

#[tokio::test]
async fn test_call_past_deadline_degrades_and_fails_fast() {
    let server = server_with_catalog().await;
    Mock::given(method("POST"))
        .and(path("/invoke"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"result": "too late"}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let mut slow = config(&server.uri());
    slow.call_timeout_secs = 1;
    let provider = HttpProvider::new(slow, None).unwrap();
    provider.start().await.unwrap();
    provider.discover().await.unwrap();
    assert_eq!(provider.state(), ProviderState::Ready);

    let started = Instant::now();
    let err = provider
        .call("mockup", json!({"screen": "login"}))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(matches!(err, ProviderError::Unavailable { .. }));
    assert!(err.to_string().contains("deadline"));
    assert_eq!(provider.state(), ProviderState::Degraded);

    // No second round-trip while degraded
    let again = Instant::now();
    let err = provider
        .call("mockup", json!({"screen": "login"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable { .. }));
    assert!(again.elapsed() < Duration::from_millis(500));
    let invocations = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/invoke")
        .count();
    assert_eq!(invocations, 1);
}

#[tokio::test]
async fn test_wrong_token_is_rejected_by_service() {
    let server = server_with_catalog().await;
    let mut wrong = config(&server.uri());
    wrong.auth = Some(AuthConfig::Bearer {
        token: "not-the-token".to_string(),
    });

    let provider = HttpProvider::new(wrong, None).unwrap();
    provider.start().await.unwrap();

    // No mock matches the wrong header: wiremock answers 404
    let err = provider.discover().await.unwrap_err();
    assert!(matches!(err, ProviderError::Execution { .. }));
    assert_ne!(provider.state(), ProviderState::Ready);
}

#[tokio::test]
async fn test_unreachable_service_degrades_without_failing_start() {
    // Bind then drop a listener to get a port nobody is serving
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let provider = HttpProvider::new(config(&format!("http://127.0.0.1:{}", port)), None).unwrap();

    provider.start().await.unwrap();
    assert_eq!(provider.state(), ProviderState::Degraded);

    let err = provider.discover().await.unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable { .. }));
    assert_eq!(provider.state(), ProviderState::Degraded);

    let err = provider.call("mockup", json!({})).await.unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable { .. }));
}

#[tokio::test]
async fn test_health_check_then_stop() {
    let server = server_with_catalog().await;
    let provider = HttpProvider::new(config(&server.uri()), None).unwrap();
    provider.start().await.unwrap();
    provider.discover().await.unwrap();
    assert_eq!(provider.check_health().await, ProviderState::Ready);

    provider.stop().await.unwrap();
    assert_eq!(provider.state(), ProviderState::Stopped);
    let err = provider.call("mockup", json!({"screen": "x"})).await.unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable { .. }));
}
