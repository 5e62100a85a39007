//! HTTP gateway tests against a WireMock backend

use std::time::Duration;

use config_rs::BackendSettings;
use resilience::{Classify, FailureClass};
use serde_json::{json, Map};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::gateway::{BackendError, BackendGateway, HttpBackendGateway};
use crate::operation::{AnalysisTarget, OperationRequest, OperationType};

fn gateway_for(server: &MockServer, timeout_ms: u64) -> HttpBackendGateway {
    HttpBackendGateway::new(&BackendSettings {
        base_url: server.uri(),
        timeout_ms,
    })
    .expect("gateway should build")
}

fn request(operation_type: OperationType) -> OperationRequest {
    OperationRequest {
        operation_type,
        target: AnalysisTarget {
            path: Some("src/lib.rs".to_string()),
            content: Some("fn main() {}".to_string()),
            language: Some("rust".to_string()),
        },
        options: Map::new(),
    }
}

#[tokio::test]
async fn test_success_posts_operation_body_to_endpoint() {
    let server = MockServer::start().await;
    let req = request(OperationType::AssessQuality);

    Mock::given(method("POST"))
        .and(path("/assess/code"))
        .and(body_json(req.body()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "quality_score": 0.91 })))
        .expect(1)
        .mount(&server)
        .await;

    let response = gateway_for(&server, 5_000).invoke(&req).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body["quality_score"], 0.91);
}

#[tokio::test]
async fn test_each_operation_hits_its_endpoint() {
    let server = MockServer::start().await;
    for endpoint in ["/compliance/check", "/performance/baseline", "/patterns/extract"] {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "endpoint": endpoint })))
            .expect(1)
            .mount(&server)
            .await;
    }

    let gateway = gateway_for(&server, 5_000);
    for (operation, endpoint) in [
        (OperationType::CheckCompliance, "/compliance/check"),
        (OperationType::AnalyzePerformance, "/performance/baseline"),
        (OperationType::GetPatterns, "/patterns/extract"),
    ] {
        let response = gateway.invoke(&request(operation)).await.unwrap();
        assert_eq!(response.body["endpoint"], endpoint);
    }
}

#[tokio::test]
async fn test_empty_success_body_is_an_empty_object() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let response = gateway_for(&server, 5_000)
        .invoke(&request(OperationType::GetPatterns))
        .await
        .unwrap();
    assert_eq!(response.body, json!({}));
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = gateway_for(&server, 5_000)
        .invoke(&request(OperationType::AssessQuality))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        BackendError::Server {
            status: 503,
            body: "overloaded".to_string()
        }
    );
    assert_eq!(err.failure_class(), FailureClass::Transient);
}

#[tokio::test]
async fn test_client_errors_are_permanent() {
    for status in [400u16, 404, 422, 429] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({ "detail": "bad input" })))
            .mount(&server)
            .await;

        let err = gateway_for(&server, 5_000)
            .invoke(&request(OperationType::CheckCompliance))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(status));
        assert!(matches!(err, BackendError::Client { .. }));
        assert_eq!(err.failure_class(), FailureClass::Permanent);
    }
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = gateway_for(&server, 100)
        .invoke(&request(OperationType::AnalyzePerformance))
        .await
        .unwrap_err();

    assert_eq!(err, BackendError::Timeout(Duration::from_millis(100)));
    assert_eq!(err.failure_class(), FailureClass::Transient);
}

#[tokio::test]
async fn test_undecodable_success_body_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&server)
        .await;

    let err = gateway_for(&server, 5_000)
        .invoke(&request(OperationType::AssessQuality))
        .await
        .unwrap_err();

    assert!(matches!(err, BackendError::InvalidResponse(_)));
    assert_eq!(err.failure_class(), FailureClass::Permanent);
}

#[tokio::test]
async fn test_unreachable_backend_is_a_connection_error() {
    let gateway = HttpBackendGateway::new(&BackendSettings {
        base_url: "http://127.0.0.1:1".to_string(),
        timeout_ms: 2_000,
    })
    .unwrap();

    let err = gateway
        .invoke(&request(OperationType::AssessQuality))
        .await
        .unwrap_err();

    assert!(matches!(err, BackendError::Connection(_)));
    assert_eq!(err.failure_class(), FailureClass::Transient);
}

/// Reads one request, then answers with headers promising more body than is
/// sent and closes the connection.
async fn serve_truncated_body(listener: TcpListener) {
    let (mut socket, _) = listener.accept().await.unwrap();

    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&request);
        if let Some(head_end) = text.find("\r\n\r\n") {
            let content_length = text[..head_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if request.len() >= head_end + 4 + content_length {
                break;
            }
        }
    }

    socket
        .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 100\r\n\r\n{\"quality")
        .await
        .unwrap();
    socket.flush().await.unwrap();
    socket.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connection_dropped_mid_body_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_truncated_body(listener));

    let gateway = HttpBackendGateway::new(&BackendSettings {
        base_url: format!("http://{}", addr),
        timeout_ms: 2_000,
    })
    .unwrap();

    let err = gateway
        .invoke(&request(OperationType::AssessQuality))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Connection(_)), "got {:?}", err);
    assert_eq!(err.failure_class(), FailureClass::Transient);

    server.await.unwrap();
}
