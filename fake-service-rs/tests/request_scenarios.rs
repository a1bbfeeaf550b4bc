//! End-to-end request scenarios through the orchestrator, with real HTTP
//! upstreams served by wiremock and real gRPC upstreams served in process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fake_service::client::{GrpcClient, HttpClientSettings, ReqwestClient, TonicClient};
use fake_service::dispatch::GrpcClients;
use fake_service::handlers::{FakeServer, Readiness};
use fake_service::load::FixedRequestGenerator;
use fake_service::{
    ErrorInjector, Inbound, InjectorConfig, OrchestratorConfig, RequestDuration, RequestOrchestrator, ServiceType,
    Terminal,
};
use tonic::transport::Server;
use wiremock::matchers::{body_bytes, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(name: &str, message: &str, upstreams: Vec<String>) -> OrchestratorConfig {
    OrchestratorConfig {
        name: name.to_string(),
        message: message.to_string(),
        upstream_uris: upstreams,
        upstream_workers: 2,
        ..OrchestratorConfig::default()
    }
}

fn http_client() -> Arc<ReqwestClient> {
    Arc::new(
        ReqwestClient::new(&HttpClientSettings {
            timeout: Duration::from_secs(2),
            ..HttpClientSettings::default()
        })
        .unwrap(),
    )
}

fn inbound(path: &str) -> Inbound {
    Inbound::http(path, Default::default())
}

/// Serve a fake service over gRPC on a free local port
async fn spawn_grpc(orchestrator: RequestOrchestrator) -> SocketAddr {
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .unwrap();

    tokio::spawn(
        Server::builder()
            .add_service(FakeServer::new(Arc::new(orchestrator)).into_service())
            .serve(addr),
    );
    tokio::time::sleep(Duration::from_millis(150)).await;

    addr
}

fn grpc_clients(uri: &str) -> GrpcClients {
    let client = TonicClient::connect_lazy(uri, Duration::from_secs(2)).unwrap();
    HashMap::from([(uri.to_string(), Arc::new(client) as Arc<dyn GrpcClient>)])
}

#[tokio::test]
async fn test_no_upstreams_returns_message() {
    let orchestrator = RequestOrchestrator::builder(config("web", "hello world", Vec::new()))
        .build()
        .unwrap();

    let handled = orchestrator.handle(inbound("/")).await;

    assert_eq!(handled.terminal, Terminal::Success);
    assert_eq!(handled.response.code, 200);
    assert_eq!(handled.response.body_str(), Some(r#""hello world""#));
    assert!(handled.response.upstream_calls.is_empty());
    assert!(handled.response.error.is_none());
}

#[tokio::test]
async fn test_full_error_rate_fails_first_call() {
    let orchestrator = RequestOrchestrator::builder(config("web", "hello world", Vec::new()))
        .injector(Arc::new(ErrorInjector::new(InjectorConfig {
            error_percentage: 1.0,
            error_type: "http_error".to_string(),
            error_code: 500,
            ..InjectorConfig::default()
        })))
        .build()
        .unwrap();

    let handled = orchestrator.handle(inbound("/")).await;

    assert_eq!(handled.terminal, Terminal::RejectedByInjection);
    assert_eq!(handled.response.code, 500);
    assert_eq!(
        handled.response.error.as_deref(),
        Some("Service error automatically injected")
    );
    assert!(handled.response.body.is_none());
}

#[tokio::test]
async fn test_http_upstream_is_keyed_by_uri() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"name":"upstream","body":"OK"}"#))
        .expect(1)
        .mount(&upstream)
        .await;

    let orchestrator = RequestOrchestrator::builder(config("web", "hello world", vec![upstream.uri()]))
        .http_client(http_client())
        .build()
        .unwrap();

    let handled = orchestrator.handle(inbound("/")).await;

    assert_eq!(handled.terminal, Terminal::Success);
    assert_eq!(handled.response.upstream_calls.len(), 1);

    let fragment = &handled.response.upstream_calls[&upstream.uri()];
    assert_eq!(fragment.name, "upstream");
    assert_eq!(fragment.uri, upstream.uri());
    assert_eq!(fragment.code, 200);
    assert_eq!(fragment.body_str(), Some(r#""OK""#));
}

#[tokio::test]
async fn test_readiness_gate_opens_after_delay() {
    let readiness = Arc::new(Readiness::new(Duration::from_millis(100), 200, 503));
    let orchestrator = RequestOrchestrator::builder(OrchestratorConfig {
        wait_till_ready: true,
        ..config("web", "hello world", Vec::new())
    })
    .readiness(readiness)
    .build()
    .unwrap();

    for _ in 0..3 {
        let handled = orchestrator.handle(inbound("/")).await;
        assert_eq!(handled.terminal, Terminal::RejectedNotReady);
        assert_eq!(handled.response.code, 503);
    }

    tokio::time::sleep(Duration::from_millis(120)).await;

    let handled = orchestrator.handle(inbound("/")).await;
    assert_eq!(handled.terminal, Terminal::Success);
    assert_eq!(handled.response.code, 200);
}

#[tokio::test]
async fn test_failing_upstream_keeps_sibling_results() {
    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"name":"healthy","code":200}"#))
        .mount(&healthy)
        .await;

    let broken = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string(r#"{"name":"broken","code":503}"#))
        .mount(&broken)
        .await;

    let orchestrator = RequestOrchestrator::builder(config("web", "hello world", vec![healthy.uri(), broken.uri()]))
        .http_client(http_client())
        .duration(RequestDuration::new(Duration::from_millis(30), Duration::ZERO, Duration::ZERO, 0))
        .build()
        .unwrap();

    let started = Instant::now();
    let handled = orchestrator.handle(inbound("/")).await;

    // the service time still applies on the failure path
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(handled.terminal, Terminal::FailedUpstream);
    assert_eq!(handled.response.code, 500);
    assert!(handled.response.body.is_none());
    assert!(handled
        .response
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("expected code 200, got 503"));

    let calls = &handled.response.upstream_calls;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[&healthy.uri()].code, 200);
    assert_eq!(calls[&broken.uri()].name, "broken");
    assert_eq!(calls[&broken.uri()].code, 503);
    assert!(calls[&broken.uri()].error.is_some());
}

#[tokio::test]
async fn test_unreachable_upstream_reports_minus_one() {
    let orchestrator = RequestOrchestrator::builder(config("web", "hello world", vec!["http://127.0.0.1:1".to_string()]))
        .http_client(http_client())
        .build()
        .unwrap();

    let handled = orchestrator.handle(inbound("/")).await;

    assert_eq!(handled.terminal, Terminal::FailedUpstream);
    assert_eq!(handled.response.upstream_calls["http://127.0.0.1:1"].code, -1);
}

#[tokio::test]
async fn test_generated_body_is_posted_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_bytes(b"payload".to_vec()))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"name":"sink"}"#))
        .expect(1)
        .mount(&upstream)
        .await;

    let orchestrator = RequestOrchestrator::builder(config("web", "hello world", vec![upstream.uri()]))
        .http_client(http_client())
        .request_generator(Arc::new(|| Some(Bytes::from_static(b"payload"))))
        .build()
        .unwrap();

    let handled = orchestrator.handle(inbound("/")).await;
    assert_eq!(handled.terminal, Terminal::Success);
}

#[tokio::test]
async fn test_inbound_path_is_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders/7"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"name":"orders"}"#))
        .expect(1)
        .mount(&upstream)
        .await;

    let orchestrator = RequestOrchestrator::builder(config("web", "hello world", vec![upstream.uri()]))
        .http_client(http_client())
        .build()
        .unwrap();

    let forward = fake_service::client::ForwardContext {
        path: "/orders/7".to_string(),
        ..Default::default()
    };
    let handled = orchestrator.handle(Inbound::http("/orders/7", forward)).await;

    assert_eq!(handled.terminal, Terminal::Success);
    assert_eq!(handled.response.upstream_calls[&upstream.uri()].name, "orders");
}

#[tokio::test]
async fn test_grpc_upstream_round_trip() {
    let currency = RequestOrchestrator::builder(config("currency", "rates", Vec::new()))
        .build()
        .unwrap();
    let addr = spawn_grpc(currency).await;
    let uri = format!("grpc://{}", addr);

    let orchestrator = RequestOrchestrator::builder(config("web", "hello world", vec![uri.clone()]))
        .grpc_clients(grpc_clients(&uri))
        .request_generator(Arc::new(FixedRequestGenerator::new("{}")))
        .build()
        .unwrap();

    let handled = orchestrator.handle(inbound("/")).await;

    assert_eq!(handled.terminal, Terminal::Success);
    let fragment = &handled.response.upstream_calls[&uri];
    assert_eq!(fragment.name, "currency");
    assert_eq!(fragment.uri, uri);
    assert_eq!(fragment.service_type, Some(ServiceType::Grpc));
    assert_eq!(fragment.body_str(), Some(r#""rates""#));
}

#[tokio::test]
async fn test_grpc_upstream_error_details_survive() {
    let currency = RequestOrchestrator::builder(config("currency", "rates", Vec::new()))
        .injector(Arc::new(ErrorInjector::new(InjectorConfig {
            error_percentage: 1.0,
            error_code: tonic::Code::Unavailable as i32,
            ..InjectorConfig::default()
        })))
        .build()
        .unwrap();
    let addr = spawn_grpc(currency).await;
    let uri = format!("grpc://{}", addr);

    let orchestrator = RequestOrchestrator::builder(config("web", "hello world", vec![uri.clone()]))
        .grpc_clients(grpc_clients(&uri))
        .build()
        .unwrap();

    let handled = orchestrator.handle(Inbound::grpc()).await;

    assert_eq!(handled.terminal, Terminal::FailedUpstream);
    assert_eq!(handled.response.code, tonic::Code::Internal as i32);

    let fragment = &handled.response.upstream_calls[&uri];
    // the name comes from the tree carried in the status details
    assert_eq!(fragment.name, "currency");
    assert_eq!(fragment.code, tonic::Code::Unavailable as i32);
    assert!(fragment.body.is_none());
    assert!(fragment
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Service error automatically injected"));
}

#[tokio::test]
async fn test_concurrent_requests_share_error_schedule() {
    let orchestrator = Arc::new(
        RequestOrchestrator::builder(config("web", "hello world", Vec::new()))
            .injector(Arc::new(ErrorInjector::new(InjectorConfig {
                error_percentage: 0.25,
                ..InjectorConfig::default()
            })))
            .build()
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for _ in 0..40 {
        let orchestrator = orchestrator.clone();
        tasks.push(tokio::spawn(async move { orchestrator.handle(Inbound::grpc()).await }));
    }

    let mut injected = 0;
    for task in tasks {
        let handled = tokio_test::assert_ok!(task.await);
        if handled.terminal == Terminal::RejectedByInjection {
            injected += 1;
        }
    }

    assert_eq!(injected, 10);
    assert_eq!(orchestrator.injector().request_count(), 40);
}
