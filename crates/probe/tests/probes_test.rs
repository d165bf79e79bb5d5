use std::net::SocketAddr;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use devstack_probe::{DefaultProbeFactory, Probe, ProbeFactory, ProbeSpec, ProbeStatus, TcpProbe};
use tokio::net::TcpListener;

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server failed");
    });

    addr
}

/// Answers `/health` with a fixed status.
async fn serve_status(status: StatusCode) -> String {
    let addr = serve(Router::new().route("/health", get(move || async move { status }))).await;

    format!("http://{addr}/health")
}

#[tokio::test]
async fn test_tcp_probe_ready_when_listening() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let probe = TcpProbe::new(listener.local_addr().unwrap().to_string());

    assert_eq!(probe.check().await, ProbeStatus::Ready);
}

#[tokio::test]
async fn test_tcp_probe_not_ready_when_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let probe = TcpProbe::new(address);

    assert!(matches!(probe.check().await, ProbeStatus::NotReady(_)));
}

#[tokio::test]
async fn test_http_probe_accepts_success() {
    let url = serve_status(StatusCode::OK).await;
    let probe = DefaultProbeFactory
        .build(
            "graph-node",
            &ProbeSpec::Http {
                url,
                expect_status: None,
            },
        )
        .unwrap();

    assert_eq!(probe.check().await, ProbeStatus::Ready);
}

#[tokio::test]
async fn test_http_probe_rejects_unavailable() {
    let url = serve_status(StatusCode::SERVICE_UNAVAILABLE).await;
    let probe = DefaultProbeFactory
        .build(
            "graph-node",
            &ProbeSpec::Http {
                url,
                expect_status: None,
            },
        )
        .unwrap();

    match probe.check().await {
        ProbeStatus::NotReady(reason) => assert!(reason.contains("503")),
        ProbeStatus::Ready => panic!("503 must not be ready"),
    }
}

#[tokio::test]
async fn test_http_probe_matches_expected_status() {
    let url = serve_status(StatusCode::METHOD_NOT_ALLOWED).await;
    let probe = DefaultProbeFactory
        .build(
            "ipfs",
            &ProbeSpec::Http {
                url,
                expect_status: Some(405),
            },
        )
        .unwrap();

    assert_eq!(probe.check().await, ProbeStatus::Ready);
}

#[tokio::test]
async fn test_exec_probe_follows_exit_code() {
    let ready = DefaultProbeFactory
        .build(
            "store",
            &ProbeSpec::Exec {
                program: "true".to_string(),
                args: vec![],
            },
        )
        .unwrap();
    assert_eq!(ready.check().await, ProbeStatus::Ready);

    let not_ready = DefaultProbeFactory
        .build(
            "store",
            &ProbeSpec::Exec {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), "echo no response >&2; exit 2".to_string()],
            },
        )
        .unwrap();

    match not_ready.check().await {
        ProbeStatus::NotReady(reason) => assert!(reason.contains("no response")),
        ProbeStatus::Ready => panic!("exit code 2 must not be ready"),
    }
}

#[tokio::test]
async fn test_exec_probe_missing_program_is_not_ready() {
    let probe = DefaultProbeFactory
        .build(
            "store",
            &ProbeSpec::Exec {
                program: "devstack-no-such-program".to_string(),
                args: vec![],
            },
        )
        .unwrap();

    assert!(matches!(probe.check().await, ProbeStatus::NotReady(_)));
}
