mod common;

use common::*;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use snapsort_lib::events::{EventBus, TransferEvent};
use snapsort_lib::server::ImageServer;
use std::time::Duration;

#[tokio::test]
async fn test_get_reports_active_status() {
    let dir = setup_temp_dir();
    let (server, _rx) = start_server(&dir).await;

    let response = reqwest::get(url(server.local_addr())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "active");
    assert_eq!(body["version"], "1.0.0");
    assert!(body["serverTime"].is_string());
    assert_eq!(body["endpoints"]["post"], "/upload");
    assert_eq!(body["endpoints"]["get"], "/status");

    server.shutdown().await;
}

#[tokio::test]
async fn test_options_preflight_and_unsupported_method() {
    let dir = setup_temp_dir();
    let (server, _rx) = start_server(&dir).await;
    let client = reqwest::Client::new();

    let preflight = client
        .request(Method::OPTIONS, url(server.local_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        preflight.headers()["access-control-allow-methods"],
        "GET, POST, OPTIONS"
    );
    assert_eq!(
        preflight.headers()["access-control-allow-headers"],
        "Content-Type"
    );
    assert!(preflight.bytes().await.unwrap().is_empty());

    let put = client
        .put(url(server.local_addr()))
        .body("ignored")
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(put.headers()["access-control-allow-origin"], "*");
    let body: Value = put.json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "method not supported");

    server.shutdown().await;
}

#[tokio::test]
async fn test_post_batch_writes_files() {
    let dir = setup_temp_dir();
    let (server, mut rx) = start_server(&dir).await;

    let response = reqwest::Client::new()
        .post(format!("{}upload", url(server.local_addr())))
        .body(SCENARIO.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");

    assert_eq!(std::fs::read(dir.path().join("a.jpg")).unwrap(), b"AAAAA");
    assert_eq!(std::fs::read(dir.path().join("b.jpg")).unwrap(), b"BBB");

    let completed: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            TransferEvent::Complete(info) => Some(info.file_name),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec!["a.jpg", "b.jpg"]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_byte_at_a_time_upload_matches_contiguous() {
    let dir = setup_temp_dir();
    let (server, mut rx) = start_server(&dir).await;

    let response = post_in_chunks(server.local_addr(), SCENARIO, 1).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);

    assert_eq!(std::fs::read(dir.path().join("a.jpg")).unwrap(), b"AAAAA");
    assert_eq!(std::fs::read(dir.path().join("b.jpg")).unwrap(), b"BBB");

    let events = drain(&mut rx);
    let starts = events
        .iter()
        .filter(|e| matches!(e, TransferEvent::Start(_)))
        .count();
    let completes = events
        .iter()
        .filter(|e| matches!(e, TransferEvent::Complete(_)))
        .count();
    assert_eq!((starts, completes), (2, 2));
    assert!(!events.iter().any(|e| matches!(e, TransferEvent::Error(_))));

    server.shutdown().await;
}

#[tokio::test]
async fn test_truncated_batch_returns_500_and_server_keeps_running() {
    let dir = setup_temp_dir();
    let (server, mut rx) = start_server(&dir).await;
    let client = reqwest::Client::new();

    let response = client
        .post(url(server.local_addr()))
        .body(b"1\npart.jpg\n2024-01-01\n10\nabcd".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "error");

    let events = drain(&mut rx);
    assert!(!events.iter().any(|e| matches!(e, TransferEvent::Complete(_))));
    assert!(matches!(events.last(), Some(TransferEvent::Error(_))));

    // Still serving
    let status = client.get(url(server.local_addr())).send().await.unwrap();
    assert_eq!(status.status(), StatusCode::OK);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unparseable_count_is_empty_batch() {
    let dir = setup_temp_dir();
    let (server, mut rx) = start_server(&dir).await;

    let response = reqwest::Client::new()
        .post(url(server.local_addr()))
        .body("abc\n")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(drain(&mut rx).is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_port_is_released_after_shutdown() {
    let dir = setup_temp_dir();
    let (server, _rx) = start_server(&dir).await;
    let addr = server.local_addr();
    server.shutdown_with_grace(Duration::from_secs(1)).await;

    let again = ImageServer::start(addr, dir.path().to_path_buf(), EventBus::new())
        .await
        .expect("port should be free again");
    assert_eq!(again.local_addr(), addr);
    again.shutdown().await;
}
