//! End-to-end pipeline tests against a mock control server.
//!
//! Covers:
//! - Fetch → execute → inline acknowledgment round trip
//! - Inline/out-of-band boundary at exactly the threshold and one past it
//! - Target failures captured as task data, not pipeline errors
//! - Fetcher reactions: no-work idling, 5xx backoff, backpressure pause
//!   and resumption
//! - Multipart and presigned upload flows

use std::time::Duration;

use base64::Engine;
use mockito::Matcher;
use serde_json::json;
use tokio::sync::mpsc;
use url::Url;

use teleport_agent::pipeline::{deliver, execute, FetcherState, TaskFetcher};
use teleport_agent::{
    AgentConfig, Delivery, FetchOutcome, RelayContext, Task, UploadMode,
};

fn test_config(server_url: &str, dir: &tempfile::TempDir) -> AgentConfig {
    let mut config = AgentConfig {
        server_url: Some(Url::parse(server_url).unwrap()),
        api_key: Some("test-key".to_string()),
        retry_delay: Duration::from_millis(10),
        idle_sleep: Duration::from_millis(20),
        backpressure_pause: Duration::from_millis(50),
        scratch_dir: dir.path().join("scratch"),
        ..AgentConfig::default()
    };
    config.metrics.dir = dir.path().join("metrics");
    config.metrics.flush_interval = Duration::from_secs(600);
    config
}

fn task_for(url: &str) -> Task {
    serde_json::from_value(json!({
        "taskId": "t1",
        "url": url,
        "method": "GET"
    }))
    .unwrap()
}

#[tokio::test]
async fn test_inline_round_trip() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = RelayContext::new(test_config(&server.url(), &dir)).unwrap();

    let body = "0123456789";
    let get_task = server
        .mock("GET", "/api/http-teleport/get-task")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({"data": {
                "taskId": "t1",
                "url": format!("{}/svc/x", server.url()),
                "method": "GET"
            }})
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let target = server
        .mock("GET", "/svc/x")
        .with_status(200)
        .with_body(body)
        .expect(1)
        .create_async()
        .await;

    let outcome = ctx.control.fetch_task().await.unwrap();
    let FetchOutcome::Task(mut task) = outcome else {
        panic!("expected a task, got no work");
    };
    execute(&ctx, &mut task).await;

    let expected = base64::engine::general_purpose::STANDARD.encode(body);
    assert_eq!(task.status_code, Some(200));
    assert_eq!(task.response_base64, Some(true));
    assert_eq!(task.output.as_deref(), Some(expected.as_str()));
    assert!(matches!(task.delivery, Delivery::Inline));

    let put_result = server
        .mock("POST", "/api/http-teleport/put-result")
        .match_body(Matcher::PartialJson(json!({
            "taskId": "t1",
            "statusCode": 200,
            "responseBase64": true,
            "output": expected,
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    deliver(&ctx, *task).await;

    get_task.assert_async().await;
    target.assert_async().await;
    put_result.assert_async().await;
    assert!(ctx.metrics.buffered() > 0, "pipeline stages emit metrics");
}

#[tokio::test]
async fn test_inline_iff_size_at_most_threshold() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server.url(), &dir);
    config.inline_threshold = 64;
    let ctx = RelayContext::new(config).unwrap();

    let _at_threshold = server
        .mock("GET", "/svc/exact")
        .with_status(200)
        .with_body("a".repeat(64))
        .create_async()
        .await;
    let _past_threshold = server
        .mock("GET", "/svc/over")
        .with_status(200)
        .with_body("a".repeat(65))
        .create_async()
        .await;

    let mut task = task_for(&format!("{}/svc/exact", server.url()));
    execute(&ctx, &mut task).await;
    assert!(matches!(task.delivery, Delivery::Inline));
    assert_eq!(task.response_base64, Some(true));
    assert!(task.response_zipped.is_none());

    let mut task = task_for(&format!("{}/svc/over", server.url()));
    execute(&ctx, &mut task).await;
    match &task.delivery {
        Delivery::File { path, gzipped } => {
            assert!(*gzipped);
            assert!(path.exists());
        }
        Delivery::Inline => panic!("65 bytes with threshold 64 must go out-of-band"),
    }
    assert_eq!(task.response_zipped, Some(true));
    assert!(task.output.is_none());
}

#[tokio::test]
async fn test_empty_body_sets_no_output() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = RelayContext::new(test_config(&server.url(), &dir)).unwrap();

    let _target = server
        .mock("GET", "/svc/empty")
        .with_status(200)
        .create_async()
        .await;

    let mut task = task_for(&format!("{}/svc/empty", server.url()));
    execute(&ctx, &mut task).await;

    assert_eq!(task.status_code, Some(200));
    assert!(task.output.is_none());
    assert!(task.response_base64.is_none());
}

#[tokio::test]
async fn test_target_error_status_is_data_not_failure() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = RelayContext::new(test_config(&server.url(), &dir)).unwrap();

    let _target = server
        .mock("GET", "/svc/missing")
        .with_status(404)
        .with_body("not here")
        .create_async()
        .await;

    let mut task = task_for(&format!("{}/svc/missing", server.url()));
    execute(&ctx, &mut task).await;

    assert_eq!(task.status_code, Some(404));
    assert_eq!(
        task.output.as_deref(),
        Some(base64::engine::general_purpose::STANDARD.encode("not here").as_str())
    );
}

#[tokio::test]
async fn test_unreachable_target_captured_as_agent_failure() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = RelayContext::new(test_config(&server.url(), &dir)).unwrap();

    // Nothing listens on port 1.
    let mut task = task_for("http://127.0.0.1:1/unreachable");
    execute(&ctx, &mut task).await;

    assert_eq!(task.status_code, Some(500));
    let output = task.output.as_deref().unwrap();
    assert!(output.starts_with("Agent Side Error:"), "got: {output}");
    assert!(matches!(task.delivery, Delivery::Inline));

    // Still deliverable: the control server learns about the failure.
    let put_result = server
        .mock("POST", "/api/http-teleport/put-result")
        .match_body(Matcher::PartialJson(json!({"taskId": "t1", "statusCode": 500})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    deliver(&ctx, task).await;
    put_result.assert_async().await;
}

#[tokio::test]
async fn test_fetcher_idles_on_no_work() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.url(), &dir);
    let idle_sleep = config.idle_sleep;
    let ctx = RelayContext::new(config).unwrap();

    let _get_task = server
        .mock("GET", "/api/http-teleport/get-task")
        .with_status(204)
        .create_async()
        .await;

    let (task_tx, _task_rx) = mpsc::channel(16);
    let (result_tx, _result_rx) = mpsc::channel(100);
    let mut fetcher = TaskFetcher::new(ctx, task_tx, result_tx);

    let pause = fetcher.poll_once().await;
    assert_eq!(pause, Some(idle_sleep));
    assert_eq!(fetcher.state(), FetcherState::IdleNoWork);
}

#[tokio::test]
async fn test_fetcher_backs_off_exponentially_on_5xx() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = RelayContext::new(test_config(&server.url(), &dir)).unwrap();

    let _get_task = server
        .mock("GET", "/api/http-teleport/get-task")
        .with_status(502)
        .create_async()
        .await;

    let (task_tx, _task_rx) = mpsc::channel(16);
    let (result_tx, _result_rx) = mpsc::channel(100);
    let mut fetcher = TaskFetcher::new(ctx, task_tx, result_tx);

    assert_eq!(fetcher.poll_once().await, Some(Duration::from_secs(5)));
    assert_eq!(fetcher.state(), FetcherState::Backoff);
    assert_eq!(fetcher.poll_once().await, Some(Duration::from_secs(10)));
    assert_eq!(fetcher.poll_once().await, Some(Duration::from_secs(20)));
}

#[tokio::test]
async fn test_backpressure_pauses_then_resumes() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.url(), &dir);
    let ctx = RelayContext::new(config).unwrap();

    // Only the post-drain poll may reach the control server.
    let get_task = server
        .mock("GET", "/api/http-teleport/get-task")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let (task_tx, _task_rx) = mpsc::channel(16);
    let capacity = ctx.config.result_queue_capacity;
    let (result_tx, mut result_rx) = mpsc::channel(capacity);

    // Fill to 85% with threshold at 80%.
    for i in 0..85 {
        result_tx.send(task_for(&format!("http://x/{i}"))).await.unwrap();
    }

    let mut fetcher = TaskFetcher::new(ctx.clone(), task_tx, result_tx);
    let pause = fetcher.poll_once().await;
    assert_eq!(pause, Some(ctx.config.backpressure_pause));
    assert_eq!(fetcher.state(), FetcherState::Backpressured);

    // Drain to 70%; fetching resumes and actually polls.
    for _ in 0..15 {
        result_rx.recv().await.unwrap();
    }
    fetcher.poll_once().await;
    assert_eq!(fetcher.state(), FetcherState::IdleNoWork);
    get_task.assert_async().await;
}

#[tokio::test]
async fn test_oversized_payload_multipart_upload() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server.url(), &dir);
    config.inline_threshold = 64;
    config.upload_mode = UploadMode::Direct;
    let ctx = RelayContext::new(config).unwrap();

    let _target = server
        .mock("GET", "/svc/big")
        .with_status(200)
        .with_body("b".repeat(4096))
        .create_async()
        .await;
    let upload = server
        .mock("POST", "/api/http-teleport/upload-result")
        .match_header(
            "content-type",
            Matcher::Regex("multipart/form-data.*".to_string()),
        )
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let mut task = task_for(&format!("{}/svc/big", server.url()));
    execute(&ctx, &mut task).await;
    assert!(matches!(task.delivery, Delivery::File { gzipped: true, .. }));

    deliver(&ctx, task).await;
    upload.assert_async().await;
}

#[tokio::test]
async fn test_oversized_payload_presigned_flow() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server.url(), &dir);
    config.inline_threshold = 64;
    config.upload_mode = UploadMode::Presigned;
    let ctx = RelayContext::new(config).unwrap();

    let _target = server
        .mock("GET", "/svc/big")
        .with_status(200)
        .with_header("content-type", "text/csv")
        .with_body("c".repeat(4096))
        .create_async()
        .await;
    let signed = server
        .mock("GET", "/api/http-teleport/upload-url")
        .match_query(Matcher::Regex("fileName=t1".to_string()))
        .with_status(200)
        .with_body(
            json!({"data": {
                "putUrl": format!("{}/store/obj", server.url()),
                "getUrl": "https://store.example.com/obj?signature=abc",
            }})
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let store_put = server
        .mock("PUT", "/store/obj")
        .match_header("content-encoding", "gzip")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let put_result = server
        .mock("POST", "/api/http-teleport/put-result")
        .match_body(Matcher::PartialJson(json!({
            "taskId": "t1",
            "s3Url": "https://store.example.com/obj?signature=abc",
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let mut task = task_for(&format!("{}/svc/big", server.url()));
    execute(&ctx, &mut task).await;
    deliver(&ctx, task).await;

    signed.assert_async().await;
    store_put.assert_async().await;
    put_result.assert_async().await;
}
