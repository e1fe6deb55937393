//! Exercises the webhook result handler against a live HTTP receiver — no
//! mocking library, just a raw `TcpListener` that reads a request and
//! answers 200, mirroring how a customer's webhook endpoint would behave.
//!
//! Requires `--features test-util` for [`batch_core::engine::MockEngine`].

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use batch_core::blobstore::FileBlobStore;
use batch_core::config::Config;
use batch_core::db::Database;
use batch_core::engine::MockEngine;
use batch_core::handlers::webhook::WebhookHandler;
use batch_core::handlers::HandlerRegistry;
use batch_core::models::{BatchStatus, FileObject, FilePurpose, WorkerHeartbeat, ENDPOINT_CHAT_COMPLETIONS};
use batch_core::worker::Worker;

/// Accepts exactly one connection, reads the request, and replies 200. The
/// request body (if any follows a `Content-Length` header) is returned to
/// the caller so it can assert on the delivered payload.
async fn accept_one_and_reply_ok(listener: TcpListener) -> String {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut buf = vec![0_u8; 64 * 1024];
    let n = socket.read(&mut buf).await.unwrap();
    socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await.unwrap();
    socket.shutdown().await.unwrap();
    String::from_utf8_lossy(&buf[..n]).to_string()
}

#[tokio::test]
async fn test_batch_completion_delivers_webhook_to_a_live_receiver() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let receiver = tokio::spawn(accept_one_and_reply_ok(listener));

    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(":memory:").await.unwrap();
    let blobs = FileBlobStore::new(dir.path()).unwrap();
    let mut config = Config::from_env().unwrap();
    config.chunk_size = 10;
    let heartbeat = Arc::new(RwLock::new(WorkerHeartbeat::new()));
    let engine = Arc::new(MockEngine { fail_model: None });

    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(WebhookHandler::new(1, std::time::Duration::from_secs(5))));
    let worker = Worker::new(db.clone(), blobs.clone(), config, heartbeat, engine, handlers, 16.0);

    let input_id = "file-webhook-in";
    let file = FileObject::new(input_id.to_string(), FilePurpose::Batch, "in.jsonl".into(), 0, "".into());
    db.create_file(&file).await.unwrap();
    let line = serde_json::json!({
        "custom_id": "r0",
        "method": "POST",
        "url": ENDPOINT_CHAT_COMPLETIONS,
        "body": {"model": "test-model", "messages": []},
    });
    blobs.put(input_id, format!("{line}\n").as_bytes()).await.unwrap();

    let mut metadata = std::collections::HashMap::new();
    metadata.insert("webhook_url".to_string(), serde_json::json!(format!("http://{addr}/hook")));
    let batch = batch_core::models::BatchJob {
        id: batch_core::ids::new_batch_id(),
        object: "batch",
        endpoint: ENDPOINT_CHAT_COMPLETIONS.into(),
        input_file_id: input_id.to_string(),
        output_file_id: None,
        error_file_id: None,
        status: BatchStatus::Validating,
        request_counts: batch_core::models::RequestCounts { total: 1, completed: 0, failed: 0 },
        metadata,
        created_at: 0,
        in_progress_at: None,
        finalizing_at: None,
        completed_at: None,
        failed_at: None,
        expired_at: None,
        cancelling_at: None,
        cancelled_at: None,
        expires_at: 86_400,
        errors: None,
    };
    db.create_batch(&batch).await.unwrap();

    worker.process_batch(&batch.id).await.unwrap();

    let finished = db.get_batch(&batch.id).await.unwrap().unwrap();
    assert_eq!(finished.status, BatchStatus::Completed);

    let request = tokio::time::timeout(std::time::Duration::from_secs(5), receiver).await.unwrap().unwrap();
    assert!(request.starts_with("POST /hook"), "unexpected request line: {request}");
}
