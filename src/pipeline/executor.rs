//! Request executor: runs target requests and decides delivery.
//!
//! A pool of identical workers drains the task queue. Each worker
//! executes the instruction against the target service, streams the
//! response body to a scratch file chunk by chunk (bodies of any size
//! never materialize in memory), then picks inline or out-of-band
//! delivery from the final byte count. A failing target is not an error
//! here: the failure is captured into the task so the uploader still
//! reports it.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use tempfile::{NamedTempFile, TempPath};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::metrics::{self, MetricsEvent, TASK_PROCESSING_DURATION_MS, UPLOAD_SIZE_BYTES};
use crate::pipeline::RelayContext;
use crate::types::{Delivery, Task};

/// Identity endpoints that issue tokens expect form encoding even when
/// the instruction says otherwise.
const FORM_ENCODED_TOKEN_PATH: &str = "/auth/identity/connect/token";

/// Worker loop: dequeue, execute, hand the result on. Exits when the
/// task queue closes; the held result sender drops with it, which is
/// what lets the uploader finish during shutdown.
pub async fn run_worker(
    ctx: Arc<RelayContext>,
    id: usize,
    task_rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    result_tx: mpsc::Sender<Task>,
) {
    debug!(worker = id, "executor started");
    loop {
        let task = {
            let mut rx = task_rx.lock().await;
            rx.recv().await
        };
        let Some(mut task) = task else { break };

        execute(&ctx, &mut task).await;
        if result_tx.send(task).await.is_err() {
            warn!(worker = id, "result queue closed, dropping completed task");
            break;
        }
    }
    debug!(worker = id, "executor stopped");
}

/// Execute one task against its target service and attach the outcome.
///
/// Never fails upward: network errors, timeouts, and stream aborts end
/// up in the task's outcome fields with a 500 status, so the task is
/// never dropped silently.
pub async fn execute(ctx: &RelayContext, task: &mut Task) {
    info!(task_id = %task.task_id, method = %task.method, url = %task.url, "processing task");
    let started = Instant::now();

    if let Err(detail) = perform(ctx, task).await {
        warn!(task_id = %task.task_id, error = %detail, "target request failed");
        task.record_agent_failure(detail);
    }

    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    ctx.metrics.record(
        MetricsEvent::new(TASK_PROCESSING_DURATION_MS, duration_ms).with_tags(
            metrics::task_processing_tags(&task.task_id, &task.method, &task.url, task.status_code),
        ),
    );
}

async fn perform(ctx: &RelayContext, task: &mut Task) -> Result<(), String> {
    let method = reqwest::Method::from_bytes(task.method.to_uppercase().as_bytes())
        .map_err(|_| format!("Error: invalid method {:?}", task.method))?;
    let headers = build_headers(task);
    let deadline = task
        .remaining_until_expiry(chrono::Utc::now().timestamp_millis())
        .map_or(ctx.config.target_timeout, |left| {
            left.min(ctx.config.target_timeout)
        });

    let mut request = ctx
        .target_http
        .request(method, &task.url)
        .headers(headers)
        .timeout(deadline);
    if let Some(body) = task.body_bytes() {
        request = request.body(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| format!("Network error: {e}"))?;

    task.status_code = Some(response.status().as_u16());
    task.response_headers = Some(collect_headers(response.headers()));
    debug!(task_id = %task.task_id, status = response.status().as_u16(), "target responded");

    let scratch = spool_body(ctx, response)
        .await
        .map_err(|e| format!("Network error: {e}"))?;
    let size = std::fs::metadata(&scratch)
        .map_err(|e| format!("Error: {e}"))?
        .len();
    debug!(task_id = %task.task_id, size, "response spooled");

    if size <= ctx.config.inline_threshold {
        attach_inline(ctx, task, &scratch, size).await?;
    } else {
        attach_file(ctx, task, scratch, size).await;
    }
    Ok(())
}

/// Stream the response body to a scratch file in chunks.
async fn spool_body(
    ctx: &RelayContext,
    response: reqwest::Response,
) -> Result<TempPath, Box<dyn std::error::Error + Send + Sync>> {
    let scratch = NamedTempFile::new_in(&ctx.config.scratch_dir)?.into_temp_path();
    let mut file = tokio::fs::File::create(&scratch).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(scratch)
}

/// Small payload: base64 into the acknowledgment itself. Empty bodies
/// set neither `output` nor the encoding flag.
async fn attach_inline(
    ctx: &RelayContext,
    task: &mut Task,
    scratch: &Path,
    size: u64,
) -> Result<(), String> {
    if size > 0 {
        let data = tokio::fs::read(scratch)
            .await
            .map_err(|e| format!("Error: {e}"))?;
        task.output = Some(base64::engine::general_purpose::STANDARD.encode(data));
        task.response_base64 = Some(true);
    }
    task.delivery = Delivery::Inline;
    ctx.metrics.record(
        MetricsEvent::new(UPLOAD_SIZE_BYTES, size as f64)
            .with_tags(metrics::upload_tags(&task.task_id, "inline")),
    );
    Ok(())
}

/// Oversized payload: gzip the scratch file and mark the task for
/// out-of-band upload. A compression failure falls back to the raw file
/// rather than failing the task; `responseZipped` records which was kept.
async fn attach_file(ctx: &RelayContext, task: &mut Task, scratch: TempPath, size: u64) {
    debug!(task_id = %task.task_id, size, threshold = ctx.config.inline_threshold, "payload exceeds inline threshold");

    let scratch_dir = ctx.config.scratch_dir.clone();
    let chunk_size = ctx.config.stream_chunk_size;
    let source = scratch.to_path_buf();
    let compressed =
        tokio::task::spawn_blocking(move || gzip_file(&source, &scratch_dir, chunk_size)).await;

    match compressed {
        Ok(Ok(gz_path)) => {
            task.response_zipped = Some(true);
            task.delivery = Delivery::File {
                path: gz_path,
                gzipped: true,
            };
        }
        Ok(Err(e)) => {
            warn!(task_id = %task.task_id, error = %e, "compression failed, uploading raw payload");
            task.response_zipped = Some(false);
            task.delivery = Delivery::File {
                path: scratch,
                gzipped: false,
            };
        }
        Err(e) => {
            warn!(task_id = %task.task_id, error = %e, "compression task aborted, uploading raw payload");
            task.response_zipped = Some(false);
            task.delivery = Delivery::File {
                path: scratch,
                gzipped: false,
            };
        }
    }
}

fn gzip_file(source: &Path, dir: &Path, chunk_size: usize) -> std::io::Result<TempPath> {
    let mut input = std::fs::File::open(source)?;
    let output = NamedTempFile::new_in(dir)?;
    let mut encoder = GzEncoder::new(output.reopen()?, Compression::default());

    let mut buffer = vec![0u8; chunk_size];
    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        encoder.write_all(&buffer[..read])?;
    }
    encoder.finish()?;
    Ok(output.into_temp_path())
}

fn build_headers(task: &Task) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &task.request_headers {
        match (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!(task_id = %task.task_id, header = %name, "skipping unrepresentable header"),
        }
    }
    if task.url.contains(FORM_ENCODED_TOKEN_PATH) {
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
    }
    headers
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect()
}
