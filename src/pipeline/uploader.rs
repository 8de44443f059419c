//! Response uploader: delivers results back to the control server.
//!
//! Single consumer of the result queue. Inline results go out as one
//! JSON POST; oversized results go out-of-band, either as a multipart
//! POST to the control server or through the presigned object-store
//! flow, per the active upload mode. Throttled and transient failures
//! retry on a bounded budget; permanent rejections and exhausted
//! budgets drop the task with a logged failure and a metrics event.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::AckStatus;
use crate::metrics::{self, MetricsEvent, UPLOAD_FAILURE, UPLOAD_SIZE_BYTES};
use crate::pipeline::RelayContext;
use crate::types::{Delivery, Task};

/// Drain the result queue until every sender is gone. During shutdown
/// that means: after the fetcher stops and the executor pool finishes
/// its in-flight work.
pub async fn run_uploader(ctx: Arc<RelayContext>, mut result_rx: mpsc::Receiver<Task>) {
    info!("uploader started");
    while let Some(task) = result_rx.recv().await {
        deliver(&ctx, task).await;
    }
    info!("uploader stopped");
}

/// Deliver one finished task. Consumes the task; its scratch file (if
/// any) is removed when the task drops at the end of this call.
pub async fn deliver(ctx: &RelayContext, mut task: Task) {
    match std::mem::take(&mut task.delivery) {
        Delivery::Inline => {
            ack_with_retry(ctx, &task, Payload::Inline).await;
        }
        Delivery::File { path, gzipped } => {
            let delivered = match ctx.upload_mode() {
                crate::config::UploadMode::Direct => {
                    ack_with_retry(ctx, &task, Payload::Multipart { path: &path, gzipped }).await
                }
                crate::config::UploadMode::Presigned => {
                    presigned_upload(ctx, &mut task, &path, gzipped).await
                }
            };
            if !delivered {
                // Last resort: acknowledge the failure inline so the
                // control server stops waiting on this task.
                task.record_agent_failure("Error: failed to upload result payload");
                ack_with_retry(ctx, &task, Payload::Inline).await;
            }
        }
    }
}

enum Payload<'a> {
    Inline,
    Multipart { path: &'a Path, gzipped: bool },
}

/// Post an acknowledgment with the configured retry budget. Returns
/// whether the control server accepted it.
async fn ack_with_retry(ctx: &RelayContext, task: &Task, payload: Payload<'_>) -> bool {
    let attempts = ctx.config.max_delivery_attempts;
    let mut delay = ctx.config.retry_delay;
    let mut last_failure = "network";

    for attempt in 1..=attempts {
        let result = match &payload {
            Payload::Inline => ctx.control.post_result(task).await,
            Payload::Multipart { path, gzipped } => {
                ctx.control.upload_file(task, path, *gzipped).await
            }
        };

        match result {
            Ok(AckStatus::Delivered) => {
                info!(task_id = %task.task_id, attempt, "task result delivered");
                return true;
            }
            Ok(AckStatus::Retryable { status }) => {
                warn!(task_id = %task.task_id, status, attempt, "delivery throttled or failed, will retry");
                last_failure = metrics::error_type_for_status(status).unwrap_or("server_error");
            }
            Ok(AckStatus::Rejected { status, body }) => {
                error!(task_id = %task.task_id, status, body, "control server rejected result");
                record_failure(ctx, task, "client_error");
                return false;
            }
            Err(e) => {
                warn!(task_id = %task.task_id, attempt, error = %e, "delivery attempt failed");
                last_failure = "network";
            }
        }

        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    error!(task_id = %task.task_id, attempts, "delivery retries exhausted, dropping task");
    record_failure(ctx, task, last_failure);
    false
}

/// Presigned flow: obtain a URL pair, PUT the payload to the object
/// store, then acknowledge with the signed GET URL. The URL fetch and
/// PUT retry as a unit; the final acknowledgment gets its own budget.
async fn presigned_upload(ctx: &RelayContext, task: &mut Task, path: &Path, gzipped: bool) -> bool {
    let attempts = ctx.config.max_delivery_attempts;
    let mut delay = ctx.config.retry_delay;

    for attempt in 1..=attempts {
        match push_to_store(ctx, task, path, gzipped).await {
            Ok(get_url) => {
                let size = std::fs::metadata(path).map_or(0.0, |m| m.len() as f64);
                ctx.metrics.record(
                    MetricsEvent::new(UPLOAD_SIZE_BYTES, size)
                        .with_tags(metrics::upload_tags(&task.task_id, "direct")),
                );
                task.s3_url = Some(get_url);
                return ack_with_retry(ctx, task, Payload::Inline).await;
            }
            Err(e) => {
                warn!(task_id = %task.task_id, attempt, error = %e, "object store upload failed");
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    error!(task_id = %task.task_id, attempts, "object store upload retries exhausted");
    record_failure(ctx, task, "network");
    false
}

async fn push_to_store(
    ctx: &RelayContext,
    task: &Task,
    path: &Path,
    gzipped: bool,
) -> crate::error::Result<String> {
    let file_name = format!("{}{}", task.task_id, uuid::Uuid::new_v4().simple());
    let pair = ctx.control.presigned_urls(&file_name).await?;

    let response_headers = task.response_headers.as_ref();
    let content_type = response_headers
        .and_then(|h| header_value(h, "content-type"));
    let content_encoding = if gzipped {
        Some("gzip")
    } else {
        response_headers.and_then(|h| header_value(h, "content-encoding"))
    };

    ctx.control
        .put_presigned(&pair.put_url, path, content_type, content_encoding)
        .await?;
    debug!(task_id = %task.task_id, "payload stored, acknowledging with signed URL");
    Ok(pair.get_url)
}

fn header_value<'a>(
    headers: &'a std::collections::HashMap<String, String>,
    name: &str,
) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn record_failure(ctx: &RelayContext, task: &Task, error_type: &str) {
    ctx.metrics.record(
        MetricsEvent::new(UPLOAD_FAILURE, 1.0)
            .with_tag("task_id", task.task_id.as_str())
            .with_tag("error_type", error_type),
    );
}
