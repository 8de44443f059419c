//! The task: one queued instruction plus its eventual outcome.
//!
//! A task is created when fetched from the control server, mutated exactly
//! once by the executor to attach the response, consumed exactly once by the
//! uploader, and discarded after acknowledgment. Ownership transfers at each
//! queue boundary; no stage touches a task after handing it on.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::TempPath;

use crate::error::{Error, Result};

/// One relay instruction and, after execution, its outcome.
///
/// Field names follow the control-server wire protocol (camelCase JSON).
/// Response-side fields stay unset until the executor fills them in;
/// unset fields are omitted from the acknowledgment payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Immutable task identifier assigned by the control server.
    pub task_id: String,

    /// Target URL inside the private network.
    pub url: String,

    /// HTTP method for the target request.
    pub method: String,

    /// Headers to send with the target request.
    #[serde(default)]
    pub request_headers: HashMap<String, String>,

    /// Request body. String values pass through as UTF-8; any other JSON
    /// value is serialized before sending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,

    /// Expiry timestamp (epoch milliseconds). Bounds the target request
    /// deadline; the configured timeout still applies as a ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_ts_ms: Option<i64>,

    /// Optional agent settings piggybacked on the task by the control
    /// server, applied before execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_config: Option<GlobalConfig>,

    /// Agent version, stamped when the task is fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Headers returned by the target service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HashMap<String, String>>,

    /// Status code returned by the target service, or 500 for
    /// agent-side failures (network error, timeout).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    /// Set when `output` carries the base64-encoded response body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_base64: Option<bool>,

    /// Set when the out-of-band payload was gzip-compressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_zipped: Option<bool>,

    /// Inline response payload (base64), or an error description for
    /// agent-side failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Signed object-store GET URL, set after a presigned upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_url: Option<String>,

    /// Delivery decision made by the executor. Never serialized; the
    /// scratch file (if any) is removed when the task is dropped.
    #[serde(skip)]
    pub delivery: Delivery,
}

/// How the executor decided the result should reach the control server.
#[derive(Debug, Default)]
pub enum Delivery {
    /// Response is embedded in the acknowledgment payload.
    #[default]
    Inline,
    /// Response exceeded the inline threshold and waits on disk for an
    /// out-of-band upload.
    File {
        /// Scratch file holding the payload; deleted on drop.
        path: TempPath,
        /// Whether the file was gzip-compressed.
        gzipped: bool,
    },
}

impl Task {
    /// Validate request fields at the queue boundary.
    ///
    /// Rejects tasks the executor could not act on: empty identifier,
    /// unparseable URL, or a method reqwest would refuse.
    pub fn validate(&self) -> Result<()> {
        if self.task_id.is_empty() {
            return Err(Error::InvalidTask("empty taskId".to_string()));
        }
        if url::Url::parse(&self.url).is_err() {
            return Err(Error::InvalidTask(format!(
                "task {} has unparseable url {:?}",
                self.task_id, self.url
            )));
        }
        if reqwest::Method::from_bytes(self.method.to_uppercase().as_bytes()).is_err() {
            return Err(Error::InvalidTask(format!(
                "task {} has invalid method {:?}",
                self.task_id, self.method
            )));
        }
        Ok(())
    }

    /// Request body as bytes, if any.
    pub fn body_bytes(&self) -> Option<Vec<u8>> {
        match &self.input {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone().into_bytes()),
            Some(other) => serde_json::to_vec(other).ok(),
        }
    }

    /// Remaining time until `expiryTsMs`, if the task carries one and it
    /// is still in the future.
    pub fn remaining_until_expiry(&self, now_ms: i64) -> Option<Duration> {
        let expiry = self.expiry_ts_ms?;
        let remaining = expiry.saturating_sub(now_ms);
        (remaining > 0).then(|| Duration::from_millis(remaining as u64))
    }

    /// Host portion of the target URL, for metric tags.
    pub fn target_domain(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Capture an agent-side failure (network error, timeout, stream
    /// abort) into the task's outcome fields. The control server sees a
    /// 500 with a description instead of waiting forever.
    pub fn record_agent_failure(&mut self, detail: impl std::fmt::Display) {
        self.status_code = Some(500);
        self.output = Some(format!("Agent Side Error: {detail}"));
        self.response_base64 = None;
        self.delivery = Delivery::Inline;
    }
}

/// Dynamic agent settings the control server may attach to a task.
///
/// Applied live: rate-limiter limits swap under their lock, the upload
/// mode swaps atomically. Anything requiring a client rebuild is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// New control-server request budget, per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_min: Option<u32>,

    /// Switch between direct multipart upload and the presigned-URL flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_direct: Option<bool>,
}

/// Result of one poll against the control server.
#[derive(Debug)]
pub enum FetchOutcome {
    /// A task was dequeued for this agent.
    Task(Box<Task>),
    /// No work queued (204, or 200 with null data).
    NoWork,
}
