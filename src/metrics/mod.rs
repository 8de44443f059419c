//! Buffered metrics with rotating file output.
//!
//! Every pipeline stage hands events to a shared [`MetricsRecorder`];
//! nothing flows back. Events buffer in memory and flush to a per-instance
//! JSONL file either when the buffer fills or on a fixed cadence,
//! whichever comes first. The file rotates daily (date-suffixed rename)
//! and expired files are pruned opportunistically.
//!
//! Everything here is fail-open: an I/O error is logged at low severity
//! and never reaches, or interrupts, task processing.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MetricsConfig;

/// Duration of an HTTP call made by the agent, tagged by operation.
pub const HTTP_REQUEST_DURATION_MS: &str = "http.request.duration_ms";
/// End-to-end execution time for one task.
pub const TASK_PROCESSING_DURATION_MS: &str = "task.processing_duration_ms";
/// Payload size delivered, tagged inline vs direct.
pub const UPLOAD_SIZE_BYTES: &str = "upload.size_bytes";
/// Result delivery that exhausted its retry budget.
pub const UPLOAD_FAILURE: &str = "upload.failure";

/// One observability event, serialized as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsEvent {
    /// Epoch milliseconds at which the event was recorded.
    #[serde(rename = "@timestamp")]
    pub timestamp: i64,
    /// Metric name, dot-separated.
    pub metric_name: String,
    /// Numeric value.
    pub value: f64,
    /// Flat tag map for grouping and filtering.
    pub tags: HashMap<String, String>,
}

impl MetricsEvent {
    /// Create an event stamped with the current time.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            metric_name: name.into(),
            value,
            tags: HashMap::new(),
        }
    }

    /// Add a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a batch of tags.
    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags.extend(tags);
        self
    }
}

/// Handle for recording metrics. Cheap to clone; all clones share one
/// buffer. [`MetricsRecorder::disabled`] produces a no-op recorder.
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    buffer: Option<Arc<Buffer>>,
}

#[derive(Debug)]
struct Buffer {
    config: MetricsConfig,
    file_name: String,
    state: Mutex<BufferState>,
}

#[derive(Debug)]
struct BufferState {
    events: Vec<MetricsEvent>,
    current_date: NaiveDate,
}

impl MetricsRecorder {
    /// Create a recorder writing `metrics{index}.json` under the
    /// configured directory.
    ///
    /// Directory creation failure disables the recorder rather than
    /// failing the agent.
    pub fn new(config: MetricsConfig, agent_index: &str) -> Self {
        if let Err(e) = fs::create_dir_all(&config.dir) {
            warn!(dir = %config.dir.display(), error = %e, "metrics directory unavailable, metrics disabled");
            return Self::disabled();
        }
        let buffer = Buffer {
            file_name: format!("metrics{agent_index}.json"),
            config,
            state: Mutex::new(BufferState {
                events: Vec::new(),
                current_date: Local::now().date_naive(),
            }),
        };
        Self {
            buffer: Some(Arc::new(buffer)),
        }
    }

    /// A recorder that drops every event.
    pub fn disabled() -> Self {
        Self { buffer: None }
    }

    /// Record one event. Flushes inline when the buffer reaches its size
    /// threshold.
    pub fn record(&self, event: MetricsEvent) {
        let Some(buffer) = &self.buffer else { return };
        let mut state = buffer.state.lock();
        state.events.push(event);
        if state.events.len() >= buffer.config.buffer_size {
            buffer.flush_locked(&mut state);
        }
    }

    /// Flush buffered events to disk now.
    pub fn flush(&self) {
        if let Some(buffer) = &self.buffer {
            let mut state = buffer.state.lock();
            buffer.flush_locked(&mut state);
        }
    }

    /// Final flush on shutdown. Synchronous so buffered events present at
    /// signal time are persisted before the process exits.
    pub fn shutdown(&self) {
        self.flush();
    }

    /// Number of events currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer
            .as_ref()
            .map_or(0, |b| b.state.lock().events.len())
    }

    /// Spawn the periodic flusher. Runs until cancelled, then performs a
    /// last flush before returning.
    pub fn spawn_flusher(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let recorder = self.clone();
        let interval = recorder
            .buffer
            .as_ref()
            .map_or(std::time::Duration::from_secs(10), |b| {
                b.config.flush_interval
            });
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => recorder.flush(),
                }
            }
            recorder.flush();
        })
    }
}

impl Buffer {
    fn current_path(&self) -> PathBuf {
        self.config.dir.join(&self.file_name)
    }

    fn flush_locked(&self, state: &mut BufferState) {
        let today = Local::now().date_naive();
        if today != state.current_date {
            self.rotate(state.current_date);
            state.current_date = today;
        }
        if state.events.is_empty() {
            return;
        }
        let events = std::mem::take(&mut state.events);
        if let Err(e) = self.append(&events) {
            debug!(error = %e, "metrics flush failed, {} events dropped", events.len());
        }
    }

    fn append(&self, events: &[MetricsEvent]) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        let mut lines = String::new();
        for event in events {
            match serde_json::to_string(event) {
                Ok(line) => {
                    lines.push_str(&line);
                    lines.push('\n');
                }
                Err(e) => debug!(error = %e, "unserializable metrics event dropped"),
            }
        }
        file.write_all(lines.as_bytes())
    }

    /// Rename the active file with the date it covered and prune expired
    /// rotations.
    fn rotate(&self, covered: NaiveDate) {
        let current = self.current_path();
        if current.exists() {
            let rotated = self
                .config
                .dir
                .join(format!("{}.{}", self.file_name, covered.format("%Y-%m-%d")));
            if let Err(e) = fs::rename(&current, &rotated) {
                debug!(error = %e, "metrics rotation failed");
            }
        }
        self.prune();
    }

    fn prune(&self) {
        let Ok(entries) = fs::read_dir(&self.config.dir) else {
            return;
        };
        let cutoff = Local::now().date_naive()
            - chrono::Days::new(u64::from(self.config.retention_days));
        let prefix = format!("{}.", self.file_name);
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(suffix, "%Y-%m-%d") else {
                continue;
            };
            if date < cutoff {
                if let Err(e) = fs::remove_file(entry.path()) {
                    debug!(file = name, error = %e, "metrics retention cleanup failed");
                }
            }
        }
    }
}

/// Strip query and fragment from a URL so tags never leak parameters;
/// also extract the host for the domain tag.
pub(crate) fn sanitize_url(raw: &str) -> (String, String) {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            let domain = parsed
                .host_str()
                .map_or_else(|| "unknown".to_string(), str::to_string);
            (parsed.to_string(), domain)
        }
        Err(_) => ("unknown".to_string(), "unknown".to_string()),
    }
}

/// Tags for an `http.request.duration_ms` event.
pub(crate) fn http_request_tags(
    task_id: &str,
    operation: &str,
    raw_url: &str,
    method: &str,
    status: Option<u16>,
) -> HashMap<String, String> {
    let (clean_url, domain) = sanitize_url(raw_url);
    let status_tag = status.map_or_else(|| "error".to_string(), |s| s.to_string());
    let success = status.is_some_and(|s| s < 400);
    let mut tags = HashMap::from([
        ("task_id".to_string(), task_id.to_string()),
        ("operation".to_string(), operation.to_string()),
        ("url".to_string(), clean_url),
        ("domain".to_string(), domain),
        ("method".to_string(), method.to_string()),
        ("status_code".to_string(), status_tag),
        ("success".to_string(), success.to_string()),
    ]);
    if let Some(error_type) = status.and_then(error_type_for_status) {
        tags.insert("error_type".to_string(), error_type.to_string());
    }
    tags
}

/// Tags for a `task.processing_duration_ms` event.
pub(crate) fn task_processing_tags(
    task_id: &str,
    method: &str,
    raw_url: &str,
    status: Option<u16>,
) -> HashMap<String, String> {
    let (_, domain) = sanitize_url(raw_url);
    HashMap::from([
        ("task_id".to_string(), task_id.to_string()),
        ("method".to_string(), method.to_string()),
        ("domain".to_string(), domain),
        (
            "http_status".to_string(),
            status.map_or_else(|| "unknown".to_string(), |s| s.to_string()),
        ),
    ])
}

/// Tags for an `upload.size_bytes` event.
pub(crate) fn upload_tags(task_id: &str, upload_type: &str) -> HashMap<String, String> {
    HashMap::from([
        ("task_id".to_string(), task_id.to_string()),
        ("upload_type".to_string(), upload_type.to_string()),
    ])
}

/// Coarse failure class for a status code, if it represents one.
pub(crate) fn error_type_for_status(status: u16) -> Option<&'static str> {
    match status {
        429 => Some("rate_limit"),
        408 | 504 => Some("timeout"),
        500..=599 => Some("server_error"),
        400..=499 => Some("client_error"),
        _ => None,
    }
}
