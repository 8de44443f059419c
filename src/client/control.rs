//! HTTP client for the control server.
//!
//! Owns the outgoing connection settings (bearer key, proxy, TLS
//! verification) and the agent's identity. Every call here first passes
//! the shared [`RateLimiter`] and then holds a [`ConcurrencyGate`] permit
//! for the duration of the request, so the control server never sees more
//! connections than the gate allows regardless of worker count. The one
//! exception is the presigned object-store PUT, which does not touch the
//! control server at all.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::multipart;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::{ConcurrencyGate, RateLimiter};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::metrics::{self, MetricsEvent, MetricsRecorder, HTTP_REQUEST_DURATION_MS};
use crate::types::{FetchOutcome, Task};

/// Agent version reported to the control server.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Outcome of one acknowledgment attempt, classified for the uploader's
/// retry policy.
#[derive(Debug)]
pub enum AckStatus {
    /// The control server accepted the result.
    Delivered,
    /// Throttled or transient server failure; worth another attempt.
    Retryable {
        /// Status code that triggered the retry.
        status: u16,
    },
    /// Permanent rejection; the task will not be retried.
    Rejected {
        /// Status code of the rejection.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
}

/// Presigned object-store URL pair for one oversized payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedPair {
    /// URL to PUT the payload to.
    pub put_url: String,
    /// Signed GET URL handed back to the control server.
    pub get_url: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

/// Client for the control server's relay API.
#[derive(Debug)]
pub struct ControlClient {
    http: reqwest::Client,
    api_key: String,
    agent_id: String,
    env_name: Option<String>,
    get_task_url: Url,
    put_result_url: Url,
    upload_result_url: Url,
    upload_url_url: Url,
    fetch_timeout: Duration,
    result_timeout: Duration,
    upload_timeout: Duration,
    limiter: Arc<RateLimiter>,
    gate: Arc<ConcurrencyGate>,
    metrics: MetricsRecorder,
}

impl ControlClient {
    /// Build the client from validated configuration.
    pub fn new(
        config: &AgentConfig,
        agent_id: String,
        limiter: Arc<RateLimiter>,
        gate: Arc<ConcurrencyGate>,
        metrics: MetricsRecorder,
    ) -> Result<Self> {
        let base = config.server_url()?;
        let mut builder =
            reqwest::Client::builder().danger_accept_invalid_certs(!config.verify_cert);
        if let Some(proxy) = &config.outgoing_proxy.http {
            builder = builder.proxy(reqwest::Proxy::http(proxy)?);
        }
        if let Some(proxy) = &config.outgoing_proxy.https {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }

        Ok(Self {
            http: builder.build()?,
            api_key: config.api_key()?.to_string(),
            agent_id,
            env_name: config.env_name.clone(),
            get_task_url: join_endpoint(base, &config.endpoints.get_task)?,
            put_result_url: join_endpoint(base, &config.endpoints.put_result)?,
            upload_result_url: join_endpoint(base, &config.endpoints.upload_result)?,
            upload_url_url: join_endpoint(base, &config.endpoints.upload_url)?,
            fetch_timeout: config.fetch_timeout,
            result_timeout: config.result_timeout,
            upload_timeout: config.upload_timeout,
            limiter,
            gate,
            metrics,
        })
    }

    /// Identifier this agent instance registered with.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Poll the control server for one queued task.
    pub async fn fetch_task(&self) -> Result<FetchOutcome> {
        self.limiter.acquire().await;
        let _permit = self.gate.acquire().await;

        let mut request = self
            .http
            .get(self.get_task_url.clone())
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.fetch_timeout)
            .query(&[
                ("agentId", self.agent_id.as_str()),
                ("agentVersion", AGENT_VERSION),
            ]);
        if let Some(env) = &self.env_name {
            request = request.query(&[("envName", env.as_str())]);
        }

        let started = Instant::now();
        let response = request.send().await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.record_call("get_task", self.get_task_url.as_str(), "GET", None, duration_ms, &[]);
                return Err(e.into());
            }
        };

        let status = response.status().as_u16();
        match status {
            200 => {
                let envelope: Envelope<Task> = response.json().await?;
                match envelope.data {
                    Some(task) => {
                        self.record_call(
                            "get_task",
                            self.get_task_url.as_str(),
                            "GET",
                            Some(200),
                            duration_ms,
                            &[("has_task", "true"), ("task_id", &task.task_id)],
                        );
                        info!(task_id = %task.task_id, "received task");
                        Ok(FetchOutcome::Task(Box::new(task)))
                    }
                    None => {
                        self.record_call(
                            "get_task",
                            self.get_task_url.as_str(),
                            "GET",
                            Some(200),
                            duration_ms,
                            &[("has_task", "false")],
                        );
                        debug!("received empty task");
                        Ok(FetchOutcome::NoWork)
                    }
                }
            }
            204 => {
                self.record_call(
                    "get_task",
                    self.get_task_url.as_str(),
                    "GET",
                    Some(204),
                    duration_ms,
                    &[("has_task", "false")],
                );
                Ok(FetchOutcome::NoWork)
            }
            s if s >= 500 => {
                self.record_call("get_task", self.get_task_url.as_str(), "GET", Some(s), duration_ms, &[]);
                Err(Error::ServerUnavailable { status: s })
            }
            s => {
                self.record_call("get_task", self.get_task_url.as_str(), "GET", Some(s), duration_ms, &[]);
                let body = response.text().await.unwrap_or_default();
                Err(Error::UnexpectedStatus { status: s, body })
            }
        }
    }

    /// Acknowledge a task with its inline payload.
    pub async fn post_result(&self, task: &Task) -> Result<AckStatus> {
        self.limiter.acquire().await;
        let _permit = self.gate.acquire().await;

        let started = Instant::now();
        let response = self
            .http
            .post(self.put_result_url.clone())
            .bearer_auth(&self.api_key)
            .timeout(self.result_timeout)
            .json(task)
            .send()
            .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.finish_ack("upload_result", self.put_result_url.as_str(), &task.task_id, response, duration_ms)
            .await
    }

    /// Upload an oversized payload as a multipart POST: binary `file`
    /// part plus a JSON `task` metadata part.
    pub async fn upload_file(&self, task: &Task, path: &Path, gzipped: bool) -> Result<AckStatus> {
        let file_name = format!(
            "{}_{}.{}",
            task.task_id,
            uuid::Uuid::new_v4().simple(),
            if gzipped { "zip" } else { "txt" }
        );
        let mime = if gzipped { "application/zip" } else { "text/plain" };

        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let file_part = multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(ReaderStream::new(file)),
            len,
        )
        .file_name(file_name)
        .mime_str(mime)?;
        let task_part = multipart::Part::text(serde_json::to_string(task)?)
            .mime_str("application/json")?;
        let form = multipart::Form::new()
            .part("file", file_part)
            .part("task", task_part);

        self.limiter.acquire().await;
        let _permit = self.gate.acquire().await;

        let mut request = self
            .http
            .post(self.upload_result_url.clone())
            .bearer_auth(&self.api_key)
            .timeout(self.upload_timeout)
            .multipart(form);
        if let Some(env) = &self.env_name {
            request = request.query(&[("envName", env.as_str())]);
        }

        let started = Instant::now();
        let response = request.send().await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.finish_ack("upload_file", self.upload_result_url.as_str(), &task.task_id, response, duration_ms)
            .await
    }

    /// Request a presigned URL pair for an oversized payload.
    pub async fn presigned_urls(&self, file_name: &str) -> Result<PresignedPair> {
        self.limiter.acquire().await;
        let _permit = self.gate.acquire().await;

        let response = self
            .http
            .get(self.upload_url_url.clone())
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.fetch_timeout)
            .query(&[("fileName", file_name)])
            .send()
            .await?
            .error_for_status()?;

        let status = response.status().as_u16();
        let envelope: Envelope<PresignedPair> = response.json().await?;
        envelope.data.ok_or(Error::UnexpectedStatus {
            status,
            body: "missing presigned URL data".to_string(),
        })
    }

    /// PUT a payload to a presigned object-store URL, forwarding the
    /// content headers the target service produced. Goes straight to the
    /// object store, so neither the rate limiter nor the gate applies.
    pub async fn put_presigned(
        &self,
        put_url: &str,
        path: &Path,
        content_type: Option<&str>,
        content_encoding: Option<&str>,
    ) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();

        let mut request = self
            .http
            .put(put_url)
            .timeout(self.upload_timeout)
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        if let Some(ct) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, ct);
        }
        if let Some(ce) = content_encoding {
            request = request.header(reqwest::header::CONTENT_ENCODING, ce);
        }

        request.send().await?.error_for_status()?;
        info!("payload uploaded to object store");
        Ok(())
    }

    async fn finish_ack(
        &self,
        operation: &str,
        url: &str,
        task_id: &str,
        response: reqwest::Result<reqwest::Response>,
        duration_ms: f64,
    ) -> Result<AckStatus> {
        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                self.record_call(operation, url, "POST", Some(status), duration_ms, &[("task_id", task_id)]);
                Ok(classify_ack(status, response).await)
            }
            Err(e) => {
                self.record_call(operation, url, "POST", None, duration_ms, &[("task_id", task_id)]);
                warn!(task_id, error = %e, "network error delivering result");
                Err(e.into())
            }
        }
    }

    fn record_call(
        &self,
        operation: &str,
        url: &str,
        method: &str,
        status: Option<u16>,
        duration_ms: f64,
        extra: &[(&str, &str)],
    ) {
        let mut event = MetricsEvent::new(HTTP_REQUEST_DURATION_MS, duration_ms)
            .with_tags(metrics::http_request_tags("none", operation, url, method, status));
        for (key, value) in extra {
            event = event.with_tag(*key, *value);
        }
        self.metrics.record(event);
    }
}

/// Classify an acknowledgment response for the retry policy: 2xx
/// delivered; 429/408/504 and any 5xx retryable; other 4xx permanent.
async fn classify_ack(status: u16, response: reqwest::Response) -> AckStatus {
    match status {
        s if (200..300).contains(&s) => AckStatus::Delivered,
        429 | 408 | 504 => AckStatus::Retryable { status },
        s if s >= 500 => AckStatus::Retryable { status },
        s => AckStatus::Rejected {
            status: s,
            body: response.text().await.unwrap_or_default(),
        },
    }
}

/// Join an endpoint path onto the server URL, preserving any path prefix
/// the deployment mounts the API under.
fn join_endpoint(base: &Url, path: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    Ok(base.join(path)?)
}
