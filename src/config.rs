//! Agent configuration.
//!
//! The library consumes a fully-formed [`AgentConfig`]; argument and
//! environment parsing lives in the binary. Validation is deliberately
//! minimal: the only unrecoverable startup condition is a missing server
//! URL or API key. Everything else has a default that matches a stock
//! deployment.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

/// Default inline-delivery threshold in bytes. Responses up to this size
/// are base64-embedded in the acknowledgment; larger ones upload
/// out-of-band. Legacy deployments ran with 100 000.
pub const DEFAULT_INLINE_THRESHOLD: u64 = 500_000;

/// How results larger than the inline threshold reach the control server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// Multipart POST straight to the control server.
    Direct,
    /// Two-step flow: fetch a presigned object-store URL, PUT the payload,
    /// then acknowledge with the signed GET URL.
    Presigned,
}

/// Sliding-window throttle settings for control-server calls.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests granted within one trailing window.
    pub max_requests: usize,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 250,
            window: Duration::from_secs(60),
        }
    }
}

/// Outbound proxy endpoints for one direction of traffic.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Proxy for plain-HTTP requests.
    pub http: Option<String>,
    /// Proxy for HTTPS requests.
    pub https: Option<String>,
}

impl ProxyConfig {
    /// Whether any proxy is configured.
    pub fn is_configured(&self) -> bool {
        self.http.is_some() || self.https.is_some()
    }
}

/// Control-server endpoint paths, relative to the server URL.
///
/// The defaults follow the hosted platform's wire protocol; self-managed
/// control planes can remap them freely.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Poll for queued work.
    pub get_task: String,
    /// Acknowledge a task, inline payload included.
    pub put_result: String,
    /// Multipart upload for oversized payloads.
    pub upload_result: String,
    /// Request a presigned object-store URL pair.
    pub upload_url: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            get_task: "api/http-teleport/get-task".to_string(),
            put_result: "api/http-teleport/put-result".to_string(),
            upload_result: "api/http-teleport/upload-result".to_string(),
            upload_url: "api/http-teleport/upload-url".to_string(),
        }
    }
}

/// Metrics buffering, rotation, and retention settings.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Directory holding the metrics files.
    pub dir: PathBuf,
    /// Background flush cadence.
    pub flush_interval: Duration,
    /// Buffer size that triggers an early flush.
    pub buffer_size: usize,
    /// Days of rotated files to keep.
    pub retention_days: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            dir: default_base_dir().join("log").join("metrics"),
            flush_interval: Duration::from_secs(10),
            buffer_size: 1000,
            retention_days: 7,
        }
    }
}

/// Complete agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control server base URL.
    pub server_url: Option<Url>,
    /// Bearer API key sent on every control-server call.
    pub api_key: Option<String>,
    /// Agent instance index, used to keep per-instance file names apart.
    pub agent_index: String,
    /// Optional environment name forwarded on fetch/upload calls.
    pub env_name: Option<String>,
    /// Whether to verify TLS certificates.
    pub verify_cert: bool,
    /// Proxy for control-server (outgoing) traffic.
    pub outgoing_proxy: ProxyConfig,
    /// Proxy for target-service (inward) traffic.
    pub inward_proxy: ProxyConfig,
    /// Control-server endpoint paths.
    pub endpoints: EndpointConfig,

    /// Number of executor workers.
    pub pool_size: usize,
    /// Task queue capacity.
    pub task_queue_capacity: usize,
    /// Result queue capacity.
    pub result_queue_capacity: usize,
    /// Result-queue occupancy fraction at which fetching pauses.
    pub backpressure_threshold: f64,
    /// Pause length while backpressured.
    pub backpressure_pause: Duration,
    /// Sleep after an empty poll.
    pub idle_sleep: Duration,
    /// Initial fetch backoff after a control-server failure.
    pub min_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,

    /// Timeout for the get-task poll.
    pub fetch_timeout: Duration,
    /// Timeout for the inline acknowledgment POST.
    pub result_timeout: Duration,
    /// Timeout for out-of-band uploads.
    pub upload_timeout: Duration,
    /// Ceiling on a single target request, also bounded by task expiry.
    pub target_timeout: Duration,
    /// TCP connect timeout for target requests.
    pub connect_timeout: Duration,

    /// Control-server request throttle.
    pub rate_limit: RateLimitConfig,
    /// Simultaneous control-server connection cap.
    pub gate_permits: usize,
    /// Inline-delivery size threshold in bytes.
    pub inline_threshold: u64,
    /// Upload strategy for oversized payloads.
    pub upload_mode: UploadMode,
    /// Total delivery attempts per task.
    pub max_delivery_attempts: u32,
    /// Delay before the first delivery retry; doubles per attempt.
    pub retry_delay: Duration,
    /// Chunk size for scratch-file reads when compressing oversized
    /// payloads.
    pub stream_chunk_size: usize,

    /// Directory for response scratch files.
    pub scratch_dir: PathBuf,
    /// Metrics settings.
    pub metrics: MetricsConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            agent_index: "_prod".to_string(),
            env_name: None,
            verify_cert: true,
            outgoing_proxy: ProxyConfig::default(),
            inward_proxy: ProxyConfig::default(),
            endpoints: EndpointConfig::default(),
            pool_size: 5,
            task_queue_capacity: 16,
            result_queue_capacity: 100,
            backpressure_threshold: 0.8,
            backpressure_pause: Duration::from_secs(5),
            idle_sleep: Duration::from_secs(1),
            min_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(600),
            fetch_timeout: Duration::from_secs(25),
            result_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(300),
            target_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            rate_limit: RateLimitConfig::default(),
            gate_permits: 2,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            upload_mode: UploadMode::Direct,
            max_delivery_attempts: 3,
            retry_delay: Duration::from_secs(2),
            stream_chunk_size: 100 * 1024,
            scratch_dir: default_base_dir().join("output_files"),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Check the configuration for the conditions the agent cannot run
    /// without.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_none() {
            return Err(Error::Config(
                "server URL must be provided (argument or environment)".to_string(),
            ));
        }
        match &self.api_key {
            None => {
                return Err(Error::Config(
                    "API key must be provided (argument or environment)".to_string(),
                ));
            }
            Some(key) if key.is_empty() => {
                return Err(Error::Config("API key must not be empty".to_string()));
            }
            Some(_) => {}
        }
        if self.pool_size == 0 {
            return Err(Error::Config("pool size must be at least 1".to_string()));
        }
        if self.gate_permits == 0 {
            return Err(Error::Config(
                "concurrency gate needs at least 1 permit".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backpressure_threshold) {
            return Err(Error::Config(format!(
                "backpressure threshold must be within [0, 1], got {}",
                self.backpressure_threshold
            )));
        }
        Ok(())
    }

    /// The validated server URL.
    ///
    /// Call only after [`validate`](Self::validate); the accessor exists so
    /// downstream code does not re-check optionality everywhere.
    pub(crate) fn server_url(&self) -> Result<&Url> {
        self.server_url
            .as_ref()
            .ok_or_else(|| Error::Config("server URL not set".to_string()))
    }

    /// The validated API key.
    pub(crate) fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| Error::Config("API key not set".to_string()))
    }

    /// Result-queue occupancy (absolute) at which the fetcher pauses.
    pub fn backpressure_mark(&self) -> usize {
        let mark = (self.result_queue_capacity as f64 * self.backpressure_threshold).ceil();
        (mark as usize).min(self.result_queue_capacity)
    }
}

/// Generate the agent instance identifier: unix timestamp plus a short
/// random hex suffix, unique enough to tell restarts apart in logs.
pub fn generate_agent_id() -> String {
    let ts = chrono::Utc::now().timestamp();
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", ts, &hex[..6])
}

fn default_base_dir() -> PathBuf {
    std::env::temp_dir().join("teleport-agent")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid_config() -> AgentConfig {
        AgentConfig {
            server_url: Some(Url::parse("https://control.example.com").unwrap()),
            api_key: Some("key".to_string()),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_defaults_match_stock_deployment() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.pool_size, 5);
        assert_eq!(cfg.gate_permits, 2);
        assert_eq!(cfg.inline_threshold, 500_000);
        assert_eq!(cfg.rate_limit.max_requests, 250);
        assert_eq!(cfg.rate_limit.window, Duration::from_secs(60));
        assert_eq!(cfg.max_delivery_attempts, 3);
        assert_eq!(cfg.metrics.retention_days, 7);
        assert_eq!(cfg.metrics.buffer_size, 1000);
        assert!(matches!(cfg.upload_mode, UploadMode::Direct));
    }

    #[test]
    fn test_validate_requires_url_and_key() {
        let cfg = AgentConfig::default();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.api_key = None;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.api_key = Some(String::new());
        assert!(cfg.validate().is_err());

        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_degenerate_limits() {
        let mut cfg = valid_config();
        cfg.pool_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.gate_permits = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.backpressure_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_backpressure_mark() {
        let mut cfg = valid_config();
        cfg.result_queue_capacity = 100;
        cfg.backpressure_threshold = 0.8;
        assert_eq!(cfg.backpressure_mark(), 80);

        cfg.result_queue_capacity = 10;
        cfg.backpressure_threshold = 0.85;
        assert_eq!(cfg.backpressure_mark(), 9);
    }

    #[test]
    fn test_generate_agent_id_shape() {
        let id = generate_agent_id();
        let (ts, hex) = id.split_once('_').unwrap();
        assert!(ts.parse::<i64>().is_ok());
        assert_eq!(hex.len(), 6);
    }
}
