//! Pipeline orchestration: shared context, queues, lifecycle.
//!
//! Data flow: fetcher → task queue → executor pool → result queue →
//! uploader → control server. Both queues are bounded; producers block
//! when a queue fills, and the fetcher additionally pauses while the
//! result queue sits above its backpressure threshold, so backlog can
//! never grow without bound.
//!
//! Shutdown is sequenced through channel closure: cancelling the token
//! stops the fetcher, dropping the task sender; the executors drain what
//! was already queued and exit, dropping their result senders; the
//! uploader drains and exits; the metrics buffer takes a final flush.
//! In-flight tasks are lost if the process dies instead: results are
//! not persisted across restarts.

mod executor;
mod fetcher;
mod uploader;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use executor::{execute, run_worker};
pub use fetcher::{FetcherState, TaskFetcher};
pub use uploader::{deliver, run_uploader};

use crate::client::{ConcurrencyGate, ControlClient, RateLimiter};
use crate::config::{generate_agent_id, AgentConfig, UploadMode};
use crate::error::Result;
use crate::metrics::MetricsRecorder;
use crate::types::GlobalConfig;

/// Shared handles every pipeline stage works against. One instance per
/// agent; stages receive it at construction instead of reaching for
/// globals.
#[derive(Debug)]
pub struct RelayContext {
    /// Agent configuration, fixed for the process lifetime except for
    /// the dynamic settings below.
    pub config: AgentConfig,
    /// Control-server request throttle.
    pub limiter: Arc<RateLimiter>,
    /// Control-server connection cap.
    pub gate: Arc<ConcurrencyGate>,
    /// Control-server API client.
    pub control: ControlClient,
    /// Shared metrics sink.
    pub metrics: MetricsRecorder,
    /// Client for target-service requests.
    pub target_http: reqwest::Client,
    upload_direct: AtomicBool,
}

impl RelayContext {
    /// Validate the configuration and build the shared context.
    ///
    /// Fails only on misconfiguration: missing connection parameters,
    /// unbuildable HTTP clients, or an unusable scratch directory.
    pub fn new(config: AgentConfig) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.scratch_dir)?;

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.max_requests,
            config.rate_limit.window,
        ));
        let gate = Arc::new(ConcurrencyGate::new(config.gate_permits));
        let metrics = MetricsRecorder::new(config.metrics.clone(), &config.agent_index);
        let control = ControlClient::new(
            &config,
            generate_agent_id(),
            Arc::clone(&limiter),
            Arc::clone(&gate),
            metrics.clone(),
        )?;
        let target_http = build_target_client(&config)?;
        let upload_direct = AtomicBool::new(config.upload_mode == UploadMode::Direct);

        Ok(Arc::new(Self {
            config,
            limiter,
            gate,
            control,
            metrics,
            target_http,
            upload_direct,
        }))
    }

    /// Active upload strategy for oversized payloads.
    pub fn upload_mode(&self) -> UploadMode {
        if self.upload_direct.load(Ordering::Relaxed) {
            UploadMode::Direct
        } else {
            UploadMode::Presigned
        }
    }

    /// Apply settings the control server pushed on a task. Only knobs
    /// adjustable without rebuilding clients take effect.
    pub fn apply_global(&self, global: &GlobalConfig) {
        if let Some(per_min) = global.rate_limit_per_min {
            info!(per_min, "control server adjusted rate limit");
            self.limiter
                .set_limits(per_min as usize, std::time::Duration::from_secs(60));
        }
        if let Some(direct) = global.upload_direct {
            self.upload_direct.store(direct, Ordering::Relaxed);
        }
    }
}

/// The assembled relay pipeline.
pub struct Pipeline {
    ctx: Arc<RelayContext>,
}

impl Pipeline {
    /// Build a pipeline from configuration.
    pub fn new(config: AgentConfig) -> Result<Self> {
        Ok(Self {
            ctx: RelayContext::new(config)?,
        })
    }

    /// Shared context, for diagnostics and tests.
    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    /// Run until the shutdown token trips, then drain and flush.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let ctx = self.ctx;
        info!(
            agent_id = ctx.control.agent_id(),
            pool_size = ctx.config.pool_size,
            gate = ctx.config.gate_permits,
            "pipeline starting; in-flight tasks are not persisted across restarts"
        );

        let (task_tx, task_rx) = mpsc::channel(ctx.config.task_queue_capacity);
        let (result_tx, result_rx) = mpsc::channel(ctx.config.result_queue_capacity);

        let flusher_stop = CancellationToken::new();
        let flusher = ctx.metrics.spawn_flusher(flusher_stop.clone());

        let fetcher = TaskFetcher::new(Arc::clone(&ctx), task_tx, result_tx.clone());
        let fetcher_handle = tokio::spawn(fetcher.run(shutdown));

        let task_rx = Arc::new(Mutex::new(task_rx));
        let workers: Vec<_> = (0..ctx.config.pool_size)
            .map(|id| {
                tokio::spawn(run_worker(
                    Arc::clone(&ctx),
                    id,
                    Arc::clone(&task_rx),
                    result_tx.clone(),
                ))
            })
            .collect();
        drop(result_tx);

        let uploader_handle = tokio::spawn(run_uploader(Arc::clone(&ctx), result_rx));

        // Shutdown sequencing: each await below only returns once the
        // previous stage has closed its outbound channel.
        if let Err(e) = fetcher_handle.await {
            error!(error = %e, "fetcher task panicked");
        }
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "executor task panicked");
            }
        }
        if let Err(e) = uploader_handle.await {
            error!(error = %e, "uploader task panicked");
        }

        flusher_stop.cancel();
        let _ = flusher.await;
        ctx.metrics.shutdown();
        info!("pipeline stopped");
        Ok(())
    }
}

fn build_target_client(config: &AgentConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .danger_accept_invalid_certs(!config.verify_cert)
        .connect_timeout(config.connect_timeout);
    if let Some(proxy) = &config.inward_proxy.http {
        builder = builder.proxy(reqwest::Proxy::http(proxy)?);
    }
    if let Some(proxy) = &config.inward_proxy.https {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AgentConfig {
        AgentConfig {
            server_url: Some(url::Url::parse("http://127.0.0.1:1").unwrap()),
            api_key: Some("key".to_string()),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_context_rejects_invalid_config() {
        assert!(RelayContext::new(AgentConfig::default()).is_err());
        assert!(RelayContext::new(valid_config()).is_ok());
    }

    #[test]
    fn test_upload_mode_follows_global_config() {
        let ctx = RelayContext::new(valid_config()).unwrap();
        assert_eq!(ctx.upload_mode(), UploadMode::Direct);

        ctx.apply_global(&GlobalConfig {
            upload_direct: Some(false),
            ..GlobalConfig::default()
        });
        assert_eq!(ctx.upload_mode(), UploadMode::Presigned);

        ctx.apply_global(&GlobalConfig {
            upload_direct: Some(true),
            ..GlobalConfig::default()
        });
        assert_eq!(ctx.upload_mode(), UploadMode::Direct);
    }
}
