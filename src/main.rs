//! Agent binary: argument parsing, logging setup, signal handling.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use teleport_agent::config::ProxyConfig;
use teleport_agent::{AgentConfig, Pipeline, UploadMode};

/// Relay agent: polls the control server for HTTP instructions and
/// executes them against services reachable from this network.
#[derive(Debug, Parser)]
#[command(name = "teleport-agent", version, about)]
struct Cli {
    /// Control server base URL.
    #[arg(long, env = "SERVER_URL")]
    server_url: Option<url::Url>,

    /// API key for control server authentication.
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Agent instance index, kept in per-instance file names.
    #[arg(long, default_value = "_prod")]
    index: String,

    /// Environment name forwarded to the control server.
    #[arg(long, env = "ENV_NAME")]
    env_name: Option<String>,

    /// Number of executor workers.
    #[arg(long, default_value_t = 5)]
    pool_size: usize,

    /// Control server request budget per minute.
    #[arg(long, default_value_t = 250)]
    rate_limit_per_min: usize,

    /// Ceiling on a single target request, in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Skip TLS certificate verification.
    #[arg(long)]
    no_verify: bool,

    /// Deliver oversized payloads through the presigned object-store
    /// flow instead of multipart upload to the control server.
    #[arg(long)]
    upload_presigned: bool,

    /// Response size (bytes) above which delivery goes out-of-band.
    #[arg(long, default_value_t = teleport_agent::config::DEFAULT_INLINE_THRESHOLD)]
    inline_threshold: u64,

    /// HTTP proxy for target-service requests.
    #[arg(long)]
    inward_proxy_http: Option<String>,

    /// HTTPS proxy for target-service requests.
    #[arg(long)]
    inward_proxy_https: Option<String>,

    /// HTTP proxy for control-server requests.
    #[arg(long)]
    outgoing_proxy_http: Option<String>,

    /// HTTPS proxy for control-server requests.
    #[arg(long)]
    outgoing_proxy_https: Option<String>,

    /// Days of rotated metrics files to keep.
    #[arg(long, default_value_t = 7)]
    metrics_retention_days: u32,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> AgentConfig {
        let mut config = AgentConfig {
            server_url: self.server_url,
            api_key: self.api_key,
            agent_index: self.index,
            env_name: self.env_name.filter(|e| !e.is_empty()),
            verify_cert: !self.no_verify,
            pool_size: self.pool_size,
            target_timeout: Duration::from_secs(self.timeout),
            inline_threshold: self.inline_threshold,
            upload_mode: if self.upload_presigned {
                UploadMode::Presigned
            } else {
                UploadMode::Direct
            },
            inward_proxy: ProxyConfig {
                http: self.inward_proxy_http,
                https: self.inward_proxy_https,
            },
            outgoing_proxy: ProxyConfig {
                http: self.outgoing_proxy_http,
                https: self.outgoing_proxy_https,
            },
            ..AgentConfig::default()
        };
        config.rate_limit.max_requests = self.rate_limit_per_min;
        config.rate_limit.window = Duration::from_secs(60);
        config.metrics.retention_days = self.metrics_retention_days;
        config
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = cli.into_config();
    info!(
        server = ?config.server_url.as_ref().map(url::Url::as_str),
        verify = config.verify_cert,
        pool_size = config.pool_size,
        upload_mode = ?config.upload_mode,
        "agent starting"
    );

    let pipeline = Pipeline::new(config).context("agent cannot start")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining pipeline");
        signal_token.cancel();
    });

    pipeline.run(shutdown).await?;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
