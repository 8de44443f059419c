//! Outbound-only relay agent for private-network HTTP APIs.
//!
//! A centrally-hosted control plane queues HTTP instructions; an agent
//! running inside the customer's network polls for them, executes each
//! against the local target service, and posts the result back. No
//! inbound connectivity is required.
//!
//! The pipeline is fixed and small:
//!
//! ```text
//! fetcher → task queue → executor pool → result queue → uploader
//! ```
//!
//! Both queues are bounded, the fetcher pauses while the downstream is
//! saturated, and every control-server call passes a shared sliding-window
//! rate limiter plus a bounded connection gate. Responses stream to disk
//! and are delivered inline (base64) or out-of-band depending on size.
//!
//! # Example
//!
//! ```rust,no_run
//! use teleport_agent::{AgentConfig, Pipeline};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AgentConfig {
//!     server_url: Some(url::Url::parse("https://control.example.com")?),
//!     api_key: Some(std::env::var("API_KEY")?),
//!     ..AgentConfig::default()
//! };
//!
//! let shutdown = CancellationToken::new();
//! Pipeline::new(config)?.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod types;

pub use client::{ConcurrencyGate, ControlClient, RateLimiter, AGENT_VERSION};
pub use config::{AgentConfig, MetricsConfig, RateLimitConfig, UploadMode};
pub use error::{Error, Result};
pub use metrics::{MetricsEvent, MetricsRecorder};
pub use pipeline::{Pipeline, RelayContext};
pub use types::{Delivery, FetchOutcome, GlobalConfig, Task};
