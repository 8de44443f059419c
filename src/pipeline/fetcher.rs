//! Task fetcher: polls the control server and feeds the task queue.
//!
//! The fetcher is the pipeline's intake valve. Before every poll it
//! checks result-queue occupancy and pauses while the downstream is
//! saturated, so the agent never pulls more work than the pipeline can
//! still hold. Control-server failures drive exponential backoff; an
//! empty poll sleeps briefly. There is no terminal state; the fetcher
//! runs until the shutdown token trips.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::AGENT_VERSION;
use crate::error::Error;
use crate::pipeline::RelayContext;
use crate::types::{FetchOutcome, Task};

/// Fetcher state, visible for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherState {
    /// Polling for work.
    Ready,
    /// Result queue too full; paused until it drains.
    Backpressured,
    /// Control server failing; waiting out an exponential delay.
    Backoff,
    /// Last poll found no work.
    IdleNoWork,
}

/// Polls the control server and enqueues validated tasks.
pub struct TaskFetcher {
    ctx: Arc<RelayContext>,
    task_tx: mpsc::Sender<Task>,
    /// Sender half of the result queue, held for two purposes: occupancy
    /// probing for backpressure, and short-circuiting tasks that fail
    /// validation straight to the uploader with a failure outcome.
    result_tx: mpsc::Sender<Task>,
    state: FetcherState,
    backoff: Duration,
}

impl TaskFetcher {
    /// Create a fetcher feeding `task_tx`.
    pub fn new(
        ctx: Arc<RelayContext>,
        task_tx: mpsc::Sender<Task>,
        result_tx: mpsc::Sender<Task>,
    ) -> Self {
        let backoff = ctx.config.min_backoff;
        Self {
            ctx,
            task_tx,
            result_tx,
            state: FetcherState::Ready,
            backoff,
        }
    }

    /// Current state.
    pub fn state(&self) -> FetcherState {
        self.state
    }

    /// Poll until the shutdown token trips. Dropping the fetcher closes
    /// the task queue, which lets the executor pool drain and exit.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("fetcher started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if let Some(pause) = self.poll_once().await {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        info!("fetcher stopped");
    }

    /// One fetch cycle. Returns how long to pause before the next, or
    /// `None` to poll again immediately.
    pub async fn poll_once(&mut self) -> Option<Duration> {
        let occupancy = self.result_queue_occupancy();
        let mark = self.ctx.config.backpressure_mark();
        if occupancy >= mark {
            if self.state != FetcherState::Backpressured {
                info!(occupancy, mark, "result queue saturated, pausing fetch");
            }
            self.state = FetcherState::Backpressured;
            return Some(self.ctx.config.backpressure_pause);
        }

        debug!("requesting task");
        match self.ctx.control.fetch_task().await {
            Ok(FetchOutcome::Task(task)) => {
                self.state = FetcherState::Ready;
                self.backoff = self.ctx.config.min_backoff;
                self.admit(*task).await;
                None
            }
            Ok(FetchOutcome::NoWork) => {
                debug!("no task available, waiting");
                self.state = FetcherState::IdleNoWork;
                Some(self.ctx.config.idle_sleep)
            }
            Err(Error::ServerUnavailable { status }) => {
                error!(status, "control server error, increasing backoff");
                Some(self.next_backoff())
            }
            Err(Error::Http(e)) => {
                error!(error = %e, "network error polling control server");
                Some(self.next_backoff())
            }
            Err(Error::UnexpectedStatus { status, body }) => {
                error!(status, body, "unexpected control server response");
                self.state = FetcherState::Ready;
                Some(self.ctx.config.idle_sleep)
            }
            Err(e) => {
                error!(error = %e, "fetch failed");
                self.state = FetcherState::Ready;
                Some(self.ctx.config.idle_sleep)
            }
        }
    }

    /// Validate and enqueue one fetched task. Tasks the executor could
    /// not act on skip execution and go straight to the uploader carrying
    /// a failure outcome, so the control server is not left waiting.
    async fn admit(&mut self, mut task: Task) {
        task.version = Some(AGENT_VERSION.to_string());
        if let Some(global) = task.global_config.clone() {
            self.ctx.apply_global(&global);
        }

        if let Err(e) = task.validate() {
            warn!(task_id = %task.task_id, error = %e, "rejecting task at queue boundary");
            task.record_agent_failure(e);
            if self.result_tx.send(task).await.is_err() {
                debug!("result queue closed, dropping rejected task");
            }
            return;
        }

        if self.task_tx.send(task).await.is_err() {
            // Only happens while shutting down.
            debug!("task queue closed, dropping fetched task");
        }
    }

    fn result_queue_occupancy(&self) -> usize {
        self.result_tx.max_capacity() - self.result_tx.capacity()
    }

    fn next_backoff(&mut self) -> Duration {
        self.state = FetcherState::Backoff;
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.ctx.config.max_backoff);
        delay
    }
}
