// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job worker.
//!
//! Claims jobs one at a time and dispatches them to their handler. The
//! worker wakes on `jobs:new` announcements and also polls, so a lost
//! announcement only delays a job by one poll interval. Every poll first
//! recovers jobs abandoned in `processing` by a crashed worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use rand::Rng;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::handlers::{self, HandlerContext};
use crate::persistence::JobRecord;
use crate::pubsub::{Channels, MessageStream};
use crate::queue::{JobCommand, JobQueue};

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll when no announcement arrives.
    pub poll_interval: Duration,
    /// How long a job may stay `processing` before it is requeued.
    pub stale_timeout: Duration,
    /// Base retry delay; multiplied by the attempt number.
    pub retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            stale_timeout: Duration::from_secs(900),
            retry_backoff: Duration::from_secs(30),
        }
    }
}

/// Delay before retrying a job that failed on its `attempt`-th claim.
pub fn retry_delay(base: Duration, attempt: i32) -> Duration {
    let attempt = u32::try_from(attempt.max(1)).unwrap_or(1);
    base.saturating_mul(attempt)
}

fn jitter(base: Duration) -> Duration {
    let max_ms = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Run one job command against its handler.
pub async fn dispatch(ctx: &HandlerContext, command: &JobCommand) -> Result<()> {
    match command {
        JobCommand::Deploy {
            service_id,
            deployment_id,
        } => handlers::deploy::handle(ctx, service_id, deployment_id).await,
        JobCommand::Destroy { service_id } => handlers::destroy::handle(ctx, service_id).await,
        JobCommand::Scale {
            service_id,
            replicas,
        } => handlers::scale::handle(ctx, service_id, *replicas).await,
        JobCommand::Build {
            service_id,
            deployment_id,
        } => handlers::build::handle(ctx, service_id, deployment_id).await,
    }
}

/// Background job worker.
pub struct Worker {
    queue: JobQueue,
    ctx: HandlerContext,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl Worker {
    /// Create a worker draining `queue` with handlers over `ctx`.
    pub fn new(queue: JobQueue, ctx: HandlerContext, config: WorkerConfig) -> Self {
        Self {
            queue,
            ctx,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown. A job in flight finishes first.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until shutdown is signalled.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stale_timeout_secs = self.config.stale_timeout.as_secs(),
            "Job worker started"
        );

        match self.ctx.nodes.refresh().await {
            Ok(count) => info!(nodes = count, "Loaded hypervisor nodes"),
            Err(e) => warn!(error = %e, "Failed to load hypervisor nodes"),
        }

        let mut announcements = match self.ctx.pubsub.subscribe(Channels::job_new()).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "Failed to subscribe to job announcements; polling only");
                None
            }
        };

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Job worker shutting down");
                    break;
                }
                message = next_announcement(&mut announcements) => {
                    match message {
                        Some(message) => {
                            debug!(job_id = ?message.get("jobId"), "Job announced");
                            self.drain().await;
                        }
                        None => {
                            warn!("Job announcement stream closed; polling only");
                            announcements = None;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.recover_stale().await;
                    self.drain().await;
                }
            }
        }
    }

    /// Process jobs until none is claimable.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        loop {
            match self.process_next().await {
                Ok(true) => processed += 1,
                Ok(false) => break,
                Err(e) => {
                    error!(error = %e, "Job queue error");
                    break;
                }
            }
        }
        processed
    }

    async fn recover_stale(&self) {
        if let Err(e) = self.queue.requeue_stale(self.config.stale_timeout).await {
            error!(error = %e, "Failed to recover stale jobs");
        }
    }

    /// Claim and run one job. Returns whether a job was claimed.
    ///
    /// Handler failures are recorded on the job; only queue errors are
    /// returned.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(job) = self.queue.claim_next().await? else {
            return Ok(false);
        };

        let started = Instant::now();
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        let outcome = match JobCommand::from_record(&job) {
            Ok(command) => dispatch(&self.ctx, &command).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                if self.queue.complete(&job).await? {
                    info!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Job completed"
                    );
                } else {
                    lost_claim(&job, "completion");
                }
            }
            Err(e) => self.record_failure(&job, &e).await?,
        }
        Ok(true)
    }

    async fn record_failure(&self, job: &JobRecord, error: &Error) -> Result<()> {
        let message = error.to_string();

        if error.is_permanent() || job.attempts >= job.max_attempts {
            if !self.queue.mark_failed(job, &message).await? {
                lost_claim(job, "failure");
                return Ok(());
            }
            error!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                permanent = error.is_permanent(),
                error = %message,
                "Job failed"
            );
            return Ok(());
        }

        let delay = retry_delay(self.config.retry_backoff, job.attempts)
            + jitter(self.config.retry_backoff);
        if !self.queue.retry_later(job, &message, delay).await? {
            lost_claim(job, "retry");
            return Ok(());
        }
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %message,
            "Job failed; will retry"
        );
        Ok(())
    }
}

/// The job was requeued as stale while this worker still ran it, and its
/// row now belongs to a newer claim.
fn lost_claim(job: &JobRecord, outcome: &str) {
    warn!(
        job_id = %job.id,
        job_type = %job.job_type,
        attempt = job.attempts,
        outcome,
        "Job claim lost to a stale requeue; outcome discarded"
    );
}

async fn next_announcement(stream: &mut Option<MessageStream>) -> Option<Value> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
