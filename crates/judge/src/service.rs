//! Service Loop (C6): a single cooperative ticker that harvests finished
//! jobs, leases new work up to the pool's free capacity, and hands each
//! leased submission to the worker pool.
//!
//! No in-pipeline cancellation: on shutdown the loop stops accepting new
//! ticks, drains whatever is in flight, then runs [`Gateway::undo_running`]
//! once more so any submission that didn't make it to `done` goes back to
//! `queued` with its partial results wiped, matching the crash-recovery
//! contract in `§4.2`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::gateway::Gateway;
use crate::pipeline::Pipeline;
use crate::pool::WorkerPool;
use crate::sandbox::Sandbox;

pub struct ServiceLoop<S: Sandbox + 'static> {
    config: Arc<Config>,
    gateway: Arc<Gateway>,
    pipeline: Arc<Pipeline<S>>,
    pool: WorkerPool,
    shutdown: Arc<AtomicBool>,
}

impl<S: Sandbox + 'static> ServiceLoop<S> {
    pub fn new(
        config: Arc<Config>,
        gateway: Arc<Gateway>,
        pipeline: Arc<Pipeline<S>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let capacity = config.worker_pool_capacity;
        Self {
            config,
            gateway,
            pipeline,
            pool: WorkerPool::new(capacity),
            shutdown,
        }
    }

    /// Startup sequence: recover any submissions stranded `running` by a
    /// previous crash, then tick until asked to shut down.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("recovering stranded submissions before starting dispatch loop");
        self.gateway.undo_running().await?;

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.service_tick_ms));

        while !self.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "service tick failed, continuing");
            }
        }

        tracing::info!("shutdown requested, draining worker pool");
        self.pool.shutdown(true).await;
        self.log_harvest(self.pool.harvest().await);

        tracing::info!("wiping partial results left by any in-flight submission");
        self.gateway.undo_running().await?;

        Ok(())
    }

    /// One iteration of the dispatch loop: harvest, lease, submit.
    async fn tick(&mut self) -> Result<()> {
        let harvested = self.pool.harvest().await;
        self.log_harvest(harvested);

        let available = self.pool.available();
        crate::metrics::record_active_jobs((self.config.worker_pool_capacity - available) as i64);
        if available == 0 {
            return Ok(());
        }

        let leased = self.gateway.lease_queued(available as i64).await;
        for submission in leased {
            let job_key = format!("submission-{}", submission.id);
            let pipeline = self.pipeline.clone();
            let submitted = self.pool.submit(job_key.clone(), async move {
                pipeline.judge_one(submission).await
            });
            if !submitted {
                tracing::warn!(job = %job_key, "pool rejected submission despite reported availability");
            }
        }

        Ok(())
    }

    fn log_harvest(&self, harvested: Vec<crate::pool::Harvested>) {
        for job in harvested {
            match job.result {
                Ok(()) => tracing::info!(
                    job = %job.job_key,
                    submitted_at = %job.submitted_at,
                    "submission judged"
                ),
                Err(e) => tracing::error!(
                    job = %job.job_key,
                    submitted_at = %job.submitted_at,
                    error = %e,
                    "submission judging failed"
                ),
            }
        }
    }
}
