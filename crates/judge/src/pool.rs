//! Worker Pool (C5): bounded concurrent execution of judging pipelines.
//!
//! Keyed by a unique job id (string), never by `(jobName, datetime)` — two
//! submissions leased in the same clock tick must not collide. Jobs are
//! it spawned as Tokio tasks; the pool's own bookkeeping map is only ever
//! touched from the dispatch loop that owns this pool, so no internal
//! locking is needed beyond what `tokio::spawn` already gives us.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

/// One submitted-but-not-yet-harvested job.
struct Job {
    submitted_at: DateTime<Utc>,
    handle: JoinHandle<anyhow::Result<()>>,
}

/// A harvested job's outcome.
pub struct Harvested {
    pub job_key: String,
    pub submitted_at: DateTime<Utc>,
    pub result: anyhow::Result<()>,
}

/// Fixed-capacity executor for judging pipelines. Pipelines are CPU-light,
/// IO-heavy (they mostly wait on sandbox/database calls), so correctness
/// only requires each job's own DB session and docker client handle be
/// independent — nothing here serializes access across jobs.
pub struct WorkerPool {
    capacity: usize,
    jobs: HashMap<String, Job>,
    accepting: bool,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            jobs: HashMap::with_capacity(capacity),
            accepting: true,
        }
    }

    /// `W - |active|`. Never negative.
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.jobs.len())
    }

    /// Non-blocking submit. Returns `false` (without spawning anything) if
    /// the pool is full or no longer accepting new work (post-shutdown).
    pub fn submit<F>(&mut self, job_key: impl Into<String>, fut: F) -> bool
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !self.accepting || self.available() == 0 {
            return false;
        }
        let job_key = job_key.into();
        let handle = tokio::spawn(fut);
        self.jobs.insert(
            job_key,
            Job {
                submitted_at: Utc::now(),
                handle,
            },
        );
        true
    }

    /// Remove and return every job that has finished. Jobs still in flight
    /// are left in the map untouched; only already-finished handles are
    /// awaited, so this never suspends waiting on work in progress.
    pub async fn harvest(&mut self) -> Vec<Harvested> {
        let done: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, j)| j.handle.is_finished())
            .map(|(k, _)| k.clone())
            .collect();

        let mut harvested = Vec::with_capacity(done.len());
        for key in done {
            if let Some(job) = self.jobs.remove(&key) {
                let result = match job.handle.await {
                    Ok(r) => r,
                    Err(e) => Err(anyhow::anyhow!("judge task panicked: {e}")),
                };
                harvested.push(Harvested {
                    job_key: key,
                    submitted_at: job.submitted_at,
                    result,
                });
            }
        }
        harvested
    }

    /// Stop accepting new submissions. If `wait_for_in_flight`, block until
    /// every currently-submitted job finishes (in-flight jobs are never
    /// cancelled — the container layer owns their timeouts); otherwise the
    /// join handles are simply dropped, detaching the still-running tasks.
    pub async fn shutdown(&mut self, wait_for_in_flight: bool) {
        self.accepting = false;
        if !wait_for_in_flight {
            self.jobs.clear();
            return;
        }
        let jobs = std::mem::take(&mut self.jobs);
        for (key, job) in jobs {
            match job.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(job = %key, error = %e, "job failed during shutdown drain"),
                Err(e) => tracing::error!(job = %key, error = %e, "job panicked during shutdown drain"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn available_reflects_capacity_minus_active() {
        let mut pool = WorkerPool::new(2);
        assert_eq!(pool.available(), 2);
        assert!(pool.submit("a", async { Ok(()) }));
        assert_eq!(pool.available(), 1);
        assert!(pool.submit("b", async { Ok(()) }));
        assert_eq!(pool.available(), 0);
        assert!(!pool.submit("c", async { Ok(()) }));
    }

    #[tokio::test]
    async fn harvest_drains_only_completed_jobs() {
        let mut pool = WorkerPool::new(4);
        let gate = Arc::new(tokio::sync::Notify::new());
        let gate_clone = gate.clone();

        pool.submit("fast", async { Ok(()) });
        pool.submit("slow", async move {
            gate_clone.notified().await;
            Ok(())
        });

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let harvested = pool.harvest().await;
        let keys: Vec<&str> = harvested.iter().map(|h| h.job_key.as_str()).collect();
        assert!(keys.contains(&"fast"));
        assert!(!keys.contains(&"slow"));
        assert_eq!(pool.available(), 3);

        gate.notify_one();
        // give the slow task a chance to finish
        for _ in 0..50 {
            if pool.jobs.get("slow").map(|j| j.handle.is_finished()) == Some(true) {
                break;
            }
            tokio::task::yield_now().await;
        }
        let harvested = pool.harvest().await;
        assert_eq!(harvested.len(), 1);
        assert_eq!(harvested[0].job_key, "slow");
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn submit_keys_by_job_id_not_timestamp_so_same_tick_jobs_never_collide() {
        let mut pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let counter = counter.clone();
            assert!(pool.submit(format!("submission-{i}"), async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        assert_eq!(pool.jobs.len(), 3);
    }

    #[tokio::test]
    async fn shutdown_without_wait_detaches_in_flight_jobs() {
        let mut pool = WorkerPool::new(2);
        pool.submit("a", async {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            Ok(())
        });
        pool.shutdown(false).await;
        assert_eq!(pool.jobs.len(), 0);
        assert!(!pool.submit("b", async { Ok(()) }));
    }

    #[tokio::test]
    async fn shutdown_with_wait_drains_in_flight_jobs() {
        let mut pool = WorkerPool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        pool.submit("a", async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        pool.shutdown(true).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
