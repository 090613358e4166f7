use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::{ThrottleConfig, WorkerPoolConfig};
use crate::error::Result;
use crate::publisher::JobContext;
use crate::scheduler::{JobStatus, WorkQueue};
use crate::worker::{AbortOrigin, DocumentExecutor, RateLimiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    pub workers: usize,
    pub processed: usize,
    /// Throttle pauses taken across all workers
    pub pauses: usize,
}

/// Fixed-size pool of document workers for one job.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
    throttle: ThrottleConfig,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, throttle: ThrottleConfig) -> Self {
        Self { config, throttle }
    }

    /// Drain `queue` with the configured number of workers. Returns once
    /// every worker has exited; if any of them raised the job's abort
    /// signal, that abort is returned as the error.
    pub async fn run(&self, ctx: Arc<JobContext>, queue: Arc<WorkQueue>) -> Result<PoolReport> {
        let workers = self.config.workers.max(1).min(queue.len().max(1));
        tracing::info!(
            job_id = ctx.job.id(),
            workers,
            documents = queue.len(),
            "Starting worker pool"
        );

        let mut handles: Vec<JoinHandle<usize>> = (0..workers)
            .map(|worker| {
                let ctx = ctx.clone();
                let queue = queue.clone();
                let limiter = RateLimiter::new(&self.throttle);
                tokio::spawn(worker_loop(worker, ctx, queue, limiter))
            })
            .collect();

        let mut interval = tokio::time::interval(self.config.poll_interval());
        loop {
            interval.tick().await;
            if handles.iter().all(|h| h.is_finished()) {
                break;
            }
            if !ctx.abort.is_raised() {
                check_killed(&ctx).await;
            }
        }

        let mut pauses = 0;
        for (worker, handle) in handles.drain(..).enumerate() {
            match handle.await {
                Ok(taken) => pauses += taken,
                Err(e) => {
                    tracing::error!(job_id = ctx.job.id(), worker, error = %e, "Worker panicked");
                    ctx.abort.raise(AbortOrigin::Worker {
                        worker,
                        reason: format!("worker task failed: {}", e),
                    });
                }
            }
        }

        let processed = queue.completed();
        tracing::info!(job_id = ctx.job.id(), processed, pauses, "Worker pool finished");
        if pauses > 0 {
            ctx.tracker
                .message(&format!("Throttled {} times", pauses))
                .await?;
        }

        match ctx.abort.origin() {
            Some(origin) => Err(origin.into_error()),
            None => Ok(PoolReport {
                workers,
                processed,
                pauses,
            }),
        }
    }
}

/// Stop the workers if an operator marked the job failed.
async fn check_killed(ctx: &JobContext) {
    match ctx.tracker.status().await {
        Ok(JobStatus::Failure) => {
            tracing::warn!(job_id = ctx.job.id(), "Job killed by operator, stopping workers");
            ctx.abort.raise(AbortOrigin::Cancelled);
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(job_id = ctx.job.id(), error = %e, "Could not read job status");
        }
    }
}

async fn worker_loop(
    worker: usize,
    ctx: Arc<JobContext>,
    queue: Arc<WorkQueue>,
    mut limiter: RateLimiter,
) -> usize {
    let executor = DocumentExecutor::new(ctx.clone());
    let mut pauses = 0;
    loop {
        if ctx.abort.is_raised() {
            tracing::debug!(job_id = ctx.job.id(), worker, "Abort seen, worker exiting");
            break;
        }
        let Some(task) = queue.claim() else {
            break;
        };
        let doc_id = task.doc_id;
        if let Err(e) = executor.execute(task).await {
            tracing::error!(
                job_id = ctx.job.id(),
                worker,
                doc_id,
                error = %e,
                "Unrecoverable error processing document"
            );
            ctx.abort.raise(AbortOrigin::Worker {
                worker,
                reason: format!("document {}: {}", doc_id, e),
            });
            break;
        }
        if let Some(done) = queue.complete_one() {
            let message = format!("Processed {} of {} documents", done, queue.len());
            if let Err(e) = ctx.tracker.message(&message).await {
                ctx.abort.raise(AbortOrigin::Worker {
                    worker,
                    reason: e.to_string(),
                });
                break;
            }
        }
        if let Some(pause) = limiter.record() {
            tracing::debug!(worker, pause_ms = pause.as_millis() as u64, "Throttling worker");
            pauses += 1;
            tokio::time::sleep(pause).await;
        }
    }
    pauses
}
