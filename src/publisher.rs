//! Job controller.
//!
//! [`Publisher::run_job`] drives one job end to end:
//!
//! 1. Load the job and move it to `In process`
//! 2. Select documents, recording selection failures in the ledger
//! 3. Drain the selection with the worker pool
//! 4. Write the media manifest
//! 5. Push to the gateway if this is a distribution job
//! 6. Promote the output tree and record first-publication dates
//!
//! An operator kill (the job's stored status set to `Failure`) stops the job
//! at the next check: during the worker pool, or before the push starts.
//!
//! Any failure along the way goes through one cleanup path: the output tree
//! is renamed to its failed name and the job ends `Failure`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::PublisherConfig;
use crate::distribution::{Gateway, PushOutcome, Pusher};
use crate::error::{PublishError, Result};
use crate::loader::JobLoader;
use crate::output::OutputTree;
use crate::pipeline::PipelineRunner;
use crate::repository::Repository;
use crate::scheduler::{Job, JobRecord, JobStatus, RequestedDocument, WorkQueue};
use crate::selector::DocumentSelector;
use crate::store::{LedgerEntry, Store};
use crate::tracker::{JobTracker, LogNotifier, Notifier};
use crate::worker::{AbortSignal, WorkerPool};

/// Everything one running job shares between the controller and its
/// workers. Counters live here, never in process-wide state.
pub struct JobContext {
    pub job: Job,
    pub store: Store,
    pub repository: Arc<dyn Repository>,
    pub pipeline: PipelineRunner,
    pub output: OutputTree,
    pub tracker: JobTracker,
    pub abort: AbortSignal,
    /// First-publication date per document; absent means never published
    pub first_pub: HashMap<i64, DateTime<Utc>>,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub job_id: i64,
    pub status: JobStatus,
    pub selected: usize,
    pub published: u32,
    pub removed: u32,
    pub errors: u32,
    pub warnings: u32,
    pub push: Option<PushOutcome>,
    pub message: String,
}

enum Completion {
    Published { push: Option<PushOutcome> },
    ReportOnly,
}

pub struct Publisher {
    config: PublisherConfig,
    store: Store,
    repository: Arc<dyn Repository>,
    gateway: Option<Arc<dyn Gateway>>,
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
}

impl Publisher {
    pub fn new(config: PublisherConfig, store: Store, repository: Arc<dyn Repository>) -> Self {
        Self {
            config,
            store,
            repository,
            gateway: None,
            notifier: Arc::new(LogNotifier),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Cancelling `token` aborts running jobs after their in-flight
    /// documents.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Queue a new job the way an external scheduler would. Returns its id.
    pub async fn queue_job(
        &self,
        system: &str,
        subset: &str,
        output_dir: &Path,
        parameters: BTreeMap<String, String>,
        documents: &[RequestedDocument],
    ) -> Result<i64> {
        let mut record = JobRecord::new(0, system, subset, output_dir);
        record.parameters = parameters;
        let job_id = self.store.create_job(&record).await?;
        self.store.add_requested(job_id, documents).await?;
        tracing::info!(job_id, system, subset, documents = documents.len(), "Job queued");
        Ok(job_id)
    }

    /// Run job `job_id` to completion.
    ///
    /// Job failures are reported in the returned summary. An error is
    /// returned only when the job cannot be run or its outcome cannot be
    /// recorded.
    pub async fn run_job(&self, job_id: i64) -> Result<JobSummary> {
        let status = self.store.status(job_id).await?;
        if status.is_terminal() {
            return Err(PublishError::UnexpectedStatus(status.to_string()));
        }

        let loader = JobLoader::new(self.store.clone(), self.repository.clone());
        let job = match loader.load(job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id, error = %e, "Job could not be loaded");
                self.store
                    .update_status(job_id, JobStatus::Failure, Some(&e.to_string()))
                    .await?;
                return Ok(JobSummary {
                    job_id,
                    status: JobStatus::Failure,
                    selected: 0,
                    published: 0,
                    removed: 0,
                    errors: 0,
                    warnings: 0,
                    push: None,
                    message: e.to_string(),
                });
            }
        };

        let tracker = JobTracker::new(
            self.store.clone(),
            job_id,
            &job.options,
            self.notifier.clone(),
        );
        tracker.set_status(JobStatus::InProcess, "Job started").await?;

        let ctx = Arc::new(JobContext {
            pipeline: PipelineRunner::new(
                self.repository.clone(),
                job.options.validate,
                job.options.publish_if_warnings,
                self.config.output.media_doctype.clone(),
            ),
            output: OutputTree::new(job.record.output_dir.clone(), &self.config.output),
            first_pub: self.store.first_pub_dates().await?,
            store: self.store.clone(),
            repository: self.repository.clone(),
            tracker,
            abort: AbortSignal::with_token(self.shutdown.child_token()),
            job,
        });

        let mut selected = 0;
        let result = self.execute(&ctx, &mut selected).await;
        self.finish(&ctx, selected, result).await
    }

    async fn execute(&self, ctx: &Arc<JobContext>, selected: &mut usize) -> Result<Completion> {
        let job = &ctx.job;
        let job_id = job.id();
        ctx.output.prepare().await?;

        let selector =
            DocumentSelector::new(self.repository.as_ref(), self.config.repository.query_timeout());
        let selection = selector.select(job).await?;
        *selected = selection.tasks.len() + selection.failures.len();
        ctx.tracker
            .message(&format!(
                "Selected {} documents, {} selection errors",
                selection.tasks.len(),
                selection.failures.len()
            ))
            .await?;

        for failure in &selection.failures {
            ctx.store
                .record_document(
                    job_id,
                    &LedgerEntry {
                        doc_id: failure.doc_id,
                        version: failure.version.unwrap_or(0),
                        doctype: failure.doctype.clone().unwrap_or_default(),
                        subdir: None,
                        filename: None,
                        messages: Some(failure.message.clone()),
                        failure: true,
                        removed: false,
                    },
                )
                .await?;
            if let Some(breach) = ctx.tracker.record_error(failure.doctype.as_deref()) {
                return Err(PublishError::ThresholdExceeded(breach));
            }
        }

        let failed_ids: Vec<i64> = selection.failed_ids().collect();
        let queue = Arc::new(WorkQueue::with_processed(
            selection.tasks,
            failed_ids,
            self.config.workers.progress_every,
        ));
        let pool = WorkerPool::new(self.config.workers.clone(), self.config.throttle.clone());
        pool.run(ctx.clone(), queue).await?;

        ctx.output.write_manifest().await?;

        let tally = ctx.tracker.tally();
        if *selected > 0 && tally.published + tally.removed == 0 {
            return Err(PublishError::ThresholdExceeded(
                "All documents failed".to_string(),
            ));
        }

        if job.options.report_only {
            return Ok(Completion::ReportOnly);
        }

        let push = if job.is_distribution() {
            if ctx.tracker.status().await? == JobStatus::Failure {
                return Err(PublishError::Cancelled);
            }
            let gateway = self.gateway.clone().ok_or_else(|| {
                PublishError::Config("distribution job but no gateway configured".to_string())
            })?;
            let pusher = Pusher::new(
                self.store.clone(),
                self.repository.clone(),
                gateway,
                std::time::Duration::from_secs(self.config.gateway.approval_poll_secs),
                self.config.output.media_doctype.clone(),
            );
            Some(pusher.push(job, &ctx.tracker, &ctx.output, &ctx.abort).await?)
        } else {
            None
        };

        ctx.output.promote().await?;
        match self.store.record_first_pub(job_id, job.started()).await {
            Ok(recorded) => tracing::debug!(job_id, recorded, "First publication dates recorded"),
            Err(e) => tracing::warn!(job_id, error = %e, "Could not record first publication dates"),
        }
        Ok(Completion::Published { push })
    }

    async fn finish(
        &self,
        ctx: &Arc<JobContext>,
        selected: usize,
        result: Result<Completion>,
    ) -> Result<JobSummary> {
        let job_id = ctx.job.id();
        let tally = ctx.tracker.tally();
        let (status, push, message) = match result {
            Ok(Completion::Published { push }) => {
                let message = format!(
                    "Job completed: {} documents published, {} removed, {} errors, {} warnings",
                    tally.published, tally.removed, tally.errors, tally.warnings
                );
                (JobStatus::Success, push, message)
            }
            Ok(Completion::ReportOnly) => {
                self.fail_output(ctx).await;
                let message = format!(
                    "Report only: {} documents processed, output left in {}",
                    tally.published,
                    ctx.output.failed_dir().display()
                );
                (JobStatus::Failure, None, message)
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Job failed");
                self.fail_output(ctx).await;
                (JobStatus::Failure, None, e.to_string())
            }
        };

        let status = ctx.tracker.finish(status, &message).await?;
        Ok(JobSummary {
            job_id,
            status,
            selected,
            published: tally.published,
            removed: tally.removed,
            errors: tally.errors,
            warnings: tally.warnings,
            push,
            message,
        })
    }

    async fn fail_output(&self, ctx: &JobContext) {
        if let Err(e) = ctx.output.fail().await {
            tracing::error!(job_id = ctx.job.id(), error = %e, "Could not rename failed output");
        }
    }
}
