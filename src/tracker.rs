//! Job status tracking: persisted status transitions, the message log,
//! error accounting against the job's budgets, and end-of-job notification.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{ErrorBudget, JobOptions};
use crate::error::Result;
use crate::scheduler::{JobRecord, JobStatus};
use crate::store::Store;

/// Tells someone a job has finished.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn job_finished(&self, job: &JobRecord, status: JobStatus, summary: &str) -> Result<()>;
}

/// Notifier that only logs.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn job_finished(&self, job: &JobRecord, status: JobStatus, summary: &str) -> Result<()> {
        tracing::info!(
            job_id = job.id,
            status = %status,
            recipients = job.email.as_deref().unwrap_or(""),
            summary,
            "Job finished"
        );
        Ok(())
    }
}

/// Per-job counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    pub errors: u32,
    pub errors_by_doctype: HashMap<String, u32>,
    pub warnings: u32,
    pub published: u32,
    pub removed: u32,
}

pub struct JobTracker {
    store: Store,
    job_id: i64,
    budget: ErrorBudget,
    per_doctype: BTreeMap<String, u32>,
    tally: Mutex<Tally>,
    notifier: Arc<dyn Notifier>,
}

impl JobTracker {
    pub fn new(store: Store, job_id: i64, options: &JobOptions, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            job_id,
            budget: options.abort_on_error,
            per_doctype: options.per_doctype_max_errors.clone(),
            tally: Mutex::new(Tally::default()),
            notifier,
        }
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Move the job to `status`. Returns false when the store refused the
    /// change because the job had already finished.
    pub async fn set_status(&self, status: JobStatus, message: &str) -> Result<bool> {
        let applied = self
            .store
            .update_status(self.job_id, status, Some(message))
            .await?;
        if applied {
            tracing::info!(job_id = self.job_id, status = %status, message, "Job status changed");
        } else {
            tracing::warn!(
                job_id = self.job_id,
                status = %status,
                "Status change ignored, job already finished"
            );
        }
        Ok(applied)
    }

    pub async fn status(&self) -> Result<JobStatus> {
        self.store.status(self.job_id).await
    }

    pub async fn message(&self, message: &str) -> Result<()> {
        tracing::info!(job_id = self.job_id, message, "Job message");
        self.store.append_message(self.job_id, message).await
    }

    /// Count one document error. Returns a description of the breached
    /// budget if this error pushed the job over one.
    pub fn record_error(&self, doctype: Option<&str>) -> Option<String> {
        let mut tally = self.tally.lock();
        tally.errors += 1;
        if let Some(doctype) = doctype {
            *tally.errors_by_doctype.entry(doctype.to_string()).or_default() += 1;
        }
        self.breach(&tally)
    }

    pub fn record_warnings(&self, count: usize) {
        self.tally.lock().warnings += count as u32;
    }

    pub fn record_published(&self) {
        self.tally.lock().published += 1;
    }

    pub fn record_removed(&self) {
        self.tally.lock().removed += 1;
    }

    pub fn tally(&self) -> Tally {
        self.tally.lock().clone()
    }

    fn breach(&self, tally: &Tally) -> Option<String> {
        if self.budget.is_exceeded_by(tally.errors) {
            return Some(format!(
                "Aborting: {} errors exceed the job's error threshold",
                tally.errors
            ));
        }
        for (doctype, max) in &self.per_doctype {
            let count = tally.errors_by_doctype.get(doctype).copied().unwrap_or(0);
            if count > *max {
                return Some(format!(
                    "Aborting: {} {} errors exceed Max{}Errors ({})",
                    count, doctype, doctype, max
                ));
            }
        }
        None
    }

    /// Record the terminal status and notify. Notification problems are
    /// logged, never raised.
    pub async fn finish(&self, status: JobStatus, summary: &str) -> Result<JobStatus> {
        self.set_status(status, summary).await?;
        let record = self.store.job(self.job_id).await?;
        if let Err(e) = self
            .notifier
            .job_finished(&record, record.status, summary)
            .await
        {
            tracing::warn!(job_id = self.job_id, error = %e, "Notification failed");
        }
        Ok(record.status)
    }
}
