use std::sync::Arc;

use crate::error::{PublishError, Result};
use crate::output::ManifestEntry;
use crate::pipeline::{PipelineOutcome, Rendered};
use crate::publisher::JobContext;
use crate::scheduler::DocumentTask;
use crate::store::LedgerEntry;
use crate::worker::AbortOrigin;

/// Takes one document through filtering, output and the job ledger.
#[derive(Clone)]
pub struct DocumentExecutor {
    ctx: Arc<JobContext>,
}

impl DocumentExecutor {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    /// Process `task`. Document problems are recorded on the task and in the
    /// ledger; the returned error is reserved for failures that must stop
    /// the job.
    pub async fn execute(&self, mut task: DocumentTask) -> Result<DocumentTask> {
        let ctx = &self.ctx;
        let spec = ctx
            .job
            .specifications
            .get(task.spec_index)
            .ok_or_else(|| {
                PublishError::Internal(format!(
                    "document {} refers to missing specification {}",
                    task.doc_id, task.spec_index
                ))
            })?;
        let subdir = spec.subdirectory.as_deref();
        let date_first_pub = ctx
            .first_pub
            .get(&task.doc_id)
            .copied()
            .unwrap_or_else(|| ctx.job.started());

        tracing::debug!(
            job_id = ctx.job.id(),
            doc_id = task.doc_id,
            version = task.version,
            doctype = %task.doctype,
            "Processing document"
        );

        let mut file_name = None;
        let mut breach = None;
        match ctx.pipeline.run(&task, spec, date_first_pub).await? {
            PipelineOutcome::Publish { rendered, warnings } => {
                ctx.tracker.record_warnings(warnings.len());
                for warning in warnings {
                    task.add_message(format!("Warning: {}", warning));
                }
                let name = rendered.file_name(task.doc_id);
                match ctx.output.write(subdir, &name, rendered.bytes()).await {
                    Ok(_) => {
                        if let Rendered::Media { title, .. } = &rendered {
                            let changed = ctx
                                .output
                                .blob_changed(ctx.repository.as_ref(), task.doc_id)
                                .await?;
                            ctx.output.add_media(ManifestEntry {
                                file_name: name.clone(),
                                changed,
                                title: title.clone(),
                            });
                        }
                        file_name = Some(name);
                        if ctx.job.removes_documents() {
                            task.removed = true;
                            ctx.tracker.record_removed();
                        } else {
                            task.published = true;
                            ctx.tracker.record_published();
                        }
                    }
                    Err(e @ PublishError::WriteFailed { .. }) => {
                        task.fail(e.to_string());
                        breach = ctx.tracker.record_error(Some(&task.doctype));
                    }
                    Err(e) => return Err(e),
                }
            }
            PipelineOutcome::Reject { messages } => {
                for message in messages {
                    task.add_message(message);
                }
                task.failed = true;
                breach = ctx.tracker.record_error(Some(&task.doctype));
            }
        }

        ctx.store
            .record_document(
                ctx.job.id(),
                &LedgerEntry {
                    doc_id: task.doc_id,
                    version: task.version,
                    doctype: task.doctype.clone(),
                    subdir: spec.subdirectory.clone(),
                    filename: file_name,
                    messages: (!task.messages.is_empty()).then(|| task.message_text()),
                    failure: task.failed,
                    removed: task.removed,
                },
            )
            .await?;
        task.recorded_in_ledger = true;

        if task.failed {
            tracing::warn!(
                job_id = ctx.job.id(),
                doc_id = task.doc_id,
                messages = %task.message_text(),
                "Document failed"
            );
        }
        if let Some(message) = breach {
            ctx.abort.raise(AbortOrigin::Threshold(message));
        }
        Ok(task)
    }
}
