use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::distribution::diff::{compute_diff, strip_declarations, PublishedDocument};
use crate::distribution::gateway::{CompletionStatus, DocumentAction, Gateway, Prolog, SendDocument};
use crate::distribution::groups::assign_groups;
use crate::distribution::{PushState, PushType};
use crate::config::DistributionSettings;
use crate::error::{PublishError, Result};
use crate::output::OutputTree;
use crate::repository::Repository;
use crate::scheduler::{Job, JobStatus};
use crate::store::{LedgerEntry, SnapshotEntry, Store};
use crate::tracker::JobTracker;
use crate::worker::AbortSignal;

const MEDIA_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("gif", "image/gif"),
    ("mp3", "audio/mpeg"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The diff was empty; no gateway session was opened
    NothingToPush,
    Pushed { count: usize },
}

/// Wrap a media blob for the gateway.
pub fn wrap_media(extension: &str, bytes: &[u8]) -> Result<String> {
    let media_type = MEDIA_TYPES
        .iter()
        .find(|(ext, _)| ext.eq_ignore_ascii_case(extension))
        .map(|(_, media_type)| *media_type)
        .ok_or_else(|| {
            PublishError::Internal(format!("media type not supported for extension {:?}", extension))
        })?;
    Ok(format!(
        "<Media Type='{}' Size='{}' Encoding='base64'>{}</Media>",
        media_type,
        bytes.len(),
        STANDARD.encode(bytes)
    ))
}

/// How far the gateway session got. Only an open session is aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    NotStarted,
    Open,
    Acknowledged,
}

/// Runs the distribution state machine for one job.
pub struct Pusher {
    store: Store,
    repository: Arc<dyn Repository>,
    gateway: Arc<dyn Gateway>,
    approval_poll: Duration,
    media_doctype: String,
}

impl Pusher {
    pub fn new(
        store: Store,
        repository: Arc<dyn Repository>,
        gateway: Arc<dyn Gateway>,
        approval_poll: Duration,
        media_doctype: impl Into<String>,
    ) -> Self {
        Self {
            store,
            repository,
            gateway,
            approval_poll,
            media_doctype: media_doctype.into(),
        }
    }

    fn enter(&self, job_id: i64, state: PushState) {
        tracing::info!(job_id, state = %state, "Push state");
    }

    /// Push the job's output. The authoritative snapshot changes only if
    /// every step, completion included, is acknowledged.
    ///
    /// The output tree is promoted just before completion is sent, so that
    /// nothing that can fail on the local side is left once the gateway has
    /// accepted the push.
    pub async fn push(
        &self,
        job: &Job,
        tracker: &JobTracker,
        output: &OutputTree,
        abort: &AbortSignal,
    ) -> Result<PushOutcome> {
        let job_id = job.id();
        let settings = job
            .options
            .distribution
            .as_ref()
            .ok_or_else(|| PublishError::Internal(format!("job {} is not a push job", job_id)))?;

        let mut session = Session::NotStarted;
        let result = self
            .run(job, settings, tracker, output, abort, &mut session)
            .await;

        match &result {
            Ok(outcome) => {
                self.enter(job_id, PushState::Success);
                tracing::info!(job_id, outcome = ?outcome, "Push finished");
            }
            Err(e) => {
                self.enter(job_id, PushState::Failure);
                match session {
                    Session::Open => self.send_abort(job_id, settings.push_type).await,
                    Session::Acknowledged => tracing::error!(
                        job_id,
                        "Gateway accepted the push but it could not be recorded locally"
                    ),
                    Session::NotStarted => {}
                }
                if let Err(discard) = self.store.discard_work(job_id).await {
                    tracing::warn!(job_id, error = %discard, "Could not discard working snapshot");
                }
                tracing::error!(job_id, error = %e, "Push failed");
            }
        }
        result
    }

    async fn run(
        &self,
        job: &Job,
        settings: &DistributionSettings,
        tracker: &JobTracker,
        output: &OutputTree,
        abort: &AbortSignal,
        session: &mut Session,
    ) -> Result<PushOutcome> {
        let job_id = job.id();
        let push_type = settings.push_type;

        self.enter(job_id, PushState::ComputingDiff);
        let entries = self.working_snapshot(job, push_type, output).await?;
        if entries.is_empty() {
            tracker.message("Nothing to push").await?;
            return Ok(PushOutcome::NothingToPush);
        }
        tracker
            .message(&format!("{} documents queued for the gateway", entries.len()))
            .await?;

        let mut description = settings.description.clone();
        if job.options.interactive {
            self.enter(job_id, PushState::AwaitingApproval);
            self.wait_for_approval(job_id, tracker, abort).await?;
            description = self
                .store
                .job(job_id)
                .await?
                .parameters
                .get("PushJobDescription")
                .filter(|d| !d.trim().is_empty())
                .cloned()
                .or(description);
        }

        self.enter(job_id, PushState::Handshaking);
        let response = self
            .gateway
            .initiate(push_type.gateway_name(), &settings.target)
            .await?
            .check()?;
        let local = self.store.last_pushed_job().await?;
        let mut last_job_id = local;
        if response.last_job_id != local {
            if !job.options.ignore_last_job_mismatch {
                return Err(PublishError::LastJobMismatch {
                    gateway: response.last_job_id,
                    local,
                });
            }
            tracing::warn!(
                job_id,
                gateway = ?response.last_job_id,
                local = ?local,
                "Last job ID mismatch overridden, using the gateway's value"
            );
            tracker
                .message(&format!(
                    "Last job ID override: gateway has {:?}, local {:?}",
                    response.last_job_id, local
                ))
                .await?;
            last_job_id = response.last_job_id;
        }

        self.enter(job_id, PushState::Streaming);
        let prolog = Prolog {
            job_id,
            push_type: push_type.gateway_name().to_string(),
            target: settings.target.clone(),
            last_job_id,
            doc_count: entries.len(),
            description: description
                .unwrap_or_else(|| format!("{} push job {}", push_type, job_id)),
        };
        self.gateway.send_prolog(&prolog).await?.check()?;
        *session = Session::Open;

        for (index, entry) in entries.iter().enumerate() {
            if abort.is_raised() {
                return Err(PublishError::Cancelled);
            }
            let send = SendDocument {
                job_id,
                sequence: index + 1,
                action: if entry.is_removal() {
                    DocumentAction::Remove
                } else {
                    DocumentAction::Export
                },
                doctype: entry.doctype.clone(),
                doc_id: entry.doc_id,
                version: entry.version,
                group: entry.group_num,
                content: entry.content.clone(),
            };
            tracing::debug!(
                job_id,
                doc_id = entry.doc_id,
                sequence = send.sequence,
                action = ?send.action,
                "Sending document"
            );
            self.gateway.send_document(&send).await?.check()?;
        }

        self.enter(job_id, PushState::Completing);
        output.promote().await?;
        self.gateway
            .send_complete(
                job_id,
                push_type.gateway_name(),
                entries.len(),
                CompletionStatus::Complete,
            )
            .await?
            .check()?;
        *session = Session::Acknowledged;
        let merged = self
            .store
            .merge_snapshot(job_id, push_type.replaces_snapshot())
            .await?;

        if push_type.prunes() {
            for _ in entries.iter().filter(|e| e.is_removal()) {
                tracker.record_removed();
            }
        }
        if let Err(e) = tracker
            .message(&format!("Pushed {} documents to {}", merged, settings.target))
            .await
        {
            tracing::warn!(job_id, error = %e, "Could not log push result");
        }
        Ok(PushOutcome::Pushed { count: merged })
    }

    /// Build and store the job's working snapshot, in send order with
    /// groups assigned.
    async fn working_snapshot(
        &self,
        job: &Job,
        push_type: PushType,
        output: &OutputTree,
    ) -> Result<Vec<SnapshotEntry>> {
        let job_id = job.id();
        let ledger = self.store.ledger(job_id).await?;
        let mut published = Vec::new();
        for entry in ledger.iter().filter(|e| !e.failure) {
            published.push(self.published_document(entry, output).await?);
        }

        let snapshot = self.store.snapshot().await?;
        let mut inactive = HashSet::new();
        if push_type.prunes() {
            let sent: HashSet<i64> = published.iter().map(|d| d.doc_id).collect();
            let doctypes: HashSet<&str> = published.iter().map(|d| d.doctype.as_str()).collect();
            for row in snapshot.iter().filter(|r| {
                !sent.contains(&r.doc_id)
                    && r.doctype != self.media_doctype
                    && doctypes.contains(r.doctype.as_str())
            }) {
                let active = self
                    .repository
                    .document_info(row.doc_id)
                    .await?
                    .map(|info| info.active)
                    .unwrap_or(false);
                if !active {
                    inactive.insert(row.doc_id);
                }
            }
        }

        let diff = compute_diff(
            &published,
            &snapshot,
            push_type,
            job.options.push_all_docs,
            &inactive,
            &self.media_doctype,
        );
        tracing::info!(
            job_id,
            changed = diff.changed.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Diff computed"
        );

        let mut entries = diff.into_entries();
        let mut links = HashMap::new();
        for entry in entries.iter().filter(|e| !e.is_removal()) {
            if let Some(info) = self.repository.document_info(entry.doc_id).await? {
                if !info.links.is_empty() {
                    links.insert(entry.doc_id, info.links);
                }
            }
        }
        assign_groups(&mut entries, &links);
        self.store.write_work(job_id, &entries).await?;
        Ok(entries)
    }

    async fn published_document(
        &self,
        entry: &LedgerEntry,
        output: &OutputTree,
    ) -> Result<PublishedDocument> {
        let file_name = entry.filename.as_deref().ok_or_else(|| {
            PublishError::Internal(format!("document {} has no output file", entry.doc_id))
        })?;
        let bytes = output.read(entry.subdir.as_deref(), file_name).await?;
        let content = if entry.doctype == self.media_doctype {
            let extension = file_name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
            wrap_media(extension, &bytes)?
        } else {
            let text = String::from_utf8(bytes).map_err(|e| {
                PublishError::Internal(format!("document {} is not UTF-8: {}", entry.doc_id, e))
            })?;
            strip_declarations(&text)
        };
        Ok(PublishedDocument {
            doc_id: entry.doc_id,
            version: entry.version,
            doctype: entry.doctype.clone(),
            content,
        })
    }

    async fn wait_for_approval(
        &self,
        job_id: i64,
        tracker: &JobTracker,
        abort: &AbortSignal,
    ) -> Result<()> {
        tracker
            .set_status(JobStatus::WaitingApproval, "Waiting for push job release")
            .await?;
        loop {
            tokio::select! {
                _ = abort.token().cancelled() => return Err(PublishError::Cancelled),
                _ = tokio::time::sleep(self.approval_poll) => {}
            }
            match tracker.status().await? {
                JobStatus::InProcess => {
                    tracker.message("Job resumed by user").await?;
                    return Ok(());
                }
                JobStatus::Failure => {
                    tracing::warn!(job_id, "Push job killed by user");
                    return Err(PublishError::Cancelled);
                }
                JobStatus::WaitingApproval => continue,
                other => return Err(PublishError::UnexpectedStatus(other.to_string())),
            }
        }
    }

    async fn send_abort(&self, job_id: i64, push_type: PushType) {
        match self
            .gateway
            .send_complete(job_id, push_type.gateway_name(), 0, CompletionStatus::Abort)
            .await
        {
            Ok(response) if response.is_ok() => {
                tracing::info!(job_id, "Gateway told to abort the push");
            }
            Ok(response) => {
                tracing::warn!(job_id, message = %response.message, "Gateway refused abort");
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Could not send abort to gateway");
            }
        }
    }
}
