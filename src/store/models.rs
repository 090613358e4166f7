use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::{PublishError, Result};
use crate::scheduler::{JobRecord, JobStatus};

/// Raw `pub_job` row.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub system: String,
    pub subset: String,
    pub started: String,
    pub output_dir: String,
    pub user: String,
    pub email: Option<String>,
    pub parameters: String,
    pub status: String,
    pub messages: String,
    pub completed: Option<String>,
}

pub(crate) fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PublishError::Internal(format!("bad timestamp {:?}: {}", value, e)))
}

impl TryFrom<JobRow> for JobRecord {
    type Error = PublishError;

    fn try_from(row: JobRow) -> Result<Self> {
        let parameters: BTreeMap<String, String> = serde_json::from_str(&row.parameters)?;
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(PublishError::Internal)?;
        Ok(JobRecord {
            id: row.id,
            system: row.system,
            subset: row.subset,
            started: parse_time(&row.started)?,
            output_dir: PathBuf::from(row.output_dir),
            user: row.user,
            email: row.email,
            parameters,
            status,
            messages: row.messages,
            completed: row.completed.as_deref().map(parse_time).transpose()?,
        })
    }
}

/// One processed document in a job's ledger.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct LedgerEntry {
    pub doc_id: i64,
    pub version: i64,
    pub doctype: String,
    pub subdir: Option<String>,
    pub filename: Option<String>,
    pub messages: Option<String>,
    pub failure: bool,
    pub removed: bool,
}

impl LedgerEntry {
    pub fn succeeded(&self) -> bool {
        !self.failure && !self.removed
    }
}

/// A row of the authoritative snapshot: what the gateway currently holds.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SnapshotRow {
    pub doc_id: i64,
    pub version: i64,
    pub doctype: String,
    pub content: String,
    pub job_id: i64,
    pub force_push: bool,
}

/// A row of a job's working snapshot. `content == None` means remove.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SnapshotEntry {
    pub doc_id: i64,
    pub version: i64,
    pub doctype: String,
    pub content: Option<String>,
    pub group_num: i64,
}

impl SnapshotEntry {
    pub fn is_removal(&self) -> bool {
        self.content.is_none()
    }
}

/// A completed push, as recorded after the gateway confirmed it.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PushRecord {
    pub job_id: i64,
    pub doc_count: i64,
    pub pushed_at: String,
}
