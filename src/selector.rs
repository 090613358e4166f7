//! Document selection.
//!
//! Selection runs in two passes. The explicit list supplied with the job is
//! matched against each specification's allowed doctypes, in specification
//! order. Then each specification's query is run and every row resolved to a
//! version. A document id is selected at most once per job.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::distribution::PushType;
use crate::error::Result;
use crate::repository::{QueryRow, Repository, RepositoryError, VersionInfo};
use crate::scheduler::{DocumentTask, Job};

/// A document that could not be selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionFailure {
    pub doc_id: i64,
    pub version: Option<i64>,
    pub doctype: Option<String>,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct Selection {
    pub tasks: Vec<DocumentTask>,
    pub failures: Vec<SelectionFailure>,
}

impl Selection {
    /// Ids that selection rejected.
    pub fn failed_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.failures.iter().map(|f| f.doc_id)
    }
}

pub struct DocumentSelector<'a> {
    repository: &'a dyn Repository,
    query_timeout: Duration,
}

impl<'a> DocumentSelector<'a> {
    pub fn new(repository: &'a dyn Repository, query_timeout: Duration) -> Self {
        Self {
            repository,
            query_timeout,
        }
    }

    pub async fn select(&self, job: &Job) -> Result<Selection> {
        let mut selection = Selection::default();
        let mut seen = HashSet::new();
        let allow_inactive = matches!(
            job.options.distribution.as_ref().map(|d| d.push_type),
            Some(PushType::TargetedRemoval)
        );

        for requested in &job.requested {
            if !seen.insert(requested.doc_id) {
                tracing::debug!(doc_id = requested.doc_id, "Duplicate document in job list");
                continue;
            }
            let row = QueryRow {
                doc_id: requested.doc_id,
                version: requested.version,
            };
            match self.resolve(job, row, None, allow_inactive).await? {
                Ok(task) => selection.tasks.push(task),
                Err(failure) => selection.failures.push(failure),
            }
        }

        for (index, spec) in job.specifications.iter().enumerate() {
            let Some(query) = spec.query.as_deref() else {
                continue;
            };
            let rows = tokio::time::timeout(
                self.query_timeout,
                self.repository.run_query(query, &job.record.parameters),
            )
            .await
            .map_err(|_| RepositoryError::Timeout(self.query_timeout))??;

            tracing::info!(
                job_id = job.id(),
                specification = spec.label(),
                rows = rows.len(),
                "Selection query returned"
            );

            for row in rows {
                if !seen.insert(row.doc_id) {
                    continue;
                }
                match self.resolve(job, row, Some(index), allow_inactive).await? {
                    Ok(task) => selection.tasks.push(task),
                    Err(failure) => selection.failures.push(failure),
                }
            }
        }

        tracing::info!(
            job_id = job.id(),
            selected = selection.tasks.len(),
            errors = selection.failures.len(),
            "Document selection complete"
        );
        Ok(selection)
    }

    /// Resolve one row to a task. The outer error is a repository outage;
    /// the inner one a problem with this document.
    async fn resolve(
        &self,
        job: &Job,
        row: QueryRow,
        spec_index: Option<usize>,
        allow_inactive: bool,
    ) -> Result<std::result::Result<DocumentTask, SelectionFailure>> {
        let failure = |doctype: Option<String>, message: String| SelectionFailure {
            doc_id: row.doc_id,
            version: row.version,
            doctype,
            message,
        };

        let Some(info) = self.repository.document_info(row.doc_id).await? else {
            return Ok(Err(failure(None, format!("Document {} not found", row.doc_id))));
        };
        if !info.active && !allow_inactive {
            return Ok(Err(failure(
                Some(info.doctype),
                format!("Document {} is not active", row.doc_id),
            )));
        }

        let spec_index = match spec_index {
            Some(index) => index,
            None => match job
                .specifications
                .iter()
                .position(|spec| spec.allows(&info.doctype))
            {
                Some(index) => index,
                None => {
                    return Ok(Err(failure(
                        Some(info.doctype.clone()),
                        format!(
                            "Document {} of type {} is not allowed in this subset",
                            row.doc_id, info.doctype
                        ),
                    )))
                }
            },
        };

        let versions = match self.repository.versions(row.doc_id).await {
            Ok(versions) => versions,
            Err(e) if e.is_document_fault() => {
                return Ok(Err(failure(Some(info.doctype), e.to_string())))
            }
            Err(e) => return Err(e.into()),
        };

        match resolve_version(&versions, row.version, job.started()) {
            Ok(version) => Ok(Ok(DocumentTask::new(
                row.doc_id,
                version,
                &info.doctype,
                spec_index,
            ))),
            Err(message) => Ok(Err(failure(
                Some(info.doctype),
                format!("Document {}: {}", row.doc_id, message),
            ))),
        }
    }
}

/// Pick the version to publish. An explicit version must itself be
/// publishable and validated; otherwise the latest eligible version created
/// no later than `cutoff` is used.
pub fn resolve_version(
    versions: &[VersionInfo],
    explicit: Option<i64>,
    cutoff: DateTime<Utc>,
) -> std::result::Result<i64, String> {
    match explicit {
        Some(num) => match versions.iter().find(|v| v.num == num) {
            Some(v) if v.is_eligible() => Ok(num),
            Some(_) => Err(format!("version {} is not publishable", num)),
            None => Err(format!("version {} does not exist", num)),
        },
        None => versions
            .iter()
            .filter(|v| v.is_eligible() && v.created <= cutoff)
            .map(|v| v.num)
            .max()
            .ok_or_else(|| "no publishable version".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn version(num: i64, created: DateTime<Utc>, eligible: bool) -> VersionInfo {
        VersionInfo {
            num,
            created,
            publishable: eligible,
            validated: true,
        }
    }

    #[test]
    fn latest_eligible_version_before_cutoff() {
        let now = Utc::now();
        let versions = vec![
            version(1, now - ChronoDuration::days(3), true),
            version(2, now - ChronoDuration::days(2), false),
            version(3, now - ChronoDuration::days(1), true),
            version(4, now + ChronoDuration::days(1), true),
        ];
        assert_eq!(resolve_version(&versions, None, now), Ok(3));
    }

    #[test]
    fn explicit_version_must_be_eligible() {
        let now = Utc::now();
        let versions = vec![version(1, now, true), version(2, now, false)];
        assert_eq!(resolve_version(&versions, Some(1), now), Ok(1));
        assert!(resolve_version(&versions, Some(2), now).is_err());
        assert!(resolve_version(&versions, Some(9), now).is_err());
    }

    #[test]
    fn no_eligible_version_is_an_error() {
        let now = Utc::now();
        let versions = vec![version(1, now + ChronoDuration::hours(1), true)];
        assert!(resolve_version(&versions, None, now).is_err());
        assert!(resolve_version(&[], None, now).is_err());
    }
}
