//! Filter pipeline for a single document.
//!
//! Filter sets run strictly in order, the output of one feeding the next.
//! A filter fault ends the chain and discards whatever it produced. Media
//! documents skip filtering entirely and carry their blob through.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::WarningPolicy;
use crate::error::Result;
use crate::repository::{Blob, Repository, RepositoryError, Severity};
use crate::scheduler::{DocumentTask, SubsetSpecification};

/// Per-document parameter carrying the first-publication date.
pub const DATE_FIRST_PUB: &str = "DateFirstPub";

/// What a document became after the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    Filtered(String),
    Media { blob: Blob, title: String },
}

impl Rendered {
    pub fn file_name(&self, doc_id: i64) -> String {
        match self {
            Rendered::Filtered(_) => format!("{}.xml", doc_id),
            Rendered::Media { blob, .. } => format!("{}.{}", doc_id, blob.extension),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Rendered::Filtered(content) => content.as_bytes(),
            Rendered::Media { blob, .. } => &blob.bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The document should be written. Warnings are informational.
    Publish {
        rendered: Rendered,
        warnings: Vec<String>,
    },
    /// The document failed filtering or validation.
    Reject { messages: Vec<String> },
}

#[derive(Clone)]
pub struct PipelineRunner {
    repository: Arc<dyn Repository>,
    validate: bool,
    warning_policy: WarningPolicy,
    media_doctype: String,
}

impl PipelineRunner {
    pub fn new(
        repository: Arc<dyn Repository>,
        validate: bool,
        warning_policy: WarningPolicy,
        media_doctype: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            validate,
            warning_policy,
            media_doctype: media_doctype.into(),
        }
    }

    pub fn is_media(&self, doctype: &str) -> bool {
        doctype == self.media_doctype
    }

    /// Run `task` through `spec`'s filter sets. Errors returned here are
    /// outages, not document problems.
    pub async fn run(
        &self,
        task: &DocumentTask,
        spec: &SubsetSpecification,
        date_first_pub: DateTime<Utc>,
    ) -> Result<PipelineOutcome> {
        let is_media = self.is_media(&task.doctype);
        let doc = match self
            .repository
            .get_document(task.doc_id, task.version, is_media)
            .await
        {
            Ok(doc) => doc,
            Err(e) => return reject_or_raise(e),
        };

        if is_media {
            return Ok(match doc.blob {
                Some(blob) => PipelineOutcome::Publish {
                    rendered: Rendered::Media {
                        blob,
                        title: doc.title,
                    },
                    warnings: Vec::new(),
                },
                None => PipelineOutcome::Reject {
                    messages: vec![format!("Media document {} has no blob", task.doc_id)],
                },
            });
        }

        let mut content = doc.content;
        let mut warnings = Vec::new();
        for set in &spec.filter_sets {
            let mut parameters: BTreeMap<String, String> = set.parameters.clone();
            parameters.insert(
                DATE_FIRST_PUB.to_string(),
                date_first_pub.format("%Y-%m-%d").to_string(),
            );
            match self
                .repository
                .filter_document(task.doc_id, &content, &set.filters, &parameters)
                .await
            {
                Ok(output) => {
                    content = output.content;
                    warnings.extend(output.warnings);
                }
                Err(e) => return reject_or_raise(e),
            }
        }

        let mut errors = Vec::new();
        if self.validate {
            for issue in self.repository.validate(&task.doctype, &content).await? {
                match issue.severity {
                    Severity::Error => errors.push(issue.message),
                    Severity::Warning => warnings.push(issue.message),
                }
            }
        }

        if self.warning_policy == WarningPolicy::Reject && !warnings.is_empty() {
            errors.append(&mut warnings);
        }

        if errors.is_empty() {
            Ok(PipelineOutcome::Publish {
                rendered: Rendered::Filtered(content),
                warnings,
            })
        } else {
            warnings.extend(errors);
            Ok(PipelineOutcome::Reject { messages: warnings })
        }
    }
}

fn reject_or_raise(e: RepositoryError) -> Result<PipelineOutcome> {
    if e.is_document_fault() {
        Ok(PipelineOutcome::Reject {
            messages: vec![e.to_string()],
        })
    } else {
        Err(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryRepository, StoredDocument, StoredVersion, ValidationRule};
    use crate::scheduler::FilterSet;

    fn repo() -> Arc<MemoryRepository> {
        let repo = MemoryRepository::new();
        repo.add_document(
            StoredDocument::new(1, "Summary", "One")
                .with_version(StoredVersion::new(1, Utc::now(), "<S>  {{DateFirstPub}}  </S>")),
        );
        repo.add_document(
            StoredDocument::new(2, "Media", "Diagram")
                .with_version(StoredVersion::new(1, Utc::now(), "").with_blob(b"GIF89a", "gif")),
        );
        Arc::new(repo)
    }

    fn spec(filters: &[&[&str]]) -> SubsetSpecification {
        SubsetSpecification {
            filter_sets: filters
                .iter()
                .map(|set| FilterSet {
                    filters: set.iter().map(|f| f.to_string()).collect(),
                    parameters: BTreeMap::new(),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn runner(repo: Arc<MemoryRepository>, policy: WarningPolicy) -> PipelineRunner {
        PipelineRunner::new(repo, true, policy, "Media")
    }

    #[tokio::test]
    async fn filter_sets_chain_in_order_with_first_pub_date() {
        let first_pub = DateTime::parse_from_rfc3339("2019-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let outcome = runner(repo(), WarningPolicy::Publish)
            .run(
                &DocumentTask::new(1, 1, "Summary", 0),
                &spec(&[&["substitute"], &["normalize-space"]]),
                first_pub,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::Publish {
                rendered: Rendered::Filtered("<S> 2019-06-01 </S>".to_string()),
                warnings: Vec::new(),
            }
        );
    }

    #[tokio::test]
    async fn filter_fault_rejects_document() {
        let outcome = runner(repo(), WarningPolicy::Publish)
            .run(
                &DocumentTask::new(1, 1, "Summary", 0),
                &spec(&[&["identity"], &["reject"], &["identity"]]),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Reject { .. }));
    }

    #[tokio::test]
    async fn warnings_publish_unless_policy_rejects() {
        let repo = repo();
        repo.add_validation_rule(
            "Summary",
            ValidationRule {
                severity: Severity::Warning,
                must_contain: "<Title>".to_string(),
                message: "missing title".to_string(),
            },
        );
        let task = DocumentTask::new(1, 1, "Summary", 0);

        let outcome = runner(repo.clone(), WarningPolicy::Publish)
            .run(&task, &spec(&[]), Utc::now())
            .await
            .unwrap();
        assert!(
            matches!(outcome, PipelineOutcome::Publish { ref warnings, .. } if warnings.len() == 1)
        );

        let outcome = runner(repo, WarningPolicy::Reject)
            .run(&task, &spec(&[]), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::Reject {
                messages: vec!["missing title".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn validation_errors_reject() {
        let repo = repo();
        repo.add_validation_rule(
            "Summary",
            ValidationRule {
                severity: Severity::Error,
                must_contain: "<Body>".to_string(),
                message: "missing body".to_string(),
            },
        );
        let outcome = runner(repo, WarningPolicy::Publish)
            .run(&DocumentTask::new(1, 1, "Summary", 0), &spec(&[]), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Reject { .. }));
    }

    #[tokio::test]
    async fn media_bypasses_filters() {
        let outcome = runner(repo(), WarningPolicy::Publish)
            .run(
                &DocumentTask::new(2, 1, "Media", 0),
                &spec(&[&["reject"]]),
                Utc::now(),
            )
            .await
            .unwrap();
        match outcome {
            PipelineOutcome::Publish { rendered, .. } => {
                assert_eq!(rendered.file_name(2), "2.gif");
                assert_eq!(rendered.bytes(), b"GIF89a");
            }
            other => panic!("expected media to publish, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn repository_outage_is_an_error() {
        let repo = repo();
        repo.make_unavailable(1);
        let result = runner(repo, WarningPolicy::Publish)
            .run(&DocumentTask::new(1, 1, "Summary", 0), &spec(&[]), Utc::now())
            .await;
        assert!(result.is_err());
    }
}
