use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::JobOptions;
use crate::distribution::PushType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Started,
    InProcess,
    WaitingApproval,
    Success,
    Failure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Started => "Started",
            JobStatus::InProcess => "In process",
            JobStatus::WaitingApproval => "Waiting user approval",
            JobStatus::Success => "Success",
            JobStatus::Failure => "Failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Started" => Ok(JobStatus::Started),
            "In process" => Ok(JobStatus::InProcess),
            "Waiting user approval" => Ok(JobStatus::WaitingApproval),
            "Success" => Ok(JobStatus::Success),
            "Failure" => Ok(JobStatus::Failure),
            other => Err(format!("unknown job status {:?}", other)),
        }
    }
}

/// A job row as persisted by the scheduler that queued it.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub system: String,
    pub subset: String,
    pub started: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub user: String,
    pub email: Option<String>,
    pub parameters: BTreeMap<String, String>,
    pub status: JobStatus,
    pub messages: String,
    pub completed: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: i64, system: &str, subset: &str, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            system: system.to_string(),
            subset: subset.to_string(),
            started: Utc::now(),
            output_dir: output_dir.into(),
            user: "publisher".to_string(),
            email: None,
            parameters: BTreeMap::new(),
            status: JobStatus::Started,
            messages: String::new(),
            completed: None,
        }
    }

    pub fn with_parameter(mut self, name: &str, value: &str) -> Self {
        self.parameters.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_started(mut self, started: DateTime<Utc>) -> Self {
        self.started = started;
        self
    }
}

/// A document the caller asked for explicitly when queueing the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedDocument {
    pub doc_id: i64,
    pub version: Option<i64>,
}

/// Ordered filters applied as one repository call, with their parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    pub filters: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// One slice of a subset: which documents, which filters, where they go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsetSpecification {
    #[serde(default)]
    pub name: Option<String>,
    /// Doctypes accepted from the explicit document list; empty accepts all
    #[serde(default)]
    pub doctypes: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub subdirectory: Option<String>,
    #[serde(default)]
    pub filter_sets: Vec<FilterSet>,
}

impl SubsetSpecification {
    pub fn allows(&self, doctype: &str) -> bool {
        self.doctypes.is_empty() || self.doctypes.iter().any(|d| d == doctype)
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subset {
    pub name: String,
    #[serde(default)]
    pub specifications: Vec<SubsetSpecification>,
    /// Default for the job's AbortOnError parameter
    #[serde(default)]
    pub threshold: Option<i64>,
    /// Parameter defaults the job's own parameters override
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishingSystem {
    pub name: String,
    pub subsets: Vec<Subset>,
}

impl PublishingSystem {
    pub fn subset(&self, name: &str) -> Option<&Subset> {
        self.subsets.iter().find(|s| s.name == name)
    }
}

/// A job after loading: persisted row plus everything resolved from it.
#[derive(Debug, Clone)]
pub struct Job {
    pub record: JobRecord,
    pub options: JobOptions,
    pub specifications: Vec<SubsetSpecification>,
    pub requested: Vec<RequestedDocument>,
}

impl Job {
    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.record.started
    }

    pub fn is_distribution(&self) -> bool {
        self.options.distribution.is_some()
    }

    /// Every document this job selects is being withdrawn.
    pub fn removes_documents(&self) -> bool {
        self.options
            .distribution
            .as_ref()
            .is_some_and(|d| d.push_type == PushType::TargetedRemoval)
    }
}

/// One document's trip through the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTask {
    pub doc_id: i64,
    pub version: i64,
    pub doctype: String,
    /// Index of the subset specification that selected this document
    pub spec_index: usize,
    pub failed: bool,
    pub removed: bool,
    pub published: bool,
    pub recorded_in_ledger: bool,
    pub messages: Vec<String>,
}

impl DocumentTask {
    pub fn new(doc_id: i64, version: i64, doctype: &str, spec_index: usize) -> Self {
        Self {
            doc_id,
            version,
            doctype: doctype.to_string(),
            spec_index,
            failed: false,
            removed: false,
            published: false,
            recorded_in_ledger: false,
            messages: Vec::new(),
        }
    }

    pub fn add_message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.failed = true;
        self.add_message(message);
    }

    pub fn message_text(&self) -> String {
        self.messages.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Started,
            JobStatus::InProcess,
            JobStatus::WaitingApproval,
            JobStatus::Success,
            JobStatus::Failure,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("Verifying".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_success_and_failure_are_terminal() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failure.is_terminal());
        assert!(!JobStatus::WaitingApproval.is_terminal());
        assert!(!JobStatus::InProcess.is_terminal());
    }

    #[test]
    fn specification_without_doctypes_allows_everything() {
        let spec = SubsetSpecification::default();
        assert!(spec.allows("Summary"));

        let spec = SubsetSpecification {
            doctypes: vec!["Term".to_string()],
            ..Default::default()
        };
        assert!(spec.allows("Term"));
        assert!(!spec.allows("Summary"));
    }

    #[test]
    fn task_failure_keeps_messages() {
        let mut task = DocumentTask::new(42, 3, "Summary", 0);
        task.add_message("warning: empty section");
        task.fail("filter failed");
        assert!(task.failed);
        assert_eq!(task.message_text(), "warning: empty section\nfilter failed");
    }
}
