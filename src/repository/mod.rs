//! Boundary to the versioned document repository.
//!
//! The repository owns documents, versions, the publishing control
//! definitions, the filter engine and the schema validator. This crate only
//! consumes it through [`Repository`]:
//!
//! - **Selection**: [`Repository::run_query`], [`Repository::versions`],
//!   [`Repository::document_info`]
//! - **Filtering**: [`Repository::get_document`], [`Repository::filter_document`],
//!   [`Repository::validate`]
//! - **Media**: [`Repository::blob_changed`]
//!
//! [`MemoryRepository`] is a complete in-process implementation used by the
//! test suite and the CLI harness.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::PublishingSystem;

pub mod memory;

pub use memory::{MemoryFixture, MemoryRepository, StoredDocument, StoredVersion, ValidationRule};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Filter failure: {0}")]
    Filter(String),

    #[error("Document {0} not found")]
    DocumentNotFound(i64),

    #[error("Version {version} of document {doc_id} not found")]
    VersionNotFound { doc_id: i64, version: i64 },

    #[error("Query {0:?} not defined")]
    UnknownQuery(String),

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    /// True for problems that belong to one document rather than to the
    /// repository as a whole.
    pub fn is_document_fault(&self) -> bool {
        matches!(
            self,
            RepositoryError::Filter(_)
                | RepositoryError::DocumentNotFound(_)
                | RepositoryError::VersionNotFound { .. }
        )
    }
}

/// One row returned by a selection query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRow {
    pub doc_id: i64,
    #[serde(default)]
    pub version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub num: i64,
    pub created: DateTime<Utc>,
    pub publishable: bool,
    pub validated: bool,
}

impl VersionInfo {
    pub fn is_eligible(&self) -> bool {
        self.publishable && self.validated
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub doc_id: i64,
    pub doctype: String,
    pub title: String,
    /// False once the document has been blocked or deleted
    pub active: bool,
    /// Documents whose gateway fate is tied to this one
    pub links: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub bytes: Vec<u8>,
    /// File extension, e.g. "jpg"
    pub extension: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub doc_id: i64,
    pub version: i64,
    pub doctype: String,
    pub title: String,
    pub content: String,
    pub blob: Option<Blob>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutput {
    pub content: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub message: String,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Publishing control definition for a system, if one exists.
    async fn publishing_system(
        &self,
        name: &str,
    ) -> Result<Option<PublishingSystem>, RepositoryError>;

    /// Run a named selection query. Callers apply their own timeout.
    async fn run_query(
        &self,
        query: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Vec<QueryRow>, RepositoryError>;

    async fn versions(&self, doc_id: i64) -> Result<Vec<VersionInfo>, RepositoryError>;

    async fn document_info(&self, doc_id: i64) -> Result<Option<DocumentInfo>, RepositoryError>;

    async fn get_document(
        &self,
        doc_id: i64,
        version: i64,
        with_blob: bool,
    ) -> Result<Document, RepositoryError>;

    /// Apply one filter set to `content`. A [`RepositoryError::Filter`]
    /// means the chain produced no document.
    async fn filter_document(
        &self,
        doc_id: i64,
        content: &str,
        filters: &[String],
        parameters: &BTreeMap<String, String>,
    ) -> Result<FilterOutput, RepositoryError>;

    async fn validate(
        &self,
        doctype: &str,
        content: &str,
    ) -> Result<Vec<ValidationIssue>, RepositoryError>;

    /// When the document's blob last changed.
    async fn blob_changed(&self, doc_id: i64) -> Result<Option<DateTime<Utc>>, RepositoryError>;
}
