use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::repository::{
    Blob, Document, DocumentInfo, FilterOutput, QueryRow, Repository, RepositoryError, Severity,
    ValidationIssue, VersionInfo,
};
use crate::scheduler::PublishingSystem;

/// Input handed to a filter function.
#[derive(Debug)]
pub struct FilterCall<'a> {
    pub doc_id: i64,
    pub content: &'a str,
    pub parameters: &'a BTreeMap<String, String>,
}

pub type FilterFn =
    Arc<dyn Fn(&FilterCall<'_>) -> std::result::Result<FilterOutput, String> + Send + Sync>;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredVersion {
    pub num: i64,
    pub created: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub publishable: bool,
    #[serde(default = "default_true")]
    pub validated: bool,
    pub content: String,
    #[serde(default)]
    pub blob: Option<Blob>,
}

impl StoredVersion {
    pub fn new(num: i64, created: DateTime<Utc>, content: &str) -> Self {
        Self {
            num,
            created,
            publishable: true,
            validated: true,
            content: content.to_string(),
            blob: None,
        }
    }

    pub fn unpublishable(mut self) -> Self {
        self.publishable = false;
        self
    }

    pub fn with_blob(mut self, bytes: &[u8], extension: &str) -> Self {
        self.blob = Some(Blob {
            bytes: bytes.to_vec(),
            extension: extension.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub doc_id: i64,
    pub doctype: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub links: Vec<i64>,
    #[serde(default)]
    pub blob_changed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub versions: Vec<StoredVersion>,
}

impl StoredDocument {
    pub fn new(doc_id: i64, doctype: &str, title: &str) -> Self {
        Self {
            doc_id,
            doctype: doctype.to_string(),
            title: title.to_string(),
            active: true,
            links: Vec::new(),
            blob_changed: None,
            versions: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: StoredVersion) -> Self {
        self.versions.push(version);
        self
    }

    pub fn with_links(mut self, links: &[i64]) -> Self {
        self.links = links.to_vec();
        self
    }
}

/// A substring check standing in for schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub severity: Severity,
    pub must_contain: String,
    pub message: String,
}

/// Serialized form of a [`MemoryRepository`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFixture {
    #[serde(default)]
    pub systems: Vec<PublishingSystem>,
    #[serde(default)]
    pub documents: Vec<StoredDocument>,
    #[serde(default)]
    pub queries: BTreeMap<String, Vec<QueryRow>>,
    #[serde(default)]
    pub validation: BTreeMap<String, Vec<ValidationRule>>,
}

#[derive(Default)]
struct MemoryState {
    systems: HashMap<String, PublishingSystem>,
    documents: BTreeMap<i64, StoredDocument>,
    queries: HashMap<String, Vec<QueryRow>>,
    validation: HashMap<String, Vec<ValidationRule>>,
    unavailable: HashSet<i64>,
}

/// In-process repository with a small built-in filter library:
///
/// - `identity`: returns its input
/// - `normalize-space`: collapses runs of whitespace
/// - `substitute`: replaces `{{Name}}` with the value of parameter `Name`
/// - `warn`: passes input through with the `Message` parameter as a warning
/// - `reject`: fails with the `Message` parameter
pub struct MemoryRepository {
    state: RwLock<MemoryState>,
    filters: RwLock<HashMap<String, FilterFn>>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        let repo = Self {
            state: RwLock::new(MemoryState::default()),
            filters: RwLock::new(HashMap::new()),
        };
        repo.install_builtin_filters();
        repo
    }

    pub fn from_fixture(fixture: MemoryFixture) -> Self {
        let repo = Self::new();
        for system in fixture.systems {
            repo.add_system(system);
        }
        for doc in fixture.documents {
            repo.add_document(doc);
        }
        for (name, rows) in fixture.queries {
            repo.add_query(&name, rows);
        }
        for (doctype, rules) in fixture.validation {
            for rule in rules {
                repo.add_validation_rule(&doctype, rule);
            }
        }
        repo
    }

    /// Load a JSON fixture file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let fixture: MemoryFixture = serde_json::from_str(&text)?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn add_system(&self, system: PublishingSystem) {
        self.state.write().systems.insert(system.name.clone(), system);
    }

    pub fn add_document(&self, doc: StoredDocument) {
        self.state.write().documents.insert(doc.doc_id, doc);
    }

    pub fn add_query(&self, name: &str, rows: Vec<QueryRow>) {
        self.state.write().queries.insert(name.to_string(), rows);
    }

    pub fn add_validation_rule(&self, doctype: &str, rule: ValidationRule) {
        self.state
            .write()
            .validation
            .entry(doctype.to_string())
            .or_default()
            .push(rule);
    }

    pub fn register_filter<F>(&self, name: &str, filter: F)
    where
        F: Fn(&FilterCall<'_>) -> std::result::Result<FilterOutput, String> + Send + Sync + 'static,
    {
        self.filters.write().insert(name.to_string(), Arc::new(filter));
    }

    pub fn set_active(&self, doc_id: i64, active: bool) {
        if let Some(doc) = self.state.write().documents.get_mut(&doc_id) {
            doc.active = active;
        }
    }

    /// Replace the content of an existing version.
    pub fn set_content(&self, doc_id: i64, version: i64, content: &str) {
        if let Some(doc) = self.state.write().documents.get_mut(&doc_id) {
            if let Some(v) = doc.versions.iter_mut().find(|v| v.num == version) {
                v.content = content.to_string();
            }
        }
    }

    /// Make every fetch of `doc_id` fail as if the repository were down.
    pub fn make_unavailable(&self, doc_id: i64) {
        self.state.write().unavailable.insert(doc_id);
    }

    fn install_builtin_filters(&self) {
        let whitespace = Regex::new(r"\s+").expect("static regex");
        self.register_filter("identity", |call| {
            Ok(FilterOutput {
                content: call.content.to_string(),
                warnings: Vec::new(),
            })
        });
        self.register_filter("normalize-space", move |call| {
            Ok(FilterOutput {
                content: whitespace.replace_all(call.content.trim(), " ").into_owned(),
                warnings: Vec::new(),
            })
        });
        self.register_filter("substitute", |call| {
            let mut content = call.content.to_string();
            for (name, value) in call.parameters {
                content = content.replace(&format!("{{{{{}}}}}", name), value);
            }
            Ok(FilterOutput {
                content,
                warnings: Vec::new(),
            })
        });
        self.register_filter("warn", |call| {
            let message = call
                .parameters
                .get("Message")
                .cloned()
                .unwrap_or_else(|| "filter warning".to_string());
            Ok(FilterOutput {
                content: call.content.to_string(),
                warnings: vec![message],
            })
        });
        self.register_filter("reject", |call| {
            Err(call
                .parameters
                .get("Message")
                .cloned()
                .unwrap_or_else(|| "document rejected by filter".to_string()))
        });
    }

    fn lookup_filter(&self, name: &str) -> Option<FilterFn> {
        self.filters.read().get(name).cloned()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn publishing_system(
        &self,
        name: &str,
    ) -> std::result::Result<Option<PublishingSystem>, RepositoryError> {
        Ok(self.state.read().systems.get(name).cloned())
    }

    async fn run_query(
        &self,
        query: &str,
        _parameters: &BTreeMap<String, String>,
    ) -> std::result::Result<Vec<QueryRow>, RepositoryError> {
        self.state
            .read()
            .queries
            .get(query)
            .cloned()
            .ok_or_else(|| RepositoryError::UnknownQuery(query.to_string()))
    }

    async fn versions(&self, doc_id: i64) -> std::result::Result<Vec<VersionInfo>, RepositoryError> {
        let state = self.state.read();
        let doc = state
            .documents
            .get(&doc_id)
            .ok_or(RepositoryError::DocumentNotFound(doc_id))?;
        Ok(doc
            .versions
            .iter()
            .map(|v| VersionInfo {
                num: v.num,
                created: v.created,
                publishable: v.publishable,
                validated: v.validated,
            })
            .collect())
    }

    async fn document_info(
        &self,
        doc_id: i64,
    ) -> std::result::Result<Option<DocumentInfo>, RepositoryError> {
        Ok(self.state.read().documents.get(&doc_id).map(|doc| DocumentInfo {
            doc_id,
            doctype: doc.doctype.clone(),
            title: doc.title.clone(),
            active: doc.active,
            links: doc.links.clone(),
        }))
    }

    async fn get_document(
        &self,
        doc_id: i64,
        version: i64,
        with_blob: bool,
    ) -> std::result::Result<Document, RepositoryError> {
        let state = self.state.read();
        if state.unavailable.contains(&doc_id) {
            return Err(RepositoryError::Unavailable(format!(
                "connection lost fetching document {}",
                doc_id
            )));
        }
        let doc = state
            .documents
            .get(&doc_id)
            .ok_or(RepositoryError::DocumentNotFound(doc_id))?;
        let stored = doc
            .versions
            .iter()
            .find(|v| v.num == version)
            .ok_or(RepositoryError::VersionNotFound { doc_id, version })?;
        Ok(Document {
            doc_id,
            version,
            doctype: doc.doctype.clone(),
            title: doc.title.clone(),
            content: stored.content.clone(),
            blob: if with_blob { stored.blob.clone() } else { None },
        })
    }

    async fn filter_document(
        &self,
        doc_id: i64,
        content: &str,
        filters: &[String],
        parameters: &BTreeMap<String, String>,
    ) -> std::result::Result<FilterOutput, RepositoryError> {
        let mut output = FilterOutput {
            content: content.to_string(),
            warnings: Vec::new(),
        };
        for name in filters {
            let filter = self
                .lookup_filter(name)
                .ok_or_else(|| RepositoryError::Filter(format!("unknown filter {:?}", name)))?;
            let call = FilterCall {
                doc_id,
                content: &output.content,
                parameters,
            };
            let step = filter(&call).map_err(RepositoryError::Filter)?;
            output.content = step.content;
            output.warnings.extend(step.warnings);
        }
        Ok(output)
    }

    async fn validate(
        &self,
        doctype: &str,
        content: &str,
    ) -> std::result::Result<Vec<ValidationIssue>, RepositoryError> {
        let state = self.state.read();
        Ok(state
            .validation
            .get(doctype)
            .map(|rules| {
                rules
                    .iter()
                    .filter(|rule| !content.contains(&rule.must_contain))
                    .map(|rule| ValidationIssue {
                        severity: rule.severity,
                        message: rule.message.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn blob_changed(
        &self,
        doc_id: i64,
    ) -> std::result::Result<Option<DateTime<Utc>>, RepositoryError> {
        let state = self.state.read();
        let doc = state
            .documents
            .get(&doc_id)
            .ok_or(RepositoryError::DocumentNotFound(doc_id))?;
        Ok(doc
            .blob_changed
            .or_else(|| doc.versions.iter().map(|v| v.created).max()))
    }
}

impl std::fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryRepository")
            .field("systems", &state.systems.len())
            .field("documents", &state.documents.len())
            .field("queries", &state.queries.len())
            .finish()
    }
}
