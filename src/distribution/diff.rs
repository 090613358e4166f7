use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::distribution::PushType;
use crate::store::{SnapshotEntry, SnapshotRow};

/// A document this job published, in the form it would be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedDocument {
    pub doc_id: i64,
    pub version: i64,
    pub doctype: String,
    pub content: String,
}

/// Working snapshot split by what the gateway must do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub changed: Vec<SnapshotEntry>,
    pub added: Vec<SnapshotEntry>,
    pub removed: Vec<SnapshotEntry>,
}

impl Diff {
    pub fn len(&self) -> usize {
        self.changed.len() + self.added.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in send order: changed, then added, then removed.
    pub fn into_entries(self) -> Vec<SnapshotEntry> {
        let mut entries = self.changed;
        entries.extend(self.added);
        entries.extend(self.removed);
        entries
    }
}

fn declarations() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<\?xml[^>]*\?>|<!DOCTYPE[^>]*>").expect("static regex"))
}

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Content as compared against the snapshot: XML and doctype declarations
/// dropped, whitespace runs collapsed.
pub fn normalize(content: &str) -> String {
    let stripped = declarations().replace_all(content, "");
    whitespace().replace_all(stripped.trim(), " ").into_owned()
}

/// Strip declarations only, as sent to the gateway.
pub fn strip_declarations(content: &str) -> String {
    declarations().replace_all(content, "").trim_start().to_string()
}

fn entry(doc: &PublishedDocument, content: Option<String>) -> SnapshotEntry {
    SnapshotEntry {
        doc_id: doc.doc_id,
        version: doc.version,
        doctype: doc.doctype.clone(),
        content,
        group_num: 0,
    }
}

/// Compare this job's output with the authoritative snapshot.
///
/// `inactive` holds snapshot documents whose source is no longer active or
/// no longer exists; they become removals when the push type prunes and the
/// job published their doctype. `media_doctype` is never pruned.
pub fn compute_diff(
    published: &[PublishedDocument],
    snapshot: &[SnapshotRow],
    push_type: PushType,
    push_all: bool,
    inactive: &HashSet<i64>,
    media_doctype: &str,
) -> Diff {
    let mut diff = Diff::default();

    match push_type {
        PushType::FullLoad => {
            diff.added = published.iter().map(|d| entry(d, Some(d.content.clone()))).collect();
        }
        PushType::TargetedRemoval => {
            diff.removed = published.iter().map(|d| entry(d, None)).collect();
        }
        PushType::Export | PushType::TargetedExport => {
            let current: HashMap<i64, &SnapshotRow> =
                snapshot.iter().map(|row| (row.doc_id, row)).collect();
            for doc in published {
                match current.get(&doc.doc_id) {
                    Some(row) => {
                        if row.force_push
                            || push_all
                            || normalize(&row.content) != normalize(&doc.content)
                        {
                            diff.changed.push(entry(doc, Some(doc.content.clone())));
                        }
                    }
                    None => diff.added.push(entry(doc, Some(doc.content.clone()))),
                }
            }

            if push_type.prunes() {
                let sent: HashSet<i64> = published.iter().map(|d| d.doc_id).collect();
                let doctypes: HashSet<&str> =
                    published.iter().map(|d| d.doctype.as_str()).collect();
                diff.removed = snapshot
                    .iter()
                    .filter(|row| {
                        !sent.contains(&row.doc_id)
                            && row.doctype != media_doctype
                            && doctypes.contains(row.doctype.as_str())
                            && inactive.contains(&row.doc_id)
                    })
                    .map(|row| SnapshotEntry {
                        doc_id: row.doc_id,
                        version: row.version,
                        doctype: row.doctype.clone(),
                        content: None,
                        group_num: 0,
                    })
                    .collect();
            }
        }
    }

    for list in [&mut diff.changed, &mut diff.added, &mut diff.removed] {
        list.sort_by_key(|e| e.doc_id);
    }
    diff
}
