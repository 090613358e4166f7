use std::collections::HashMap;

use crate::store::SnapshotEntry;

fn find(parent: &mut HashMap<i64, i64>, id: i64) -> i64 {
    let mut root = id;
    while let Some(&next) = parent.get(&root) {
        if next == root {
            break;
        }
        root = next;
    }
    // path compression
    let mut current = id;
    while current != root {
        let next = parent[&current];
        parent.insert(current, root);
        current = next;
    }
    root
}

/// Assign dependency-group numbers in place.
///
/// Exported documents connected through `links` share a group; groups are
/// numbered from 1 in the order their first member appears. Every removal
/// gets a group of its own, numbered after all export groups.
pub fn assign_groups(entries: &mut [SnapshotEntry], links: &HashMap<i64, Vec<i64>>) {
    let mut parent: HashMap<i64, i64> = entries
        .iter()
        .filter(|e| !e.is_removal())
        .map(|e| (e.doc_id, e.doc_id))
        .collect();

    for (&doc_id, targets) in links {
        if !parent.contains_key(&doc_id) {
            continue;
        }
        for target in targets {
            if !parent.contains_key(target) {
                continue;
            }
            let a = find(&mut parent, doc_id);
            let b = find(&mut parent, *target);
            if a != b {
                parent.insert(b, a);
            }
        }
    }

    let mut numbers: HashMap<i64, i64> = HashMap::new();
    let mut next = 1;
    for entry in entries.iter_mut().filter(|e| !e.is_removal()) {
        let root = find(&mut parent, entry.doc_id);
        entry.group_num = *numbers.entry(root).or_insert_with(|| {
            let n = next;
            next += 1;
            n
        });
    }
    for entry in entries.iter_mut().filter(|e| e.is_removal()) {
        entry.group_num = next;
        next += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export(id: i64) -> SnapshotEntry {
        SnapshotEntry {
            doc_id: id,
            version: 1,
            doctype: "Summary".to_string(),
            content: Some("<S/>".to_string()),
            group_num: 0,
        }
    }

    fn removal(id: i64) -> SnapshotEntry {
        SnapshotEntry {
            content: None,
            ..export(id)
        }
    }

    #[test]
    fn linked_exports_share_a_group() {
        let mut entries = vec![export(10), export(20), export(30), export(40), removal(50), removal(60)];
        let mut links = HashMap::new();
        links.insert(10, vec![30]);
        links.insert(40, vec![30, 99]);
        links.insert(50, vec![20]);

        assign_groups(&mut entries, &links);
        let groups: Vec<i64> = entries.iter().map(|e| e.group_num).collect();
        assert_eq!(groups, vec![1, 2, 1, 1, 3, 4]);
    }

    #[test]
    fn unlinked_documents_each_get_a_group() {
        let mut entries = vec![export(1), export(2)];
        assign_groups(&mut entries, &HashMap::new());
        assert_eq!(entries[0].group_num, 1);
        assert_eq!(entries[1].group_num, 2);
    }
}
