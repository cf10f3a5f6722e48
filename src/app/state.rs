use super::edit::{classify_edit, EditEvent};
use crate::git::{ChangeKind, LineAnnotations};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Stable caller-assigned identity of an open document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub u64);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc#{}", self.0)
    }
}

/// Change markers and stats for one document, as of the last refresh
/// (plus any incremental edits since).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRecord {
    /// When false every other field is meaningless and nothing is drawn.
    pub tracked: bool,
    pub annotations: LineAnnotations,
    /// Whole-file stats from numstat, independent of `annotations`
    pub insertions: usize,
    pub deletions: usize,
    /// Last successfully fetched branch name, or empty
    pub branch: String,
    /// SHA-256 of the diff text the annotations came from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub diff_hash: String,
}

impl DiffRecord {
    pub fn untracked() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
struct Entry {
    record: Arc<DiffRecord>,
    /// Sequence number of the refresh that produced `record`
    installed: u64,
}

/// One [`DiffRecord`] per open document.
///
/// Records are handed out as `Arc` snapshots: a writer swaps or
/// copy-on-writes the `Arc`, so a reader never sees a map from one refresh
/// with stats from another.
#[derive(Debug, Default)]
pub struct DiffStateStore {
    entries: RwLock<HashMap<DocumentId, Entry>>,
    sequence: AtomicU64,
}

impl DiffStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record, creating an untracked placeholder on first query.
    pub fn get(&self, doc: DocumentId) -> Arc<DiffRecord> {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(&doc) {
                return Arc::clone(&entry.record);
            }
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(doc).or_insert_with(|| self.placeholder());
        Arc::clone(&entry.record)
    }

    /// Current record without creating one
    pub fn peek(&self, doc: DocumentId) -> Option<Arc<DiffRecord>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&doc)
            .map(|entry| Arc::clone(&entry.record))
    }

    /// Whether the store currently holds an entry for `doc`
    pub fn contains(&self, doc: DocumentId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&doc)
    }

    /// Swap in a record unconditionally.
    pub fn replace(&self, doc: DocumentId, record: DiffRecord) {
        let seq = self.next_sequence();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            doc,
            Entry {
                record: Arc::new(record),
                installed: seq,
            },
        );
    }

    /// Take a sequence number for a refresh about to start. Numbers are
    /// monotonic across the whole store, so also per document.
    pub fn begin_refresh(&self, doc: DocumentId) -> u64 {
        // Make sure the document is known before its refresh is in flight.
        drop(self.get(doc));
        self.next_sequence()
    }

    /// Install a refresh result unless something newer is already in place
    /// or the document was closed. Returns whether it was installed.
    pub fn install(&self, doc: DocumentId, seq: u64, record: DiffRecord) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(&doc) {
            Some(entry) if seq > entry.installed => {
                entry.record = Arc::new(record);
                entry.installed = seq;
                true
            }
            _ => false,
        }
    }

    /// Patch one line in place. `None` clears it. Ignored for untracked or
    /// unknown documents; returns whether anything was written.
    pub fn mutate_annotation(
        &self,
        doc: DocumentId,
        line: usize,
        kind: Option<ChangeKind>,
    ) -> bool {
        self.with_tracked(doc, |record| match kind {
            Some(kind) => record.annotations.insert(line, kind),
            None => {
                record.annotations.remove(line);
            }
        })
    }

    /// Run an edit through the incremental classifier, then drop markers
    /// the edit pushed past the end of the document.
    pub fn apply_edit(&self, doc: DocumentId, event: &EditEvent) -> bool {
        self.with_tracked(doc, |record| {
            let current = record.annotations.get(event.line);
            if let Some(kind) = classify_edit(current, event) {
                record.annotations.insert(event.line, kind);
            }
            record.annotations.retain_within(event.lines_after);
        })
    }

    /// Drop annotations beyond `line_count`
    pub fn clamp_to_line_count(&self, doc: DocumentId, line_count: usize) -> bool {
        self.with_tracked(doc, |record| record.annotations.retain_within(line_count))
    }

    /// Document closed: forget it. Late refresh results are then discarded.
    pub fn close(&self, doc: DocumentId) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&doc)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_tracked(&self, doc: DocumentId, f: impl FnOnce(&mut DiffRecord)) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(&doc) {
            Some(entry) if entry.record.tracked => {
                f(Arc::make_mut(&mut entry.record));
                true
            }
            _ => false,
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Refreshes issued before this point belong to an earlier life of the
    /// document and must not land on the placeholder.
    fn placeholder(&self) -> Entry {
        Entry {
            record: Arc::new(DiffRecord::untracked()),
            installed: self.sequence.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::edit::EditKind;
    use pretty_assertions::assert_eq;

    const DOC: DocumentId = DocumentId(1);

    fn annotations(entries: &[(usize, ChangeKind)]) -> LineAnnotations {
        entries.iter().copied().collect()
    }

    fn tracked(entries: &[(usize, ChangeKind)]) -> DiffRecord {
        DiffRecord {
            tracked: true,
            annotations: annotations(entries),
            insertions: 1,
            deletions: 1,
            branch: "main".to_string(),
            diff_hash: String::new(),
        }
    }

    #[test]
    fn get_creates_untracked_placeholder() {
        let store = DiffStateStore::new();
        assert!(!store.contains(DOC));
        let record = store.get(DOC);
        assert_eq!(*record, DiffRecord::untracked());
        assert!(store.contains(DOC));
    }

    #[test]
    fn peek_does_not_create() {
        let store = DiffStateStore::new();
        assert!(store.peek(DOC).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn replace_swaps_whole_record() {
        let store = DiffStateStore::new();
        store.replace(DOC, tracked(&[(3, ChangeKind::Addition)]));
        let before = store.get(DOC);
        store.replace(DOC, tracked(&[(9, ChangeKind::Deletion)]));
        assert_eq!(before.annotations.get(3), Some(ChangeKind::Addition));
        assert_eq!(store.get(DOC).annotations.get(9), Some(ChangeKind::Deletion));
        assert_eq!(store.get(DOC).annotations.get(3), None);
    }

    #[test]
    fn install_discards_older_sequence() {
        let store = DiffStateStore::new();
        let first = store.begin_refresh(DOC);
        let second = store.begin_refresh(DOC);
        assert!(second > first);

        assert!(store.install(DOC, second, tracked(&[(2, ChangeKind::Modification)])));
        assert!(!store.install(DOC, first, tracked(&[(7, ChangeKind::Addition)])));
        assert_eq!(
            store.get(DOC).annotations,
            annotations(&[(2, ChangeKind::Modification)])
        );
    }

    #[test]
    fn install_after_close_is_discarded() {
        let store = DiffStateStore::new();
        let seq = store.begin_refresh(DOC);
        assert!(store.close(DOC));
        assert!(!store.install(DOC, seq, tracked(&[])));
        assert!(!store.contains(DOC));

        // Reopened: the stale refresh still must not land
        store.get(DOC);
        assert!(!store.install(DOC, seq, tracked(&[])));
        assert!(!store.get(DOC).tracked);
    }

    #[test]
    fn mutate_annotation_requires_tracked() {
        let store = DiffStateStore::new();
        assert!(!store.mutate_annotation(DOC, 1, Some(ChangeKind::Modification)));
        store.replace(DOC, tracked(&[(4, ChangeKind::Addition)]));
        assert!(store.mutate_annotation(DOC, 1, Some(ChangeKind::Modification)));
        assert!(store.mutate_annotation(DOC, 4, None));
        assert_eq!(
            store.get(DOC).annotations,
            annotations(&[(1, ChangeKind::Modification)])
        );
    }

    #[test]
    fn mutation_does_not_touch_existing_snapshots() {
        let store = DiffStateStore::new();
        store.replace(DOC, tracked(&[]));
        let snapshot = store.get(DOC);
        store.mutate_annotation(DOC, 5, Some(ChangeKind::Modification));
        assert!(snapshot.annotations.is_empty());
        assert_eq!(store.get(DOC).annotations.len(), 1);
    }

    #[test]
    fn apply_edit_classifies_and_drops_out_of_range_lines() {
        let store = DiffStateStore::new();
        store.replace(
            DOC,
            tracked(&[(2, ChangeKind::Addition), (10, ChangeKind::Modification)]),
        );
        let event = EditEvent {
            kind: EditKind::Remove,
            line: 4,
            lines_before: 10,
            lines_after: 9,
        };
        assert!(store.apply_edit(DOC, &event));
        assert_eq!(
            store.get(DOC).annotations,
            annotations(&[(2, ChangeKind::Addition), (4, ChangeKind::Deletion)])
        );
    }

    #[test]
    fn apply_edit_ignored_when_untracked() {
        let store = DiffStateStore::new();
        let event = EditEvent {
            kind: EditKind::Insert,
            line: 1,
            lines_before: 1,
            lines_after: 1,
        };
        assert!(!store.apply_edit(DOC, &event));
        assert!(store.get(DOC).annotations.is_empty());
    }

    #[test]
    fn clamp_to_line_count_keeps_tail_marker() {
        let store = DiffStateStore::new();
        store.replace(
            DOC,
            tracked(&[(3, ChangeKind::Modification), (4, ChangeKind::Deletion)]),
        );
        store.clamp_to_line_count(DOC, 3);
        assert_eq!(store.get(DOC).annotations.len(), 2);
        store.clamp_to_line_count(DOC, 2);
        assert!(store.get(DOC).annotations.is_empty());
    }

    #[test]
    fn close_unknown_document_is_noop() {
        let store = DiffStateStore::new();
        assert!(!store.close(DocumentId(42)));
        assert!(store.is_empty());
    }
}
