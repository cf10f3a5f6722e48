use super::state::{DiffStateStore, DocumentId};
use crate::git::LineAnnotations;

impl LineAnnotations {
    /// First changed line after `from`, stepping over the run of changed
    /// lines `from` sits in, so repeated calls go hunk to hunk.
    pub fn next_change(&self, from: usize) -> Option<usize> {
        let map = self.as_map();
        let mut end = from;
        for (&line, _) in map.range(from..) {
            if line != end {
                break;
            }
            end += 1;
        }
        // `end` is now the first unannotated line at or after `from`
        map.range(end..).next().map(|(&line, _)| line)
    }

    /// Mirror of [`LineAnnotations::next_change`], scanning toward line 0.
    pub fn previous_change(&self, from: usize) -> Option<usize> {
        let map = self.as_map();
        let mut start = from;
        for (&line, _) in map.range(..=from).rev() {
            if line != start {
                break;
            }
            if start == 0 {
                return None;
            }
            start -= 1;
        }
        map.range(..=start).next_back().map(|(&line, _)| line)
    }
}

/// Next changed line of `doc` after `from`
pub fn next_change(store: &DiffStateStore, doc: DocumentId, from: usize) -> Option<usize> {
    let record = store.get(doc);
    if !record.tracked {
        return None;
    }
    record.annotations.next_change(from)
}

/// Previous changed line of `doc` before `from`
pub fn previous_change(store: &DiffStateStore, doc: DocumentId, from: usize) -> Option<usize> {
    let record = store.get(doc);
    if !record.tracked {
        return None;
    }
    record.annotations.previous_change(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::state::DiffRecord;
    use crate::git::ChangeKind;

    fn marks(lines: &[usize]) -> LineAnnotations {
        lines
            .iter()
            .map(|&line| (line, ChangeKind::Modification))
            .collect()
    }

    #[test]
    fn next_skips_run_at_start() {
        let map = marks(&[3, 4, 5, 9]);
        assert_eq!(map.next_change(3), Some(9));
        assert_eq!(map.next_change(4), Some(9));
    }

    #[test]
    fn previous_skips_run_at_start() {
        let map = marks(&[3, 4, 5, 9]);
        assert_eq!(map.previous_change(9), Some(5));
        assert_eq!(map.previous_change(5), None);
    }

    #[test]
    fn next_from_unannotated_line() {
        let map = marks(&[3, 4, 5, 9]);
        assert_eq!(map.next_change(1), Some(3));
        assert_eq!(map.next_change(6), Some(9));
        assert_eq!(map.next_change(9), None);
    }

    #[test]
    fn previous_from_unannotated_line() {
        let map = marks(&[3, 4, 5, 9]);
        assert_eq!(map.previous_change(7), Some(5));
        assert_eq!(map.previous_change(20), Some(9));
        assert_eq!(map.previous_change(2), None);
    }

    #[test]
    fn previous_run_reaching_line_zero() {
        let map = marks(&[0, 1, 2]);
        assert_eq!(map.previous_change(2), None);
    }

    #[test]
    fn empty_map_has_no_neighbours() {
        let map = LineAnnotations::new();
        assert_eq!(map.next_change(1), None);
        assert_eq!(map.previous_change(1), None);
    }

    #[test]
    fn store_navigation_requires_tracked_record() {
        let store = DiffStateStore::new();
        let doc = DocumentId(7);
        assert_eq!(next_change(&store, doc, 1), None);

        store.replace(
            doc,
            DiffRecord {
                tracked: true,
                annotations: marks(&[2, 8]),
                ..DiffRecord::default()
            },
        );
        assert_eq!(next_change(&store, doc, 2), Some(8));
        assert_eq!(previous_change(&store, doc, 8), Some(2));
    }
}
