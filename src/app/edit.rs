//! Keeps markers roughly right between refreshes.
//!
//! This is a heuristic, not a diff. "Line count went down" is read as
//! "lines were deleted", so a multi-line paste looks like a one-line edit
//! and a multi-line delete looks like a one-line delete. Markers are not
//! shifted when lines come or go either. The next refresh replaces
//! whatever this produced.

use crate::git::ChangeKind;

/// What the editor did to the text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Insert,
    Remove,
    Replace,
}

/// One text mutation as reported by the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditEvent {
    pub kind: EditKind,
    /// 1-based line where the edit lands, in post-edit numbering. For a
    /// removed line this is the line that now follows it.
    pub line: usize,
    pub lines_before: usize,
    pub lines_after: usize,
}

impl EditEvent {
    fn shrinks(&self) -> bool {
        self.lines_after < self.lines_before
    }
}

/// New marker for `event.line`, given what it carries now. `None` leaves
/// the line as it is.
pub fn classify_edit(current: Option<ChangeKind>, event: &EditEvent) -> Option<ChangeKind> {
    // Typing inside a brand-new line keeps it new.
    if current == Some(ChangeKind::Addition) {
        return None;
    }
    // TODO: a block typed line by line should end up as Addition, but repeated
    // edits on one line can't be told apart from modifying an existing line.
    match event.kind {
        EditKind::Remove | EditKind::Replace if event.shrinks() => Some(ChangeKind::Deletion),
        EditKind::Insert | EditKind::Remove | EditKind::Replace => Some(ChangeKind::Modification),
    }
}
