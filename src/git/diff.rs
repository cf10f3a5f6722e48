use crate::error::ParseError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// How a line of the current document differs from the reference revision.
/// Unchanged lines carry no annotation at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Addition,
    Modification,
    /// Gap marker: lines were removed just above this one.
    Deletion,
}

impl ChangeKind {
    pub fn symbol(&self) -> &'static str {
        match self {
            ChangeKind::Addition => "+",
            ChangeKind::Modification => "~",
            ChangeKind::Deletion => "_",
        }
    }
}

/// Textual grammar of the hunk bodies handed to [`parse_diff`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffFormat {
    /// Classic unified diff with a `+`/`-`/` ` prefix column
    #[default]
    Unified,
    /// `git diff --word-diff=plain`: no prefix column, `[-…-]` and `{+…+}` markers inline.
    ///
    /// Git shows a removed blank line or a whitespace-only re-indent as a
    /// plain context line here, so those changes get no marker even though
    /// numstat counts them. Joined lines also print fewer body lines than
    /// the header counts, so a new header or `diff --git` line always ends
    /// the current hunk.
    WordDiff,
}

/// Line number (1-based, current document) → change kind, sorted by line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineAnnotations(BTreeMap<usize, ChangeKind>);

impl LineAnnotations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, line: usize) -> Option<ChangeKind> {
        self.0.get(&line).copied()
    }

    pub fn insert(&mut self, line: usize, kind: ChangeKind) {
        self.0.insert(line, kind);
    }

    /// Attach a deletion gap marker unless the line is already claimed.
    pub fn mark_gap(&mut self, line: usize) {
        self.0.entry(line).or_insert(ChangeKind::Deletion);
    }

    pub fn remove(&mut self, line: usize) -> Option<ChangeKind> {
        self.0.remove(&line)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, ChangeKind)> + '_ {
        self.0.iter().map(|(line, kind)| (*line, *kind))
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.0.values().filter(|k| **k == kind).count()
    }

    /// Drop annotations that no longer fit a document of `line_count` lines.
    /// A deletion marker may sit one past the end (content removed at the tail).
    pub fn retain_within(&mut self, line_count: usize) {
        self.0.retain(|line, kind| match kind {
            ChangeKind::Deletion => *line <= line_count + 1,
            _ => *line <= line_count,
        });
    }

    pub(crate) fn as_map(&self) -> &BTreeMap<usize, ChangeKind> {
        &self.0
    }
}

impl FromIterator<(usize, ChangeKind)> for LineAnnotations {
    fn from_iter<I: IntoIterator<Item = (usize, ChangeKind)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Result of parsing one file's diff
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDiff {
    pub annotations: LineAnnotations,
    /// Added content lines seen in hunk bodies
    pub insertions: usize,
    /// Removed content lines seen in hunk bodies
    pub deletions: usize,
    pub hunks: usize,
}

/// One or more hunk headers were unreadable. `partial` holds every hunk
/// that did parse, before and after the bad ones.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} malformed hunk header(s) in diff", .errors.len())]
pub struct ParseFailure {
    pub errors: Vec<ParseError>,
    pub partial: ParsedDiff,
}

/// Hunk header ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkHeader {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
}

/// SHA-256 of the raw diff text, hex encoded
pub fn diff_hash(raw_diff: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_diff.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parse a single file's diff into per-line annotations.
///
/// Empty input is a valid "no changes" diff. A malformed hunk header only
/// loses that hunk; see [`ParseFailure`].
pub fn parse_diff(raw: &str, format: DiffFormat) -> Result<ParsedDiff, ParseFailure> {
    let mut parsed = ParsedDiff::default();
    let mut errors = Vec::new();
    let mut hunk: Option<HunkWalker> = None;

    for (idx, line) in raw.lines().enumerate() {
        if let Some(walker) = hunk.as_mut() {
            if walker.is_open() && !ends_word_diff_hunk(line, format) {
                walker.feed(classify_body_line(line, format), &mut parsed);
                continue;
            }
            walker.finish(&mut parsed);
            hunk = None;
        }

        // Outside a hunk body: either a new hunk or file header noise
        // (diff --git, index, ---, +++, mode lines, "\ No newline").
        if line.starts_with("@@") {
            match parse_hunk_header(line) {
                Some(header) => {
                    parsed.hunks += 1;
                    hunk = Some(HunkWalker::new(header));
                }
                None => errors.push(ParseError::MalformedHunkHeader {
                    line: idx + 1,
                    header: line.to_string(),
                }),
            }
        }
    }

    if let Some(mut walker) = hunk {
        walker.finish(&mut parsed);
    }

    if errors.is_empty() {
        Ok(parsed)
    } else {
        Err(ParseFailure {
            errors,
            partial: parsed,
        })
    }
}

/// Word-diff hunk bodies can run short of their header counts.
fn ends_word_diff_hunk(line: &str, format: DiffFormat) -> bool {
    format == DiffFormat::WordDiff
        && (line.starts_with("diff --git ") || parse_hunk_header(line).is_some())
}

/// Parse a hunk header like "@@ -10,4 +10,15 @@ fn foo()"
pub fn parse_hunk_header(line: &str) -> Option<HunkHeader> {
    let after_first = line.strip_prefix("@@ ")?;
    let end_idx = after_first.find(" @@")?;
    let range_str = &after_first[..end_idx];

    // Parse "-old_start,old_count +new_start,new_count"
    let mut parts = range_str.split_whitespace();
    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;
    if parts.next().is_some() {
        return None;
    }

    let (old_start, old_count) = parse_range(old)?;
    let (new_start, new_count) = parse_range(new)?;

    Some(HunkHeader {
        old_start,
        old_count,
        new_start,
        new_count,
    })
}

/// Parse "start,count" or just "start" (count defaults to 1)
fn parse_range(s: &str) -> Option<(usize, usize)> {
    if let Some((start, count)) = s.split_once(',') {
        Some((start.parse().ok()?, count.parse().ok()?))
    } else {
        Some((s.parse().ok()?, 1))
    }
}

/// What a hunk body line means for line classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLine {
    Context,
    Added,
    Removed,
    /// Word-diff line with changes inside an existing line
    Edited,
    /// "\ No newline at end of file"
    NoNewline,
}

fn classify_body_line(line: &str, format: DiffFormat) -> BodyLine {
    if line.starts_with("\\ ") {
        return BodyLine::NoNewline;
    }
    match format {
        DiffFormat::Unified => match line.as_bytes().first() {
            Some(b'+') => BodyLine::Added,
            Some(b'-') => BodyLine::Removed,
            _ => BodyLine::Context,
        },
        DiffFormat::WordDiff => classify_word_diff_line(line),
    }
}

/// A leading `+`/`-` is content here: only complete `{+…+}` / `[-…-]`
/// markers count, and any text outside them means the line survived.
fn classify_word_diff_line(line: &str) -> BodyLine {
    let mut rest = line;
    let mut added = false;
    let mut removed = false;
    let mut plain = false;

    while !rest.is_empty() {
        if let Some((after, found)) = take_marker(rest, "{+", "+}") {
            added |= found;
            plain |= !found;
            rest = after;
            continue;
        }
        if let Some((after, found)) = take_marker(rest, "[-", "-]") {
            removed |= found;
            plain |= !found;
            rest = after;
            continue;
        }
        let next = rest
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == '{' || *c == '[')
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        plain = true;
        rest = &rest[next..];
    }

    match (added, removed, plain) {
        (false, false, _) => BodyLine::Context,
        (true, false, false) => BodyLine::Added,
        (false, true, false) => BodyLine::Removed,
        _ => BodyLine::Edited,
    }
}

/// Strip one marker off the front of `s`. Returns the remainder and whether
/// the marker was closed; an unclosed opener swallows the rest as text.
fn take_marker<'a>(s: &'a str, open: &str, close: &str) -> Option<(&'a str, bool)> {
    let after = s.strip_prefix(open)?;
    match after.find(close) {
        Some(end) => Some((&after[end + close.len()..], true)),
        None => Some(("", false)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Run {
    Idle,
    /// Removed lines not yet followed by any addition
    Removing,
    /// Additions directly after removals: an edited block
    Pairing,
}

/// Walks one hunk body, bounded by the header's line counts.
struct HunkWalker {
    cursor: usize,
    old_remaining: usize,
    new_remaining: usize,
    run: Run,
}

impl HunkWalker {
    fn new(header: HunkHeader) -> Self {
        // "+6,0" means "after line 6": the next current line is 7.
        let cursor = if header.new_count == 0 {
            header.new_start + 1
        } else {
            header.new_start
        };
        Self {
            cursor,
            old_remaining: header.old_count,
            new_remaining: header.new_count,
            run: Run::Idle,
        }
    }

    fn is_open(&self) -> bool {
        self.old_remaining > 0 || self.new_remaining > 0
    }

    fn feed(&mut self, line: BodyLine, parsed: &mut ParsedDiff) {
        match line {
            BodyLine::Context => {
                self.flush(parsed);
                self.advance_both();
            }
            BodyLine::Added => {
                parsed.insertions += 1;
                let kind = match self.run {
                    Run::Removing | Run::Pairing => {
                        self.run = Run::Pairing;
                        ChangeKind::Modification
                    }
                    Run::Idle => ChangeKind::Addition,
                };
                parsed.annotations.insert(self.cursor, kind);
                self.cursor += 1;
                self.new_remaining = self.new_remaining.saturating_sub(1);
            }
            BodyLine::Removed => {
                parsed.deletions += 1;
                self.run = Run::Removing;
                self.old_remaining = self.old_remaining.saturating_sub(1);
            }
            BodyLine::Edited => {
                self.flush(parsed);
                parsed.insertions += 1;
                parsed.deletions += 1;
                parsed
                    .annotations
                    .insert(self.cursor, ChangeKind::Modification);
                self.advance_both();
            }
            BodyLine::NoNewline => {}
        }
    }

    fn advance_both(&mut self) {
        self.cursor += 1;
        self.old_remaining = self.old_remaining.saturating_sub(1);
        self.new_remaining = self.new_remaining.saturating_sub(1);
    }

    /// A removal run with no additions leaves one gap marker on the line
    /// that now follows it.
    fn flush(&mut self, parsed: &mut ParsedDiff) {
        if self.run == Run::Removing {
            parsed.annotations.mark_gap(self.cursor);
        }
        self.run = Run::Idle;
    }

    fn finish(&mut self, parsed: &mut ParsedDiff) {
        self.flush(parsed);
    }
}
