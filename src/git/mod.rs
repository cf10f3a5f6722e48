mod diff;
mod status;

pub use diff::{
    diff_hash, parse_diff, parse_hunk_header, ChangeKind, DiffFormat, HunkHeader,
    LineAnnotations, ParseFailure, ParsedDiff,
};
pub use status::{
    parse_numstat, DiffRequest, GitClient, NumstatEntry, VersionControlClient,
};
