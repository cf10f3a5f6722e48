mod edit;
mod navigate;
mod refresh;
mod state;

pub use edit::{classify_edit, EditEvent, EditKind};
pub use navigate::{next_change, previous_change};
pub use refresh::{DiffRefreshCoordinator, RefreshHandle, RefreshOutcome};
pub use state::{DiffRecord, DiffStateStore, DocumentId};
