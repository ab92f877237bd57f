pub mod entry;
pub mod metadata;

pub use entry::{BranchRecord, BranchStatus, Entry, EntryKind, SleepState};
pub use metadata::{EntryMetadata, MetaStatus};
