pub mod backup;
pub mod comparator;
pub mod engine;
pub mod executor;
pub mod file_state;
pub mod materialize;
pub mod queue;
pub mod scanner;

pub use backup::{BackupIndex, BackupRecord, BackupStore, RepairReport};
pub use comparator::{metadata_equal, snapshot, DiffSummary, Metadata, TreeDiff};
pub use engine::{wait_for_roots, EngineStats, SyncEngine};
pub use executor::PathState;
pub use file_state::{hash_file, same_content, TrackedFile, TrackedFiles};
pub use materialize::{AccessCounter, AccessTracker};
pub use queue::{ChangeEvent, ChangeKind, SyncAction, SyncTask, TaskQueue, TaskSender};
pub use scanner::{walk, FileScanner, TreeListing};
