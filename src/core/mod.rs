pub mod comparator;
pub mod engine;
pub mod index;
pub mod queue;
pub mod remote_index;
pub mod run_log;
pub mod scanner;
pub mod target_state;
pub mod transfer;
pub mod trash;

pub use comparator::{
    CompareMode, CompareSummary, FolderResult, PullScanSummary, PullTargetResult,
    RecommendedAction, TargetStatus,
};
pub use engine::{ActionProgress, ActionReport, SyncEngine, TransferCounts};
pub use index::{FileIndex, IndexEntry};
pub use queue::{ActionQueue, QueueAction, QueueEvent, QueueItem, QueueItemStatus, QueueRunner};
pub use remote_index::{IndexMutation, RemoteIndexCopy, RemoteIndexSync, REMOTE_INDEX_FILENAME};
pub use scanner::{FileScanner, ScanConfig};
pub use target_state::{TargetStateStore, TargetStates};
