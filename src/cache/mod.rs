pub mod entry;
pub mod manager;
pub mod storage;

pub use entry::{CandleCacheEntry, MergeOutcome};
pub use manager::{CacheStats, CandleCacheManager, SweeperHandle};
pub use storage::{storage_key, CandleStorage, FileStorage, MemoryStorage};
