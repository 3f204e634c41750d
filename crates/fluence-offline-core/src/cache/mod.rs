//! Versioned response cache for offline asset access.
//!
//! This module provides the `CacheManager`, which serves requests cache-first
//! out of two named partitions:
//! - static: filled from a fixed manifest at install time
//! - dynamic: filled at runtime for whitelisted URLs
//!
//! Partition names embed the cache version; activation deletes every
//! partition that doesn't match the current names. There is no TTL or LRU.

pub mod error;
pub mod fallback;
pub mod manager;
pub mod storage;

pub use error::CacheError;
pub use manager::{ActivationReport, CacheManager, FailedAsset, InstallReport};
pub use storage::{CacheStorage, DiskCacheStorage, MemoryCacheStorage};
