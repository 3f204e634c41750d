//! Fluence Offline Core - offline support for the Fluence learning site.
//!
//! This crate contains the platform-agnostic pieces behind the site's
//! offline mode: a cache-first response cache with versioned partitions,
//! a durable queue of quiz results and progress updates recorded while
//! offline, and the worker lifecycle that ties them to host events.
//!
//! I/O goes through three seams so every part can run against in-memory
//! doubles: `http::Network`, `cache::CacheStorage` and
//! `storage::KeyValueStore`.

pub mod cache;
pub mod config;
pub mod http;
pub mod queue;
pub mod storage;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{CacheManager, CacheStorage, DiskCacheStorage, MemoryCacheStorage};
pub use config::{Config, InstallMode};
pub use http::{Destination, FetchError, HttpClient, Network, Request, Response};
pub use queue::{ActionKind, Connectivity, OfflineAction, OfflineQueue};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use worker::{EventOutcome, LifecycleEvent, ServiceWorker, WorkerError, WorkerState};
