//! Partitioned response storage.
//!
//! A `CacheStorage` holds named partitions, each mapping a request URL to a
//! stored response. Partitions are kept in creation order; `lookup_any`
//! searches them in that order. Writes are idempotent overwrites, so
//! concurrent puts for the same URL are last-write-wins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::CacheError;
use crate::http::{Headers, Response, ResponseType};

/// Index of partition names, in creation order
const INDEX_FILE: &str = "partitions.json";

/// Extension of a stored entry: one JSON metadata line, then the raw body
const ENTRY_EXT: &str = "entry";

#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the partition if it doesn't exist yet.
    async fn open(&self, name: &str) -> Result<(), CacheError>;

    /// Partition names in creation order.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Returns false if the partition didn't exist.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// Store a response, opening the partition if needed.
    async fn put(&self, name: &str, url: &str, response: &Response) -> Result<(), CacheError>;

    async fn lookup(&self, name: &str, url: &str) -> Result<Option<Response>, CacheError>;

    /// URLs stored in a partition.
    async fn entries(&self, name: &str) -> Result<Vec<String>, CacheError>;

    /// Exact-URL match across all partitions, first partition wins.
    async fn lookup_any(&self, url: &str) -> Result<Option<Response>, CacheError> {
        for name in self.keys().await? {
            if let Some(response) = self.lookup(&name, url).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

// ============================================================================
// In-memory storage
// ============================================================================

struct Partition {
    name: String,
    entries: HashMap<String, Response>,
}

/// Storage that lives as long as the process. Used in tests and for
/// ephemeral workers.
#[derive(Default)]
pub struct MemoryCacheStorage {
    partitions: RwLock<Vec<Partition>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        let mut partitions = self.partitions.write().await;
        if !partitions.iter().any(|p| p.name == name) {
            partitions.push(Partition {
                name: name.to_string(),
                entries: HashMap::new(),
            });
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.partitions.read().await.iter().map(|p| p.name.clone()).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let mut partitions = self.partitions.write().await;
        let before = partitions.len();
        partitions.retain(|p| p.name != name);
        Ok(partitions.len() != before)
    }

    async fn put(&self, name: &str, url: &str, response: &Response) -> Result<(), CacheError> {
        let mut partitions = self.partitions.write().await;
        match partitions.iter_mut().find(|p| p.name == name) {
            Some(partition) => {
                partition.entries.insert(url.to_string(), response.clone());
            }
            None => {
                let mut entries = HashMap::new();
                entries.insert(url.to_string(), response.clone());
                partitions.push(Partition {
                    name: name.to_string(),
                    entries,
                });
            }
        }
        Ok(())
    }

    async fn lookup(&self, name: &str, url: &str) -> Result<Option<Response>, CacheError> {
        Ok(self
            .partitions
            .read()
            .await
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.entries.get(url).cloned()))
    }

    async fn entries(&self, name: &str) -> Result<Vec<String>, CacheError> {
        let partitions = self.partitions.read().await;
        let mut urls: Vec<String> = partitions
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.entries.keys().cloned().collect())
            .unwrap_or_default();
        urls.sort();
        Ok(urls)
    }
}

// ============================================================================
// On-disk storage
// ============================================================================

/// Metadata line at the head of each entry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    status: u16,
    status_text: String,
    headers: Headers,
    response_type: ResponseType,
    response_url: Option<String>,
    cached_at: DateTime<Utc>,
}

/// Storage under a directory: `partitions.json` lists partition names in
/// creation order, each partition is a subdirectory holding one `.entry`
/// file per URL, named by URL hash.
///
/// An entry file is written to a temporary name and renamed into place, so
/// a reader sees either the previous entry or the new one, never a mix.
pub struct DiskCacheStorage {
    root: PathBuf,
    /// Serializes index rewrites
    index_lock: Mutex<()>,
    /// Distinguishes temporary files of concurrent puts
    write_seq: AtomicU64,
}

impl DiskCacheStorage {
    pub fn new(root: PathBuf) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            index_lock: Mutex::new(()),
            write_seq: AtomicU64::new(0),
        })
    }

    fn hash(value: &str) -> String {
        hex::encode(Sha256::digest(value.as_bytes()))
    }

    fn partition_dir(&self, name: &str) -> PathBuf {
        self.root.join(&Self::hash(name)[..16])
    }

    fn entry_path(&self, name: &str, url: &str) -> PathBuf {
        self.partition_dir(name)
            .join(format!("{}.{}", Self::hash(url), ENTRY_EXT))
    }

    fn encode_entry(meta: &EntryMeta, body: &[u8]) -> Result<Vec<u8>, CacheError> {
        // Compact JSON never contains a raw newline
        let mut bytes = serde_json::to_vec(meta)?;
        bytes.push(b'\n');
        bytes.extend_from_slice(body);
        Ok(bytes)
    }

    fn decode_entry(bytes: &[u8]) -> Result<(EntryMeta, &[u8]), CacheError> {
        let split = bytes.iter().position(|b| *b == b'\n').unwrap_or(bytes.len());
        let meta = serde_json::from_slice(&bytes[..split])?;
        let body = bytes.get(split + 1..).unwrap_or_default();
        Ok((meta, body))
    }

    async fn read_index(&self) -> Result<Vec<String>, CacheError> {
        match tokio::fs::read_to_string(self.root.join(INDEX_FILE)).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_index(&self, names: &[String]) -> Result<(), CacheError> {
        let path = self.root.join(INDEX_FILE);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(names)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        let _guard = self.index_lock.lock().await;
        let mut names = self.read_index().await?;
        tokio::fs::create_dir_all(self.partition_dir(name)).await?;
        if !names.iter().any(|n| n == name) {
            debug!(cache = name, "Opening new cache partition");
            names.push(name.to_string());
            self.write_index(&names).await?;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.read_index().await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let _guard = self.index_lock.lock().await;
        let mut names = self.read_index().await?;
        let before = names.len();
        names.retain(|n| n != name);
        if names.len() == before {
            return Ok(false);
        }
        self.write_index(&names).await?;

        match tokio::fs::remove_dir_all(self.partition_dir(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    async fn put(&self, name: &str, url: &str, response: &Response) -> Result<(), CacheError> {
        self.open(name).await?;

        let path = self.entry_path(name, url);
        let meta = EntryMeta {
            url: url.to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            response_type: response.response_type,
            response_url: response.url.clone(),
            cached_at: Utc::now(),
        };

        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("{}.tmp", seq));
        tokio::fs::write(&tmp, Self::encode_entry(&meta, &response.body)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn lookup(&self, name: &str, url: &str) -> Result<Option<Response>, CacheError> {
        let bytes = match tokio::fs::read(self.entry_path(name, url)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (meta, body) = Self::decode_entry(&bytes)?;

        // Hash collision guard
        if meta.url != url {
            return Ok(None);
        }

        Ok(Some(Response {
            status: meta.status,
            status_text: meta.status_text,
            headers: meta.headers,
            body: body.to_vec(),
            response_type: meta.response_type,
            url: meta.response_url,
        }))
    }

    async fn entries(&self, name: &str) -> Result<Vec<String>, CacheError> {
        let mut dir = match tokio::fs::read_dir(self.partition_dir(name)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut urls = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match Self::decode_entry(&bytes) {
                Ok((meta, _)) => urls.push(meta.url),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable cache entry"),
            }
        }
        urls.sort();
        Ok(urls)
    }
}
