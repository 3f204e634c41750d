use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{join_all, try_join_all};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::fallback;
use super::storage::CacheStorage;
use super::CacheError;
use crate::config::{Config, InstallMode};
use crate::http::{Destination, FetchError, Method, Network, Request, Response, ResponseType};

/// An asset that couldn't be cached during install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAsset {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub cached: Vec<String>,
    pub failed: Vec<FailedAsset>,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    pub deleted: Vec<String>,
    pub clients_claimed: bool,
}

/// Cache-first request handling over a static and a dynamic partition.
pub struct CacheManager {
    config: Arc<Config>,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    /// Dynamic-cache writes still in flight
    pending_writes: Mutex<JoinSet<()>>,
    clients_claimed: AtomicBool,
}

impl CacheManager {
    pub fn new(config: Arc<Config>, storage: Arc<dyn CacheStorage>, network: Arc<dyn Network>) -> Self {
        Self {
            config,
            storage,
            network,
            pending_writes: Mutex::new(JoinSet::new()),
            clients_claimed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    pub fn static_cache_name(&self) -> String {
        self.config.static_cache_name()
    }

    pub fn dynamic_cache_name(&self) -> String {
        self.config.dynamic_cache_name()
    }

    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed.load(Ordering::SeqCst)
    }

    // ===== Install =====

    /// Fetch the static manifest into the static partition.
    ///
    /// In `PerAsset` mode every failure is reported in the returned
    /// `InstallReport` and the install still succeeds. In `Atomic` mode a
    /// failing same-origin asset fails the whole install and nothing
    /// same-origin is written; cross-origin assets are isolated in both modes.
    pub async fn install(&self) -> Result<InstallReport, CacheError> {
        let static_name = self.static_cache_name();
        info!(cache = %static_name, mode = ?self.config.install_mode, "Caching static assets");
        self.storage.open(&static_name).await?;

        let mut report = InstallReport::default();
        let mut same_origin = Vec::new();
        let mut cross_origin = Vec::new();

        for asset in &self.config.static_assets {
            match self.config.resolve(asset) {
                Ok(url) if self.config.is_same_origin(&url) => same_origin.push(url),
                Ok(url) => cross_origin.push(url),
                Err(e) => {
                    warn!(asset = %asset, error = %e, "Skipping unparseable manifest entry");
                    report.failed.push(FailedAsset {
                        url: asset.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let (same_results, cross_results) = tokio::join!(
            join_all(same_origin.iter().map(|url| self.fetch_asset(url))),
            join_all(cross_origin.iter().map(|url| self.fetch_asset(url))),
        );

        if self.config.install_mode == InstallMode::Atomic {
            let failed: Vec<String> = same_origin
                .iter()
                .zip(&same_results)
                .filter(|(_, result)| result.is_err())
                .map(|(url, _)| url.to_string())
                .collect();
            if !failed.is_empty() || !report.failed.is_empty() {
                for (url, result) in same_origin.iter().zip(&same_results) {
                    if let Err(e) = result {
                        warn!(url = %url, error = %e, "Critical asset failed, aborting install");
                    }
                }
                let mut failed = failed;
                failed.extend(report.failed.iter().map(|f| f.url.clone()));
                return Err(CacheError::InstallFailed { failed });
            }
        }

        let results = same_origin
            .iter()
            .zip(same_results)
            .chain(cross_origin.iter().zip(cross_results));

        for (url, result) in results {
            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    // Cross-origin fonts are the usual casualty; the page works without them
                    warn!(url = %url, error = %e, "Static asset caching failed");
                    report.failed.push(FailedAsset {
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            match self.storage.put(&static_name, url.as_str(), &response).await {
                Ok(()) => report.cached.push(url.to_string()),
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to store static asset");
                    report.failed.push(FailedAsset {
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Static install finished"
        );
        Ok(report)
    }

    /// Fetch one manifest asset; anything but a 2xx is a failure.
    async fn fetch_asset(&self, url: &Url) -> Result<Response, FetchError> {
        let response = self.network.fetch(&Request::get(url.clone())).await?;
        if !response.is_ok() {
            return Err(FetchError::from_status(response.status, &response.text()));
        }
        Ok(response)
    }

    // ===== Activate =====

    /// Delete every partition that isn't the current static or dynamic one,
    /// then take control of open clients.
    pub async fn activate(&self) -> Result<ActivationReport, CacheError> {
        let keep = [self.static_cache_name(), self.dynamic_cache_name()];

        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| !keep.contains(name))
            .collect();

        let deletions = try_join_all(stale.iter().map(|name| async move {
            info!(cache = %name, "Deleting old cache");
            self.storage.delete(name).await.map(|existed| (name.clone(), existed))
        }))
        .await?;

        let deleted = deletions
            .into_iter()
            .filter_map(|(name, existed)| existed.then_some(name))
            .collect();

        self.clients_claimed.store(true, Ordering::SeqCst);
        info!("Cache activation complete");

        Ok(ActivationReport {
            deleted,
            clients_claimed: true,
        })
    }

    // ===== Fetch =====

    /// Only GET requests over http(s) are intercepted.
    pub fn should_intercept(request: &Request) -> bool {
        request.method == Method::Get && request.is_http()
    }

    /// Handle an intercepted request cache-first.
    ///
    /// Returns `Ok(None)` when the request isn't intercepted and should go
    /// straight to the network. Errors only for non-document, non-image
    /// requests that miss the cache while the network is down.
    pub async fn handle_fetch(&self, request: &Request) -> Result<Option<Response>, FetchError> {
        if !Self::should_intercept(request) {
            return Ok(None);
        }

        let key = request.cache_key();
        match self.storage.lookup_any(key).await {
            Ok(Some(cached)) => {
                debug!(url = key, "Serving from cache");
                return Ok(Some(cached));
            }
            Ok(None) => {}
            Err(e) => warn!(url = key, error = %e, "Cache lookup failed, going to network"),
        }

        let response = match self.network.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = key, error = %e, "Network fetch failed");
                return self.offline_fallback(request).await.map(Some);
            }
        };

        if response.status != 200 || response.response_type != ResponseType::Basic {
            return Ok(Some(response));
        }

        if self.config.is_cacheable(key) {
            self.store_in_background(key.to_string(), response.clone());
        }

        Ok(Some(response))
    }

    async fn offline_fallback(&self, request: &Request) -> Result<Response, FetchError> {
        match request.destination {
            Destination::Document => {
                let root = self.config.root_document()?;
                match self.storage.lookup_any(root.as_str()).await {
                    Ok(Some(document)) => Ok(document),
                    Ok(None) => Ok(fallback::offline_page()),
                    Err(e) => {
                        warn!(error = %e, "Failed to read cached root document");
                        Ok(fallback::offline_page())
                    }
                }
            }
            Destination::Image => Ok(fallback::image_placeholder()),
            _ => Err(FetchError::Offline(request.cache_key().to_string())),
        }
    }

    fn pending(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.pending_writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write into the dynamic partition without holding up the response.
    fn store_in_background(&self, url: String, response: Response) {
        let storage = Arc::clone(&self.storage);
        let cache_name = self.dynamic_cache_name();

        let mut pending = self.pending();
        // Reap finished writes so the set doesn't grow without bound
        while pending.try_join_next().is_some() {}

        pending.spawn(async move {
            debug!(url = %url, cache = %cache_name, "Caching new asset");
            if let Err(e) = storage.put(&cache_name, &url, &response).await {
                warn!(url = %url, error = %e, "Dynamic cache write failed");
            }
        });
    }

    /// Number of background cache writes not yet reaped.
    pub fn pending_writes(&self) -> usize {
        self.pending().len()
    }

    /// Wait for every background cache write started so far.
    pub async fn flush(&self) {
        let mut pending = std::mem::replace(&mut *self.pending(), JoinSet::new());
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Background cache write did not complete");
            }
        }
    }
}
