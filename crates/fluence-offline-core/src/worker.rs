//! Worker lifecycle: routes host events to the cache manager and the
//! offline queue.
//!
//! A `ServiceWorker` is built once per worker context with injected storage
//! and network. Its lifecycle state is persisted in key-value storage, so a
//! fresh context picks up where the last one left off:
//!
//! `Parsed -> Installing -> Installed -> Activating -> Activated`
//!
//! with `Redundant` when install fails. The state is stored with the cache
//! version it belongs to; a worker built for a different version starts over
//! at `Parsed`, the way a newly deployed script does.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{ActivationReport, CacheError, CacheManager, CacheStorage, InstallReport};
use crate::config::Config;
use crate::http::{FetchError, Network, Request, Response};
use crate::queue::{
    ActionSink, Connectivity, DrainReport, HttpActionSink, OfflineQueue, QueueError,
};
use crate::storage::{KeyValueStore, StorageError};

/// Key the lifecycle state is persisted under
const STATE_KEY: &str = "fluence_worker_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl WorkerState {
    /// State to resume from when a worker context was torn down mid-transition.
    /// An unfinished install starts over, an unfinished activation retries.
    fn interrupted(self) -> Self {
        match self {
            WorkerState::Installing => WorkerState::Parsed,
            WorkerState::Activating => WorkerState::Installed,
            other => other,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    cache_version: String,
    state: WorkerState,
}

/// Events delivered by the host runtime.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Install,
    Activate,
    Fetch(Request),
    Sync { tag: String },
    Online,
    Offline,
}

impl LifecycleEvent {
    fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Install => "install",
            LifecycleEvent::Activate => "activate",
            LifecycleEvent::Fetch(_) => "fetch",
            LifecycleEvent::Sync { .. } => "sync",
            LifecycleEvent::Online => "online",
            LifecycleEvent::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Installed(InstallReport),
    Activated(ActivationReport),
    /// Answered by the cache manager
    Response(Response),
    /// Not intercepted; fetched straight from the network
    Passthrough(Response),
    Synced(DrainReport),
    Reconnected(DrainReport),
    Disconnected,
    /// Sync tag this worker doesn't handle
    Ignored,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Cannot handle {event} while {state}")]
    InvalidState {
        event: &'static str,
        state: WorkerState,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Corrupt worker state: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct ServiceWorker {
    config: Arc<Config>,
    cache: CacheManager,
    queue: OfflineQueue,
    network: Arc<dyn Network>,
    store: Arc<dyn KeyValueStore>,
    state: Mutex<WorkerState>,
}

impl ServiceWorker {
    /// Build a worker that replays queued actions over HTTP to the configured
    /// endpoints.
    pub async fn new(
        config: Config,
        cache_storage: Arc<dyn CacheStorage>,
        store: Arc<dyn KeyValueStore>,
        network: Arc<dyn Network>,
    ) -> Result<Self, WorkerError> {
        let sink = Arc::new(HttpActionSink::new(Arc::clone(&network), &config)?);
        Self::with_sink(config, cache_storage, store, network, sink).await
    }

    pub async fn with_sink(
        config: Config,
        cache_storage: Arc<dyn CacheStorage>,
        store: Arc<dyn KeyValueStore>,
        network: Arc<dyn Network>,
        sink: Arc<dyn ActionSink>,
    ) -> Result<Self, WorkerError> {
        let config = Arc::new(config);

        let state = match store.get(STATE_KEY).await? {
            Some(stored) => {
                let persisted: PersistedState = serde_json::from_str(&stored)?;
                if persisted.cache_version == config.cache_version {
                    persisted.state.interrupted()
                } else {
                    info!(
                        previous = %persisted.cache_version,
                        current = %config.cache_version,
                        "New cache version, starting a fresh worker"
                    );
                    WorkerState::Parsed
                }
            }
            None => WorkerState::Parsed,
        };
        debug!(%state, "Worker state restored");

        let initial = if config.start_online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };
        let queue = OfflineQueue::load(Arc::clone(&store), sink, &config.queue_key, initial).await?;
        let cache = CacheManager::new(Arc::clone(&config), cache_storage, Arc::clone(&network));

        Ok(Self {
            config,
            cache,
            queue,
            network,
            store,
            state: Mutex::new(state),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn set_state(&self, state: WorkerState) -> Result<(), WorkerError> {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
        let persisted = PersistedState {
            cache_version: self.config.cache_version.clone(),
            state,
        };
        self.store.set(STATE_KEY, &serde_json::to_string(&persisted)?).await?;
        debug!(%state, "Worker state changed");
        Ok(())
    }

    fn require(&self, event: &'static str, allowed: &[WorkerState]) -> Result<(), WorkerError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(WorkerError::InvalidState { event, state })
        }
    }

    /// Handle one host event.
    ///
    /// `Install`, `Activate` and `Sync` complete their side effects before
    /// returning. `Fetch` returns as soon as a response is available; any
    /// dynamic-cache write it starts continues in the background.
    pub async fn dispatch(&self, event: LifecycleEvent) -> Result<EventOutcome, WorkerError> {
        let name = event.name();
        match event {
            LifecycleEvent::Install => {
                self.require(name, &[WorkerState::Parsed, WorkerState::Redundant])?;
                self.install().await.map(EventOutcome::Installed)
            }
            LifecycleEvent::Activate => {
                self.require(name, &[WorkerState::Installed])?;
                self.activate().await.map(EventOutcome::Activated)
            }
            LifecycleEvent::Fetch(request) => self.fetch(&request).await,
            LifecycleEvent::Sync { tag } => {
                if tag != self.config.sync_tag {
                    debug!(tag = %tag, "Ignoring unknown sync tag");
                    return Ok(EventOutcome::Ignored);
                }
                info!(tag = %tag, "Background sync");
                Ok(EventOutcome::Synced(self.queue.drain().await?))
            }
            LifecycleEvent::Online => Ok(EventOutcome::Reconnected(self.queue.go_online().await?)),
            LifecycleEvent::Offline => {
                self.queue.go_offline().await?;
                Ok(EventOutcome::Disconnected)
            }
        }
    }

    async fn install(&self) -> Result<InstallReport, WorkerError> {
        info!("Worker installing");
        self.set_state(WorkerState::Installing).await?;

        match self.cache.install().await {
            Ok(report) => {
                // Skip waiting: ready to activate right away
                self.set_state(WorkerState::Installed).await?;
                info!("Worker installed");
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "Worker install failed");
                self.set_state(WorkerState::Redundant).await?;
                Err(e.into())
            }
        }
    }

    async fn activate(&self) -> Result<ActivationReport, WorkerError> {
        info!("Worker activating");
        self.set_state(WorkerState::Activating).await?;
        let report = match self.cache.activate().await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Worker activation failed, staying installed");
                self.set_state(WorkerState::Installed).await?;
                return Err(e.into());
            }
        };
        self.set_state(WorkerState::Activated).await?;
        info!(deleted = report.deleted.len(), "Worker activated");
        Ok(report)
    }

    async fn fetch(&self, request: &Request) -> Result<EventOutcome, WorkerError> {
        // Until activation the page talks to the network directly
        if self.state() == WorkerState::Activated {
            if let Some(response) = self.cache.handle_fetch(request).await? {
                return Ok(EventOutcome::Response(response));
            }
        }
        Ok(EventOutcome::Passthrough(self.network.fetch(request).await?))
    }

    /// Wait for background cache writes; call before discarding the worker
    /// if they must not be lost.
    pub async fn shutdown(&self) {
        self.cache.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::http::Method;
    use crate::storage::MemoryStore;
    use crate::test_support::{ok, FakeNetwork, ORIGIN};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use url::Url;

    struct Harness {
        network: Arc<FakeNetwork>,
        cache_storage: Arc<MemoryCacheStorage>,
        store: Arc<MemoryStore>,
    }

    impl Harness {
        fn new() -> Self {
            let network = Arc::new(FakeNetwork::new());
            network.respond(&url("/"), ok("<html>root</html>"));
            network.respond(&url("/manifest.json"), ok("{}"));
            Self {
                network,
                cache_storage: Arc::new(MemoryCacheStorage::new()),
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn config() -> Config {
            Config {
                origin: ORIGIN.to_string(),
                static_assets: vec!["/".to_string(), "/manifest.json".to_string()],
                ..Config::default()
            }
        }

        async fn worker(&self, config: Config) -> ServiceWorker {
            ServiceWorker::new(
                config,
                self.cache_storage.clone(),
                self.store.clone(),
                self.network.clone(),
            )
            .await
            .expect("worker")
        }
    }

    fn url(path: &str) -> String {
        format!("{}{}", ORIGIN, path)
    }

    fn get(path: &str) -> Request {
        Request::get(Url::parse(&url(path)).expect("url"))
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let harness = Harness::new();
        let worker = harness.worker(Harness::config()).await;
        assert_eq!(worker.state(), WorkerState::Parsed);

        let outcome = worker.dispatch(LifecycleEvent::Install).await.expect("install");
        assert!(matches!(outcome, EventOutcome::Installed(ref r) if r.cached.len() == 2));
        assert_eq!(worker.state(), WorkerState::Installed);

        let outcome = worker.dispatch(LifecycleEvent::Activate).await.expect("activate");
        assert!(matches!(outcome, EventOutcome::Activated(ref r) if r.clients_claimed));
        assert_eq!(worker.state(), WorkerState::Activated);

        harness.network.reset_calls();
        let outcome = worker.dispatch(LifecycleEvent::Fetch(get("/"))).await.expect("fetch");
        match outcome {
            EventOutcome::Response(response) => assert_eq!(response.text(), "<html>root</html>"),
            other => panic!("expected cached response, got {other:?}"),
        }
        assert_eq!(harness.network.calls(), 0);
    }

    #[tokio::test]
    async fn test_state_survives_new_worker() {
        let harness = Harness::new();
        {
            let worker = harness.worker(Harness::config()).await;
            worker.dispatch(LifecycleEvent::Install).await.expect("install");
        }

        let worker = harness.worker(Harness::config()).await;
        assert_eq!(worker.state(), WorkerState::Installed);
        worker.dispatch(LifecycleEvent::Activate).await.expect("activate");
    }

    #[tokio::test]
    async fn test_activate_before_install_is_rejected() {
        let harness = Harness::new();
        let worker = harness.worker(Harness::config()).await;

        let result = worker.dispatch(LifecycleEvent::Activate).await;
        assert!(matches!(
            result,
            Err(WorkerError::InvalidState {
                event: "activate",
                state: WorkerState::Parsed
            })
        ));
    }

    #[tokio::test]
    async fn test_failed_atomic_install_makes_worker_redundant() {
        let harness = Harness::new();
        harness.network.respond(&url("/manifest.json"), Response::new(404, ""));
        let config = Config {
            install_mode: crate::config::InstallMode::Atomic,
            ..Harness::config()
        };
        let worker = harness.worker(config).await;

        assert!(worker.dispatch(LifecycleEvent::Install).await.is_err());
        assert_eq!(worker.state(), WorkerState::Redundant);
    }

    #[tokio::test]
    async fn test_fetch_before_activation_passes_through() {
        let harness = Harness::new();
        let worker = harness.worker(Harness::config()).await;

        let outcome = worker.dispatch(LifecycleEvent::Fetch(get("/"))).await.expect("fetch");
        assert!(matches!(outcome, EventOutcome::Passthrough(_)));
        assert_eq!(harness.network.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_get_passes_through_after_activation() {
        let harness = Harness::new();
        harness.network.respond(&url("/api/progress"), ok("{}"));
        let worker = harness.worker(Harness::config()).await;
        worker.dispatch(LifecycleEvent::Install).await.expect("install");
        worker.dispatch(LifecycleEvent::Activate).await.expect("activate");

        let request = Request::post_json(Url::parse(&url("/api/progress")).expect("url"), &json!({}))
            .expect("post");
        let outcome = worker.dispatch(LifecycleEvent::Fetch(request)).await.expect("fetch");
        match outcome {
            EventOutcome::Passthrough(response) => assert_eq!(response.status, 200),
            other => panic!("expected passthrough, got {other:?}"),
        }
        let last = harness.network.requests().pop().expect("request recorded");
        assert_eq!(last.method, Method::Post);
    }

    #[tokio::test]
    async fn test_sync_tag_drains_queue() {
        let harness = Harness::new();
        harness.network.respond(&url("/api/quiz-results"), ok("{}"));
        let worker = harness.worker(Harness::config()).await;
        worker
            .queue()
            .enqueue_raw("quiz_result", json!({"score": 8}))
            .await
            .expect("enqueue");

        let outcome = worker
            .dispatch(LifecycleEvent::Sync {
                tag: "other-tag".to_string(),
            })
            .await
            .expect("sync");
        assert_eq!(outcome, EventOutcome::Ignored);
        assert_eq!(worker.queue().len().await, 1);

        let outcome = worker
            .dispatch(LifecycleEvent::Sync {
                tag: "quiz-results".to_string(),
            })
            .await
            .expect("sync");
        assert!(matches!(outcome, EventOutcome::Synced(r) if r.delivered == 1));
        assert!(worker.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_connectivity_events() {
        let harness = Harness::new();
        harness.network.respond(&url("/api/progress"), ok("{}"));
        let worker = harness.worker(Harness::config()).await;

        assert_eq!(
            worker.dispatch(LifecycleEvent::Offline).await.expect("offline"),
            EventOutcome::Disconnected
        );
        assert_eq!(worker.queue().connectivity(), Connectivity::Offline);

        worker
            .queue()
            .enqueue_raw("progress_update", json!({"lesson": 4}))
            .await
            .expect("enqueue");
        let outcome = worker.dispatch(LifecycleEvent::Online).await.expect("online");
        assert!(matches!(outcome, EventOutcome::Reconnected(r) if r.delivered == 1 && r.remaining == 0));
        assert_eq!(worker.queue().connectivity(), Connectivity::Online);
    }

    #[tokio::test]
    async fn test_version_bump_evicts_previous_partitions() {
        let harness = Harness::new();
        let old = harness.worker(Harness::config()).await;
        old.dispatch(LifecycleEvent::Install).await.expect("install");
        old.dispatch(LifecycleEvent::Activate).await.expect("activate");
        drop(old);

        let config = Config {
            cache_version: "v2.2".to_string(),
            ..Harness::config()
        };
        let new = harness.worker(config).await;
        assert_eq!(new.state(), WorkerState::Parsed);
        new.dispatch(LifecycleEvent::Install).await.expect("install");
        let outcome = new.dispatch(LifecycleEvent::Activate).await.expect("activate");

        match outcome {
            EventOutcome::Activated(report) => {
                assert_eq!(report.deleted, vec!["fluence-static-v2.1".to_string()]);
            }
            other => panic!("expected activation, got {other:?}"),
        }
        assert_eq!(
            harness.cache_storage.keys().await.expect("keys"),
            vec!["fluence-static-v2.2"]
        );
    }

    /// Memory storage whose next `keys()` call fails once when armed.
    #[derive(Default)]
    struct FlakyCacheStorage {
        inner: MemoryCacheStorage,
        fail_keys: AtomicBool,
    }

    #[async_trait]
    impl CacheStorage for FlakyCacheStorage {
        async fn open(&self, name: &str) -> Result<(), CacheError> {
            self.inner.open(name).await
        }

        async fn keys(&self) -> Result<Vec<String>, CacheError> {
            if self.fail_keys.swap(false, Ordering::SeqCst) {
                return Err(CacheError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk unavailable",
                )));
            }
            self.inner.keys().await
        }

        async fn delete(&self, name: &str) -> Result<bool, CacheError> {
            self.inner.delete(name).await
        }

        async fn put(&self, name: &str, url: &str, response: &Response) -> Result<(), CacheError> {
            self.inner.put(name, url, response).await
        }

        async fn lookup(&self, name: &str, url: &str) -> Result<Option<Response>, CacheError> {
            self.inner.lookup(name, url).await
        }

        async fn entries(&self, name: &str) -> Result<Vec<String>, CacheError> {
            self.inner.entries(name).await
        }
    }

    #[tokio::test]
    async fn test_failed_activation_can_be_retried() {
        let harness = Harness::new();
        let caches = Arc::new(FlakyCacheStorage::default());
        let build = || {
            ServiceWorker::new(
                Harness::config(),
                caches.clone(),
                harness.store.clone(),
                harness.network.clone(),
            )
        };

        let worker = build().await.expect("worker");
        worker.dispatch(LifecycleEvent::Install).await.expect("install");
        caches.fail_keys.store(true, Ordering::SeqCst);
        let result = worker.dispatch(LifecycleEvent::Activate).await;
        assert!(matches!(result, Err(WorkerError::Cache(_))));
        assert_eq!(worker.state(), WorkerState::Installed);
        drop(worker);

        let fresh = build().await.expect("fresh worker");
        assert_eq!(fresh.state(), WorkerState::Installed);
        fresh.dispatch(LifecycleEvent::Activate).await.expect("retry activate");
        assert_eq!(fresh.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_interrupted_transitions_resume() {
        for (stored, resumed) in [
            (WorkerState::Installing, WorkerState::Parsed),
            (WorkerState::Activating, WorkerState::Installed),
            (WorkerState::Activated, WorkerState::Activated),
        ] {
            let harness = Harness::new();
            let persisted = PersistedState {
                cache_version: Harness::config().cache_version,
                state: stored,
            };
            harness
                .store
                .set(STATE_KEY, &serde_json::to_string(&persisted).expect("encode"))
                .await
                .expect("seed");

            let worker = harness.worker(Harness::config()).await;
            assert_eq!(worker.state(), resumed, "resuming from {stored}");
        }
    }

    #[tokio::test]
    async fn test_offline_survives_new_worker() {
        let harness = Harness::new();
        harness.network.respond(&url("/api/quiz-results"), ok("{}"));

        let worker = harness.worker(Harness::config()).await;
        worker.dispatch(LifecycleEvent::Offline).await.expect("offline");
        drop(worker);

        let next = harness.worker(Harness::config()).await;
        assert_eq!(next.queue().connectivity(), Connectivity::Offline);
        harness.network.reset_calls();
        let outcome = next
            .queue()
            .submit(crate::queue::ActionKind::QuizResult, json!({"score": 7}))
            .await
            .expect("submit");
        assert_eq!(outcome, crate::queue::SubmitOutcome::Queued(1));
        assert_eq!(harness.network.calls(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_queue_does_not_block_cached_assets() {
        let harness = Harness::new();
        let worker = harness.worker(Harness::config()).await;
        worker.dispatch(LifecycleEvent::Install).await.expect("install");
        worker.dispatch(LifecycleEvent::Activate).await.expect("activate");
        drop(worker);

        let queue_key = Harness::config().queue_key;
        harness
            .store
            .set(&queue_key, r#"[{"type":"quiz_res"#)
            .await
            .expect("seed");

        let worker = harness.worker(Harness::config()).await;
        assert!(worker.queue().is_empty().await);

        harness.network.set_offline(true);
        let outcome = worker
            .dispatch(LifecycleEvent::Fetch(get("/manifest.json")))
            .await
            .expect("fetch");
        assert!(matches!(outcome, EventOutcome::Response(ref r) if r.text() == "{}"));
    }
}
