use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::{ActionKind, ActionSink, OfflineAction, QueueError};
use crate::storage::KeyValueStore;

/// Queue length above which every enqueue logs a warning.
/// The queue is rewritten in full on each change, so it should stay small.
const QUEUE_SOFT_LIMIT: usize = 200;

/// Key the last known connectivity is persisted under
pub const CONNECTIVITY_KEY: &str = "fluence_connectivity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Delivered,
    /// Delivery wasn't possible; the action is queued at this position (1-based)
    Queued(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Queue length after reconciliation, including actions that arrived mid-drain
    pub remaining: usize,
}

struct QueueState {
    actions: Vec<OfflineAction>,
    /// Bumped by `clear` so an in-flight drain doesn't resurrect its failures
    generation: u64,
}

/// Ordered, persisted queue of actions awaiting delivery.
///
/// Constructed by `load`, which restores whatever was persisted; nothing is
/// assumed to survive in memory between worker instances.
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    sink: Arc<dyn ActionSink>,
    storage_key: String,
    state: Mutex<QueueState>,
    /// Held for the duration of a drain so drains never overlap
    drain_lock: Mutex<()>,
    connectivity: watch::Sender<Connectivity>,
}

impl OfflineQueue {
    /// Restore the queue and the last known connectivity. `initial` is used
    /// only when no connectivity change was ever persisted.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        sink: Arc<dyn ActionSink>,
        storage_key: &str,
        initial: Connectivity,
    ) -> Result<Self, QueueError> {
        let actions = match store.get(storage_key).await? {
            Some(stored) => Self::restore(store.as_ref(), storage_key, &stored).await?,
            None => Vec::new(),
        };
        debug!(count = actions.len(), "Offline queue loaded");

        let current = match store.get(CONNECTIVITY_KEY).await? {
            Some(stored) => serde_json::from_str(&stored).unwrap_or_else(|e| {
                warn!(error = %e, "Unreadable connectivity, using default");
                initial
            }),
            None => initial,
        };
        let (connectivity, _) = watch::channel(current);

        Ok(Self {
            store,
            sink,
            storage_key: storage_key.to_string(),
            state: Mutex::new(QueueState {
                actions,
                generation: 0,
            }),
            drain_lock: Mutex::new(()),
            connectivity,
        })
    }

    /// A stored queue that isn't a JSON list is moved to `<key>_corrupt` and
    /// the queue starts empty.
    async fn restore(
        store: &dyn KeyValueStore,
        storage_key: &str,
        stored: &str,
    ) -> Result<Vec<OfflineAction>, QueueError> {
        match Self::parse_stored(stored) {
            Ok(actions) => Ok(actions),
            Err(e) => {
                let aside = format!("{}_corrupt", storage_key);
                warn!(error = %e, moved_to = %aside, "Offline queue unreadable, starting empty");
                store.set(&aside, stored).await?;
                store.remove(storage_key).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Entries with an unknown or malformed type are dropped rather than
    /// retried forever.
    fn parse_stored(stored: &str) -> Result<Vec<OfflineAction>, serde_json::Error> {
        let raw: Vec<Value> = serde_json::from_str(stored)?;
        Ok(raw
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<OfflineAction>(entry.clone()) {
                Ok(action) => Some(action),
                Err(e) => {
                    warn!(entry = %entry, error = %e, "Dropping unreadable offline action");
                    None
                }
            })
            .collect())
    }

    async fn persist(&self, actions: &[OfflineAction]) -> Result<(), QueueError> {
        let contents = serde_json::to_string(actions)?;
        self.store.set(&self.storage_key, &contents).await?;
        Ok(())
    }

    // ===== Queueing =====

    /// Append an action and persist the whole queue. Returns the new length.
    ///
    /// If persisting fails the action stays queued in memory and the error
    /// is returned.
    pub async fn enqueue(&self, action: OfflineAction) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let kind = action.kind;
        state.actions.push(action);
        let len = state.actions.len();

        if len > QUEUE_SOFT_LIMIT {
            warn!(len, limit = QUEUE_SOFT_LIMIT, "Offline queue is growing large");
        }

        self.persist(&state.actions).await?;
        info!(kind = %kind, len, "Action queued for when online");
        Ok(len)
    }

    /// Queue an action given its wire type name. Unknown types are rejected
    /// immediately and never queued.
    pub async fn enqueue_raw(&self, kind: &str, data: Value) -> Result<usize, QueueError> {
        let kind: ActionKind = kind.parse()?;
        self.enqueue(OfflineAction::new(kind, data)).await
    }

    /// Deliver now if online, otherwise (or if delivery fails) queue it.
    pub async fn submit(&self, kind: ActionKind, data: Value) -> Result<SubmitOutcome, QueueError> {
        let action = OfflineAction::new(kind, data);

        if self.connectivity().is_online() {
            match self.sink.deliver(&action).await {
                Ok(()) => return Ok(SubmitOutcome::Delivered),
                Err(e) => debug!(kind = %kind, error = %e, "Immediate delivery failed, queueing"),
            }
        }

        let position = self.enqueue(action).await?;
        Ok(SubmitOutcome::Queued(position))
    }

    // ===== Draining =====

    /// Replay every queued action concurrently and keep only the failures.
    ///
    /// Failed actions stay in their original relative order; actions queued
    /// while the drain was in flight are kept after them.
    pub async fn drain(&self) -> Result<DrainReport, QueueError> {
        let _drain = self.drain_lock.lock().await;

        let (snapshot, generation) = {
            let state = self.state.lock().await;
            (state.actions.clone(), state.generation)
        };

        if snapshot.is_empty() {
            return Ok(DrainReport::default());
        }

        info!(count = snapshot.len(), "Processing offline actions");

        let results = join_all(snapshot.iter().map(|action| self.sink.deliver(action))).await;

        let mut retained = Vec::new();
        for (action, result) in snapshot.iter().zip(results) {
            if let Err(e) = result {
                warn!(kind = %action.kind, error = %e, "Offline action failed, keeping for retry");
                retained.push(action.clone());
            }
        }

        let failed = retained.len();
        let delivered = snapshot.len() - failed;

        let mut state = self.state.lock().await;
        if state.generation == generation {
            let keep = snapshot.len().min(state.actions.len());
            let arrived = state.actions.split_off(keep);
            retained.extend(arrived);
            state.actions = retained;
        } else {
            debug!("Queue cleared during drain, discarding drain results");
        }
        self.persist(&state.actions).await?;

        info!(delivered, failed, "Successfully processed offline actions");

        Ok(DrainReport {
            attempted: snapshot.len(),
            delivered,
            failed,
            remaining: state.actions.len(),
        })
    }

    /// Drop every queued action, including ones that keep failing.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let dropped = state.actions.len();
        state.actions.clear();
        state.generation += 1;
        self.persist(&state.actions).await?;
        info!(dropped, "Offline queue cleared");
        Ok(())
    }

    pub async fn pending(&self) -> Vec<OfflineAction> {
        self.state.lock().await.actions.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.actions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // ===== Connectivity =====

    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    /// Watch connectivity changes (drives the offline indicator).
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    async fn set_connectivity(&self, connectivity: Connectivity) -> Result<(), QueueError> {
        self.connectivity.send_replace(connectivity);
        self.store
            .set(CONNECTIVITY_KEY, &serde_json::to_string(&connectivity)?)
            .await?;
        Ok(())
    }

    /// Back online: publish the change and drain the queue.
    pub async fn go_online(&self) -> Result<DrainReport, QueueError> {
        self.set_connectivity(Connectivity::Online).await?;
        info!("Back online");
        self.drain().await
    }

    pub async fn go_offline(&self) -> Result<(), QueueError> {
        self.set_connectivity(Connectivity::Offline).await?;
        info!("Gone offline");
        Ok(())
    }
}
