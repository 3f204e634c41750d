use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::{ActionKind, OfflineAction, SyncError};
use crate::config::Config;
use crate::http::{FetchError, Network, Request};

/// Destination for replayed actions.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn deliver(&self, action: &OfflineAction) -> Result<(), SyncError>;
}

/// POSTs each action as JSON to the endpoint configured for its type.
/// Network errors and non-2xx statuses both count as failures.
pub struct HttpActionSink {
    network: Arc<dyn Network>,
    endpoints: HashMap<ActionKind, Url>,
}

impl HttpActionSink {
    pub fn new(network: Arc<dyn Network>, config: &Config) -> Result<Self, FetchError> {
        let mut endpoints = HashMap::new();
        for kind in [ActionKind::QuizResult, ActionKind::ProgressUpdate] {
            endpoints.insert(kind, config.resolve(config.endpoints.for_kind(kind))?);
        }
        Ok(Self { network, endpoints })
    }

    pub fn endpoint(&self, kind: ActionKind) -> Option<&Url> {
        self.endpoints.get(&kind)
    }
}

#[async_trait]
impl ActionSink for HttpActionSink {
    async fn deliver(&self, action: &OfflineAction) -> Result<(), SyncError> {
        let url = self
            .endpoints
            .get(&action.kind)
            .cloned()
            .ok_or_else(|| FetchError::Network(format!("no endpoint for {}", action.kind)))?;

        let request = Request::post_json(url, &action.payload())?;
        let response = self.network.fetch(&request).await?;

        if !response.is_ok() {
            return Err(SyncError::Rejected {
                status: response.status,
            });
        }

        debug!(kind = %action.kind, status = response.status, "Offline action delivered");
        Ok(())
    }
}
