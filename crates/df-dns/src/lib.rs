pub mod records;
pub mod packet;
pub mod cache;
pub mod classifier;
pub mod upstream;
pub mod resolver;
pub mod logging;
pub mod listener;
pub mod reload;

#[cfg(test)]
pub(crate) mod testing;

pub use listener::{InterfaceControl, ListenerManager, SystemInterfaces};
pub use logging::{AccessLogger, LogStatus};
pub use reload::ReloadController;
pub use upstream::{Upstream, UpstreamError, UpstreamForwarder};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use arc_swap::ArcSwap;
use tracing::debug;

use df_common::EnvConfig;
use df_policy::PolicySnapshot;

use crate::cache::ResolutionCache;
use crate::classifier::GroupClassifier;

/// Everything a resolution task needs, shared by all listeners.
///
/// The policy snapshot is published by reference: every query loads it once
/// and decides against that single version, even if a reload lands mid-flight.
pub struct FilterState<U> {
    snapshot: ArcSwap<PolicySnapshot>,
    pub classifier: GroupClassifier,
    pub cache: ResolutionCache,
    pub upstream: U,
    pub logger: AccessLogger,
}

impl<U: Upstream> FilterState<U> {
    pub fn new(snapshot: PolicySnapshot, upstream: U, logger: AccessLogger, env: &EnvConfig) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            classifier: GroupClassifier::new(
                Duration::from_secs(env.group_cache_ttl_secs),
                env.cache_size,
            ),
            cache: ResolutionCache::new(Duration::from_secs(env.cache_ttl_secs), env.cache_size),
            upstream,
            logger,
        }
    }

    /// The active snapshot
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load_full()
    }

    /// Make `snapshot` the active one. Callers clear the caches first.
    pub fn publish(&self, snapshot: PolicySnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    pub async fn clear_caches(&self) {
        self.classifier.clear().await;
        self.cache.clear().await;
    }

    /// Run one datagram through the pipeline. Returns the reply to send, if any.
    ///
    /// Malformed datagrams and responses are discarded without a log line.
    pub async fn handle(&self, datagram: &[u8], client: SocketAddr) -> Option<Vec<u8>> {
        let query = match packet::parse_query(datagram) {
            Ok(q) => q,
            Err(e) => {
                debug!("Discarding datagram from {}: {}", client, e);
                return None;
            }
        };

        let snapshot = self.snapshot();
        let resolution = resolver::resolve(self, &snapshot, &query, client.ip()).await;

        if let Some(status) = resolution.status {
            self.logger.log(client.ip(), status, &query.question.name);
        }
        resolution.reply(&query)
    }
}
