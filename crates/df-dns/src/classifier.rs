use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

use df_policy::PolicySnapshot;

use crate::cache::TtlCache;

/// Maps client addresses to policy groups, remembering recent answers.
///
/// The cache belongs to one snapshot generation: it must be cleared whenever
/// a new snapshot is published.
pub struct GroupClassifier {
    cache: TtlCache<IpAddr, String>,
}

impl GroupClassifier {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            cache: TtlCache::new(ttl, max_size),
        }
    }

    /// Never fails: unmatched addresses land in the default group.
    pub async fn classify(&self, snapshot: &PolicySnapshot, ip: IpAddr) -> String {
        if let Some(group) = self.cache.get(&ip).await {
            return group;
        }

        let generation = self.cache.generation();
        let group = snapshot.match_group(ip).to_string();
        debug!("Classified {} into group {}", ip, group);
        self.cache.insert_at(generation, ip, group.clone()).await;
        group
    }

    pub async fn clear(&self) {
        self.cache.clear().await;
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.len().await
    }
}
