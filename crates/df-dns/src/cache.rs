use std::hash::Hash;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Fixed-TTL map behind an exclusive lock. Expired entries are never returned.
///
/// Every `clear` starts a new generation. Inserts tagged with an older
/// generation are discarded, so work started before a clear cannot refill it.
pub struct TtlCache<K, V> {
    entries: Mutex<FxHashMap<K, CacheEntry<V>>>,
    generation: AtomicU64,
    ttl: Duration,
    max_size: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::with_capacity_and_hasher(
                max_size,
                Default::default(),
            )),
            generation: AtomicU64::new(0),
            ttl,
            max_size: max_size.max(1),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get(key)?;

        if entry.inserted_at.elapsed() >= self.ttl {
            entries.remove(key);
            return None;
        }

        Some(entry.value.clone())
    }

    /// Current generation, to be passed to `insert_at` later
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn insert(&self, key: K, value: V) {
        self.insert_at(self.generation(), key, value).await;
    }

    /// Insert unless the cache was cleared since `generation` was read.
    pub async fn insert_at(&self, generation: u64, key: K, value: V) {
        if self.ttl.is_zero() {
            return;
        }

        let mut entries = self.entries.lock().await;
        // Compared under the lock `clear` takes
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        // Evict expired entries if at capacity
        if entries.len() >= self.max_size && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, v| v.inserted_at.elapsed() < ttl);
        }

        // If still at capacity, remove oldest entry
        if entries.len() >= self.max_size && !entries.contains_key(&key) {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, v)| v.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Forward resolution caches, one per record shape, keyed by lowercase name
pub struct ResolutionCache {
    pub a: TtlCache<String, Ipv4Addr>,
    pub aaaa: TtlCache<String, Ipv6Addr>,
}

impl ResolutionCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            a: TtlCache::new(ttl, max_size),
            aaaa: TtlCache::new(ttl, max_size),
        }
    }

    pub async fn clear(&self) {
        self.a.clear().await;
        self.aaaa.clear().await;
    }
}
