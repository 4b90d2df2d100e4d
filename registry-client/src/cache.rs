use std::collections::HashMap;
use parking_lot::Mutex;
use rand::Rng;
use shared::types::ServiceInstance;

/// A discovery result held by the resolver.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub services: Vec<ServiceInstance>,
    pub cached_at: i64,
    pub expires_at: i64,
}

impl CacheEntry {
    /// Expiry is the shortest heartbeat interval among the instances, scaled
    /// by `multiplier`. Oversized intervals clamp to the far future.
    pub fn new(services: Vec<ServiceInstance>, cached_at: i64, multiplier: f64) -> Self {
        let min_interval = services
            .iter()
            .map(|s| s.heartbeat_interval)
            .min()
            .unwrap_or(0);
        let ttl_millis = (min_interval as f64 * multiplier * 1000.0) as i64;

        Self {
            services,
            cached_at,
            expires_at: cached_at.saturating_add(ttl_millis),
        }
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        now < self.expires_at
    }

    /// Uniformly random instance URL, or None for an empty entry.
    pub fn pick_url(&self) -> Option<String> {
        if self.services.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..self.services.len());
        Some(self.services[index].url())
    }
}

/// Per-name discovery cache. Locks are held only for map access.
#[derive(Debug, Default)]
pub struct ResolverCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResolverCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// URL from an unexpired entry
    pub fn fresh_url(&self, name: &str, now: i64) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .get(name)
            .filter(|entry| entry.is_fresh(now))
            .and_then(CacheEntry::pick_url)
    }

    /// URL from any entry, expired or not
    pub fn stale_url(&self, name: &str) -> Option<String> {
        self.entries.lock().get(name).and_then(CacheEntry::pick_url)
    }

    pub fn insert(&self, name: &str, entry: CacheEntry) {
        self.entries.lock().insert(name.to_string(), entry);
    }

    pub fn get(&self, name: &str) -> Option<CacheEntry> {
        self.entries.lock().get(name).cloned()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
