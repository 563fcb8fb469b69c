//! Memoization of node results keyed by a structural fingerprint.

use crate::config::{CacheConfig, CacheWeigher};
use chaincore::{CacheError, NodeExecution, NodeStatus, NodeType, Value};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::debug;

struct CacheEntry {
    outputs: HashMap<String, Value>,
    inserted_at: Instant,
    last_access: AtomicU64,
    weight: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    /// Total weight currently held
    pub total_size: usize,
    pub entries: usize,
}

/// Thread-safe TTL + LRU cache of node outputs.
///
/// Entries live in a sharded map so lookups of unrelated keys do not contend.
/// Recency is a global logical clock stamped on every hit; eviction removes
/// the entry with the oldest stamp until the total weight fits the capacity.
pub struct ExecutionCache {
    config: CacheConfig,
    entries: DashMap<u64, CacheEntry>,
    total_weight: AtomicUsize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    eviction_lock: Mutex<()>,
}

impl ExecutionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            total_weight: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Order-independent fingerprint of a node invocation.
    pub fn fingerprint(node_id: &str, node_type: NodeType, inputs: &HashMap<String, Value>) -> u64 {
        let mut hasher = DefaultHasher::new();
        node_id.hash(&mut hasher);
        node_type.hash(&mut hasher);

        let mut keys: Vec<&String> = inputs.keys().collect();
        keys.sort();
        for key in keys {
            key.hash(&mut hasher);
            // serde_json maps are ordered, so nested objects hash canonically
            inputs[key].to_json().to_string().hash(&mut hasher);
        }
        hasher.finish()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        entry.inserted_at.elapsed() >= self.config.ttl()
    }

    fn weigh(&self, outputs: &HashMap<String, Value>) -> Result<usize, CacheError> {
        match self.config.weigher {
            CacheWeigher::Unit => Ok(1),
            CacheWeigher::SerializedBytes => serde_json::to_vec(outputs)
                .map(|bytes| bytes.len().max(1))
                .map_err(|e| CacheError::Weigh(e.to_string())),
        }
    }

    pub fn get(
        &self,
        node_id: &str,
        node_type: NodeType,
        inputs: &HashMap<String, Value>,
    ) -> Option<HashMap<String, Value>> {
        if !self.config.enabled {
            return None;
        }
        let key = Self::fingerprint(node_id, node_type, inputs);

        let expired = match self.entries.get(&key) {
            Some(entry) if !self.is_expired(&entry) => {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for node {}", node_id);
                return Some(entry.outputs.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some((_, entry)) = self.entries.remove_if(&key, |_, e| self.is_expired(e)) {
                self.total_weight.fetch_sub(entry.weight, Ordering::Relaxed);
                debug!("Dropped expired cache entry for node {}", node_id);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(
        &self,
        node_id: &str,
        node_type: NodeType,
        inputs: &HashMap<String, Value>,
        outputs: HashMap<String, Value>,
    ) -> Result<(), CacheError> {
        if !self.config.enabled {
            return Err(CacheError::Disabled);
        }
        let weight = self.weigh(&outputs)?;
        if weight > self.config.capacity {
            return Err(CacheError::TooLarge {
                weight,
                capacity: self.config.capacity,
            });
        }

        let key = Self::fingerprint(node_id, node_type, inputs);
        let entry = CacheEntry {
            outputs,
            inserted_at: Instant::now(),
            last_access: AtomicU64::new(self.tick()),
            weight,
        };
        if let Some(previous) = self.entries.insert(key, entry) {
            self.total_weight.fetch_sub(previous.weight, Ordering::Relaxed);
        }
        self.total_weight.fetch_add(weight, Ordering::Relaxed);

        self.evict_to_capacity();
        Ok(())
    }

    fn evict_to_capacity(&self) {
        let _guard = self.eviction_lock.lock();
        while self.total_weight.load(Ordering::Relaxed) > self.config.capacity {
            let victim = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_access.load(Ordering::Relaxed))
                .map(|e| *e.key());
            let Some(key) = victim else { break };
            if let Some((_, entry)) = self.entries.remove(&key) {
                self.total_weight.fetch_sub(entry.weight, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted least recently used cache entry {:x}", key);
            }
        }
    }

    /// Whether a finished node's outputs may be memoized.
    pub fn should_cache(&self, node: &NodeExecution) -> bool {
        self.config.enabled
            && node.status == NodeStatus::Completed
            && node.node_type != NodeType::Condition
            && self.config.cacheable_types.contains(&node.node_type)
    }

    /// Remove every expired entry and return how many were dropped.
    pub fn clean_expired(&self) -> usize {
        let mut removed = 0;
        let mut freed = 0;
        let ttl = self.config.ttl();
        self.entries.retain(|_, entry| {
            if entry.inserted_at.elapsed() >= ttl {
                removed += 1;
                freed += entry.weight;
                false
            } else {
                true
            }
        });
        self.total_weight.fetch_sub(freed, Ordering::Relaxed);
        if removed > 0 {
            debug!("Cleaned {} expired cache entries", removed);
        }
        removed
    }

    pub fn clear(&self) {
        let _guard = self.eviction_lock.lock();
        self.entries.clear();
        self.total_weight.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            total_size: self.total_weight.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(capacity: usize, ttl_ms: u64) -> CacheConfig {
        CacheConfig {
            capacity,
            ttl_ms,
            ..CacheConfig::default()
        }
    }

    fn inputs(pairs: &[(&str, i64)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    fn outputs(v: i64) -> HashMap<String, Value> {
        inputs(&[("result", v)])
    }

    #[test]
    fn test_set_then_get_is_idempotent() {
        let cache = ExecutionCache::new(config(10, 60_000));
        let key = inputs(&[("a", 1), ("b", 2)]);
        cache
            .set("double", NodeType::Transform, &key, outputs(4))
            .unwrap();

        assert_eq!(cache.get("double", NodeType::Transform, &key), Some(outputs(4)));
        assert_eq!(cache.get("double", NodeType::Transform, &key), Some(outputs(4)));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_fingerprint_ignores_key_order_but_not_node() {
        let a = inputs(&[("a", 1), ("b", 2)]);
        let b = inputs(&[("b", 2), ("a", 1)]);
        assert_eq!(
            ExecutionCache::fingerprint("n", NodeType::Transform, &a),
            ExecutionCache::fingerprint("n", NodeType::Transform, &b)
        );
        assert_ne!(
            ExecutionCache::fingerprint("n", NodeType::Transform, &a),
            ExecutionCache::fingerprint("m", NodeType::Transform, &a)
        );
        assert_ne!(
            ExecutionCache::fingerprint("n", NodeType::Transform, &a),
            ExecutionCache::fingerprint("n", NodeType::McpTool, &a)
        );
    }

    #[test]
    fn test_expired_entry_is_a_miss_without_sweep() {
        let cache = ExecutionCache::new(config(10, 20));
        let key = inputs(&[("x", 1)]);
        cache.set("t", NodeType::Transform, &key, outputs(1)).unwrap();

        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.get("t", NodeType::Transform, &key), None);
        assert_eq!(cache.stats().misses, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_inserting_past_capacity_evicts_exactly_one() {
        let cache = ExecutionCache::new(config(3, 60_000));
        for i in 0..3 {
            cache
                .set("t", NodeType::Transform, &inputs(&[("x", i)]), outputs(i))
                .unwrap();
        }
        // touch the oldest entry so the second one becomes least recently used
        assert!(cache.get("t", NodeType::Transform, &inputs(&[("x", 0)])).is_some());

        cache
            .set("t", NodeType::Transform, &inputs(&[("x", 3)]), outputs(3))
            .unwrap();

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 3);
        assert!(cache.get("t", NodeType::Transform, &inputs(&[("x", 1)])).is_none());
        assert!(cache.get("t", NodeType::Transform, &inputs(&[("x", 0)])).is_some());
    }

    #[test]
    fn test_clean_expired_and_clear() {
        let cache = ExecutionCache::new(config(10, 20));
        cache.set("a", NodeType::Transform, &inputs(&[]), outputs(1)).unwrap();
        cache.set("b", NodeType::Transform, &inputs(&[]), outputs(2)).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.clean_expired(), 2);
        assert_eq!(cache.stats().total_size, 0);

        let cache = ExecutionCache::new(config(10, 60_000));
        cache.set("a", NodeType::Transform, &inputs(&[]), outputs(1)).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().total_size, 0);
    }

    #[test]
    fn test_should_cache_only_completed_cacheable_types() {
        let cache = ExecutionCache::new(CacheConfig::default());

        let mut transform = NodeExecution::new("t", NodeType::Transform);
        transform.start(HashMap::new());
        assert!(!cache.should_cache(&transform));
        transform.complete(HashMap::new());
        assert!(cache.should_cache(&transform));

        let mut condition = NodeExecution::new("c", NodeType::Condition);
        condition.start(HashMap::new());
        condition.complete(HashMap::new());
        assert!(!cache.should_cache(&condition));
    }

    #[test]
    fn test_disabled_and_oversized_entries_are_rejected() {
        let disabled = ExecutionCache::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        assert_eq!(
            disabled.set("t", NodeType::Transform, &inputs(&[]), outputs(1)),
            Err(CacheError::Disabled)
        );

        let bytes = ExecutionCache::new(CacheConfig {
            capacity: 4,
            weigher: CacheWeigher::SerializedBytes,
            ..CacheConfig::default()
        });
        assert!(matches!(
            bytes.set("t", NodeType::Transform, &inputs(&[]), outputs(1)),
            Err(CacheError::TooLarge { .. })
        ));
    }
}
