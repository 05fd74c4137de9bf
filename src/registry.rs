//! Memory-Bounded Stream Registry with LRU Eviction
//!
//! Holds one state value per caller-chosen key. The number of keys is capped;
//! inserting past the cap evicts the least recently touched key.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Configuration for the registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of keys to keep
    pub max_entries: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
        }
    }
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    /// Logical clock value of the last access; the entry's key in `order`
    last_access: u64,
}

/// Key-value registry bounded by `max_entries`, evicting least recently used.
#[derive(Debug)]
pub struct StreamRegistry<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Access clock -> key, oldest first
    order: BTreeMap<u64, K>,
    config: RegistryConfig,
    evictions: u64,
    /// Monotonic logical clock; deterministic, unlike wall time
    clock: u64,
}

impl<K: Hash + Eq + Clone, V> StreamRegistry<K, V> {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            config: RegistryConfig {
                max_entries: config.max_entries.max(1),
            },
            evictions: 0,
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped to make room since creation
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.config.max_entries
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Read without touching the access order.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Get or lazily create the value for `key`, marking it most recently used.
    pub fn get_or_create<Q, F>(&mut self, key: &Q, create: F) -> &mut V
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
        F: FnOnce() -> V,
    {
        self.clock += 1;
        let now = self.clock;

        if !self.entries.contains_key(key) && self.is_full() {
            self.evict_one();
        }

        let owned = key.to_owned();
        self.order.insert(now, owned.clone());
        let entry = self.entries.entry(owned).or_insert_with(|| Entry {
            value: create(),
            last_access: 0,
        });
        // clock starts at 1, so a fresh entry's 0 is never in `order`
        self.order.remove(&entry.last_access);
        entry.last_access = now;
        &mut entry.value
    }

    /// Evict the least recently used entry in O(log n)
    fn evict_one(&mut self) -> Option<(K, V)> {
        let (_, candidate) = self.order.pop_first()?;
        let entry = self.entries.remove(&candidate)?;
        self.evictions += 1;
        Some((candidate, entry.value))
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.last_access);
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

impl<K: Hash + Eq + Clone, V> Default for StreamRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(max_entries: usize) -> StreamRegistry<String, u32> {
        StreamRegistry::with_config(RegistryConfig { max_entries })
    }

    #[test]
    fn test_basic_operations() {
        let mut registry = small(10);

        *registry.get_or_create("a", || 1) += 10;
        registry.get_or_create("b", || 2);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.peek("a"), Some(&11));
        assert_eq!(registry.remove("a"), Some(11));
        assert!(!registry.contains("a"));
        assert_eq!(registry.remove("a"), None);
    }

    #[test]
    fn test_get_or_create_reuses_existing() {
        let mut registry = small(10);

        assert_eq!(*registry.get_or_create("k", || 42), 42);
        *registry.get_or_create("k", || 999) = 100;

        assert_eq!(registry.peek("k"), Some(&100));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut registry = small(3);

        registry.get_or_create("a", || 1);
        registry.get_or_create("b", || 2);
        registry.get_or_create("c", || 3);

        // Touch "a" so "b" becomes the oldest
        registry.get_or_create("a", || 0);
        registry.get_or_create("d", || 4);

        assert_eq!(registry.len(), 3);
        assert!(registry.contains("a"));
        assert!(!registry.contains("b"));
        assert!(registry.contains("c"));
        assert!(registry.contains("d"));
        assert_eq!(registry.evictions(), 1);
    }

    #[test]
    fn test_eviction_order_follows_every_touch() {
        let mut registry = small(3);
        for key in ["a", "b", "c"] {
            registry.get_or_create(key, || 0);
        }
        // access order is now b, c, a (oldest first)
        registry.get_or_create("a", || 0);
        registry.remove("b");
        registry.get_or_create("d", || 0);
        assert_eq!(registry.evictions(), 0);

        registry.get_or_create("e", || 0);
        assert!(!registry.contains("c"));
        registry.get_or_create("f", || 0);
        assert!(!registry.contains("a"));
        assert!(registry.contains("d") && registry.contains("e") && registry.contains("f"));
        assert_eq!(registry.evictions(), 2);
    }

    #[test]
    fn test_clear_resets_eviction_order() {
        let mut registry = small(2);
        registry.get_or_create("a", || 1);
        registry.get_or_create("b", || 2);
        registry.clear();
        assert!(registry.is_empty());

        registry.get_or_create("c", || 3);
        registry.get_or_create("d", || 4);
        registry.get_or_create("e", || 5);
        assert!(!registry.contains("c"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_full_registry_churn_stays_bounded() {
        let mut registry = small(1_000);
        for i in 0..50_000u32 {
            *registry.get_or_create(&format!("k{i}"), || 0) += 1;
        }
        assert_eq!(registry.len(), 1_000);
        assert_eq!(registry.evictions(), 49_000);
        assert!(registry.contains("k49999"));
        assert!(!registry.contains("k48999"));
    }

    #[test]
    fn test_zero_capacity_is_clamped_to_one() {
        let mut registry = small(0);
        registry.get_or_create("a", || 1);
        registry.get_or_create("b", || 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("b"));
    }
}
