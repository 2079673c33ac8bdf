use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::core::{Dynamic, duration_ms};

pub(crate) struct CacheEntry {
    pub value: Dynamic,
    pub inserted_at: Instant,
    pub ttl: Duration,
    pub last_accessed: Instant,
    pub access_count: u64,
    /// Approximate serialized size in bytes.
    pub size: usize,
    /// Recency rank, strictly increasing with every touch. Instants can
    /// compare equal, ranks can't.
    rank: u64,
}

impl CacheEntry {
    pub fn new(value: Dynamic, size: usize, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            inserted_at: now,
            ttl,
            last_accessed: now,
            access_count: 0,
            size,
            rank: 0,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

/// A snapshot of one cache entry, as reported by the cache index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheItemInfo {
    pub key: String,
    #[serde(with = "duration_ms")]
    pub age: Duration,
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    #[serde(with = "duration_ms")]
    pub idle: Duration,
    pub access_count: u64,
    pub size: usize,
}

pub(crate) enum Lookup {
    Hit(Dynamic),
    Expired,
    Miss,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Inserted {
    pub stored: bool,
    pub evicted: usize,
}

/// Key-value storage bounded by entry count and total bytes, evicting the
/// least recently accessed entries first.
pub(crate) struct CacheStore {
    entries: HashMap<String, CacheEntry>,
    memory: usize,
    max_entries: usize,
    max_memory: usize,
    clock: u64,
}

impl CacheStore {
    pub fn new(max_entries: usize, max_memory: usize) -> Self {
        Self {
            entries: HashMap::new(),
            memory: 0,
            max_entries: max_entries.max(1),
            max_memory,
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn memory(&self) -> usize {
        self.memory
    }

    /// Looks a key up and refreshes its recency. Expired entries are removed
    /// on the spot.
    pub fn get(&mut self, key: &str, now: Instant) -> Lookup {
        let expired = match self.entries.get(key) {
            None => return Lookup::Miss,
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            self.remove(key);
            return Lookup::Expired;
        }

        let rank = self.tick();
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.rank = rank;
                entry.last_accessed = now;
                entry.access_count += 1;
                Lookup::Hit(entry.value.clone())
            }
            None => Lookup::Miss,
        }
    }

    pub fn contains_live(&self, key: &str, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Stores an entry, evicting least recently used entries until both the
    /// entry and byte ceilings hold. An entry larger than the whole byte
    /// budget is not stored at all.
    pub fn insert(&mut self, key: String, mut entry: CacheEntry) -> Inserted {
        self.remove(&key);

        if entry.size > self.max_memory {
            return Inserted::default();
        }

        let mut evicted = 0;
        while !self.entries.is_empty()
            && (self.entries.len() >= self.max_entries || self.memory + entry.size > self.max_memory)
        {
            let Some(victim) = self.least_recent() else {
                break;
            };
            self.remove(&victim);
            evicted += 1;
        }

        entry.rank = self.tick();
        self.memory += entry.size;
        self.entries.insert(key, entry);

        Inserted {
            stored: true,
            evicted,
        }
    }

    fn least_recent(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.rank)
            .map(|(key, _)| key.clone())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.memory = self.memory.saturating_sub(entry.size);
                true
            }
            None => false,
        }
    }

    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.memory = 0;
        count
    }

    /// Entries ordered from most to least recently used.
    pub fn index(&self, now: Instant) -> Vec<CacheItemInfo> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|a, b| b.1.rank.cmp(&a.1.rank));

        entries
            .into_iter()
            .map(|(key, entry)| CacheItemInfo {
                key: key.clone(),
                age: now.saturating_duration_since(entry.inserted_at),
                ttl: entry.ttl,
                idle: now.saturating_duration_since(entry.last_accessed),
                access_count: entry.access_count,
                size: entry.size,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(size: usize, ttl_ms: u64, now: Instant) -> CacheEntry {
        CacheEntry::new(Arc::new(size), size, Duration::from_millis(ttl_ms), now)
    }

    #[test]
    fn test_lru_respects_access() {
        let now = Instant::now();
        let mut store = CacheStore::new(3, usize::MAX);

        store.insert("a".into(), entry(1, 1000, now));
        store.insert("b".into(), entry(1, 1000, now));
        store.insert("c".into(), entry(1, 1000, now));
        assert!(matches!(store.get("a", now), Lookup::Hit(_)));

        let inserted = store.insert("d".into(), entry(1, 1000, now));
        assert_eq!(inserted, Inserted { stored: true, evicted: 1 });
        assert!(matches!(store.get("b", now), Lookup::Miss));
        assert!(store.contains_live("a", now));
        assert!(store.contains_live("c", now));
        assert!(store.contains_live("d", now));
    }

    #[test]
    fn test_memory_ceiling() {
        let now = Instant::now();
        let mut store = CacheStore::new(100, 100);

        store.insert("a".into(), entry(40, 1000, now));
        store.insert("b".into(), entry(40, 1000, now));
        assert_eq!(store.memory(), 80);

        let inserted = store.insert("c".into(), entry(50, 1000, now));
        assert_eq!(inserted.evicted, 1);
        assert!(!store.contains_live("a", now));
        assert_eq!(store.memory(), 90);

        // never fits, never stored, nothing evicted for it
        let inserted = store.insert("huge".into(), entry(101, 1000, now));
        assert_eq!(inserted, Inserted::default());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_replacing_key_keeps_accounting() {
        let now = Instant::now();
        let mut store = CacheStore::new(10, 1000);
        store.insert("a".into(), entry(10, 1000, now));
        store.insert("a".into(), entry(30, 1000, now));
        assert_eq!(store.len(), 1);
        assert_eq!(store.memory(), 30);
        assert!(store.remove("a"));
        assert_eq!(store.memory(), 0);
    }

    #[test]
    fn test_expiry_and_prefix() {
        let now = Instant::now();
        let mut store = CacheStore::new(10, 1000);
        store.insert("whois:a".into(), entry(1, 10, now));
        store.insert("whois:b".into(), entry(1, 1000, now));
        store.insert("dns:a".into(), entry(1, 1000, now));

        let later = now + Duration::from_millis(11);
        assert!(matches!(store.get("whois:a", later), Lookup::Expired));
        assert_eq!(store.purge_expired(later), 0);
        assert_eq!(store.remove_prefix("whois:"), 1);
        assert_eq!(store.len(), 1);

        let index = store.index(later);
        assert_eq!(index[0].key, "dns:a");
        assert_eq!(index[0].age, Duration::from_millis(11));
    }
}
