//! Weighted LRU eviction engine.
//!
//! A recency-ordered map bounded by a total weight budget and, optionally, by
//! an entry count. Entry weights come from an [`LruPolicy`], which is also the
//! single place removal side effects attach to:
//! - replacing a key fires [`RemovalCause::Replaced`]
//! - [`LruEngine::remove`] fires [`RemovalCause::Explicit`]
//! - trimming to budget fires [`RemovalCause::Evicted`]
//!
//! The engine itself is synchronous and performs no I/O.

use std::borrow::Borrow;
use std::hash::Hash;

use lru::LruCache;
use serde::Serialize;

use crate::error::{CacheError, Result};

/// Why an entry left the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Trimmed to restore the weight or entry budget.
    Evicted,
    /// Superseded by a `put` for the same key.
    Replaced,
    /// Removed through [`LruEngine::remove`].
    Explicit,
}

impl RemovalCause {
    /// True only for capacity evictions.
    pub fn evicted(&self) -> bool {
        matches!(self, RemovalCause::Evicted)
    }
}

/// Sizing and removal hooks for an [`LruEngine`].
pub trait LruPolicy<K, V> {
    /// Weight of a single entry. Must be stable for the lifetime of the entry.
    fn weigh(&self, _key: &K, _value: &V) -> u64 {
        1
    }

    /// Called after `old` has left the engine. `new` is the replacement value
    /// when the cause is [`RemovalCause::Replaced`].
    fn on_removed(
        &mut self,
        _cause: RemovalCause,
        _key: &K,
        _old: &V,
        _new: Option<&V>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Counts entries and ignores removals.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountPolicy;

impl<K, V> LruPolicy<K, V> for CountPolicy {}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LruStats {
    pub entries: usize,
    pub weight: u64,
    pub max_weight: u64,
    pub max_entries: Option<usize>,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
}

impl LruStats {
    /// Hit ratio over all lookups (0.0 when there were none).
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}

/// The eviction engine.
pub struct LruEngine<K: Hash + Eq, V, P> {
    map: LruCache<K, V>,
    weight: u64,
    max_weight: u64,
    max_entries: Option<usize>,
    policy: P,
    hits: u64,
    misses: u64,
    puts: u64,
    evictions: u64,
}

impl<K, V, P> LruEngine<K, V, P>
where
    K: Hash + Eq + Clone,
    P: LruPolicy<K, V>,
{
    /// Create an engine holding at most `max_weight` total weight.
    pub fn new(max_weight: u64, policy: P) -> Result<Self> {
        if max_weight == 0 {
            return Err(CacheError::InvalidConfiguration(
                "max_weight must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            map: LruCache::unbounded(),
            weight: 0,
            max_weight,
            max_entries: None,
            policy,
            hits: 0,
            misses: 0,
            puts: 0,
            evictions: 0,
        })
    }

    /// Additionally cap the number of live entries.
    pub fn with_max_entries(mut self, max_entries: usize) -> Result<Self> {
        if max_entries == 0 {
            return Err(CacheError::InvalidConfiguration(
                "max_entries must be greater than zero".to_string(),
            ));
        }
        self.max_entries = Some(max_entries);
        Ok(self)
    }

    /// Look up `key`, marking it most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.map.get(key) {
            Some(value) => {
                self.hits += 1;
                Some(value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Look up `key` without touching recency or counters.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.peek(key)
    }

    /// Insert or replace `key`, then evict until back within budget.
    ///
    /// Returns the replaced value, after the policy has been notified of the
    /// replacement. The new entry itself is evicted if it alone exceeds the
    /// budget.
    pub fn put(&mut self, key: K, value: V) -> Result<Option<V>> {
        self.puts += 1;
        let added = self.policy.weigh(&key, &value);
        self.weight = self.weight.checked_add(added).ok_or_else(|| {
            CacheError::InternalConsistency("total weight overflowed u64".to_string())
        })?;

        let mut first_err = None;
        let previous = match self.map.push(key.clone(), value) {
            Some((_, old)) => {
                let removed = self.policy.weigh(&key, &old);
                self.release_weight(removed)?;
                let new = self.map.peek(&key);
                if let Err(e) = self
                    .policy
                    .on_removed(RemovalCause::Replaced, &key, &old, new)
                {
                    first_err = Some(e);
                }
                Some(old)
            }
            None => None,
        };

        let trimmed = self.trim(self.max_weight, self.max_entries.unwrap_or(usize::MAX));
        match (first_err, trimmed) {
            (Some(e), _) | (None, Err(e)) => Err(e),
            (None, Ok(())) => Ok(previous),
        }
    }

    /// Remove `key` unconditionally.
    pub fn remove<Q>(&mut self, key: &Q) -> Result<Option<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some((key, old)) = self.map.pop_entry(key) else {
            return Ok(None);
        };
        let removed = self.policy.weigh(&key, &old);
        self.release_weight(removed)?;
        self.policy
            .on_removed(RemovalCause::Explicit, &key, &old, None)?;
        Ok(Some(old))
    }

    /// Change the weight budget and evict immediately if now over it.
    pub fn resize(&mut self, max_weight: u64) -> Result<()> {
        if max_weight == 0 {
            return Err(CacheError::InvalidConfiguration(
                "max_weight must be greater than zero".to_string(),
            ));
        }
        self.max_weight = max_weight;
        self.trim(self.max_weight, self.max_entries.unwrap_or(usize::MAX))
    }

    /// Evict every entry, least recently used first.
    pub fn evict_all(&mut self) -> Result<()> {
        self.trim(0, 0)
    }

    /// Evict least-recently-used entries until within both budgets.
    ///
    /// Keeps going when the policy reports a failure so the budget is always
    /// restored; the first failure is returned afterwards.
    fn trim(&mut self, max_weight: u64, max_entries: usize) -> Result<()> {
        let mut first_err = None;
        loop {
            if self.map.is_empty() && self.weight != 0 {
                return Err(CacheError::InternalConsistency(format!(
                    "engine is empty but reports weight {}",
                    self.weight
                )));
            }
            if self.map.is_empty() || (self.weight <= max_weight && self.map.len() <= max_entries)
            {
                break;
            }

            let Some((key, value)) = self.map.pop_lru() else {
                break;
            };
            let removed = self.policy.weigh(&key, &value);
            self.release_weight(removed)?;
            self.evictions += 1;

            if let Err(e) = self
                .policy
                .on_removed(RemovalCause::Evicted, &key, &value, None)
            {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release_weight(&mut self, removed: u64) -> Result<()> {
        self.weight = self.weight.checked_sub(removed).ok_or_else(|| {
            CacheError::InternalConsistency(format!(
                "weigher reported inconsistent results: removing {removed} from total {}",
                self.weight
            ))
        })?;
        Ok(())
    }

    /// Iterate entries from least to most recently used.
    pub fn iter_lru(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter().rev()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains(key)
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn max_weight(&self) -> u64 {
        self.max_weight
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    pub fn stats(&self) -> LruStats {
        LruStats {
            entries: self.map.len(),
            weight: self.weight,
            max_weight: self.max_weight,
            max_entries: self.max_entries,
            hits: self.hits,
            misses: self.misses,
            puts: self.puts,
            evictions: self.evictions,
        }
    }
}

impl<K: Hash + Eq, V, P> std::fmt::Debug for LruEngine<K, V, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lookups = self.hits + self.misses;
        let hit_percent = if lookups != 0 { 100 * self.hits / lookups } else { 0 };
        write!(
            f,
            "LruEngine[max_weight={},weight={},hits={},misses={},hit_rate={}%]",
            self.max_weight, self.weight, self.hits, self.misses, hit_percent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Weighs by value and records every removal.
    #[derive(Default)]
    struct Recorder {
        removed: Vec<(RemovalCause, &'static str, u64)>,
    }

    impl LruPolicy<&'static str, u64> for Recorder {
        fn weigh(&self, _key: &&'static str, value: &u64) -> u64 {
            *value
        }

        fn on_removed(
            &mut self,
            cause: RemovalCause,
            key: &&'static str,
            old: &u64,
            _new: Option<&u64>,
        ) -> Result<()> {
            self.removed.push((cause, *key, *old));
            Ok(())
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = LruEngine::<&str, u64, _>::new(0, CountPolicy);
        assert!(matches!(result, Err(CacheError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_eviction_prefers_least_recent() {
        let mut engine = LruEngine::new(49, Recorder::default()).unwrap();
        engine.put("a", 20).unwrap();
        engine.put("b", 30).unwrap();

        assert!(engine.peek("a").is_none());
        assert_eq!(engine.peek("b"), Some(&30));
        assert_eq!(engine.weight(), 30);
        assert_eq!(
            engine.policy().removed,
            vec![(RemovalCause::Evicted, "a", 20)]
        );
    }

    #[test]
    fn test_get_refreshes_recency() {
        let mut engine = LruEngine::new(30, Recorder::default()).unwrap();
        engine.put("a", 10).unwrap();
        engine.put("b", 10).unwrap();
        engine.put("c", 10).unwrap();

        assert_eq!(engine.get("a"), Some(&10));
        engine.put("d", 10).unwrap();

        assert!(engine.contains("a"));
        assert!(!engine.contains("b"));
        let order: Vec<_> = engine.iter_lru().map(|(k, _)| *k).collect();
        assert_eq!(order, vec!["c", "a", "d"]);
    }

    #[test]
    fn test_replace_reports_previous() {
        let mut engine = LruEngine::new(100, Recorder::default()).unwrap();
        assert_eq!(engine.put("a", 10).unwrap(), None);
        assert_eq!(engine.put("a", 25).unwrap(), Some(10));

        assert_eq!(engine.weight(), 25);
        assert_eq!(engine.len(), 1);
        assert_eq!(
            engine.policy().removed,
            vec![(RemovalCause::Replaced, "a", 10)]
        );
    }

    #[test]
    fn test_explicit_remove() {
        let mut engine = LruEngine::new(100, Recorder::default()).unwrap();
        engine.put("a", 10).unwrap();

        assert_eq!(engine.remove("a").unwrap(), Some(10));
        assert_eq!(engine.remove("a").unwrap(), None);
        assert_eq!(engine.weight(), 0);
        assert!(!engine.policy().removed[0].0.evicted());
    }

    #[test]
    fn test_oversized_entry_evicted_immediately() {
        let mut engine = LruEngine::new(19, Recorder::default()).unwrap();
        engine.put("a", 20).unwrap();

        assert!(engine.is_empty());
        assert_eq!(engine.weight(), 0);
        assert_eq!(engine.stats().evictions, 1);
    }

    #[test]
    fn test_resize_trims() {
        let mut engine = LruEngine::new(50, Recorder::default()).unwrap();
        engine.put("a", 45).unwrap();
        engine.put("b", 5).unwrap();

        engine.resize(49).unwrap();
        assert_eq!(engine.len(), 1);
        assert!(engine.contains("b"));
        assert!(matches!(
            engine.resize(0),
            Err(CacheError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_max_entries_evicts_oldest_regardless_of_weight() {
        let mut engine = LruEngine::new(1_000, Recorder::default())
            .unwrap()
            .with_max_entries(2)
            .unwrap();
        engine.put("small", 1).unwrap();
        engine.put("big", 500).unwrap();
        engine.put("tiny", 1).unwrap();

        assert!(!engine.contains("small"));
        assert_eq!(engine.len(), 2);
        assert_eq!(engine.weight(), 501);
    }

    #[test]
    fn test_counters() {
        let mut engine = LruEngine::new(10, CountPolicy).unwrap();
        engine.put("a", ()).unwrap();
        engine.get("a");
        engine.get("missing");
        engine.get("a");

        let stats = engine.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.puts, 1);
        assert!((stats.hit_ratio() - 2.0 / 3.0).abs() < 1e-10);
    }

    /// Reports a different weight on the way out than on the way in.
    struct Shrinking {
        calls: std::cell::Cell<u64>,
    }

    impl LruPolicy<&'static str, ()> for Shrinking {
        fn weigh(&self, _key: &&'static str, _value: &()) -> u64 {
            let n = self.calls.get();
            self.calls.set(n + 1);
            if n == 0 {
                1
            } else {
                5
            }
        }
    }

    #[test]
    fn test_inconsistent_weigher_is_fatal() {
        let mut engine = LruEngine::new(10, Shrinking { calls: 0.into() }).unwrap();
        engine.put("a", ()).unwrap();

        let result = engine.remove("a");
        assert!(matches!(result, Err(CacheError::InternalConsistency(_))));
    }

    #[test]
    fn test_evict_all() {
        let mut engine = LruEngine::new(100, Recorder::default()).unwrap();
        engine.put("a", 1).unwrap();
        engine.put("b", 2).unwrap();

        engine.evict_all().unwrap();
        assert!(engine.is_empty());
        let evicted: Vec<_> = engine.policy().removed.iter().map(|r| r.1).collect();
        assert_eq!(evicted, vec!["a", "b"]);
    }
}
