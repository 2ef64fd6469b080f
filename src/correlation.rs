//! Bounded correlation table for in-flight operations
//!
//! Start hooks park a pending record under an identity key; end hooks take it
//! back out. The table is the only place the two halves of an operation meet,
//! so it has to hold up under fully concurrent begin/end traffic from every
//! CPU without a global lock.
//!
//! # Design
//!
//! ```text
//!   start hook ──begin(key, rec)──▶ ┌───────────────────────────┐
//!                                   │ DashMap<K, Slot<V>>       │
//!                                   │   sharded RwLocks         │
//!                                   │ occupancy: AtomicUsize    │ ≤ capacity
//!   end hook ◀──end(key)─────────── └───────────────────────────┘
//! ```
//!
//! - **Hard capacity:** a begin for a new key on a full table is dropped and
//!   reported as [`BeginOutcome::Dropped`]. The operation goes untracked and
//!   its end finds nothing.
//! - **Atomic take:** `end` looks up and removes under one shard write lock,
//!   so a record is handed to at most one end hook.
//! - **Conflicts:** what happens when a key already holds a record is chosen
//!   by [`BeginPolicy`].
//!
//! Nothing here blocks beyond a shard lock held for a few instructions, and
//! nothing returns an error: misses and drops are ordinary outcomes, counted
//! in [`TableStats`].

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Conflict policy for a begin on a key that already holds a pending record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BeginPolicy {
    /// Replace the pending record; the superseded one is lost
    #[default]
    Overwrite,
    /// Keep the pending record; the new begin is refused
    Reject,
    /// Stack the new record on the old one; `end` takes the newest first
    Version,
}

/// Result of [`CorrelationTable::begin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// New key, record stored
    Inserted,
    /// Existing record overwritten
    Replaced,
    /// Existing record kept, new one refused
    Rejected,
    /// New record stacked above the existing one
    Versioned,
    /// Table full, record not stored
    Dropped,
}

impl BeginOutcome {
    /// Whether the new record will be matched by a later `end`
    pub fn is_tracked(&self) -> bool {
        matches!(
            self,
            BeginOutcome::Inserted | BeginOutcome::Replaced | BeginOutcome::Versioned
        )
    }
}

/// Point-in-time counters for one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub inserted: u64,
    pub replaced: u64,
    pub rejected: u64,
    pub versioned: u64,
    pub dropped: u64,
    pub matched: u64,
    pub missed: u64,
    pub evicted: u64,
    /// Records currently pending
    pub pending: usize,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct Counters {
    inserted: AtomicU64,
    replaced: AtomicU64,
    rejected: AtomicU64,
    versioned: AtomicU64,
    dropped: AtomicU64,
    matched: AtomicU64,
    missed: AtomicU64,
    evicted: AtomicU64,
}

/// Records parked under one key. `shadowed` stays empty unless the table
/// runs with [`BeginPolicy::Version`].
#[derive(Debug)]
struct Slot<V> {
    current: V,
    shadowed: Vec<V>,
}

impl<V> Slot<V> {
    fn new(record: V) -> Self {
        Self {
            current: record,
            shadowed: Vec::new(),
        }
    }

    fn push(&mut self, record: V) {
        let older = std::mem::replace(&mut self.current, record);
        self.shadowed.push(older);
    }

    fn len(&self) -> usize {
        1 + self.shadowed.len()
    }

    /// Drop expired records. Returns how many went and whether any remain.
    fn evict(&mut self, expired: &mut impl FnMut(&V) -> bool) -> (usize, bool) {
        let before = self.shadowed.len();
        self.shadowed.retain(|record| !expired(record));
        let mut removed = before - self.shadowed.len();

        if expired(&self.current) {
            removed += 1;
            match self.shadowed.pop() {
                Some(newest) => self.current = newest,
                None => return (removed, false),
            }
        }
        (removed, true)
    }
}

/// Fixed-capacity concurrent map from identity to pending record
#[derive(Debug)]
pub struct CorrelationTable<K, V>
where
    K: Eq + Hash,
{
    map: DashMap<K, Slot<V>>,
    policy: BeginPolicy,
    capacity: usize,
    occupancy: AtomicUsize,
    counters: Counters,
}

impl<K, V> CorrelationTable<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a table holding at most `capacity` pending records
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0.
    pub fn new(capacity: usize, policy: BeginPolicy) -> Self {
        assert!(capacity > 0, "Correlation table capacity must be > 0");

        Self {
            map: DashMap::with_capacity(capacity),
            policy,
            capacity,
            occupancy: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    /// Park `record` under `key`
    pub fn begin(&self, key: K, record: V) -> BeginOutcome {
        let outcome = match self.map.entry(key) {
            Entry::Vacant(vacant) => {
                if self.try_reserve() {
                    vacant.insert(Slot::new(record));
                    BeginOutcome::Inserted
                } else {
                    BeginOutcome::Dropped
                }
            }
            Entry::Occupied(mut occupied) => match self.policy {
                BeginPolicy::Overwrite => {
                    occupied.get_mut().current = record;
                    BeginOutcome::Replaced
                }
                BeginPolicy::Reject => BeginOutcome::Rejected,
                BeginPolicy::Version => {
                    if self.try_reserve() {
                        occupied.get_mut().push(record);
                        BeginOutcome::Versioned
                    } else {
                        BeginOutcome::Dropped
                    }
                }
            },
        };

        let counter = match outcome {
            BeginOutcome::Inserted => &self.counters.inserted,
            BeginOutcome::Replaced => &self.counters.replaced,
            BeginOutcome::Rejected => &self.counters.rejected,
            BeginOutcome::Versioned => &self.counters.versioned,
            BeginOutcome::Dropped => &self.counters.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        outcome
    }

    /// Take the pending record for `key`, if any
    pub fn end(&self, key: &K) -> Option<V> {
        let record = match self.map.entry(key.clone()) {
            Entry::Vacant(_) => None,
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                match slot.shadowed.pop() {
                    Some(older) => Some(std::mem::replace(&mut slot.current, older)),
                    None => Some(occupied.remove().current),
                }
            }
        };

        match record {
            Some(_) => {
                self.occupancy.fetch_sub(1, Ordering::AcqRel);
                self.counters.matched.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.counters.missed.fetch_add(1, Ordering::Relaxed);
            }
        }
        record
    }

    /// Remove every pending record for which `expired` returns true
    ///
    /// Returns the number of records evicted.
    pub fn sweep(&self, mut expired: impl FnMut(&V) -> bool) -> usize {
        let mut evicted = 0;
        self.map.retain(|_, slot| {
            let (removed, alive) = slot.evict(&mut expired);
            evicted += removed;
            alive
        });

        self.occupancy.fetch_sub(evicted, Ordering::AcqRel);
        self.counters
            .evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Drop every pending record, returning how many there were
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        self.map.retain(|_, slot| {
            removed += slot.len();
            false
        });
        self.occupancy.fetch_sub(removed, Ordering::AcqRel);
        removed
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Number of pending records
    pub fn len(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BeginPolicy {
        self.policy
    }

    pub fn stats(&self) -> TableStats {
        let c = &self.counters;
        TableStats {
            inserted: c.inserted.load(Ordering::Relaxed),
            replaced: c.replaced.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            versioned: c.versioned.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            matched: c.matched.load(Ordering::Relaxed),
            missed: c.missed.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            pending: self.len(),
            capacity: self.capacity,
        }
    }

    fn try_reserve(&self) -> bool {
        self.occupancy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_then_end_returns_record() {
        let table = CorrelationTable::new(4, BeginPolicy::Overwrite);
        assert_eq!(table.begin(1u64, "a"), BeginOutcome::Inserted);
        assert_eq!(table.len(), 1);
        assert_eq!(table.end(&1), Some("a"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_end_without_begin_is_miss() {
        let table: CorrelationTable<u64, u64> = CorrelationTable::new(4, BeginPolicy::Overwrite);
        assert_eq!(table.end(&9), None);
        assert_eq!(table.stats().missed, 1);
        assert_eq!(table.stats().matched, 0);
    }

    #[test]
    fn test_second_end_misses() {
        let table = CorrelationTable::new(4, BeginPolicy::Overwrite);
        table.begin(1u64, 10u64);
        assert_eq!(table.end(&1), Some(10));
        assert_eq!(table.end(&1), None);
    }

    #[test]
    fn test_overwrite_policy_keeps_newest() {
        let table = CorrelationTable::new(4, BeginPolicy::Overwrite);
        table.begin(3u64, 100u64);
        assert_eq!(table.begin(3, 200), BeginOutcome::Replaced);
        assert_eq!(table.len(), 1);
        assert_eq!(table.end(&3), Some(200));
        assert_eq!(table.end(&3), None);
    }

    #[test]
    fn test_reject_policy_keeps_oldest() {
        let table = CorrelationTable::new(4, BeginPolicy::Reject);
        table.begin(3u64, 100u64);
        assert_eq!(table.begin(3, 200), BeginOutcome::Rejected);
        assert_eq!(table.end(&3), Some(100));
        assert_eq!(table.stats().rejected, 1);
    }

    #[test]
    fn test_version_policy_unwinds_newest_first() {
        let table = CorrelationTable::new(4, BeginPolicy::Version);
        table.begin(3u64, 100u64);
        assert_eq!(table.begin(3, 200), BeginOutcome::Versioned);
        assert_eq!(table.len(), 2);
        assert_eq!(table.end(&3), Some(200));
        assert_eq!(table.end(&3), Some(100));
        assert_eq!(table.end(&3), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_version_policy_counts_against_capacity() {
        let table = CorrelationTable::new(2, BeginPolicy::Version);
        table.begin(1u64, 1u64);
        table.begin(1, 2);
        assert_eq!(table.begin(1, 3), BeginOutcome::Dropped);
        assert_eq!(table.end(&1), Some(2));
    }

    #[test]
    fn test_capacity_drops_new_keys_only() {
        let table = CorrelationTable::new(2, BeginPolicy::Overwrite);
        assert_eq!(table.begin(1u64, 'a'), BeginOutcome::Inserted);
        assert_eq!(table.begin(2, 'b'), BeginOutcome::Inserted);
        assert_eq!(table.begin(3, 'c'), BeginOutcome::Dropped);

        // Existing keys can still be overwritten at capacity
        assert_eq!(table.begin(2, 'B'), BeginOutcome::Replaced);

        assert_eq!(table.end(&3), None);
        assert_eq!(table.end(&1), Some('a'));
        assert_eq!(table.end(&2), Some('B'));
        assert_eq!(table.stats().dropped, 1);
    }

    #[test]
    fn test_capacity_frees_after_end() {
        let table = CorrelationTable::new(1, BeginPolicy::Overwrite);
        table.begin(1u64, ());
        assert_eq!(table.begin(2, ()), BeginOutcome::Dropped);
        table.end(&1);
        assert_eq!(table.begin(2, ()), BeginOutcome::Inserted);
    }

    #[test]
    fn test_sweep_evicts_expired() {
        let table = CorrelationTable::new(8, BeginPolicy::Overwrite);
        for key in 0u64..6 {
            table.begin(key, key * 100);
        }
        let evicted = table.sweep(|start| *start < 300);
        assert_eq!(evicted, 3);
        assert_eq!(table.len(), 3);
        assert_eq!(table.end(&1), None);
        assert_eq!(table.end(&4), Some(400));
        assert_eq!(table.stats().evicted, 3);
    }

    #[test]
    fn test_sweep_promotes_shadowed_record() {
        let table = CorrelationTable::new(8, BeginPolicy::Version);
        table.begin(1u64, 10u64);
        table.begin(1, 500);
        table.begin(1, 20);
        assert_eq!(table.sweep(|start| *start < 100), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.end(&1), Some(500));
        assert!(!table.contains(&1));
    }

    #[test]
    fn test_clear_resets_occupancy() {
        let table = CorrelationTable::new(3, BeginPolicy::Version);
        table.begin(1u64, ());
        table.begin(1, ());
        table.begin(2, ());
        assert_eq!(table.clear(), 3);
        assert!(table.is_empty());
        assert_eq!(table.begin(5, ()), BeginOutcome::Inserted);
    }

    #[test]
    #[should_panic(expected = "Correlation table capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = CorrelationTable::<u64, u64>::new(0, BeginPolicy::Overwrite);
    }

    #[test]
    fn test_outcome_tracking() {
        assert!(BeginOutcome::Inserted.is_tracked());
        assert!(BeginOutcome::Replaced.is_tracked());
        assert!(BeginOutcome::Versioned.is_tracked());
        assert!(!BeginOutcome::Rejected.is_tracked());
        assert!(!BeginOutcome::Dropped.is_tracked());
    }
}
