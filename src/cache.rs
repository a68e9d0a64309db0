//! Set-associative LRU cache manager.
//!
//! A fixed-capacity map from 64-bit keys to user values. A key hashes to a
//! single set of `assoc` slots searched linearly; within a set, slot 0 is
//! the most recently used entry and slot `assoc - 1` the least recently
//! used. Displaced entries are handed to a caller-supplied [`Writeback`]
//! capability rather than dropped, which is what makes the cache usable as
//! a staging layer in front of a stream.
//!
//! Reads follow a checkout pattern: a hit removes the entry and returns it
//! to the caller without invoking writeback. The caller owns the value from
//! then on and re-inserts it with [`CacheManager::write`] when done.

use std::mem;
use std::sync::{Arc, Mutex};

use log;

use crate::error::Result;
use crate::memory::{MemoryCharge, MemoryManager};

/// Capability invoked when the cache displaces an occupied slot.
pub trait Writeback<T> {
    fn write_back(&mut self, value: T);
}

impl<T, F: FnMut(T)> Writeback<T> for F {
    fn write_back(&mut self, value: T) {
        self(value)
    }
}

/// LRU set-associative cache manager.
///
/// Public operations serialize on an internal lock, so a shared instance
/// may be used from several threads; each operation is atomic relative to
/// the others.
pub struct CacheManager<T, W: Writeback<T>> {
    inner: Mutex<CacheInner<T, W>>,
}

struct CacheInner<T, W> {
    /// `sets * assoc` slots; within a set the occupied slots form a dense
    /// MRU-to-LRU prefix.
    slots: Vec<Option<(u64, T)>>,
    capacity: usize,
    assoc: usize,
    sets: usize,
    writeback: W,
    _charge: Option<MemoryCharge>,
}

impl<T, W: Writeback<T>> CacheManager<T, W> {
    /// Creates a cache with `capacity` entries and `assoc` entries per set,
    /// charging the slot array against the global memory manager.
    ///
    /// `assoc == 0` selects full associativity. An associativity above the
    /// capacity is clamped, and a capacity that is not a multiple of the
    /// associativity is rounded down; both emit a warning.
    pub fn new(capacity: usize, assoc: usize, writeback: W) -> Result<Self> {
        Self::with_memory_manager(capacity, assoc, writeback, MemoryManager::global())
    }

    /// Creates a cache charging the slot array against the given manager.
    pub fn with_memory_manager(
        capacity: usize,
        mut assoc: usize,
        writeback: W,
        memory: &Arc<MemoryManager>,
    ) -> Result<Self> {
        let mut capacity = capacity;
        let sets;

        if capacity != 0 {
            if assoc == 0 {
                assoc = capacity;
            }
            if assoc > capacity {
                log::warn!("associativity {} exceeds capacity {}; reduced", assoc, capacity);
                assoc = capacity;
            }
            if capacity % assoc != 0 {
                let rounded = (capacity / assoc) * assoc;
                log::warn!(
                    "capacity {} is not a multiple of associativity {}; reduced to {}",
                    capacity,
                    assoc,
                    rounded
                );
                capacity = rounded;
            }
            sets = capacity / assoc;
        } else {
            assoc = 0;
            sets = 0;
        }

        let charge = if capacity != 0 {
            let bytes = (capacity * mem::size_of::<Option<(u64, T)>>()) as u64;
            Some(MemoryCharge::take(memory, bytes)?)
        } else {
            None
        };

        let mut slots = Vec::new();
        slots.resize_with(capacity, || None);

        return Ok(CacheManager {
            inner: Mutex::new(CacheInner {
                slots,
                capacity,
                assoc,
                sets,
                writeback,
                _charge: charge,
            }),
        });
    }

    /// Looks up `key` and, on a hit, removes the entry and returns it.
    ///
    /// The value is checked out to the caller; no writeback occurs.
    pub fn read(&self, key: u64) -> Option<T> {
        assert!(key != 0, "key 0 is reserved for empty slots");
        let mut inner = self.inner.lock().unwrap();
        if inner.capacity == 0 {
            return None;
        }

        let base = (key % inner.sets as u64) as usize * inner.assoc;
        let assoc = inner.assoc;
        let hit = (base..base + assoc).find(|&i| matches!(&inner.slots[i], Some((k, _)) if *k == key))?;

        let (_, value) = inner.slots[hit].take().unwrap();
        // compact so the occupied slots stay a dense MRU prefix
        inner.slots[hit..base + assoc].rotate_left(1);
        return Some(value);
    }

    /// Inserts an entry at the MRU position of its set.
    ///
    /// The occupied LRU slot, if any, is displaced through the writeback
    /// capability first. A zero-capacity cache forwards the value to
    /// writeback immediately.
    pub fn write(&self, key: u64, value: T) {
        assert!(key != 0, "key 0 is reserved for empty slots");
        let mut inner = self.inner.lock().unwrap();
        if inner.capacity == 0 {
            let inner = &mut *inner;
            inner.writeback.write_back(value);
            return;
        }

        let base = (key % inner.sets as u64) as usize * inner.assoc;
        let assoc = inner.assoc;

        let inner = &mut *inner;
        if let Some((_, displaced)) = inner.slots[base + assoc - 1].take() {
            inner.writeback.write_back(displaced);
        }
        inner.slots[base..base + assoc].rotate_right(1);
        inner.slots[base] = Some((key, value));
    }

    /// Removes `key` from the cache, writing the value back first.
    /// Returns whether the key was present.
    pub fn erase(&self, key: u64) -> bool {
        assert!(key != 0, "key 0 is reserved for empty slots");
        let mut inner = self.inner.lock().unwrap();
        if inner.capacity == 0 {
            return false;
        }

        let base = (key % inner.sets as u64) as usize * inner.assoc;
        let assoc = inner.assoc;
        let hit = match (base..base + assoc).find(|&i| matches!(&inner.slots[i], Some((k, _)) if *k == key)) {
            Some(hit) => hit,
            None => return false,
        };

        let inner = &mut *inner;
        let (_, value) = inner.slots[hit].take().unwrap();
        inner.writeback.write_back(value);
        inner.slots[hit..base + assoc].rotate_left(1);
        return true;
    }

    /// Writes back every occupied slot and empties the cache.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        for slot in inner.slots.iter_mut() {
            if let Some((_, value)) = slot.take() {
                inner.writeback.write_back(value);
            }
        }
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Effective capacity after rounding.
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Effective associativity.
    pub fn associativity(&self) -> usize {
        self.inner.lock().unwrap().assoc
    }

    #[cfg(test)]
    fn keys_in_set(&self, set: usize) -> Vec<u64> {
        let inner = self.inner.lock().unwrap();
        let base = set * inner.assoc;
        inner.slots[base..base + inner.assoc]
            .iter()
            .filter_map(|slot| slot.as_ref().map(|(k, _)| *k))
            .collect()
    }
}

impl<T, W: Writeback<T>> Drop for CacheManager<T, W> {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use rstest::*;

    use super::CacheManager;

    /// Writeback functor appending to a shared log.
    fn logging_writeback<T>(log: &Arc<Mutex<Vec<T>>>) -> impl FnMut(T) {
        let log = log.clone();
        move |value| log.lock().unwrap().push(value)
    }

    #[test]
    fn test_eviction_order_within_one_set() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cache = CacheManager::new(4, 2, logging_writeback(&log)).unwrap();

        // keys 1,3,5,7,9 all hash to set 1 of 2
        for (key, value) in [(1, 'a'), (3, 'b'), (5, 'c'), (7, 'd'), (9, 'e')] {
            cache.write(key, value);
        }

        assert_eq!(*log.lock().unwrap(), vec!['a', 'b', 'c']);
        assert_eq!(cache.keys_in_set(1), vec![9, 7]);
        assert_eq!(cache.keys_in_set(0), Vec::<u64>::new());
    }

    #[test]
    fn test_read_removes_without_writeback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cache = CacheManager::new(4, 2, logging_writeback(&log)).unwrap();

        cache.write(2, "two");
        assert_eq!(cache.read(2), Some("two"));
        assert_eq!(cache.read(2), None);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_read_keeps_dense_prefix() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cache = CacheManager::new(4, 4, logging_writeback(&log)).unwrap();

        cache.write(1, 10);
        cache.write(2, 20);
        cache.write(3, 30);
        assert_eq!(cache.keys_in_set(0), vec![3, 2, 1]);

        assert_eq!(cache.read(2), Some(20));
        assert_eq!(cache.keys_in_set(0), vec![3, 1]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_erase_writes_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cache = CacheManager::new(4, 2, logging_writeback(&log)).unwrap();

        cache.write(1, 'x');
        assert!(cache.erase(1));
        assert!(!cache.erase(1));
        assert_eq!(*log.lock().unwrap(), vec!['x']);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_flush_empties_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cache = CacheManager::new(6, 3, logging_writeback(&log)).unwrap();

        for key in 1..=5u64 {
            cache.write(key, key * 100);
        }
        cache.flush();

        assert_eq!(cache.len(), 0);
        let mut written: Vec<u64> = log.lock().unwrap().clone();
        written.sort_unstable();
        assert_eq!(written, vec![100, 200, 300, 400, 500]);
    }

    #[test]
    fn test_zero_capacity_forwards_writes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cache = CacheManager::new(0, 2, logging_writeback(&log)).unwrap();

        cache.write(1, 'a');
        cache.write(2, 'b');
        assert_eq!(cache.read(1), None);
        assert_eq!(*log.lock().unwrap(), vec!['a', 'b']);
    }

    #[rstest]
    #[case(5, 2, 4, 2)]
    #[case(9, 4, 8, 4)]
    #[case(4, 8, 4, 4)]
    #[case(4, 0, 4, 4)]
    fn test_parameter_normalization(
        #[case] capacity: usize,
        #[case] assoc: usize,
        #[case] effective_capacity: usize,
        #[case] effective_assoc: usize,
    ) {
        let cache = CacheManager::new(capacity, assoc, |_: u32| {}).unwrap();
        assert_eq!(cache.capacity(), effective_capacity);
        assert_eq!(cache.associativity(), effective_assoc);
    }

    #[test]
    fn test_fully_associative_ignores_key_distribution() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cache = CacheManager::new(4, 0, logging_writeback(&log)).unwrap();

        for key in [2, 4, 6, 8u64] {
            cache.write(key, key);
        }
        assert_eq!(cache.len(), 4);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(cache.keys_in_set(0), vec![8, 6, 4, 2]);
    }

    #[test]
    fn test_drop_flushes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let cache = CacheManager::new(2, 1, logging_writeback(&log)).unwrap();
            cache.write(1, 'q');
        }
        assert_eq!(*log.lock().unwrap(), vec!['q']);
    }
}
