//! Size- and time-bounded LRU cache (C1).
//!
//! Mirrors the `Ns_Cache` contract: a named container with a hard byte
//! budget, a hash `key -> entry`, and an MRU-ordered list. Every mutating
//! operation expects the caller to be holding the cache's lock; the only
//! primitive that releases and reacquires it internally is
//! `wait_create_entry`, across the condition-variable wait.
//!
//! The intrusive doubly-linked list from the original design is realized
//! as index-based links into a backing arena (`Vec<Slot<K, V>>`), per the
//! "avoid the per-entry owning-pointer graph" design note, rather than a
//! graph of owning pointers.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

const NONE: usize = usize::MAX;

/// A cache entry's value slot. `Inflight` models the NULL-value marker:
/// another thread is building this entry's value.
enum ValueSlot<V> {
    Inflight,
    Present(V),
}

struct Slot<K, V> {
    key: K,
    value: ValueSlot<V>,
    /// Absolute expiry instant. `None` means "never expires".
    expires: Option<Instant>,
    size: usize,
    /// Microsecond cost to build, as measured by the caller.
    cost_us: u64,
    reuse_count: u64,
    prev: usize,
    next: usize,
}

/// Aggregate cache statistics, exposed read-only to callers.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub nhit: u64,
    pub nmiss: u64,
    pub nexpired: u64,
    pub nflushed: u64,
    pub npruned: u64,
}

struct Inner<K, V> {
    slots: Vec<Slot<K, V>>,
    free_list: Vec<usize>,
    index: HashMap<K, usize>,
    head: usize, // MRU
    tail: usize, // LRU
    current_size: usize,
    max_size: usize,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev != NONE {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NONE {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.slots[idx].prev = NONE;
        self.slots[idx].next = NONE;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = NONE;
        self.slots[idx].next = self.head;
        if self.head != NONE {
            self.slots[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NONE {
            self.tail = idx;
        }
    }

    fn touch_mru(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn is_expired(slot: &Slot<K, V>, now: Instant) -> bool {
        matches!(slot.expires, Some(exp) if exp <= now)
    }

    /// Removes a slot from the list+index+arena and returns its value
    /// (if present) for the caller to drop under the right conditions.
    fn remove_slot(&mut self, idx: usize) -> ValueSlot<V> {
        self.unlink(idx);
        let slot = &mut self.slots[idx];
        self.current_size -= slot.size;
        let key = slot.key.clone();
        self.index.remove(&key);
        let value = std::mem::replace(&mut slot.value, ValueSlot::Inflight);
        self.free_list.push(idx);
        value
    }

    /// Deletes expired entries found during a lookup/iteration pass.
    fn expire_if_needed(&mut self, idx: usize, now: Instant) -> bool {
        if Self::is_expired(&self.slots[idx], now) {
            self.remove_slot(idx);
            self.stats.nexpired += 1;
            true
        } else {
            false
        }
    }

    /// Prunes LRU-tail entries while over budget, stopping at the
    /// in-progress entry and at any inflight entry.
    fn prune(&mut self, protect: usize) {
        while self.current_size > self.max_size {
            let tail = self.tail;
            if tail == NONE || tail == protect {
                break;
            }
            if matches!(self.slots[tail].value, ValueSlot::Inflight) {
                break;
            }
            self.remove_slot(tail);
            self.stats.npruned += 1;
        }
    }
}

/// A size/TTL-bounded LRU cache. Safe for concurrent callers; every
/// mutating method takes the internal lock itself except where noted.
pub struct Cache<K: Eq + Hash + Clone, V> {
    name: String,
    inner: Mutex<Inner<K, V>>,
    cond: Condvar,
}

/// Handle identifying a live entry. Opaque to callers; only meaningful
/// for the cache that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle(usize);

impl<K: Eq + Hash + Clone, V> Cache<K, V> {
    pub fn new(name: impl Into<String>, max_size: usize) -> Self {
        Cache {
            name: name.into(),
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free_list: Vec::new(),
                index: HashMap::new(),
                head: NONE,
                tail: NONE,
                current_size: 0,
                max_size,
                stats: CacheStats::default(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    pub fn current_size(&self) -> usize {
        self.inner.lock().current_size
    }

    /// `find(cache, key) -> entry?`. Lazily expires the entry if its TTL
    /// has elapsed. On hit, promotes the entry to MRU and bumps reuse
    /// count.
    pub fn find(&self, key: &K) -> Option<EntryHandle> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let idx = match inner.index.get(key).copied() {
            Some(idx) => idx,
            None => {
                inner.stats.nmiss += 1;
                return None;
            }
        };
        if inner.expire_if_needed(idx, now) {
            inner.stats.nmiss += 1;
            return None;
        }
        if matches!(inner.slots[idx].value, ValueSlot::Inflight) {
            // Inflight entries are not a hit; treat as a miss for stats
            // purposes but still return the handle so wait_create_entry
            // can observe it.
            inner.stats.nmiss += 1;
            return Some(EntryHandle(idx));
        }
        inner.touch_mru(idx);
        inner.slots[idx].reuse_count += 1;
        inner.stats.nhit += 1;
        Some(EntryHandle(idx))
    }

    /// `create_entry(cache, key, &is_new) -> entry`. Creates a fresh
    /// inflight entry if the key is absent or the existing one is
    /// expired; otherwise returns the existing entry (which may already
    /// be inflight or carry a value).
    pub fn create_entry(&self, key: K) -> (EntryHandle, bool) {
        let mut inner = self.inner.lock();
        self.create_entry_locked(&mut inner, key)
    }

    fn create_entry_locked(&self, inner: &mut Inner<K, V>, key: K) -> (EntryHandle, bool) {
        let now = Instant::now();
        if let Some(&idx) = inner.index.get(&key) {
            if !inner.expire_if_needed(idx, now) {
                return (EntryHandle(idx), false);
            }
        }
        let idx = if let Some(idx) = inner.free_list.pop() {
            inner.slots[idx] = Slot {
                key: key.clone(),
                value: ValueSlot::Inflight,
                expires: None,
                size: 0,
                cost_us: 0,
                reuse_count: 0,
                prev: NONE,
                next: NONE,
            };
            idx
        } else {
            inner.slots.push(Slot {
                key: key.clone(),
                value: ValueSlot::Inflight,
                expires: None,
                size: 0,
                cost_us: 0,
                reuse_count: 0,
                prev: NONE,
                next: NONE,
            });
            inner.slots.len() - 1
        };
        inner.index.insert(key, idx);
        inner.push_front(idx);
        (EntryHandle(idx), true)
    }

    /// `wait_create_entry(cache, key, deadline) -> entry?`. Calls
    /// `create_entry`; while the entry already existed and is inflight,
    /// waits on the condition variable until `deadline`, then retries.
    /// Returns `None` on deadline expiry. The lock is held on return in
    /// both the `Some` and `None` cases (matches the invariant that
    /// `wait_create_entry` never returns with the lock dropped).
    pub fn wait_create_entry(&self, key: K, deadline: Instant) -> Option<EntryHandle>
    where
        K: Clone,
    {
        let mut inner = self.inner.lock();
        loop {
            let (handle, is_new) = self.create_entry_locked(&mut inner, key.clone());
            if is_new || !matches!(inner.slots[handle.0].value, ValueSlot::Inflight) {
                return Some(handle);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let timed_out = self
                .cond
                .wait_until(&mut inner, deadline)
                .timed_out();
            if timed_out {
                return None;
            }
        }
    }

    /// `set_value(entry, value, size, expiry, cost)`. Caller must hold
    /// the cache lock (acquired implicitly here); per the design
    /// convention, long builds should be performed with the lock
    /// released and only re-acquired for this call plus `broadcast`.
    pub fn set_value(
        &self,
        entry: EntryHandle,
        value: V,
        size: usize,
        expiry: Option<Instant>,
        cost_us: u64,
    ) {
        let mut inner = self.inner.lock();
        let idx = entry.0;
        let old_size = inner.slots[idx].size;
        inner.slots[idx].value = ValueSlot::Present(value);
        inner.slots[idx].size = size;
        inner.slots[idx].expires = expiry;
        inner.slots[idx].cost_us = cost_us;
        inner.current_size = inner.current_size - old_size + size;
        inner.prune(idx);
    }

    /// `unset_value(entry)`. Frees the value and marks the entry
    /// inflight again. The slot is nulled before the value is dropped so
    /// that a re-entrant destructor sees an inflight entry, not a
    /// double-free.
    pub fn unset_value(&self, entry: EntryHandle) {
        let mut inner = self.inner.lock();
        let idx = entry.0;
        let old_size = inner.slots[idx].size;
        inner.current_size -= old_size;
        inner.slots[idx].size = 0;
        let old = std::mem::replace(&mut inner.slots[idx].value, ValueSlot::Inflight);
        drop(inner);
        drop(old);
    }

    /// `delete_entry`. Removes the entry outright (e.g. on build
    /// failure of an inflight placeholder).
    pub fn delete_entry(&self, entry: EntryHandle) {
        let mut inner = self.inner.lock();
        let value = inner.remove_slot(entry.0);
        drop(inner);
        drop(value);
    }

    /// `flush_entry`. Sets the value to NULL before dropping it (same
    /// reentrancy guarantee as `unset_value`), then deletes the entry
    /// and counts it as flushed.
    pub fn flush_entry(&self, entry: EntryHandle) {
        let mut inner = self.inner.lock();
        let value = inner.remove_slot(entry.0);
        inner.stats.nflushed += 1;
        drop(inner);
        drop(value);
    }

    /// `flush(cache)`. Flushes every live entry.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        let mut idx = inner.head;
        let mut victims = Vec::new();
        while idx != NONE {
            victims.push(idx);
            idx = inner.slots[idx].next;
        }
        let count = victims.len() as u64;
        let mut dropped = Vec::with_capacity(victims.len());
        for idx in victims {
            dropped.push(inner.remove_slot(idx));
        }
        inner.stats.nflushed += count;
        drop(inner);
        drop(dropped);
    }

    /// `broadcast`. Wakes every thread waiting in `wait_create_entry`.
    pub fn broadcast(&self) {
        self.cond.notify_all();
    }

    /// `signal`. Wakes a single waiter.
    pub fn signal(&self) {
        self.cond.notify_one();
    }

    /// Runs `f` with exclusive access to an entry's value, if present.
    /// This is the safe substitute for exposing the raw value pointer:
    /// callers that need to read/copy a value under the lock use this.
    pub fn with_value<R>(&self, entry: EntryHandle, f: impl FnOnce(Option<&V>) -> R) -> R {
        let inner = self.inner.lock();
        let value = match &inner.slots[entry.0].value {
            ValueSlot::Present(v) => Some(v),
            ValueSlot::Inflight => None,
        };
        f(value)
    }

    pub fn entry_size(&self, entry: EntryHandle) -> usize {
        self.inner.lock().slots[entry.0].size
    }

    /// True if the entry returned by `create_entry`/`wait_create_entry`
    /// still has no value — i.e. the caller is responsible for building
    /// it (or it was left inflight by a builder that failed and has not
    /// yet called `delete_entry`).
    pub fn is_inflight(&self, entry: EntryHandle) -> bool {
        matches!(self.inner.lock().slots[entry.0].value, ValueSlot::Inflight)
    }

    pub fn entry_reuse_count(&self, entry: EntryHandle) -> u64 {
        self.inner.lock().slots[entry.0].reuse_count
    }

    /// Iteration cursor produced by `first_entry`/`next_entry`. Captures
    /// "now" once so expiry checks are stable across one walk.
    pub fn first_entry(&self) -> CacheSearch<K, V> {
        let now = Instant::now();
        let start = self.inner.lock().head;
        CacheSearch { now, next: start, _marker: std::marker::PhantomData }
    }

    pub fn next_entry(&self, search: &mut CacheSearch<K, V>) -> Option<EntryHandle> {
        loop {
            let mut inner = self.inner.lock();
            let idx = search.next;
            if idx == NONE {
                return None;
            }
            search.next = inner.slots[idx].next;
            if inner.expire_if_needed(idx, search.now) {
                continue;
            }
            if matches!(inner.slots[idx].value, ValueSlot::Inflight) {
                continue;
            }
            return Some(EntryHandle(idx));
        }
    }

    /// Waits on the cache's condition variable with no deadline, for
    /// callers implementing their own coalescing protocol on top of C1
    /// (e.g. C3's `eval`). Mirrors `cache_wait`.
    pub fn wait(&self, deadline: Option<Instant>) -> WaitStatus {
        let mut inner = self.inner.lock();
        match deadline {
            None => {
                self.cond.wait(&mut inner);
                WaitStatus::Ok
            }
            Some(d) => {
                if self.cond.wait_until(&mut inner, d).timed_out() {
                    WaitStatus::TimedOut
                } else {
                    WaitStatus::Ok
                }
            }
        }
    }

}

pub struct CacheSearch<K, V> {
    now: Instant,
    next: usize,
    _marker: std::marker::PhantomData<(K, V)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ok,
    TimedOut,
}

/// Convenience for callers that want a relative timeout translated to an
/// absolute deadline, matching the "every wait is deadline-bounded"
/// concurrency-model rule.
pub fn deadline_from(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn bytes(n: usize) -> Vec<u8> {
        vec![0u8; n]
    }

    #[test]
    fn lru_eviction_scenario() {
        // §8 scenario 1: max_size=30, store a/b/c at 10B each, find a,
        // store d at 10B -> b evicted, pruned == 1.
        let cache: Cache<String, Vec<u8>> = Cache::new("c", 30);
        for k in ["a", "b", "c"] {
            let (h, _) = cache.create_entry(k.to_string());
            cache.set_value(h, bytes(10), 10, None, 0);
        }
        assert!(cache.find(&"a".to_string()).is_some());
        let (h, _) = cache.create_entry("d".to_string());
        cache.set_value(h, bytes(10), 10, None, 0);

        assert!(cache.find(&"a".to_string()).is_some());
        assert!(cache.find(&"c".to_string()).is_some());
        assert!(cache.find(&"d".to_string()).is_some());
        assert!(cache.find(&"b".to_string()).is_none());
        assert_eq!(cache.stats().npruned, 1);
        assert_eq!(cache.current_size(), 30);
    }

    #[test]
    fn set_then_delete_preserves_current_size() {
        let cache: Cache<String, Vec<u8>> = Cache::new("c", 1000);
        let (h, _) = cache.create_entry("k".to_string());
        cache.set_value(h, bytes(42), 42, None, 0);
        assert_eq!(cache.current_size(), 42);
        cache.delete_entry(h);
        assert_eq!(cache.current_size(), 0);
    }

    #[test]
    fn expiry_is_detected_lazily_on_find() {
        let cache: Cache<String, Vec<u8>> = Cache::new("c", 1000);
        let (h, _) = cache.create_entry("k".to_string());
        cache.set_value(h, bytes(1), 1, Some(Instant::now() - Duration::from_secs(1)), 0);
        assert!(cache.find(&"k".to_string()).is_none());
        assert_eq!(cache.stats().nexpired, 1);
    }

    #[test]
    fn wait_create_entry_times_out_on_inflight_contention() {
        let cache: Arc<Cache<String, Vec<u8>>> = Arc::new(Cache::new("c", 1000));
        let (_h, is_new) = cache.create_entry("k".to_string());
        assert!(is_new);
        // "k" is now inflight (never set_value'd). A second waiter
        // should time out rather than block forever.
        let deadline = Instant::now() + Duration::from_millis(50);
        let got = cache.wait_create_entry("k".to_string(), deadline);
        assert!(got.is_none());
    }

    #[test]
    fn inflight_coalescing_builder_runs_once() {
        // §8 scenario 2, single-threaded surrogate: two sequential
        // wait_create_entry calls for the same key only see one build.
        let cache: Arc<Cache<String, Vec<u8>>> = Arc::new(Cache::new("c", 1000));
        let build_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let c1 = cache.clone();
        let bc1 = build_count.clone();
        let t1 = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            if let Some(h) = c1.wait_create_entry("k".to_string(), deadline) {
                if c1.is_inflight(h) {
                    bc1.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(80));
                    c1.set_value(h, b"v".to_vec(), 1, None, 0);
                    c1.broadcast();
                }
            }
        });

        thread::sleep(Duration::from_millis(10));

        let c2 = cache.clone();
        let deadline = Instant::now() + Duration::from_secs(2);
        let h2 = c2.wait_create_entry("k".to_string(), deadline).unwrap();
        let v = c2.with_value(h2, |v| v.cloned());
        assert_eq!(v, Some(b"v".to_vec()));

        t1.join().unwrap();
        assert_eq!(build_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn iteration_skips_inflight_entries() {
        let cache: Cache<String, Vec<u8>> = Cache::new("c", 1000);
        let (h1, _) = cache.create_entry("a".to_string());
        cache.set_value(h1, bytes(1), 1, None, 0);
        let (_h2, _) = cache.create_entry("b".to_string()); // left inflight

        let mut search = cache.first_entry();
        let mut seen = Vec::new();
        while let Some(h) = cache.next_entry(&mut search) {
            seen.push(cache.entry_size(h));
        }
        assert_eq!(seen, vec![1]);
    }
}
