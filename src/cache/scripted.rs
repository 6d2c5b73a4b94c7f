//! Scripted cache façade (C3): a typed wrapper over [`Cache`] exposing
//! eval/incr/append/flush/keys to the handler layer, with concurrent
//! build coalescing delegated entirely to C1's `wait_create_entry`
//! contract.
//!
//! The "opaque user script" of the original design is realized as a
//! Rust closure: `Fn() -> BuildResult`. This is the sole remaining trace
//! of the out-of-scope scripting interpreter — the façade does not know
//! or care what produced the closure.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::cache::core::{deadline_from, Cache, EntryHandle};
use crate::error::{CoreError, CoreResult};

/// Outcome of a build script invocation.
pub enum BuildOutcome {
    /// Build succeeded; value should be cached.
    Ok(String),
    /// Build failed; the placeholder entry must be deleted, not cached.
    Error,
    /// Build explicitly declined caching (e.g. a `continue`-like return
    /// in the original Tcl semantics); placeholder is deleted too.
    DoNotCache,
}

pub struct ScriptedCacheConfig {
    pub default_wait_timeout: Duration,
    pub default_expiry: Option<Duration>,
    pub max_entry_size: usize,
}

impl Default for ScriptedCacheConfig {
    fn default() -> Self {
        ScriptedCacheConfig {
            default_wait_timeout: Duration::from_secs(0),
            default_expiry: None,
            max_entry_size: usize::MAX,
        }
    }
}

pub struct ScriptedCache {
    cache: Cache<String, String>,
    config: ScriptedCacheConfig,
}

impl ScriptedCache {
    pub fn new(name: impl Into<String>, max_size: usize, config: ScriptedCacheConfig) -> Self {
        ScriptedCache {
            cache: Cache::new(name, max_size),
            config,
        }
    }

    pub fn name(&self) -> &str {
        self.cache.name()
    }

    /// `eval`: returns the cached value if present and valid (unless
    /// `force` is set), otherwise invokes `build` with the lock
    /// released, stores the result, and broadcasts.
    pub fn eval(
        &self,
        key: &str,
        force: bool,
        wait_timeout: Option<Duration>,
        build: impl FnOnce() -> BuildOutcome,
    ) -> CoreResult<String> {
        if !force {
            if let Some(handle) = self.cache.find(&key.to_string()) {
                if !self.cache.is_inflight(handle) {
                    return Ok(self.cache.with_value(handle, |v| v.cloned()).unwrap());
                }
            }
        }

        let deadline = deadline_from(wait_timeout.unwrap_or(self.config.default_wait_timeout));
        let handle = self
            .cache
            .wait_create_entry(key.to_string(), deadline)
            .ok_or(CoreError::CacheWaitTimeout)?;

        if !self.cache.is_inflight(handle) {
            // Another builder finished while we were waiting.
            return Ok(self.cache.with_value(handle, |v| v.cloned()).unwrap());
        }

        // We are the builder: release the lock conceptually by simply
        // not holding any guard across `build()` (the Rust cache never
        // exposes the guard itself, so there is nothing to release).
        let started = Instant::now();
        let outcome = build();
        let cost_us = started.elapsed().as_micros() as u64;

        match outcome {
            BuildOutcome::Ok(value) => {
                let size = value.len();
                if size > self.config.max_entry_size {
                    self.cache.delete_entry(handle);
                    self.cache.broadcast();
                    return Err(CoreError::EntityTooLarge(format!(
                        "value for {key} exceeds max_entry_size"
                    )));
                }
                let expiry = self.config.default_expiry.map(deadline_from);
                self.cache.set_value(handle, value.clone(), size, expiry, cost_us);
                self.cache.broadcast();
                Ok(value)
            }
            BuildOutcome::Error | BuildOutcome::DoNotCache => {
                self.cache.delete_entry(handle);
                self.cache.broadcast();
                Err(CoreError::Internal(format!("build for {key} failed")))
            }
        }
    }

    /// `get`: plain lookup, no build-on-miss.
    pub fn get(&self, key: &str) -> Option<String> {
        let handle = self.cache.find(&key.to_string())?;
        if self.cache.is_inflight(handle) {
            return None;
        }
        self.cache.with_value(handle, |v| v.cloned())
    }

    fn store(&self, key: &str, value: String) {
        let size = value.len();
        if size > self.config.max_entry_size {
            if let Some(handle) = self.cache.find(&key.to_string()) {
                self.cache.delete_entry(handle);
            }
            return;
        }
        let (handle, _) = self.cache.create_entry(key.to_string());
        let expiry = self.config.default_expiry.map(deadline_from);
        self.cache.set_value(handle, value, size, expiry, 0);
        self.cache.broadcast();
    }

    /// `incr`: parse-as-int, add, rewrite. Seeds at zero if absent.
    pub fn incr(&self, key: &str, delta: i64) -> CoreResult<i64> {
        let current = self.get(key).unwrap_or_else(|| "0".to_string());
        let value: i64 = current
            .trim()
            .parse()
            .map_err(|_| CoreError::BadRequest(format!("value for {key} is not an integer")))?;
        let next = value + delta;
        self.store(key, next.to_string());
        Ok(next)
    }

    /// `append`: concatenates onto the existing value (seeding with
    /// empty string if absent).
    pub fn append(&self, key: &str, text: &str) -> String {
        let mut current = self.get(key).unwrap_or_default();
        current.push_str(text);
        self.store(key, current.clone());
        current
    }

    /// `lappend`: append formatted as a Tcl-list element (space
    /// separated; this façade only models the separator contract, not
    /// full Tcl list quoting).
    pub fn lappend(&self, key: &str, text: &str) -> String {
        let mut current = self.get(key).unwrap_or_default();
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(text);
        self.store(key, current.clone());
        current
    }

    /// `flush`: either the whole cache, or a single key.
    pub fn flush(&self) {
        self.cache.flush();
    }

    pub fn flush_key(&self, key: &str) {
        if let Some(handle) = self.cache.find(&key.to_string()) {
            self.cache.flush_entry(handle);
        }
    }

    pub fn stats(&self) -> crate::cache::core::CacheStats {
        self.cache.stats()
    }
}

/// Server-scoped registry resolving cache names to instances, mirroring
/// `pingsix::proxy::route::ROUTE_MAP`'s global-DashMap-registry idiom.
#[derive(Default)]
pub struct ScriptedCacheRegistry {
    caches: DashMap<String, std::sync::Arc<NamedScriptedCache>>,
}

/// A scripted cache that also tracks its own live keys, since `keys()`
/// needs to enumerate by name and the underlying `Cache` intentionally
/// doesn't expose keys from `EntryHandle` alone (handles are opaque).
pub struct NamedScriptedCache {
    inner: ScriptedCache,
    live_keys: dashmap::DashSet<String>,
}

impl NamedScriptedCache {
    pub fn eval(
        &self,
        key: &str,
        force: bool,
        wait_timeout: Option<Duration>,
        build: impl FnOnce() -> BuildOutcome,
    ) -> CoreResult<String> {
        let result = self.inner.eval(key, force, wait_timeout, build);
        if result.is_ok() {
            self.live_keys.insert(key.to_string());
        }
        result
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    pub fn incr(&self, key: &str, delta: i64) -> CoreResult<i64> {
        let r = self.inner.incr(key, delta);
        if r.is_ok() {
            self.live_keys.insert(key.to_string());
        }
        r
    }

    pub fn append(&self, key: &str, text: &str) -> String {
        self.live_keys.insert(key.to_string());
        self.inner.append(key, text)
    }

    pub fn lappend(&self, key: &str, text: &str) -> String {
        self.live_keys.insert(key.to_string());
        self.inner.lappend(key, text)
    }

    pub fn flush(&self) {
        self.inner.flush();
        self.live_keys.clear();
    }

    pub fn flush_key(&self, key: &str) {
        self.inner.flush_key(key);
        self.live_keys.remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.live_keys
            .iter()
            .filter(|k| self.inner.get(k.key()).is_some())
            .map(|k| k.key().clone())
            .collect()
    }

    pub fn stats(&self) -> crate::cache::core::CacheStats {
        self.inner.stats()
    }
}

impl ScriptedCacheRegistry {
    pub fn create(
        &self,
        name: impl Into<String>,
        max_size: usize,
        config: ScriptedCacheConfig,
    ) -> std::sync::Arc<NamedScriptedCache> {
        let name = name.into();
        let cache = std::sync::Arc::new(NamedScriptedCache {
            inner: ScriptedCache::new(name.clone(), max_size, config),
            live_keys: dashmap::DashSet::new(),
        });
        self.caches.insert(name, cache.clone());
        cache
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<NamedScriptedCache>> {
        self.caches.get(name).map(|c| c.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.caches.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_caches_build_result_and_skips_rebuild() {
        let cache = ScriptedCache::new("c", 1_000_000, ScriptedCacheConfig::default());
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let build = || {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            BuildOutcome::Ok("v".to_string())
        };
        assert_eq!(cache.eval("k", false, None, build).unwrap(), "v");
        let build2 = || {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            BuildOutcome::Ok("v2".to_string())
        };
        assert_eq!(cache.eval("k", false, None, build2).unwrap(), "v");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn eval_force_rebuilds() {
        let cache = ScriptedCache::new("c", 1_000_000, ScriptedCacheConfig::default());
        cache.eval("k", false, None, || BuildOutcome::Ok("v".into())).unwrap();
        let v = cache.eval("k", true, None, || BuildOutcome::Ok("v2".into())).unwrap();
        assert_eq!(v, "v2");
    }

    #[test]
    fn build_failure_deletes_placeholder() {
        let cache = ScriptedCache::new("c", 1_000_000, ScriptedCacheConfig::default());
        let err = cache.eval("k", false, None, || BuildOutcome::Error);
        assert!(err.is_err());
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn incr_seeds_at_zero_and_accumulates() {
        let cache = ScriptedCache::new("c", 1_000_000, ScriptedCacheConfig::default());
        assert_eq!(cache.incr("n", 5).unwrap(), 5);
        assert_eq!(cache.incr("n", 3).unwrap(), 8);
    }

    #[test]
    fn append_and_lappend() {
        let cache = ScriptedCache::new("c", 1_000_000, ScriptedCacheConfig::default());
        assert_eq!(cache.append("s", "a"), "a");
        assert_eq!(cache.append("s", "b"), "ab");
        assert_eq!(cache.lappend("l", "x"), "x");
        assert_eq!(cache.lappend("l", "y"), "x y");
    }

    #[test]
    fn single_entry_cap_deletes_oversized_value() {
        let config = ScriptedCacheConfig { max_entry_size: 2, ..Default::default() };
        let cache = ScriptedCache::new("c", 1_000_000, config);
        let result = cache.eval("k", false, None, || BuildOutcome::Ok("too-long".into()));
        assert!(result.is_err());
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn registry_tracks_names_and_keys() {
        let registry = ScriptedCacheRegistry::default();
        let cache = registry.create("mycache", 1000, ScriptedCacheConfig::default());
        cache.append("a", "1");
        cache.append("b", "2");
        assert_eq!(registry.names(), vec!["mycache".to_string()]);
        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
