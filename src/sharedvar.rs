//! Shared variables (C14): a fixed-bucket-count store of named arrays
//! of string key/value pairs, each bucket independently lockable.

use std::collections::HashMap;

use parking_lot::Mutex;

type Array = HashMap<String, String>;

struct Bucket {
    arrays: Mutex<HashMap<String, Array>>,
}

/// A shared-variable pool with a fixed number of independently-locked
/// buckets, sized at construction time.
pub struct SharedVarPool {
    buckets: Vec<Bucket>,
}

fn bucket_hash(name: &str) -> u64 {
    let mut hash: u64 = 0;
    for c in name.bytes() {
        hash = hash.wrapping_shl(3).wrapping_add(hash).wrapping_add(c as u64);
    }
    hash
}

impl SharedVarPool {
    pub fn new(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        let buckets = (0..bucket_count).map(|_| Bucket { arrays: Mutex::new(HashMap::new()) }).collect();
        SharedVarPool { buckets }
    }

    fn bucket_for(&self, array_name: &str) -> &Bucket {
        let idx = (bucket_hash(array_name) % self.buckets.len() as u64) as usize;
        &self.buckets[idx]
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn get(&self, array: &str, key: &str) -> Option<String> {
        let bucket = self.bucket_for(array);
        let arrays = bucket.arrays.lock();
        arrays.get(array).and_then(|a| a.get(key)).cloned()
    }

    pub fn set(&self, array: &str, key: &str, value: impl Into<String>) {
        let bucket = self.bucket_for(array);
        let mut arrays = bucket.arrays.lock();
        arrays.entry(array.to_string()).or_default().insert(key.to_string(), value.into());
    }

    pub fn exists(&self, array: &str, key: &str) -> bool {
        let bucket = self.bucket_for(array);
        let arrays = bucket.arrays.lock();
        arrays.get(array).map(|a| a.contains_key(key)).unwrap_or(false)
    }

    /// Parses the existing value as an integer, adds `delta`, and
    /// rewrites it. Missing keys start at zero.
    pub fn incr(&self, array: &str, key: &str, delta: i64) -> Result<i64, std::num::ParseIntError> {
        let bucket = self.bucket_for(array);
        let mut arrays = bucket.arrays.lock();
        let entry = arrays.entry(array.to_string()).or_default();
        let current: i64 = match entry.get(key) {
            Some(existing) => existing.parse()?,
            None => 0,
        };
        let updated = current + delta;
        entry.insert(key.to_string(), updated.to_string());
        Ok(updated)
    }

    /// Concatenates each piece of `values` onto the existing value (or
    /// starts fresh if unset), returning the new value.
    pub fn append(&self, array: &str, key: &str, values: &[&str]) -> String {
        let bucket = self.bucket_for(array);
        let mut arrays = bucket.arrays.lock();
        let entry = arrays.entry(array.to_string()).or_default();
        let mut current = entry.get(key).cloned().unwrap_or_default();
        for v in values {
            current.push_str(v);
        }
        entry.insert(key.to_string(), current.clone());
        current
    }

    /// Unsets one key, or the whole array when `key` is `None`.
    pub fn unset(&self, array: &str, key: Option<&str>) {
        let bucket = self.bucket_for(array);
        let mut arrays = bucket.arrays.lock();
        match key {
            Some(key) => {
                if let Some(a) = arrays.get_mut(array) {
                    a.remove(key);
                }
            }
            None => {
                arrays.remove(array);
            }
        }
    }

    /// Walks every bucket and returns array names matching `glob`
    /// (`*`/`?` wildcards), or all names if `glob` is `None`.
    pub fn names(&self, glob: Option<&str>) -> Vec<String> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            let arrays = bucket.arrays.lock();
            for name in arrays.keys() {
                if glob.map(|pattern| glob_match(pattern, name)).unwrap_or(true) {
                    out.push(name.clone());
                }
            }
        }
        out
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[u8], text: &[u8]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&pattern[1..], text) || (!text.is_empty() && inner(pattern, &text[1..])),
            (Some(b'?'), Some(_)) => inner(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if p == t => inner(&pattern[1..], &text[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}
