//! Index (C5): a sorted array with user-supplied element- and
//! key-comparators.
//!
//! Per the "Polymorphism... model as trait objects or generic type
//! parameters" design note: a single `Index<T, K>` owns one comparator
//! pair for its whole lifetime, so plain generic closures are used
//! rather than paying for dynamic dispatch on every comparison.

use std::cmp::Ordering;

pub struct Index<T, K> {
    items: Vec<T>,
    cmp_el: Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>,
    cmp_key: Box<dyn Fn(&K, &T) -> Ordering + Send + Sync>,
}

impl<T, K> Index<T, K> {
    pub fn init(
        cmp_el: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static,
        cmp_key: impl Fn(&K, &T) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        Index { items: Vec::new(), cmp_el: Box::new(cmp_el), cmp_key: Box::new(cmp_key) }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Binary-search insertion with a stable forward shift: if multiple
    /// elements compare equal, the new element is inserted after the
    /// existing run (stable order of insertion is preserved).
    pub fn add(&mut self, value: T) {
        let pos = match self.items.binary_search_by(|probe| (self.cmp_el)(probe, &value)) {
            Ok(mut idx) => {
                while idx < self.items.len() && (self.cmp_el)(&self.items[idx], &value) == Ordering::Equal {
                    idx += 1;
                }
                idx
            }
            Err(idx) => idx,
        };
        self.items.insert(pos, value);
    }

    /// Removes the first element `==` to `value` under the element
    /// comparator, if present.
    pub fn del(&mut self, value: &T) -> bool {
        if let Ok(idx) = self.items.binary_search_by(|probe| (self.cmp_el)(probe, value)) {
            self.items.remove(idx);
            true
        } else {
            false
        }
    }

    /// Key-based binary search returning the first (lowest-index) match.
    pub fn find(&self, key: &K) -> Option<&T> {
        let idx = self.find_index(key)?;
        Some(&self.items[idx])
    }

    fn find_index(&self, key: &K) -> Option<usize> {
        let idx = self.items.binary_search_by(|probe| (self.cmp_key)(key, probe).reverse()).ok()?;
        let mut first = idx;
        while first > 0 && (self.cmp_key)(key, &self.items[first - 1]) == Ordering::Equal {
            first -= 1;
        }
        Some(first)
    }

    /// The greatest element `<=` key, or `None` if `key` sorts before
    /// the first element.
    pub fn find_inf(&self, key: &K) -> Option<&T> {
        if self.items.is_empty() {
            return None;
        }
        match self.items.binary_search_by(|probe| (self.cmp_key)(key, probe).reverse()) {
            Ok(idx) => Some(&self.items[idx]),
            Err(idx) => {
                if idx == 0 {
                    None
                } else {
                    Some(&self.items[idx - 1])
                }
            }
        }
    }

    /// Every element comparing equal to `key`, expanding left then
    /// right from any one match.
    pub fn find_multiple(&self, key: &K) -> Vec<&T> {
        let idx = match self.items.binary_search_by(|probe| (self.cmp_key)(key, probe).reverse()) {
            Ok(idx) => idx,
            Err(_) => return Vec::new(),
        };
        let mut lo = idx;
        while lo > 0 && (self.cmp_key)(key, &self.items[lo - 1]) == Ordering::Equal {
            lo -= 1;
        }
        let mut hi = idx;
        while hi + 1 < self.items.len() && (self.cmp_key)(key, &self.items[hi + 1]) == Ordering::Equal {
            hi += 1;
        }
        self.items[lo..=hi].iter().collect()
    }
}

/// Specialised string-keyed variant storing owned `String`s, mirroring
/// the original's `strdup`-owning string index.
pub type StringIndex = Index<String, str>;

pub fn string_index() -> StringIndex {
    Index::init(
        |a: &String, b: &String| a.as_str().cmp(b.as_str()),
        |k: &str, el: &String| k.cmp(el.as_str()),
    )
}
