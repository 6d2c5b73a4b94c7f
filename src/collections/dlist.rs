//! Dynamic list (C4): a small-vector-optimised owning/non-owning pointer
//! list, realized as a thin wrapper around `smallvec` with an optional
//! owning drop closure.
//!
//! `smallvec` already implements the static-buffer-then-heap growth
//! strategy the original `Ns_DList` hand-rolls, including the doubling
//! policy and the ability to shrink back into inline storage via
//! `shrink_to_fit`, so the wrapper here only needs to add the ownership
//! rules (`set_free_proc`, `add_unique`, arithmetic-overflow guard) that
//! are specific to this spec.

use smallvec::SmallVec;

/// Conservative ceiling mirroring the original's overflow-checked
/// byte-count guard. Exceeding it aborts rather than silently wrapping.
const MAX_ELEMENTS: usize = 1 << 28;

type FreeProc<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Small-vector-optimised list holding up to 30 elements inline before
/// spilling to the heap, matching the original's `static_data[30]`.
pub struct DList<T> {
    data: SmallVec<[T; 30]>,
    free_proc: Option<FreeProc<T>>,
}

impl<T> Default for DList<T> {
    fn default() -> Self {
        DList { data: SmallVec::new(), free_proc: None }
    }
}

impl<T> DList<T> {
    pub fn init() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Installs a drop callback invoked on every element evicted by
    /// `delete`, `set_length` (on shrink), `reset`, or drop. May only be
    /// called while the list is empty; otherwise it is a no-op (mirrors
    /// the original logging a warning and leaving the proc unchanged).
    pub fn set_free_proc(&mut self, proc: impl Fn(&T) + Send + Sync + 'static) {
        if self.data.is_empty() {
            self.free_proc = Some(Box::new(proc));
        }
    }

    fn check_growth(new_len: usize) {
        if new_len > MAX_ELEMENTS {
            panic!("DList: requested length {new_len} exceeds the maximum of {MAX_ELEMENTS}");
        }
    }

    /// Doubles capacity on overflow, same growth policy as the backing
    /// `SmallVec`; this just enforces the overflow guard first.
    pub fn append(&mut self, value: T) {
        Self::check_growth(self.data.len() + 1);
        self.data.push(value);
    }

    /// Appends `value` only if no existing element is `==`; returns
    /// whether an insertion happened. Linear scan, as specified.
    pub fn add_unique(&mut self, value: T) -> bool
    where
        T: PartialEq,
    {
        if self.data.iter().any(|existing| existing == &value) {
            false
        } else {
            self.append(value);
            true
        }
    }

    /// Linear scan for the first element matching `predicate`, then
    /// shift the remainder down. Runs the free proc on the evicted
    /// element, if installed.
    pub fn delete(&mut self, predicate: impl Fn(&T) -> bool) -> bool {
        if let Some(pos) = self.data.iter().position(predicate) {
            let removed = self.data.remove(pos);
            if let Some(proc) = &self.free_proc {
                proc(&removed);
            }
            true
        } else {
            false
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        Self::check_growth(capacity);
        const INLINE_CAPACITY: usize = 30;
        if capacity <= INLINE_CAPACITY.max(self.data.len()) {
            self.data.shrink_to_fit();
        } else {
            self.data.reserve(capacity.saturating_sub(self.data.capacity()));
        }
    }

    /// Truncates or no-ops (never grows with default values, matching
    /// the original's contract that growth goes through `append`).
    /// Elements evicted by a shrink run the free proc.
    pub fn set_length(&mut self, new_len: usize) {
        if new_len >= self.data.len() {
            return;
        }
        if let Some(proc) = &self.free_proc {
            for item in &self.data[new_len..] {
                proc(item);
            }
        }
        self.data.truncate(new_len);
    }

    pub fn reset(&mut self) {
        self.set_length(0);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

impl<T> Drop for DList<T> {
    fn drop(&mut self) {
        if let Some(proc) = &self.free_proc {
            for item in self.data.iter() {
                proc(item);
            }
        }
    }
}
