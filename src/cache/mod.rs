//! C1 cache engine and its C3 scripted façade.

pub mod core;
pub mod scripted;

pub use core::{deadline_from, Cache, CacheStats, EntryHandle, WaitStatus};
