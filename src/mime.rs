//! MIME & encoding registry (C6).
//!
//! A process-global table mapping file extension -> MIME type, and a
//! codec-alias table mapping IANA charset name -> the charset's own
//! canonical name (and back). `encoding_rs` already ships a canonical,
//! well-tested charset registry, so the alias table here wraps it
//! rather than reimplementing charset detection; what this module adds
//! on top is the extension->MIME registry and the
//! loading-with-waiters coordination the original's codec cache
//! performs (realized with a `parking_lot` mutex/condvar "loading"
//! sentinel, the same coordination shape as C1).
//!
//! Tables are global (`Lazy` + `DashMap`), matching the
//! `ROUTE_MAP`-style static-registry idiom used elsewhere in this
//! codebase, then extended from configuration at startup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

const BUILTIN_TYPES: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".htm", "text/html"),
    (".txt", "text/plain"),
    (".css", "text/css"),
    (".js", "application/javascript"),
    (".json", "application/json"),
    (".xml", "application/xml"),
    (".png", "image/png"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".gif", "image/gif"),
    (".svg", "image/svg+xml"),
    (".pdf", "application/pdf"),
    (".zip", "application/zip"),
    (".gz", "application/gzip"),
    (".wasm", "application/wasm"),
];

pub const DEFAULT_MIME_TYPE: &str = "*/*";

static EXTENSION_MAP: Lazy<DashMap<String, String>> = Lazy::new(|| {
    let map = DashMap::new();
    for (ext, mime) in BUILTIN_TYPES {
        map.insert((*ext).to_string(), (*mime).to_string());
    }
    map
});

/// Registers or overrides an extension -> MIME mapping, as the config
/// loader does at startup.
pub fn register_extension(ext: &str, mime_type: &str) {
    EXTENSION_MAP.insert(normalize_ext(ext), mime_type.to_string());
}

fn normalize_ext(ext: &str) -> String {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    format!(".{ext}")
}

/// Resolves a file's extension to a MIME type, falling back to
/// [`DEFAULT_MIME_TYPE`] when unknown.
pub fn type_for_path(path: &str) -> String {
    let ext = path.rsplit_once('.').map(|(_, e)| format!(".{}", e.to_ascii_lowercase()));
    ext.and_then(|e| EXTENSION_MAP.get(&e).map(|v| v.clone()))
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string())
}

/// Resolves an IANA charset name to `encoding_rs`'s canonical label via
/// its alias table, returning `None` for unrecognized names (mirroring
/// the original's "alias or encoding name if no alias" fallback, except
/// a genuinely unknown label has no codec to fall back to).
pub fn charset_to_codec_name(charset: &str) -> Option<&'static str> {
    encoding_rs::Encoding::for_label(charset.as_bytes()).map(|enc| enc.name())
}

/// Sentinel states for the codec-load cache: a codec name maps either
/// to a loaded handle or to a "someone is loading this" marker that
/// other threads wait on.
enum CodecSlot {
    Loading,
    Loaded(&'static encoding_rs::Encoding),
}

struct CodecCache {
    slots: Mutex<std::collections::HashMap<String, CodecSlot>>,
    cond: Condvar,
}

static CODEC_CACHE: Lazy<CodecCache> = Lazy::new(|| CodecCache {
    slots: Mutex::new(std::collections::HashMap::new()),
    cond: Condvar::new(),
});

/// Loads (or waits for another thread to load) the codec for `name`,
/// with the same inflight-sentinel coordination as the cache engine:
/// threads that find `Loading` wait on the condition variable until the
/// loader finishes.
pub fn load_codec(name: &str, wait_timeout: Duration) -> Option<&'static encoding_rs::Encoding> {
    let mut slots = CODEC_CACHE.slots.lock();
    loop {
        match slots.get(name) {
            Some(CodecSlot::Loaded(enc)) => return Some(*enc),
            Some(CodecSlot::Loading) => {
                let deadline = Instant::now() + wait_timeout;
                if CODEC_CACHE.cond.wait_until(&mut slots, deadline).timed_out() {
                    return None;
                }
            }
            None => {
                slots.insert(name.to_string(), CodecSlot::Loading);
                drop(slots);
                let loaded = encoding_rs::Encoding::for_label(name.as_bytes());
                slots = CODEC_CACHE.slots.lock();
                match loaded {
                    Some(enc) => {
                        slots.insert(name.to_string(), CodecSlot::Loaded(enc));
                        CODEC_CACHE.cond.notify_all();
                        return Some(enc);
                    }
                    None => {
                        slots.remove(name);
                        CODEC_CACHE.cond.notify_all();
                        return None;
                    }
                }
            }
        }
    }
}

/// Registry of charset aliases beyond what `encoding_rs` recognizes
/// natively, e.g. operator-supplied shorthand names from configuration.
#[derive(Default)]
pub struct CharsetAliasTable {
    aliases: DashMap<String, Arc<str>>,
}

impl CharsetAliasTable {
    pub fn register(&self, alias: &str, canonical: &str) {
        self.aliases.insert(alias.to_ascii_lowercase(), Arc::from(canonical));
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<str>> {
        if let Some(canonical) = self.aliases.get(&name.to_ascii_lowercase()) {
            return Some(canonical.clone());
        }
        charset_to_codec_name(name).map(Arc::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_extension_lookup() {
        assert_eq!(type_for_path("/index.html"), "text/html");
        assert_eq!(type_for_path("/style.CSS"), "text/css");
        assert_eq!(type_for_path("/unknown.qqq"), DEFAULT_MIME_TYPE);
    }

    #[test]
    fn register_extension_overrides() {
        register_extension("sixtest", "application/x-sixtest");
        assert_eq!(type_for_path("f.sixtest"), "application/x-sixtest");
    }

    #[test]
    fn charset_alias_resolves_through_encoding_rs() {
        assert_eq!(charset_to_codec_name("iso-8859-1"), Some("windows-1252"));
        assert_eq!(charset_to_codec_name("utf-8"), Some("UTF-8"));
        assert_eq!(charset_to_codec_name("bogus-charset-xyz"), None);
    }

    #[test]
    fn load_codec_caches_result() {
        let a = load_codec("utf-8", Duration::from_millis(100));
        let b = load_codec("utf-8", Duration::from_millis(100));
        assert!(a.is_some());
        assert_eq!(a.map(|e| e.name()), b.map(|e| e.name()));
    }

    #[test]
    fn custom_alias_table_overrides_lookup() {
        let table = CharsetAliasTable::default();
        table.register("latin1x", "windows-1252");
        assert_eq!(table.resolve("latin1x").as_deref(), Some("windows-1252"));
    }
}
