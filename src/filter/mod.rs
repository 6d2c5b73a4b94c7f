//! Filter registration and authorization chains (§4.11).
//!
//! Mirrors the teacher's `Arc<dyn Fn(...) + Send + Sync>` callback
//! idiom (see `proxy::route::ROUTE_MAP`'s handler storage) generalized
//! to carry an opaque user-data slot and an optional release callback,
//! which is this crate's sole coupling to an external scripting layer.

use std::any::Any;
use std::sync::{Arc, RwLock};

use crate::error::{CoreError, CoreResult};

/// Phase a filter registration runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPhase {
    PreAuth,
    PostAuth,
    Trace,
    VoidTrace,
}

pub type UserData = Arc<dyn Any + Send + Sync>;
pub type ReleaseFn = Arc<dyn Fn(&UserData) + Send + Sync>;
pub type FilterFn = Arc<dyn Fn(&str, &str, Option<&UserData>) -> CoreResult<()> + Send + Sync>;

struct Registration {
    method: String,
    url_pattern: String,
    callback: FilterFn,
    user_data: Option<UserData>,
    release: Option<ReleaseFn>,
    first: bool,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let (Some(release), Some(data)) = (&self.release, &self.user_data) {
            release(data);
        }
    }
}

fn pattern_matches(pattern: &str, url: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return url.starts_with(prefix);
    }
    pattern == url
}

fn method_matches(registered: &str, method: &str) -> bool {
    registered == "*" || registered.eq_ignore_ascii_case(method)
}

/// A single-phase filter chain, guarded by a `RwLock` (the
/// `filterrwlocks` configuration knob selects this over a plain mutex
/// at the call site that constructs pools).
#[derive(Default)]
pub struct FilterChain {
    registrations: RwLock<Vec<Registration>>,
}

impl FilterChain {
    pub fn new() -> Self {
        FilterChain::default()
    }

    pub fn register(
        &self,
        method: impl Into<String>,
        url_pattern: impl Into<String>,
        callback: FilterFn,
        user_data: Option<UserData>,
        release: Option<ReleaseFn>,
        first: bool,
    ) {
        let registration =
            Registration { method: method.into(), url_pattern: url_pattern.into(), callback, user_data, release, first };
        let mut registrations = self.registrations.write().unwrap();
        if first {
            registrations.insert(0, registration);
        } else {
            registrations.push(registration);
        }
    }

    /// Runs every matching filter in registration order, stopping (and
    /// returning) at the first error.
    pub fn run(&self, _phase: FilterPhase, method: &str, url: &str) -> CoreResult<()> {
        let registrations = self.registrations.read().unwrap();
        for reg in registrations.iter() {
            if method_matches(&reg.method, method) && pattern_matches(&reg.url_pattern, url) {
                (reg.callback)(method, url, reg.user_data.as_ref())?;
            }
        }
        Ok(())
    }

    /// Runs every matching filter regardless of outcome, logging (but
    /// not propagating) errors — the void-trace contract.
    pub fn run_void_trace(&self, method: &str, url: &str) {
        let registrations = self.registrations.read().unwrap();
        for reg in registrations.iter() {
            if method_matches(&reg.method, method) && pattern_matches(&reg.url_pattern, url) {
                if let Err(err) = (reg.callback)(method, url, reg.user_data.as_ref()) {
                    log::warn!("void-trace filter for {method} {url} failed: {err}");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.registrations.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a single auth-chain callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Ok,
    Unauthorized,
    Forbidden,
    Error,
}

/// Whether the engine should keep evaluating subsequent callbacks after
/// this one returns a non-ok verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Stop,
    Continue,
}

pub type AuthFn = Arc<
    dyn Fn(&str, &str, Option<&str>, Option<&str>, Option<&str>) -> (AuthVerdict, Continuation) + Send + Sync,
>;

struct AuthRegistration {
    name: String,
    callback: AuthFn,
    first: bool,
}

/// Request-authorization and user-authentication chain, evaluated in
/// registration order (per §4.11).
#[derive(Default)]
pub struct AuthChain {
    registrations: RwLock<Vec<AuthRegistration>>,
}

impl AuthChain {
    pub fn new() -> Self {
        AuthChain::default()
    }

    pub fn register(&self, name: impl Into<String>, callback: AuthFn, first: bool) {
        let registration = AuthRegistration { name: name.into(), callback, first };
        let mut registrations = self.registrations.write().unwrap();
        if first {
            registrations.insert(0, registration);
        } else {
            registrations.push(registration);
        }
    }

    /// Evaluates the chain, returning the first non-ok verdict unless
    /// its continuation explicitly requests further evaluation. A
    /// callback's own panic is not caught here; errors are expected to
    /// be reported via `AuthVerdict::Error`.
    pub fn evaluate(
        &self,
        method: &str,
        url: &str,
        user: Option<&str>,
        pass: Option<&str>,
        peer: Option<&str>,
    ) -> CoreResult<()> {
        let registrations = self.registrations.read().unwrap();
        for reg in registrations.iter() {
            let (verdict, continuation) = (reg.callback)(method, url, user, pass, peer);
            match verdict {
                AuthVerdict::Ok => continue,
                AuthVerdict::Error => {
                    log::error!("auth callback '{}' errored for {method} {url}", reg.name);
                    if continuation == Continuation::Continue {
                        continue;
                    }
                    return Err(CoreError::Internal(format!("auth callback '{}' failed", reg.name)));
                }
                AuthVerdict::Unauthorized => {
                    if continuation == Continuation::Continue {
                        continue;
                    }
                    return Err(CoreError::Unauthorized(format!("denied by '{}'", reg.name)));
                }
                AuthVerdict::Forbidden => {
                    if continuation == Continuation::Continue {
                        continue;
                    }
                    return Err(CoreError::Forbidden(format!("denied by '{}'", reg.name)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn filter_chain_runs_matching_registrations_in_order() {
        let chain = FilterChain::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_a = order.clone();
        let order_b = order.clone();
        chain.register(
            "GET",
            "/api/*",
            Arc::new(move |_m, _u, _d| {
                order_a.lock().unwrap().push("a");
                Ok(())
            }),
            None,
            None,
            false,
        );
        chain.register(
            "GET",
            "/api/*",
            Arc::new(move |_m, _u, _d| {
                order_b.lock().unwrap().push("b");
                Ok(())
            }),
            None,
            None,
            false,
        );
        chain.run(FilterPhase::PreAuth, "GET", "/api/widgets").unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn filter_chain_first_flag_prepends() {
        let chain = FilterChain::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_a = order.clone();
        let order_b = order.clone();
        chain.register("GET", "*", Arc::new(move |_m, _u, _d| { order_a.lock().unwrap().push("normal"); Ok(()) }), None, None, false);
        chain.register("GET", "*", Arc::new(move |_m, _u, _d| { order_b.lock().unwrap().push("first"); Ok(()) }), None, None, true);
        chain.run(FilterPhase::PreAuth, "GET", "/x").unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "normal"]);
    }

    #[test]
    fn filter_chain_stops_on_first_error() {
        let chain = FilterChain::new();
        let ran_second = Arc::new(AtomicUsize::new(0));
        let ran_second_clone = ran_second.clone();
        chain.register("GET", "*", Arc::new(|_m, _u, _d| Err(CoreError::Forbidden("no".into()))), None, None, false);
        chain.register("GET", "*", Arc::new(move |_m, _u, _d| { ran_second_clone.fetch_add(1, Ordering::SeqCst); Ok(()) }), None, None, false);
        let result = chain.run(FilterPhase::PreAuth, "GET", "/x");
        assert!(result.is_err());
        assert_eq!(ran_second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn void_trace_runs_every_filter_despite_errors() {
        let chain = FilterChain::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_a = count.clone();
        let count_b = count.clone();
        chain.register("GET", "*", Arc::new(move |_m, _u, _d| { count_a.fetch_add(1, Ordering::SeqCst); Err(CoreError::Internal("boom".into())) }), None, None, false);
        chain.register("GET", "*", Arc::new(move |_m, _u, _d| { count_b.fetch_add(1, Ordering::SeqCst); Ok(()) }), None, None, false);
        chain.run_void_trace("GET", "/x");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn release_callback_runs_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let released_clone = released.clone();
        {
            let chain = FilterChain::new();
            chain.register(
                "GET",
                "*",
                Arc::new(|_m, _u, _d| Ok(())),
                Some(Arc::new(42i32) as UserData),
                Some(Arc::new(move |_data: &UserData| {
                    released_clone.fetch_add(1, Ordering::SeqCst);
                })),
                false,
            );
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn auth_chain_returns_first_non_ok_verdict() {
        let chain = AuthChain::new();
        chain.register("authority-a", Arc::new(|_m, _u, _user, _pass, _peer| (AuthVerdict::Ok, Continuation::Stop)), false);
        chain.register(
            "authority-b",
            Arc::new(|_m, _u, _user, _pass, _peer| (AuthVerdict::Unauthorized, Continuation::Stop)),
            false,
        );
        chain.register("authority-c", Arc::new(|_m, _u, _user, _pass, _peer| (AuthVerdict::Ok, Continuation::Stop)), false);
        let result = chain.evaluate("GET", "/x", None, None, None);
        assert!(matches!(result, Err(CoreError::Unauthorized(_))));
    }

    #[test]
    fn auth_chain_continuation_overrides_stop() {
        let chain = AuthChain::new();
        chain.register(
            "authority-a",
            Arc::new(|_m, _u, _user, _pass, _peer| (AuthVerdict::Forbidden, Continuation::Continue)),
            false,
        );
        chain.register("authority-b", Arc::new(|_m, _u, _user, _pass, _peer| (AuthVerdict::Ok, Continuation::Stop)), false);
        let result = chain.evaluate("GET", "/x", None, None, None);
        assert!(result.is_ok());
    }
}
