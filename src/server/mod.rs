//! Server lifecycle (C11): per-server state, the log-file registry, and
//! graceful shutdown coordination shared across a server's pools.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::config::ServerConfig;
use crate::logging::LogFile;
use crate::pool::Pool;

/// A running server instance: its pools, DNS/shared-variable state, and
/// the log-file registry, guarded the way the original guards its
/// per-server log-fd table with a dedicated mutex — here, a
/// concurrent map, since each named log file is independent.
pub struct Server {
    pub config: ServerConfig,
    pools: DashMap<String, Arc<Pool>>,
    log_files: DashMap<String, Arc<LogFile>>,
    stop_notify: Arc<Notify>,
    stopping: std::sync::atomic::AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config,
            pools: DashMap::new(),
            log_files: DashMap::new(),
            stop_notify: Arc::new(Notify::new()),
            stopping: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Creates (or returns the existing) named pool from this server's
    /// `pools` configuration, falling back to defaults if unnamed.
    pub fn pool(&self, name: &str) -> Arc<Pool> {
        if let Some(existing) = self.pools.get(name) {
            return existing.clone();
        }
        let settings = self.config.pools.iter().find(|p| p.name == name);
        let pool_config = settings.map(|s| s.to_pool_config()).unwrap_or_default();
        let pool = Arc::new(Pool::new(name, pool_config));
        self.pools.insert(name.to_string(), pool.clone());
        pool
    }

    /// Registers (or returns the existing) log file at `path`, relative
    /// to this server's `logdir` unless already absolute.
    pub fn log_file(&self, name: &str, relative_path: &str) -> Arc<LogFile> {
        if let Some(existing) = self.log_files.get(name) {
            return existing.clone();
        }
        let full_path = if std::path::Path::new(relative_path).is_absolute() {
            relative_path.to_string()
        } else {
            format!("{}/{}", self.config.logdir.trim_end_matches('/'), relative_path)
        };
        let log_file = Arc::new(LogFile::new(full_path));
        self.log_files.insert(name.to_string(), log_file.clone());
        log_file
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Signals every pool to begin graceful shutdown and waits up to
    /// `deadline` for them to drain.
    pub async fn shutdown(&self, deadline: std::time::Duration) {
        self.stopping.store(true, std::sync::atomic::Ordering::SeqCst);
        self.stop_notify.notify_waiters();

        for entry in self.pools.iter() {
            entry.value().shutdown(deadline).await;
        }
    }

    pub fn stop_notify(&self) -> Arc<Notify> {
        self.stop_notify.clone()
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DnsConfig, HeaderCase};

    fn test_config() -> ServerConfig {
        ServerConfig {
            id: "test".into(),
            realm: "test-realm".into(),
            checkmodifiedsince: true,
            stealthmode: false,
            serverdir: "/tmp/sixcore".into(),
            logdir: "/tmp/sixcore/logs".into(),
            errorminsize: 512,
            filterrwlocks: false,
            headercase: HeaderCase::Preserve,
            extraheaders: Default::default(),
            compressenable: false,
            compresslevel: 6,
            compressminsize: 512,
            compresspreinit: false,
            dns: DnsConfig::default(),
            pools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn pool_is_created_on_first_access_and_reused() {
        let server = Server::new(test_config());
        let pool_a = server.pool("default");
        let pool_b = server.pool("default");
        assert!(Arc::ptr_eq(&pool_a, &pool_b));
        pool_a.shutdown(std::time::Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_marks_stopping() {
        let server = Server::new(test_config());
        assert!(!server.is_stopping());
        server.shutdown(std::time::Duration::from_millis(100)).await;
        assert!(server.is_stopping());
    }
}
