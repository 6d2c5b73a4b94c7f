//! Runtime configuration (§6, "Configuration recognized by the core").
//!
//! Follows the teacher's `Config::load_from_yaml`/`from_yaml`/`to_yaml`
//! shape and its `validator::Validate` usage, stripped of the
//! pingora/etcd/route-table coupling that belonged to the gateway, not
//! to this embeddable server core.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Root configuration: one or more named servers, each owning its own
/// pools and DNS settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Config {
    pub fn load_from_yaml<P>(path: P) -> std::io::Result<Self>
    where
        P: AsRef<std::path::Path>,
    {
        let conf_str = fs::read_to_string(path)?;
        Self::from_yaml(&conf_str).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self, String> {
        let conf: Config = serde_yaml::from_str(conf_str).map_err(|e| format!("unable to parse yaml conf: {e}"))?;
        conf.validate().map_err(|e| format!("conf validation failed: {e}"))?;
        Ok(conf)
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|e| {
            log::error!("failed to serialize config to yaml: {e}");
            String::new()
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderCase {
    #[default]
    Preserve,
    Tolower,
    Toupper,
}

/// Per-server settings (§6).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "ServerConfig::validate_compress_bounds"))]
pub struct ServerConfig {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub realm: String,

    #[serde(default = "default_true")]
    pub checkmodifiedsince: bool,

    #[serde(default)]
    pub stealthmode: bool,

    #[validate(length(min = 1))]
    pub serverdir: String,

    #[validate(length(min = 1))]
    pub logdir: String,

    #[serde(default = "ServerConfig::default_errorminsize")]
    pub errorminsize: usize,

    #[serde(default)]
    pub filterrwlocks: bool,

    #[serde(default)]
    pub headercase: HeaderCase,

    #[serde(default)]
    pub extraheaders: HashMap<String, String>,

    #[serde(default)]
    pub compressenable: bool,

    #[serde(default = "ServerConfig::default_compresslevel")]
    pub compresslevel: u32,

    #[serde(default = "ServerConfig::default_compressminsize")]
    pub compressminsize: usize,

    #[serde(default)]
    pub compresspreinit: bool,

    #[validate(nested)]
    #[serde(default)]
    pub dns: DnsConfig,

    #[validate(nested)]
    #[serde(default)]
    pub pools: Vec<PoolSettings>,
}

impl ServerConfig {
    fn default_errorminsize() -> usize {
        512
    }

    fn default_compresslevel() -> u32 {
        6
    }

    fn default_compressminsize() -> usize {
        512
    }

    fn validate_compress_bounds(&self) -> Result<(), ValidationError> {
        if self.compresslevel > 9 {
            return Err(ValidationError::new("compresslevel_out_of_range"));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

/// DNS cache settings (§6).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct DnsConfig {
    #[serde(default = "default_true")]
    pub dnscache: bool,

    #[serde(default = "DnsConfig::default_max_size")]
    pub dnscachemaxsize: usize,

    #[serde(default = "DnsConfig::default_wait_timeout_secs")]
    pub dnswaittimeout: u64,

    #[serde(default = "DnsConfig::default_cache_timeout_secs")]
    pub dnscachetimeout: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            dnscache: true,
            dnscachemaxsize: Self::default_max_size(),
            dnswaittimeout: Self::default_wait_timeout_secs(),
            dnscachetimeout: Self::default_cache_timeout_secs(),
        }
    }
}

impl DnsConfig {
    fn default_max_size() -> usize {
        1 << 20
    }

    fn default_wait_timeout_secs() -> u64 {
        5
    }

    fn default_cache_timeout_secs() -> u64 {
        60
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.dnswaittimeout)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.dnscachetimeout)
    }
}

/// Per-pool settings (§6), consumed by [`crate::pool::PoolConfig`].
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "PoolSettings::validate_watermarks"))]
pub struct PoolSettings {
    #[serde(default)]
    pub name: String,

    #[serde(default = "PoolSettings::default_maxconnections")]
    pub maxconnections: usize,

    #[serde(default = "PoolSettings::default_minthreads")]
    pub minthreads: usize,

    #[serde(default = "PoolSettings::default_maxthreads")]
    pub maxthreads: usize,

    #[serde(default)]
    pub connsperthread: usize,

    #[serde(default = "PoolSettings::default_threadtimeout_secs")]
    pub threadtimeout: u64,

    #[serde(default)]
    pub rejectoverrun: bool,

    #[serde(default = "PoolSettings::default_retryafter_secs")]
    pub retryafter: u64,

    #[serde(default = "PoolSettings::default_highwatermark")]
    pub highwatermark: usize,

    #[serde(default)]
    pub lowwatermark: usize,

    pub connectionratelimit: Option<u64>,
    pub poolratelimit: Option<u64>,
}

impl PoolSettings {
    fn default_maxconnections() -> usize {
        100
    }

    fn default_minthreads() -> usize {
        1
    }

    fn default_maxthreads() -> usize {
        10
    }

    fn default_threadtimeout_secs() -> u64 {
        120
    }

    fn default_retryafter_secs() -> u64 {
        5
    }

    fn default_highwatermark() -> usize {
        5
    }

    fn validate_watermarks(&self) -> Result<(), ValidationError> {
        if self.lowwatermark > self.highwatermark {
            return Err(ValidationError::new("lowwatermark_exceeds_highwatermark"));
        }
        if self.minthreads > self.maxthreads {
            return Err(ValidationError::new("minthreads_exceeds_maxthreads"));
        }
        Ok(())
    }

    pub fn to_pool_config(&self) -> crate::pool::PoolConfig {
        crate::pool::PoolConfig {
            maxconnections: self.maxconnections,
            minthreads: self.minthreads,
            maxthreads: self.maxthreads,
            connsperthread: self.connsperthread,
            threadtimeout: Duration::from_secs(self.threadtimeout),
            rejectoverrun: self.rejectoverrun,
            retryafter: Duration::from_secs(self.retryafter),
            highwatermark: self.highwatermark,
            lowwatermark: self.lowwatermark,
            connectionratelimit: self.connectionratelimit,
            poolratelimit: self.poolratelimit,
        }
    }
}
