//! Configuration for the routing core.
//!
//! Every component takes its own section; [`HopwireConfig`] bundles them for
//! loading from a JSON file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::credit::CreditPool;
use crate::error::{Error, Result};

/// Initial flow-control window of a new connection or stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditConfig {
    /// Window of each new connection.
    pub initial_connection_window: i32,
    /// Window of each new stream.
    pub initial_stream_window: i32,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            initial_connection_window: 65_535,
            initial_stream_window: 65_535,
        }
    }
}

impl CreditConfig {
    /// A fresh pool holding the connection window.
    pub fn connection_pool(&self, name: impl Into<String>) -> CreditPool {
        CreditPool::new(name, self.initial_connection_window)
    }

    /// A fresh pool holding the stream window.
    pub fn stream_pool(&self, name: impl Into<String>) -> CreditPool {
        CreditPool::new(name, self.initial_stream_window)
    }
}

/// Failed-endpoint cache tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailedEndpointConfig {
    /// How long an endpoint stays unusable after a failure (default 30 minutes).
    pub cooldown_ms: u64,
    /// Sweeps only run once the cache holds more entries than this.
    pub sweep_threshold: usize,
    /// Minimum time between sweeps (default 5 minutes).
    pub sweep_interval_ms: u64,
}

impl Default for FailedEndpointConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 30 * 60 * 1000,
            sweep_threshold: 8,
            sweep_interval_ms: 5 * 60 * 1000,
        }
    }
}

/// Redirect following policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectPolicy {
    /// When false, redirects are handed back to the caller.
    pub enabled: bool,
    /// Most redirects followed for one request (default 10).
    pub max_hops: u32,
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_hops: 50,
        }
    }
}

impl RedirectPolicy {
    /// Follows up to `max_hops` redirects.
    pub fn limited(max_hops: u32) -> Self {
        Self {
            enabled: true,
            max_hops,
        }
    }

    /// Never follows redirects.
    pub fn none() -> Self {
        Self {
            enabled: false,
            max_hops: 0,
        }
    }
}

/// Explicitly owned proxy settings.
///
/// `proxy_list` holds already-split proxy URIs; `proxies` holds a raw
/// configuration string (`"http=p1:8080;https=p2:8443 p3"`) that is only
/// tokenized as candidates are needed. When both are set the list wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Raw proxy configuration string.
    pub proxies: Option<String>,
    /// Pre-split proxy URIs.
    pub proxy_list: Vec<String>,
    /// Hosts reached directly; see [`BypassList`](crate::BypassList).
    pub bypass: Vec<String>,
}

impl ProxyConfig {
    /// True when no proxy is configured at all.
    pub fn is_empty(&self) -> bool {
        self.proxy_list.is_empty()
            && self
                .proxies
                .as_deref()
                .map_or(true, |p| p.trim().is_empty())
    }
}

/// Top-level configuration, loadable from JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HopwireConfig {
    /// Flow-control windows.
    pub credit: CreditConfig,
    /// Failed-endpoint cache tuning.
    pub failed_endpoints: FailedEndpointConfig,
    /// Redirect policy.
    pub redirect: RedirectPolicy,
    /// Proxy candidates and bypass list.
    pub proxy: ProxyConfig,
}

impl HopwireConfig {
    /// Reads and validates a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Parses and validates JSON config text.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: HopwireConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects windows below zero and a zero cooldown.
    pub fn validate(&self) -> Result<()> {
        if self.credit.initial_connection_window < 0 || self.credit.initial_stream_window < 0 {
            return Err(Error::Config("initial windows must not be negative".into()));
        }
        if self.failed_endpoints.cooldown_ms == 0 {
            return Err(Error::Config("failure cooldown must be positive".into()));
        }
        Ok(())
    }
}
