use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use regex::Regex;
use tracing::info;

use crate::config::ConfigSnapshot;
use crate::error::{ProxyError, Result};
use crate::lists::ListsStore;
use crate::socks::SocksDialer;
use crate::vault;

/// Shared service state handed to every connection task.
///
/// Everything here is either immutable after start (config, cookie, dialer,
/// host pattern) or guarded by its own lock; see the individual fields.
#[derive(Debug)]
pub struct ServiceState {
    pub config: ConfigSnapshot,
    pub lists: ListsStore,
    pub dialer: SocksDialer,
    /// Per-run control-port bearer token, already written to disk.
    pub cookie: Option<String>,
    /// Serializes AUTH attempts across all control connections.
    pub auth_gate: tokio::sync::Mutex<()>,
    halt: AtomicBool,
    host_pattern: Regex,
}

impl ServiceState {
    /// Run the start sequence: write the cookie file, then load both lists.
    pub fn new(config: ConfigSnapshot) -> Result<Self> {
        let cookie = match &config.cookie_path {
            Some(path) => {
                let token = vault::new_cookie();
                std::fs::write(path, &token).map_err(|e| {
                    ProxyError::Config(format!(
                        "cannot write cookie file {}: {e}",
                        path.display()
                    ))
                })?;
                info!("wrote control cookie to {}", path.display());
                Some(token)
            }
            None => None,
        };

        let state = Self::assemble(config, cookie)?;
        let blacklisted = state
            .lists
            .load_blacklist(state.config.blacklist_path.as_deref())?;
        let aliased = state.lists.load_aliases(state.config.alias_path.as_deref())?;
        info!("loaded {blacklisted} blacklist entries and {aliased} aliases");
        Ok(state)
    }

    /// Build the state without touching the filesystem.
    pub(crate) fn assemble(config: ConfigSnapshot, cookie: Option<String>) -> Result<Self> {
        let host_pattern = Regex::new(&format!(
            r"(?i)^(.+)\.{}(:\d+)?$",
            regex::escape(&config.suffix)
        ))
        .map_err(|e| ProxyError::Config(format!("suffix does not form a pattern: {e}")))?;
        let dialer = SocksDialer::new(config.tor_addr, Duration::from_millis(config.tor_timeout_ms));

        Ok(Self {
            config,
            lists: ListsStore::default(),
            dialer,
            cookie,
            auth_gate: tokio::sync::Mutex::new(()),
            halt: AtomicBool::new(false),
            host_pattern,
        })
    }

    /// Split a Host header into the label under the suffix and an optional
    /// port string. `None` when the host is outside the suffix.
    pub fn split_host(&self, host: &str) -> Option<(String, Option<String>)> {
        let caps = self.host_pattern.captures(host)?;
        let label = caps.get(1)?.as_str().to_string();
        let port = caps.get(2).map(|m| m.as_str()[1..].to_string());
        Some((label, port))
    }

    pub fn halted(&self) -> bool {
        self.halt.load(Ordering::Relaxed)
    }

    /// Set or clear the halt flag; returns the previous value.
    pub fn set_halted(&self, halted: bool) -> bool {
        self.halt.swap(halted, Ordering::Relaxed)
    }
}
