//! Configuration file support and retry policy.
//!
//! The server can be driven entirely from flags, but deployments that used
//! a config file keep that workflow: a TOML file supplies the served root,
//! bind address, port range, accept strategy and TLS material. Flags win
//! over file values, file values win over defaults.

use crate::server::AcceptStrategy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Config file picked up from the working directory when no explicit
/// `--config` path is given.
pub const DEFAULT_CONFIG_FILE: &str = "fileshelf.toml";

/// Default pause between bounded retry attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);

/// Ceiling for the exponential backoff growth.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// How many times a failed transfer cycle may be retried.
///
/// The default is unbounded, which reproduces the protocol's native
/// behavior: a permanently failing file loops until a peer closes the
/// transport. A bounded policy is the operator's opt-out of that hazard;
/// exhaustion is then surfaced by dropping the connection, because the
/// protocol has no in-band way to abandon a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` means retry forever.
    pub max_attempts: Option<u32>,
    /// Base pause before the second attempt; doubles per attempt after that.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::ZERO,
        }
    }

    pub fn limited(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            backoff,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_attempts.is_none()
    }

    /// True once `attempts` cycles have been spent and no more are allowed.
    pub fn exhausted(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts >= max,
            None => false,
        }
    }

    /// Pause before attempt `attempt + 1`, growing exponentially from the
    /// base and capped. Unbounded policies do not sleep, matching the
    /// original hot resend loop.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if self.backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// On-disk server configuration. Every field is optional so a partial file
/// only pins what it names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Directory whose top-level files are served.
    pub root_dir: Option<PathBuf>,
    /// Local address the listeners bind to.
    pub bind_addr: Option<IpAddr>,
    /// First port of the escalating range (also the shared listener port).
    pub base_port: Option<u16>,
    /// Last usable port of the escalating range.
    pub max_port: Option<u16>,
    /// Listener strategy: one port per session, or one shared port.
    pub accept: Option<AcceptStrategy>,
    pub tls: Option<TlsSection>,
    pub retry: Option<RetrySection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Optional cipher suite allow-list, by standard suite name.
    pub cipher_suites: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub backoff_ms: Option<u64>,
}

impl ConfigFile {
    /// Parse an explicit config file. Missing or malformed files are hard
    /// errors here.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ConfigFile = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve the config source: an explicit path must parse, the default
    /// file is used when present, and otherwise everything falls back to
    /// built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// The resend policy this file asks for; absent section means unbounded.
    pub fn retry_policy(&self) -> RetryPolicy {
        match &self.retry {
            Some(section) => RetryPolicy::limited(
                section.max_attempts,
                Duration::from_millis(
                    section
                        .backoff_ms
                        .unwrap_or(DEFAULT_BACKOFF.as_millis() as u64),
                ),
            ),
            None => RetryPolicy::unbounded(),
        }
    }
}
