//! Server configuration read through the `config` crate.
//!
//! Keys are looked up as `{name}.{key}` first, then `{key}`, then a
//! hard-coded default, so several servers in one process can share a file.

use crate::error::Error;
use crate::pup::MAX_PUP_DATA;
use ::config::{Config, ConfigError};
use std::time::Duration;

// Resolves `{name}.{key}`, then `{key}`, then the caller's default. Only a
// missing key falls through; a present but unparsable value is an error even
// under the namespace.
struct KeyLookup<'a> {
    config: &'a Config,
    name: &'a str,
}

impl<'a> KeyLookup<'a> {
    fn new(config: &'a Config, name: &'a str) -> Self {
        Self { config, name }
    }

    fn read<T>(
        &self,
        key: &str,
        default: T,
        get: impl Fn(&Config, &str) -> Result<T, ConfigError>,
    ) -> Result<T, Error> {
        let scoped = (!self.name.is_empty()).then(|| format!("{}.{key}", self.name));
        for candidate in scoped.as_deref().into_iter().chain([key]) {
            match get(self.config, candidate) {
                Ok(value) => return Ok(value),
                Err(ConfigError::NotFound(_)) => continue,
                Err(err) => return Err(Error::Config(err)),
            }
        }
        Ok(default)
    }

    fn count(&self, key: &str, default: usize) -> Result<usize, Error> {
        self.read(key, default, |cfg, key| cfg.get::<usize>(key))
    }

    fn number(&self, key: &str, default: u64) -> Result<u64, Error> {
        self.read(key, default, |cfg, key| cfg.get::<u64>(key))
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, Error> {
        self.number(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}

/// Tunables for the dispatcher, its channels, and the worker pool.
///
/// # Configuration Keys
///
/// - `max_workers`: maximum concurrent handlers (default 32)
/// - `worker_grace_ms`: how long `terminate` waits for a handler (default 1000)
/// - `max_bytes`: advertised bytes per packet, at most 532 (default 532)
/// - `max_pups`: advertised outstanding packets (default 5)
/// - `ack_timeout_ms`: writer wait before retransmitting (default 1000)
/// - `max_retransmits`: retransmission rounds before aborting (default 5)
/// - `first_socket_id`: first id handed out by the sequential allocator
///
/// # Example
///
/// ```toml
/// max_workers = 64
///
/// [telnet]
/// max_workers = 8
/// worker_grace_ms = 250
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BspConfig {
    pub max_workers: usize,
    pub worker_grace: Duration,
    pub max_bytes: u16,
    pub max_pups: u16,
    pub ack_timeout: Duration,
    pub max_retransmits: u32,
    pub first_socket_id: u32,
}

impl Default for BspConfig {
    fn default() -> Self {
        Self {
            max_workers: 32,
            worker_grace: Duration::from_millis(1000),
            max_bytes: MAX_PUP_DATA as u16,
            max_pups: 5,
            ack_timeout: Duration::from_millis(1000),
            max_retransmits: 5,
            first_socket_id: 0x1000,
        }
    }
}

impl BspConfig {
    /// Reads the configuration without a namespace.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Reads the configuration, preferring keys under `name`.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();
        let keys = KeyLookup::new(config, name);

        let max_workers = keys.count("max_workers", defaults.max_workers)?;
        let worker_grace = keys.millis("worker_grace_ms", defaults.worker_grace)?;
        let max_bytes = keys.count("max_bytes", defaults.max_bytes as usize)?;
        let max_pups = keys.count("max_pups", defaults.max_pups as usize)?;
        let ack_timeout = keys.millis("ack_timeout_ms", defaults.ack_timeout)?;
        let max_retransmits = keys.number("max_retransmits", defaults.max_retransmits as u64)?;
        let first_socket_id = keys.number("first_socket_id", defaults.first_socket_id as u64)?;

        if max_bytes == 0 || max_bytes > MAX_PUP_DATA {
            return Err(Error::InvalidConfig {
                key: "max_bytes",
                reason: format!("{max_bytes} is not in 1..={MAX_PUP_DATA}"),
            });
        }
        if max_pups == 0 || max_pups > u16::MAX as usize {
            return Err(Error::InvalidConfig {
                key: "max_pups",
                reason: format!("{max_pups} is not in 1..={}", u16::MAX),
            });
        }
        let first_socket_id = u32::try_from(first_socket_id).map_err(|_| Error::InvalidConfig {
            key: "first_socket_id",
            reason: format!("{first_socket_id} does not fit in 32 bits"),
        })?;
        let max_retransmits = u32::try_from(max_retransmits).map_err(|_| Error::InvalidConfig {
            key: "max_retransmits",
            reason: format!("{max_retransmits} does not fit in 32 bits"),
        })?;

        Self {
            max_workers,
            worker_grace,
            max_bytes: max_bytes as u16,
            max_pups: max_pups as u16,
            ack_timeout,
            max_retransmits,
            first_socket_id,
        }
        .validated()
    }

    /// Checks invariants that hold for both parsed and hand-built configs.
    pub fn validated(self) -> Result<Self, Error> {
        if self.max_workers == 0 {
            return Err(Error::InvalidConfig {
                key: "max_workers",
                reason: "must be a positive integer".to_string(),
            });
        }
        if self.max_bytes == 0 || self.max_bytes as usize > MAX_PUP_DATA {
            return Err(Error::InvalidConfig {
                key: "max_bytes",
                reason: format!("{} is not in 1..={MAX_PUP_DATA}", self.max_bytes),
            });
        }
        if self.max_pups == 0 {
            return Err(Error::InvalidConfig {
                key: "max_pups",
                reason: "must be a positive integer".to_string(),
            });
        }
        Ok(self)
    }
}
