//! Configuration lookups.
//!
//! Every key is resolved as `{name}.{key}` first, then `{key}`, and finally
//! falls back to a hard-coded default. An empty `name` skips the namespaced
//! lookup.
//!
//! ```toml
//! # Global default
//! high_water_mark = 67108864
//!
//! # Specific to the "metrics_feed" instance
//! [metrics_feed]
//! high_water_mark = 1048576
//! ```

use ::config::Config;

pub(crate) const DEFAULT_POLL_CAPACITY: usize = 1024;
pub(crate) const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;
/// Largest UDP payload over IPv4.
pub(crate) const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65507;
pub(crate) const DEFAULT_RECEIVE_SCRATCH_SIZE: usize = 65536;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

/// Settings for an [`EventLoop`](crate::EventLoop).
///
/// # Configuration Keys
///
/// - `poll_capacity`: number of readiness events fetched per loop turn
///   (default 1024)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub poll_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_capacity: DEFAULT_POLL_CAPACITY,
        }
    }
}

impl LoopConfig {
    /// Reads loop settings, using `name` as the configuration namespace.
    pub fn from_config(config: &Config, name: &str) -> Self {
        Self {
            poll_capacity: get_namespaced_usize(config, name, "poll_capacity")
                .unwrap_or(DEFAULT_POLL_CAPACITY),
        }
    }
}

/// Settings for a [`Connection`](crate::Connection).
///
/// # Configuration Keys
///
/// - `high_water_mark`: output buffer size at which the high-water-mark
///   callback fires; 0 disables it (default 64 MiB)
/// - `max_datagram_size`: largest datagram sent on a datagram socket; further
///   capped by the UDP payload limit of the peer's address family
///   (default 65507)
/// - `receive_scratch_size`: extra read area of stream sockets and the
///   receive buffer of datagram sockets (default 65536)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub high_water_mark: usize,
    pub max_datagram_size: usize,
    pub receive_scratch_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            receive_scratch_size: DEFAULT_RECEIVE_SCRATCH_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Reads connection settings, using `name` as the configuration namespace.
    pub fn from_config(config: &Config, name: &str) -> Self {
        Self {
            high_water_mark: get_namespaced_usize(config, name, "high_water_mark")
                .unwrap_or(DEFAULT_HIGH_WATER_MARK),
            max_datagram_size: get_namespaced_usize(config, name, "max_datagram_size")
                .unwrap_or(DEFAULT_MAX_DATAGRAM_SIZE),
            receive_scratch_size: get_namespaced_usize(config, name, "receive_scratch_size")
                .unwrap_or(DEFAULT_RECEIVE_SCRATCH_SIZE),
        }
    }
}
