/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Configuration management with validation and defaults.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{TransportError, TransportResult};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Racing, pooling and TLS settings
    pub link: LinkConfig,

    /// IP prober settings
    pub finder: FinderConfig,

    /// Range fetch settings
    pub range: RangeConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Cipher suite profile used to build the TLS context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherProfile {
    /// Everything the TLS provider supports, in its preferred order
    Default,
    /// Curated modern suites accepted by the trusted front-end
    Gws,
}

/// Racing, pooling and TLS configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Number of addresses raced per round
    pub max_window: usize,

    /// Number of race rounds before giving up
    pub max_retry: usize,

    /// Steady-state timeout for trusted front-end connections (seconds)
    pub timeout_secs: f64,

    /// Fast-fail timeout for the TCP connect phase (milliseconds)
    pub connect_fast_timeout_ms: u64,

    /// Fast-fail timeout for the TLS handshake phase (milliseconds)
    pub handshake_fast_timeout_ms: u64,

    /// Idle lifetime of pooled connections for ordinary keys (seconds)
    pub keep_alive_secs: u64,

    /// Idle lifetime of pooled connections for trusted keys (seconds)
    pub trusted_keep_alive_secs: u64,

    /// Cache keys starting with this prefix belong to the trusted class
    pub trusted_prefix: String,

    /// Organization expected in trusted peer certificates
    pub trusted_organization: String,

    /// Hosts ending with this suffix are platform-hosted aliases
    pub platform_suffix: String,

    /// SNI sent when connecting to a platform-hosted alias
    pub platform_server_name: String,

    /// Cipher profile for the TLS context
    pub cipher_profile: CipherProfile,

    /// Explicit colon-separated cipher list, overrides the profile
    pub ciphers: Option<String>,

    /// PEM bundle of trusted roots (empty = bundled web roots)
    pub ca_bundle: Option<PathBuf>,

    /// Sweep interval of the plain connection pool (seconds)
    pub sweep_plain_secs: u64,

    /// Sweep interval of the TLS connection pool (seconds)
    pub sweep_tls_secs: u64,

    /// Capacity of each latency ranking table
    pub latency_cache_size: usize,

    /// Capacity of the per-IP in-flight connect limiter
    pub limiter_size: usize,

    /// Concurrent connects allowed per IP
    pub limiter_slots: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_window: 4,
            max_retry: 2,
            timeout_secs: 8.0,
            connect_fast_timeout_ms: 1000,
            handshake_fast_timeout_ms: 1500,
            keep_alive_secs: 30,
            trusted_keep_alive_secs: 180,
            trusted_prefix: "google".to_string(),
            trusted_organization: "Google Inc".to_string(),
            platform_suffix: ".appspot.com".to_string(),
            platform_server_name: "www.google.com".to_string(),
            cipher_profile: CipherProfile::Gws,
            ciphers: None,
            ca_bundle: None,
            sweep_plain_secs: 10,
            sweep_tls_secs: 5,
            latency_cache_size: 256,
            limiter_size: 512,
            limiter_slots: 3,
        }
    }
}

impl LinkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn connect_fast_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_fast_timeout_ms)
    }

    pub fn handshake_fast_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_fast_timeout_ms)
    }
}

/// IP prober configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    /// Floor under which fresh IPs are requested
    pub min_ip_count: usize,

    /// Upper bound for an acceptable handshake (milliseconds)
    pub max_timeout_ms: u64,

    /// Driver tick (seconds)
    pub driver_interval_secs: u64,

    /// Probe one IP after the pool sat idle this long (seconds)
    pub idle_probe_secs: u64,

    /// Probe one IP at least this often (seconds)
    pub forced_probe_secs: u64,

    /// A full rotation through the pool should take about this long (seconds)
    pub probe_cycle_secs: u64,

    /// Name of the trusted pool
    pub primary_pool: String,

    /// Name of the secondary pool whose members are weighted higher
    pub secondary_pool: String,

    /// Persisted IP list
    pub iplist_file: PathBuf,

    /// Persisted per-IP statistics
    pub statistics_file: PathBuf,

    /// Endpoint serving fresh candidate IPs, one per line
    pub discovery_url: Option<String>,

    /// Host suffixes resolved through the primary pool
    pub pool_hosts: Vec<String>,
}

impl Default for FinderConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("frontrace");
        Self {
            min_ip_count: 9,
            max_timeout_ms: 1000,
            driver_interval_secs: 2,
            idle_probe_secs: 6,
            forced_probe_secs: 30,
            probe_cycle_secs: 120,
            primary_pool: "google_gws".to_string(),
            secondary_pool: "google_com".to_string(),
            iplist_file: data_dir.join("iplist.toml"),
            statistics_file: data_dir.join("statistics.toml"),
            discovery_url: None,
            pool_hosts: vec![".appspot.com".to_string(), ".google.com".to_string()],
        }
    }
}

/// Range fetch configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    /// Size of one sub-fetch (bytes)
    pub max_size: u64,

    /// Size of one body read (bytes)
    pub buf_size: usize,

    /// Number of fetchlets
    pub threads: usize,

    /// Throughput under which an IP is dropped from a fetch (bytes/second)
    pub low_speed: u64,

    /// Slot identifiers gating concurrent sub-fetches
    pub app_ids: Vec<String>,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            max_size: 4 * 1024 * 1024,
            buf_size: 8192,
            threads: 2,
            low_speed: 32 * 1024,
            app_ids: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (empty = no file logging)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. /etc/frontrace/frontrace.toml (system-wide)
    /// 2. ~/.config/frontrace/config.toml (user)
    /// 3. an explicit path, if given
    /// 4. Environment variables (FRONTRACE_*)
    pub fn load(explicit: Option<&Path>) -> TransportResult<Self> {
        let mut config = Config::default();

        if let Some(parsed) = Self::read_optional(Path::new("/etc/frontrace/frontrace.toml")) {
            config = config.merge(parsed);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("frontrace").join("config.toml");
            if let Some(parsed) = Self::read_optional(&user_config) {
                config = config.merge(parsed);
            }
        }

        if let Some(path) = explicit {
            let content = fs::read_to_string(path)
                .map_err(|e| TransportError::persist(path.display().to_string(), e))?;
            let parsed = Self::parse(&content)?;
            config = config.merge(parsed);
        }

        config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn parse(content: &str) -> TransportResult<Self> {
        toml::from_str::<Config>(content).map_err(|e| TransportError::Config {
            message: e.to_string(),
        })
    }

    fn read_optional(path: &Path) -> Option<Config> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        match Self::parse(&content) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("ignoring {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one (sections that differ from default win)
    fn merge(mut self, other: Config) -> Self {
        let default = Config::default();

        if other.link != default.link {
            self.link = other.link;
        }
        if other.finder != default.finder {
            self.finder = other.finder;
        }
        if other.range != default.range {
            self.range = other.range;
        }
        if other.logging != default.logging {
            self.logging = other.logging;
        }

        self
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("FRONTRACE_WINDOW") {
            if let Ok(n) = val.parse() {
                self.link.max_window = n;
            }
        }

        if let Ok(val) = std::env::var("FRONTRACE_RANGE_THREADS") {
            if let Ok(n) = val.parse() {
                self.range.threads = n;
            }
        }

        if let Ok(val) = std::env::var("FRONTRACE_MIN_IP") {
            if let Ok(n) = val.parse() {
                self.finder.min_ip_count = n;
            }
        }

        if let Ok(val) = std::env::var("FRONTRACE_LOG_LEVEL") {
            self.logging.level = val;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> TransportResult<()> {
        let fail = |message: &str| {
            Err(TransportError::Config {
                message: message.to_string(),
            })
        };
        if self.link.max_window == 0 {
            return fail("link.max_window must be at least 1");
        }
        if self.link.max_retry == 0 {
            return fail("link.max_retry must be at least 1");
        }
        if self.link.limiter_slots == 0 {
            return fail("link.limiter_slots must be at least 1");
        }
        if self.link.latency_cache_size == 0 || self.link.limiter_size == 0 {
            return fail("cache capacities must be at least 1");
        }
        if self.range.threads == 0 {
            return fail("range.threads must be at least 1");
        }
        if self.range.max_size == 0 || self.range.buf_size == 0 {
            return fail("range.max_size and range.buf_size must be positive");
        }
        Ok(())
    }

    /// Timeout for a single range sub-fetch
    pub fn range_timeout(&self) -> Duration {
        Duration::from_secs_f64((self.link.timeout_secs - 2.0).clamp(1.5, 3.0))
    }
}
