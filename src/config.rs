//! System configuration parameters
//!
//! All tunable parameters for the messenger. Values can be
//! overridden from a JSON config file passed on the command line;
//! everything else falls back to the defaults below. Queue depths
//! and pool widths are compile-time constants (they size fixed
//! arrays); the timing knobs and ports live here.

use serde::{Deserialize, Serialize};

use crate::net::driver::parse_ipv4;

/// The host tick clock runs at 60 Hz; every timeout and interval in
/// the system is expressed in these ticks.
pub const TICK_HZ: u64 = 60;

/// Core system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    // --- Identity ---
    /// Display name announced to peers (1-32 bytes, no '|').
    pub username: String,

    // --- Ports ---
    /// UDP discovery port.
    pub udp_port: u16,
    /// TCP messaging port.
    pub tcp_port: u16,
    /// Discovery broadcast target (subnet-directed or limited).
    pub broadcast_addr: String,

    // --- Timing ---
    /// Seconds between presence broadcasts.
    pub discovery_interval_secs: u16,
    /// Seconds of silence before a peer is greyed out.
    pub peer_timeout_secs: u16,
    /// Seconds before a stuck connect/send is swept.
    pub connection_timeout_secs: u16,
    /// Seconds between roster prune passes.
    pub prune_interval_secs: u16,

    // --- Logging ---
    /// Maximum level: "error", "warn", "info", or "debug".
    pub log_level: String,
    /// Echo debug-level lines to the console as well as the file.
    pub debug_to_console: bool,
    /// Rolling log file path; `None` disables the file.
    pub log_file: Option<String>,
    /// Rotate the log file when it exceeds this size.
    pub log_file_max_kb: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            // Identity
            username: "user".to_string(),

            // Ports
            udp_port: 8765,
            tcp_port: 8766,
            broadcast_addr: "255.255.255.255".to_string(),

            // Timing
            discovery_interval_secs: 10,
            peer_timeout_secs: 30,
            connection_timeout_secs: 30,
            prune_interval_secs: 5,

            // Logging
            log_level: "info".to_string(),
            debug_to_console: false,
            log_file: Some("lanmsg.log".to_string()),
            log_file_max_kb: 512,
        }
    }
}

impl SystemConfig {
    /// Range-check every field. Invalid values are rejected, not
    /// clamped.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.username.is_empty() || self.username.len() > crate::protocol::MAX_USERNAME_LEN {
            return Err("username must be 1-32 bytes");
        }
        if self.username.contains('|') {
            return Err("username must not contain '|'");
        }
        if self.udp_port == 0 || self.tcp_port == 0 {
            return Err("ports must be nonzero");
        }
        if self.udp_port == self.tcp_port {
            return Err("udp_port and tcp_port must differ");
        }
        if parse_ipv4(&self.broadcast_addr).is_none() {
            return Err("broadcast_addr is not a dotted quad");
        }
        if self.discovery_interval_secs == 0
            || self.peer_timeout_secs == 0
            || self.connection_timeout_secs == 0
            || self.prune_interval_secs == 0
        {
            return Err("intervals must be nonzero");
        }
        if log_level_from_str(&self.log_level).is_none() {
            return Err("log_level must be error/warn/info/debug");
        }
        Ok(())
    }

    pub fn broadcast_ip(&self) -> std::net::Ipv4Addr {
        // validate() has already established this parses.
        parse_ipv4(&self.broadcast_addr).unwrap_or(std::net::Ipv4Addr::BROADCAST)
    }

    pub fn max_log_level(&self) -> log::LevelFilter {
        log_level_from_str(&self.log_level).unwrap_or(log::LevelFilter::Info)
    }

    // --- Tick conversions ---

    pub fn discovery_interval_ticks(&self) -> u64 {
        u64::from(self.discovery_interval_secs) * TICK_HZ
    }

    pub fn peer_timeout_ticks(&self) -> u64 {
        u64::from(self.peer_timeout_secs) * TICK_HZ
    }

    pub fn connection_timeout_ticks(&self) -> u64 {
        u64::from(self.connection_timeout_secs) * TICK_HZ
    }

    pub fn prune_interval_ticks(&self) -> u64 {
        u64::from(self.prune_interval_secs) * TICK_HZ
    }

    // --- Persistence ---

    /// Load and validate a JSON config file.
    pub fn load_json(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound
            } else {
                ConfigError::IoError
            }
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|_| ConfigError::Corrupted)?;
        config.validate().map_err(ConfigError::ValidationFailed)?;
        Ok(config)
    }

    /// Validate and persist as pretty JSON.
    pub fn save_json(&self, path: &str) -> Result<(), ConfigError> {
        self.validate().map_err(ConfigError::ValidationFailed)?;
        let text = serde_json::to_string_pretty(self).map_err(|_| ConfigError::IoError)?;
        std::fs::write(path, text).map_err(|_| ConfigError::IoError)
    }
}

fn log_level_from_str(s: &str) -> Option<log::LevelFilter> {
    match s {
        "error" => Some(log::LevelFilter::Error),
        "warn" => Some(log::LevelFilter::Warn),
        "info" => Some(log::LevelFilter::Info),
        "debug" => Some(log::LevelFilter::Debug),
        _ => None,
    }
}

/// Errors from config load/save.
#[derive(Debug)]
pub enum ConfigError {
    /// No config file at the given path (defaults apply).
    NotFound,
    /// File exists but is not valid JSON for this schema.
    Corrupted,
    /// A field failed range validation.
    ValidationFailed(&'static str),
    /// Generic I/O error.
    IoError,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "config not found"),
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
