//! Unified error types for the messenger.
//!
//! A single `Error` enum that every subsystem can convert into keeps
//! the top-level loop's error handling uniform. Network and protocol
//! variants are `Copy` so they can travel through the state machines
//! without allocation.

use core::fmt;

use crate::config::ConfigError;
use crate::net::driver::NetError;
use crate::protocol::ProtoError;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the crate funnels into this type.
#[derive(Debug)]
pub enum Error {
    /// A transport operation failed (normalized driver code).
    Net(NetError),
    /// A wire record could not be formatted or parsed.
    Proto(ProtoError),
    /// Configuration is invalid or could not be loaded.
    Config(ConfigError),
    /// Subsystem initialisation failed; everything allocated before
    /// the failure has been rolled back.
    Init(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Net(e) => write!(f, "net: {e}"),
            Self::Proto(e) => write!(f, "protocol: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Init(msg) => write!(f, "init: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<NetError> for Error {
    fn from(e: NetError) -> Self {
        Self::Net(e)
    }
}

impl From<ProtoError> for Error {
    fn from(e: ProtoError) -> Self {
        Self::Proto(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
