//! LanMsg library.
//!
//! Peer-to-peer LAN messenger: UDP broadcast discovery, a bounded
//! peer roster, and one-message-per-connection TCP text delivery,
//! driven by a single-threaded cooperative tick loop over an
//! asynchronous transport abstraction. Everything except the host
//! adapters runs against any [`net::driver::Driver`] implementation,
//! which is how the integration tests script the network.

#![deny(unused_must_use)]

pub mod app;
pub mod config;
pub mod discovery;
pub mod net;
pub mod peers;
pub mod protocol;
pub mod selftest;

mod error;

pub mod adapters;

pub use error::{Error, Result};
