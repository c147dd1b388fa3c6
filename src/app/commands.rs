//! Inbound commands to the application service.
//!
//! These represent actions requested by the outside world (the CLI
//! pump, the self-test menu item) that the
//! [`MessengerService`](super::service::MessengerService) interprets
//! and acts upon.

use std::net::Ipv4Addr;

/// Commands that external adapters can send into the application
/// core.
#[derive(Debug, Clone)]
pub enum AppCommand {
    /// Send a text message to one peer.
    SendText { peer_ip: Ipv4Addr, content: String },

    /// Send a text message to every active peer.
    Broadcast { content: String },

    /// Toggle debug-level echo to the console (handled by the
    /// logging adapter, outside the service).
    SetDebugLogging(bool),

    /// Start the automated send-API exercise.
    RunSelfTest,

    /// Announce departure and shut down.
    Quit,
}
