//! Adapters: concrete implementations of the port traits for a
//! standard host (std::net sockets, terminal, Instant-backed clock,
//! file-backed logger).

pub mod clock;
pub mod console;
pub mod logger;
pub mod std_net;
