//! # ezvpn — reverse-tunneled SOCKS5 relay
//!
//! Agents deployed inside private networks dial *out* to a public gateway
//! over a mutually-authenticated TLS WebSocket; the gateway multiplexes many
//! logical byte-streams over that single control link. Each stream carries
//! one SOCKS5 session between an external client and a SOCKS5 engine running
//! next to (or inside) the gateway.
//!
//! ```text
//! external user ──TCP──> agent local listener ──mux stream──> gateway
//!               ──TCP/UDS──> SOCKS5 engine ──TCP──> real destination
//! ```
//!
//! Control flow runs the other way: the agent registers once at startup via
//! `GET /register/{auth_key}` and keeps the mux session alive indefinitely,
//! reconnecting after recoverable failures.
//!
//! The crate is split along the three load-bearing pieces:
//!
//! 1. [`mux`] + [`agent`] + [`server`] — the tunnel: WebSocket transport,
//!    authenticated handshake, stream multiplexing, keep-alive, recovery.
//! 2. [`socks`] — the SOCKS5 protocol engine (NoAuth + CONNECT only).
//! 3. [`relay`] — the bidirectional pump bridging any two byte endpoints.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::time::Duration;

pub mod agent;
pub mod error;
pub mod mux;
pub mod relay;
pub mod server;
pub mod socks;
pub mod tls;

pub use error::{Error, Result};

/// Max size of a single copy between tunnel endpoints. Large enough that a
/// typical MTU-sized read never fragments.
pub const BUFFER_SIZE: usize = 1500;

/// How long the agent binary waits for in-flight tunnels after cancellation.
pub const AGENT_CANCEL_WAIT: Duration = Duration::from_secs(3);

/// Fixed wait between failed register attempts.
pub const AGENT_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Timeout for the agent's WebSocket upgrade against the gateway.
pub const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for writing a WebSocket close frame during teardown.
pub const WS_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for TCP dials to the SOCKS endpoint and to CONNECT targets.
pub const NET_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Mux keep-alive ping period. Both sides of a tunnel use the same value.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Silence on a mux session longer than this marks the peer dead.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the gateway re-checks the allowed-agents file for changes.
pub const REGISTRY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Cap on concurrently tunneled connections per process.
pub const TUNNEL_POOL_SIZE: usize = 10_000;

/// Identification header sent with the agent's upgrade request.
pub const AGENT_HEADER_NAME: &str = "Agent";

/// Value of the [`AGENT_HEADER_NAME`] header.
pub const AGENT_HEADER_VALUE: &str = "ezvpn-agent@easzlab";
