//! RTMP ingest
//!
//! Accepts publish connections from encoders and turns them into codec
//! configuration and media events for the gateway.
//!
//! ## Architecture
//!
//! - `server.rs` - TCP/TLS listener and the per-connection task arena
//! - `session.rs` - Per-connection RTMP state machine (handshake, AMF commands, auth)
//! - `tags.rs` - FLV audio/video tag demuxing
//! - `registry.rs` - Shared maps of connecting sessions, active keys and producers

pub mod registry;
pub mod server;
pub mod session;
pub mod tags;

pub use registry::StreamRegistry;
pub use server::IngestListener;
pub use session::{IngestSession, SessionEvents};

use std::time::Duration;

/// A session must finish the handshake within this window
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifier allocated to each accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
