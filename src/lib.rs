//! RTMP ingest to SFU gateway.
//!
//! Encoders publish over RTMP(S); each authenticated stream is negotiated
//! with the SFU over a WebSocket control channel and relayed as RTP, H264
//! repacketized with FU-A and AAC transcoded to Opus.

// Gateway settings and stream descriptors
pub mod settings;

// Ingest, codecs, RTP relay and SFU signaling
pub mod modules;

pub use modules::gateway::Gateway;
pub use modules::rtmp::{ConnectionId, IngestListener, StreamRegistry};
pub use modules::sfu::{SignalingClient, SignalingCommand, SignalingOptions};
pub use settings::Settings;
