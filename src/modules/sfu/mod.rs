//! SFU control plane: JSON messages, per-stream producers and the
//! signaling client that negotiates them one at a time.

pub mod client;
pub mod messages;
pub mod producer;

pub use client::{SignalingClient, SignalingCommand, SignalingError, SignalingOptions};
pub use messages::{MediaKind, SfuRequest, SfuResponse, TransportEndpoint};
pub use producer::{AudioError, CreationState, MediaProducer, ProducerProgress};
