//! Codec configuration bitstream parsers
//!
//! - `avc.rs` - AVC decoder configuration record (FLV `AVCPacketType` 0)
//! - `aac.rs` - AAC AudioSpecificConfig (FLV `AACPacketType` 0)

pub mod aac;
pub mod avc;

pub use aac::AudioSpecificConfig;
pub use avc::{AvcDecoderConfigurationRecord, HighProfileExtension};

use thiserror::Error;

/// Errors raised while parsing codec configuration records
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("{0} unexpected trailing bytes after config")]
    TrailingData(usize),

    #[error("bit reader exhausted after {0} bits")]
    OutOfBits(usize),
}
