//! Opus RTP packetization: one encoded frame per packet

use bytes::Bytes;

use super::{RtpError, RtpPayload, RtpSender, SenderConfig};

/// Samples per channel in one 20 ms frame at 48 kHz
pub const OPUS_FRAME_SIZE: u32 = 960;

pub fn packetize(frame: &[u8], frame_size: u32) -> RtpPayload {
    RtpPayload {
        data: Bytes::copy_from_slice(frame),
        marker: true,
        timestamp_increment: frame_size,
    }
}

/// RTP sender for Opus audio
pub struct OpusSender {
    rtp: RtpSender,
    frame_size: u32,
}

impl OpusSender {
    pub async fn open(config: &SenderConfig) -> Result<Self, RtpError> {
        Ok(OpusSender {
            rtp: RtpSender::open(config).await?,
            frame_size: OPUS_FRAME_SIZE,
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.rtp.ssrc()
    }

    /// Send one encoded Opus frame as a single packet
    pub async fn send(&mut self, frame: &[u8]) -> Result<usize, RtpError> {
        self.rtp.send(vec![packetize(frame, self.frame_size)]).await
    }
}
