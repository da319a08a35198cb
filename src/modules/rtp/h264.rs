//! H.264 RTP packetization (single NAL unit and FU-A modes)

use bytes::{BufMut, Bytes, BytesMut};

use super::{RtpError, RtpPayload, RtpSender, SenderConfig, MAX_PAYLOAD_LEN};

/// Fixed frame rate the timestamp increment is derived from
pub const DEFAULT_FPS: u32 = 30;

const NAL_TYPE_MASK: u8 = 0x1F;
const NAL_FNRI_MASK: u8 = 0xE0;
const NAL_TYPE_FU_A: u8 = 28;
const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// Highest NAL type that carries a coded slice (non-IDR, partitions A-C, IDR)
const LAST_SLICE_NAL_TYPE: u8 = 5;

/// Split one NAL unit (without start code or length prefix) into RTP payloads.
///
/// A NAL whose body (everything after the header byte) fits in `max_len` is
/// sent whole; anything larger is fragmented into FU-A packets of
/// `max_len + 2` bytes with a shorter trailing fragment.
pub fn packetize(nal: &[u8], max_len: usize, timestamp_increment: u32) -> Vec<RtpPayload> {
    let Some(&header) = nal.first() else {
        return Vec::new();
    };

    let body_len = nal.len() - 1;
    if body_len <= max_len {
        let marker = (header & NAL_TYPE_MASK) <= LAST_SLICE_NAL_TYPE;
        return vec![RtpPayload {
            data: Bytes::copy_from_slice(nal),
            marker,
            timestamp_increment: if marker { timestamp_increment } else { 0 },
        }];
    }

    let mut num = body_len / max_len;
    let mut last_len = body_len % max_len;
    if last_len == 0 {
        num -= 1;
        last_len = max_len;
    }

    let fu_indicator = (header & NAL_FNRI_MASK) | NAL_TYPE_FU_A;
    let nal_type = header & NAL_TYPE_MASK;

    let mut payloads = Vec::with_capacity(num + 1);
    for index in 0..=num {
        let start = 1 + index * max_len;
        let (fu_header, chunk_len) = if index == 0 {
            (nal_type | FU_START, max_len)
        } else if index == num {
            (nal_type | FU_END, last_len)
        } else {
            (nal_type, max_len)
        };

        let mut data = BytesMut::with_capacity(chunk_len + 2);
        data.put_u8(fu_indicator);
        data.put_u8(fu_header);
        data.put_slice(&nal[start..start + chunk_len]);

        let last = index == num;
        payloads.push(RtpPayload {
            data: data.freeze(),
            marker: last,
            timestamp_increment: if last { timestamp_increment } else { 0 },
        });
    }
    payloads
}

/// RTP sender for H.264 video
pub struct H264Sender {
    rtp: RtpSender,
    max_payload_len: usize,
    timestamp_increment: u32,
}

impl H264Sender {
    pub async fn open(config: &SenderConfig) -> Result<Self, RtpError> {
        let rtp = RtpSender::open(config).await?;
        Ok(H264Sender {
            timestamp_increment: rtp.clock_rate() / DEFAULT_FPS,
            max_payload_len: MAX_PAYLOAD_LEN,
            rtp,
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.rtp.ssrc()
    }

    /// Send one NAL unit; returns the number of RTP packets written
    pub async fn send(&mut self, nal: &[u8]) -> Result<usize, RtpError> {
        let payloads = packetize(nal, self.max_payload_len, self.timestamp_increment);
        self.rtp.send(payloads).await
    }
}
