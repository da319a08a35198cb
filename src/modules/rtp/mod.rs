//! RTP relay senders
//!
//! - `h264.rs` - single NAL unit / FU-A packetization (RFC 6184)
//! - `opus.rs` - one Opus frame per packet (RFC 7587)
//!
//! Packetizers are pure functions producing [`RtpPayload`]s; [`RtpSender`]
//! owns the UDP socket and the RTP header state (SSRC, sequence number,
//! timestamp) and stamps each payload as it goes out.

pub mod h264;
pub mod opus;

pub use self::h264::H264Sender;
pub use self::opus::OpusSender;

use bytes::Bytes;
use rand_core::{OsRng, RngCore};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::UdpSocket;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::util::Marshal;

/// Default transport packet size the payload budget is derived from
pub const DEFAULT_PACKET_SIZE: usize = 1400;

/// Payload budget per packet: packet size minus IP/UDP slack and the RTP header
pub const MAX_PAYLOAD_LEN: usize = DEFAULT_PACKET_SIZE - 100 - 12;

#[derive(Debug, Error)]
pub enum RtpError {
    #[error("invalid destination address {0}")]
    InvalidAddress(String),

    #[error("UDP socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RTP marshal error: {0}")]
    Marshal(#[from] webrtc::util::Error),
}

/// One packet's worth of payload plus the header bits the packetizer decides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPayload {
    pub data: Bytes,
    pub marker: bool,
    /// Added to the stream timestamp after this packet is sent
    pub timestamp_increment: u32,
}

/// Parameters for opening a sender toward one SFU plain transport
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub destination_ip: String,
    pub destination_port: u16,
    pub payload_type: u8,
    pub clock_rate: u32,
    /// Local UDP port; 0 lets the OS pick
    pub port_base: u16,
}

pub struct RtpSender {
    socket: UdpSocket,
    destination: SocketAddr,
    payload_type: u8,
    clock_rate: u32,
    ssrc: u32,
    sequence_number: u16,
    timestamp: u32,
}

impl RtpSender {
    pub async fn open(config: &SenderConfig) -> Result<Self, RtpError> {
        let ip: IpAddr = config
            .destination_ip
            .parse()
            .map_err(|_| RtpError::InvalidAddress(config.destination_ip.clone()))?;
        let destination = SocketAddr::new(ip, config.destination_port);

        let bind_addr = if ip.is_ipv4() {
            format!("0.0.0.0:{}", config.port_base)
        } else {
            format!("[::]:{}", config.port_base)
        };
        let socket = UdpSocket::bind(&bind_addr).await?;

        let sender = RtpSender {
            socket,
            destination,
            payload_type: config.payload_type,
            clock_rate: config.clock_rate,
            ssrc: OsRng.next_u32(),
            sequence_number: OsRng.next_u32() as u16,
            timestamp: OsRng.next_u32(),
        };

        log::debug!(
            "RTP sender opened: {} -> {} (pt={}, clock={}, ssrc={:08x})",
            sender.socket.local_addr()?,
            destination,
            sender.payload_type,
            sender.clock_rate,
            sender.ssrc
        );
        Ok(sender)
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RtpError> {
        Ok(self.socket.local_addr()?)
    }

    /// Wrap a payload in an RTP header and advance sequence number and timestamp
    fn next_packet(&mut self, payload: RtpPayload) -> Packet {
        let packet = Packet {
            header: Header {
                version: 2,
                marker: payload.marker,
                payload_type: self.payload_type,
                sequence_number: self.sequence_number,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload: payload.data,
        };
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(payload.timestamp_increment);
        packet
    }

    /// Send payloads in order; returns the number of packets written
    pub async fn send(&mut self, payloads: Vec<RtpPayload>) -> Result<usize, RtpError> {
        let count = payloads.len();
        for payload in payloads {
            let packet = self.next_packet(payload);
            let raw = packet.marshal()?;
            self.socket.send_to(&raw, self.destination).await?;
        }
        Ok(count)
    }
}
