//! JSON control messages exchanged with the SFU
//!
//! Every message is an envelope `{"type": ..., "payload": {...}}`. Responses
//! carry no request identifier; they are matched to requests by order.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::settings::{AudioCodec, VideoCodec};

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message {0} has no payload")]
    MissingPayload(String),

    #[error("unknown message type {0}")]
    UnknownType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// Requests sent to the SFU
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum SfuRequest {
    #[serde(rename = "createSendPlainTransport", rename_all = "camelCase")]
    CreateSendPlainTransport { rtcp_mux: bool, comedia: bool },

    #[serde(rename = "produce")]
    Produce { id: String, parameters: ProduceParameters },

    #[serde(rename = "pauseProducer", rename_all = "camelCase")]
    PauseProducer { producer_id: String },

    #[serde(rename = "resumeProducer", rename_all = "camelCase")]
    ResumeProducer { producer_id: String },
}

impl SfuRequest {
    /// RTP is pushed to the SFU, which learns our address from the first packet
    pub fn create_plain_transport() -> Self {
        SfuRequest::CreateSendPlainTransport {
            rtcp_mux: false,
            comedia: true,
        }
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceParameters {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: AppData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppData {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RtpParameters {
    pub codecs: Vec<RtpCodecParameters>,
    pub encodings: Vec<RtpEncoding>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RtpEncoding {
    pub ssrc: u32,
}

impl RtpParameters {
    pub fn video(codec: &VideoCodec, ssrc: u32) -> Self {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.payload_type,
                clock_rate: codec.clock_rate,
                channels: None,
                parameters: json!({
                    "packetization-mode": 1,
                    "profile-level-id": "42e01f",
                    "level-asymmetry-allowed": 1
                }),
            }],
            encodings: vec![RtpEncoding { ssrc }],
        }
    }

    pub fn audio(codec: &AudioCodec, ssrc: u32) -> Self {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.payload_type,
                clock_rate: codec.clock_rate,
                channels: Some(codec.channels),
                parameters: json!({ "sprop-stereo": u8::from(codec.stereo) }),
            }],
            encodings: vec![RtpEncoding { ssrc }],
        }
    }
}

/// Plain transport allocated by the SFU for one media kind
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEndpoint {
    pub id: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub rtcp_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProducerCreated {
    pub id: String,
    #[serde(default)]
    pub kind: Option<MediaKind>,
}

/// Responses understood from the SFU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SfuResponse {
    TransportCreated(TransportEndpoint),
    ProducerCreated(ProducerCreated),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
}

impl SfuResponse {
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let payload = match envelope.payload {
            Some(payload) if !payload.is_null() => payload,
            _ => return Err(MessageError::MissingPayload(envelope.kind)),
        };

        match envelope.kind.as_str() {
            "sendPlainTransport" => Ok(SfuResponse::TransportCreated(serde_json::from_value(
                payload,
            )?)),
            "producer" => Ok(SfuResponse::ProducerCreated(serde_json::from_value(payload)?)),
            _ => Err(MessageError::UnknownType(envelope.kind)),
        }
    }
}
