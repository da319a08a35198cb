//! Gateway settings
//!
//! Loaded from a JSON file (`CONFIG_PATH`, default `config.json`), then
//! overridden from the environment the same way the server flags are.

use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const DEFAULT_RTMP_PORT: u16 = 1935;
pub const DEFAULT_SFU_URL: &str = "wss://mediasoup:3000";
pub const DEFAULT_SFU_ORIGIN: &str = "localhost";
pub const DEFAULT_GATEWAY_NAME: &str = "rtmp-gateway";
pub const H264_MIME_TYPE: &str = "video/h264";
pub const OPUS_MIME_TYPE: &str = "audio/opus";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },

    #[error("duplicate stream key {0}")]
    DuplicateStreamKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCodec {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioCodec {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub channels: u8,
    pub stereo: bool,
}

/// A publishable stream and the media it is allowed to carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub stream_key: String,
    pub video: Option<VideoCodec>,
    pub audio: Option<AudioCodec>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub name: String,
    pub rtmp_port: u16,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub sfu_url: String,
    pub sfu_origin: String,
    /// Delay before reconnecting the control channel; `None` disables it
    pub reconnect_interval: Option<Duration>,
    pub streams: Vec<Arc<StreamDescriptor>>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            name: DEFAULT_GATEWAY_NAME.to_string(),
            rtmp_port: DEFAULT_RTMP_PORT,
            tls_cert_path: None,
            tls_key_path: None,
            sfu_url: DEFAULT_SFU_URL.to_string(),
            sfu_origin: DEFAULT_SFU_ORIGIN.to_string(),
            reconnect_interval: None,
            streams: Vec::new(),
        }
    }
}

impl Settings {
    /// Load from `CONFIG_PATH` and the process environment
    pub fn load() -> Result<Self, SettingsError> {
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut settings = if Path::new(&path).exists() {
            Settings::from_file(&path)?
        } else {
            log::warn!("Settings file {} not found, using defaults", path);
            Settings::default()
        };
        settings.apply_overrides(|name| env::var(name).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &str) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_string(),
            source,
        })?;
        Settings::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, SettingsError> {
        let file: SettingsFile = serde_json::from_str(text)?;
        let mut settings = Settings::default();

        if let Some(name) = file.name {
            settings.name = name;
        }
        if let Some(server) = file.rtmp_server {
            settings.rtmp_port = server.port.unwrap_or(DEFAULT_RTMP_PORT);
            settings.tls_cert_path = server.certfile;
            settings.tls_key_path = server.keyfile;
        }
        if let Some(sfu) = file.mediasoup {
            if let Some(ws) = sfu.ws {
                settings.sfu_url = ws;
            }
            if let Some(origin) = sfu.origin {
                settings.sfu_origin = origin;
            }
            settings.reconnect_interval = sfu.reconnect_interval.map(Duration::from_secs);
        }

        let mut seen = HashSet::new();
        for streamer in file.streamers {
            let Some(stream_key) = streamer.stream_key else {
                log::warn!("Skipping streamer entry without streamKey");
                continue;
            };
            if !seen.insert(stream_key.clone()) {
                return Err(SettingsError::DuplicateStreamKey(stream_key));
            }

            let video = streamer
                .video
                .and_then(|v| v.codec)
                .filter(|codec| supported(&stream_key, &codec.mime_type, H264_MIME_TYPE))
                .map(|codec| VideoCodec {
                    mime_type: codec.mime_type,
                    payload_type: codec.payload_type,
                    clock_rate: codec.clock_rate,
                });
            let audio = streamer
                .audio
                .and_then(|a| a.codec)
                .filter(|codec| supported(&stream_key, &codec.mime_type, OPUS_MIME_TYPE))
                .map(|codec| AudioCodec {
                    mime_type: codec.mime_type,
                    payload_type: codec.payload_type,
                    clock_rate: codec.clock_rate,
                    channels: codec.channels,
                    stereo: codec
                        .parameters
                        .map(|p| p.sprop_stereo != 0)
                        .unwrap_or(false),
                });

            settings.streams.push(Arc::new(StreamDescriptor {
                stream_key,
                video,
                audio,
            }));
        }

        Ok(settings)
    }

    /// Apply `PORT`, `SFU_URL`, `SFU_ORIGIN`, `TLS_CERT_PATH` and `TLS_KEY_PATH`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.rtmp_port = port.parse().map_err(|_| SettingsError::InvalidEnv {
                name: "PORT".to_string(),
                value: port,
            })?;
        }
        if let Some(url) = lookup("SFU_URL") {
            self.sfu_url = url;
        }
        if let Some(origin) = lookup("SFU_ORIGIN") {
            self.sfu_origin = origin;
        }
        if let Some(cert) = lookup("TLS_CERT_PATH") {
            self.tls_cert_path = Some(cert);
        }
        if let Some(key) = lookup("TLS_KEY_PATH") {
            self.tls_key_path = Some(key);
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct SettingsFile {
    name: Option<String>,
    #[serde(rename = "rtmp-server")]
    rtmp_server: Option<RtmpServerSection>,
    mediasoup: Option<SfuSection>,
    #[serde(default)]
    streamers: Vec<StreamerSection>,
}

#[derive(Debug, Deserialize)]
struct RtmpServerSection {
    port: Option<u16>,
    certfile: Option<String>,
    keyfile: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SfuSection {
    ws: Option<String>,
    origin: Option<String>,
    reconnect_interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamerSection {
    stream_key: Option<String>,
    video: Option<MediaSection<VideoCodecSection>>,
    audio: Option<MediaSection<AudioCodecSection>>,
}

#[derive(Debug, Deserialize)]
struct MediaSection<C> {
    codec: Option<C>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoCodecSection {
    mime_type: String,
    payload_type: u8,
    clock_rate: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioCodecSection {
    mime_type: String,
    payload_type: u8,
    clock_rate: u32,
    channels: u8,
    parameters: Option<AudioParameters>,
}

#[derive(Debug, Deserialize)]
struct AudioParameters {
    #[serde(rename = "sprop-stereo", default)]
    sprop_stereo: u8,
}

/// Only H.264 video and Opus audio can be produced; anything else disables that leg
fn supported(stream_key: &str, mime_type: &str, expected: &str) -> bool {
    let ok = mime_type.eq_ignore_ascii_case(expected);
    if !ok {
        log::warn!(
            "Stream {}: codec {} not supported, expected {}; media disabled",
            stream_key,
            mime_type,
            expected
        );
    }
    ok
}
