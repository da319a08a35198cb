//! Per-Connection RTMP Session State Machine
//!
//! Manages the lifecycle of a publish connection:
//! - RTMP handshake (bounded by [`HANDSHAKE_TIMEOUT`])
//! - AMF0 command dispatch (`connect`, `createStream`, `FCPublish`, `publish`, `play`, ...)
//! - Stream-key authentication through [`SessionEvents::on_stream_key`]
//! - Audio/video tag demuxing into codec configs and media units
//!
//! Chunk-level framing is delegated to `rml_rtmp`; everything above it is
//! handled here so the replies match what common encoders expect.

use rml_amf0::Amf0Value;
use rml_rtmp::chunk_io::{ChunkDeserializer, ChunkSerializer};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::messages::{MessagePayload, PeerBandwidthLimitType, RtmpMessage};
use rml_rtmp::time::RtmpTimestamp;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use super::tags::{parse_audio_tag, parse_video_tag, AudioTag, NalUnits, VideoTag};
use super::{ConnectionId, HANDSHAKE_TIMEOUT};
use crate::modules::codec::{AudioSpecificConfig, AvcDecoderConfigurationRecord};

/// Window acknowledgement size and peer bandwidth announced on connect
pub const WINDOW_ACK_SIZE: u32 = 2_500_000;
/// Outbound chunk size announced on connect
pub const OUTBOUND_CHUNK_SIZE: u32 = 4096;

const FMS_VERSION: &str = "FMS/3,5,1,525";
const SERVER_VERSION: &str = "3,5,1,525";
const STREAM_LENGTH: f64 = 10.0;
const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("handshake did not complete in time")]
    HandshakeTimeout,

    #[error("connection closed during handshake")]
    ClosedDuringHandshake,

    #[error("RTMP error: {0}")]
    Rtmp(String),

    #[error("{0} without a stream key")]
    MissingStreamKey(String),

    #[error("stream key {0} rejected")]
    Rejected(String),

    #[error("stream key {requested} requested while publishing {current}")]
    KeyChanged { current: String, requested: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    AwaitingStreamKey,
    Authenticated,
    Closed,
}

/// Callbacks from an ingest session into the rest of the gateway
pub trait SessionEvents: Send + Sync + 'static {
    /// Decide whether `stream_key` may publish on connection `id`
    fn on_stream_key(&self, id: ConnectionId, stream_key: &str)
        -> impl Future<Output = bool> + Send;

    /// Called exactly once when the session ends, for any reason
    fn on_closed(&self, id: ConnectionId, stream_key: Option<&str>)
        -> impl Future<Output = ()> + Send;

    fn on_video_config(
        &self,
        stream_key: &str,
        config: &AvcDecoderConfigurationRecord,
    ) -> impl Future<Output = ()> + Send;

    fn on_audio_config(
        &self,
        stream_key: &str,
        config: &AudioSpecificConfig,
    ) -> impl Future<Output = ()> + Send;

    /// One NAL unit, without its length prefix
    fn on_video_data(
        &self,
        stream_key: &str,
        nal: &[u8],
        timestamp: u32,
    ) -> impl Future<Output = ()> + Send;

    /// One raw AAC access unit
    fn on_audio_data(
        &self,
        stream_key: &str,
        aac: &[u8],
        timestamp: u32,
    ) -> impl Future<Output = ()> + Send;
}

pub struct IngestSession<S, E> {
    id: ConnectionId,
    stream: S,
    events: Arc<E>,
    stop: watch::Receiver<bool>,
    state: SessionState,
    deserializer: ChunkDeserializer,
    serializer: ChunkSerializer,
    next_stream_id: u32,
    stream_key: Option<String>,
    avc_config: Option<AvcDecoderConfigurationRecord>,
    peer_ack_window: Option<u32>,
    bytes_received: u64,
    last_ack: u64,
}

impl<S, E> IngestSession<S, E>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    E: SessionEvents,
{
    pub fn new(id: ConnectionId, stream: S, events: Arc<E>, stop: watch::Receiver<bool>) -> Self {
        IngestSession {
            id,
            stream,
            events,
            stop,
            state: SessionState::Handshaking,
            deserializer: ChunkDeserializer::new(),
            serializer: ChunkSerializer::new(),
            next_stream_id: 0,
            stream_key: None,
            avc_config: None,
            peer_ack_window: None,
            bytes_received: 0,
            last_ack: 0,
        }
    }

    /// Run the session to completion, then report it closed
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.process().await;
        self.state = SessionState::Closed;
        self.events.on_closed(self.id, self.stream_key.as_deref()).await;
        result
    }

    async fn process(&mut self) -> Result<(), SessionError> {
        let remaining = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake())
            .await
            .map_err(|_| SessionError::HandshakeTimeout)??;
        log::debug!("RTMP handshake completed for {}", self.id);
        self.state = SessionState::AwaitingStreamKey;

        if !remaining.is_empty() {
            self.handle_input(&remaining).await?;
        }

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        while self.state != SessionState::Closed {
            if *self.stop.borrow() {
                break;
            }
            tokio::select! {
                read = self.stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        log::info!("RTMP connection closed: {}", self.id);
                        break;
                    }
                    self.handle_input(&buf[..n]).await?;
                }
                _ = self.stop.changed() => {
                    log::info!("Stopping RTMP session {}", self.id);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handshake(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut handshake = Handshake::new(PeerType::Server);
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(SessionError::ClosedDuringHandshake);
            }

            match handshake.process_bytes(&buf[..n]) {
                Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                    if !response_bytes.is_empty() {
                        self.stream.write_all(&response_bytes).await?;
                    }
                }
                Ok(HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                }) => {
                    if !response_bytes.is_empty() {
                        self.stream.write_all(&response_bytes).await?;
                    }
                    return Ok(remaining_bytes);
                }
                Err(e) => return Err(SessionError::Handshake(format!("{:?}", e))),
            }
        }
    }

    async fn handle_input(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.bytes_received += bytes.len() as u64;

        let mut input = bytes;
        while self.state != SessionState::Closed {
            let payload = self
                .deserializer
                .get_next_message(input)
                .map_err(|e| SessionError::Rtmp(format!("{:?}", e)))?;
            input = &[];

            match payload {
                Some(payload) => self.handle_payload(payload).await?,
                None => return self.acknowledge().await,
            }
        }
        Ok(())
    }

    async fn acknowledge(&mut self) -> Result<(), SessionError> {
        let Some(window) = self.peer_ack_window else {
            return Ok(());
        };
        if window == 0 || self.bytes_received - self.last_ack < window as u64 {
            return Ok(());
        }

        self.last_ack = self.bytes_received;
        // sequence number wraps at 32 bits
        let sequence_number = self.bytes_received as u32;
        self.send(RtmpMessage::Acknowledgement { sequence_number }, 0)
            .await
    }

    async fn handle_payload(&mut self, payload: MessagePayload) -> Result<(), SessionError> {
        let timestamp = payload.timestamp.value;
        let message_stream_id = payload.message_stream_id;
        let message = match payload.to_rtmp_message() {
            Ok(message) => message,
            Err(e) => {
                log::warn!(
                    "{}: dropping undecodable message type {}: {:?}",
                    self.id,
                    payload.type_id,
                    e
                );
                return Ok(());
            }
        };

        match message {
            RtmpMessage::SetChunkSize { size } => {
                log::debug!("{}: peer chunk size {}", self.id, size);
                self.deserializer
                    .set_max_chunk_size(size as usize)
                    .map_err(|e| SessionError::Rtmp(format!("{:?}", e)))?;
            }
            RtmpMessage::WindowAcknowledgement { size } => {
                log::debug!("{}: peer window acknowledgement size {}", self.id, size);
                self.peer_ack_window = Some(size);
            }
            RtmpMessage::Amf0Command {
                command_name,
                transaction_id,
                command_object,
                additional_arguments,
            } => {
                self.handle_command(
                    &command_name,
                    transaction_id,
                    &command_object,
                    &additional_arguments,
                    message_stream_id,
                )
                .await?;
            }
            RtmpMessage::AudioData { data } => self.handle_audio(&data, timestamp).await,
            RtmpMessage::VideoData { data } => self.handle_video(&data, timestamp).await,
            RtmpMessage::Amf0Data { values } => {
                log::debug!("{}: data message with {} value(s)", self.id, values.len());
            }
            other => {
                log::trace!("{}: ignoring {:?}", self.id, other);
            }
        }
        Ok(())
    }

    async fn handle_command(
        &mut self,
        name: &str,
        transaction_id: f64,
        command_object: &Amf0Value,
        arguments: &[Amf0Value],
        message_stream_id: u32,
    ) -> Result<(), SessionError> {
        log::debug!("{}: client invoking <{}>", self.id, name);

        match name {
            "connect" => self.send_connect_result(transaction_id, command_object).await,
            "createStream" => {
                self.next_stream_id += 1;
                self.send_result_number(transaction_id, self.next_stream_id as f64)
                    .await
            }
            "getStreamLength" => self.send_result_number(transaction_id, STREAM_LENGTH).await,
            "FCPublish" => {
                let stream_key = self.authenticate(name, arguments).await?;
                log::info!("{}: FCPublish {}", self.id, stream_key);
                let info = status_object("NetStream.Publish.Start", "FCPublish to stream.");
                self.send_command("onFCPublish", 0.0, Amf0Value::Null, vec![info], 0)
                    .await
            }
            "publish" => {
                self.authenticate(name, arguments).await?;
                self.next_stream_id += 1;
                self.send_result_number(transaction_id, self.next_stream_id as f64)
                    .await?;
                let info = status_object("NetStream.Publish.Start", "Start publishing");
                self.send_command("onStatus", 0.0, Amf0Value::Null, vec![info], message_stream_id)
                    .await
            }
            "play" => {
                self.authenticate(name, arguments).await?;
                self.next_stream_id += 1;
                self.send_result_number(transaction_id, self.next_stream_id as f64)
                    .await
            }
            "releaseStream" | "FCUnpublish" | "deleteStream" => {
                log::info!("{}: {} {:?}", self.id, name, string_argument(arguments));
                Ok(())
            }
            _ => {
                log::debug!("{}: unhandled command {}", self.id, name);
                Ok(())
            }
        }
    }

    /// Run the stream key from `arguments` past the gateway; a rejection
    /// closes the session.
    ///
    /// A connection publishes one key for its whole life: repeating that key
    /// is a no-op and naming another one closes the session.
    async fn authenticate(
        &mut self,
        command: &str,
        arguments: &[Amf0Value],
    ) -> Result<String, SessionError> {
        let Some(stream_key) = string_argument(arguments).map(str::to_string) else {
            self.state = SessionState::Closed;
            return Err(SessionError::MissingStreamKey(command.to_string()));
        };

        if let Some(current) = self.authenticated_key() {
            if current == stream_key {
                return Ok(stream_key);
            }
            let current = current.to_string();
            self.state = SessionState::Closed;
            return Err(SessionError::KeyChanged {
                current,
                requested: stream_key,
            });
        }

        if !self.events.on_stream_key(self.id, &stream_key).await {
            self.state = SessionState::Closed;
            return Err(SessionError::Rejected(stream_key));
        }

        log::info!("{}: authenticated stream key {}", self.id, stream_key);
        self.stream_key = Some(stream_key.clone());
        self.state = SessionState::Authenticated;
        Ok(stream_key)
    }

    async fn handle_audio(&mut self, data: &[u8], timestamp: u32) {
        let Some(stream_key) = self.authenticated_key() else {
            log::trace!("{}: dropping audio before authentication", self.id);
            return;
        };

        match parse_audio_tag(data) {
            Ok(AudioTag::AacSequenceHeader(bytes)) => match AudioSpecificConfig::parse(bytes) {
                Ok(config) => {
                    log::info!(
                        "{}: AAC object type {} at {} Hz, {} channel(s)",
                        stream_key,
                        config.audio_object_type,
                        config.frequency,
                        config.channels()
                    );
                    self.events.on_audio_config(stream_key, &config).await;
                }
                Err(e) => log::warn!("{}: invalid AAC sequence header: {}", stream_key, e),
            },
            Ok(AudioTag::AacRaw(bytes)) => {
                self.events.on_audio_data(stream_key, bytes, timestamp).await;
            }
            Err(e) => log::debug!("{}: dropping audio tag: {}", stream_key, e),
        }
    }

    async fn handle_video(&mut self, data: &[u8], timestamp: u32) {
        let Some(stream_key) = self.authenticated_key() else {
            log::trace!("{}: dropping video before authentication", self.id);
            return;
        };

        match parse_video_tag(data) {
            Ok(VideoTag::AvcSequenceHeader(bytes)) => {
                match AvcDecoderConfigurationRecord::parse(bytes) {
                    Ok(config) => {
                        self.events.on_video_config(stream_key, &config).await;
                        self.avc_config = Some(config);
                    }
                    Err(e) => log::warn!("{}: invalid AVC sequence header: {}", stream_key, e),
                }
            }
            Ok(VideoTag::AvcNalu { data, .. }) => {
                let Some(config) = self.avc_config.as_ref() else {
                    log::debug!("{}: NALU before AVC sequence header", stream_key);
                    return;
                };
                let units = match NalUnits::new(data, config.nal_length_size()) {
                    Ok(units) => units,
                    Err(e) => {
                        log::warn!("{}: {}", stream_key, e);
                        return;
                    }
                };
                for unit in units {
                    match unit {
                        Ok(nal) => self.events.on_video_data(stream_key, nal, timestamp).await,
                        Err(e) => log::warn!("{}: dropping rest of tag: {}", stream_key, e),
                    }
                }
            }
            Ok(VideoTag::AvcEndOfSequence) => {
                log::debug!("{}: AVC end of sequence", stream_key);
            }
            Err(e) => log::debug!("{}: dropping video tag: {}", stream_key, e),
        }
    }

    fn authenticated_key(&self) -> Option<&str> {
        match self.state {
            SessionState::Authenticated => self.stream_key.as_deref(),
            _ => None,
        }
    }

    async fn send_connect_result(
        &mut self,
        transaction_id: f64,
        command_object: &Amf0Value,
    ) -> Result<(), SessionError> {
        let (app, object_encoding) = match command_object {
            Amf0Value::Object(properties) => (
                match properties.get("app") {
                    Some(Amf0Value::Utf8String(app)) => app.clone(),
                    _ => String::new(),
                },
                match properties.get("objectEncoding") {
                    Some(Amf0Value::Number(encoding)) => *encoding,
                    _ => 0.0,
                },
            ),
            _ => (String::new(), 0.0),
        };
        log::info!("{}: connect app={}", self.id, app);

        self.send(
            RtmpMessage::WindowAcknowledgement {
                size: WINDOW_ACK_SIZE,
            },
            0,
        )
        .await?;
        self.send(
            RtmpMessage::SetPeerBandwidth {
                size: WINDOW_ACK_SIZE,
                limit_type: PeerBandwidthLimitType::Dynamic,
            },
            0,
        )
        .await?;

        let packet = self
            .serializer
            .set_max_chunk_size(OUTBOUND_CHUNK_SIZE, RtmpTimestamp::new(0))
            .map_err(|e| SessionError::Rtmp(format!("{:?}", e)))?;
        self.stream.write_all(&packet.bytes).await?;

        let (properties, information) = connect_result_objects(object_encoding);
        self.send_command("_result", transaction_id, properties, vec![information], 0)
            .await
    }

    async fn send_result_number(
        &mut self,
        transaction_id: f64,
        value: f64,
    ) -> Result<(), SessionError> {
        self.send_command(
            "_result",
            transaction_id,
            Amf0Value::Null,
            vec![Amf0Value::Number(value)],
            0,
        )
        .await
    }

    async fn send_command(
        &mut self,
        name: &str,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_arguments: Vec<Amf0Value>,
        stream_id: u32,
    ) -> Result<(), SessionError> {
        let message = RtmpMessage::Amf0Command {
            command_name: name.to_string(),
            transaction_id,
            command_object,
            additional_arguments,
        };
        self.send(message, stream_id).await
    }

    async fn send(&mut self, message: RtmpMessage, stream_id: u32) -> Result<(), SessionError> {
        let payload = message
            .into_message_payload(RtmpTimestamp::new(0), stream_id)
            .map_err(|e| SessionError::Rtmp(format!("{:?}", e)))?;
        let packet = self
            .serializer
            .serialize(&payload, false, false)
            .map_err(|e| SessionError::Rtmp(format!("{:?}", e)))?;
        self.stream.write_all(&packet.bytes).await?;
        Ok(())
    }
}

fn string_argument(arguments: &[Amf0Value]) -> Option<&str> {
    match arguments.first() {
        Some(Amf0Value::Utf8String(value)) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn status_object(code: &str, description: &str) -> Amf0Value {
    let mut properties = HashMap::new();
    properties.insert("level".to_string(), Amf0Value::Utf8String("status".to_string()));
    properties.insert("code".to_string(), Amf0Value::Utf8String(code.to_string()));
    properties.insert(
        "description".to_string(),
        Amf0Value::Utf8String(description.to_string()),
    );
    Amf0Value::Object(properties)
}

/// Properties and information objects of the `connect` reply
fn connect_result_objects(object_encoding: f64) -> (Amf0Value, Amf0Value) {
    let mut properties = HashMap::new();
    properties.insert(
        "fmsVer".to_string(),
        Amf0Value::Utf8String(FMS_VERSION.to_string()),
    );
    properties.insert("capabilities".to_string(), Amf0Value::Number(31.0));
    properties.insert("mode".to_string(), Amf0Value::Number(1.0));

    let mut data = HashMap::new();
    data.insert(
        "version".to_string(),
        Amf0Value::Utf8String(SERVER_VERSION.to_string()),
    );

    let mut information = match status_object("NetConnection.Connect.Success", "Connection succeeded.") {
        Amf0Value::Object(information) => information,
        _ => HashMap::new(),
    };
    information.insert(
        "objectEncoding".to_string(),
        Amf0Value::Number(object_encoding),
    );
    information.insert("data".to_string(), Amf0Value::Object(data));

    (Amf0Value::Object(properties), Amf0Value::Object(information))
}
