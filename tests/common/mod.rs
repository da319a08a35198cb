#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use rml_amf0::Amf0Value;
use rml_rtmp::chunk_io::{ChunkDeserializer, ChunkSerializer};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::messages::{MessagePayload, RtmpMessage};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Baseline profile record with one SPS and one PPS, 4-byte NAL lengths
pub const AVC_RECORD: &str = "0142c01effe1000a6742c01e95a0280f684001000468ce3c80";

/// Minimal encoder side of an RTMP connection
pub struct TestClient<S> {
    io: S,
    serializer: ChunkSerializer,
    deserializer: ChunkDeserializer,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestClient<S> {
    pub async fn handshake(mut io: S) -> Self {
        let mut handshake = Handshake::new(PeerType::Client);
        let p0_and_p1 = handshake.generate_outbound_p0_and_p1().unwrap();
        io.write_all(&p0_and_p1).await.unwrap();

        let mut buf = [0u8; 4096];
        loop {
            let n = io.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed during handshake");
            match handshake.process_bytes(&buf[..n]).unwrap() {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    io.write_all(&response_bytes).await.unwrap();
                }
                HandshakeProcessResult::Completed { response_bytes, .. } => {
                    io.write_all(&response_bytes).await.unwrap();
                    break;
                }
            }
        }

        TestClient {
            io,
            serializer: ChunkSerializer::new(),
            deserializer: ChunkDeserializer::new(),
        }
    }

    pub async fn send(&mut self, message: RtmpMessage, stream_id: u32, timestamp: u32) {
        let payload = message
            .into_message_payload(RtmpTimestamp::new(timestamp), stream_id)
            .unwrap();
        let packet = self.serializer.serialize(&payload, false, false).unwrap();
        self.io.write_all(&packet.bytes).await.unwrap();
    }

    pub async fn command(&mut self, name: &str, transaction_id: f64, arguments: Vec<Amf0Value>) {
        self.command_on(name, transaction_id, Amf0Value::Null, arguments, 0)
            .await;
    }

    pub async fn command_on(
        &mut self,
        name: &str,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_arguments: Vec<Amf0Value>,
        stream_id: u32,
    ) {
        let message = RtmpMessage::Amf0Command {
            command_name: name.to_string(),
            transaction_id,
            command_object,
            additional_arguments,
        };
        self.send(message, stream_id, 0).await;
    }

    pub async fn connect(&mut self) {
        let mut object = HashMap::new();
        object.insert("app".to_string(), Amf0Value::Utf8String("live".to_string()));
        object.insert("objectEncoding".to_string(), Amf0Value::Number(0.0));
        self.command_on("connect", 1.0, Amf0Value::Object(object), vec![], 0)
            .await;
    }

    pub async fn video(&mut self, tag: Vec<u8>, timestamp: u32) {
        self.send(RtmpMessage::VideoData { data: tag.into() }, 1, timestamp)
            .await;
    }

    pub async fn audio(&mut self, tag: Vec<u8>, timestamp: u32) {
        self.send(RtmpMessage::AudioData { data: tag.into() }, 1, timestamp)
            .await;
    }

    /// Next message from the server, or None once it hangs up
    pub async fn next_message(&mut self) -> Option<RtmpMessage> {
        if let Some(payload) = self.deserializer.get_next_message(&[]).unwrap() {
            return Some(self.apply(payload));
        }

        let mut buf = [0u8; 4096];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), self.io.read(&mut buf))
                .await
                .expect("timed out waiting for server")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
            if let Some(payload) = self.deserializer.get_next_message(&buf[..n]).unwrap() {
                return Some(self.apply(payload));
            }
        }
    }

    /// Skip messages until a command with `name` arrives
    pub async fn expect_command(&mut self, name: &str) -> (f64, Vec<Amf0Value>) {
        loop {
            match self.next_message().await {
                Some(RtmpMessage::Amf0Command {
                    command_name,
                    transaction_id,
                    additional_arguments,
                    ..
                }) if command_name == name => return (transaction_id, additional_arguments),
                Some(_) => continue,
                None => panic!("connection closed before {}", name),
            }
        }
    }

    /// Round-trip a `getStreamLength` so everything sent before it has been processed
    pub async fn sync(&mut self) {
        self.command("getStreamLength", 99.0, vec![]).await;
        loop {
            let (transaction_id, arguments) = self.expect_command("_result").await;
            if transaction_id == 99.0 {
                assert_eq!(arguments, vec![Amf0Value::Number(10.0)]);
                return;
            }
        }
    }

    fn apply(&mut self, payload: MessagePayload) -> RtmpMessage {
        let message = payload.to_rtmp_message().unwrap();
        if let RtmpMessage::SetChunkSize { size } = &message {
            self.deserializer.set_max_chunk_size(*size as usize).unwrap();
        }
        message
    }
}

pub fn string(value: &str) -> Amf0Value {
    Amf0Value::Utf8String(value.to_string())
}

pub fn avc_sequence_header() -> Vec<u8> {
    let mut tag = vec![0x17, 0x00, 0x00, 0x00, 0x00];
    tag.extend(hex::decode(AVC_RECORD).unwrap());
    tag
}

/// Inter frame carrying an AUD and a 3-byte slice
pub fn avc_nalu_tag() -> Vec<u8> {
    vec![
        0x27, 0x01, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x02, 0x09, 0xF0, //
        0x00, 0x00, 0x00, 0x03, 0x41, 0x9A, 0x02,
    ]
}
