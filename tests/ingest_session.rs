mod common;

use std::sync::{Arc, Mutex};

use common::{avc_nalu_tag, avc_sequence_header, string, TestClient};
use rml_amf0::Amf0Value;
use rml_rtmp::messages::RtmpMessage;
use rtmp_sfu_gateway::modules::codec::{AudioSpecificConfig, AvcDecoderConfigurationRecord};
use rtmp_sfu_gateway::modules::rtmp::session::{IngestSession, SessionError, SessionEvents};
use rtmp_sfu_gateway::ConnectionId;
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    StreamKey(String),
    Closed(Option<String>),
    VideoConfig(usize),
    AudioConfig(u32, u8),
    Video(Vec<u8>, u32),
    Audio(Vec<u8>, u32),
}

struct Recorder {
    allowed: Vec<String>,
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl SessionEvents for Recorder {
    async fn on_stream_key(&self, _id: ConnectionId, stream_key: &str) -> bool {
        self.record(Event::StreamKey(stream_key.to_string()));
        self.allowed.iter().any(|k| k == stream_key)
    }

    async fn on_closed(&self, _id: ConnectionId, stream_key: Option<&str>) {
        self.record(Event::Closed(stream_key.map(str::to_string)));
    }

    async fn on_video_config(&self, _stream_key: &str, config: &AvcDecoderConfigurationRecord) {
        self.record(Event::VideoConfig(config.nal_length_size()));
    }

    async fn on_audio_config(&self, _stream_key: &str, config: &AudioSpecificConfig) {
        self.record(Event::AudioConfig(config.frequency, config.channels()));
    }

    async fn on_video_data(&self, _stream_key: &str, nal: &[u8], timestamp: u32) {
        self.record(Event::Video(nal.to_vec(), timestamp));
    }

    async fn on_audio_data(&self, _stream_key: &str, aac: &[u8], timestamp: u32) {
        self.record(Event::Audio(aac.to_vec(), timestamp));
    }
}

struct Harness {
    events: Arc<Recorder>,
    stop: watch::Sender<bool>,
    session: JoinHandle<Result<(), SessionError>>,
}

fn spawn_session(allowed: &[&str]) -> (Harness, DuplexStream) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (stop, stop_rx) = watch::channel(false);
    let events = Arc::new(Recorder {
        allowed: allowed.iter().map(|k| k.to_string()).collect(),
        events: Mutex::new(Vec::new()),
    });
    let session = IngestSession::new(ConnectionId(1), server_io, events.clone(), stop_rx);
    let harness = Harness {
        events,
        stop,
        session: tokio::spawn(session.run()),
    };
    (harness, client_io)
}

async fn connected_client(allowed: &[&str]) -> (Harness, TestClient<DuplexStream>) {
    let (harness, io) = spawn_session(allowed);
    let mut client = TestClient::handshake(io).await;
    client.connect().await;
    client.expect_command("_result").await;
    (harness, client)
}

#[tokio::test]
async fn test_connect_reply_sequence() {
    let (_harness, io) = spawn_session(&[]);
    let mut client = TestClient::handshake(io).await;
    client.connect().await;

    assert!(matches!(
        client.next_message().await,
        Some(RtmpMessage::WindowAcknowledgement { size: 2_500_000 })
    ));
    assert!(matches!(
        client.next_message().await,
        Some(RtmpMessage::SetPeerBandwidth { size: 2_500_000, .. })
    ));
    assert!(matches!(
        client.next_message().await,
        Some(RtmpMessage::SetChunkSize { size: 4096 })
    ));

    let Some(RtmpMessage::Amf0Command {
        command_name,
        transaction_id,
        command_object,
        additional_arguments,
    }) = client.next_message().await
    else {
        panic!("expected connect result");
    };
    assert_eq!(command_name, "_result");
    assert_eq!(transaction_id, 1.0);

    let Amf0Value::Object(properties) = command_object else {
        panic!("expected properties object");
    };
    assert_eq!(properties["fmsVer"], string("FMS/3,5,1,525"));
    assert_eq!(properties["capabilities"], Amf0Value::Number(31.0));

    let Some(Amf0Value::Object(information)) = additional_arguments.first() else {
        panic!("expected information object");
    };
    assert_eq!(information["code"], string("NetConnection.Connect.Success"));
    assert_eq!(information["objectEncoding"], Amf0Value::Number(0.0));
}

#[tokio::test]
async fn test_publish_and_demux() {
    let (harness, mut client) = connected_client(&["alice"]).await;

    client.command("releaseStream", 2.0, vec![string("alice")]).await;
    client.command("FCPublish", 3.0, vec![string("alice")]).await;
    let (_, arguments) = client.expect_command("onFCPublish").await;
    let Some(Amf0Value::Object(info)) = arguments.first() else {
        panic!("expected status object");
    };
    assert_eq!(info["code"], string("NetStream.Publish.Start"));

    client.command("createStream", 4.0, vec![]).await;
    let (transaction_id, arguments) = client.expect_command("_result").await;
    assert_eq!(transaction_id, 4.0);
    assert_eq!(arguments, vec![Amf0Value::Number(1.0)]);

    client
        .command_on(
            "publish",
            5.0,
            Amf0Value::Null,
            vec![string("alice"), string("live")],
            1,
        )
        .await;
    let (transaction_id, arguments) = client.expect_command("_result").await;
    assert_eq!(transaction_id, 5.0);
    assert_eq!(arguments, vec![Amf0Value::Number(2.0)]);
    client.expect_command("onStatus").await;

    client.video(avc_sequence_header(), 0).await;
    client.video(avc_nalu_tag(), 40).await;
    // end of sequence is a no-op
    client.video(vec![0x17, 0x02, 0, 0, 0], 80).await;

    client.audio(vec![0xAF, 0x00, 0x12, 0x10], 0).await;
    client.audio(vec![0xAF, 0x01, 0x21, 0x00, 0x49], 23).await;
    // MP3 is dropped
    client.audio(vec![0x2F, 0xFF, 0xFB], 46).await;
    client.sync().await;

    assert_eq!(
        harness.events.events(),
        vec![
            Event::StreamKey("alice".to_string()),
            Event::VideoConfig(4),
            Event::Video(vec![0x09, 0xF0], 40),
            Event::Video(vec![0x41, 0x9A, 0x02], 40),
            Event::AudioConfig(44100, 2),
            Event::Audio(vec![0x21, 0x00, 0x49], 23),
        ]
    );

    drop(client);
    harness.session.await.unwrap().unwrap();
    assert_eq!(
        harness.events.events().last(),
        Some(&Event::Closed(Some("alice".to_string())))
    );
}

#[tokio::test]
async fn test_rejected_key_closes_session() {
    let (harness, mut client) = connected_client(&["alice"]).await;

    client.command("FCPublish", 2.0, vec![string("mallory")]).await;
    assert!(client.next_message().await.is_none());

    let result = harness.session.await.unwrap();
    assert!(matches!(result, Err(SessionError::Rejected(key)) if key == "mallory"));
    assert_eq!(
        harness.events.events(),
        vec![Event::StreamKey("mallory".to_string()), Event::Closed(None)]
    );
}

#[tokio::test]
async fn test_second_stream_key_closes_session() {
    let (harness, mut client) = connected_client(&["alice", "bob"]).await;

    client.command("FCPublish", 2.0, vec![string("alice")]).await;
    client.expect_command("onFCPublish").await;

    // repeating the key is not a second authentication
    client
        .command_on("publish", 3.0, Amf0Value::Null, vec![string("alice")], 1)
        .await;
    client.expect_command("onStatus").await;

    client.command("FCPublish", 4.0, vec![string("bob")]).await;
    assert!(client.next_message().await.is_none());

    let result = harness.session.await.unwrap();
    assert!(matches!(
        result,
        Err(SessionError::KeyChanged { current, requested }) if current == "alice" && requested == "bob"
    ));
    assert_eq!(
        harness.events.events(),
        vec![
            Event::StreamKey("alice".to_string()),
            Event::Closed(Some("alice".to_string())),
        ]
    );
}

#[tokio::test]
async fn test_media_dropped_until_authenticated_and_configured() {
    let (harness, mut client) = connected_client(&["alice"]).await;

    client.video(avc_sequence_header(), 0).await;
    client.audio(vec![0xAF, 0x01, 0x21, 0x00], 0).await;

    // publish without FCPublish authenticates on publish
    client
        .command_on("publish", 2.0, Amf0Value::Null, vec![string("alice")], 1)
        .await;
    client.expect_command("onStatus").await;

    // the sequence header above was discarded, so NAL lengths are unknown
    client.video(avc_nalu_tag(), 40).await;
    client.sync().await;

    assert_eq!(
        harness.events.events(),
        vec![Event::StreamKey("alice".to_string())]
    );
}

#[tokio::test]
async fn test_overrunning_nal_drops_rest_of_tag() {
    let (harness, mut client) = connected_client(&["alice"]).await;
    client.command("FCPublish", 2.0, vec![string("alice")]).await;
    client.expect_command("onFCPublish").await;

    client.video(avc_sequence_header(), 0).await;
    client
        .video(
            vec![
                0x27, 0x01, 0, 0, 0, //
                0, 0, 0, 1, 0x09, //
                0, 0, 0, 0x40, 0x41,
            ],
            10,
        )
        .await;
    client.sync().await;

    assert_eq!(
        harness.events.events(),
        vec![
            Event::StreamKey("alice".to_string()),
            Event::VideoConfig(4),
            Event::Video(vec![0x09], 10),
        ]
    );
}

#[tokio::test]
async fn test_acknowledges_peer_window() {
    let (_harness, mut client) = connected_client(&[]).await;

    client
        .send(RtmpMessage::WindowAcknowledgement { size: 64 }, 0, 0)
        .await;
    client.video(vec![0x17; 300], 0).await;

    loop {
        match client.next_message().await {
            Some(RtmpMessage::Acknowledgement { sequence_number }) => {
                assert!(sequence_number >= 300);
                break;
            }
            Some(_) => continue,
            None => panic!("session closed without acknowledging"),
        }
    }
}

#[tokio::test]
async fn test_stop_flag_ends_session() {
    let (harness, _client) = connected_client(&[]).await;

    harness.stop.send(true).unwrap();
    harness.session.await.unwrap().unwrap();
    assert_eq!(harness.events.events(), vec![Event::Closed(None)]);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout() {
    let (harness, _io) = spawn_session(&[]);

    let result = harness.session.await.unwrap();
    assert!(matches!(result, Err(SessionError::HandshakeTimeout)));
    assert_eq!(harness.events.events(), vec![Event::Closed(None)]);
}
