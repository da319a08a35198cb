//! Gateway glue between ingest sessions and the SFU side
//!
//! Authenticates stream keys against the configured streams, creates or
//! resumes producers, and routes demuxed media into them.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::modules::codec::{AudioSpecificConfig, AvcDecoderConfigurationRecord};
use crate::modules::rtmp::registry::StreamRegistry;
use crate::modules::rtmp::{ConnectionId, SessionEvents};
use crate::modules::sfu::{CreationState, MediaProducer, SignalingCommand};
use crate::settings::StreamDescriptor;

pub struct Gateway {
    streams: Vec<Arc<StreamDescriptor>>,
    registry: StreamRegistry,
    signaling: mpsc::UnboundedSender<SignalingCommand>,
}

impl Gateway {
    pub fn new(
        streams: Vec<Arc<StreamDescriptor>>,
        registry: StreamRegistry,
        signaling: mpsc::UnboundedSender<SignalingCommand>,
    ) -> Self {
        Gateway {
            streams,
            registry,
            signaling,
        }
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    fn find_stream(&self, stream_key: &str) -> Option<Arc<StreamDescriptor>> {
        self.streams
            .iter()
            .find(|s| s.stream_key == stream_key)
            .cloned()
    }

    fn signal(&self, command: SignalingCommand) {
        if self.signaling.send(command).is_err() {
            log::warn!("Signaling task is gone, dropping command");
        }
    }
}

impl SessionEvents for Gateway {
    async fn on_stream_key(&self, id: ConnectionId, stream_key: &str) -> bool {
        let Some(descriptor) = self.find_stream(stream_key) else {
            log::warn!("{}: unknown stream key {}", id, stream_key);
            return false;
        };

        if !self.registry.activate(stream_key, id).await {
            log::warn!("{}: stream key {} is already publishing", id, stream_key);
            return false;
        }

        if self.registry.producer(stream_key).await.is_some() {
            self.signal(SignalingCommand::Resume(stream_key.to_string()));
            return true;
        }

        let producer = MediaProducer::new(descriptor);
        let needs_negotiation = producer.state() != CreationState::None;
        if self.registry.insert_producer(producer).await && needs_negotiation {
            self.signal(SignalingCommand::Enqueue(stream_key.to_string()));
        }
        true
    }

    async fn on_closed(&self, id: ConnectionId, stream_key: Option<&str>) {
        if let Some(stream_key) = stream_key {
            if self.registry.owner(stream_key).await == Some(id) {
                self.signal(SignalingCommand::Pause(stream_key.to_string()));
            }
        }
        self.registry.release(id).await;
    }

    async fn on_video_config(&self, stream_key: &str, config: &AvcDecoderConfigurationRecord) {
        log::info!(
            "{}: AVC profile {} level {}, {}-byte NAL lengths",
            stream_key,
            config.profile_indication,
            config.level_indication,
            config.nal_length_size()
        );
        for sps in &config.sequence_parameter_sets {
            log::debug!("{}: SPS {}", stream_key, hex::encode(sps));
        }
        for pps in &config.picture_parameter_sets {
            log::debug!("{}: PPS {}", stream_key, hex::encode(pps));
        }
    }

    async fn on_audio_config(&self, stream_key: &str, config: &AudioSpecificConfig) {
        let Some(slot) = self.registry.producer(stream_key).await else {
            return;
        };
        let mut producer = slot.lock().await;
        if let Err(e) = producer.configure_audio(config) {
            log::error!("{}: cannot transcode audio: {}", stream_key, e);
        }
    }

    async fn on_video_data(&self, stream_key: &str, nal: &[u8], _timestamp: u32) {
        let Some(slot) = self.registry.producer(stream_key).await else {
            return;
        };
        let mut producer = slot.lock().await;
        if let Err(e) = producer.send_video(nal).await {
            log::warn!("{}: video relay failed: {}", stream_key, e);
        }
    }

    async fn on_audio_data(&self, stream_key: &str, aac: &[u8], timestamp: u32) {
        let Some(slot) = self.registry.producer(stream_key).await else {
            return;
        };
        let mut producer = slot.lock().await;
        if let Err(e) = producer.send_audio(aac, timestamp).await {
            log::warn!("{}: audio relay failed: {}", stream_key, e);
        }
    }
}
