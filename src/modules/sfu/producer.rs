//! Per-stream media producer
//!
//! Owns the negotiated transport endpoints, the RTP senders and the AAC to
//! Opus transcoder for one stream key. Its creation state only moves when the
//! signaling client applies an SFU response to it.

use std::sync::Arc;

use super::messages::{
    AppData, MediaKind, ProduceParameters, RtpParameters, SfuRequest, TransportEndpoint,
};
use crate::modules::codec::AudioSpecificConfig;
use crate::modules::rtp::{H264Sender, OpusSender, RtpError, SenderConfig};
use crate::modules::transcode::{TranscodeError, Transcoder, MAX_OPUS_PACKET_SIZE};
use crate::settings::StreamDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationState {
    /// No media enabled; never negotiated
    None,
    CreatingVideo,
    CreatingAudio,
    Created,
}

/// What the signaling client should do after a producer-created response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerProgress {
    /// Video leg done, audio leg needs its own transport
    NeedAudioTransport,
    /// All legs done; this producer leaves the queue
    Created,
    /// Response did not apply to the current state
    Ignored,
}

pub struct MediaProducer {
    descriptor: Arc<StreamDescriptor>,
    state: CreationState,
    video_endpoint: Option<TransportEndpoint>,
    audio_endpoint: Option<TransportEndpoint>,
    video_producer_id: Option<String>,
    audio_producer_id: Option<String>,
    video_sender: Option<H264Sender>,
    audio_sender: Option<OpusSender>,
    transcoder: Option<Transcoder>,
    opus_buffer: Vec<u8>,
}

impl MediaProducer {
    pub fn new(descriptor: Arc<StreamDescriptor>) -> Self {
        let state = if descriptor.video.is_some() {
            CreationState::CreatingVideo
        } else if descriptor.audio.is_some() {
            CreationState::CreatingAudio
        } else {
            CreationState::None
        };

        MediaProducer {
            descriptor,
            state,
            video_endpoint: None,
            audio_endpoint: None,
            video_producer_id: None,
            audio_producer_id: None,
            video_sender: None,
            audio_sender: None,
            transcoder: None,
            opus_buffer: vec![0u8; MAX_OPUS_PACKET_SIZE],
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.descriptor.stream_key
    }

    pub fn state(&self) -> CreationState {
        self.state
    }

    pub fn endpoint(&self, kind: MediaKind) -> Option<&TransportEndpoint> {
        match kind {
            MediaKind::Video => self.video_endpoint.as_ref(),
            MediaKind::Audio => self.audio_endpoint.as_ref(),
        }
    }

    pub fn producer_id(&self, kind: MediaKind) -> Option<&str> {
        match kind {
            MediaKind::Video => self.video_producer_id.as_deref(),
            MediaKind::Audio => self.audio_producer_id.as_deref(),
        }
    }

    /// SSRC registered with the SFU; 0 when no sender could be opened
    pub fn ssrc(&self, kind: MediaKind) -> u32 {
        match kind {
            MediaKind::Video => self.video_sender.as_ref().map_or(0, H264Sender::ssrc),
            MediaKind::Audio => self.audio_sender.as_ref().map_or(0, OpusSender::ssrc),
        }
    }

    /// Record the transport for the leg being created, open its sender and
    /// build the matching produce request.
    pub async fn on_transport_created(
        &mut self,
        endpoint: TransportEndpoint,
        app_name: &str,
    ) -> Option<SfuRequest> {
        let kind = match self.state {
            CreationState::CreatingVideo => MediaKind::Video,
            CreationState::CreatingAudio => MediaKind::Audio,
            state => {
                log::warn!(
                    "Transport {} for {} arrived in state {:?}",
                    endpoint.id,
                    self.stream_key(),
                    state
                );
                return None;
            }
        };

        let transport_id = endpoint.id.clone();
        log::info!(
            "{} {} transport {} -> {}:{}",
            self.stream_key(),
            kind,
            transport_id,
            endpoint.ip,
            endpoint.port
        );

        let rtp_parameters = match kind {
            MediaKind::Video => {
                if let Err(e) = self.open_video(&endpoint).await {
                    log::error!("Failed to open video sender for {}: {}", self.stream_key(), e);
                }
                self.video_endpoint = Some(endpoint);
                let codec = self.descriptor.video.as_ref()?;
                RtpParameters::video(codec, self.ssrc(MediaKind::Video))
            }
            MediaKind::Audio => {
                if let Err(e) = self.open_audio(&endpoint).await {
                    log::error!("Failed to open audio sender for {}: {}", self.stream_key(), e);
                }
                self.audio_endpoint = Some(endpoint);
                let codec = self.descriptor.audio.as_ref()?;
                RtpParameters::audio(codec, self.ssrc(MediaKind::Audio))
            }
        };

        Some(SfuRequest::Produce {
            id: transport_id,
            parameters: ProduceParameters {
                kind,
                rtp_parameters,
                app_data: AppData {
                    name: app_name.to_string(),
                },
            },
        })
    }

    pub fn on_producer_created(&mut self, producer_id: String) -> ProducerProgress {
        match self.state {
            CreationState::CreatingVideo => {
                self.video_producer_id = Some(producer_id);
                if self.descriptor.audio.is_some() {
                    self.state = CreationState::CreatingAudio;
                    ProducerProgress::NeedAudioTransport
                } else {
                    self.state = CreationState::Created;
                    ProducerProgress::Created
                }
            }
            CreationState::CreatingAudio => {
                self.audio_producer_id = Some(producer_id);
                self.state = CreationState::Created;
                ProducerProgress::Created
            }
            state => {
                log::warn!(
                    "Producer {} for {} arrived in state {:?}",
                    producer_id,
                    self.stream_key(),
                    state
                );
                ProducerProgress::Ignored
            }
        }
    }

    pub fn pause_requests(&self) -> Vec<SfuRequest> {
        self.assigned_producer_ids()
            .map(|id| SfuRequest::PauseProducer {
                producer_id: id.to_string(),
            })
            .collect()
    }

    pub fn resume_requests(&self) -> Vec<SfuRequest> {
        self.assigned_producer_ids()
            .map(|id| SfuRequest::ResumeProducer {
                producer_id: id.to_string(),
            })
            .collect()
    }

    fn assigned_producer_ids(&self) -> impl Iterator<Item = &str> {
        self.video_producer_id
            .as_deref()
            .into_iter()
            .chain(self.audio_producer_id.as_deref())
    }

    async fn open_video(&mut self, endpoint: &TransportEndpoint) -> Result<(), RtpError> {
        let Some(codec) = self.descriptor.video.as_ref() else {
            return Ok(());
        };

        let config = SenderConfig {
            destination_ip: endpoint.ip.clone(),
            destination_port: endpoint.port,
            payload_type: codec.payload_type,
            clock_rate: codec.clock_rate,
            port_base: 0,
        };
        self.video_sender = Some(H264Sender::open(&config).await?);
        Ok(())
    }

    async fn open_audio(&mut self, endpoint: &TransportEndpoint) -> Result<(), RtpError> {
        let Some(codec) = self.descriptor.audio.as_ref() else {
            return Ok(());
        };

        let config = SenderConfig {
            destination_ip: endpoint.ip.clone(),
            destination_port: endpoint.port,
            payload_type: codec.payload_type,
            clock_rate: codec.clock_rate,
            port_base: 0,
        };
        self.audio_sender = Some(OpusSender::open(&config).await?);
        Ok(())
    }

    /// Relay one NAL unit; dropped until the video sender is open
    pub async fn send_video(&mut self, nal: &[u8]) -> Result<usize, RtpError> {
        match self.video_sender.as_mut() {
            Some(sender) => sender.send(nal).await,
            None => Ok(0),
        }
    }

    /// (Re)build the transcoder for a new AAC sequence header
    pub fn configure_audio(&mut self, config: &AudioSpecificConfig) -> Result<(), TranscodeError> {
        self.transcoder = None;
        self.transcoder = Some(Transcoder::new(config)?);
        Ok(())
    }

    /// Transcode one raw AAC frame and relay every complete Opus frame.
    /// Returns the number of Opus frames sent.
    pub async fn send_audio(&mut self, aac: &[u8], timestamp: u32) -> Result<usize, AudioError> {
        let (Some(transcoder), Some(sender)) = (self.transcoder.as_mut(), self.audio_sender.as_mut())
        else {
            return Ok(0);
        };

        transcoder.decode(aac)?;

        let mut frames = 0;
        while let Some(len) = transcoder.encode(&mut self.opus_buffer)? {
            sender.send(&self.opus_buffer[..len]).await?;
            frames += 1;
        }
        log::trace!(
            "{}: {} Opus frame(s) for AAC at {} ms",
            self.descriptor.stream_key,
            frames,
            timestamp
        );
        Ok(frames)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error(transparent)]
    Rtp(#[from] RtpError),
}
