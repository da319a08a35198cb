//! AAC to Opus bridge
//!
//! AAC frames carry 1024 (LC) or 2048 (HE) samples per channel while Opus is
//! fed fixed 960-sample frames, so decoded PCM is staged in an interleaved
//! buffer and drained one Opus frame at a time.

use thiserror::Error;

use super::codec::AudioSpecificConfig;
use super::rtp::opus::OPUS_FRAME_SIZE;

/// Largest interleaved PCM frame the AAC decoder may emit
const MAX_DECODE_BUFFER_SIZE: usize = 10 * 1024;

/// Target Opus bitrate in bits per second
pub const OPUS_BITRATE: i32 = 64000;

/// Upper bound for one encoded Opus frame
pub const MAX_OPUS_PACKET_SIZE: usize = 20 * 1024;

const ADTS_HEADER_LEN: usize = 7;

/// `frame_length` is a 13-bit field covering header and payload
const MAX_ADTS_FRAME_LEN: usize = (1 << 13) - 1;

/// Indices above this are reserved or the explicit-rate escape
const MAX_ADTS_FREQUENCY_INDEX: u8 = 0xC;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("AAC decoder error: {0}")]
    Decoder(String),

    #[error("Opus encoder error: {0}")]
    Encoder(String),

    #[error("unsupported channel count {0}")]
    UnsupportedChannels(u8),

    #[error("AAC config not decodable: {0}")]
    UnsupportedConfig(String),
}

/// Compressed-audio decoder producing interleaved 16-bit PCM
pub trait PcmDecoder: Send {
    /// Queue compressed input
    fn fill(&mut self, data: &[u8]) -> Result<(), TranscodeError>;

    /// Decode the next frame into `pcm`, returning the interleaved sample
    /// count, or `None` once queued input is exhausted
    fn decode_frame(&mut self, pcm: &mut [i16]) -> Option<usize>;
}

/// Encoder consuming exactly one frame of interleaved PCM per call
pub trait FrameEncoder: Send {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, TranscodeError>;
}

/// ADTS fixed header fields for one AAC stream.
///
/// FLV carries bare access units; the decoder is opened in ADTS mode, so each
/// unit is framed with a 7-byte header (no CRC) built from the stream config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    profile: u8,
    frequency_index: u8,
    channel_configuration: u8,
}

impl AdtsHeader {
    pub fn from_config(config: &AudioSpecificConfig) -> Result<Self, TranscodeError> {
        // ADTS has a 2-bit profile (object type - 1) and no escape for an
        // explicit sampling rate or a PCE-only channel layout
        if !(1..=4).contains(&config.audio_object_type) {
            return Err(TranscodeError::UnsupportedConfig(format!(
                "object type {}",
                config.audio_object_type
            )));
        }
        if config.frequency_index > MAX_ADTS_FREQUENCY_INDEX {
            return Err(TranscodeError::UnsupportedConfig(format!(
                "sampling frequency index {}",
                config.frequency_index
            )));
        }
        if !(1..=7).contains(&config.channel_configuration) {
            return Err(TranscodeError::UnsupportedConfig(format!(
                "channel configuration {}",
                config.channel_configuration
            )));
        }

        Ok(AdtsHeader {
            profile: config.audio_object_type - 1,
            frequency_index: config.frequency_index,
            channel_configuration: config.channel_configuration,
        })
    }

    /// Append the header for a frame carrying `payload_len` bytes
    pub fn write(&self, payload_len: usize, out: &mut Vec<u8>) -> Result<(), TranscodeError> {
        let frame_len = payload_len + ADTS_HEADER_LEN;
        if frame_len > MAX_ADTS_FRAME_LEN {
            return Err(TranscodeError::Decoder(format!(
                "access unit of {} bytes does not fit an ADTS frame",
                payload_len
            )));
        }

        out.extend_from_slice(&[
            0xFF,
            0xF1,
            (self.profile << 6) | (self.frequency_index << 2) | (self.channel_configuration >> 2),
            ((self.channel_configuration & 0x03) << 6) | (frame_len >> 11) as u8,
            (frame_len >> 3) as u8,
            ((frame_len & 0x07) << 5) as u8 | 0x1F,
            // buffer fullness 0x7FF (VBR), one raw data block
            0xFC,
        ]);
        Ok(())
    }
}

/// AAC decoder fed raw access units
pub struct FdkAacDecoder {
    decoder: fdk_aac::dec::Decoder,
    header: AdtsHeader,
    frame: Vec<u8>,
}

impl FdkAacDecoder {
    pub fn new(config: &AudioSpecificConfig) -> Result<Self, TranscodeError> {
        let header = AdtsHeader::from_config(config)?;
        Ok(FdkAacDecoder {
            decoder: fdk_aac::dec::Decoder::new(fdk_aac::dec::Transport::Adts),
            header,
            frame: Vec::new(),
        })
    }
}

impl PcmDecoder for FdkAacDecoder {
    fn fill(&mut self, data: &[u8]) -> Result<(), TranscodeError> {
        if data.is_empty() {
            return Ok(());
        }

        self.frame.clear();
        self.header.write(data.len(), &mut self.frame)?;
        self.frame.extend_from_slice(data);

        let consumed = self
            .decoder
            .fill(&self.frame)
            .map_err(|e| TranscodeError::Decoder(e.to_string()))?;
        if consumed < self.frame.len() {
            return Err(TranscodeError::Decoder(format!(
                "decoder input full, {} of {} bytes queued",
                consumed,
                self.frame.len()
            )));
        }
        Ok(())
    }

    fn decode_frame(&mut self, pcm: &mut [i16]) -> Option<usize> {
        match self.decoder.decode_frame(pcm) {
            Ok(()) => Some(self.decoder.decoded_frame_size()),
            // NotEnoughBits and friends all mean nothing more to drain
            Err(_) => None,
        }
    }
}

pub struct OpusFrameEncoder {
    encoder: opus::Encoder,
}

impl OpusFrameEncoder {
    pub fn new(sample_rate: u32, channels: u8) -> Result<Self, TranscodeError> {
        let channels = match channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            n => return Err(TranscodeError::UnsupportedChannels(n)),
        };

        let mut encoder = opus::Encoder::new(sample_rate, channels, opus::Application::Audio)
            .map_err(|e| TranscodeError::Encoder(format!("Failed to create Opus encoder: {}", e)))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(OPUS_BITRATE))
            .map_err(|e| TranscodeError::Encoder(format!("Failed to set bitrate: {}", e)))?;

        Ok(OpusFrameEncoder { encoder })
    }
}

impl FrameEncoder for OpusFrameEncoder {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, TranscodeError> {
        self.encoder
            .encode(pcm, out)
            .map_err(|e| TranscodeError::Encoder(e.to_string()))
    }
}

pub struct Transcoder<D = FdkAacDecoder, E = OpusFrameEncoder> {
    decoder: D,
    encoder: E,
    channels: usize,
    frame_size: usize,
    buffer: Vec<i16>,
}

impl Transcoder {
    /// Build an AAC decoder and matching Opus encoder from a parsed config.
    ///
    /// SBR streams decode at the extension rate and PS streams always decode
    /// to stereo, so the encoder follows the decoder's output, not the core.
    pub fn new(config: &AudioSpecificConfig) -> Result<Self, TranscodeError> {
        let sample_rate = if config.sbr_present && config.extension_frequency != 0 {
            config.extension_frequency
        } else {
            config.frequency
        };
        let channels = if config.ps_present { 2 } else { config.channels() };

        let decoder = FdkAacDecoder::new(config)?;
        let encoder = OpusFrameEncoder::new(sample_rate, channels)?;

        log::debug!(
            "AAC->Opus transcoder: {} Hz, {} channel(s), {} bps",
            sample_rate,
            channels,
            OPUS_BITRATE
        );
        Ok(Transcoder::with_codecs(decoder, encoder, channels as usize))
    }
}

impl<D: PcmDecoder, E: FrameEncoder> Transcoder<D, E> {
    pub fn with_codecs(decoder: D, encoder: E, channels: usize) -> Self {
        Transcoder {
            decoder,
            encoder,
            channels,
            frame_size: OPUS_FRAME_SIZE as usize,
            buffer: Vec::new(),
        }
    }

    /// Feed compressed data and buffer every fully decoded PCM frame
    pub fn decode(&mut self, data: &[u8]) -> Result<(), TranscodeError> {
        self.decoder.fill(data)?;

        let mut pcm = vec![0i16; MAX_DECODE_BUFFER_SIZE];
        while let Some(samples) = self.decoder.decode_frame(&mut pcm) {
            if samples == 0 {
                break;
            }
            self.buffer
                .extend_from_slice(&pcm[..samples.min(MAX_DECODE_BUFFER_SIZE)]);
        }
        Ok(())
    }

    /// Encode one frame from the front of the buffer.
    ///
    /// Returns `Ok(None)` without touching the buffer when less than a full
    /// frame is available. A frame the encoder rejects is discarded.
    pub fn encode(&mut self, out: &mut [u8]) -> Result<Option<usize>, TranscodeError> {
        let needed = self.frame_size * self.channels;
        if self.buffer.len() < needed {
            return Ok(None);
        }

        let result = self.encoder.encode(&self.buffer[..needed], out);
        self.buffer.drain(..needed);
        result.map(Some)
    }

    /// Interleaved samples waiting for the next frame
    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }
}
