//! FLV tag demuxing for RTMP audio and video messages

use thiserror::Error;

/// SoundFormat value for AAC in the audio tag header
pub const SOUND_FORMAT_AAC: u8 = 10;
/// CodecID value for AVC in the video tag header
pub const VIDEO_CODEC_AVC: u8 = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("empty tag")]
    Empty,

    #[error("tag too short: {0} bytes")]
    TooShort(usize),

    #[error("unsupported sound format {0}")]
    UnsupportedSoundFormat(u8),

    #[error("unsupported video codec {0}")]
    UnsupportedVideoCodec(u8),

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("invalid NAL length size {0}")]
    InvalidLengthSize(usize),

    #[error("NAL length {length} at offset {offset} overruns tag of {available} bytes")]
    NalOverrun {
        offset: usize,
        length: usize,
        available: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioTag<'a> {
    /// AudioSpecificConfig bytes
    AacSequenceHeader(&'a [u8]),
    /// One raw AAC access unit
    AacRaw(&'a [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoTag<'a> {
    /// AVCDecoderConfigurationRecord bytes
    AvcSequenceHeader(&'a [u8]),
    /// Length-prefixed NAL units
    AvcNalu {
        composition_time: i32,
        data: &'a [u8],
    },
    AvcEndOfSequence,
}

pub fn parse_audio_tag(data: &[u8]) -> Result<AudioTag<'_>, TagError> {
    let header = *data.first().ok_or(TagError::Empty)?;
    let sound_format = header >> 4;
    if sound_format != SOUND_FORMAT_AAC {
        return Err(TagError::UnsupportedSoundFormat(sound_format));
    }
    if data.len() < 2 {
        return Err(TagError::TooShort(data.len()));
    }

    match data[1] {
        0 => Ok(AudioTag::AacSequenceHeader(&data[2..])),
        1 => Ok(AudioTag::AacRaw(&data[2..])),
        other => Err(TagError::UnknownPacketType(other)),
    }
}

pub fn parse_video_tag(data: &[u8]) -> Result<VideoTag<'_>, TagError> {
    let header = *data.first().ok_or(TagError::Empty)?;
    let codec_id = header & 0x0F;
    if codec_id != VIDEO_CODEC_AVC {
        return Err(TagError::UnsupportedVideoCodec(codec_id));
    }
    if data.len() < 5 {
        return Err(TagError::TooShort(data.len()));
    }

    // 24-bit signed composition time offset
    let raw = u32::from_be_bytes([0, data[2], data[3], data[4]]);
    let composition_time = ((raw << 8) as i32) >> 8;

    match data[1] {
        0 => Ok(VideoTag::AvcSequenceHeader(&data[5..])),
        1 => Ok(VideoTag::AvcNalu {
            composition_time,
            data: &data[5..],
        }),
        2 => Ok(VideoTag::AvcEndOfSequence),
        other => Err(TagError::UnknownPacketType(other)),
    }
}

/// Iterator over length-prefixed NAL units.
///
/// Yields an error once and then stops when a length prefix runs past the
/// end of the data.
pub struct NalUnits<'a> {
    data: &'a [u8],
    position: usize,
    length_size: usize,
    failed: bool,
}

impl<'a> NalUnits<'a> {
    pub fn new(data: &'a [u8], length_size: usize) -> Result<Self, TagError> {
        if !(1..=4).contains(&length_size) {
            return Err(TagError::InvalidLengthSize(length_size));
        }
        Ok(NalUnits {
            data,
            position: 0,
            length_size,
            failed: false,
        })
    }
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = Result<&'a [u8], TagError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.data.len() {
            return None;
        }

        let offset = self.position;
        let header_end = offset + self.length_size;
        if header_end > self.data.len() {
            self.failed = true;
            return Some(Err(TagError::NalOverrun {
                offset,
                length: self.length_size,
                available: self.data.len(),
            }));
        }

        let length = self.data[offset..header_end]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        let end = header_end + length;
        if end > self.data.len() {
            self.failed = true;
            return Some(Err(TagError::NalOverrun {
                offset,
                length,
                available: self.data.len(),
            }));
        }

        self.position = end;
        Some(Ok(&self.data[header_end..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_tags() {
        assert_eq!(
            parse_audio_tag(&[0xAF, 0x00, 0x12, 0x10]),
            Ok(AudioTag::AacSequenceHeader(&[0x12, 0x10]))
        );
        assert_eq!(
            parse_audio_tag(&[0xAF, 0x01, 0x21, 0x00]),
            Ok(AudioTag::AacRaw(&[0x21, 0x00]))
        );
        // MP3
        assert_eq!(
            parse_audio_tag(&[0x2F, 0x01]),
            Err(TagError::UnsupportedSoundFormat(2))
        );
        assert_eq!(parse_audio_tag(&[]), Err(TagError::Empty));
        assert_eq!(parse_audio_tag(&[0xAF]), Err(TagError::TooShort(1)));
    }

    #[test]
    fn test_video_tags() {
        assert_eq!(
            parse_video_tag(&[0x17, 0x00, 0, 0, 0, 0x01, 0x42]),
            Ok(VideoTag::AvcSequenceHeader(&[0x01, 0x42]))
        );
        assert_eq!(
            parse_video_tag(&[0x27, 0x01, 0x00, 0x00, 0x28, 0xAA]),
            Ok(VideoTag::AvcNalu {
                composition_time: 40,
                data: &[0xAA]
            })
        );
        assert_eq!(
            parse_video_tag(&[0x17, 0x01, 0xFF, 0xFF, 0xFF]),
            Ok(VideoTag::AvcNalu {
                composition_time: -1,
                data: &[]
            })
        );
        assert_eq!(
            parse_video_tag(&[0x17, 0x02, 0, 0, 0]),
            Ok(VideoTag::AvcEndOfSequence)
        );
        // VP6
        assert_eq!(
            parse_video_tag(&[0x14, 0x01, 0, 0, 0]),
            Err(TagError::UnsupportedVideoCodec(4))
        );
        assert_eq!(parse_video_tag(&[0x17, 0x01]), Err(TagError::TooShort(2)));
        assert_eq!(
            parse_video_tag(&[0x17, 0x05, 0, 0, 0]),
            Err(TagError::UnknownPacketType(5))
        );
    }

    #[test]
    fn test_nal_units_four_byte_lengths() {
        let data = [
            0, 0, 0, 2, 0x09, 0xF0, // AUD
            0, 0, 0, 3, 0x65, 0x88, 0x84, // IDR slice
        ];
        let units: Vec<_> = NalUnits::new(&data, 4)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(units, vec![&[0x09, 0xF0][..], &[0x65, 0x88, 0x84][..]]);
    }

    #[test]
    fn test_nal_units_short_lengths() {
        let data = [2, 0x41, 0x9A, 1, 0x41];
        let units: Vec<_> = NalUnits::new(&data, 1)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1], &[0x41]);
    }

    #[test]
    fn test_nal_overrun_stops_iteration() {
        let data = [0, 2, 0x09, 0xF0, 0, 9, 0x65];
        let mut units = NalUnits::new(&data, 2).unwrap();
        assert_eq!(units.next(), Some(Ok(&[0x09, 0xF0][..])));
        assert_eq!(
            units.next(),
            Some(Err(TagError::NalOverrun {
                offset: 4,
                length: 9,
                available: 7
            }))
        );
        assert_eq!(units.next(), None);
    }

    #[test]
    fn test_invalid_length_size() {
        assert!(matches!(
            NalUnits::new(&[], 0),
            Err(TagError::InvalidLengthSize(0))
        ));
        assert!(matches!(
            NalUnits::new(&[], 5),
            Err(TagError::InvalidLengthSize(5))
        ));
    }
}
