//! AVC decoder configuration record (ISO/IEC 14496-15 `avcC`)
//!
//! Carried in the FLV video tag with `AVCPacketType` 0. The only field the
//! relay path needs is the NAL length-prefix width; the parameter sets are
//! kept for diagnostics.

use super::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcDecoderConfigurationRecord {
    pub configuration_version: u8,
    pub profile_indication: u8,
    pub profile_compatibility: u8,
    pub level_indication: u8,
    pub length_size_minus_one: u8,
    pub sequence_parameter_sets: Vec<Vec<u8>>,
    pub picture_parameter_sets: Vec<Vec<u8>>,
    /// Trailer present only for the High profile family
    pub high_profile: Option<HighProfileExtension>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighProfileExtension {
    pub chroma_format: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub sequence_parameter_set_ext: Vec<Vec<u8>>,
}

/// `profile_idc` values whose records may carry [`HighProfileExtension`]
const HIGH_PROFILES: [u8; 4] = [100, 110, 122, 144];

impl AvcDecoderConfigurationRecord {
    /// Parse a complete record. The input must end exactly after the last PPS,
    /// or after the High profile trailer when the profile allows one.
    pub fn parse(data: &[u8]) -> Result<Self, ConfigError> {
        let mut parser = RecordParser::new(data);

        let configuration_version = parser.read_u8()?;
        let profile_indication = parser.read_u8()?;
        let profile_compatibility = parser.read_u8()?;
        let level_indication = parser.read_u8()?;
        let length_size_minus_one = parser.read_u8()? & 0x03;

        let sps_count = parser.read_u8()? & 0x1F;
        let sequence_parameter_sets = parser.read_parameter_sets(sps_count)?;

        let pps_count = parser.read_u8()?;
        let picture_parameter_sets = parser.read_parameter_sets(pps_count)?;

        // older muxers omit the trailer even for High profile
        let high_profile = if HIGH_PROFILES.contains(&profile_indication) && !parser.is_empty() {
            let chroma_format = parser.read_u8()? & 0x03;
            let bit_depth_luma_minus8 = parser.read_u8()? & 0x07;
            let bit_depth_chroma_minus8 = parser.read_u8()? & 0x07;
            let sps_ext_count = parser.read_u8()?;
            Some(HighProfileExtension {
                chroma_format,
                bit_depth_luma_minus8,
                bit_depth_chroma_minus8,
                sequence_parameter_set_ext: parser.read_parameter_sets(sps_ext_count)?,
            })
        } else {
            None
        };

        parser.finish()?;

        Ok(AvcDecoderConfigurationRecord {
            configuration_version,
            profile_indication,
            profile_compatibility,
            level_indication,
            length_size_minus_one,
            sequence_parameter_sets,
            picture_parameter_sets,
            high_profile,
        })
    }

    /// Width in bytes (1-4) of the length prefix in front of each NAL unit
    pub fn nal_length_size(&self) -> usize {
        self.length_size_minus_one as usize + 1
    }
}

struct RecordParser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> RecordParser<'a> {
    fn new(data: &'a [u8]) -> Self {
        RecordParser { data, position: 0 }
    }

    fn read(&mut self, length: usize) -> Result<&'a [u8], ConfigError> {
        let available = self.data.len() - self.position;
        if length > available {
            return Err(ConfigError::Truncated {
                offset: self.position,
                needed: length,
                available,
            });
        }
        let result = &self.data[self.position..self.position + length];
        self.position += length;
        Ok(result)
    }

    fn read_u8(&mut self) -> Result<u8, ConfigError> {
        Ok(self.read(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ConfigError> {
        let bytes = self.read(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_parameter_sets(&mut self, count: u8) -> Result<Vec<Vec<u8>>, ConfigError> {
        let mut sets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let length = self.read_u16()? as usize;
            sets.push(self.read(length)?.to_vec());
        }
        Ok(sets)
    }

    fn is_empty(&self) -> bool {
        self.position == self.data.len()
    }

    fn finish(&self) -> Result<(), ConfigError> {
        match self.data.len() - self.position {
            0 => Ok(()),
            trailing => Err(ConfigError::TrailingData(trailing)),
        }
    }
}
