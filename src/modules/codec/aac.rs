//! AAC AudioSpecificConfig (ISO/IEC 14496-3 1.6.2.1)
//!
//! The config is a bit-packed structure, not byte aligned. Only the fields up
//! to the SBR/PS extension are decoded; the raw config bytes are retained
//! verbatim alongside them.

use super::ConfigError;

/// Sampling frequency table, indexed by `samplingFrequencyIndex`
const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

const ESCAPE_OBJECT_TYPE: u32 = 31;
const ESCAPE_FREQUENCY_INDEX: u32 = 0xF;
const AOT_SBR: u8 = 5;
const AOT_PS: u8 = 29;
const AOT_ER_BSAC: u8 = 22;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    /// Object type of the core decoder (after resolving an SBR/PS wrapper)
    pub audio_object_type: u8,
    pub frequency_index: u8,
    pub frequency: u32,
    pub channel_configuration: u8,
    pub extension_audio_object_type: u8,
    pub sbr_present: bool,
    pub ps_present: bool,
    pub extension_frequency_index: u8,
    pub extension_frequency: u32,
    pub extension_channel_configuration: u8,
    /// Input bytes, verbatim
    pub raw: Vec<u8>,
}

impl AudioSpecificConfig {
    pub fn parse(data: &[u8]) -> Result<Self, ConfigError> {
        let mut reader = BitReader::new(data);
        let mut config = AudioSpecificConfig {
            raw: data.to_vec(),
            ..Default::default()
        };

        config.audio_object_type = read_object_type(&mut reader)?;
        let (index, frequency) = read_frequency(&mut reader)?;
        config.frequency_index = index;
        config.frequency = frequency;
        config.channel_configuration = reader.read_bits(4)? as u8;

        if config.audio_object_type == AOT_SBR || config.audio_object_type == AOT_PS {
            config.extension_audio_object_type = AOT_SBR;
            config.sbr_present = true;
            config.ps_present = config.audio_object_type == AOT_PS;

            let (index, frequency) = read_frequency(&mut reader)?;
            config.extension_frequency_index = index;
            config.extension_frequency = frequency;

            config.audio_object_type = read_object_type(&mut reader)?;
            if config.audio_object_type == AOT_ER_BSAC {
                config.extension_channel_configuration = reader.read_bits(4)? as u8;
            }
        }

        Ok(config)
    }

    /// Number of interleaved PCM channels the decoder will produce
    pub fn channels(&self) -> u8 {
        match self.channel_configuration {
            0 => 2,
            7 => 8,
            n => n,
        }
    }
}

/// Map a 4-bit sampling frequency index to Hz; reserved indices map to 0
pub fn sampling_frequency(index: u8) -> u32 {
    SAMPLING_FREQUENCIES
        .get(index as usize)
        .copied()
        .unwrap_or(0)
}

fn read_object_type(reader: &mut BitReader) -> Result<u8, ConfigError> {
    let object_type = reader.read_bits(5)?;
    if object_type == ESCAPE_OBJECT_TYPE {
        return Ok((32 + reader.read_bits(6)?) as u8);
    }
    Ok(object_type as u8)
}

fn read_frequency(reader: &mut BitReader) -> Result<(u8, u32), ConfigError> {
    let index = reader.read_bits(4)?;
    if index == ESCAPE_FREQUENCY_INDEX {
        return Ok((index as u8, reader.read_bits(24)?));
    }
    Ok((index as u8, sampling_frequency(index as u8)))
}

/// MSB-first bit reader
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BitReader { data, position: 0 }
    }

    /// Read up to 32 bits as an unsigned big-endian value
    pub fn read_bits(&mut self, count: usize) -> Result<u32, ConfigError> {
        if self.position + count > self.data.len() * 8 {
            return Err(ConfigError::OutOfBits(self.position));
        }
        let mut value = 0u32;
        for _ in 0..count {
            let byte = self.data[self.position / 8];
            let bit = (byte >> (7 - self.position % 8)) & 1;
            value = (value << 1) | bit as u32;
            self.position += 1;
        }
        Ok(value)
    }

    pub fn bits_read(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_bits(fields: &[(u32, usize)]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut acc = 0u8;
        let mut filled = 0;
        for &(value, width) in fields {
            for i in (0..width).rev() {
                acc = (acc << 1) | ((value >> i) & 1) as u8;
                filled += 1;
                if filled == 8 {
                    out.push(acc);
                    acc = 0;
                    filled = 0;
                }
            }
        }
        if filled > 0 {
            out.push(acc << (8 - filled));
        }
        out
    }

    #[test]
    fn test_aac_lc_stereo() {
        let config = AudioSpecificConfig::parse(&[0x12, 0x10]).unwrap();
        assert_eq!(config.audio_object_type, 2);
        assert_eq!(config.frequency_index, 4);
        assert_eq!(config.frequency, 44100);
        assert_eq!(config.channel_configuration, 2);
        assert_eq!(config.extension_audio_object_type, 0);
        assert!(!config.sbr_present);
        assert!(!config.ps_present);
        assert_eq!(config.extension_frequency, 0);
        assert_eq!(config.raw, vec![0x12, 0x10]);
    }

    #[test]
    fn test_non_sbr_object_types_consume_no_extension() {
        for object_type in [1u32, 2, 3, 4, 6, 22, 23, 30] {
            let data = pack_bits(&[(object_type, 5), (3, 4), (1, 4)]);
            let config = AudioSpecificConfig::parse(&data).unwrap();
            assert_eq!(config.audio_object_type as u32, object_type);
            assert_eq!(config.extension_audio_object_type, 0);
            assert_eq!(config.extension_frequency_index, 0);
            assert_eq!(config.extension_channel_configuration, 0);
            assert_eq!(config.frequency, 48000);
        }
    }

    #[test]
    fn test_sbr_extension() {
        let data = pack_bits(&[(5, 5), (6, 4), (2, 4), (3, 4), (2, 5)]);
        let config = AudioSpecificConfig::parse(&data).unwrap();
        assert_eq!(config.extension_audio_object_type, 5);
        assert!(config.sbr_present);
        assert!(!config.ps_present);
        assert_eq!(config.frequency, 24000);
        assert_eq!(config.extension_frequency_index, 3);
        assert_eq!(config.extension_frequency, 48000);
        assert_eq!(config.audio_object_type, 2);
        assert_eq!(config.channels(), 2);
    }

    #[test]
    fn test_parametric_stereo_with_bsac_core() {
        let data = pack_bits(&[(29, 5), (6, 4), (1, 4), (3, 4), (22, 5), (2, 4)]);
        let config = AudioSpecificConfig::parse(&data).unwrap();
        assert_eq!(config.extension_audio_object_type, 5);
        assert!(config.sbr_present);
        assert!(config.ps_present);
        assert_eq!(config.audio_object_type, 22);
        assert_eq!(config.extension_channel_configuration, 2);
    }

    #[test]
    fn test_escaped_fields() {
        let data = pack_bits(&[(31, 5), (10, 6), (0xF, 4), (48000, 24), (1, 4)]);
        let config = AudioSpecificConfig::parse(&data).unwrap();
        assert_eq!(config.audio_object_type, 42);
        assert_eq!(config.frequency_index, 0xF);
        assert_eq!(config.frequency, 48000);
        assert_eq!(config.channel_configuration, 1);

        let data = pack_bits(&[(5, 5), (4, 4), (2, 4), (0xF, 4), (88200, 24), (31, 5), (0, 6)]);
        let config = AudioSpecificConfig::parse(&data).unwrap();
        assert_eq!(config.extension_frequency, 88200);
        assert_eq!(config.audio_object_type, 32);
    }

    #[test]
    fn test_reserved_frequency_indices() {
        assert_eq!(sampling_frequency(0xC), 7350);
        assert_eq!(sampling_frequency(0xD), 0);
        assert_eq!(sampling_frequency(0xE), 0);
    }

    #[test]
    fn test_truncated_config() {
        assert_eq!(AudioSpecificConfig::parse(&[0x12]), Err(ConfigError::OutOfBits(5)));
        assert!(AudioSpecificConfig::parse(&[0x2b]).is_err());
    }

    #[test]
    fn test_bit_reader() {
        let mut reader = BitReader::new(&[0b1010_0000, 0xFF]);
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        assert_eq!(reader.read_bits(9).unwrap(), 0b0_0000_1111);
        assert_eq!(reader.bits_read(), 12);
        assert_eq!(reader.read_bits(4).unwrap(), 0xF);
        assert!(reader.read_bits(1).is_err());
    }
}
