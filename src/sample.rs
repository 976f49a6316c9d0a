//! Sample specification data type.

use enum_primitive_derive::Primitive;

use crate::error::Error;
use crate::time::{MicroSeconds, USEC_PER_SEC};

/// Maximum number of channels.
pub const CHANNELS_MAX: u8 = 32;

/// Minimum accepted sample rate.
pub const RATE_MIN: u32 = 8000;

/// Maximum accepted sample rate.
pub const RATE_MAX: u32 = 48000 * 8;

/// Describes how individual samples are encoded.
#[derive(Debug, Copy, Clone, Primitive, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Unsigned 8 Bit PCM
    U8 = 0,
    /// 8 Bit a-Law
    Alaw = 1,
    /// 8 Bit mu-Law
    Ulaw = 2,
    /// Signed 16 Bit PCM, little endian (PC)
    #[default]
    S16Le = 3,
    /// Signed 16 Bit PCM, big endian
    S16Be = 4,
    /// 32 Bit IEEE floating point, little endian (PC), range -1.0 to 1.0
    Float32Le = 5,
    /// 32 Bit IEEE floating point, big endian, range -1.0 to 1.0
    Float32Be = 6,
    /// Signed 32 Bit PCM, little endian (PC)
    S32Le = 7,
    /// Signed 32 Bit PCM, big endian
    S32Be = 8,
    /// Signed 24 Bit PCM packed, little endian (PC)
    S24Le = 9,
    /// Signed 24 Bit PCM packed, big endian
    S24Be = 10,
    /// Signed 24 Bit PCM in LSB of 32 Bit words, little endian (PC)
    S24In32Le = 11,
    /// Signed 24 Bit PCM in LSB of 32 Bit words, big endian
    S24In32Be = 12,
}

impl SampleFormat {
    /// The size of a single sample in this format, in bytes.
    pub fn sample_size(self) -> usize {
        use SampleFormat::*;

        match self {
            U8 | Alaw | Ulaw => 1,
            S16Le | S16Be => 2,
            S24Le | S24Be => 3,
            Float32Le | Float32Be | S32Le | S32Be | S24In32Le | S24In32Be => 4,
        }
    }
}

/// A sample specification that fully describes the format of a sample stream between 2 endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleSpec {
    /// Format / Encoding of individual samples.
    pub format: SampleFormat,
    /// Number of independent channels. Must be at least 1.
    pub channels: u8,
    /// Number of samples per second (and per channel).
    pub rate: u32,
}

impl SampleSpec {
    /// Creates a new sample specification.
    pub fn new(format: SampleFormat, channels: u8, rate: u32) -> Result<Self, Error> {
        if channels == 0 || channels > CHANNELS_MAX {
            return Err(Error::Invalid(format!(
                "invalid channel count {} (must be between 1 and {})",
                channels, CHANNELS_MAX
            )));
        }

        if rate < RATE_MIN || rate > RATE_MAX {
            return Err(Error::Invalid(format!(
                "invalid sample rate {} (must be between {} and {})",
                rate, RATE_MIN, RATE_MAX
            )));
        }

        Ok(Self {
            format,
            channels,
            rate,
        })
    }

    /// The size of one frame (one sample per channel), in bytes.
    pub fn frame_size(&self) -> usize {
        self.format.sample_size() * self.channels as usize
    }

    /// The number of bytes that are played back per second.
    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.rate as usize
    }

    /// Converts a byte count in this spec into a duration, rounding down to
    /// full frames.
    pub fn bytes_to_usec(&self, bytes: usize) -> MicroSeconds {
        let frames = bytes / self.frame_size();
        MicroSeconds(frames as u64 * USEC_PER_SEC / self.rate as u64)
    }

    /// Converts a duration into a byte count in this spec, rounded down to a
    /// full frame.
    pub fn usec_to_bytes(&self, t: MicroSeconds) -> usize {
        let frames = (t.0 * self.rate as u64 / USEC_PER_SEC) as usize;
        frames * self.frame_size()
    }
}

/// The two rate families devices can switch between.
///
/// A rate is only eligible for rate switching if it is a whole multiple of
/// one of the family bases, and it can only replace a configured rate of the
/// same family.
pub fn rate_family(rate: u32) -> Option<u32> {
    if rate % 4000 == 0 {
        Some(4000)
    } else if rate % 11025 == 0 {
        Some(11025)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn spec_validation() {
        assert!(SampleSpec::new(SampleFormat::S16Le, 2, 44100).is_ok());
        assert_matches!(
            SampleSpec::new(SampleFormat::S16Le, 0, 44100),
            Err(Error::Invalid(_))
        );
        assert_matches!(
            SampleSpec::new(SampleFormat::S16Le, 2, 4000),
            Err(Error::Invalid(_))
        );
        assert_matches!(
            SampleSpec::new(SampleFormat::S16Le, 2, RATE_MAX + 1),
            Err(Error::Invalid(_))
        );
    }

    #[test]
    fn frame_math() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 2, 48000).unwrap();
        assert_eq!(spec.frame_size(), 4);
        assert_eq!(spec.bytes_to_usec(spec.bytes_per_second()), MicroSeconds(USEC_PER_SEC));
        assert_eq!(spec.usec_to_bytes(MicroSeconds(USEC_PER_SEC)), spec.bytes_per_second());
    }

    #[test]
    fn rate_families() {
        assert_eq!(rate_family(48000), Some(4000));
        assert_eq!(rate_family(44100), Some(11025));
        assert_eq!(rate_family(44101), None);
    }
}
