//! Defines volume specification data types.

use std::fmt;

use crate::channel::{ChannelMap, ChannelPosition};
use crate::sample::{SampleSpec, CHANNELS_MAX};

const VOLUME_NORM: u32 = 0x10000;
const VOLUME_MUTED: u32 = 0;
const VOLUME_MAX: u32 = VOLUME_NORM * 2;

/// Volume specification for a single channel.
///
/// The raw value is linear in a cubic perceptual scale; conversion to dB is
/// only meaningful on devices that declare decibel volume support.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Volume(u32);

impl Volume {
    /// The normal volume (100%, 0 dB, no attenuation, no amplification).
    pub const NORM: Self = Volume(VOLUME_NORM);

    /// The muted volume (0%, -Inf dB).
    pub const MUTED: Self = Volume(VOLUME_MUTED);

    /// The maximum amplified volume.
    pub const MAX: Self = Volume(VOLUME_MAX);

    /// Gets the raw volume value as a `u32`.
    ///
    /// This is not useful for user presentation.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Creates a volume specification from a raw `u32`.
    ///
    /// If the raw value is out of the valid range, it will be clamped.
    pub fn from_u32_clamped(raw: u32) -> Self {
        Volume(raw.min(VOLUME_MAX))
    }

    /// Whether this volume is exactly muted.
    pub fn is_muted(&self) -> bool {
        self.0 == VOLUME_MUTED
    }

    /// Gets the amplification/attenuation in decibel (dB) corresponding to this volume.
    pub fn to_db(&self) -> f64 {
        (self.to_linear() as f64).log10() * 20.0
    }

    /// Creates a volume from an amplification/attenuation in decibel (dB).
    pub fn from_db(db: f64) -> Self {
        if db == f64::NEG_INFINITY {
            return Volume::MUTED;
        }
        Self::from_linear(10f64.powf(db / 20.0) as f32)
    }

    /// Convert the volume to a linear volume.
    ///
    /// The range of the returned number goes from 0.0 (mute) over 1.0 (0 dB, 100%) and can go
    /// beyond 1.0 to indicate that the signal should be amplified.
    pub fn to_linear(&self) -> f32 {
        // Like PulseAudio, we use a cubic scale.
        // Also see: http://www.robotplanet.dk/audio/audio_gui_design/
        let f = self.0 as f32 / VOLUME_NORM as f32;
        f * f * f
    }

    /// Convert from a linear volume.
    ///
    /// Volumes outside the valid range will be clamped.
    pub fn from_linear(linear: f32) -> Self {
        if linear <= 0.0 {
            return Volume::MUTED;
        }
        let raw = (linear.cbrt() * VOLUME_NORM as f32).round() as u32;
        Volume(raw.min(VOLUME_MAX))
    }

    /// Multiplies two volumes.
    ///
    /// The result of multiplying anything with `NORM` is the other factor.
    pub fn multiply(self, other: Volume) -> Volume {
        let raw = (self.0 as u64 * other.0 as u64 + VOLUME_NORM as u64 / 2) / VOLUME_NORM as u64;
        Volume::from_u32_clamped(raw.min(u32::MAX as u64) as u32)
    }

    /// Divides `self` by `other`, the inverse of [`Volume::multiply`].
    ///
    /// Dividing by `MUTED` yields `MUTED`.
    pub fn divide(self, other: Volume) -> Volume {
        if other.0 == 0 {
            return Volume::MUTED;
        }
        let raw = (self.0 as u64 * VOLUME_NORM as u64 + other.0 as u64 / 2) / other.0 as u64;
        Volume::from_u32_clamped(raw.min(u32::MAX as u64) as u32)
    }

    /// Maps this volume onto an integer hardware range `[min, max]`.
    pub fn to_hw(&self, min: i64, max: i64) -> i64 {
        let f = (self.to_linear() as f64).clamp(0.0, 1.0);
        min + (f * (max - min) as f64).round() as i64
    }

    /// Maps a value from an integer hardware range `[min, max]` back to a volume.
    pub fn from_hw(value: i64, min: i64, max: i64) -> Volume {
        if max <= min {
            return Volume::NORM;
        }
        let f = (value - min) as f64 / (max - min) as f64;
        Volume::from_linear(f as f32)
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} dB", self.to_db())
    }
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Volume")
            .field(&format!(
                "raw={:.1}, linear={:.1}, {:.1} dB",
                self.0 as f32 / VOLUME_NORM as f32,
                self.to_linear(),
                self.to_db()
            ))
            .finish()
    }
}

/// Per-channel volume setting.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelVolume {
    channels: u8,
    volumes: [Volume; CHANNELS_MAX as usize],
}

impl Default for ChannelVolume {
    fn default() -> Self {
        Self {
            channels: 1,
            volumes: [Volume::MUTED; CHANNELS_MAX as usize],
        }
    }
}

impl ChannelVolume {
    /// Create a `ChannelVolume` with N channels, all muted.
    pub fn muted(channels: usize) -> ChannelVolume {
        Self {
            channels: channels as u8,
            volumes: [Volume::MUTED; CHANNELS_MAX as usize],
        }
    }

    /// Create a `ChannelVolume` with N channels, all at full volume.
    pub fn norm(channels: usize) -> ChannelVolume {
        Self {
            channels: channels as u8,
            volumes: [Volume::NORM; CHANNELS_MAX as usize],
        }
    }

    /// Create a `ChannelVolume` with N channels, all at `v`.
    pub fn uniform(channels: usize, v: Volume) -> ChannelVolume {
        let mut cv = Self::muted(channels);
        for ch in cv.channels_mut() {
            *ch = v;
        }
        cv
    }

    /// Create a `ChannelVolume` from a slice of per-channel volumes.
    pub fn from_slice(volumes: &[Volume]) -> ChannelVolume {
        let mut cv = Self::muted(volumes.len());
        cv.volumes[..volumes.len()].copy_from_slice(volumes);
        cv
    }

    /// Returns the per-channel volumes stored in `self`.
    pub fn channels(&self) -> &[Volume] {
        &self.volumes[..self.channels as usize]
    }

    /// Returns the per-channel volumes stored in `self`, mutably.
    pub fn channels_mut(&mut self) -> &mut [Volume] {
        &mut self.volumes[..self.channels as usize]
    }

    /// The number of channels.
    pub fn num_channels(&self) -> u8 {
        self.channels
    }

    /// A `ChannelVolume` is compatible with a sample spec iff the channel
    /// counts match.
    pub fn compatible_with(&self, spec: &SampleSpec) -> bool {
        self.channels == spec.channels
    }

    /// Whether every channel is exactly muted.
    pub fn is_muted(&self) -> bool {
        self.channels().iter().all(|v| v.is_muted())
    }

    /// Whether every channel is exactly `NORM`.
    pub fn is_norm(&self) -> bool {
        self.channels().iter().all(|v| *v == Volume::NORM)
    }

    /// The loudest channel.
    pub fn max(&self) -> Volume {
        self.channels().iter().copied().max().unwrap_or(Volume::MUTED)
    }

    /// The mean channel volume.
    pub fn avg(&self) -> Volume {
        if self.channels == 0 {
            return Volume::MUTED;
        }
        let sum: u64 = self.channels().iter().map(|v| v.as_u32() as u64).sum();
        Volume::from_u32_clamped((sum / self.channels as u64) as u32)
    }

    /// Channelwise multiplication. Both operands must have the same number of
    /// channels.
    pub fn multiply(&self, other: &ChannelVolume) -> ChannelVolume {
        debug_assert_eq!(self.channels, other.channels);
        let mut out = *self;
        for (a, b) in out.channels_mut().iter_mut().zip(other.channels()) {
            *a = a.multiply(*b);
        }
        out
    }

    /// Multiplies every channel by the scalar `v`.
    pub fn multiply_scalar(&self, v: Volume) -> ChannelVolume {
        let mut out = *self;
        for ch in out.channels_mut() {
            *ch = ch.multiply(v);
        }
        out
    }

    /// Channelwise division, the inverse of [`ChannelVolume::multiply`].
    pub fn divide(&self, other: &ChannelVolume) -> ChannelVolume {
        debug_assert_eq!(self.channels, other.channels);
        let mut out = *self;
        for (a, b) in out.channels_mut().iter_mut().zip(other.channels()) {
            *a = a.divide(*b);
        }
        out
    }

    /// Remaps a volume from one channel map to another.
    ///
    /// Volumes for positions present in both maps are carried over directly;
    /// positions only present in the target map get the mean of the source
    /// channels on the same side of the stage, or the overall mean.
    pub fn remap(&self, from: &ChannelMap, to: &ChannelMap) -> ChannelVolume {
        debug_assert_eq!(self.channels, from.num_channels());

        if from == to {
            return *self;
        }

        let mut out = ChannelVolume::muted(to.num_channels() as usize);
        for k in 0..to.num_channels() as usize {
            let p = to.position(k);

            let exact = self.mean_where(from, |q| q == p);
            let side = if p.is_left() {
                self.mean_where(from, |q| q.is_left())
            } else if p.is_right() {
                self.mean_where(from, |q| q.is_right())
            } else {
                None
            };

            out.channels_mut()[k] = exact.or(side).unwrap_or_else(|| self.avg());
        }
        out
    }

    fn mean_where(
        &self,
        map: &ChannelMap,
        f: impl Fn(ChannelPosition) -> bool,
    ) -> Option<Volume> {
        let mut sum = 0u64;
        let mut n = 0u64;
        for (i, v) in self.channels().iter().enumerate() {
            if f(map.position(i)) {
                sum += v.as_u32() as u64;
                n += 1;
            }
        }
        if n == 0 {
            None
        } else {
            Some(Volume::from_u32_clamped((sum / n) as u32))
        }
    }
}

/// Combines a per-stream volume over map `from` into a device volume over map
/// `to`, disturbing unrelated device channels as little as possible.
///
/// If remapping the current device volume (`template`) back to the stream's
/// map already matches `v`, the device volume is left alone. Otherwise, if
/// the maps differ, the device channels are set uniformly to `max(v)` so that
/// changing one stream does not leak into unrelated channels.
pub fn remap_minimal_impact(
    v: &ChannelVolume,
    template: &ChannelVolume,
    from: &ChannelMap,
    to: &ChannelMap,
) -> ChannelVolume {
    debug_assert_eq!(v.num_channels(), from.num_channels());
    debug_assert_eq!(template.num_channels(), to.num_channels());

    if template.remap(to, from) == *v {
        return *template;
    }

    if from == to {
        *v
    } else {
        ChannelVolume::uniform(to.num_channels() as usize, v.max())
    }
}

impl fmt::Debug for ChannelVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only print the occupied part of the backing storage
        self.volumes[..self.channels.into()].fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    fn stereo() -> ChannelMap {
        ChannelMap::default_for(2).unwrap()
    }

    #[test]
    fn volume_conversions() {
        assert_eq!(Volume::NORM.to_linear(), 1.0);
        assert_eq!(Volume::MUTED.to_linear(), 0.0);
        assert_eq!(Volume::from_linear(-43.0).to_linear(), 0.0);
        assert_eq!(Volume::NORM.to_db(), 0.0);
        assert_eq!(Volume::MUTED.to_db(), f64::NEG_INFINITY);
        assert_eq!(Volume::from_db(f64::NEG_INFINITY), Volume::MUTED);
    }

    #[test]
    fn multiply_divide() {
        let half = Volume::from_u32_clamped(0x8000);
        assert_eq!(Volume::NORM.multiply(half), half);
        assert_eq!(half.multiply(Volume::NORM).divide(half), Volume::NORM);
        assert_eq!(half.divide(Volume::MUTED), Volume::MUTED);
    }

    #[test]
    fn hw_range_round_trip() {
        let v = Volume::from_linear(0.5);
        let hw = v.to_hw(0, 255);
        let back = Volume::from_hw(hw, 0, 255);
        // One hardware step of slack.
        assert!((back.as_u32() as i64 - v.as_u32() as i64).abs() < 0x400);
    }

    #[test]
    fn remap_identity_and_mono() {
        let cv = ChannelVolume::from_slice(&[Volume::NORM, Volume::from_u32_clamped(0x8000)]);
        assert_eq!(cv.remap(&stereo(), &stereo()), cv);

        let mono = ChannelMap::default_for(1).unwrap();
        let down = cv.remap(&stereo(), &mono);
        assert_eq!(down.num_channels(), 1);
        assert_eq!(down.channels()[0], cv.avg());

        let up = down.remap(&mono, &stereo());
        assert_eq!(up.channels()[0], up.channels()[1]);
    }

    #[test]
    fn minimal_impact_prefers_template() {
        let surround = ChannelMap::default_for(6).unwrap();
        let template = ChannelVolume::norm(6);
        let v = template.remap(&surround, &stereo());

        // The stream volume is just the device volume as seen through the
        // stream's map, so the device volume must not change.
        let out = remap_minimal_impact(&v, &template, &stereo(), &surround);
        assert_eq!(out, template);

        // A genuinely different stream volume flattens to its maximum.
        let v = ChannelVolume::from_slice(&[Volume::from_u32_clamped(0x8000), Volume::NORM]);
        let out = remap_minimal_impact(&v, &template, &stereo(), &surround);
        assert_eq!(out, ChannelVolume::uniform(6, Volume::NORM));
    }

    quickcheck! {
        fn linear_round_trip(raw: u32) -> bool {
            let v = Volume::from_u32_clamped(raw % (VOLUME_MAX + 1));
            let back = Volume::from_linear(v.to_linear());
            (back.as_u32() as i64 - v.as_u32() as i64).abs() <= 1
        }

        fn multiply_norm_is_identity(raw: u32) -> bool {
            let v = Volume::from_u32_clamped(raw % (VOLUME_MAX + 1));
            v.multiply(Volume::NORM) == v && Volume::NORM.multiply(v) == v
        }
    }
}
