//! The resampler seam between stream and device sample specs.
//!
//! The actual conversion algorithms live outside this crate; streams only
//! depend on the [`Resampler`] trait. The trivial nearest-frame converter
//! here keeps format, rate and channel counts in step well enough for the
//! core's accounting (and for tests).

use byteorder::{ByteOrder, LittleEndian};

use crate::channel::ChannelMap;
use crate::error::Error;
use crate::memblock::MemChunk;
use crate::sample::{SampleFormat, SampleSpec};

/// Which conversion algorithm a stream asked for, and which it got.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ResampleMethod {
    /// Let the core pick.
    #[default]
    Auto,
    /// Nearest-frame duplication/decimation.
    Trivial,
    /// Linear interpolation between frames.
    Linear,
}

/// Converts sample data between a stream spec and a device spec.
pub trait Resampler: Send {
    /// The spec fed into [`Resampler::run`].
    fn input_spec(&self) -> &SampleSpec;

    /// The spec produced by [`Resampler::run`].
    fn output_spec(&self) -> &SampleSpec;

    /// How many input bytes are needed to produce `out_len` output bytes.
    fn request(&self, out_len: usize) -> usize;

    /// How many output bytes `in_len` input bytes will produce.
    fn result(&self, in_len: usize) -> usize;

    /// Converts a chunk of input data.
    fn run(&mut self, chunk: &MemChunk) -> MemChunk;

    /// Drops internal history, e.g. after a rewind.
    fn reset(&mut self);

    /// The algorithm actually in use.
    fn method(&self) -> ResampleMethod;
}

/// Creates a resampler for the given conversion, resolving `Auto` to the
/// method the build supports.
pub fn new_resampler(
    input_spec: SampleSpec,
    input_map: ChannelMap,
    output_spec: SampleSpec,
    output_map: ChannelMap,
    method: ResampleMethod,
) -> Result<Box<dyn Resampler>, Error> {
    for spec in [&input_spec, &output_spec] {
        match spec.format {
            SampleFormat::S16Le | SampleFormat::Float32Le => {}
            other => {
                return Err(Error::Invalid(format!(
                    "no resampler for sample format {:?}",
                    other
                )))
            }
        }
    }

    let method = match method {
        ResampleMethod::Auto => ResampleMethod::Trivial,
        other => other,
    };

    Ok(Box::new(TrivialResampler {
        input_spec,
        input_map,
        output_spec,
        output_map,
        method,
        phase: 0,
    }))
}

struct TrivialResampler {
    input_spec: SampleSpec,
    input_map: ChannelMap,
    output_spec: SampleSpec,
    output_map: ChannelMap,
    method: ResampleMethod,
    /// Fractional output frames carried between calls, in input-rate units.
    phase: u64,
}

impl TrivialResampler {
    fn read_frame(&self, data: &[u8], frame: usize, out: &mut [f32]) {
        let channels = self.input_spec.channels as usize;
        let fs = self.input_spec.frame_size();
        let base = frame * fs;
        for (c, slot) in out.iter_mut().enumerate().take(channels) {
            *slot = match self.input_spec.format {
                SampleFormat::S16Le => {
                    LittleEndian::read_i16(&data[base + c * 2..]) as f32 / i16::MAX as f32
                }
                SampleFormat::Float32Le => LittleEndian::read_f32(&data[base + c * 4..]),
                _ => unreachable!("checked at construction"),
            };
        }
    }

    fn write_frame(&self, data: &mut [u8], frame: usize, samples: &[f32]) {
        let channels = self.output_spec.channels as usize;
        let fs = self.output_spec.frame_size();
        let base = frame * fs;
        for (c, &s) in samples.iter().enumerate().take(channels) {
            match self.output_spec.format {
                SampleFormat::S16Le => LittleEndian::write_i16(
                    &mut data[base + c * 2..],
                    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16,
                ),
                SampleFormat::Float32Le => LittleEndian::write_f32(&mut data[base + c * 4..], s),
                _ => unreachable!("checked at construction"),
            }
        }
    }

    /// Maps an input frame onto the output channel layout, matching channels
    /// by position and falling back to the frame mean.
    fn remap_frame(&self, input: &[f32], output: &mut [f32]) {
        let in_channels = self.input_spec.channels as usize;
        let mean = input[..in_channels].iter().sum::<f32>() / in_channels as f32;

        for (k, slot) in output
            .iter_mut()
            .enumerate()
            .take(self.output_spec.channels as usize)
        {
            let pos = self.output_map.position(k);
            let matched = (0..in_channels).find(|&i| self.input_map.position(i) == pos);
            *slot = match matched {
                Some(i) => input[i],
                None => mean,
            };
        }
    }
}

impl Resampler for TrivialResampler {
    fn input_spec(&self) -> &SampleSpec {
        &self.input_spec
    }

    fn output_spec(&self) -> &SampleSpec {
        &self.output_spec
    }

    fn request(&self, out_len: usize) -> usize {
        let out_frames = out_len / self.output_spec.frame_size();
        let in_frames = (out_frames as u64 * self.input_spec.rate as u64)
            .div_ceil(self.output_spec.rate as u64);
        in_frames as usize * self.input_spec.frame_size()
    }

    fn result(&self, in_len: usize) -> usize {
        let in_frames = in_len / self.input_spec.frame_size();
        let out_frames =
            in_frames as u64 * self.output_spec.rate as u64 / self.input_spec.rate as u64;
        out_frames as usize * self.output_spec.frame_size()
    }

    fn run(&mut self, chunk: &MemChunk) -> MemChunk {
        let data = chunk.as_slice();
        let in_frames = data.len() / self.input_spec.frame_size();
        if in_frames == 0 {
            return MemChunk::silence(0);
        }

        let total = in_frames as u64 * self.output_spec.rate as u64 + self.phase;
        let out_frames = (total / self.input_spec.rate as u64) as usize;
        self.phase = total % self.input_spec.rate as u64;

        let mut out = vec![0u8; out_frames * self.output_spec.frame_size()];
        let mut in_samples = [0f32; 32];
        let mut out_samples = [0f32; 32];

        for k in 0..out_frames {
            // Nearest input frame for this output frame.
            let src = (k as u64 * self.input_spec.rate as u64 / self.output_spec.rate as u64)
                .min(in_frames as u64 - 1) as usize;
            self.read_frame(data, src, &mut in_samples);
            self.remap_frame(&in_samples, &mut out_samples);
            self.write_frame(&mut out, k, &out_samples);
        }

        MemChunk::from_vec(out)
    }

    fn reset(&mut self) {
        self.phase = 0;
    }

    fn method(&self) -> ResampleMethod {
        self.method
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(in_rate: u32, out_rate: u32) -> (SampleSpec, ChannelMap, SampleSpec, ChannelMap) {
        (
            SampleSpec::new(SampleFormat::S16Le, 2, in_rate).unwrap(),
            ChannelMap::default_for(2).unwrap(),
            SampleSpec::new(SampleFormat::S16Le, 2, out_rate).unwrap(),
            ChannelMap::default_for(2).unwrap(),
        )
    }

    #[test]
    fn request_result_are_inverse_bounds() {
        let (is, im, os, om) = specs(44100, 48000);
        let r = new_resampler(is, im, os, om, ResampleMethod::Auto).unwrap();

        let out_len = os.frame_size() * 480;
        let in_len = r.request(out_len);
        assert!(r.result(in_len) >= out_len);
    }

    #[test]
    fn downmix_by_position() {
        let is = SampleSpec::new(SampleFormat::S16Le, 2, 48000).unwrap();
        let im = ChannelMap::default_for(2).unwrap();
        let os = SampleSpec::new(SampleFormat::S16Le, 1, 48000).unwrap();
        let om = ChannelMap::default_for(1).unwrap();
        let mut r = new_resampler(is, im, os, om, ResampleMethod::Trivial).unwrap();

        let mut data = vec![0u8; 8];
        LittleEndian::write_i16_into(&[8000, -8000, 8000, -8000], &mut data);
        let out = r.run(&MemChunk::from_vec(data));

        // Mono output has no positional match, so each frame is the mean.
        assert_eq!(out.length, 4);
        let mut samples = [0i16; 2];
        LittleEndian::read_i16_into(out.as_slice(), &mut samples);
        assert_eq!(samples, [0, 0]);
    }

    #[test]
    fn rate_conversion_conserves_duration() {
        let (is, im, os, om) = specs(48000, 24000);
        let mut r = new_resampler(is, im, os, om, ResampleMethod::Trivial).unwrap();

        let chunk = MemChunk::silence(is.frame_size() * 480);
        let out = r.run(&chunk);
        assert_eq!(out.length, os.frame_size() * 240);
    }
}
