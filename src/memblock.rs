//! Reference-counted sample memory and the volume-apply primitive.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::sample::{SampleFormat, SampleSpec};
use crate::volume::ChannelVolume;

/// The largest chunk the IO paths hand around in one piece.
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// A reference-counted block of sample memory.
///
/// Blocks handed into a device may be read by many consumers; in-place
/// modification requires [`MemChunk::make_writable`] first.
#[derive(Debug, Clone)]
pub struct MemBlock {
    data: Arc<Vec<u8>>,
}

impl MemBlock {
    /// Wraps a buffer in a block.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    /// A block of `len` silent bytes.
    pub fn silence(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    /// The length of the block in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the block is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The block's contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// A view into a [`MemBlock`]: an offset and a length.
#[derive(Debug, Clone)]
pub struct MemChunk {
    /// The underlying block.
    pub block: MemBlock,
    /// Byte offset of the view into the block.
    pub index: usize,
    /// Byte length of the view.
    pub length: usize,
}

impl MemChunk {
    /// A chunk covering a whole freshly allocated buffer.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let length = data.len();
        Self {
            block: MemBlock::new(data),
            index: 0,
            length,
        }
    }

    /// A chunk of `len` silent bytes.
    pub fn silence(len: usize) -> Self {
        Self {
            block: MemBlock::silence(len),
            index: 0,
            length: len,
        }
    }

    /// The bytes covered by the chunk.
    pub fn as_slice(&self) -> &[u8] {
        &self.block.as_slice()[self.index..self.index + self.length]
    }

    /// Makes the chunk's bytes writable, copying the covered region into a
    /// fresh block if the underlying one is shared with other readers.
    pub fn make_writable(&mut self) -> &mut [u8] {
        if Arc::strong_count(&self.block.data) > 1 || self.index != 0 {
            let copy = self.as_slice().to_vec();
            self.block = MemBlock::new(copy);
            self.index = 0;
        }

        // The block is now uniquely owned.
        let data = Arc::get_mut(&mut self.block.data).expect("memblock still shared");
        &mut data[..self.length]
    }

    /// Splits off and returns the first `n` bytes, advancing this chunk past
    /// them.
    pub fn split_prefix(&mut self, n: usize) -> MemChunk {
        let n = n.min(self.length);
        let head = MemChunk {
            block: self.block.clone(),
            index: self.index,
            length: n,
        };
        self.index += n;
        self.length -= n;
        head
    }
}

/// Applies a per-channel software volume to a chunk in place.
///
/// This is the single point where gain touches samples; everything else in
/// the core deals in volumes, not sample data. Only the native PCM formats
/// are processed; other formats are passed through untouched with a warning,
/// since streams in those formats are expected to be passthrough.
pub fn apply_volume(chunk: &mut MemChunk, spec: &SampleSpec, volume: &ChannelVolume) {
    debug_assert!(volume.compatible_with(spec));

    if volume.is_norm() {
        return;
    }

    if volume.is_muted() {
        let data = chunk.make_writable();
        data.fill(0);
        return;
    }

    let channels = spec.channels as usize;
    let factors: Vec<f32> = volume.channels().iter().map(|v| v.to_linear()).collect();
    let data = chunk.make_writable();

    match spec.format {
        SampleFormat::S16Le => {
            for (i, frame) in data.chunks_exact_mut(2).enumerate() {
                let f = factors[i % channels];
                let s = LittleEndian::read_i16(frame) as f32 * f;
                LittleEndian::write_i16(frame, s.clamp(i16::MIN as f32, i16::MAX as f32) as i16);
            }
        }
        SampleFormat::Float32Le => {
            for (i, frame) in data.chunks_exact_mut(4).enumerate() {
                let f = factors[i % channels];
                let s = LittleEndian::read_f32(frame) * f;
                LittleEndian::write_f32(frame, s);
            }
        }
        other => {
            warn!("volume adjustment unsupported for {:?}, passing through", other);
        }
    }
}

/// Sums `src` into `dst`, saturating. Both buffers must be in `spec`.
pub fn mix_into(dst: &mut [u8], src: &[u8], spec: &SampleSpec) {
    let n = dst.len().min(src.len());

    match spec.format {
        SampleFormat::S16Le => {
            for (d, s) in dst[..n].chunks_exact_mut(2).zip(src[..n].chunks_exact(2)) {
                let sum = LittleEndian::read_i16(d) as i32 + LittleEndian::read_i16(s) as i32;
                LittleEndian::write_i16(d, sum.clamp(i16::MIN as i32, i16::MAX as i32) as i16);
            }
        }
        SampleFormat::Float32Le => {
            for (d, s) in dst[..n].chunks_exact_mut(4).zip(src[..n].chunks_exact(4)) {
                let sum = LittleEndian::read_f32(d) + LittleEndian::read_f32(s);
                LittleEndian::write_f32(d, sum);
            }
        }
        other => {
            warn!("mixing unsupported for {:?}", other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Volume;

    fn s16_chunk(samples: &[i16]) -> MemChunk {
        let mut data = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(samples, &mut data);
        MemChunk::from_vec(data)
    }

    fn read_s16(chunk: &MemChunk) -> Vec<i16> {
        let mut out = vec![0i16; chunk.length / 2];
        LittleEndian::read_i16_into(chunk.as_slice(), &mut out);
        out
    }

    #[test]
    fn clone_for_write_leaves_other_readers_alone() {
        let a = s16_chunk(&[1000, 2000]);
        let mut b = a.clone();

        let spec = SampleSpec::new(SampleFormat::S16Le, 2, 48000).unwrap();
        apply_volume(&mut b, &spec, &ChannelVolume::muted(2));

        assert_eq!(read_s16(&a), vec![1000, 2000]);
        assert_eq!(read_s16(&b), vec![0, 0]);
    }

    #[test]
    fn per_channel_gain() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 2, 48000).unwrap();
        let mut chunk = s16_chunk(&[10000, 10000, -10000, -10000]);

        let vol = ChannelVolume::from_slice(&[Volume::NORM, Volume::MUTED]);
        apply_volume(&mut chunk, &spec, &vol);

        assert_eq!(read_s16(&chunk), vec![10000, 0, -10000, 0]);
    }

    #[test]
    fn mixing_saturates() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 1, 48000).unwrap();
        let mut dst = vec![0u8; 4];
        LittleEndian::write_i16_into(&[i16::MAX, -100], &mut dst);
        let mut src = vec![0u8; 4];
        LittleEndian::write_i16_into(&[1000, -100], &mut src);

        mix_into(&mut dst, &src, &spec);

        let mut out = [0i16; 2];
        LittleEndian::read_i16_into(&dst, &mut out);
        assert_eq!(out, [i16::MAX, -200]);
    }

    #[test]
    fn split_prefix_advances() {
        let mut chunk = s16_chunk(&[1, 2, 3, 4]);
        let head = chunk.split_prefix(4);
        assert_eq!(read_s16(&head), vec![1, 2]);
        assert_eq!(read_s16(&chunk), vec![3, 4]);
    }
}
