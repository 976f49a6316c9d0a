//! Per-stream playback producers attached to a sink.
//!
//! Pull-driven: the sink's IO thread calls [`SinkInputIo::peek`] to fill and
//! read the per-stream render queue, [`SinkInputIo::drop_bytes`] to consume
//! it, and the rewind protocol to rewrite data the hardware has not played
//! yet.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::channel::ChannelMap;
use crate::core::{Core, MoveEvent, MAX_STREAMS_PER_DEVICE};
use crate::device::{
    assert_ctl_context, assert_io_context, broadcast_volume, compute_reference_ratio, DeviceFlags,
    DeviceState, StreamFlags, StreamState,
};
use crate::error::{Error, Result};
use crate::format::{negotiate, FormatEncoding, FormatInfo};
use crate::hook::{HookResult, SubscriptionFacility, SubscriptionOperation};
use crate::memblock::{apply_volume, MemChunk, MAX_BLOCK_SIZE};
use crate::memblockq::MemBlockQ;
use crate::props::Props;
use crate::resampler::{new_resampler, ResampleMethod, Resampler};
use crate::sample::SampleSpec;
use crate::sink::{Sink, SinkMsg};
use crate::source::SHARE_TREE_DEPTH_MAX;
use crate::time::MicroSeconds;
use crate::volume::ChannelVolume;

/// The per-stream behavior supplied by the stream's creator; control thread
/// only.
pub trait SinkInputImpl {
    /// The stream is moving: `dest` is the new sink, or `None` when the
    /// stream is detached (or its move failed).
    fn moving(&mut self, input: &mut SinkInput, dest: Option<u32>) {
        let _ = (input, dest);
    }

    /// The stream is being killed.
    fn kill(&mut self, input: &mut SinkInput) {
        let _ = input;
    }

    /// The stream's device was suspended or resumed.
    fn suspend(&mut self, input: &mut SinkInput, suspended: bool) {
        let _ = (input, suspended);
    }
}

/// The IO-thread data path of a playback stream.
pub trait SinkInputBackend: Send {
    /// Produce up to `nbytes` of data in the stream's sample spec.
    ///
    /// An error is treated as an underrun.
    fn pop(&mut self, nbytes: usize) -> Result<MemChunk>;

    /// Rewind the not-yet-popped data by `nbytes` (stream spec); the next
    /// `pop` replays it.
    fn process_rewind(&mut self, nbytes: usize) {
        let _ = nbytes;
    }

    /// Called when the render queue ran dry; return `true` if every byte of
    /// valid data has been played.
    fn process_underrun(&mut self) -> bool {
        false
    }
}

/// An outstanding rewrite request, in the stream's sample spec.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Rewrite {
    /// Rewrite as much as the rewind allows ("drop all buffered").
    All,
    /// Rewrite up to this many bytes.
    Bytes(usize),
}

/// The IO thread's state for one attached input.
pub struct SinkInputIo {
    /// The stream's index.
    pub index: u32,
    /// Mirrored stream state.
    pub state: StreamState,
    /// The stream's sample spec.
    pub sample_spec: SampleSpec,
    /// The stream's channel map.
    pub channel_map: ChannelMap,
    /// The device's channel map, to decide where volume is applied.
    pub device_map: ChannelMap,
    /// Stream soft volume in the stream's map.
    pub soft_volume: ChannelVolume,
    /// Mirrored mute flag.
    pub muted: bool,
    /// Device-side volume factor in the device's map, applied after the
    /// resampler; `None` when neutral.
    pub volume_factor_device: Option<ChannelVolume>,
    /// Converts from the stream spec to the device spec.
    pub resampler: Option<Box<dyn Resampler>>,
    /// Rendered, device-spec data waiting to be mixed.
    pub render_memblockq: MemBlockQ,
    /// Bytes rendered since the last underrun, in device bytes.
    pub playing_for: u64,
    /// Bytes of silence inserted since data last flowed, in device bytes.
    pub underrun_for: u64,
    /// Whether all submitted data has been played.
    pub drained: Arc<AtomicBool>,
    rewrite: Option<Rewrite>,
    rewrite_flush: bool,
    dont_rewind_render: bool,
    /// The data path.
    pub backend: Box<dyn SinkInputBackend>,
}

impl SinkInputIo {
    /// Creates the IO state for a stream in `spec`/`map` playing to a
    /// device in `device_map`, with everything else neutral.
    pub fn new(
        index: u32,
        spec: SampleSpec,
        map: ChannelMap,
        device_map: ChannelMap,
        backend: Box<dyn SinkInputBackend>,
    ) -> Self {
        Self {
            index,
            state: StreamState::Init,
            sample_spec: spec,
            channel_map: map,
            device_map,
            soft_volume: ChannelVolume::norm(spec.channels as usize),
            muted: false,
            volume_factor_device: None,
            resampler: None,
            render_memblockq: MemBlockQ::new(),
            playing_for: 0,
            underrun_for: 0,
            drained: Arc::new(AtomicBool::new(false)),
            rewrite: None,
            rewrite_flush: false,
            dont_rewind_render: false,
            backend,
        }
    }

    /// Fills the render queue until `slength` device bytes are readable and
    /// returns the chunk at the read cursor.
    ///
    /// The returned volume is what the mixing stage still has to apply:
    /// neutral if the gain was applied here (channel maps differ), the mute
    /// volume, or the stream's soft volume.
    pub fn peek(&mut self, slength: usize, device_spec: &SampleSpec) -> (MemChunk, ChannelVolume) {
        assert_io_context();

        let apply_here = self.channel_map != self.device_map;

        while self.render_memblockq.length() < slength {
            let needed = slength - self.render_memblockq.length();
            let ilength = match &self.resampler {
                Some(r) => r.request(needed),
                None => needed,
            }
            .clamp(self.sample_spec.frame_size(), MAX_BLOCK_SIZE);

            let popped = if self.state == StreamState::Corked {
                Err(Error::BadState("corked".into()))
            } else {
                self.backend.pop(ilength)
            };

            let mut tchunk = match popped {
                Ok(chunk) if chunk.length > 0 => chunk,
                _ => {
                    // Underrun: pad with silence and remember how much.
                    self.render_memblockq.seek_write(slength as i64);
                    self.playing_for = 0;
                    self.underrun_for += slength as u64;
                    self.drained.store(true, Ordering::Release);
                    break;
                }
            };

            self.underrun_for = 0;
            self.drained.store(false, Ordering::Release);

            while tchunk.length > 0 {
                let mut wchunk = tchunk.split_prefix(MAX_BLOCK_SIZE);

                let out = match &mut self.resampler {
                    Some(resampler) => {
                        if apply_here && (!self.soft_volume.is_norm() || self.muted) {
                            if self.muted {
                                wchunk = MemChunk::silence(wchunk.length);
                            } else {
                                apply_volume(&mut wchunk, &self.sample_spec, &self.soft_volume);
                            }
                        }

                        let mut out = resampler.run(&wchunk);
                        if let Some(factor) = &self.volume_factor_device {
                            if out.length > 0 && !factor.is_norm() && !self.muted {
                                apply_volume(&mut out, device_spec, factor);
                            }
                        }
                        out
                    }
                    None => {
                        // Stream and device specs match; one pass covers
                        // both gains.
                        let combined = match (apply_here, &self.volume_factor_device) {
                            (true, Some(factor)) => Some(self.soft_volume.multiply(factor)),
                            (true, None) => Some(self.soft_volume),
                            (false, Some(factor)) => Some(*factor),
                            (false, None) => None,
                        };
                        if apply_here && self.muted {
                            wchunk = MemChunk::silence(wchunk.length);
                        } else if let Some(combined) = combined.filter(|c| !c.is_norm()) {
                            if !self.muted {
                                apply_volume(&mut wchunk, &self.sample_spec, &combined);
                            }
                        }
                        wchunk
                    }
                };
                if out.length == 0 {
                    continue;
                }

                self.playing_for += out.length as u64;
                self.render_memblockq.push(out);
            }
        }

        let mut chunk = self
            .render_memblockq
            .peek()
            .unwrap_or_else(|| MemChunk::silence(slength));
        chunk.length = chunk.length.min(slength).min(MAX_BLOCK_SIZE);

        let channels = self.device_map.num_channels() as usize;
        let volume = if apply_here {
            ChannelVolume::norm(channels)
        } else if self.muted {
            ChannelVolume::muted(channels)
        } else {
            self.soft_volume
        };

        (chunk, volume)
    }

    /// Advances the render queue's read cursor.
    pub fn drop_bytes(&mut self, nbytes: usize) {
        assert_io_context();
        self.render_memblockq.drop_bytes(nbytes);
    }

    /// Returns `true` when the stream has genuinely run out of data: the
    /// render queue is empty and the implementor confirms everything valid
    /// has been played. The queue is silenced so later peeks cannot rewind
    /// into the played region.
    pub fn process_underrun(&mut self) -> bool {
        assert_io_context();

        if self.render_memblockq.length() > 0 {
            return false;
        }
        if !self.backend.process_underrun() {
            return false;
        }

        self.render_memblockq.silence();
        true
    }

    /// Requests that already-rendered data be rewritten.
    ///
    /// `nbytes` is in the stream's sample spec; `usize::MAX` means "drop all
    /// buffered data". The request is merged with any outstanding one,
    /// capped at what has actually been emitted, and the translated device
    /// amount is returned for [`crate::sink::SinkThreadInfo::request_rewind`].
    pub fn request_rewind(
        &mut self,
        nbytes: usize,
        rewrite: bool,
        flush: bool,
        dont_rewind_render: bool,
    ) -> usize {
        assert_io_context();

        if rewrite {
            let req = if nbytes == usize::MAX {
                Rewrite::All
            } else {
                Rewrite::Bytes(nbytes)
            };
            self.rewrite = Some(match (self.rewrite, req) {
                (Some(Rewrite::All), _) | (_, Rewrite::All) => Rewrite::All,
                (Some(Rewrite::Bytes(a)), Rewrite::Bytes(b)) => Rewrite::Bytes(a.max(b)),
                (None, r) => r,
            });
            self.rewrite_flush |= flush;
        }
        self.dont_rewind_render |= dont_rewind_render;

        // Translate into the device domain, bounded by what was emitted.
        let device_bytes = match &self.resampler {
            Some(r) => r.result(nbytes.min(MAX_BLOCK_SIZE * 64)),
            None => nbytes,
        };
        (device_bytes as u64).min(self.playing_for) as usize
    }

    /// The device rewound its buffer by `nbytes` device bytes; re-run the
    /// rewrite protocol so the queue and the implementor agree on the
    /// stream position.
    pub fn process_rewind(&mut self, nbytes: usize) {
        assert_io_context();

        if !self.dont_rewind_render {
            self.render_memblockq.rewind(nbytes);
        }

        if let Some(rewrite) = self.rewrite {
            // Everything between the rewound point and the write cursor may
            // be rewritten.
            let max_rewrite = nbytes + self.render_memblockq.length();
            let max_local = match &self.resampler {
                Some(r) => r.request(max_rewrite),
                None => max_rewrite,
            };
            let amount = match rewrite {
                Rewrite::All => max_local,
                Rewrite::Bytes(b) => b.min(max_local),
            };

            if amount > 0 {
                self.backend.process_rewind(amount);
                let out_amount = match &self.resampler {
                    Some(r) => r.result(amount),
                    None => amount,
                };
                self.render_memblockq.seek_write(-(out_amount as i64));
                if self.rewrite_flush {
                    self.render_memblockq.silence();
                }
                if let Some(r) = &mut self.resampler {
                    r.reset();
                }
            }
        }

        self.rewrite = None;
        self.rewrite_flush = false;
        self.dont_rewind_render = false;
    }

    /// The device's rewind budget changed.
    pub fn update_max_rewind(&mut self, max_rewind: usize) {
        self.render_memblockq.set_max_rewind(max_rewind);
    }
}

impl std::fmt::Debug for SinkInputIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkInputIo")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("queued", &self.render_memblockq.length())
            .finish()
    }
}

/// Builder for a new sink input.
pub struct SinkInputNewData {
    /// The sink to attach to, by index.
    pub sink: Option<u32>,
    /// The sink to attach to, by name; used if `sink` is absent.
    pub sink_name: Option<String>,
    /// Owning client.
    pub client: Option<u32>,
    /// Owning module.
    pub module: Option<u32>,
    /// Arbitrary properties.
    pub props: Props,
    /// Requested sample spec; the device's is used if absent.
    pub sample_spec: Option<SampleSpec>,
    /// Requested channel map; derived if absent.
    pub channel_map: Option<ChannelMap>,
    /// Requested formats, negotiated against the device's advertised ones.
    pub req_formats: Vec<FormatInfo>,
    /// Behavior flags.
    pub flags: StreamFlags,
    /// Initial volume.
    pub volume: Option<ChannelVolume>,
    /// Internal adjustment always applied, in the stream's map.
    pub volume_factor: Option<ChannelVolume>,
    /// Device-side adjustment, in the device's map.
    pub volume_factor_device: Option<ChannelVolume>,
    /// Initial mute.
    pub muted: bool,
    /// Requested conversion algorithm.
    pub resample_method: ResampleMethod,
    /// For filter devices: the sharing device this stream is the master
    /// edge of.
    pub origin_sink: Option<u32>,
    /// An existing stream to start and stop together with.
    pub sync_with: Option<u32>,
    /// The data path. Mandatory.
    pub backend: Option<Box<dyn SinkInputBackend>>,
    /// Per-stream behavior callbacks.
    pub imp: Option<Box<dyn SinkInputImpl>>,
    /// Whether the initial volume came from persistent state.
    pub save_volume: bool,
    /// Whether the initial mute came from persistent state.
    pub save_muted: bool,
}

impl SinkInputNewData {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self {
            sink: None,
            sink_name: None,
            client: None,
            module: None,
            props: Props::new(),
            sample_spec: None,
            channel_map: None,
            req_formats: Vec::new(),
            flags: StreamFlags::empty(),
            volume: None,
            volume_factor: None,
            volume_factor_device: None,
            muted: false,
            resample_method: ResampleMethod::Auto,
            origin_sink: None,
            sync_with: None,
            backend: None,
            imp: None,
            save_volume: false,
            save_muted: false,
        }
    }
}

impl Default for SinkInputNewData {
    fn default() -> Self {
        Self::new()
    }
}

/// A playback stream attached to a sink.
pub struct SinkInput {
    /// Stable index into the core's stream set.
    pub index: u32,
    /// The sink this stream is attached to; `None` while moving.
    pub sink: Option<u32>,
    /// For filter devices: the sharing device this stream is the master
    /// edge of.
    pub origin_sink: Option<u32>,
    /// Owning client.
    pub client: Option<u32>,
    /// Owning module.
    pub module: Option<u32>,
    /// Arbitrary properties.
    pub props: Props,
    /// Behavior flags.
    pub flags: StreamFlags,
    /// Lifecycle state.
    pub state: StreamState,
    /// The negotiated format.
    pub format: FormatInfo,
    /// The stream's sample spec.
    pub sample_spec: SampleSpec,
    /// The stream's channel map.
    pub channel_map: ChannelMap,
    /// The conversion algorithm the creator asked for.
    pub requested_resample_method: ResampleMethod,
    /// The conversion algorithm in use.
    pub actual_resample_method: ResampleMethod,
    /// User-visible volume, in the stream's map.
    pub volume: ChannelVolume,
    /// Internal adjustment always applied; the product of the named factor
    /// layers.
    pub volume_factor: ChannelVolume,
    /// Named contributions multiplied into `volume_factor`.
    pub volume_factor_items: BTreeMap<String, ChannelVolume>,
    /// Device-side adjustment; remapped between device maps on move.
    pub volume_factor_device: ChannelVolume,
    /// Which channel map `volume_factor_device` currently lives in.
    pub volume_factor_device_map: ChannelMap,
    /// `volume / device.reference_volume`.
    pub reference_ratio: ChannelVolume,
    /// `volume / device.real_volume`.
    pub real_ratio: ChannelVolume,
    /// `real_ratio × volume_factor`; applied in the IO path.
    pub soft_volume: ChannelVolume,
    /// Mute state.
    pub muted: bool,
    /// Whether the volume should be persisted.
    pub save_volume: bool,
    /// Whether the mute should be persisted.
    pub save_muted: bool,
    /// Previous member of the sync chain.
    pub sync_prev: Option<u32>,
    /// Next member of the sync chain.
    pub sync_next: Option<u32>,
    /// Whether all submitted data has been played; shared with the IO side.
    pub drained: Arc<AtomicBool>,
    /// This stream's latency request.
    pub requested_latency: Option<MicroSeconds>,
    /// Per-stream behavior callbacks; dropped on unlink.
    pub imp: Option<Box<dyn SinkInputImpl>>,
    /// The IO state, held here while detached (or when the device runs
    /// without an IO thread).
    pub io: Option<Box<SinkInputIo>>,
}

impl std::fmt::Debug for SinkInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkInput")
            .field("index", &self.index)
            .field("sink", &self.sink)
            .field("state", &self.state)
            .finish()
    }
}

impl SinkInput {
    /// Creates a sink input from a builder: resolves the sink, negotiates
    /// the format, and fixes up spec and map.
    pub fn new(core: &mut Core, mut data: SinkInputNewData) -> Result<u32> {
        assert_ctl_context();

        let sidx = match data.sink {
            Some(idx) => idx,
            None => {
                let name = data
                    .sink_name
                    .as_deref()
                    .ok_or_else(|| Error::Invalid("no sink given".into()))?;
                core.sink_by_name(name)
                    .ok_or_else(|| Error::NoEntity(name.to_owned()))?
            }
        };

        let (dev_spec, dev_map, dev_state, n_inputs, advertised) = {
            let s = core.sinks.get(sidx).ok_or(Error::NoEntity(sidx.to_string()))?;
            if s.state == DeviceState::Unlinked {
                return Err(Error::BadState("sink is unlinked".into()));
            }
            let advertised = match &s.imp {
                Some(imp) => imp.get_formats(s),
                None => vec![FormatInfo::new(FormatEncoding::Pcm)],
            };
            (
                s.sample_spec,
                s.channel_map,
                s.state,
                s.inputs.len(),
                advertised,
            )
        };

        if dev_state == DeviceState::Suspended
            && data.flags.contains(StreamFlags::NO_CREATE_ON_SUSPEND)
        {
            return Err(Error::BadState("sink is suspended".into()));
        }
        if n_inputs >= MAX_STREAMS_PER_DEVICE {
            return Err(Error::TooLarge);
        }

        let format = if data.req_formats.is_empty() {
            FormatInfo::new(FormatEncoding::Pcm)
        } else {
            negotiate(&data.req_formats, &advertised)?
        };

        let passthrough = !format.is_pcm() || data.flags.contains(StreamFlags::PASSTHROUGH);
        if passthrough && (n_inputs > 0 || Sink::is_passthrough(core, sidx)) {
            return Err(Error::Busy);
        }
        if !passthrough && Sink::is_passthrough(core, sidx) {
            return Err(Error::Busy);
        }

        if let Some(other) = data.sync_with {
            let o = core
                .sink_inputs
                .get(other)
                .ok_or(Error::NoEntity(other.to_string()))?;
            if o.sink != Some(sidx) {
                return Err(Error::Invalid(
                    "sync partner lives on a different sink".into(),
                ));
            }
        }

        let mut spec = data.sample_spec.unwrap_or(dev_spec);
        if data.flags.contains(StreamFlags::FIX_FORMAT) {
            spec.format = dev_spec.format;
        }
        if data.flags.contains(StreamFlags::FIX_RATE) {
            spec.rate = dev_spec.rate;
        }
        if data.flags.contains(StreamFlags::FIX_CHANNELS) {
            spec.channels = dev_spec.channels;
            data.channel_map = Some(dev_map);
        }
        let spec = SampleSpec::new(spec.format, spec.channels, spec.rate)?;

        let channel_map = match data.channel_map {
            Some(map) if map.compatible_with(&spec) => map,
            Some(_) => {
                return Err(Error::Invalid(
                    "channel map does not match sample spec".into(),
                ))
            }
            None => ChannelMap::default_for(spec.channels)?,
        };

        let volume = match data.volume {
            Some(v) => broadcast_volume(&v, spec.channels)
                .ok_or_else(|| Error::Invalid("volume does not match sample spec".into()))?,
            None => ChannelVolume::norm(spec.channels as usize),
        };
        let volume_factor = data
            .volume_factor
            .unwrap_or_else(|| ChannelVolume::norm(spec.channels as usize));
        let volume_factor_device = data
            .volume_factor_device
            .unwrap_or_else(|| ChannelVolume::norm(dev_map.num_channels() as usize));

        let backend = data
            .backend
            .take()
            .ok_or_else(|| Error::Invalid("sink input needs a data path".into()))?;

        let requested_resample_method = data.resample_method;
        let drained = Arc::new(AtomicBool::new(false));

        let mut volume_factor_items = BTreeMap::new();
        if !volume_factor.is_norm() {
            volume_factor_items.insert("internal".to_owned(), volume_factor);
        }

        let idx = core.sink_inputs.insert_with(|index| SinkInput {
            index,
            sink: Some(sidx),
            origin_sink: data.origin_sink,
            client: data.client,
            module: data.module,
            props: data.props,
            flags: data.flags,
            state: StreamState::Init,
            format,
            sample_spec: spec,
            channel_map,
            requested_resample_method,
            actual_resample_method: requested_resample_method,
            volume,
            volume_factor,
            volume_factor_items,
            volume_factor_device,
            volume_factor_device_map: dev_map,
            reference_ratio: ChannelVolume::norm(spec.channels as usize),
            real_ratio: ChannelVolume::norm(spec.channels as usize),
            soft_volume: ChannelVolume::norm(spec.channels as usize),
            muted: data.muted,
            save_volume: data.save_volume,
            save_muted: data.save_muted,
            sync_prev: None,
            sync_next: None,
            drained: Arc::clone(&drained),
            requested_latency: None,
            imp: data.imp,
            io: Some(Box::new({
                let mut io = SinkInputIo::new(index, spec, channel_map, dev_map, backend);
                io.muted = data.muted;
                io.drained = drained;
                io
            })),
        });

        // Link into the sync chain at the end.
        if let Some(other) = data.sync_with {
            let mut tail = other;
            for _ in 0..MAX_STREAMS_PER_DEVICE {
                match core.sink_inputs.get(tail).and_then(|i| i.sync_next) {
                    Some(next) => tail = next,
                    None => break,
                }
            }
            core.sink_inputs.get_mut(tail).unwrap().sync_next = Some(idx);
            core.sink_inputs.get_mut(idx).unwrap().sync_prev = Some(tail);
        }

        debug!("created sink input {} on sink {}", idx, sidx);
        Ok(idx)
    }

    /// Publishes the stream: attaches it to its sink, instantiates the
    /// resampler, and recomputes the device volume.
    pub fn put(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let (sidx, start_corked, passthrough) = {
            let i = core
                .sink_inputs
                .get(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            assert_eq!(i.state, StreamState::Init);
            (
                i.sink.expect("new stream must have a sink"),
                i.flags.contains(StreamFlags::START_CORKED),
                i.is_passthrough(),
            )
        };

        {
            let s = core.sinks.get_mut(sidx).unwrap();
            s.inputs.insert(idx);
            if start_corked {
                s.n_corked += 1;
            }
        }

        let i = core.sink_inputs.get_mut(idx).unwrap();
        i.state = if start_corked {
            StreamState::Corked
        } else {
            StreamState::Running
        };

        Self::refit_io(core, idx, sidx)?;
        Self::ship_io(core, idx, sidx)?;
        Self::recompute_volumes(core, idx, sidx)?;

        if passthrough {
            Sink::enter_passthrough(core, sidx)?;
        }

        Sink::update_status(core, sidx)?;
        Sink::update_requested_latency(core, sidx)?;
        core.subscription_post(
            SubscriptionFacility::SinkInput,
            SubscriptionOperation::New,
            idx,
        );
        Ok(())
    }

    fn refit_io(core: &mut Core, idx: u32, sidx: u32) -> Result<()> {
        let (dev_spec, dev_map) = {
            let s = core.sinks.get(sidx).unwrap();
            (s.sample_spec, s.channel_map)
        };

        let i = core.sink_inputs.get_mut(idx).unwrap();
        let needs_resampler = i.format.is_pcm()
            && (dev_spec != i.sample_spec || dev_map != i.channel_map)
            && !i.flags.contains(StreamFlags::NO_REMAP | StreamFlags::NO_REMIX);

        let resampler = if needs_resampler {
            Some(new_resampler(
                i.sample_spec,
                i.channel_map,
                dev_spec,
                dev_map,
                i.requested_resample_method,
            )?)
        } else {
            None
        };
        i.actual_resample_method = resampler
            .as_ref()
            .map(|r| r.method())
            .unwrap_or(i.requested_resample_method);

        let vfd = if i.volume_factor_device.is_norm() {
            None
        } else {
            Some(
                i.volume_factor_device
                    .remap(&i.volume_factor_device_map, &dev_map),
            )
        };

        let io = i.io.as_mut().expect("detached stream must hold its IO state");
        io.state = i.state;
        io.device_map = dev_map;
        io.resampler = resampler;
        io.soft_volume = i.soft_volume;
        io.volume_factor_device = vfd;
        io.muted = i.muted;
        Ok(())
    }

    fn ship_io(core: &mut Core, idx: u32, sidx: u32) -> Result<()> {
        let has_q = core.sinks.get(sidx).unwrap().msgq.is_some();
        if !has_q {
            return Ok(());
        }

        let io = core
            .sink_inputs
            .get_mut(idx)
            .unwrap()
            .io
            .take()
            .expect("IO state already shipped");
        let s = core.sinks.get(sidx).unwrap();
        s.msgq.as_ref().unwrap().send(SinkMsg::AddInput(io))?;
        Ok(())
    }

    fn recompute_volumes(core: &mut Core, idx: u32, sidx: u32) -> Result<()> {
        let root = Sink::shared_root(core, sidx);
        let flat = core
            .sinks
            .get(root)
            .unwrap()
            .flags
            .contains(DeviceFlags::FLAT_VOLUME);

        if flat {
            Sink::set_volume(core, root, None, true, false)
        } else {
            let (reference, dev_map) = {
                let s = core.sinks.get(sidx).unwrap();
                (s.reference_volume, s.channel_map)
            };
            let i = core.sink_inputs.get_mut(idx).unwrap();
            i.reference_ratio = compute_reference_ratio(
                &i.volume,
                &i.channel_map,
                &i.reference_ratio,
                &reference,
                &dev_map,
            );
            i.real_ratio = i.volume;
            i.soft_volume = i.volume.multiply(&i.volume_factor);
            Self::send_soft_volume(core, idx)
        }
    }

    pub(crate) fn send_soft_volume(core: &Core, idx: u32) -> Result<()> {
        let i = core
            .sink_inputs
            .get(idx)
            .ok_or(Error::NoEntity(idx.to_string()))?;
        let Some(sidx) = i.sink else {
            return Ok(());
        };
        let s = core.sinks.get(sidx).unwrap();
        if let Some(q) = &s.msgq {
            q.send(SinkMsg::SetInputSoftVolume {
                index: idx,
                soft: i.soft_volume,
                muted: i.muted,
            })?;
        }
        Ok(())
    }

    /// Detaches and removes the stream.
    pub fn unlink(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let (sidx, was_corked, was_init, passthrough) = {
            let i = core
                .sink_inputs
                .get(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            if i.state == StreamState::Unlinked {
                return Ok(());
            }
            (
                i.sink,
                i.state == StreamState::Corked,
                i.state == StreamState::Init,
                i.is_passthrough(),
            )
        };

        // Unlink from the sync chain.
        {
            let (prev, next) = {
                let i = core.sink_inputs.get(idx).unwrap();
                (i.sync_prev, i.sync_next)
            };
            if let Some(p) = prev {
                if let Some(pi) = core.sink_inputs.get_mut(p) {
                    pi.sync_next = next;
                }
            }
            if let Some(n) = next {
                if let Some(ni) = core.sink_inputs.get_mut(n) {
                    ni.sync_prev = prev;
                }
            }
            let i = core.sink_inputs.get_mut(idx).unwrap();
            i.sync_prev = None;
            i.sync_next = None;
        }

        if let Some(sidx) = sidx {
            {
                let s = core.sinks.get_mut(sidx).unwrap();
                s.inputs.remove(&idx);
                if was_corked {
                    s.n_corked = s.n_corked.saturating_sub(1);
                }
                if let Some(q) = &s.msgq {
                    q.send(SinkMsg::RemoveInput(idx))?;
                }
            }

            if passthrough {
                Sink::leave_passthrough(core, sidx)?;
            }

            let root = Sink::shared_root(core, sidx);
            if core
                .sinks
                .get(root)
                .unwrap()
                .flags
                .contains(DeviceFlags::FLAT_VOLUME)
            {
                Sink::set_volume(core, root, None, true, false)?;
            }

            Sink::update_status(core, sidx)?;
            Sink::update_requested_latency(core, sidx)?;
        }

        let i = core.sink_inputs.get_mut(idx).unwrap();
        i.state = StreamState::Unlinked;
        i.sink = None;
        i.imp = None;
        i.io = None;

        if !was_init {
            core.subscription_post(
                SubscriptionFacility::SinkInput,
                SubscriptionOperation::Remove,
                idx,
            );
        }
        Ok(())
    }

    /// Kills the stream: notifies the implementor, then unlinks.
    pub fn kill(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        {
            let Some(i) = core.sink_inputs.get_mut(idx) else {
                return Ok(());
            };
            if i.state == StreamState::Unlinked {
                return Ok(());
            }
            let mut imp = i.imp.take();
            if let Some(im) = imp.as_mut() {
                im.kill(i);
            }
            i.imp = imp;
        }
        Self::unlink(core, idx)
    }

    /// Pauses or resumes the stream, together with its sync chain.
    pub fn cork(core: &mut Core, idx: u32, on: bool) -> Result<()> {
        assert_ctl_context();

        // Collect the whole sync chain first.
        let mut chain = vec![idx];
        let mut at = idx;
        while let Some(p) = core.sink_inputs.get(at).and_then(|i| i.sync_prev) {
            chain.push(p);
            at = p;
        }
        at = idx;
        while let Some(n) = core.sink_inputs.get(at).and_then(|i| i.sync_next) {
            chain.push(n);
            at = n;
        }

        for member in chain {
            Self::cork_one(core, member, on)?;
        }
        Ok(())
    }

    fn cork_one(core: &mut Core, idx: u32, on: bool) -> Result<()> {
        let sidx = {
            let i = core
                .sink_inputs
                .get_mut(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            let new_state = if on {
                StreamState::Corked
            } else {
                StreamState::Running
            };
            if i.state == new_state {
                return Ok(());
            }
            if !matches!(
                i.state,
                StreamState::Running | StreamState::Corked | StreamState::Drained
            ) {
                return Err(Error::BadState("stream is not linked".into()));
            }
            let was_corked = i.state == StreamState::Corked;
            i.state = new_state;
            (i.sink, was_corked)
        };

        let (sink, was_corked) = sidx;
        if let Some(sidx) = sink {
            {
                let s = core.sinks.get_mut(sidx).unwrap();
                if on && !was_corked {
                    s.n_corked += 1;
                } else if !on && was_corked {
                    s.n_corked = s.n_corked.saturating_sub(1);
                }
                if let Some(q) = &s.msgq {
                    q.send(SinkMsg::SetInputState {
                        index: idx,
                        state: if on {
                            StreamState::Corked
                        } else {
                            StreamState::Running
                        },
                    })?;
                }
            }
            Sink::update_status(core, sidx)?;
        }

        core.subscription_post(
            SubscriptionFacility::SinkInput,
            SubscriptionOperation::Change,
            idx,
        );
        Ok(())
    }

    /// Whether this stream forwards an unmixable bitstream.
    pub fn is_passthrough(&self) -> bool {
        !self.format.is_pcm() || self.flags.contains(StreamFlags::PASSTHROUGH)
    }

    /// Sets the stream volume. With `absolute` unset on a flat-volume
    /// device, `v` is relative to the device's reference volume.
    pub fn set_volume(
        core: &mut Core,
        idx: u32,
        v: &ChannelVolume,
        save: bool,
        absolute: bool,
    ) -> Result<()> {
        assert_ctl_context();

        let (sidx, channels) = {
            let i = core
                .sink_inputs
                .get(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            if i.is_passthrough() {
                return Err(Error::NotSupported);
            }
            (i.sink, i.sample_spec.channels)
        };

        let v = broadcast_volume(v, channels)
            .ok_or_else(|| Error::Invalid("volume does not match sample spec".into()))?;

        let (flat, root) = match sidx {
            Some(sidx) => {
                let root = Sink::shared_root(core, sidx);
                (
                    core.sinks
                        .get(root)
                        .unwrap()
                        .flags
                        .contains(DeviceFlags::FLAT_VOLUME),
                    Some(root),
                )
            }
            None => (false, None),
        };

        let v = if !absolute && flat {
            let root = root.unwrap();
            let (reference, root_map) = {
                let s = core.sinks.get(root).unwrap();
                (s.reference_volume, s.channel_map)
            };
            let i = core.sink_inputs.get(idx).unwrap();
            v.multiply(&reference.remap(&root_map, &i.channel_map))
        } else {
            v
        };

        {
            let i = core.sink_inputs.get_mut(idx).unwrap();
            i.volume = v;
            i.save_volume = save;
        }

        if let Some(sidx) = sidx {
            if flat {
                Sink::set_volume(core, root.unwrap(), None, true, save)?;
            } else {
                let (reference, dev_map) = {
                    let s = core.sinks.get(sidx).unwrap();
                    (s.reference_volume, s.channel_map)
                };
                let i = core.sink_inputs.get_mut(idx).unwrap();
                i.reference_ratio = compute_reference_ratio(
                    &i.volume,
                    &i.channel_map,
                    &i.reference_ratio,
                    &reference,
                    &dev_map,
                );
                i.real_ratio = i.volume;
                i.soft_volume = i.volume.multiply(&i.volume_factor);
                Self::send_soft_volume(core, idx)?;
            }
        }

        core.subscription_post(
            SubscriptionFacility::SinkInput,
            SubscriptionOperation::Change,
            idx,
        );
        Ok(())
    }

    /// Sets the stream mute flag.
    pub fn set_mute(core: &mut Core, idx: u32, muted: bool, save: bool) -> Result<()> {
        assert_ctl_context();

        {
            let i = core
                .sink_inputs
                .get_mut(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            if i.muted == muted {
                i.save_muted |= save;
                return Ok(());
            }
            i.muted = muted;
            i.save_muted = save;
        }

        Self::send_soft_volume(core, idx)?;
        core.subscription_post(
            SubscriptionFacility::SinkInput,
            SubscriptionOperation::Change,
            idx,
        );
        Ok(())
    }

    /// Adds (or replaces) a named volume-factor layer; the product of all
    /// layers is the stream's `volume_factor`.
    pub fn add_volume_factor(
        core: &mut Core,
        idx: u32,
        key: &str,
        factor: &ChannelVolume,
    ) -> Result<()> {
        assert_ctl_context();

        {
            let i = core
                .sink_inputs
                .get_mut(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            let factor = broadcast_volume(factor, i.sample_spec.channels)
                .ok_or_else(|| Error::Invalid("factor does not match sample spec".into()))?;
            if i.volume_factor_items.insert(key.to_owned(), factor).is_some() {
                warn!("sink input {}: volume factor \"{}\" replaced", idx, key);
            }
        }
        Self::recompute_volume_factor(core, idx)
    }

    /// Removes a named volume-factor layer.
    pub fn remove_volume_factor(core: &mut Core, idx: u32, key: &str) -> Result<()> {
        assert_ctl_context();

        {
            let i = core
                .sink_inputs
                .get_mut(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            if i.volume_factor_items.remove(key).is_none() {
                return Err(Error::NoEntity(key.to_owned()));
            }
        }
        Self::recompute_volume_factor(core, idx)
    }

    fn recompute_volume_factor(core: &mut Core, idx: u32) -> Result<()> {
        {
            let i = core.sink_inputs.get_mut(idx).unwrap();
            let mut product = ChannelVolume::norm(i.sample_spec.channels as usize);
            for factor in i.volume_factor_items.values() {
                product = product.multiply(factor);
            }
            i.volume_factor = product;
            i.soft_volume = i.real_ratio.multiply(&i.volume_factor);
        }
        Self::send_soft_volume(core, idx)
    }

    /// Updates this stream's latency request and renegotiates the device's.
    pub fn set_requested_latency(
        core: &mut Core,
        idx: u32,
        latency: Option<MicroSeconds>,
    ) -> Result<()> {
        assert_ctl_context();

        let sidx = {
            let i = core
                .sink_inputs
                .get_mut(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            i.requested_latency = latency.map(|l| l.clamp_latency());
            i.sink
        };

        if let Some(sidx) = sidx {
            Sink::update_requested_latency(core, sidx)?;
        }
        Ok(())
    }

    /// Changes the stream's sample rate (variable-rate streams only).
    pub fn set_rate(core: &mut Core, idx: u32, rate: u32) -> Result<()> {
        assert_ctl_context();

        {
            let i = core
                .sink_inputs
                .get_mut(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            if !i.flags.contains(StreamFlags::VARIABLE_RATE) {
                return Err(Error::NotSupported);
            }
            let spec = SampleSpec::new(i.sample_spec.format, i.sample_spec.channels, rate)?;
            i.sample_spec = spec;
        }
        Self::update_rate(core, idx)
    }

    /// Resyncs the resampler with the device's sample spec.
    pub fn update_rate(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let (sidx, shipped) = {
            let i = core
                .sink_inputs
                .get(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            let Some(sidx) = i.sink else {
                return Ok(());
            };
            (sidx, i.io.is_none())
        };

        if shipped {
            let io = Self::take_io(core, idx, sidx)?;
            core.sink_inputs.get_mut(idx).unwrap().io = Some(io);
            Self::refit_io(core, idx, sidx)?;
            Self::ship_io(core, idx, sidx)?;
        } else {
            Self::refit_io(core, idx, sidx)?;
        }
        Ok(())
    }

    fn take_io(core: &mut Core, idx: u32, sidx: u32) -> Result<Box<SinkInputIo>> {
        let s = core.sinks.get(sidx).unwrap();
        let q = s
            .msgq
            .as_ref()
            .ok_or_else(|| Error::BadState("no IO thread".into()))?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        q.send(SinkMsg::TakeInput { index: idx, reply: tx })?;
        rx.recv()
            .map_err(|_| Error::BadState("IO thread is gone".into()))?
            .ok_or_else(|| Error::NoEntity(idx.to_string()))
    }

    /// Whether the stream may be moved at all. Sync-group members may not.
    pub fn may_move(core: &Core, idx: u32) -> bool {
        let Some(i) = core.sink_inputs.get(idx) else {
            return false;
        };
        i.state != StreamState::Unlinked
            && !i.flags.contains(StreamFlags::DONT_MOVE)
            && i.sync_prev.is_none()
            && i.sync_next.is_none()
    }

    /// Whether the stream may be moved to `dest`.
    pub fn may_move_to(core: &Core, idx: u32, dest: u32) -> bool {
        if !Self::may_move(core, idx) {
            return false;
        }
        let Some(i) = core.sink_inputs.get(idx) else {
            return false;
        };
        if i.sink == Some(dest) {
            return false;
        }
        let Some(d) = core.sinks.get(dest) else {
            return false;
        };
        if d.state == DeviceState::Unlinked {
            return false;
        }
        if d.inputs.len() >= MAX_STREAMS_PER_DEVICE {
            return false;
        }

        let mut at = dest;
        for _ in 0..SHARE_TREE_DEPTH_MAX {
            if Some(at) == i.origin_sink {
                return false;
            }
            let Some(s) = core.sinks.get(at) else {
                break;
            };
            let Some(edge) = s.input_to_master else {
                break;
            };
            if edge == idx {
                return false;
            }
            let Some(next) = core.sink_inputs.get(edge).and_then(|e| e.sink) else {
                break;
            };
            at = next;
        }
        true
    }

    /// First phase of a move: detaches the stream from its sink.
    pub fn start_move(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let (sidx, passthrough) = {
            let i = core
                .sink_inputs
                .get(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            (
                i.sink
                    .ok_or_else(|| Error::BadState("stream is not attached".into()))?,
                i.is_passthrough(),
            )
        };

        let mut ev = MoveEvent {
            stream: idx,
            dest: None,
        };
        core.hooks.sink_input_move_start.fire(&mut ev);

        let was_corked = core.sink_inputs.get(idx).unwrap().state == StreamState::Corked;
        {
            let s = core.sinks.get_mut(sidx).unwrap();
            s.inputs.remove(&idx);
            if was_corked {
                s.n_corked = s.n_corked.saturating_sub(1);
            }
        }

        if passthrough {
            Sink::leave_passthrough(core, sidx)?;
        }

        let root = Sink::shared_root(core, sidx);
        if core
            .sinks
            .get(root)
            .unwrap()
            .flags
            .contains(DeviceFlags::FLAT_VOLUME)
        {
            Sink::set_volume(core, root, None, true, false)?;
        }

        let has_q = core.sinks.get(sidx).unwrap().msgq.is_some();
        if has_q {
            let io = Self::take_io(core, idx, sidx)?;
            core.sink_inputs.get_mut(idx).unwrap().io = Some(io);
        }

        core.sink_inputs.get_mut(idx).unwrap().sink = None;

        Sink::update_status(core, sidx)?;
        Sink::update_requested_latency(core, sidx)?;
        Ok(())
    }

    /// Second phase of a move: attaches the stream to `dest`.
    pub fn finish_move(core: &mut Core, idx: u32, dest: u32, save: bool) -> Result<()> {
        assert_ctl_context();

        {
            let i = core
                .sink_inputs
                .get(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            if i.sink.is_some() {
                return Err(Error::BadState("stream is still attached".into()));
            }
        }
        {
            let d = core.sinks.get(dest).ok_or(Error::NoEntity(dest.to_string()))?;
            if d.state == DeviceState::Unlinked {
                return Err(Error::BadState("destination is unlinked".into()));
            }
            if d.inputs.len() >= MAX_STREAMS_PER_DEVICE {
                return Err(Error::TooLarge);
            }
        }

        let mut ev = MoveEvent {
            stream: idx,
            dest: Some(dest),
        };
        if core.hooks.sink_input_move_finish.fire(&mut ev) == HookResult::Cancel {
            return Err(Error::NotSupported);
        }

        let (is_pt, stream_rate) = {
            let i = core.sink_inputs.get(idx).unwrap();
            (i.is_passthrough(), i.sample_spec.rate)
        };
        if is_pt && Sink::is_passthrough(core, dest) {
            return Err(Error::Busy);
        }

        let dest_rate = core.sinks.get(dest).unwrap().sample_spec.rate;
        if dest_rate != stream_rate {
            let _ = Sink::update_rate(core, dest, stream_rate, is_pt);
        }

        {
            let i = core.sink_inputs.get_mut(idx).unwrap();
            let mut imp = i.imp.take();
            if let Some(im) = imp.as_mut() {
                im.moving(i, Some(dest));
            }
            i.imp = imp;
        }

        let was_corked = core.sink_inputs.get(idx).unwrap().state == StreamState::Corked;
        {
            let s = core.sinks.get_mut(dest).unwrap();
            s.inputs.insert(idx);
            if was_corked {
                s.n_corked += 1;
            }
        }

        let dest_map = core.sinks.get(dest).unwrap().channel_map;
        {
            let i = core.sink_inputs.get_mut(idx).unwrap();
            i.sink = Some(dest);
            i.volume_factor_device = i
                .volume_factor_device
                .remap(&i.volume_factor_device_map, &dest_map);
            i.volume_factor_device_map = dest_map;
        }

        Self::update_volume_due_to_moving(core, idx, dest)?;
        Self::refit_io(core, idx, dest)?;
        Self::ship_io(core, idx, dest)?;

        let root = Sink::shared_root(core, dest);
        if core
            .sinks
            .get(root)
            .unwrap()
            .flags
            .contains(DeviceFlags::FLAT_VOLUME)
        {
            Sink::set_volume(core, root, None, true, false)?;
        } else {
            Self::send_soft_volume(core, idx)?;
        }

        if is_pt {
            Sink::enter_passthrough(core, dest)?;
        }

        {
            let i = core.sink_inputs.get_mut(idx).unwrap();
            i.save_volume = i.save_volume || save;
        }

        Sink::update_status(core, dest)?;
        Sink::update_requested_latency(core, dest)?;
        core.subscription_post(
            SubscriptionFacility::SinkInput,
            SubscriptionOperation::Change,
            idx,
        );
        Ok(())
    }

    fn update_volume_due_to_moving(core: &mut Core, idx: u32, dest: u32) -> Result<()> {
        let root = Sink::shared_root(core, dest);
        let (flat, root_ref, root_real, root_map) = {
            let r = core.sinks.get(root).unwrap();
            (
                r.flags.contains(DeviceFlags::FLAT_VOLUME),
                r.reference_volume,
                r.real_volume,
                r.channel_map,
            )
        };

        let origin = core.sink_inputs.get(idx).unwrap().origin_sink;

        if let Some(origin) = origin {
            {
                let i = core.sink_inputs.get_mut(idx).unwrap();
                let n = i.channel_map.num_channels() as usize;
                if flat {
                    i.real_ratio = ChannelVolume::norm(n);
                    i.soft_volume = i.volume_factor;
                } else {
                    i.volume = ChannelVolume::norm(n);
                    i.reference_ratio = ChannelVolume::norm(n);
                    i.real_ratio = ChannelVolume::norm(n);
                    i.soft_volume = i.volume_factor;
                }
            }

            let (origin_map, origin_streams) = {
                let f = core.sinks.get(origin).unwrap();
                (f.channel_map, f.inputs.iter().copied().collect::<Vec<_>>())
            };
            {
                let f = core.sinks.get_mut(origin).unwrap();
                f.reference_volume = root_ref.remap(&root_map, &origin_map);
                f.real_volume = root_real.remap(&root_map, &origin_map);
            }
            for s in origin_streams {
                Self::update_volume_due_to_moving(core, s, origin)?;
            }
        } else {
            let i = core.sink_inputs.get_mut(idx).unwrap();
            if flat {
                let remapped = root_ref.remap(&root_map, &i.channel_map);
                i.volume = i.reference_ratio.multiply(&remapped);
            } else {
                i.volume = i.reference_ratio;
                i.real_ratio = i.reference_ratio;
                i.soft_volume = i.real_ratio.multiply(&i.volume_factor);
            }
        }
        Ok(())
    }

    /// A move that could not complete: lets a hook or the implementor
    /// resurrect the stream, and kills it otherwise.
    pub fn fail_move(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let mut ev = MoveEvent {
            stream: idx,
            dest: None,
        };
        core.hooks.sink_input_move_fail.fire(&mut ev);

        if core
            .sink_inputs
            .get(idx)
            .map(|i| i.sink.is_some())
            .unwrap_or(true)
        {
            return Ok(());
        }

        {
            let i = core.sink_inputs.get_mut(idx).unwrap();
            let mut imp = i.imp.take();
            if let Some(im) = imp.as_mut() {
                im.moving(i, None);
            }
            i.imp = imp;
        }

        if core
            .sink_inputs
            .get(idx)
            .map(|i| i.sink.is_some())
            .unwrap_or(true)
        {
            return Ok(());
        }

        warn!("sink input {} could not be moved, killing it", idx);
        Self::kill(core, idx)
    }

    /// Moves the stream to `dest` in one step.
    pub fn move_to(core: &mut Core, idx: u32, dest: u32, save: bool) -> Result<()> {
        assert_ctl_context();

        if !Self::may_move_to(core, idx, dest) {
            return Err(Error::NotSupported);
        }

        Self::start_move(core, idx)?;
        if let Err(e) = Self::finish_move(core, idx, dest, save) {
            Self::fail_move(core, idx)?;
            return Err(e);
        }
        Ok(())
    }

    /// The stream's device suspended or resumed.
    pub(crate) fn device_suspended(core: &mut Core, idx: u32, suspended: bool) -> Result<()> {
        let kill = {
            let Some(i) = core.sink_inputs.get(idx) else {
                return Ok(());
            };
            suspended && i.flags.contains(StreamFlags::KILL_ON_SUSPEND)
        };

        if kill {
            return Self::kill(core, idx);
        }

        let i = core.sink_inputs.get_mut(idx).unwrap();
        let mut imp = i.imp.take();
        if let Some(im) = imp.as_mut() {
            im.suspend(i, suspended);
        }
        i.imp = imp;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceFlags;
    use crate::sample::SampleFormat;
    use crate::sink::{Sink, SinkNewData};
    use crate::volume::Volume;
    use std::sync::Mutex;

    #[derive(Default)]
    struct BackendLog {
        rewinds: Vec<usize>,
        pops: Vec<usize>,
    }

    struct ScriptedBackend {
        fill: u8,
        fail: bool,
        all_played: bool,
        log: Arc<Mutex<BackendLog>>,
    }

    impl ScriptedBackend {
        fn new(fill: u8) -> (Self, Arc<Mutex<BackendLog>>) {
            let log = Arc::new(Mutex::new(BackendLog::default()));
            (
                Self {
                    fill,
                    fail: false,
                    all_played: false,
                    log: Arc::clone(&log),
                },
                log,
            )
        }
    }

    impl SinkInputBackend for ScriptedBackend {
        fn pop(&mut self, nbytes: usize) -> Result<MemChunk> {
            self.log.lock().unwrap().pops.push(nbytes);
            if self.fail {
                return Err(Error::NoEntity("dry".into()));
            }
            Ok(MemChunk::from_vec(vec![self.fill; nbytes]))
        }

        fn process_rewind(&mut self, nbytes: usize) {
            self.log.lock().unwrap().rewinds.push(nbytes);
        }

        fn process_underrun(&mut self) -> bool {
            self.all_played
        }
    }

    fn spec(channels: u8) -> SampleSpec {
        SampleSpec::new(SampleFormat::S16Le, channels, 44100).unwrap()
    }

    fn io_with(backend: ScriptedBackend) -> SinkInputIo {
        SinkInputIo {
            index: 0,
            state: StreamState::Running,
            sample_spec: spec(2),
            channel_map: ChannelMap::default_for(2).unwrap(),
            device_map: ChannelMap::default_for(2).unwrap(),
            soft_volume: ChannelVolume::norm(2),
            muted: false,
            volume_factor_device: None,
            resampler: None,
            render_memblockq: MemBlockQ::new(),
            playing_for: 0,
            underrun_for: 0,
            drained: Arc::new(AtomicBool::new(false)),
            rewrite: None,
            rewrite_flush: false,
            dont_rewind_render: false,
            backend: Box::new(backend),
        }
    }

    /// With matching channel maps the gain is left for the mixing stage.
    #[test]
    fn peek_defers_volume_to_the_mixer() {
        crate::device::mark_io_context();

        let (backend, _log) = ScriptedBackend::new(0x11);
        let mut io = io_with(backend);
        io.soft_volume = ChannelVolume::from_slice(&[Volume::NORM, Volume::MUTED]);

        let (chunk, volume) = io.peek(16, &spec(2));
        assert_eq!(chunk.length, 16);
        assert_eq!(chunk.as_slice(), &[0x11; 16]);
        assert_eq!(volume, io.soft_volume);
        assert_eq!(io.playing_for, 16);
    }

    /// A failing pop is an underrun: silence comes back, counters track it,
    /// and the stream reports drained.
    #[test]
    fn peek_underrun() {
        crate::device::mark_io_context();

        let (mut backend, _log) = ScriptedBackend::new(0);
        backend.fail = true;
        let mut io = io_with(backend);
        io.playing_for = 100;

        let (chunk, _volume) = io.peek(16, &spec(2));
        assert_eq!(chunk.length, 16);
        assert!(chunk.as_slice().iter().all(|&b| b == 0));
        assert_eq!(io.playing_for, 0);
        assert_eq!(io.underrun_for, 16);
        assert!(io.drained.load(Ordering::Acquire));
    }

    /// Corked streams underrun without bothering the implementor.
    #[test]
    fn peek_while_corked() {
        crate::device::mark_io_context();

        let (backend, log) = ScriptedBackend::new(0x11);
        let mut io = io_with(backend);
        io.state = StreamState::Corked;

        let (chunk, _volume) = io.peek(8, &spec(2));
        assert_eq!(chunk.length, 8);
        assert!(log.lock().unwrap().pops.is_empty());
    }

    /// The rewind protocol: the read cursor moves back at most
    /// min(n, playing_for) and the implementor sees the stream-domain
    /// amount.
    #[test]
    fn process_rewind_bounds() {
        crate::device::mark_io_context();

        let (backend, log) = ScriptedBackend::new(0x22);
        let mut io = io_with(backend);
        io.update_max_rewind(64);

        let dspec = spec(2);
        let (chunk, _) = io.peek(16, &dspec);
        io.drop_bytes(chunk.length);
        assert_eq!(io.playing_for, 16);

        let device_bytes = io.request_rewind(8, true, false, false);
        assert_eq!(device_bytes, 8);

        let read_before = io.render_memblockq.read_index();
        io.process_rewind(8);
        let moved_back = (read_before - io.render_memblockq.read_index()) as usize;
        assert!(moved_back <= 8);
        assert_eq!(log.lock().unwrap().rewinds.as_slice(), &[8]);
    }

    /// Outstanding rewrite requests merge by maximum and "drop all" wins.
    #[test]
    fn request_rewind_merges() {
        crate::device::mark_io_context();

        let (backend, _log) = ScriptedBackend::new(0);
        let mut io = io_with(backend);
        io.playing_for = 1000;

        io.request_rewind(8, true, false, false);
        io.request_rewind(24, true, false, false);
        assert_eq!(io.rewrite, Some(Rewrite::Bytes(24)));

        io.request_rewind(usize::MAX, true, true, false);
        assert_eq!(io.rewrite, Some(Rewrite::All));
        assert!(io.rewrite_flush);
    }

    /// A drained queue plus a confirming implementor silences the queue so
    /// later peeks cannot rewind into played data.
    #[test]
    fn process_underrun_silences() {
        crate::device::mark_io_context();

        let (mut backend, _log) = ScriptedBackend::new(0x33);
        backend.all_played = true;
        let mut io = io_with(backend);
        io.update_max_rewind(64);

        let dspec = spec(2);
        let (chunk, _) = io.peek(16, &dspec);
        io.drop_bytes(chunk.length);

        assert!(io.process_underrun());
        // The retained history is gone.
        assert_eq!(io.render_memblockq.rewind(16), 0);
    }

    fn new_sink(core: &mut Core, name: &str) -> u32 {
        let mut data = SinkNewData::new(name);
        data.sample_spec = Some(spec(2));
        let idx = Sink::new(core, data, DeviceFlags::FLAT_VOLUME).unwrap();
        Sink::put(core, idx).unwrap();
        idx
    }

    fn new_input(core: &mut Core, sink: u32) -> u32 {
        let mut data = SinkInputNewData::new();
        data.sink = Some(sink);
        data.sample_spec = Some(spec(2));
        data.backend = Some(Box::new(ScriptedBackend::new(0).0));
        let idx = SinkInput::new(core, data).unwrap();
        SinkInput::put(core, idx).unwrap();
        idx
    }

    /// Named volume-factor layers multiply together and removal restores
    /// unity.
    #[test]
    fn volume_factor_layers() {
        let mut core = Core::new();
        let s = new_sink(&mut core, "s");
        let i = new_input(&mut core, s);

        let half = ChannelVolume::uniform(2, Volume::from_u32_clamped(0x8000));
        SinkInput::add_volume_factor(&mut core, i, "duck", &half).unwrap();
        SinkInput::add_volume_factor(&mut core, i, "role", &half).unwrap();

        let input = core.sink_inputs.get(i).unwrap();
        let expected = half.multiply(&half);
        assert_eq!(input.volume_factor, expected);

        SinkInput::remove_volume_factor(&mut core, i, "duck").unwrap();
        SinkInput::remove_volume_factor(&mut core, i, "role").unwrap();
        let input = core.sink_inputs.get(i).unwrap();
        assert!(input.volume_factor.is_norm());

        assert_matches::assert_matches!(
            SinkInput::remove_volume_factor(&mut core, i, "duck"),
            Err(Error::NoEntity(_))
        );
    }

    /// Sync-group members start and stop together and may not be moved.
    #[test]
    fn sync_groups() {
        let mut core = Core::new();
        let s = new_sink(&mut core, "s");
        let other = new_sink(&mut core, "other");
        let a = new_input(&mut core, s);

        let mut data = SinkInputNewData::new();
        data.sink = Some(s);
        data.sample_spec = Some(spec(2));
        data.sync_with = Some(a);
        data.backend = Some(Box::new(ScriptedBackend::new(0).0));
        let b = SinkInput::new(&mut core, data).unwrap();
        SinkInput::put(&mut core, b).unwrap();

        assert!(!SinkInput::may_move(&core, a));
        assert!(!SinkInput::may_move_to(&core, a, other));

        // Corking either corks the chain.
        SinkInput::cork(&mut core, a, true).unwrap();
        assert_eq!(core.sink_inputs.get(b).unwrap().state, StreamState::Corked);
        assert_eq!(core.sinks.get(s).unwrap().n_corked, 2);

        SinkInput::cork(&mut core, b, false).unwrap();
        assert_eq!(core.sink_inputs.get(a).unwrap().state, StreamState::Running);
    }

    /// A second passthrough stream is refused; so is a PCM stream next to a
    /// passthrough one.
    #[test]
    fn passthrough_is_exclusive() {
        let mut core = Core::new();
        let s = new_sink(&mut core, "s");

        let mut data = SinkInputNewData::new();
        data.sink = Some(s);
        data.sample_spec = Some(spec(2));
        data.flags = StreamFlags::PASSTHROUGH;
        data.backend = Some(Box::new(ScriptedBackend::new(0).0));
        let _pt = {
            let idx = SinkInput::new(&mut core, data).unwrap();
            SinkInput::put(&mut core, idx).unwrap();
            idx
        };

        let mut pcm = SinkInputNewData::new();
        pcm.sink = Some(s);
        pcm.sample_spec = Some(spec(2));
        pcm.backend = Some(Box::new(ScriptedBackend::new(0).0));
        assert_matches::assert_matches!(SinkInput::new(&mut core, pcm), Err(Error::Busy));
    }
}
