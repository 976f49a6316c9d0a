//! Per-stream capture consumers attached to a source.

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
use crate::memblock::{apply_volume, MemChunk};
use crate::memblockq::MemBlockQ;
use crate::props::Props;
use crate::resampler::{new_resampler, ResampleMethod, Resampler};
use crate::sample::SampleSpec;
use crate::source::{Source, SourceMsg, SHARE_TREE_DEPTH_MAX};
use crate::time::MicroSeconds;
use crate::volume::ChannelVolume;

/// The per-stream behavior supplied by the stream's creator.
///
/// All methods are optional and run on the control thread; the data path
/// lives in [`SourceOutputBackend`].
pub trait SourceOutputImpl {
    /// The stream is moving: `dest` is the new source, or `None` when the
    /// stream is detached (or its move failed).
    fn moving(&mut self, output: &mut SourceOutput, dest: Option<u32>) {
        let _ = (output, dest);
    }

    /// The stream is being killed.
    fn kill(&mut self, output: &mut SourceOutput) {
        let _ = output;
    }

    /// The stream's device was suspended or resumed.
    fn suspend(&mut self, output: &mut SourceOutput, suspended: bool) {
        let _ = (output, suspended);
    }
}

/// The IO-thread data path of a stream: receives converted, volume-adjusted
/// chunks.
pub trait SourceOutputBackend: Send {
    /// Deliver one chunk in the stream's sample spec.
    fn push(&mut self, chunk: &MemChunk);

    /// Take back `nbytes` of not-yet-consumed capture data.
    fn process_rewind(&mut self, nbytes: usize) {
        let _ = nbytes;
    }

    /// Whether [`SourceOutputBackend::process_rewind`] is wired. Streams
    /// that can rewind get their data immediately instead of through the
    /// delay queue.
    fn supports_rewind(&self) -> bool {
        false
    }
}

/// The IO thread's state for one attached output.
pub struct SourceOutputIo {
    /// The stream's index.
    pub index: u32,
    /// Mirrored stream state.
    pub state: StreamState,
    /// The stream's sample spec.
    pub sample_spec: SampleSpec,
    /// The stream's channel map.
    pub channel_map: ChannelMap,
    /// Stream soft volume, remapped into the device's channel map; applied
    /// ahead of the resampler.
    pub soft_volume: ChannelVolume,
    /// Mirrored mute flag.
    pub muted: bool,
    /// Device-side volume factor in the stream's channel map, applied after
    /// the resampler; `None` when it is neutral.
    pub volume_factor_device: Option<ChannelVolume>,
    /// Converts from the device spec to the stream spec.
    pub resampler: Option<Box<dyn Resampler>>,
    /// Holds data back so the device can rewind it.
    pub delay_memblockq: MemBlockQ,
    /// The bonded sink input delivering chunks directly, bypassing the
    /// broadcast.
    pub direct_on_input: Option<u32>,
    /// The data path.
    pub backend: Box<dyn SourceOutputBackend>,
}

impl SourceOutputIo {
    /// Delivers one chunk in the device's sample spec, per the capture data
    /// flow: delay queue, then soft volume, resampler and device factor.
    pub fn push(
        &mut self,
        chunk: &MemChunk,
        max_rewind: usize,
        monitor_unplayed: Option<usize>,
        device_spec: &SampleSpec,
    ) {
        assert_io_context();

        if self.state != StreamState::Running {
            return;
        }

        self.delay_memblockq.push(chunk.clone());

        // Streams that can rewind take their data immediately; everything
        // else is held back far enough that the device can still take the
        // data back.
        let mut limit = if self.backend.supports_rewind() {
            0
        } else {
            max_rewind
        };
        if let Some(unplayed) = monitor_unplayed {
            // Monitors must not loop back data the sink could still rewrite.
            limit = limit.min(unplayed);
        }

        while self.delay_memblockq.length() > limit {
            let excess = self.delay_memblockq.length() - limit;
            let Some(piece) = self.delay_memblockq.pop(excess) else {
                break;
            };
            self.deliver(piece, device_spec);
        }
    }

    fn deliver(&mut self, mut piece: MemChunk, device_spec: &SampleSpec) {
        if self.muted {
            piece = MemChunk::silence(piece.length);
        } else if self.resampler.is_none() {
            // Device and stream specs match; one pass covers both gains.
            let combined = match &self.volume_factor_device {
                Some(factor) => self.soft_volume.multiply(factor),
                None => self.soft_volume,
            };
            if !combined.is_norm() {
                apply_volume(&mut piece, device_spec, &combined);
            }
        } else if !self.soft_volume.is_norm() {
            apply_volume(&mut piece, device_spec, &self.soft_volume);
        }

        if let Some(resampler) = &mut self.resampler {
            piece = resampler.run(&piece);
            if piece.length == 0 {
                return;
            }
            if let Some(factor) = &self.volume_factor_device {
                if !factor.is_norm() && !self.muted {
                    apply_volume(&mut piece, &self.sample_spec, factor);
                }
            }
        }

        self.backend.push(&piece);
    }

    /// The device's rewind budget changed.
    pub fn update_max_rewind(&mut self, max_rewind: usize) {
        self.delay_memblockq.set_max_rewind(max_rewind);
    }

    /// The device is taking back `nbytes` of capture history.
    pub fn process_rewind(&mut self, nbytes: usize) {
        assert_io_context();

        if self.backend.supports_rewind() {
            self.backend.process_rewind(nbytes);
        } else {
            // The data is still in the delay queue; drop it there.
            self.delay_memblockq.seek_write(-(nbytes as i64));
        }
    }
}

impl std::fmt::Debug for SourceOutputIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceOutputIo")
            .field("index", &self.index)
            .field("state", &self.state)
            .finish()
    }
}

/// Builder for a new source output.
pub struct SourceOutputNewData {
    /// The source to attach to, by index.
    pub source: Option<u32>,
    /// The source to attach to, by name; used if `source` is absent.
    pub source_name: Option<String>,
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
    /// A sink input whose monitor path feeds this output directly.
    pub direct_on_input: Option<u32>,
    /// For filter devices: the sharing device this stream is the master
    /// edge of.
    pub origin_source: Option<u32>,
    /// The data path. Mandatory.
    pub backend: Option<Box<dyn SourceOutputBackend>>,
    /// Per-stream behavior callbacks.
    pub imp: Option<Box<dyn SourceOutputImpl>>,
    /// Whether the initial volume came from persistent state.
    pub save_volume: bool,
    /// Whether the initial mute came from persistent state.
    pub save_muted: bool,
}

impl SourceOutputNewData {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self {
            source: None,
            source_name: None,
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
            direct_on_input: None,
            origin_source: None,
            backend: None,
            imp: None,
            save_volume: false,
            save_muted: false,
        }
    }
}

impl Default for SourceOutputNewData {
    fn default() -> Self {
        Self::new()
    }
}

/// A capture stream attached to a source.
pub struct SourceOutput {
    /// Stable index into the core's stream set.
    pub index: u32,
    /// The source this stream is attached to; `None` while moving.
    pub source: Option<u32>,
    /// For filter devices: the sharing device this stream is the master
    /// edge of.
    pub origin_source: Option<u32>,
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
    /// Internal adjustment always applied, in the stream's map.
    pub volume_factor: ChannelVolume,
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
    /// A sink input whose monitor path feeds this output directly.
    pub direct_on_input: Option<u32>,
    /// This stream's latency request.
    pub requested_latency: Option<MicroSeconds>,
    /// Per-stream behavior callbacks; dropped on unlink.
    pub imp: Option<Box<dyn SourceOutputImpl>>,
    /// The IO state, held here while detached (or when the device runs
    /// without an IO thread).
    pub io: Option<Box<SourceOutputIo>>,
}

impl std::fmt::Debug for SourceOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceOutput")
            .field("index", &self.index)
            .field("source", &self.source)
            .field("state", &self.state)
            .finish()
    }
}

impl SourceOutput {
    /// Creates a source output from a builder: resolves the source,
    /// negotiates the format, and fixes up spec and map.
    pub fn new(core: &mut Core, mut data: SourceOutputNewData) -> Result<u32> {
        assert_ctl_context();

        let sidx = match data.source {
            Some(idx) => idx,
            None => {
                let name = data
                    .source_name
                    .as_deref()
                    .ok_or_else(|| Error::Invalid("no source given".into()))?;
                core.source_by_name(name)
                    .ok_or_else(|| Error::NoEntity(name.to_owned()))?
            }
        };

        let (dev_spec, dev_map, dev_state, n_outputs, advertised) = {
            let s = core
                .sources
                .get(sidx)
                .ok_or(Error::NoEntity(sidx.to_string()))?;
            if s.state == DeviceState::Unlinked {
                return Err(Error::BadState("source is unlinked".into()));
            }
            let advertised = match &s.imp {
                Some(imp) => imp.get_formats(s),
                None => vec![FormatInfo::new(FormatEncoding::Pcm)],
            };
            (
                s.sample_spec,
                s.channel_map,
                s.state,
                s.outputs.len(),
                advertised,
            )
        };

        if dev_state == DeviceState::Suspended
            && data.flags.contains(StreamFlags::NO_CREATE_ON_SUSPEND)
        {
            return Err(Error::BadState("source is suspended".into()));
        }
        if n_outputs >= MAX_STREAMS_PER_DEVICE {
            return Err(Error::TooLarge);
        }

        // A direct bond only makes sense on a monitor, with an input that
        // plays to the very sink being monitored.
        if let Some(di) = data.direct_on_input {
            let monitor_of = core.sources.get(sidx).unwrap().monitor_of;
            let input_sink = core.sink_inputs.get(di).and_then(|i| i.sink);
            if monitor_of.is_none() || input_sink != monitor_of {
                return Err(Error::Invalid(
                    "direct-on-input requires an input on the monitored sink".into(),
                ));
            }
        }

        let format = if data.req_formats.is_empty() {
            FormatInfo::new(FormatEncoding::Pcm)
        } else {
            negotiate(&data.req_formats, &advertised)?
        };

        let passthrough = !format.is_pcm() || data.flags.contains(StreamFlags::PASSTHROUGH);
        if passthrough && (n_outputs > 0 || Source::is_passthrough(core, sidx)) {
            // Passthrough is exclusive on a device.
            return Err(Error::Busy);
        }
        if !passthrough && Source::is_passthrough(core, sidx) {
            return Err(Error::Busy);
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
            .ok_or_else(|| Error::Invalid("source output needs a data path".into()))?;

        let requested_resample_method = data.resample_method;

        let idx = core.source_outputs.insert_with(|index| SourceOutput {
            index,
            source: Some(sidx),
            origin_source: data.origin_source,
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
            volume_factor_device,
            volume_factor_device_map: dev_map,
            reference_ratio: ChannelVolume::norm(spec.channels as usize),
            real_ratio: ChannelVolume::norm(spec.channels as usize),
            soft_volume: ChannelVolume::norm(spec.channels as usize),
            muted: data.muted,
            save_volume: data.save_volume,
            save_muted: data.save_muted,
            direct_on_input: data.direct_on_input,
            requested_latency: None,
            imp: data.imp,
            io: Some(Box::new(SourceOutputIo {
                index,
                state: StreamState::Init,
                sample_spec: spec,
                channel_map,
                soft_volume: ChannelVolume::norm(dev_map.num_channels() as usize),
                muted: data.muted,
                volume_factor_device: None,
                resampler: None,
                delay_memblockq: MemBlockQ::new(),
                direct_on_input: data.direct_on_input,
                backend,
            })),
        });

        debug!("created source output {} on source {}", idx, sidx);
        Ok(idx)
    }

    /// Publishes the stream: attaches it to its source, instantiates the
    /// resampler, and recomputes the device volume.
    pub fn put(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let sidx = {
            let o = core
                .source_outputs
                .get(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            assert_eq!(o.state, StreamState::Init);
            o.source.expect("new stream must have a source")
        };

        let start_corked = {
            let o = core.source_outputs.get(idx).unwrap();
            o.flags.contains(StreamFlags::START_CORKED)
        };

        {
            let s = core.sources.get_mut(sidx).unwrap();
            s.outputs.insert(idx);
            if start_corked {
                s.n_corked += 1;
            }
        }

        let o = core.source_outputs.get_mut(idx).unwrap();
        o.state = if start_corked {
            StreamState::Corked
        } else {
            StreamState::Running
        };

        Self::refit_io(core, idx, sidx)?;
        Self::ship_io(core, idx, sidx)?;

        // Membership changed; the shared volume must follow (in this order).
        Self::recompute_volumes(core, idx, sidx)?;

        Source::update_status(core, sidx)?;
        Source::update_requested_latency(core, sidx)?;
        core.subscription_post(
            SubscriptionFacility::SourceOutput,
            SubscriptionOperation::New,
            idx,
        );
        Ok(())
    }

    /// Rebuilds the stream's IO-side conversion state against `sidx`'s
    /// current spec.
    fn refit_io(core: &mut Core, idx: u32, sidx: u32) -> Result<()> {
        let (dev_spec, dev_map) = {
            let s = core.sources.get(sidx).unwrap();
            (s.sample_spec, s.channel_map)
        };

        let o = core.source_outputs.get_mut(idx).unwrap();
        let needs_resampler = o.format.is_pcm()
            && (dev_spec != o.sample_spec || dev_map != o.channel_map)
            && !o.flags.contains(StreamFlags::NO_REMAP | StreamFlags::NO_REMIX);

        let resampler = if needs_resampler {
            Some(new_resampler(
                dev_spec,
                dev_map,
                o.sample_spec,
                o.channel_map,
                o.requested_resample_method,
            )?)
        } else {
            None
        };
        o.actual_resample_method = resampler
            .as_ref()
            .map(|r| r.method())
            .unwrap_or(o.requested_resample_method);

        let vfd_stream = if o.volume_factor_device.is_norm() {
            None
        } else {
            Some(
                o.volume_factor_device
                    .remap(&o.volume_factor_device_map, &o.channel_map),
            )
        };

        let io = o.io.as_mut().expect("detached stream must hold its IO state");
        io.state = o.state;
        io.resampler = resampler;
        io.soft_volume = o.soft_volume.remap(&o.channel_map, &dev_map);
        io.volume_factor_device = vfd_stream;
        io.muted = o.muted;
        Ok(())
    }

    /// Hands the IO state to the device's IO thread, if it runs one.
    fn ship_io(core: &mut Core, idx: u32, sidx: u32) -> Result<()> {
        let has_q = core.sources.get(sidx).unwrap().msgq.is_some();
        if !has_q {
            return Ok(());
        }

        let io = core
            .source_outputs
            .get_mut(idx)
            .unwrap()
            .io
            .take()
            .expect("IO state already shipped");
        let s = core.sources.get(sidx).unwrap();
        s.msgq.as_ref().unwrap().send(SourceMsg::AddOutput(io))?;
        Ok(())
    }

    /// Recomputes volumes after a membership change: the whole tree in flat
    /// mode, just this stream's ratios otherwise.
    fn recompute_volumes(core: &mut Core, idx: u32, sidx: u32) -> Result<()> {
        let root = Source::shared_root(core, sidx);
        let flat = core
            .sources
            .get(root)
            .unwrap()
            .flags
            .contains(DeviceFlags::FLAT_VOLUME);

        if flat {
            Source::set_volume(core, root, None, true, false)
        } else {
            let (reference, dev_map) = {
                let s = core.sources.get(sidx).unwrap();
                (s.reference_volume, s.channel_map)
            };
            let o = core.source_outputs.get_mut(idx).unwrap();
            o.reference_ratio = compute_reference_ratio(
                &o.volume,
                &o.channel_map,
                &o.reference_ratio,
                &reference,
                &dev_map,
            );
            o.real_ratio = o.volume;
            o.soft_volume = o.volume.multiply(&o.volume_factor);
            Self::send_soft_volume(core, idx)
        }
    }

    /// Mirrors this stream's soft volume and mute to its device's IO thread.
    pub(crate) fn send_soft_volume(core: &Core, idx: u32) -> Result<()> {
        let o = core
            .source_outputs
            .get(idx)
            .ok_or(Error::NoEntity(idx.to_string()))?;
        let Some(sidx) = o.source else {
            return Ok(());
        };
        let s = core.sources.get(sidx).unwrap();
        if let Some(q) = &s.msgq {
            let soft = o.soft_volume.remap(&o.channel_map, &s.channel_map);
            q.send(SourceMsg::SetOutputSoftVolume {
                index: idx,
                soft,
                muted: o.muted,
            })?;
        }
        Ok(())
    }

    /// Detaches and removes the stream.
    pub fn unlink(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let (sidx, was_corked, was_init) = {
            let o = core
                .source_outputs
                .get(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            if o.state == StreamState::Unlinked {
                return Ok(());
            }
            (
                o.source,
                o.state == StreamState::Corked,
                o.state == StreamState::Init,
            )
        };

        if let Some(sidx) = sidx {
            {
                let s = core.sources.get_mut(sidx).unwrap();
                s.outputs.remove(&idx);
                if was_corked {
                    s.n_corked = s.n_corked.saturating_sub(1);
                }
                if let Some(q) = &s.msgq {
                    q.send(SourceMsg::RemoveOutput(idx))?;
                }
            }

            let root = Source::shared_root(core, sidx);
            if core
                .sources
                .get(root)
                .unwrap()
                .flags
                .contains(DeviceFlags::FLAT_VOLUME)
            {
                Source::set_volume(core, root, None, true, false)?;
            }

            Source::update_status(core, sidx)?;
            Source::update_requested_latency(core, sidx)?;
        }

        let o = core.source_outputs.get_mut(idx).unwrap();
        o.state = StreamState::Unlinked;
        o.source = None;
        o.imp = None;
        o.io = None;

        if !was_init {
            core.subscription_post(
                SubscriptionFacility::SourceOutput,
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
            let Some(o) = core.source_outputs.get_mut(idx) else {
                return Ok(());
            };
            if o.state == StreamState::Unlinked {
                return Ok(());
            }
            let mut imp = o.imp.take();
            if let Some(i) = imp.as_mut() {
                i.kill(o);
            }
            o.imp = imp;
        }
        Self::unlink(core, idx)
    }

    /// Pauses or resumes the stream.
    pub fn cork(core: &mut Core, idx: u32, on: bool) -> Result<()> {
        assert_ctl_context();

        let sidx = {
            let o = core
                .source_outputs
                .get_mut(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            let new_state = if on {
                StreamState::Corked
            } else {
                StreamState::Running
            };
            if o.state == new_state {
                return Ok(());
            }
            if !matches!(o.state, StreamState::Running | StreamState::Corked) {
                return Err(Error::BadState("stream is not linked".into()));
            }
            o.state = new_state;
            o.source
        };

        if let Some(sidx) = sidx {
            {
                let s = core.sources.get_mut(sidx).unwrap();
                if on {
                    s.n_corked += 1;
                } else {
                    s.n_corked = s.n_corked.saturating_sub(1);
                }
                if let Some(q) = &s.msgq {
                    q.send(SourceMsg::SetOutputState {
                        index: idx,
                        state: if on {
                            StreamState::Corked
                        } else {
                            StreamState::Running
                        },
                    })?;
                }
            }
            Source::update_status(core, sidx)?;
        }

        core.subscription_post(
            SubscriptionFacility::SourceOutput,
            SubscriptionOperation::Change,
            idx,
        );
        Ok(())
    }

    /// Whether this stream forwards an unmixable bitstream.
    pub fn is_passthrough(&self) -> bool {
        !self.format.is_pcm() || self.flags.contains(StreamFlags::PASSTHROUGH)
    }

    /// Sets the stream volume.
    ///
    /// With `absolute` unset on a flat-volume device, `v` is interpreted
    /// relative to the device's reference volume.
    pub fn set_volume(
        core: &mut Core,
        idx: u32,
        v: &ChannelVolume,
        save: bool,
        absolute: bool,
    ) -> Result<()> {
        assert_ctl_context();

        let (sidx, channels) = {
            let o = core
                .source_outputs
                .get(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            if o.is_passthrough() {
                return Err(Error::NotSupported);
            }
            (o.source, o.sample_spec.channels)
        };

        let v = broadcast_volume(v, channels)
            .ok_or_else(|| Error::Invalid("volume does not match sample spec".into()))?;

        let (flat, root) = match sidx {
            Some(sidx) => {
                let root = Source::shared_root(core, sidx);
                (
                    core.sources
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
                let s = core.sources.get(root).unwrap();
                (s.reference_volume, s.channel_map)
            };
            let o = core.source_outputs.get(idx).unwrap();
            v.multiply(&reference.remap(&root_map, &o.channel_map))
        } else {
            v
        };

        {
            let o = core.source_outputs.get_mut(idx).unwrap();
            o.volume = v;
            o.save_volume = save;
        }

        if let Some(sidx) = sidx {
            if flat {
                // The device tracks the maximum of its streams.
                Source::set_volume(core, root.unwrap(), None, true, save)?;
            } else {
                let (reference, dev_map) = {
                    let s = core.sources.get(sidx).unwrap();
                    (s.reference_volume, s.channel_map)
                };
                let o = core.source_outputs.get_mut(idx).unwrap();
                o.reference_ratio = compute_reference_ratio(
                    &o.volume,
                    &o.channel_map,
                    &o.reference_ratio,
                    &reference,
                    &dev_map,
                );
                o.real_ratio = o.volume;
                o.soft_volume = o.volume.multiply(&o.volume_factor);
                Self::send_soft_volume(core, idx)?;
            }
        }

        core.subscription_post(
            SubscriptionFacility::SourceOutput,
            SubscriptionOperation::Change,
            idx,
        );
        Ok(())
    }

    /// Sets the stream mute flag.
    pub fn set_mute(core: &mut Core, idx: u32, muted: bool, save: bool) -> Result<()> {
        assert_ctl_context();

        {
            let o = core
                .source_outputs
                .get_mut(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            if o.muted == muted {
                o.save_muted |= save;
                return Ok(());
            }
            o.muted = muted;
            o.save_muted = save;
        }

        Self::send_soft_volume(core, idx)?;
        core.subscription_post(
            SubscriptionFacility::SourceOutput,
            SubscriptionOperation::Change,
            idx,
        );
        Ok(())
    }

    /// Updates this stream's latency request and renegotiates the device's.
    pub fn set_requested_latency(
        core: &mut Core,
        idx: u32,
        latency: Option<MicroSeconds>,
    ) -> Result<()> {
        assert_ctl_context();

        let sidx = {
            let o = core
                .source_outputs
                .get_mut(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            o.requested_latency = latency.map(|l| l.clamp_latency());
            o.source
        };

        if let Some(sidx) = sidx {
            Source::update_requested_latency(core, sidx)?;
        }
        Ok(())
    }

    /// Changes the stream's sample rate (variable-rate streams only).
    pub fn set_rate(core: &mut Core, idx: u32, rate: u32) -> Result<()> {
        assert_ctl_context();

        {
            let o = core
                .source_outputs
                .get_mut(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            if !o.flags.contains(StreamFlags::VARIABLE_RATE) {
                return Err(Error::NotSupported);
            }
            let spec = SampleSpec::new(o.sample_spec.format, o.sample_spec.channels, rate)?;
            o.sample_spec = spec;
        }
        Self::update_rate(core, idx)
    }

    /// Resyncs the resampler with the device's sample spec, e.g. after a
    /// device rate switch.
    pub fn update_rate(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let (sidx, shipped) = {
            let o = core
                .source_outputs
                .get(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            let Some(sidx) = o.source else {
                return Ok(());
            };
            (sidx, o.io.is_none())
        };

        if shipped {
            // Fetch the IO state back, refit it, and ship it again.
            let io = Self::take_io(core, idx, sidx)?;
            core.source_outputs.get_mut(idx).unwrap().io = Some(io);
            Self::refit_io(core, idx, sidx)?;
            Self::ship_io(core, idx, sidx)?;
        } else {
            Self::refit_io(core, idx, sidx)?;
        }
        Ok(())
    }

    fn take_io(core: &mut Core, idx: u32, sidx: u32) -> Result<Box<SourceOutputIo>> {
        let s = core.sources.get(sidx).unwrap();
        let q = s
            .msgq
            .as_ref()
            .ok_or_else(|| Error::BadState("no IO thread".into()))?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        q.send(SourceMsg::TakeOutput { index: idx, reply: tx })?;
        rx.recv()
            .map_err(|_| Error::BadState("IO thread is gone".into()))?
            .ok_or_else(|| Error::NoEntity(idx.to_string()))
    }

    /// Whether the stream may be moved at all.
    pub fn may_move(core: &Core, idx: u32) -> bool {
        let Some(o) = core.source_outputs.get(idx) else {
            return false;
        };
        o.state != StreamState::Unlinked && !o.flags.contains(StreamFlags::DONT_MOVE)
    }

    /// Whether the stream may be moved to `dest`: movable, not already
    /// there, and not creating a sharing cycle.
    pub fn may_move_to(core: &Core, idx: u32, dest: u32) -> bool {
        if !Self::may_move(core, idx) {
            return false;
        }
        let Some(o) = core.source_outputs.get(idx) else {
            return false;
        };
        if o.source == Some(dest) {
            return false;
        }
        let Some(d) = core.sources.get(dest) else {
            return false;
        };
        if d.state == DeviceState::Unlinked {
            return false;
        }
        if d.outputs.len() >= MAX_STREAMS_PER_DEVICE {
            return false;
        }

        // Walking up from dest must not pass through this stream or the
        // filter device it feeds.
        let mut at = dest;
        for _ in 0..SHARE_TREE_DEPTH_MAX {
            if Some(at) == o.origin_source {
                return false;
            }
            let Some(s) = core.sources.get(at) else {
                break;
            };
            let Some(edge) = s.output_from_master else {
                break;
            };
            if edge == idx {
                return false;
            }
            let Some(next) = core.source_outputs.get(edge).and_then(|e| e.source) else {
                break;
            };
            at = next;
        }
        true
    }

    /// First phase of a move: detaches the stream from its source.
    pub fn start_move(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let sidx = {
            let o = core
                .source_outputs
                .get(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            o.source
                .ok_or_else(|| Error::BadState("stream is not attached".into()))?
        };

        let mut ev = MoveEvent {
            stream: idx,
            dest: None,
        };
        core.hooks.source_output_move_start.fire(&mut ev);

        let was_corked = core.source_outputs.get(idx).unwrap().state == StreamState::Corked;
        {
            let s = core.sources.get_mut(sidx).unwrap();
            s.outputs.remove(&idx);
            if was_corked {
                s.n_corked = s.n_corked.saturating_sub(1);
            }
        }

        // Recompute the shared volume without this stream.
        let root = Source::shared_root(core, sidx);
        if core
            .sources
            .get(root)
            .unwrap()
            .flags
            .contains(DeviceFlags::FLAT_VOLUME)
        {
            Source::set_volume(core, root, None, true, false)?;
        }

        // Pull the IO state back from the device's IO thread.
        let has_q = core.sources.get(sidx).unwrap().msgq.is_some();
        if has_q {
            let io = Self::take_io(core, idx, sidx)?;
            core.source_outputs.get_mut(idx).unwrap().io = Some(io);
        }

        core.source_outputs.get_mut(idx).unwrap().source = None;

        Source::update_status(core, sidx)?;
        Source::update_requested_latency(core, sidx)?;
        Ok(())
    }

    /// Second phase of a move: attaches the stream to `dest`.
    pub fn finish_move(core: &mut Core, idx: u32, dest: u32, save: bool) -> Result<()> {
        assert_ctl_context();

        {
            let o = core
                .source_outputs
                .get(idx)
                .ok_or(Error::NoEntity(idx.to_string()))?;
            if o.source.is_some() {
                return Err(Error::BadState("stream is still attached".into()));
            }
            if o.direct_on_input.is_some() {
                return Err(Error::NotSupported);
            }
        }
        {
            let d = core
                .sources
                .get(dest)
                .ok_or(Error::NoEntity(dest.to_string()))?;
            if d.state == DeviceState::Unlinked {
                return Err(Error::BadState("destination is unlinked".into()));
            }
            if d.outputs.len() >= MAX_STREAMS_PER_DEVICE {
                return Err(Error::TooLarge);
            }
        }

        let mut ev = MoveEvent {
            stream: idx,
            dest: Some(dest),
        };
        if core.hooks.source_output_move_finish.fire(&mut ev) == HookResult::Cancel {
            return Err(Error::NotSupported);
        }

        let (is_pt, stream_rate) = {
            let o = core.source_outputs.get(idx).unwrap();
            (o.is_passthrough(), o.sample_spec.rate)
        };
        if is_pt && Source::is_passthrough(core, dest) {
            return Err(Error::Busy);
        }

        // Glitch minimization: try running the destination at our rate.
        let dest_rate = core.sources.get(dest).unwrap().sample_spec.rate;
        if dest_rate != stream_rate {
            let _ = Source::update_rate(core, dest, stream_rate, is_pt);
        }

        {
            let o = core.source_outputs.get_mut(idx).unwrap();
            let mut imp = o.imp.take();
            if let Some(i) = imp.as_mut() {
                i.moving(o, Some(dest));
            }
            o.imp = imp;
        }

        let was_corked = core.source_outputs.get(idx).unwrap().state == StreamState::Corked;
        {
            let s = core.sources.get_mut(dest).unwrap();
            s.outputs.insert(idx);
            if was_corked {
                s.n_corked += 1;
            }
        }

        // Carry the device-side factor over to the new device's map.
        let dest_map = core.sources.get(dest).unwrap().channel_map;
        {
            let o = core.source_outputs.get_mut(idx).unwrap();
            o.source = Some(dest);
            o.volume_factor_device = o
                .volume_factor_device
                .remap(&o.volume_factor_device_map, &dest_map);
            o.volume_factor_device_map = dest_map;
        }

        Self::update_volume_due_to_moving(core, idx, dest)?;
        Self::refit_io(core, idx, dest)?;
        Self::ship_io(core, idx, dest)?;

        // Membership changed; finalize the shared volume.
        let root = Source::shared_root(core, dest);
        if core
            .sources
            .get(root)
            .unwrap()
            .flags
            .contains(DeviceFlags::FLAT_VOLUME)
        {
            Source::set_volume(core, root, None, true, false)?;
        } else {
            Self::send_soft_volume(core, idx)?;
        }

        {
            let o = core.source_outputs.get_mut(idx).unwrap();
            o.save_volume = o.save_volume || save;
        }

        Source::update_status(core, dest)?;
        Source::update_requested_latency(core, dest)?;
        core.subscription_post(
            SubscriptionFacility::SourceOutput,
            SubscriptionOperation::Change,
            idx,
        );
        Ok(())
    }

    /// Adjusts volumes for the new device, per the sharing rules.
    fn update_volume_due_to_moving(core: &mut Core, idx: u32, dest: u32) -> Result<()> {
        let root = Source::shared_root(core, dest);
        let (flat, root_ref, root_real, root_map) = {
            let r = core.sources.get(root).unwrap();
            (
                r.flags.contains(DeviceFlags::FLAT_VOLUME),
                r.reference_volume,
                r.real_volume,
                r.channel_map,
            )
        };

        let origin = core.source_outputs.get(idx).unwrap().origin_source;

        if let Some(origin) = origin {
            // We are the master edge of a filter device: the filter inherits
            // the root's volumes, and this stream carries no gain of its own.
            {
                let o = core.source_outputs.get_mut(idx).unwrap();
                let n = o.channel_map.num_channels() as usize;
                if flat {
                    o.real_ratio = ChannelVolume::norm(n);
                    o.soft_volume = o.volume_factor;
                } else {
                    o.volume = ChannelVolume::norm(n);
                    o.reference_ratio = ChannelVolume::norm(n);
                    o.real_ratio = ChannelVolume::norm(n);
                    o.soft_volume = o.volume_factor;
                }
            }

            let (origin_map, origin_streams) = {
                let f = core.sources.get(origin).unwrap();
                (f.channel_map, f.outputs.iter().copied().collect::<Vec<_>>())
            };
            {
                let f = core.sources.get_mut(origin).unwrap();
                f.reference_volume = root_ref.remap(&root_map, &origin_map);
                f.real_volume = root_real.remap(&root_map, &origin_map);
            }
            // The filter's own streams now divide against the new volumes.
            for s in origin_streams {
                Self::update_volume_due_to_moving(core, s, origin)?;
            }
        } else {
            let o = core.source_outputs.get_mut(idx).unwrap();
            if flat {
                let remapped = root_ref.remap(&root_map, &o.channel_map);
                o.volume = o.reference_ratio.multiply(&remapped);
            } else {
                o.volume = o.reference_ratio;
                o.real_ratio = o.reference_ratio;
                o.soft_volume = o.real_ratio.multiply(&o.volume_factor);
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
        core.hooks.source_output_move_fail.fire(&mut ev);

        // A hook may have re-routed the stream.
        if core
            .source_outputs
            .get(idx)
            .map(|o| o.source.is_some())
            .unwrap_or(true)
        {
            return Ok(());
        }

        {
            let o = core.source_outputs.get_mut(idx).unwrap();
            let mut imp = o.imp.take();
            if let Some(i) = imp.as_mut() {
                i.moving(o, None);
            }
            o.imp = imp;
        }

        if core
            .source_outputs
            .get(idx)
            .map(|o| o.source.is_some())
            .unwrap_or(true)
        {
            return Ok(());
        }

        warn!("source output {} could not be moved, killing it", idx);
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
            let Some(o) = core.source_outputs.get(idx) else {
                return Ok(());
            };
            suspended && o.flags.contains(StreamFlags::KILL_ON_SUSPEND)
        };

        if kill {
            return Self::kill(core, idx);
        }

        let o = core.source_outputs.get_mut(idx).unwrap();
        let mut imp = o.imp.take();
        if let Some(i) = imp.as_mut() {
            i.suspend(o, suspended);
        }
        o.imp = imp;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceFlags;
    use crate::sample::SampleFormat;
    use crate::source::{Source, SourceNewData};
    use crate::volume::Volume;
    use std::sync::{Arc, Mutex};

    struct CollectBackend {
        chunks: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl SourceOutputBackend for CollectBackend {
        fn push(&mut self, chunk: &MemChunk) {
            self.chunks.lock().unwrap().push(chunk.as_slice().to_vec());
        }
    }

    struct NullBackend;

    impl SourceOutputBackend for NullBackend {
        fn push(&mut self, _chunk: &MemChunk) {}
    }

    fn vol(f: f32) -> Volume {
        Volume::from_u32_clamped((f * 0x10000 as f32) as u32)
    }

    fn cv(vals: &[f32]) -> ChannelVolume {
        ChannelVolume::from_slice(&vals.iter().map(|&f| vol(f)).collect::<Vec<_>>())
    }

    fn spec(channels: u8, rate: u32) -> SampleSpec {
        SampleSpec::new(SampleFormat::S16Le, channels, rate).unwrap()
    }

    fn new_source(core: &mut Core, name: &str, channels: u8) -> u32 {
        let mut data = SourceNewData::new(name);
        data.sample_spec = Some(spec(channels, 44100));
        let idx = Source::new(core, data, DeviceFlags::FLAT_VOLUME).unwrap();
        Source::put(core, idx).unwrap();
        idx
    }

    fn new_output(core: &mut Core, source: u32, channels: u8) -> u32 {
        let mut data = SourceOutputNewData::new();
        data.source = Some(source);
        data.sample_spec = Some(spec(channels, 44100));
        data.backend = Some(Box::new(NullBackend));
        let idx = SourceOutput::new(core, data).unwrap();
        SourceOutput::put(core, idx).unwrap();
        idx
    }

    /// Moving a mono stream from a stereo device to a 5.1 device replaces
    /// the resampler, remaps the device factor, and keeps the audible
    /// volume (reference ratio) intact.
    #[test]
    fn move_with_channel_map_change() {
        let mut core = Core::new();
        let stereo = new_source(&mut core, "stereo", 2);
        let surround = new_source(&mut core, "surround", 6);

        let mut data = SourceOutputNewData::new();
        data.source = Some(stereo);
        data.sample_spec = Some(spec(1, 44100));
        data.volume = Some(ChannelVolume::from_slice(&[vol(0.5)]));
        data.volume_factor_device = Some(cv(&[0.9, 0.9]));
        data.backend = Some(Box::new(NullBackend));
        let o = SourceOutput::new(&mut core, data).unwrap();
        SourceOutput::put(&mut core, o).unwrap();

        let before_ratio = core.source_outputs.get(o).unwrap().reference_ratio;

        SourceOutput::move_to(&mut core, o, surround, false).unwrap();

        let output = core.source_outputs.get(o).unwrap();
        assert_eq!(output.source, Some(surround));
        assert_eq!(output.volume_factor_device.num_channels(), 6);
        assert_eq!(output.reference_ratio, before_ratio);

        // volume = reference_ratio × dest reference, channelwise.
        let dest_ref = core.sources.get(surround).unwrap().reference_volume;
        let dest_map = core.sources.get(surround).unwrap().channel_map;
        let expected = before_ratio.multiply(&dest_ref.remap(&dest_map, &output.channel_map));
        assert_eq!(output.volume, expected);

        // Mono → 5.1 needs conversion again.
        let io = output.io.as_ref().unwrap();
        assert!(io.resampler.is_some());
        assert_eq!(output.actual_resample_method, ResampleMethod::Trivial);
    }

    /// The cycle walk: a stream may not move onto its own device, and the
    /// master edge of a filter may not move into the filter's subtree.
    #[test]
    fn move_loop_rejection() {
        let mut core = Core::new();
        let r = new_source(&mut core, "root", 2);
        let other = new_source(&mut core, "other", 2);

        let mut edge_data = SourceOutputNewData::new();
        edge_data.source = Some(r);
        edge_data.sample_spec = Some(spec(2, 44100));
        edge_data.backend = Some(Box::new(NullBackend));
        let edge = SourceOutput::new(&mut core, edge_data).unwrap();

        let mut f_data = SourceNewData::new("filter");
        f_data.sample_spec = Some(spec(2, 44100));
        f_data.output_from_master = Some(edge);
        let f = Source::new(&mut core, f_data, DeviceFlags::SHARE_VOLUME_WITH_MASTER).unwrap();
        core.source_outputs.get_mut(edge).unwrap().origin_source = Some(f);
        Source::put(&mut core, f).unwrap();
        SourceOutput::put(&mut core, edge).unwrap();

        // Same device.
        assert!(!SourceOutput::may_move_to(&core, edge, r));
        // Into the filter it feeds.
        assert!(!SourceOutput::may_move_to(&core, edge, f));
        // Somewhere unrelated is fine.
        assert!(SourceOutput::may_move_to(&core, edge, other));

        // A plain stream on the filter may not move to the filter itself.
        let x = new_output(&mut core, f, 2);
        assert!(!SourceOutput::may_move_to(&core, x, f));
        assert!(SourceOutput::may_move_to(&core, x, other));
    }

    #[test]
    fn dont_move_flag_wins() {
        let mut core = Core::new();
        let a = new_source(&mut core, "a", 2);
        let b = new_source(&mut core, "b", 2);

        let mut data = SourceOutputNewData::new();
        data.source = Some(a);
        data.sample_spec = Some(spec(2, 44100));
        data.flags = StreamFlags::DONT_MOVE;
        data.backend = Some(Box::new(NullBackend));
        let o = SourceOutput::new(&mut core, data).unwrap();
        SourceOutput::put(&mut core, o).unwrap();

        assert!(!SourceOutput::may_move_to(&core, o, b));
        assert_matches::assert_matches!(
            SourceOutput::move_to(&mut core, o, b, false),
            Err(Error::NotSupported)
        );
    }

    /// A failed move falls through to kill unless somebody re-homes the
    /// stream.
    #[test]
    fn fail_move_kills() {
        let mut core = Core::new();
        let a = new_source(&mut core, "a", 2);
        let o = new_output(&mut core, a, 2);

        SourceOutput::start_move(&mut core, o).unwrap();
        SourceOutput::fail_move(&mut core, o).unwrap();
        assert_eq!(
            core.source_outputs.get(o).unwrap().state,
            StreamState::Unlinked
        );
    }

    /// The capture data path: chunks pass the delay queue and reach the
    /// backend with the stream's gain applied.
    #[test]
    fn push_applies_soft_volume() {
        crate::device::mark_io_context();

        let dev_spec = spec(2, 44100);
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let mut io = SourceOutputIo {
            index: 0,
            state: StreamState::Running,
            sample_spec: dev_spec,
            channel_map: ChannelMap::default_for(2).unwrap(),
            soft_volume: ChannelVolume::muted(2),
            muted: false,
            volume_factor_device: None,
            resampler: None,
            delay_memblockq: MemBlockQ::new(),
            direct_on_input: None,
            backend: Box::new(CollectBackend {
                chunks: Arc::clone(&chunks),
            }),
        };

        let chunk = MemChunk::from_vec(vec![0x7f; 8]);
        io.push(&chunk, 0, None, &dev_spec);

        let delivered = chunks.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        // Soft-muted: one pass wiped the samples.
        assert!(delivered[0].iter().all(|&b| b == 0));
    }

    /// The delay queue holds data back up to the device's rewind budget; a
    /// monitor lowers the budget to the sink's unplayed length.
    #[test]
    fn delay_queue_limits() {
        crate::device::mark_io_context();

        let dev_spec = spec(2, 44100);
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let mut io = SourceOutputIo {
            index: 0,
            state: StreamState::Running,
            sample_spec: dev_spec,
            channel_map: ChannelMap::default_for(2).unwrap(),
            soft_volume: ChannelVolume::norm(2),
            muted: false,
            volume_factor_device: None,
            resampler: None,
            delay_memblockq: MemBlockQ::new(),
            direct_on_input: None,
            backend: Box::new(CollectBackend {
                chunks: Arc::clone(&chunks),
            }),
        };

        // A 16-byte rewind budget holds everything back.
        io.push(&MemChunk::from_vec(vec![1; 8]), 16, None, &dev_spec);
        assert!(chunks.lock().unwrap().is_empty());
        assert_eq!(io.delay_memblockq.length(), 8);

        // More data spills the excess.
        io.push(&MemChunk::from_vec(vec![2; 16]), 16, None, &dev_spec);
        assert_eq!(io.delay_memblockq.length(), 16);
        assert_eq!(chunks.lock().unwrap().len(), 1);

        // A monitor with little unplayed sink data lowers the limit.
        io.push(&MemChunk::from_vec(vec![3; 8]), 16, Some(4), &dev_spec);
        assert_eq!(io.delay_memblockq.length(), 4);
    }
}
