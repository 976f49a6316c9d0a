//! The playback device: owns the attached sink inputs, renders their mix,
//! drives the rewind protocol, and propagates volume and mute across its
//! sharing tree.
//!
//! Structurally the twin of [`crate::source`]; the capture side pushes
//! chunks at its streams, this side pulls and mixes them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};

use crate::channel::ChannelMap;
use crate::core::{Core, NamedEntity};
use crate::device::{
    assert_ctl_context, assert_io_context, broadcast_volume, compute_real_ratio,
    compute_reference_ratio, fold_stream_volumes, DeviceFlags, DeviceState, StreamState,
    StreamVolumeEntry, SuspendCause, VolumeChangeQueue,
};
use crate::error::{Error, Result};
use crate::format::FormatInfo;
use crate::hook::{HookResult, SubscriptionFacility, SubscriptionOperation};
use crate::memblock::{apply_volume, mix_into, MemChunk};
use crate::msgq::{AsyncMsgQ, Envelope};
use crate::port::DevicePort;
use crate::props::Props;
use crate::sample::{rate_family, SampleSpec};
use crate::sink_input::{SinkInput, SinkInputIo};
use crate::source::{Source, SHARE_TREE_DEPTH_MAX};
use crate::time::{MicroSeconds, DEFAULT_FIXED_LATENCY, MAX_LATENCY, MIN_LATENCY};
use crate::volume::{ChannelVolume, Volume};

/// The per-device behavior supplied by a driver. All methods are optional;
/// the device's flags declare which are wired.
pub trait SinkImpl {
    /// Consumes `real_volume` and applies it to the hardware; may leave a
    /// residual in `soft_volume`.
    fn set_volume(&mut self, sink: &mut Sink) {
        let _ = sink;
    }

    /// Reads the current hardware volume back into `real_volume`.
    fn get_volume(&mut self, sink: &mut Sink) {
        let _ = sink;
    }

    /// Applies `muted` to the hardware.
    fn set_mute(&mut self, sink: &mut Sink) {
        let _ = sink;
    }

    /// Reads the hardware mute state.
    fn get_mute(&mut self, sink: &mut Sink) -> Option<bool> {
        let _ = sink;
        None
    }

    /// Activates a port in the control thread.
    fn set_port(&mut self, sink: &mut Sink, port: &str) -> Result<()> {
        let _ = (sink, port);
        Err(Error::NotImplemented)
    }

    /// Reconfigures the hardware for a new sample rate.
    fn update_rate(&mut self, sink: &mut Sink, rate: u32) -> Result<()> {
        let _ = (sink, rate);
        Err(Error::NotSupported)
    }

    /// The formats this device can accept.
    fn get_formats(&self, sink: &Sink) -> Vec<FormatInfo> {
        let _ = sink;
        vec![FormatInfo::new(crate::format::FormatEncoding::Pcm)]
    }

    /// Called right before a state transition; may veto it.
    fn set_state(&mut self, sink: &mut Sink, state: DeviceState, cause: SuspendCause) -> Result<()> {
        let _ = (sink, state, cause);
        Ok(())
    }

    /// The aggregate requested latency changed.
    fn update_requested_latency(&mut self, sink: &mut Sink) {
        let _ = sink;
    }
}

/// Control→IO messages for a sink, processed in FIFO order.
pub enum SinkMsg {
    /// Mirror a state transition.
    SetState(DeviceState),
    /// Mirror the device soft volume; `hw` carries a deferred hardware
    /// volume target.
    SetVolume {
        /// New software gain for the mixing stage.
        soft: ChannelVolume,
        /// Deferred hardware volume target, if any.
        hw: Option<ChannelVolume>,
    },
    /// Mirror the mute flag.
    SetMute(bool),
    /// Attach a new input's IO state.
    AddInput(Box<SinkInputIo>),
    /// Detach an input.
    RemoveInput(u32),
    /// Detach an input and hand its IO state back (used while moving).
    TakeInput {
        /// The input's index.
        index: u32,
        /// Where to deliver the IO state.
        reply: Sender<Option<Box<SinkInputIo>>>,
    },
    /// Mirror one input's soft volume and mute.
    SetInputSoftVolume {
        /// The input's index.
        index: u32,
        /// Soft volume in the stream's channel map.
        soft: ChannelVolume,
        /// Stream mute flag.
        muted: bool,
    },
    /// Mirror one input's state.
    SetInputState {
        /// The input's index.
        index: u32,
        /// New stream state.
        state: StreamState,
    },
    /// Switch the active port on the IO thread (deferred volume devices).
    SetPort {
        /// Name of the port to activate.
        port: String,
        /// The port's latency offset.
        latency_offset: MicroSeconds,
    },
    /// Mirror a new port latency offset.
    SetLatencyOffset(MicroSeconds),
    /// Query the current device latency.
    GetLatency(Sender<MicroSeconds>),
    /// Ask the IO side to read the hardware volume back.
    RefreshVolume(Sender<Option<ChannelVolume>>),
    /// Mirror the dynamic latency range.
    SetLatencyRange {
        /// Lower bound.
        min: MicroSeconds,
        /// Upper bound.
        max: MicroSeconds,
    },
    /// Mirror the fixed latency.
    SetFixedLatency(MicroSeconds),
    /// Mirror the min-reduced requested latency.
    SetRequestedLatency(Option<MicroSeconds>),
    /// Mirror the rewind budget.
    SetMaxRewind(usize),
}

/// IO→control notifications for hardware-originated changes.
#[derive(Debug)]
pub enum SinkUpMsg {
    /// The hardware mixer changed under us; reconcile and publish.
    UpdateVolumeAndMute {
        /// Volume read from the hardware.
        hw_volume: ChannelVolume,
        /// Mute read from the hardware.
        muted: bool,
    },
}

/// Builder for a new sink, passed through the `NEW` and `FIXATE` hooks.
#[derive(Debug)]
pub struct SinkNewData {
    /// Unique device name.
    pub name: String,
    /// Driver tag.
    pub driver: String,
    /// Arbitrary properties.
    pub props: Props,
    /// Owning module.
    pub module: Option<u32>,
    /// Owning card.
    pub card: Option<u32>,
    /// The device's sample spec. Mandatory.
    pub sample_spec: Option<SampleSpec>,
    /// The device's channel map; derived from the spec if absent.
    pub channel_map: Option<ChannelMap>,
    /// Initial volume.
    pub volume: Option<ChannelVolume>,
    /// Initial mute.
    pub muted: bool,
    /// The configured ports.
    pub ports: Vec<DevicePort>,
    /// The initially active port.
    pub active_port: Option<String>,
    /// The monitor source capturing this sink's mix.
    pub monitor_source: Option<u32>,
    /// The master-edge stream for volume-sharing filters.
    pub input_to_master: Option<u32>,
    /// Rate the device may switch to.
    pub alternate_rate: Option<u32>,
    /// The 0 dB point.
    pub base_volume: Volume,
    /// Number of discrete hardware volume steps.
    pub n_volume_steps: u32,
    /// Initial suspend causes.
    pub suspend_cause: SuspendCause,
    /// Whether the initial volume came from persistent state.
    pub save_volume: bool,
    /// Whether the initial mute came from persistent state.
    pub save_muted: bool,
    /// Whether the initial port came from persistent state.
    pub save_port: bool,
}

impl SinkNewData {
    /// Creates a builder with the given unique name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: String::new(),
            props: Props::new(),
            module: None,
            card: None,
            sample_spec: None,
            channel_map: None,
            volume: None,
            muted: false,
            ports: Vec::new(),
            active_port: None,
            monitor_source: None,
            input_to_master: None,
            alternate_rate: None,
            base_volume: Volume::NORM,
            n_volume_steps: 0x10001,
            suspend_cause: SuspendCause::empty(),
            save_volume: false,
            save_muted: false,
            save_port: false,
        }
    }
}

/// A playback device.
pub struct Sink {
    /// Stable index into the core's sink set.
    pub index: u32,
    /// Unique name.
    pub name: String,
    /// Driver tag.
    pub driver: String,
    /// Arbitrary properties.
    pub props: Props,
    /// Owning module.
    pub module: Option<u32>,
    /// Owning card.
    pub card: Option<u32>,
    /// Capability flags.
    pub flags: DeviceFlags,
    /// Lifecycle state.
    pub state: DeviceState,
    /// Why the device is suspended, if it is.
    pub suspend_cause: SuspendCause,
    /// The configured format.
    pub sample_spec: SampleSpec,
    /// The configured channel map.
    pub channel_map: ChannelMap,
    /// The preferred rate.
    pub default_rate: u32,
    /// The rate the device may switch to.
    pub alternate_rate: u32,
    /// Attached inputs, by stream index.
    pub inputs: BTreeSet<u32>,
    /// How many attached inputs are corked.
    pub n_corked: u32,
    /// The monitor source capturing this sink's mix.
    pub monitor_source: Option<u32>,
    /// The master-edge stream for volume-sharing filters.
    pub input_to_master: Option<u32>,
    /// What the user asked for; visible externally.
    pub reference_volume: ChannelVolume,
    /// What the hardware actually applies.
    pub real_volume: ChannelVolume,
    /// Residual software gain applied while mixing.
    pub soft_volume: ChannelVolume,
    /// Mute state.
    pub muted: bool,
    /// Whether the volume should be persisted.
    pub save_volume: bool,
    /// Whether the mute should be persisted.
    pub save_muted: bool,
    /// Whether the port selection should be persisted.
    pub save_port: bool,
    /// The 0 dB point.
    pub base_volume: Volume,
    /// Number of discrete hardware volume steps.
    pub n_volume_steps: u32,
    /// Configured ports, by name.
    pub ports: BTreeMap<String, DevicePort>,
    /// The active port's name.
    pub active_port: Option<String>,
    /// The active port's latency offset.
    pub port_latency_offset: MicroSeconds,
    /// Min-reduced requested latency across streams.
    pub requested_latency: Option<MicroSeconds>,
    /// Dynamic latency range lower bound.
    pub min_latency: MicroSeconds,
    /// Dynamic latency range upper bound.
    pub max_latency: MicroSeconds,
    /// The latency reported without `DYNAMIC_LATENCY`.
    pub fixed_latency: MicroSeconds,
    /// Set when the hardware mixer may have changed behind our back.
    pub mixer_dirty: Arc<AtomicBool>,
    /// The driver behavior table; dropped on unlink.
    pub imp: Option<Box<dyn SinkImpl>>,
    /// The control→IO queue, once the driver has started its IO thread.
    pub msgq: Option<AsyncMsgQ<SinkMsg>>,
    /// Hardware-originated notifications from the IO thread.
    pub up_rx: Option<Receiver<SinkUpMsg>>,
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Sink {
    /// Creates a sink from a builder.
    pub fn new(core: &mut Core, mut data: SinkNewData, flags: DeviceFlags) -> Result<u32> {
        assert_ctl_context();

        if core.hooks.sink_new.fire(&mut data) == HookResult::Cancel {
            return Err(Error::Invalid("sink creation vetoed".into()));
        }

        let spec = data
            .sample_spec
            .ok_or_else(|| Error::Invalid("sink needs a sample spec".into()))?;
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

        if flags.contains(DeviceFlags::SHARE_VOLUME_WITH_MASTER) && data.volume.is_some() {
            return Err(Error::Invalid(
                "volume sharing devices may not configure a volume".into(),
            ));
        }

        if core.hooks.sink_fixate.fire(&mut data) == HookResult::Cancel {
            return Err(Error::Invalid("sink creation vetoed".into()));
        }

        let mut flags = flags;
        if flags.contains(DeviceFlags::SHARE_VOLUME_WITH_MASTER) {
            flags.remove(
                DeviceFlags::DECIBEL_VOLUME
                    | DeviceFlags::HW_VOLUME_CTRL
                    | DeviceFlags::HW_MUTE_CTRL
                    | DeviceFlags::DEFERRED_VOLUME,
            );
        } else {
            flags.insert(DeviceFlags::DECIBEL_VOLUME);
        }

        let reference_volume = match data.volume {
            Some(v) => broadcast_volume(&v, spec.channels)
                .ok_or_else(|| Error::Invalid("volume does not match sample spec".into()))?,
            None => ChannelVolume::norm(spec.channels as usize),
        };

        let active_port = data.active_port.clone().or_else(|| {
            data.ports
                .iter()
                .max_by_key(|p| p.priority)
                .map(|p| p.name.clone())
        });
        let port_latency_offset = active_port
            .as_deref()
            .and_then(|name| data.ports.iter().find(|p| p.name == name))
            .map(|p| p.latency_offset)
            .unwrap_or_default();

        let name = data.name.clone();
        let alternate_rate = data.alternate_rate.unwrap_or(core.alternate_rate);
        let default_rate = spec.rate;

        let idx = core.sinks.insert_with(|index| Sink {
            index,
            name: data.name,
            driver: data.driver,
            props: data.props,
            module: data.module,
            card: data.card,
            flags,
            state: DeviceState::Init,
            suspend_cause: data.suspend_cause,
            sample_spec: spec,
            channel_map,
            default_rate,
            alternate_rate,
            inputs: BTreeSet::new(),
            n_corked: 0,
            monitor_source: data.monitor_source,
            input_to_master: data.input_to_master,
            reference_volume,
            real_volume: reference_volume,
            soft_volume: ChannelVolume::norm(spec.channels as usize),
            muted: data.muted,
            save_volume: data.save_volume,
            save_muted: data.save_muted,
            save_port: data.save_port,
            base_volume: data.base_volume,
            n_volume_steps: data.n_volume_steps,
            ports: data.ports.into_iter().map(|p| (p.name.clone(), p)).collect(),
            active_port,
            port_latency_offset,
            requested_latency: None,
            min_latency: MIN_LATENCY,
            max_latency: MAX_LATENCY,
            fixed_latency: DEFAULT_FIXED_LATENCY,
            mixer_dirty: Arc::new(AtomicBool::new(false)),
            imp: None,
            msgq: None,
            up_rx: None,
        });

        if let Err(e) = core.register_name(&name, NamedEntity::Sink(idx)) {
            core.sinks.remove(idx);
            return Err(e);
        }

        debug!("created sink {} \"{}\"", idx, name);
        Ok(idx)
    }

    /// Publishes the sink and transitions `INIT` to `IDLE` or `SUSPENDED`.
    pub fn put(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        {
            let s = core.sinks.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
            assert_eq!(s.state, DeviceState::Init);
            assert!(
                !s.flags.contains(DeviceFlags::DEFERRED_VOLUME)
                    || s.flags.contains(DeviceFlags::HW_VOLUME_CTRL),
                "deferred volume requires a hardware volume"
            );
            assert!(
                !s.flags.contains(DeviceFlags::SHARE_VOLUME_WITH_MASTER)
                    || !s.flags.contains(DeviceFlags::FLAT_VOLUME),
                "flat volume lives at the sharing root"
            );
            if s.flags.contains(DeviceFlags::SHARE_VOLUME_WITH_MASTER) {
                assert!(
                    s.input_to_master.is_some(),
                    "volume sharing needs a master stream"
                );
            }
        }

        let root = Self::shared_root(core, idx);
        if root != idx {
            let (root_ref, root_real, root_map) = {
                let r = core.sinks.get(root).unwrap();
                (r.reference_volume, r.real_volume, r.channel_map)
            };
            let s = core.sinks.get_mut(idx).unwrap();
            s.reference_volume = root_ref.remap(&root_map, &s.channel_map);
            s.real_volume = root_real.remap(&root_map, &s.channel_map);
        } else {
            let s = core.sinks.get_mut(idx).unwrap();
            s.real_volume = s.reference_volume;
            if !s.flags.contains(DeviceFlags::HW_VOLUME_CTRL) {
                s.base_volume = Volume::NORM;
                s.n_volume_steps = 0x10001;
            }
        }

        let target = {
            let s = core.sinks.get(idx).unwrap();
            if s.suspend_cause.is_empty() {
                DeviceState::Idle
            } else {
                DeviceState::Suspended
            }
        };
        Self::set_state(core, idx, target)?;

        let mut hook_arg = idx;
        core.hooks.sink_put.fire(&mut hook_arg);
        core.subscription_post(SubscriptionFacility::Sink, SubscriptionOperation::New, idx);
        Ok(())
    }

    /// Removes the sink: kills the attached streams, unregisters the name,
    /// and transitions to `UNLINKED`.
    pub fn unlink(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let (linked, name, inputs) = {
            let s = core.sinks.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
            if s.state == DeviceState::Unlinked {
                return Ok(());
            }
            (
                s.state != DeviceState::Init,
                s.name.clone(),
                s.inputs.iter().copied().collect::<Vec<_>>(),
            )
        };

        if linked {
            let mut hook_arg = idx;
            core.hooks.sink_unlink.fire(&mut hook_arg);
        }

        for i in inputs {
            SinkInput::kill(core, i)?;
        }

        core.unregister_name(&name);
        Self::set_state(core, idx, DeviceState::Unlinked)?;

        let s = core.sinks.get_mut(idx).unwrap();
        s.imp = None;
        s.msgq = None;

        if linked {
            core.subscription_post(
                SubscriptionFacility::Sink,
                SubscriptionOperation::Remove,
                idx,
            );
        }
        Ok(())
    }

    /// Walks `input_to_master` edges to the device that owns the volume.
    pub fn shared_root(core: &Core, mut idx: u32) -> u32 {
        for _ in 0..SHARE_TREE_DEPTH_MAX {
            let Some(s) = core.sinks.get(idx) else {
                return idx;
            };
            if !s.flags.contains(DeviceFlags::SHARE_VOLUME_WITH_MASTER) {
                return idx;
            }
            let Some(master) = s
                .input_to_master
                .and_then(|i| core.sink_inputs.get(i))
                .and_then(|i| i.sink)
            else {
                return idx;
            };
            idx = master;
        }
        panic!("sharing tree does not terminate");
    }

    fn sharing_subtree(core: &Core, root: u32) -> Vec<u32> {
        let mut subtree = vec![root];
        for idx in core.sinks.indices() {
            if idx != root && Self::shared_root(core, idx) == root {
                subtree.push(idx);
            }
        }
        subtree
    }

    fn subtree_streams(core: &Core, subtree: &[u32]) -> Vec<(u32, u32, bool)> {
        let mut streams = Vec::new();
        for &dev in subtree {
            let Some(s) = core.sinks.get(dev) else {
                continue;
            };
            for &i in &s.inputs {
                if let Some(input) = core.sink_inputs.get(i) {
                    streams.push((i, dev, input.origin_sink.is_some()));
                }
            }
        }
        streams
    }

    /// Whether a passthrough stream is connected.
    pub fn is_passthrough(core: &Core, idx: u32) -> bool {
        let Some(s) = core.sinks.get(idx) else {
            return false;
        };
        s.inputs.iter().any(|&i| {
            core.sink_inputs
                .get(i)
                .map(|i| i.is_passthrough())
                .unwrap_or(false)
        })
    }

    /// A passthrough stream attached: the monitor must stop capturing
    /// mixable data.
    pub(crate) fn enter_passthrough(core: &mut Core, idx: u32) -> Result<()> {
        let monitor = core.sinks.get(idx).and_then(|s| s.monitor_source);
        if let Some(m) = monitor {
            Source::suspend(core, m, true, SuspendCause::PASSTHROUGH)?;
        }
        Ok(())
    }

    /// The passthrough stream left again.
    pub(crate) fn leave_passthrough(core: &mut Core, idx: u32) -> Result<()> {
        let monitor = core.sinks.get(idx).and_then(|s| s.monitor_source);
        if let Some(m) = monitor {
            Source::suspend(core, m, false, SuspendCause::PASSTHROUGH)?;
        }
        Ok(())
    }

    /// Sets the device volume, or recomputes it from the attached streams.
    /// See [`Source::set_volume`]; the algorithm is the same.
    pub fn set_volume(
        core: &mut Core,
        idx: u32,
        volume: Option<&ChannelVolume>,
        send_msg: bool,
        save: bool,
    ) -> Result<()> {
        assert_ctl_context();

        let root = Self::shared_root(core, idx);
        let (root_map, root_channels, flat) = {
            let s = core.sinks.get(root).ok_or(Error::NoEntity(root.to_string()))?;
            (
                s.channel_map,
                s.sample_spec.channels,
                s.flags.contains(DeviceFlags::FLAT_VOLUME),
            )
        };

        if volume.is_some() && Self::is_passthrough(core, root) {
            return Err(Error::Busy);
        }
        if volume.is_none() && !flat {
            return Err(Error::Invalid(
                "volume can only be synchronized from streams in flat mode".into(),
            ));
        }

        let subtree = Self::sharing_subtree(core, root);
        let streams = Self::subtree_streams(core, &subtree);

        let stream_entries = |core: &Core| -> Vec<StreamVolumeEntry> {
            streams
                .iter()
                .filter(|(_, _, edge)| !edge)
                .filter_map(|(i, _, _)| core.sink_inputs.get(*i))
                .map(|i| StreamVolumeEntry {
                    volume: i.volume,
                    channel_map: i.channel_map,
                })
                .collect()
        };

        let old_reference = core.sinks.get(root).unwrap().reference_volume;

        let new_reference = match volume {
            Some(v) => broadcast_volume(v, root_channels)
                .ok_or_else(|| Error::Invalid("volume does not match channel map".into()))?,
            None => {
                let real = fold_stream_volumes(&stream_entries(core), &root_map, &old_reference);
                let mut merged = old_reference;
                for (m, r) in merged.channels_mut().iter_mut().zip(real.channels()) {
                    *m = (*m).max(*r);
                }
                merged
            }
        };
        let reference_changed = new_reference != old_reference;

        {
            let s = core.sinks.get_mut(root).unwrap();
            s.reference_volume = new_reference;
            if reference_changed {
                s.save_volume = save;
            }
        }

        if volume.is_some() && flat && reference_changed {
            for (i, _, edge) in &streams {
                if *edge {
                    continue;
                }
                if let Some(input) = core.sink_inputs.get_mut(*i) {
                    let remapped = new_reference.remap(&root_map, &input.channel_map);
                    input.volume = input.reference_ratio.multiply(&remapped);
                    core.subscription_post(
                        SubscriptionFacility::SinkInput,
                        SubscriptionOperation::Change,
                        *i,
                    );
                }
            }
        }

        let new_real = if flat {
            fold_stream_volumes(&stream_entries(core), &root_map, &new_reference)
        } else {
            new_reference
        };
        core.sinks.get_mut(root).unwrap().real_volume = new_real;

        for &child in &subtree[1..] {
            let child_map = core.sinks.get(child).unwrap().channel_map;
            let c = core.sinks.get_mut(child).unwrap();
            c.reference_volume = new_reference.remap(&root_map, &child_map);
            c.real_volume = new_real.remap(&root_map, &child_map);
            core.subscription_post(
                SubscriptionFacility::Sink,
                SubscriptionOperation::Change,
                child,
            );
        }

        for (i, _, edge) in &streams {
            let Some(input) = core.sink_inputs.get_mut(*i) else {
                continue;
            };
            if *edge {
                let n = input.channel_map.num_channels() as usize;
                input.real_ratio = ChannelVolume::norm(n);
                input.soft_volume = input.volume_factor;
                continue;
            }

            input.reference_ratio = compute_reference_ratio(
                &input.volume,
                &input.channel_map,
                &input.reference_ratio,
                &new_reference,
                &root_map,
            );

            if flat {
                let ratios = compute_real_ratio(
                    &input.volume,
                    &input.channel_map,
                    &input.volume_factor,
                    &input.real_ratio,
                    &new_real,
                    &root_map,
                );
                input.real_ratio = ratios.real_ratio;
                input.soft_volume = ratios.soft_volume;
            } else {
                input.real_ratio = input.volume;
                input.soft_volume = input.volume.multiply(&input.volume_factor);
            }
        }

        let hw_target = {
            let s = core.sinks.get_mut(root).unwrap();
            if s.flags.contains(DeviceFlags::HW_VOLUME_CTRL) {
                s.soft_volume = ChannelVolume::norm(root_channels as usize);
                if s.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
                    Some(s.real_volume)
                } else {
                    let mut imp = s.imp.take();
                    if let Some(i) = imp.as_mut() {
                        i.set_volume(s);
                    }
                    s.imp = imp;
                    None
                }
            } else {
                s.soft_volume = s.real_volume;
                None
            }
        };

        if send_msg {
            Self::send_volume_messages(core, root, &subtree, &streams, hw_target)?;
        }

        core.subscription_post(
            SubscriptionFacility::Sink,
            SubscriptionOperation::Change,
            root,
        );
        Ok(())
    }

    fn send_volume_messages(
        core: &mut Core,
        root: u32,
        subtree: &[u32],
        streams: &[(u32, u32, bool)],
        hw_target: Option<ChannelVolume>,
    ) -> Result<()> {
        for &dev in subtree {
            let s = core.sinks.get(dev).unwrap();
            let soft = s.soft_volume;
            let hw = if dev == root { hw_target } else { None };
            if let Some(q) = &s.msgq {
                q.send(SinkMsg::SetVolume { soft, hw })?;
            }
        }

        for (i, dev, _) in streams {
            let (soft, muted) = {
                let input = core.sink_inputs.get(*i).unwrap();
                (input.soft_volume, input.muted)
            };
            let s = core.sinks.get(*dev).unwrap();
            if let Some(q) = &s.msgq {
                q.send(SinkMsg::SetInputSoftVolume {
                    index: *i,
                    soft,
                    muted,
                })?;
            }
        }
        Ok(())
    }

    /// Reads the device volume, optionally asking the hardware first.
    pub fn get_volume(core: &mut Core, idx: u32, force_refresh: bool) -> Result<ChannelVolume> {
        assert_ctl_context();

        if force_refresh {
            let has_hw = {
                let s = core.sinks.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
                s.flags.contains(DeviceFlags::HW_VOLUME_CTRL)
            };

            if has_hw {
                let new_real = {
                    let s = core.sinks.get_mut(idx).unwrap();
                    if s.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
                        if let Some(q) = &s.msgq {
                            let (tx, rx) = bounded(1);
                            q.send(SinkMsg::RefreshVolume(tx))?;
                            rx.recv().ok().flatten()
                        } else {
                            None
                        }
                    } else {
                        let mut imp = s.imp.take();
                        if let Some(i) = imp.as_mut() {
                            i.get_volume(s);
                        }
                        let real = s.real_volume;
                        s.imp = imp;
                        Some(real)
                    }
                };

                if let Some(real) = new_real {
                    Self::propagate_real_volume(core, idx, real)?;
                }
            }
        }

        let s = core.sinks.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
        Ok(s.reference_volume)
    }

    fn propagate_real_volume(core: &mut Core, idx: u32, new_real: ChannelVolume) -> Result<()> {
        let root = Self::shared_root(core, idx);
        let (old_real, old_reference) = {
            let s = core.sinks.get(root).unwrap();
            (s.real_volume, s.reference_volume)
        };

        if new_real == old_real {
            return Ok(());
        }

        let ratio = old_reference.divide(&old_real);
        let new_reference = new_real.multiply(&ratio);
        {
            let s = core.sinks.get_mut(root).unwrap();
            s.real_volume = new_real;
            s.reference_volume = new_reference;
        }

        Self::set_volume(core, root, Some(&new_reference), true, false)
    }

    /// Sets the mute switch.
    pub fn set_mute(core: &mut Core, idx: u32, muted: bool, save: bool) -> Result<()> {
        assert_ctl_context();

        let root = Self::shared_root(core, idx);
        let changed = {
            let s = core.sinks.get_mut(root).ok_or(Error::NoEntity(root.to_string()))?;
            let changed = s.muted != muted;
            s.muted = muted;
            if changed {
                s.save_muted = save;
            } else {
                s.save_muted |= save;
            }

            if s.flags.contains(DeviceFlags::HW_MUTE_CTRL)
                && !s.flags.contains(DeviceFlags::DEFERRED_VOLUME)
            {
                let mut imp = s.imp.take();
                if let Some(i) = imp.as_mut() {
                    i.set_mute(s);
                }
                s.imp = imp;
            }
            changed
        };

        let subtree = Self::sharing_subtree(core, root);
        for &dev in &subtree {
            let s = core.sinks.get_mut(dev).unwrap();
            s.muted = muted;
            if let Some(q) = &s.msgq {
                q.send(SinkMsg::SetMute(muted))?;
            }
        }

        if changed {
            core.subscription_post(
                SubscriptionFacility::Sink,
                SubscriptionOperation::Change,
                root,
            );
        }
        Ok(())
    }

    /// Reads the mute switch, optionally refreshing it from the hardware.
    pub fn get_mute(core: &mut Core, idx: u32, force_refresh: bool) -> Result<bool> {
        assert_ctl_context();

        if force_refresh {
            let reported = {
                let s = core.sinks.get_mut(idx).ok_or(Error::NoEntity(idx.to_string()))?;
                if s.flags.contains(DeviceFlags::HW_MUTE_CTRL) {
                    let mut imp = s.imp.take();
                    let m = imp.as_mut().and_then(|i| i.get_mute(s));
                    s.imp = imp;
                    m
                } else {
                    None
                }
            };

            if let Some(m) = reported {
                let s = core.sinks.get(idx).unwrap();
                if s.muted != m {
                    Self::set_mute(core, idx, m, true)?;
                }
            }
        }

        Ok(core
            .sinks
            .get(idx)
            .ok_or(Error::NoEntity(idx.to_string()))?
            .muted)
    }

    /// Activates a port by name; a round-trip through the IO thread when
    /// deferred volume is in use.
    pub fn set_port(core: &mut Core, idx: u32, name: &str, save: bool) -> Result<()> {
        assert_ctl_context();

        let (deferred, latency_offset) = {
            let s = core.sinks.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
            let port = s
                .ports
                .get(name)
                .ok_or_else(|| Error::NoEntity(name.to_owned()))?;
            if s.active_port.as_deref() == Some(name) {
                return Ok(());
            }
            (
                s.flags.contains(DeviceFlags::DEFERRED_VOLUME),
                port.latency_offset,
            )
        };

        if deferred {
            let s = core.sinks.get(idx).unwrap();
            let q = s
                .msgq
                .as_ref()
                .ok_or_else(|| Error::BadState("no IO thread".into()))?;
            q.send(SinkMsg::SetPort {
                port: name.to_owned(),
                latency_offset,
            })?;
        } else {
            let s = core.sinks.get_mut(idx).unwrap();
            let mut imp = s.imp.take();
            let r = imp
                .as_mut()
                .map(|i| i.set_port(s, name))
                .unwrap_or(Err(Error::NotImplemented));
            s.imp = imp;
            r?;
            if let Some(q) = &s.msgq {
                q.post(SinkMsg::SetLatencyOffset(latency_offset))?;
            }
        }

        let s = core.sinks.get_mut(idx).unwrap();
        s.active_port = Some(name.to_owned());
        s.save_port = save;
        s.port_latency_offset = latency_offset;

        let mut hook_arg = idx;
        core.hooks.sink_port_changed.fire(&mut hook_arg);
        core.subscription_post(SubscriptionFacility::Sink, SubscriptionOperation::Change, idx);
        Ok(())
    }

    /// Requests or releases suspension for `cause`.
    pub fn suspend(core: &mut Core, idx: u32, on: bool, cause: SuspendCause) -> Result<()> {
        assert_ctl_context();

        let flipped = {
            let s = core.sinks.get_mut(idx).ok_or(Error::NoEntity(idx.to_string()))?;
            let was = !s.suspend_cause.is_empty();
            if on {
                s.suspend_cause.insert(cause);
            } else {
                s.suspend_cause.remove(cause);
            }
            was != !s.suspend_cause.is_empty()
        };

        if !flipped {
            return Ok(());
        }

        let suspending = {
            let s = core.sinks.get(idx).unwrap();
            !s.suspend_cause.is_empty()
        };

        if suspending {
            Self::set_state(core, idx, DeviceState::Suspended)
        } else {
            Self::set_state(core, idx, DeviceState::Idle)?;
            Self::reconcile_mixer(core, idx)?;
            Self::update_status(core, idx)
        }
    }

    fn reconcile_mixer(core: &mut Core, idx: u32) -> Result<()> {
        let dirty = {
            let s = core.sinks.get(idx).unwrap();
            s.mixer_dirty.swap(false, Ordering::AcqRel)
        };
        if !dirty {
            return Ok(());
        }

        debug!("sink {}: mixer dirty, re-applying state", idx);

        let (active_port, reference, muted) = {
            let s = core.sinks.get(idx).unwrap();
            (s.active_port.clone(), s.reference_volume, s.muted)
        };

        if let Some(port) = active_port {
            let s = core.sinks.get_mut(idx).unwrap();
            let mut imp = s.imp.take();
            if let Some(i) = imp.as_mut() {
                if let Err(e) = i.set_port(s, &port) {
                    warn!("sink {}: failed to re-apply port {}: {}", idx, port, e);
                }
            }
            s.imp = imp;
        }

        if let Err(e) = Self::set_volume(core, idx, Some(&reference), true, false) {
            warn!("sink {}: failed to re-apply volume: {}", idx, e);
        }
        Self::set_mute(core, idx, muted, false)
    }

    /// Resolves the state to `RUNNING` or `IDLE`.
    pub fn update_status(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let target = {
            let s = core.sinks.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
            if !s.state.is_opened() {
                return Ok(());
            }
            if s.inputs.len() as u32 > s.n_corked {
                DeviceState::Running
            } else {
                DeviceState::Idle
            }
        };
        Self::set_state(core, idx, target)
    }

    pub(crate) fn set_state(core: &mut Core, idx: u32, state: DeviceState) -> Result<()> {
        let (old, inputs) = {
            let s = core.sinks.get_mut(idx).ok_or(Error::NoEntity(idx.to_string()))?;
            let old = s.state;
            if old == state {
                return Ok(());
            }

            let cause = s.suspend_cause;
            let mut imp = s.imp.take();
            let r = imp
                .as_mut()
                .map(|i| i.set_state(s, state, cause))
                .unwrap_or(Ok(()));
            s.imp = imp;
            r?;

            s.state = state;
            if let Some(q) = &s.msgq {
                q.send(SinkMsg::SetState(state))?;
            }
            (old, s.inputs.iter().copied().collect::<Vec<_>>())
        };

        if old.is_opened() != state.is_opened() {
            let suspended = !state.is_opened();
            for i in inputs {
                SinkInput::device_suspended(core, i, suspended)?;
            }
        }

        if old != DeviceState::Init {
            core.subscription_post(SubscriptionFacility::Sink, SubscriptionOperation::Change, idx);
        }
        Ok(())
    }

    /// Switches the device sample rate; refused while running.
    pub fn update_rate(core: &mut Core, idx: u32, rate: u32, passthrough: bool) -> Result<bool> {
        assert_ctl_context();

        let (desired, inputs) = {
            let s = core.sinks.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;

            if s.state == DeviceState::Running {
                debug!("sink {}: cannot change rate while running", idx);
                return Ok(false);
            }

            let desired = if passthrough {
                rate
            } else {
                if s.default_rate == s.alternate_rate {
                    warn!(
                        "sink {}: default and alternate rate are both {}, not switching",
                        idx, s.default_rate
                    );
                    return Err(Error::Invalid("no alternate rate configured".into()));
                }

                let family = rate_family(rate)
                    .ok_or_else(|| Error::Invalid(format!("unsupported rate {}", rate)))?;

                if rate == s.default_rate || rate == s.alternate_rate {
                    rate
                } else if rate_family(s.alternate_rate) == Some(family) {
                    s.alternate_rate
                } else if rate_family(s.default_rate) == Some(family) {
                    s.default_rate
                } else {
                    return Err(Error::NotSupported);
                }
            };

            if desired == s.sample_spec.rate {
                return Ok(false);
            }

            (desired, s.inputs.iter().copied().collect::<Vec<_>>())
        };

        Self::suspend(core, idx, true, SuspendCause::INTERNAL)?;

        let switched = {
            let s = core.sinks.get_mut(idx).unwrap();
            let mut imp = s.imp.take();
            let r = imp
                .as_mut()
                .map(|i| i.update_rate(s, desired))
                .unwrap_or(Err(Error::NotSupported));
            s.imp = imp;
            match r {
                Ok(()) => {
                    s.sample_spec.rate = desired;
                    true
                }
                Err(e) => {
                    warn!("sink {}: rate switch to {} failed: {}", idx, desired, e);
                    false
                }
            }
        };

        if switched {
            for i in inputs {
                SinkInput::update_rate(core, i)?;
            }
        }

        Self::suspend(core, idx, false, SuspendCause::INTERNAL)?;
        Ok(switched)
    }

    /// The device latency, resolved through the IO thread when dynamic.
    pub fn get_latency(core: &Core, idx: u32) -> Result<MicroSeconds> {
        assert_ctl_context();

        let s = core.sinks.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
        if !s.flags.contains(DeviceFlags::LATENCY) {
            return Ok(MicroSeconds(0));
        }
        if !s.flags.contains(DeviceFlags::DYNAMIC_LATENCY) {
            return Ok((s.fixed_latency + s.port_latency_offset).clamp_latency());
        }

        let q = s
            .msgq
            .as_ref()
            .ok_or_else(|| Error::BadState("no IO thread".into()))?;
        let (tx, rx) = bounded(1);
        q.send(SinkMsg::GetLatency(tx))?;
        rx.recv()
            .map_err(|_| Error::BadState("IO thread is gone".into()))
    }

    /// Sets the dynamic latency range.
    pub fn set_latency_range(
        core: &mut Core,
        idx: u32,
        min: MicroSeconds,
        max: MicroSeconds,
    ) -> Result<()> {
        assert_ctl_context();

        let s = core.sinks.get_mut(idx).ok_or(Error::NoEntity(idx.to_string()))?;
        let min = min.clamp_latency();
        let max = max.clamp_latency();
        if min > max {
            return Err(Error::Invalid("min latency above max".into()));
        }
        s.min_latency = min;
        s.max_latency = max;
        if let Some(q) = &s.msgq {
            q.send(SinkMsg::SetLatencyRange { min, max })?;
        }
        Ok(())
    }

    /// Sets the fixed latency reported without dynamic latency support.
    pub fn set_fixed_latency(core: &mut Core, idx: u32, latency: MicroSeconds) -> Result<()> {
        assert_ctl_context();

        let s = core.sinks.get_mut(idx).ok_or(Error::NoEntity(idx.to_string()))?;
        let latency = latency.clamp_latency();
        s.fixed_latency = latency;
        if let Some(q) = &s.msgq {
            q.send(SinkMsg::SetFixedLatency(latency))?;
        }
        Ok(())
    }

    /// Recomputes the min-reduced requested latency across streams.
    pub fn update_requested_latency(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let (requested, inputs_empty) = {
            let s = core.sinks.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
            let mut requested: Option<MicroSeconds> = None;
            for &i in &s.inputs {
                if let Some(input) = core.sink_inputs.get(i) {
                    if let Some(l) = input.requested_latency {
                        requested = Some(requested.map_or(l, |r| r.min(l)));
                    }
                }
            }
            (
                requested.map(|l| l.clamp_latency().max(s.min_latency).min(s.max_latency)),
                s.inputs.is_empty(),
            )
        };

        let s = core.sinks.get_mut(idx).unwrap();
        s.requested_latency = if inputs_empty { None } else { requested };
        if let Some(q) = &s.msgq {
            q.send(SinkMsg::SetRequestedLatency(s.requested_latency))?;
        }

        let s = core.sinks.get_mut(idx).unwrap();
        let mut imp = s.imp.take();
        if let Some(i) = imp.as_mut() {
            i.update_requested_latency(s);
        }
        s.imp = imp;
        Ok(())
    }

    /// Starts moving every movable stream off the device.
    pub fn move_all_start(core: &mut Core, idx: u32) -> Result<Vec<u32>> {
        assert_ctl_context();

        let inputs: Vec<u32> = core
            .sinks
            .get(idx)
            .ok_or(Error::NoEntity(idx.to_string()))?
            .inputs
            .iter()
            .copied()
            .collect();

        let mut queue = Vec::new();
        for i in inputs {
            if SinkInput::may_move(core, i) {
                SinkInput::start_move(core, i)?;
                queue.push(i);
            }
        }
        Ok(queue)
    }

    /// Re-attaches every queued stream to `dest`.
    pub fn move_all_finish(core: &mut Core, queue: Vec<u32>, dest: u32, save: bool) -> Result<()> {
        assert_ctl_context();

        for i in queue {
            if SinkInput::may_move_to(core, i, dest) {
                SinkInput::finish_move(core, i, dest, save)?;
            } else {
                SinkInput::fail_move(core, i)?;
            }
        }
        Ok(())
    }

    /// Fails every queued move.
    pub fn move_all_fail(core: &mut Core, queue: Vec<u32>) -> Result<()> {
        assert_ctl_context();

        for i in queue {
            SinkInput::fail_move(core, i)?;
        }
        Ok(())
    }

    /// Drains hardware-originated notifications posted by the IO thread.
    pub fn flush_io_events(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        loop {
            let msg = {
                let s = core.sinks.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
                match &s.up_rx {
                    Some(rx) => match rx.try_recv() {
                        Ok(msg) => msg,
                        Err(_) => return Ok(()),
                    },
                    None => return Ok(()),
                }
            };

            match msg {
                SinkUpMsg::UpdateVolumeAndMute { hw_volume, muted } => {
                    Self::propagate_real_volume(core, idx, hw_volume)?;
                    let s = core.sinks.get(idx).unwrap();
                    if s.muted != muted {
                        Self::set_mute(core, idx, muted, true)?;
                    }
                }
            }
        }
    }
}

/// The IO thread's mirror of a sink.
pub struct SinkThreadInfo {
    /// Mirrored lifecycle state.
    pub state: DeviceState,
    /// The device's sample spec.
    pub sample_spec: SampleSpec,
    /// The device's channel map.
    pub channel_map: ChannelMap,
    /// Device soft volume, applied while mixing.
    pub soft_volume: ChannelVolume,
    /// Mirrored mute flag.
    pub muted: bool,
    /// Attached inputs' IO state.
    pub inputs: BTreeMap<u32, SinkInputIo>,
    /// Mirrored requested latency.
    pub requested_latency: Option<MicroSeconds>,
    /// Mirrored latency range.
    pub min_latency: MicroSeconds,
    /// Mirrored latency range.
    pub max_latency: MicroSeconds,
    /// Mirrored fixed latency.
    pub fixed_latency: MicroSeconds,
    /// How far back the hardware buffer can be rewritten.
    pub max_rewind: usize,
    /// Outstanding device rewind request, in device bytes.
    pub rewind_requested: usize,
    /// Mirrored port latency offset.
    pub port_latency_offset: MicroSeconds,
    /// The last hardware volume committed.
    pub current_hw_volume: ChannelVolume,
    /// Pending deferred hardware volume changes.
    pub volume_changes: VolumeChangeQueue,
    /// Forwards the rendered mix to the monitor source, if one exists.
    pub monitor_post: Option<Box<dyn FnMut(&MemChunk) + Send>>,
    /// Commits a hardware volume; required for deferred volume.
    pub write_volume: Option<Box<dyn FnMut(&ChannelVolume) + Send>>,
    /// Reads the hardware volume; used by deferred refresh.
    pub read_volume: Option<Box<dyn FnMut() -> Option<ChannelVolume> + Send>>,
    /// Reports the device latency.
    pub get_latency: Option<Box<dyn FnMut() -> MicroSeconds + Send>>,
    /// Switches the active port from the IO thread.
    pub set_port: Option<Box<dyn FnMut(&str) -> Result<()> + Send>>,
    /// Posts hardware-originated changes back to the control thread.
    pub up: Option<Sender<SinkUpMsg>>,
}

impl SinkThreadInfo {
    /// Creates the mirror for a device in `spec`/`map`.
    pub fn new(
        spec: SampleSpec,
        map: ChannelMap,
        safety_margin: MicroSeconds,
        extra_delay: MicroSeconds,
    ) -> Self {
        Self {
            state: DeviceState::Init,
            sample_spec: spec,
            channel_map: map,
            soft_volume: ChannelVolume::norm(spec.channels as usize),
            muted: false,
            inputs: BTreeMap::new(),
            requested_latency: None,
            min_latency: MIN_LATENCY,
            max_latency: MAX_LATENCY,
            fixed_latency: DEFAULT_FIXED_LATENCY,
            max_rewind: 0,
            rewind_requested: 0,
            port_latency_offset: MicroSeconds(0),
            current_hw_volume: ChannelVolume::norm(spec.channels as usize),
            volume_changes: VolumeChangeQueue::new(safety_margin, extra_delay),
            monitor_post: None,
            write_volume: None,
            read_volume: None,
            get_latency: None,
            set_port: None,
            up: None,
        }
    }

    /// Handles one queued control message and acknowledges it.
    pub fn handle(&mut self, env: Envelope<SinkMsg>, now: MicroSeconds) {
        assert_io_context();

        let (msg, ack) = env.into_parts();
        let result = self.dispatch(msg, now);
        if let Some(ack) = ack {
            ack.ack(result);
        }
    }

    fn dispatch(&mut self, msg: SinkMsg, now: MicroSeconds) -> Result<()> {
        match msg {
            SinkMsg::SetState(state) => self.state = state,
            SinkMsg::SetVolume { soft, hw } => {
                self.soft_volume = soft;
                if let Some(hw) = hw {
                    self.volume_changes.push(now, hw);
                }
            }
            SinkMsg::SetMute(muted) => self.muted = muted,
            SinkMsg::AddInput(io) => {
                self.inputs.insert(io.index, *io);
            }
            SinkMsg::RemoveInput(index) => {
                self.inputs.remove(&index);
            }
            SinkMsg::TakeInput { index, reply } => {
                let _ = reply.send(self.inputs.remove(&index).map(Box::new));
            }
            SinkMsg::SetInputSoftVolume { index, soft, muted } => {
                if let Some(i) = self.inputs.get_mut(&index) {
                    i.soft_volume = soft;
                    i.muted = muted;
                }
            }
            SinkMsg::SetInputState { index, state } => {
                if let Some(i) = self.inputs.get_mut(&index) {
                    i.state = state;
                }
            }
            SinkMsg::SetPort {
                port,
                latency_offset,
            } => {
                match self.set_port.as_mut() {
                    Some(cb) => cb(&port)?,
                    None => return Err(Error::NotImplemented),
                }
                self.port_latency_offset = latency_offset;
            }
            SinkMsg::SetLatencyOffset(offset) => self.port_latency_offset = offset,
            SinkMsg::GetLatency(tx) => {
                let latency = self
                    .get_latency
                    .as_mut()
                    .map(|cb| cb())
                    .unwrap_or(self.fixed_latency)
                    + self.port_latency_offset;
                let _ = tx.send(latency);
            }
            SinkMsg::RefreshVolume(tx) => {
                let v = self.read_volume.as_mut().and_then(|cb| cb());
                if let Some(v) = v {
                    self.current_hw_volume = v;
                }
                let _ = tx.send(v);
            }
            SinkMsg::SetLatencyRange { min, max } => {
                self.min_latency = min;
                self.max_latency = max;
            }
            SinkMsg::SetFixedLatency(latency) => self.fixed_latency = latency,
            SinkMsg::SetRequestedLatency(latency) => self.requested_latency = latency,
            SinkMsg::SetMaxRewind(n) => {
                self.max_rewind = n;
                for i in self.inputs.values_mut() {
                    i.update_max_rewind(n);
                }
            }
        }
        Ok(())
    }

    /// Renders `length` bytes of mixed audio from the attached inputs.
    ///
    /// Each input contributes a volume-adjusted chunk; the mix is summed
    /// into one buffer, the device's own soft volume and mute are applied,
    /// and the result is forwarded to the monitor source.
    pub fn render(&mut self, length: usize) -> MemChunk {
        assert_io_context();

        let mut mix = MemChunk::silence(length);

        if self.state.is_opened() && !self.muted {
            let spec = self.sample_spec;
            let buf = mix.make_writable();

            for input in self.inputs.values_mut() {
                let (mut chunk, volume) = input.peek(length, &spec);
                let consumed = chunk.length.min(length);
                if consumed == 0 {
                    continue;
                }
                if !volume.is_norm() {
                    apply_volume(&mut chunk, &spec, &volume);
                }
                mix_into(buf, chunk.as_slice(), &spec);
                input.drop_bytes(consumed);
            }
        }

        if !self.muted && !self.soft_volume.is_norm() {
            apply_volume(&mut mix, &self.sample_spec, &self.soft_volume);
        }

        if let Some(monitor) = self.monitor_post.as_mut() {
            monitor(&mix);
        }

        mix
    }

    /// An input asks the device to rewrite already-mixed data.
    pub fn request_rewind(&mut self, nbytes: usize) {
        assert_io_context();
        self.rewind_requested = self.rewind_requested.max(nbytes.min(self.max_rewind));
    }

    /// The hardware buffer was rewound by `nbytes`; fan out to the inputs
    /// so they re-mix from the right point.
    pub fn process_rewind(&mut self, nbytes: usize) {
        assert_io_context();

        self.rewind_requested = 0;
        for input in self.inputs.values_mut() {
            input.process_rewind(nbytes);
        }
    }

    /// Commits every deferred volume change that has come due.
    pub fn apply_pending_volume(&mut self, now: MicroSeconds) {
        assert_io_context();

        if let Some(hw) = self.volume_changes.apply(now) {
            self.current_hw_volume = hw;
            if let Some(cb) = self.write_volume.as_mut() {
                cb(&hw);
            }
        }
    }

    /// Reports a hardware-originated change up to the control thread.
    pub fn report_hw_change(&mut self, hw_volume: ChannelVolume, muted: bool) {
        assert_io_context();

        self.current_hw_volume = hw_volume;
        if let Some(up) = &self.up {
            let _ = up.send(SinkUpMsg::UpdateVolumeAndMute { hw_volume, muted });
        }
    }

    /// How much queued-but-unplayed data the sink holds, for monitor loop
    /// protection.
    pub fn unplayed_bytes(&self) -> usize {
        self.inputs
            .values()
            .map(|i| i.render_memblockq.length())
            .max()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for SinkThreadInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkThreadInfo")
            .field("state", &self.state)
            .field("inputs", &self.inputs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleFormat;
    use crate::sink_input::{SinkInput, SinkInputBackend, SinkInputIo, SinkInputNewData};
    use crate::time::USEC_PER_MSEC;
    use byteorder::{ByteOrder, LittleEndian};
    use std::sync::Mutex;

    struct ConstBackend {
        value: i16,
    }

    impl SinkInputBackend for ConstBackend {
        fn pop(&mut self, nbytes: usize) -> Result<MemChunk> {
            let mut data = vec![0u8; nbytes];
            for frame in data.chunks_exact_mut(2) {
                LittleEndian::write_i16(frame, self.value);
            }
            Ok(MemChunk::from_vec(data))
        }
    }

    fn spec(channels: u8) -> SampleSpec {
        SampleSpec::new(SampleFormat::S16Le, channels, 44100).unwrap()
    }

    fn input_io(index: u32, value: i16) -> SinkInputIo {
        let map = ChannelMap::default_for(2).unwrap();
        let mut io = SinkInputIo::new(index, spec(2), map, map, Box::new(ConstBackend { value }));
        io.state = StreamState::Running;
        io
    }

    /// Rendering sums the attached inputs and forwards the mix to the
    /// monitor.
    #[test]
    fn render_mixes_inputs() {
        crate::device::mark_io_context();

        let monitored: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let mut ti = SinkThreadInfo::new(
            spec(2),
            ChannelMap::default_for(2).unwrap(),
            MicroSeconds(0),
            MicroSeconds(0),
        );
        ti.state = DeviceState::Running;
        ti.inputs.insert(0, input_io(0, 1000));
        ti.inputs.insert(1, input_io(1, 234));

        let monitor = Arc::clone(&monitored);
        ti.monitor_post = Some(Box::new(move |chunk: &MemChunk| {
            monitor.lock().unwrap().push(chunk.length);
        }));

        let mix = ti.render(16);
        assert_eq!(mix.length, 16);
        let mut samples = [0i16; 8];
        LittleEndian::read_i16_into(mix.as_slice(), &mut samples);
        assert!(samples.iter().all(|&s| s == 1234));

        assert_eq!(monitored.lock().unwrap().as_slice(), &[16]);
    }

    /// A muted sink renders silence without pulling the inputs dry.
    #[test]
    fn render_muted() {
        crate::device::mark_io_context();

        let mut ti = SinkThreadInfo::new(
            spec(2),
            ChannelMap::default_for(2).unwrap(),
            MicroSeconds(0),
            MicroSeconds(0),
        );
        ti.state = DeviceState::Running;
        ti.muted = true;
        ti.inputs.insert(0, input_io(0, 1000));

        let mix = ti.render(16);
        assert!(mix.as_slice().iter().all(|&b| b == 0));
        assert_eq!(ti.inputs[&0].render_memblockq.length(), 0);
    }

    /// A device rewind fans out to every input.
    #[test]
    fn process_rewind_fans_out() {
        crate::device::mark_io_context();

        let mut ti = SinkThreadInfo::new(
            spec(2),
            ChannelMap::default_for(2).unwrap(),
            MicroSeconds(0),
            MicroSeconds(0),
        );
        ti.state = DeviceState::Running;
        ti.max_rewind = 64;
        let mut io = input_io(0, 500);
        io.update_max_rewind(64);
        ti.inputs.insert(0, io);

        let mix = ti.render(16);
        assert_eq!(mix.length, 16);

        ti.request_rewind(8);
        assert_eq!(ti.rewind_requested, 8);
        ti.process_rewind(8);
        assert_eq!(ti.rewind_requested, 0);
        // The input's queue holds the re-mixable data again.
        assert_eq!(ti.inputs[&0].render_memblockq.length(), 8);
    }

    struct NullBackend;

    impl SinkInputBackend for NullBackend {
        fn pop(&mut self, _nbytes: usize) -> Result<MemChunk> {
            Err(Error::NoEntity("dry".into()))
        }
    }

    /// The device's requested latency is the minimum across its streams,
    /// clamped into the device range.
    #[test]
    fn requested_latency_is_min_reduced() {
        let mut core = Core::new();
        let mut data = SinkNewData::new("s");
        data.sample_spec = Some(spec(2));
        let s = Sink::new(&mut core, data, DeviceFlags::DYNAMIC_LATENCY).unwrap();
        Sink::put(&mut core, s).unwrap();

        let mut mk = |latency: u64| {
            let mut d = SinkInputNewData::new();
            d.sink = Some(s);
            d.sample_spec = Some(spec(2));
            d.backend = Some(Box::new(NullBackend));
            let i = SinkInput::new(&mut core, d).unwrap();
            SinkInput::put(&mut core, i).unwrap();
            SinkInput::set_requested_latency(&mut core, i, Some(MicroSeconds(latency))).unwrap();
            i
        };
        mk(30 * USEC_PER_MSEC);
        mk(10 * USEC_PER_MSEC);

        assert_eq!(
            core.sinks.get(s).unwrap().requested_latency,
            Some(MicroSeconds(10 * USEC_PER_MSEC))
        );

        // Requests below the floor clamp up.
        let mut d = SinkInputNewData::new();
        d.sink = Some(s);
        d.sample_spec = Some(spec(2));
        d.backend = Some(Box::new(NullBackend));
        let i = SinkInput::new(&mut core, d).unwrap();
        SinkInput::put(&mut core, i).unwrap();
        SinkInput::set_requested_latency(&mut core, i, Some(MicroSeconds(1))).unwrap();
        assert_eq!(
            core.sinks.get(s).unwrap().requested_latency,
            Some(crate::time::MIN_LATENCY)
        );
    }
}
