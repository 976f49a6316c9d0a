//! The capture device: owns the attached source outputs, runs the capture IO
//! side, negotiates latency, and propagates volume and mute across its
//! sharing tree.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};

use crate::channel::ChannelMap;
use crate::core::{Core, NamedEntity, MAX_STREAMS_PER_DEVICE};
use crate::device::{
    assert_ctl_context, assert_io_context, broadcast_volume, compute_real_ratio,
    compute_reference_ratio, fold_stream_volumes, DeviceFlags, DeviceState, StreamState,
    StreamVolumeEntry, SuspendCause, VolumeChangeQueue,
};
use crate::error::{Error, Result};
use crate::format::FormatInfo;
use crate::hook::{HookResult, SubscriptionFacility, SubscriptionOperation};
use crate::memblock::{apply_volume, MemChunk};
use crate::msgq::{AsyncMsgQ, Envelope};
use crate::port::DevicePort;
use crate::props::Props;
use crate::sample::{rate_family, SampleSpec};
use crate::source_output::{SourceOutput, SourceOutputIo};
use crate::time::{MicroSeconds, DEFAULT_FIXED_LATENCY, MAX_LATENCY, MIN_LATENCY};
use crate::volume::{ChannelVolume, Volume};

/// How deep a sharing tree may get before we declare a cycle.
pub const SHARE_TREE_DEPTH_MAX: usize = 100;

/// The per-device behavior supplied by a driver.
///
/// All methods are optional; the device's flags declare which of them are
/// actually wired. The table is dropped when the device is unlinked.
pub trait SourceImpl {
    /// Consumes `real_volume` and applies it to the hardware; may leave a
    /// residual in `soft_volume`. Required with `HW_VOLUME_CTRL` unless
    /// `DEFERRED_VOLUME` routes the change through the IO thread.
    fn set_volume(&mut self, source: &mut Source) {
        let _ = source;
    }

    /// Reads the current hardware volume back into `real_volume`.
    fn get_volume(&mut self, source: &mut Source) {
        let _ = source;
    }

    /// Applies `muted` to the hardware. Required with `HW_MUTE_CTRL`.
    fn set_mute(&mut self, source: &mut Source) {
        let _ = source;
    }

    /// Reads the hardware mute state.
    fn get_mute(&mut self, source: &mut Source) -> Option<bool> {
        let _ = source;
        None
    }

    /// Activates a port in the control thread. Devices with
    /// `DEFERRED_VOLUME` switch ports on the IO thread instead.
    fn set_port(&mut self, source: &mut Source, port: &str) -> Result<()> {
        let _ = (source, port);
        Err(Error::NotImplemented)
    }

    /// Reconfigures the hardware for a new sample rate.
    fn update_rate(&mut self, source: &mut Source, rate: u32) -> Result<()> {
        let _ = (source, rate);
        Err(Error::NotSupported)
    }

    /// The formats this device can accept.
    fn get_formats(&self, source: &Source) -> Vec<FormatInfo> {
        let _ = source;
        vec![FormatInfo::new(crate::format::FormatEncoding::Pcm)]
    }

    /// Called right before a state transition; may veto it.
    fn set_state(
        &mut self,
        source: &mut Source,
        state: DeviceState,
        cause: SuspendCause,
    ) -> Result<()> {
        let _ = (source, state, cause);
        Ok(())
    }

    /// The aggregate requested latency changed.
    fn update_requested_latency(&mut self, source: &mut Source) {
        let _ = source;
    }
}

/// Control→IO messages for a source. Processed in FIFO order by the device's
/// IO thread.
pub enum SourceMsg {
    /// Mirror a state transition.
    SetState(DeviceState),
    /// Mirror the device soft volume; `hw` carries a deferred hardware
    /// volume target to be scheduled.
    SetVolume {
        /// New software gain for the IO path.
        soft: ChannelVolume,
        /// Deferred hardware volume target, if any.
        hw: Option<ChannelVolume>,
    },
    /// Mirror the mute flag.
    SetMute(bool),
    /// Attach a new output's IO state.
    AddOutput(Box<SourceOutputIo>),
    /// Detach an output.
    RemoveOutput(u32),
    /// Detach an output and hand its IO state back (used while moving).
    TakeOutput {
        /// The output's index.
        index: u32,
        /// Where to deliver the IO state.
        reply: Sender<Option<Box<SourceOutputIo>>>,
    },
    /// Mirror one output's soft volume and mute.
    SetOutputSoftVolume {
        /// The output's index.
        index: u32,
        /// Soft volume, already remapped into the device's channel map.
        soft: ChannelVolume,
        /// Stream mute flag.
        muted: bool,
    },
    /// Mirror one output's state.
    SetOutputState {
        /// The output's index.
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
pub enum SourceUpMsg {
    /// The hardware mixer changed under us; reconcile and publish.
    UpdateVolumeAndMute {
        /// Volume read from the hardware.
        hw_volume: ChannelVolume,
        /// Mute read from the hardware.
        muted: bool,
    },
}

/// Builder for a new source, passed through the `NEW` and `FIXATE` hooks.
#[derive(Debug)]
pub struct SourceNewData {
    /// Unique device name.
    pub name: String,
    /// Driver tag, e.g. the module that created the device.
    pub driver: String,
    /// Arbitrary properties.
    pub props: Props,
    /// Owning module, if any.
    pub module: Option<u32>,
    /// Owning card, if any.
    pub card: Option<u32>,
    /// The device's sample spec. Mandatory.
    pub sample_spec: Option<SampleSpec>,
    /// The device's channel map; derived from the spec if absent.
    pub channel_map: Option<ChannelMap>,
    /// Initial volume. Must not be set together with
    /// `SHARE_VOLUME_WITH_MASTER`.
    pub volume: Option<ChannelVolume>,
    /// Initial mute.
    pub muted: bool,
    /// The configured ports.
    pub ports: Vec<DevicePort>,
    /// The initially active port; highest priority wins if absent.
    pub active_port: Option<String>,
    /// The sink whose mix this source captures, if it is a monitor.
    pub monitor_of: Option<u32>,
    /// The master-edge stream for volume-sharing filters.
    pub output_from_master: Option<u32>,
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

impl SourceNewData {
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
            monitor_of: None,
            output_from_master: None,
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

/// A capture device.
///
/// Control-thread state only; everything the IO thread needs is mirrored
/// into a [`SourceThreadInfo`] through the message queue.
pub struct Source {
    /// Stable index into the core's source set.
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
    /// Attached outputs, by stream index.
    pub outputs: BTreeSet<u32>,
    /// How many attached outputs are corked.
    pub n_corked: u32,
    /// The sink whose mix this source captures, if it is a monitor.
    pub monitor_of: Option<u32>,
    /// The master-edge stream for volume-sharing filters.
    pub output_from_master: Option<u32>,
    /// What the user asked for; visible externally.
    pub reference_volume: ChannelVolume,
    /// What the hardware actually applies.
    pub real_volume: ChannelVolume,
    /// Residual software gain applied in the IO path.
    pub soft_volume: ChannelVolume,
    /// Mute state; overrides the volume.
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
    /// Set from any context when the hardware mixer may have changed behind
    /// our back; consumed on resume.
    pub mixer_dirty: Arc<AtomicBool>,
    /// The driver behavior table; dropped on unlink.
    pub imp: Option<Box<dyn SourceImpl>>,
    /// The control→IO queue, once the driver has started its IO thread.
    pub msgq: Option<AsyncMsgQ<SourceMsg>>,
    /// Hardware-originated notifications from the IO thread.
    pub up_rx: Option<Receiver<SourceUpMsg>>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Source {
    /// Creates a source from a builder.
    ///
    /// Fails if the name is taken, the format is invalid, or one of the
    /// creation hooks rejects the candidate.
    pub fn new(core: &mut Core, mut data: SourceNewData, flags: DeviceFlags) -> Result<u32> {
        assert_ctl_context();

        if core.hooks.source_new.fire(&mut data) == HookResult::Cancel {
            return Err(Error::Invalid("source creation vetoed".into()));
        }

        let spec = data
            .sample_spec
            .ok_or_else(|| Error::Invalid("source needs a sample spec".into()))?;
        // Re-validate; the builder fields are freely settable.
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

        if core.hooks.source_fixate.fire(&mut data) == HookResult::Cancel {
            return Err(Error::Invalid("source creation vetoed".into()));
        }

        let mut flags = flags;
        if flags.contains(DeviceFlags::SHARE_VOLUME_WITH_MASTER) {
            // The master carries the volume; dB math happens there.
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

        let idx = core.sources.insert_with(|index| Source {
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
            outputs: BTreeSet::new(),
            n_corked: 0,
            monitor_of: data.monitor_of,
            output_from_master: data.output_from_master,
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

        if let Err(e) = core.register_name(&name, NamedEntity::Source(idx)) {
            core.sources.remove(idx);
            return Err(e);
        }

        debug!("created source {} \"{}\"", idx, name);
        Ok(idx)
    }

    /// Publishes the source: finalizes volume initialization and transitions
    /// `INIT` to `IDLE` or `SUSPENDED`.
    pub fn put(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        {
            let s = core.sources.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
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
                    s.output_from_master.is_some(),
                    "volume sharing needs a master stream"
                );
            }
        }

        // Volume sharing devices mirror the root's volumes.
        let root = Self::shared_root(core, idx);
        if root != idx {
            let (root_ref, root_real, root_map) = {
                let r = core.sources.get(root).unwrap();
                (r.reference_volume, r.real_volume, r.channel_map)
            };
            let s = core.sources.get_mut(idx).unwrap();
            s.reference_volume = root_ref.remap(&root_map, &s.channel_map);
            s.real_volume = root_real.remap(&root_map, &s.channel_map);
        } else {
            let s = core.sources.get_mut(idx).unwrap();
            s.real_volume = s.reference_volume;
            if !s.flags.contains(DeviceFlags::HW_VOLUME_CTRL) {
                s.base_volume = Volume::NORM;
                s.n_volume_steps = 0x10001;
            }
        }

        let target = {
            let s = core.sources.get(idx).unwrap();
            if s.suspend_cause.is_empty() {
                DeviceState::Idle
            } else {
                DeviceState::Suspended
            }
        };
        Self::set_state(core, idx, target)?;

        let mut hook_arg = idx;
        core.hooks.source_put.fire(&mut hook_arg);
        core.subscription_post(SubscriptionFacility::Source, SubscriptionOperation::New, idx);
        Ok(())
    }

    /// Removes the source: kills every attached stream, unregisters the
    /// name, and transitions to `UNLINKED`.
    pub fn unlink(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let (linked, name, outputs) = {
            let s = core.sources.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
            if s.state == DeviceState::Unlinked {
                return Ok(());
            }
            (
                s.state != DeviceState::Init,
                s.name.clone(),
                s.outputs.iter().copied().collect::<Vec<_>>(),
            )
        };

        if linked {
            let mut hook_arg = idx;
            core.hooks.source_unlink.fire(&mut hook_arg);
        }

        for o in outputs {
            SourceOutput::kill(core, o)?;
        }

        core.unregister_name(&name);
        Self::set_state(core, idx, DeviceState::Unlinked)?;

        let s = core.sources.get_mut(idx).unwrap();
        s.imp = None;
        s.msgq = None;

        if linked {
            core.subscription_post(
                SubscriptionFacility::Source,
                SubscriptionOperation::Remove,
                idx,
            );
        }
        Ok(())
    }

    /// Walks `output_from_master` edges to the device that actually owns the
    /// volume.
    pub fn shared_root(core: &Core, mut idx: u32) -> u32 {
        for _ in 0..SHARE_TREE_DEPTH_MAX {
            let Some(s) = core.sources.get(idx) else {
                return idx;
            };
            if !s.flags.contains(DeviceFlags::SHARE_VOLUME_WITH_MASTER) {
                return idx;
            }
            let Some(master) = s
                .output_from_master
                .and_then(|o| core.source_outputs.get(o))
                .and_then(|o| o.source)
            else {
                return idx;
            };
            idx = master;
        }
        panic!("sharing tree does not terminate");
    }

    /// All sources whose sharing chain ends at `root`, root first.
    fn sharing_subtree(core: &Core, root: u32) -> Vec<u32> {
        let mut subtree = vec![root];
        for idx in core.sources.indices() {
            if idx != root && Self::shared_root(core, idx) == root {
                subtree.push(idx);
            }
        }
        subtree
    }

    /// `(stream, attached source, is sharing edge)` for every output in the
    /// subtree.
    fn subtree_streams(core: &Core, subtree: &[u32]) -> Vec<(u32, u32, bool)> {
        let mut streams = Vec::new();
        for &src in subtree {
            let Some(s) = core.sources.get(src) else {
                continue;
            };
            for &o in &s.outputs {
                if let Some(output) = core.source_outputs.get(o) {
                    streams.push((o, src, output.origin_source.is_some()));
                }
            }
        }
        streams
    }

    /// Whether a passthrough stream is connected.
    pub fn is_passthrough(core: &Core, idx: u32) -> bool {
        let Some(s) = core.sources.get(idx) else {
            return false;
        };
        s.outputs.iter().any(|&o| {
            core.source_outputs
                .get(o)
                .map(|o| o.is_passthrough())
                .unwrap_or(false)
        })
    }

    /// Sets the device volume, or recomputes it from the attached streams.
    ///
    /// Always operates on the sharing root: a supplied volume is interpreted
    /// relative to the root's channel map (mono broadcasts), and the
    /// reference, real and soft volumes are recomputed down the whole tree.
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
            let s = core.sources.get(root).ok_or(Error::NoEntity(root.to_string()))?;
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
                .filter_map(|(o, _, _)| core.source_outputs.get(*o))
                .map(|o| StreamVolumeEntry {
                    volume: o.volume,
                    channel_map: o.channel_map,
                })
                .collect()
        };

        let old_reference = core.sources.get(root).unwrap().reference_volume;

        // 1. The new reference volume: what the user asked for, or (sync
        //    case) the old reference stretched to cover the streams.
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
            let s = core.sources.get_mut(root).unwrap();
            s.reference_volume = new_reference;
            if reference_changed {
                s.save_volume = save;
            }
        }

        // 2. A user-initiated reference change in flat mode rescales every
        //    stream so relative balances stay put.
        if volume.is_some() && flat && reference_changed {
            for (o, _, edge) in &streams {
                if *edge {
                    continue;
                }
                if let Some(output) = core.source_outputs.get_mut(*o) {
                    let remapped = new_reference.remap(&root_map, &output.channel_map);
                    output.volume = output.reference_ratio.multiply(&remapped);
                    core.subscription_post(
                        SubscriptionFacility::SourceOutput,
                        SubscriptionOperation::Change,
                        *o,
                    );
                }
            }
        }

        // 3. The real volume: stream maximum in flat mode, reference
        //    otherwise.
        let new_real = if flat {
            fold_stream_volumes(&stream_entries(core), &root_map, &new_reference)
        } else {
            new_reference
        };
        core.sources.get_mut(root).unwrap().real_volume = new_real;

        // 4. Sharing children inherit the root's volumes, remapped.
        for &child in &subtree[1..] {
            let child_map = core.sources.get(child).unwrap().channel_map;
            let c = core.sources.get_mut(child).unwrap();
            c.reference_volume = new_reference.remap(&root_map, &child_map);
            c.real_volume = new_real.remap(&root_map, &child_map);
            core.subscription_post(
                SubscriptionFacility::Source,
                SubscriptionOperation::Change,
                child,
            );
        }

        // 5. Stream ratios.
        for (o, _, edge) in &streams {
            let Some(output) = core.source_outputs.get_mut(*o) else {
                continue;
            };
            if *edge {
                // The filter carries no gain of its own; the root applies it.
                let n = output.channel_map.num_channels() as usize;
                output.real_ratio = ChannelVolume::norm(n);
                output.soft_volume = output.volume_factor;
                continue;
            }

            output.reference_ratio = compute_reference_ratio(
                &output.volume,
                &output.channel_map,
                &output.reference_ratio,
                &new_reference,
                &root_map,
            );

            if flat {
                let ratios = compute_real_ratio(
                    &output.volume,
                    &output.channel_map,
                    &output.volume_factor,
                    &output.real_ratio,
                    &new_real,
                    &root_map,
                );
                output.real_ratio = ratios.real_ratio;
                output.soft_volume = ratios.soft_volume;
            } else {
                output.real_ratio = output.volume;
                output.soft_volume = output.volume.multiply(&output.volume_factor);
            }
        }

        // 6. Split the real volume between hardware and the device's own
        //    soft volume.
        let hw_target = {
            let s = core.sources.get_mut(root).unwrap();
            if s.flags.contains(DeviceFlags::HW_VOLUME_CTRL) {
                if s.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
                    s.soft_volume = ChannelVolume::norm(root_channels as usize);
                    Some(s.real_volume)
                } else {
                    s.soft_volume = ChannelVolume::norm(root_channels as usize);
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

        // 7. Mirror everything into the IO threads.
        if send_msg {
            Self::send_volume_messages(core, root, &subtree, &streams, hw_target)?;
        }

        core.subscription_post(
            SubscriptionFacility::Source,
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
            let (soft, hw) = {
                let s = core.sources.get(dev).unwrap();
                (s.soft_volume, if dev == root { hw_target } else { None })
            };
            let s = core.sources.get(dev).unwrap();
            if let Some(q) = &s.msgq {
                q.send(SourceMsg::SetVolume { soft, hw })?;
            }
        }

        for (o, src, _) in streams {
            let (soft, muted, stream_map) = {
                let output = core.source_outputs.get(*o).unwrap();
                (output.soft_volume, output.muted, output.channel_map)
            };
            let s = core.sources.get(*src).unwrap();
            // The IO path applies stream soft volume in the device spec,
            // ahead of the resampler.
            let soft = soft.remap(&stream_map, &s.channel_map);
            if let Some(q) = &s.msgq {
                q.send(SourceMsg::SetOutputSoftVolume {
                    index: *o,
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
                let s = core.sources.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
                s.flags.contains(DeviceFlags::HW_VOLUME_CTRL)
            };

            if has_hw {
                let new_real = {
                    let s = core.sources.get_mut(idx).unwrap();
                    if s.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
                        if let Some(q) = &s.msgq {
                            let (tx, rx) = bounded(1);
                            q.send(SourceMsg::RefreshVolume(tx))?;
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

        let s = core.sources.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
        Ok(s.reference_volume)
    }

    /// Reconciles a hardware-originated real volume change: the reference
    /// drifts by the same factor and all stream ratios are recomputed.
    fn propagate_real_volume(core: &mut Core, idx: u32, new_real: ChannelVolume) -> Result<()> {
        let root = Self::shared_root(core, idx);
        let (old_real, old_reference) = {
            let s = core.sources.get(root).unwrap();
            (s.real_volume, s.reference_volume)
        };

        if new_real == old_real {
            return Ok(());
        }

        let ratio = old_reference.divide(&old_real);
        let new_reference = new_real.multiply(&ratio);
        {
            let s = core.sources.get_mut(root).unwrap();
            s.real_volume = new_real;
            s.reference_volume = new_reference;
        }

        // Reuse the stream/children recomputation with the new volumes held.
        Self::set_volume(core, root, Some(&new_reference), true, false)
    }

    /// Sets the mute switch.
    pub fn set_mute(core: &mut Core, idx: u32, muted: bool, save: bool) -> Result<()> {
        assert_ctl_context();

        let root = Self::shared_root(core, idx);
        let changed = {
            let s = core.sources.get_mut(root).ok_or(Error::NoEntity(root.to_string()))?;
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
            let s = core.sources.get_mut(dev).unwrap();
            s.muted = muted;
            if let Some(q) = &s.msgq {
                q.send(SourceMsg::SetMute(muted))?;
            }
        }

        if changed {
            core.subscription_post(
                SubscriptionFacility::Source,
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
            let (has_hw, reported) = {
                let s = core.sources.get_mut(idx).ok_or(Error::NoEntity(idx.to_string()))?;
                if s.flags.contains(DeviceFlags::HW_MUTE_CTRL) {
                    let mut imp = s.imp.take();
                    let m = imp.as_mut().and_then(|i| i.get_mute(s));
                    s.imp = imp;
                    (true, m)
                } else {
                    (false, None)
                }
            };

            if has_hw {
                if let Some(m) = reported {
                    let s = core.sources.get(idx).unwrap();
                    if s.muted != m {
                        Self::set_mute(core, idx, m, true)?;
                    }
                }
            }
        }

        Ok(core
            .sources
            .get(idx)
            .ok_or(Error::NoEntity(idx.to_string()))?
            .muted)
    }

    /// Activates a port by name.
    ///
    /// On devices with deferred volume the switch is a round-trip through
    /// the IO thread; the call returns only after the IO thread has
    /// acknowledged it.
    pub fn set_port(core: &mut Core, idx: u32, name: &str, save: bool) -> Result<()> {
        assert_ctl_context();

        let (deferred, latency_offset) = {
            let s = core.sources.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
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
            let s = core.sources.get(idx).unwrap();
            let q = s
                .msgq
                .as_ref()
                .ok_or_else(|| Error::BadState("no IO thread".into()))?;
            q.send(SourceMsg::SetPort {
                port: name.to_owned(),
                latency_offset,
            })?;
        } else {
            let s = core.sources.get_mut(idx).unwrap();
            let mut imp = s.imp.take();
            let r = imp
                .as_mut()
                .map(|i| i.set_port(s, name))
                .unwrap_or(Err(Error::NotImplemented));
            s.imp = imp;
            r?;
            if let Some(q) = &s.msgq {
                q.post(SourceMsg::SetLatencyOffset(latency_offset))?;
            }
        }

        let s = core.sources.get_mut(idx).unwrap();
        s.active_port = Some(name.to_owned());
        s.save_port = save;
        s.port_latency_offset = latency_offset;

        let mut hook_arg = idx;
        core.hooks.source_port_changed.fire(&mut hook_arg);
        core.subscription_post(
            SubscriptionFacility::Source,
            SubscriptionOperation::Change,
            idx,
        );
        Ok(())
    }

    /// Requests or releases suspension for `cause`.
    ///
    /// Monitor sources only accept the passthrough cause; everything else is
    /// driven by their sink.
    pub fn suspend(core: &mut Core, idx: u32, on: bool, cause: SuspendCause) -> Result<()> {
        assert_ctl_context();

        let flipped = {
            let s = core.sources.get_mut(idx).ok_or(Error::NoEntity(idx.to_string()))?;
            if s.monitor_of.is_some() && cause != SuspendCause::PASSTHROUGH {
                return Err(Error::NotSupported);
            }

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
            let s = core.sources.get(idx).unwrap();
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

    /// Re-applies port, volume and mute after the mixer may have been
    /// changed externally (e.g. a session suspend lost us the device).
    fn reconcile_mixer(core: &mut Core, idx: u32) -> Result<()> {
        let dirty = {
            let s = core.sources.get(idx).unwrap();
            s.mixer_dirty.swap(false, Ordering::AcqRel)
        };
        if !dirty {
            return Ok(());
        }

        debug!("source {}: mixer dirty, re-applying state", idx);

        let (active_port, reference, muted) = {
            let s = core.sources.get(idx).unwrap();
            (s.active_port.clone(), s.reference_volume, s.muted)
        };

        if let Some(port) = active_port {
            let s = core.sources.get_mut(idx).unwrap();
            let mut imp = s.imp.take();
            if let Some(i) = imp.as_mut() {
                // The IO handler's status is not propagated on this path.
                if let Err(e) = i.set_port(s, &port) {
                    warn!("source {}: failed to re-apply port {}: {}", idx, port, e);
                }
            }
            s.imp = imp;
        }

        if let Err(e) = Self::set_volume(core, idx, Some(&reference), true, false) {
            warn!("source {}: failed to re-apply volume: {}", idx, e);
        }
        Self::set_mute(core, idx, muted, false)
    }

    /// Resolves the state to `RUNNING` or `IDLE` based on the attached
    /// streams.
    pub fn update_status(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let target = {
            let s = core.sources.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
            if !s.state.is_opened() {
                return Ok(());
            }
            if s.outputs.len() as u32 > s.n_corked {
                DeviceState::Running
            } else {
                DeviceState::Idle
            }
        };
        Self::set_state(core, idx, target)
    }

    /// Drives the state machine; fires per-stream suspend callbacks when the
    /// opened-ness flips.
    pub(crate) fn set_state(core: &mut Core, idx: u32, state: DeviceState) -> Result<()> {
        let (old, outputs) = {
            let s = core.sources.get_mut(idx).ok_or(Error::NoEntity(idx.to_string()))?;
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
                q.send(SourceMsg::SetState(state))?;
            }
            (old, s.outputs.iter().copied().collect::<Vec<_>>())
        };

        if old.is_opened() != state.is_opened() {
            let suspended = !state.is_opened();
            for o in outputs {
                SourceOutput::device_suspended(core, o, suspended)?;
            }
        }

        if old != DeviceState::Init {
            core.subscription_post(
                SubscriptionFacility::Source,
                SubscriptionOperation::Change,
                idx,
            );
        }
        Ok(())
    }

    /// Switches the device sample rate.
    ///
    /// Refused while any non-corked stream is attached. Returns `Ok(true)`
    /// if the rate changed.
    pub fn update_rate(core: &mut Core, idx: u32, rate: u32, passthrough: bool) -> Result<bool> {
        assert_ctl_context();

        let (desired, outputs) = {
            let s = core.sources.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;

            if s.state == DeviceState::Running {
                debug!("source {}: cannot change rate while running", idx);
                return Ok(false);
            }

            let desired = if passthrough {
                rate
            } else {
                if s.default_rate == s.alternate_rate {
                    warn!(
                        "source {}: default and alternate rate are both {}, not switching",
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
                    // Neither configured rate family matches; no fallback.
                    return Err(Error::NotSupported);
                }
            };

            if desired == s.sample_spec.rate {
                return Ok(false);
            }

            (desired, s.outputs.iter().copied().collect::<Vec<_>>())
        };

        Self::suspend(core, idx, true, SuspendCause::INTERNAL)?;

        let switched = {
            let s = core.sources.get_mut(idx).unwrap();
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
                    warn!("source {}: rate switch to {} failed: {}", idx, desired, e);
                    false
                }
            }
        };

        if switched {
            // Give corked streams a chance to re-resample.
            for o in outputs {
                SourceOutput::update_rate(core, o)?;
            }
        }

        Self::suspend(core, idx, false, SuspendCause::INTERNAL)?;
        Ok(switched)
    }

    /// The device latency, resolved through the IO thread when dynamic.
    pub fn get_latency(core: &Core, idx: u32) -> Result<MicroSeconds> {
        assert_ctl_context();

        let s = core.sources.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
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
        q.send(SourceMsg::GetLatency(tx))?;
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

        let s = core.sources.get_mut(idx).ok_or(Error::NoEntity(idx.to_string()))?;
        let min = min.clamp_latency();
        let max = max.clamp_latency();
        if min > max {
            return Err(Error::Invalid("min latency above max".into()));
        }
        s.min_latency = min;
        s.max_latency = max;
        if let Some(q) = &s.msgq {
            q.send(SourceMsg::SetLatencyRange { min, max })?;
        }
        Ok(())
    }

    /// Sets the fixed latency reported without dynamic latency support.
    pub fn set_fixed_latency(core: &mut Core, idx: u32, latency: MicroSeconds) -> Result<()> {
        assert_ctl_context();

        let s = core.sources.get_mut(idx).ok_or(Error::NoEntity(idx.to_string()))?;
        let latency = latency.clamp_latency();
        s.fixed_latency = latency;
        if let Some(q) = &s.msgq {
            q.send(SourceMsg::SetFixedLatency(latency))?;
        }
        Ok(())
    }

    /// Recomputes the min-reduced requested latency across streams and
    /// mirrors it to the IO thread.
    pub fn update_requested_latency(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        let (requested, outputs_empty) = {
            let s = core.sources.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
            let mut requested: Option<MicroSeconds> = None;
            for &o in &s.outputs {
                if let Some(output) = core.source_outputs.get(o) {
                    if let Some(l) = output.requested_latency {
                        requested = Some(requested.map_or(l, |r| r.min(l)));
                    }
                }
            }
            (
                requested.map(|l| l.clamp_latency().max(s.min_latency).min(s.max_latency)),
                s.outputs.is_empty(),
            )
        };

        let s = core.sources.get_mut(idx).unwrap();
        s.requested_latency = if outputs_empty { None } else { requested };
        if let Some(q) = &s.msgq {
            q.send(SourceMsg::SetRequestedLatency(s.requested_latency))?;
        }

        let s = core.sources.get_mut(idx).unwrap();
        let mut imp = s.imp.take();
        if let Some(i) = imp.as_mut() {
            i.update_requested_latency(s);
        }
        s.imp = imp;
        Ok(())
    }

    /// Starts moving every movable stream off the device. Returns the move
    /// queue for [`Source::move_all_finish`] or [`Source::move_all_fail`].
    pub fn move_all_start(core: &mut Core, idx: u32) -> Result<Vec<u32>> {
        assert_ctl_context();

        let outputs: Vec<u32> = core
            .sources
            .get(idx)
            .ok_or(Error::NoEntity(idx.to_string()))?
            .outputs
            .iter()
            .copied()
            .collect();

        let mut queue = Vec::new();
        for o in outputs {
            if SourceOutput::may_move(core, o) {
                SourceOutput::start_move(core, o)?;
                queue.push(o);
            }
        }
        Ok(queue)
    }

    /// Re-attaches every queued stream to `dest`, failing individual moves
    /// that the destination rejects.
    pub fn move_all_finish(core: &mut Core, queue: Vec<u32>, dest: u32, save: bool) -> Result<()> {
        assert_ctl_context();

        for o in queue {
            if SourceOutput::may_move_to(core, o, dest) {
                SourceOutput::finish_move(core, o, dest, save)?;
            } else {
                SourceOutput::fail_move(core, o)?;
            }
        }
        Ok(())
    }

    /// Fails every queued move, giving each stream's `moving(None)` a chance
    /// to resurrect it before it is killed.
    pub fn move_all_fail(core: &mut Core, queue: Vec<u32>) -> Result<()> {
        assert_ctl_context();

        for o in queue {
            SourceOutput::fail_move(core, o)?;
        }
        Ok(())
    }

    /// Drains hardware-originated notifications posted by the IO thread.
    pub fn flush_io_events(core: &mut Core, idx: u32) -> Result<()> {
        assert_ctl_context();

        loop {
            let msg = {
                let s = core.sources.get(idx).ok_or(Error::NoEntity(idx.to_string()))?;
                match &s.up_rx {
                    Some(rx) => match rx.try_recv() {
                        Ok(msg) => msg,
                        Err(_) => return Ok(()),
                    },
                    None => return Ok(()),
                }
            };

            match msg {
                SourceUpMsg::UpdateVolumeAndMute { hw_volume, muted } => {
                    Self::propagate_real_volume(core, idx, hw_volume)?;
                    let s = core.sources.get(idx).unwrap();
                    if s.muted != muted {
                        Self::set_mute(core, idx, muted, true)?;
                    }
                }
            }
        }
    }
}

/// The IO thread's mirror of a source.
///
/// Written only by the IO thread; the control thread feeds it through the
/// message queue.
pub struct SourceThreadInfo {
    /// Mirrored lifecycle state.
    pub state: DeviceState,
    /// The device's sample spec.
    pub sample_spec: SampleSpec,
    /// The device's channel map.
    pub channel_map: ChannelMap,
    /// Device soft volume, applied once per captured chunk.
    pub soft_volume: ChannelVolume,
    /// Mirrored mute flag.
    pub muted: bool,
    /// Attached outputs' IO state.
    pub outputs: BTreeMap<u32, SourceOutputIo>,
    /// Mirrored requested latency.
    pub requested_latency: Option<MicroSeconds>,
    /// Mirrored latency range.
    pub min_latency: MicroSeconds,
    /// Mirrored latency range.
    pub max_latency: MicroSeconds,
    /// Mirrored fixed latency.
    pub fixed_latency: MicroSeconds,
    /// How much capture history outputs must be able to take back.
    pub max_rewind: usize,
    /// Mirrored port latency offset.
    pub port_latency_offset: MicroSeconds,
    /// The last hardware volume committed.
    pub current_hw_volume: ChannelVolume,
    /// Pending deferred hardware volume changes.
    pub volume_changes: VolumeChangeQueue,
    /// For monitors: how much unplayed data the sink still holds.
    pub monitor_unplayed: Option<usize>,
    /// Commits a hardware volume; required for deferred volume.
    pub write_volume: Option<Box<dyn FnMut(&ChannelVolume) + Send>>,
    /// Reads the hardware volume; used by deferred refresh.
    pub read_volume: Option<Box<dyn FnMut() -> Option<ChannelVolume> + Send>>,
    /// Reports the device latency.
    pub get_latency: Option<Box<dyn FnMut() -> MicroSeconds + Send>>,
    /// Switches the active port from the IO thread.
    pub set_port: Option<Box<dyn FnMut(&str) -> Result<()> + Send>>,
    /// Posts hardware-originated changes back to the control thread.
    pub up: Option<Sender<SourceUpMsg>>,
}

impl SourceThreadInfo {
    /// Creates the mirror for a device in `spec`/`map` with the deferred
    /// volume scheduling parameters.
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
            outputs: BTreeMap::new(),
            requested_latency: None,
            min_latency: MIN_LATENCY,
            max_latency: MAX_LATENCY,
            fixed_latency: DEFAULT_FIXED_LATENCY,
            max_rewind: 0,
            port_latency_offset: MicroSeconds(0),
            current_hw_volume: ChannelVolume::norm(spec.channels as usize),
            volume_changes: VolumeChangeQueue::new(safety_margin, extra_delay),
            monitor_unplayed: None,
            write_volume: None,
            read_volume: None,
            get_latency: None,
            set_port: None,
            up: None,
        }
    }

    /// Handles one queued control message and acknowledges it. `now` is the
    /// IO thread's clock, used to schedule deferred volume changes.
    pub fn handle(&mut self, env: Envelope<SourceMsg>, now: MicroSeconds) {
        assert_io_context();

        // Split the envelope so the ack survives the message move.
        let (msg, ack) = env.into_parts();
        let result = self.dispatch(msg, now);
        if let Some(ack) = ack {
            ack.ack(result);
        }
    }

    fn dispatch(&mut self, msg: SourceMsg, now: MicroSeconds) -> Result<()> {
        match msg {
            SourceMsg::SetState(state) => self.state = state,
            SourceMsg::SetVolume { soft, hw } => {
                self.soft_volume = soft;
                if let Some(hw) = hw {
                    self.volume_changes.push(now, hw);
                }
            }
            SourceMsg::SetMute(muted) => self.muted = muted,
            SourceMsg::AddOutput(io) => {
                self.outputs.insert(io.index, *io);
            }
            SourceMsg::RemoveOutput(index) => {
                self.outputs.remove(&index);
            }
            SourceMsg::TakeOutput { index, reply } => {
                let _ = reply.send(self.outputs.remove(&index).map(Box::new));
            }
            SourceMsg::SetOutputSoftVolume { index, soft, muted } => {
                if let Some(o) = self.outputs.get_mut(&index) {
                    o.soft_volume = soft;
                    o.muted = muted;
                }
            }
            SourceMsg::SetOutputState { index, state } => {
                if let Some(o) = self.outputs.get_mut(&index) {
                    o.state = state;
                }
            }
            SourceMsg::SetPort {
                port,
                latency_offset,
            } => {
                match self.set_port.as_mut() {
                    Some(cb) => cb(&port)?,
                    None => return Err(Error::NotImplemented),
                }
                self.port_latency_offset = latency_offset;
            }
            SourceMsg::SetLatencyOffset(offset) => self.port_latency_offset = offset,
            SourceMsg::GetLatency(tx) => {
                let latency = self
                    .get_latency
                    .as_mut()
                    .map(|cb| cb())
                    .unwrap_or(self.fixed_latency)
                    + self.port_latency_offset;
                let _ = tx.send(latency);
            }
            SourceMsg::RefreshVolume(tx) => {
                let v = self.read_volume.as_mut().and_then(|cb| cb());
                if let Some(v) = v {
                    self.current_hw_volume = v;
                }
                let _ = tx.send(v);
            }
            SourceMsg::SetLatencyRange { min, max } => {
                self.min_latency = min;
                self.max_latency = max;
            }
            SourceMsg::SetFixedLatency(latency) => self.fixed_latency = latency,
            SourceMsg::SetRequestedLatency(latency) => self.requested_latency = latency,
            SourceMsg::SetMaxRewind(n) => {
                self.max_rewind = n;
                for o in self.outputs.values_mut() {
                    o.update_max_rewind(n);
                }
            }
        }
        Ok(())
    }

    /// Delivers one captured chunk (in the device's sample spec) to every
    /// attached output.
    pub fn post(&mut self, chunk: &MemChunk) {
        assert_io_context();

        if !self.state.is_opened() {
            return;
        }

        // Device-level soft volume and mute are applied once, up front.
        let mut vchunk = chunk.clone();
        if self.muted {
            vchunk = MemChunk::silence(chunk.length);
        } else if !self.soft_volume.is_norm() {
            apply_volume(&mut vchunk, &self.sample_spec, &self.soft_volume);
        }

        let max_rewind = self.max_rewind;
        let monitor_unplayed = self.monitor_unplayed;
        for o in self.outputs.values_mut() {
            if o.direct_on_input.is_some() {
                // Fed straight from the bonded sink input instead.
                continue;
            }
            o.push(&vchunk, max_rewind, monitor_unplayed, &self.sample_spec);
        }
    }

    /// Commits every deferred volume change that has come due, with a single
    /// `write_volume` call per batch.
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
            let _ = up.send(SourceUpMsg::UpdateVolumeAndMute { hw_volume, muted });
        }
    }
}

impl std::fmt::Debug for SourceThreadInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceThreadInfo")
            .field("state", &self.state)
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;
    use crate::ioloop::IoLoop;
    use crate::msgq::async_msgq;
    use crate::sample::SampleFormat;
    use crate::source_output::{SourceOutput, SourceOutputBackend, SourceOutputNewData};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    struct NullImpl;

    impl SourceImpl for NullImpl {
        fn update_rate(&mut self, _source: &mut Source, _rate: u32) -> Result<()> {
            Ok(())
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

    fn new_source(core: &mut Core, name: &str, channels: u8, flags: DeviceFlags) -> u32 {
        let mut data = SourceNewData::new(name);
        data.sample_spec = Some(SampleSpec::new(SampleFormat::S16Le, channels, 44100).unwrap());
        let idx = Source::new(core, data, flags).unwrap();
        core.sources.get_mut(idx).unwrap().imp = Some(Box::new(NullImpl));
        Source::put(core, idx).unwrap();
        idx
    }

    fn new_output(core: &mut Core, source: u32, channels: u8, volume: &[f32]) -> u32 {
        let mut data = SourceOutputNewData::new();
        data.source = Some(source);
        data.sample_spec = Some(SampleSpec::new(SampleFormat::S16Le, channels, 44100).unwrap());
        data.volume = Some(cv(volume));
        data.backend = Some(Box::new(NullBackend));
        let idx = SourceOutput::new(core, data).unwrap();
        SourceOutput::put(core, idx).unwrap();
        idx
    }

    /// Two streams on one flat-volume device: the device's real volume is
    /// the channelwise maximum and each stream's real ratio divides out.
    #[test]
    fn flat_volume_two_streams() {
        let mut core = Core::new();
        let a = new_source(&mut core, "a", 2, DeviceFlags::FLAT_VOLUME);
        let x = new_output(&mut core, a, 2, &[0.5, 0.5]);
        let y = new_output(&mut core, a, 2, &[0.2, 1.0]);

        let s = core.sources.get(a).unwrap();
        assert_eq!(s.real_volume, cv(&[0.5, 1.0]));

        let x = core.source_outputs.get(x).unwrap();
        assert_eq!(x.real_ratio, cv(&[1.0, 0.5]));

        let y = core.source_outputs.get(y).unwrap();
        assert_eq!(y.real_ratio.channels()[1], vol(1.0));
        // 0.2 / 0.5
        let expect = vol(0.2).divide(vol(0.5));
        assert_eq!(y.real_ratio.channels()[0], expect);
    }

    /// A filter sharing its volume with a master: both devices report the
    /// stream's volume, and the stream's gain collapses into its factor.
    #[test]
    fn volume_sharing_tree() {
        let mut core = Core::new();
        let r = new_source(&mut core, "root", 2, DeviceFlags::FLAT_VOLUME);

        // The edge stream carries the filter's data into the root.
        let mut edge_data = SourceOutputNewData::new();
        edge_data.source = Some(r);
        edge_data.sample_spec = Some(SampleSpec::new(SampleFormat::S16Le, 2, 44100).unwrap());
        edge_data.backend = Some(Box::new(NullBackend));
        let edge = SourceOutput::new(&mut core, edge_data).unwrap();

        let mut f_data = SourceNewData::new("filter");
        f_data.sample_spec = Some(SampleSpec::new(SampleFormat::S16Le, 2, 44100).unwrap());
        f_data.output_from_master = Some(edge);
        let f = Source::new(&mut core, f_data, DeviceFlags::SHARE_VOLUME_WITH_MASTER).unwrap();
        core.source_outputs.get_mut(edge).unwrap().origin_source = Some(f);
        Source::put(&mut core, f).unwrap();
        SourceOutput::put(&mut core, edge).unwrap();

        assert_eq!(Source::shared_root(&core, f), r);

        let x = new_output(&mut core, f, 2, &[0.8, 0.8]);

        let root = core.sources.get(r).unwrap();
        let filter = core.sources.get(f).unwrap();
        assert_eq!(root.real_volume, cv(&[0.8, 0.8]));
        assert_eq!(filter.real_volume, cv(&[0.8, 0.8]));

        let x = core.source_outputs.get(x).unwrap();
        assert!(x.real_ratio.is_norm());

        let edge = core.source_outputs.get(edge).unwrap();
        assert!(edge.real_ratio.is_norm());
        assert_eq!(edge.soft_volume, edge.volume_factor);
    }

    /// Setting the device to its own reference volume must not move any
    /// stream volume or ratio.
    #[test]
    fn reference_ratio_idempotence() {
        let mut core = Core::new();
        let a = new_source(&mut core, "a", 2, DeviceFlags::FLAT_VOLUME);
        let x = new_output(&mut core, a, 2, &[0.5, 0.7]);

        let reference = core.sources.get(a).unwrap().reference_volume;
        let before = {
            let x = core.source_outputs.get(x).unwrap();
            (x.volume, x.reference_ratio)
        };

        Source::set_volume(&mut core, a, Some(&reference), false, false).unwrap();

        let x = core.source_outputs.get(x).unwrap();
        assert_eq!((x.volume, x.reference_ratio), before);
    }

    /// get_volume returns what set_volume was given.
    #[test]
    fn volume_round_trip() {
        let mut core = Core::new();
        let a = new_source(&mut core, "a", 2, DeviceFlags::empty());

        let v = cv(&[0.3, 0.9]);
        Source::set_volume(&mut core, a, Some(&v), false, true).unwrap();
        assert_eq!(Source::get_volume(&mut core, a, false).unwrap(), v);
    }

    /// A mono volume broadcasts over the device's channels.
    #[test]
    fn mono_volume_broadcasts() {
        let mut core = Core::new();
        let a = new_source(&mut core, "a", 2, DeviceFlags::empty());

        let v = ChannelVolume::from_slice(&[vol(0.25)]);
        Source::set_volume(&mut core, a, Some(&v), false, false).unwrap();
        assert_eq!(
            Source::get_volume(&mut core, a, false).unwrap(),
            cv(&[0.25, 0.25])
        );
    }

    /// Rate switching is refused while a non-corked stream keeps the device
    /// running.
    #[test]
    fn rate_switch_refused_while_running() {
        let mut core = Core::new();
        let a = new_source(&mut core, "a", 2, DeviceFlags::empty());
        let _x = new_output(&mut core, a, 2, &[1.0, 1.0]);

        assert_eq!(core.sources.get(a).unwrap().state, DeviceState::Running);
        assert!(!Source::update_rate(&mut core, a, 48000, false).unwrap());
        assert_eq!(core.sources.get(a).unwrap().sample_spec.rate, 44100);
    }

    /// Corked streams allow the switch, and the family rules hold.
    #[test]
    fn rate_switch_families() {
        let mut core = Core::new();
        let a = new_source(&mut core, "a", 2, DeviceFlags::empty());
        let x = new_output(&mut core, a, 2, &[1.0, 1.0]);
        SourceOutput::cork(&mut core, x, true).unwrap();

        // 48000 matches the alternate family.
        assert!(Source::update_rate(&mut core, a, 48000, false).unwrap());
        assert_eq!(core.sources.get(a).unwrap().sample_spec.rate, 48000);

        // A rate of neither family is rejected without fallback.
        assert_matches::assert_matches!(
            Source::update_rate(&mut core, a, 44101, false),
            Err(Error::Invalid(_))
        );
    }

    /// Suspension causes accumulate; the device resumes only when the last
    /// one clears.
    #[test]
    fn suspend_causes_are_a_bitmask() {
        let mut core = Core::new();
        let a = new_source(&mut core, "a", 2, DeviceFlags::empty());

        Source::suspend(&mut core, a, true, SuspendCause::USER).unwrap();
        Source::suspend(&mut core, a, true, SuspendCause::SESSION).unwrap();
        assert_eq!(core.sources.get(a).unwrap().state, DeviceState::Suspended);

        Source::suspend(&mut core, a, false, SuspendCause::USER).unwrap();
        assert_eq!(core.sources.get(a).unwrap().state, DeviceState::Suspended);

        Source::suspend(&mut core, a, false, SuspendCause::SESSION).unwrap();
        assert_eq!(core.sources.get(a).unwrap().state, DeviceState::Idle);
    }

    /// Monitors refuse every suspend cause except passthrough.
    #[test]
    fn monitor_suspend_restrictions() {
        let mut core = Core::new();
        let mut data = SourceNewData::new("monitor");
        data.sample_spec = Some(SampleSpec::new(SampleFormat::S16Le, 2, 44100).unwrap());
        data.monitor_of = Some(0);
        let m = Source::new(&mut core, data, DeviceFlags::empty()).unwrap();
        Source::put(&mut core, m).unwrap();

        assert_matches::assert_matches!(
            Source::suspend(&mut core, m, true, SuspendCause::USER),
            Err(Error::NotSupported)
        );
        Source::suspend(&mut core, m, true, SuspendCause::PASSTHROUGH).unwrap();
        assert_eq!(core.sources.get(m).unwrap().state, DeviceState::Suspended);
    }

    #[test]
    fn unlink_kills_streams_and_frees_the_name() {
        let mut core = Core::new();
        let a = new_source(&mut core, "a", 2, DeviceFlags::empty());
        let x = new_output(&mut core, a, 2, &[1.0, 1.0]);

        Source::unlink(&mut core, a).unwrap();
        assert_eq!(core.sources.get(a).unwrap().state, DeviceState::Unlinked);
        assert_eq!(
            core.source_outputs.get(x).unwrap().state,
            StreamState::Unlinked
        );
        assert!(core.source_by_name("a").is_none());

        // The name is free for a new device.
        let _b = new_source(&mut core, "a", 2, DeviceFlags::empty());
    }

    /// Drives a real IO thread: deferred port switching is a blocking
    /// round-trip, deferred volume lands via write_volume, and dynamic
    /// latency queries go through the queue.
    #[test]
    fn deferred_round_trips() -> anyhow::Result<()> {
        let mut core = Core::new();
        core.deferred_volume_safety_margin = MicroSeconds(0);

        let mut data = SourceNewData::new("hw");
        data.sample_spec = Some(SampleSpec::new(SampleFormat::S16Le, 2, 44100).unwrap());
        let mut speaker = DevicePort::new("speaker", crate::port::Direction::Input, 100);
        speaker.latency_offset = MicroSeconds(0);
        let mut headphones = DevicePort::new("headphones", crate::port::Direction::Input, 90);
        headphones.latency_offset = MicroSeconds(5000);
        data.ports = vec![speaker, headphones];

        let flags = DeviceFlags::HW_VOLUME_CTRL
            | DeviceFlags::DEFERRED_VOLUME
            | DeviceFlags::LATENCY
            | DeviceFlags::DYNAMIC_LATENCY;
        let idx = Source::new(&mut core, data, flags).unwrap();
        core.sources.get_mut(idx).unwrap().imp = Some(Box::new(NullImpl));

        let ports_switched: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let volumes_written: Arc<Mutex<Vec<ChannelVolume>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let mut ioloop = IoLoop::new().unwrap();
        let (q, rx) = async_msgq(Some(ioloop.waker()));
        core.sources.get_mut(idx).unwrap().msgq = Some(q);

        let io_ports = Arc::clone(&ports_switched);
        let io_volumes = Arc::clone(&volumes_written);
        let io_stop = Arc::clone(&stop);
        let io = std::thread::spawn(move || {
            crate::device::mark_io_context();

            let spec = SampleSpec::new(SampleFormat::S16Le, 2, 44100).unwrap();
            let mut ti = SourceThreadInfo::new(
                spec,
                ChannelMap::default_for(2).unwrap(),
                MicroSeconds(0),
                MicroSeconds(0),
            );
            ti.set_port = Some(Box::new(move |port: &str| {
                io_ports.lock().unwrap().push(port.to_owned());
                Ok(())
            }));
            ti.write_volume = Some(Box::new(move |v: &ChannelVolume| {
                io_volumes.lock().unwrap().push(*v);
            }));
            ti.get_latency = Some(Box::new(|| MicroSeconds(1234)));

            let start = Instant::now();
            while !io_stop.load(Ordering::Acquire) {
                let _ = ioloop.iterate(Some(Duration::from_millis(5)));
                let now = MicroSeconds::from(start.elapsed());
                while let Some(env) = rx.try_recv() {
                    ti.handle(env, now);
                }
                ti.apply_pending_volume(now);
            }
        });

        Source::put(&mut core, idx)?;

        // Port switch: the call returns only after the IO thread applied it.
        Source::set_port(&mut core, idx, "headphones", true)?;
        assert_eq!(ports_switched.lock().unwrap().as_slice(), ["headphones"]);
        assert_eq!(
            core.sources.get(idx).unwrap().active_port.as_deref(),
            Some("headphones")
        );

        // Deferred volume: scheduled on the IO thread, committed on a tick.
        let v = cv(&[0.5, 0.5]);
        Source::set_volume(&mut core, idx, Some(&v), true, false)?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while volumes_written.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "hw volume never written");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(volumes_written.lock().unwrap()[0], v);

        // Dynamic latency resolves through the IO thread, including the
        // port's latency offset.
        let latency = Source::get_latency(&core, idx)?;
        assert_eq!(latency, MicroSeconds(1234 + 5000));

        stop.store(true, Ordering::Release);
        io.join().unwrap();
        Ok(())
    }
}
