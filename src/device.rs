//! State, flags and volume machinery shared by sources and sinks.

use std::cell::Cell;
use std::collections::VecDeque;

use bitflags::bitflags;
use log::trace;

use crate::channel::ChannelMap;
use crate::time::MicroSeconds;
use crate::volume::{remap_minimal_impact, ChannelVolume, Volume};

bitflags! {
    /// Capability flags of a device. Each is independently toggleable; some
    /// are dynamic and may change at runtime after the device has
    /// initialized.
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        /// Supports hardware volume control.
        const HW_VOLUME_CTRL = 0x0001;

        /// Supports latency querying.
        const LATENCY = 0x0002;

        /// Is a hardware device of some kind, in contrast to
        /// "virtual"/software devices.
        const HARDWARE = 0x0004;

        /// Is a networked device of some kind.
        const NETWORK = 0x0008;

        /// Supports hardware mute control.
        const HW_MUTE_CTRL = 0x0010;

        /// Volume can be translated to dB.
        const DECIBEL_VOLUME = 0x0020;

        /// This device is in flat volume mode, i.e. its volume is always
        /// the maximum of the volumes of all connected streams.
        const FLAT_VOLUME = 0x0040;

        /// The latency can be adjusted dynamically depending on the needs of
        /// the connected streams.
        const DYNAMIC_LATENCY = 0x0080;

        /// Hardware volume changes are scheduled from the IO thread so they
        /// stay in step with audible playback.
        const DEFERRED_VOLUME = 0x0100;

        /// This device is a virtual filter whose volume is merged into its
        /// master's, avoiding double attenuation.
        const SHARE_VOLUME_WITH_MASTER = 0x0200;
    }
}

bitflags! {
    /// Why a device is suspended. Multiple subsystems may request suspension
    /// independently; the device resumes once every cause is cleared.
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SuspendCause: u32 {
        /// An explicit user request.
        const USER = 0x0001;
        /// An application request through the native interface.
        const APPLICATION = 0x0002;
        /// The device idled out.
        const IDLE = 0x0004;
        /// The login session lost access to the hardware.
        const SESSION = 0x0008;
        /// A passthrough stream needs exclusive access elsewhere.
        const PASSTHROUGH = 0x0010;
        /// An internal reconfiguration such as a rate switch.
        const INTERNAL = 0x0020;
    }
}

/// The lifecycle state of a device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DeviceState {
    /// Created but not yet published.
    #[default]
    Init,
    /// At least one non-corked stream is attached.
    Running,
    /// Opened, but no stream is sending/receiving samples.
    Idle,
    /// Not currently open; at least one suspend cause is set.
    Suspended,
    /// Removed; terminal.
    Unlinked,
}

impl DeviceState {
    /// Whether the device is open (as opposed to suspended, unborn or dead).
    pub fn is_opened(self) -> bool {
        matches!(self, DeviceState::Running | DeviceState::Idle)
    }
}

bitflags! {
    /// Behavior flags of a stream, fixed at creation time.
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
    pub struct StreamFlags: u32 {
        /// The stream may never be moved to another device.
        const DONT_MOVE = 0x0001;
        /// The stream does not keep its device from auto-suspending.
        const DONT_INHIBIT_AUTO_SUSPEND = 0x0002;
        /// Kill the stream rather than keeping it when its device suspends.
        const KILL_ON_SUSPEND = 0x0004;
        /// Create the stream in the corked state.
        const START_CORKED = 0x0008;
        /// The stream may change its sample rate at runtime.
        const VARIABLE_RATE = 0x0010;
        /// Never remap channels between maps.
        const NO_REMAP = 0x0020;
        /// Never up- or downmix between channel counts.
        const NO_REMIX = 0x0040;
        /// Use the device's sample format instead of the requested one.
        const FIX_FORMAT = 0x0080;
        /// Use the device's sample rate instead of the requested one.
        const FIX_RATE = 0x0100;
        /// Use the device's channel count instead of the requested one.
        const FIX_CHANNELS = 0x0200;
        /// Forward the bitstream unmodified; excludes mixing and volume and
        /// is exclusive on a device.
        const PASSTHROUGH = 0x0400;
        /// Fail creation if the device is suspended.
        const NO_CREATE_ON_SUSPEND = 0x0800;
    }
}

/// The lifecycle state of a stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Created but not yet published.
    #[default]
    Init,
    /// Passing samples.
    Running,
    /// Paused by the owner; does not keep the device open.
    Corked,
    /// Playback streams only: all submitted data has been played.
    Drained,
    /// Removed; terminal.
    Unlinked,
}

impl StreamState {
    /// Whether the stream is linked to a device and not paused.
    pub fn is_active(self) -> bool {
        matches!(self, StreamState::Running | StreamState::Drained)
    }
}

thread_local! {
    static IO_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as a device IO thread.
pub fn mark_io_context() {
    IO_CONTEXT.with(|c| c.set(true));
}

/// Asserts that the caller runs on the control thread.
#[inline]
pub(crate) fn assert_ctl_context() {
    debug_assert!(
        IO_CONTEXT.with(|c| !c.get()),
        "control-thread state touched from an IO thread"
    );
}

/// Asserts that the caller runs on an IO thread.
#[inline]
pub(crate) fn assert_io_context() {
    debug_assert!(
        IO_CONTEXT.with(|c| c.get()),
        "IO-thread state touched from the control thread"
    );
}

/// A scheduled hardware volume change.
#[derive(Debug, Clone)]
pub struct VolumeChange {
    /// When to commit the change.
    pub at: MicroSeconds,
    /// The hardware volume to commit.
    pub hw_volume: ChannelVolume,
}

/// The queue of pending deferred hardware volume changes.
///
/// Changes are scheduled into the future so that what the user hears tracks
/// what the hardware mixer does; the safety margin keeps an audible gap
/// between steps in the same direction.
#[derive(Debug)]
pub struct VolumeChangeQueue {
    changes: VecDeque<VolumeChange>,
    safety_margin: MicroSeconds,
    extra_delay: MicroSeconds,
}

impl VolumeChangeQueue {
    /// Creates a queue with the device's scheduling parameters.
    pub fn new(safety_margin: MicroSeconds, extra_delay: MicroSeconds) -> Self {
        Self {
            changes: VecDeque::new(),
            safety_margin,
            extra_delay,
        }
    }

    /// The pending changes, earliest first.
    pub fn pending(&self) -> impl Iterator<Item = &VolumeChange> {
        self.changes.iter()
    }

    /// Schedules `hw_volume` for application at (roughly) `now` plus the
    /// extra delay.
    ///
    /// A change that raises the volume relative to an already-queued change
    /// must land at least a safety margin after it; a change that lowers it
    /// must land at least a safety margin before it, or it is pulled
    /// earlier. Queued changes that would apply after the new one are
    /// superseded and dropped.
    pub fn push(&mut self, now: MicroSeconds, hw_volume: ChannelVolume) {
        let mut at = now + self.extra_delay;
        let avg = hw_volume.avg();

        for p in self.changes.iter().rev() {
            let p_avg = p.hw_volume.avg();
            if p_avg < avg {
                // Volume going up; don't step before the earlier change has
                // become audible.
                let earliest = p.at + self.safety_margin;
                if at < earliest {
                    at = earliest;
                }
            } else if p_avg > avg {
                // Volume going down; cut ahead of the earlier change.
                let latest = p.at.saturating_sub(self.safety_margin);
                if at > latest {
                    at = latest;
                }
            }
        }

        if at < now {
            at = now;
        }

        self.changes.retain(|p| p.at < at);
        self.changes.push_back(VolumeChange { at, hw_volume });
        trace!("queued hw volume change for t={}", at.0);
    }

    /// Dequeues every change due at `now` and returns the last one, to be
    /// committed with a single `write_volume` call.
    pub fn apply(&mut self, now: MicroSeconds) -> Option<ChannelVolume> {
        let mut committed = None;
        while let Some(front) = self.changes.front() {
            if front.at > now {
                break;
            }
            committed = Some(self.changes.pop_front().unwrap().hw_volume);
        }
        committed
    }

    /// Drops all pending changes.
    pub fn clear(&mut self) {
        self.changes.clear();
    }
}

/// A stream's volume as seen by the device-side flat volume fold.
#[derive(Debug, Clone)]
pub(crate) struct StreamVolumeEntry {
    pub volume: ChannelVolume,
    pub channel_map: ChannelMap,
}

/// Computes a device's real volume in flat mode: the channelwise maximum of
/// the attached streams' volumes, each combined into the device map with
/// minimal impact on unrelated channels. With no streams attached the
/// reference volume is held.
pub(crate) fn fold_stream_volumes(
    entries: &[StreamVolumeEntry],
    device_map: &ChannelMap,
    reference: &ChannelVolume,
) -> ChannelVolume {
    if entries.is_empty() {
        return *reference;
    }

    let mut max = ChannelVolume::muted(device_map.num_channels() as usize);
    for e in entries {
        let remapped = remap_minimal_impact(&e.volume, &max, &e.channel_map, device_map);
        for (m, r) in max.channels_mut().iter_mut().zip(remapped.channels()) {
            *m = (*m).max(*r);
        }
    }
    max
}

/// Per-stream results of the ratio recomputation.
#[derive(Debug, Clone)]
pub(crate) struct StreamRatios {
    pub real_ratio: ChannelVolume,
    pub soft_volume: ChannelVolume,
}

/// Recomputes a stream's `real_ratio` and `soft_volume` against the device's
/// real volume.
///
/// Channels on which the device is muted keep their previous ratio and get a
/// muted soft volume; there is nothing meaningful to divide by.
pub(crate) fn compute_real_ratio(
    stream_volume: &ChannelVolume,
    stream_map: &ChannelMap,
    volume_factor: &ChannelVolume,
    prev_real_ratio: &ChannelVolume,
    device_real: &ChannelVolume,
    device_map: &ChannelMap,
) -> StreamRatios {
    let remapped = device_real.remap(device_map, stream_map);
    let mut real_ratio = *prev_real_ratio;

    for c in 0..stream_map.num_channels() as usize {
        if remapped.channels()[c].is_muted() {
            continue;
        }
        real_ratio.channels_mut()[c] = stream_volume.channels()[c].divide(remapped.channels()[c]);
    }

    let mut soft_volume = real_ratio.multiply(volume_factor);
    for c in 0..stream_map.num_channels() as usize {
        if remapped.channels()[c].is_muted() {
            soft_volume.channels_mut()[c] = Volume::MUTED;
        }
    }

    StreamRatios {
        real_ratio,
        soft_volume,
    }
}

/// Recomputes a stream's `reference_ratio` against the device's reference
/// volume, skipping channels on which the device is muted.
pub(crate) fn compute_reference_ratio(
    stream_volume: &ChannelVolume,
    stream_map: &ChannelMap,
    prev_reference_ratio: &ChannelVolume,
    device_reference: &ChannelVolume,
    device_map: &ChannelMap,
) -> ChannelVolume {
    let remapped = device_reference.remap(device_map, stream_map);
    let mut out = *prev_reference_ratio;

    for c in 0..stream_map.num_channels() as usize {
        if remapped.channels()[c].is_muted() {
            continue;
        }
        out.channels_mut()[c] = stream_volume.channels()[c].divide(remapped.channels()[c]);
    }
    out
}

/// Broadcasts a mono volume to `channels`, or passes a matching volume
/// through.
pub(crate) fn broadcast_volume(v: &ChannelVolume, channels: u8) -> Option<ChannelVolume> {
    if v.num_channels() == channels {
        Some(*v)
    } else if v.num_channels() == 1 {
        Some(ChannelVolume::uniform(channels as usize, v.channels()[0]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::USEC_PER_MSEC;

    fn cv(vals: &[f32]) -> ChannelVolume {
        ChannelVolume::from_slice(
            &vals
                .iter()
                .map(|&v| Volume::from_linear(v))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn volume_change_scheduling() {
        // Three changes pushed at the same instant with volumes 0.3, 0.6,
        // 0.2 and a 10 ms safety margin.
        let safety = MicroSeconds(10 * USEC_PER_MSEC);
        let mut q = VolumeChangeQueue::new(safety, MicroSeconds(0));
        let t = MicroSeconds(1000);

        q.push(t, cv(&[0.3, 0.3]));
        q.push(t, cv(&[0.6, 0.6]));

        // Raising the volume keeps an audible gap between the steps.
        let times: Vec<_> = q.pending().map(|c| c.at).collect();
        assert_eq!(times.len(), 2);
        assert_eq!(times[0], t);
        assert_eq!(times[1], t + safety);

        // Lowering it cuts ahead; the superseded raises are dropped and the
        // schedule stays non-decreasing with safety-margin gaps.
        q.push(t, cv(&[0.2, 0.2]));
        let pending: Vec<_> = q.pending().collect();
        assert_eq!(pending.last().unwrap().hw_volume, cv(&[0.2, 0.2]));
        for pair in pending.windows(2) {
            assert!(pair[0].at <= pair[1].at);
            assert!(pair[1].at.0 - pair[0].at.0 >= safety.0);
        }

        // On tick, everything due commits as one batch ending in the final
        // requested state.
        let committed = q.apply(t + MicroSeconds(10 * safety.0)).unwrap();
        assert_eq!(committed, cv(&[0.2, 0.2]));
        assert!(q.pending().next().is_none());
    }

    #[test]
    fn volume_change_apply_batches() {
        let mut q = VolumeChangeQueue::new(MicroSeconds(10), MicroSeconds(0));
        q.push(MicroSeconds(0), cv(&[0.1]));
        q.push(MicroSeconds(100), cv(&[0.5]));

        // Both due: one committed value, the later one.
        let committed = q.apply(MicroSeconds(10_000)).unwrap();
        assert_eq!(committed, cv(&[0.5]));
        assert!(q.apply(MicroSeconds(20_000)).is_none());
    }

    #[test]
    fn fold_holds_reference_without_streams() {
        let map = ChannelMap::default_for(2).unwrap();
        let reference = cv(&[0.7, 0.7]);
        assert_eq!(fold_stream_volumes(&[], &map, &reference), reference);
    }

    #[test]
    fn real_ratio_skips_muted_device_channels() {
        let map = ChannelMap::default_for(2).unwrap();
        let ratios = compute_real_ratio(
            &cv(&[0.5, 0.5]),
            &map,
            &ChannelVolume::norm(2),
            &ChannelVolume::norm(2),
            &ChannelVolume::from_slice(&[Volume::MUTED, Volume::NORM]),
            &map,
        );

        // Muted channel: previous ratio kept, soft muted.
        assert_eq!(ratios.real_ratio.channels()[0], Volume::NORM);
        assert_eq!(ratios.soft_volume.channels()[0], Volume::MUTED);
        // Live channel: plain division.
        assert_eq!(
            ratios.real_ratio.channels()[1],
            Volume::from_linear(0.5).divide(Volume::NORM)
        );
    }
}
