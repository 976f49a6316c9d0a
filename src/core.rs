//! The core object: cross-device registries, hook lists and defaults.
//!
//! The core is shared read-mostly; all mutation happens on the control
//! thread.

use std::collections::HashMap;

use crate::device::assert_ctl_context;
use crate::hook::{
    Hook, SubscriptionCallback, SubscriptionFacility, SubscriptionOperation,
};
use crate::idxset::IdxSet;
use crate::sink::{Sink, SinkNewData};
use crate::sink_input::SinkInput;
use crate::source::{Source, SourceNewData};
use crate::source_output::SourceOutput;
use crate::time::MicroSeconds;
use crate::time::USEC_PER_MSEC;

/// The maximum number of streams attached to one device.
pub const MAX_STREAMS_PER_DEVICE: usize = 64;

/// What a registered name refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NamedEntity {
    /// A capture device.
    Source(u32),
    /// A playback device.
    Sink(u32),
}

/// A move event passed to the move hooks: the stream and, for finish, the
/// destination device.
#[derive(Debug, Copy, Clone)]
pub struct MoveEvent {
    /// The stream being moved.
    pub stream: u32,
    /// The destination device, absent for `MOVE_START` and `MOVE_FAIL`.
    pub dest: Option<u32>,
}

/// Lifecycle hook lists.
///
/// `NEW` and `FIXATE` see the builder and may cancel creation; the rest are
/// notifications keyed by entity index.
#[derive(Debug, Default)]
pub struct CoreHooks {
    /// A source builder was submitted.
    pub source_new: Hook<SourceNewData>,
    /// A source builder is final; last chance to veto.
    pub source_fixate: Hook<SourceNewData>,
    /// A source was published.
    pub source_put: Hook<u32>,
    /// A source is going away.
    pub source_unlink: Hook<u32>,
    /// A source's active port changed.
    pub source_port_changed: Hook<u32>,
    /// A sink builder was submitted.
    pub sink_new: Hook<SinkNewData>,
    /// A sink builder is final; last chance to veto.
    pub sink_fixate: Hook<SinkNewData>,
    /// A sink was published.
    pub sink_put: Hook<u32>,
    /// A sink is going away.
    pub sink_unlink: Hook<u32>,
    /// A sink's active port changed.
    pub sink_port_changed: Hook<u32>,
    /// A source output starts moving away from its source.
    pub source_output_move_start: Hook<MoveEvent>,
    /// A source output is about to attach to a new source; may veto.
    pub source_output_move_finish: Hook<MoveEvent>,
    /// A source output move failed; a callback may re-route the stream.
    pub source_output_move_fail: Hook<MoveEvent>,
    /// A sink input starts moving away from its sink.
    pub sink_input_move_start: Hook<MoveEvent>,
    /// A sink input is about to attach to a new sink; may veto.
    pub sink_input_move_finish: Hook<MoveEvent>,
    /// A sink input move failed; a callback may re-route the stream.
    pub sink_input_move_fail: Hook<MoveEvent>,
}

/// The core's registries and configuration.
pub struct Core {
    /// All sources, by stable index.
    pub sources: IdxSet<Source>,
    /// All sinks, by stable index.
    pub sinks: IdxSet<Sink>,
    /// All capture streams, by stable index.
    pub source_outputs: IdxSet<SourceOutput>,
    /// All playback streams, by stable index.
    pub sink_inputs: IdxSet<SinkInput>,
    /// Unique device names.
    names: HashMap<String, NamedEntity>,
    /// Lifecycle hooks.
    pub hooks: CoreHooks,
    /// The sample rate new devices default to.
    pub default_rate: u32,
    /// The rate devices may switch to when streams would benefit.
    pub alternate_rate: u32,
    /// Minimum distance between deferred hardware volume steps.
    pub deferred_volume_safety_margin: MicroSeconds,
    /// Extra scheduling delay for deferred hardware volume steps.
    pub deferred_volume_extra_delay: MicroSeconds,
    /// The call point into the external event bus.
    pub subscription: Option<SubscriptionCallback>,
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

impl Core {
    /// Creates an empty core with default configuration.
    pub fn new() -> Self {
        Self {
            sources: IdxSet::new(),
            sinks: IdxSet::new(),
            source_outputs: IdxSet::new(),
            sink_inputs: IdxSet::new(),
            names: HashMap::new(),
            hooks: CoreHooks::default(),
            default_rate: 44100,
            alternate_rate: 48000,
            deferred_volume_safety_margin: MicroSeconds(8 * USEC_PER_MSEC),
            deferred_volume_extra_delay: MicroSeconds(0),
            subscription: None,
        }
    }

    /// Registers a unique device name.
    pub(crate) fn register_name(&mut self, name: &str, entity: NamedEntity) -> crate::Result<()> {
        assert_ctl_context();
        if self.names.contains_key(name) {
            return Err(crate::Error::Exist(name.to_owned()));
        }
        self.names.insert(name.to_owned(), entity);
        Ok(())
    }

    /// Drops a name registration.
    pub(crate) fn unregister_name(&mut self, name: &str) {
        assert_ctl_context();
        self.names.remove(name);
    }

    /// Looks a device up by name.
    pub fn lookup_name(&self, name: &str) -> Option<NamedEntity> {
        self.names.get(name).copied()
    }

    /// Finds a source by name.
    pub fn source_by_name(&self, name: &str) -> Option<u32> {
        match self.lookup_name(name) {
            Some(NamedEntity::Source(idx)) => Some(idx),
            _ => None,
        }
    }

    /// Finds a sink by name.
    pub fn sink_by_name(&self, name: &str) -> Option<u32> {
        match self.lookup_name(name) {
            Some(NamedEntity::Sink(idx)) => Some(idx),
            _ => None,
        }
    }

    /// Publishes an event on the external subscription bus, if one is wired.
    pub(crate) fn subscription_post(
        &self,
        facility: SubscriptionFacility,
        operation: SubscriptionOperation,
        index: u32,
    ) {
        if let Some(cb) = &self.subscription {
            cb(facility, operation, index);
        }
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("sources", &self.sources.len())
            .field("sinks", &self.sinks.len())
            .field("source_outputs", &self.source_outputs.len())
            .field("sink_inputs", &self.sink_inputs.len())
            .finish()
    }
}
