//! One hardware mixer control group and its probed state.

use log::warn;

use crate::channel::{ChannelMap, ChannelPosition, PositionMask};
use crate::error::{Error, Result};
use crate::mixer::backend::MixerBackend;
use crate::port::Direction;
use crate::profile::DecibelFix;
use crate::volume::{ChannelVolume, Volume};

/// How much dB step mismatch we accept before declaring a driver broken.
const DB_EPSILON: f64 = 0.5;

/// What a path does with an element's switch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SwitchUse {
    /// Leave the switch alone.
    #[default]
    Ignore,
    /// The switch is the path's mute control.
    Mute,
    /// Force the switch on when the path activates.
    On,
    /// Force the switch off when the path activates.
    Off,
    /// The switch is toggled by the path's settings.
    Select,
}

/// What a path does with an element's volume.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum VolumeUse {
    /// Leave the volume alone.
    #[default]
    Ignore,
    /// The volume contributes to the path's merged volume slider.
    Merge,
    /// Force the volume to its minimum.
    Off,
    /// Force the volume to 0 dB.
    Zero,
    /// Force the volume to a constant step.
    Constant(u32),
}

/// What a path does with an enumeration element.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum EnumerationUse {
    /// Leave the enumeration alone.
    #[default]
    Ignore,
    /// The enumeration is switched by the path's settings.
    Select,
}

/// Presence requirements for elements, jacks and options.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Required {
    /// No requirement.
    #[default]
    Ignore,
    /// Some use of this control must be present.
    Any,
    /// A switch must be present.
    Switch,
    /// A volume must be present.
    Volume,
    /// An enumeration must be present.
    Enumeration,
}

/// One option of a `SELECT` switch or enumeration.
#[derive(Debug, Clone)]
pub struct ElementOption {
    /// The hardware-side option string ("on"/"off" for switches).
    pub alsa_name: String,
    /// The short tag used in setting and port names.
    pub name: String,
    /// Description for the user.
    pub description: String,
    /// Higher priority options sort first in synthesized settings.
    pub priority: u32,
    /// Presence requirement.
    pub required: Required,
    /// Contributes to the path's required-any test.
    pub required_any: Required,
    /// Must be absent.
    pub required_absent: Required,
    /// The hardware index of the option, resolved at probe time; `None` if
    /// the hardware does not offer it.
    pub hw_index: Option<usize>,
}

impl ElementOption {
    /// Creates an option with the given hardware string and tag.
    pub fn new(alsa_name: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            alsa_name: alsa_name.into(),
            description: name.clone(),
            name,
            priority: 0,
            required: Required::Ignore,
            required_any: Required::Ignore,
            required_absent: Required::Ignore,
            hw_index: None,
        }
    }
}

/// The outcome of probing one element.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ElementProbe {
    /// The element stays in the path.
    Kept,
    /// The element is dropped from the path (absent or broken but not
    /// required).
    Dropped,
}

/// One mixer control in a path.
#[derive(Debug, Clone)]
pub struct Element {
    /// The hardware element name.
    pub name: String,
    /// Which direction's controls this path uses.
    pub direction: Direction,
    /// Fall back to the opposite direction's switch/volume if this one has
    /// none.
    pub direction_try_other: bool,
    /// Switch usage class.
    pub switch_use: SwitchUse,
    /// Volume usage class.
    pub volume_use: VolumeUse,
    /// Enumeration usage class.
    pub enumeration_use: EnumerationUse,
    /// Presence requirement.
    pub required: Required,
    /// Contributes to the path's required-any test.
    pub required_any: Required,
    /// Must be absent.
    pub required_absent: Required,
    /// Cap on the hardware step a set-volume may use.
    pub volume_limit: Option<i64>,
    /// Override masks for 1- and 2-channel elements, indexed by channel
    /// count − 1.
    pub override_map: [Option<Vec<PositionMask>>; 2],
    /// Maps integer steps to dB when the driver's own dB info is absent or
    /// broken.
    pub db_fix: Option<DecibelFix>,
    /// Declared options for `SELECT` use.
    pub options: Vec<ElementOption>,

    /// Probed: the element has usable dB information.
    pub has_db: bool,
    /// Probed: the integer volume range.
    pub min_volume: i64,
    /// Probed: the integer volume range (after `volume_limit`).
    pub max_volume: i64,
    /// Probed: dB at `min_volume`.
    pub min_db: f64,
    /// Probed: dB at `max_volume`.
    pub max_db: f64,
    /// Probed: hardware channel count (1 = mono).
    pub n_channels: usize,
    /// Probed: per hardware channel, the abstract positions it feeds.
    pub masks: Vec<PositionMask>,
}

/// The standard position of hardware channel `i` on multi-channel elements.
fn standard_position(i: usize) -> PositionMask {
    use ChannelPosition::*;

    let pos = match i {
        0 => FrontLeft,
        1 => FrontRight,
        2 => RearLeft,
        3 => RearRight,
        4 => FrontCenter,
        5 => Lfe,
        6 => SideLeft,
        7 => SideRight,
        8 => RearCenter,
        _ => return PositionMask::NONE,
    };
    PositionMask::position(pos)
}

impl Element {
    /// Creates an element with all uses ignored.
    pub fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
            direction_try_other: false,
            switch_use: SwitchUse::Ignore,
            volume_use: VolumeUse::Ignore,
            enumeration_use: EnumerationUse::Ignore,
            required: Required::Ignore,
            required_any: Required::Ignore,
            required_absent: Required::Ignore,
            volume_limit: None,
            override_map: [None, None],
            db_fix: None,
            options: Vec::new(),
            has_db: false,
            min_volume: 0,
            max_volume: 0,
            min_db: 0.0,
            max_db: 0.0,
            n_channels: 0,
            masks: Vec::new(),
        }
    }

    /// Probes the element against the hardware.
    ///
    /// `Err` fails the whole path (a requirement could not be met);
    /// `Dropped` removes just this element.
    pub fn probe(&mut self, backend: &dyn MixerBackend) -> Result<ElementProbe> {
        // A single element may not be switched by settings twice.
        if self.switch_use == SwitchUse::Select && self.enumeration_use == EnumerationUse::Select {
            return Err(Error::Invalid(format!(
                "element {} is both switch-select and enum-select",
                self.name
            )));
        }

        if !backend.has_element(&self.name) {
            if self.required != Required::Ignore {
                return Err(Error::NoEntity(self.name.clone()));
            }
            self.switch_use = SwitchUse::Ignore;
            self.volume_use = VolumeUse::Ignore;
            self.enumeration_use = EnumerationUse::Ignore;
            return Ok(ElementProbe::Dropped);
        }
        if self.required_absent != Required::Ignore {
            return Err(Error::Invalid(format!(
                "element {} must be absent",
                self.name
            )));
        }

        if self.switch_use != SwitchUse::Ignore && self.switch_use != SwitchUse::Select {
            if !backend.has_switch(&self.name, self.direction) {
                let other = match self.direction {
                    Direction::Input => Direction::Output,
                    Direction::Output => Direction::Input,
                };
                if self.direction_try_other && backend.has_switch(&self.name, other) {
                    self.direction = other;
                } else if matches!(self.required, Required::Switch | Required::Any) {
                    return Err(Error::NoEntity(format!("{} switch", self.name)));
                } else {
                    self.switch_use = SwitchUse::Ignore;
                }
            }
        }

        if self.volume_use != VolumeUse::Ignore {
            if !backend.has_volume(&self.name, self.direction) {
                let other = match self.direction {
                    Direction::Input => Direction::Output,
                    Direction::Output => Direction::Input,
                };
                if self.direction_try_other && backend.has_volume(&self.name, other) {
                    self.direction = other;
                } else if matches!(self.required, Required::Volume | Required::Any) {
                    return Err(Error::NoEntity(format!("{} volume", self.name)));
                } else {
                    self.volume_use = VolumeUse::Ignore;
                }
            }

            if self.volume_use != VolumeUse::Ignore {
                if let Err(e) = self.probe_volume(backend) {
                    warn!("element {}: {}", self.name, e);
                    if matches!(self.required, Required::Volume | Required::Any) {
                        return Err(e);
                    }
                    return Ok(ElementProbe::Dropped);
                }
            }
        }

        if self.enumeration_use == EnumerationUse::Select || self.switch_use == SwitchUse::Select {
            if self.enumeration_use == EnumerationUse::Select {
                if !backend.has_enumeration(&self.name) {
                    if matches!(self.required, Required::Enumeration | Required::Any) {
                        return Err(Error::NoEntity(format!("{} enumeration", self.name)));
                    }
                    self.enumeration_use = EnumerationUse::Ignore;
                } else {
                    let items = backend.enum_items(&self.name);
                    for option in &mut self.options {
                        option.hw_index = items.iter().position(|i| *i == option.alsa_name);
                    }
                }
            }

            // Switch options always exist with the switch itself; only
            // enumeration options can be missing from the hardware.
            if self.enumeration_use == EnumerationUse::Select {
                for option in &self.options {
                    if option.required != Required::Ignore && option.hw_index.is_none() {
                        return Err(Error::NoEntity(format!(
                            "{} option {}",
                            self.name, option.alsa_name
                        )));
                    }
                    if option.required_absent != Required::Ignore && option.hw_index.is_some() {
                        return Err(Error::Invalid(format!(
                            "{} option {} must be absent",
                            self.name, option.alsa_name
                        )));
                    }
                }
            }
        }

        self.probe_masks(backend);
        Ok(ElementProbe::Kept)
    }

    fn probe_volume(&mut self, backend: &dyn MixerBackend) -> Result<()> {
        let (min, max) = backend.volume_range(&self.name, self.direction)?;
        self.min_volume = min;
        self.max_volume = max;

        if let Some(fix) = &self.db_fix {
            // The fix table overrides whatever the driver claims.
            self.min_volume = self.min_volume.max(fix.min_step);
            self.max_volume = self.max_volume.min(fix.max_step);
            self.min_db = fix.db_at(self.min_volume);
            self.max_db = fix.db_at(self.max_volume);
            self.has_db = true;
        } else {
            match backend.db_range(&self.name, self.direction) {
                Ok((min_db, max_db)) => {
                    // Cross-check the endpoints; drivers have been caught
                    // lying about one or the other.
                    let at_min = backend.step_to_db(&self.name, self.direction, self.min_volume)?;
                    let at_max = backend.step_to_db(&self.name, self.direction, self.max_volume)?;
                    if (at_min - min_db).abs() > DB_EPSILON || (at_max - max_db).abs() > DB_EPSILON
                    {
                        return Err(Error::Invalid(format!(
                            "inconsistent dB data ({:.2}..{:.2} vs {:.2}..{:.2})",
                            at_min, at_max, min_db, max_db
                        )));
                    }
                    self.min_db = min_db;
                    self.max_db = max_db;
                    self.has_db = true;
                }
                Err(_) => {
                    self.has_db = false;
                }
            }
        }

        if let Some(limit) = self.volume_limit {
            if limit >= self.min_volume && limit < self.max_volume {
                self.max_volume = limit;
                if self.has_db {
                    self.max_db = match &self.db_fix {
                        Some(fix) => fix.db_at(self.max_volume),
                        None => backend.step_to_db(&self.name, self.direction, self.max_volume)?,
                    };
                }
            }
        }

        Ok(())
    }

    fn probe_masks(&mut self, backend: &dyn MixerBackend) {
        self.n_channels = backend.channels(&self.name, self.direction).max(1);

        if self.n_channels == 1 {
            // A mono element touches every position.
            self.masks = vec![PositionMask::ALL];
            return;
        }

        if self.n_channels <= 2 {
            if let Some(map) = &self.override_map[self.n_channels - 1] {
                if map.len() == self.n_channels {
                    self.masks = map.clone();
                    return;
                }
            }
        }

        self.masks = (0..self.n_channels).map(standard_position).collect();
    }

    /// The dB value at an integer step.
    fn db_at(&self, backend: &dyn MixerBackend, step: i64) -> Result<f64> {
        match &self.db_fix {
            Some(fix) => Ok(fix.db_at(step)),
            None => backend.step_to_db(&self.name, self.direction, step),
        }
    }

    /// Reads this element's contribution to the path volume.
    ///
    /// Per abstract channel, the element's hardware channels covering that
    /// position are folded with `max`; positions no hardware channel covers
    /// read as `NORM`.
    pub fn get_volume(
        &self,
        backend: &dyn MixerBackend,
        map: &ChannelMap,
        use_db: bool,
    ) -> Result<ChannelVolume> {
        let steps = backend.read_volume(&self.name, self.direction)?;
        let mut out = ChannelVolume::norm(map.num_channels() as usize);

        for k in 0..map.num_channels() as usize {
            let pos = map.position(k);
            let mut best: Option<Volume> = None;

            for (c, &step) in steps.iter().enumerate().take(self.n_channels) {
                let mask = self.masks.get(c).copied().unwrap_or(PositionMask::NONE);
                if !mask.contains(pos) {
                    continue;
                }
                let v = if use_db {
                    Volume::from_db(self.db_at(backend, step)?)
                } else {
                    Volume::from_hw(step, self.min_volume, self.max_volume)
                };
                best = Some(best.map_or(v, |b: Volume| b.max(v)));
            }

            out.channels_mut()[k] = best.unwrap_or(Volume::NORM);
        }

        Ok(out)
    }

    /// Applies as much of `v` as this element can and returns what it
    /// absorbed.
    ///
    /// With dB the target is clamped to the element's (limited) maximum and
    /// rounded up for playback, down for capture; deferred volume asks the
    /// hardware for both roundings and picks the closer one.
    pub fn set_volume(
        &self,
        backend: &mut dyn MixerBackend,
        v: &ChannelVolume,
        map: &ChannelMap,
        playback: bool,
        deferred: bool,
    ) -> Result<ChannelVolume> {
        let mut steps = vec![self.max_volume; self.n_channels];
        let mut absorbed = ChannelVolume::norm(map.num_channels() as usize);

        for c in 0..self.n_channels {
            let mask = self.masks.get(c).copied().unwrap_or(PositionMask::NONE);

            // The loudest abstract channel this hardware channel feeds.
            let mut target: Option<Volume> = None;
            for k in 0..map.num_channels() as usize {
                if mask.contains(map.position(k)) {
                    let vv = v.channels()[k];
                    target = Some(target.map_or(vv, |t: Volume| t.max(vv)));
                }
            }
            let Some(target) = target else {
                continue;
            };

            let (step, achieved) = if self.has_db {
                let target_db = target.to_db().min(self.max_db);
                let step = if let Some(fix) = &self.db_fix {
                    fix.nearest_step(target_db, playback)
                } else if deferred {
                    // Pick whichever rounding lands closer to the target.
                    let up = backend.db_to_step(&self.name, self.direction, target_db, true)?;
                    let down = backend.db_to_step(&self.name, self.direction, target_db, false)?;
                    let up_db = self.db_at(backend, up)?;
                    let down_db = self.db_at(backend, down)?;
                    if (up_db - target_db).abs() <= (down_db - target_db).abs() {
                        up
                    } else {
                        down
                    }
                } else {
                    backend.db_to_step(&self.name, self.direction, target_db, playback)?
                };
                let step = step.clamp(self.min_volume, self.max_volume);
                (step, Volume::from_db(self.db_at(backend, step)?))
            } else {
                let step = target
                    .to_hw(self.min_volume, self.max_volume)
                    .clamp(self.min_volume, self.max_volume);
                (step, Volume::from_hw(step, self.min_volume, self.max_volume))
            };

            steps[c] = step;
            for k in 0..map.num_channels() as usize {
                if mask.contains(map.position(k)) {
                    absorbed.channels_mut()[k] = achieved;
                }
            }
        }

        backend.write_volume(&self.name, self.direction, &steps)?;
        Ok(absorbed)
    }

    /// Applies the element's static configuration when its path activates.
    pub fn apply_constant(&self, backend: &mut dyn MixerBackend) -> Result<()> {
        match self.switch_use {
            SwitchUse::On => backend.write_switch(&self.name, self.direction, true)?,
            SwitchUse::Off => backend.write_switch(&self.name, self.direction, false)?,
            _ => {}
        }

        match self.volume_use {
            VolumeUse::Off => {
                let steps = vec![self.min_volume; self.n_channels];
                backend.write_volume(&self.name, self.direction, &steps)?;
            }
            VolumeUse::Zero if self.has_db => {
                let step = match &self.db_fix {
                    Some(fix) => fix.nearest_step(0.0, false),
                    None => backend.db_to_step(&self.name, self.direction, 0.0, false)?,
                };
                let steps = vec![step.clamp(self.min_volume, self.max_volume); self.n_channels];
                backend.write_volume(&self.name, self.direction, &steps)?;
            }
            VolumeUse::Constant(step) => {
                let steps = vec![step as i64; self.n_channels];
                backend.write_volume(&self.name, self.direction, &steps)?;
            }
            _ => {}
        }

        Ok(())
    }

    /// The effective maximum dB this element can be asked for, used by the
    /// subset test.
    pub fn effective_max_db(&self) -> Option<f64> {
        match self.volume_use {
            VolumeUse::Merge if self.has_db => Some(self.max_db),
            VolumeUse::Zero => Some(0.0),
            VolumeUse::Off => Some(f64::NEG_INFINITY),
            VolumeUse::Constant(_) if self.has_db => Some(self.max_db),
            _ => None,
        }
    }
}
