//! An ordered chain of mixer elements aggregated into a single volume
//! slider, mute switch and settings pick-list.

use log::{debug, warn};

use crate::channel::ChannelMap;
use crate::error::{Error, Result};
use crate::mixer::backend::MixerBackend;
use crate::mixer::element::{
    Element, ElementProbe, EnumerationUse, Required, SwitchUse, VolumeUse,
};
use crate::mixer::jack::Jack;
use crate::port::Available;
use crate::volume::ChannelVolume;

/// A named permutation of the `SELECT`-style options along a path.
#[derive(Debug, Clone)]
pub struct Setting {
    /// Name used as a port suffix.
    pub name: String,
    /// Description for the user.
    pub description: String,
    /// Higher priority settings sort first.
    pub priority: u32,
    /// `(element index, option alsa-name)` pairs, one per `SELECT` element.
    pub options: Vec<(usize, String)>,
}

/// A probed path.
#[derive(Debug, Clone)]
pub struct Path {
    /// The path's unique name.
    pub name: String,
    /// Description for the user.
    pub description: String,
    /// A key to look the canonical description up elsewhere.
    pub description_key: Option<String>,
    /// Higher priority paths make higher priority ports.
    pub priority: u32,
    /// The ELD device index for HDMI paths.
    pub eld_device: Option<i32>,
    /// Hold the mute switch while this path is being activated.
    pub mute_during_activation: bool,
    /// The elements, in order.
    pub elements: Vec<Element>,
    /// The jacks bound to this path.
    pub jacks: Vec<Jack>,
    /// Synthesized settings.
    pub settings: Vec<Setting>,
    /// Whether [`Path::probe`] ran.
    pub probed: bool,
    /// Whether the probe found the path usable.
    pub supported: bool,
    /// The path has a volume slider.
    pub has_volume: bool,
    /// All merged volume elements have dB information.
    pub has_db: bool,
    /// The path has a mute switch.
    pub has_mute: bool,
    /// Sum of the merged elements' dB floors.
    pub min_db: f64,
    /// Sum of the merged elements' dB ceilings.
    pub max_db: f64,
}

impl Path {
    /// Creates an empty path.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            description_key: None,
            priority: 0,
            eld_device: None,
            mute_during_activation: false,
            elements: Vec::new(),
            jacks: Vec::new(),
            settings: Vec::new(),
            probed: false,
            supported: false,
            has_volume: false,
            has_db: false,
            has_mute: false,
            min_db: f64::NEG_INFINITY,
            max_db: 0.0,
        }
    }

    /// Probes every element and jack and computes the path-level flags.
    ///
    /// Returns `Ok(false)` (and marks the path unsupported) when a
    /// requirement cannot be met.
    pub fn probe(&mut self, backend: &dyn MixerBackend) -> Result<bool> {
        if self.probed {
            return Ok(self.supported);
        }
        self.probed = true;

        let has_required_any = self
            .elements
            .iter()
            .any(|e| e.required_any != Required::Ignore)
            || self
                .jacks
                .iter()
                .any(|j| j.required_any != Required::Ignore)
            || self
                .elements
                .iter()
                .flat_map(|e| e.options.iter())
                .any(|o| o.required_any != Required::Ignore);

        let mut kept = Vec::with_capacity(self.elements.len());
        for mut e in std::mem::take(&mut self.elements) {
            match e.probe(backend) {
                Ok(ElementProbe::Kept) => kept.push(e),
                Ok(ElementProbe::Dropped) => {
                    debug!("path {}: dropping element {}", self.name, e.name);
                }
                Err(e) => {
                    debug!("path {}: unsupported: {}", self.name, e);
                    self.supported = false;
                    return Ok(false);
                }
            }
        }
        self.elements = kept;

        for j in &mut self.jacks {
            if let Err(e) = j.probe(backend) {
                debug!("path {}: unsupported: {}", self.name, e);
                self.supported = false;
                return Ok(false);
            }
        }

        if has_required_any {
            let satisfied = self
                .elements
                .iter()
                .any(|e| e.required_any != Required::Ignore)
                || self
                    .jacks
                    .iter()
                    .any(|j| j.required_any != Required::Ignore && j.has_control)
                || self
                    .elements
                    .iter()
                    .flat_map(|e| e.options.iter())
                    .any(|o| o.required_any != Required::Ignore && o.hw_index.is_some());
            if !satisfied {
                debug!("path {}: no required-any control present", self.name);
                self.supported = false;
                return Ok(false);
            }
        }

        // All variable gain must sit in dB-capable elements: a merged
        // element without dB that is followed by one with dB gets pinned to
        // its 0 dB point.
        let mut later_has_db = false;
        for e in self.elements.iter_mut().rev() {
            if e.volume_use != VolumeUse::Merge {
                continue;
            }
            if e.has_db {
                later_has_db = true;
            } else if later_has_db {
                debug!(
                    "path {}: pinning non-dB element {} to 0 dB",
                    self.name, e.name
                );
                e.volume_use = VolumeUse::Zero;
            }
        }

        let merged: Vec<&Element> = self
            .elements
            .iter()
            .filter(|e| e.volume_use == VolumeUse::Merge)
            .collect();
        self.has_volume = !merged.is_empty();
        self.has_db = self.has_volume && merged.iter().all(|e| e.has_db);
        self.has_mute = self.elements.iter().any(|e| e.switch_use == SwitchUse::Mute);

        if self.has_db {
            self.min_db = merged.iter().map(|e| e.min_db).sum();
            self.max_db = merged.iter().map(|e| e.max_db).sum();
        }

        self.supported = true;
        Ok(true)
    }

    /// Reads the path's merged volume.
    pub fn get_volume(
        &self,
        backend: &dyn MixerBackend,
        map: &ChannelMap,
    ) -> Result<ChannelVolume> {
        if !self.has_volume {
            return Err(Error::NotSupported);
        }

        let mut out: Option<ChannelVolume> = None;
        for e in self.elements.iter().filter(|e| e.volume_use == VolumeUse::Merge) {
            let ev = e.get_volume(backend, map, self.has_db)?;
            out = Some(match out {
                None => ev,
                // With dB the gains chain, so the volumes multiply.
                Some(acc) if self.has_db => acc.multiply(&ev),
                Some(acc) => acc,
            });
            if !self.has_db {
                break;
            }
        }

        Ok(out.unwrap_or_else(|| ChannelVolume::norm(map.num_channels() as usize)))
    }

    /// Distributes `v` over the merged elements and returns what the
    /// hardware actually absorbed.
    pub fn set_volume(
        &self,
        backend: &mut dyn MixerBackend,
        v: &ChannelVolume,
        map: &ChannelMap,
        playback: bool,
        deferred: bool,
    ) -> Result<ChannelVolume> {
        if !self.has_volume {
            return Err(Error::NotSupported);
        }

        // rv is what is still to be applied, absorbed what has been.
        let mut rv = *v;
        let mut total = ChannelVolume::norm(map.num_channels() as usize);

        for e in self.elements.iter().filter(|e| e.volume_use == VolumeUse::Merge) {
            let absorbed = e.set_volume(backend, &rv, map, playback, deferred)?;
            total = total.multiply(&absorbed);
            rv = rv.divide(&absorbed);
            if !self.has_db {
                break;
            }
        }

        Ok(total)
    }

    /// Applies the mute switch.
    pub fn set_mute(&self, backend: &mut dyn MixerBackend, muted: bool) -> Result<()> {
        if !self.has_mute {
            return Err(Error::NotSupported);
        }

        for e in self.elements.iter().filter(|e| e.switch_use == SwitchUse::Mute) {
            backend.write_switch(&e.name, e.direction, !muted)?;
        }
        Ok(())
    }

    /// Activates the path: applies every element's static configuration,
    /// then the chosen setting's options.
    ///
    /// With `mute_during_activation`, the mute switch is held while the
    /// element writes happen.
    pub fn select(&self, backend: &mut dyn MixerBackend, setting: Option<&str>) -> Result<()> {
        let hold_mute = self.mute_during_activation && self.has_mute;
        if hold_mute {
            self.set_mute(backend, true)?;
        }

        let result = self.select_inner(backend, setting);

        if hold_mute {
            if let Err(e) = self.set_mute(backend, false) {
                warn!("path {}: failed to release activation mute: {}", self.name, e);
            }
        }
        result
    }

    fn select_inner(&self, backend: &mut dyn MixerBackend, setting: Option<&str>) -> Result<()> {
        for e in &self.elements {
            e.apply_constant(backend)?;
        }

        let Some(name) = setting else {
            return Ok(());
        };
        let setting = self
            .settings
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::NoEntity(name.to_owned()))?;

        for (elem_idx, option_name) in &setting.options {
            let e = &self.elements[*elem_idx];
            if e.switch_use == SwitchUse::Select {
                backend.write_switch(&e.name, e.direction, option_name == "on")?;
            } else if e.enumeration_use == EnumerationUse::Select {
                let option = e
                    .options
                    .iter()
                    .find(|o| o.alsa_name == *option_name)
                    .ok_or_else(|| Error::NoEntity(option_name.clone()))?;
                let hw = option
                    .hw_index
                    .ok_or_else(|| Error::NoEntity(option_name.clone()))?;
                backend.set_enum_item(&e.name, hw)?;
            }
        }
        Ok(())
    }

    /// Re-reads the jacks and reports the path's availability.
    pub fn update_jacks(&mut self, backend: &dyn MixerBackend) -> Available {
        let mut availability = Available::Unknown;
        for j in &mut self.jacks {
            j.update(backend);
            match j.availability() {
                Available::No => return Available::No,
                Available::Yes => availability = Available::Yes,
                Available::Unknown => {}
            }
        }
        availability
    }

    /// Synthesizes the Cartesian settings over the `SELECT` elements by
    /// successive composition.
    pub fn build_settings(&mut self) {
        let mut settings: Vec<Setting> = Vec::new();

        for (ei, e) in self.elements.iter().enumerate() {
            let selectable = e.switch_use == SwitchUse::Select
                || e.enumeration_use == EnumerationUse::Select;
            if !selectable {
                continue;
            }

            let options: Vec<_> = e
                .options
                .iter()
                .filter(|o| e.switch_use == SwitchUse::Select || o.hw_index.is_some())
                .collect();
            if options.is_empty() {
                continue;
            }

            if settings.is_empty() {
                settings = options
                    .iter()
                    .map(|o| Setting {
                        name: o.name.clone(),
                        description: o.description.clone(),
                        priority: o.priority,
                        options: vec![(ei, o.alsa_name.clone())],
                    })
                    .collect();
            } else {
                let mut combined = Vec::with_capacity(settings.len() * options.len());
                for s in &settings {
                    for o in &options {
                        let mut opts = s.options.clone();
                        opts.push((ei, o.alsa_name.clone()));
                        combined.push(Setting {
                            name: format!("{}+{}", s.name, o.name),
                            description: format!("{} / {}", s.description, o.description),
                            priority: s.priority + o.priority,
                            options: opts,
                        });
                    }
                }
                settings = combined;
            }
        }

        settings.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.settings = settings;
    }

    /// The subset test used by path set condensation: `self ⊆ other` means
    /// activating `self` can be expressed within `other`, so `self` is
    /// redundant.
    pub fn is_subset_of(&self, other: &Path) -> bool {
        // Every jack with a control must exist in the superset with the
        // same availability mapping.
        for j in self.jacks.iter().filter(|j| j.has_control) {
            let Some(oj) = other.jacks.iter().find(|oj| oj.name == j.name) else {
                return false;
            };
            if oj.state_plugged != j.state_plugged || oj.state_unplugged != j.state_unplugged {
                return false;
            }
        }

        for e in &self.elements {
            let Some(oe) = other.elements.iter().find(|oe| oe.name == e.name) else {
                let neutral = e.switch_use == SwitchUse::Ignore
                    && e.volume_use == VolumeUse::Ignore
                    && e.enumeration_use == EnumerationUse::Ignore;
                if neutral {
                    continue;
                }
                return false;
            };
            if !element_is_subset(e, oe) {
                return false;
            }
        }

        true
    }
}

fn element_is_subset(a: &Element, b: &Element) -> bool {
    // Volume uses.
    match (a.volume_use, b.volume_use) {
        (VolumeUse::Ignore, _) => {}
        (VolumeUse::Constant(x), VolumeUse::Constant(y)) => {
            if x != y {
                return false;
            }
        }
        (VolumeUse::Zero, VolumeUse::Zero) | (VolumeUse::Off, VolumeUse::Off) => {}
        (_, VolumeUse::Merge) => {
            // Anything fits under a merged volume as long as the effective
            // maximum stays within the superset's limit.
            if let (Some(a_max), Some(b_max)) = (a.effective_max_db(), Some(b.max_db)) {
                if b.has_db && a_max > b_max {
                    return false;
                }
            }
            if a.volume_use == VolumeUse::Merge && a.override_map != b.override_map {
                return false;
            }
        }
        _ => return false,
    }

    // Switch uses.
    match (a.switch_use, b.switch_use) {
        (SwitchUse::Ignore, _) => {}
        (SwitchUse::Mute, SwitchUse::Mute) => {}
        (SwitchUse::On, SwitchUse::On) | (SwitchUse::Off, SwitchUse::Off) => {}
        (SwitchUse::On, SwitchUse::Select) => {
            if !b.options.iter().any(|o| o.alsa_name == "on") {
                return false;
            }
        }
        (SwitchUse::Off, SwitchUse::Select) => {
            if !b.options.iter().any(|o| o.alsa_name == "off") {
                return false;
            }
        }
        (SwitchUse::Select, SwitchUse::Select) => {
            for o in &a.options {
                if !b.options.iter().any(|bo| bo.alsa_name == o.alsa_name) {
                    return false;
                }
            }
        }
        _ => return false,
    }

    // Enumeration uses.
    match (a.enumeration_use, b.enumeration_use) {
        (EnumerationUse::Ignore, _) => {}
        (EnumerationUse::Select, EnumerationUse::Select) => {
            for o in &a.options {
                if !b.options.iter().any(|bo| bo.alsa_name == o.alsa_name) {
                    return false;
                }
            }
        }
        _ => return false,
    }

    true
}
