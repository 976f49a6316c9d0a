//! Plug-detect controls bound to a path.

use crate::mixer::backend::MixerBackend;
use crate::mixer::element::Required;
use crate::port::Available;

/// A jack control: maps plugged/unplugged hardware events to port
/// availability.
#[derive(Debug, Clone)]
pub struct Jack {
    /// The configured jack name.
    pub name: String,
    /// The hardware control name, by convention `<name> Jack`.
    pub alsa_name: String,
    /// What "plugged" means for the bound port.
    pub state_plugged: Available,
    /// What "unplugged" means for the bound port.
    pub state_unplugged: Available,
    /// Presence requirement.
    pub required: Required,
    /// Contributes to the path's required-any test.
    pub required_any: Required,
    /// Must be absent.
    pub required_absent: Required,
    /// Probed: the hardware has this jack control.
    pub has_control: bool,
    /// Last observed plug state.
    pub plugged_in: bool,
}

impl Jack {
    /// Creates a jack with the conventional control name and default state
    /// mapping (plugged means available).
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            alsa_name: format!("{} Jack", name),
            name,
            state_plugged: Available::Yes,
            state_unplugged: Available::No,
            required: Required::Ignore,
            required_any: Required::Ignore,
            required_absent: Required::Ignore,
            has_control: false,
            plugged_in: false,
        }
    }

    /// Probes the jack. Returns `Err` if a presence requirement fails.
    pub fn probe(&mut self, backend: &dyn MixerBackend) -> crate::Result<()> {
        match backend.jack_plugged(&self.alsa_name) {
            Some(plugged) => {
                if self.required_absent != Required::Ignore {
                    return Err(crate::Error::Invalid(format!(
                        "jack {} must be absent",
                        self.alsa_name
                    )));
                }
                self.has_control = true;
                self.plugged_in = plugged;
            }
            None => {
                if self.required != Required::Ignore {
                    return Err(crate::Error::NoEntity(self.alsa_name.clone()));
                }
                self.has_control = false;
            }
        }
        Ok(())
    }

    /// Re-reads the plug state.
    pub fn update(&mut self, backend: &dyn MixerBackend) {
        if let Some(plugged) = backend.jack_plugged(&self.alsa_name) {
            self.plugged_in = plugged;
        }
    }

    /// The availability this jack currently reports for its port.
    pub fn availability(&self) -> Available {
        if !self.has_control {
            return Available::Unknown;
        }
        if self.plugged_in {
            self.state_plugged
        } else {
            self.state_unplugged
        }
    }
}
