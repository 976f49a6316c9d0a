//! Defines the [`Props`] type, a key-value map that is used to associate arbitrary properties with
//! objects.

use std::collections::BTreeMap;

/// For streams: localized media name, formatted as UTF-8.
pub const PROP_MEDIA_NAME: &str = "media.name";
/// For streams: an id for the role this media is played in.
pub const PROP_MEDIA_ROLE: &str = "media.role";
/// For clients/streams: application name.
pub const PROP_APPLICATION_NAME: &str = "application.name";
/// For devices: localized human readable device one-line description.
pub const PROP_DEVICE_DESCRIPTION: &str = "device.description";
/// For devices: device string the implementor opened the hardware with.
pub const PROP_DEVICE_STRING: &str = "device.string";
/// For devices: a class string, one of "sound", "modem", "monitor", "filter".
pub const PROP_DEVICE_CLASS: &str = "device.class";
/// For devices: name of the owning profile.
pub const PROP_DEVICE_PROFILE_NAME: &str = "device.profile.name";

/// A list of key-value pairs that associate arbitrary properties with an
/// object. By convention keys are dotted ASCII strings.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Props(BTreeMap<String, String>);

impl Props {
    /// Creates a new, empty property list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a property in the map.
    ///
    /// If the property already has a value, it will be overwritten with the new one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Gets a property from the map.
    ///
    /// If `key` is not in the map, returns `None`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }

    /// Removes a property from the map, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Merges another property list into this one, overwriting existing keys.
    pub fn merge(&mut self, other: &Props) {
        for (k, v) in other.0.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Create an Iterator over the properties.
    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, String, String> {
        self.0.iter()
    }
}

impl std::fmt::Debug for Props {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}
