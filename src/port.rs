//! Externally visible, selectable I/O points on a device.

use crate::mixer::pathset::PathSet;
use crate::time::MicroSeconds;

/// Specifies the direction of a port.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// The port is an input, ie. part of a source.
    Input,
    /// The port is an output, ie. part of a sink.
    Output,
}

/// Port availability / jack detection status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Available {
    /// This port does not support jack detection.
    #[default]
    Unknown,
    /// This port is not available, likely because the jack is not plugged in.
    No,
    /// This port is available, likely because the jack is plugged in.
    Yes,
}

/// A port on a device, to which a speaker or microphone can be connected.
///
/// A port binds a mixer path, and optionally one of the path's settings; the
/// two together determine what activating the port does to the hardware
/// mixer.
#[derive(Debug, Clone)]
pub struct DevicePort {
    /// The port's unique name. When the bound path has multiple settings,
    /// this is `<path-name>;<setting-name>`.
    pub name: String,
    /// Human readable description.
    pub description: String,
    /// Whether this is an input or output port.
    pub direction: Direction,
    /// Higher priority ports are preferred when picking a default.
    pub priority: u32,
    /// Jack detection status.
    pub available: Available,
    /// Extra latency this port adds to the device.
    pub latency_offset: MicroSeconds,
    /// Name of the mixer path the port activates.
    pub path: Option<String>,
    /// Name of the path setting the port selects, if the path has settings.
    pub setting: Option<String>,
    /// Whether a port selection should be persisted.
    pub save: bool,
}

impl DevicePort {
    /// Creates a plain port with no mixer binding.
    pub fn new(name: impl Into<String>, direction: Direction, priority: u32) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            direction,
            priority,
            available: Available::Unknown,
            latency_offset: MicroSeconds(0),
            path: None,
            setting: None,
            save: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::path::{Path, Setting};

    #[test]
    fn port_names_carry_the_setting() {
        let mut plain = Path::new("analog-output");
        plain.priority = 90;

        let mut multi = Path::new("analog-input");
        multi.description = "Analog Input".into();
        multi.settings = vec![
            Setting {
                name: "mic".into(),
                description: "Microphone".into(),
                priority: 20,
                options: vec![],
            },
            Setting {
                name: "line".into(),
                description: "Line In".into(),
                priority: 10,
                options: vec![],
            },
        ];

        let mut set = crate::mixer::pathset::PathSet::new(Direction::Input);
        set.add(plain);
        set.add(multi);

        let ports = ports_from_path_set(&set, Direction::Input);
        let names: Vec<_> = ports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["analog-output", "analog-input;mic", "analog-input;line"]
        );
        assert_eq!(ports[1].description, "Analog Input / Microphone");
        assert_eq!(ports[1].setting.as_deref(), Some("mic"));
    }
}

/// Builds the user-visible ports for a probed path set.
///
/// Paths without settings produce one port named after the path; paths with
/// several settings produce one port per setting, named
/// `<path-name>;<setting-name>` and described as
/// `<path-desc> / <setting-desc>`.
pub fn ports_from_path_set(set: &PathSet, direction: Direction) -> Vec<DevicePort> {
    let mut ports = Vec::new();

    for path in set.paths() {
        if path.settings.len() > 1 {
            for setting in &path.settings {
                ports.push(DevicePort {
                    name: format!("{};{}", path.name, setting.name),
                    description: format!("{} / {}", path.description, setting.description),
                    direction,
                    priority: path.priority + setting.priority,
                    available: Available::Unknown,
                    latency_offset: MicroSeconds(0),
                    path: Some(path.name.clone()),
                    setting: Some(setting.name.clone()),
                    save: false,
                });
            }
        } else {
            ports.push(DevicePort {
                name: path.name.clone(),
                description: path.description.clone(),
                direction,
                priority: path.priority,
                available: Available::Unknown,
                latency_offset: MicroSeconds(0),
                path: Some(path.name.clone()),
                setting: path.settings.first().map(|s| s.name.clone()),
                save: false,
            });
        }
    }

    ports
}
