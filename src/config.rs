//! Resolves tokenized configuration into the path and profile-set schema.
//!
//! The section/key=value tokenizer lives outside this crate; what arrives
//! here is an ordered list of `(section, key, value)` triples. This module
//! owns the schema: which sections and keys exist, the value grammars
//! (masks, required classes, `db-values` tables), and the assembly into
//! [`Path`] and [`ProfileSet`] objects.

use std::collections::BTreeMap;

use crate::channel::{ChannelMap, PositionMask};
use crate::error::{Error, Result};
use crate::mixer::element::{
    Element, ElementOption, EnumerationUse, Required, SwitchUse, VolumeUse,
};
use crate::mixer::jack::Jack;
use crate::mixer::path::Path;
use crate::port::{Available, Direction};
use crate::profile::{DecibelFix, Mapping, Profile, ProfileSet};

/// One tokenized configuration line: `(section, key, value)`.
pub type ConfigEntry = (String, String, String);

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(Error::Invalid(format!("not a boolean: {}", value))),
    }
}

fn parse_required(value: &str) -> Result<Required> {
    Ok(match value {
        "ignore" => Required::Ignore,
        "any" => Required::Any,
        "switch" => Required::Switch,
        "volume" => Required::Volume,
        "enumeration" => Required::Enumeration,
        _ => return Err(Error::Invalid(format!("unknown required class: {}", value))),
    })
}

fn parse_available(value: &str) -> Result<Available> {
    Ok(match value {
        "yes" => Available::Yes,
        "no" => Available::No,
        "unknown" => Available::Unknown,
        _ => {
            return Err(Error::Invalid(format!(
                "unknown availability: {}",
                value
            )))
        }
    })
}

fn parse_direction(value: &str) -> Result<Direction> {
    Ok(match value {
        "playback" | "output" => Direction::Output,
        "capture" | "input" => Direction::Input,
        _ => return Err(Error::Invalid(format!("unknown direction: {}", value))),
    })
}

fn parse_masks(value: &str) -> Result<Vec<PositionMask>> {
    value.split(',').map(|m| m.trim().parse()).collect()
}

fn parse_string_list(value: &str) -> Vec<String> {
    value
        .split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(|s| s.to_owned())
        .collect()
}

/// Resolves the `[General]` / `[Jack]` / `[Element]` / `[Option]` schema
/// into a path named `name` and bound to `direction`.
///
/// Unknown sections or keys are rejected as `Invalid`.
pub fn path_from_config(
    name: &str,
    direction: Direction,
    entries: &[ConfigEntry],
) -> Result<Path> {
    let mut path = Path::new(name);

    // Elements keep their configuration order; options attach to them by
    // name afterwards.
    let mut element_order: Vec<String> = Vec::new();
    let mut elements: BTreeMap<String, Element> = BTreeMap::new();
    let mut jacks: BTreeMap<String, Jack> = BTreeMap::new();
    let mut jack_order: Vec<String> = Vec::new();

    for (section, key, value) in entries {
        if section == "General" {
            match key.as_str() {
                "priority" => {
                    path.priority = value
                        .parse()
                        .map_err(|_| Error::Invalid(format!("bad priority: {}", value)))?
                }
                "description" => path.description = value.clone(),
                "description-key" => path.description_key = Some(value.clone()),
                "mute-during-activation" => path.mute_during_activation = parse_bool(value)?,
                "eld-device" => {
                    path.eld_device = Some(
                        value
                            .parse()
                            .map_err(|_| Error::Invalid(format!("bad eld-device: {}", value)))?,
                    )
                }
                _ => {
                    return Err(Error::Invalid(format!(
                        "unknown key {} in [General]",
                        key
                    )))
                }
            }
        } else if let Some(jack_name) = section.strip_prefix("Jack ") {
            let jack = jacks.entry(jack_name.to_owned()).or_insert_with(|| {
                jack_order.push(jack_name.to_owned());
                Jack::new(jack_name)
            });
            match key.as_str() {
                "state.plugged" => jack.state_plugged = parse_available(value)?,
                "state.unplugged" => jack.state_unplugged = parse_available(value)?,
                "required" => jack.required = parse_required(value)?,
                "required-any" => jack.required_any = parse_required(value)?,
                "required-absent" => jack.required_absent = parse_required(value)?,
                _ => {
                    return Err(Error::Invalid(format!(
                        "unknown key {} in [Jack {}]",
                        key, jack_name
                    )))
                }
            }
        } else if let Some(element_name) = section.strip_prefix("Element ") {
            let element = elements.entry(element_name.to_owned()).or_insert_with(|| {
                element_order.push(element_name.to_owned());
                Element::new(element_name, direction)
            });
            match key.as_str() {
                "switch" => {
                    element.switch_use = match value.as_str() {
                        "ignore" => SwitchUse::Ignore,
                        "mute" => SwitchUse::Mute,
                        "on" => SwitchUse::On,
                        "off" => SwitchUse::Off,
                        "select" => SwitchUse::Select,
                        _ => {
                            return Err(Error::Invalid(format!(
                                "unknown switch use: {}",
                                value
                            )))
                        }
                    }
                }
                "volume" => {
                    element.volume_use = match value.as_str() {
                        "ignore" => VolumeUse::Ignore,
                        "merge" => VolumeUse::Merge,
                        "off" => VolumeUse::Off,
                        "zero" => VolumeUse::Zero,
                        constant => VolumeUse::Constant(constant.parse().map_err(|_| {
                            Error::Invalid(format!("unknown volume use: {}", constant))
                        })?),
                    }
                }
                "enumeration" => {
                    element.enumeration_use = match value.as_str() {
                        "ignore" => EnumerationUse::Ignore,
                        "select" => EnumerationUse::Select,
                        _ => {
                            return Err(Error::Invalid(format!(
                                "unknown enumeration use: {}",
                                value
                            )))
                        }
                    }
                }
                "direction" => element.direction = parse_direction(value)?,
                "direction-try-other" => element.direction_try_other = parse_bool(value)?,
                "volume-limit" => {
                    let limit: i64 = value
                        .parse()
                        .map_err(|_| Error::Invalid(format!("bad volume-limit: {}", value)))?;
                    if limit < 0 {
                        return Err(Error::Invalid("volume-limit must be >= 0".into()));
                    }
                    element.volume_limit = Some(limit);
                }
                "override-map.1" => element.override_map[0] = Some(parse_masks(value)?),
                "override-map.2" => element.override_map[1] = Some(parse_masks(value)?),
                "required" => element.required = parse_required(value)?,
                "required-any" => element.required_any = parse_required(value)?,
                "required-absent" => element.required_absent = parse_required(value)?,
                _ => {
                    return Err(Error::Invalid(format!(
                        "unknown key {} in [Element {}]",
                        key, element_name
                    )))
                }
            }
        } else if let Some(option_name) = section.strip_prefix("Option ") {
            let (element_name, option_value) = option_name
                .rsplit_once(':')
                .ok_or_else(|| Error::Invalid(format!("bad option section: {}", section)))?;
            let element = elements
                .get_mut(element_name)
                .ok_or_else(|| Error::NoEntity(element_name.to_owned()))?;

            let option = match element
                .options
                .iter_mut()
                .find(|o| o.alsa_name == option_value)
            {
                Some(o) => o,
                None => {
                    element
                        .options
                        .push(ElementOption::new(option_value, option_value));
                    element.options.last_mut().unwrap()
                }
            };

            match key.as_str() {
                "priority" => {
                    option.priority = value
                        .parse()
                        .map_err(|_| Error::Invalid(format!("bad priority: {}", value)))?
                }
                "name" => {
                    option.name = value.clone();
                    option.description = value.clone();
                }
                "required" => option.required = parse_required(value)?,
                "required-any" => option.required_any = parse_required(value)?,
                "required-absent" => option.required_absent = parse_required(value)?,
                _ => {
                    return Err(Error::Invalid(format!(
                        "unknown key {} in [Option {}]",
                        key, option_name
                    )))
                }
            }
        } else {
            return Err(Error::Invalid(format!("unknown section: {}", section)));
        }
    }

    for name in element_order {
        path.elements.push(elements.remove(&name).unwrap());
    }
    for name in jack_order {
        path.jacks.push(jacks.remove(&name).unwrap());
    }
    Ok(path)
}

/// Resolves the `[General]` / `[Mapping]` / `[Profile]` / `[DecibelFix]`
/// schema into a profile set.
pub fn profile_set_from_config(entries: &[ConfigEntry]) -> Result<ProfileSet> {
    let mut set = ProfileSet::new();
    let mut db_points: BTreeMap<String, Vec<(i64, f64)>> = BTreeMap::new();

    for (section, key, value) in entries {
        if section == "General" {
            match key.as_str() {
                "auto-profiles" => set.auto_profiles = parse_bool(value)?,
                _ => {
                    return Err(Error::Invalid(format!(
                        "unknown key {} in [General]",
                        key
                    )))
                }
            }
        } else if let Some(name) = section.strip_prefix("Mapping ") {
            let mapping = set
                .mappings
                .entry(name.to_owned())
                .or_insert_with(|| Mapping::new(name));
            match key.as_str() {
                "device-strings" => mapping.device_strings = parse_string_list(value),
                "channel-map" => mapping.channel_map = Some(value.parse::<ChannelMap>()?),
                "paths-input" => mapping.paths_input = parse_string_list(value),
                "paths-output" => mapping.paths_output = parse_string_list(value),
                "element-input" => mapping.element_input = Some(value.clone()),
                "element-output" => mapping.element_output = Some(value.clone()),
                "direction" => mapping.direction = Some(parse_direction(value)?),
                "description" => mapping.description = value.clone(),
                "priority" => {
                    mapping.priority = value
                        .parse()
                        .map_err(|_| Error::Invalid(format!("bad priority: {}", value)))?
                }
                _ => {
                    return Err(Error::Invalid(format!(
                        "unknown key {} in [Mapping {}]",
                        key, name
                    )))
                }
            }
        } else if let Some(name) = section.strip_prefix("Profile ") {
            let profile = set.profiles.entry(name.to_owned()).or_insert_with(|| Profile {
                name: name.to_owned(),
                description: name.to_owned(),
                ..Default::default()
            });
            match key.as_str() {
                "input-mappings" => profile.input_mappings = parse_string_list(value),
                "output-mappings" => profile.output_mappings = parse_string_list(value),
                "skip-probe" => profile.skip_probe = parse_bool(value)?,
                "description" => profile.description = value.clone(),
                "priority" => {
                    profile.priority = value
                        .parse()
                        .map_err(|_| Error::Invalid(format!("bad priority: {}", value)))?
                }
                _ => {
                    return Err(Error::Invalid(format!(
                        "unknown key {} in [Profile {}]",
                        key, name
                    )))
                }
            }
        } else if let Some(name) = section.strip_prefix("DecibelFix ") {
            match key.as_str() {
                "db-values" => {
                    let mut points = Vec::new();
                    for pair in value.split_whitespace() {
                        let (step, db) = pair.split_once(':').ok_or_else(|| {
                            Error::Invalid(format!("bad db-values entry: {}", pair))
                        })?;
                        let step = step
                            .parse()
                            .map_err(|_| Error::Invalid(format!("bad step: {}", step)))?;
                        let db = db
                            .parse()
                            .map_err(|_| Error::Invalid(format!("bad dB value: {}", db)))?;
                        points.push((step, db));
                    }
                    db_points.insert(name.to_owned(), points);
                }
                _ => {
                    return Err(Error::Invalid(format!(
                        "unknown key {} in [DecibelFix {}]",
                        key, name
                    )))
                }
            }
        } else {
            return Err(Error::Invalid(format!("unknown section: {}", section)));
        }
    }

    for (name, points) in db_points {
        set.decibel_fixes
            .insert(name.clone(), DecibelFix::from_points(name, &points)?);
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelPosition;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn entries(list: &[(&str, &str, &str)]) -> Vec<ConfigEntry> {
        list.iter()
            .map(|(s, k, v)| (s.to_string(), k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn path_schema() {
        let path = path_from_config(
            "analog-output-headphones",
            Direction::Output,
            &entries(&[
                ("General", "priority", "90"),
                ("General", "description", "Headphones"),
                ("Jack Headphone", "state.plugged", "yes"),
                ("Jack Headphone", "state.unplugged", "no"),
                ("Element Headphone", "switch", "mute"),
                ("Element Headphone", "volume", "merge"),
                ("Element Headphone", "volume-limit", "40"),
                ("Element Headphone", "override-map.2", "all-left,all-right"),
                ("Element Input Source", "enumeration", "select"),
                ("Option Input Source:Mic", "name", "mic"),
                ("Option Input Source:Mic", "priority", "20"),
            ]),
        )
        .unwrap();

        assert_eq!(path.priority, 90);
        assert_eq!(path.description, "Headphones");
        assert_eq!(path.jacks.len(), 1);
        assert_eq!(path.elements.len(), 2);

        let hp = &path.elements[0];
        assert_eq!(hp.switch_use, SwitchUse::Mute);
        assert_eq!(hp.volume_use, VolumeUse::Merge);
        assert_eq!(hp.volume_limit, Some(40));
        let masks = hp.override_map[1].as_ref().unwrap();
        assert!(masks[0].contains(ChannelPosition::FrontLeft));
        assert!(masks[1].contains(ChannelPosition::RearRight));

        let source = &path.elements[1];
        assert_eq!(source.enumeration_use, EnumerationUse::Select);
        assert_eq!(source.options[0].name, "mic");
        assert_eq!(source.options[0].priority, 20);
    }

    #[test]
    fn path_schema_rejects_unknown_keys() {
        assert_matches!(
            path_from_config(
                "x",
                Direction::Output,
                &entries(&[("General", "prio", "90")])
            ),
            Err(Error::Invalid(_))
        );
        assert_matches!(
            path_from_config(
                "x",
                Direction::Output,
                &entries(&[("Bogus", "key", "value")])
            ),
            Err(Error::Invalid(_))
        );
    }

    #[test]
    fn profile_set_schema() {
        let set = profile_set_from_config(&entries(&[
            ("General", "auto-profiles", "yes"),
            ("Mapping analog-stereo", "device-strings", "front:%f"),
            ("Mapping analog-stereo", "channel-map", "front-left,front-right"),
            ("Mapping analog-stereo", "paths-output", "analog-output analog-output-headphones"),
            ("Mapping analog-stereo", "priority", "10"),
            ("Profile off", "description", "Off"),
            ("Profile off", "skip-probe", "yes"),
            ("DecibelFix PCM", "db-values", "0:-60.0 64:0.0"),
        ]))
        .unwrap();

        assert!(set.auto_profiles);
        let mapping = &set.mappings["analog-stereo"];
        assert_eq!(mapping.channel_map.unwrap().num_channels(), 2);
        assert_eq!(mapping.paths_output.len(), 2);
        assert!(set.profiles["off"].skip_probe);
        assert_eq!(set.decibel_fixes["PCM"].db_at(32), -30.0);
    }
}
