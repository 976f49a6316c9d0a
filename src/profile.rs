//! Mappings, profiles and decibel fixes: the named combinations of device
//! strings, formats and paths a card exposes.

use std::collections::BTreeMap;

use crate::channel::ChannelMap;
use crate::error::{Error, Result};
use crate::port::Direction;

/// A correction table for drivers whose dB information is missing or wrong:
/// maps integer steps to dB, linearly interpolated between the configured
/// points.
#[derive(Debug, Clone)]
pub struct DecibelFix {
    /// The mixer element this fix applies to.
    pub name: String,
    /// First step covered by the table.
    pub min_step: i64,
    /// Last step covered by the table.
    pub max_step: i64,
    /// dB per step, indexed by `step - min_step`.
    db_values: Vec<f64>,
}

impl DecibelFix {
    /// Builds a fix from sparse `(step, dB)` points.
    ///
    /// Steps and dB values must both be strictly increasing; the gaps are
    /// filled by linear interpolation.
    pub fn from_points(name: impl Into<String>, points: &[(i64, f64)]) -> Result<Self> {
        if points.is_empty() {
            return Err(Error::Invalid("decibel fix needs at least one point".into()));
        }
        for pair in points.windows(2) {
            if pair[1].0 <= pair[0].0 || pair[1].1 <= pair[0].1 {
                return Err(Error::Invalid(
                    "decibel fix points must be strictly increasing".into(),
                ));
            }
        }

        let min_step = points[0].0;
        let max_step = points[points.len() - 1].0;
        let mut db_values = Vec::with_capacity((max_step - min_step + 1) as usize);

        let mut seg = 0;
        for step in min_step..=max_step {
            while seg + 1 < points.len() && points[seg + 1].0 < step {
                seg += 1;
            }
            let (s0, d0) = points[seg];
            let db = if step <= s0 || seg + 1 >= points.len() {
                d0
            } else {
                let (s1, d1) = points[seg + 1];
                d0 + (d1 - d0) * (step - s0) as f64 / (s1 - s0) as f64
            };
            db_values.push(db);
        }

        Ok(Self {
            name: name.into(),
            min_step,
            max_step,
            db_values,
        })
    }

    /// The dB value at `step`, clamped to the table.
    pub fn db_at(&self, step: i64) -> f64 {
        let idx = (step.clamp(self.min_step, self.max_step) - self.min_step) as usize;
        self.db_values[idx]
    }

    /// The step whose dB value is nearest to `db`, rounding up (playback)
    /// or down (capture) between table entries.
    pub fn nearest_step(&self, db: f64, round_up: bool) -> i64 {
        // The table is monotone, so scan for the crossing.
        for (i, &v) in self.db_values.iter().enumerate() {
            if v >= db {
                if v > db && !round_up && i > 0 {
                    return self.min_step + i as i64 - 1;
                }
                return self.min_step + i as i64;
            }
        }
        self.max_step
    }
}

/// A named (sample-spec, channel-map, device-string) combination.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    /// The mapping's name.
    pub name: String,
    /// Description for the user.
    pub description: String,
    /// Higher priority mappings are preferred.
    pub priority: u32,
    /// Device strings to try, in order.
    pub device_strings: Vec<String>,
    /// The channel map streams on this mapping use.
    pub channel_map: Option<ChannelMap>,
    /// Path names probed when this mapping captures.
    pub paths_input: Vec<String>,
    /// Path names probed when this mapping plays.
    pub paths_output: Vec<String>,
    /// A single fallback element for capture volume.
    pub element_input: Option<String>,
    /// A single fallback element for playback volume.
    pub element_output: Option<String>,
    /// Restricts the mapping to one direction.
    pub direction: Option<Direction>,
}

impl Mapping {
    /// Creates an empty mapping.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            ..Default::default()
        }
    }

    /// Whether the mapping can serve the given direction.
    pub fn supports(&self, direction: Direction) -> bool {
        self.direction.map_or(true, |d| d == direction)
    }
}

/// A named combination of mappings, exposed to the user as a card profile.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    /// The profile's name.
    pub name: String,
    /// Description for the user.
    pub description: String,
    /// Higher priority profiles are preferred.
    pub priority: u32,
    /// Capture mappings this profile activates.
    pub input_mappings: Vec<String>,
    /// Playback mappings this profile activates.
    pub output_mappings: Vec<String>,
    /// Trust the configuration and skip probing the mappings.
    pub skip_probe: bool,
}

/// All mappings, profiles and decibel fixes configured for one card model.
#[derive(Debug, Default)]
pub struct ProfileSet {
    /// Synthesize profiles from the mapping combinations.
    pub auto_profiles: bool,
    /// Mappings by name.
    pub mappings: BTreeMap<String, Mapping>,
    /// Profiles by name.
    pub profiles: BTreeMap<String, Profile>,
    /// Decibel fixes by element name.
    pub decibel_fixes: BTreeMap<String, DecibelFix>,
}

impl ProfileSet {
    /// Creates an empty set with auto-profiles enabled.
    pub fn new() -> Self {
        Self {
            auto_profiles: true,
            ..Default::default()
        }
    }

    /// Synthesizes the Cartesian profiles over the input and output
    /// mappings, plus one single-direction profile per mapping. Explicitly
    /// configured profiles are never overwritten.
    pub fn synthesize_auto_profiles(&mut self) {
        if !self.auto_profiles {
            return;
        }

        let inputs: Vec<&Mapping> = self
            .mappings
            .values()
            .filter(|m| m.supports(Direction::Input))
            .collect();
        let outputs: Vec<&Mapping> = self
            .mappings
            .values()
            .filter(|m| m.supports(Direction::Output))
            .collect();

        let mut synthesized = Vec::new();

        for o in &outputs {
            synthesized.push(Profile {
                name: format!("output:{}", o.name),
                description: format!("{} Output", o.description),
                priority: o.priority,
                input_mappings: Vec::new(),
                output_mappings: vec![o.name.clone()],
                skip_probe: false,
            });

            for i in &inputs {
                synthesized.push(Profile {
                    name: format!("output:{}+input:{}", o.name, i.name),
                    description: format!("{} Output + {} Input", o.description, i.description),
                    priority: o.priority + i.priority,
                    input_mappings: vec![i.name.clone()],
                    output_mappings: vec![o.name.clone()],
                    skip_probe: false,
                });
            }
        }
        for i in &inputs {
            synthesized.push(Profile {
                name: format!("input:{}", i.name),
                description: format!("{} Input", i.description),
                priority: i.priority,
                input_mappings: vec![i.name.clone()],
                output_mappings: Vec::new(),
                skip_probe: false,
            });
        }

        for p in synthesized {
            self.profiles.entry(p.name.clone()).or_insert(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decibel_fix_interpolates() {
        let fix = DecibelFix::from_points("PCM", &[(0, -60.0), (10, -10.0), (20, 0.0)]).unwrap();
        assert_eq!(fix.db_at(0), -60.0);
        assert_eq!(fix.db_at(10), -10.0);
        assert_eq!(fix.db_at(5), -35.0);
        assert_eq!(fix.db_at(15), -5.0);
        // Out-of-range steps clamp.
        assert_eq!(fix.db_at(-5), -60.0);
        assert_eq!(fix.db_at(99), 0.0);
    }

    #[test]
    fn decibel_fix_rejects_non_monotone() {
        assert!(DecibelFix::from_points("PCM", &[(0, -10.0), (5, -20.0)]).is_err());
        assert!(DecibelFix::from_points("PCM", &[(5, -10.0), (5, 0.0)]).is_err());
    }

    #[test]
    fn nearest_step_rounding() {
        let fix = DecibelFix::from_points("PCM", &[(0, -10.0), (10, 0.0)]).unwrap();
        // -3.5 dB sits between steps 6 (-4.0) and 7 (-3.0).
        assert_eq!(fix.nearest_step(-3.5, true), 7);
        assert_eq!(fix.nearest_step(-3.5, false), 6);
    }

    #[test]
    fn auto_profile_synthesis() {
        let mut set = ProfileSet::new();
        let mut stereo_out = Mapping::new("analog-stereo");
        stereo_out.direction = Some(Direction::Output);
        stereo_out.priority = 10;
        let mut stereo_in = Mapping::new("analog-stereo-in");
        stereo_in.direction = Some(Direction::Input);
        stereo_in.priority = 5;
        set.mappings.insert(stereo_out.name.clone(), stereo_out);
        set.mappings.insert(stereo_in.name.clone(), stereo_in);

        set.synthesize_auto_profiles();

        assert!(set.profiles.contains_key("output:analog-stereo"));
        assert!(set.profiles.contains_key("input:analog-stereo-in"));
        let combined = &set.profiles["output:analog-stereo+input:analog-stereo-in"];
        assert_eq!(combined.priority, 15);
    }
}
