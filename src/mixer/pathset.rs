//! A collection of paths for one device direction: probed, deduplicated and
//! condensed into the set a device's ports are built from.

use std::collections::HashMap;

use log::debug;

use crate::error::Result;
use crate::mixer::backend::MixerBackend;
use crate::mixer::path::Path;
use crate::port::Direction;

/// All paths applicable to one device direction.
#[derive(Debug)]
pub struct PathSet {
    direction: Direction,
    paths: Vec<Path>,
}

impl PathSet {
    /// Creates an empty set.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            paths: Vec::new(),
        }
    }

    /// The set's direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Adds a path to be probed.
    pub fn add(&mut self, path: Path) {
        self.paths.push(path);
    }

    /// The surviving paths, in priority order.
    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    /// Looks up a path by name.
    pub fn path(&self, name: &str) -> Option<&Path> {
        self.paths.iter().find(|p| p.name == name)
    }

    /// Looks up a path by name, mutably.
    pub fn path_mut(&mut self, name: &str) -> Option<&mut Path> {
        self.paths.iter_mut().find(|p| p.name == name)
    }

    /// Probes every path, drops the unsupported and redundant ones, makes
    /// option names unique, and synthesizes the settings.
    pub fn probe(&mut self, backend: &dyn MixerBackend) -> Result<()> {
        let mut supported = Vec::with_capacity(self.paths.len());
        for mut path in std::mem::take(&mut self.paths) {
            if path.probe(backend)? {
                supported.push(path);
            } else {
                debug!("dropping unsupported path {}", path.name);
            }
        }
        self.paths = supported;

        self.condense();
        self.make_option_names_unique();
        for path in &mut self.paths {
            path.build_settings();
        }

        self.paths.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(())
    }

    /// Drops every path that is a subset of another path in the set.
    fn condense(&mut self) {
        let mut drop = vec![false; self.paths.len()];

        for i in 0..self.paths.len() {
            for j in 0..self.paths.len() {
                if i == j || drop[j] {
                    continue;
                }
                if drop[i] {
                    break;
                }
                let a = &self.paths[i];
                let b = &self.paths[j];
                if a.is_subset_of(b) {
                    // Two paths that are subsets of each other are
                    // identical; keep the first.
                    if b.is_subset_of(a) && j > i {
                        continue;
                    }
                    debug!("dropping path {} (subset of {})", a.name, b.name);
                    drop[i] = true;
                }
            }
        }

        let mut keep = drop.iter().map(|d| !d);
        self.paths.retain(|_| keep.next().unwrap());
    }

    /// Appends `-N` to option tags that repeat across the set, so setting
    /// and port names stay unambiguous.
    fn make_option_names_unique(&mut self) {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for path in &self.paths {
            for e in &path.elements {
                for o in &e.options {
                    *counts.entry(o.name.clone()).or_default() += 1;
                }
            }
        }

        let mut seen: HashMap<String, u32> = HashMap::new();
        for path in &mut self.paths {
            for e in &mut path.elements {
                for o in &mut e.options {
                    if counts.get(&o.name).copied().unwrap_or(0) > 1 {
                        let n = seen.entry(o.name.clone()).or_default();
                        *n += 1;
                        if *n > 1 {
                            o.name = format!("{}-{}", o.name, n);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::element::{Element, ElementOption, SwitchUse, VolumeUse};
    use crate::mixer::testutil::FakeMixer;
    use crate::port::Direction;

    fn merge_element(name: &str, limit: Option<i64>) -> Element {
        let mut e = Element::new(name, Direction::Output);
        e.volume_use = VolumeUse::Merge;
        e.volume_limit = limit;
        e
    }

    /// A path whose volume element has a lower limit, plus an extra OFF
    /// element, is condensed away in favor of the unrestricted path.
    #[test]
    fn subset_condensation() {
        let mut mixer = FakeMixer::new();
        mixer.add_volume("E1", 0, 64, -64.0, 0.0);
        mixer.add_volume("E2", 0, 10, -10.0, 0.0);

        let mut p = Path::new("analog-output");
        p.priority = 90;
        p.elements.push(merge_element("E1", None));
        p.elements.push(merge_element("E2", None));

        let mut q = Path::new("analog-output-limited");
        q.priority = 80;
        q.elements.push(merge_element("E1", Some(32)));
        let mut off = Element::new("E2", Direction::Output);
        off.volume_use = VolumeUse::Off;
        q.elements.push(off);

        let mut set = PathSet::new(Direction::Output);
        set.add(p);
        set.add(q);
        set.probe(&mixer).unwrap();

        let names: Vec<_> = set.paths().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["analog-output"]);
    }

    /// After condensation no path is a strict subset of another.
    #[test]
    fn no_strict_subsets_survive() {
        let mut mixer = FakeMixer::new();
        mixer.add_volume("Master", 0, 64, -64.0, 0.0);
        mixer.add_switch("Headphone", true);
        mixer.add_volume("Headphone", 0, 64, -64.0, 0.0);

        let mut a = Path::new("a");
        a.elements.push(merge_element("Master", None));

        let mut b = Path::new("b");
        b.elements.push(merge_element("Master", None));
        let mut hp = merge_element("Headphone", None);
        hp.switch_use = SwitchUse::Mute;
        b.elements.push(hp);

        let mut set = PathSet::new(Direction::Output);
        set.add(a);
        set.add(b);
        set.probe(&mixer).unwrap();

        for (i, p) in set.paths().iter().enumerate() {
            for (j, q) in set.paths().iter().enumerate() {
                if i != j {
                    assert!(
                        !(p.is_subset_of(q) && !q.is_subset_of(p)),
                        "{} is a strict subset of {}",
                        p.name,
                        q.name
                    );
                }
            }
        }
    }

    /// Settings are the Cartesian product over the SELECT elements.
    #[test]
    fn setting_synthesis() {
        let mut mixer = FakeMixer::new();
        mixer.add_enum("Input Source", &["Mic", "Line"]);
        mixer.add_switch("Boost", false);

        let mut path = Path::new("analog-input");
        let mut source = Element::new("Input Source", Direction::Input);
        source.enumeration_use = crate::mixer::element::EnumerationUse::Select;
        source.options.push(ElementOption::new("Mic", "mic"));
        source.options.push(ElementOption::new("Line", "line"));
        path.elements.push(source);

        let mut boost = Element::new("Boost", Direction::Input);
        boost.switch_use = SwitchUse::Select;
        boost.options.push(ElementOption::new("on", "boost"));
        boost.options.push(ElementOption::new("off", "noboost"));
        path.elements.push(boost);

        let mut set = PathSet::new(Direction::Input);
        set.add(path);
        set.probe(&mixer).unwrap();

        let settings: Vec<_> = set.paths()[0]
            .settings
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(settings.len(), 4);
        assert!(settings.contains(&"mic+boost"));
        assert!(settings.contains(&"line+noboost"));
    }
}
