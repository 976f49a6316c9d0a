//! A scripted in-memory mixer for exercising the path machinery.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::mixer::backend::MixerBackend;
use crate::port::Direction;

#[derive(Debug, Default, Clone)]
struct FakeElement {
    has_volume: bool,
    has_switch: bool,
    min: i64,
    max: i64,
    min_db: f64,
    max_db: f64,
    /// Reported dB endpoints; differ from the real ones on broken drivers.
    claimed_db: Option<(f64, f64)>,
    steps: Vec<i64>,
    switch: bool,
    enum_items: Vec<String>,
    enum_selected: usize,
}

impl FakeElement {
    fn step_to_db(&self, step: i64) -> f64 {
        if self.max == self.min {
            return self.max_db;
        }
        let f = (step - self.min) as f64 / (self.max - self.min) as f64;
        self.min_db + f * (self.max_db - self.min_db)
    }

    fn db_to_step(&self, db: f64, round_up: bool) -> i64 {
        if self.max_db == self.min_db {
            return self.max;
        }
        let f = (db - self.min_db) / (self.max_db - self.min_db);
        let raw = self.min as f64 + f * (self.max - self.min) as f64;
        let step = if round_up { raw.ceil() } else { raw.floor() } as i64;
        step.clamp(self.min, self.max)
    }
}

/// A scripted mixer backend.
#[derive(Debug, Default)]
pub struct FakeMixer {
    elements: HashMap<String, FakeElement>,
    jacks: HashMap<String, bool>,
    /// Every write the path machinery performed, for assertions.
    pub writes: Vec<String>,
}

impl FakeMixer {
    /// Creates an empty mixer.
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds an element with a volume control.
    pub fn add_volume(&mut self, name: &str, min: i64, max: i64, min_db: f64, max_db: f64) {
        let e = self.elements.entry(name.to_owned()).or_default();
        e.has_volume = true;
        e.min = min;
        e.max = max;
        e.min_db = min_db;
        e.max_db = max_db;
        e.steps = vec![max];
    }

    /// Adds a volume whose claimed dB range disagrees with its step data.
    pub fn add_broken_volume(&mut self, name: &str, min: i64, max: i64) {
        self.add_volume(name, min, max, -30.0, 0.0);
        self.elements.get_mut(name).unwrap().claimed_db = Some((-99.0, 20.0));
    }

    /// Adds an element with a switch.
    pub fn add_switch(&mut self, name: &str, initial: bool) {
        let e = self.elements.entry(name.to_owned()).or_default();
        e.has_switch = true;
        e.switch = initial;
    }

    /// Adds an enumeration element.
    pub fn add_enum(&mut self, name: &str, items: &[&str]) {
        let e = self.elements.entry(name.to_owned()).or_default();
        e.enum_items = items.iter().map(|s| s.to_string()).collect();
    }

    /// Adds a jack control.
    pub fn add_jack(&mut self, name: &str, plugged: bool) {
        self.jacks.insert(name.to_owned(), plugged);
    }

    /// Simulates (un)plugging a jack.
    pub fn set_jack(&mut self, name: &str, plugged: bool) {
        self.jacks.insert(name.to_owned(), plugged);
    }

    /// The current steps of an element's volume.
    pub fn volume_of(&self, name: &str) -> &[i64] {
        &self.elements[name].steps
    }

    /// The current state of an element's switch.
    pub fn switch_of(&self, name: &str) -> bool {
        self.elements[name].switch
    }

    fn element(&self, name: &str) -> Result<&FakeElement> {
        self.elements
            .get(name)
            .ok_or_else(|| Error::NoEntity(name.to_owned()))
    }
}

impl MixerBackend for FakeMixer {
    fn has_element(&self, name: &str) -> bool {
        self.elements.contains_key(name)
    }

    fn has_switch(&self, name: &str, _dir: Direction) -> bool {
        self.elements.get(name).map(|e| e.has_switch).unwrap_or(false)
    }

    fn has_volume(&self, name: &str, _dir: Direction) -> bool {
        self.elements.get(name).map(|e| e.has_volume).unwrap_or(false)
    }

    fn has_enumeration(&self, name: &str) -> bool {
        self.elements
            .get(name)
            .map(|e| !e.enum_items.is_empty())
            .unwrap_or(false)
    }

    fn volume_range(&self, name: &str, _dir: Direction) -> Result<(i64, i64)> {
        let e = self.element(name)?;
        Ok((e.min, e.max))
    }

    fn db_range(&self, name: &str, _dir: Direction) -> Result<(f64, f64)> {
        let e = self.element(name)?;
        match e.claimed_db {
            Some(claimed) => Ok(claimed),
            None => Ok((e.min_db, e.max_db)),
        }
    }

    fn step_to_db(&self, name: &str, _dir: Direction, step: i64) -> Result<f64> {
        Ok(self.element(name)?.step_to_db(step))
    }

    fn db_to_step(&self, name: &str, _dir: Direction, db: f64, round_up: bool) -> Result<i64> {
        Ok(self.element(name)?.db_to_step(db, round_up))
    }

    fn channels(&self, name: &str, _dir: Direction) -> usize {
        self.elements.get(name).map(|e| e.steps.len()).unwrap_or(0)
    }

    fn read_volume(&self, name: &str, _dir: Direction) -> Result<Vec<i64>> {
        Ok(self.element(name)?.steps.clone())
    }

    fn write_volume(&mut self, name: &str, _dir: Direction, steps: &[i64]) -> Result<()> {
        self.writes.push(format!("{}={:?}", name, steps));
        let e = self
            .elements
            .get_mut(name)
            .ok_or_else(|| Error::NoEntity(name.to_owned()))?;
        e.steps = steps.to_vec();
        Ok(())
    }

    fn read_switch(&self, name: &str, _dir: Direction) -> Result<bool> {
        Ok(self.element(name)?.switch)
    }

    fn write_switch(&mut self, name: &str, _dir: Direction, on: bool) -> Result<()> {
        self.writes.push(format!("{}={}", name, on));
        let e = self
            .elements
            .get_mut(name)
            .ok_or_else(|| Error::NoEntity(name.to_owned()))?;
        e.switch = on;
        Ok(())
    }

    fn enum_items(&self, name: &str) -> Vec<String> {
        self.elements
            .get(name)
            .map(|e| e.enum_items.clone())
            .unwrap_or_default()
    }

    fn set_enum_item(&mut self, name: &str, item: usize) -> Result<()> {
        self.writes.push(format!("{}#{}", name, item));
        let e = self
            .elements
            .get_mut(name)
            .ok_or_else(|| Error::NoEntity(name.to_owned()))?;
        if item >= e.enum_items.len() {
            return Err(Error::Invalid(format!("enum index {} out of range", item)));
        }
        e.enum_selected = item;
        Ok(())
    }

    fn jack_plugged(&self, name: &str) -> Option<bool> {
        self.jacks.get(name).copied()
    }
}
