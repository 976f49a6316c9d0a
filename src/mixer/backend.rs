//! The seam to the hardware mixer driver bindings.
//!
//! Only the operations the path machinery needs are modeled; the actual
//! driver lives outside this crate. Volumes are integer steps in a
//! per-element range, decibel values are `f64` dB.

use crate::error::Result;
use crate::port::Direction;

/// Access to one hardware mixer.
pub trait MixerBackend {
    /// Whether a mixer element with this name exists at all.
    fn has_element(&self, name: &str) -> bool;

    /// Whether the element has a switch in the given direction.
    fn has_switch(&self, name: &str, dir: Direction) -> bool;

    /// Whether the element has a volume in the given direction.
    fn has_volume(&self, name: &str, dir: Direction) -> bool;

    /// Whether the element is an enumeration.
    fn has_enumeration(&self, name: &str) -> bool;

    /// The integer volume range `[min, max]`.
    fn volume_range(&self, name: &str, dir: Direction) -> Result<(i64, i64)>;

    /// The dB range `[min, max]` in dB.
    fn db_range(&self, name: &str, dir: Direction) -> Result<(f64, f64)>;

    /// The dB value of an integer step.
    fn step_to_db(&self, name: &str, dir: Direction, step: i64) -> Result<f64>;

    /// The nearest selectable step for a dB target, rounding up or down.
    fn db_to_step(&self, name: &str, dir: Direction, db: f64, round_up: bool) -> Result<i64>;

    /// How many hardware channels the element has; 1 means mono.
    fn channels(&self, name: &str, dir: Direction) -> usize;

    /// Reads the per-channel integer volumes.
    fn read_volume(&self, name: &str, dir: Direction) -> Result<Vec<i64>>;

    /// Writes the per-channel integer volumes.
    fn write_volume(&mut self, name: &str, dir: Direction, steps: &[i64]) -> Result<()>;

    /// Reads the switch state.
    fn read_switch(&self, name: &str, dir: Direction) -> Result<bool>;

    /// Writes the switch state.
    fn write_switch(&mut self, name: &str, dir: Direction, on: bool) -> Result<()>;

    /// The hardware's option strings for an enumeration element.
    fn enum_items(&self, name: &str) -> Vec<String>;

    /// Selects an enumeration item by hardware index.
    fn set_enum_item(&mut self, name: &str, item: usize) -> Result<()>;

    /// The plug state of a jack control, if the control exists.
    fn jack_plugged(&self, name: &str) -> Option<bool>;
}
