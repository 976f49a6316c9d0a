//! The port-and-path mixer abstraction: hardware mixer control groups
//! (elements) aggregated into paths that expose one volume slider, one mute
//! switch and a pick-list of settings, probed against a mixer backend and
//! condensed into the ports a device announces.

pub mod backend;
pub mod element;
pub mod jack;
pub mod path;
pub mod pathset;

#[cfg(test)]
pub mod testutil;
