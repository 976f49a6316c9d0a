//! The device and stream core of a userspace sound server: sources and
//! sinks, the per-stream source outputs and sink inputs attached to them,
//! flat-volume propagation across sharing trees, deferred hardware volume,
//! and the mixer path abstraction that turns hardware controls into ports.
//!
//! The crate deliberately stops at the seams: the event loop, resampler
//! algorithms, hardware drivers, and the wire protocol are collaborators,
//! reached through the traits in [`source`], [`sink`], [`resampler`] and
//! [`mixer::backend`].

#![warn(
    anonymous_parameters,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_qualifications
)]

pub mod channel;
pub mod config;
pub mod core;
pub mod device;
pub mod format;
pub mod hook;
pub mod idxset;
pub mod ioloop;
pub mod memblock;
pub mod memblockq;
pub mod mixer;
pub mod msgq;
pub mod port;
pub mod profile;
pub mod props;
pub mod resampler;
pub mod sample;
pub mod sink;
pub mod sink_input;
pub mod source;
pub mod source_output;
pub mod time;
pub mod volume;

mod error;

pub use error::{Error, Result};
