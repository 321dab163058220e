//! GPS position for a capture pass
//!
//! `client` talks to gpsd (JSON over TCP) and records raw NMEA with
//! gpspipe; `sampler` waits for a 3D fix, samples it for the duration of a
//! pass and averages the samples into the pass metadata.

mod client;
mod sampler;

pub use client::{GpsFix, GpsSource, GpsdClient};
pub use sampler::{average, AveragedFix, GpsSample, GpsSampler};
