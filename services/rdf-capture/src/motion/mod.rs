//! Stepper motion for the rotating antenna
//!
//! - `output` - step/direction/enable pulse backends (sysfs GPIO, simulation)
//! - `ramp` - acceleration profile planning for a rotation
//! - `controller` - cumulative bearing tracking, shortest-path resets, timed rotations

mod controller;
mod output;
mod ramp;

pub use controller::{MotionConfig, MotionController, RotationResult, TravelWindow};
pub use output::{Direction, NullPulseOutput, PulseOutput, SysfsPins, SysfsPulseOutput};
pub use ramp::{RampConfig, RampProfile, RampSegment};
