//! Acceleration ramp planning
//!
//! A rotation of N pulses over T seconds is split into `k` ramp-up segments,
//! a cruise segment and `k` mirrored ramp-down segments. Segment `i` of a
//! ramp runs at `(i + 1) / (k + 1)` of the cruise frequency, and the cruise
//! frequency is solved so the whole profile lasts exactly T.

use std::time::Duration;

use crate::error::MotionError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampConfig {
    /// Segments per ramp side; 0 disables ramping
    pub segments: usize,
    /// Share of the pulses spent in each ramp side, [0, 0.5]
    pub fraction: f64,
    /// Fastest step frequency the driver and motor can follow
    pub max_frequency_hz: f64,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            segments: 4,
            fraction: 0.1,
            max_frequency_hz: 20_000.0,
        }
    }
}

/// `pulses` steps at a fixed frequency
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampSegment {
    pub frequency_hz: f64,
    pub pulses: u64,
}

impl RampSegment {
    /// Seconds between rising edges
    pub fn interval(&self) -> f64 {
        1.0 / self.frequency_hz
    }

    pub fn duration_secs(&self) -> f64 {
        self.pulses as f64 / self.frequency_hz
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RampProfile {
    segments: Vec<RampSegment>,
}

impl RampProfile {
    pub fn plan(pulses: u64, duration: Duration, config: &RampConfig) -> Result<Self, MotionError> {
        let secs = duration.as_secs_f64();
        if secs <= 0.0 {
            return Err(MotionError::Precondition(
                "rotation duration must be greater than zero".into(),
            ));
        }
        if pulses == 0 {
            return Ok(Self::default());
        }

        let k = config.segments;
        let mut per_side = (pulses as f64 * config.fraction.clamp(0.0, 0.5)).floor() as u64;
        // too short to ramp: every segment needs at least one pulse
        if k == 0 || per_side < k as u64 {
            per_side = 0;
        }

        let ramp_pulses = split_evenly(per_side, k);
        let scales: Vec<f64> = (0..k).map(|i| (i + 1) as f64 / (k + 1) as f64).collect();
        let cruise_pulses = pulses - 2 * per_side;

        let slowed: f64 = ramp_pulses
            .iter()
            .zip(&scales)
            .map(|(&p, &s)| p as f64 / s)
            .sum();
        let cruise_hz = (cruise_pulses as f64 + 2.0 * slowed) / secs;

        let mut segments = Vec::with_capacity(2 * k + 1);
        if per_side > 0 {
            for (&p, &s) in ramp_pulses.iter().zip(&scales) {
                segments.push(RampSegment { frequency_hz: cruise_hz * s, pulses: p });
            }
        }
        if cruise_pulses > 0 {
            segments.push(RampSegment { frequency_hz: cruise_hz, pulses: cruise_pulses });
        }
        if per_side > 0 {
            for (&p, &s) in ramp_pulses.iter().zip(&scales).rev() {
                segments.push(RampSegment { frequency_hz: cruise_hz * s, pulses: p });
            }
        }

        let profile = Self { segments };
        profile.validate(config)?;
        Ok(profile)
    }

    fn validate(&self, config: &RampConfig) -> Result<(), MotionError> {
        for segment in &self.segments {
            if !(segment.frequency_hz.is_finite() && segment.frequency_hz > 0.0) {
                return Err(MotionError::Precondition(format!(
                    "invalid step frequency {} Hz",
                    segment.frequency_hz
                )));
            }
            if segment.frequency_hz > config.max_frequency_hz {
                return Err(MotionError::Precondition(format!(
                    "step frequency {:.0} Hz exceeds the {:.0} Hz limit; lengthen the duration or shorten the sweep",
                    segment.frequency_hz, config.max_frequency_hz
                )));
            }
        }
        Ok(())
    }

    pub fn segments(&self) -> &[RampSegment] {
        &self.segments
    }

    pub fn pulses(&self) -> u64 {
        self.segments.iter().map(|s| s.pulses).sum()
    }

    pub fn duration_secs(&self) -> f64 {
        self.segments.iter().map(RampSegment::duration_secs).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Spread `total` over `parts` buckets, remainder going to the first ones
fn split_evenly(total: u64, parts: usize) -> Vec<u64> {
    if parts == 0 {
        return Vec::new();
    }
    let parts_u = parts as u64;
    let (base, rem) = (total / parts_u, total % parts_u);
    (0..parts_u).map(|i| base + u64::from(i < rem)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_matches_requested_duration() {
        let config = RampConfig::default();
        for (pulses, secs) in [(6400u64, 15.0f64), (1000, 2.0), (57, 0.5), (12_345, 30.0)] {
            let profile = RampProfile::plan(pulses, Duration::from_secs_f64(secs), &config).unwrap();
            assert_eq!(profile.pulses(), pulses);
            let err = (profile.duration_secs() - secs).abs() / secs;
            assert!(err < 0.01, "{pulses} pulses over {secs}s planned as {}s", profile.duration_secs());
        }
    }

    #[test]
    fn ramps_are_mirrored_and_slower_than_cruise() {
        let profile = RampProfile::plan(6400, Duration::from_secs(15), &RampConfig::default()).unwrap();
        let segments = profile.segments();
        assert_eq!(segments.len(), 9);

        let cruise = segments[4];
        assert_eq!(cruise.pulses, 6400 - 2 * 640);
        for i in 0..4 {
            assert_eq!(segments[i], segments[8 - i]);
            assert!(segments[i].frequency_hz < segments[i + 1].frequency_hz);
        }
        assert!((segments[0].frequency_hz - cruise.frequency_hz / 5.0).abs() < 1e-9);
    }

    #[test]
    fn short_rotations_skip_the_ramp() {
        let profile = RampProfile::plan(30, Duration::from_secs(1), &RampConfig::default()).unwrap();
        assert_eq!(profile.segments().len(), 1);
        assert!((profile.segments()[0].frequency_hz - 30.0).abs() < 1e-9);
    }

    #[test]
    fn zero_duration_is_rejected() {
        let err = RampProfile::plan(100, Duration::ZERO, &RampConfig::default()).unwrap_err();
        assert!(matches!(err, MotionError::Precondition(_)));
    }

    #[test]
    fn frequency_ceiling_is_enforced() {
        let config = RampConfig { max_frequency_hz: 1000.0, ..RampConfig::default() };
        let err = RampProfile::plan(6400, Duration::from_secs(1), &config).unwrap_err();
        assert!(matches!(err, MotionError::Precondition(msg) if msg.contains("exceeds")));
    }

    #[test]
    fn no_pulses_means_empty_profile() {
        let profile = RampProfile::plan(0, Duration::from_secs(1), &RampConfig::default()).unwrap();
        assert!(profile.is_empty());
    }

    #[test]
    fn split_evenly_keeps_total() {
        assert_eq!(split_evenly(10, 4), vec![3, 3, 2, 2]);
        assert_eq!(split_evenly(4, 4), vec![1, 1, 1, 1]);
        assert!(split_evenly(7, 0).is_empty());
    }
}
