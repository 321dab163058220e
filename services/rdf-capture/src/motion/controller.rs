//! Motion controller
//!
//! Owns the antenna's cumulative bearing (not reduced mod 360, since the
//! feed cable limits how far the mount may wind) and turns rotation
//! requests into timed pulse trains on a [`PulseOutput`].

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::output::{Direction, PulseOutput};
use super::ramp::{RampConfig, RampProfile};
use crate::error::MotionError;
use crate::params::normalize_bearing;

const BEARING_EPSILON: f64 = 1e-6;

/// Resets shorter than this are skipped
const RESET_TOLERANCE: f64 = 0.1;

/// Busy-wait the last stretch before an edge; thread::sleep overshoots
const SPIN_THRESHOLD: Duration = Duration::from_micros(200);

/// Bounds on the cumulative bearing, in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TravelWindow {
    pub min: f64,
    pub max: f64,
}

impl Default for TravelWindow {
    fn default() -> Self {
        Self { min: -360.0, max: 720.0 }
    }
}

impl TravelWindow {
    pub fn contains(&self, bearing: f64) -> bool {
        bearing >= self.min - BEARING_EPSILON && bearing <= self.max + BEARING_EPSILON
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    fn at_boundary(&self, bearing: f64) -> bool {
        (bearing - self.min).abs() < BEARING_EPSILON || (bearing - self.max).abs() < BEARING_EPSILON
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotionConfig {
    pub steps_per_revolution: u32,
    pub microsteps: u32,
    pub window: TravelWindow,
    /// Degrees per second for repositioning moves
    pub reset_rate: f64,
    pub ramp: RampConfig,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            steps_per_revolution: 400,
            microsteps: 16,
            window: TravelWindow::default(),
            reset_rate: 30.0,
            ramp: RampConfig::default(),
        }
    }
}

impl MotionConfig {
    pub fn degrees_per_microstep(&self) -> f64 {
        360.0 / (f64::from(self.steps_per_revolution) * f64::from(self.microsteps))
    }
}

/// Timing of one rotation
#[derive(Debug, Clone, PartialEq)]
pub struct RotationResult {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub pulses: u64,
    pub expected_pulse_interval: Duration,
    pub measured_pulse_interval: Duration,
}

impl RotationResult {
    fn idle(at: DateTime<Utc>) -> Self {
        Self {
            start_time: at,
            end_time: at,
            pulses: 0,
            expected_pulse_interval: Duration::ZERO,
            measured_pulse_interval: Duration::ZERO,
        }
    }
}

pub struct MotionController<O: PulseOutput> {
    output: O,
    config: MotionConfig,
    bearing_current: f64,
}

impl<O: PulseOutput> MotionController<O> {
    /// The antenna is assumed to point at bearing 0 when the controller is created
    pub fn new(output: O, config: MotionConfig) -> Self {
        Self {
            output,
            config,
            bearing_current: 0.0,
        }
    }

    pub fn with_bearing(mut self, bearing: f64) -> Self {
        self.bearing_current = bearing;
        self
    }

    pub fn bearing_current(&self) -> f64 {
        self.bearing_current
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    /// Signed travel that brings the antenna to `target` (mod 360) and keeps
    /// the following sweep of `upcoming` degrees inside the travel window.
    pub fn best_path(&self, target: f64, upcoming: f64) -> f64 {
        let current = self.bearing_current;
        let target = normalize_bearing(target);
        let window = self.config.window;
        let fits = |travel: f64| {
            let start = current + travel;
            window.contains(start) && window.contains(start + upcoming)
        };

        // Already aligned but parked on a window edge: unwind all the way to
        // the canonical bearing, unless the sweep from there leaves the window.
        if angular_distance(normalize_bearing(current), target) < BEARING_EPSILON
            && window.at_boundary(current)
            && fits(target - current)
        {
            return target - current;
        }

        let candidate = 180.0 - (540.0 + (current - target)).rem_euclid(360.0);

        let best = (-3..=3)
            .map(|k| candidate + 360.0 * f64::from(k))
            .filter(|&travel| fits(travel))
            .min_by(|a, b| a.abs().total_cmp(&b.abs()));

        match best {
            Some(travel) => travel,
            None => {
                warn!(
                    "No path from {:.2}° to {:.2}° keeps a {:+.2}° sweep inside [{}, {}]; taking the shortest",
                    current, target, upcoming, window.min, window.max
                );
                candidate
            }
        }
    }

    /// Move to `target` at the configured reset rate. Returns whether the
    /// antenna moved.
    pub fn reset_to(&mut self, target: f64, upcoming: f64) -> Result<bool, MotionError> {
        let rate = self.config.reset_rate;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(MotionError::Precondition(format!("invalid reset rate {rate} deg/s")));
        }

        let travel = self.best_path(target, upcoming);
        if travel.abs() < RESET_TOLERANCE {
            debug!("Antenna already at {:.2}°, no reset needed", self.bearing_current);
            return Ok(false);
        }

        let duration = Duration::try_from_secs_f64(travel.abs() / rate)
            .map_err(|e| MotionError::Precondition(format!("reset duration: {e}")))?;
        info!(
            "Resetting antenna {:.2}° -> {:.2}° ({:+.2}° over {:.1}s)",
            self.bearing_current,
            self.bearing_current + travel,
            travel,
            duration.as_secs_f64()
        );
        self.rotate(travel, duration)?;
        Ok(true)
    }

    /// Rotate by `degrees` (signed) over `duration`
    pub fn rotate(&mut self, degrees: f64, duration: Duration) -> Result<RotationResult, MotionError> {
        if duration.is_zero() {
            return Err(MotionError::Precondition(
                "rotation duration must be greater than zero".into(),
            ));
        }
        if !degrees.is_finite() {
            return Err(MotionError::Precondition(format!("invalid rotation of {degrees} degrees")));
        }

        let dpm = self.config.degrees_per_microstep();
        let steps = (degrees / dpm).round() as i64;
        if steps == 0 {
            debug!("Rotation of {:.4}° is below one microstep ({:.4}°)", degrees, dpm);
            return Ok(RotationResult::idle(Utc::now()));
        }
        let pulses = steps.unsigned_abs();
        let direction = Direction::from_steps(steps);
        let profile = RampProfile::plan(pulses, duration, &self.config.ramp)?;
        debug!(
            "Rotation plan: {:+.2}° = {} pulses in {} segments over {:.3}s",
            degrees,
            pulses,
            profile.segments().len(),
            duration.as_secs_f64()
        );

        self.output
            .set_direction(direction)
            .and_then(|()| self.output.set_enabled(true))
            .map_err(|source| MotionError::Output { emitted: 0, source })?;

        let start_time = Utc::now();
        let started = Instant::now();
        if let Err((emitted, source)) = self.drive(&profile, started) {
            self.bearing_current += direction.sign() * emitted as f64 * dpm;
            error!(
                "Pulse output failed after {}/{} pulses, antenna now at {:.2}°: {}",
                emitted, pulses, self.bearing_current, source
            );
            return Err(MotionError::Output { emitted, source });
        }
        let elapsed = started.elapsed();
        let end_time = Utc::now();
        self.bearing_current += degrees;

        let expected = duration.as_secs_f64() / pulses as f64;
        let measured = elapsed.as_secs_f64() / pulses as f64;
        info!(
            "Rotated {:+.2}° in {:.3}s ({} pulses, interval expected {:.1}us measured {:.1}us, {:+.2}%)",
            degrees,
            elapsed.as_secs_f64(),
            pulses,
            expected * 1e6,
            measured * 1e6,
            (measured - expected) / expected * 100.0
        );

        Ok(RotationResult {
            start_time,
            end_time,
            pulses,
            expected_pulse_interval: Duration::from_secs_f64(expected),
            measured_pulse_interval: Duration::from_secs_f64(measured),
        })
    }

    /// Emit the profile against absolute deadlines from `t0`, so per-pulse
    /// overhead never accumulates. On failure returns the pulses already emitted.
    fn drive(&mut self, profile: &RampProfile, t0: Instant) -> Result<(), (u64, std::io::Error)> {
        let mut emitted = 0u64;
        let mut edge = 0.0f64;
        for segment in profile.segments() {
            let interval = segment.interval();
            for _ in 0..segment.pulses {
                sleep_until(t0 + Duration::from_secs_f64(edge));
                self.output.set_step(true).map_err(|e| (emitted, e))?;
                // the rising edge already stepped the motor
                emitted += 1;
                sleep_until(t0 + Duration::from_secs_f64(edge + interval / 2.0));
                self.output.set_step(false).map_err(|e| (emitted, e))?;
                edge += interval;
            }
        }
        sleep_until(t0 + Duration::from_secs_f64(edge));
        Ok(())
    }
}

fn sleep_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        if remaining > SPIN_THRESHOLD {
            thread::sleep(remaining - SPIN_THRESHOLD);
        } else {
            std::hint::spin_loop();
        }
    }
}

fn angular_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).abs() % 360.0;
    d.min(360.0 - d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Enabled(bool),
        Direction(Direction),
        Step(bool),
    }

    #[derive(Default)]
    struct RecordingOutput {
        events: Vec<Event>,
        fail_after: Option<u64>,
    }

    impl RecordingOutput {
        fn failing_after(pulses: u64) -> Self {
            Self { fail_after: Some(pulses), ..Self::default() }
        }

        fn rising_edges(&self) -> usize {
            self.events.iter().filter(|e| **e == Event::Step(true)).count()
        }
    }

    impl PulseOutput for RecordingOutput {
        fn set_enabled(&mut self, enabled: bool) -> io::Result<()> {
            self.events.push(Event::Enabled(enabled));
            Ok(())
        }

        fn set_direction(&mut self, direction: Direction) -> io::Result<()> {
            self.events.push(Event::Direction(direction));
            Ok(())
        }

        fn set_step(&mut self, high: bool) -> io::Result<()> {
            if high && Some(self.rising_edges() as u64) == self.fail_after {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gpio gone"));
            }
            self.events.push(Event::Step(high));
            Ok(())
        }
    }

    fn controller() -> MotionController<RecordingOutput> {
        MotionController::new(RecordingOutput::default(), MotionConfig::default())
    }

    fn congruent(a: f64, b: f64) -> bool {
        angular_distance(a, b) < 1e-6
    }

    #[test]
    fn best_path_reaches_target_modulo_360() {
        let window = TravelWindow::default();
        let mut current = window.min;
        while current <= window.max {
            for target in [0.0, 45.0, 90.0, 179.0, 180.0, 181.0, 270.0, 359.5] {
                let ctl = controller().with_bearing(current);
                let travel = ctl.best_path(target, 0.0);
                assert!(
                    congruent(current + travel, target),
                    "from {current} to {target} travelled {travel}"
                );
                assert!(window.contains(current + travel));
            }
            current += 37.5;
        }
    }

    #[test]
    fn best_path_prefers_the_shortest_fitting_travel() {
        let ctl = controller().with_bearing(10.0);
        assert!((ctl.best_path(350.0, 0.0) - -20.0).abs() < 1e-9);

        let ctl = controller().with_bearing(350.0);
        assert!((ctl.best_path(10.0, 0.0) - 20.0).abs() < 1e-9);

        let ctl = controller().with_bearing(100.0);
        assert!((ctl.best_path(100.0, 360.0)).abs() < 1e-9);
    }

    #[test]
    fn best_path_leaves_room_for_the_sweep() {
        // at 700 a forward 360 sweep from 0 (== 720) would overrun 720
        let ctl = controller().with_bearing(700.0);
        let travel = ctl.best_path(0.0, 360.0);
        let start = 700.0 + travel;
        assert!(congruent(start, 0.0));
        assert!(start + 360.0 <= 720.0 + 1e-9, "start {start}");
        assert!((start - 360.0).abs() < 1e-9);

        // reverse sweeps need room below
        let ctl = controller().with_bearing(-350.0);
        let start = -350.0 + ctl.best_path(0.0, -360.0);
        assert!(start - 360.0 >= -360.0 - 1e-9, "start {start}");
    }

    #[test]
    fn best_path_unwinds_from_window_edge() {
        let ctl = controller().with_bearing(720.0);
        assert!((ctl.best_path(0.0, 360.0) - -720.0).abs() < 1e-9);

        let ctl = controller().with_bearing(-360.0);
        assert!((ctl.best_path(0.0, 360.0) - 360.0).abs() < 1e-9);
    }

    #[test]
    fn edge_unwind_still_keeps_the_sweep_inside() {
        let ctl = controller().with_bearing(720.0);
        let travel = ctl.best_path(0.0, -720.0);
        let start = 720.0 + travel;
        assert!(congruent(start, 0.0));
        assert!(ctl.config().window.contains(start), "start {start}");
        assert!(ctl.config().window.contains(start - 720.0), "end {}", start - 720.0);
    }

    #[test]
    fn zero_duration_rotation_emits_nothing() {
        let mut ctl = controller();
        let err = ctl.rotate(90.0, Duration::ZERO).unwrap_err();
        assert!(matches!(err, MotionError::Precondition(_)));
        assert!(ctl.output().events.is_empty());
        assert_eq!(ctl.bearing_current(), 0.0);
    }

    #[test]
    fn rotation_emits_expected_pulses() {
        let mut ctl = controller();
        let result = ctl.rotate(-9.0, Duration::from_millis(40)).unwrap();
        // 9 / (360 / 6400) = 160
        assert_eq!(result.pulses, 160);
        assert_eq!(ctl.output().rising_edges(), 160);
        assert_eq!(ctl.output().events[0], Event::Direction(Direction::Reverse));
        assert_eq!(ctl.output().events[1], Event::Enabled(true));
        assert!((ctl.bearing_current() - -9.0).abs() < 1e-9);
        assert!(result.end_time >= result.start_time);
        let expected = result.expected_pulse_interval.as_secs_f64();
        assert!((expected - 250e-6).abs() < 1e-9);
        assert!(result.measured_pulse_interval.as_secs_f64() >= expected * 0.99);
    }

    #[test]
    fn sub_microstep_rotation_is_a_no_op() {
        let mut ctl = controller();
        let result = ctl.rotate(0.01, Duration::from_secs(1)).unwrap();
        assert_eq!(result.pulses, 0);
        assert!(ctl.output().events.is_empty());
        assert_eq!(ctl.bearing_current(), 0.0);
    }

    #[test]
    fn output_failure_aborts_and_tracks_partial_travel() {
        let mut ctl = MotionController::new(RecordingOutput::failing_after(32), MotionConfig::default());
        let err = ctl.rotate(9.0, Duration::from_millis(40)).unwrap_err();
        assert!(matches!(err, MotionError::Output { emitted: 32, .. }));
        assert!((ctl.bearing_current() - 32.0 * 360.0 / 6400.0).abs() < 1e-9);
    }

    #[test]
    fn reset_skips_tiny_moves() {
        let mut ctl = controller().with_bearing(360.05);
        assert!(!ctl.reset_to(0.0, 360.0).unwrap());
        assert!(ctl.output().events.is_empty());
    }

    #[test]
    fn reset_moves_to_target() {
        let config = MotionConfig { reset_rate: 90.0, ..MotionConfig::default() };
        let mut ctl = MotionController::new(RecordingOutput::default(), config).with_bearing(3.0);
        assert!(ctl.reset_to(0.0, 360.0).unwrap());
        assert!(ctl.bearing_current().abs() < 1e-9);
    }
}
