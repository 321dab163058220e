//! Session parameters, validated on assignment
//!
//! Every setter rejects invalid values with a [`ParamError`], so a
//! `SessionParams` value handed to a capture session is always internally
//! consistent. Only the interface's existence is checked later, against the
//! live interface list.

use std::time::Duration;

use crate::error::ParamError;
use crate::locate::Bssid;

/// 1 TU = 1024 usec
pub const TU: f64 = 1024.0 / 1_000_000.0;

/// Hop interval chosen to stay out of step with the standard 100 TU beacon period
pub const OPTIMAL_BEACON_INTERVAL: f64 = 179.0 * TU;

/// Default distance between consecutive hops in the channel list
pub const STD_CHANNEL_DISTANCE: u32 = 2;

/// Narrow follow-up sweep centered on a guessed bearing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusedSweep {
    /// Arc width in degrees, (0, 360]
    pub width: f64,
    /// Seconds, > 0
    pub duration: f64,
}

/// Read-only snapshot handed to every task of a capture pass
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    capture: String,
    pass: u32,
    interface: Option<String>,
    duration: f64,
    degrees: f64,
    bearing: f64,
    hop_interval: f64,
    hop_distance: u32,
    channel: Option<u32>,
    macs: Vec<Bssid>,
    focused: Option<FocusedSweep>,
    focused_transmitter: Option<Bssid>,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            capture: chrono::Local::now().format("%Y%m%d-%H-%M-%S").to_string(),
            pass: 1,
            interface: None,
            duration: 15.0,
            degrees: 360.0,
            bearing: 0.0,
            hop_interval: OPTIMAL_BEACON_INTERVAL,
            hop_distance: STD_CHANNEL_DISTANCE,
            channel: None,
            macs: Vec::new(),
            focused: None,
            focused_transmitter: None,
        }
    }
}

impl SessionParams {
    pub fn capture(&self) -> &str {
        &self.capture
    }

    pub fn set_capture(&mut self, name: impl Into<String>) {
        self.capture = name.into();
    }

    pub fn pass(&self) -> u32 {
        self.pass
    }

    pub fn set_pass(&mut self, pass: u32) {
        self.pass = pass;
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn set_interface(&mut self, iface: impl Into<String>) -> Result<(), ParamError> {
        let iface = iface.into();
        let trimmed = iface.trim();
        if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
            return Err(ParamError::Interface(iface));
        }
        self.interface = Some(trimmed.to_string());
        Ok(())
    }

    /// Pass duration in seconds
    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn duration_std(&self) -> Duration {
        Duration::from_secs_f64(self.duration)
    }

    pub fn set_duration(&mut self, seconds: f64) -> Result<(), ParamError> {
        if !(seconds.is_finite() && seconds > 0.0) || Duration::try_from_secs_f64(seconds).is_err() {
            return Err(ParamError::Duration(seconds));
        }
        self.duration = seconds;
        Ok(())
    }

    /// Signed sweep; positive is the motor's forward direction
    pub fn degrees(&self) -> f64 {
        self.degrees
    }

    pub fn set_degrees(&mut self, degrees: f64) -> Result<(), ParamError> {
        if !degrees.is_finite() {
            return Err(ParamError::Degrees(degrees));
        }
        self.degrees = degrees;
        Ok(())
    }

    /// Starting magnetic bearing, always in [0, 360)
    pub fn bearing(&self) -> f64 {
        self.bearing
    }

    pub fn set_bearing(&mut self, bearing: f64) -> Result<(), ParamError> {
        if !bearing.is_finite() {
            return Err(ParamError::Bearing(bearing));
        }
        self.bearing = normalize_bearing(bearing);
        Ok(())
    }

    /// Channel hop interval in seconds
    pub fn hop_interval(&self) -> f64 {
        self.hop_interval
    }

    pub fn hop_interval_std(&self) -> Duration {
        Duration::from_secs_f64(self.hop_interval)
    }

    pub fn set_hop_interval(&mut self, seconds: f64) -> Result<(), ParamError> {
        if !(seconds.is_finite() && seconds > 0.0) || Duration::try_from_secs_f64(seconds).is_err() {
            return Err(ParamError::HopInterval(seconds));
        }
        self.hop_interval = seconds;
        Ok(())
    }

    pub fn hop_distance(&self) -> u32 {
        self.hop_distance
    }

    pub fn set_hop_distance(&mut self, distance: i64) -> Result<(), ParamError> {
        match u32::try_from(distance) {
            Ok(d) if d > 0 => {
                self.hop_distance = d;
                Ok(())
            }
            _ => Err(ParamError::HopDistance(distance)),
        }
    }

    /// Fixed channel; disables hopping when set
    pub fn channel(&self) -> Option<u32> {
        self.channel
    }

    pub fn set_channel(&mut self, channel: Option<i64>) -> Result<(), ParamError> {
        self.channel = match channel {
            None => None,
            Some(c) => match u32::try_from(c) {
                Ok(ch) if ch > 0 => Some(ch),
                _ => return Err(ParamError::Channel(c)),
            },
        };
        Ok(())
    }

    /// Transmitter allow-list; empty means every transmitter
    pub fn macs(&self) -> &[Bssid] {
        &self.macs
    }

    pub fn add_mac(&mut self, mac: &str) -> Result<(), ParamError> {
        let bssid: Bssid = mac.parse()?;
        if !self.macs.contains(&bssid) {
            self.macs.push(bssid);
        }
        Ok(())
    }

    pub fn set_macs(&mut self, macs: Vec<Bssid>) {
        self.macs = macs;
    }

    pub fn focused(&self) -> Option<FocusedSweep> {
        self.focused
    }

    pub fn set_focused(&mut self, focused: Option<FocusedSweep>) -> Result<(), ParamError> {
        if let Some(sweep) = focused {
            let width_ok = sweep.width > 0.0 && sweep.width <= 360.0;
            let duration_ok = sweep.duration.is_finite()
                && sweep.duration > 0.0
                && Duration::try_from_secs_f64(sweep.duration).is_ok();
            if !(width_ok && duration_ok) {
                return Err(ParamError::Focused {
                    width: sweep.width,
                    duration: sweep.duration,
                });
            }
        }
        self.focused = focused;
        Ok(())
    }

    pub fn focused_transmitter(&self) -> Option<Bssid> {
        self.focused_transmitter
    }

    /// Check the assembled snapshot before a session starts
    pub fn validate(&self) -> Result<(), ParamError> {
        if self.interface.is_none() {
            return Err(ParamError::Missing("interface"));
        }
        Ok(())
    }

    /// Parameters for a narrow pass centered on `guess`, if a focused sweep
    /// is configured. `clockwise` tells whether forward motor travel
    /// increases the bearing, so the sweep starts on the matching side.
    pub fn focused_on(&self, transmitter: Bssid, guess: f64, clockwise: bool) -> Option<SessionParams> {
        let sweep = self.focused?;
        let sign = if clockwise { 1.0 } else { -1.0 };
        let mut params = self.clone();
        params.degrees = sweep.width;
        params.duration = sweep.duration;
        params.bearing = normalize_bearing(guess - sign * sweep.width / 2.0);
        params.macs = vec![transmitter];
        params.focused = None;
        params.focused_transmitter = Some(transmitter);
        Some(params)
    }
}

/// Wrap a bearing into [0, 360)
pub fn normalize_bearing(bearing: f64) -> f64 {
    let wrapped = bearing.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}
