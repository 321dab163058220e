//! Bearing estimation from beacon arrival times
//!
//! Each beacon's arrival time is mapped to the antenna bearing at that
//! instant by linear interpolation over the rotation window. Per transmitter
//! the strongest power per degree is kept, and the bearing of peak power is
//! taken either directly (few samples) or from a pchip interpolant.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::frame::{Bssid, FrameRecord, Security};
use super::pchip::Pchip;
use super::tracker::{TransmitterState, TransmitterTracker, BUCKETS};
use crate::error::EstimateError;
use crate::session::CaptureMetadata;

/// At or below this many defined degrees the peak is picked directly
pub const NAIVE_SAMPLE_LIMIT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Naive,
    Pchip,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Naive => "naive",
            Method::Pchip => "pchip",
        })
    }
}

/// Antenna sweep in time and angle
#[derive(Debug, Clone, PartialEq)]
pub struct RotationWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    sweep_degrees: f64,
    start_bearing: f64,
    direction: f64,
}

impl RotationWindow {
    /// `clockwise` tells whether positive motor travel increases the bearing
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sweep_degrees: f64,
        start_bearing: f64,
        clockwise: bool,
    ) -> Result<Self, EstimateError> {
        if end <= start {
            return Err(EstimateError::DegenerateWindow { start, end });
        }
        Ok(Self {
            start,
            end,
            sweep_degrees,
            start_bearing,
            direction: if clockwise { 1.0 } else { -1.0 },
        })
    }

    pub fn from_metadata(metadata: &CaptureMetadata, clockwise: bool) -> Result<Self, EstimateError> {
        Self::new(
            metadata.rotation.start_time,
            metadata.rotation.end_time,
            metadata.params.degrees(),
            metadata.params.bearing(),
            clockwise,
        )
    }

    pub fn full_circle(&self) -> bool {
        self.sweep_degrees.abs() >= 360.0
    }

    /// Antenna bearing at `t`, in [0, 360). Times outside the window clamp
    /// to its ends.
    pub fn bearing_at(&self, t: DateTime<Utc>) -> f64 {
        let span = seconds(self.end - self.start);
        let progress = (seconds(t - self.start) / span).clamp(0.0, 1.0);
        (self.direction * progress * self.sweep_degrees + self.start_bearing).rem_euclid(360.0)
    }
}

fn seconds(delta: chrono::TimeDelta) -> f64 {
    delta
        .num_microseconds()
        .map_or(delta.num_milliseconds() as f64 / 1e3, |us| us as f64 / 1e6)
}

/// Estimated bearing of one transmitter
#[derive(Debug, Clone, PartialEq)]
pub struct BearingEstimate {
    pub transmitter: Bssid,
    pub ssid: Option<String>,
    /// Channel most beacons arrived on
    pub channel: Option<u32>,
    pub security: Option<Security>,
    /// Strongest signal seen, dBm
    pub strength_dbm: i32,
    pub sample_count: u64,
    pub method: Method,
    /// Interpolation failed and the naive pick was used instead
    pub fell_back: bool,
    /// Degrees magnetic, 0..=359
    pub bearing: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EstimateReport {
    /// Strongest first, ties by transmitter address
    pub estimates: Vec<BearingEstimate>,
    pub frames_used: u64,
    /// Frames missing time, transmitter, signal or channel
    pub decode_failures: u64,
    /// Frames from transmitters outside the allow-list
    pub filtered: u64,
    pub fallbacks: u64,
}

impl EstimateReport {
    pub fn get(&self, transmitter: &Bssid) -> Option<&BearingEstimate> {
        self.estimates.iter().find(|e| &e.transmitter == transmitter)
    }
}

/// Estimate a bearing for every transmitter heard during `window`.
/// An empty `macs` accepts every transmitter.
pub fn estimate(frames: &[FrameRecord], window: &RotationWindow, macs: &[Bssid]) -> EstimateReport {
    let mut tracker = TransmitterTracker::new();
    let mut report = EstimateReport::default();

    for frame in frames {
        let Some(beacon) = frame.beacon() else {
            report.decode_failures += 1;
            continue;
        };
        if !macs.is_empty() && !macs.contains(&beacon.transmitter) {
            report.filtered += 1;
            continue;
        }
        tracker.update(window.bearing_at(beacon.arrival_time), &beacon);
        report.frames_used += 1;
    }
    if report.decode_failures > 0 {
        warn!("{} frames lacked fields needed for estimation", report.decode_failures);
    }
    debug!("{}", tracker.stats_summary());

    for state in tracker.iter() {
        let Some((bearing, method, fell_back)) = locate(state, window.full_circle()) else {
            continue;
        };
        if fell_back {
            report.fallbacks += 1;
            warn!("Interpolation failed for {}, used naive peak", state.transmitter);
        }
        report.estimates.push(BearingEstimate {
            transmitter: state.transmitter,
            ssid: state.ssid.clone(),
            channel: state.modal_channel(),
            security: state.security.clone(),
            strength_dbm: state.max_dbm,
            sample_count: state.frames,
            method,
            fell_back,
            bearing,
        });
    }

    report.estimates.sort_by(|a, b| {
        b.strength_dbm
            .cmp(&a.strength_dbm)
            .then_with(|| a.transmitter.cmp(&b.transmitter))
    });
    info!(
        "Estimated bearings for {} transmitters from {} frames",
        report.estimates.len(),
        report.frames_used
    );
    report
}

fn locate(state: &TransmitterState, full_circle: bool) -> Option<(u16, Method, bool)> {
    let points: Vec<(f64, f64)> = state
        .buckets()
        .iter()
        .enumerate()
        .filter_map(|(deg, power)| power.filter(|p| p.is_finite()).map(|p| (deg as f64, p)))
        .collect();
    pick(&points, full_circle, pchip_peak)
}

/// Naive peak for sparse points, `interpolate` otherwise with the naive peak
/// as fallback
fn pick(
    points: &[(f64, f64)],
    full_circle: bool,
    interpolate: fn(&[(f64, f64)], bool) -> Option<u16>,
) -> Option<(u16, Method, bool)> {
    let naive = naive_peak(points)?;
    if points.len() <= NAIVE_SAMPLE_LIMIT {
        return Some((naive, Method::Naive, false));
    }
    match interpolate(points, full_circle) {
        Some(bearing) => Some((bearing, Method::Pchip, false)),
        None => Some((naive, Method::Naive, true)),
    }
}

/// Degree of the strongest sample; the lowest degree wins a tie
fn naive_peak(points: &[(f64, f64)]) -> Option<u16> {
    let mut best: Option<(f64, f64)> = None;
    for &(deg, power) in points {
        if best.map_or(true, |(_, p)| power > p) {
            best = Some((deg, power));
        }
    }
    best.map(|(deg, _)| deg as u16)
}

fn pchip_peak(points: &[(f64, f64)], full_circle: bool) -> Option<u16> {
    let (x, y): (Vec<f64>, Vec<f64>) = if full_circle {
        // one copy either side keeps the ends of the circle continuous
        [-360.0, 0.0, 360.0]
            .iter()
            .flat_map(|offset| points.iter().map(move |&(deg, p)| (deg + offset, p)))
            .unzip()
    } else {
        unwrap_arc(points).into_iter().unzip()
    };
    let first = x.first().copied()?;
    let last = x.last().copied()?;
    let interpolant = Pchip::new(x, y)?;

    let (from, to) = if full_circle {
        (0, BUCKETS as i64 - 1)
    } else {
        (first.ceil() as i64, last.floor() as i64)
    };

    let mut best: Option<(i64, f64)> = None;
    for deg in from..=to {
        let value = interpolant.evaluate(deg as f64)?;
        if !value.is_finite() {
            continue;
        }
        if best.map_or(true, |(_, v)| value > v) {
            best = Some((deg, value));
        }
    }
    best.map(|(deg, _)| deg.rem_euclid(BUCKETS as i64) as u16)
}

/// Lay a partial sweep out as one increasing run of degrees, cutting the
/// circle at its widest gap so an arc across north stays contiguous
fn unwrap_arc(points: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let n = points.len();
    if n < 2 {
        return points.to_vec();
    }
    let mut cut = 0;
    let mut widest = f64::MIN;
    for i in 0..n {
        let next = points[(i + 1) % n].0;
        let gap = (next - points[i].0).rem_euclid(BUCKETS as f64);
        if gap > widest {
            widest = gap;
            cut = (i + 1) % n;
        }
    }
    let base = points[cut].0;
    (0..n)
        .map(|i| {
            let (deg, p) = points[(cut + i) % n];
            (base + (deg - base).rem_euclid(BUCKETS as f64), p)
        })
        .collect()
}
