//! Per-transmitter aggregation over one rotation
//!
//! Beacons from the same transmitter are folded into 360 one-degree
//! buckets holding the strongest received power seen at that bearing.
//! Transmitters are kept in address order so every report built from a
//! tracker comes out the same way for the same input.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use super::frame::{Beacon, Bssid, Security};

pub const BUCKETS: usize = 360;

/// dBm to milliwatts
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Bucket of a bearing: nearest whole degree, wrapped into [0, 360)
pub fn bucket_index(bearing: f64) -> usize {
    (bearing.round() as i64).rem_euclid(BUCKETS as i64) as usize
}

/// Aggregated state of one transmitter
#[derive(Debug, Clone, PartialEq)]
pub struct TransmitterState {
    pub transmitter: Bssid,
    /// First non-empty SSID seen
    pub ssid: Option<String>,
    pub security: Option<Security>,
    /// Frames folded in
    pub frames: u64,
    /// Strongest signal across all bearings
    pub max_dbm: i32,
    buckets: Vec<Option<f64>>,
    channels: BTreeMap<u32, u64>,
}

impl TransmitterState {
    pub fn new(transmitter: Bssid) -> Self {
        Self {
            transmitter,
            ssid: None,
            security: None,
            frames: 0,
            max_dbm: i32::MIN,
            buckets: vec![None; BUCKETS],
            channels: BTreeMap::new(),
        }
    }

    pub fn update(&mut self, bearing: f64, beacon: &Beacon<'_>) {
        self.frames += 1;
        self.max_dbm = self.max_dbm.max(beacon.signal_dbm);
        *self.channels.entry(beacon.channel).or_insert(0) += 1;

        if self.ssid.is_none() {
            self.ssid = beacon.ssid.filter(|s| !s.trim().is_empty()).map(str::to_string);
        }
        if self.security.is_none() {
            self.security = beacon.security.cloned();
        }

        let power = dbm_to_mw(f64::from(beacon.signal_dbm));
        let bucket = &mut self.buckets[bucket_index(bearing)];
        *bucket = Some(bucket.map_or(power, |held| held.max(power)));
    }

    /// Most frequent channel; ties go to the lowest channel number
    pub fn modal_channel(&self) -> Option<u32> {
        let mut best: Option<(u32, u64)> = None;
        for (&channel, &count) in &self.channels {
            if best.map_or(true, |(_, n)| count > n) {
                best = Some((channel, count));
            }
        }
        best.map(|(channel, _)| channel)
    }

    pub fn buckets(&self) -> &[Option<f64>] {
        &self.buckets
    }

    /// Buckets holding at least one sample
    pub fn defined(&self) -> usize {
        self.buckets.iter().filter(|b| b.is_some()).count()
    }
}

/// Transmitter tracker - manages state for every transmitter in a capture
#[derive(Debug, Default)]
pub struct TransmitterTracker {
    transmitters: BTreeMap<Bssid, TransmitterState>,
}

impl TransmitterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bearing: f64, beacon: &Beacon<'_>) -> &TransmitterState {
        let state = self.transmitters.entry(beacon.transmitter).or_insert_with(|| {
            debug!("New transmitter tracked: {}", beacon.transmitter);
            TransmitterState::new(beacon.transmitter)
        });
        state.update(bearing, beacon);
        state
    }

    pub fn get(&self, transmitter: &Bssid) -> Option<&TransmitterState> {
        self.transmitters.get(transmitter)
    }

    /// All transmitters in address order
    pub fn iter(&self) -> impl Iterator<Item = &TransmitterState> {
        self.transmitters.values()
    }

    pub fn count(&self) -> usize {
        self.transmitters.len()
    }

    pub fn stats_summary(&self) -> TrackerStats {
        TrackerStats {
            transmitters: self.transmitters.len(),
            with_ssid: self.transmitters.values().filter(|t| t.ssid.is_some()).count(),
            total_frames: self.transmitters.values().map(|t| t.frames).sum(),
            defined_buckets: self.transmitters.values().map(|t| t.defined()).sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerStats {
    pub transmitters: usize,
    pub with_ssid: usize,
    pub total_frames: u64,
    pub defined_buckets: usize,
}

impl fmt::Display for TrackerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transmitters: {} total, {} with ssid, {} frames in {} bearing buckets",
            self.transmitters, self.with_ssid, self.total_frames, self.defined_buckets
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn beacon(mac: [u8; 6], dbm: i32, channel: u32, ssid: Option<&str>) -> Beacon<'_> {
        Beacon {
            arrival_time: Utc::now(),
            transmitter: Bssid::new(mac),
            signal_dbm: dbm,
            channel,
            ssid,
            security: None,
        }
    }

    #[test]
    fn buckets_keep_the_strongest_sample() {
        let mut state = TransmitterState::new(Bssid::new([1; 6]));
        state.update(10.2, &beacon([1; 6], -60, 6, None));
        state.update(9.7, &beacon([1; 6], -50, 6, None));
        state.update(10.4, &beacon([1; 6], -70, 6, None));
        assert_eq!(state.defined(), 1);
        assert!((state.buckets()[10].unwrap() - dbm_to_mw(-50.0)).abs() < 1e-15);
        assert_eq!(state.max_dbm, -50);
        assert_eq!(state.frames, 3);
    }

    #[test]
    fn bearings_wrap_into_buckets() {
        assert_eq!(bucket_index(359.6), 0);
        assert_eq!(bucket_index(-0.4), 0);
        assert_eq!(bucket_index(-1.0), 359);
        assert_eq!(bucket_index(725.0), 5);
    }

    #[test]
    fn modal_channel_prefers_lowest_on_tie() {
        let mut state = TransmitterState::new(Bssid::new([2; 6]));
        for ch in [11, 6, 11, 6, 1] {
            state.update(0.0, &beacon([2; 6], -40, ch, None));
        }
        assert_eq!(state.modal_channel(), Some(6));
    }

    #[test]
    fn tracker_orders_by_address_and_keeps_ssid() {
        let mut tracker = TransmitterTracker::new();
        tracker.update(0.0, &beacon([9; 6], -40, 1, Some("b")));
        tracker.update(0.0, &beacon([3; 6], -40, 1, Some("a")));
        tracker.update(5.0, &beacon([3; 6], -40, 1, Some("")));
        tracker.update(6.0, &beacon([3; 6], -40, 1, Some("renamed")));
        let order: Vec<Bssid> = tracker.iter().map(|t| t.transmitter).collect();
        assert_eq!(order, vec![Bssid::new([3; 6]), Bssid::new([9; 6])]);
        assert_eq!(tracker.get(&Bssid::new([3; 6])).unwrap().ssid.as_deref(), Some("a"));

        let stats = tracker.stats_summary();
        assert_eq!(stats.transmitters, 2);
        assert_eq!(stats.total_frames, 4);
        assert_eq!(stats.defined_buckets, 4);
    }

    #[test]
    fn dbm_conversion() {
        assert!((dbm_to_mw(0.0) - 1.0).abs() < 1e-12);
        assert!((dbm_to_mw(-30.0) - 0.001).abs() < 1e-15);
    }

    #[test]
    fn power_strictly_increases_with_dbm() {
        let mut previous = dbm_to_mw(-120.0);
        for tenth in -1199..=300 {
            let power = dbm_to_mw(f64::from(tenth) / 10.0);
            assert!(power > previous, "{} dBm", f64::from(tenth) / 10.0);
            previous = power;
        }
    }
}
