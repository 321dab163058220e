//! Channel hopping across the 2.4 GHz band

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::interface::{InterfaceControl, InterfaceMode};
use crate::error::InterfaceError;
use crate::params::SessionParams;

/// IEEE 802.11b/g channels usable everywhere
pub const IEEE80211BG: [u32; 11] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

/// Hop counters (atomic so a progress logger can read them mid-pass)
#[derive(Debug, Default)]
pub struct HopStats {
    hops: AtomicU64,
    failures: AtomicU64,
}

impl HopStats {
    pub fn record_hop(&self) {
        self.hops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_hops(&self) -> u64 {
        self.hops.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

pub struct ChannelHopper<'a> {
    control: &'a dyn InterfaceControl,
    iface: String,
    interval: Duration,
    distance: u32,
    fixed: Option<u32>,
    channels: &'static [u32],
    stats: HopStats,
}

impl<'a> ChannelHopper<'a> {
    pub fn new(control: &'a dyn InterfaceControl, iface: &str, params: &SessionParams) -> Self {
        Self {
            control,
            iface: iface.to_string(),
            interval: params.hop_interval_std(),
            distance: params.hop_distance(),
            fixed: params.channel(),
            channels: &IEEE80211BG,
            stats: HopStats::default(),
        }
    }

    /// Channel of the `hop`-th hop, stepping `distance` entries through the list
    pub fn channel_at(&self, hop: u64) -> u32 {
        let len = self.channels.len() as u64;
        let index = hop.wrapping_mul(u64::from(self.distance)) % len;
        self.channels[index as usize]
    }

    /// Put the interface in monitor mode on its first channel
    pub fn prepare(&self) -> Result<(), InterfaceError> {
        self.control.ensure_mode(&self.iface, InterfaceMode::Monitor)?;
        let channel = self.fixed.unwrap_or_else(|| self.channel_at(0));
        self.control.set_channel(&self.iface, channel)?;
        debug!("{} ready on channel {}", self.iface, channel);
        Ok(())
    }

    /// Hop for `duration`. Individual hop failures are counted, not fatal.
    pub fn run(&self, duration: Duration) -> &HopStats {
        if let Some(channel) = self.fixed {
            info!("Channel fixed at {}, not hopping", channel);
            return &self.stats;
        }

        let hops = (duration.as_secs_f64() / self.interval.as_secs_f64()).round() as u64;
        let started = Instant::now();
        for hop in 0..hops {
            let due = started + self.interval.mul_f64(hop as f64);
            thread::sleep(due.saturating_duration_since(Instant::now()));
            let channel = self.channel_at(hop);
            match self.control.set_channel(&self.iface, channel) {
                Ok(()) => self.stats.record_hop(),
                Err(e) => {
                    if self.stats.get_failures() == 0 {
                        warn!("Channel hop to {} failed: {}", channel, e);
                    }
                    self.stats.record_failure();
                }
            }
        }

        info!(
            "Channel hopping done in {:.2}s: {} hops, {} failures",
            started.elapsed().as_secs_f64(),
            self.stats.get_hops(),
            self.stats.get_failures()
        );
        &self.stats
    }
}
