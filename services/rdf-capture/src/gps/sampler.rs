//! Fix acquisition, periodic sampling and averaging

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use super::client::{GpsFix, GpsSource};
use crate::error::GpsError;
use crate::session::gate::Gate;

const FIX_NOTICE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsSample {
    pub timestamp: DateTime<Utc>,
    pub fix: GpsFix,
}

/// Mean position over a pass. Each error term is averaged over the samples
/// that reported it, and is `None` when none did.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AveragedFix {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub lat_err: Option<f64>,
    pub lon_err: Option<f64>,
    pub alt_err: Option<f64>,
    pub samples: usize,
}

pub struct GpsSampler<'a> {
    source: &'a mut dyn GpsSource,
    interval: Duration,
}

impl<'a> GpsSampler<'a> {
    pub fn new(source: &'a mut dyn GpsSource, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Block until the source reports a 3D fix, or `abort` is cancelled
    pub fn wait_for_fix(&mut self, abort: &Gate) -> Result<GpsFix, GpsError> {
        let started = Instant::now();
        let mut last_notice = started;
        let mut mode = 0;
        loop {
            if abort.is_cancelled() {
                return Err(GpsError::Cancelled);
            }
            match self.source.current_fix() {
                Ok(fix) if fix.has_3d_fix() => {
                    info!(
                        "3D gps fix after {:.1}s: {:.6}, {:.6} alt {:.1}m",
                        started.elapsed().as_secs_f64(),
                        fix.lat,
                        fix.lon,
                        fix.alt
                    );
                    return Ok(fix);
                }
                Ok(fix) => mode = fix.mode,
                Err(e) => debug!("gps poll failed while waiting for fix: {}", e),
            }
            if last_notice.elapsed() >= FIX_NOTICE_INTERVAL {
                warn!(
                    "Waiting {:.0}s for 3D gps fix (current mode = {})",
                    started.elapsed().as_secs_f64(),
                    mode
                );
                last_notice = Instant::now();
            }
            thread::sleep(self.interval);
        }
    }

    /// Record NMEA to `nmea`, poll every interval for `duration`, write the
    /// samples to `csv` and return their average
    pub fn sample(&mut self, duration: Duration, nmea: &Path, csv: &Path) -> Result<AveragedFix, GpsError> {
        self.source.start_recording(nmea)?;

        let started = Instant::now();
        let mut samples = Vec::new();
        let mut polls = 0u32;
        let mut failures = 0u32;
        loop {
            match self.source.current_fix() {
                Ok(fix) if fix.has_position() => samples.push(GpsSample {
                    timestamp: Utc::now(),
                    fix,
                }),
                Ok(_) => failures += 1,
                Err(e) => {
                    failures += 1;
                    warn!("gps poll failed: {}", e);
                }
            }
            polls += 1;
            let next = self.interval * polls;
            if next >= duration {
                break;
            }
            thread::sleep((started + next).saturating_duration_since(Instant::now()));
        }

        if let Err(e) = self.source.stop_recording() {
            warn!("Failed to stop NMEA recording: {}", e);
        }
        write_samples_csv(csv, &samples)?;

        info!(
            "Captured gps data for {:.2}s (expected {:.2}s): {} samples, {} without fix",
            started.elapsed().as_secs_f64(),
            duration.as_secs_f64(),
            samples.len(),
            failures
        );
        average(&samples)
    }
}

pub fn average(samples: &[GpsSample]) -> Result<AveragedFix, GpsError> {
    if samples.is_empty() {
        return Err(GpsError::NoFix);
    }
    let n = samples.len() as f64;
    Ok(AveragedFix {
        lat: samples.iter().map(|s| s.fix.lat).sum::<f64>() / n,
        lon: samples.iter().map(|s| s.fix.lon).sum::<f64>() / n,
        alt: samples.iter().map(|s| s.fix.alt).sum::<f64>() / n,
        lat_err: mean(samples.iter().filter_map(|s| s.fix.lat_err)),
        lon_err: mean(samples.iter().filter_map(|s| s.fix.lon_err)),
        alt_err: mean(samples.iter().filter_map(|s| s.fix.alt_err)),
        samples: samples.len(),
    })
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn write_samples_csv(path: &Path, samples: &[GpsSample]) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "timestamp,lat,lon,alt,lat_err,lon_err,alt_err")?;
    for sample in samples {
        let fix = &sample.fix;
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            sample.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            fix.lat,
            fix.lon,
            fix.alt,
            opt(fix.lat_err),
            opt(fix.lon_err),
            opt(fix.alt_err)
        )?;
    }
    out.flush()
}

fn opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
