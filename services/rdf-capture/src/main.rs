//! RDF Capture - rotating-antenna 802.11 direction finding
//!
//! Sweeps a motorized directional antenna while capturing beacon frames and
//! a GPS fix, then estimates the bearing of every transmitter heard.

mod capture;
mod config;
mod device;
mod error;
mod gps;
mod locate;
mod motion;
mod params;
mod session;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use capture::CaptureSupervisor;
use config::Config;
use device::{InterfaceControl, InterfaceMode, IwControl};
use error::SessionError;
use gps::GpsdClient;
use locate::{Bssid, EstimateReport, SsidForm, TsharkFrames};
use motion::{MotionController, NullPulseOutput, PulseOutput, SysfsPulseOutput};
use params::SessionParams;
use session::CaptureSession;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rdf_capture=info")),
        )
        .with_target(false)
        .init();

    info!("===========================================");
    info!("   RDF Capture - rotating antenna");
    info!("   802.11 beacon direction finding");
    info!("===========================================");

    let config = Config::from_env().context("loading configuration")?;

    info!("Configuration:");
    info!("  Interface: {}", config.params.interface().unwrap_or_default());
    info!(
        "  Sweep: {} deg from {} over {}s, {} pass(es)",
        config.params.degrees(),
        config.params.bearing(),
        config.params.duration(),
        config.passes
    );
    match config.params.channel() {
        Some(channel) => info!("  Channel: fixed at {}", channel),
        None => info!(
            "  Channel hopping: every {:.6}s, distance {}",
            config.params.hop_interval(),
            config.params.hop_distance()
        ),
    }
    if !config.params.macs().is_empty() {
        let macs: Vec<String> = config.params.macs().iter().map(Bssid::to_string).collect();
        info!("  Transmitters: {}", macs.join(", "));
    }
    if let Some(focused) = config.params.focused() {
        info!("  Focused follow-up: {} deg over {}s", focused.width, focused.duration);
    }
    info!("  Output: {}", config.output_dir.display());
    info!("  gpsd: {}", config.gpsd_addr);
    info!("  Pulse output: {}", if config.simulate { "simulated" } else { "sysfs gpio" });

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            flag.store(true, Ordering::SeqCst);
        }
    });

    info!("===========================================");
    info!("  Starting capture...");
    info!("  Press Ctrl+C to stop.");
    info!("===========================================");

    let summary = tokio::task::spawn_blocking(move || run_passes(&config, &cancel))
        .await
        .context("pass loop panicked")??;

    info!("Shutdown complete. {}", summary);
    Ok(())
}

#[derive(Debug, Default)]
struct RunSummary {
    passes: u32,
    focused: u32,
    failed: u32,
    estimates: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Passes: {} completed, {} focused, {} failed, {} bearing estimates",
            self.passes, self.focused, self.failed, self.estimates
        )
    }
}

fn run_passes(config: &Config, cancel: &AtomicBool) -> Result<RunSummary> {
    let output: Box<dyn PulseOutput> = if config.simulate {
        Box::new(NullPulseOutput::default())
    } else {
        Box::new(SysfsPulseOutput::open(&config.pins).context("opening gpio pins")?)
    };
    let mut motion = MotionController::new(output, config.motion.clone());
    let mut gps = GpsdClient::connect(&config.gpsd_addr, config.gpspipe_path.clone())
        .with_context(|| format!("connecting to gpsd at {}", config.gpsd_addr))?;
    let interface = IwControl::new();
    let capture = CaptureSupervisor::new(config.capture_config());
    let ssid_form = if config.tshark_ssid_hex { SsidForm::Hex } else { SsidForm::Text };
    let frames = TsharkFrames::new(config.tshark_path.clone()).with_ssid_form(ssid_form);
    let settings = config.session_settings();

    let mut summary = RunSummary::default();
    for pass in 1..=config.passes {
        if cancel.load(Ordering::SeqCst) {
            warn!("Interrupted, skipping remaining passes");
            break;
        }
        let mut params = config.params.clone();
        params.set_pass(pass);

        let mut session = CaptureSession::new(&settings, &mut motion, &mut gps, &interface, &capture)
            .with_frames(&frames);
        let report = match session.run(&params, cancel) {
            Ok(outcome) => {
                summary.passes += 1;
                outcome.report
            }
            Err(SessionError::Cancelled) => break,
            Err(e) => {
                error!("Pass {} failed: {}", pass, e);
                summary.failed += 1;
                continue;
            }
        };
        let Some(report) = report else { continue };
        summary.estimates += report.estimates.len();

        for (target, guess) in focus_targets(&params, &report) {
            let Some(focused) = params.focused_on(target, f64::from(guess), config.clockwise) else {
                break;
            };
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            info!("Focused pass on {} around {} deg", target, guess);
            let mut session = CaptureSession::new(&settings, &mut motion, &mut gps, &interface, &capture)
                .with_frames(&frames);
            match session.run(&focused, cancel) {
                Ok(_) => summary.focused += 1,
                Err(SessionError::Cancelled) => break,
                Err(e) => {
                    error!("Focused pass on {} failed: {}", target, e);
                    summary.failed += 1;
                }
            }
        }
    }

    if config.restore_managed {
        if let Some(iface) = config.params.interface() {
            if let Err(e) = interface.ensure_mode(iface, InterfaceMode::Managed) {
                warn!("Failed to restore {} to managed mode: {}", iface, e);
            }
        }
    }
    info!("Antenna left at motor position {:.1} deg", motion.bearing_current());
    Ok(summary)
}

/// Transmitters to revisit with a focused sweep: the allow-list members that
/// were heard, or else the strongest transmitter
fn focus_targets(params: &SessionParams, report: &EstimateReport) -> Vec<(Bssid, u16)> {
    if params.focused().is_none() {
        return Vec::new();
    }
    if params.macs().is_empty() {
        return report
            .estimates
            .first()
            .map(|e| vec![(e.transmitter, e.bearing)])
            .unwrap_or_default();
    }
    params
        .macs()
        .iter()
        .filter_map(|mac| report.get(mac).map(|e| (e.transmitter, e.bearing)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locate::{BearingEstimate, Method};
    use crate::params::FocusedSweep;

    fn estimate(last: u8, strength: i32, bearing: u16) -> BearingEstimate {
        BearingEstimate {
            transmitter: Bssid::new([0, 0, 0, 0, 0, last]),
            ssid: None,
            channel: Some(1),
            security: None,
            strength_dbm: strength,
            sample_count: 10,
            method: Method::Pchip,
            fell_back: false,
            bearing,
        }
    }

    fn report() -> EstimateReport {
        EstimateReport {
            estimates: vec![estimate(2, -40, 120), estimate(1, -55, 300)],
            ..EstimateReport::default()
        }
    }

    #[test]
    fn no_focus_without_a_focused_sweep() {
        assert!(focus_targets(&SessionParams::default(), &report()).is_empty());
    }

    #[test]
    fn focus_on_strongest_without_allow_list() {
        let mut params = SessionParams::default();
        params.set_focused(Some(FocusedSweep { width: 40.0, duration: 5.0 })).unwrap();
        assert_eq!(
            focus_targets(&params, &report()),
            vec![(Bssid::new([0, 0, 0, 0, 0, 2]), 120)]
        );
    }

    #[test]
    fn focus_on_every_heard_allow_list_member() {
        let mut params = SessionParams::default();
        params.set_focused(Some(FocusedSweep { width: 40.0, duration: 5.0 })).unwrap();
        params.add_mac("00:00:00:00:00:01").unwrap();
        params.add_mac("00:00:00:00:00:09").unwrap();
        assert_eq!(
            focus_targets(&params, &report()),
            vec![(Bssid::new([0, 0, 0, 0, 0, 1]), 300)]
        );
    }
}
