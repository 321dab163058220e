//! Configuration loaded from environment variables

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::capture::CaptureConfig;
use crate::motion::{MotionConfig, SysfsPins, TravelWindow};
use crate::params::{FocusedSweep, SessionParams};
use crate::session::SessionSettings;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Parameters of the first pass
    pub params: SessionParams,

    /// Number of sequential passes
    pub passes: u32,

    /// Root directory for capture output
    pub output_dir: PathBuf,

    /// Drive the no-op pulse output instead of GPIO
    pub simulate: bool,

    pub pins: SysfsPins,

    pub motion: MotionConfig,

    /// Positive motor travel is clockwise
    pub clockwise: bool,

    /// gpsd address (host:port)
    pub gpsd_addr: String,

    pub gps_interval_ms: u64,

    /// Warn when tasks are not ready after this long
    pub startup_timeout_ms: u64,

    /// Abort when tasks are not ready after this long
    pub ready_abort_ms: u64,

    /// Bound on dumpcap reporting its output file
    pub capture_start_timeout_ms: u64,

    /// Estimate bearings after each pass
    pub guess: bool,

    pub dumpcap_path: PathBuf,
    pub tshark_path: PathBuf,
    /// tshark prints every SSID as hex
    pub tshark_ssid_hex: bool,
    pub gpspipe_path: PathBuf,

    /// Put the interface back in managed mode on exit
    pub restore_managed: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source. Session parameters are
    /// strict; everything else falls back to its default when unset or
    /// unparsable.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = MotionConfig::default();
        let pins = SysfsPins::default();

        Ok(Self {
            params: session_params(&var)?,

            passes: match strict::<u32>(&var, "RDF_PASSES")? {
                Some(0) => bail!("RDF_PASSES must be at least 1"),
                Some(n) => n,
                None => 1,
            },

            output_dir: var("RDF_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),

            simulate: flag(&var, "RDF_SIMULATE", false),

            pins: SysfsPins {
                step: lenient(&var, "RDF_GPIO_STEP", pins.step),
                direction: lenient(&var, "RDF_GPIO_DIR", pins.direction),
                enable: lenient(&var, "RDF_GPIO_ENABLE", pins.enable),
                enable_active_low: flag(&var, "RDF_ENABLE_ACTIVE_LOW", pins.enable_active_low),
            },

            motion: MotionConfig {
                steps_per_revolution: lenient(&var, "RDF_STEPS_PER_REV", defaults.steps_per_revolution),
                microsteps: lenient(&var, "RDF_MICROSTEPS", defaults.microsteps),
                window: TravelWindow {
                    min: lenient(&var, "RDF_BEARING_MIN", defaults.window.min),
                    max: lenient(&var, "RDF_BEARING_MAX", defaults.window.max),
                },
                reset_rate: lenient(&var, "RDF_RESET_RATE", defaults.reset_rate),
                ramp: defaults.ramp,
            },

            clockwise: flag(&var, "RDF_CLOCKWISE", true),

            gpsd_addr: var("RDF_GPSD_ADDR").unwrap_or_else(|| "127.0.0.1:2947".to_string()),

            gps_interval_ms: lenient(&var, "RDF_GPS_INTERVAL_MS", 1000),

            startup_timeout_ms: lenient(&var, "RDF_STARTUP_TIMEOUT_MS", 5000),

            ready_abort_ms: lenient(&var, "RDF_READY_ABORT_MS", 60_000),

            capture_start_timeout_ms: lenient(&var, "RDF_CAPTURE_START_TIMEOUT_MS", 10_000),

            guess: flag(&var, "RDF_GUESS", true),

            dumpcap_path: var("RDF_DUMPCAP_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("dumpcap")),

            tshark_path: var("RDF_TSHARK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tshark")),

            tshark_ssid_hex: flag(&var, "RDF_TSHARK_SSID_HEX", false),

            gpspipe_path: var("RDF_GPSPIPE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("gpspipe")),

            restore_managed: flag(&var, "RDF_RESTORE_MANAGED", true),
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            output_dir: self.output_dir.clone(),
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            ready_abort: Duration::from_millis(self.ready_abort_ms),
            gps_interval: Duration::from_millis(self.gps_interval_ms.max(1)),
            guess: self.guess,
            clockwise: self.clockwise,
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            dumpcap_path: self.dumpcap_path.clone(),
            start_timeout: Duration::from_millis(self.capture_start_timeout_ms),
            ..CaptureConfig::default()
        }
    }
}

fn session_params(var: &impl Fn(&str) -> Option<String>) -> Result<SessionParams> {
    let mut params = SessionParams::default();

    let iface = var("RDF_INTERFACE").context("RDF_INTERFACE must name the wireless interface")?;
    params.set_interface(iface).context("RDF_INTERFACE")?;

    if let Some(name) = var("RDF_CAPTURE").filter(|s| !s.trim().is_empty()) {
        params.set_capture(name.trim());
    }
    if let Some(v) = strict(var, "RDF_DURATION")? {
        params.set_duration(v).context("RDF_DURATION")?;
    }
    if let Some(v) = strict(var, "RDF_DEGREES")? {
        params.set_degrees(v).context("RDF_DEGREES")?;
    }
    if let Some(v) = strict(var, "RDF_BEARING")? {
        params.set_bearing(v).context("RDF_BEARING")?;
    }
    if let Some(v) = strict(var, "RDF_HOP_INTERVAL")? {
        params.set_hop_interval(v).context("RDF_HOP_INTERVAL")?;
    }
    if let Some(v) = strict(var, "RDF_HOP_DISTANCE")? {
        params.set_hop_distance(v).context("RDF_HOP_DISTANCE")?;
    }
    if let Some(v) = strict(var, "RDF_CHANNEL")? {
        params.set_channel(Some(v)).context("RDF_CHANNEL")?;
    }
    if let Some(macs) = var("RDF_MACS") {
        for mac in macs.split(',').map(str::trim).filter(|m| !m.is_empty()) {
            params.add_mac(mac).context("RDF_MACS")?;
        }
    }
    if let Some(focused) = var("RDF_FOCUSED").filter(|s| !s.trim().is_empty()) {
        let (width, duration) = focused
            .split_once(',')
            .ok_or_else(|| anyhow!("RDF_FOCUSED should be 'width,duration', got {focused:?}"))?;
        let sweep = FocusedSweep {
            width: width.trim().parse().context("RDF_FOCUSED width")?,
            duration: duration.trim().parse().context("RDF_FOCUSED duration")?,
        };
        params.set_focused(Some(sweep)).context("RDF_FOCUSED")?;
    }

    Ok(params)
}

/// Parsed value, `None` when unset; an unparsable value is an error
fn strict<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name).filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name}={raw:?}")),
        None => Ok(None),
    }
}

fn lenient<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    var(name)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn flag(var: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    match var(name).map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
