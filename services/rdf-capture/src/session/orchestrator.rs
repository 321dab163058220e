//! One synchronized capture pass
//!
//! Four tasks run on named threads inside a thread scope: motion, GPS,
//! channel hopper and packet capture. Each prepares its hardware, reports
//! ready, and blocks on the start gate. Rotation additionally waits for the
//! capture-live gate so the antenna only moves while packets are recorded.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Scope};
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use super::gate::{Gate, GateWait};
use super::metadata::{write_guesses, CaptureFiles, CaptureMetadata};
use crate::capture::{CaptureReport, CaptureSupervisor};
use crate::device::{ChannelHopper, InterfaceControl, InterfaceMode};
use crate::error::{InterfaceError, ParamError, SessionError};
use crate::gps::{AveragedFix, GpsSampler, GpsSource};
use crate::locate::{estimate, EstimateReport, FrameSource, RotationWindow};
use crate::motion::{MotionController, PulseOutput, RotationResult};
use crate::params::SessionParams;

const READY_POLL: Duration = Duration::from_millis(100);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
/// Slack on top of the capture start bound before rotation gives up
const LIVE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Motion,
    Gps,
    ChannelHopper,
    Capture,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Motion,
        TaskKind::Gps,
        TaskKind::ChannelHopper,
        TaskKind::Capture,
    ];

    fn thread_name(self) -> &'static str {
        match self {
            TaskKind::Motion => "rdf-motion",
            TaskKind::Gps => "rdf-gps",
            TaskKind::ChannelHopper => "rdf-hopper",
            TaskKind::Capture => "rdf-capture",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskKind::Motion => "motion",
            TaskKind::Gps => "gps",
            TaskKind::ChannelHopper => "channel hopper",
            TaskKind::Capture => "capture",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready(TaskKind),
    Failed(TaskKind),
}

enum ReadyAbort {
    Failed(TaskKind),
    TimedOut(Vec<TaskKind>),
    Cancelled,
}

/// Settings that stay fixed across passes
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub output_dir: PathBuf,
    /// Warn when tasks are not ready after this long
    pub startup_timeout: Duration,
    /// Abort when tasks are not ready after this long
    pub ready_abort: Duration,
    pub gps_interval: Duration,
    /// Estimate bearings after each pass
    pub guess: bool,
    /// Positive motor travel turns the antenna clockwise
    pub clockwise: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            startup_timeout: Duration::from_secs(5),
            ready_abort: Duration::from_secs(60),
            gps_interval: Duration::from_secs(1),
            guess: true,
            clockwise: true,
        }
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub metadata: CaptureMetadata,
    /// Present when guessing is enabled and estimation succeeded
    pub report: Option<EstimateReport>,
}

/// Borrowed hardware for one pass
pub struct CaptureSession<'a, O: PulseOutput> {
    settings: &'a SessionSettings,
    motion: &'a mut MotionController<O>,
    gps: &'a mut dyn GpsSource,
    interface: &'a dyn InterfaceControl,
    capture: &'a CaptureSupervisor,
    frames: Option<&'a dyn FrameSource>,
}

impl<'a, O: PulseOutput> CaptureSession<'a, O> {
    pub fn new(
        settings: &'a SessionSettings,
        motion: &'a mut MotionController<O>,
        gps: &'a mut dyn GpsSource,
        interface: &'a dyn InterfaceControl,
        capture: &'a CaptureSupervisor,
    ) -> Self {
        Self {
            settings,
            motion,
            gps,
            interface,
            capture,
            frames: None,
        }
    }

    /// Decode each pass's capture with `frames` for bearing estimation
    pub fn with_frames(mut self, frames: &'a dyn FrameSource) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Run one pass. `cancel` aborts the pass if raised before the start
    /// signal; later it is ignored and the pass runs to completion.
    pub fn run(&mut self, params: &SessionParams, cancel: &AtomicBool) -> Result<SessionOutcome, SessionError> {
        let began = Instant::now();
        let iface = self.validate(params)?;
        if cancel.load(Ordering::SeqCst) {
            return Err(SessionError::Cancelled);
        }

        let files = CaptureFiles::create(&self.settings.output_dir, params.capture(), params.pass())?;
        info!("========================================");
        info!("Capture pass {} of '{}'", params.pass(), params.capture());
        info!("  Interface: {}", iface);
        info!("  Sweep: {:.1} deg from {:.1} over {:.1}s", params.degrees(), params.bearing(), params.duration());
        info!("  Output: {}", files.dir.display());
        info!("========================================");

        let result = self.execute(params, &iface, &files, cancel, began);
        if let Err(e) = &result {
            error!("Capture pass failed: {}", e);
            files.discard();
        }
        result
    }

    fn validate(&self, params: &SessionParams) -> Result<String, SessionError> {
        params.validate()?;
        let iface = params
            .interface()
            .ok_or(ParamError::Missing("interface"))?
            .to_string();
        if !self.interface.interfaces()?.contains(&iface) {
            return Err(ParamError::Interface(iface).into());
        }
        let window = self.motion.config().window;
        if params.degrees().abs() > window.span() {
            return Err(ParamError::SweepExceedsWindow {
                degrees: params.degrees(),
                min: window.min,
                max: window.max,
            }
            .into());
        }
        Ok(iface)
    }

    fn execute(
        &mut self,
        params: &SessionParams,
        iface: &str,
        files: &CaptureFiles,
        cancel: &AtomicBool,
        began: Instant,
    ) -> Result<SessionOutcome, SessionError> {
        let settings = self.settings;
        let capture = self.capture;
        let interface = self.interface;
        let frames = self.frames;
        let motion = &mut *self.motion;
        let gps = &mut *self.gps;

        let start = Gate::new("start");
        let live = Gate::new("capture-live");
        let monitor = Gate::new("monitor-mode");
        let duration = params.duration_std();
        // the motor counts bearings in its own travel direction
        let target = motor_position(params.bearing(), settings.clockwise);
        let degrees = params.degrees();

        thread::scope(|scope| {
            let result = (|| -> Result<SessionOutcome, SessionError> {
                let (ready_tx, ready_rx) = bounded(TaskKind::ALL.len());

                let live_timeout = capture.start_timeout() + LIVE_GRACE;
                let live_ref = &live;
                let motion_rx = spawn_task(
                    scope,
                    TaskKind::Motion,
                    ready_tx.clone(),
                    &start,
                    move || {
                        motion.reset_to(target, degrees)?;
                        Ok(motion)
                    },
                    move |motion| match live_ref.wait_timeout(live_timeout) {
                        GateWait::Opened => Ok(motion.rotate(degrees, duration)?),
                        GateWait::Cancelled => Err(SessionError::CaptureFailure(
                            "capture never went live, rotation skipped".to_string(),
                        )),
                        GateWait::TimedOut => Err(SessionError::CaptureFailure(format!(
                            "capture not live after {live_timeout:?}, rotation skipped"
                        ))),
                    },
                )?;

                let start_ref = &start;
                let gps_rx = spawn_task(
                    scope,
                    TaskKind::Gps,
                    ready_tx.clone(),
                    &start,
                    move || {
                        let mut sampler = GpsSampler::new(gps, settings.gps_interval);
                        sampler.wait_for_fix(start_ref)?;
                        Ok(sampler)
                    },
                    move |mut sampler| Ok(sampler.sample(duration, &files.nmea, &files.gps_csv)?),
                )?;

                // the hopper alone switches the interface mode
                let monitor_ref = &monitor;
                let hopper_rx = spawn_task(
                    scope,
                    TaskKind::ChannelHopper,
                    ready_tx.clone(),
                    &start,
                    move || {
                        let hopper = ChannelHopper::new(interface, iface, params);
                        match hopper.prepare() {
                            Ok(()) => {
                                monitor_ref.open();
                                Ok(hopper)
                            }
                            Err(e) => {
                                monitor_ref.cancel();
                                Err(e.into())
                            }
                        }
                    },
                    move |hopper| {
                        let stats = hopper.run(duration);
                        Ok((stats.get_hops(), stats.get_failures()))
                    },
                )?;

                let capture_rx = spawn_task(
                    scope,
                    TaskKind::Capture,
                    ready_tx,
                    &start,
                    move || {
                        capture.prepare()?;
                        await_monitor(monitor_ref, interface, iface, settings.ready_abort)
                    },
                    move |()| Ok(capture.run(iface, duration, &files.pcap, live_ref)?),
                )?;

                match await_ready(&ready_rx, cancel, settings) {
                    Ok(()) => {}
                    Err(ReadyAbort::Cancelled) => return Err(SessionError::Cancelled),
                    Err(ReadyAbort::TimedOut(pending)) => {
                        return Err(SessionError::HardwareTimeout {
                            pending,
                            timeout: settings.ready_abort,
                        })
                    }
                    Err(ReadyAbort::Failed(kind)) => {
                        let failure = match kind {
                            TaskKind::Motion => take(kind, &motion_rx).map(|_| ()),
                            TaskKind::Gps => take(kind, &gps_rx).map(|_| ()),
                            TaskKind::ChannelHopper => take(kind, &hopper_rx).map(|_| ()),
                            TaskKind::Capture => take(kind, &capture_rx).map(|_| ()),
                        };
                        return Err(failure.err().unwrap_or_else(|| SessionError::TaskFailed {
                            task: kind,
                            reason: "reported failure without an error".to_string(),
                        }));
                    }
                }

                start.open();
                info!("All tasks ready, starting {:.1}s pass", duration.as_secs_f64());
                wait_out(duration, cancel);

                let rotation = take(TaskKind::Motion, &motion_rx);
                let fix = take(TaskKind::Gps, &gps_rx);
                let report = take(TaskKind::Capture, &capture_rx);
                // a failed capture also aborts the rotation; report the cause
                let report: CaptureReport = report?;
                let rotation: RotationResult = rotation?;
                let fix: AveragedFix = fix?;
                info!(
                    "Rotation {:.3}s, {} pulses at {:?} (expected {:?})",
                    (rotation.end_time - rotation.start_time).num_milliseconds() as f64 / 1e3,
                    rotation.pulses,
                    rotation.measured_pulse_interval,
                    rotation.expected_pulse_interval
                );

                let mut metadata = CaptureMetadata {
                    params: params.clone(),
                    files: files.clone(),
                    rotation,
                    fix,
                    counts: report.counts,
                    elapsed: Duration::ZERO,
                    guess_file: None,
                    guess_count: None,
                    guess_duration: None,
                };

                let mut estimates = None;
                if let Some(frames) = frames.filter(|_| settings.guess) {
                    let guess_started = Instant::now();
                    match guess(frames, &metadata, settings.clockwise) {
                        Ok(report) => {
                            metadata.guess_file = Some(files.guess.clone());
                            metadata.guess_count = Some(report.estimates.len());
                            metadata.guess_duration = Some(guess_started.elapsed());
                            estimates = Some(report);
                        }
                        Err(e) => warn!("Bearing estimation skipped: {:#}", e),
                    }
                }

                match take(TaskKind::ChannelHopper, &hopper_rx) {
                    Ok((hops, failures)) => debug!("Channel hopper: {} hops, {} failures", hops, failures),
                    Err(e) => warn!("Channel hopper: {}", e),
                }

                metadata.elapsed = began.elapsed();
                metadata.write(&files.metadata)?;
                info!(
                    "Pass {} complete in {:.2}s: {} packets ({} dropped), {} samples at {:.6}, {:.6}",
                    params.pass(),
                    metadata.elapsed.as_secs_f64(),
                    metadata.counts.captured,
                    metadata.counts.dropped,
                    metadata.fix.samples,
                    metadata.fix.lat,
                    metadata.fix.lon
                );
                Ok(SessionOutcome {
                    metadata,
                    report: estimates,
                })
            })();

            // release anything still parked on a gate so the scope can join
            start.cancel();
            live.cancel();
            monitor.cancel();
            result
        })
    }
}

/// Spawn a task that runs `setup`, reports readiness, waits for `start`
/// and then runs `run`. Its result arrives on the returned channel.
fn spawn_task<'scope, S, T, Setup, Run>(
    scope: &'scope Scope<'scope, '_>,
    kind: TaskKind,
    ready: Sender<Readiness>,
    start: &'scope Gate,
    setup: Setup,
    run: Run,
) -> Result<Receiver<Result<T, SessionError>>, SessionError>
where
    Setup: FnOnce() -> Result<S, SessionError> + Send + 'scope,
    Run: FnOnce(S) -> Result<T, SessionError> + Send + 'scope,
    T: Send + 'scope,
{
    let (result_tx, result_rx) = bounded(1);
    thread::Builder::new()
        .name(kind.thread_name().to_string())
        .spawn_scoped(scope, move || {
            let outcome = match setup() {
                Ok(state) => {
                    info!("{} ready", kind);
                    let _ = ready.send(Readiness::Ready(kind));
                    match start.wait() {
                        GateWait::Opened => run(state),
                        _ => Err(SessionError::Cancelled),
                    }
                }
                Err(e) => {
                    error!("{} setup failed: {}", kind, e);
                    let _ = ready.send(Readiness::Failed(kind));
                    Err(e)
                }
            };
            if let Err(e) = &outcome {
                debug!("{} finished with error: {}", kind, e);
            }
            let _ = result_tx.send(outcome);
        })?;
    Ok(result_rx)
}

/// Motor position that points the antenna at magnetic `bearing`
fn motor_position(bearing: f64, clockwise: bool) -> f64 {
    if clockwise {
        bearing
    } else {
        -bearing
    }
}

/// Wait for the hopper to put `iface` in monitor mode, then confirm it
fn await_monitor(
    monitor: &Gate,
    interface: &dyn InterfaceControl,
    iface: &str,
    timeout: Duration,
) -> Result<(), SessionError> {
    match monitor.wait_timeout(timeout) {
        GateWait::Opened => {}
        GateWait::Cancelled => {
            return Err(SessionError::TaskFailed {
                task: TaskKind::ChannelHopper,
                reason: format!("{iface} was not put in monitor mode"),
            })
        }
        GateWait::TimedOut => {
            return Err(SessionError::CaptureFailure(format!(
                "{iface} not in monitor mode after {timeout:?}"
            )))
        }
    }
    let mode = interface.mode(iface)?;
    if mode != InterfaceMode::Monitor {
        return Err(InterfaceError::ModeNotApplied {
            iface: iface.to_string(),
            requested: InterfaceMode::Monitor.to_string(),
            actual: mode.to_string(),
        }
        .into());
    }
    Ok(())
}

fn take<T>(kind: TaskKind, rx: &Receiver<Result<T, SessionError>>) -> Result<T, SessionError> {
    rx.recv().unwrap_or_else(|_| {
        Err(SessionError::TaskFailed {
            task: kind,
            reason: "exited without a result".to_string(),
        })
    })
}

fn await_ready(
    ready: &Receiver<Readiness>,
    cancel: &AtomicBool,
    settings: &SessionSettings,
) -> Result<(), ReadyAbort> {
    let started = Instant::now();
    let mut pending = TaskKind::ALL.to_vec();
    let mut warned = false;

    while !pending.is_empty() {
        if cancel.load(Ordering::SeqCst) {
            warn!("Interrupted while waiting for {:?}", pending);
            return Err(ReadyAbort::Cancelled);
        }
        let waited = started.elapsed();
        if waited >= settings.ready_abort {
            error!("Tasks not ready after {:?}: {:?}", waited, pending);
            return Err(ReadyAbort::TimedOut(pending));
        }
        if !warned && waited >= settings.startup_timeout {
            warn!("Still waiting on {:?} after {:.1}s", pending, waited.as_secs_f64());
            warned = true;
        }

        match ready.recv_timeout(READY_POLL) {
            Ok(Readiness::Ready(kind)) => pending.retain(|k| *k != kind),
            Ok(Readiness::Failed(kind)) => return Err(ReadyAbort::Failed(kind)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Err(ReadyAbort::TimedOut(pending)),
        }
    }
    debug!("All tasks ready after {:?}", started.elapsed());
    Ok(())
}

/// Sleep through the pass, logging progress
fn wait_out(duration: Duration, cancel: &AtomicBool) {
    let started = Instant::now();
    let mut noted_cancel = false;
    loop {
        let elapsed = started.elapsed();
        if elapsed >= duration {
            break;
        }
        if !noted_cancel && cancel.load(Ordering::SeqCst) {
            warn!("Interrupt after start ignored, the pass runs to completion");
            noted_cancel = true;
        }
        thread::sleep((duration - elapsed).min(PROGRESS_INTERVAL));
        let elapsed = started.elapsed();
        if elapsed < duration {
            info!("{:.0}s of {:.0}s", elapsed.as_secs_f64(), duration.as_secs_f64());
        }
    }
}

fn guess(frames: &dyn FrameSource, metadata: &CaptureMetadata, clockwise: bool) -> anyhow::Result<EstimateReport> {
    let window = RotationWindow::from_metadata(metadata, clockwise)?;
    let records = frames
        .frames(&metadata.files.pcap, metadata.params.macs())
        .context("decoding capture")?;
    let report = estimate(&records, &window, metadata.params.macs());
    write_guesses(&metadata.files.guess, &report).context("writing guess file")?;
    for e in report.estimates.iter().take(5) {
        info!(
            "  {} {:<24} ch {:>3} {:>4} dBm -> {:>3} deg ({})",
            e.transmitter,
            e.ssid.as_deref().unwrap_or("<hidden>"),
            e.channel.map(|c| c.to_string()).unwrap_or_default(),
            e.strength_dbm,
            e.bearing,
            e.method
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use chrono::Utc;

    use crate::capture::CaptureConfig;
    use crate::error::{DecodeError, GpsError, InterfaceError};
    use crate::gps::GpsFix;
    use crate::locate::{Bssid, FrameRecord, Method};
    use crate::params::FocusedSweep;
    use crate::motion::{MotionConfig, NullPulseOutput};

    struct FakeGps {
        fix: GpsFix,
    }

    impl GpsSource for FakeGps {
        fn current_fix(&mut self) -> Result<GpsFix, GpsError> {
            Ok(self.fix)
        }

        fn start_recording(&mut self, path: &Path) -> Result<(), GpsError> {
            std::fs::write(path, b"$GPGGA\n")?;
            Ok(())
        }

        fn stop_recording(&mut self) -> Result<(), GpsError> {
            Ok(())
        }
    }

    fn gps(mode: u8) -> FakeGps {
        FakeGps {
            fix: GpsFix {
                mode,
                lat: 47.6,
                lon: -122.3,
                alt: 12.0,
                lat_err: Some(3.0),
                lon_err: Some(4.0),
                alt_err: None,
            },
        }
    }

    /// Mode switches take a while, like `ip link down` / `iw` / `ip link up`
    struct FakeInterface {
        mode: Mutex<InterfaceMode>,
        switches: AtomicU32,
    }

    impl FakeInterface {
        fn new() -> Self {
            Self {
                mode: Mutex::new(InterfaceMode::Managed),
                switches: AtomicU32::new(0),
            }
        }
    }

    impl InterfaceControl for FakeInterface {
        fn interfaces(&self) -> Result<Vec<String>, InterfaceError> {
            Ok(vec!["wlan0".into()])
        }

        fn mode(&self, _iface: &str) -> Result<InterfaceMode, InterfaceError> {
            Ok(*self.mode.lock().unwrap())
        }

        fn set_mode(&self, _iface: &str, mode: InterfaceMode) -> Result<(), InterfaceError> {
            self.switches.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            *self.mode.lock().unwrap() = mode;
            Ok(())
        }

        fn channel(&self, _iface: &str) -> Result<Option<u32>, InterfaceError> {
            Ok(Some(1))
        }

        fn set_channel(&self, _iface: &str, _channel: u32) -> Result<(), InterfaceError> {
            Ok(())
        }
    }

    /// One beacon heard as the rotation ended
    struct FakeFrames;

    impl FrameSource for FakeFrames {
        fn frames(&self, _pcap: &Path, _macs: &[Bssid]) -> Result<Vec<FrameRecord>, DecodeError> {
            Ok(vec![FrameRecord {
                arrival_time: Some(Utc::now()),
                transmitter: Some(Bssid::new([2, 0, 0, 0, 0, 1])),
                ssid: Some("lab".into()),
                signal_dbm: Some(-40),
                channel: Some(6),
                security: None,
            }])
        }
    }

    fn settings(root: &Path) -> SessionSettings {
        SessionSettings {
            output_dir: root.to_path_buf(),
            startup_timeout: Duration::from_millis(200),
            ready_abort: Duration::from_secs(5),
            gps_interval: Duration::from_millis(20),
            guess: true,
            clockwise: true,
        }
    }

    fn params(duration: f64, degrees: f64) -> SessionParams {
        let mut params = SessionParams::default();
        params.set_capture("test");
        params.set_interface("wlan0").unwrap();
        params.set_duration(duration).unwrap();
        params.set_degrees(degrees).unwrap();
        params.set_hop_interval(0.05).unwrap();
        params
    }

    fn motion() -> MotionController<NullPulseOutput> {
        MotionController::new(
            NullPulseOutput::default(),
            MotionConfig {
                steps_per_revolution: 200,
                microsteps: 1,
                ..MotionConfig::default()
            },
        )
    }

    #[cfg(unix)]
    fn fake_dumpcap() -> CaptureSupervisor {
        CaptureSupervisor::new(CaptureConfig {
            dumpcap_path: PathBuf::from("sh"),
            leading_args: vec![
                "-c".into(),
                r#"echo "File: $9" >&2
: > "$9"
sleep 0.6
echo "Packets received/dropped on interface '$2': 10/0 (pcap:0/dumpcap:0/flushed:0/ps_ifdrop:0) (100.0%)" >&2"#
                    .into(),
                "dumpcap".into(),
            ],
            buffer_mib: 12,
            start_timeout: Duration::from_secs(5),
        })
    }

    #[cfg(unix)]
    #[test]
    fn full_pass_records_metadata_and_guesses() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let mut motion = motion();
        let mut gps = gps(3);
        let iface = FakeInterface::new();
        let capture = fake_dumpcap();
        let frames = FakeFrames;
        let params = params(0.5, 90.0);

        let before = Utc::now();
        let outcome = CaptureSession::new(&settings, &mut motion, &mut gps, &iface, &capture)
            .with_frames(&frames)
            .run(&params, &AtomicBool::new(false))
            .unwrap();
        let after = Utc::now();

        let meta = &outcome.metadata;
        assert!(meta.rotation.start_time >= before);
        assert!(meta.rotation.end_time <= after);
        assert!(meta.rotation.end_time > meta.rotation.start_time);
        assert_eq!(meta.rotation.pulses, 50);
        assert_eq!(meta.counts.captured, 10);
        assert!(meta.fix.samples > 0);
        assert!((meta.fix.lat - 47.6).abs() < 1e-9);
        assert!((motion.bearing_current() - 90.0).abs() < 1e-9);
        assert_eq!(*iface.mode.lock().unwrap(), InterfaceMode::Monitor);

        assert!(meta.files.metadata.is_file());
        assert!(meta.files.gps_csv.is_file());
        let report = outcome.report.unwrap();
        assert_eq!(report.estimates.len(), 1);
        assert_eq!(meta.guess_count, Some(1));
        assert!(meta.files.guess.is_file());
    }

    #[cfg(unix)]
    #[test]
    fn cancel_before_start_discards_files() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let mut motion = motion();
        // never reaches a 3D fix, so the pass stays in startup
        let mut gps = gps(2);
        let iface = FakeInterface::new();
        let capture = fake_dumpcap();
        let params = params(0.5, 90.0);
        let cancel = AtomicBool::new(false);

        let result = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(300));
                cancel.store(true, Ordering::SeqCst);
            });
            CaptureSession::new(&settings, &mut motion, &mut gps, &iface, &capture).run(&params, &cancel)
        });

        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert!(!root.path().join("test").exists());
    }

    #[cfg(unix)]
    #[test]
    fn interface_mode_is_switched_once_per_pass() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let mut motion = motion();
        let mut gps = gps(3);
        let iface = FakeInterface::new();
        let capture = fake_dumpcap();

        CaptureSession::new(&settings, &mut motion, &mut gps, &iface, &capture)
            .run(&params(0.3, 45.0), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(iface.switches.load(Ordering::SeqCst), 1);
        assert_eq!(*iface.mode.lock().unwrap(), InterfaceMode::Monitor);
    }

    #[cfg(unix)]
    #[test]
    fn counter_clockwise_focused_pass_covers_the_guess() {
        let root = tempfile::tempdir().unwrap();
        let settings = SessionSettings {
            clockwise: false,
            ..settings(root.path())
        };
        let mut motion = MotionController::new(
            NullPulseOutput::default(),
            MotionConfig {
                steps_per_revolution: 200,
                microsteps: 1,
                reset_rate: 400.0,
                ..MotionConfig::default()
            },
        );
        let mut gps = gps(3);
        let iface = FakeInterface::new();
        let capture = fake_dumpcap();
        let frames = FakeFrames;

        let mut wide = params(0.5, 360.0);
        wide.set_focused(Some(FocusedSweep { width: 40.0, duration: 0.5 })).unwrap();
        let target = Bssid::new([2, 0, 0, 0, 0, 1]);
        let focused = wide.focused_on(target, 100.0, false).unwrap();
        assert!((focused.bearing() - 120.0).abs() < 1e-9);

        let outcome = CaptureSession::new(&settings, &mut motion, &mut gps, &iface, &capture)
            .with_frames(&frames)
            .run(&focused, &AtomicBool::new(false))
            .unwrap();

        // motor reset to -120 (magnetic 120), then swept forward to -80 (magnetic 80)
        assert!((motion.bearing_current() - -80.0).abs() < 1e-9);
        let window = RotationWindow::from_metadata(&outcome.metadata, false).unwrap();
        let rotation = &outcome.metadata.rotation;
        assert!((window.bearing_at(rotation.start_time) - 120.0).abs() < 1e-9);
        assert!((window.bearing_at(rotation.end_time) - 80.0).abs() < 1e-9);

        // the only beacon arrives after the sweep ends, at magnetic 80
        let report = outcome.report.unwrap();
        assert_eq!(report.estimates[0].transmitter, target);
        assert_eq!(report.estimates[0].bearing, 80);
        assert_eq!(report.estimates[0].method, Method::Naive);
    }

    #[cfg(unix)]
    #[test]
    fn task_that_never_gets_ready_times_out() {
        let root = tempfile::tempdir().unwrap();
        let settings = SessionSettings {
            startup_timeout: Duration::from_millis(100),
            ready_abort: Duration::from_millis(400),
            ..settings(root.path())
        };
        let mut motion = motion();
        // 2D fixes only, so the gps task never reports ready
        let mut gps = gps(2);
        let iface = FakeInterface::new();
        let capture = fake_dumpcap();

        let started = Instant::now();
        let result = CaptureSession::new(&settings, &mut motion, &mut gps, &iface, &capture)
            .run(&params(0.5, 90.0), &AtomicBool::new(false));

        match result {
            Err(SessionError::HardwareTimeout { pending, timeout }) => {
                assert_eq!(pending, vec![TaskKind::Gps]);
                assert_eq!(timeout, Duration::from_millis(400));
            }
            other => panic!("expected a hardware timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!root.path().join("test").exists());
        assert_eq!(motion.output().pulses(), 0);
    }

    #[test]
    fn unknown_interface_is_rejected_before_any_task() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let mut motion = motion();
        let mut gps = gps(3);
        let iface = FakeInterface::new();
        let capture = CaptureSupervisor::new(CaptureConfig::default());
        let mut params = params(0.5, 90.0);
        params.set_interface("wlan9").unwrap();

        let result = CaptureSession::new(&settings, &mut motion, &mut gps, &iface, &capture)
            .run(&params, &AtomicBool::new(false));
        assert!(matches!(
            result,
            Err(SessionError::ParameterValidation(ParamError::Interface(_)))
        ));
        assert!(!root.path().join("test").exists());
        assert_eq!(motion.output().pulses(), 0);
    }

    #[test]
    fn oversized_sweep_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let mut motion = motion();
        let mut gps = gps(3);
        let iface = FakeInterface::new();
        let capture = CaptureSupervisor::new(CaptureConfig::default());
        let params = params(0.5, 1440.0);

        let result = CaptureSession::new(&settings, &mut motion, &mut gps, &iface, &capture)
            .run(&params, &AtomicBool::new(false));
        assert!(matches!(
            result,
            Err(SessionError::ParameterValidation(ParamError::SweepExceedsWindow { .. }))
        ));
    }

    #[test]
    fn missing_tool_fails_the_pass_during_setup() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let mut motion = motion();
        let mut gps = gps(3);
        let iface = FakeInterface::new();
        let capture = CaptureSupervisor::new(CaptureConfig {
            dumpcap_path: PathBuf::from("no-such-dumpcap-here"),
            ..CaptureConfig::default()
        });
        let params = params(0.5, 90.0);

        let result = CaptureSession::new(&settings, &mut motion, &mut gps, &iface, &capture)
            .run(&params, &AtomicBool::new(false));
        assert!(matches!(result, Err(SessionError::CaptureFailure(_))));
        assert!(!root.path().join("test").exists());
    }
}
