//! dumpcap process supervision

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::session::gate::Gate;

/// dumpcap prints this once the output file is open and packets are flowing
const START_MARKER: &str = "File:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketCounts {
    pub captured: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureReport {
    pub counts: PacketCounts,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// dumpcap configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub dumpcap_path: PathBuf,
    /// Arguments placed before dumpcap's own, for launchers such as `sudo dumpcap`
    pub leading_args: Vec<String>,
    /// Kernel capture buffer in MiB
    pub buffer_mib: u32,
    pub start_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            dumpcap_path: PathBuf::from("dumpcap"),
            leading_args: Vec::new(),
            buffer_mib: 12,
            start_timeout: Duration::from_secs(10),
        }
    }
}

pub struct CaptureSupervisor {
    config: CaptureConfig,
}

impl CaptureSupervisor {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    pub fn start_timeout(&self) -> Duration {
        self.config.start_timeout
    }

    fn tool(&self) -> String {
        self.config.dumpcap_path.display().to_string()
    }

    /// Check the capture tool is installed
    pub fn prepare(&self) -> Result<PathBuf, CaptureError> {
        find_tool(&self.config.dumpcap_path)
            .ok_or_else(|| CaptureError::ToolMissing(self.config.dumpcap_path.clone()))
    }

    pub fn command(&self, iface: &str, duration: Duration, output: &Path) -> Command {
        // one extra second so the motion task never outlives the capture
        let autostop = duration.as_secs_f64().ceil() as u64 + 1;
        let mut cmd = Command::new(&self.config.dumpcap_path);
        cmd.args(&self.config.leading_args)
            .arg("-i")
            .arg(iface)
            .arg("-B")
            .arg(self.config.buffer_mib.to_string())
            .arg("-q")
            .arg("-a")
            .arg(format!("duration:{autostop}"))
            .arg("-w")
            .arg(output);
        cmd
    }

    /// Capture for `duration`, opening `live` once dumpcap reports the
    /// output file. `live` is cancelled on every failure before that point.
    pub fn run(
        &self,
        iface: &str,
        duration: Duration,
        output: &Path,
        live: &Gate,
    ) -> Result<CaptureReport, CaptureError> {
        let result = self.supervise(iface, duration, output, live);
        if result.is_err() {
            live.cancel();
        }
        result
    }

    fn supervise(
        &self,
        iface: &str,
        duration: Duration,
        output: &Path,
        live: &Gate,
    ) -> Result<CaptureReport, CaptureError> {
        let tool = self.tool();
        let mut cmd = self.command(iface, duration, output);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        info!("Executing: {:?}", cmd);
        let started_at = Utc::now();
        let mut child = cmd
            .spawn()
            .map_err(|source| CaptureError::Spawn { tool: tool.clone(), source })?;

        let stderr = match child.stderr.take() {
            Some(stderr) => stderr,
            None => {
                stop(&mut child);
                return Err(CaptureError::Spawn {
                    tool,
                    source: std::io::Error::other("stderr was not captured"),
                });
            }
        };

        // stderr reader: logs every line and forwards it for marker/count parsing
        let (line_tx, line_rx) = unbounded::<String>();
        let reader = thread::Builder::new()
            .name("rdf-dumpcap-stderr".to_string())
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        info!("[dumpcap] {}", trimmed);
                    }
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            });
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                stop(&mut child);
                return Err(CaptureError::Io(e));
            }
        };

        let timeout = self.config.start_timeout;
        let deadline = Instant::now() + timeout;
        let mut transcript = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match line_rx.recv_timeout(remaining) {
                Ok(line) => {
                    let started = line.trim_start().starts_with(START_MARKER);
                    transcript.push(line);
                    if started {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("No capture start from {} after {:?}, stopping it", tool, timeout);
                    stop(&mut child);
                    return Err(CaptureError::NoStartMarker { tool, timeout });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let status = child.wait()?;
                    let _ = reader.join();
                    warn!("{} exited ({}) before the capture started", tool, status);
                    return Err(CaptureError::NoStartMarker { tool, timeout });
                }
            }
        }

        live.open();
        let live_at = Instant::now();
        info!("Capture live on {} -> {}", iface, output.display());

        // dumpcap closes stderr on exit
        transcript.extend(line_rx.iter());
        let status = child.wait()?;
        let _ = reader.join();
        let ended_at = Utc::now();

        info!(
            "Captured packets for {:.2}s (expected {:.2}s)",
            live_at.elapsed().as_secs_f64(),
            duration.as_secs_f64()
        );

        let counts = transcript
            .iter()
            .rev()
            .find_map(|line| parse_packet_counts(line))
            .ok_or_else(|| CaptureError::Counts {
                tool: tool.clone(),
                status: status.to_string(),
            })?;
        if counts.dropped > 0 {
            warn!("{} dropped {} of {} packets", tool, counts.dropped, counts.captured + counts.dropped);
        }
        debug!("{} exited with {}", tool, status);

        Ok(CaptureReport {
            counts,
            started_at,
            ended_at,
        })
    }
}

fn stop(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Parse dumpcap's summary line, e.g.
/// `Packets received/dropped on interface 'wlan0': 1234/5 (pcap:0/dumpcap:0/flushed:5/ps_ifdrop:0) (99.6%)`
pub fn parse_packet_counts(line: &str) -> Option<PacketCounts> {
    let (_, rest) = line.split_once("dropped on interface '")?;
    let (_, counts) = rest.split_once("': ")?;
    let counts = counts.split_whitespace().next()?;
    let (captured, dropped) = counts.split_once('/')?;
    Some(PacketCounts {
        captured: captured.parse().ok()?,
        dropped: dropped.parse().ok()?,
    })
}

/// Resolve an executable by path, or by name on `PATH`
pub fn find_tool(tool: &Path) -> Option<PathBuf> {
    if tool.components().count() > 1 {
        return tool.is_file().then(|| tool.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}
