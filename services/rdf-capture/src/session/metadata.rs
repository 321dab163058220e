//! Per-pass output files and the capture metadata record

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tracing::{debug, warn};

use crate::capture::PacketCounts;
use crate::gps::AveragedFix;
use crate::locate::EstimateReport;
use crate::motion::RotationResult;
use crate::params::SessionParams;

/// Column order of the capture metadata file
pub const METADATA_FIELDS: [&str; 24] = [
    "name",
    "pass-id",
    "path",
    "interface",
    "duration",
    "hop-interval",
    "avg-lat",
    "avg-lon",
    "avg-alt",
    "lat-error",
    "lon-error",
    "alt-error",
    "rotation-start",
    "rotation-end",
    "sweep-degrees",
    "start-bearing",
    "pcap-file",
    "nmea-file",
    "gps-csv-file",
    "focused-transmitter-id",
    "guess-file",
    "elapsed",
    "guess-count",
    "guess-duration",
];

const GUESS_FIELDS: [&str; 9] = [
    "ssid", "bssid", "channel", "security", "strength", "samples", "method", "fallback", "bearing",
];

/// Paths written by one pass, all under `<output>/<capture>/`
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFiles {
    pub dir: PathBuf,
    pub pcap: PathBuf,
    pub nmea: PathBuf,
    pub gps_csv: PathBuf,
    pub metadata: PathBuf,
    pub guess: PathBuf,
}

impl CaptureFiles {
    /// Create the capture directory and name this pass's files
    pub fn create(output_dir: &Path, capture: &str, pass: u32) -> io::Result<Self> {
        let dir = output_dir.join(capture);
        fs::create_dir_all(&dir)?;
        let base = format!("{}-p{}", Local::now().format("%Y%m%d-%H-%M-%S"), pass);
        let file = |suffix: &str| dir.join(format!("{base}{suffix}"));
        Ok(Self {
            pcap: file(".pcapng"),
            nmea: file(".nmea"),
            gps_csv: file("-gps.csv"),
            metadata: file("-capture.csv"),
            guess: file("-guess.csv"),
            dir,
        })
    }

    /// Remove whatever this pass has written so far
    pub fn discard(&self) {
        for path in [&self.pcap, &self.nmea, &self.gps_csv, &self.metadata, &self.guess] {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed partial file {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        // only succeeds when the pass left the directory empty
        let _ = fs::remove_dir(&self.dir);
    }
}

/// Everything recorded about one completed pass
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureMetadata {
    pub params: SessionParams,
    pub files: CaptureFiles,
    pub rotation: RotationResult,
    pub fix: AveragedFix,
    pub counts: PacketCounts,
    pub elapsed: Duration,
    pub guess_file: Option<PathBuf>,
    pub guess_count: Option<usize>,
    pub guess_duration: Option<Duration>,
}

impl CaptureMetadata {
    /// Values in [`METADATA_FIELDS`] order; absent optionals are empty
    pub fn values(&self) -> Vec<String> {
        let p = &self.params;
        let name = |path: &Path| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        vec![
            p.capture().to_string(),
            p.pass().to_string(),
            self.files.dir.display().to_string(),
            p.interface().unwrap_or_default().to_string(),
            p.duration().to_string(),
            p.hop_interval().to_string(),
            self.fix.lat.to_string(),
            self.fix.lon.to_string(),
            self.fix.alt.to_string(),
            opt(self.fix.lat_err),
            opt(self.fix.lon_err),
            opt(self.fix.alt_err),
            epoch(self.rotation.start_time),
            epoch(self.rotation.end_time),
            p.degrees().to_string(),
            p.bearing().to_string(),
            name(&self.files.pcap),
            name(&self.files.nmea),
            name(&self.files.gps_csv),
            p.focused_transmitter().map(|t| t.to_string()).unwrap_or_default(),
            self.guess_file.as_deref().map(name).unwrap_or_default(),
            format!("{:.6}", self.elapsed.as_secs_f64()),
            self.guess_count.map(|n| n.to_string()).unwrap_or_default(),
            self.guess_duration
                .map(|d| format!("{:.6}", d.as_secs_f64()))
                .unwrap_or_default(),
        ]
    }

    /// Header line plus one row
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{}", METADATA_FIELDS.join(","))?;
        writeln!(out, "{}", join_row(&self.values()))?;
        out.flush()
    }
}

/// One row per estimate, strongest first
pub fn write_guesses(path: &Path, report: &EstimateReport) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", GUESS_FIELDS.join(","))?;
    for e in &report.estimates {
        let row = [
            e.ssid.clone().unwrap_or_default(),
            e.transmitter.to_string(),
            e.channel.map(|c| c.to_string()).unwrap_or_default(),
            e.security.as_ref().map(|s| s.to_string()).unwrap_or_default(),
            e.strength_dbm.to_string(),
            e.sample_count.to_string(),
            e.method.to_string(),
            e.fell_back.to_string(),
            e.bearing.to_string(),
        ];
        writeln!(out, "{}", join_row(&row))?;
    }
    out.flush()
}

/// Epoch seconds with microseconds
fn epoch(t: DateTime<Utc>) -> String {
    format!("{:.6}", t.timestamp_micros() as f64 / 1e6)
}

fn opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn join_row(values: &[String]) -> String {
    values.iter().map(|v| escape(v)).collect::<Vec<_>>().join(",")
}

/// Quote a field holding a separator, quote or line break
fn escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locate::{BearingEstimate, Bssid, Method, Security};

    fn metadata(files: CaptureFiles) -> CaptureMetadata {
        let mut params = SessionParams::default();
        params.set_capture("field");
        params.set_interface("wlan0").unwrap();
        let start = DateTime::from_timestamp(1_700_000_000, 250_000_000).unwrap();
        CaptureMetadata {
            params,
            files,
            rotation: RotationResult {
                start_time: start,
                end_time: start + chrono::TimeDelta::seconds(15),
                pulses: 6400,
                expected_pulse_interval: Duration::from_micros(2343),
                measured_pulse_interval: Duration::from_micros(2344),
            },
            fix: AveragedFix {
                lat: 47.5,
                lon: -122.25,
                alt: 30.0,
                lat_err: Some(2.0),
                lon_err: None,
                alt_err: Some(5.5),
                samples: 15,
            },
            counts: PacketCounts { captured: 100, dropped: 0 },
            elapsed: Duration::from_millis(15_500),
            guess_file: None,
            guess_count: None,
            guess_duration: None,
        }
    }

    #[test]
    fn files_are_named_per_pass() {
        let root = tempfile::tempdir().unwrap();
        let files = CaptureFiles::create(root.path(), "field", 3).unwrap();
        assert!(files.dir.is_dir());
        assert_eq!(files.dir, root.path().join("field"));
        let pcap = files.pcap.file_name().unwrap().to_string_lossy().into_owned();
        assert!(pcap.ends_with("-p3.pcapng"), "{pcap}");
        assert!(files.gps_csv.to_string_lossy().ends_with("-p3-gps.csv"));
        assert!(files.metadata.to_string_lossy().ends_with("-p3-capture.csv"));
    }

    #[test]
    fn discard_removes_partial_output() {
        let root = tempfile::tempdir().unwrap();
        let files = CaptureFiles::create(root.path(), "field", 1).unwrap();
        fs::write(&files.pcap, b"partial").unwrap();
        fs::write(&files.nmea, b"$GPGGA").unwrap();
        files.discard();
        assert!(!files.pcap.exists());
        assert!(!files.nmea.exists());
        assert!(!files.dir.exists());
    }

    #[test]
    fn metadata_follows_the_field_order() {
        let root = tempfile::tempdir().unwrap();
        let files = CaptureFiles::create(root.path(), "field", 1).unwrap();
        let meta = metadata(files.clone());
        meta.write(&files.metadata).unwrap();

        let text = fs::read_to_string(&files.metadata).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), METADATA_FIELDS.join(","));
        let row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(row.len(), METADATA_FIELDS.len());
        assert_eq!(row[0], "field");
        assert_eq!(row[3], "wlan0");
        assert_eq!(row[9], "2");
        assert_eq!(row[10], "");
        assert_eq!(row[12], "1700000000.250000");
        assert_eq!(row[13], "1700000015.250000");
        assert_eq!(row[19], "");
        assert_eq!(row[21], "15.500000");
        assert_eq!(row[22], "");
    }

    #[test]
    fn guesses_are_written_with_quoting() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("guess.csv");
        let report = EstimateReport {
            estimates: vec![BearingEstimate {
                transmitter: Bssid::new([0xaa, 0, 0, 0, 0, 1]),
                ssid: Some("Cafe, Upstairs".into()),
                channel: Some(11),
                security: Some(Security::open()),
                strength_dbm: -42,
                sample_count: 17,
                method: Method::Pchip,
                fell_back: false,
                bearing: 271,
            }],
            ..EstimateReport::default()
        };
        write_guesses(&path, &report).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ssid,bssid,channel,security,strength,samples,method,fallback,bearing");
        assert_eq!(lines[1], "\"Cafe, Upstairs\",aa:00:00:00:00:01,11,Open,-42,17,pchip,false,271");
    }
}
