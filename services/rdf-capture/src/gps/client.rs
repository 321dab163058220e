//! gpsd client

use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::GpsError;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Streamed reports (TPV, SKY, ...) interleave with poll answers
const MAX_LINES_PER_POLL: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GpsFix {
    /// NMEA fix mode: 0/1 none, 2 = 2D, 3 = 3D
    pub mode: u8,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub lat_err: Option<f64>,
    pub lon_err: Option<f64>,
    pub alt_err: Option<f64>,
}

impl GpsFix {
    pub fn has_position(&self) -> bool {
        self.mode >= 2
    }

    pub fn has_3d_fix(&self) -> bool {
        self.mode >= 3
    }
}

/// Position source used by the GPS task
pub trait GpsSource: Send {
    fn current_fix(&mut self) -> Result<GpsFix, GpsError>;

    /// Begin writing raw NMEA sentences to `path`
    fn start_recording(&mut self, path: &Path) -> Result<(), GpsError>;

    fn stop_recording(&mut self) -> Result<(), GpsError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<'a> {
    #[serde(borrow)]
    class: &'a str,
}

#[derive(Debug, Deserialize)]
struct PollReport {
    #[serde(default)]
    tpv: Vec<Tpv>,
}

#[derive(Debug, Deserialize)]
struct Tpv {
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(rename = "altHAE")]
    alt_hae: Option<f64>,
    #[serde(rename = "altMSL")]
    alt_msl: Option<f64>,
    alt: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
    epv: Option<f64>,
}

impl From<Tpv> for GpsFix {
    fn from(tpv: Tpv) -> Self {
        Self {
            mode: tpv.mode,
            lat: tpv.lat.unwrap_or_default(),
            lon: tpv.lon.unwrap_or_default(),
            alt: tpv.alt_hae.or(tpv.alt_msl).or(tpv.alt).unwrap_or_default(),
            // epy is the latitude error, epx the longitude error
            lat_err: tpv.epy,
            lon_err: tpv.epx,
            alt_err: tpv.epv,
        }
    }
}

/// Parse one gpsd line; `Ok(None)` for anything but a POLL answer
pub(crate) fn parse_poll(line: &str) -> Result<Option<GpsFix>, GpsError> {
    let envelope: Envelope = serde_json::from_str(line)?;
    if envelope.class != "POLL" {
        return Ok(None);
    }
    let report: PollReport = serde_json::from_str(line)?;
    let tpv = report.tpv.into_iter().next().ok_or(GpsError::NoReport)?;
    Ok(Some(tpv.into()))
}

pub struct GpsdClient {
    addr: String,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    gpspipe: PathBuf,
    recorder: Option<Child>,
}

impl GpsdClient {
    pub fn connect(addr: &str, gpspipe: impl Into<PathBuf>) -> Result<Self, GpsError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let writer = stream.try_clone()?;
        let mut client = Self {
            addr: addr.to_string(),
            reader: BufReader::new(stream),
            writer,
            gpspipe: gpspipe.into(),
            recorder: None,
        };
        client.send(r#"?WATCH={"enable":true,"json":true};"#)?;
        info!("Connected to gpsd at {}", addr);
        Ok(client)
    }

    fn send(&mut self, command: &str) -> io::Result<()> {
        self.writer.write_all(command.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

impl GpsSource for GpsdClient {
    fn current_fix(&mut self) -> Result<GpsFix, GpsError> {
        self.send("?POLL;")?;
        let mut line = String::new();
        for _ in 0..MAX_LINES_PER_POLL {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(GpsError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("gpsd at {} closed the connection", self.addr),
                )));
            }
            if let Some(fix) = parse_poll(line.trim())? {
                return Ok(fix);
            }
        }
        Err(GpsError::NoReport)
    }

    fn start_recording(&mut self, path: &Path) -> Result<(), GpsError> {
        self.stop_recording()?;
        let mut cmd = Command::new(&self.gpspipe);
        cmd.args(["-r", "-uu", "-o"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        debug!("Executing: {:?}", cmd);
        let child = cmd.spawn().map_err(|source| GpsError::Recorder {
            tool: self.gpspipe.display().to_string(),
            source,
        })?;
        self.recorder = Some(child);
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<(), GpsError> {
        if let Some(mut child) = self.recorder.take() {
            child.kill()?;
            let status = child.wait()?;
            debug!("gpspipe stopped ({})", status);
        }
        Ok(())
    }
}

impl Drop for GpsdClient {
    fn drop(&mut self) {
        if let Err(e) = self.stop_recording() {
            warn!("Failed to stop gpspipe: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    const POLL: &str = r#"{"class":"POLL","time":"2024-05-01T12:00:00.000Z","active":1,"tpv":[{"class":"TPV","device":"/dev/ttyACM0","mode":3,"lat":52.5163,"lon":13.3777,"altHAE":87.2,"epx":3.1,"epy":4.2,"epv":9.5}],"sky":[]}"#;

    #[test]
    fn poll_answer_maps_errors_to_axes() {
        let fix = parse_poll(POLL).unwrap().unwrap();
        assert_eq!(fix.mode, 3);
        assert!(fix.has_3d_fix());
        assert_eq!(fix.lat, 52.5163);
        assert_eq!(fix.lon, 13.3777);
        assert_eq!(fix.alt, 87.2);
        assert_eq!(fix.lat_err, Some(4.2));
        assert_eq!(fix.lon_err, Some(3.1));
        assert_eq!(fix.alt_err, Some(9.5));
    }

    #[test]
    fn streamed_reports_are_skipped() {
        let tpv = r#"{"class":"TPV","mode":3,"lat":1.0,"lon":2.0}"#;
        assert!(parse_poll(tpv).unwrap().is_none());
        assert!(parse_poll(r#"{"class":"VERSION","release":"3.25"}"#).unwrap().is_none());
    }

    #[test]
    fn poll_without_tpv_is_an_error() {
        let err = parse_poll(r#"{"class":"POLL","active":0,"tpv":[],"sky":[]}"#).unwrap_err();
        assert!(matches!(err, GpsError::NoReport));
        assert!(matches!(parse_poll("not json"), Err(GpsError::Report(_))));
    }

    #[test]
    fn no_fix_has_no_position() {
        let fix = parse_poll(r#"{"class":"POLL","tpv":[{"class":"TPV","mode":1}]}"#)
            .unwrap()
            .unwrap();
        assert!(!fix.has_position());
        assert_eq!(fix.lat_err, None);
    }

    #[test]
    fn client_polls_fake_gpsd() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert!(line.starts_with("?WATCH"));
            writeln!(writer, r#"{{"class":"VERSION","release":"3.25"}}"#).unwrap();
            line.clear();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line.trim(), "?POLL;");
            writeln!(writer, r#"{{"class":"TPV","mode":3}}"#).unwrap();
            writeln!(writer, "{POLL}").unwrap();
        });

        let mut client = GpsdClient::connect(&addr, "gpspipe").unwrap();
        let fix = client.current_fix().unwrap();
        assert_eq!(fix.lat, 52.5163);
        server.join().unwrap();
    }
}
