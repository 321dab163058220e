//! Beacon extraction from a capture file via tshark
//!
//! tshark prints one tab-separated line per beacon with the fields listed in
//! [`FIELDS`]; each line becomes a [`FrameRecord`], with unparseable fields
//! left empty rather than failing the file.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::frame::{Bssid, Encryption, FrameRecord, Security};
use crate::error::DecodeError;

/// Columns requested from tshark, in output order
pub const FIELDS: [&str; 9] = [
    "frame.time_epoch",
    "wlan.bssid",
    "wlan.ssid",
    "radiotap.dbm_antsignal",
    "wlan_radio.channel",
    "radiotap.channel.freq",
    "wlan.fixed.capabilities.privacy",
    "wlan.rsn.akms.type",
    "wlan.rsn.pcs.type",
];

/// Source of decoded beacons for a capture file
pub trait FrameSource {
    fn frames(&self, pcap: &Path, macs: &[Bssid]) -> Result<Vec<FrameRecord>, DecodeError>;
}

/// How the tshark build in use prints `wlan.ssid`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SsidForm {
    /// Printable SSIDs as text (tshark 3.0 and later)
    #[default]
    Text,
    /// Every SSID as a hex byte string
    Hex,
}

pub struct TsharkFrames {
    tshark: PathBuf,
    ssid_form: SsidForm,
}

impl TsharkFrames {
    pub fn new(tshark: impl Into<PathBuf>) -> Self {
        Self {
            tshark: tshark.into(),
            ssid_form: SsidForm::default(),
        }
    }

    pub fn with_ssid_form(mut self, form: SsidForm) -> Self {
        self.ssid_form = form;
        self
    }

    fn tool(&self) -> String {
        self.tshark.display().to_string()
    }

    pub fn command(&self, pcap: &Path, macs: &[Bssid]) -> Command {
        let mut cmd = Command::new(&self.tshark);
        cmd.arg("-r")
            .arg(pcap)
            .arg("-Y")
            .arg(display_filter(macs))
            .args(["-T", "fields", "-E", "separator=/t", "-E", "occurrence=a", "-E", "aggregator=,"]);
        for field in FIELDS {
            cmd.arg("-e").arg(field);
        }
        cmd
    }
}

impl FrameSource for TsharkFrames {
    fn frames(&self, pcap: &Path, macs: &[Bssid]) -> Result<Vec<FrameRecord>, DecodeError> {
        let mut cmd = self.command(pcap, macs);
        cmd.stdin(Stdio::null());
        debug!("Executing: {:?}", cmd);

        let output = cmd.output().map_err(|source| DecodeError::Spawn {
            tool: self.tool(),
            source,
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            warn!("[tshark] {}", line.trim());
        }
        if !output.status.success() {
            return Err(DecodeError::Failed {
                tool: self.tool(),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let frames: Vec<FrameRecord> = stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_fields_line(line, self.ssid_form))
            .collect();
        info!("Decoded {} beacon frames from {}", frames.len(), pcap.display());
        Ok(frames)
    }
}

/// Beacons only, optionally restricted to the given transmitters
pub fn display_filter(macs: &[Bssid]) -> String {
    let beacons = "wlan.fc.type_subtype == 0x0008";
    if macs.is_empty() {
        return beacons.to_string();
    }
    let allowed: Vec<String> = macs.iter().map(|m| format!("wlan.bssid == {m}")).collect();
    format!("{beacons} && ({})", allowed.join(" || "))
}

/// Parse one line of tshark field output
pub fn parse_fields_line(line: &str, ssid_form: SsidForm) -> FrameRecord {
    let cols: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
    let col = |i: usize| cols.get(i).map(|s| s.trim()).filter(|s| !s.is_empty());
    // multi-antenna radios report one value per chain
    let first = |i: usize| col(i).and_then(|s| s.split(',').next()).map(str::trim);

    FrameRecord {
        arrival_time: first(0).and_then(parse_epoch),
        transmitter: first(1).and_then(|s| s.parse().ok()),
        ssid: col(2).map(|raw| decode_ssid(raw, ssid_form)),
        signal_dbm: first(3).and_then(|s| s.parse().ok()),
        channel: first(4)
            .and_then(|s| s.parse().ok())
            .or_else(|| first(5).and_then(|s| s.parse().ok()).and_then(freq_to_channel)),
        security: Some(parse_security(col(6), col(7), col(8))),
    }
}

fn parse_epoch(s: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    let secs: i64 = secs.parse().ok()?;
    let digits: String = frac.chars().take(9).collect();
    let nanos = if digits.is_empty() {
        0
    } else {
        let scale = 10u32.pow(9 - digits.len() as u32);
        digits.parse::<u32>().ok()? * scale
    };
    DateTime::from_timestamp(secs, nanos)
}

/// Only the hex form is decoded; a text SSID made of hex digits stays as is
fn decode_ssid(raw: &str, form: SsidForm) -> String {
    match form {
        SsidForm::Text => raw.to_string(),
        SsidForm::Hex => match hex::decode(raw) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => raw.to_string(),
        },
    }
}

/// MHz to 802.11 channel number
pub fn freq_to_channel(freq: u32) -> Option<u32> {
    match freq {
        2484 => Some(14),
        2412..=2472 => Some((freq - 2407) / 5),
        5160..=5885 => Some((freq - 5000) / 5),
        5955..=7115 => Some((freq - 5950) / 5),
        _ => None,
    }
}

fn parse_security(privacy: Option<&str>, akms: Option<&str>, pcs: Option<&str>) -> Security {
    let list = |s: Option<&str>| -> Vec<String> {
        s.map(|v| v.split(',').map(|t| t.trim().to_string()).collect())
            .unwrap_or_default()
    };
    let akms = list(akms);
    let pcs = list(pcs);

    if !akms.is_empty() || !pcs.is_empty() {
        let auth = if akms.iter().any(|t| t == "3") {
            Some("FT".to_string())
        } else if akms.iter().any(|t| t == "2") {
            Some("PSK".to_string())
        } else {
            None
        };
        let mut ciphers: Vec<&str> = pcs
            .iter()
            .filter_map(|t| match t.as_str() {
                "4" => Some("CCMP"),
                "2" => Some("TKIP"),
                _ => None,
            })
            .collect();
        ciphers.sort_unstable();
        ciphers.dedup();
        let cipher = (!ciphers.is_empty()).then(|| ciphers.join("+"));
        return Security {
            encryption: Encryption::Wpa,
            cipher,
            auth,
        };
    }

    match privacy {
        Some("1") | Some("True") | Some("true") => Security {
            encryption: Encryption::Wep,
            cipher: Some("WEP".to_string()),
            auth: None,
        },
        _ => Security::open(),
    }
}
