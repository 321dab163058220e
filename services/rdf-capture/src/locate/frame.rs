//! 802.11 beacon frame types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::ParamError;

/// 48-bit transmitter address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bssid([u8; 6]);

impl Bssid {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for Bssid {
    type Err = ParamError;

    /// Six hex octets separated consistently by `:` or `-`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParamError::Mac(s.to_string());
        let trimmed = s.trim();
        let separator = if trimmed.contains(':') { ':' } else { '-' };
        let parts: Vec<&str> = trimmed.split(separator).collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(invalid());
            }
            let byte = hex::decode(part).map_err(|_| invalid())?;
            *octet = byte[0];
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for Bssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Encryption {
    Open,
    Wep,
    Wpa,
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Encryption::Open => "Open",
            Encryption::Wep => "WEP",
            Encryption::Wpa => "WPA",
        })
    }
}

/// Advertised security of a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Security {
    pub encryption: Encryption,
    /// Pairwise cipher suites, e.g. "CCMP"
    pub cipher: Option<String>,
    /// Key management, e.g. "PSK"
    pub auth: Option<String>,
}

impl Security {
    pub fn open() -> Self {
        Self {
            encryption: Encryption::Open,
            cipher: None,
            auth: None,
        }
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encryption)?;
        match (&self.cipher, &self.auth) {
            (Some(cipher), Some(auth)) => write!(f, " ({cipher}/{auth})"),
            (Some(only), None) | (None, Some(only)) => write!(f, " ({only})"),
            (None, None) => Ok(()),
        }
    }
}

/// One decoded beacon; any field may be missing from a damaged frame
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameRecord {
    /// Capture timestamp
    pub arrival_time: Option<DateTime<Utc>>,

    /// BSSID of the sender
    pub transmitter: Option<Bssid>,

    /// Network name (may be hidden)
    pub ssid: Option<String>,

    /// Received signal strength in dBm
    pub signal_dbm: Option<i32>,

    /// 802.11 channel the frame was received on
    pub channel: Option<u32>,

    pub security: Option<Security>,
}

/// The fields bearing estimation cannot do without
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beacon<'a> {
    pub arrival_time: DateTime<Utc>,
    pub transmitter: Bssid,
    pub signal_dbm: i32,
    pub channel: u32,
    pub ssid: Option<&'a str>,
    pub security: Option<&'a Security>,
}

impl FrameRecord {
    /// `None` if a required field is missing
    pub fn beacon(&self) -> Option<Beacon<'_>> {
        Some(Beacon {
            arrival_time: self.arrival_time?,
            transmitter: self.transmitter?,
            signal_dbm: self.signal_dbm?,
            channel: self.channel?,
            ssid: self.ssid.as_deref(),
            security: self.security.as_ref(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bssid_parses_both_separators() {
        let colon: Bssid = "00:1A:2b:3c:4D:5e".parse().unwrap();
        let dash: Bssid = "00-1a-2b-3c-4d-5e".parse().unwrap();
        assert_eq!(colon, dash);
        assert_eq!(colon.to_string(), "00:1a:2b:3c:4d:5e");
        assert_eq!(colon.octets(), [0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]);
    }

    #[test]
    fn bssid_rejects_malformed() {
        for bad in ["", "00:1a:2b:3c:4d", "00:1a:2b:3c:4d:5e:6f", "0:1a:2b:3c:4d:5e", "zz:1a:2b:3c:4d:5e"] {
            assert!(bad.parse::<Bssid>().is_err(), "{bad}");
        }
    }

    #[test]
    fn security_display() {
        let wpa = Security {
            encryption: Encryption::Wpa,
            cipher: Some("CCMP".into()),
            auth: Some("PSK".into()),
        };
        assert_eq!(wpa.to_string(), "WPA (CCMP/PSK)");
        assert_eq!(Security::open().to_string(), "Open");
    }

    #[test]
    fn beacon_requires_core_fields() {
        let mut frame = FrameRecord {
            arrival_time: Some(Utc::now()),
            transmitter: Some(Bssid::new([1, 2, 3, 4, 5, 6])),
            signal_dbm: Some(-40),
            channel: Some(6),
            ..FrameRecord::default()
        };
        assert!(frame.beacon().is_some());
        frame.signal_dbm = None;
        assert!(frame.beacon().is_none());
    }
}
