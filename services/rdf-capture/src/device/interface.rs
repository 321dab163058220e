//! Wireless interface control through `iw` and `ip`

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::InterfaceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceMode {
    Managed,
    Monitor,
    Other,
}

impl InterfaceMode {
    /// Name used by `iw ... set type`
    pub fn as_iw(self) -> &'static str {
        match self {
            InterfaceMode::Managed => "managed",
            InterfaceMode::Monitor => "monitor",
            InterfaceMode::Other => "other",
        }
    }

    fn from_iw(kind: &str) -> Self {
        match kind {
            "managed" => InterfaceMode::Managed,
            "monitor" => InterfaceMode::Monitor,
            _ => InterfaceMode::Other,
        }
    }
}

impl fmt::Display for InterfaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_iw())
    }
}

/// Operations the capture pass needs from the host's wireless stack
pub trait InterfaceControl: Send + Sync {
    fn interfaces(&self) -> Result<Vec<String>, InterfaceError>;
    fn mode(&self, iface: &str) -> Result<InterfaceMode, InterfaceError>;
    fn set_mode(&self, iface: &str, mode: InterfaceMode) -> Result<(), InterfaceError>;
    fn channel(&self, iface: &str) -> Result<Option<u32>, InterfaceError>;
    fn set_channel(&self, iface: &str, channel: u32) -> Result<(), InterfaceError>;

    fn ensure_mode(&self, iface: &str, mode: InterfaceMode) -> Result<(), InterfaceError> {
        let current = self.mode(iface)?;
        if current == mode {
            debug!("{} already in {} mode", iface, mode);
            return Ok(());
        }
        info!("Switching {} from {} to {} mode", iface, current, mode);
        self.set_mode(iface, mode)?;
        let applied = self.mode(iface)?;
        if applied != mode {
            return Err(InterfaceError::ModeNotApplied {
                iface: iface.to_string(),
                requested: mode.to_string(),
                actual: applied.to_string(),
            });
        }
        Ok(())
    }
}

/// One `Interface` block of `iw dev`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IwDevice {
    pub name: String,
    pub mode: InterfaceMode,
    pub channel: Option<u32>,
}

/// Parse `iw dev` output
///
/// ```text
/// phy#0
///         Interface wlan0
///                 ifindex 3
///                 type monitor
///                 channel 6 (2437 MHz), width: 20 MHz (no HT), center1: 2437 MHz
/// ```
pub fn parse_iw_dev(output: &str) -> Vec<IwDevice> {
    let mut devices: Vec<IwDevice> = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("Interface ") {
            devices.push(IwDevice {
                name: name.trim().to_string(),
                mode: InterfaceMode::Other,
                channel: None,
            });
            continue;
        }
        let Some(device) = devices.last_mut() else {
            continue;
        };
        if let Some(kind) = line.strip_prefix("type ") {
            device.mode = InterfaceMode::from_iw(kind.trim());
        } else if let Some(rest) = line.strip_prefix("channel ") {
            device.channel = rest.split_whitespace().next().and_then(|c| c.parse().ok());
        }
    }
    devices
}

pub struct IwControl {
    iw: PathBuf,
    ip: PathBuf,
}

impl Default for IwControl {
    fn default() -> Self {
        Self {
            iw: PathBuf::from("iw"),
            ip: PathBuf::from("ip"),
        }
    }
}

impl IwControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, program: &Path, args: &[&str]) -> Result<String, InterfaceError> {
        let command = format!("{} {}", program.display(), args.join(" "));
        debug!("Executing: {}", command);
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| InterfaceError::Command {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(InterfaceError::Status {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn devices(&self) -> Result<Vec<IwDevice>, InterfaceError> {
        Ok(parse_iw_dev(&self.run(&self.iw, &["dev"])?))
    }

    fn device(&self, iface: &str) -> Result<IwDevice, InterfaceError> {
        self.devices()?
            .into_iter()
            .find(|d| d.name == iface)
            .ok_or_else(|| InterfaceError::Unknown(iface.to_string()))
    }
}

impl InterfaceControl for IwControl {
    fn interfaces(&self) -> Result<Vec<String>, InterfaceError> {
        Ok(self.devices()?.into_iter().map(|d| d.name).collect())
    }

    fn mode(&self, iface: &str) -> Result<InterfaceMode, InterfaceError> {
        Ok(self.device(iface)?.mode)
    }

    fn set_mode(&self, iface: &str, mode: InterfaceMode) -> Result<(), InterfaceError> {
        self.run(&self.ip, &["link", "set", "dev", iface, "down"])?;
        let result = self.run(&self.iw, &["dev", iface, "set", "type", mode.as_iw()]);
        // bring the link back up even if the type change was refused
        self.run(&self.ip, &["link", "set", "dev", iface, "up"])?;
        result.map(|_| ())
    }

    fn channel(&self, iface: &str) -> Result<Option<u32>, InterfaceError> {
        Ok(self.device(iface)?.channel)
    }

    fn set_channel(&self, iface: &str, channel: u32) -> Result<(), InterfaceError> {
        self.run(&self.iw, &["dev", iface, "set", "channel", &channel.to_string()])
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IW_DEV: &str = "phy#1
\tInterface wlan1
\t\tifindex 4
\t\twdev 0x100000001
\t\taddr 00:c0:ca:12:34:56
\t\ttype monitor
\t\tchannel 6 (2437 MHz), width: 20 MHz (no HT), center1: 2437 MHz
\t\ttxpower 20.00 dBm
phy#0
\tUnnamed/non-netdev interface
\t\twdev 0x2
\tInterface wlan0
\t\tifindex 3
\t\twdev 0x1
\t\taddr b8:27:eb:00:11:22
\t\tssid home
\t\ttype managed
";

    #[test]
    fn parses_iw_dev_blocks() {
        let devices = parse_iw_dev(IW_DEV);
        assert_eq!(
            devices,
            vec![
                IwDevice { name: "wlan1".into(), mode: InterfaceMode::Monitor, channel: Some(6) },
                IwDevice { name: "wlan0".into(), mode: InterfaceMode::Managed, channel: None },
            ]
        );
    }

    #[test]
    fn unknown_types_are_other() {
        let devices = parse_iw_dev("\tInterface ap0\n\t\ttype AP\n");
        assert_eq!(devices[0].mode, InterfaceMode::Other);
        assert!(parse_iw_dev("").is_empty());
    }
}
