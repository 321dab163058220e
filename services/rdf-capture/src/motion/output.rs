//! Pulse output backends for a step/direction stepper driver

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

const GPIO_ROOT: &str = "/sys/class/gpio";

/// How long to wait for udev to create (and chmod) an exported pin
const EXPORT_SETTLE: Duration = Duration::from_secs(1);

/// Rotation sense as seen by the driver's DIR pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn from_steps(steps: i64) -> Self {
        if steps < 0 {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
        }
    }
}

/// Low-level stepper driver lines
///
/// A pulse is one rising edge on the step line. Implementations must be
/// `Send` so the controller can be lent to the motion task thread.
pub trait PulseOutput: Send {
    fn set_enabled(&mut self, enabled: bool) -> io::Result<()>;
    fn set_direction(&mut self, direction: Direction) -> io::Result<()>;
    fn set_step(&mut self, high: bool) -> io::Result<()>;
}

impl<T: PulseOutput + ?Sized> PulseOutput for Box<T> {
    fn set_enabled(&mut self, enabled: bool) -> io::Result<()> {
        (**self).set_enabled(enabled)
    }

    fn set_direction(&mut self, direction: Direction) -> io::Result<()> {
        (**self).set_direction(direction)
    }

    fn set_step(&mut self, high: bool) -> io::Result<()> {
        (**self).set_step(high)
    }
}

/// Simulation backend: counts pulses, drives nothing
#[derive(Debug, Default)]
pub struct NullPulseOutput {
    pulses: u64,
    enabled: bool,
    step_high: bool,
    direction: Option<Direction>,
}

impl NullPulseOutput {
    pub fn pulses(&self) -> u64 {
        self.pulses
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl PulseOutput for NullPulseOutput {
    fn set_enabled(&mut self, enabled: bool) -> io::Result<()> {
        self.enabled = enabled;
        Ok(())
    }

    fn set_direction(&mut self, direction: Direction) -> io::Result<()> {
        self.direction = Some(direction);
        Ok(())
    }

    fn set_step(&mut self, high: bool) -> io::Result<()> {
        if high && !self.step_high {
            self.pulses += 1;
        }
        self.step_high = high;
        Ok(())
    }
}

/// BCM pin numbers of the driver lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysfsPins {
    pub step: u32,
    pub direction: u32,
    pub enable: u32,
    /// Most step-stick drivers enable on a low level
    pub enable_active_low: bool,
}

impl Default for SysfsPins {
    fn default() -> Self {
        Self {
            step: 23,
            direction: 24,
            enable: 18,
            enable_active_low: true,
        }
    }
}

/// Sysfs GPIO backend; value files stay open for the life of the output
pub struct SysfsPulseOutput {
    step: File,
    direction: File,
    enable: File,
    enable_active_low: bool,
}

impl SysfsPulseOutput {
    pub fn open(pins: &SysfsPins) -> io::Result<Self> {
        Self::open_at(Path::new(GPIO_ROOT), pins)
    }

    fn open_at(root: &Path, pins: &SysfsPins) -> io::Result<Self> {
        let output = Self {
            step: export_output(root, pins.step)?,
            direction: export_output(root, pins.direction)?,
            enable: export_output(root, pins.enable)?,
            enable_active_low: pins.enable_active_low,
        };
        info!(
            "Stepper GPIO ready: step={} dir={} enable={} (enable active {})",
            pins.step,
            pins.direction,
            pins.enable,
            if pins.enable_active_low { "low" } else { "high" }
        );
        Ok(output)
    }
}

impl PulseOutput for SysfsPulseOutput {
    fn set_enabled(&mut self, enabled: bool) -> io::Result<()> {
        write_level(&self.enable, enabled != self.enable_active_low)
    }

    fn set_direction(&mut self, direction: Direction) -> io::Result<()> {
        write_level(&self.direction, direction == Direction::Forward)
    }

    fn set_step(&mut self, high: bool) -> io::Result<()> {
        write_level(&self.step, high)
    }
}

impl Drop for SysfsPulseOutput {
    fn drop(&mut self) {
        let _ = write_level(&self.step, false);
        let _ = self.set_enabled(false);
    }
}

fn export_output(root: &Path, pin: u32) -> io::Result<File> {
    let dir = root.join(format!("gpio{pin}"));
    if !dir.exists() {
        debug!("Exporting GPIO {}", pin);
        fs::write(root.join("export"), pin.to_string())?;
        wait_for(&dir.join("direction"))?;
    }
    fs::write(dir.join("direction"), "out")?;
    OpenOptions::new().write(true).open(dir.join("value"))
}

fn wait_for(path: &Path) -> io::Result<()> {
    let deadline = Instant::now() + EXPORT_SETTLE;
    while !path.exists() {
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not appear after export", path.display()),
            ));
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

fn write_level(file: &File, high: bool) -> io::Result<()> {
    file.write_at(if high { b"1" } else { b"0" }, 0).map(|_| ())
}
