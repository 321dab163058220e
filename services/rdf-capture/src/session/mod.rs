//! Capture orchestration
//!
//! A pass starts motion, GPS, channel hopping and packet capture together
//! behind a one-shot start gate, then records what each produced.

pub mod gate;
mod metadata;
mod orchestrator;

pub use metadata::{write_guesses, CaptureFiles, CaptureMetadata, METADATA_FIELDS};
pub use orchestrator::{CaptureSession, SessionOutcome, SessionSettings, TaskKind};
