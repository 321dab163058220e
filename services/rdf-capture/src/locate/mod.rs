//! Bearing estimation: beacon decoding, per-transmitter aggregation and
//! peak finding

mod decode;
mod estimator;
mod frame;
mod pchip;
mod tracker;

pub use decode::{display_filter, freq_to_channel, parse_fields_line, FrameSource, SsidForm, TsharkFrames, FIELDS};
pub use estimator::{estimate, BearingEstimate, EstimateReport, Method, RotationWindow, NAIVE_SAMPLE_LIMIT};
pub use frame::{Beacon, Bssid, Encryption, FrameRecord, Security};
pub use pchip::Pchip;
pub use tracker::{dbm_to_mw, TrackerStats, TransmitterState, TransmitterTracker};
