//! 802.11 packet capture via an external dumpcap process
//!
//! The supervisor launches dumpcap for a bounded duration, forwards its
//! stderr into the log, opens the capture-live gate once dumpcap reports
//! the output file, and parses the final captured/dropped counts.

mod supervisor;

pub use supervisor::{
    find_tool, parse_packet_counts, CaptureConfig, CaptureReport, CaptureSupervisor, PacketCounts,
};
