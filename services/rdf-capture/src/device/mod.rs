//! Wireless interface management: monitor mode, channel control and hopping

mod hopper;
mod interface;

pub use hopper::{ChannelHopper, HopStats, IEEE80211BG};
pub use interface::{parse_iw_dev, InterfaceControl, InterfaceMode, IwControl, IwDevice};
