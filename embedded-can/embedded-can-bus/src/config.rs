//! Bus-level configuration.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::FrameKind;

/// Settings for one adapter channel and the transmit queue in front of it.
///
/// Bit timing is carried through to the port opener untouched; this crate never derives
/// register values from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusOptions {
    /// Adapter channel selector (e.g. `"can0"`, `"pcan-usb:1"`).
    pub channel: String,
    /// Nominal (arbitration phase) bitrate in bit/s.
    pub bitrate: u32,
    /// Data-phase bitrate for CAN FD, if used.
    pub data_bitrate: Option<u32>,
    /// Classic or FD protocol mode.
    pub mode: FrameKind,
    /// Minimum gap enforced between consecutive data frames, in microseconds.
    pub min_frame_gap_us: u64,
    /// Maximum number of pending writes in the transmit queue.
    pub queue_capacity: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            channel: String::from("vcan0"),
            bitrate: 500_000,
            data_bitrate: None,
            mode: FrameKind::Classic,
            min_frame_gap_us: 0,
            queue_capacity: 64,
        }
    }
}

impl BusOptions {
    /// Minimum inter-frame gap as a `Duration`.
    pub fn min_frame_gap(&self) -> Duration {
        Duration::from_micros(self.min_frame_gap_us)
    }

    /// Reject settings the queue cannot honour.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1");
        }
        if self.bitrate == 0 {
            return Err("bitrate must be non-zero");
        }
        if self.mode == FrameKind::Classic && self.data_bitrate.is_some() {
            return Err("data_bitrate requires fd mode");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(BusOptions::default().validate().is_ok());
    }

    #[test]
    fn zero_capacity_rejected() {
        let opts = BusOptions {
            queue_capacity: 0,
            ..BusOptions::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn classic_with_data_bitrate_rejected() {
        let opts = BusOptions {
            data_bitrate: Some(2_000_000),
            ..BusOptions::default()
        };
        assert!(opts.validate().is_err());
    }
}
