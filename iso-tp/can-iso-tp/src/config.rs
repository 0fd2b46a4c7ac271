//! ISO-TP configuration and file-based link configuration.

use core::time::Duration;
use std::path::Path;
use std::sync::Arc;

use embedded_can_bus::{BusOptions, FrameKind};
use serde::Deserialize;
use thiserror::Error;

use crate::address::IsoTpEndpoint;
use crate::buffer::{BufferAllocator, HeapAllocator, PooledAllocator};
use crate::errors::IsoTpError;
use crate::pdu::FrameLayout;

/// Protocol options for an ISO-TP channel.
#[derive(Debug, Clone)]
pub struct IsoTpOptions {
    /// Classic or FD frames.
    pub frame_kind: FrameKind,
    /// CAN payload size used for segmentation (8 classic, 8..=64 FD).
    pub frame_len: usize,
    /// Pad byte for transmitted frames (`None` = no padding).
    pub padding: Option<u8>,
    /// Block size advertised to senders (0 = unlimited).
    pub block_size: u8,
    /// STmin advertised to senders.
    pub st_min: Duration,
    /// Local lower bound on the gap between transmitted consecutive frames.
    pub st_min_floor: Duration,
    /// Maximum number of FlowControl::Wait responses accepted before failing.
    pub wft_max: u8,
    /// Sender frame transmission timeout.
    pub n_as: Duration,
    /// Receiver frame transmission timeout.
    pub n_ar: Duration,
    /// Timeout waiting for Flow Control.
    pub n_bs: Duration,
    /// Timeout for the receiver to issue Flow Control.
    pub n_br: Duration,
    /// Timeout between consecutive frame transmissions.
    pub n_cs: Duration,
    /// Timeout waiting for the next consecutive frame.
    pub n_cr: Duration,
    /// Overall request/response timeout; derived from the N_* timers when `None`.
    pub request_timeout: Option<Duration>,
    /// Largest message accepted in either direction.
    pub max_payload_len: usize,
    /// Do not answer First Frames with Flow Control.
    pub suppress_flow_control: bool,
    /// Reject received frames shorter than `frame_len` when padding is enabled.
    pub strict_padding: bool,
    /// Completed inbound messages buffered before the receiver stops draining the bus.
    pub rx_queue_depth: usize,
    /// Reassembly buffer source.
    pub allocator: Arc<dyn BufferAllocator>,
}

impl Default for IsoTpOptions {
    fn default() -> Self {
        Self {
            frame_kind: FrameKind::Classic,
            frame_len: 8,
            padding: None,
            block_size: 0,
            st_min: Duration::ZERO,
            st_min_floor: Duration::ZERO,
            wft_max: 0,
            n_as: Duration::from_millis(1000),
            n_ar: Duration::from_millis(1000),
            n_bs: Duration::from_millis(1000),
            n_br: Duration::from_millis(1000),
            n_cs: Duration::from_millis(1000),
            n_cr: Duration::from_millis(1000),
            request_timeout: None,
            max_payload_len: 4095,
            suppress_flow_control: false,
            strict_padding: false,
            rx_queue_depth: 16,
            allocator: Arc::new(HeapAllocator::new()),
        }
    }
}

impl IsoTpOptions {
    /// Classic CAN defaults.
    pub fn classic() -> Self {
        Self::default()
    }

    /// CAN FD defaults with 64-byte frames.
    pub fn fd() -> Self {
        Self {
            frame_kind: FrameKind::Fd,
            frame_len: 64,
            ..Self::default()
        }
    }

    /// Overall timeout applied by [`crate::IsoTpChannel::request`].
    pub fn effective_request_timeout(&self) -> Duration {
        self.request_timeout
            .unwrap_or(self.n_as + self.n_bs + self.n_br + self.n_cr)
    }

    /// Transmit layout for `endpoint`.
    pub fn tx_layout(&self, endpoint: &IsoTpEndpoint) -> FrameLayout {
        FrameLayout {
            id: endpoint.tx_id,
            prefix: endpoint.tx_address,
            kind: self.frame_kind,
            frame_len: self.frame_len,
            padding: self.padding,
        }
    }

    /// Reject invalid limits.
    pub fn validate(&self) -> Result<(), IsoTpError> {
        let max_len = self.frame_kind.max_len();
        if self.frame_len < 8 || self.frame_len > max_len {
            return Err(IsoTpError::InvalidConfig("frame_len out of range for frame kind"));
        }
        if self.frame_kind == FrameKind::Fd
            && embedded_can_bus::fd_len_round_up(self.frame_len) != Some(self.frame_len)
        {
            return Err(IsoTpError::InvalidConfig("frame_len is not a valid CAN FD length"));
        }
        if self.max_payload_len == 0 || self.max_payload_len > u32::MAX as usize {
            return Err(IsoTpError::InvalidConfig("max_payload_len out of range"));
        }
        if self.rx_queue_depth == 0 {
            return Err(IsoTpError::InvalidConfig("rx_queue_depth must be at least 1"));
        }
        let timers = [
            self.n_as, self.n_ar, self.n_bs, self.n_br, self.n_cs, self.n_cr,
        ];
        if timers.iter().any(Duration::is_zero) {
            return Err(IsoTpError::InvalidConfig("N_* timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// `[isotp]` table as written in a config file. Durations are integers with unit suffixes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct IsoTpSection {
    frame_kind: FrameKind,
    frame_len: Option<usize>,
    padding: Option<u8>,
    block_size: u8,
    st_min_us: u64,
    st_min_floor_us: u64,
    wft_max: u8,
    n_as_ms: u64,
    n_ar_ms: u64,
    n_bs_ms: u64,
    n_br_ms: u64,
    n_cs_ms: u64,
    n_cr_ms: u64,
    request_timeout_ms: Option<u64>,
    max_payload_len: usize,
    suppress_flow_control: bool,
    strict_padding: bool,
    rx_queue_depth: usize,
    pooled_buffers: Option<usize>,
}

impl Default for IsoTpSection {
    fn default() -> Self {
        let d = IsoTpOptions::default();
        Self {
            frame_kind: d.frame_kind,
            frame_len: None,
            padding: d.padding,
            block_size: d.block_size,
            st_min_us: d.st_min.as_micros() as u64,
            st_min_floor_us: d.st_min_floor.as_micros() as u64,
            wft_max: d.wft_max,
            n_as_ms: d.n_as.as_millis() as u64,
            n_ar_ms: d.n_ar.as_millis() as u64,
            n_bs_ms: d.n_bs.as_millis() as u64,
            n_br_ms: d.n_br.as_millis() as u64,
            n_cs_ms: d.n_cs.as_millis() as u64,
            n_cr_ms: d.n_cr.as_millis() as u64,
            request_timeout_ms: None,
            max_payload_len: d.max_payload_len,
            suppress_flow_control: d.suppress_flow_control,
            strict_padding: d.strict_padding,
            rx_queue_depth: d.rx_queue_depth,
            pooled_buffers: None,
        }
    }
}

impl From<IsoTpSection> for IsoTpOptions {
    fn from(s: IsoTpSection) -> Self {
        let allocator: Arc<dyn BufferAllocator> = match s.pooled_buffers {
            Some(max_idle) => Arc::new(PooledAllocator::new(max_idle)),
            None => Arc::new(HeapAllocator::new()),
        };
        Self {
            frame_kind: s.frame_kind,
            frame_len: s.frame_len.unwrap_or(s.frame_kind.max_len()),
            padding: s.padding,
            block_size: s.block_size,
            st_min: Duration::from_micros(s.st_min_us),
            st_min_floor: Duration::from_micros(s.st_min_floor_us),
            wft_max: s.wft_max,
            n_as: Duration::from_millis(s.n_as_ms),
            n_ar: Duration::from_millis(s.n_ar_ms),
            n_bs: Duration::from_millis(s.n_bs_ms),
            n_br: Duration::from_millis(s.n_br_ms),
            n_cs: Duration::from_millis(s.n_cs_ms),
            n_cr: Duration::from_millis(s.n_cr_ms),
            request_timeout: s.request_timeout_ms.map(Duration::from_millis),
            max_payload_len: s.max_payload_len,
            suppress_flow_control: s.suppress_flow_control,
            strict_padding: s.strict_padding,
            rx_queue_depth: s.rx_queue_depth,
            allocator,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LinkFile {
    bus: BusOptions,
    isotp: IsoTpSection,
}

/// Bus and transport settings for one link, usually loaded from TOML:
///
/// ```toml
/// [bus]
/// channel = "can0"
/// bitrate = 500000
/// min_frame_gap_us = 200
///
/// [isotp]
/// padding = 0xCC
/// block_size = 8
/// st_min_us = 1000
/// request_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, Default)]
pub struct LinkConfig {
    /// `[bus]` table.
    pub bus: BusOptions,
    /// `[isotp]` table.
    pub isotp: IsoTpOptions,
}

impl LinkConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: LinkFile = toml::from_str(content)?;
        let config = Self {
            bus: file.bus,
            isotp: file.isotp.into(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Validate both tables and their combination.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus
            .validate()
            .map_err(|msg| ConfigError::Invalid(msg.into()))?;
        self.isotp
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.isotp.frame_kind == FrameKind::Fd && self.bus.mode == FrameKind::Classic {
            return Err(ConfigError::Invalid(
                "isotp.frame_kind = \"fd\" needs bus.mode = \"fd\"".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = LinkConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.bus, BusOptions::default());
        assert_eq!(cfg.isotp.frame_len, 8);
        assert_eq!(cfg.isotp.n_cr, Duration::from_millis(1000));
        assert_eq!(cfg.isotp.effective_request_timeout(), Duration::from_millis(4000));
    }

    #[test]
    fn fd_link_parses() {
        let cfg = LinkConfig::from_toml_str(
            r#"
            [bus]
            channel = "can1"
            mode = "fd"
            data_bitrate = 2000000
            min_frame_gap_us = 250

            [isotp]
            frame_kind = "fd"
            padding = 0xCC
            block_size = 4
            st_min_us = 500
            wft_max = 3
            request_timeout_ms = 2500
            pooled_buffers = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bus.channel, "can1");
        assert_eq!(cfg.bus.min_frame_gap(), Duration::from_micros(250));
        assert_eq!(cfg.isotp.frame_len, 64);
        assert_eq!(cfg.isotp.padding, Some(0xCC));
        assert_eq!(cfg.isotp.st_min, Duration::from_micros(500));
        assert_eq!(
            cfg.isotp.effective_request_timeout(),
            Duration::from_millis(2500)
        );
        assert!(cfg.isotp.allocator.is_pooled());
    }

    #[test]
    fn fd_transport_on_classic_bus_is_rejected() {
        let err = LinkConfig::from_toml_str("[isotp]\nframe_kind = \"fd\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn bad_frame_len_and_unknown_keys_are_rejected() {
        assert!(matches!(
            LinkConfig::from_toml_str("[isotp]\nframe_len = 13\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            LinkConfig::from_toml_str("[isotp]\nblocksize = 4\n"),
            Err(ConfigError::Toml(_))
        ));
    }
}
