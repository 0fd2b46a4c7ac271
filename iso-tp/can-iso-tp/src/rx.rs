//! Receive-side reassembly and flow-control decisions.
//!
//! [`Reassembler`] is a synchronous state machine: the channel's inbound task feeds it decoded
//! PDUs and carries out the returned [`RxOutcome`]. Timers are expressed as deadlines the caller
//! sleeps on.

use core::cmp::min;
use core::time::Duration;
use std::sync::Arc;

use embedded_can_bus::CLASSIC_MAX_LEN;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::buffer::{BufferAllocator, RentedBuffer};
use crate::config::IsoTpOptions;
use crate::datagram::{DatagramMeta, IsoTpDatagram};
use crate::errors::{IsoTpError, TimeoutKind};
use crate::pdu::{FlowStatus, Pdu, duration_to_st_min};

/// Outcome after processing a PDU.
#[derive(Debug)]
pub enum RxOutcome {
    /// Nothing to send back yet.
    None,
    /// Emit a flow control frame.
    SendFlowControl {
        /// Flow status to transmit back to the sender.
        status: FlowStatus,
        /// Block size for the sender (0 = unlimited).
        block_size: u8,
        /// Encoded STmin value to send (not a `Duration`).
        st_min: u8,
    },
    /// A message is complete.
    Completed(IsoTpDatagram),
}

/// In-progress segmented transfer.
#[derive(Debug)]
struct RxSession {
    buffer: RentedBuffer,
    expected_len: usize,
    written: usize,
    /// Frame length the sender uses, taken from the First Frame (RX_DL).
    rx_dl: usize,
    cf_capacity: usize,
    next_sn: u8,
    block_remaining: u8,
    frame_count: u32,
    started_at: Instant,
    deadline: Instant,
}

/// Receive state machine for one endpoint.
#[derive(Debug)]
pub struct Reassembler {
    allocator: Arc<dyn BufferAllocator>,
    block_size: u8,
    st_min: u8,
    n_cr: Duration,
    max_payload_len: usize,
    frame_len: usize,
    pci_offset: usize,
    suppress_flow_control: bool,
    strict_padding: bool,
    padding: bool,
    fd: bool,
    functional: bool,
    next_correlation: u64,
    session: Option<RxSession>,
}

impl Reassembler {
    /// Build a reassembler for frames whose PCI sits at `pci_offset`. With `functional`, only
    /// Single Frames are accepted.
    pub fn new(options: &IsoTpOptions, pci_offset: usize, functional: bool) -> Self {
        Self {
            allocator: options.allocator.clone(),
            block_size: options.block_size,
            st_min: duration_to_st_min(options.st_min),
            n_cr: options.n_cr,
            max_payload_len: options.max_payload_len,
            frame_len: options.frame_len,
            pci_offset,
            suppress_flow_control: options.suppress_flow_control,
            strict_padding: options.strict_padding,
            padding: options.padding.is_some(),
            fd: options.frame_kind == embedded_can_bus::FrameKind::Fd,
            functional,
            next_correlation: 0,
            session: None,
        }
    }

    /// True while a segmented transfer is in progress.
    pub fn is_receiving(&self) -> bool {
        self.session.is_some()
    }

    /// When the in-progress transfer times out (N_Cr).
    pub fn deadline(&self) -> Option<Instant> {
        self.session.as_ref().map(|s| s.deadline)
    }

    /// Abort the in-progress transfer if its deadline has passed. The rented buffer is released.
    pub fn on_timeout(&mut self, now: Instant) -> Option<IsoTpError> {
        let expired = self.session.as_ref().is_some_and(|s| now >= s.deadline);
        if !expired {
            return None;
        }
        if let Some(session) = self.session.take() {
            warn!(
                received = session.written,
                expected = session.expected_len,
                "N_Cr expired; dropping partial message"
            );
        }
        Some(IsoTpError::Timeout(TimeoutKind::NCr))
    }

    /// Drop any in-progress transfer.
    pub fn abort(&mut self) {
        if self.session.take().is_some() {
            debug!("receive session aborted");
        }
    }

    /// Check a received frame's length against the padding policy.
    pub fn check_padding(&self, frame_len: usize) -> Result<(), IsoTpError> {
        if self.strict_padding && self.padding && frame_len < self.frame_len {
            return Err(IsoTpError::PaddingError);
        }
        Ok(())
    }

    /// Handle an incoming non-flow-control PDU carried in a frame of `frame_len` bytes.
    ///
    /// Any error aborts the in-progress transfer.
    pub fn on_pdu(
        &mut self,
        pdu: Pdu<'_>,
        frame_len: usize,
        now: Instant,
    ) -> Result<RxOutcome, IsoTpError> {
        let result = match pdu {
            Pdu::SingleFrame { len, data } => self.handle_single(len, data, frame_len, now),
            Pdu::FirstFrame { len, data } => self.handle_first(len, data, frame_len, now),
            Pdu::ConsecutiveFrame { sn, data } => self.handle_consecutive(sn, data, frame_len, now),
            Pdu::FlowControl { .. } => Ok(RxOutcome::None),
        };
        if result.is_err() {
            self.session = None;
        }
        result
    }

    fn meta(&mut self, started_at: Instant, frame_count: u32, padded: bool) -> DatagramMeta {
        let correlation_id = self.next_correlation;
        self.next_correlation = self.next_correlation.wrapping_add(1);
        DatagramMeta {
            correlation_id,
            started_at,
            frame_count,
            functional: self.functional,
            fd: self.fd,
            padded,
        }
    }

    fn abandon_in_progress(&mut self, reason: &str) {
        if let Some(session) = self.session.take() {
            warn!(
                received = session.written,
                expected = session.expected_len,
                reason,
                "abandoning partial message"
            );
        }
    }

    fn handle_single(
        &mut self,
        len: usize,
        data: &[u8],
        frame_len: usize,
        now: Instant,
    ) -> Result<RxOutcome, IsoTpError> {
        self.abandon_in_progress("new single frame");
        if len > self.max_payload_len {
            return Err(IsoTpError::LocalOverflow {
                declared: len,
                max: self.max_payload_len,
            });
        }
        let mut buffer = RentedBuffer::rent(&self.allocator, len);
        buffer.as_mut_slice().copy_from_slice(&data[..len]);
        let meta = self.meta(now, 1, frame_len >= self.frame_len);
        trace!(len, "single frame received");
        Ok(RxOutcome::Completed(IsoTpDatagram::new(buffer, len, meta)))
    }

    fn handle_first(
        &mut self,
        len: usize,
        data: &[u8],
        frame_len: usize,
        now: Instant,
    ) -> Result<RxOutcome, IsoTpError> {
        if self.functional {
            debug!(len, "ignoring first frame on functional address");
            return Ok(RxOutcome::None);
        }
        self.abandon_in_progress("new first frame");
        if len > self.max_payload_len {
            return Err(IsoTpError::LocalOverflow {
                declared: len,
                max: self.max_payload_len,
            });
        }
        if data.len() >= len || frame_len < CLASSIC_MAX_LEN {
            return Err(IsoTpError::LengthMismatch);
        }
        let mut buffer = RentedBuffer::rent(&self.allocator, len);
        buffer.as_mut_slice()[..data.len()].copy_from_slice(data);
        self.session = Some(RxSession {
            buffer,
            expected_len: len,
            written: data.len(),
            rx_dl: frame_len,
            cf_capacity: frame_len.saturating_sub(1 + self.pci_offset),
            next_sn: 1,
            block_remaining: self.block_size,
            frame_count: 1,
            started_at: now,
            deadline: now + self.n_cr,
        });
        debug!(len, rx_dl = frame_len, "first frame received");

        if self.suppress_flow_control {
            return Ok(RxOutcome::None);
        }
        Ok(RxOutcome::SendFlowControl {
            status: FlowStatus::ClearToSend,
            block_size: self.block_size,
            st_min: self.st_min,
        })
    }

    fn handle_consecutive(
        &mut self,
        sn: u8,
        data: &[u8],
        frame_len: usize,
        now: Instant,
    ) -> Result<RxOutcome, IsoTpError> {
        let Some(session) = self.session.as_mut() else {
            trace!(sn, "consecutive frame without a transfer; ignored");
            return Ok(RxOutcome::None);
        };
        if sn != session.next_sn {
            warn!(expected = session.next_sn, actual = sn, "sequence error");
            return Err(IsoTpError::SequenceError {
                expected: session.next_sn,
                actual: sn,
            });
        }
        let remaining = session.expected_len - session.written;
        let chunk = min(data.len(), remaining);
        if chunk < remaining && data.len() < session.cf_capacity {
            return Err(IsoTpError::LengthMismatch);
        }
        let end = session.written + chunk;
        session.buffer.as_mut_slice()[session.written..end].copy_from_slice(&data[..chunk]);
        session.written = end;
        session.next_sn = (session.next_sn + 1) & 0x0F;
        session.frame_count += 1;
        session.deadline = now + self.n_cr;

        if session.written >= session.expected_len {
            let Some(done) = self.session.take() else {
                return Ok(RxOutcome::None);
            };
            let meta = self.meta(done.started_at, done.frame_count, frame_len >= done.rx_dl);
            debug!(len = done.expected_len, frames = done.frame_count, "message complete");
            return Ok(RxOutcome::Completed(IsoTpDatagram::new(
                done.buffer,
                done.expected_len,
                meta,
            )));
        }

        if self.block_size > 0 {
            session.block_remaining = session.block_remaining.saturating_sub(1);
            if session.block_remaining == 0 {
                session.block_remaining = self.block_size;
                if !self.suppress_flow_control {
                    return Ok(RxOutcome::SendFlowControl {
                        status: FlowStatus::ClearToSend,
                        block_size: self.block_size,
                        st_min: self.st_min,
                    });
                }
            }
        }

        Ok(RxOutcome::None)
    }
}
