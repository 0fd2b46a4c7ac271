//! Transmit-side segmentation for ISO-TP.
//!
//! [`Segmenter`] drives one outbound message through the queued bus: Single Frame, or First
//! Frame followed by flow-controlled Consecutive Frames. Every frame is submitted as a data frame
//! and awaited until the queue hands it to the port, so the N_As budget covers queueing as well
//! as the adapter.

use core::time::Duration;

use embedded_can_bus::{
    BusError, CanFrame, CancelToken, DeadlineTracker, FrameClass, QueuedCanBus, WriteHandle,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, trace};

use crate::config::IsoTpOptions;
use crate::errors::{IsoTpError, TimeoutKind};
use crate::pdu::{
    FlowStatus, FrameLayout, Pdu, ST_MIN_RESERVED_FALLBACK, encode, st_min_to_duration,
};

/// Flow Control as received from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    /// Flow status.
    pub status: FlowStatus,
    /// Block size (0 = unlimited).
    pub block_size: u8,
    /// Raw STmin byte.
    pub st_min: u8,
}

/// Segmenter state, reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// No active transfer.
    Idle,
    /// Single Frame submitted.
    SendingSingleFrame,
    /// First Frame submitted.
    SendingFirstFrame,
    /// Waiting for Flow Control.
    AwaitingFlowControl,
    /// Streaming Consecutive Frames.
    SendingConsecutiveFrames,
    /// Message fully handed to the bus.
    Complete,
    /// Transfer failed.
    Aborted,
}

/// Bookkeeping for an in-flight segmented transfer.
#[derive(Debug)]
pub struct TxSession {
    /// Expected full payload length.
    pub payload_len: usize,
    /// Current offset into payload.
    pub offset: usize,
    /// Next sequence number nibble.
    pub next_sn: u8,
    /// Block size negotiated (0 = unlimited).
    pub block_size: u8,
    /// Frames remaining before next FC.
    pub block_remaining: u8,
    /// Separation time between CFs.
    pub st_min: Duration,
    /// Count of Wait responses seen.
    pub wait_count: u8,
    /// Frames handed to the bus so far.
    pub frames: u32,
    /// Current state.
    pub state: TxState,
}

impl TxSession {
    /// Build a new session for `payload_len` bytes.
    pub fn new(payload_len: usize) -> Self {
        Self {
            payload_len,
            offset: 0,
            next_sn: 1,
            block_size: 0,
            block_remaining: 0,
            st_min: Duration::ZERO,
            wait_count: 0,
            frames: 0,
            state: TxState::Idle,
        }
    }

    fn enter(&mut self, state: TxState) {
        trace!(from = ?self.state, to = ?state, offset = self.offset, "tx state");
        self.state = state;
    }
}

/// Withdraws a queued frame when the sender stops waiting for it.
struct Submitted(WriteHandle);

impl Drop for Submitted {
    fn drop(&mut self) {
        // No effect once the frame has reached the port.
        self.0.cancel();
    }
}

/// One outbound transfer over a queued bus.
pub(crate) struct Segmenter<'a> {
    pub bus: &'a QueuedCanBus,
    pub layout: FrameLayout,
    pub options: &'a IsoTpOptions,
    pub functional: bool,
    pub flow_control: &'a mut mpsc::Receiver<FlowControl>,
    pub tracker: &'a DeadlineTracker,
    pub cancel: &'a CancelToken,
    pub shutdown: &'a CancelToken,
}

impl Segmenter<'_> {
    /// Send `payload`, returning the number of frames used.
    pub async fn run(&mut self, payload: &[u8]) -> Result<u32, IsoTpError> {
        let mut session = TxSession::new(payload.len());
        let result = self.drive(&mut session, payload).await;
        match &result {
            Ok(frames) => {
                session.enter(TxState::Complete);
                debug!(len = payload.len(), frames, "message sent");
            }
            Err(err) => {
                session.enter(TxState::Aborted);
                debug!(%err, sent = session.offset, len = payload.len(), "send aborted");
                self.tracker.clear();
            }
        }
        result
    }

    async fn drive(&mut self, session: &mut TxSession, payload: &[u8]) -> Result<u32, IsoTpError> {
        if payload.is_empty() {
            return Err(IsoTpError::InvalidFrame);
        }
        if payload.len() > self.options.max_payload_len {
            return Err(IsoTpError::PayloadTooLarge {
                len: payload.len(),
                max: self.options.max_payload_len,
            });
        }

        let sf_capacity = self.layout.single_frame_capacity();
        if payload.len() <= sf_capacity {
            session.enter(TxState::SendingSingleFrame);
            let frame = encode(
                &self.layout,
                &Pdu::SingleFrame {
                    len: payload.len(),
                    data: payload,
                },
            )?;
            self.emit(frame, None).await?;
            session.offset = payload.len();
            session.frames = 1;
            return Ok(session.frames);
        }
        if self.functional {
            return Err(IsoTpError::PayloadTooLarge {
                len: payload.len(),
                max: sf_capacity,
            });
        }

        // Flow Control left over from an earlier transfer must not drive this one.
        while self.flow_control.try_recv().is_ok() {}

        session.enter(TxState::SendingFirstFrame);
        let first = payload.len().min(self.layout.first_frame_capacity(payload.len()));
        let frame = encode(
            &self.layout,
            &Pdu::FirstFrame {
                len: payload.len(),
                data: &payload[..first],
            },
        )?;
        self.emit(frame, None).await?;
        session.offset = first;
        session.frames = 1;

        self.await_flow_control(session).await?;
        session.enter(TxState::SendingConsecutiveFrames);

        let cf_capacity = self.layout.consecutive_frame_capacity();
        let mut last_cf: Option<Instant> = None;
        while session.offset < payload.len() {
            if session.block_size > 0 && session.block_remaining == 0 {
                self.await_flow_control(session).await?;
                session.enter(TxState::SendingConsecutiveFrames);
            }

            if let Some(sent_at) = last_cf {
                self.pause_until(sent_at + session.st_min).await?;
            }

            let chunk = (payload.len() - session.offset).min(cf_capacity);
            let frame = encode(
                &self.layout,
                &Pdu::ConsecutiveFrame {
                    sn: session.next_sn,
                    data: &payload[session.offset..session.offset + chunk],
                },
            )?;
            self.emit(frame, Some(self.options.n_cs)).await?;

            last_cf = Some(Instant::now());
            session.offset += chunk;
            session.frames += 1;
            session.next_sn = (session.next_sn + 1) & 0x0F;
            if session.block_size > 0 {
                session.block_remaining = session.block_remaining.saturating_sub(1);
            }
        }

        Ok(session.frames)
    }

    async fn pause_until(&self, at: Instant) -> Result<(), IsoTpError> {
        if at <= Instant::now() {
            return Ok(());
        }
        tokio::select! {
            biased;
            err = interrupted(self.cancel, self.shutdown) => Err(err),
            _ = sleep_until(at) => Ok(()),
        }
    }

    async fn await_flow_control(&mut self, session: &mut TxSession) -> Result<(), IsoTpError> {
        session.enter(TxState::AwaitingFlowControl);
        let mut deadline = Instant::now() + self.options.n_bs;
        loop {
            let received = tokio::select! {
                biased;
                err = interrupted(self.cancel, self.shutdown) => return Err(err),
                fc = timeout_at(deadline, self.flow_control.recv()) => fc,
            };
            let fc = match received {
                Ok(Some(fc)) => fc,
                Ok(None) => return Err(IsoTpError::Disposed),
                Err(_) => return Err(IsoTpError::Timeout(TimeoutKind::NBs)),
            };
            match fc.status {
                FlowStatus::ClearToSend => {
                    let peer = st_min_to_duration(fc.st_min).unwrap_or(ST_MIN_RESERVED_FALLBACK);
                    session.block_size = fc.block_size;
                    session.block_remaining = fc.block_size;
                    session.st_min = peer.max(self.options.st_min_floor);
                    session.wait_count = 0;
                    trace!(
                        block_size = fc.block_size,
                        st_min_us = session.st_min.as_micros() as u64,
                        "flow control: clear to send"
                    );
                    return Ok(());
                }
                FlowStatus::Wait => {
                    session.wait_count = session.wait_count.saturating_add(1);
                    if session.wait_count > self.options.wft_max {
                        return Err(IsoTpError::Timeout(TimeoutKind::NBs));
                    }
                    trace!(waits = session.wait_count, "flow control: wait");
                    deadline = Instant::now() + self.options.n_bs;
                }
                FlowStatus::Overflow => return Err(IsoTpError::RemoteOverflow),
            }
        }
    }

    /// Submit one frame and wait until it is on the wire. `pacing` bounds consecutive frames
    /// by N_Cs in addition to N_As.
    async fn emit(&self, frame: CanFrame, pacing: Option<Duration>) -> Result<(), IsoTpError> {
        let ticket = self.tracker.enqueue();
        let now = Instant::now();
        let as_deadline = self
            .tracker
            .deadline()
            .unwrap_or(now + self.tracker.limit());
        let (deadline, kind) = match pacing {
            Some(n_cs) if now + n_cs < as_deadline => (now + n_cs, TimeoutKind::NCs),
            _ => (as_deadline, TimeoutKind::NAs),
        };
        let result = self.submit(frame, deadline, kind).await;
        if let Some(latency) = self.tracker.dequeue(ticket) {
            trace!(?frame, latency_us = latency.as_micros() as u64, "frame on the wire");
        }
        result
    }

    async fn submit(
        &self,
        frame: CanFrame,
        deadline: Instant,
        kind: TimeoutKind,
    ) -> Result<(), IsoTpError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let mut submitted = tokio::select! {
            biased;
            err = interrupted(self.cancel, self.shutdown) => return Err(err),
            queued = self.bus.enqueue(frame, FrameClass::Data, budget) => match queued {
                Ok(handle) => Submitted(handle),
                Err(BusError::QueueFull) => return Err(IsoTpError::Timeout(kind)),
                Err(err) => return Err(err.into()),
            },
        };
        tokio::select! {
            biased;
            err = interrupted(self.cancel, self.shutdown) => Err(err),
            done = timeout_at(deadline, &mut submitted.0) => match done {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.into()),
                Err(_) => Err(IsoTpError::Timeout(kind)),
            },
        }
    }
}

/// Resolves with the error matching whichever token fires first.
pub(crate) async fn interrupted(cancel: &CancelToken, shutdown: &CancelToken) -> IsoTpError {
    tokio::select! {
        _ = cancel.cancelled() => IsoTpError::Cancelled,
        _ = shutdown.cancelled() => IsoTpError::Disposed,
    }
}
