//! Endpoint facade: one ISO-TP conversation over a shared queued bus.

use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use embedded_can::Frame;
use embedded_can_bus::{
    BusError, CanFrame, CancelToken, DeadlineTracker, FrameClass, FrameKind, IdMaskFilter,
    QueuedCanBus, raw_id,
};
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tracing::{debug, trace, warn};

use crate::address::IsoTpEndpoint;
use crate::config::IsoTpOptions;
use crate::datagram::IsoTpDatagram;
use crate::errors::{IsoTpError, TimeoutKind};
use crate::pdu::{FlowStatus, FrameLayout, Pdu, decode, encode};
use crate::rx::{Reassembler, RxOutcome};
use crate::tx::{FlowControl, Segmenter, interrupted};

const FLOW_CONTROL_BACKLOG: usize = 4;

type Inbound = Result<IsoTpDatagram, IsoTpError>;

/// Clears the busy flag when the owning send/request ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// An ISO-TP endpoint bound to a [`QueuedCanBus`].
///
/// One outbound transfer runs at a time ([`IsoTpChannel::send`] / [`IsoTpChannel::request`]
/// fail fast with [`IsoTpError::Busy`] otherwise). A background task reassembles inbound
/// messages, answers First Frames with Flow Control and routes received Flow Control to the
/// active sender. Completed messages, and inbound transfers that failed, are read with
/// [`IsoTpChannel::recv`].
pub struct IsoTpChannel {
    bus: Arc<QueuedCanBus>,
    endpoint: IsoTpEndpoint,
    options: IsoTpOptions,
    tx_layout: FrameLayout,
    busy: AtomicBool,
    flow_control: AsyncMutex<mpsc::Receiver<FlowControl>>,
    inbound: AsyncMutex<mpsc::Receiver<Inbound>>,
    tracker: DeadlineTracker,
    shutdown: CancelToken,
    filter: IdMaskFilter,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl IsoTpChannel {
    /// Open a channel for `endpoint` on `bus` and start its inbound task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        bus: Arc<QueuedCanBus>,
        endpoint: IsoTpEndpoint,
        options: IsoTpOptions,
    ) -> Result<Self, IsoTpError> {
        endpoint.validate()?;
        options.validate()?;
        if bus.is_disposed() {
            return Err(IsoTpError::Disposed);
        }
        if options.frame_kind == FrameKind::Fd && bus.mode() == FrameKind::Classic {
            return Err(IsoTpError::InvalidConfig("CAN FD transport on a classic bus"));
        }

        let filter = IdMaskFilter::exact(endpoint.rx_id);
        bus.install_filter(filter)?;
        let frames = bus.subscribe();
        let (fc_tx, fc_rx) = mpsc::channel(FLOW_CONTROL_BACKLOG);
        let (inbound_tx, inbound_rx) = mpsc::channel(options.rx_queue_depth);
        let shutdown = CancelToken::new();
        let tx_layout = options.tx_layout(&endpoint);

        let receiver = Receiver {
            bus: bus.clone(),
            endpoint,
            fc_layout: FrameLayout {
                id: endpoint.flow_control_id(),
                ..tx_layout
            },
            n_ar: options.n_ar,
            n_br: options.n_br,
            reassembler: Reassembler::new(
                &options,
                endpoint.rx_pci_offset(),
                endpoint.receives_functional(),
            ),
            frames,
            flow_control: fc_tx,
            inbound: inbound_tx,
            shutdown: shutdown.clone(),
        };
        let worker = tokio::spawn(receiver.run());

        debug!(
            tx_id = raw_id(endpoint.tx_id),
            rx_id = raw_id(endpoint.rx_id),
            mode = ?endpoint.mode,
            kind = ?options.frame_kind,
            "iso-tp channel open"
        );

        Ok(Self {
            tracker: DeadlineTracker::new(options.n_as),
            bus,
            endpoint,
            options,
            tx_layout,
            busy: AtomicBool::new(false),
            flow_control: AsyncMutex::new(fc_rx),
            inbound: AsyncMutex::new(inbound_rx),
            shutdown,
            filter,
            worker: parking_lot::Mutex::new(Some(worker)),
        })
    }

    /// Addressing of this channel.
    pub fn endpoint(&self) -> &IsoTpEndpoint {
        &self.endpoint
    }

    /// Protocol options of this channel.
    pub fn options(&self) -> &IsoTpOptions {
        &self.options
    }

    /// True once [`IsoTpChannel::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn begin(&self) -> Result<BusyGuard<'_>, IsoTpError> {
        if self.shutdown.is_cancelled() {
            return Err(IsoTpError::Disposed);
        }
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| IsoTpError::Busy)?;
        Ok(BusyGuard(&self.busy))
    }

    async fn transmit(&self, payload: &[u8], cancel: &CancelToken) -> Result<u32, IsoTpError> {
        let mut flow_control = self.flow_control.lock().await;
        let mut segmenter = Segmenter {
            bus: &self.bus,
            layout: self.tx_layout,
            options: &self.options,
            functional: self.endpoint.is_functional(),
            flow_control: &mut *flow_control,
            tracker: &self.tracker,
            cancel,
            shutdown: &self.shutdown,
        };
        segmenter.run(payload).await
    }

    /// Send one message. Resolves once the last frame has been handed to the port.
    pub async fn send(&self, payload: &[u8], cancel: &CancelToken) -> Result<(), IsoTpError> {
        let _busy = self.begin()?;
        self.transmit(payload, cancel).await.map(|_| ())
    }

    /// Send one message and wait for the next inbound message.
    ///
    /// Messages received before the request are discarded. The outbound transfer is bounded by
    /// the N_As/N_Bs/N_Cs timers; the wait for the response that follows is bounded by
    /// [`IsoTpOptions::effective_request_timeout`].
    pub async fn request(
        &self,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> Result<IsoTpDatagram, IsoTpError> {
        let _busy = self.begin()?;

        let mut inbound = tokio::select! {
            biased;
            err = interrupted(cancel, &self.shutdown) => return Err(err),
            guard = self.inbound.lock() => guard,
        };
        while let Ok(stale) = inbound.try_recv() {
            match stale {
                Ok(datagram) => debug!(len = datagram.len(), "discarding unsolicited message"),
                Err(err) => debug!(%err, "discarding earlier receive failure"),
            }
        }
        self.transmit(payload, cancel).await?;

        let deadline = Instant::now() + self.options.effective_request_timeout();
        let response = async {
            tokio::select! {
                biased;
                err = interrupted(cancel, &self.shutdown) => Err(err),
                response = inbound.recv() => response.unwrap_or(Err(IsoTpError::Disposed)),
            }
        };

        match timeout_at(deadline, response).await {
            Ok(result) => result,
            Err(_) => {
                debug!("request timed out");
                Err(IsoTpError::RequestTimeout)
            }
        }
    }

    /// Wait for the next inbound message, or the error that ended an inbound transfer.
    pub async fn recv(&self, cancel: &CancelToken) -> Result<IsoTpDatagram, IsoTpError> {
        if self.shutdown.is_cancelled() {
            return Err(IsoTpError::Disposed);
        }
        let mut inbound = tokio::select! {
            biased;
            err = interrupted(cancel, &self.shutdown) => return Err(err),
            guard = self.inbound.lock() => guard,
        };
        tokio::select! {
            biased;
            err = interrupted(cancel, &self.shutdown) => Err(err),
            received = inbound.recv() => received.unwrap_or(Err(IsoTpError::Disposed)),
        }
    }

    /// Stop the inbound task, abort any transfer and remove the channel's bus filter.
    /// Later operations fail with [`IsoTpError::Disposed`]. Closing twice is a no-op.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return;
        };
        if let Err(err) = self.bus.remove_filter(&self.filter) {
            debug!(%err, "bus filter not removed");
        }
        if let Err(err) = worker.await {
            warn!(%err, "inbound task ended abnormally");
        }
        self.tracker.clear();
        debug!(rx_id = raw_id(self.endpoint.rx_id), "iso-tp channel closed");
    }
}

impl Drop for IsoTpChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// State owned by the inbound task.
struct Receiver {
    bus: Arc<QueuedCanBus>,
    endpoint: IsoTpEndpoint,
    fc_layout: FrameLayout,
    n_ar: Duration,
    n_br: Duration,
    reassembler: Reassembler,
    frames: broadcast::Receiver<CanFrame>,
    flow_control: mpsc::Sender<FlowControl>,
    inbound: mpsc::Sender<Inbound>,
    shutdown: CancelToken,
}

impl Receiver {
    async fn run(mut self) {
        loop {
            let deadline = self.reassembler.deadline();
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(err) = self.reassembler.on_timeout(Instant::now()) {
                        self.deliver(Err(err));
                    }
                    continue;
                }
                received = self.frames.recv() => match received {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "inbound frames lost");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            self.on_frame(frame).await;
        }
        self.reassembler.abort();
        trace!("inbound task stopped");
    }

    async fn on_frame(&mut self, frame: CanFrame) {
        let data = frame.data();
        if !self.endpoint.accepts(frame.id(), data) {
            return;
        }
        let pdu = match decode(data, self.endpoint.rx_pci_offset()) {
            Ok(pdu) => pdu,
            Err(IsoTpError::InvalidFrame) => {
                trace!(?frame, "ignoring malformed frame");
                return;
            }
            Err(err) => {
                self.reassembler.abort();
                self.deliver(Err(err));
                return;
            }
        };

        if let Pdu::FlowControl {
            status,
            block_size,
            st_min,
        } = pdu
        {
            let fc = FlowControl {
                status,
                block_size,
                st_min,
            };
            if self.flow_control.try_send(fc).is_err() {
                trace!(?fc, "flow control dropped");
            }
            return;
        }

        if let Err(err) = self.reassembler.check_padding(data.len()) {
            self.reassembler.abort();
            self.deliver(Err(err));
            return;
        }

        let first_frame = matches!(pdu, Pdu::FirstFrame { .. });
        match self.reassembler.on_pdu(pdu, data.len(), Instant::now()) {
            Ok(RxOutcome::None) => {}
            Ok(RxOutcome::SendFlowControl {
                status,
                block_size,
                st_min,
            }) => {
                if let Err(err) = self.send_flow_control(status, block_size, st_min).await {
                    warn!(%err, "flow control not sent; dropping transfer");
                    self.reassembler.abort();
                    self.deliver(Err(err));
                }
            }
            Ok(RxOutcome::Completed(datagram)) => self.deliver(Ok(datagram)),
            Err(err @ IsoTpError::LocalOverflow { .. }) if first_frame => {
                if let Err(fc_err) = self.send_flow_control(FlowStatus::Overflow, 0, 0).await {
                    debug!(%fc_err, "overflow flow control not sent");
                }
                self.deliver(Err(err));
            }
            Err(err) => self.deliver(Err(err)),
        }
    }

    async fn send_flow_control(
        &self,
        status: FlowStatus,
        block_size: u8,
        st_min: u8,
    ) -> Result<(), IsoTpError> {
        let frame = encode(
            &self.fc_layout,
            &Pdu::FlowControl {
                status,
                block_size,
                st_min,
            },
        )?;
        let mut handle = match self.bus.enqueue(frame, FrameClass::Control, self.n_br).await {
            Ok(handle) => handle,
            Err(BusError::QueueFull) => return Err(IsoTpError::Timeout(TimeoutKind::NBr)),
            Err(err) => return Err(err.into()),
        };
        match timeout(self.n_ar, &mut handle).await {
            Ok(result) => result.map_err(IsoTpError::from),
            Err(_) => {
                handle.cancel();
                Err(IsoTpError::Timeout(TimeoutKind::NAr))
            }
        }
    }

    fn deliver(&self, item: Inbound) {
        match self.inbound.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(failed = dropped.is_err(), "receive queue full; inbound message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
