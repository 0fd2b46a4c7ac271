//! In-process CAN bus for tests, demos and hardware-less development.
//!
//! Every [`VirtualPort`] opened on a [`VirtualBus`] implements [`RawBusPort`]. A transmitted
//! frame is delivered to every *other* port whose acceptance filters let it through, and is
//! appended to a timestamped bus log.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use crate::config::BusOptions;
use crate::error::BusError;
use crate::frame::{CanFrame, FrameKind};
use crate::port::{IdMaskFilter, RawBusPort, filters_accept};

const PORT_BACKLOG: usize = 1024;

/// One frame as seen on the virtual wire.
#[derive(Debug, Clone, Copy)]
pub struct LoggedFrame {
    /// When the frame was put on the wire.
    pub at: Instant,
    /// Port that transmitted it (`None` for injected frames).
    pub port: Option<usize>,
    /// The frame.
    pub frame: CanFrame,
}

struct PortSlot {
    id: usize,
    tx: broadcast::Sender<CanFrame>,
    filters: Vec<IdMaskFilter>,
}

struct BusInner {
    mode: FrameKind,
    ports: Mutex<Vec<PortSlot>>,
    log: Mutex<Vec<LoggedFrame>>,
    next_port: AtomicUsize,
}

impl BusInner {
    fn deliver(&self, from: Option<usize>, frame: &CanFrame) {
        self.log.lock().push(LoggedFrame {
            at: Instant::now(),
            port: from,
            frame: *frame,
        });
        let ports = self.ports.lock();
        for slot in ports.iter() {
            if Some(slot.id) == from || !filters_accept(&slot.filters, embedded_can::Frame::id(frame)) {
                continue;
            }
            // No receivers yet is fine; the frame is simply not observed by that port.
            let _ = slot.tx.send(*frame);
        }
    }
}

/// A shared in-process bus.
#[derive(Clone)]
pub struct VirtualBus {
    inner: Arc<BusInner>,
}

impl VirtualBus {
    /// Create a bus running in the given protocol mode.
    pub fn new(mode: FrameKind) -> Self {
        Self {
            inner: Arc::new(BusInner {
                mode,
                ports: Mutex::new(Vec::new()),
                log: Mutex::new(Vec::new()),
                next_port: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a bus matching the mode in `options`.
    pub fn from_options(options: &BusOptions) -> Self {
        Self::new(options.mode)
    }

    /// Attach a new port.
    pub fn open_port(&self) -> Arc<VirtualPort> {
        let id = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = broadcast::channel(PORT_BACKLOG);
        self.inner.ports.lock().push(PortSlot {
            id,
            tx: tx.clone(),
            filters: Vec::new(),
        });
        Arc::new(VirtualPort {
            id,
            bus: self.inner.clone(),
            tx,
            reject_next: AtomicUsize::new(0),
        })
    }

    /// Put a frame on the wire as if an external node had sent it.
    pub fn inject(&self, frame: CanFrame) {
        self.inner.deliver(None, &frame);
    }

    /// Snapshot of every frame seen on the wire so far.
    pub fn log(&self) -> Vec<LoggedFrame> {
        self.inner.log.lock().clone()
    }

    /// Forget the bus log.
    pub fn clear_log(&self) {
        self.inner.log.lock().clear();
    }

    /// Protocol mode of the bus.
    pub fn mode(&self) -> FrameKind {
        self.inner.mode
    }
}

/// A port attached to a [`VirtualBus`].
pub struct VirtualPort {
    id: usize,
    bus: Arc<BusInner>,
    tx: broadcast::Sender<CanFrame>,
    reject_next: AtomicUsize,
}

impl VirtualPort {
    /// Port number on its bus.
    pub fn port_id(&self) -> usize {
        self.id
    }

    /// Make the next `count` transmit calls fail with [`BusError::TransmitRejected`].
    pub fn reject_next(&self, count: usize) {
        self.reject_next.store(count, Ordering::Release);
    }
}

impl RawBusPort for VirtualPort {
    fn transmit(&self, frame: &CanFrame) -> Result<(), BusError> {
        if self
            .reject_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BusError::TransmitRejected);
        }
        if frame.is_fd() && self.bus.mode == FrameKind::Classic {
            return Err(BusError::Unsupported("CAN FD frame on a classic bus"));
        }
        trace!(port = self.id, ?frame, "virtual transmit");
        self.bus.deliver(Some(self.id), frame);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.tx.subscribe()
    }

    fn set_filters(&self, filters: &[IdMaskFilter]) -> Result<(), BusError> {
        let mut ports = self.bus.ports.lock();
        if let Some(slot) = ports.iter_mut().find(|slot| slot.id == self.id) {
            slot.filters = filters.to_vec();
        }
        Ok(())
    }
}

impl Drop for VirtualPort {
    fn drop(&mut self) {
        self.bus.ports.lock().retain(|slot| slot.id != self.id);
    }
}
