//! Ordered, backpressured transmit queue in front of a [`RawBusPort`].
//!
//! Any number of producers call [`QueuedCanBus::enqueue`]; a single consumer task pops writes in
//! FIFO order, waits out the configured minimum gap since the previous data frame and hands each
//! frame to the port. The returned [`WriteHandle`] resolves once that hand-off happened (or
//! failed). The queue never retries a rejected frame.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::config::BusOptions;
use crate::error::BusError;
use crate::frame::{CanFrame, FrameKind};
use crate::port::{IdMaskFilter, RawBusPort};

/// Scheduling class of a queued frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Payload-carrying frame; subject to the minimum inter-frame gap.
    Data,
    /// Protocol control frame (ISO-TP Flow Control); exempt from the gap.
    Control,
}

struct PendingWrite {
    frame: CanFrame,
    class: FrameClass,
    enqueued_at: Instant,
    cancelled: Arc<AtomicBool>,
    done: oneshot::Sender<Result<(), BusError>>,
}

impl PendingWrite {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn resolve(self, result: Result<(), BusError>) {
        // The waiter may have gone away; the outcome is then simply dropped.
        let _ = self.done.send(result);
    }
}

/// Completion handle for one queued frame.
///
/// Awaiting it yields `Ok(())` once the frame was accepted by the port, or the error that
/// prevented it. Dropping the handle does **not** withdraw the frame; call
/// [`WriteHandle::cancel`] for that.
#[derive(Debug)]
pub struct WriteHandle {
    rx: oneshot::Receiver<Result<(), BusError>>,
    cancelled: Arc<AtomicBool>,
    enqueued_at: Instant,
}

impl WriteHandle {
    /// Withdraw the frame if it has not reached the port yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// When the frame entered the queue.
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }
}

impl Future for WriteHandle {
    type Output = Result<(), BusError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(BusError::Disposed)))
    }
}

/// Single-consumer FIFO transmit queue owning one raw port.
pub struct QueuedCanBus {
    port: Arc<dyn RawBusPort>,
    tx: mpsc::Sender<PendingWrite>,
    shutdown: CancelToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    filters: Mutex<Vec<IdMaskFilter>>,
    mode: FrameKind,
    min_gap: Duration,
}

impl QueuedCanBus {
    /// Take ownership of `port` and spawn the consumer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(port: Arc<dyn RawBusPort>, options: &BusOptions) -> Result<Self, BusError> {
        options
            .validate()
            .map_err(|msg| BusError::Driver(msg.to_string()))?;
        let (tx, rx) = mpsc::channel(options.queue_capacity);
        let shutdown = CancelToken::new();
        let min_gap = options.min_frame_gap();
        let worker = tokio::spawn(run_consumer(
            port.clone(),
            rx,
            min_gap,
            shutdown.clone(),
        ));
        debug!(
            channel = %options.channel,
            capacity = options.queue_capacity,
            min_gap_us = options.min_frame_gap_us,
            "transmit queue started"
        );
        Ok(Self {
            port,
            tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
            filters: Mutex::new(Vec::new()),
            mode: options.mode,
            min_gap,
        })
    }

    /// Queue a frame.
    ///
    /// Waits up to `wait_budget` for queue capacity; fails with [`BusError::QueueFull`] after
    /// that. The returned handle resolves when the frame has been handed to the port.
    pub async fn enqueue(
        &self,
        frame: CanFrame,
        class: FrameClass,
        wait_budget: Duration,
    ) -> Result<WriteHandle, BusError> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Disposed);
        }
        if frame.is_fd() && self.mode == FrameKind::Classic {
            return Err(BusError::Unsupported("CAN FD frame on a classic bus"));
        }
        let permit = match timeout(wait_budget, self.tx.reserve()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(BusError::Disposed),
            Err(_elapsed) => return Err(BusError::QueueFull),
        };
        let (done, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let enqueued_at = Instant::now();
        permit.send(PendingWrite {
            frame,
            class,
            enqueued_at,
            cancelled: cancelled.clone(),
            done,
        });
        Ok(WriteHandle {
            rx,
            cancelled,
            enqueued_at,
        })
    }

    /// Queue a data frame and wait until it has been handed to the port.
    pub async fn send(&self, frame: CanFrame) -> Result<(), BusError> {
        self.enqueue(frame, FrameClass::Data, Duration::MAX)
            .await?
            .await
    }

    /// Number of writes currently waiting in the queue.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Configured minimum gap between data frames.
    pub fn min_gap(&self) -> Duration {
        self.min_gap
    }

    /// Protocol mode of the underlying bus.
    pub fn mode(&self) -> FrameKind {
        self.mode
    }

    /// Subscribe to inbound frames of the underlying port.
    pub fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.port.subscribe()
    }

    /// Add an acceptance filter; the port receives the union of all installed filters.
    pub fn install_filter(&self, filter: IdMaskFilter) -> Result<(), BusError> {
        let mut filters = self.filters.lock();
        if !filters.contains(&filter) {
            filters.push(filter);
        }
        self.port.set_filters(&filters)
    }

    /// Remove a previously installed acceptance filter.
    pub fn remove_filter(&self, filter: &IdMaskFilter) -> Result<(), BusError> {
        let mut filters = self.filters.lock();
        filters.retain(|f| f != filter);
        self.port.set_filters(&filters)
    }

    /// True once [`QueuedCanBus::dispose`] has started.
    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting frames, resolve every unsent write with [`BusError::Disposed`] and join
    /// the consumer task once it has drained the queue. Calling it again is a no-op.
    pub async fn dispose(&self) -> Result<(), BusError> {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        match worker {
            Some(handle) => handle
                .await
                .map_err(|err| BusError::Background(err.to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for QueuedCanBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_consumer(
    port: Arc<dyn RawBusPort>,
    mut rx: mpsc::Receiver<PendingWrite>,
    min_gap: Duration,
    shutdown: CancelToken,
) {
    let mut last_data_tx: Option<Instant> = None;
    loop {
        let write = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(write) => write,
                None => break,
            },
        };
        if write.is_cancelled() {
            write.resolve(Err(BusError::Cancelled));
            continue;
        }

        if write.class == FrameClass::Data
            && !min_gap.is_zero()
            && let Some(prev) = last_data_tx
        {
            let ready_at = prev + min_gap;
            let interrupted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => true,
                _ = sleep_until(ready_at) => false,
            };
            if interrupted {
                write.resolve(Err(BusError::Disposed));
                break;
            }
            if write.is_cancelled() {
                write.resolve(Err(BusError::Cancelled));
                continue;
            }
        }

        let result = port.transmit(&write.frame);
        let now = Instant::now();
        if write.class == FrameClass::Data {
            last_data_tx = Some(now);
        }
        match &result {
            Ok(()) => trace!(
                frame = ?write.frame,
                queued_us = now.duration_since(write.enqueued_at).as_micros() as u64,
                "frame transmitted"
            ),
            Err(err) => warn!(frame = ?write.frame, %err, "port rejected frame"),
        }
        write.resolve(result);
    }

    rx.close();
    let mut drained = 0usize;
    while let Some(write) = rx.recv().await {
        let outcome = if write.is_cancelled() {
            BusError::Cancelled
        } else {
            BusError::Disposed
        };
        write.resolve(Err(outcome));
        drained += 1;
    }
    debug!(drained, "transmit queue stopped");
}
