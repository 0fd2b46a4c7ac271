//! Software cyclic transmission.
//!
//! [`PeriodicTxScheduler`] emits one frame at a fixed period from a cooperative tokio task.
//! Frame, period and repeat count can be changed while it runs. Transmit failures are logged and
//! the schedule continues.

use core::time::Duration;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::BusError;
use crate::frame::CanFrame;
use crate::port::RawBusPort;
use crate::queued::{FrameClass, QueuedCanBus};

/// Where periodic frames go.
#[derive(Clone)]
pub enum PeriodicTarget {
    /// Straight to a raw port, bypassing any queue.
    Port(Arc<dyn RawBusPort>),
    /// Through a transmit queue, sharing its ordering and gap.
    Queue(Arc<QueuedCanBus>),
}

impl PeriodicTarget {
    async fn emit(&self, frame: CanFrame) -> Result<(), BusError> {
        match self {
            PeriodicTarget::Port(port) => port.transmit(&frame),
            PeriodicTarget::Queue(queue) => {
                queue
                    .enqueue(frame, FrameClass::Data, Duration::ZERO)
                    .await?
                    .await
            }
        }
    }
}

/// How many times the frame is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Repeat {
    /// Until stopped.
    #[default]
    Forever,
    /// This many more emissions, then complete.
    Times(u32),
}

/// Partial change applied by [`PeriodicTxScheduler::update`]. `None` fields are left as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeriodicUpdate {
    /// New frame to emit.
    pub frame: Option<CanFrame>,
    /// New period.
    pub period: Option<Duration>,
    /// New remaining repeat count.
    pub repeat: Option<Repeat>,
}

#[derive(Debug)]
struct Schedule {
    frame: CanFrame,
    period: Duration,
    repeat: Repeat,
}

type CompletionCallback = Box<dyn Fn() + Send + Sync>;

struct Running {
    cancel: CancelToken,
    task: JoinHandle<()>,
}

/// Cooperative periodic transmitter.
pub struct PeriodicTxScheduler {
    target: PeriodicTarget,
    schedule: Arc<Mutex<Schedule>>,
    changed: Arc<Notify>,
    immediate: bool,
    running: Mutex<Option<Running>>,
    callbacks: Arc<Mutex<Vec<CompletionCallback>>>,
}

impl PeriodicTxScheduler {
    /// Create a stopped scheduler. With `immediate`, the first frame goes out as soon as the
    /// loop starts instead of one period later.
    pub fn new(target: PeriodicTarget, frame: CanFrame, period: Duration, immediate: bool) -> Self {
        Self {
            target,
            schedule: Arc::new(Mutex::new(Schedule {
                frame,
                period,
                repeat: Repeat::Forever,
            })),
            changed: Arc::new(Notify::new()),
            immediate,
            running: Mutex::new(None),
            callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Limit the number of emissions (builder form of [`PeriodicUpdate::repeat`]).
    pub fn with_repeat(self, repeat: Repeat) -> Self {
        self.schedule.lock().repeat = repeat;
        self
    }

    /// Register a callback fired once when a finite repeat count reaches zero.
    pub fn on_complete(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().push(Box::new(callback));
    }

    /// Start the loop. Starting a running scheduler is a no-op.
    ///
    /// A finite repeat count that has run out must be raised with [`Self::update`] before the
    /// scheduler can start again.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), BusError> {
        {
            let schedule = self.schedule.lock();
            if schedule.period.is_zero() {
                return Err(BusError::Unsupported("periodic transmit needs a non-zero period"));
            }
            if schedule.repeat == Repeat::Times(0) {
                return Err(BusError::Unsupported("repeat count exhausted"));
            }
        }
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Ok(());
        }
        let cancel = CancelToken::new();
        let task = tokio::spawn(run_periodic(
            self.target.clone(),
            self.schedule.clone(),
            self.changed.clone(),
            self.immediate,
            cancel.clone(),
            self.callbacks.clone(),
        ));
        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Change frame, period and/or repeat count without restarting the loop.
    pub fn update(&self, update: PeriodicUpdate) -> Result<(), BusError> {
        if update.period.is_some_and(|p| p.is_zero()) {
            return Err(BusError::Unsupported("periodic transmit needs a non-zero period"));
        }
        let mut schedule = self.schedule.lock();
        if let Some(frame) = update.frame {
            schedule.frame = frame;
        }
        if let Some(repeat) = update.repeat {
            schedule.repeat = repeat;
        }
        if let Some(period) = update.period {
            schedule.period = period;
            self.changed.notify_one();
        }
        Ok(())
    }

    /// True while the loop task is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Cancel the loop and wait for it to exit. No frame is emitted after this returns.
    /// Stopping a stopped scheduler does nothing.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { cancel, task }) = running {
            cancel.cancel();
            if let Err(err) = task.await {
                warn!(%err, "periodic transmit task ended abnormally");
            }
        }
    }
}

impl Drop for PeriodicTxScheduler {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

async fn run_periodic(
    target: PeriodicTarget,
    schedule: Arc<Mutex<Schedule>>,
    changed: Arc<Notify>,
    immediate: bool,
    cancel: CancelToken,
    callbacks: Arc<Mutex<Vec<CompletionCallback>>>,
) {
    let started = Instant::now();
    let mut last_emit: Option<Instant> = None;
    let mut next = if immediate {
        started
    } else {
        started + schedule.lock().period
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = changed.notified() => {
                let period = schedule.lock().period;
                next = last_emit.unwrap_or(started) + period;
                continue;
            }
            _ = sleep_until(next) => {}
        }

        let (frame, period, exhausted) = {
            let s = schedule.lock();
            (s.frame, s.period, s.repeat == Repeat::Times(0))
        };
        if exhausted {
            complete(&callbacks);
            break;
        }

        if let Err(err) = target.emit(frame).await {
            debug!(%err, ?frame, "periodic transmit failed; continuing");
        }
        let now = Instant::now();
        last_emit = Some(now);

        let exhausted = {
            let mut s = schedule.lock();
            match &mut s.repeat {
                Repeat::Times(n) => {
                    *n = n.saturating_sub(1);
                    *n == 0
                }
                Repeat::Forever => false,
            }
        };
        if exhausted {
            complete(&callbacks);
            break;
        }

        next += period;
        if next <= now {
            next = now + period;
        }
    }
}

fn complete(callbacks: &Mutex<Vec<CompletionCallback>>) {
    debug!("periodic transmit completed");
    for callback in callbacks.lock().iter() {
        callback();
    }
}
