//! Bus-level error type.

use thiserror::Error;

/// Errors produced by raw ports and the transmit queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The port refused the frame (mailbox full, bus-off, ...).
    #[error("transmit rejected by the port")]
    TransmitRejected,
    /// Driver-specific failure.
    #[error("driver error: {0}")]
    Driver(String),
    /// The transmit queue stayed full for the whole wait budget.
    #[error("transmit queue full")]
    QueueFull,
    /// The pending write was cancelled before it reached the port.
    #[error("pending write cancelled")]
    Cancelled,
    /// The queue or port has been disposed.
    #[error("bus disposed")]
    Disposed,
    /// The frame is not supported by this port (e.g. FD frame on a classic bus).
    #[error("unsupported frame: {0}")]
    Unsupported(&'static str),
    /// A background task failed unexpectedly.
    #[error("background task failed: {0}")]
    Background(String),
}
