//! Transport-layer error types.

use embedded_can_bus::BusError;
use thiserror::Error;

/// Timeout category identifiers (ISO-TP naming).
///
/// - `N_As` / `N_Ar`: a frame did not reach the wire in time (sender / receiver side).
/// - `N_Bs`: no Flow Control after a First Frame or a completed block.
/// - `N_Br`: the receiver could not send its Flow Control in time.
/// - `N_Cs` / `N_Cr`: pacing between consecutive frames was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Sender-side frame transmission.
    NAs,
    /// Receiver-side frame transmission.
    NAr,
    /// Waiting for Flow Control.
    NBs,
    /// Receiver preparing Flow Control.
    NBr,
    /// Sender pacing between consecutive frames.
    NCs,
    /// Waiting for the next consecutive frame.
    NCr,
}

impl core::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            TimeoutKind::NAs => "N_As",
            TimeoutKind::NAr => "N_Ar",
            TimeoutKind::NBs => "N_Bs",
            TimeoutKind::NBr => "N_Br",
            TimeoutKind::NCs => "N_Cs",
            TimeoutKind::NCr => "N_Cr",
        };
        f.write_str(name)
    }
}

/// Transport-layer errors surfaced by the ISO-TP implementation.
///
/// A failure aborts the session it occurred in; the channel stays usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IsoTpError {
    /// Deadline exceeded for the indicated phase.
    #[error("{0} timeout")]
    Timeout(TimeoutKind),
    /// No response arrived within the overall request timeout.
    #[error("request timed out")]
    RequestTimeout,
    /// Consecutive frame sequence number mismatch.
    #[error("sequence error: expected {expected}, got {actual}")]
    SequenceError {
        /// Sequence number the receiver was waiting for.
        expected: u8,
        /// Sequence number that arrived.
        actual: u8,
    },
    /// Declared length disagrees with the frame contents.
    #[error("length mismatch")]
    LengthMismatch,
    /// A padded frame was shorter than the configured frame length.
    #[error("padding error")]
    PaddingError,
    /// Reserved or out-of-place protocol control information.
    #[error("unexpected PCI 0x{0:02X}")]
    UnexpectedPci(u8),
    /// The peer answered with Flow Control OVERFLOW.
    #[error("remote receiver overflow")]
    RemoteOverflow,
    /// The peer announced more data than this endpoint accepts.
    #[error("local overflow: {declared} bytes announced, {max} accepted")]
    LocalOverflow {
        /// Announced message length.
        declared: usize,
        /// Configured maximum.
        max: usize,
    },
    /// Payload cannot be carried by this endpoint.
    #[error("payload too large: {len} bytes, limit {max}")]
    PayloadTooLarge {
        /// Requested payload length.
        len: usize,
        /// Largest payload accepted.
        max: usize,
    },
    /// Another send or request is already active on this channel.
    #[error("channel busy")]
    Busy,
    /// The channel has been closed.
    #[error("channel disposed")]
    Disposed,
    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// Malformed CAN frame content.
    #[error("invalid frame")]
    InvalidFrame,
    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The bus below failed.
    #[error(transparent)]
    Transport(#[from] BusError),
}
