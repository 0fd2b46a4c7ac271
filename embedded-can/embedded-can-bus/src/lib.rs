//! `embedded-can-bus`: a raw CAN port contract plus the async plumbing protocol layers need on
//! top of it.
//!
//! The crate is built around [`RawBusPort`], the minimal surface a vendor SDK binding has to
//! offer (transmit one frame, fan out inbound frames, accept ID/mask filters). Above it sit:
//! - [`QueuedCanBus`]: an ordered, backpressured transmit queue drained by a single consumer
//!   task that enforces a minimum gap between data frames,
//! - [`DeadlineTracker`]: submission-to-wire latency bookkeeping for per-frame protocol timers,
//! - [`PeriodicTxScheduler`]: software cyclic transmission,
//! - [`VirtualBus`]: an in-process bus implementing [`RawBusPort`], used by tests and demos.
//!
//! Frames are [`CanFrame`] values implementing [`embedded_can::Frame`], extended with CAN FD
//! payloads up to 64 bytes.
//!
//! # Quick start
//! ```rust,ignore
//! use std::sync::Arc;
//! use embedded_can::{Frame, StandardId};
//! use embedded_can_bus::{BusOptions, CanFrame, FrameKind, QueuedCanBus, VirtualBus};
//!
//! # async fn demo() -> Result<(), embedded_can_bus::BusError> {
//! let bus = VirtualBus::new(FrameKind::Classic);
//! let queue = QueuedCanBus::new(bus.open_port(), &BusOptions::default())?;
//! let frame = CanFrame::new(StandardId::new(0x7E0).unwrap(), &[0x02, 0x10, 0x01]).unwrap();
//! queue.send(frame).await?;
//! queue.dispose().await?;
//! # Ok(())
//! # }
//! ```
//!
//! All background work runs on tokio; constructors that spawn tasks must be called from within
//! a runtime.

pub mod cancel;
pub mod config;
pub mod deadline;
pub mod error;
pub mod frame;
pub mod periodic;
pub mod port;
pub mod queued;
pub mod virtual_bus;

pub use cancel::CancelToken;
pub use config::BusOptions;
pub use deadline::{DeadlineTracker, Ticket};
pub use error::BusError;
pub use frame::{CLASSIC_MAX_LEN, CanFrame, FD_MAX_LEN, FrameFlags, FrameKind, fd_len_round_up, raw_id};
pub use periodic::{PeriodicTarget, PeriodicTxScheduler, PeriodicUpdate, Repeat};
pub use port::{IdMask, IdMaskFilter, RawBusPort};
pub use queued::{FrameClass, QueuedCanBus, WriteHandle};
pub use virtual_bus::{LoggedFrame, VirtualBus, VirtualPort};
