//! `can-iso-tp`: an async ISO-TP (ISO 15765-2) transport layer over a queued CAN bus.
//!
//! ISO-TP (“ISO Transport Protocol”) defines how to carry *larger* payloads over CAN by
//! segmenting messages into:
//! - a **Single Frame** (small payloads),
//! - a **First Frame** + multiple **Consecutive Frames** (larger payloads), and
//! - **Flow Control** frames to regulate pacing and batching.
//!
//! This crate provides:
//! - An endpoint facade ([`IsoTpChannel`]) that sends, receives and runs request/response
//!   exchanges over an [`embedded_can_bus::QueuedCanBus`].
//! - The building blocks it is made of: PCI encoding ([`pdu`]), the receive-side
//!   [`Reassembler`], transmit bookkeeping ([`TxSession`]), addressing helpers ([`address`])
//!   and receive buffer allocation ([`buffer`]).
//! - TOML link configuration ([`LinkConfig`]) describing a bus and its ISO-TP options.
//!
//! # Concepts
//! - **Addressing**: ISO-TP supports “normal” addressing (just CAN IDs), and extended/mixed modes
//!   where an additional *addressing byte* is inserted before the PCI. This crate models that via
//!   [`IsoTpEndpoint`] and [`AddressingMode`].
//! - **PCI offset**: when an addressing byte is present, the Protocol Control Information starts at
//!   byte 1 rather than byte 0. [`FrameLayout`] and [`pdu::decode`] keep encoding and decoding
//!   consistent.
//! - **Timers**: every wait is bounded by one of the N_As/N_Ar/N_Bs/N_Br/N_Cs/N_Cr timers in
//!   [`IsoTpOptions`]; expiry surfaces as [`IsoTpError::Timeout`] naming the timer.
//!
//! # Quick start
//! ```rust,no_run
//! use std::sync::Arc;
//! use embedded_can::StandardId;
//! use embedded_can_bus::{BusOptions, CancelToken, FrameKind, QueuedCanBus, VirtualBus};
//! use can_iso_tp::{IsoTpChannel, IsoTpEndpoint, IsoTpOptions};
//!
//! # async fn example() -> Result<(), can_iso_tp::IsoTpError> {
//! let wire = VirtualBus::new(FrameKind::Classic);
//! let bus = Arc::new(QueuedCanBus::new(wire.open_port(), &BusOptions::default())?);
//! let endpoint = IsoTpEndpoint::normal(
//!     StandardId::new(0x7E0).unwrap().into(),
//!     StandardId::new(0x7E8).unwrap().into(),
//! );
//! let channel = IsoTpChannel::new(bus, endpoint, IsoTpOptions::classic())?;
//!
//! let response = channel.request(&[0x22, 0xF1, 0x90], &CancelToken::new()).await?;
//! println!("{:02X?}", response.payload());
//! channel.close().await;
//! # Ok(()) }
//! ```

pub mod address;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod datagram;
pub mod errors;
pub mod pdu;
pub mod rx;
pub mod tx;

pub use address::{AddressingMode, FixedAddress, IsoTpEndpoint, TargetAddressType};
pub use buffer::{BufferAllocator, HeapAllocator, PooledAllocator, RentedBuffer};
pub use channel::IsoTpChannel;
pub use config::{ConfigError, IsoTpOptions, LinkConfig};
pub use datagram::IsoTpDatagram;
pub use errors::{IsoTpError, TimeoutKind};
pub use pdu::{FlowStatus, FrameLayout, Pdu};
pub use rx::{Reassembler, RxOutcome};
pub use tx::{FlowControl, TxSession, TxState};
