//! Completed inbound messages.

use tokio::time::Instant;

use crate::buffer::RentedBuffer;

/// A fully reassembled ISO-TP message.
///
/// Owns the reassembly buffer; dropping the datagram returns it to the allocator it was rented
/// from.
#[derive(Debug)]
pub struct IsoTpDatagram {
    buffer: RentedBuffer,
    len: usize,
    correlation_id: u64,
    started_at: Instant,
    completed_at: Instant,
    frame_count: u32,
    functional: bool,
    fd: bool,
    padded: bool,
}

/// Transfer facts recorded alongside a datagram.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DatagramMeta {
    pub correlation_id: u64,
    pub started_at: Instant,
    pub frame_count: u32,
    pub functional: bool,
    pub fd: bool,
    pub padded: bool,
}

impl IsoTpDatagram {
    pub(crate) fn new(buffer: RentedBuffer, len: usize, meta: DatagramMeta) -> Self {
        Self {
            buffer,
            len,
            correlation_id: meta.correlation_id,
            started_at: meta.started_at,
            completed_at: Instant::now(),
            frame_count: meta.frame_count,
            functional: meta.functional,
            fd: meta.fd,
            padded: meta.padded,
        }
    }

    /// Message payload.
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_slice()[..self.len]
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Per-channel sequence number of this message.
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// When the first frame of the message arrived.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// When the last frame of the message arrived.
    pub fn completed_at(&self) -> Instant {
        self.completed_at
    }

    /// Number of CAN frames the message was carried in.
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Received on a functional (1-to-n) endpoint.
    pub fn is_functional(&self) -> bool {
        self.functional
    }

    /// Carried in CAN FD frames.
    pub fn is_fd(&self) -> bool {
        self.fd
    }

    /// Frames were padded to the full frame length.
    pub fn is_padded(&self) -> bool {
        self.padded
    }

    /// Copy the payload out, releasing the buffer.
    pub fn into_vec(self) -> Vec<u8> {
        self.payload().to_vec()
    }
}

impl AsRef<[u8]> for IsoTpDatagram {
    fn as_ref(&self) -> &[u8] {
        self.payload()
    }
}
