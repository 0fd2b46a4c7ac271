//! Immutable CAN / CAN FD frame value.

use bitflags::bitflags;
use embedded_can::{Frame as EmbeddedFrame, Id};

/// Largest classic CAN payload.
pub const CLASSIC_MAX_LEN: usize = 8;
/// Largest CAN FD payload.
pub const FD_MAX_LEN: usize = 64;

/// Payload lengths representable by a CAN FD DLC above 8.
const FD_LENGTHS: [usize; 7] = [12, 16, 20, 24, 32, 48, 64];

/// Frame format on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// CAN 2.0 frame (up to 8 data bytes).
    #[default]
    Classic,
    /// CAN FD frame (up to 64 data bytes).
    Fd,
}

impl FrameKind {
    /// Maximum payload length for this kind.
    pub const fn max_len(self) -> usize {
        match self {
            FrameKind::Classic => CLASSIC_MAX_LEN,
            FrameKind::Fd => FD_MAX_LEN,
        }
    }
}

bitflags! {
    /// Frame flags beyond the identifier width.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        /// Remote transmission request (classic only).
        const RTR = 0b0001;
        /// Bit-rate switch for the data phase (FD only).
        const BRS = 0b0010;
        /// Error state indicator (FD only).
        const ESI = 0b0100;
    }
}

/// Round a payload length up to the next length a CAN FD DLC can express.
///
/// Returns `None` when `len` exceeds 64.
pub fn fd_len_round_up(len: usize) -> Option<usize> {
    if len <= CLASSIC_MAX_LEN {
        return Some(len);
    }
    FD_LENGTHS.iter().copied().find(|&l| l >= len)
}

/// Encode a payload length as a DLC nibble.
pub fn len_to_dlc(len: usize) -> Option<u8> {
    if len <= CLASSIC_MAX_LEN {
        return Some(len as u8);
    }
    FD_LENGTHS
        .iter()
        .position(|&l| l == len)
        .map(|idx| 9 + idx as u8)
}

/// A CAN frame as handed to and received from a [`crate::RawBusPort`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: Id,
    data: [u8; FD_MAX_LEN],
    len: u8,
    kind: FrameKind,
    flags: FrameFlags,
}

impl CanFrame {
    /// Build a CAN FD frame. The payload length must be a valid FD length (see
    /// [`fd_len_round_up`]).
    pub fn new_fd(id: impl Into<Id>, data: &[u8], flags: FrameFlags) -> Option<Self> {
        if fd_len_round_up(data.len()) != Some(data.len()) || flags.contains(FrameFlags::RTR) {
            return None;
        }
        let mut buf = [0u8; FD_MAX_LEN];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id: id.into(),
            data: buf,
            len: data.len() as u8,
            kind: FrameKind::Fd,
            flags,
        })
    }

    /// Build a frame of the given kind (classic frames ignore FD-only flags).
    pub fn with_kind(id: impl Into<Id>, data: &[u8], kind: FrameKind) -> Option<Self> {
        match kind {
            FrameKind::Classic => <Self as EmbeddedFrame>::new(id, data),
            FrameKind::Fd => Self::new_fd(id, data, FrameFlags::BRS),
        }
    }

    /// Frame format.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Frame flags.
    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    /// True for CAN FD frames.
    pub fn is_fd(&self) -> bool {
        self.kind == FrameKind::Fd
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True when the frame carries no payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw identifier value (11 or 29 bits).
    pub fn raw_id(&self) -> u32 {
        raw_id(self.id)
    }
}

/// Raw numeric value of an `embedded_can::Id`.
pub fn raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(sid) => u32::from(sid.as_raw()),
        Id::Extended(eid) => eid.as_raw(),
    }
}

impl EmbeddedFrame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > CLASSIC_MAX_LEN {
            return None;
        }
        let mut buf = [0u8; FD_MAX_LEN];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id: id.into(),
            data: buf,
            len: data.len() as u8,
            kind: FrameKind::Classic,
            flags: FrameFlags::empty(),
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > CLASSIC_MAX_LEN {
            return None;
        }
        Some(Self {
            id: id.into(),
            data: [0u8; FD_MAX_LEN],
            len: dlc as u8,
            kind: FrameKind::Classic,
            flags: FrameFlags::RTR,
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.flags.contains(FrameFlags::RTR)
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        len_to_dlc(self.len as usize).map_or(0, usize::from)
    }

    fn data(&self) -> &[u8] {
        if self.is_remote_frame() {
            &[]
        } else {
            &self.data[..self.len as usize]
        }
    }
}

impl core::fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let width = if self.is_extended() { 8 } else { 3 };
        write!(f, "CanFrame({:0width$X} {:?} [", self.raw_id(), self.kind)?;
        for (i, b) in self.data().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02X}")?;
        }
        write!(f, "])")
    }
}
