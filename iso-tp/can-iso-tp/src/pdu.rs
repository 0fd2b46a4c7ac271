//! Encode and decode ISO-TP protocol control information.

use core::time::Duration;

use embedded_can::Id;
use embedded_can_bus::{CLASSIC_MAX_LEN, CanFrame, FD_MAX_LEN, FrameKind, fd_len_round_up};

use crate::errors::IsoTpError;

/// Largest length a First Frame can carry in its 12-bit length field.
pub const FF_DL_12BIT_MAX: usize = 0x0FFF;

/// Byte used to fill CAN FD frames up to the next valid DLC when padding is disabled.
pub const FD_FILL_BYTE: u8 = 0xCC;

/// STmin applied when a peer sends a reserved STmin value.
pub const ST_MIN_RESERVED_FALLBACK: Duration = Duration::from_millis(0x7F);

/// Flow control status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Clear to send more consecutive frames.
    ClearToSend,
    /// Wait before resuming.
    Wait,
    /// Abort due to overflow.
    Overflow,
}

/// Parsed ISO-TP Protocol Data Unit (PDU).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu<'a> {
    /// Single Frame payload.
    SingleFrame { len: usize, data: &'a [u8] },
    /// First Frame with total length and first bytes.
    FirstFrame { len: usize, data: &'a [u8] },
    /// Consecutive Frame carrying sequence and bytes.
    ConsecutiveFrame { sn: u8, data: &'a [u8] },
    /// Flow Control feedback.
    FlowControl {
        /// Flow status from receiver to sender.
        status: FlowStatus,
        /// Block size requested by receiver (0 = unlimited).
        block_size: u8,
        /// STmin (encoded byte form, not a `Duration`).
        st_min: u8,
    },
}

/// How PDUs are laid out in CAN frames on one direction of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// CAN identifier of produced frames.
    pub id: Id,
    /// Addressing byte placed before the PCI (extended/mixed addressing).
    pub prefix: Option<u8>,
    /// Classic or FD frames.
    pub kind: FrameKind,
    /// CAN payload size used for segmentation (8 classic, up to 64 FD).
    pub frame_len: usize,
    /// Pad byte; `None` sends frames at their natural length.
    pub padding: Option<u8>,
}

impl FrameLayout {
    /// Index within the CAN payload where the PCI starts.
    pub fn pci_offset(&self) -> usize {
        usize::from(self.prefix.is_some())
    }

    /// Max application bytes in a Single Frame.
    pub fn single_frame_capacity(&self) -> usize {
        single_frame_capacity(self.frame_len, self.pci_offset())
    }

    /// Max application bytes in a First Frame announcing `total` bytes.
    pub fn first_frame_capacity(&self, total: usize) -> usize {
        let header = if total > FF_DL_12BIT_MAX { 6 } else { 2 };
        self.frame_len.saturating_sub(header + self.pci_offset())
    }

    /// Max application bytes in a Consecutive Frame.
    pub fn consecutive_frame_capacity(&self) -> usize {
        self.frame_len.saturating_sub(1 + self.pci_offset())
    }
}

fn single_frame_capacity(frame_len: usize, offset: usize) -> usize {
    if frame_len > CLASSIC_MAX_LEN {
        frame_len.saturating_sub(2 + offset)
    } else {
        7usize.saturating_sub(offset)
    }
}

/// Build a CAN frame carrying `pdu` according to `layout`.
pub fn encode(layout: &FrameLayout, pdu: &Pdu<'_>) -> Result<CanFrame, IsoTpError> {
    let frame_len = layout.frame_len;
    if !(CLASSIC_MAX_LEN..=FD_MAX_LEN).contains(&frame_len) {
        return Err(IsoTpError::InvalidFrame);
    }
    let mut buf = [0u8; FD_MAX_LEN];
    let offset = layout.pci_offset();
    if let Some(prefix) = layout.prefix {
        buf[0] = prefix;
    }

    let used = match pdu {
        Pdu::SingleFrame { len, data } => {
            let payload_len = *len;
            if payload_len > data.len() {
                return Err(IsoTpError::InvalidFrame);
            }
            if payload_len <= 7usize.saturating_sub(offset) {
                buf[offset] = payload_len as u8;
                let used = offset + 1 + payload_len;
                buf[offset + 1..used].copy_from_slice(&data[..payload_len]);
                used
            } else {
                // SF_DL escape: nibble 0, length in the next byte.
                let needed = offset + 2 + payload_len;
                if frame_len <= CLASSIC_MAX_LEN || needed > frame_len {
                    return Err(IsoTpError::InvalidFrame);
                }
                buf[offset] = 0x00;
                buf[offset + 1] = payload_len as u8;
                buf[offset + 2..needed].copy_from_slice(&data[..payload_len]);
                needed
            }
        }
        Pdu::FirstFrame { len, data } => {
            let total = *len;
            if total <= single_frame_capacity(frame_len, offset)
                || total > u32::MAX as usize
                || data.is_empty()
            {
                return Err(IsoTpError::InvalidFrame);
            }
            let header = if total > FF_DL_12BIT_MAX {
                buf[offset] = 0x10;
                buf[offset + 1] = 0x00;
                buf[offset + 2..offset + 6].copy_from_slice(&(total as u32).to_be_bytes());
                offset + 6
            } else {
                buf[offset] = 0x10 | ((total >> 8) as u8 & 0x0F);
                buf[offset + 1] = (total & 0xFF) as u8;
                offset + 2
            };
            let data_len = data.len().min(frame_len.saturating_sub(header));
            buf[header..header + data_len].copy_from_slice(&data[..data_len]);
            header + data_len
        }
        Pdu::ConsecutiveFrame { sn, data } => {
            if data.len() > frame_len.saturating_sub(1 + offset) {
                return Err(IsoTpError::InvalidFrame);
            }
            buf[offset] = 0x20 | (*sn & 0x0F);
            let used = offset + 1 + data.len();
            buf[offset + 1..used].copy_from_slice(data);
            used
        }
        Pdu::FlowControl {
            status,
            block_size,
            st_min,
        } => {
            let status_nibble = match status {
                FlowStatus::ClearToSend => 0x0,
                FlowStatus::Wait => 0x1,
                FlowStatus::Overflow => 0x2,
            };
            buf[offset] = 0x30 | status_nibble;
            buf[offset + 1] = *block_size;
            buf[offset + 2] = *st_min;
            offset + 3
        }
    };

    let used = match (layout.padding, layout.kind) {
        (Some(pad), _) => {
            buf[used..frame_len].fill(pad);
            frame_len
        }
        (None, FrameKind::Fd) => {
            let rounded = fd_len_round_up(used).ok_or(IsoTpError::InvalidFrame)?;
            buf[used..rounded].fill(FD_FILL_BYTE);
            rounded
        }
        (None, FrameKind::Classic) => used,
    };

    CanFrame::with_kind(layout.id, &buf[..used], layout.kind).ok_or(IsoTpError::InvalidFrame)
}

/// Decode raw CAN data into a PDU view, interpreting the PCI at `pci_offset` (0 or 1).
///
/// Frames longer than 8 bytes are treated as CAN FD for the Single Frame length escape.
pub fn decode(data: &[u8], pci_offset: usize) -> Result<Pdu<'_>, IsoTpError> {
    if pci_offset > 1 || data.len() <= pci_offset {
        return Err(IsoTpError::InvalidFrame);
    }

    let pci = data[pci_offset];
    match pci >> 4 {
        0x0 => {
            let nibble = usize::from(pci & 0x0F);
            let (len, start) = if nibble == 0 {
                if data.len() <= CLASSIC_MAX_LEN || data.len() < pci_offset + 2 {
                    return Err(IsoTpError::LengthMismatch);
                }
                (usize::from(data[pci_offset + 1]), pci_offset + 2)
            } else {
                if nibble > 7usize.saturating_sub(pci_offset) {
                    return Err(IsoTpError::LengthMismatch);
                }
                (nibble, pci_offset + 1)
            };
            if len == 0 || data.len() < start + len {
                return Err(IsoTpError::LengthMismatch);
            }
            Ok(Pdu::SingleFrame {
                len,
                data: &data[start..start + len],
            })
        }
        0x1 => {
            if data.len() < pci_offset + 2 {
                return Err(IsoTpError::InvalidFrame);
            }
            let short = (usize::from(pci & 0x0F) << 8) | usize::from(data[pci_offset + 1]);
            let (len, start) = if short == 0 {
                let end = pci_offset + 6;
                if data.len() < end {
                    return Err(IsoTpError::InvalidFrame);
                }
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&data[pci_offset + 2..end]);
                (u32::from_be_bytes(raw) as usize, end)
            } else {
                (short, pci_offset + 2)
            };
            if len <= single_frame_capacity(data.len(), pci_offset) {
                return Err(IsoTpError::LengthMismatch);
            }
            Ok(Pdu::FirstFrame {
                len,
                data: &data[start..],
            })
        }
        0x2 => Ok(Pdu::ConsecutiveFrame {
            sn: pci & 0x0F,
            data: &data[pci_offset + 1..],
        }),
        0x3 => {
            if data.len() < pci_offset + 3 {
                return Err(IsoTpError::InvalidFrame);
            }
            let status = match pci & 0x0F {
                0x0 => FlowStatus::ClearToSend,
                0x1 => FlowStatus::Wait,
                0x2 => FlowStatus::Overflow,
                _ => return Err(IsoTpError::UnexpectedPci(pci)),
            };
            Ok(Pdu::FlowControl {
                status,
                block_size: data[pci_offset + 1],
                st_min: data[pci_offset + 2],
            })
        }
        _ => Err(IsoTpError::UnexpectedPci(pci)),
    }
}

/// Convert STmin byte to a Duration, returning None for reserved values.
pub fn st_min_to_duration(raw: u8) -> Option<Duration> {
    match raw {
        0x00..=0x7F => Some(Duration::from_millis(raw as u64)),
        0xF1..=0xF9 => Some(Duration::from_micros((raw as u64 - 0xF0) * 100)),
        _ => None,
    }
}

/// Encode a Duration into an STmin byte, clamping to the supported range.
pub fn duration_to_st_min(duration: Duration) -> u8 {
    let micros = duration.as_micros();
    if micros == 0 {
        return 0;
    }
    if (100..=900).contains(&micros) && micros.is_multiple_of(100) {
        return 0xF0 + (micros / 100) as u8;
    }
    let millis = duration.as_millis();
    if millis <= 0x7F { millis as u8 } else { 0x7F }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_can::{Frame, StandardId};

    fn layout(padding: Option<u8>) -> FrameLayout {
        FrameLayout {
            id: Id::Standard(StandardId::new(0x7E0).unwrap()),
            prefix: None,
            kind: FrameKind::Classic,
            frame_len: 8,
            padding,
        }
    }

    #[test]
    fn single_frame_is_exact_without_padding() {
        let frame = encode(
            &layout(None),
            &Pdu::SingleFrame {
                len: 3,
                data: &[0xAA, 0xBB, 0xCC],
            },
        )
        .unwrap();
        assert_eq!(frame.data(), &[0x03, 0xAA, 0xBB, 0xCC]);
        assert_eq!(
            decode(frame.data(), 0).unwrap(),
            Pdu::SingleFrame {
                len: 3,
                data: &[0xAA, 0xBB, 0xCC]
            }
        );
    }

    #[test]
    fn padding_fills_to_frame_len() {
        let frame = encode(
            &layout(Some(0x55)),
            &Pdu::FlowControl {
                status: FlowStatus::ClearToSend,
                block_size: 0,
                st_min: 0,
            },
        )
        .unwrap();
        assert_eq!(frame.data(), &[0x30, 0x00, 0x00, 0x55, 0x55, 0x55, 0x55, 0x55]);
    }

    #[test]
    fn first_frame_uses_escape_above_4095() {
        let layout = FrameLayout {
            kind: FrameKind::Fd,
            frame_len: 64,
            ..layout(None)
        };
        let payload = [0x11u8; 64];
        let frame = encode(
            &layout,
            &Pdu::FirstFrame {
                len: 5000,
                data: &payload,
            },
        )
        .unwrap();
        assert_eq!(frame.len(), 64);
        assert_eq!(&frame.data()[..6], &[0x10, 0x00, 0x00, 0x00, 0x13, 0x88]);
        match decode(frame.data(), 0).unwrap() {
            Pdu::FirstFrame { len, data } => {
                assert_eq!(len, 5000);
                assert_eq!(data.len(), 58);
            }
            other => panic!("unexpected PDU {other:?}"),
        }
        assert_eq!(layout.first_frame_capacity(5000), 58);
        assert_eq!(layout.first_frame_capacity(100), 62);
    }

    #[test]
    fn fd_single_frame_escape_and_dlc_rounding() {
        let layout = FrameLayout {
            kind: FrameKind::Fd,
            frame_len: 64,
            ..layout(None)
        };
        let payload = [0x42u8; 20];
        let frame = encode(
            &layout,
            &Pdu::SingleFrame {
                len: 20,
                data: &payload,
            },
        )
        .unwrap();
        // 2 PCI bytes + 20 data bytes round up to a 24-byte FD frame.
        assert_eq!(frame.len(), 24);
        assert_eq!(&frame.data()[..2], &[0x00, 20]);
        assert_eq!(&frame.data()[22..], &[FD_FILL_BYTE, FD_FILL_BYTE]);
        assert_eq!(
            decode(frame.data(), 0).unwrap(),
            Pdu::SingleFrame {
                len: 20,
                data: &payload
            }
        );
    }

    #[test]
    fn extended_addressing_shifts_pci() {
        let layout = FrameLayout {
            prefix: Some(0xF1),
            ..layout(None)
        };
        assert_eq!(layout.single_frame_capacity(), 6);
        assert_eq!(layout.consecutive_frame_capacity(), 6);
        let frame = encode(
            &layout,
            &Pdu::ConsecutiveFrame {
                sn: 0x12,
                data: &[1, 2],
            },
        )
        .unwrap();
        assert_eq!(frame.data(), &[0xF1, 0x22, 1, 2]);
        assert_eq!(
            decode(frame.data(), 1).unwrap(),
            Pdu::ConsecutiveFrame {
                sn: 2,
                data: &[1, 2]
            }
        );
    }

    #[test]
    fn decode_rejects_bad_frames() {
        assert_eq!(decode(&[0x10, 0x00], 0), Err(IsoTpError::InvalidFrame));
        assert_eq!(decode(&[0x10, 0x05, 1, 2, 3, 4, 5, 6], 0), Err(IsoTpError::LengthMismatch));
        assert_eq!(decode(&[0x05, 1, 2], 0), Err(IsoTpError::LengthMismatch));
        assert_eq!(decode(&[0x40, 0, 0], 0), Err(IsoTpError::UnexpectedPci(0x40)));
        assert_eq!(decode(&[0x35, 0, 0], 0), Err(IsoTpError::UnexpectedPci(0x35)));
    }

    #[test]
    fn st_min_conversions() {
        assert_eq!(st_min_to_duration(0x14), Some(Duration::from_millis(20)));
        assert_eq!(st_min_to_duration(0xF3), Some(Duration::from_micros(300)));
        assert!(st_min_to_duration(0x80).is_none());
        assert!(st_min_to_duration(0xF0).is_none());
        assert_eq!(duration_to_st_min(Duration::from_micros(500)), 0xF5);
        assert_eq!(duration_to_st_min(Duration::from_secs(1)), 0x7F);
    }
}
