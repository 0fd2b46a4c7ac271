//! The raw port contract every vendor back-end implements.

use embedded_can::Id;
use tokio::sync::broadcast;

use crate::error::BusError;
use crate::frame::{CanFrame, raw_id};

/// Acceptance mask, matching the width of the identifier it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdMask {
    /// 11-bit mask.
    Standard(u16),
    /// 29-bit mask.
    Extended(u32),
}

/// Identifier/mask acceptance filter.
///
/// A frame passes when `(frame_id & mask) == (id & mask)` and the identifier widths agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdMaskFilter {
    /// Identifier to compare against.
    pub id: Id,
    /// Bits of the identifier that must match.
    pub mask: IdMask,
}

impl IdMaskFilter {
    /// Filter accepting exactly one identifier.
    pub fn exact(id: Id) -> Self {
        let mask = match id {
            Id::Standard(_) => IdMask::Standard(0x7FF),
            Id::Extended(_) => IdMask::Extended(0x1FFF_FFFF),
        };
        Self { id, mask }
    }

    /// True when `id` passes this filter.
    pub fn matches(&self, id: Id) -> bool {
        match (self.id, self.mask, id) {
            (Id::Standard(_), IdMask::Standard(mask), Id::Standard(_)) => {
                let mask = u32::from(mask);
                raw_id(id) & mask == raw_id(self.id) & mask
            }
            (Id::Extended(_), IdMask::Extended(mask), Id::Extended(_)) => {
                raw_id(id) & mask == raw_id(self.id) & mask
            }
            _ => false,
        }
    }
}

/// True when `filters` is empty (accept all) or any filter accepts `id`.
pub fn filters_accept(filters: &[IdMaskFilter], id: Id) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(id))
}

/// A raw CAN port: one adapter channel as exposed by a vendor SDK.
///
/// Implementations must not block for long in [`RawBusPort::transmit`]; the queue above calls it
/// from its consumer task. Inbound frames are fanned out through a broadcast channel so several
/// protocol layers can listen to the same port.
pub trait RawBusPort: Send + Sync {
    /// Hand one frame to the hardware. `Err(BusError::TransmitRejected)` is the "not accepted"
    /// outcome; there is no retry at this level.
    fn transmit(&self, frame: &CanFrame) -> Result<(), BusError>;

    /// Subscribe to inbound frames.
    fn subscribe(&self) -> broadcast::Receiver<CanFrame>;

    /// Replace the acceptance filters. An empty slice accepts everything.
    fn set_filters(&self, filters: &[IdMaskFilter]) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_can::{ExtendedId, StandardId};

    fn sid(raw: u16) -> Id {
        Id::Standard(StandardId::new(raw).unwrap())
    }

    #[test]
    fn exact_filter_matches_only_its_id() {
        let f = IdMaskFilter::exact(sid(0x7E8));
        assert!(f.matches(sid(0x7E8)));
        assert!(!f.matches(sid(0x7E0)));
        assert!(!f.matches(Id::Extended(ExtendedId::new(0x7E8).unwrap())));
    }

    #[test]
    fn masked_filter_ignores_low_byte() {
        let f = IdMaskFilter {
            id: Id::Extended(ExtendedId::new(0x18DA_F100).unwrap()),
            mask: IdMask::Extended(0x1FFF_FF00),
        };
        assert!(f.matches(Id::Extended(ExtendedId::new(0x18DA_F133).unwrap())));
        assert!(!f.matches(Id::Extended(ExtendedId::new(0x18DB_F133).unwrap())));
    }

    #[test]
    fn empty_filter_set_accepts_all() {
        assert!(filters_accept(&[], sid(0x123)));
        assert!(!filters_accept(&[IdMaskFilter::exact(sid(0x1))], sid(0x123)));
    }
}
