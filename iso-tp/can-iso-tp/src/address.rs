//! ISO-TP addressing modes and endpoint descriptions.

use embedded_can::{ExtendedId, Id};
use embedded_can_bus::raw_id;
use serde::{Deserialize, Serialize};

use crate::errors::IsoTpError;

const NORMAL_FIXED_PHYSICAL: u32 = 0x18DA_0000;
const NORMAL_FIXED_FUNCTIONAL: u32 = 0x18DB_0000;
const MIXED_PHYSICAL: u32 = 0x18CE_0000;
const MIXED_FUNCTIONAL: u32 = 0x18CD_0000;
const FIXED_BASE_MASK: u32 = 0x1FFF_0000;

/// How an endpoint places addressing information into CAN identifiers and payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    /// Plain CAN identifiers, no address byte.
    #[default]
    Normal,
    /// 29-bit `0x18DA_TA_SA` identifiers carrying source and target addresses.
    NormalFixed,
    /// 1-to-n addressing (`0x18DB_TA_SA` or an agreed functional identifier); Single Frames only.
    Functional,
    /// First payload byte carries the target address.
    Extended,
    /// First payload byte carries an address extension.
    Mixed,
}

impl AddressingMode {
    /// True when byte 0 of every frame is an address byte.
    pub fn uses_address_byte(self) -> bool {
        matches!(self, AddressingMode::Extended | AddressingMode::Mixed)
    }
}

/// Target address type of 29-bit fixed identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetAddressType {
    /// 1-to-1 communication.
    Physical,
    /// 1-to-n communication.
    Functional,
}

/// Source/target pair decoded from a 29-bit fixed identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedAddress {
    /// Physical or functional.
    pub target_type: TargetAddressType,
    /// Target address byte.
    pub target: u8,
    /// Source address byte.
    pub source: u8,
}

/// Encode a normal-fixed identifier (`0x18DA_TA_SA` / `0x18DB_TA_SA`).
pub fn normal_fixed_id(target_type: TargetAddressType, target: u8, source: u8) -> Id {
    let base = match target_type {
        TargetAddressType::Physical => NORMAL_FIXED_PHYSICAL,
        TargetAddressType::Functional => NORMAL_FIXED_FUNCTIONAL,
    };
    fixed_id(base, target, source)
}

/// Encode a 29-bit mixed identifier (`0x18CE_TA_SA` / `0x18CD_TA_SA`).
pub fn mixed_id(target_type: TargetAddressType, target: u8, source: u8) -> Id {
    let base = match target_type {
        TargetAddressType::Physical => MIXED_PHYSICAL,
        TargetAddressType::Functional => MIXED_FUNCTIONAL,
    };
    fixed_id(base, target, source)
}

fn fixed_id(base: u32, target: u8, source: u8) -> Id {
    let raw = base | (u32::from(target) << 8) | u32::from(source);
    // Bases are below 0x1FFF_0000, so every value fits in 29 bits.
    match ExtendedId::new(raw) {
        Some(id) => Id::Extended(id),
        None => Id::Extended(ExtendedId::MAX),
    }
}

/// Decode a normal-fixed or mixed 29-bit identifier.
pub fn decode_fixed_id(id: Id) -> Option<FixedAddress> {
    let Id::Extended(_) = id else {
        return None;
    };
    let raw = raw_id(id);
    let target_type = match raw & FIXED_BASE_MASK {
        NORMAL_FIXED_PHYSICAL | MIXED_PHYSICAL => TargetAddressType::Physical,
        NORMAL_FIXED_FUNCTIONAL | MIXED_FUNCTIONAL => TargetAddressType::Functional,
        _ => return None,
    };
    Some(FixedAddress {
        target_type,
        target: ((raw >> 8) & 0xFF) as u8,
        source: (raw & 0xFF) as u8,
    })
}

/// One side of an ISO-TP conversation: identifiers, addressing mode and address bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoTpEndpoint {
    /// Identifier used when transmitting.
    pub tx_id: Id,
    /// Identifier accepted when receiving.
    pub rx_id: Id,
    /// Addressing mode.
    pub mode: AddressingMode,
    /// Address byte prepended to transmitted frames (extended/mixed).
    pub tx_address: Option<u8>,
    /// Address byte expected on received frames (extended/mixed).
    pub rx_address: Option<u8>,
}

impl IsoTpEndpoint {
    /// Normal addressing with explicit Tx/Rx IDs.
    pub fn normal(tx_id: Id, rx_id: Id) -> Self {
        Self {
            tx_id,
            rx_id,
            mode: AddressingMode::Normal,
            tx_address: None,
            rx_address: None,
        }
    }

    /// Normal fixed 29-bit addressing from the local (`source`) to the remote (`target`) node.
    pub fn normal_fixed(source: u8, target: u8) -> Self {
        Self {
            tx_id: normal_fixed_id(TargetAddressType::Physical, target, source),
            rx_id: normal_fixed_id(TargetAddressType::Physical, source, target),
            mode: AddressingMode::NormalFixed,
            tx_address: None,
            rx_address: None,
        }
    }

    /// Functional addressing with explicit identifiers (e.g. `0x7DF` for OBD).
    pub fn functional(tx_id: Id, rx_id: Id) -> Self {
        Self {
            tx_id,
            rx_id,
            mode: AddressingMode::Functional,
            tx_address: None,
            rx_address: None,
        }
    }

    /// Functional 29-bit fixed addressing (`0x18DB_TA_SA`); responses arrive physically.
    pub fn functional_fixed(source: u8, target: u8) -> Self {
        Self {
            tx_id: normal_fixed_id(TargetAddressType::Functional, target, source),
            rx_id: normal_fixed_id(TargetAddressType::Physical, source, target),
            mode: AddressingMode::Functional,
            tx_address: None,
            rx_address: None,
        }
    }

    /// Extended addressing: `target` leads transmitted frames, `source` is expected on received
    /// ones.
    pub fn extended(tx_id: Id, rx_id: Id, source: u8, target: u8) -> Self {
        Self {
            tx_id,
            rx_id,
            mode: AddressingMode::Extended,
            tx_address: Some(target),
            rx_address: Some(source),
        }
    }

    /// Mixed 11-bit addressing with a shared address extension byte.
    pub fn mixed_11(tx_id: Id, rx_id: Id, address_extension: u8) -> Self {
        Self {
            tx_id,
            rx_id,
            mode: AddressingMode::Mixed,
            tx_address: Some(address_extension),
            rx_address: Some(address_extension),
        }
    }

    /// Mixed 29-bit addressing (`0x18CE_TA_SA` plus an address extension byte).
    pub fn mixed_29(source: u8, target: u8, address_extension: u8) -> Self {
        Self {
            tx_id: mixed_id(TargetAddressType::Physical, target, source),
            rx_id: mixed_id(TargetAddressType::Physical, source, target),
            mode: AddressingMode::Mixed,
            tx_address: Some(address_extension),
            rx_address: Some(address_extension),
        }
    }

    /// Byte offset of the PCI in transmitted frames.
    pub fn tx_pci_offset(&self) -> usize {
        usize::from(self.tx_address.is_some())
    }

    /// Byte offset of the PCI in received frames.
    pub fn rx_pci_offset(&self) -> usize {
        usize::from(self.rx_address.is_some())
    }

    /// True for 1-to-n endpoints.
    pub fn is_functional(&self) -> bool {
        self.mode == AddressingMode::Functional
    }

    /// True when the receive identifier is a 1-to-n fixed identifier.
    pub fn receives_functional(&self) -> bool {
        decode_fixed_id(self.rx_id)
            .is_some_and(|fixed| fixed.target_type == TargetAddressType::Functional)
    }

    /// Identifier used for Flow Control frames sent by this endpoint.
    ///
    /// A functional fixed endpoint receives physical responses, so their Flow Control goes back
    /// on the matching physical identifier.
    pub fn flow_control_id(&self) -> Id {
        if self.mode == AddressingMode::Functional
            && let Some(rx) = decode_fixed_id(self.rx_id)
            && rx.target_type == TargetAddressType::Physical
        {
            return normal_fixed_id(TargetAddressType::Physical, rx.source, rx.target);
        }
        self.tx_id
    }

    /// True when the transmit identifier is 29-bit.
    pub fn is_extended(&self) -> bool {
        matches!(self.tx_id, Id::Extended(_))
    }

    /// True when a received frame with `id` and `data` belongs to this endpoint.
    pub fn accepts(&self, id: Id, data: &[u8]) -> bool {
        if id != self.rx_id {
            return false;
        }
        match self.rx_address {
            Some(expected) => data.first() == Some(&expected),
            None => true,
        }
    }

    /// Reject inconsistent combinations.
    pub fn validate(&self) -> Result<(), IsoTpError> {
        let needs_byte = self.mode.uses_address_byte();
        if needs_byte != self.tx_address.is_some() || needs_byte != self.rx_address.is_some() {
            return Err(IsoTpError::InvalidConfig(
                "address bytes must be set exactly for extended and mixed addressing",
            ));
        }
        match self.mode {
            AddressingMode::NormalFixed => {
                if decode_fixed_id(self.tx_id).is_none() || decode_fixed_id(self.rx_id).is_none() {
                    return Err(IsoTpError::InvalidConfig(
                        "normal fixed addressing needs 0x18DA/0x18DB identifiers",
                    ));
                }
            }
            AddressingMode::Mixed => {
                if let (Id::Extended(_), Id::Extended(_)) = (self.tx_id, self.rx_id)
                    && (decode_fixed_id(self.tx_id).is_none()
                        || decode_fixed_id(self.rx_id).is_none())
                {
                    return Err(IsoTpError::InvalidConfig(
                        "29-bit mixed addressing needs 0x18CE/0x18CD identifiers",
                    ));
                }
            }
            _ => {}
        }
        if self.tx_id == self.rx_id && self.tx_address == self.rx_address {
            return Err(IsoTpError::InvalidConfig("tx and rx addressing are identical"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_can::StandardId;

    fn sid(raw: u16) -> Id {
        Id::Standard(StandardId::new(raw).unwrap())
    }

    #[test]
    fn normal_fixed_ids_mirror_each_other() {
        let ep = IsoTpEndpoint::normal_fixed(0xF1, 0x10);
        assert_eq!(raw_id(ep.tx_id), 0x18DA_10F1);
        assert_eq!(raw_id(ep.rx_id), 0x18DA_F110);
        assert!(ep.is_extended());
        assert!(ep.validate().is_ok());

        let decoded = decode_fixed_id(ep.tx_id).unwrap();
        assert_eq!(decoded.target_type, TargetAddressType::Physical);
        assert_eq!((decoded.target, decoded.source), (0x10, 0xF1));
    }

    #[test]
    fn functional_fixed_uses_18db() {
        let ep = IsoTpEndpoint::functional_fixed(0xF1, 0x33);
        assert_eq!(raw_id(ep.tx_id), 0x18DB_33F1);
        assert!(ep.is_functional());
        assert_eq!(
            decode_fixed_id(ep.tx_id).unwrap().target_type,
            TargetAddressType::Functional
        );
        assert!(!ep.receives_functional());
        assert_eq!(raw_id(ep.flow_control_id()), 0x18DA_33F1);
    }

    #[test]
    fn mixed_29_uses_18ce_and_address_byte() {
        let ep = IsoTpEndpoint::mixed_29(0xF1, 0x10, 0x42);
        assert_eq!(raw_id(ep.tx_id), 0x18CE_10F1);
        assert_eq!(ep.tx_pci_offset(), 1);
        assert!(ep.validate().is_ok());
    }

    #[test]
    fn accepts_checks_id_and_address_byte() {
        let ep = IsoTpEndpoint::extended(sid(0x700), sid(0x701), 0xF1, 0x10);
        assert!(ep.accepts(sid(0x701), &[0xF1, 0x02, 0x50, 0x01]));
        assert!(!ep.accepts(sid(0x701), &[0x10, 0x02, 0x50, 0x01]));
        assert!(!ep.accepts(sid(0x700), &[0xF1, 0x02]));
    }

    #[test]
    fn validate_rejects_inconsistent_endpoints() {
        let mut ep = IsoTpEndpoint::normal(sid(0x7E0), sid(0x7E0));
        assert!(ep.validate().is_err());
        ep.rx_id = sid(0x7E8);
        assert!(ep.validate().is_ok());
        ep.tx_address = Some(1);
        assert!(ep.validate().is_err());
        assert!(decode_fixed_id(sid(0x7E0)).is_none());
    }
}
