pub mod group_address;
pub mod unicast_address;
pub mod virtual_address;

pub use group_address::GroupAddress;
pub use unicast_address::UnicastAddress;
pub use virtual_address::{LabelUuid, VirtualAddress};

use crate::pdu::ParseError;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidAddress;

impl From<InvalidAddress> for ParseError {
    fn from(_: InvalidAddress) -> Self {
        ParseError::InvalidValue
    }
}

/// Destination of a mesh message.
///
/// A [`LabelUuid`] destination is carried on the wire as its virtual address; the label
/// itself only takes part in upper transport authentication.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Address {
    Unassigned,
    Unicast(UnicastAddress),
    Virtual(VirtualAddress),
    Group(GroupAddress),
    LabelUuid(LabelUuid),
}

impl Address {
    pub fn as_bytes(&self) -> [u8; 2] {
        match self {
            Address::Unassigned => [0, 0],
            Address::Unicast(inner) => inner.as_bytes(),
            Address::Virtual(inner) => inner.as_bytes(),
            Address::Group(inner) => inner.as_bytes(),
            Address::LabelUuid(inner) => inner.virtual_address().as_bytes(),
        }
    }

    pub fn as_u16(&self) -> u16 {
        u16::from_be_bytes(self.as_bytes())
    }

    pub fn parse(data: [u8; 2]) -> Self {
        let val = u16::from_be_bytes(data);
        if val == 0 {
            Self::Unassigned
        } else if UnicastAddress::is_unicast_address(&data) {
            Self::Unicast(UnicastAddress(val))
        } else if GroupAddress::is_group_address(&data) {
            Self::Group(GroupAddress::parse_unchecked(data))
        } else {
            Self::Virtual(VirtualAddress(val))
        }
    }

    pub fn is_unicast(&self) -> bool {
        matches!(self, Address::Unicast(_))
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Address::Virtual(_) | Address::LabelUuid(_))
    }

    pub fn label_uuid(&self) -> Option<&LabelUuid> {
        match self {
            Address::LabelUuid(label) => Some(label),
            _ => None,
        }
    }
}

impl From<u16> for Address {
    fn from(val: u16) -> Self {
        Self::parse(val.to_be_bytes())
    }
}
