use crate::address::{Address, InvalidAddress};
use crate::crypto;
use crate::pdu::ParseError;
use cmac::crypto_mac::InvalidKeyLength;
use core::convert::TryInto;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct VirtualAddress(pub(crate) u16);

impl VirtualAddress {
    pub fn as_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn is_virtual_address(data: &[u8; 2]) -> bool {
        data[0] & 0b11000000 == 0b10000000
    }

    pub fn parse(data: [u8; 2]) -> Result<Self, InvalidAddress> {
        if Self::is_virtual_address(&data) {
            Ok(VirtualAddress(u16::from_be_bytes(data)))
        } else {
            Err(InvalidAddress)
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for VirtualAddress {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{=u16:04x}", self.0)
    }
}

impl From<VirtualAddress> for Address {
    fn from(addr: VirtualAddress) -> Self {
        Address::Virtual(addr)
    }
}

/// A label UUID together with the virtual address hashed from it.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct LabelUuid {
    uuid: [u8; 16],
    address: VirtualAddress,
}

#[cfg(feature = "defmt")]
impl defmt::Format for LabelUuid {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "label={=[u8]:x}; {}", self.uuid, self.address)
    }
}

impl LabelUuid {
    pub fn parse(uuid: &[u8]) -> Result<Self, ParseError> {
        let uuid: [u8; 16] = uuid.try_into().map_err(|_| ParseError::InvalidLength)?;
        Self::new(uuid).map_err(|_| ParseError::InvalidValue)
    }

    pub fn new(uuid: [u8; 16]) -> Result<Self, InvalidKeyLength> {
        Ok(Self {
            uuid,
            address: Self::virtual_address_of(uuid)?,
        })
    }

    pub fn label_uuid(&self) -> &[u8; 16] {
        &self.uuid
    }

    pub fn virtual_address(&self) -> VirtualAddress {
        self.address
    }

    pub fn virtual_address_of(uuid: [u8; 16]) -> Result<VirtualAddress, InvalidKeyLength> {
        let salt = crypto::s1(b"vtad")?;
        let hash = crypto::aes_cmac(&salt.into_bytes(), &uuid)?.into_bytes();
        let high = (0b00111111 & hash[14]) | 0b10000000;
        Ok(VirtualAddress(u16::from_be_bytes([high, hash[15]])))
    }
}

impl From<LabelUuid> for Address {
    fn from(label: LabelUuid) -> Self {
        Address::LabelUuid(label)
    }
}
