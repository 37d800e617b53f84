use crate::address::{Address, InvalidAddress};
use core::convert::TryFrom;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct UnicastAddress(pub(crate) u16);

impl core::fmt::LowerHex for UnicastAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        self.0.fmt(f)
    }
}

impl core::fmt::Display for UnicastAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        write!(f, "{:04x}", self.0)
    }
}

impl UnicastAddress {
    pub fn new(addr: u16) -> Result<Self, InvalidAddress> {
        Self::parse(addr.to_be_bytes())
    }

    pub fn as_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn is_unicast_address(data: &[u8; 2]) -> bool {
        data[0] & 0b10000000 == 0 && (data[0] != 0 || data[1] != 0)
    }

    pub fn parse(data: [u8; 2]) -> Result<Self, InvalidAddress> {
        if Self::is_unicast_address(&data) {
            Ok(UnicastAddress(u16::from_be_bytes(data)))
        } else {
            Err(InvalidAddress)
        }
    }
}

impl From<UnicastAddress> for Address {
    fn from(addr: UnicastAddress) -> Self {
        Address::Unicast(addr)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for UnicastAddress {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{=u16:04x}", self.0);
    }
}

impl From<UnicastAddress> for u16 {
    fn from(addr: UnicastAddress) -> Self {
        addr.0
    }
}

impl TryFrom<u16> for UnicastAddress {
    type Error = InvalidAddress;

    fn try_from(val: u16) -> Result<Self, Self::Error> {
        Self::new(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unicast_range() {
        assert!(UnicastAddress::new(0x0000).is_err());
        assert!(UnicastAddress::new(0x0001).is_ok());
        assert!(UnicastAddress::new(0x7FFF).is_ok());
        assert!(UnicastAddress::new(0x8000).is_err());
        assert_eq!("1201", UnicastAddress(0x1201).to_string());
    }
}
