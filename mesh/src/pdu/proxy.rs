use crate::address::Address;
use crate::pdu::ParseError;
use crate::InsufficientBuffer;
use heapless::Vec;

pub const MAX_PROXY_PARAMETERS: usize = 17;

/// Opcodes of proxy configuration messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProxyOpcode {
    SetFilterType = 0x00,
    AddAddressesToFilter = 0x01,
    RemoveAddressesFromFilter = 0x02,
    FilterStatus = 0x03,
}

impl ProxyOpcode {
    pub fn parse(data: u8) -> Result<Self, ParseError> {
        match data {
            0x00 => Ok(Self::SetFilterType),
            0x01 => Ok(Self::AddAddressesToFilter),
            0x02 => Ok(Self::RemoveAddressesFromFilter),
            0x03 => Ok(Self::FilterStatus),
            _ => Err(ParseError::InvalidValue),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterType {
    AcceptList = 0x00,
    RejectList = 0x01,
}

/// Proxy configuration message, always carried unsegmented.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProxyConfigurationPDU {
    pub opcode: ProxyOpcode,
    pub parameters: Vec<u8, MAX_PROXY_PARAMETERS>,
}

impl ProxyConfigurationPDU {
    pub fn new(opcode: ProxyOpcode, parameters: &[u8]) -> Result<Self, InsufficientBuffer> {
        Ok(Self {
            opcode,
            parameters: Vec::from_slice(parameters).map_err(|_| InsufficientBuffer)?,
        })
    }

    pub fn set_filter_type(filter_type: FilterType) -> Self {
        let mut parameters = Vec::new();
        // capacity is never zero
        let _ = parameters.push(filter_type as u8);
        Self {
            opcode: ProxyOpcode::SetFilterType,
            parameters,
        }
    }

    pub fn add_addresses(addresses: &[Address]) -> Result<Self, InsufficientBuffer> {
        Self::with_addresses(ProxyOpcode::AddAddressesToFilter, addresses)
    }

    pub fn remove_addresses(addresses: &[Address]) -> Result<Self, InsufficientBuffer> {
        Self::with_addresses(ProxyOpcode::RemoveAddressesFromFilter, addresses)
    }

    fn with_addresses(
        opcode: ProxyOpcode,
        addresses: &[Address],
    ) -> Result<Self, InsufficientBuffer> {
        let mut parameters = Vec::new();
        for address in addresses {
            parameters
                .extend_from_slice(&address.as_bytes())
                .map_err(|_| InsufficientBuffer)?;
        }
        Ok(Self { opcode, parameters })
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.is_empty() {
            return Err(ParseError::InvalidLength);
        }
        Ok(Self {
            opcode: ProxyOpcode::parse(data[0])?,
            parameters: Vec::from_slice(&data[1..]).map_err(|_| ParseError::InvalidLength)?,
        })
    }

    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        xmit.push(self.opcode as u8)
            .map_err(|_| InsufficientBuffer)?;
        xmit.extend_from_slice(&self.parameters)
            .map_err(|_| InsufficientBuffer)
    }
}
