use crate::pdu::ParseError;
use crate::InsufficientBuffer;
use heapless::Vec;

/// Largest access payload an upper transport PDU can carry.
pub const MAX_ACCESS_PAYLOAD: usize = 380;

/// Access layer opcode, one to three octets on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Opcode {
    OneOctet(u8),
    TwoOctet(u8, u8),
    ThreeOctet(u8, u8, u8),
}

impl Opcode {
    /// Packs a numeric opcode, `0x8201` becomes two octets and `0xC00102` three.
    pub fn from_u32(opcode: u32) -> Self {
        if opcode < 0x80 {
            Opcode::OneOctet(opcode as u8)
        } else if opcode < 0x4000 || (opcode & 0xFFFC00) == 0x8000 {
            Opcode::TwoOctet(0x80 | ((opcode >> 8) & 0x3F) as u8, opcode as u8)
        } else {
            Opcode::ThreeOctet(
                0xC0 | ((opcode >> 16) & 0x3F) as u8,
                (opcode >> 8) as u8,
                opcode as u8,
            )
        }
    }

    /// Vendor opcode: six bit opcode followed by the little endian company identifier.
    pub fn vendor(opcode: u8, company_identifier: u16) -> Self {
        let cid = company_identifier.to_le_bytes();
        Opcode::ThreeOctet(opcode | 0xC0, cid[0], cid[1])
    }

    pub fn value(&self) -> u32 {
        match *self {
            Opcode::OneOctet(a) => a as u32,
            Opcode::TwoOctet(a, b) => u32::from_be_bytes([0, 0, a, b]),
            Opcode::ThreeOctet(a, b, c) => u32::from_be_bytes([0, a, b, c]),
        }
    }

    /// Opcode length implied by the most significant opcode octet.
    pub fn length_of(first: u8) -> usize {
        if first < 0x80 {
            1
        } else if first <= 0xBF {
            2
        } else {
            3
        }
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            Opcode::OneOctet(a) if !data.is_empty() && data[0] == *a => true,
            Opcode::TwoOctet(a, b) if data.len() >= 2 && data[0] == *a && data[1] == *b => true,
            Opcode::ThreeOctet(a, b, c)
                if data.len() >= 3 && data[0] == *a && data[1] == *b && data[2] == *c =>
            {
                true
            }
            _ => false,
        }
    }

    pub fn opcode_len(&self) -> usize {
        match self {
            Opcode::OneOctet(_) => 1,
            Opcode::TwoOctet(_, _) => 2,
            Opcode::ThreeOctet(_, _, _) => 3,
        }
    }

    pub fn split(data: &[u8]) -> Option<(Opcode, &[u8])> {
        let first = *data.first()?;
        match Self::length_of(first) {
            1 if first != 0x7F => Some((Opcode::OneOctet(first), &data[1..])),
            2 if data.len() >= 2 => Some((Opcode::TwoOctet(first, data[1]), &data[2..])),
            3 if data.len() >= 3 => Some((Opcode::ThreeOctet(first, data[1], data[2]), &data[3..])),
            _ => None,
        }
    }

    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        match self {
            Opcode::OneOctet(a) => {
                xmit.push(*a).map_err(|_| InsufficientBuffer)?;
            }
            Opcode::TwoOctet(a, b) => {
                xmit.extend_from_slice(&[*a, *b])
                    .map_err(|_| InsufficientBuffer)?;
            }
            Opcode::ThreeOctet(a, b, c) => {
                xmit.extend_from_slice(&[*a, *b, *c])
                    .map_err(|_| InsufficientBuffer)?;
            }
        }
        Ok(())
    }
}

/// Opcode and parameters, the plaintext of an upper transport access PDU.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AccessPayload {
    pub opcode: Opcode,
    pub parameters: Vec<u8, MAX_ACCESS_PAYLOAD>,
}

impl AccessPayload {
    pub fn new(opcode: Opcode, parameters: &[u8]) -> Result<Self, InsufficientBuffer> {
        Ok(Self {
            opcode,
            parameters: Vec::from_slice(parameters).map_err(|_| InsufficientBuffer)?,
        })
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let (opcode, parameters) = Opcode::split(data).ok_or(ParseError::InvalidPDUFormat)?;
        Ok(Self {
            opcode,
            parameters: Vec::from_slice(parameters).map_err(|_| ParseError::InsufficientBuffer)?,
        })
    }

    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        self.opcode.emit(xmit)?;
        xmit.extend_from_slice(&self.parameters)
            .map_err(|_| InsufficientBuffer)
    }
}
