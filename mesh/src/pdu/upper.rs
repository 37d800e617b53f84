use crate::app::ApplicationKeyIdentifier;
use crate::pdu::lower::{self, SzMic, MAX_SEGMENTS, SEGMENTED_ACCESS_CHUNK, SEGMENTED_CONTROL_CHUNK};
use crate::pdu::ParseError;
use crate::InsufficientBuffer;
use heapless::Vec;

pub const MAX_UPPER_ACCESS_LEN: usize = MAX_SEGMENTS * SEGMENTED_ACCESS_CHUNK;
pub const MAX_UPPER_CONTROL_LEN: usize = MAX_SEGMENTS * SEGMENTED_CONTROL_CHUNK;

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpperPDU {
    Control(UpperControl),
    Access(UpperAccess),
}

/// Unencrypted transport control payload.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UpperControl {
    pub(crate) opcode: lower::Opcode,
    pub(crate) parameters: Vec<u8, MAX_UPPER_CONTROL_LEN>,
}

impl UpperControl {
    pub fn new(opcode: lower::Opcode, parameters: &[u8]) -> Result<Self, InsufficientBuffer> {
        Ok(Self {
            opcode,
            parameters: Vec::from_slice(parameters).map_err(|_| InsufficientBuffer)?,
        })
    }

    /// `opcode || parameters`, the framing used for both directions.
    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        xmit.push(self.opcode as u8)
            .map_err(|_| InsufficientBuffer)?;
        xmit.extend_from_slice(&self.parameters)
            .map_err(|_| InsufficientBuffer)
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.is_empty() {
            return Err(ParseError::InvalidLength);
        }
        let opcode = lower::Opcode::parse(data[0] & 0b01111111).ok_or(ParseError::InvalidValue)?;
        Ok(Self {
            opcode,
            parameters: Vec::from_slice(&data[1..]).map_err(|_| ParseError::InvalidLength)?,
        })
    }
}

/// Encrypted access payload followed by its TransMIC.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UpperAccess {
    pub(crate) akf: bool,
    pub(crate) aid: ApplicationKeyIdentifier,
    pub(crate) szmic: SzMic,
    pub(crate) payload: Vec<u8, MAX_UPPER_ACCESS_LEN>,
}

impl UpperAccess {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Splits the payload into ciphertext and TransMIC.
    pub fn split_mic(&self, mic_len: usize) -> Result<(&[u8], &[u8]), ParseError> {
        if self.payload.len() <= mic_len {
            return Err(ParseError::InvalidLength);
        }
        Ok(self.payload.split_at(self.payload.len() - mic_len))
    }
}
