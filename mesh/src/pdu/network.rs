use crate::address::{Address, UnicastAddress};
use crate::keys::NetworkKeyDerivatives;
use crate::pdu::lower::LowerPDU;
use crate::pdu::proxy::ProxyConfigurationPDU;
use crate::pdu::ParseError;
use crate::InsufficientBuffer;
use heapless::Vec;

/// Bytes before the encrypted region: pdu type, IVI/NID and the obfuscated header.
pub const NETWORK_HEADER_LEN: usize = 8;
pub const MAX_ENCRYPTED_LEN: usize = 28;
pub const MAX_NETWORK_PDU_LEN: usize = NETWORK_HEADER_LEN + MAX_ENCRYPTED_LEN;

/// Smallest decryptable payload: dst, one transport octet and a 32-bit NetMIC.
const MIN_ENCRYPTED_LEN: usize = 2 + 1 + 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PduType {
    Network = 0x00,
    ProxyConfiguration = 0x03,
}

impl PduType {
    pub fn parse(data: u8) -> Result<Self, ParseError> {
        match data {
            0x00 => Ok(Self::Network),
            0x03 => Ok(Self::ProxyConfiguration),
            _ => Err(ParseError::InvalidValue),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ObfuscatedAndEncryptedNetworkPDU {
    pub(crate) pdu_type: PduType,
    pub(crate) ivi: u8, /* 1 bit */
    pub(crate) nid: u8, /* 7 bits */
    pub(crate) obfuscated: [u8; 6],
    pub(crate) encrypted_and_mic: Vec<u8, MAX_ENCRYPTED_LEN>,
}

impl ObfuscatedAndEncryptedNetworkPDU {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < NETWORK_HEADER_LEN + MIN_ENCRYPTED_LEN {
            return Err(ParseError::InvalidLength);
        }
        let pdu_type = PduType::parse(data[0])?;
        let ivi = (data[1] & 0b10000000) >> 7;
        let nid = data[1] & 0b01111111;
        let mut obfuscated = [0; 6];
        obfuscated.copy_from_slice(&data[2..NETWORK_HEADER_LEN]);

        let encrypted_and_mic = Vec::from_slice(&data[NETWORK_HEADER_LEN..])
            .map_err(|_| ParseError::InvalidLength)?;

        Ok(Self {
            pdu_type,
            ivi,
            nid,
            obfuscated,
            encrypted_and_mic,
        })
    }

    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        xmit.push(self.pdu_type as u8)
            .map_err(|_| InsufficientBuffer)?;
        let ivi_nid = ((self.ivi & 0b0000001) << 7) | (self.nid & 0b01111111);
        xmit.push(ivi_nid).map_err(|_| InsufficientBuffer)?;
        xmit.extend_from_slice(&self.obfuscated)
            .map_err(|_| InsufficientBuffer)?;
        xmit.extend_from_slice(&self.encrypted_and_mic)
            .map_err(|_| InsufficientBuffer)?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportPDU {
    Lower(LowerPDU),
    Proxy(ProxyConfigurationPDU),
}

impl TransportPDU {
    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        match self {
            TransportPDU::Lower(inner) => inner.emit(xmit),
            TransportPDU::Proxy(inner) => inner.emit(xmit),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CleartextNetworkPDU {
    pub(crate) pdu_type: PduType,
    pub(crate) network_key: NetworkKeyDerivatives,
    pub(crate) net_key_index: u16,
    pub(crate) iv_index: u32,
    // ctl: bool /* 1 bit */ derived from transport_pdu
    pub(crate) ttl: u8,  /* 7 bits */
    pub(crate) seq: u32, /* 24 bits */
    pub(crate) src: UnicastAddress,
    pub(crate) dst: Address,
    pub(crate) transport_pdu: TransportPDU,
}

impl CleartextNetworkPDU {
    pub fn ivi(&self) -> u8 {
        (self.iv_index & 1) as u8
    }

    pub fn nid(&self) -> u8 {
        self.network_key.nid
    }

    pub fn ctl(&self) -> bool {
        match &self.transport_pdu {
            TransportPDU::Lower(LowerPDU::Access(_)) => false,
            TransportPDU::Lower(LowerPDU::Control(_)) => true,
            TransportPDU::Proxy(_) => true,
        }
    }

    /// First octet of the network header, `ctl << 7 | ttl`.
    pub fn ctl_ttl(&self) -> u8 {
        let ctl = if self.ctl() { 0b10000000 } else { 0b00000000 };
        ctl | (self.ttl & 0b01111111)
    }

    pub fn net_mic_len(&self) -> usize {
        net_mic_len(self.ctl())
    }

    /// Plaintext of the encrypted region: destination followed by the transport PDU.
    pub fn emit_payload<const N: usize>(
        &self,
        xmit: &mut Vec<u8, N>,
    ) -> Result<(), InsufficientBuffer> {
        xmit.extend_from_slice(&self.dst.as_bytes())
            .map_err(|_| InsufficientBuffer)?;
        self.transport_pdu.emit(xmit)
    }

    /// Reverse of [`CleartextNetworkPDU::emit_payload`] once the header is known.
    pub fn parse_payload(
        pdu_type: PduType,
        ctl: bool,
        payload: &[u8],
    ) -> Result<(Address, TransportPDU), ParseError> {
        if payload.len() < 3 {
            return Err(ParseError::InvalidLength);
        }
        let dst = Address::parse([payload[0], payload[1]]);
        let transport_pdu = match pdu_type {
            PduType::Network => TransportPDU::Lower(LowerPDU::parse(ctl, &payload[2..])?),
            PduType::ProxyConfiguration => {
                TransportPDU::Proxy(ProxyConfigurationPDU::parse(&payload[2..])?)
            }
        };
        Ok((dst, transport_pdu))
    }
}

/// NetMIC is 32 bits for access messages and 64 bits for control messages.
pub fn net_mic_len(ctl: bool) -> usize {
    if ctl {
        8
    } else {
        4
    }
}
