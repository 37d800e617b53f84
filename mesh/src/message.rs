//! Messages as seen by the application, with the intermediate PDUs of every layer.

use crate::address::{Address, LabelUuid, UnicastAddress};
use crate::app::ApplicationKeyIdentifier;
use crate::keys::{ApplicationKey, DeviceKey};
use crate::pdu::access::{AccessPayload, Opcode, MAX_ACCESS_PAYLOAD};
use crate::pdu::lower::{self, SegmentAck};
use crate::pdu::network::{PduType, MAX_NETWORK_PDU_LEN};
use crate::pdu::proxy::{ProxyConfigurationPDU, ProxyOpcode};
use crate::pdu::upper::{MAX_UPPER_ACCESS_LEN, MAX_UPPER_CONTROL_LEN};
use crate::InsufficientBuffer;
use heapless::Vec;
use std::collections::BTreeMap;

/// Longest lower transport PDU: a 4 octet segment header and a 12 octet segment.
pub const MAX_LOWER_PDU_LEN: usize = 16;

pub type NetworkPdu = Vec<u8, MAX_NETWORK_PDU_LEN>;
pub type LowerTransportPdu = Vec<u8, MAX_LOWER_PDU_LEN>;

/// Segment index to PDU, iterated in ascending segment order.
pub type SegmentMap<T> = BTreeMap<u8, T>;

/// `(iv_index << 24) | seq`, the value protected against replay.
pub fn seq_auth(iv_index: u32, seq: u32) -> u64 {
    ((iv_index as u64) << 24) | (seq & 0xFFFFFF) as u64
}

/// Metadata common to access and control messages.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageHeader {
    pub pdu_type: PduType,
    /// `None` takes the TTL of the source node when sent.
    pub ttl: Option<u8>,
    pub src: UnicastAddress,
    pub dst: Address,
    pub seq: u32,
    pub iv_index: u32,
    /// `None` selects the network key bound to the application key, or the primary one.
    pub net_key_index: Option<u16>,
    pub segmented: bool,
    pub network_pdus: SegmentMap<NetworkPdu>,
}

impl MessageHeader {
    pub fn new(src: UnicastAddress, dst: Address) -> Self {
        Self {
            pdu_type: PduType::Network,
            ttl: None,
            src,
            dst,
            seq: 0,
            iv_index: 0,
            net_key_index: None,
            segmented: false,
            network_pdus: Default::default(),
        }
    }

    pub fn seq_auth(&self) -> u64 {
        seq_auth(self.iv_index, self.seq)
    }
}

/// Key protecting an access message at the upper transport layer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AccessKey {
    Device(DeviceKey),
    Application(ApplicationKey),
}

impl AccessKey {
    pub fn akf(&self) -> bool {
        matches!(self, AccessKey::Application(_))
    }

    pub fn aid(&self) -> ApplicationKeyIdentifier {
        match self {
            AccessKey::Device(_) => ApplicationKeyIdentifier::default(),
            AccessKey::Application(key) => key.aid(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccessMessage {
    pub header: MessageHeader,
    pub key: AccessKey,
    /// Requests a 64 bit TransMIC. Only honoured for segmented messages.
    pub aszmic: bool,
    pub payload: AccessPayload,
    pub access_pdu: Vec<u8, MAX_ACCESS_PAYLOAD>,
    pub upper_transport_pdu: Vec<u8, MAX_UPPER_ACCESS_LEN>,
    pub lower_transport_pdus: SegmentMap<LowerTransportPdu>,
}

impl AccessMessage {
    pub fn new(
        src: UnicastAddress,
        dst: Address,
        key: AccessKey,
        opcode: Opcode,
        parameters: &[u8],
    ) -> Result<Self, InsufficientBuffer> {
        Ok(Self {
            header: MessageHeader::new(src, dst),
            key,
            aszmic: false,
            payload: AccessPayload::new(opcode, parameters)?,
            access_pdu: Vec::new(),
            upper_transport_pdu: Vec::new(),
            lower_transport_pdus: Default::default(),
        })
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.header.ttl.replace(ttl & 0x7F);
        self
    }

    pub fn with_aszmic(mut self, aszmic: bool) -> Self {
        self.aszmic = aszmic;
        self
    }

    pub fn with_net_key_index(mut self, index: u16) -> Self {
        self.header.net_key_index.replace(index);
        self
    }

    pub fn akf(&self) -> bool {
        self.key.akf()
    }

    pub fn aid(&self) -> ApplicationKeyIdentifier {
        self.key.aid()
    }

    pub fn opcode(&self) -> Opcode {
        self.payload.opcode
    }

    pub fn parameters(&self) -> &[u8] {
        &self.payload.parameters
    }

    pub fn label_uuid(&self) -> Option<&LabelUuid> {
        self.header.dst.label_uuid()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlOpcode {
    Transport(lower::Opcode),
    Proxy(ProxyOpcode),
}

impl ControlOpcode {
    pub fn value(&self) -> u8 {
        match self {
            ControlOpcode::Transport(opcode) => *opcode as u8,
            ControlOpcode::Proxy(opcode) => *opcode as u8,
        }
    }
}

/// Parsed form of the control payloads the transport itself understands.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportControlMessage {
    SegmentAcknowledgement(SegmentAck),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ControlMessage {
    pub header: MessageHeader,
    pub opcode: ControlOpcode,
    pub parameters: Vec<u8, MAX_UPPER_CONTROL_LEN>,
    /// `opcode || parameters`
    pub transport_control_pdu: Vec<u8, { MAX_UPPER_CONTROL_LEN + 1 }>,
    pub lower_transport_pdus: SegmentMap<LowerTransportPdu>,
    pub transport_control_message: Option<TransportControlMessage>,
}

impl ControlMessage {
    pub fn new(
        src: UnicastAddress,
        dst: Address,
        opcode: lower::Opcode,
        parameters: &[u8],
    ) -> Result<Self, InsufficientBuffer> {
        Ok(Self {
            header: MessageHeader::new(src, dst),
            opcode: ControlOpcode::Transport(opcode),
            parameters: Vec::from_slice(parameters).map_err(|_| InsufficientBuffer)?,
            transport_control_pdu: Vec::new(),
            lower_transport_pdus: Default::default(),
            transport_control_message: None,
        })
    }

    /// Proxy configuration messages travel with TTL 0 to the unassigned address.
    pub fn proxy_configuration(
        src: UnicastAddress,
        pdu: &ProxyConfigurationPDU,
    ) -> Result<Self, InsufficientBuffer> {
        let mut header = MessageHeader::new(src, Address::Unassigned);
        header.pdu_type = PduType::ProxyConfiguration;
        header.ttl.replace(0);
        Ok(Self {
            header,
            opcode: ControlOpcode::Proxy(pdu.opcode),
            parameters: Vec::from_slice(&pdu.parameters).map_err(|_| InsufficientBuffer)?,
            transport_control_pdu: Vec::new(),
            lower_transport_pdus: Default::default(),
            transport_control_message: None,
        })
    }

    pub(crate) fn segment_ack(
        src: UnicastAddress,
        dst: UnicastAddress,
        ttl: u8,
        ack: SegmentAck,
    ) -> Result<Self, InsufficientBuffer> {
        let mut parameters: Vec<u8, { SegmentAck::LEN }> = Vec::new();
        ack.emit(&mut parameters)?;
        let mut message = Self::new(
            src,
            dst.into(),
            lower::Opcode::SegmentedAcknowledgement,
            &parameters,
        )?;
        message.header.ttl.replace(ttl);
        message
            .transport_control_message
            .replace(TransportControlMessage::SegmentAcknowledgement(ack));
        Ok(message)
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.header.ttl.replace(ttl & 0x7F);
        self
    }

    pub fn with_net_key_index(mut self, index: u16) -> Self {
        self.header.net_key_index.replace(index);
        self
    }

    pub fn block_ack(&self) -> Option<&SegmentAck> {
        match &self.transport_control_message {
            Some(TransportControlMessage::SegmentAcknowledgement(ack)) => Some(ack),
            None => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Access(AccessMessage),
    Control(ControlMessage),
}

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Access(inner) => &inner.header,
            Message::Control(inner) => &inner.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        match self {
            Message::Access(inner) => &mut inner.header,
            Message::Control(inner) => &mut inner.header,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Message::Control(_))
    }

    pub fn lower_transport_pdus(&self) -> &SegmentMap<LowerTransportPdu> {
        match self {
            Message::Access(inner) => &inner.lower_transport_pdus,
            Message::Control(inner) => &inner.lower_transport_pdus,
        }
    }

    pub fn network_pdus(&self) -> &SegmentMap<NetworkPdu> {
        &self.header().network_pdus
    }
}

impl From<AccessMessage> for Message {
    fn from(message: AccessMessage) -> Self {
        Message::Access(message)
    }
}

impl From<ControlMessage> for Message {
    fn from(message: ControlMessage) -> Self {
        Message::Control(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::lower::BlockAck;

    #[test]
    fn test_seq_auth() {
        assert_eq!(0x0000_0001_000002, seq_auth(1, 2));
        // iv index never overflows into the sign or truncates
        assert_eq!(0xFFFF_FFFF_FFFFFF, seq_auth(u32::MAX, 0xFFFFFF));
        assert!(seq_auth(2, 0) > seq_auth(1, 0xFFFFFF));
    }

    #[test]
    fn test_proxy_configuration_header() {
        let pdu = ProxyConfigurationPDU::add_addresses(&[Address::from(0xC000)]).unwrap();
        let message = ControlMessage::proxy_configuration(UnicastAddress(0x0001), &pdu).unwrap();
        assert_eq!(PduType::ProxyConfiguration, message.header.pdu_type);
        assert_eq!(Some(0), message.header.ttl);
        assert_eq!(Address::Unassigned, message.header.dst);
        assert_eq!(0x01, message.opcode.value());
    }

    #[test]
    fn test_segment_ack_message() {
        let ack = SegmentAck {
            obo: false,
            seq_zero: 0x10,
            block_ack: BlockAck::new(0b111),
        };
        let message =
            ControlMessage::segment_ack(UnicastAddress(0x0002), UnicastAddress(0x0001), 4, ack)
                .unwrap();
        assert_eq!(Some(&ack), message.block_ack());
        assert_eq!(6, message.parameters.len());
        assert_eq!(Some(4), message.header.ttl);
    }
}
