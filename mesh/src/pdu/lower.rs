use crate::app::ApplicationKeyIdentifier;
use crate::pdu::ParseError;
use crate::InsufficientBuffer;
use heapless::Vec;

/// Upper transport access PDUs up to this size are sent unsegmented.
pub const MAX_UNSEGMENTED_ACCESS_PAYLOAD: usize = 12;
/// Payload carried by each segment of a segmented access message.
pub const SEGMENTED_ACCESS_CHUNK: usize = 12;
pub const MAX_UNSEGMENTED_CONTROL_PAYLOAD: usize = 11;
pub const SEGMENTED_CONTROL_CHUNK: usize = 8;
pub const MAX_SEGMENTS: usize = 32;

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LowerPDU {
    Access(LowerAccess),
    Control(LowerControl),
}

impl LowerPDU {
    pub fn parse(ctl: bool, data: &[u8]) -> Result<Self, ParseError> {
        if data.len() >= 2 {
            let seg = data[0] & 0b10000000 != 0;

            match (ctl, seg) {
                (true, false) => Ok(LowerPDU::Control(Self::parse_unsegmented_control(data)?)),
                (true, true) => Ok(LowerPDU::Control(Self::parse_segmented_control(data)?)),
                (false, false) => Ok(LowerPDU::Access(Self::parse_unsegmented_access(data)?)),
                (false, true) => Ok(LowerPDU::Access(Self::parse_segmented_access(data)?)),
            }
        } else if ctl && data.len() == 1 {
            // parameterless control message
            Ok(LowerPDU::Control(Self::parse_unsegmented_control(data)?))
        } else {
            Err(ParseError::InvalidLength)
        }
    }

    fn parse_unsegmented_control(data: &[u8]) -> Result<LowerControl, ParseError> {
        let opcode = Opcode::parse(data[0] & 0b01111111).ok_or(ParseError::InvalidValue)?;
        let parameters = &data[1..];
        Ok(LowerControl {
            opcode,
            message: LowerControlMessage::Unsegmented {
                parameters: Vec::from_slice(parameters).map_err(|_| ParseError::InvalidLength)?,
            },
        })
    }

    fn parse_segmented_control(data: &[u8]) -> Result<LowerControl, ParseError> {
        let opcode = Opcode::parse(data[0] & 0b01111111).ok_or(ParseError::InvalidValue)?;
        let (_, header) = SegmentHeader::parse(data)?;
        Ok(LowerControl {
            opcode,
            message: LowerControlMessage::Segmented {
                seq_zero: header.seq_zero,
                seg_o: header.seg_o,
                seg_n: header.seg_n,
                segment_m: Vec::from_slice(&data[4..]).map_err(|_| ParseError::InvalidLength)?,
            },
        })
    }

    fn parse_unsegmented_access(data: &[u8]) -> Result<LowerAccess, ParseError> {
        let akf = data[0] & 0b01000000 != 0;
        let aid = data[0] & 0b00111111;
        Ok(LowerAccess {
            akf,
            aid: aid.into(),
            message: LowerAccessMessage::Unsegmented(
                Vec::from_slice(&data[1..]).map_err(|_| ParseError::InvalidLength)?,
            ),
        })
    }

    fn parse_segmented_access(data: &[u8]) -> Result<LowerAccess, ParseError> {
        let akf = data[0] & 0b01000000 != 0;
        let aid = data[0] & 0b00111111;
        let (szmic, header) = SegmentHeader::parse(data)?;

        Ok(LowerAccess {
            akf,
            aid: aid.into(),
            message: LowerAccessMessage::Segmented {
                szmic,
                seq_zero: header.seq_zero,
                seg_o: header.seg_o,
                seg_n: header.seg_n,
                segment_m: Vec::from_slice(&data[4..]).map_err(|_| ParseError::InvalidLength)?,
            },
        })
    }

    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        match self {
            LowerPDU::Access(inner) => inner.emit(xmit),
            LowerPDU::Control(inner) => inner.emit(xmit),
        }
    }

    pub fn is_segmented(&self) -> bool {
        match self {
            LowerPDU::Access(inner) => {
                matches!(inner.message, LowerAccessMessage::Segmented { .. })
            }
            LowerPDU::Control(inner) => {
                matches!(inner.message, LowerControlMessage::Segmented { .. })
            }
        }
    }
}

/// The three octets following the first octet of every segmented lower transport PDU.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SegmentHeader {
    pub seq_zero: u16,
    pub seg_o: u8,
    pub seg_n: u8,
}

impl SegmentHeader {
    fn parse(data: &[u8]) -> Result<(SzMic, Self), ParseError> {
        if data.len() < 5 {
            return Err(ParseError::InvalidLength);
        }
        let szmic = SzMic::parse(data[1] & 0b10000000);
        let seq_zero = u16::from_be_bytes([data[1] & 0b01111111, data[2] & 0b11111100]) >> 2;
        let seg_o = (u16::from_be_bytes([data[2] & 0b00000011, data[3] & 0b11100000]) >> 5) as u8;
        let seg_n = data[3] & 0b00011111;
        if seg_o > seg_n {
            return Err(ParseError::InvalidValue);
        }
        Ok((
            szmic,
            Self {
                seq_zero,
                seg_o,
                seg_n,
            },
        ))
    }

    fn emit<const N: usize>(
        &self,
        szmic: SzMic,
        xmit: &mut Vec<u8, N>,
    ) -> Result<(), InsufficientBuffer> {
        let mut header = [0; 3];
        // szmic + first 7 bits of seq_zero
        header[0] = match szmic {
            SzMic::Bit32 => 0b00000000,
            SzMic::Bit64 => 0b10000000,
        } | ((self.seq_zero >> 6) & 0b1111111) as u8;
        // last 6 bits of seq_zero + first 2 bits of seg_o
        header[1] = ((self.seq_zero << 2) & 0b11111100) as u8 | ((self.seg_o >> 3) & 0b11);
        header[2] = ((self.seg_o & 0b00000111) << 5) | (self.seg_n & 0b00011111);
        xmit.extend_from_slice(&header)
            .map_err(|_| InsufficientBuffer)
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LowerAccess {
    pub(crate) akf: bool,
    pub(crate) aid: ApplicationKeyIdentifier,
    pub(crate) message: LowerAccessMessage,
}

impl LowerAccess {
    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        let seg = match self.message {
            LowerAccessMessage::Unsegmented(_) => 0b00000000,
            LowerAccessMessage::Segmented { .. } => 0b10000000,
        };
        let akf = if self.akf { 0b01000000 } else { 0b00000000 };
        xmit.push(seg | akf | u8::from(self.aid))
            .map_err(|_| InsufficientBuffer)?;
        self.message.emit(xmit)
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LowerControl {
    pub(crate) opcode: Opcode,
    pub(crate) message: LowerControlMessage,
}

impl LowerControl {
    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        match &self.message {
            LowerControlMessage::Unsegmented { parameters } => {
                xmit.push(self.opcode as u8)
                    .map_err(|_| InsufficientBuffer)?;
                xmit.extend_from_slice(parameters)
                    .map_err(|_| InsufficientBuffer)?;
            }
            LowerControlMessage::Segmented {
                seq_zero,
                seg_o,
                seg_n,
                segment_m,
            } => {
                xmit.push(0b10000000 | self.opcode as u8)
                    .map_err(|_| InsufficientBuffer)?;
                SegmentHeader {
                    seq_zero: *seq_zero,
                    seg_o: *seg_o,
                    seg_n: *seg_n,
                }
                .emit(SzMic::Bit32, xmit)?;
                xmit.extend_from_slice(segment_m)
                    .map_err(|_| InsufficientBuffer)?;
            }
        }

        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SzMic {
    Bit32,
    Bit64,
}

impl SzMic {
    pub fn parse(data: u8) -> Self {
        if data != 0 {
            Self::Bit64
        } else {
            Self::Bit32
        }
    }

    /// TransMIC length selected by this flag.
    pub fn mic_len(&self) -> usize {
        match self {
            SzMic::Bit32 => 4,
            SzMic::Bit64 => 8,
        }
    }
}

impl From<bool> for SzMic {
    fn from(aszmic: bool) -> Self {
        if aszmic {
            Self::Bit64
        } else {
            Self::Bit32
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LowerAccessMessage {
    Unsegmented(Vec<u8, 15>),
    Segmented {
        szmic: SzMic,
        seq_zero: u16,
        seg_o: u8,
        seg_n: u8,
        segment_m: Vec<u8, SEGMENTED_ACCESS_CHUNK>,
    },
}

impl LowerAccessMessage {
    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        match self {
            LowerAccessMessage::Unsegmented(inner) => xmit
                .extend_from_slice(inner)
                .map_err(|_| InsufficientBuffer),
            LowerAccessMessage::Segmented {
                szmic,
                seq_zero,
                seg_o,
                seg_n,
                segment_m,
            } => {
                SegmentHeader {
                    seq_zero: *seq_zero,
                    seg_o: *seg_o,
                    seg_n: *seg_n,
                }
                .emit(*szmic, xmit)?;
                xmit.extend_from_slice(segment_m)
                    .map_err(|_| InsufficientBuffer)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LowerControlMessage {
    Unsegmented {
        parameters: Vec<u8, MAX_UNSEGMENTED_CONTROL_PAYLOAD>,
    },
    Segmented {
        seq_zero: u16,
        seg_o: u8,
        seg_n: u8,
        segment_m: Vec<u8, SEGMENTED_CONTROL_CHUNK>,
    },
}

/// Transport control opcodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Opcode {
    SegmentedAcknowledgement = 0x00,
    FriendPoll = 0x01,
    FriendUpdate = 0x02,
    FriendRequest = 0x03,
    FriendOffer = 0x04,
    FriendClear = 0x05,
    FriendClearConfirm = 0x06,
    FriendSubscriptionListAdd = 0x07,
    FriendSubscriptionListRemove = 0x08,
    FriendSubscriptionListConfirm = 0x09,
    Heartbeat = 0x0A,
}

impl Opcode {
    pub fn parse(data: u8) -> Option<Opcode> {
        match data {
            0x00 => Some(Self::SegmentedAcknowledgement),
            0x01 => Some(Self::FriendPoll),
            0x02 => Some(Self::FriendUpdate),
            0x03 => Some(Self::FriendRequest),
            0x04 => Some(Self::FriendOffer),
            0x05 => Some(Self::FriendClear),
            0x06 => Some(Self::FriendClearConfirm),
            0x07 => Some(Self::FriendSubscriptionListAdd),
            0x08 => Some(Self::FriendSubscriptionListRemove),
            0x09 => Some(Self::FriendSubscriptionListConfirm),
            0x0A => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Bit `i` is set once segment `i` has been received.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockAck(u32);

impl BlockAck {
    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn ack(&mut self, seg_o: u8) {
        if (seg_o as usize) < MAX_SEGMENTS {
            self.0 |= 1 << seg_o;
        }
    }

    pub fn is_acked(&self, seg_o: u8) -> bool {
        (seg_o as usize) < MAX_SEGMENTS && self.0 & (1 << seg_o) != 0
    }

    /// True when the lowest `seg_n + 1` bits are all set.
    pub fn has_all_segments(&self, seg_n: u8) -> bool {
        let mask = if seg_n as usize >= MAX_SEGMENTS - 1 {
            u32::MAX
        } else {
            (1u32 << (seg_n + 1)) - 1
        };
        self.0 & mask == mask
    }

    /// Segment indices below `segment_count` whose bit is clear.
    pub fn missing(&self, segment_count: usize) -> impl Iterator<Item = u8> + '_ {
        (0..segment_count.min(MAX_SEGMENTS) as u8).filter(move |seg_o| !self.is_acked(*seg_o))
    }
}

/// Parameters of a segment acknowledgement control message.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SegmentAck {
    pub obo: bool,
    pub seq_zero: u16,
    pub block_ack: BlockAck,
}

impl SegmentAck {
    pub const LEN: usize = 6;

    pub fn parse(parameters: &[u8]) -> Result<Self, ParseError> {
        if parameters.len() != Self::LEN {
            return Err(ParseError::InvalidLength);
        }
        let obo = parameters[0] & 0b10000000 != 0;
        let seq_zero =
            u16::from_be_bytes([parameters[0] & 0b01111111, parameters[1] & 0b11111100]) >> 2;
        let block_ack = u32::from_be_bytes([
            parameters[2],
            parameters[3],
            parameters[4],
            parameters[5],
        ]);
        Ok(Self {
            obo,
            seq_zero,
            block_ack: BlockAck(block_ack),
        })
    }

    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        let obo = if self.obo { 0b10000000 } else { 0b00000000 };
        xmit.push(obo | ((self.seq_zero >> 6) & 0b1111111) as u8)
            .map_err(|_| InsufficientBuffer)?;
        xmit.push(((self.seq_zero << 2) & 0b11111100) as u8)
            .map_err(|_| InsufficientBuffer)?;
        xmit.extend_from_slice(&self.block_ack.0.to_be_bytes())
            .map_err(|_| InsufficientBuffer)
    }
}
