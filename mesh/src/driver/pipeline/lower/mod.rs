use crate::driver::DeviceError;
use crate::message::{seq_auth, LowerTransportPdu, NetworkPdu, SegmentMap};
use crate::pdu::lower::{
    LowerAccess, LowerAccessMessage, LowerControl, LowerControlMessage, LowerPDU, SzMic,
    MAX_UNSEGMENTED_ACCESS_PAYLOAD, MAX_UNSEGMENTED_CONTROL_PAYLOAD, SEGMENTED_ACCESS_CHUNK,
    SEGMENTED_CONTROL_CHUNK,
};
use crate::pdu::network::TransportPDU;
use crate::pdu::proxy::ProxyConfigurationPDU;
use crate::pdu::upper::{UpperAccess, UpperControl, UpperPDU};
use heapless::Vec;

pub mod reassembly;

pub use reassembly::{Reassembled, Reassembly, ReassemblyOutcome, Segment, SegmentKind};

/// Inbound lower transport PDU, classified for the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum LowerInbound {
    Unsegmented(UpperPDU),
    Segment(Segment),
    Proxy(ProxyConfigurationPDU),
}

/// Segmentation of upper transport PDUs and classification of inbound lower PDUs.
pub struct Lower;

impl Lower {
    /// Sequence number of the first segment, rebuilt from `seq_zero` and the sequence number
    /// of any segment of the same message.
    pub fn transport_sequence(net_seq: u32, seq_zero: u16) -> u32 {
        let seq_zero = (seq_zero & 0x1FFF) as u32;
        let low = net_seq & 0x1FFF;
        let base = net_seq - low;
        if low < seq_zero {
            (base + seq_zero).saturating_sub(0x2000)
        } else {
            base + seq_zero
        }
    }

    /// Splits `upper` into lower transport PDUs. Segments share `seq_zero` from `seq`.
    pub fn segment_access(
        upper: &UpperAccess,
        seq: u32,
    ) -> Result<SegmentMap<LowerPDU>, DeviceError> {
        let mut segments = SegmentMap::new();
        let payload = upper.payload();
        if payload.len() <= MAX_UNSEGMENTED_ACCESS_PAYLOAD {
            segments.insert(
                0,
                LowerPDU::Access(LowerAccess {
                    akf: upper.akf,
                    aid: upper.aid,
                    message: LowerAccessMessage::Unsegmented(
                        Vec::from_slice(payload).map_err(|_| DeviceError::InsufficientBuffer)?,
                    ),
                }),
            );
        } else {
            let seq_zero = (seq & 0x1FFF) as u16;
            let seg_n = Self::seg_n(payload.len(), SEGMENTED_ACCESS_CHUNK)?;
            for (seg_o, chunk) in payload.chunks(SEGMENTED_ACCESS_CHUNK).enumerate() {
                segments.insert(
                    seg_o as u8,
                    LowerPDU::Access(LowerAccess {
                        akf: upper.akf,
                        aid: upper.aid,
                        message: LowerAccessMessage::Segmented {
                            szmic: upper.szmic,
                            seq_zero,
                            seg_o: seg_o as u8,
                            seg_n,
                            segment_m: Vec::from_slice(chunk)
                                .map_err(|_| DeviceError::InsufficientBuffer)?,
                        },
                    }),
                );
            }
        }
        debug!("access pdu of {} octets in {} lower pdus", payload.len(), segments.len());
        Ok(segments)
    }

    pub fn segment_control(
        upper: &UpperControl,
        seq: u32,
    ) -> Result<SegmentMap<LowerPDU>, DeviceError> {
        let mut segments = SegmentMap::new();
        let parameters = &upper.parameters;
        if parameters.len() <= MAX_UNSEGMENTED_CONTROL_PAYLOAD {
            segments.insert(
                0,
                LowerPDU::Control(LowerControl {
                    opcode: upper.opcode,
                    message: LowerControlMessage::Unsegmented {
                        parameters: Vec::from_slice(parameters)
                            .map_err(|_| DeviceError::InsufficientBuffer)?,
                    },
                }),
            );
        } else {
            let seq_zero = (seq & 0x1FFF) as u16;
            let seg_n = Self::seg_n(parameters.len(), SEGMENTED_CONTROL_CHUNK)?;
            for (seg_o, chunk) in parameters.chunks(SEGMENTED_CONTROL_CHUNK).enumerate() {
                segments.insert(
                    seg_o as u8,
                    LowerPDU::Control(LowerControl {
                        opcode: upper.opcode,
                        message: LowerControlMessage::Segmented {
                            seq_zero,
                            seg_o: seg_o as u8,
                            seg_n,
                            segment_m: Vec::from_slice(chunk)
                                .map_err(|_| DeviceError::InsufficientBuffer)?,
                        },
                    }),
                );
            }
        }
        Ok(segments)
    }

    fn seg_n(len: usize, chunk: usize) -> Result<u8, DeviceError> {
        let count = (len + chunk - 1) / chunk;
        if count == 0 || count > 32 {
            return Err(DeviceError::InsufficientBuffer);
        }
        Ok((count - 1) as u8)
    }

    pub fn emit(pdu: &TransportPDU) -> Result<LowerTransportPdu, DeviceError> {
        let mut xmit = Vec::new();
        pdu.emit(&mut xmit)?;
        Ok(xmit)
    }

    /// Classifies an authenticated transport PDU received with network `seq`.
    pub fn process_inbound(
        transport_pdu: TransportPDU,
        seq: u32,
        iv_index: u32,
        network_pdu: &[u8],
    ) -> Result<LowerInbound, DeviceError> {
        let lower = match transport_pdu {
            TransportPDU::Proxy(proxy) => return Ok(LowerInbound::Proxy(proxy)),
            TransportPDU::Lower(lower) => lower,
        };
        let lower_pdu = Self::emit(&TransportPDU::Lower(lower.clone()))?;

        match lower {
            LowerPDU::Access(LowerAccess { akf, aid, message }) => match message {
                LowerAccessMessage::Unsegmented(payload) => {
                    Ok(LowerInbound::Unsegmented(UpperPDU::Access(UpperAccess {
                        akf,
                        aid,
                        szmic: SzMic::Bit32,
                        payload: Vec::from_slice(&payload)
                            .map_err(|_| DeviceError::InsufficientBuffer)?,
                    })))
                }
                LowerAccessMessage::Segmented {
                    szmic,
                    seq_zero,
                    seg_o,
                    seg_n,
                    segment_m,
                } => {
                    let seq = Self::transport_sequence(seq, seq_zero);
                    Ok(LowerInbound::Segment(Segment {
                        kind: SegmentKind::Access { akf, aid, szmic },
                        seq,
                        seq_auth: seq_auth(iv_index, seq),
                        seq_zero,
                        seg_o,
                        seg_n,
                        payload: Vec::from_slice(&segment_m)
                            .map_err(|_| DeviceError::InsufficientBuffer)?,
                        lower_pdu,
                        network_pdu: NetworkPdu::from_slice(network_pdu)
                            .map_err(|_| DeviceError::InsufficientBuffer)?,
                    }))
                }
            },
            LowerPDU::Control(LowerControl { opcode, message }) => match message {
                LowerControlMessage::Unsegmented { parameters } => {
                    Ok(LowerInbound::Unsegmented(UpperPDU::Control(UpperControl {
                        opcode,
                        parameters: Vec::from_slice(&parameters)
                            .map_err(|_| DeviceError::InsufficientBuffer)?,
                    })))
                }
                LowerControlMessage::Segmented {
                    seq_zero,
                    seg_o,
                    seg_n,
                    segment_m,
                } => {
                    let seq = Self::transport_sequence(seq, seq_zero);
                    Ok(LowerInbound::Segment(Segment {
                        kind: SegmentKind::Control { opcode },
                        seq,
                        seq_auth: seq_auth(iv_index, seq),
                        seq_zero,
                        seg_o,
                        seg_n,
                        payload: Vec::from_slice(&segment_m)
                            .map_err(|_| DeviceError::InsufficientBuffer)?,
                        lower_pdu,
                        network_pdu: NetworkPdu::from_slice(network_pdu)
                            .map_err(|_| DeviceError::InsufficientBuffer)?,
                    }))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::lower::Opcode;

    fn upper_access(len: usize, szmic: SzMic) -> UpperAccess {
        let payload: std::vec::Vec<u8> = (0..len as u8).collect();
        UpperAccess {
            akf: true,
            aid: 0x05.into(),
            szmic,
            payload: Vec::from_slice(&payload).unwrap(),
        }
    }

    #[test]
    fn test_transport_sequence() {
        assert_eq!(0x000100, Lower::transport_sequence(0x000103, 0x0100));
        // seq_zero from before the 13 bit wrap
        assert_eq!(0x001FFE, Lower::transport_sequence(0x002001, 0x1FFE));
        assert_eq!(0, Lower::transport_sequence(0x000001, 0x1FFF));
    }

    #[test]
    fn test_unsegmented_threshold() {
        let segments = Lower::segment_access(&upper_access(12, SzMic::Bit32), 7).unwrap();
        assert_eq!(1, segments.len());
        assert!(!segments[&0].is_segmented());

        let segments = Lower::segment_access(&upper_access(13, SzMic::Bit32), 7).unwrap();
        assert_eq!(2, segments.len());
        assert!(segments[&0].is_segmented());
    }

    #[test]
    fn test_forty_octets_in_four_segments() {
        let segments = Lower::segment_access(&upper_access(40, SzMic::Bit64), 0x2345).unwrap();
        assert_eq!(std::vec![0, 1, 2, 3], segments.keys().copied().collect::<std::vec::Vec<_>>());
        for (seg_o, pdu) in segments.iter() {
            match pdu {
                LowerPDU::Access(LowerAccess {
                    message:
                        LowerAccessMessage::Segmented {
                            szmic,
                            seq_zero,
                            seg_o: o,
                            seg_n,
                            segment_m,
                        },
                    ..
                }) => {
                    assert_eq!(SzMic::Bit64, *szmic);
                    assert_eq!(0x0345, *seq_zero);
                    assert_eq!(seg_o, o);
                    assert_eq!(3, *seg_n);
                    let expected = if *seg_o == 3 { 4 } else { 12 };
                    assert_eq!(expected, segment_m.len());
                }
                _ => panic!("expected a segmented access pdu"),
            }
        }
    }

    #[test]
    fn test_control_segmentation() {
        let short = UpperControl::new(Opcode::Heartbeat, &[0; 11]).unwrap();
        assert_eq!(1, Lower::segment_control(&short, 1).unwrap().len());

        let long = UpperControl::new(Opcode::Heartbeat, &[0; 17]).unwrap();
        let segments = Lower::segment_control(&long, 1).unwrap();
        assert_eq!(3, segments.len());
        assert!(segments.values().all(|pdu| pdu.is_segmented()));
    }

    #[test]
    fn test_inbound_segment_sequence() {
        let segments = Lower::segment_access(&upper_access(20, SzMic::Bit32), 0x1FFF).unwrap();
        let second = segments[&1].clone();
        // second segment sent with the next sequence number, across the 13 bit boundary
        let inbound =
            Lower::process_inbound(TransportPDU::Lower(second), 0x2000, 1, &[0; 20]).unwrap();
        match inbound {
            LowerInbound::Segment(segment) => {
                assert_eq!(0x1FFF, segment.seq);
                assert_eq!((1 << 24) | 0x1FFF, segment.seq_auth);
                assert_eq!(1, segment.seg_o);
                assert_eq!(1, segment.seg_n);
                assert_eq!(8, segment.payload.len());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
