//! Reassembly of segmented lower transport PDUs from a single source node.
//!
//! The state machine is synchronous. Timers live in the transport, which feeds
//! segments in through [`Reassembly::process`] and reports expiry through
//! [`Reassembly::expire`].

use crate::app::ApplicationKeyIdentifier;
use crate::message::{LowerTransportPdu, NetworkPdu, SegmentMap};
use crate::pdu::lower::{
    self, BlockAck, SegmentAck, SzMic, SEGMENTED_ACCESS_CHUNK, SEGMENTED_CONTROL_CHUNK,
};
use crate::pdu::upper::{UpperAccess, UpperControl, UpperPDU};
use crate::pdu::ParseError;
use heapless::Vec;

/// Fields of the first lower transport octet shared by every segment of a message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SegmentKind {
    Access {
        akf: bool,
        aid: ApplicationKeyIdentifier,
        szmic: SzMic,
    },
    Control {
        opcode: lower::Opcode,
    },
}

impl SegmentKind {
    fn chunk(&self) -> usize {
        match self {
            SegmentKind::Access { .. } => SEGMENTED_ACCESS_CHUNK,
            SegmentKind::Control { .. } => SEGMENTED_CONTROL_CHUNK,
        }
    }
}

/// One received segment together with the PDUs it arrived in.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Sequence number of the first segment of the message.
    pub seq: u32,
    pub seq_auth: u64,
    pub seq_zero: u16,
    pub seg_o: u8,
    pub seg_n: u8,
    pub payload: Vec<u8, SEGMENTED_ACCESS_CHUNK>,
    pub lower_pdu: LowerTransportPdu,
    pub network_pdu: NetworkPdu,
}

/// A message whose segments have all arrived.
#[derive(Clone, Debug, PartialEq)]
pub struct Reassembled {
    pub upper: UpperPDU,
    pub seq: u32,
    pub seq_auth: u64,
    pub ack: SegmentAck,
    pub lower_pdus: SegmentMap<LowerTransportPdu>,
    pub network_pdus: SegmentMap<NetworkPdu>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReassemblyOutcome {
    /// `seq_auth` is not newer than the last one accepted from the node.
    Rejected,
    /// Segment of a message whose incomplete timer already fired.
    Ignored,
    /// First segment of a new message.
    Started,
    /// Further segment of the message being received, possibly a duplicate.
    Progress,
    Complete(Reassembled),
    /// Segment of a message already delivered, with the final acknowledgement.
    AlreadyComplete(SegmentAck),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Receiving,
    Complete,
    Expired,
}

struct InFlight {
    seq_auth: u64,
    seq_zero: u16,
    seg_n: u8,
    kind: SegmentKind,
    phase: Phase,
    block_ack: BlockAck,
    segments: SegmentMap<Segment>,
}

impl InFlight {
    fn new(segment: &Segment) -> Self {
        Self {
            seq_auth: segment.seq_auth,
            seq_zero: segment.seq_zero,
            seg_n: segment.seg_n,
            kind: segment.kind,
            phase: Phase::Receiving,
            block_ack: BlockAck::default(),
            segments: SegmentMap::new(),
        }
    }

    fn ack(&self) -> SegmentAck {
        SegmentAck {
            obo: false,
            seq_zero: self.seq_zero,
            block_ack: self.block_ack,
        }
    }

    fn validate(&self, segment: &Segment) -> Result<(), ParseError> {
        if segment.seg_n != self.seg_n || segment.seg_o > self.seg_n || segment.kind != self.kind {
            return Err(ParseError::InvalidValue);
        }
        let chunk = self.kind.chunk();
        let len = segment.payload.len();
        let valid = if segment.seg_o < self.seg_n {
            len == chunk
        } else {
            len > 0 && len <= chunk
        };
        if valid {
            Ok(())
        } else {
            Err(ParseError::InvalidLength)
        }
    }

    /// Stores `segment` and returns the message once every segment is present.
    fn store(&mut self, segment: Segment) -> Result<Option<Reassembled>, ParseError> {
        self.validate(&segment)?;
        self.block_ack.ack(segment.seg_o);
        let seq = segment.seq;
        self.segments.entry(segment.seg_o).or_insert(segment);

        if !self.block_ack.has_all_segments(self.seg_n) {
            return Ok(None);
        }

        self.phase = Phase::Complete;
        let segments = core::mem::take(&mut self.segments);
        let mut lower_pdus = SegmentMap::new();
        let mut network_pdus = SegmentMap::new();
        let upper = match self.kind {
            SegmentKind::Access { akf, aid, szmic } => {
                let mut payload = Vec::new();
                for (seg_o, segment) in segments {
                    payload
                        .extend_from_slice(&segment.payload)
                        .map_err(|_| ParseError::InsufficientBuffer)?;
                    lower_pdus.insert(seg_o, segment.lower_pdu);
                    network_pdus.insert(seg_o, segment.network_pdu);
                }
                UpperPDU::Access(UpperAccess {
                    akf,
                    aid,
                    szmic,
                    payload,
                })
            }
            SegmentKind::Control { opcode } => {
                let mut parameters = Vec::new();
                for (seg_o, segment) in segments {
                    parameters
                        .extend_from_slice(&segment.payload)
                        .map_err(|_| ParseError::InsufficientBuffer)?;
                    lower_pdus.insert(seg_o, segment.lower_pdu);
                    network_pdus.insert(seg_o, segment.network_pdu);
                }
                UpperPDU::Control(UpperControl { opcode, parameters })
            }
        };

        Ok(Some(Reassembled {
            upper,
            seq,
            seq_auth: self.seq_auth,
            ack: self.ack(),
            lower_pdus,
            network_pdus,
        }))
    }
}

/// Replay window and in-flight message of one source node.
#[derive(Default)]
pub struct Reassembly {
    last_seq_auth: Option<u64>,
    in_flight: Option<InFlight>,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seq_auth(&self) -> Option<u64> {
        self.last_seq_auth
    }

    fn is_fresh(&self, seq_auth: u64) -> bool {
        self.last_seq_auth.map_or(true, |last| seq_auth > last)
    }

    /// Replay check for an unsegmented message. Advances the window when accepted.
    pub fn accept_unsegmented(&mut self, seq_auth: u64) -> bool {
        if self.is_fresh(seq_auth) {
            self.last_seq_auth.replace(seq_auth);
            true
        } else {
            false
        }
    }

    pub fn process(&mut self, segment: Segment) -> Result<ReassemblyOutcome, ParseError> {
        if let Some(in_flight) = self
            .in_flight
            .as_mut()
            .filter(|in_flight| in_flight.seq_auth == segment.seq_auth)
        {
            return match in_flight.phase {
                Phase::Expired => Ok(ReassemblyOutcome::Ignored),
                Phase::Complete => Ok(ReassemblyOutcome::AlreadyComplete(in_flight.ack())),
                Phase::Receiving => match in_flight.store(segment)? {
                    Some(reassembled) => Ok(ReassemblyOutcome::Complete(reassembled)),
                    None => Ok(ReassemblyOutcome::Progress),
                },
            };
        }

        if !self.is_fresh(segment.seq_auth) {
            return Ok(ReassemblyOutcome::Rejected);
        }

        let mut in_flight = InFlight::new(&segment);
        let result = in_flight.store(segment)?;
        if let Some(previous) = self.in_flight.as_ref() {
            if previous.phase == Phase::Receiving {
                debug!(
                    "seq_auth {:x} abandoned for {:x}",
                    previous.seq_auth, in_flight.seq_auth
                );
            }
        }
        self.last_seq_auth.replace(in_flight.seq_auth);
        self.in_flight.replace(in_flight);
        match result {
            Some(reassembled) => Ok(ReassemblyOutcome::Complete(reassembled)),
            None => Ok(ReassemblyOutcome::Started),
        }
    }

    /// Drops the partial message for `seq_auth`. Later segments of it are ignored.
    pub fn expire(&mut self, seq_auth: u64) -> bool {
        match self.in_flight.as_mut() {
            Some(in_flight)
                if in_flight.seq_auth == seq_auth && in_flight.phase == Phase::Receiving =>
            {
                in_flight.phase = Phase::Expired;
                in_flight.segments.clear();
                true
            }
            _ => false,
        }
    }

    /// Acknowledgement of the segments received so far for `seq_auth`.
    pub fn block_ack(&self, seq_auth: u64) -> Option<SegmentAck> {
        self.in_flight
            .as_ref()
            .filter(|in_flight| in_flight.seq_auth == seq_auth && in_flight.phase != Phase::Expired)
            .map(InFlight::ack)
    }

    pub fn is_receiving(&self, seq_auth: u64) -> bool {
        matches!(
            &self.in_flight,
            Some(in_flight) if in_flight.seq_auth == seq_auth && in_flight.phase == Phase::Receiving
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::seq_auth;

    fn access_segments(seq: u32, payload: &[u8]) -> std::vec::Vec<Segment> {
        let chunks: std::vec::Vec<_> = payload.chunks(SEGMENTED_ACCESS_CHUNK).collect();
        let seg_n = (chunks.len() - 1) as u8;
        chunks
            .iter()
            .enumerate()
            .map(|(seg_o, chunk)| Segment {
                kind: SegmentKind::Access {
                    akf: true,
                    aid: 0x01.into(),
                    szmic: SzMic::Bit32,
                },
                seq,
                seq_auth: seq_auth(0, seq),
                seq_zero: (seq & 0x1FFF) as u16,
                seg_o: seg_o as u8,
                seg_n,
                payload: Vec::from_slice(chunk).unwrap(),
                lower_pdu: Vec::from_slice(&[seg_o as u8]).unwrap(),
                network_pdu: Vec::from_slice(&[0xA0 | seg_o as u8]).unwrap(),
            })
            .collect()
    }

    fn forty_octets() -> std::vec::Vec<u8> {
        (0..40).collect()
    }

    #[test]
    fn test_replay_window() {
        let mut reassembly = Reassembly::new();
        assert!(reassembly.accept_unsegmented(100));
        assert!(!reassembly.accept_unsegmented(99));
        assert!(!reassembly.accept_unsegmented(100));
        assert!(reassembly.accept_unsegmented(101));

        let segments = access_segments(50, &forty_octets());
        assert_eq!(
            ReassemblyOutcome::Rejected,
            reassembly.process(segments[0].clone()).unwrap()
        );
    }

    #[test]
    fn test_block_ack_progress() {
        let mut reassembly = Reassembly::new();
        let segments = access_segments(7, &forty_octets());
        let seq_auth = segments[0].seq_auth;

        assert_eq!(
            ReassemblyOutcome::Started,
            reassembly.process(segments[0].clone()).unwrap()
        );
        for seg_o in [2, 3] {
            assert_eq!(
                ReassemblyOutcome::Progress,
                reassembly.process(segments[seg_o].clone()).unwrap()
            );
        }
        assert_eq!(
            0b1101,
            reassembly.block_ack(seq_auth).unwrap().block_ack.bits()
        );

        match reassembly.process(segments[1].clone()).unwrap() {
            ReassemblyOutcome::Complete(reassembled) => {
                assert_eq!(0b1111, reassembled.ack.block_ack.bits());
                assert_eq!(7, reassembled.ack.seq_zero);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!reassembly.is_receiving(seq_auth));
    }

    #[test]
    fn test_any_order_reassembly() {
        let payload = forty_octets();
        for order in [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]] {
            let mut reassembly = Reassembly::new();
            let segments = access_segments(0x2001, &payload);
            let mut completed = None;
            for seg_o in order {
                if let ReassemblyOutcome::Complete(reassembled) =
                    reassembly.process(segments[seg_o].clone()).unwrap()
                {
                    completed.replace(reassembled);
                }
            }
            let reassembled = completed.expect("message should complete");
            match reassembled.upper {
                UpperPDU::Access(access) => assert_eq!(&payload[..], access.payload()),
                _ => panic!("expected an access pdu"),
            }
            assert_eq!(4, reassembled.lower_pdus.len());
            assert_eq!(
                Some(&[0xA3][..]),
                reassembled.network_pdus.get(&3).map(|pdu| &pdu[..])
            );
        }
    }

    #[test]
    fn test_duplicates_after_completion_are_reacknowledged() {
        let mut reassembly = Reassembly::new();
        let segments = access_segments(9, &forty_octets()[..20]);
        reassembly.process(segments[0].clone()).unwrap();
        assert!(matches!(
            reassembly.process(segments[1].clone()).unwrap(),
            ReassemblyOutcome::Complete(_)
        ));
        match reassembly.process(segments[0].clone()).unwrap() {
            ReassemblyOutcome::AlreadyComplete(ack) => assert_eq!(0b11, ack.block_ack.bits()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expired_transaction_is_ignored() {
        let mut reassembly = Reassembly::new();
        let segments = access_segments(300, &forty_octets());
        let seq_auth = segments[0].seq_auth;
        reassembly.process(segments[0].clone()).unwrap();
        assert!(reassembly.expire(seq_auth));
        assert!(!reassembly.expire(seq_auth));
        assert_eq!(None, reassembly.block_ack(seq_auth));

        for segment in segments.iter().skip(1) {
            assert_eq!(
                ReassemblyOutcome::Ignored,
                reassembly.process(segment.clone()).unwrap()
            );
        }

        // a newer message from the same node starts afresh
        let next = access_segments(310, &forty_octets());
        assert_eq!(
            ReassemblyOutcome::Started,
            reassembly.process(next[0].clone()).unwrap()
        );
    }

    #[test]
    fn test_newer_message_replaces_pending_one() {
        let mut reassembly = Reassembly::new();
        let first = access_segments(10, &forty_octets());
        let second = access_segments(20, &forty_octets());
        reassembly.process(first[0].clone()).unwrap();
        assert_eq!(
            ReassemblyOutcome::Started,
            reassembly.process(second[0].clone()).unwrap()
        );
        assert_eq!(
            ReassemblyOutcome::Rejected,
            reassembly.process(first[1].clone()).unwrap()
        );
        assert_eq!(Some(second[0].seq_auth), reassembly.last_seq_auth());
    }

    #[test]
    fn test_single_segment_completes_immediately() {
        let mut reassembly = Reassembly::new();
        let segments = access_segments(4, &[0x55; 10]);
        assert_eq!(0, segments[0].seg_n);
        assert!(matches!(
            reassembly.process(segments[0].clone()).unwrap(),
            ReassemblyOutcome::Complete(_)
        ));
    }

    #[test]
    fn test_inconsistent_segments_are_malformed() {
        let mut reassembly = Reassembly::new();
        let segments = access_segments(11, &forty_octets());
        reassembly.process(segments[0].clone()).unwrap();

        let mut wrong_count = segments[1].clone();
        wrong_count.seg_n = 5;
        assert_eq!(Err(ParseError::InvalidValue), reassembly.process(wrong_count));

        let mut short = segments[1].clone();
        short.payload.truncate(3);
        assert_eq!(Err(ParseError::InvalidLength), reassembly.process(short));

        // the partial message survives the bad segments
        assert_eq!(
            0b1,
            reassembly.block_ack(segments[0].seq_auth).unwrap().block_ack.bits()
        );
    }

    #[test]
    fn test_segmented_control_reassembly() {
        let parameters: std::vec::Vec<u8> = (0..17).collect();
        let chunks: std::vec::Vec<_> = parameters.chunks(SEGMENTED_CONTROL_CHUNK).collect();
        let mut reassembly = Reassembly::new();
        let mut result = None;
        for (seg_o, chunk) in chunks.iter().enumerate() {
            let outcome = reassembly
                .process(Segment {
                    kind: SegmentKind::Control {
                        opcode: lower::Opcode::Heartbeat,
                    },
                    seq: 1,
                    seq_auth: 1,
                    seq_zero: 1,
                    seg_o: seg_o as u8,
                    seg_n: 2,
                    payload: Vec::from_slice(chunk).unwrap(),
                    lower_pdu: Vec::new(),
                    network_pdu: Vec::new(),
                })
                .unwrap();
            if let ReassemblyOutcome::Complete(reassembled) = outcome {
                result.replace(reassembled.upper);
            }
        }
        assert_eq!(
            Some(UpperPDU::Control(
                UpperControl::new(lower::Opcode::Heartbeat, &parameters).unwrap()
            )),
            result
        );
    }
}
