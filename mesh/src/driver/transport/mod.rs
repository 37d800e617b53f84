//! The transport orchestrator.
//!
//! [`MeshTransport`] composes the network, lower and upper layers, owns the replay and
//! reassembly state of every remote node and schedules the incomplete, acknowledgement and
//! outbound transaction timers. Codec and crypto work happens on the caller's thread with
//! no lock held; only timer callbacks run on the scheduler.

use crate::address::{Address, UnicastAddress};
use crate::config::TransportConfig;
use crate::driver::pipeline::lower::{Lower, LowerInbound, Reassembly, ReassemblyOutcome, Segment};
use crate::driver::pipeline::network::{Authentication, NetworkMessageCache};
use crate::driver::pipeline::upper::{OutboundControl, Upper, UpperContext};
use crate::driver::DeviceError;
use crate::keys::{KeyStore, NetworkKey};
use crate::message::{
    seq_auth, AccessKey, AccessMessage, ControlMessage, ControlOpcode, LowerTransportPdu,
    Message, MessageHeader, NetworkPdu, SegmentMap, TransportControlMessage,
};
use crate::pdu::access::AccessPayload;
use crate::pdu::lower::{LowerPDU, SegmentAck, SzMic};
use crate::pdu::network::{
    CleartextNetworkPDU, ObfuscatedAndEncryptedNetworkPDU, PduType, TransportPDU,
};
use crate::pdu::proxy::ProxyConfigurationPDU;
use crate::pdu::upper::UpperPDU;
use core::sync::atomic::{AtomicU64, Ordering};
use heapless::Vec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;

pub mod timer;

use timer::lock;
pub use timer::{Scheduler, TimerHandle};

/// Highest sequence number a node may use.
const MAX_SEQUENCE: u32 = 0xFFFFFF;
const NETWORK_CACHE_SIZE: usize = 64;

/// Receives wire-ready network PDUs.
pub trait BearerSink: Send + Sync + 'static {
    fn on_pdu_ready(&self, dst: Address, pdu: &[u8]);
}

/// Observer of transport events. Every method defaults to doing nothing.
pub trait StatusSink: Send + Sync + 'static {
    fn on_message_decrypted(&self, _message: &Message) {}

    /// `layer` names where authentication failed.
    fn on_decrypt_failed(&self, _layer: &str, _error: &DeviceError) {}

    /// A segmented transaction with the remote node timed out or was cancelled.
    fn on_transaction_timeout(&self, _address: UnicastAddress) {}

    fn on_block_ack_received(&self, _src: UnicastAddress, _ack: &SegmentAck) {}

    fn on_unknown_pdu(&self, _src: UnicastAddress, _pdu: &[u8]) {}
}

/// Status sink ignoring every event.
pub struct NoStatus;

impl StatusSink for NoStatus {}

/// Diagnostic counters.
#[derive(Debug, Default)]
pub struct TransportStats {
    replay_rejected: AtomicU64,
    authentication_failures: AtomicU64,
    malformed_pdus: AtomicU64,
    reassembly_timeouts: AtomicU64,
    retransmitted_segments: AtomicU64,
    duplicates: AtomicU64,
}

impl TransportStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replay_rejected(&self) -> u64 {
        self.replay_rejected.load(Ordering::Relaxed)
    }

    pub fn authentication_failures(&self) -> u64 {
        self.authentication_failures.load(Ordering::Relaxed)
    }

    pub fn malformed_pdus(&self) -> u64 {
        self.malformed_pdus.load(Ordering::Relaxed)
    }

    pub fn reassembly_timeouts(&self) -> u64 {
        self.reassembly_timeouts.load(Ordering::Relaxed)
    }

    pub fn retransmitted_segments(&self) -> u64 {
        self.retransmitted_segments.load(Ordering::Relaxed)
    }

    /// Network PDUs dropped by the network message cache.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}

/// Reassembly state and timers of one remote node.
#[derive(Default)]
struct NodeState {
    reassembly: Reassembly,
    incomplete: Option<(u64, TimerHandle)>,
    ack: Option<(u64, TimerHandle)>,
}

impl NodeState {
    fn cancel_incomplete(&mut self) {
        if let Some((_, timer)) = self.incomplete.take() {
            timer.cancel();
        }
    }

    fn cancel_ack(&mut self) {
        if let Some((_, timer)) = self.ack.take() {
            timer.cancel();
        }
    }
}

/// A segmented message sent to a unicast address, awaiting acknowledgement.
struct Outbound {
    message: Message,
    segment_count: usize,
    token: u64,
    timer: Option<TimerHandle>,
}

/// What the timers of a segmented inbound message need to act on it.
#[derive(Copy, Clone)]
struct InboundTransaction {
    remote: UnicastAddress,
    local: Option<UnicastAddress>,
    seq_auth: u64,
    ttl: u8,
    net_key_index: u16,
}

struct Inner {
    keys: Arc<dyn KeyStore>,
    bearer: Arc<dyn BearerSink>,
    status: Arc<dyn StatusSink>,
    config: TransportConfig,
    scheduler: Scheduler,
    nodes: Mutex<HashMap<UnicastAddress, Arc<Mutex<NodeState>>>>,
    outbound: Mutex<HashMap<(UnicastAddress, u16), Outbound>>,
    sequences: Mutex<HashMap<UnicastAddress, u32>>,
    cache: Mutex<NetworkMessageCache<NETWORK_CACHE_SIZE>>,
    stats: TransportStats,
    tokens: AtomicU64,
}

/// Bluetooth mesh network and transport layers bound to a key store, a bearer and a
/// status observer.
pub struct MeshTransport {
    inner: Arc<Inner>,
}

impl MeshTransport {
    /// Creates a transport whose timers run on an owned runtime of
    /// `config.worker_threads` workers.
    pub fn new(
        keys: Arc<dyn KeyStore>,
        bearer: Arc<dyn BearerSink>,
        status: Arc<dyn StatusSink>,
        config: TransportConfig,
    ) -> Result<Self, DeviceError> {
        let scheduler = Scheduler::new(config.worker_threads)?;
        Ok(Self::build(keys, bearer, status, config, scheduler))
    }

    /// Creates a transport whose timers run on the runtime behind `handle`.
    pub fn with_handle(
        keys: Arc<dyn KeyStore>,
        bearer: Arc<dyn BearerSink>,
        status: Arc<dyn StatusSink>,
        config: TransportConfig,
        handle: Handle,
    ) -> Self {
        Self::build(keys, bearer, status, config, Scheduler::with_handle(handle))
    }

    fn build(
        keys: Arc<dyn KeyStore>,
        bearer: Arc<dyn BearerSink>,
        status: Arc<dyn StatusSink>,
        config: TransportConfig,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                keys,
                bearer,
                status,
                config,
                scheduler,
                nodes: Mutex::new(HashMap::new()),
                outbound: Mutex::new(HashMap::new()),
                sequences: Mutex::new(HashMap::new()),
                cache: Mutex::new(NetworkMessageCache::new()),
                stats: TransportStats::default(),
                tokens: AtomicU64::new(0),
            }),
        }
    }

    /// Runs `message` through the upper, lower and network layers.
    ///
    /// Assigns the sequence number, IV index, TTL and network key index and writes them
    /// back into the header together with every intermediate PDU.
    pub fn encode(&self, message: &mut Message) -> Result<SegmentMap<NetworkPdu>, DeviceError> {
        self.inner.encode(message)
    }

    /// Encodes `message` and hands each network PDU to the bearer.
    ///
    /// Segmented messages to a unicast address are kept until acknowledged, so that
    /// segments missing from a block acknowledgement are retransmitted.
    pub fn send(&self, message: &mut Message) -> Result<SegmentMap<NetworkPdu>, DeviceError> {
        self.inner.send(message)
    }

    /// Processes one inbound network PDU.
    ///
    /// Returns the message once it is complete. Replayed, duplicated and partial messages
    /// yield `Ok(None)`.
    pub fn receive(&self, data: &[u8]) -> Result<Option<Message>, DeviceError> {
        self.inner.receive(data)
    }

    /// Re-encrypts the given segments of an already encoded message with fresh sequence
    /// numbers and hands them to the bearer. Indices beyond the segment count are skipped.
    pub fn resend(
        &self,
        message: &Message,
        segments: &[u8],
    ) -> Result<SegmentMap<NetworkPdu>, DeviceError> {
        self.inner.resend(message, segments)
    }

    /// Next sequence number `src` will use.
    pub fn sequence(&self, src: UnicastAddress) -> Option<u32> {
        lock(&self.inner.sequences)
            .get(&src)
            .copied()
            .or_else(|| self.inner.keys.node(src).map(|node| node.sequence))
    }

    pub fn stats(&self) -> &TransportStats {
        &self.inner.stats
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Cancels every timer and refuses further work.
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
        lock(&self.inner.nodes).clear();
        lock(&self.inner.outbound).clear();
        info!("transport shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.scheduler.is_shut_down()
    }
}

impl Inner {
    fn check_running(&self) -> Result<(), DeviceError> {
        if self.scheduler.is_shut_down() {
            Err(DeviceError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn next_token(&self) -> u64 {
        self.tokens.fetch_add(1, Ordering::Relaxed)
    }

    fn next_sequence(&self, src: UnicastAddress) -> Result<u32, DeviceError> {
        let mut sequences = lock(&self.sequences);
        let next = sequences
            .entry(src)
            .or_insert_with(|| self.keys.node(src).map(|node| node.sequence).unwrap_or(0));
        if *next > MAX_SEQUENCE {
            error!("sequence numbers of {:x} exhausted", src.0);
            return Err(DeviceError::InvalidState);
        }
        let seq = *next;
        *next += 1;
        Ok(seq)
    }

    fn node_state(&self, address: UnicastAddress) -> Arc<Mutex<NodeState>> {
        lock(&self.nodes).entry(address).or_default().clone()
    }

    fn network_key(&self, message: &Message) -> Result<NetworkKey, DeviceError> {
        let index = message.header().net_key_index.or(match message {
            Message::Access(AccessMessage {
                key: AccessKey::Application(key),
                ..
            }) => Some(key.net_key_index()),
            _ => None,
        });
        match index {
            Some(index) => self.keys.network_key(index),
            None => self.keys.primary_network_key(),
        }
        .ok_or_else(|| {
            error!("no network key for message from {:x}", message.header().src.0);
            DeviceError::UnknownNetworkKey
        })
    }

    fn default_ttl(&self, src: UnicastAddress) -> u8 {
        self.keys
            .node(src)
            .map(|node| node.ttl)
            .unwrap_or(self.config.default_ttl)
    }

    fn encode(&self, message: &mut Message) -> Result<SegmentMap<NetworkPdu>, DeviceError> {
        self.check_running()?;
        let network_key = self.network_key(message)?;
        let src = message.header().src;
        let ttl = message
            .header()
            .ttl
            .unwrap_or_else(|| self.default_ttl(src))
            & 0x7F;
        let seq = self.next_sequence(src)?;
        let iv_index = self.keys.iv_index();

        let header = message.header_mut();
        header.seq = seq;
        header.iv_index = iv_index;
        header.ttl.replace(ttl);
        header.net_key_index.replace(network_key.index());

        let transport_pdus: SegmentMap<TransportPDU> = match message {
            Message::Access(access) => {
                let upper = Upper::process_outbound_access(access)?;
                Lower::segment_access(&upper, seq)?
                    .into_iter()
                    .map(|(seg_o, lower)| (seg_o, TransportPDU::Lower(lower)))
                    .collect()
            }
            Message::Control(control) => match Upper::process_outbound_control(control)? {
                OutboundControl::Transport(upper) => Lower::segment_control(&upper, seq)?
                    .into_iter()
                    .map(|(seg_o, lower)| (seg_o, TransportPDU::Lower(lower)))
                    .collect(),
                OutboundControl::Proxy(proxy) => {
                    let mut pdus = SegmentMap::new();
                    pdus.insert(0, TransportPDU::Proxy(proxy));
                    pdus
                }
            },
        };

        let segmented = matches!(
            transport_pdus.get(&0),
            Some(TransportPDU::Lower(lower)) if lower.is_segmented()
        );
        let header = message.header().clone();
        let mut lower_pdus = SegmentMap::new();
        let mut network_pdus = SegmentMap::new();
        for (seg_o, transport_pdu) in transport_pdus {
            let seq = if seg_o == 0 {
                seq
            } else {
                self.next_sequence(src)?
            };
            lower_pdus.insert(seg_o, Lower::emit(&transport_pdu)?);
            let cleartext = CleartextNetworkPDU {
                pdu_type: header.pdu_type,
                network_key: *network_key.derivatives(),
                net_key_index: network_key.index(),
                iv_index,
                ttl,
                seq,
                src,
                dst: header.dst,
                transport_pdu,
            };
            network_pdus.insert(seg_o, Self::encrypt(&cleartext)?);
        }
        debug!(
            "encoded seq {} from {:x} into {} network pdus",
            seq,
            src.0,
            network_pdus.len()
        );

        let header = message.header_mut();
        header.segmented = segmented;
        header.network_pdus = network_pdus.clone();
        match message {
            Message::Access(access) => access.lower_transport_pdus = lower_pdus,
            Message::Control(control) => control.lower_transport_pdus = lower_pdus,
        }
        Ok(network_pdus)
    }

    fn encrypt(cleartext: &CleartextNetworkPDU) -> Result<NetworkPdu, DeviceError> {
        let encrypted = Authentication::process_outbound(cleartext)?;
        let mut pdu = NetworkPdu::new();
        encrypted.emit(&mut pdu)?;
        trace!("network pdu of {} octets", pdu.len());
        Ok(pdu)
    }

    fn send(
        self: &Arc<Self>,
        message: &mut Message,
    ) -> Result<SegmentMap<NetworkPdu>, DeviceError> {
        let network_pdus = self.encode(message)?;
        let dst = message.header().dst;
        for pdu in network_pdus.values() {
            self.bearer.on_pdu_ready(dst, pdu);
        }
        if message.header().segmented {
            if let Address::Unicast(remote) = dst {
                self.track_outbound(message, remote)?;
            }
        }
        Ok(network_pdus)
    }

    fn track_outbound(
        self: &Arc<Self>,
        message: &Message,
        remote: UnicastAddress,
    ) -> Result<(), DeviceError> {
        let header = message.header();
        let key = (header.src, (header.seq & 0x1FFF) as u16);
        let token = self.next_token();
        let weak = Arc::downgrade(self);
        let timer = self
            .scheduler
            .schedule(self.config.incomplete_timeout(), move || {
                Self::outbound_expired(weak, key, token, remote)
            })?;
        let previous = lock(&self.outbound).insert(
            key,
            Outbound {
                message: message.clone(),
                segment_count: message.lower_transport_pdus().len(),
                token,
                timer: Some(timer),
            },
        );
        if let Some(Outbound {
            timer: Some(timer), ..
        }) = previous
        {
            timer.cancel();
        }
        Ok(())
    }

    fn outbound_expired(
        inner: Weak<Self>,
        key: (UnicastAddress, u16),
        token: u64,
        remote: UnicastAddress,
    ) {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let expired = {
            let mut outbound = lock(&inner.outbound);
            match outbound.get(&key) {
                Some(transaction) if transaction.token == token => outbound.remove(&key).is_some(),
                _ => false,
            }
        };
        if expired {
            warn!("outbound seq_zero {} to {:x} was never acknowledged", key.1, remote.0);
            inner.status.on_transaction_timeout(remote);
        }
    }

    fn resend(
        &self,
        message: &Message,
        segments: &[u8],
    ) -> Result<SegmentMap<NetworkPdu>, DeviceError> {
        self.check_running()?;
        let header = message.header();
        let net_key_index = header.net_key_index.ok_or(DeviceError::InvalidState)?;
        let network_key = self
            .keys
            .network_key(net_key_index)
            .ok_or(DeviceError::UnknownNetworkKey)?;
        let ttl = header.ttl.unwrap_or_else(|| self.default_ttl(header.src));

        let mut network_pdus = SegmentMap::new();
        for seg_o in segments {
            let lower_pdu = match message.lower_transport_pdus().get(seg_o) {
                Some(lower_pdu) => lower_pdu,
                None => continue,
            };
            let transport_pdu = match header.pdu_type {
                PduType::Network => {
                    TransportPDU::Lower(LowerPDU::parse(message.is_control(), lower_pdu)?)
                }
                PduType::ProxyConfiguration => {
                    TransportPDU::Proxy(ProxyConfigurationPDU::parse(lower_pdu)?)
                }
            };
            let cleartext = CleartextNetworkPDU {
                pdu_type: header.pdu_type,
                network_key: *network_key.derivatives(),
                net_key_index,
                iv_index: header.iv_index,
                ttl,
                seq: self.next_sequence(header.src)?,
                src: header.src,
                dst: header.dst,
                transport_pdu,
            };
            let pdu = Self::encrypt(&cleartext)?;
            self.bearer.on_pdu_ready(header.dst, &pdu);
            TransportStats::bump(&self.stats.retransmitted_segments);
            network_pdus.insert(*seg_o, pdu);
        }
        debug!(
            "retransmitted {} segments of seq_zero {}",
            network_pdus.len(),
            header.seq & 0x1FFF
        );
        Ok(network_pdus)
    }

    fn receive(self: &Arc<Self>, data: &[u8]) -> Result<Option<Message>, DeviceError> {
        self.check_running()?;
        trace!("inbound network pdu of {} octets", data.len());
        let pdu = ObfuscatedAndEncryptedNetworkPDU::parse(data).map_err(|err| {
            warn!("malformed network pdu: {:?}", err);
            TransportStats::bump(&self.stats.malformed_pdus);
            DeviceError::ParseError(err)
        })?;

        let cleartext = match Authentication::process_inbound(&*self.keys, &pdu) {
            Ok(cleartext) => cleartext,
            Err(err) => return Err(self.inbound_failure("network", err)),
        };

        if lock(&self.cache).has_seen(&cleartext) {
            trace!("duplicate seq {} from {:x}", cleartext.seq, cleartext.src.0);
            TransportStats::bump(&self.stats.duplicates);
            return Ok(None);
        }

        let inbound = Lower::process_inbound(
            cleartext.transport_pdu.clone(),
            cleartext.seq,
            cleartext.iv_index,
            data,
        )
        .map_err(|err| self.inbound_failure("lower transport", err))?;

        match inbound {
            LowerInbound::Proxy(proxy) => {
                if !self.accept_unsegmented(&cleartext) {
                    return Ok(None);
                }
                self.deliver_proxy(&cleartext, proxy, data).map(Some)
            }
            LowerInbound::Unsegmented(upper) => {
                if !self.accept_unsegmented(&cleartext) {
                    return Ok(None);
                }
                let lower_pdu = Lower::emit(&cleartext.transport_pdu)?;
                let mut lower_pdus = SegmentMap::new();
                lower_pdus.insert(0, lower_pdu);
                let mut network_pdus = SegmentMap::new();
                network_pdus.insert(0, Self::network_pdu(data)?);
                self.deliver(&cleartext, upper, cleartext.seq, false, lower_pdus, network_pdus)
            }
            LowerInbound::Segment(segment) => {
                let transaction = InboundTransaction {
                    remote: cleartext.src,
                    local: match cleartext.dst {
                        Address::Unicast(local) => Some(local),
                        _ => None,
                    },
                    seq_auth: segment.seq_auth,
                    ttl: cleartext.ttl,
                    net_key_index: cleartext.net_key_index,
                };
                self.receive_segment(&cleartext, transaction, segment)
            }
        }
    }

    fn inbound_failure(&self, layer: &str, err: DeviceError) -> DeviceError {
        match err {
            DeviceError::AuthenticationFailed(_)
            | DeviceError::UnknownNetworkKey
            | DeviceError::MissingKey => {
                warn!("{} decryption failed: {:?}", layer, err);
                TransportStats::bump(&self.stats.authentication_failures);
                self.status.on_decrypt_failed(layer, &err);
            }
            DeviceError::ParseError(_)
            | DeviceError::InvalidSrcAddress
            | DeviceError::InvalidDstAddress
            | DeviceError::InsufficientBuffer => {
                warn!("{} dropped malformed pdu: {:?}", layer, err);
                TransportStats::bump(&self.stats.malformed_pdus);
            }
            _ => {
                error!("{} failed: {:?}", layer, err);
            }
        }
        err
    }

    fn network_pdu(data: &[u8]) -> Result<NetworkPdu, DeviceError> {
        NetworkPdu::from_slice(data).map_err(|_| DeviceError::InsufficientBuffer)
    }

    fn accept_unsegmented(&self, cleartext: &CleartextNetworkPDU) -> bool {
        let state = self.node_state(cleartext.src);
        let accepted = lock(&state)
            .reassembly
            .accept_unsegmented(seq_auth(cleartext.iv_index, cleartext.seq));
        if !accepted {
            warn!("replayed seq {} from {:x}", cleartext.seq, cleartext.src.0);
            TransportStats::bump(&self.stats.replay_rejected);
        }
        accepted
    }

    fn receive_segment(
        self: &Arc<Self>,
        cleartext: &CleartextNetworkPDU,
        transaction: InboundTransaction,
        segment: Segment,
    ) -> Result<Option<Message>, DeviceError> {
        let seg_o = segment.seg_o;
        let state = self.node_state(transaction.remote);
        let mut guard = lock(&state);
        let outcome = match guard.reassembly.process(segment) {
            Ok(outcome) => outcome,
            Err(err) => {
                drop(guard);
                return Err(self.inbound_failure("lower transport", err.into()));
            }
        };

        match outcome {
            ReassemblyOutcome::Rejected => {
                drop(guard);
                warn!(
                    "replayed segment {} seq_auth {:x} from {:x}",
                    seg_o, transaction.seq_auth, transaction.remote.0
                );
                TransportStats::bump(&self.stats.replay_rejected);
                Ok(None)
            }
            ReassemblyOutcome::Ignored => {
                debug!("segment {} of expired seq_auth {:x}", seg_o, transaction.seq_auth);
                Ok(None)
            }
            ReassemblyOutcome::Started => {
                guard.cancel_incomplete();
                guard.cancel_ack();
                self.arm_incomplete(&mut guard, transaction)?;
                self.arm_ack(&mut guard, transaction)?;
                debug!(
                    "segment {} started seq_auth {:x} from {:x}",
                    seg_o, transaction.seq_auth, transaction.remote.0
                );
                Ok(None)
            }
            ReassemblyOutcome::Progress => {
                guard.cancel_incomplete();
                self.arm_incomplete(&mut guard, transaction)?;
                if guard.ack.is_none() {
                    self.arm_ack(&mut guard, transaction)?;
                }
                Ok(None)
            }
            ReassemblyOutcome::AlreadyComplete(ack) => {
                drop(guard);
                self.send_ack(transaction, ack);
                Ok(None)
            }
            ReassemblyOutcome::Complete(reassembled) => {
                guard.cancel_incomplete();
                guard.cancel_ack();
                drop(guard);
                info!(
                    "seq_auth {:x} from {:x} complete",
                    transaction.seq_auth, transaction.remote.0
                );
                self.send_ack(transaction, reassembled.ack);
                self.deliver(
                    cleartext,
                    reassembled.upper,
                    reassembled.seq,
                    true,
                    reassembled.lower_pdus,
                    reassembled.network_pdus,
                )
            }
        }
    }

    fn arm_incomplete(
        self: &Arc<Self>,
        state: &mut NodeState,
        transaction: InboundTransaction,
    ) -> Result<(), DeviceError> {
        let token = self.next_token();
        let weak = Arc::downgrade(self);
        let timer = self
            .scheduler
            .schedule(self.config.incomplete_timeout(), move || {
                Self::incomplete_expired(weak, transaction, token)
            })?;
        state.incomplete.replace((token, timer));
        Ok(())
    }

    /// Acknowledgements are only sent for messages addressed to a unicast address.
    fn arm_ack(
        self: &Arc<Self>,
        state: &mut NodeState,
        transaction: InboundTransaction,
    ) -> Result<(), DeviceError> {
        if transaction.local.is_none() {
            return Ok(());
        }
        let token = self.next_token();
        let weak = Arc::downgrade(self);
        let timer = self
            .scheduler
            .schedule(self.config.ack_timeout(transaction.ttl), move || {
                Self::ack_expired(weak, transaction, token)
            })?;
        trace!("ack timer {} armed for {:x}", token, transaction.remote.0);
        state.ack.replace((token, timer));
        Ok(())
    }

    fn incomplete_expired(inner: Weak<Self>, transaction: InboundTransaction, token: u64) {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let state = match lock(&inner.nodes).get(&transaction.remote) {
            Some(state) => state.clone(),
            None => return,
        };
        {
            let mut state = lock(&state);
            if !matches!(state.incomplete, Some((current, _)) if current == token) {
                return;
            }
            state.incomplete.take();
            state.cancel_ack();
            if !state.reassembly.expire(transaction.seq_auth) {
                return;
            }
        }
        warn!(
            "seq_auth {:x} from {:x} timed out incomplete",
            transaction.seq_auth, transaction.remote.0
        );
        TransportStats::bump(&inner.stats.reassembly_timeouts);
        inner.status.on_transaction_timeout(transaction.remote);
    }

    fn ack_expired(inner: Weak<Self>, transaction: InboundTransaction, token: u64) {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let state = match lock(&inner.nodes).get(&transaction.remote) {
            Some(state) => state.clone(),
            None => return,
        };
        let ack = {
            let mut state = lock(&state);
            if !matches!(state.ack, Some((current, _)) if current == token) {
                return;
            }
            state.ack.take();
            if !state.reassembly.is_receiving(transaction.seq_auth) {
                return;
            }
            state.reassembly.block_ack(transaction.seq_auth)
        };
        if let Some(ack) = ack {
            inner.send_ack(transaction, ack);
        }
    }

    /// Sends `ack` back to the remote node. Failures are logged, never propagated.
    fn send_ack(self: &Arc<Self>, transaction: InboundTransaction, ack: SegmentAck) {
        let local = match transaction.local {
            Some(local) => local,
            None => return,
        };
        let ttl = if transaction.ttl == 0 {
            0
        } else {
            self.default_ttl(local)
        };
        let result = ControlMessage::segment_ack(local, transaction.remote, ttl, ack)
            .map_err(DeviceError::from)
            .and_then(|message| {
                let mut message =
                    Message::Control(message.with_net_key_index(transaction.net_key_index));
                self.send(&mut message)
            });
        match result {
            Ok(_) => info!(
                "acked {:x} seq_zero {} to {:x}",
                ack.block_ack.bits(),
                ack.seq_zero,
                transaction.remote.0
            ),
            Err(err) => error!("failed to ack {:x}: {:?}", transaction.remote.0, err),
        }
    }

    fn deliver(
        self: &Arc<Self>,
        cleartext: &CleartextNetworkPDU,
        upper: UpperPDU,
        seq: u32,
        segmented: bool,
        lower_transport_pdus: SegmentMap<LowerTransportPdu>,
        network_pdus: SegmentMap<NetworkPdu>,
    ) -> Result<Option<Message>, DeviceError> {
        let mut header = MessageHeader::new(cleartext.src, cleartext.dst);
        header.pdu_type = cleartext.pdu_type;
        header.ttl.replace(cleartext.ttl);
        header.seq = seq;
        header.iv_index = cleartext.iv_index;
        header.net_key_index.replace(cleartext.net_key_index);
        header.segmented = segmented;
        header.network_pdus = network_pdus;

        let message = match upper {
            UpperPDU::Access(access) => {
                let addressing = UpperContext {
                    seq,
                    src: cleartext.src,
                    dst: cleartext.dst,
                    iv_index: cleartext.iv_index,
                    net_key_index: cleartext.net_key_index,
                };
                let decrypted = Upper::process_inbound_access(&*self.keys, &access, &addressing)
                    .map_err(|err| self.inbound_failure("upper transport", err))?;
                let payload = match AccessPayload::parse(&decrypted.access_pdu) {
                    Ok(payload) => payload,
                    Err(_) => {
                        warn!("unknown access pdu from {:x}", cleartext.src.0);
                        self.status.on_unknown_pdu(cleartext.src, &decrypted.access_pdu);
                        return Ok(None);
                    }
                };
                header.dst = decrypted.dst;
                Message::Access(AccessMessage {
                    header,
                    key: decrypted.key,
                    aszmic: access.szmic == SzMic::Bit64,
                    payload,
                    access_pdu: decrypted.access_pdu,
                    upper_transport_pdu: access.payload,
                    lower_transport_pdus,
                })
            }
            UpperPDU::Control(control) => {
                let parsed = Upper::process_inbound_control(&control)
                    .map_err(|err| self.inbound_failure("upper transport", err))?;
                let mut transport_control_pdu = Vec::new();
                control.emit(&mut transport_control_pdu)?;
                let message = ControlMessage {
                    header,
                    opcode: ControlOpcode::Transport(control.opcode),
                    parameters: control.parameters,
                    transport_control_pdu,
                    lower_transport_pdus,
                    transport_control_message: parsed,
                };
                if let Some(TransportControlMessage::SegmentAcknowledgement(ack)) = parsed {
                    self.block_ack_received(cleartext, ack);
                }
                Message::Control(message)
            }
        };

        self.status.on_message_decrypted(&message);
        Ok(Some(message))
    }

    fn deliver_proxy(
        &self,
        cleartext: &CleartextNetworkPDU,
        proxy: ProxyConfigurationPDU,
        data: &[u8],
    ) -> Result<Message, DeviceError> {
        let mut header = MessageHeader::new(cleartext.src, cleartext.dst);
        header.pdu_type = PduType::ProxyConfiguration;
        header.ttl.replace(cleartext.ttl);
        header.seq = cleartext.seq;
        header.iv_index = cleartext.iv_index;
        header.net_key_index.replace(cleartext.net_key_index);
        header.network_pdus.insert(0, Self::network_pdu(data)?);

        let mut transport_control_pdu = Vec::new();
        proxy.emit(&mut transport_control_pdu)?;
        let mut lower_transport_pdus = SegmentMap::new();
        lower_transport_pdus.insert(
            0,
            LowerTransportPdu::from_slice(&transport_control_pdu)
                .map_err(|_| DeviceError::InsufficientBuffer)?,
        );
        let message = Message::Control(ControlMessage {
            header,
            opcode: ControlOpcode::Proxy(proxy.opcode),
            parameters: Vec::from_slice(&proxy.parameters)
                .map_err(|_| DeviceError::InsufficientBuffer)?,
            transport_control_pdu,
            lower_transport_pdus,
            transport_control_message: None,
        });
        self.status.on_message_decrypted(&message);
        Ok(message)
    }

    /// Retransmits what `ack` reports missing from our pending transaction, or closes it.
    fn block_ack_received(self: &Arc<Self>, cleartext: &CleartextNetworkPDU, ack: SegmentAck) {
        let remote = cleartext.src;
        self.status.on_block_ack_received(remote, &ack);
        let local = match cleartext.dst {
            Address::Unicast(local) => local,
            _ => return,
        };
        let key = (local, ack.seq_zero);

        let pending = {
            let mut outbound = lock(&self.outbound);
            let transaction = match outbound.get(&key) {
                Some(transaction) => transaction,
                None => {
                    debug!("block ack for unknown seq_zero {} from {:x}", ack.seq_zero, remote.0);
                    return;
                }
            };
            let missing: std::vec::Vec<u8> =
                ack.block_ack.missing(transaction.segment_count).collect();
            if ack.block_ack.bits() != 0 && !missing.is_empty() {
                Some((transaction.message.clone(), missing))
            } else {
                if let Some(Outbound {
                    timer: Some(timer), ..
                }) = outbound.remove(&key)
                {
                    timer.cancel();
                }
                None
            }
        };

        match pending {
            Some((message, missing)) => {
                debug!("{} segments missing at {:x}", missing.len(), remote.0);
                if let Err(err) = self.resend(&message, &missing) {
                    error!("retransmission to {:x} failed: {:?}", remote.0, err);
                }
            }
            None if ack.block_ack.bits() == 0 => {
                warn!("seq_zero {} cancelled by {:x}", ack.seq_zero, remote.0);
                self.status.on_transaction_timeout(remote);
            }
            None => info!("seq_zero {} acknowledged by {:x}", ack.seq_zero, remote.0),
        }
    }
}
