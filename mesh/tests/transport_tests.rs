use drogue_mesh::address::{Address, LabelUuid, UnicastAddress};
use drogue_mesh::app::ApplicationKeyIdentifier;
use drogue_mesh::keys::{ApplicationKey, DeviceKey, KeyStore, NetworkKey, NodeDetails};
use drogue_mesh::message::{AccessKey, AccessMessage, ControlMessage, ControlOpcode, Message};
use drogue_mesh::pdu::access::Opcode;
use drogue_mesh::pdu::proxy::{FilterType, ProxyConfigurationPDU, ProxyOpcode};
use drogue_mesh::{BearerSink, DeviceError, MeshTransport, StatusSink, TransportConfig};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::runtime::Handle;

static INIT: Once = Once::new();

fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

const NET_KEY: [u8; 16] = [
    0x7d, 0xd7, 0x36, 0x4c, 0xd8, 0x42, 0xad, 0x18, 0xc1, 0x7c, 0x2b, 0x82, 0x0c, 0x84, 0xc3, 0xd6,
];
const APP_KEY: [u8; 16] = [
    0x63, 0x96, 0x47, 0x71, 0x73, 0x4f, 0xbd, 0x76, 0xe3, 0xb4, 0x05, 0x19, 0xd1, 0xd9, 0x4a, 0x48,
];

fn address(addr: u16) -> UnicastAddress {
    UnicastAddress::new(addr).unwrap()
}

#[derive(Clone)]
struct Keys {
    network_key: NetworkKey,
    app_key: ApplicationKey,
    labels: Vec<LabelUuid>,
}

impl Keys {
    fn new() -> Self {
        Self {
            network_key: NetworkKey::new(0, NET_KEY).unwrap(),
            app_key: ApplicationKey::new(0, 0, APP_KEY).unwrap(),
            labels: Vec::new(),
        }
    }

    fn with_label(mut self, label: LabelUuid) -> Self {
        self.labels.push(label);
        self
    }

    fn device_key(address: UnicastAddress) -> DeviceKey {
        DeviceKey::new([u16::from(address) as u8; 16])
    }
}

impl KeyStore for Keys {
    fn iv_index(&self) -> u32 {
        0x12345678
    }

    fn primary_network_key(&self) -> Option<NetworkKey> {
        Some(self.network_key)
    }

    fn network_key(&self, index: u16) -> Option<NetworkKey> {
        Some(self.network_key).filter(|key| key.index() == index)
    }

    fn network_keys(&self) -> Vec<NetworkKey> {
        vec![self.network_key]
    }

    fn application_keys(&self, net_key_index: u16) -> Vec<ApplicationKey> {
        vec![self.app_key]
            .into_iter()
            .filter(|key| key.net_key_index() == net_key_index)
            .collect()
    }

    fn label_uuids(&self) -> Vec<LabelUuid> {
        self.labels.clone()
    }

    fn node(&self, address: UnicastAddress) -> Option<NodeDetails> {
        Some(NodeDetails {
            device_key: Some(Self::device_key(address)),
            ttl: 3,
            sequence: 0,
        })
    }
}

#[derive(Default)]
struct Outbox {
    pdus: Mutex<VecDeque<Vec<u8>>>,
}

impl BearerSink for Outbox {
    fn on_pdu_ready(&self, _dst: Address, pdu: &[u8]) {
        self.pdus.lock().unwrap().push_back(pdu.to_vec());
    }
}

#[derive(Default)]
struct Recorder {
    timeouts: Mutex<Vec<UnicastAddress>>,
    delivered: Mutex<usize>,
}

impl StatusSink for Recorder {
    fn on_message_decrypted(&self, _message: &Message) {
        *self.delivered.lock().unwrap() += 1;
    }

    fn on_transaction_timeout(&self, address: UnicastAddress) {
        self.timeouts.lock().unwrap().push(address);
    }
}

struct Node {
    address: UnicastAddress,
    transport: MeshTransport,
    outbox: Arc<Outbox>,
    status: Arc<Recorder>,
}

impl Node {
    fn new(addr: u16, keys: Keys) -> Self {
        let outbox = Arc::new(Outbox::default());
        let status = Arc::new(Recorder::default());
        let transport = MeshTransport::with_handle(
            Arc::new(keys),
            outbox.clone(),
            status.clone(),
            TransportConfig::default(),
            Handle::current(),
        );
        Self {
            address: address(addr),
            transport,
            outbox,
            status,
        }
    }

    fn timeouts(&self) -> Vec<UnicastAddress> {
        self.status.timeouts.lock().unwrap().clone()
    }
}

/// Hands every PDU queued by `from` to `to`, skipping the indices `lose` selects.
fn pump(from: &Node, to: &Node, lose: impl Fn(usize) -> bool) -> Vec<Message> {
    let pdus: Vec<Vec<u8>> = from.outbox.pdus.lock().unwrap().drain(..).collect();
    let mut delivered = Vec::new();
    for (index, pdu) in pdus.into_iter().enumerate() {
        if lose(index) {
            log::info!("losing pdu {} from {}", index, from.address);
            continue;
        }
        if let Some(message) = to.transport.receive(&pdu).unwrap() {
            delivered.push(message);
        }
    }
    delivered
}

fn access(src: &Node, dst: Address, key: AccessKey, len: usize) -> Message {
    let parameters: Vec<u8> = (0..len).map(|i| i as u8).collect();
    AccessMessage::new(src.address, dst, key, Opcode::from_u32(0x8204), &parameters)
        .unwrap()
        .into()
}

#[tokio::test(start_paused = true)]
async fn test_lost_segment_is_recovered() {
    setup();
    let a = Node::new(0x0001, Keys::new());
    let b = Node::new(0x0002, Keys::new());

    let key = AccessKey::Application(Keys::new().app_key);
    let mut message = access(&a, b.address.into(), key, 30);
    let sent = a.transport.send(&mut message).unwrap();
    assert_eq!(3, sent.len());

    assert!(pump(&a, &b, |index| index == 1).is_empty());

    // block acknowledgement timer: 150 ms plus 50 ms per hop
    tokio::time::sleep(Duration::from_millis(400)).await;
    let acks = pump(&b, &a, |_| false);
    assert_eq!(1, acks.len());
    assert_eq!(1, a.transport.stats().retransmitted_segments());

    let delivered = pump(&a, &b, |_| false);
    assert_eq!(1, delivered.len());
    match &delivered[0] {
        Message::Access(received) => {
            assert_eq!(key, received.key);
            assert_eq!(Opcode::from_u32(0x8204), received.opcode());
            assert_eq!(30, received.parameters().len());
            assert_eq!(a.address, received.header.src);
        }
        other => panic!("unexpected {:?}", other),
    }

    // final acknowledgement closes the transaction before it can time out
    pump(&b, &a, |_| false);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(a.timeouts().is_empty());
    assert!(b.timeouts().is_empty());
    assert!(a.outbox.pdus.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_device_key_with_64_bit_mic() {
    setup();
    let a = Node::new(0x0001, Keys::new());
    let b = Node::new(0x0002, Keys::new());

    let key = AccessKey::Device(Keys::device_key(a.address));
    let mut message: Message = AccessMessage::new(
        a.address,
        b.address.into(),
        key,
        Opcode::from_u32(0x8008),
        &[0x55; 20],
    )
    .unwrap()
    .with_aszmic(true)
    .into();
    a.transport.send(&mut message).unwrap();

    let delivered = pump(&a, &b, |_| false);
    match &delivered[..] {
        [Message::Access(received)] => {
            assert_eq!(key, received.key);
            assert!(received.aszmic);
            assert_eq!(&[0x55; 20][..], received.parameters());
            // two octet opcode, 20 octets of parameters and an 8 octet TransMIC
            assert_eq!(30, received.upper_transport_pdu.len());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(1, *b.status.delivered.lock().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_virtual_destination() {
    setup();
    let label = LabelUuid::new([0x42; 16]).unwrap();
    let a = Node::new(0x0001, Keys::new());
    let b = Node::new(0x0002, Keys::new().with_label(label));
    let c = Node::new(0x0003, Keys::new());

    let mut message = access(&a, label.into(), AccessKey::Application(Keys::new().app_key), 4);
    a.transport.send(&mut message).unwrap();
    let pdu = a.outbox.pdus.lock().unwrap()[0].clone();

    let delivered = pump(&a, &b, |_| false);
    match &delivered[..] {
        [Message::Access(received)] => assert_eq!(Address::LabelUuid(label), received.header.dst),
        other => panic!("unexpected {:?}", other),
    }

    // a node without the label cannot authenticate the upper transport PDU
    assert_eq!(Err(DeviceError::MissingKey), c.transport.receive(&pdu));
    assert_eq!(1, c.transport.stats().authentication_failures());
}

#[tokio::test(start_paused = true)]
async fn test_proxy_configuration() {
    setup();
    let a = Node::new(0x0001, Keys::new());
    let b = Node::new(0x0002, Keys::new());

    let pdu = ProxyConfigurationPDU::set_filter_type(FilterType::AcceptList);
    let mut message: Message = ControlMessage::proxy_configuration(a.address, &pdu)
        .unwrap()
        .into();
    a.transport.send(&mut message).unwrap();
    assert_eq!(Some(0), message.header().ttl);

    match &pump(&a, &b, |_| false)[..] {
        [Message::Control(received)] => {
            assert_eq!(ControlOpcode::Proxy(ProxyOpcode::SetFilterType), received.opcode);
            assert_eq!(&[FilterType::AcceptList as u8][..], &received.parameters[..]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_transaction_times_out() {
    setup();
    let a = Node::new(0x0001, Keys::new());
    let b = Node::new(0x0002, Keys::new());

    let mut message = access(&a, b.address.into(), AccessKey::Application(Keys::new().app_key), 40);
    a.transport.send(&mut message).unwrap();
    assert!(pump(&a, &b, |index| index > 0).is_empty());

    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert_eq!(vec![a.address], b.timeouts());
    assert_eq!(1, b.transport.stats().reassembly_timeouts());
    // the sender never saw an acknowledgement either
    assert_eq!(vec![b.address], a.timeouts());
}

#[tokio::test(start_paused = true)]
async fn test_foreign_network_rejected() {
    setup();
    let a = Node::new(0x0001, Keys::new());
    let mut foreign = Keys::new();
    foreign.network_key = NetworkKey::new(0, [0x01; 16]).unwrap();
    let b = Node::new(0x0002, foreign);

    let mut message = access(&a, b.address.into(), AccessKey::Application(Keys::new().app_key), 2);
    let pdus = a.transport.send(&mut message).unwrap();
    let err = b.transport.receive(&pdus[&0]).unwrap_err();
    assert!(matches!(
        err,
        DeviceError::UnknownNetworkKey | DeviceError::AuthenticationFailed(_)
    ));
    assert_eq!(1, b.transport.stats().authentication_failures());
}

#[tokio::test(start_paused = true)]
async fn test_old_network_key_accepted_during_key_refresh() {
    setup();
    let old_key = [0x3C; 16];
    let mut stale = Keys::new();
    stale.network_key = NetworkKey::new(0, old_key).unwrap();
    let a = Node::new(0x0001, stale);
    let mut refreshing = Keys::new();
    refreshing.network_key = NetworkKey::new(0, NET_KEY)
        .unwrap()
        .with_old_key(old_key)
        .unwrap();
    let b = Node::new(0x0002, refreshing);

    let app_key = Keys::new().app_key;
    assert_eq!(ApplicationKeyIdentifier::from(0x26), app_key.aid());
    let mut message = access(&a, b.address.into(), AccessKey::Application(app_key), 6);
    a.transport.send(&mut message).unwrap();

    match &pump(&a, &b, |_| false)[..] {
        [Message::Access(received)] => {
            assert_eq!(a.address, received.header.src);
            assert_eq!(Some(0), received.header.net_key_index);
            assert_eq!(6, received.parameters().len());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(0, b.transport.stats().authentication_failures());
}
