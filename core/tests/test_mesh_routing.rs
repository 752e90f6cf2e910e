// Integration tests for multi-hop forwarding
//
// Three nodes share one simulated radio: a gateway G with a serial link to
// the base station, a relay R and a leaf L. Packets only move when the test
// pumps a node's outbox into another node's scanner.

use parking_lot::Mutex;
use std::sync::Arc;
use unified_comms_core::config::CommsConfig;
use unified_comms_core::routing::{IncomingPath, OutgoingRoute, RouteRecord};
use unified_comms_core::transport::ble::{
    AdvertisingCodec, AdvertisingDriver, AdvertisingPacket, BluetoothInterface, ScanReport,
};
use unified_comms_core::transport::serial::{SerialDriver, SerialFrame, SerialInterface};
use unified_comms_core::{
    Address, Channel, CommsError, CommsInterface, CommsNode, IncomingRoute, InterfaceKind, Message,
    PayloadKind, PayloadType, ReceiveHandler,
};

const GATEWAY: Address = Address::new(0x0000_00C0_0001);
const RELAY: Address = Address::new(0x0000_00C0_0002);
const LEAF: Address = Address::new(0x0000_00C0_0003);

#[derive(Default)]
struct Air {
    outbox: Mutex<Vec<AdvertisingPacket>>,
}

impl AdvertisingDriver for Air {
    fn advertise(&self, packet: &AdvertisingPacket) -> Result<(), CommsError> {
        self.outbox.lock().push(packet.clone());
        Ok(())
    }

    fn set_scanning(&self, _enabled: bool) -> Result<(), CommsError> {
        Ok(())
    }
}

#[derive(Default)]
struct Uart {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl SerialDriver for Uart {
    fn max_frame_len(&self) -> usize {
        256
    }

    fn transmit(&self, frame: &[u8]) -> Result<(), CommsError> {
        self.frames.lock().push(frame.to_vec());
        Ok(())
    }

    fn set_enabled(&self, _enabled: bool) -> Result<(), CommsError> {
        Ok(())
    }
}

type Inbox = Arc<Mutex<Vec<(InterfaceKind, IncomingRoute, Message)>>>;

struct TestNode {
    address: Address,
    node: CommsNode,
    air: Arc<Air>,
    ble: Arc<BluetoothInterface>,
    inbox: Inbox,
}

impl TestNode {
    fn new(address: Address) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let config = CommsConfig::default().with_local_address(address);
        let node = CommsNode::new(config.clone()).expect("valid config");
        let air = Arc::new(Air::default());
        let ble = Arc::new(BluetoothInterface::new(
            air.clone(),
            AdvertisingCodec::new(address),
            &config.bluetooth,
        ));
        node.register(ble.clone()).expect("register bluetooth");

        let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = inbox.clone();
        let application: ReceiveHandler =
            Arc::new(move |kind: InterfaceKind, route: &IncomingRoute, message: &Message| {
                sink.lock().push((kind, *route, message.clone()));
            });
        node.start(Some(application));
        Self {
            address,
            node,
            air,
            ble,
            inbox,
        }
    }

    /// Hand everything this node advertised to `other`
    fn pump_to(&self, other: &TestNode) -> usize {
        let packets: Vec<_> = self.air.outbox.lock().drain(..).collect();
        for packet in &packets {
            other.ble.scan_received(&ScanReport {
                address: self.address,
                rssi: -70,
                connectable: packet.connectable,
                data: packet.data.to_vec(),
            });
        }
        packets.len()
    }
}

fn gateway_with_serial() -> (TestNode, Arc<SerialInterface>, Arc<Uart>) {
    let gateway = TestNode::new(GATEWAY);
    let uart = Arc::new(Uart::default());
    let serial = Arc::new(SerialInterface::new(uart.clone(), 256));
    gateway.node.register(serial.clone()).expect("register serial");
    (gateway, serial, uart)
}

#[test]
fn test_base_instruction_reaches_leaf_over_two_hops() {
    let (gateway, serial, _uart) = gateway_with_serial();
    let relay = TestNode::new(RELAY);
    let leaf = TestNode::new(LEAF);

    let instruction = OutgoingRoute::new(PayloadKind::Rpc, vec![0x01, 0x02, 0x03])
        .via(RouteRecord::new(RELAY, InterfaceKind::Bluetooth, Channel::DEFAULT))
        .via(RouteRecord::new(LEAF, InterfaceKind::Bluetooth, Channel::DEFAULT))
        .to_bytes()
        .expect("route fits");
    let frame = SerialFrame {
        address: Address::BASE,
        sequence: 0,
        payload_type: PayloadType::OUTGOING,
        payload: instruction,
    };
    serial.receive_bytes(&frame.to_bytes().expect("frame"));

    assert_eq!(gateway.pump_to(&relay), 1);
    {
        let inbox = relay.inbox.lock();
        assert_eq!(inbox.len(), 1);
        let (_, route, message) = &inbox[0];
        assert_eq!(message.source, GATEWAY);
        assert_eq!(message.destination, RELAY);
        assert_eq!(message.payload_type, PayloadType::OUTGOING);
        assert_eq!(message.payload[0], 1);
        assert_eq!(route.record.hop, GATEWAY);
    }

    assert_eq!(relay.pump_to(&leaf), 1);
    let inbox = leaf.inbox.lock();
    assert_eq!(inbox.len(), 1);
    let (kind, _, message) = &inbox[0];
    assert_eq!(*kind, InterfaceKind::Bluetooth);
    assert_eq!(message.source, RELAY);
    assert_eq!(message.destination, LEAF);
    assert_eq!(message.kind(), PayloadKind::Rpc);
    assert_eq!(&message.payload[..3], &[0x01, 0x02, 0x03]);

    println!("✓ Base station instruction forwarded over two BLE hops");
}

#[test]
fn test_instruction_overheard_by_bystander_is_not_forwarded() {
    let (gateway, serial, _uart) = gateway_with_serial();
    let bystander = TestNode::new(LEAF);

    let instruction = OutgoingRoute::new(PayloadKind::Rpc, vec![0x0F])
        .via(RouteRecord::new(RELAY, InterfaceKind::Bluetooth, Channel::DEFAULT))
        .via(RouteRecord::new(Address::new(0x99), InterfaceKind::Bluetooth, Channel::DEFAULT))
        .to_bytes()
        .unwrap();
    let frame = SerialFrame {
        address: Address::BASE,
        sequence: 7,
        payload_type: PayloadType::OUTGOING,
        payload: instruction,
    };
    serial.receive_bytes(&frame.to_bytes().unwrap());

    assert_eq!(gateway.pump_to(&bystander), 1);
    assert_eq!(bystander.inbox.lock().len(), 1);
    assert!(bystander.air.outbox.lock().is_empty());

    println!("✓ Forwarding instructions addressed elsewhere are ignored");
}

#[test]
fn test_serial_instruction_for_another_gateway_is_dropped() {
    let (gateway, serial, _uart) = gateway_with_serial();

    let instruction = OutgoingRoute::new(PayloadKind::Rpc, vec![0x0A])
        .via(RouteRecord::new(RELAY, InterfaceKind::Bluetooth, Channel::DEFAULT))
        .to_bytes()
        .unwrap();
    let frame = SerialFrame {
        address: Address::new(0x1234),
        sequence: 3,
        payload_type: PayloadType::OUTGOING,
        payload: instruction,
    };
    serial.receive_bytes(&frame.to_bytes().unwrap());

    {
        let inbox = gateway.inbox.lock();
        assert_eq!(inbox.len(), 1);
        let (kind, _, message) = &inbox[0];
        assert_eq!(*kind, InterfaceKind::Serial);
        assert_eq!(message.source, Address::BROADCAST);
        assert_eq!(message.destination, Address::new(0x1234));
    }
    assert!(gateway.air.outbox.lock().is_empty());

    println!("✓ Serial instructions for another node are not launched");
}

#[test]
fn test_telemetry_relayed_up_serial() {
    let (gateway, _serial, uart) = gateway_with_serial();
    let leaf = TestNode::new(LEAF);

    let reading = Message::new(LEAF, Address::BROADCAST, PayloadKind::Tdf3, vec![0x09, 0x09]);
    leaf.ble.send(Channel::DEFAULT, &reading).expect("advertise");
    assert_eq!(leaf.pump_to(&gateway), 1);

    let frames = uart.frames.lock();
    assert_eq!(frames.len(), 1);
    let frame = SerialFrame::from_bytes(&frames[0]).expect("serial frame");
    assert_eq!(frame.address, GATEWAY);
    assert_eq!(frame.payload_type, PayloadType::INCOMING);

    let path = IncomingPath::from_bytes(&frame.payload).expect("incoming stack");
    assert_eq!(path.num_hops(), 1);
    assert_eq!(path.first_hop.record.hop, LEAF);
    assert_eq!(path.first_hop.record.interface, InterfaceKind::Bluetooth);
    assert_eq!(path.first_hop.metadata.rssi, 100);
    assert_eq!(path.payload_type, PayloadType::TDF3);
    assert_eq!(&path.payload[..2], &[0x09, 0x09]);

    println!("✓ Telemetry heard over BLE is wrapped and sent to the base");
}

#[test]
fn test_relayed_telemetry_gains_a_hop() {
    let (gateway, _serial, uart) = gateway_with_serial();

    // An INCOMING stack a relay produced for a reading it heard from the leaf
    let first_hop = IncomingRoute::new(
        RouteRecord::new(LEAF, InterfaceKind::Bluetooth, Channel::DEFAULT),
        Default::default(),
    );
    let heard = Message::new(LEAF, Address::BROADCAST, PayloadKind::Tdf3, vec![0x42]);
    let stack = unified_comms_core::routing::push_incoming_hop(&first_hop, &heard).unwrap();
    let relayed = Message::new(RELAY, Address::BROADCAST, PayloadType::INCOMING, stack);

    let relay_air = Arc::new(Air::default());
    let relay_ble = BluetoothInterface::new(
        relay_air.clone(),
        AdvertisingCodec::new(RELAY),
        &CommsConfig::default().bluetooth,
    );
    relay_ble.send(Channel::DEFAULT, &relayed).unwrap();
    for packet in relay_air.outbox.lock().iter() {
        gateway.ble.scan_received(&ScanReport {
            address: RELAY,
            rssi: -50,
            connectable: true,
            data: packet.data.to_vec(),
        });
    }

    let frames = uart.frames.lock();
    assert_eq!(frames.len(), 1);
    let frame = SerialFrame::from_bytes(&frames[0]).unwrap();
    let path = IncomingPath::from_bytes(&frame.payload).unwrap();
    assert_eq!(path.num_hops(), 2);
    assert_eq!(path.relays[0].record.hop, RELAY);
    assert_eq!(path.first_hop.record.hop, LEAF);
    assert_eq!(path.payload, vec![0x42]);

    println!("✓ Relayed INCOMING stacks gain one hop per gateway");
}
