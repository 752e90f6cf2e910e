//! Stateless forwarding rules
//!
//! The router looks at one received message at a time:
//!
//! - OUTGOING: peel one record and send the rest to the next hop, or the
//!   final payload once the last record is reached. Only instructions
//!   addressed to this node, or arriving over serial addressed to this node
//!   or the base station, are obeyed.
//! - anything else heard over RF: push the receive route and send the
//!   INCOMING result up the serial link.
//! - anything else from serial: left to the application.

use super::record::IncomingRoute;
use super::stack::{push_incoming_hop, OutgoingStep};
use super::RouteError;
use crate::message::{Address, Message, PayloadKind, PayloadType};
use crate::transport::{Channel, InterfaceKind, InterfaceRegistry, ReceiveHandler};
use crate::CommsError;
use std::sync::Arc;
use tracing::{error, info, warn};

/// One send the router wants performed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub interface: InterfaceKind,
    pub channel: Channel,
    pub message: Message,
}

/// Forwards messages between the interfaces of a registry
pub struct Router {
    local: Address,
    registry: Arc<InterfaceRegistry>,
}

impl Router {
    pub fn new(local: Address, registry: Arc<InterfaceRegistry>) -> Self {
        Self { local, registry }
    }

    pub fn local(&self) -> Address {
        self.local
    }

    /// Decide what, if anything, to send for a received message
    pub fn decide(
        local: Address,
        interface: InterfaceKind,
        route: &IncomingRoute,
        message: &Message,
    ) -> Result<Option<Forward>, RouteError> {
        if message.kind() == PayloadKind::Outgoing {
            // Serial frames addressed to the base station are instructions the
            // base wants this gateway to launch
            let trusted = message.destination == local
                || (interface == InterfaceKind::Serial && message.destination.is_base());
            if !trusted {
                warn!(
                    "Ignoring forwarding instruction from {} to {} via {}",
                    message.source, message.destination, interface
                );
                return Ok(None);
            }
            return Self::next_hop(local, message).map(Some);
        }

        if interface == InterfaceKind::Serial {
            return Ok(None);
        }

        let stack = push_incoming_hop(route, message)?;
        Ok(Some(Forward {
            interface: InterfaceKind::Serial,
            channel: Channel::DEFAULT,
            message: Message {
                source: local,
                destination: Address::BROADCAST,
                payload_type: PayloadType::INCOMING,
                payload: stack,
            },
        }))
    }

    /// Peel one record off an OUTGOING message
    pub fn next_hop(local: Address, message: &Message) -> Result<Forward, RouteError> {
        let kind = message.kind();
        if kind != PayloadKind::Outgoing {
            return Err(RouteError::NotRoutable(kind));
        }
        let (record, payload_type, payload) = match OutgoingStep::peel(&message.payload)? {
            OutgoingStep::Forward { next, stack } => (next, PayloadType::OUTGOING, stack),
            OutgoingStep::LastHop {
                record,
                payload_type,
                payload,
            } => (record, payload_type, payload.to_vec()),
        };
        if !matches!(record.interface, InterfaceKind::Bluetooth | InterfaceKind::Gatt) {
            return Err(RouteError::UnsupportedInterface(record.interface));
        }
        Ok(Forward {
            interface: record.interface,
            channel: record.channel,
            message: Message {
                source: local,
                destination: record.hop,
                payload_type,
                payload,
            },
        })
    }

    /// Route one received message, performing the resulting send
    pub fn handle(
        &self,
        interface: InterfaceKind,
        route: &IncomingRoute,
        message: &Message,
    ) -> Result<Option<Forward>, CommsError> {
        let Some(forward) = Self::decide(self.local, interface, route, message)? else {
            return Ok(None);
        };
        info!(
            "Forwarding {} from {} to {} via {} channel {}",
            forward.message.payload_type,
            interface,
            forward.message.destination,
            forward.interface,
            forward.channel
        );
        self.registry
            .send(forward.interface, forward.channel, &forward.message)?;
        Ok(Some(forward))
    }

    /// Receive handler that gives every message to `application` and then routes it
    pub fn into_handler(self: Arc<Self>, application: Option<ReceiveHandler>) -> ReceiveHandler {
        Arc::new(move |interface: InterfaceKind, route: &IncomingRoute, message: &Message| {
            if let Some(application) = &application {
                application(interface, route, message);
            }
            match self.handle(interface, route, message) {
                Ok(_) => {}
                Err(CommsError::InvalidData(reason)) => {
                    warn!("Dropping unroutable {} from {}: {}", message.payload_type, message.source, reason)
                }
                Err(e) => error!("Forwarding {} from {} failed: {}", message.payload_type, message.source, e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{OutgoingRoute, RouteMetadata, RouteRecord};
    use crate::transport::CommsInterface;
    use parking_lot::Mutex;

    const LOCAL: Address = Address::new(0x0000_0000_00AA);

    fn serial_route() -> IncomingRoute {
        IncomingRoute::new(
            RouteRecord::new(Address::BROADCAST, InterfaceKind::Serial, Channel::DEFAULT),
            RouteMetadata::default(),
        )
    }

    fn ble_route(hop: Address) -> IncomingRoute {
        IncomingRoute::new(
            RouteRecord::new(hop, InterfaceKind::Bluetooth, Channel::DEFAULT),
            RouteMetadata {
                age_ms: 0,
                sequence: 3,
                rssi: 95,
            },
        )
    }

    fn hop(address: u64, interface: InterfaceKind) -> RouteRecord {
        RouteRecord::new(Address::new(address), interface, Channel::DEFAULT)
    }

    fn outgoing(source: Address, destination: Address, route: &OutgoingRoute) -> Message {
        Message::new(source, destination, PayloadType::OUTGOING, route.to_bytes().unwrap())
    }

    #[test]
    fn test_serial_instruction_from_base_is_obeyed() {
        let route = OutgoingRoute::new(PayloadKind::Rpc, vec![1, 2])
            .via(hop(0xB1, InterfaceKind::Bluetooth))
            .via(hop(0xB2, InterfaceKind::Gatt));
        let message = outgoing(Address::BROADCAST, Address::BASE, &route);
        let forward = Router::decide(LOCAL, InterfaceKind::Serial, &serial_route(), &message)
            .unwrap()
            .expect("forwarded");
        assert_eq!(forward.interface, InterfaceKind::Bluetooth);
        assert_eq!(forward.message.destination, Address::new(0xB1));
        assert_eq!(forward.message.source, LOCAL);
        assert_eq!(forward.message.payload_type, PayloadType::OUTGOING);
        assert_eq!(forward.message.payload[0], 1);
    }

    #[test]
    fn test_serial_instruction_for_another_node_is_ignored() {
        let route = OutgoingRoute::new(PayloadKind::Rpc, vec![1]).via(hop(0xB1, InterfaceKind::Bluetooth));
        let message = outgoing(Address::BROADCAST, Address::new(0x1234), &route);
        assert_eq!(
            Router::decide(LOCAL, InterfaceKind::Serial, &serial_route(), &message),
            Ok(None)
        );

        // naming the gateway itself is obeyed
        let message = outgoing(Address::BROADCAST, LOCAL, &route);
        assert!(Router::decide(LOCAL, InterfaceKind::Serial, &serial_route(), &message)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_base_addressed_instruction_over_rf_is_ignored() {
        let route = OutgoingRoute::new(PayloadKind::Rpc, vec![1]).via(hop(0xB1, InterfaceKind::Bluetooth));
        let message = outgoing(Address::new(0x55), Address::BASE, &route);
        assert_eq!(
            Router::decide(LOCAL, InterfaceKind::Bluetooth, &ble_route(Address::new(0x55)), &message),
            Ok(None)
        );
    }

    #[test]
    fn test_instruction_for_someone_else_is_ignored() {
        let route = OutgoingRoute::new(PayloadKind::Rpc, vec![1]).via(hop(0xB1, InterfaceKind::Bluetooth));
        let message = outgoing(Address::new(0x55), Address::new(0x66), &route);
        assert_eq!(
            Router::decide(LOCAL, InterfaceKind::Bluetooth, &ble_route(Address::new(0x55)), &message),
            Ok(None)
        );
    }

    #[test]
    fn test_depth_decrements_until_last_hop() {
        let route = OutgoingRoute::new(PayloadKind::Tdf3, vec![0xEE])
            .via(hop(0x01, InterfaceKind::Bluetooth))
            .via(hop(0x02, InterfaceKind::Bluetooth))
            .via(hop(0x03, InterfaceKind::Gatt));
        let mut message = outgoing(Address::BASE, LOCAL, &route);
        let mut depths = Vec::new();
        loop {
            let forward = Router::next_hop(LOCAL, &message).unwrap();
            if forward.message.payload_type != PayloadType::OUTGOING {
                assert_eq!(forward.interface, InterfaceKind::Gatt);
                assert_eq!(forward.message.payload, vec![0xEE]);
                break;
            }
            depths.push(forward.message.payload[0]);
            message = Message {
                destination: LOCAL,
                ..forward.message
            };
        }
        assert_eq!(depths, vec![2, 1]);
    }

    #[test]
    fn test_unsupported_next_interface() {
        let route = OutgoingRoute::new(PayloadKind::Tdf3, vec![1]).via(hop(0x01, InterfaceKind::Lora));
        let message = outgoing(Address::BASE, LOCAL, &route);
        assert_eq!(
            Router::decide(LOCAL, InterfaceKind::Serial, &serial_route(), &message),
            Err(RouteError::UnsupportedInterface(InterfaceKind::Lora))
        );
    }

    #[test]
    fn test_rf_traffic_goes_up_serial() {
        let heard = Message::new(Address::new(0x42), Address::BROADCAST, PayloadKind::Tdf3, vec![5, 6]);
        let forward = Router::decide(LOCAL, InterfaceKind::Bluetooth, &ble_route(Address::new(0x42)), &heard)
            .unwrap()
            .expect("relayed");
        assert_eq!(forward.interface, InterfaceKind::Serial);
        assert_eq!(forward.message.source, LOCAL);
        assert_eq!(forward.message.destination, Address::BROADCAST);
        assert_eq!(forward.message.payload_type, PayloadType::INCOMING);
        assert_eq!(forward.message.payload[0], 1);
    }

    #[test]
    fn test_serial_traffic_stays_local() {
        let message = Message::new(Address::BROADCAST, LOCAL, PayloadKind::Rpc, vec![1]);
        assert_eq!(
            Router::decide(LOCAL, InterfaceKind::Serial, &serial_route(), &message),
            Ok(None)
        );
    }

    struct Recorder {
        kind: InterfaceKind,
        sent: Mutex<Vec<Message>>,
    }

    impl CommsInterface for Recorder {
        fn kind(&self) -> InterfaceKind {
            self.kind
        }
        fn init(&self) -> Result<(), CommsError> {
            Ok(())
        }
        fn enable(&self, _: bool) -> Result<(), CommsError> {
            Ok(())
        }
        fn send(&self, _: Channel, message: &Message) -> Result<(), CommsError> {
            self.sent.lock().push(message.clone());
            Ok(())
        }
        fn set_receive_handler(&self, _: Option<ReceiveHandler>) {}
    }

    #[test]
    fn test_handler_delivers_then_forwards() {
        let registry = Arc::new(InterfaceRegistry::new());
        let serial = Arc::new(Recorder {
            kind: InterfaceKind::Serial,
            sent: Mutex::new(Vec::new()),
        });
        registry.register(serial.clone()).unwrap();

        let delivered = Arc::new(Mutex::new(0usize));
        let counter = delivered.clone();
        let application: ReceiveHandler = Arc::new(move |_, _: &IncomingRoute, _: &Message| {
            *counter.lock() += 1;
        });
        let handler = Arc::new(Router::new(LOCAL, registry)).into_handler(Some(application));

        let heard = Message::new(Address::new(0x42), LOCAL, PayloadKind::Tdf3, vec![1]);
        handler(InterfaceKind::Bluetooth, &ble_route(Address::new(0x42)), &heard);
        assert_eq!(*delivered.lock(), 1);
        assert_eq!(serial.sent.lock().len(), 1);

        // a broken stack is dropped without reaching serial
        let broken = Message::new(Address::BROADCAST, LOCAL, PayloadType::OUTGOING, vec![0]);
        handler(InterfaceKind::Serial, &serial_route(), &broken);
        assert_eq!(*delivered.lock(), 2);
        assert_eq!(serial.sent.lock().len(), 1);
    }
}
