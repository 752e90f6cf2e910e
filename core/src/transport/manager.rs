//! Interface registry: one instance of each transport
//!
//! The registry owns the long-lived interfaces, resolves interface ids from
//! route records to handles, fans a single receive handler out to every
//! interface and keeps a listen controller per interface.

use super::abstraction::{Channel, CommsInterface, InterfaceKind, ReceiveHandler};
use super::listen::{ListenController, ListenDuration, ListenMode};
use crate::message::Message;
use crate::CommsError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

struct Registered {
    interface: Arc<dyn CommsInterface>,
    listen: ListenController,
}

/// Registry of the node's interfaces
#[derive(Default)]
pub struct InterfaceRegistry {
    interfaces: RwLock<HashMap<InterfaceKind, Registered>>,
    handler: RwLock<Option<ReceiveHandler>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialise and register an interface; each kind may be registered once
    pub fn register(&self, interface: Arc<dyn CommsInterface>) -> Result<(), CommsError> {
        let kind = interface.kind();
        let mut interfaces = self.interfaces.write();
        if interfaces.contains_key(&kind) {
            return Err(CommsError::InvalidState(format!("{} interface already registered", kind)));
        }
        interface.init()?;
        interface.set_receive_handler(self.handler.read().clone());
        interfaces.insert(
            kind,
            Registered {
                listen: ListenController::new(interface.clone()),
                interface,
            },
        );
        info!("Registered {} interface", kind);
        Ok(())
    }

    pub fn get(&self, kind: InterfaceKind) -> Option<Arc<dyn CommsInterface>> {
        self.interfaces.read().get(&kind).map(|r| r.interface.clone())
    }

    /// Resolve a 4-bit interface id to a registered interface
    pub fn resolve(&self, id: u8) -> Result<Arc<dyn CommsInterface>, CommsError> {
        let kind = InterfaceKind::from_id(id)?;
        self.get(kind)
            .ok_or_else(|| CommsError::InvalidState(format!("{} interface not registered", kind)))
    }

    pub fn kinds(&self) -> Vec<InterfaceKind> {
        let mut kinds: Vec<_> = self.interfaces.read().keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn send(&self, kind: InterfaceKind, channel: Channel, message: &Message) -> Result<(), CommsError> {
        let interface = self
            .get(kind)
            .ok_or_else(|| CommsError::InvalidState(format!("{} interface not registered", kind)))?;
        debug!(
            "Sending {} bytes to {} via {} channel {}",
            message.payload.len(),
            message.destination,
            kind,
            channel
        );
        interface.send(channel, message)
    }

    /// Install `handler` on every interface, present and future
    pub fn set_receive_handler(&self, handler: Option<ReceiveHandler>) {
        *self.handler.write() = handler.clone();
        for registered in self.interfaces.read().values() {
            registered.interface.set_receive_handler(handler.clone());
        }
    }

    pub fn listen(&self, kind: InterfaceKind, duration: ListenDuration) -> Result<(), CommsError> {
        let interfaces = self.interfaces.read();
        let registered = interfaces
            .get(&kind)
            .ok_or_else(|| CommsError::InvalidState(format!("{} interface not registered", kind)))?;
        registered.listen.listen(duration)
    }

    pub fn listen_mode(&self, kind: InterfaceKind) -> Option<ListenMode> {
        self.interfaces.read().get(&kind).map(|r| r.listen.mode())
    }
}
