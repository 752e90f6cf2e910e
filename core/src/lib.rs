// Unified Comms: one message abstraction over serial, BLE advertising and GATT
//
// Battery-powered sensor nodes exchange small telemetry and control packets
// over very different links. Every link is wrapped in a `CommsInterface`
// that speaks `Message`; the `Router` lets a node act as a store-and-forward
// gateway between them.

pub mod config;
pub mod crypto;
pub mod encoding;
pub mod message;
pub mod routing;
pub mod transport;

use std::sync::Arc;
use thiserror::Error;

pub use config::CommsConfig;
pub use crypto::{AesKey, BlockCipher, KeyLookup, NoKeys, SoftwareAes, StaticKeys};
pub use message::{Address, Message, PayloadKind, PayloadType};
pub use routing::{IncomingPath, IncomingRoute, OutgoingRoute, RouteRecord, Router};
pub use transport::{
    Channel, CommsInterface, InterfaceKind, InterfaceRegistry, ListenDuration, ReceiveHandler,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommsError {
    /// Destination unreachable on this transport, or no active connection
    #[error("Invalid address")]
    InvalidAddress,
    #[error("Invalid data: {0}")]
    InvalidData(String),
    /// Transport not ready, e.g. no subscriber
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("No free send buffer")]
    UnavailableResource,
    #[error("Timed out")]
    Timeout,
    #[error("Buffer too small: need {need} bytes, got {got}")]
    BufferTooSmall { need: usize, got: usize },
    #[error("Transport error: {0}")]
    Generic(String),
}

impl From<encoding::Csiro85Error> for CommsError {
    fn from(err: encoding::Csiro85Error) -> Self {
        match err {
            encoding::Csiro85Error::OutputTooSmall { need, got } => CommsError::BufferTooSmall { need, got },
            other => CommsError::InvalidData(other.to_string()),
        }
    }
}

impl From<crypto::CryptoError> for CommsError {
    fn from(err: crypto::CryptoError) -> Self {
        match err {
            crypto::CryptoError::UnalignedBlocks(_) => CommsError::InvalidData(err.to_string()),
            crypto::CryptoError::CipherFailure(reason) => CommsError::Generic(reason),
        }
    }
}

impl From<routing::RouteError> for CommsError {
    fn from(err: routing::RouteError) -> Self {
        CommsError::InvalidData(err.to_string())
    }
}

// ============================================================================
// NODE
// ============================================================================

/// A node: its configuration, its interfaces and the router between them.
///
/// Register interfaces, then call [`CommsNode::start`] to install the
/// routing receive handler.
pub struct CommsNode {
    config: CommsConfig,
    registry: Arc<InterfaceRegistry>,
    router: Arc<Router>,
}

impl CommsNode {
    pub fn new(config: CommsConfig) -> Result<Self, CommsError> {
        config.validate()?;
        let registry = Arc::new(InterfaceRegistry::new());
        let router = Arc::new(Router::new(config.local_address, registry.clone()));
        Ok(Self {
            config,
            registry,
            router,
        })
    }

    pub fn config(&self) -> &CommsConfig {
        &self.config
    }

    pub fn local_address(&self) -> Address {
        self.config.local_address
    }

    pub fn registry(&self) -> &Arc<InterfaceRegistry> {
        &self.registry
    }

    pub fn register(&self, interface: Arc<dyn CommsInterface>) -> Result<(), CommsError> {
        self.registry.register(interface)
    }

    /// Deliver received messages to `application` and forward them as routed
    pub fn start(&self, application: Option<ReceiveHandler>) {
        let handler = self.router.clone().into_handler(application);
        self.registry.set_receive_handler(Some(handler));
        tracing::info!(
            "Node {} started with {:?}",
            self.config.local_address,
            self.registry.kinds()
        );
    }

    pub fn stop(&self) {
        self.registry.set_receive_handler(None);
    }

    pub fn send(&self, interface: InterfaceKind, channel: Channel, message: &Message) -> Result<(), CommsError> {
        self.registry.send(interface, channel, message)
    }

    pub fn listen(&self, interface: InterfaceKind, duration: ListenDuration) -> Result<(), CommsError> {
        self.registry.listen(interface, duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let err: CommsError = encoding::Csiro85Error::OutputTooSmall { need: 5, got: 4 }.into();
        assert_eq!(err, CommsError::BufferTooSmall { need: 5, got: 4 });
        let err: CommsError = routing::RouteError::ZeroHops.into();
        assert!(matches!(err, CommsError::InvalidData(_)));
        let err: CommsError = crypto::CryptoError::CipherFailure("engine busy".into()).into();
        assert_eq!(err, CommsError::Generic("engine busy".into()));
    }

    #[test]
    fn test_node_rejects_invalid_config() {
        let config = CommsConfig::default().with_local_address(Address::BROADCAST);
        assert!(matches!(CommsNode::new(config), Err(CommsError::InvalidAddress)));
    }
}
