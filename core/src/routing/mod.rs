//! Multi-hop routing between interfaces
//!
//! - `record`: the per-hop wire records (`RouteRecord`, `RouteMetadata`, `IncomingRoute`)
//! - `stack`: the routable header stacks carried by OUTGOING and INCOMING payloads
//! - `router`: the stateless forwarding rules that move messages between interfaces
//!
//! A base station steers a packet by wrapping it in an OUTGOING stack; every
//! node on the path peels one record and forwards the rest. Telemetry heard
//! over the air travels the other way: each gateway pushes the route it was
//! received on and sends the INCOMING result up its serial link.

pub mod record;
pub mod router;
pub mod stack;

pub use record::{
    IncomingRoute, RouteMetadata, RouteRecord, INCOMING_ROUTE_LEN, ROUTE_METADATA_LEN,
    ROUTE_RECORD_LEN,
};
pub use router::{Forward, Router};
pub use stack::{
    push_incoming_hop, IncomingPath, OutgoingRoute, OutgoingStep, MAX_ROUTING_PACKET_SIZE,
};

use crate::message::PayloadKind;
use crate::transport::InterfaceKind;
use thiserror::Error;

/// Errors raised while parsing or building route stacks
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Route stack truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("Route stack has zero hops")]
    ZeroHops,

    #[error("Route stack has too many hops: {0}")]
    TooManyHops(usize),

    #[error("Hop length {declared} inconsistent with {available} available bytes")]
    LengthMismatch { declared: usize, available: usize },

    #[error("Routing packet too large: {0} bytes (max {MAX})", MAX = MAX_ROUTING_PACKET_SIZE)]
    TooLarge(usize),

    #[error("Unknown interface id: {0}")]
    UnknownInterface(u8),

    #[error("Forwarding over {0} is not supported")]
    UnsupportedInterface(InterfaceKind),

    #[error("Payload kind {0:?} carries no route stack")]
    NotRoutable(PayloadKind),
}
