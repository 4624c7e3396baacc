//! # Weft - A real-time messaging fabric
//!
//! Weft is a horizontally scalable messaging fabric for persistent client
//! connections (game / chat / presence workloads). Clients connect to
//! front-end servers over a length-prefixed TCP protocol, authenticate with
//! an opaque user identifier, join named channels, exchange direct messages,
//! and attach to *locations* - authoritative back-end processes that own the
//! state of a named world.
//!
//! ## Core Components
//!
//! - **Dispatch engine** ([`dispatch`]): walks a dotted path of named
//!   handlers on an application root object, enforcing authority at every
//!   step and composing router chains with async continuations.
//! - **Connection registry** ([`frontend::ConnectionRegistry`]): the
//!   per-process index of connections, user ids, channels and location
//!   attachments, bridged to broker subscriptions.
//! - **Location registry** ([`locations::LocationRegistry`]): the
//!   cluster-wide directory of live location processes, with heartbeat
//!   liveness and connect/disconnect announcements.
//! - **Message manager** ([`frontend::MessageManager`]): routes inbound
//!   broker and location traffic back into local deliveries or dispatches.
//! - **Location gateway** ([`locations::Gateway`]): fronts a location
//!   process to the cluster.
//!
//! ## Cluster Layout
//!
//! ```text
//! client --> front-end TCP --> dispatch --> root handlers
//!                |                             |
//!                v                             v
//!         connection registry <-------- senders (uid / channel / location)
//!                |                             |
//!                v                             v
//!          broker device  <--------->  other front-ends
//!                |
//!                v
//!        location processes <-------> location registry
//! ```
//!
//! The fabric is in-memory and best-effort: per-publisher FIFO is the only
//! ordering guarantee, and frames published while the broker is unreachable
//! are dropped.

pub mod broker;
pub mod cli;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod envelope;
pub mod frontend;
pub mod locations;
pub mod net;
pub mod topic;

pub use crate::broker::{BrokerClient, BrokerDevice};
pub use crate::codec::{CodecError, FrameCodec};
pub use crate::config::{Config, ConfigError};
pub use crate::dispatch::{
    Access, DispatchError, HandlerKind, Lookup, Loopback, Next, Node, Proxy, Sign, dispatch,
    dispatch_with_loopback,
};
pub use crate::domain::{ChannelName, ConnectionId, Ident, Uid};
pub use crate::envelope::{Envelope, Kwargs};
pub use crate::frontend::{
    ConnectionRegistry, FrontendRoot, FrontendServer, MessageManager, RegistryError,
};
pub use crate::locations::{Gateway, GatewayError, LocationRegistry};
pub use crate::topic::{Topic, TopicError};
