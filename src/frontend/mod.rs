//! The front-end server: client TCP termination, the connection registry
//! and the message manager.

pub mod connections;
pub mod message_manager;
pub mod server;

pub use connections::{
    ConnectionRegistry, ConnectionSender, RegistryError, TopicPublisher, TopicSubscriber,
};
pub use message_manager::{LocationLink, LocationLinks, MessageManager};
pub use server::FrontendServer;

use async_trait::async_trait;

use crate::dispatch::{Loopback, Node};
use crate::domain::Ident;
use crate::envelope::Kwargs;

/// The application root object hosted by a front-end.
///
/// Besides being the dispatch tree root, it owns the loopback queue and is
/// informed of location lifecycle changes by the message manager.
#[async_trait]
pub trait FrontendRoot: Node {
    /// The root's deferred-dispatch queue.
    fn loopback(&self) -> &Loopback;

    /// A location went LIVE. `metadata` is what the location registered
    /// with, minus its socket addresses.
    async fn location_added(&self, ident: &Ident, metadata: Kwargs);

    /// A location went DEAD.
    async fn location_removed(&self, ident: &Ident);
}
