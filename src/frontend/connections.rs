//! The per-process connection registry.
//!
//! Four intersecting indexes - connections, uid bindings, channel
//! subscriptions, location attachments - kept behind a single lock because
//! their invariants span maps (no empty multimap set may persist, the uid
//! maps are bijective inverses, and the subscribed broker topic set must
//! always equal the set derivable from the indexes). Bridge calls to the
//! subscription and publish surfaces happen after the lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::dispatch::DispatchError;
use crate::domain::{ChannelName, ConnectionId, Ident, Uid};
use crate::envelope::Envelope;
use crate::topic::Topic;

/// Subscription side of a bridge (broker or location stream).
pub trait TopicSubscriber: Send + Sync {
    /// Starts delivering frames for `topic` to this process.
    fn subscribe(&self, topic: &Topic);
    /// Stops delivering frames for `topic`.
    fn unsubscribe(&self, topic: &Topic);
}

/// Publish side of the broker bridge.
pub trait TopicPublisher: Send + Sync {
    /// Fans `envelope` out to every process subscribed to `topic`.
    fn publish(&self, topic: &Topic, envelope: &Envelope);
}

/// An index-state violation.
///
/// These are programming errors of the hosting application; they are
/// returned to the dispatch root, logged there, and never tear the
/// front-end down.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// `add` saw an id it already holds.
    #[error("connection {0} already registered")]
    DuplicateConnection(ConnectionId),
    /// An operation named a connection the registry does not hold.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    /// `bind_uid` saw a uid that is already bound.
    #[error("uid {0} is already bound")]
    UidTaken(Uid),
    /// `bind_uid` saw a connection that already has a uid.
    #[error("connection {0} is already bound to a uid")]
    ConnectionAlreadyBound(ConnectionId),
    /// An operation named a uid with no bound connection.
    #[error("unknown uid {0}")]
    UnknownUid(Uid),
    /// `attach_to_location` saw a user already attached elsewhere.
    #[error("uid {0} is already attached to location {1}")]
    AlreadyAttached(Uid, Ident),
    /// `detach_from_location` saw a user not attached there.
    #[error("uid {0} is not attached to location {1}")]
    NotAttached(Uid, Ident),
}

impl From<RegistryError> for DispatchError {
    fn from(error: RegistryError) -> Self {
        DispatchError::handler(error)
    }
}

/// Write half of one client connection.
///
/// Cloneable; sending never blocks and silently drops once the connection
/// task is gone. The sign field is stripped on the way out - client frames
/// never carry authority.
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl ConnectionSender {
    /// Wraps the outbound queue of a connection task.
    pub fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { id, outbound }
    }

    /// The connection's registry handle.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues an envelope for the client.
    pub fn send(&self, mut envelope: Envelope) {
        envelope.sign = None;
        let _ = self.outbound.send(envelope);
    }
}

#[derive(Default)]
struct Indexes {
    connections: HashMap<ConnectionId, ConnectionSender>,
    uid_to_conn: HashMap<Uid, ConnectionId>,
    conn_to_uid: HashMap<ConnectionId, Uid>,
    channel_to_conns: HashMap<ChannelName, HashSet<ConnectionId>>,
    conn_to_channels: HashMap<ConnectionId, HashSet<ChannelName>>,
    uid_to_location: HashMap<Uid, Ident>,
    location_to_uids: HashMap<Ident, HashSet<Uid>>,
}

/// The per-front-end connection registry (see module docs).
pub struct ConnectionRegistry {
    indexes: Mutex<Indexes>,
    broker_sub: std::sync::Arc<dyn TopicSubscriber>,
    broker_pub: std::sync::Arc<dyn TopicPublisher>,
    locations_sub: std::sync::Arc<dyn TopicSubscriber>,
}

impl ConnectionRegistry {
    /// A registry bridged to the broker (uid and channel topics) and the
    /// location-messages stream (location topics).
    pub fn new(
        broker_sub: std::sync::Arc<dyn TopicSubscriber>,
        broker_pub: std::sync::Arc<dyn TopicPublisher>,
        locations_sub: std::sync::Arc<dyn TopicSubscriber>,
    ) -> Self {
        Self {
            indexes: Mutex::new(Indexes::default()),
            broker_sub,
            broker_pub,
            locations_sub,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Indexes> {
        self.indexes.lock().expect("connection indexes poisoned")
    }

    /// Records a fresh connection.
    pub fn add(&self, sender: ConnectionSender) -> Result<(), RegistryError> {
        let mut ix = self.lock();
        let id = sender.id();
        if ix.connections.contains_key(&id) {
            return Err(RegistryError::DuplicateConnection(id));
        }
        ix.connections.insert(id, sender);
        Ok(())
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// The uid bound to a connection, if any.
    pub fn uid_of(&self, id: ConnectionId) -> Option<Uid> {
        self.lock().conn_to_uid.get(&id).cloned()
    }

    /// Binds a uid to a connection and subscribes its direct-send topic.
    pub fn bind_uid(&self, id: ConnectionId, uid: Uid) -> Result<(), RegistryError> {
        {
            let mut ix = self.lock();
            if !ix.connections.contains_key(&id) {
                return Err(RegistryError::UnknownConnection(id));
            }
            if ix.uid_to_conn.contains_key(&uid) {
                return Err(RegistryError::UidTaken(uid));
            }
            if ix.conn_to_uid.contains_key(&id) {
                return Err(RegistryError::ConnectionAlreadyBound(id));
            }
            ix.uid_to_conn.insert(uid.clone(), id);
            ix.conn_to_uid.insert(id, uid.clone());
        }
        self.broker_sub.subscribe(&Topic::SendByUid(uid));
        Ok(())
    }

    /// Adds a connection to a channel; the process's first subscriber also
    /// subscribes the channel topic on the broker. Idempotent per
    /// (connection, channel).
    pub fn subscribe_channel(
        &self,
        id: ConnectionId,
        channel: ChannelName,
    ) -> Result<(), RegistryError> {
        let first = {
            let mut ix = self.lock();
            if !ix.connections.contains_key(&id) {
                return Err(RegistryError::UnknownConnection(id));
            }
            ix.conn_to_channels.entry(id).or_default().insert(channel.clone());
            let conns = ix.channel_to_conns.entry(channel.clone()).or_default();
            let first = conns.is_empty();
            conns.insert(id);
            first
        };
        if first {
            self.broker_sub.subscribe(&Topic::PublishToChannel(channel));
        }
        Ok(())
    }

    /// Removes a connection from a channel; the process's last subscriber
    /// also unsubscribes the channel topic. A no-op when not subscribed.
    pub fn unsubscribe_channel(&self, id: ConnectionId, channel: &ChannelName) {
        let last = {
            let mut ix = self.lock();
            if let Some(channels) = ix.conn_to_channels.get_mut(&id) {
                channels.remove(channel);
                if channels.is_empty() {
                    ix.conn_to_channels.remove(&id);
                }
            }
            match ix.channel_to_conns.get_mut(channel) {
                Some(conns) => {
                    let removed = conns.remove(&id);
                    let empty = conns.is_empty();
                    if empty {
                        ix.channel_to_conns.remove(channel);
                    }
                    removed && empty
                }
                None => false,
            }
        };
        if last {
            self.broker_sub
                .unsubscribe(&Topic::PublishToChannel(channel.clone()));
        }
    }

    /// Attaches a bound user to a location, subscribing its private topic
    /// and (for the process's first local user there) the public topic.
    pub fn attach_to_location(&self, uid: &Uid, ident: &Ident) -> Result<(), RegistryError> {
        let first = {
            let mut ix = self.lock();
            if !ix.uid_to_conn.contains_key(uid) {
                return Err(RegistryError::UnknownUid(uid.clone()));
            }
            match ix.uid_to_location.get(uid) {
                Some(current) if current == ident => return Ok(()),
                Some(current) => {
                    return Err(RegistryError::AlreadyAttached(uid.clone(), current.clone()));
                }
                None => {}
            }
            ix.uid_to_location.insert(uid.clone(), ident.clone());
            let uids = ix.location_to_uids.entry(ident.clone()).or_default();
            let first = uids.is_empty();
            uids.insert(uid.clone());
            first
        };
        self.locations_sub
            .subscribe(&Topic::PrivateFromLocation(ident.clone(), uid.clone()));
        if first {
            self.locations_sub
                .subscribe(&Topic::PublicFromLocation(ident.clone()));
        }
        Ok(())
    }

    /// Detaches a user from a location; the process's last local user
    /// there also unsubscribes the public topic.
    pub fn detach_from_location(&self, uid: &Uid, ident: &Ident) -> Result<(), RegistryError> {
        let last = {
            let mut ix = self.lock();
            match ix.uid_to_location.get(uid) {
                Some(current) if current == ident => {}
                _ => return Err(RegistryError::NotAttached(uid.clone(), ident.clone())),
            }
            ix.uid_to_location.remove(uid);
            match ix.location_to_uids.get_mut(ident) {
                Some(uids) => {
                    uids.remove(uid);
                    let empty = uids.is_empty();
                    if empty {
                        ix.location_to_uids.remove(ident);
                    }
                    empty
                }
                None => false,
            }
        };
        self.locations_sub
            .unsubscribe(&Topic::PrivateFromLocation(ident.clone(), uid.clone()));
        if last {
            self.locations_sub
                .unsubscribe(&Topic::PublicFromLocation(ident.clone()));
        }
        Ok(())
    }

    /// Tears a connection down: uid binding, every channel subscription
    /// and the location attachment all go, and every topic whose sole
    /// justification was this connection is unsubscribed in one pass.
    pub fn remove(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let mut broker_unsubs: Vec<Topic> = Vec::new();
        let mut location_unsubs: Vec<Topic> = Vec::new();
        {
            let mut ix = self.lock();
            if ix.connections.remove(&id).is_none() {
                return Err(RegistryError::UnknownConnection(id));
            }
            if let Some(uid) = ix.conn_to_uid.remove(&id) {
                ix.uid_to_conn.remove(&uid);
                broker_unsubs.push(Topic::SendByUid(uid.clone()));
                if let Some(ident) = ix.uid_to_location.remove(&uid) {
                    let empty = match ix.location_to_uids.get_mut(&ident) {
                        Some(uids) => {
                            uids.remove(&uid);
                            uids.is_empty()
                        }
                        None => false,
                    };
                    location_unsubs.push(Topic::PrivateFromLocation(ident.clone(), uid));
                    if empty {
                        ix.location_to_uids.remove(&ident);
                        location_unsubs.push(Topic::PublicFromLocation(ident));
                    }
                }
            }
            if let Some(channels) = ix.conn_to_channels.remove(&id) {
                for channel in channels {
                    let empty = match ix.channel_to_conns.get_mut(&channel) {
                        Some(conns) => {
                            conns.remove(&id);
                            conns.is_empty()
                        }
                        None => false,
                    };
                    if empty {
                        ix.channel_to_conns.remove(&channel);
                        broker_unsubs.push(Topic::PublishToChannel(channel));
                    }
                }
            }
        }
        for topic in broker_unsubs {
            self.broker_sub.unsubscribe(&topic);
        }
        for topic in location_unsubs {
            self.locations_sub.unsubscribe(&topic);
        }
        Ok(())
    }

    /// Sends directly to one local connection; a no-op if it is gone.
    pub fn send_to(&self, id: ConnectionId, envelope: Envelope) {
        let sender = self.lock().connections.get(&id).cloned();
        if let Some(sender) = sender {
            sender.send(envelope);
        }
    }

    /// Delivers to the holder of `uid` if it is local; otherwise publishes
    /// on the broker and returns `false`. Callers must not assume the
    /// remote side received it.
    pub fn send_by_uid(&self, uid: &Uid, envelope: Envelope) -> bool {
        if self.deliver_to_uid(uid, envelope.clone()) {
            return true;
        }
        self.broker_pub
            .publish(&Topic::SendByUid(uid.clone()), &envelope);
        false
    }

    /// Local-only uid delivery, used when replaying broker frames so a
    /// racing disconnect cannot re-publish and loop.
    pub fn deliver_to_uid(&self, uid: &Uid, envelope: Envelope) -> bool {
        let sender = {
            let ix = self.lock();
            ix.uid_to_conn
                .get(uid)
                .and_then(|id| ix.connections.get(id).cloned())
        };
        match sender {
            Some(sender) => {
                sender.send(envelope);
                true
            }
            None => false,
        }
    }

    /// Delivers to every local subscriber of a channel; unless
    /// `local_only`, also publishes on the broker for the other
    /// front-ends. Broker replays must pass `local_only = true` to prevent
    /// a publish/subscribe loop.
    pub fn publish_to_channel(&self, channel: &ChannelName, envelope: &Envelope, local_only: bool) {
        let targets: Vec<ConnectionSender> = {
            let ix = self.lock();
            ix.channel_to_conns
                .get(channel)
                .map(|conns| {
                    conns
                        .iter()
                        .filter_map(|id| ix.connections.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };
        for sender in targets {
            sender.send(envelope.clone());
        }
        if !local_only {
            self.broker_pub
                .publish(&Topic::PublishToChannel(channel.clone()), envelope);
        }
    }

    /// Delivers to every locally attached user of a location.
    pub fn publish_to_location(&self, ident: &Ident, envelope: &Envelope) {
        let targets: Vec<ConnectionSender> = {
            let ix = self.lock();
            ix.location_to_uids
                .get(ident)
                .map(|uids| {
                    uids.iter()
                        .filter_map(|uid| ix.uid_to_conn.get(uid))
                        .filter_map(|id| ix.connections.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };
        for sender in targets {
            sender.send(envelope.clone());
        }
    }

    /// Delivers to every local connection.
    pub fn publish_to_all(&self, envelope: &Envelope) {
        let targets: Vec<ConnectionSender> = self.lock().connections.values().cloned().collect();
        for sender in targets {
            sender.send(envelope.clone());
        }
    }

    /// The topic set the current index state justifies. Always equal to
    /// the actually-subscribed set; exposed for the invariant tests and
    /// for debugging.
    pub fn derived_topics(&self) -> HashSet<Topic> {
        let ix = self.lock();
        let mut topics = HashSet::new();
        for uid in ix.uid_to_conn.keys() {
            topics.insert(Topic::SendByUid(uid.clone()));
        }
        for channel in ix.channel_to_conns.keys() {
            topics.insert(Topic::PublishToChannel(channel.clone()));
        }
        for (uid, ident) in &ix.uid_to_location {
            topics.insert(Topic::PrivateFromLocation(ident.clone(), uid.clone()));
        }
        for ident in ix.location_to_uids.keys() {
            topics.insert(Topic::PublicFromLocation(ident.clone()));
        }
        topics
    }
}
