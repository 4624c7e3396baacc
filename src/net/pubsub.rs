//! Prefix-subscription pub/sub endpoints.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use super::{
    NetError, RECONNECT_DELAY, SEND_QUEUE, decode_parts, decode_topic_frame, encode_parts,
    encode_topic_frame, part_str,
};
use crate::codec::FrameCodec;

const SUBSCRIBE: &str = "sub";
const UNSUBSCRIBE: &str = "unsub";
const ORIGIN: &str = "origin";

struct Subscriber {
    prefixes: HashSet<String>,
    /// Identity for echo suppression; frames published under the same
    /// origin are not delivered back to this subscriber.
    origin: Option<String>,
    frames: mpsc::Sender<Bytes>,
}

/// Bind-side publisher.
///
/// Subscriber connections send `["sub", prefix]` / `["unsub", prefix]`
/// control frames; [`publish`](Self::publish) fans `[topic, body]` frames
/// out to every connection with a matching prefix (the empty prefix
/// matches everything). A full subscriber queue drops frames.
pub struct PubEndpoint {
    local_addr: SocketAddr,
    subscribers: Arc<DashMap<u64, Subscriber>>,
    accept_task: JoinHandle<()>,
}

impl PubEndpoint {
    /// Binds and starts accepting subscribers.
    pub async fn bind(addr: &str) -> Result<Self, NetError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let subscribers: Arc<DashMap<u64, Subscriber>> = Arc::new(DashMap::new());

        let accept_task = tokio::spawn({
            let subscribers = Arc::clone(&subscribers);
            async move {
                let mut next_id = 0u64;
                loop {
                    let stream = match listener.accept().await {
                        Ok((stream, _)) => stream,
                        Err(error) => {
                            warn!(%error, "pub endpoint accept failed");
                            continue;
                        }
                    };
                    next_id += 1;
                    let id = next_id;
                    let (mut sink, mut frames) =
                        Framed::new(stream, FrameCodec::new()).split();
                    let (tx, mut rx) = mpsc::channel::<Bytes>(SEND_QUEUE);
                    subscribers.insert(
                        id,
                        Subscriber {
                            prefixes: HashSet::new(),
                            origin: None,
                            frames: tx,
                        },
                    );
                    tokio::spawn(async move {
                        while let Some(frame) = rx.recv().await {
                            if sink.send(frame).await.is_err() {
                                break;
                            }
                        }
                    });
                    let subscribers = Arc::clone(&subscribers);
                    tokio::spawn(async move {
                        while let Some(Ok(frame)) = frames.next().await {
                            if let Err(error) = apply_control(&subscribers, id, &frame) {
                                warn!(%error, "bad subscription control frame");
                            }
                        }
                        subscribers.remove(&id);
                    });
                }
            }
        });

        Ok(Self {
            local_addr,
            subscribers,
            accept_task,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fans `[topic, body]` out to every matching subscriber.
    pub fn publish(&self, topic: &str, body: &[u8]) {
        self.publish_handle().publish(topic, body);
    }

    /// A cheap cloneable publish surface, detached from the endpoint's
    /// lifetime management.
    pub fn publish_handle(&self) -> PubHandle {
        PubHandle {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

/// Publish surface of a [`PubEndpoint`], cloneable into tasks.
#[derive(Clone)]
pub struct PubHandle {
    subscribers: Arc<DashMap<u64, Subscriber>>,
}

impl PubHandle {
    /// Fans `[topic, body]` out to every matching subscriber.
    pub fn publish(&self, topic: &str, body: &[u8]) {
        self.publish_from(topic, body, None);
    }

    /// Like [`publish`](Self::publish), but skips subscribers that
    /// identified themselves with the same `origin` - the publisher's own
    /// process does not get its frame echoed back.
    pub fn publish_from(&self, topic: &str, body: &[u8], origin: Option<&str>) {
        let frame = match encode_topic_frame(topic, body) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, topic, "cannot encode publication");
                return;
            }
        };
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if origin.is_some() && subscriber.origin.as_deref() == origin {
                continue;
            }
            if subscriber
                .prefixes
                .iter()
                .any(|prefix| topic.starts_with(prefix.as_str()))
                && subscriber.frames.try_send(frame.clone()).is_err()
            {
                trace!(topic, "dropping frame for slow subscriber");
            }
        }
    }
}

impl Drop for PubEndpoint {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn apply_control(
    subscribers: &DashMap<u64, Subscriber>,
    id: u64,
    frame: &[u8],
) -> Result<(), NetError> {
    let parts = decode_parts(frame)?;
    let op = part_str(&parts, 0)?;
    let prefix = part_str(&parts, 1)?.to_owned();
    let Some(mut subscriber) = subscribers.get_mut(&id) else {
        return Ok(());
    };
    match op {
        SUBSCRIBE => {
            subscriber.prefixes.insert(prefix);
        }
        UNSUBSCRIBE => {
            subscriber.prefixes.remove(&prefix);
        }
        ORIGIN => subscriber.origin = Some(prefix),
        _ => return Err(NetError::Malformed("unknown subscription op")),
    }
    Ok(())
}

enum SubCtl {
    Subscribe(String),
    Unsubscribe(String),
}

struct SubConn {
    ctl: mpsc::UnboundedSender<SubCtl>,
    task: JoinHandle<()>,
}

struct SubShared {
    prefixes: Mutex<HashSet<String>>,
    conns: Mutex<HashMap<String, SubConn>>,
    origin: Mutex<Option<String>>,
    inbound: mpsc::UnboundedSender<(String, Bytes)>,
}

/// Connect-side subscriber.
///
/// Maintains connections to one or more [`PubEndpoint`]s, replays its
/// current prefix set on every (re)connect and merges inbound frames into
/// one stream. Connections retry forever; frames published while a
/// connection is down are lost.
#[derive(Clone)]
pub struct SubEndpoint {
    shared: Arc<SubShared>,
}

impl SubEndpoint {
    /// A subscriber with no connections yet; the receiver yields merged
    /// `(topic, body)` frames.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Bytes)>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: Arc::new(SubShared {
                    prefixes: Mutex::new(HashSet::new()),
                    conns: Mutex::new(HashMap::new()),
                    origin: Mutex::new(None),
                    inbound,
                }),
            },
            rx,
        )
    }

    /// Declares this subscriber's identity for echo suppression: matching
    /// publishers' frames are not delivered back. Set before `connect`.
    pub fn set_origin(&self, origin: &str) {
        *self.shared.origin.lock().expect("sub origin poisoned") = Some(origin.to_owned());
    }

    /// Adds a publisher address; a no-op if already connected to it.
    pub fn connect(&self, addr: &str) {
        let mut conns = self.shared.conns.lock().expect("sub conns poisoned");
        if conns.contains_key(addr) {
            return;
        }
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_sub_conn(
            Arc::clone(&self.shared),
            addr.to_owned(),
            ctl_rx,
        ));
        conns.insert(addr.to_owned(), SubConn { ctl: ctl_tx, task });
    }

    /// Drops the connection to a publisher address.
    pub fn disconnect(&self, addr: &str) {
        let removed = self
            .shared
            .conns
            .lock()
            .expect("sub conns poisoned")
            .remove(addr);
        if let Some(conn) = removed {
            conn.task.abort();
        }
    }

    /// Adds a prefix to the subscription set of every connection.
    pub fn subscribe(&self, prefix: &str) {
        let fresh = self
            .shared
            .prefixes
            .lock()
            .expect("sub prefixes poisoned")
            .insert(prefix.to_owned());
        if fresh {
            self.broadcast(|p| SubCtl::Subscribe(p), prefix);
        }
    }

    /// Removes a prefix from the subscription set of every connection.
    pub fn unsubscribe(&self, prefix: &str) {
        let removed = self
            .shared
            .prefixes
            .lock()
            .expect("sub prefixes poisoned")
            .remove(prefix);
        if removed {
            self.broadcast(|p| SubCtl::Unsubscribe(p), prefix);
        }
    }

    fn broadcast(&self, op: impl Fn(String) -> SubCtl, prefix: &str) {
        let conns = self.shared.conns.lock().expect("sub conns poisoned");
        for conn in conns.values() {
            let _ = conn.ctl.send(op(prefix.to_owned()));
        }
    }
}

async fn run_sub_conn(
    shared: Arc<SubShared>,
    addr: String,
    mut ctl: mpsc::UnboundedReceiver<SubCtl>,
) {
    loop {
        if shared.inbound.is_closed() {
            return;
        }
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(_) => {
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        debug!(%addr, "subscriber connected");
        let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();

        let origin = shared.origin.lock().expect("sub origin poisoned").clone();
        let snapshot: Vec<String> = {
            let prefixes = shared.prefixes.lock().expect("sub prefixes poisoned");
            prefixes.iter().cloned().collect()
        };
        let mut replay = Vec::new();
        if let Some(origin) = origin {
            replay.push((ORIGIN, origin));
        }
        for prefix in snapshot {
            replay.push((SUBSCRIBE, prefix));
        }
        let mut replay_failed = false;
        for (op, value) in replay {
            let frame = match encode_parts(&[op.as_bytes(), value.as_bytes()]) {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            if sink.send(frame).await.is_err() {
                replay_failed = true;
                break;
            }
        }
        if replay_failed {
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }

        loop {
            tokio::select! {
                op = ctl.recv() => {
                    let Some(op) = op else { return };
                    let (name, prefix) = match &op {
                        SubCtl::Subscribe(p) => (SUBSCRIBE, p),
                        SubCtl::Unsubscribe(p) => (UNSUBSCRIBE, p),
                    };
                    let Ok(frame) = encode_parts(&[name.as_bytes(), prefix.as_bytes()]) else {
                        continue;
                    };
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                frame = frames.next() => {
                    match frame {
                        Some(Ok(frame)) => match decode_topic_frame(&frame) {
                            Ok((topic, body)) => {
                                if shared.inbound.send((topic, body)).is_err() {
                                    return;
                                }
                            }
                            Err(error) => warn!(%error, "bad pub/sub frame"),
                        },
                        _ => break,
                    }
                }
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
