//! The location registry: the cluster-wide directory of live locations.
//!
//! One core task owns the table; the request, ingress and sweeper inputs
//! are serialized onto it through channels, so the state machine itself
//! needs no locking. For every ident, `location_added` and
//! `location_disconnected` announcements alternate strictly.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CONNECT, DISCONNECT, GET_LOCATIONS_INFO, HEARTBEAT};
use crate::config::LocationManagerConfig;
use crate::domain::Ident;
use crate::net::{
    NetError, PubEndpoint, PullEndpoint, RepEndpoint, RepRequest, decode_parts, part_str,
};
use crate::topic::Topic;

struct LocationRecord {
    metadata: serde_json::Value,
    last_heartbeat: Instant,
}

/// The registry process behind `weft-registry`.
pub struct LocationRegistry {
    rep_address: SocketAddr,
    pull_address: SocketAddr,
    pub_address: SocketAddr,
    task: JoinHandle<()>,
}

impl LocationRegistry {
    /// Binds the three endpoints and starts the core task.
    pub async fn bind(config: &LocationManagerConfig) -> Result<Self, NetError> {
        let announcements = PubEndpoint::bind(&config.pub_address).await?;
        let (rep, rep_rx) = RepEndpoint::bind(&config.rep_address).await?;
        let (pull, pull_rx) = PullEndpoint::bind(&config.pull_address).await?;
        info!(
            rep = %rep.local_addr(),
            pull = %pull.local_addr(),
            announcements = %announcements.local_addr(),
            "location registry up"
        );

        let core = Core {
            locations: HashMap::new(),
            announcements,
            max_silence: config.max_silence(),
        };
        let rep_address = rep.local_addr();
        let pull_address = pull.local_addr();
        let pub_address = core.announcements.local_addr();
        let task = tokio::spawn(run(core, rep, pull, rep_rx, pull_rx, config.checker_period()));

        Ok(Self {
            rep_address,
            pull_address,
            pub_address,
            task,
        })
    }

    /// The bound request/reply address.
    pub fn rep_address(&self) -> SocketAddr {
        self.rep_address
    }

    /// The bound ingress address.
    pub fn pull_address(&self) -> SocketAddr {
        self.pull_address
    }

    /// The bound announcement address.
    pub fn pub_address(&self) -> SocketAddr {
        self.pub_address
    }
}

impl Drop for LocationRegistry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Core {
    locations: HashMap<String, LocationRecord>,
    announcements: PubEndpoint,
    max_silence: std::time::Duration,
}

async fn run(
    mut core: Core,
    _rep: RepEndpoint,
    _pull: PullEndpoint,
    mut rep_rx: mpsc::UnboundedReceiver<RepRequest>,
    mut pull_rx: mpsc::UnboundedReceiver<Bytes>,
    checker_period: std::time::Duration,
) {
    let mut sweeper = tokio::time::interval(checker_period);
    sweeper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            request = rep_rx.recv() => {
                let Some(request) = request else { return };
                core.handle_request(request);
            }
            frame = pull_rx.recv() => {
                let Some(frame) = frame else { return };
                core.handle_ingress(&frame);
            }
            _ = sweeper.tick() => core.check_heartbeats(),
        }
    }
}

impl Core {
    fn handle_request(&mut self, request: RepRequest) {
        let reply = match self.dispatch_request(&request.frame) {
            Ok(reply) => reply,
            Err(error) => {
                warn!(%error, "unanswerable registry request");
                return;
            }
        };
        let _ = request.reply.send(reply);
    }

    fn dispatch_request(&mut self, frame: &[u8]) -> Result<Bytes, NetError> {
        let parts = decode_parts(frame)?;
        match part_str(&parts, 0)? {
            CONNECT => {
                let ident = part_str(&parts, 1)?.to_owned();
                let raw_metadata = parts
                    .get(2)
                    .map(|part| Bytes::copy_from_slice(part))
                    .ok_or(NetError::Malformed("connect without metadata"))?;
                Ok(Bytes::from(rmp_serde::to_vec(&self.connect(ident, raw_metadata))?))
            }
            GET_LOCATIONS_INFO => {
                let snapshot: HashMap<&String, &serde_json::Value> = self
                    .locations
                    .iter()
                    .map(|(ident, record)| (ident, &record.metadata))
                    .collect();
                Ok(Bytes::from(rmp_serde::to_vec_named(&snapshot)?))
            }
            other => {
                warn!(request = other, "unknown registry request");
                Err(NetError::Malformed("unknown registry request"))
            }
        }
    }

    fn connect(&mut self, ident: String, raw_metadata: Bytes) -> bool {
        let Ok(topic_ident) = Ident::try_new(ident.clone()) else {
            warn!("rejecting connect with empty ident");
            return false;
        };
        if self.locations.contains_key(&ident) {
            warn!(%ident, "rejecting connect for live ident");
            return false;
        }
        // The registration body is forwarded verbatim in the announcement.
        let metadata = rmp_serde::from_slice(&raw_metadata).unwrap_or(serde_json::Value::Null);
        self.announcements
            .publish(&Topic::LocationAdded(topic_ident).to_string(), &raw_metadata);
        self.locations.insert(
            ident.clone(),
            LocationRecord {
                metadata,
                last_heartbeat: Instant::now(),
            },
        );
        info!(%ident, "location connected");
        true
    }

    fn handle_ingress(&mut self, frame: &[u8]) {
        let parts = match decode_parts(frame) {
            Ok(parts) => parts,
            Err(error) => {
                warn!(%error, "bad ingress frame");
                return;
            }
        };
        let (command, ident) = match (part_str(&parts, 0), part_str(&parts, 1)) {
            (Ok(command), Ok(ident)) => (command, ident.to_owned()),
            _ => {
                warn!("short ingress frame");
                return;
            }
        };
        match command {
            HEARTBEAT => match self.locations.get_mut(&ident) {
                Some(record) => {
                    debug!(%ident, "heartbeat");
                    record.last_heartbeat = Instant::now();
                }
                None => warn!(%ident, "heartbeat from unknown location"),
            },
            DISCONNECT => {
                if self.locations.contains_key(&ident) {
                    self.disconnect(&ident);
                } else {
                    warn!(%ident, "disconnect from unknown location");
                }
            }
            other => warn!(command = other, "unknown ingress command"),
        }
    }

    fn check_heartbeats(&mut self) {
        let now = Instant::now();
        let silent: Vec<String> = self
            .locations
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_heartbeat) >= self.max_silence)
            .map(|(ident, _)| ident.clone())
            .collect();
        for ident in silent {
            warn!(%ident, "heartbeat silence, declaring location dead");
            self.disconnect(&ident);
        }
    }

    fn disconnect(&mut self, ident: &str) {
        self.locations.remove(ident);
        if let Ok(topic_ident) = Ident::try_new(ident.to_owned()) {
            let body = rmp_serde::to_vec(&()).unwrap_or_default();
            self.announcements.publish(
                &Topic::LocationDisconnected(topic_ident).to_string(),
                &body,
            );
        }
        info!(%ident, "location disconnected");
    }
}
