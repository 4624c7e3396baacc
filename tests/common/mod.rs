//! In-process cluster harness for the end-to-end suite: one broker, one
//! location registry, any number of front-ends (running the demo world)
//! and location processes (running the demo location world), all on
//! ephemeral ports.

#![allow(dead_code)]

pub mod location_world;
pub mod world;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use weft::broker::{BrokerClient, BrokerDevice};
use weft::codec::{CodecError, FrameCodec};
use weft::config::{
    Config, LocationConfig, LocationManagerConfig, MessageBrokerConfig, OuterServerConfig,
    UserConfig,
};
use weft::domain::Ident;
use weft::envelope::{Envelope, Kwargs};
use weft::frontend::{ConnectionRegistry, FrontendServer, LocationLinks, MessageManager};
use weft::locations::{Gateway, GatewayError, LocationRegistry};
use weft::net::SubEndpoint;

use self::location_world::LocationWorld;
use self::world::World;

/// Settle time after starting a component, mirroring the cluster's
/// connection establishment latency.
const SETTLE: Duration = Duration::from_millis(300);
/// Timeout for every expected message.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Frontend {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    _manager: MessageManager,
    serve_task: JoinHandle<std::io::Result<()>>,
}

pub struct LocationProc {
    shutdown: CancellationToken,
    run_task: JoinHandle<()>,
}

/// One complete in-process cluster.
pub struct Cluster {
    pub config: Arc<Config>,
    _broker: BrokerDevice,
    _registry: LocationRegistry,
    frontends: Vec<Frontend>,
    locations: HashMap<String, LocationProc>,
}

impl Cluster {
    /// Starts the broker and the location registry with fast liveness
    /// tuning (heartbeat 100ms, max silence 500ms).
    pub async fn start() -> Self {
        let broker = BrokerDevice::bind("127.0.0.1:0", "127.0.0.1:0")
            .await
            .expect("broker");
        let registry_config = LocationManagerConfig {
            rep_address: "127.0.0.1:0".to_owned(),
            pull_address: "127.0.0.1:0".to_owned(),
            pub_address: "127.0.0.1:0".to_owned(),
            heartbeats_checker_period: 0.05,
            max_heartbeat_silence: 0.5,
        };
        let registry = LocationRegistry::bind(&registry_config)
            .await
            .expect("location registry");

        let config = Arc::new(Config {
            location_manager: LocationManagerConfig {
                rep_address: registry.rep_address().to_string(),
                pull_address: registry.pull_address().to_string(),
                pub_address: registry.pub_address().to_string(),
                ..registry_config
            },
            message_broker: MessageBrokerConfig {
                sub_address: broker.sub_address().to_string(),
                pub_address: broker.pub_address().to_string(),
            },
            location: LocationConfig {
                heartbeat_period: 0.1,
            },
            outer_server: OuterServerConfig {
                location_handler_path: "location".to_owned(),
                client_location_handler_path: "location".to_owned(),
            },
            user: UserConfig {
                start_locations: vec!["loc_1".to_owned()],
            },
        });

        Self {
            config,
            _broker: broker,
            _registry: registry,
            frontends: Vec::new(),
            locations: HashMap::new(),
        }
    }

    /// Starts a front-end running the demo world; returns its client
    /// address.
    pub async fn start_frontend(&mut self, max_conn: usize) -> SocketAddr {
        let (broker_client, broker_rx) = BrokerClient::connect(&self.config.message_broker);
        let broker_client = Arc::new(broker_client);
        let (locations_sub, locations_rx) = SubEndpoint::new();

        let registry = Arc::new(ConnectionRegistry::new(
            broker_client.clone(),
            broker_client.clone(),
            Arc::new(locations_sub.clone()),
        ));
        let links: Arc<LocationLinks> = Arc::new(LocationLinks::new());
        let root = Arc::new(World::new(
            Arc::clone(&self.config),
            Arc::clone(&registry),
            Arc::clone(&links),
        ));

        let manager = MessageManager::start(
            Arc::clone(&self.config),
            Arc::clone(&registry),
            Arc::clone(&root),
            links,
            locations_sub,
            broker_rx,
            locations_rx,
        )
        .await
        .expect("message manager");

        let server = FrontendServer::bind("127.0.0.1:0").await.expect("front-end");
        let addr = server.local_addr();
        let shutdown = CancellationToken::new();
        let serve_task = tokio::spawn(server.serve(registry, root, Some(max_conn), shutdown.clone()));

        self.frontends.push(Frontend {
            addr,
            shutdown,
            _manager: manager,
            serve_task,
        });
        tokio::time::sleep(SETTLE).await;
        addr
    }

    /// Starts a location process running the demo location world.
    pub async fn start_location(&mut self, ident: &str) {
        self.try_start_location(ident).await.expect("location");
    }

    /// Starts a location process, surfacing registration refusals.
    pub async fn try_start_location(&mut self, ident: &str) -> Result<(), GatewayError> {
        let gateway = Arc::new(
            Gateway::connect(
                &self.config,
                Ident::try_new(ident.to_owned()).expect("ident"),
                "127.0.0.1:0",
                "127.0.0.1:0",
                Kwargs::new(),
            )
            .await?,
        );
        let root = Arc::new(LocationWorld::new(Arc::clone(&gateway)));
        let shutdown = CancellationToken::new();
        let run_task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { gateway.run(root.as_ref(), shutdown).await }
        });
        self.locations
            .insert(ident.to_owned(), LocationProc { shutdown, run_task });
        tokio::time::sleep(SETTLE).await;
        Ok(())
    }

    /// Shuts a location down cleanly: it notifies the registry before
    /// exiting.
    pub async fn stop_location(&mut self, ident: &str) {
        let proc = self.locations.remove(ident).expect("unknown location");
        proc.shutdown.cancel();
        let _ = proc.run_task.await;
    }

    /// Kills a location without any notification; only heartbeat silence
    /// reveals its death.
    pub fn kill_location(&mut self, ident: &str) {
        let proc = self.locations.remove(ident).expect("unknown location");
        proc.run_task.abort();
    }

    /// Connects a test client to the `index`-th front-end.
    pub async fn client(&self, index: usize) -> TestClient {
        TestClient::connect(self.frontends[index].addr).await
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for frontend in &self.frontends {
            frontend.shutdown.cancel();
            frontend.serve_task.abort();
        }
        for location in self.locations.values() {
            location.run_task.abort();
        }
    }
}

/// A buffering test client over the client wire protocol.
pub struct TestClient {
    framed: Framed<TcpStream, FrameCodec>,
    buffer: Vec<Envelope>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
            buffer: Vec::new(),
        }
    }

    /// Sends an envelope, panicking on transport failure.
    pub async fn send(&mut self, path: &str, kwargs: Kwargs) {
        self.try_send(path, kwargs).await.expect("send");
    }

    /// Sends an envelope, surfacing transport failure (closed stream).
    pub async fn try_send(&mut self, path: &str, kwargs: Kwargs) -> Result<(), CodecError> {
        let body = Envelope::new(path, kwargs).to_bytes().expect("encode");
        self.framed.send(Bytes::from(body)).await
    }

    /// Receives the next envelope whose path starts with `path_prefix`,
    /// buffering everything else. Panics after five seconds.
    pub async fn recv(&mut self, path_prefix: &str) -> Envelope {
        self.recv_where(path_prefix, &[]).await
    }

    /// Like [`recv`](Self::recv), also requiring kwargs entries.
    pub async fn recv_where(
        &mut self,
        path_prefix: &str,
        contains: &[(&str, serde_json::Value)],
    ) -> Envelope {
        let matches = |envelope: &Envelope| {
            envelope.path.starts_with(path_prefix)
                && contains
                    .iter()
                    .all(|(key, value)| envelope.kwargs.get(*key) == Some(value))
        };
        if let Some(position) = self.buffer.iter().position(|e| matches(e)) {
            return self.buffer.remove(position);
        }
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.framed.next())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for '{path_prefix}'"))
                .unwrap_or_else(|| panic!("stream closed waiting for '{path_prefix}'"))
                .expect("protocol error");
            let envelope = Envelope::from_bytes(&frame).expect("decode");
            if matches(&envelope) {
                return envelope;
            }
            self.buffer.push(envelope);
        }
    }

    /// Asserts that no envelope matching `path_prefix` is buffered or
    /// arrives within `window`.
    pub async fn expect_silence(&mut self, path_prefix: &str, window: Duration) {
        assert!(
            !self.buffer.iter().any(|e| e.path.starts_with(path_prefix)),
            "buffered envelope matches '{path_prefix}'"
        );
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Err(_) => return,
                Ok(None) => return,
                Ok(Some(frame)) => frame.expect("protocol error"),
            };
            let envelope = Envelope::from_bytes(&frame).expect("decode");
            assert!(
                !envelope.path.starts_with(path_prefix),
                "unexpected envelope: {envelope:?}"
            );
            self.buffer.push(envelope);
        }
    }

    /// Drops everything buffered so far.
    pub fn flush(&mut self) {
        self.buffer.clear();
    }
}
