//! The demo front-end world used by the end-to-end suite: an echoing,
//! channel-subscribing, location-hopping root object.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use weft::config::Config;
use weft::dispatch::{
    Access, DispatchError, HandlerKind, Lookup, Loopback, Next, Node, Path, Proxy, Sign,
};
use weft::domain::{ChannelName, ConnectionId, Ident, Uid};
use weft::envelope::{Envelope, Kwargs};
use weft::frontend::{ConnectionRegistry, FrontendRoot, LocationLinks};
use weft::kwargs;
use weft::net::{PushEndpoint, encode_parts};

pub fn app_error(message: impl Into<String>) -> DispatchError {
    DispatchError::handler(std::io::Error::other(message.into()))
}

pub fn str_arg<'a>(kwargs: &'a Kwargs, name: &str) -> Result<&'a str, DispatchError> {
    kwargs
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| app_error(format!("missing kwarg '{name}'")))
}

pub fn uid_arg(kwargs: &Kwargs, name: &str) -> Result<Uid, DispatchError> {
    kwargs
        .get(name)
        .and_then(Uid::from_value)
        .ok_or_else(|| app_error(format!("missing kwarg '{name}'")))
}

pub fn conn_arg(kwargs: &Kwargs) -> Result<ConnectionId, DispatchError> {
    kwargs
        .get("conn")
        .and_then(Value::as_u64)
        .map(ConnectionId::new)
        .ok_or_else(|| app_error("missing kwarg 'conn'"))
}

struct User {
    username: String,
    uid: Uid,
    location: Option<Ident>,
    conn: ConnectionId,
}

impl User {
    fn describe(&self) -> Value {
        serde_json::json!({"username": self.username, "uid": self.uid})
    }
}

/// The front-end root: sign-in, echo, direct sends, channels and the
/// location router with its forwarding proxy.
pub struct World {
    config: Arc<Config>,
    registry: Arc<ConnectionRegistry>,
    links: Arc<LocationLinks>,
    loopback: Loopback,
    users: Mutex<HashMap<Uid, User>>,
    locations: Mutex<BTreeMap<String, Kwargs>>,
}

impl World {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ConnectionRegistry>,
        links: Arc<LocationLinks>,
    ) -> Self {
        Self {
            config,
            registry,
            links,
            loopback: Loopback::new(),
            users: Mutex::new(HashMap::new()),
            locations: Mutex::new(BTreeMap::new()),
        }
    }

    fn sign_id(&self, kwargs: &Kwargs) -> Result<(), DispatchError> {
        let username = str_arg(kwargs, "username")?.to_owned();
        let conn = conn_arg(kwargs)?;
        let uid = derive_uid(&username)?;

        self.registry.bind_uid(conn, uid.clone())?;
        self.users.lock().unwrap().insert(
            uid.clone(),
            User {
                username,
                uid: uid.clone(),
                location: None,
                conn,
            },
        );

        let location = kwargs
            .get("loc")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| self.config.user.start_locations.first().cloned())
            .ok_or_else(|| app_error("no start location configured"))?;

        self.registry
            .send_to(conn, Envelope::new("sign_id", kwargs!(uid = uid)));
        // Entering the location needs internal authority; defer it until
        // this frame unwinds.
        self.loopback
            .send("location.enter", kwargs!(uid = uid, location = location));
        Ok(())
    }

    fn send_to_user(&self, kwargs: &Kwargs) -> Result<(), DispatchError> {
        let text = str_arg(kwargs, "text")?;
        let receiver = uid_arg(kwargs, "receiver")?;
        let sender = uid_arg(kwargs, "uid")?;
        self.registry.send_by_uid(
            &receiver,
            Envelope::new("message_from_user", kwargs!(text = text, uid = sender)),
        );
        Ok(())
    }

    fn get_locations(&self, kwargs: &Kwargs) -> Result<(), DispatchError> {
        let conn = conn_arg(kwargs)?;
        let data: Vec<Value> = self
            .locations
            .lock()
            .unwrap()
            .values()
            .cloned()
            .map(Value::Object)
            .collect();
        self.registry
            .send_to(conn, Envelope::new("locations", kwargs!(data = data)));
        Ok(())
    }

    fn user_location(&self, uid: &Uid) -> Result<Ident, DispatchError> {
        self.users
            .lock()
            .unwrap()
            .get(uid)
            .and_then(|user| user.location.clone())
            .ok_or_else(|| app_error("user is not in a location"))
    }
}

fn derive_uid(username: &str) -> Result<Uid, DispatchError> {
    username
        .chars()
        .last()
        .and_then(|c| c.to_digit(10))
        .map(|digit| Uid::Int(i64::from(digit)))
        .ok_or_else(|| app_error("username must end in a digit"))
}

#[async_trait]
impl Node for World {
    fn node_name(&self) -> &'static str {
        "root"
    }

    fn lookup(&self, name: &str) -> Lookup {
        match name {
            "echo" | "sign_id" | "get_locations" => {
                Lookup::Handler(HandlerKind::Receiver, Access::Open)
            }
            "send_to_user" => Lookup::Handler(HandlerKind::Receiver, Access::User),
            "channels" => Lookup::Handler(HandlerKind::Router, Access::Open),
            "location" => Lookup::Handler(HandlerKind::Router, Access::UserOrInternal),
            _ => Lookup::Unknown,
        }
    }

    async fn receive(&self, name: &str, kwargs: Kwargs) -> Result<(), DispatchError> {
        match name {
            "echo" => {
                let text = str_arg(&kwargs, "text")?;
                let conn = conn_arg(&kwargs)?;
                self.registry.send_to(
                    conn,
                    Envelope::new("echo", kwargs!(text = format!("Echo: {text}"))),
                );
                Ok(())
            }
            "sign_id" => self.sign_id(&kwargs),
            "send_to_user" => self.send_to_user(&kwargs),
            "get_locations" => self.get_locations(&kwargs),
            _ => unreachable!(),
        }
    }

    async fn route(&self, name: &str, next: Next<'_>, kwargs: Kwargs) -> Result<(), DispatchError> {
        match name {
            "channels" => {
                let channels = Channels {
                    registry: Arc::clone(&self.registry),
                };
                next.step(&channels, kwargs).await
            }
            "location" => {
                let uid = uid_arg(&kwargs, "uid")?;
                // A client is routed to its own location; internal
                // dispatches may address any location explicitly.
                let location = if next.sign() == Sign::Internal {
                    match kwargs.get("location").and_then(Value::as_str) {
                        Some(name) => Ident::try_new(name.to_owned())
                            .map_err(|_| app_error("empty location name"))?,
                        None => self.user_location(&uid)?,
                    }
                } else {
                    self.user_location(&uid)?
                };
                let push = self.links.get(&location).map(|link| link.push.clone());
                let view = LocationView {
                    world: self,
                    location,
                    uid,
                    push,
                };
                next.step(&view, kwargs).await
            }
            _ => unreachable!(),
        }
    }
}

#[async_trait]
impl FrontendRoot for World {
    fn loopback(&self) -> &Loopback {
        &self.loopback
    }

    async fn location_added(&self, ident: &Ident, metadata: Kwargs) {
        self.locations
            .lock()
            .unwrap()
            .insert(ident.to_string(), metadata);
        self.registry.publish_to_all(&Envelope::new(
            "location_added",
            kwargs!(loc_id = ident.to_string()),
        ));
    }

    async fn location_removed(&self, ident: &Ident) {
        self.locations.lock().unwrap().remove(&ident.to_string());
        self.registry.publish_to_all(&Envelope::new(
            "location_removed",
            kwargs!(loc_id = ident.to_string()),
        ));
    }
}

/// Channel operations, reached through the `channels` router.
struct Channels {
    registry: Arc<ConnectionRegistry>,
}

#[async_trait]
impl Node for Channels {
    fn node_name(&self) -> &'static str {
        "channels"
    }

    fn lookup(&self, name: &str) -> Lookup {
        match name {
            "subscribe" | "publish" | "unsubscribe" => {
                Lookup::Handler(HandlerKind::Receiver, Access::Open)
            }
            _ => Lookup::Unknown,
        }
    }

    async fn receive(&self, name: &str, kwargs: Kwargs) -> Result<(), DispatchError> {
        let channel_name = str_arg(&kwargs, "channel")?;
        let channel = ChannelName::try_new(channel_name.to_owned())
            .map_err(|_| app_error("empty channel name"))?;
        match name {
            "subscribe" => {
                let conn = conn_arg(&kwargs)?;
                self.registry.subscribe_channel(conn, channel)?;
            }
            "publish" => {
                let text = str_arg(&kwargs, "text")?;
                self.registry.publish_to_channel(
                    &channel,
                    &Envelope::new(
                        "message_from_channel",
                        kwargs!(text = text, channel = channel_name),
                    ),
                    false,
                );
            }
            "unsubscribe" => {
                let conn = conn_arg(&kwargs)?;
                self.registry.unsubscribe_channel(conn, &channel);
            }
            _ => unreachable!(),
        }
        Ok(())
    }
}

/// A per-dispatch view of one location: `enter` is handled on the
/// front-end, everything else is proxied into the location process (for
/// user dispatches) or out to the client (for internal ones).
struct LocationView<'a> {
    world: &'a World,
    location: Ident,
    uid: Uid,
    push: Option<PushEndpoint>,
}

impl LocationView<'_> {
    fn send_to_location(&self, mut envelope: Envelope, sign: Sign) {
        let Some(push) = &self.push else { return };
        match serde_json::to_value(&self.uid) {
            Ok(value) => {
                envelope.kwargs.insert("uid".to_owned(), value);
            }
            Err(_) => return,
        }
        envelope.sign = Some(sign);
        let frame = envelope
            .to_bytes()
            .ok()
            .and_then(|body| encode_parts(&[&body]).ok());
        if let Some(frame) = frame {
            push.send(frame);
        }
    }
}

#[async_trait]
impl Node for LocationView<'_> {
    fn node_name(&self) -> &'static str {
        "location"
    }

    fn lookup(&self, name: &str) -> Lookup {
        match name {
            "enter" => Lookup::Handler(HandlerKind::Receiver, Access::Internal),
            _ => Lookup::Unknown,
        }
    }

    async fn receive(&self, name: &str, _kwargs: Kwargs) -> Result<(), DispatchError> {
        debug_assert_eq!(name, "enter");
        if self.push.is_none() {
            // The location is not live; entering is a silent no-op, the
            // user stays where it was.
            return Ok(());
        }
        let user_value = {
            let mut users = self.world.users.lock().unwrap();
            let user = users
                .get_mut(&self.uid)
                .ok_or_else(|| app_error("unknown user"))?;
            if let Some(previous) = user.location.clone() {
                if previous != self.location {
                    self.world
                        .registry
                        .detach_from_location(&self.uid, &previous)?;
                }
            }
            user.location = Some(self.location.clone());
            user.describe()
        };
        self.world
            .registry
            .attach_to_location(&self.uid, &self.location)?;
        self.send_to_location(
            Envelope::new("enter", kwargs!(user = user_value)),
            Sign::Internal,
        );
        Ok(())
    }

    fn proxy(&self) -> Option<&dyn Proxy> {
        Some(self)
    }
}

#[async_trait]
impl Proxy for LocationView<'_> {
    async fn forward(
        &self,
        rest: Path,
        sign: Sign,
        mut kwargs: Kwargs,
    ) -> Result<(), DispatchError> {
        kwargs.remove("uid");
        kwargs.remove("location");
        kwargs.remove("conn");
        match sign {
            // A user's unresolved location calls go into the location
            // process, carrying the user's authority.
            Sign::User => {
                self.send_to_location(Envelope::new(rest.to_string(), kwargs), Sign::User);
            }
            // Internal ones are location traffic for the user's client.
            Sign::Internal => {
                let mut envelope = Envelope::new(rest.to_string(), kwargs);
                envelope.prefix_path(&self.world.config.outer_server.client_location_handler_path);
                let conn = self
                    .world
                    .users
                    .lock()
                    .unwrap()
                    .get(&self.uid)
                    .map(|user| user.conn);
                if let Some(conn) = conn {
                    self.world.registry.send_to(conn, envelope);
                }
            }
            Sign::None => {}
        }
        Ok(())
    }
}
