//! The demo location world: a room that greets entering users and hands
//! them over to other locations on request.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use weft::dispatch::{Access, DispatchError, HandlerKind, Lookup, Node};
use weft::domain::Uid;
use weft::envelope::{Envelope, Kwargs};
use weft::kwargs;
use weft::locations::Gateway;

use super::world::{app_error, str_arg, uid_arg};

/// Root object of one location process.
pub struct LocationWorld {
    gateway: Arc<Gateway>,
    users: Mutex<BTreeMap<Uid, Value>>,
}

impl LocationWorld {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            users: Mutex::new(BTreeMap::new()),
        }
    }

    fn enter(&self, kwargs: &Kwargs) -> Result<(), DispatchError> {
        let user = kwargs
            .get("user")
            .cloned()
            .ok_or_else(|| app_error("missing kwarg 'user'"))?;
        let uid = uid_arg(kwargs, "uid")?;

        let users: Vec<Value> = {
            let mut table = self.users.lock().unwrap();
            table.insert(uid.clone(), user.clone());
            table.values().cloned().collect()
        };
        self.gateway.publish_private(
            &uid,
            &Envelope::new(
                "init",
                kwargs!(users = users, ident = self.gateway.ident().to_string()),
            ),
        );
        self.gateway
            .publish_public(&Envelope::new("user_connected", kwargs!(user = user)));
        Ok(())
    }

    fn move_to(&self, kwargs: &Kwargs) -> Result<(), DispatchError> {
        let uid = uid_arg(kwargs, "uid")?;
        let target = str_arg(kwargs, "target_location")?;

        self.users.lock().unwrap().remove(&uid);
        self.gateway
            .publish_private(&uid, &Envelope::new("enter", kwargs!(location = target)));
        self.gateway
            .publish_public(&Envelope::new("user_disconnected", kwargs!(uid = uid)));
        Ok(())
    }
}

#[async_trait]
impl Node for LocationWorld {
    fn node_name(&self) -> &'static str {
        "location_root"
    }

    fn lookup(&self, name: &str) -> Lookup {
        match name {
            "enter" => Lookup::Handler(HandlerKind::Receiver, Access::Internal),
            "move_to" => Lookup::Handler(HandlerKind::Receiver, Access::User),
            _ => Lookup::Unknown,
        }
    }

    async fn receive(&self, name: &str, kwargs: Kwargs) -> Result<(), DispatchError> {
        match name {
            "enter" => self.enter(&kwargs),
            "move_to" => self.move_to(&kwargs),
            _ => unreachable!(),
        }
    }
}
