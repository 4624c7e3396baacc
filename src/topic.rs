//! The cluster topic grammar.
//!
//! Topics are the only routing vocabulary on the broker and the location
//! pub/sub surfaces: `"<prefix><identifier>"` ASCII strings. Everything a
//! front-end subscribes to is derived from its connection registry state,
//! so the grammar is kept closed - an unknown prefix is a parse error, not
//! an extension point.

use std::fmt;

use thiserror::Error;

use crate::domain::{ChannelName, Ident, Uid};

const SEND_BY_UID: &str = "send_by_uid:";
const PUBLISH_TO_CHANNEL: &str = "publish_to_channel:";
const LOCATION_ADDED: &str = "location_added:";
const LOCATION_DISCONNECTED: &str = "location_disconnected:";
const PUBLIC_FROM_LOCATION: &str = "public_message_from_location:";
const PRIVATE_FROM_LOCATION: &str = "private_message_from_location:";

/// A parse failure for a cluster topic string.
#[derive(Debug, Error)]
pub enum TopicError {
    /// The topic does not start with a known prefix.
    #[error("unknown topic prefix: {topic}")]
    UnknownPrefix {
        /// The offending topic string.
        topic: String,
    },
    /// The identifier part is missing or malformed.
    #[error("malformed topic: {topic}")]
    Malformed {
        /// The offending topic string.
        topic: String,
    },
}

/// A parsed cluster topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Direct message for the holder of a uid.
    SendByUid(Uid),
    /// Fan-out to every subscriber of a channel.
    PublishToChannel(ChannelName),
    /// Registry announcement: a location went LIVE.
    LocationAdded(Ident),
    /// Registry announcement: a location went DEAD.
    LocationDisconnected(Ident),
    /// Broadcast from a location to every user attached to it.
    PublicFromLocation(Ident),
    /// Message from a location to one attached user.
    PrivateFromLocation(Ident, Uid),
}

impl Topic {
    /// Parses a topic string; the inverse of [`Display`](fmt::Display).
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let malformed = || TopicError::Malformed {
            topic: topic.to_owned(),
        };
        if let Some(rest) = topic.strip_prefix(SEND_BY_UID) {
            Ok(Self::SendByUid(Uid::parse(rest)))
        } else if let Some(rest) = topic.strip_prefix(PUBLISH_TO_CHANNEL) {
            let channel = ChannelName::try_new(rest.to_owned()).map_err(|_| malformed())?;
            Ok(Self::PublishToChannel(channel))
        } else if let Some(rest) = topic.strip_prefix(LOCATION_ADDED) {
            let ident = Ident::try_new(rest.to_owned()).map_err(|_| malformed())?;
            Ok(Self::LocationAdded(ident))
        } else if let Some(rest) = topic.strip_prefix(LOCATION_DISCONNECTED) {
            let ident = Ident::try_new(rest.to_owned()).map_err(|_| malformed())?;
            Ok(Self::LocationDisconnected(ident))
        } else if let Some(rest) = topic.strip_prefix(PUBLIC_FROM_LOCATION) {
            let ident = Ident::try_new(rest.to_owned()).map_err(|_| malformed())?;
            Ok(Self::PublicFromLocation(ident))
        } else if let Some(rest) = topic.strip_prefix(PRIVATE_FROM_LOCATION) {
            let (ident, uid) = rest.split_once(':').ok_or_else(malformed)?;
            let ident = Ident::try_new(ident.to_owned()).map_err(|_| malformed())?;
            Ok(Self::PrivateFromLocation(ident, Uid::parse(uid)))
        } else {
            Err(TopicError::UnknownPrefix {
                topic: topic.to_owned(),
            })
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SendByUid(uid) => write!(f, "{SEND_BY_UID}{uid}"),
            Self::PublishToChannel(channel) => write!(f, "{PUBLISH_TO_CHANNEL}{channel}"),
            Self::LocationAdded(ident) => write!(f, "{LOCATION_ADDED}{ident}"),
            Self::LocationDisconnected(ident) => write!(f, "{LOCATION_DISCONNECTED}{ident}"),
            Self::PublicFromLocation(ident) => write!(f, "{PUBLIC_FROM_LOCATION}{ident}"),
            Self::PrivateFromLocation(ident, uid) => {
                write!(f, "{PRIVATE_FROM_LOCATION}{ident}:{uid}")
            }
        }
    }
}
