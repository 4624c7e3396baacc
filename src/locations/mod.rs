//! Location processes and their cluster-wide directory.

pub mod gateway;
pub mod registry;

pub use gateway::{Gateway, GatewayError};
pub use registry::LocationRegistry;

/// Request command: register a location.
pub(crate) const CONNECT: &str = "connect";
/// Request command: snapshot the LIVE locations.
pub(crate) const GET_LOCATIONS_INFO: &str = "get_locations_info";
/// Ingress command: liveness signal.
pub(crate) const HEARTBEAT: &str = "heartbeat";
/// Ingress command: clean shutdown.
pub(crate) const DISCONNECT: &str = "disconnect";
