//! Application ports (hexagonal architecture boundaries)
//!
//! - `outbound`: the roaming-protocol client the adapter submits to
//! - `inbound`: the charge point directory the adapter reads from

pub mod inbound;
pub mod outbound;

pub use inbound::ChargePointDirectory;
pub use outbound::{
    ResultCode, RoamingAuthorisation, RoamingClient, TransportError, UpstreamResponse,
};
