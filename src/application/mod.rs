pub mod adapter;
pub mod authorization;
pub mod cdr;
pub mod filters;
pub mod ports;
pub mod queue;
pub mod sync;
pub mod upstream;

#[cfg(test)]
pub mod testing;

// Re-export key types for convenience
pub use adapter::{RoamingAdapter, RoamingAdapterBuilder};
pub use authorization::{AuthorizationCache, AuthorizationOutcome, AuthorizationResult};
pub use cdr::{CdrMode, CdrPipeline};
pub use filters::{CdrFilter, CdrFilterDecision, ChargePointFilter};
pub use ports::{
    ChargePointDirectory, ResultCode, RoamingAuthorisation, RoamingClient, TransportError,
    UpstreamResponse,
};
pub use queue::QueueDepth;
pub use sync::{FullSyncReport, StatusFlushReport, StatusRefreshReport};
pub use upstream::UpstreamFacade;
