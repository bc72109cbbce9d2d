//! # Texnouz Roaming Adapter
//!
//! Synchronization core between the operator's charge point network and a
//! batched roaming/clearinghouse service.
//!
//! ## Architecture
//!
//! The crate follows Clean Architecture principles:
//!
//! - **domain**: Charge points, statuses, CDRs, tokens and push outcomes
//! - **application**: Queues, flush timers, schedulers, CDR pipeline and the
//!   authorization cache, wired together by [`RoamingAdapter`]
//! - **notifications**: Event bus carrying per-item results to the host
//! - **shared**: Error types and the clock abstraction
//!
//! The wire protocol is not part of this crate: hosts plug in a
//! [`RoamingClient`](application::ports::RoamingClient) implementation.

pub mod application;
pub mod config;
pub mod domain;
pub mod notifications;
pub mod shared;
pub mod telemetry;

pub use application::{CdrMode, RoamingAdapter, RoamingAdapterBuilder};
pub use config::{default_config_path, AppConfig};
pub use notifications::{create_event_bus, Event, EventBus, SharedEventBus};
pub use shared::{AdapterError, AdapterResult};
