//! Notifications module
//!
//! Results of every push, cycle summaries and background failures are
//! published on an [`EventBus`]; the operator's domain model subscribes to
//! learn the per-item outcome of operations that completed in the background.
//!
//! # Usage
//! ```ignore
//! let event_bus = create_event_bus();
//! let mut events = event_bus.subscribe();
//! while let Some(message) = events.recv().await {
//!     if let Event::PushCompleted(push) = message.event {
//!         // update charge point / session bookkeeping
//!     }
//! }
//! ```

pub mod event_bus;
pub mod events;

pub use event_bus::{create_event_bus, EventBus, EventSubscriber, SharedEventBus};
pub use events::*;
