//! Authorization identifiers
//!
//! Tokens presented by drivers and the e-mobility contracts they resolve to.

pub mod model;

pub use model::{CachedAuthorization, ContractId, TokenId};
