//! Token and contract identifiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier read from a driver's access medium (RFID UID, app token, ...)
    TokenId
);

string_id!(
    /// E-mobility contract identifier, e.g. `DE*ABC*1234*5`
    ContractId
);

pub(crate) use string_id;

/// What the cache remembers about an authorized token.
///
/// Contains only fields that are also written to the authorization log,
/// so a replay reproduces it exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAuthorization {
    pub contract_id: ContractId,
    pub expiry: Option<DateTime<Utc>>,
    pub printed_number: Option<String>,
}

impl CachedAuthorization {
    pub fn new(contract_id: impl Into<ContractId>) -> Self {
        Self {
            contract_id: contract_id.into(),
            expiry: None,
            printed_number: None,
        }
    }
}
