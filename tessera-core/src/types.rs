//! Identifiers and placement records
//!
//! Hosts, contracts and sector roots are all 32-byte values. They are kept
//! as distinct newtypes so a contract id can never be passed where a host
//! key is expected.

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create from raw bytes
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Convert to hex string (without prefix)
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from hex string, with or without the display prefix
            pub fn from_hex(s: &str) -> Result<Self> {
                let s = s.strip_prefix(concat!($prefix, ":")).unwrap_or(s);
                let bytes =
                    hex::decode(s).map_err(|e| TesseraError::InvalidIdentifier(e.to_string()))?;
                let arr: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
                    TesseraError::InvalidIdentifier(format!(
                        "Invalid length: expected 32, got {}",
                        b.len()
                    ))
                })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.to_hex())
            }
        }
    };
}

id_type!(
    /// Public key identifying a storage host
    HostKey,
    "ed25519"
);

id_type!(
    /// Identifier of a negotiated file contract
    ContractId,
    "fcid"
);

id_type!(
    /// Content-addressed root of a stored sector
    SectorRoot,
    "h"
);

impl SectorRoot {
    /// Compute the content root of sector data.
    ///
    /// Identical sector content always yields the same root, so uploading a
    /// shard twice is idempotent at the root level.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

/// Where one shard's ciphertext is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sector {
    pub host: HostKey,
    pub root: SectorRoot,
}

/// A negotiated contract usable as a placement candidate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractMetadata {
    pub id: ContractId,
    pub host_key: HostKey,
    pub host_addr: String,
}

impl ContractMetadata {
    pub fn new(id: ContractId, host_key: HostKey, host_addr: impl Into<String>) -> Self {
        Self {
            id,
            host_key,
            host_addr: host_addr.into(),
        }
    }
}
