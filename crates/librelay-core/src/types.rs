//! Core types used throughout librelay

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Device identifier under an address. Device 1 is the primary device.
pub type DeviceId = u32;

/// The device id assigned to an account's primary device.
pub const PRIMARY_DEVICE_ID: DeviceId = 1;

/// User address (UUID string), identifying a principal independent of
/// any specific device.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Create a new random address
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Pair with a device id
    pub fn with_device(&self, device_id: DeviceId) -> ProtocolAddress {
        ProtocolAddress {
            addr: self.clone(),
            device_id,
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Error produced when parsing an encoded `"<addr>.<deviceId>"` pair
#[derive(Debug, Error)]
#[error("malformed protocol address: {0}")]
pub struct AddressParseError(pub String);

/// An `(address, device)` pair, the unit of session state.
///
/// The encoded form `"<addr>.<deviceId>"` keys session records in the
/// store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolAddress {
    pub addr: Address,
    pub device_id: DeviceId,
}

impl ProtocolAddress {
    /// Create from address and device id
    pub fn new(addr: Address, device_id: DeviceId) -> Self {
        Self { addr, device_id }
    }

    /// Encode as the store key `"<addr>.<deviceId>"`
    pub fn encode(&self) -> String {
        format!("{}.{}", self.addr, self.device_id)
    }

    /// Whether this is the account's primary device
    pub fn is_primary(&self) -> bool {
        self.device_id == PRIMARY_DEVICE_ID
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.addr, self.device_id)
    }
}

impl FromStr for ProtocolAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, device) = s
            .rsplit_once('.')
            .ok_or_else(|| AddressParseError(s.to_string()))?;
        let device_id: DeviceId = device
            .parse()
            .map_err(|_| AddressParseError(s.to_string()))?;
        if addr.is_empty() || device_id == 0 {
            return Err(AddressParseError(s.to_string()));
        }
        Ok(Self {
            addr: Address::from(addr),
            device_id,
        })
    }
}

/// Timestamp in milliseconds since the Unix epoch.
///
/// For outgoing messages this is assigned by the sender at construction
/// and doubles as the logical message id in retransmit and receipt
/// flows.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis() as u64)
    }

    /// Create from milliseconds
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Get as milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Self(millis)
    }
}
