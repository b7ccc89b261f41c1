//! Error taxonomy for the messaging pipelines
//!
//! Service faults keep their numeric protocol code: 404, 409 and 410
//! have structural meaning for the outgoing pipeline, everything else
//! is opaque. Outgoing faults are never thrown out of the pipeline;
//! they end up journaled and emitted as error events.

use serde_json::Value;
use thiserror::Error;

use librelay_core::envelope::CodecError;
use librelay_core::padding::PaddingError;
use librelay_core::storage::StorageError;
use librelay_core::types::{Address, Timestamp};
use librelay_crypto::CryptoError;

use crate::queue::QueueClosed;

/// Status code for a mismatched-devices response
pub const MISMATCHED_DEVICES: u16 = 409;
/// Status code for a stale-devices response
pub const STALE_DEVICES: u16 = 410;
/// Status code for an unregistered address
pub const NOT_FOUND: u16 = 404;

/// Failure talking to the message service
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service answered with an error status. `response` carries
    /// the parsed JSON body when one was present.
    #[error("service rejected request with status {code}")]
    Protocol { code: u16, response: Option<Value> },

    /// The request never produced a response
    #[error("network failure talking to the message service: {0}")]
    Network(String),

    /// The response could not be interpreted
    #[error("malformed service response: {0}")]
    BadResponse(String),

    /// Local failure while preparing the request
    #[error("local service-client failure: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Protocol status code, if this is a protocol error
    pub fn code(&self) -> Option<u16> {
        match self {
            ServiceError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Terminal outcome journaled for one address by the outgoing pipeline
#[derive(Debug, Error)]
pub enum SendError {
    /// 404 from transmit or from primary-device key fetch
    #[error("{addr} is not a registered user")]
    UnregisteredUser { addr: Address },

    /// Transmit was rejected or never reached the service
    #[error("message transmit to {addr} failed")]
    SendMessage {
        addr: Address,
        timestamp: Timestamp,
        #[source]
        cause: ServiceError,
    },

    /// Key fetch failed
    #[error("key fetch for {addr} failed")]
    KeyFetch {
        addr: Address,
        timestamp: Timestamp,
        #[source]
        cause: ServiceError,
    },

    /// Per-device encryption failed
    #[error("failed to create message for {addr}")]
    Encrypt {
        addr: Address,
        timestamp: Timestamp,
        #[source]
        cause: CryptoError,
    },

    /// A session primitive failed outside of encryption proper
    #[error("session operation for {addr} failed")]
    Session {
        addr: Address,
        timestamp: Timestamp,
        #[source]
        cause: CryptoError,
    },

    /// The remote identity key changed and was not accepted
    #[error("identity key for {addr} changed")]
    OutgoingIdentityKey {
        addr: Address,
        timestamp: Timestamp,
        identity_key: Vec<u8>,
    },

    /// A second drift response arrived on the retry attempt
    #[error("hit retry limit attempting to reload the device list for {addr}")]
    RetryLimit { addr: Address, timestamp: Timestamp },

    /// Store access failed mid-send
    #[error("storage failure during send")]
    Storage(#[from] StorageError),
}

impl SendError {
    /// The address this outcome was journaled for
    pub fn addr(&self) -> Option<&Address> {
        match self {
            SendError::UnregisteredUser { addr }
            | SendError::SendMessage { addr, .. }
            | SendError::KeyFetch { addr, .. }
            | SendError::Encrypt { addr, .. }
            | SendError::Session { addr, .. }
            | SendError::OutgoingIdentityKey { addr, .. }
            | SendError::RetryLimit { addr, .. } => Some(addr),
            SendError::Storage(_) => None,
        }
    }
}

/// Fault inside the incoming pipeline
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// Envelope or content decode failed
    #[error("envelope decode failed")]
    Codec(#[from] CodecError),

    /// Session primitive fault; drives the recovery table
    #[error("session primitive fault")]
    Crypto(#[from] CryptoError),

    /// Padding violation in a decrypted body
    #[error("padding violation")]
    Padding(#[from] PaddingError),

    /// Store access failed
    #[error("storage failure during receive")]
    Storage(#[from] StorageError),

    /// Service access failed
    #[error("service failure during receive")]
    Service(#[from] ServiceError),

    /// The serialization queue shut down
    #[error("envelope queue closed")]
    Queue(#[from] QueueClosed),

    /// Envelope carries neither content nor a legacy message
    #[error("envelope has neither content nor legacy message")]
    EmptyEnvelope,

    /// Content carries neither a data message nor a sync message
    #[error("content has neither data message nor sync message")]
    EmptyContent,

    /// Sync transcript with nothing in it
    #[error("empty sync message")]
    EmptySync,

    /// Ciphertext envelope with a type the cipher cannot handle
    #[error("unsupported ciphertext envelope type {0}")]
    UnsupportedEnvelopeType(i32),

    /// Sync message from an address other than our own
    #[error("sync message from foreign address {0}")]
    ForeignSync(Address),

    /// Sync message claiming to come from this very device
    #[error("sync message from our own device")]
    SelfSync,

    /// Blocked-contacts sync is deliberately unimplemented
    #[error("blocked-contacts sync is unsupported")]
    UnsupportedSync,

    /// Deprecated sync payload
    #[error("deprecated {0} sync message")]
    DeprecatedSync(&'static str),

    /// The remote identity key changed and no listener accepted it
    #[error("identity key for {addr} changed and was not accepted")]
    UntrustedIdentity { addr: Address, identity_key: Vec<u8> },

    /// The receiver is closing or closed
    #[error("receiver is closed")]
    Closed,

    /// Streaming transport fault
    #[error("transport failure: {0}")]
    Transport(String),
}
