//! Error types for LagSim
//!
//! None of these errors is fatal to a running simulation: malformed PDUs are
//! discarded, configuration conflicts degrade to discard-wrong-conversation,
//! and resource starvation leaves ports unselected.

use thiserror::Error;

/// Result type alias for LagSim operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for LagSim
#[derive(Error, Debug)]
pub enum Error {
    /// PDU with an unknown subtype, bad TLV type or inconsistent length
    #[error("Malformed PDU: {0}")]
    MalformedPdu(String),

    /// Packet construction error
    #[error("Packet construction error: {0}")]
    PacketConstruction(String),

    /// Conflicting administrative values (duplicate link number, unknown
    /// link in a conversation list, digest mismatch)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No compatible aggregator (or other pool entity) available
    #[error("Unavailable resource: {0}")]
    UnavailableResource(String),

    /// DRCP peer reports a conflicting view of shared state
    #[error("Peer inconsistent: {0}")]
    PeerInconsistent(String),

    /// Frame lost to a link going down mid-exchange
    #[error("Transient drop: {0}")]
    TransientDrop(String),
}

impl Error {
    /// Create a malformed-PDU error with a custom message
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Error::MalformedPdu(msg.into())
    }

    /// Create an invalid-configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Create an unavailable-resource error with a custom message
    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        Error::UnavailableResource(msg.into())
    }
}
