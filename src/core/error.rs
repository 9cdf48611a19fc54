//! Typed failures surfaced by the negotiation, pairing and transfer machines.

use thiserror::Error;

/// Terminal reason a negotiation, pairing attempt or transfer stopped.
///
/// Travels inside state values, so it is cheap to clone and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("peer connection did not connect in time after ICE gathering completed")]
    NegotiationTimeout,
    #[error("peer connection failed: {0}")]
    ConnectionFailure(String),
    #[error("connection interrupted before the transfer completed")]
    ConnectionInterrupted,
    #[error("pairing code or request has expired")]
    RequestExpired,
    #[error("pairing code not found")]
    NotFound,
    #[error("could not store received file: {0}")]
    Persistence(String),
    #[error("relay store error: {0}")]
    Relay(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("request declined by the remote user")]
    RequestDeclined,
    #[error("cancelled")]
    Cancelled,
}

impl FailureReason {
    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::ConnectionFailure(err.to_string())
    }
}

/// A relay payload that could not be understood. Logged and dropped.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("unrecognized signal payload shape")]
    Unrecognized,
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{envelope} envelope carries a {body} description")]
    KindMismatch {
        envelope: &'static str,
        body: &'static str,
    },
    #[error("failed to encode signal payload: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("relay store unavailable: {0}")]
    Unavailable(String),
    #[error("subscription closed")]
    SubscriptionClosed,
    #[error("could not encode row: {0}")]
    Encode(String),
}

impl From<SignalingError> for RelayError {
    fn from(err: SignalingError) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<RelayError> for FailureReason {
    fn from(err: RelayError) -> Self {
        Self::Relay(err.to_string())
    }
}

/// Local write destination could not accept the file.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("destination unavailable: {0}")]
    Unavailable(String),
    #[error("save cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<PersistenceError> for FailureReason {
    fn from(err: PersistenceError) -> Self {
        Self::Persistence(err.to_string())
    }
}
