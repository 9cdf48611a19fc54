pub mod config;
pub mod error;
pub mod negotiation;
pub mod pairing;
pub mod relay;
pub mod session;
pub mod transfer;
pub mod transport;

pub use error::FailureReason;
