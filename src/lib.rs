//! peerbeam: direct peer-to-peer file exchange.
//!
//! Two devices find each other through a relay store, negotiate a WebRTC
//! peer connection over it, and then stream files across ordered data
//! channels with flow control.

pub mod core;
pub mod utils;
