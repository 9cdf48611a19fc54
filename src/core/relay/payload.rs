//! Signal payload wire format.
//!
//! Rows are written as a tagged envelope `{"kind": ..., "body": ...}`.
//! Older peers wrote the bare description or candidate object, so decoding
//! falls back to telling them apart by shape.

use crate::core::error::SignalingError;
use crate::core::transport::{IceCandidate, SdpKind, SessionDescription};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
        }
    }

    pub fn encode(&self) -> Result<Value, SignalingError> {
        serde_json::to_value(self).map_err(SignalingError::Encode)
    }

    pub fn decode(value: &Value) -> Result<Self, SignalingError> {
        let payload = if value.get("kind").is_some() {
            serde_json::from_value::<Self>(value.clone()).map_err(|source| {
                SignalingError::Malformed {
                    kind: "envelope",
                    source,
                }
            })?
        } else {
            Self::decode_legacy(value)?
        };
        payload.check_consistent()?;
        Ok(payload)
    }

    fn decode_legacy(value: &Value) -> Result<Self, SignalingError> {
        if value.get("candidate").is_some() {
            return serde_json::from_value(value.clone())
                .map(Self::IceCandidate)
                .map_err(|source| SignalingError::Malformed {
                    kind: "ice-candidate",
                    source,
                });
        }
        let description = |kind: &'static str| {
            serde_json::from_value::<SessionDescription>(value.clone())
                .map_err(|source| SignalingError::Malformed { kind, source })
        };
        match value.get("type").and_then(Value::as_str) {
            Some("answer") => description("answer").map(Self::Answer),
            Some("offer") => description("offer").map(Self::Offer),
            _ => Err(SignalingError::Unrecognized),
        }
    }

    fn check_consistent(&self) -> Result<(), SignalingError> {
        let (envelope, body) = match self {
            Self::Offer(d) if d.kind != SdpKind::Offer => ("offer", d.kind),
            Self::Answer(d) if d.kind != SdpKind::Answer => ("answer", d.kind),
            _ => return Ok(()),
        };
        Err(SignalingError::KindMismatch {
            envelope,
            body: body.as_str(),
        })
    }
}
