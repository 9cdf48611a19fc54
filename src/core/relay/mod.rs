//! Relay store contract and the signaling adapter built on it.
//!
//! The relay is an external insert-and-subscribe store. Every operation the
//! core needs from it is on [`RelayStore`]; [`SignalingRelay`] layers the
//! send / subscribe / cleanup primitives of the negotiation machines on top.

pub mod memory;
mod payload;

pub use memory::MemoryRelayStore;
pub use payload::SignalPayload;

use crate::core::error::RelayError;
use crate::core::transfer::FileMetadata;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

// ── Rows ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A write-once signaling row. `payload` is kept raw so that rows written by
/// any peer version can be stored and relayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRow {
    pub from: UserId,
    pub to: UserId,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCode {
    pub code: String,
    pub owner: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCodeRedemption {
    pub code: String,
    pub redeemer: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSharingRequest {
    pub id: Uuid,
    pub from: UserId,
    pub to: UserId,
    pub files: Vec<FileMetadata>,
    pub created_at: DateTime<Utc>,
}

impl FileSharingRequest {
    pub fn new(from: UserId, to: UserId, files: Vec<FileMetadata>) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            files,
            created_at: Utc::now(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSharingRequestResponse {
    pub request_id: Uuid,
    pub accepted: bool,
}

/// A pairing between two users. The pair is unordered: both argument orders
/// of [`UserPairing::new`] produce the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserPairing {
    user_a: UserId,
    user_b: UserId,
}

impl UserPairing {
    pub fn new(one: UserId, other: UserId) -> Self {
        if one <= other {
            Self {
                user_a: one,
                user_b: other,
            }
        } else {
            Self {
                user_a: other,
                user_b: one,
            }
        }
    }

    pub fn contains(&self, user: &UserId) -> bool {
        &self.user_a == user || &self.user_b == user
    }

    /// The member of the pair that is not `user`.
    pub fn other(&self, user: &UserId) -> &UserId {
        if &self.user_a == user {
            &self.user_b
        } else {
            &self.user_a
        }
    }
}

// ── Subscriptions ────────────────────────────────────────────────────────────

/// Push stream of newly inserted rows. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Stops delivery. Calling it again is a no-op.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

// ── Store contract ───────────────────────────────────────────────────────────

#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn insert_signals(&self, rows: Vec<SignalRow>) -> Result<(), RelayError>;

    /// Deletes every signal row matching `{from, to}` and returns how many went.
    async fn delete_signals(&self, from: &UserId, to: &UserId) -> Result<usize, RelayError>;

    async fn subscribe_signals(
        &self,
        to: &UserId,
        from: Option<&UserId>,
    ) -> Result<Subscription<SignalRow>, RelayError>;

    /// Inserts `code`, deleting any code the same owner held before.
    async fn replace_pairing_code(&self, code: PairingCode) -> Result<(), RelayError>;

    async fn find_pairing_code(&self, code: &str) -> Result<Option<PairingCode>, RelayError>;

    async fn delete_pairing_code(&self, code: &str) -> Result<(), RelayError>;

    async fn insert_redemption(&self, redemption: PairingCodeRedemption) -> Result<(), RelayError>;

    async fn subscribe_redemptions(
        &self,
        code: &str,
    ) -> Result<Subscription<PairingCodeRedemption>, RelayError>;

    async fn insert_file_request(&self, request: FileSharingRequest) -> Result<(), RelayError>;

    async fn subscribe_file_requests(
        &self,
        to: &UserId,
        from: Option<&UserId>,
    ) -> Result<Subscription<FileSharingRequest>, RelayError>;

    async fn insert_file_response(
        &self,
        response: FileSharingRequestResponse,
    ) -> Result<(), RelayError>;

    async fn subscribe_file_responses(
        &self,
        request_id: Uuid,
    ) -> Result<Subscription<FileSharingRequestResponse>, RelayError>;

    /// Idempotent on the unordered pair.
    async fn upsert_pairing(&self, pairing: UserPairing) -> Result<(), RelayError>;

    async fn list_pairings(&self, user: &UserId) -> Result<Vec<UserPairing>, RelayError>;

    /// Returns whether a row was removed.
    async fn delete_pairing(&self, pairing: &UserPairing) -> Result<bool, RelayError>;
}

// ── Signaling adapter ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub from: UserId,
    pub payload: SignalPayload,
}

#[derive(Clone)]
pub struct SignalingRelay {
    store: Arc<dyn RelayStore>,
}

impl SignalingRelay {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RelayStore> {
        &self.store
    }

    pub async fn send(
        &self,
        from: &UserId,
        to: &UserId,
        payload: SignalPayload,
    ) -> Result<(), RelayError> {
        self.send_batch(from, to, vec![payload]).await
    }

    /// Appends all payloads in one insert, preserving their order.
    pub async fn send_batch(
        &self,
        from: &UserId,
        to: &UserId,
        payloads: Vec<SignalPayload>,
    ) -> Result<(), RelayError> {
        if payloads.is_empty() {
            return Ok(());
        }
        let rows = payloads
            .iter()
            .map(|payload| {
                Ok(SignalRow {
                    from: from.clone(),
                    to: to.clone(),
                    payload: payload.encode()?,
                })
            })
            .collect::<Result<Vec<_>, RelayError>>()?;
        debug!(event = "signal_send", %from, %to, count = rows.len());
        self.store.insert_signals(rows).await
    }

    pub async fn subscribe(
        &self,
        self_id: &UserId,
        peer: Option<&UserId>,
    ) -> Result<SignalSubscription, RelayError> {
        let inner = self.store.subscribe_signals(self_id, peer).await?;
        Ok(SignalSubscription {
            self_id: self_id.clone(),
            inner,
        })
    }

    /// Deletes every row sent by `peer_id` to `self_id`. Safe to repeat.
    pub async fn cleanup(&self, self_id: &UserId, peer_id: &UserId) -> Result<usize, RelayError> {
        let removed = self.store.delete_signals(peer_id, self_id).await?;
        debug!(event = "signal_cleanup", %self_id, %peer_id, removed);
        Ok(removed)
    }
}

/// Decoded signal stream addressed to one user.
#[derive(Debug)]
pub struct SignalSubscription {
    self_id: UserId,
    inner: Subscription<SignalRow>,
}

impl SignalSubscription {
    /// Next well-formed message for us. Malformed or misaddressed rows are
    /// logged and skipped.
    pub async fn next(&mut self) -> Option<SignalMessage> {
        loop {
            let row = self.inner.next().await?;
            if row.to != self.self_id {
                warn!(event = "signal_misaddressed", to = %row.to, "Dropping signal for another user");
                continue;
            }
            match SignalPayload::decode(&row.payload) {
                Ok(payload) => {
                    return Some(SignalMessage {
                        from: row.from,
                        payload,
                    });
                }
                Err(e) => {
                    warn!(event = "signal_dropped", from = %row.from, %e, "Dropping malformed signal");
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{IceCandidate, SessionDescription};
    use serde_json::json;

    fn relay() -> (Arc<MemoryRelayStore>, SignalingRelay) {
        let store = Arc::new(MemoryRelayStore::new());
        (store.clone(), SignalingRelay::new(store))
    }

    #[tokio::test]
    async fn subscriber_receives_only_rows_addressed_to_it() {
        let (_, relay) = relay();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let carol = UserId::from("carol");

        let mut bob_from_alice = relay.subscribe(&bob, Some(&alice)).await.unwrap();
        let mut bob_any = relay.subscribe(&bob, None).await.unwrap();

        relay
            .send(&alice, &carol, SignalPayload::Offer(SessionDescription::offer("x")))
            .await
            .unwrap();
        relay
            .send(&carol, &bob, SignalPayload::Offer(SessionDescription::offer("from-carol")))
            .await
            .unwrap();
        relay
            .send(&alice, &bob, SignalPayload::Offer(SessionDescription::offer("from-alice")))
            .await
            .unwrap();

        let msg = bob_from_alice.next().await.unwrap();
        assert_eq!(msg.from, alice);
        assert_eq!(
            msg.payload,
            SignalPayload::Offer(SessionDescription::offer("from-alice"))
        );

        assert_eq!(bob_any.next().await.unwrap().from, carol);
        assert_eq!(bob_any.next().await.unwrap().from, alice);
    }

    #[tokio::test]
    async fn malformed_rows_are_skipped_without_ending_the_stream() {
        let (store, relay) = relay();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let mut sub = relay.subscribe(&bob, Some(&alice)).await.unwrap();

        store
            .insert_signals(vec![
                SignalRow {
                    from: alice.clone(),
                    to: bob.clone(),
                    payload: json!({"nonsense": true}),
                },
                SignalRow {
                    from: alice.clone(),
                    to: bob.clone(),
                    payload: json!({"candidate": "candidate:legacy"}),
                },
            ])
            .await
            .unwrap();

        let msg = sub.next().await.unwrap();
        assert!(matches!(
            msg.payload,
            SignalPayload::IceCandidate(IceCandidate { ref candidate, .. }) if candidate == "candidate:legacy"
        ));
    }

    #[tokio::test]
    async fn cleanup_twice_leaves_no_rows() {
        let (store, relay) = relay();
        let a = UserId::from("a");
        let b = UserId::from("b");

        let candidates = (0..3)
            .map(|i| SignalPayload::IceCandidate(IceCandidate::new(format!("candidate:{i}"))))
            .collect();
        relay.send_batch(&b, &a, candidates).await.unwrap();
        relay
            .send(&a, &b, SignalPayload::Offer(SessionDescription::offer("keep")))
            .await
            .unwrap();

        assert_eq!(relay.cleanup(&a, &b).await.unwrap(), 3);
        assert_eq!(store.signal_count(&b, &a).await, 0);
        assert_eq!(relay.cleanup(&a, &b).await.unwrap(), 0);
        assert_eq!(store.signal_count(&b, &a).await, 0);
        // Rows in the other direction are untouched.
        assert_eq!(store.signal_count(&a, &b).await, 1);
    }

    #[tokio::test]
    async fn closing_a_subscription_twice_is_harmless() {
        let (_, relay) = relay();
        let mut sub = relay.subscribe(&UserId::from("a"), None).await.unwrap();
        sub.close();
        sub.close();
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn user_pairing_ignores_argument_order() {
        let ab = UserPairing::new("a".into(), "b".into());
        let ba = UserPairing::new("b".into(), "a".into());
        assert_eq!(ab, ba);
        assert_eq!(ab.other(&UserId::from("a")), &UserId::from("b"));
        assert!(ab.contains(&UserId::from("b")));
    }
}
