//! In-process relay store.
//!
//! Backs the local demo and the tests. Subscribers get rows pushed in insert
//! order; subscribers that went away are pruned on the next insert.

use super::{
    FileSharingRequest, FileSharingRequestResponse, PairingCode, PairingCodeRedemption,
    RelayStore, SignalRow, Subscription, UserId, UserPairing,
};
use crate::core::error::RelayError;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use uuid::Uuid;

struct Subscriber<K, T> {
    key: K,
    tx: mpsc::UnboundedSender<T>,
}

/// Push `row` to every live subscriber whose key matches.
fn fan_out<K, T: Clone>(
    subscribers: &mut Vec<Subscriber<K, T>>,
    row: &T,
    matches: impl Fn(&K) -> bool,
) {
    subscribers.retain(|s| !s.tx.is_closed());
    for subscriber in subscribers.iter().filter(|s| matches(&s.key)) {
        let _ = subscriber.tx.send(row.clone());
    }
}

fn subscribe<K, T>(subscribers: &mut Vec<Subscriber<K, T>>, key: K) -> Subscription<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    subscribers.push(Subscriber { key, tx });
    Subscription::new(rx)
}

#[derive(Default)]
struct Tables {
    signals: Vec<SignalRow>,
    signal_subscribers: Vec<Subscriber<(UserId, Option<UserId>), SignalRow>>,
    pairing_codes: Vec<PairingCode>,
    redemptions: Vec<PairingCodeRedemption>,
    redemption_subscribers: Vec<Subscriber<String, PairingCodeRedemption>>,
    requests: Vec<FileSharingRequest>,
    request_subscribers: Vec<Subscriber<(UserId, Option<UserId>), FileSharingRequest>>,
    responses: Vec<FileSharingRequestResponse>,
    response_subscribers: Vec<Subscriber<Uuid, FileSharingRequestResponse>>,
    pairings: BTreeSet<UserPairing>,
    pairing_inserts: usize,
}

#[derive(Default)]
pub struct MemoryRelayStore {
    tables: Mutex<Tables>,
}

impl MemoryRelayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored signal rows from `from` to `to`.
    pub async fn signal_count(&self, from: &UserId, to: &UserId) -> usize {
        let tables = self.tables.lock().await;
        tables
            .signals
            .iter()
            .filter(|row| &row.from == from && &row.to == to)
            .count()
    }

    /// How many upserts actually created a pairing row.
    pub async fn pairing_inserts(&self) -> usize {
        self.tables.lock().await.pairing_inserts
    }

    pub async fn redemption_count(&self, code: &str) -> usize {
        let tables = self.tables.lock().await;
        tables.redemptions.iter().filter(|r| r.code == code).count()
    }

    pub async fn responses(&self) -> Vec<FileSharingRequestResponse> {
        self.tables.lock().await.responses.clone()
    }
}

#[async_trait]
impl RelayStore for MemoryRelayStore {
    async fn insert_signals(&self, rows: Vec<SignalRow>) -> Result<(), RelayError> {
        let mut tables = self.tables.lock().await;
        let Tables {
            signals,
            signal_subscribers,
            ..
        } = &mut *tables;
        for row in rows {
            fan_out(signal_subscribers, &row, |(to, from)| {
                to == &row.to && from.as_ref().is_none_or(|f| f == &row.from)
            });
            signals.push(row);
        }
        Ok(())
    }

    async fn delete_signals(&self, from: &UserId, to: &UserId) -> Result<usize, RelayError> {
        let mut tables = self.tables.lock().await;
        let before = tables.signals.len();
        tables
            .signals
            .retain(|row| !(&row.from == from && &row.to == to));
        Ok(before - tables.signals.len())
    }

    async fn subscribe_signals(
        &self,
        to: &UserId,
        from: Option<&UserId>,
    ) -> Result<Subscription<SignalRow>, RelayError> {
        let mut tables = self.tables.lock().await;
        Ok(subscribe(
            &mut tables.signal_subscribers,
            (to.clone(), from.cloned()),
        ))
    }

    async fn replace_pairing_code(&self, code: PairingCode) -> Result<(), RelayError> {
        let mut tables = self.tables.lock().await;
        tables.pairing_codes.retain(|c| c.owner != code.owner);
        if tables.pairing_codes.iter().any(|c| c.code == code.code) {
            return Err(RelayError::Unavailable(format!(
                "pairing code '{}' is already in use",
                code.code
            )));
        }
        debug!(event = "pairing_code_stored", owner = %code.owner);
        tables.pairing_codes.push(code);
        Ok(())
    }

    async fn find_pairing_code(&self, code: &str) -> Result<Option<PairingCode>, RelayError> {
        let tables = self.tables.lock().await;
        Ok(tables.pairing_codes.iter().find(|c| c.code == code).cloned())
    }

    async fn delete_pairing_code(&self, code: &str) -> Result<(), RelayError> {
        self.tables
            .lock()
            .await
            .pairing_codes
            .retain(|c| c.code != code);
        Ok(())
    }

    async fn insert_redemption(&self, redemption: PairingCodeRedemption) -> Result<(), RelayError> {
        let mut tables = self.tables.lock().await;
        fan_out(&mut tables.redemption_subscribers, &redemption, |code| {
            code == &redemption.code
        });
        tables.redemptions.push(redemption);
        Ok(())
    }

    async fn subscribe_redemptions(
        &self,
        code: &str,
    ) -> Result<Subscription<PairingCodeRedemption>, RelayError> {
        let mut tables = self.tables.lock().await;
        Ok(subscribe(&mut tables.redemption_subscribers, code.to_string()))
    }

    async fn insert_file_request(&self, request: FileSharingRequest) -> Result<(), RelayError> {
        let mut tables = self.tables.lock().await;
        fan_out(&mut tables.request_subscribers, &request, |(to, from)| {
            to == &request.to && from.as_ref().is_none_or(|f| f == &request.from)
        });
        tables.requests.push(request);
        Ok(())
    }

    async fn subscribe_file_requests(
        &self,
        to: &UserId,
        from: Option<&UserId>,
    ) -> Result<Subscription<FileSharingRequest>, RelayError> {
        let mut tables = self.tables.lock().await;
        Ok(subscribe(
            &mut tables.request_subscribers,
            (to.clone(), from.cloned()),
        ))
    }

    async fn insert_file_response(
        &self,
        response: FileSharingRequestResponse,
    ) -> Result<(), RelayError> {
        let mut tables = self.tables.lock().await;
        fan_out(&mut tables.response_subscribers, &response, |id| {
            id == &response.request_id
        });
        tables.responses.push(response);
        Ok(())
    }

    async fn subscribe_file_responses(
        &self,
        request_id: Uuid,
    ) -> Result<Subscription<FileSharingRequestResponse>, RelayError> {
        let mut tables = self.tables.lock().await;
        Ok(subscribe(&mut tables.response_subscribers, request_id))
    }

    async fn upsert_pairing(&self, pairing: UserPairing) -> Result<(), RelayError> {
        let mut tables = self.tables.lock().await;
        if tables.pairings.insert(pairing) {
            tables.pairing_inserts += 1;
        }
        Ok(())
    }

    async fn list_pairings(&self, user: &UserId) -> Result<Vec<UserPairing>, RelayError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .pairings
            .iter()
            .filter(|p| p.contains(user))
            .cloned()
            .collect())
    }

    async fn delete_pairing(&self, pairing: &UserPairing) -> Result<bool, RelayError> {
        Ok(self.tables.lock().await.pairings.remove(pairing))
    }
}
