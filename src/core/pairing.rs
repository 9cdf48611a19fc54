//! New-connection orchestrator: pairing two users with a short code.
//!
//! The code owner publishes a code and waits for someone to redeem it, then
//! calls the redeemer and records the pairing. The redeemer looks the code
//! up, consumes it and answers. Progress is published on a `watch` channel
//! so a UI can follow along.

use crate::core::config::{PAIRING_CODE_ALPHABET, PAIRING_CODE_LENGTH};
use crate::core::error::FailureReason;
use crate::core::negotiation::{
    CallerNegotiation, NegotiationContext, ReceiverNegotiation, negotiate,
};
use crate::core::relay::{PairingCode, PairingCodeRedemption, UserId, UserPairing};
use crate::core::transport::PeerTransport;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum PairingState {
    Idle,
    CreatingCode,
    WaitingForRedemption { code: String },
    RedeemingCode { code: String },
    ConnectingCaller { remote: UserId },
    CreatingUserConnection { remote: UserId },
    ConnectingReceiver { remote: UserId },
    Connected { remote: UserId },
    ConnectionErrored { reason: FailureReason },
}

impl PairingCode {
    /// A fresh random code owned by `owner`.
    pub fn generate(owner: UserId, now: DateTime<Utc>) -> Self {
        let mut rng = rand::rng();
        let code = (0..PAIRING_CODE_LENGTH)
            .map(|_| PAIRING_CODE_ALPHABET[rng.random_range(0..PAIRING_CODE_ALPHABET.len())] as char)
            .collect();
        Self {
            code,
            owner,
            created_at: now,
        }
    }

    /// Valid while `created_at >= now - ttl`.
    pub fn check_valid(&self, now: DateTime<Utc>, ttl: Duration) -> Result<(), FailureReason> {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        match now.checked_sub_signed(ttl) {
            Some(cutoff) if self.created_at < cutoff => Err(FailureReason::RequestExpired),
            _ => Ok(()),
        }
    }
}

pub struct NewConnection {
    ctx: NegotiationContext,
    code_ttl: Duration,
    state: watch::Sender<PairingState>,
    active: Mutex<Option<Arc<dyn PeerTransport>>>,
}

impl NewConnection {
    pub fn new(ctx: NegotiationContext, code_ttl: Duration) -> Self {
        let (state, _) = watch::channel(PairingState::Idle);
        Self {
            ctx,
            code_ttl,
            state,
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> watch::Receiver<PairingState> {
        self.state.subscribe()
    }

    /// Publishes a fresh code, waits for it to be redeemed and connects to
    /// the redeemer. Returns who redeemed it.
    pub async fn create_code(&self) -> Result<UserId, FailureReason> {
        let code = PairingCode::generate(self.ctx.self_id.clone(), Utc::now());
        self.create_code_with(code.code).await
    }

    async fn create_code_with(&self, code: String) -> Result<UserId, FailureReason> {
        self.close_active().await;
        self.set(PairingState::CreatingCode);
        let result = self.await_redemption(&code).await;
        if result.is_err() {
            // Leave no redeemable code behind a failed attempt.
            if let Err(e) = self.ctx.relay.store().delete_pairing_code(&code).await {
                warn!(event = "pairing_code_cleanup_failed", %code, %e);
            }
        }
        self.finish(result).await
    }

    async fn await_redemption(&self, code: &str) -> Result<UserId, FailureReason> {
        let store = self.ctx.relay.store();
        let self_id = &self.ctx.self_id;

        // Subscribe first so a redeemer that is quicker than us is not missed.
        let mut redemptions = store.subscribe_redemptions(code).await?;
        store
            .replace_pairing_code(PairingCode {
                code: code.to_string(),
                owner: self_id.clone(),
                created_at: Utc::now(),
            })
            .await?;
        info!(event = "pairing_code_published", owner = %self_id, code);
        self.set(PairingState::WaitingForRedemption {
            code: code.to_string(),
        });

        let redemption = tokio::time::timeout(self.code_ttl, redemptions.next())
            .await
            .map_err(|_| FailureReason::RequestExpired)?
            .ok_or_else(|| FailureReason::Relay("redemption stream closed".into()))?;
        // Only the first redemption counts.
        redemptions.close();
        let remote = redemption.redeemer;

        self.set(PairingState::ConnectingCaller {
            remote: remote.clone(),
        });
        let transport = self.open_transport().await?;
        negotiate(CallerNegotiation::new(), &self.ctx, &remote, transport, None).await?;

        self.set(PairingState::CreatingUserConnection {
            remote: remote.clone(),
        });
        store
            .upsert_pairing(UserPairing::new(self_id.clone(), remote.clone()))
            .await?;
        Ok(remote)
    }

    /// Redeems `code` and answers its owner's call. Returns the owner.
    pub async fn redeem_code(&self, code: &str) -> Result<UserId, FailureReason> {
        let code = code.trim().to_ascii_lowercase();
        self.close_active().await;
        self.set(PairingState::RedeemingCode { code: code.clone() });
        let result = self.redeem(&code).await;
        self.finish(result).await
    }

    async fn redeem(&self, code: &str) -> Result<UserId, FailureReason> {
        let store = self.ctx.relay.store();
        let self_id = &self.ctx.self_id;

        let found = store
            .find_pairing_code(code)
            .await?
            .ok_or(FailureReason::NotFound)?;
        found.check_valid(Utc::now(), self.code_ttl)?;
        if &found.owner == self_id {
            return Err(FailureReason::ProtocolViolation(
                "cannot redeem a code you created".into(),
            ));
        }
        let remote = found.owner;

        // The owner calls as soon as it sees the redemption; listen first.
        let signals = self.ctx.relay.subscribe(self_id, Some(&remote)).await?;
        let transport = self.open_transport().await?;
        store
            .insert_redemption(PairingCodeRedemption {
                code: code.to_string(),
                redeemer: self_id.clone(),
            })
            .await?;
        store.delete_pairing_code(code).await?;
        debug!(event = "pairing_code_consumed", code, owner = %remote);

        self.set(PairingState::ConnectingReceiver {
            remote: remote.clone(),
        });
        negotiate(
            ReceiverNegotiation::new(),
            &self.ctx,
            &remote,
            transport,
            Some(signals),
        )
        .await?;
        Ok(remote)
    }

    /// Users this user is paired with.
    pub async fn list_connections(&self) -> Result<Vec<UserId>, FailureReason> {
        let self_id = &self.ctx.self_id;
        let pairings = self.ctx.relay.store().list_pairings(self_id).await?;
        Ok(pairings
            .iter()
            .map(|pairing| pairing.other(self_id).clone())
            .collect())
    }

    /// Returns whether a pairing with `remote` existed.
    pub async fn remove_connection(&self, remote: &UserId) -> Result<bool, FailureReason> {
        let pairing = UserPairing::new(self.ctx.self_id.clone(), remote.clone());
        let removed = self.ctx.relay.store().delete_pairing(&pairing).await?;
        info!(event = "pairing_removed", %remote, removed);
        Ok(removed)
    }

    /// Tears down the connection of the last attempt and returns to idle.
    pub async fn close(&self) {
        self.close_active().await;
        self.set(PairingState::Idle);
    }

    async fn open_transport(&self) -> Result<Arc<dyn PeerTransport>, FailureReason> {
        let transport = self
            .ctx
            .transports
            .create()
            .await
            .map_err(FailureReason::connection)?;
        *self.active.lock().await = Some(transport.clone());
        Ok(transport)
    }

    async fn close_active(&self) {
        if let Some(transport) = self.active.lock().await.take() {
            transport.close().await;
        }
    }

    async fn finish(&self, result: Result<UserId, FailureReason>) -> Result<UserId, FailureReason> {
        match &result {
            Ok(remote) => self.set(PairingState::Connected {
                remote: remote.clone(),
            }),
            Err(reason) => {
                warn!(event = "pairing_failed", %reason);
                self.close_active().await;
                self.set(PairingState::ConnectionErrored {
                    reason: reason.clone(),
                });
            }
        }
        result
    }

    fn set(&self, next: PairingState) {
        debug!(event = "pairing_state", state = ?next);
        self.state.send_replace(next);
    }
}
