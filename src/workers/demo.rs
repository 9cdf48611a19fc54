//! Local two-peer run: pairs two users through an in-process relay and
//! sends files between them over real WebRTC data channels.

use anyhow::{Context, Result, anyhow, bail};
use peerbeam::core::config::Settings;
use peerbeam::core::negotiation::NegotiationContext;
use peerbeam::core::pairing::{NewConnection, PairingState};
use peerbeam::core::relay::{MemoryRelayStore, SignalingRelay, UserId};
use peerbeam::core::session::{FileTransferSession, SessionHandle, SessionState};
use peerbeam::core::transfer::{DirectoryDestination, FileSource};
use peerbeam::core::transport::RtcTransportFactory;
use peerbeam::utils::shutdown::Shutdown;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub async fn run(settings: Settings, files: Vec<PathBuf>, shutdown: Shutdown) -> Result<()> {
    let mut sources = Vec::with_capacity(files.len());
    for path in &files {
        let source = FileSource::from_path(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        sources.push(source);
    }

    let relay = SignalingRelay::new(Arc::new(MemoryRelayStore::new()));
    let transports = Arc::new(RtcTransportFactory::new(&settings)?);
    let context = |self_id: UserId| NegotiationContext {
        self_id,
        relay: relay.clone(),
        transports: transports.clone(),
        connect_timeout: settings.connect_timeout(),
    };
    let sender_id = UserId::new(Uuid::new_v4().to_string());
    let receiver_id = UserId::new(Uuid::new_v4().to_string());
    let sender_ctx = context(sender_id.clone());
    let receiver_ctx = context(receiver_id.clone());

    tokio::select! {
        paired = pair(&sender_ctx, &receiver_ctx, &settings) => paired?,
        _ = shutdown.cancelled() => bail!("interrupted while pairing"),
    }

    let destination = Arc::new(DirectoryDestination::new(&settings.download_dir));
    let sender = FileTransferSession::spawn(sender_ctx, receiver_id, destination.clone()).await?;
    let receiver = FileTransferSession::spawn(receiver_ctx, sender_id, destination).await?;

    info!(event = "demo_sending", files = sources.len(), dir = %settings.download_dir.display());
    sender.send_files(sources);

    tokio::select! {
        done = follow(&receiver) => done,
        _ = shutdown.cancelled() => {
            receiver.cancel();
            sender.cancel();
            bail!("interrupted")
        }
    }
}

/// The sender publishes a code, the receiver redeems it.
async fn pair(
    sender_ctx: &NegotiationContext,
    receiver_ctx: &NegotiationContext,
    settings: &Settings,
) -> Result<()> {
    let owner = NewConnection::new(sender_ctx.clone(), settings.pairing_code_ttl());
    let redeemer = NewConnection::new(receiver_ctx.clone(), settings.pairing_code_ttl());
    let mut owner_state = owner.state();

    let redeem = async {
        let state = owner_state
            .wait_for(|s| {
                matches!(
                    s,
                    PairingState::WaitingForRedemption { .. } | PairingState::ConnectionErrored { .. }
                )
            })
            .await
            .map_err(|_| anyhow!("pairing stopped"))?
            .clone();
        let PairingState::WaitingForRedemption { code } = state else {
            bail!("pairing code was not published");
        };
        info!(event = "demo_code", code = %code, "Redeeming pairing code");
        Ok(redeemer.redeem_code(&code).await?)
    };

    let (created, redeemed) = tokio::join!(owner.create_code(), redeem);
    let remote = created?;
    let owner_id = redeemed?;
    info!(event = "demo_paired", sender = %owner_id, receiver = %remote);

    // Sessions negotiate their own connection per request.
    owner.close().await;
    redeemer.close().await;
    Ok(())
}

/// Answers the incoming request and reports progress until the batch ends.
async fn follow(receiver: &SessionHandle) -> Result<()> {
    let mut state = receiver.state();
    let mut last_percent = None;
    loop {
        let current = state.borrow_and_update().clone();
        match current {
            SessionState::PromptingUserToAccept { request } => {
                info!(
                    event = "demo_request",
                    files = request.files.len(),
                    bytes = request.total_size(),
                    "Accepting request"
                );
                receiver.accept();
            }
            SessionState::ReceivingFiles { transfers } => {
                let total: u64 = transfers.iter().map(|t| t.metadata.size).sum();
                let written: u64 = transfers.iter().filter_map(|t| t.written_bytes).sum();
                let percent = if total == 0 { 100 } else { written * 100 / total };
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    info!(event = "demo_progress", percent, written, total);
                }
            }
            SessionState::FilesReceived => {
                info!(event = "demo_done", "All files received");
                return Ok(());
            }
            SessionState::Idle {
                last_failure: Some(reason),
            } => {
                warn!(event = "demo_failed", %reason);
                bail!("transfer failed: {reason}");
            }
            _ => {}
        }
        state
            .changed()
            .await
            .map_err(|_| anyhow!("receiving session stopped"))?;
    }
}
