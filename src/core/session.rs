//! File transfer session with one paired remote user.
//!
//! A session runs in its own task. At rest it listens for file-sharing
//! requests from its remote and for commands from the handle; every flow
//! (sending or receiving a batch) runs to completion or failure and then
//! returns to a rest state. One peer connection is negotiated per accepted
//! request and each file gets a fresh `file:<index>` channel on it.

use crate::core::config::{INTERRUPTION_GRACE, file_channel_label, parse_file_channel_label};
use crate::core::error::FailureReason;
use crate::core::negotiation::{
    CallerNegotiation, NegotiationContext, ReceiverNegotiation, negotiate,
};
use crate::core::relay::{
    FileSharingRequest, FileSharingRequestResponse, Subscription, UserId,
};
use crate::core::transfer::{
    FileDestination, FileSource, Transfer, TransferProgress, receive_file, send_file,
};
use crate::core::transport::{DataChannel, PeerTransport, TransportEvent};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle { last_failure: Option<FailureReason> },
    SendingRequest,
    WaitingForResponse { request_id: Uuid },
    Connecting { request_id: Uuid },
    SendingFiles { transfers: Vec<Transfer> },
    FilesSent,
    PromptingUserToAccept { request: FileSharingRequest },
    AcceptingRequest { request_id: Uuid },
    ConnectingWithCaller { request_id: Uuid },
    ReceivingFiles { transfers: Vec<Transfer> },
    FilesReceived,
}

impl SessionState {
    fn label(&self) -> &'static str {
        match self {
            Self::Idle { .. } => "idle",
            Self::SendingRequest => "sending-request",
            Self::WaitingForResponse { .. } => "waiting-for-response",
            Self::Connecting { .. } => "connecting",
            Self::SendingFiles { .. } => "sending-files",
            Self::FilesSent => "files-sent",
            Self::PromptingUserToAccept { .. } => "prompting-user-to-accept",
            Self::AcceptingRequest { .. } => "accepting-request",
            Self::ConnectingWithCaller { .. } => "connecting-with-caller",
            Self::ReceivingFiles { .. } => "receiving-files",
            Self::FilesReceived => "files-received",
        }
    }
}

#[derive(Debug)]
pub enum SessionCommand {
    SendFiles(Vec<FileSource>),
    Accept,
    Decline,
    Cancel,
}

/// Owning handle to a running session. Dropping it stops the session.
pub struct SessionHandle {
    remote: UserId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    pub fn send_files(&self, files: Vec<FileSource>) {
        self.command(SessionCommand::SendFiles(files));
    }

    pub fn accept(&self) {
        self.command(SessionCommand::Accept);
    }

    pub fn decline(&self) {
        self.command(SessionCommand::Decline);
    }

    pub fn cancel(&self) {
        self.command(SessionCommand::Cancel);
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    fn command(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            warn!(event = "session_gone", remote = %self.remote, "Session task has stopped");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct FileTransferSession;

impl FileTransferSession {
    /// Starts a session with `remote`. Incoming requests are listened for
    /// before this returns, so none sent afterwards can be missed.
    pub async fn spawn(
        ctx: NegotiationContext,
        remote: UserId,
        destination: Arc<dyn FileDestination>,
    ) -> Result<SessionHandle, FailureReason> {
        let requests = ctx
            .relay
            .store()
            .subscribe_file_requests(&ctx.self_id, Some(&remote))
            .await?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle { last_failure: None });

        let session = Session {
            ctx,
            remote: remote.clone(),
            destination,
            commands: commands_rx,
            requests,
            state: state_tx,
            lingering: None,
        };
        let task = tokio::spawn(session.run());

        Ok(SessionHandle {
            remote,
            commands: commands_tx,
            state: state_rx,
            task,
        })
    }
}

/// A sender's connection kept open in `FilesSent` until the receiver closes it.
struct Lingering {
    transport: Arc<dyn PeerTransport>,
    events: broadcast::Receiver<TransportEvent>,
}

struct Session {
    ctx: NegotiationContext,
    remote: UserId,
    destination: Arc<dyn FileDestination>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    requests: Subscription<FileSharingRequest>,
    state: watch::Sender<SessionState>,
    lingering: Option<Lingering>,
}

/// How a flow over an established connection ended.
enum Finish {
    /// Connection still up.
    Open,
    /// The connection went away, but only after all work was done.
    AlreadyClosed,
}

impl Session {
    async fn run(mut self) {
        info!(event = "session_started", remote = %self.remote);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::SendFiles(files)) => {
                        self.release_lingering().await;
                        let outcome = self.send(files).await;
                        self.settle(outcome);
                    }
                    Some(SessionCommand::Cancel) => {
                        self.release_lingering().await;
                        self.set(SessionState::Idle { last_failure: Some(FailureReason::Cancelled) });
                    }
                    Some(command) => {
                        debug!(event = "command_ignored", ?command, "No pending request");
                    }
                    None => break,
                },
                request = self.requests.next() => match request {
                    Some(request) => {
                        self.release_lingering().await;
                        let outcome = self.receive(request).await;
                        self.settle(outcome);
                    }
                    None => {
                        warn!(event = "request_stream_closed", remote = %self.remote);
                        break;
                    }
                },
                _ = lingering_closed(&mut self.lingering) => {
                    debug!(event = "sender_connection_closed", remote = %self.remote);
                    self.release_lingering().await;
                    self.set(SessionState::Idle { last_failure: None });
                }
            }
        }
        self.release_lingering().await;
        info!(event = "session_stopped", remote = %self.remote);
    }

    fn set(&self, next: SessionState) {
        let previous = self.state.borrow().label();
        if previous != next.label() {
            debug!(event = "session_state", remote = %self.remote, from = previous, to = next.label());
        }
        self.state.send_replace(next);
    }

    fn settle(&self, outcome: Result<SessionState, FailureReason>) {
        match outcome {
            Ok(state) => self.set(state),
            Err(reason) => {
                warn!(event = "session_flow_failed", remote = %self.remote, %reason);
                self.set(SessionState::Idle {
                    last_failure: Some(reason),
                });
            }
        }
    }

    async fn release_lingering(&mut self) {
        if let Some(lingering) = self.lingering.take() {
            lingering.transport.close().await;
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    async fn send(&mut self, files: Vec<FileSource>) -> Result<SessionState, FailureReason> {
        if files.is_empty() {
            return Err(FailureReason::ProtocolViolation("no files to send".into()));
        }
        self.set(SessionState::SendingRequest);
        let store = self.ctx.relay.store().clone();
        let request = FileSharingRequest::new(
            self.ctx.self_id.clone(),
            self.remote.clone(),
            files.iter().map(|f| f.metadata().clone()).collect(),
        );
        let request_id = request.id;

        let mut responses = store.subscribe_file_responses(request_id).await?;
        store.insert_file_request(request.clone()).await?;
        info!(
            event = "file_request_sent",
            %request_id,
            to = %self.remote,
            files = request.files.len(),
            bytes = request.total_size(),
        );
        self.set(SessionState::WaitingForResponse { request_id });

        let response = interruptible(&mut self.commands, responses.next())
            .await?
            .ok_or_else(|| FailureReason::Relay("response stream closed".into()))?;
        responses.close();
        if !response.accepted {
            return Err(FailureReason::RequestDeclined);
        }

        self.set(SessionState::Connecting { request_id });
        let transport = self
            .ctx
            .transports
            .create()
            .await
            .map_err(FailureReason::connection)?;
        let mut events = transport.subscribe();

        let result = self.send_over(&transport, &mut events, files).await;
        match result {
            Ok(Finish::Open) => {
                self.lingering = Some(Lingering { transport, events });
                Ok(SessionState::FilesSent)
            }
            Ok(Finish::AlreadyClosed) => {
                transport.close().await;
                self.set(SessionState::FilesSent);
                Ok(SessionState::Idle { last_failure: None })
            }
            Err(reason) => {
                transport.close().await;
                Err(reason)
            }
        }
    }

    async fn send_over(
        &mut self,
        transport: &Arc<dyn PeerTransport>,
        events: &mut broadcast::Receiver<TransportEvent>,
        files: Vec<FileSource>,
    ) -> Result<Finish, FailureReason> {
        interruptible(
            &mut self.commands,
            negotiate(
                CallerNegotiation::new(),
                &self.ctx,
                &self.remote,
                transport.clone(),
                None,
            ),
        )
        .await??;

        let count = files.len();
        let mut transfers: Vec<Transfer> = files
            .iter()
            .enumerate()
            .map(|(i, f)| Transfer::sending(i, f.metadata().clone()))
            .collect();
        self.set(SessionState::SendingFiles {
            transfers: transfers.clone(),
        });
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<TransferProgress>();

        for (index, source) in files.into_iter().enumerate() {
            let channel = transport
                .create_data_channel(&file_channel_label(index))
                .await
                .map_err(FailureReason::connection)?;
            let mut worker = JoinSet::new();
            let progress = progress_tx.clone();
            worker.spawn(async move { send_file(channel, index, &source, progress).await });

            loop {
                tokio::select! {
                    joined = worker.join_next() => {
                        transfers[index] = joined_transfer(joined)?;
                        self.set(SessionState::SendingFiles { transfers: transfers.clone() });
                        break;
                    }
                    Some(progress) = progress_rx.recv() => {
                        transfers[progress.index].apply(&progress);
                        self.set(SessionState::SendingFiles { transfers: transfers.clone() });
                    }
                    event = events.recv() => {
                        if !is_interruption(&event) {
                            continue;
                        }
                        warn!(event = "send_interrupted", index, remote = %self.remote);
                        // The receiver closes the connection right after the
                        // last file; the worker may still be reporting it.
                        let finished = tokio::time::timeout(INTERRUPTION_GRACE, worker.join_next()).await;
                        transport.close().await;
                        return match finished {
                            Ok(joined) if index + 1 == count => {
                                transfers[index] = joined_transfer(joined)?;
                                self.set(SessionState::SendingFiles { transfers });
                                Ok(Finish::AlreadyClosed)
                            }
                            _ => Err(FailureReason::ConnectionInterrupted),
                        };
                    }
                    command = self.commands.recv() => {
                        if cancels(command) {
                            return Err(FailureReason::Cancelled);
                        }
                    }
                }
            }
            info!(event = "batch_progress", done = index + 1, total = count, remote = %self.remote);
        }
        Ok(Finish::Open)
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    async fn receive(&mut self, request: FileSharingRequest) -> Result<SessionState, FailureReason> {
        let request_id = request.id;
        info!(
            event = "file_request_received",
            %request_id,
            from = %request.from,
            files = request.files.len(),
            bytes = request.total_size(),
        );
        self.set(SessionState::PromptingUserToAccept {
            request: request.clone(),
        });

        let store = self.ctx.relay.store().clone();
        let accepted = loop {
            match self.commands.recv().await {
                Some(SessionCommand::Accept) => break true,
                Some(SessionCommand::Decline) => break false,
                Some(SessionCommand::Cancel) | None => {
                    store
                        .insert_file_response(FileSharingRequestResponse {
                            request_id,
                            accepted: false,
                        })
                        .await?;
                    return Err(FailureReason::Cancelled);
                }
                Some(SessionCommand::SendFiles(_)) => {
                    warn!(event = "send_while_prompting", %request_id, "Answer the pending request first");
                }
            }
        };
        if !accepted {
            store
                .insert_file_response(FileSharingRequestResponse {
                    request_id,
                    accepted: false,
                })
                .await?;
            info!(event = "file_request_declined", %request_id);
            return Ok(SessionState::Idle { last_failure: None });
        }

        self.set(SessionState::AcceptingRequest { request_id });
        let transport = self
            .ctx
            .transports
            .create()
            .await
            .map_err(FailureReason::connection)?;
        let result = self.receive_over(&transport, &request).await;
        transport.close().await;
        result.map(|()| SessionState::FilesReceived)
    }

    async fn receive_over(
        &mut self,
        transport: &Arc<dyn PeerTransport>,
        request: &FileSharingRequest,
    ) -> Result<(), FailureReason> {
        let request_id = request.id;
        let mut events = transport.subscribe();
        let mut incoming = transport
            .take_incoming_channels()
            .ok_or_else(|| FailureReason::connection("incoming channels already taken"))?;

        // The sender starts calling as soon as it sees the response.
        let signals = self
            .ctx
            .relay
            .subscribe(&self.ctx.self_id, Some(&self.remote))
            .await?;
        self.ctx
            .relay
            .store()
            .insert_file_response(FileSharingRequestResponse {
                request_id,
                accepted: true,
            })
            .await?;
        self.set(SessionState::ConnectingWithCaller { request_id });

        interruptible(
            &mut self.commands,
            negotiate(
                ReceiverNegotiation::new(),
                &self.ctx,
                &self.remote,
                transport.clone(),
                Some(signals),
            ),
        )
        .await??;

        let count = request.files.len();
        let mut transfers: Vec<Transfer> = request
            .files
            .iter()
            .enumerate()
            .map(|(i, metadata)| Transfer::receiving(i, metadata.clone()))
            .collect();
        self.set(SessionState::ReceivingFiles {
            transfers: transfers.clone(),
        });

        let mut started = vec![false; count];
        let mut done = vec![false; count];
        let mut workers = JoinSet::new();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<TransferProgress>();

        while !done.iter().all(|d| *d) {
            tokio::select! {
                Some(channel) = incoming.recv() => {
                    match parse_file_channel_label(channel.label()) {
                        Some(index) if index < count && !started[index] => {
                            started[index] = true;
                            debug!(event = "file_channel_accepted", index, %request_id);
                            workers.spawn(receive_file(
                                channel,
                                index,
                                self.destination.clone(),
                                progress_tx.clone(),
                            ));
                        }
                        _ => ignore_channel(channel),
                    }
                }
                Some(joined) = workers.join_next() => {
                    let transfer = joined_transfer(Some(joined))?;
                    let index = transfer.index;
                    done[index] = true;
                    transfers[index] = transfer;
                    self.set(SessionState::ReceivingFiles { transfers: transfers.clone() });
                }
                Some(progress) = progress_rx.recv() => {
                    transfers[progress.index].apply(&progress);
                    self.set(SessionState::ReceivingFiles { transfers: transfers.clone() });
                }
                event = events.recv() => {
                    if !is_interruption(&event) {
                        continue;
                    }
                    warn!(event = "receive_interrupted", %request_id, remote = %self.remote);
                    // Closing ends every open channel, so workers abort their
                    // outputs and report back promptly.
                    transport.close().await;
                    let drained = tokio::time::timeout(INTERRUPTION_GRACE, async {
                        while let Some(joined) = workers.join_next().await {
                            if let Ok(Ok(transfer)) = joined {
                                done[transfer.index] = true;
                            }
                        }
                    })
                    .await;
                    if drained.is_ok() && done.iter().all(|d| *d) {
                        break;
                    }
                    return Err(FailureReason::ConnectionInterrupted);
                }
                command = self.commands.recv() => {
                    if cancels(command) {
                        return Err(FailureReason::Cancelled);
                    }
                }
            }
        }

        info!(event = "files_received", %request_id, files = count, remote = %self.remote);
        Ok(())
    }
}

/// Runs `fut` unless the session is cancelled first. Commands other than
/// cancel are not meaningful mid-flow and are dropped.
async fn interruptible<F: Future>(
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    fut: F,
) -> Result<F::Output, FailureReason> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return Ok(output),
            command = commands.recv() => {
                if cancels(command) {
                    return Err(FailureReason::Cancelled);
                }
            }
        }
    }
}

fn cancels(command: Option<SessionCommand>) -> bool {
    match command {
        Some(SessionCommand::Cancel) | None => true,
        Some(command) => {
            debug!(event = "command_ignored", ?command, "Session busy");
            false
        }
    }
}

fn is_interruption(event: &Result<TransportEvent, broadcast::error::RecvError>) -> bool {
    match event {
        Ok(TransportEvent::ConnectionStateChanged(state)) => state.is_interruption(),
        Ok(TransportEvent::IceConnectionFailed) => true,
        Ok(_) => false,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(event = "transport_events_lagged", skipped);
            false
        }
        Err(broadcast::error::RecvError::Closed) => true,
    }
}

fn joined_transfer(
    joined: Option<Result<Result<Transfer, FailureReason>, tokio::task::JoinError>>,
) -> Result<Transfer, FailureReason> {
    match joined {
        Some(Ok(result)) => result,
        Some(Err(e)) => Err(FailureReason::connection(format!("transfer worker failed: {e}"))),
        None => Err(FailureReason::connection("transfer worker missing")),
    }
}

fn ignore_channel(channel: Arc<dyn DataChannel>) {
    debug!(event = "channel_ignored", label = channel.label());
}

/// Completes when a lingering sender connection goes away; never completes
/// when there is none.
async fn lingering_closed(lingering: &mut Option<Lingering>) {
    let Some(lingering) = lingering else {
        return std::future::pending().await;
    };
    loop {
        let event = lingering.events.recv().await;
        if is_interruption(&event) {
            return;
        }
    }
}
