//! Receiving side of one file channel.
//!
//! The event loop counts bytes as they arrive and hands every chunk to a
//! single writer task, so disk writes happen one at a time and in arrival
//! order while the channel keeps draining. The writer opens the sink itself;
//! chunks that arrive while the destination is still prompting simply queue.

use super::{FileDestination, FileMetadata, FileSink, Transfer, TransferProgress};
use crate::core::error::{FailureReason, PersistenceError};
use crate::core::transport::{ChannelEvent, DataChannel};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Writer = JoinHandle<Result<Box<dyn FileSink>, PersistenceError>>;

/// Receives one file from `channel` into `destination`.
///
/// Returns when every byte is durably written. The output is finalized
/// before the channel is closed, and that close tells the sender it is done.
pub async fn receive_file(
    channel: Arc<dyn DataChannel>,
    index: usize,
    destination: Arc<dyn FileDestination>,
    progress: mpsc::UnboundedSender<TransferProgress>,
) -> Result<Transfer, FailureReason> {
    let mut events = channel.take_events().ok_or_else(|| {
        FailureReason::ProtocolViolation(format!("channel '{}' already in use", channel.label()))
    })?;

    let metadata = match read_metadata(&mut events).await {
        Ok(metadata) => metadata,
        Err(reason) => {
            channel.close().await;
            return Err(reason);
        }
    };
    debug!(event = "metadata_received", index, name = %metadata.name, size = metadata.size);

    let size = metadata.size;
    let mut transfer = Transfer::receiving(index, metadata.clone());
    let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
    let (written_tx, mut written_rx) = mpsc::unbounded_channel();
    let mut writer: Writer = tokio::spawn(write_chunks(destination, metadata, chunk_rx, written_tx));
    let mut chunk_tx = Some(chunk_tx);

    let report = |transfer: &Transfer| {
        let _ = progress.send(TransferProgress {
            index,
            transferred_bytes: transfer.transferred_bytes,
            written_bytes: transfer.written_bytes,
        });
    };

    loop {
        tokio::select! {
            biased;

            finished = &mut writer => {
                let outcome = match finished {
                    Ok(Ok(sink)) => sink.finalize().await.map_err(FailureReason::from),
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(FailureReason::Persistence(e.to_string())),
                };
                channel.close().await;
                if let Err(reason) = outcome {
                    warn!(event = "receive_failed", index, %reason);
                    return Err(reason);
                }
                transfer.written_bytes = Some(size);
                report(&transfer);
                info!(event = "file_received", index, name = %transfer.metadata.name, bytes = size);
                return Ok(transfer);
            }

            Some(written) = written_rx.recv() => {
                transfer.written_bytes = Some(written);
                report(&transfer);
            }

            event = events.recv() => match event {
                Some(ChannelEvent::Binary(data)) => {
                    let received = transfer.transferred_bytes + data.len() as u64;
                    if received > size {
                        warn!(event = "receive_overflow", index, received, size);
                        stop_writer(chunk_tx.take(), writer).await;
                        channel.close().await;
                        return Err(FailureReason::ProtocolViolation(format!(
                            "received {received} bytes for a {size} byte file"
                        )));
                    }
                    transfer.transferred_bytes = received;
                    if let Some(tx) = &chunk_tx {
                        let _ = tx.send(data);
                    }
                    report(&transfer);
                }
                Some(ChannelEvent::Closed) | None => {
                    warn!(
                        event = "receive_interrupted",
                        index,
                        received = transfer.transferred_bytes,
                        size,
                    );
                    stop_writer(chunk_tx.take(), writer).await;
                    return Err(FailureReason::ConnectionInterrupted);
                }
                Some(ChannelEvent::Text(_)) => {
                    warn!(event = "duplicate_metadata", index, "Ignoring extra metadata frame");
                }
                Some(ChannelEvent::Open | ChannelEvent::BufferedAmountLow) => {}
            },
        }
    }
}

/// First text frame, parsed as metadata. Binary frames before it are dropped.
async fn read_metadata(
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
) -> Result<FileMetadata, FailureReason> {
    loop {
        match events.recv().await {
            Some(ChannelEvent::Text(text)) => {
                return serde_json::from_str(&text).map_err(|e| {
                    FailureReason::ProtocolViolation(format!("bad metadata frame: {e}"))
                });
            }
            Some(ChannelEvent::Binary(data)) => {
                warn!(event = "chunk_before_metadata", bytes = data.len(), "Dropping chunk");
            }
            Some(ChannelEvent::Closed) | None => return Err(FailureReason::ConnectionInterrupted),
            Some(_) => {}
        }
    }
}

/// Opens the sink and writes chunks strictly in order until `size` bytes
/// are durable. Returns the sink, ready to finalize.
async fn write_chunks(
    destination: Arc<dyn FileDestination>,
    metadata: FileMetadata,
    mut chunks: mpsc::UnboundedReceiver<Bytes>,
    written_tx: mpsc::UnboundedSender<u64>,
) -> Result<Box<dyn FileSink>, PersistenceError> {
    let mut sink = destination.open(&metadata).await?;
    let mut written = 0u64;

    while written < metadata.size {
        let Some(chunk) = chunks.recv().await else {
            sink.abort().await;
            return Err(PersistenceError::Cancelled);
        };
        if let Err(e) = sink.write_chunk(&chunk).await {
            sink.abort().await;
            return Err(e);
        }
        written += chunk.len() as u64;
        let _ = written_tx.send(written);
    }
    Ok(sink)
}

/// Stops the writer and discards whatever it produced. A writer that is
/// still busy is cancelled, which drops (and so discards) its sink.
async fn stop_writer(chunk_tx: Option<mpsc::UnboundedSender<Bytes>>, writer: Writer) {
    drop(chunk_tx);
    writer.abort();
    if let Ok(Ok(sink)) = writer.await {
        sink.abort().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CHUNK_SIZE;
    use crate::core::transfer::destination::memory::MemoryDestination;
    use crate::core::transfer::{DirectoryDestination, FileSource, send_file};
    use crate::core::transport::memory::MemoryChannel;

    fn metadata(size: u64) -> FileMetadata {
        FileMetadata {
            name: "data.bin".into(),
            size,
            mime_type: "application/octet-stream".into(),
        }
    }

    fn spawn_receiver(
        remote: Arc<MemoryChannel>,
        destination: Arc<dyn FileDestination>,
    ) -> (
        JoinHandle<Result<Transfer, FailureReason>>,
        mpsc::UnboundedReceiver<TransferProgress>,
    ) {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(receive_file(remote, 3, destination, progress_tx));
        (task, progress_rx)
    }

    async fn send_metadata(local: &MemoryChannel, size: u64) {
        local
            .send_text(serde_json::to_string(&metadata(size)).unwrap())
            .await
            .unwrap();
    }

    async fn wait_closed(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            if let ChannelEvent::Closed = event {
                return;
            }
        }
    }

    #[tokio::test]
    async fn output_is_final_before_the_channel_closes() {
        let (local, remote) = MemoryChannel::pair("file:3", true);
        let mut local_events = local.take_events().unwrap();
        let destination = MemoryDestination::default();
        let (task, mut progress) = spawn_receiver(remote, Arc::new(destination.clone()));

        let body: Vec<u8> = (0..120_000u32).map(|i| (i % 251) as u8).collect();
        send_metadata(&local, body.len() as u64).await;
        for chunk in body.chunks(CHUNK_SIZE) {
            local.send_binary(Bytes::copy_from_slice(chunk)).await.unwrap();
        }

        wait_closed(&mut local_events).await;
        assert_eq!(destination.finalized(), vec![("data.bin".to_string(), body.clone())]);

        let transfer = task.await.unwrap().unwrap();
        assert_eq!(transfer.index, 3);
        assert_eq!(transfer.transferred_bytes, body.len() as u64);
        assert_eq!(transfer.written_bytes, Some(body.len() as u64));
        assert!(transfer.is_done());

        let mut last = None;
        while let Ok(p) = progress.try_recv() {
            assert!(p.written_bytes.unwrap_or(0) <= p.transferred_bytes);
            last = Some(p);
        }
        assert_eq!(last.and_then(|p| p.written_bytes), Some(body.len() as u64));
    }

    #[tokio::test]
    async fn chunks_before_metadata_are_dropped() {
        let (local, remote) = MemoryChannel::pair("file:3", true);
        let destination = MemoryDestination::default();
        let (task, _progress) = spawn_receiver(remote, Arc::new(destination.clone()));

        local.send_binary(Bytes::from_static(b"early")).await.unwrap();
        send_metadata(&local, 4).await;
        local.send_binary(Bytes::from_static(b"body")).await.unwrap();

        task.await.unwrap().unwrap();
        assert_eq!(destination.finalized(), vec![("data.bin".to_string(), b"body".to_vec())]);
    }

    #[tokio::test]
    async fn empty_file_finishes_on_metadata() {
        let (local, remote) = MemoryChannel::pair("file:3", true);
        let destination = MemoryDestination::default();
        let (task, _progress) = spawn_receiver(remote, Arc::new(destination.clone()));

        send_metadata(&local, 0).await;

        let transfer = task.await.unwrap().unwrap();
        assert_eq!(transfer.written_bytes, Some(0));
        assert_eq!(destination.finalized().len(), 1);
        assert!(!local.is_open());
    }

    #[tokio::test]
    async fn early_close_aborts_the_output() {
        let (local, remote) = MemoryChannel::pair("file:3", true);
        let destination = MemoryDestination::default();
        let (task, mut progress) = spawn_receiver(remote, Arc::new(destination.clone()));

        send_metadata(&local, 100).await;
        local.send_binary(Bytes::from(vec![0u8; 40])).await.unwrap();
        // Close only once the sink is open and holds the first chunk.
        while let Some(p) = progress.recv().await {
            if p.written_bytes == Some(40) {
                break;
            }
        }
        local.close().await;

        assert_eq!(task.await.unwrap(), Err(FailureReason::ConnectionInterrupted));
        assert!(destination.finalized().is_empty());
        assert_eq!(destination.aborted(), vec!["data.bin".to_string()]);
    }

    #[tokio::test]
    async fn close_before_the_sink_opens_finalizes_nothing() {
        let (local, remote) = MemoryChannel::pair("file:3", true);
        let destination = MemoryDestination::default();
        let (task, _progress) = spawn_receiver(remote, Arc::new(destination.clone()));

        send_metadata(&local, 100).await;
        local.send_binary(Bytes::from(vec![0u8; 40])).await.unwrap();
        local.close().await;

        assert_eq!(task.await.unwrap(), Err(FailureReason::ConnectionInterrupted));
        assert!(destination.finalized().is_empty());
    }

    #[tokio::test]
    async fn more_bytes_than_announced_is_a_protocol_violation() {
        let (local, remote) = MemoryChannel::pair("file:3", true);
        let destination = MemoryDestination::default();
        let (task, _progress) = spawn_receiver(remote, Arc::new(destination.clone()));

        send_metadata(&local, 4).await;
        local.send_binary(Bytes::from_static(b"too long")).await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(FailureReason::ProtocolViolation(_))
        ));
        assert!(destination.finalized().is_empty());
    }

    #[tokio::test]
    async fn unavailable_destination_closes_the_channel() {
        let (local, remote) = MemoryChannel::pair("file:3", true);
        let destination = MemoryDestination {
            fail_open: true,
            ..Default::default()
        };
        let (task, _progress) = spawn_receiver(remote, Arc::new(destination));

        send_metadata(&local, 10).await;

        assert!(matches!(
            task.await.unwrap(),
            Err(FailureReason::Persistence(_))
        ));
        assert!(!local.is_open());
    }

    #[tokio::test]
    async fn sender_and_receiver_round_trip_to_disk() {
        let dir = std::env::temp_dir().join("peerbeam_test").join("round_trip");
        let _ = std::fs::remove_dir_all(&dir);

        let (local, remote) = MemoryChannel::pair("file:0", true);
        let body: Vec<u8> = (0..150_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let source = FileSource::from_bytes("photo.png", body.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

        let receiving = tokio::spawn(receive_file(
            remote,
            0,
            Arc::new(DirectoryDestination::new(&dir)),
            progress_tx,
        ));
        let sent = send_file(local, 0, &source, tx).await.unwrap();
        let received = receiving.await.unwrap().unwrap();

        assert_eq!(sent.transferred_bytes, 150_000);
        assert_eq!(received.written_bytes, Some(150_000));
        assert_eq!(received.metadata.mime_type, "image/png");
        assert_eq!(std::fs::read(dir.join("photo.png")).unwrap(), body);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
