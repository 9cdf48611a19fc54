//! Sending side of one file channel.

use super::{FileSource, Transfer, TransferProgress};
use crate::core::config::{BUFFERED_AMOUNT_LOW_THRESHOLD, CHUNK_SIZE};
use crate::core::error::FailureReason;
use crate::core::transport::{ChannelEvent, DataChannel};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type Events = mpsc::UnboundedReceiver<ChannelEvent>;

/// Streams `source` over `channel` and returns once the far side closed the
/// channel after receiving every byte.
///
/// Reading is paused whenever the channel's send buffer grows past
/// [`BUFFERED_AMOUNT_LOW_THRESHOLD`], so memory use stays bounded no matter
/// how slow the receiver is.
pub async fn send_file(
    channel: Arc<dyn DataChannel>,
    index: usize,
    source: &FileSource,
    progress: mpsc::UnboundedSender<TransferProgress>,
) -> Result<Transfer, FailureReason> {
    let mut events = channel.take_events().ok_or_else(|| {
        FailureReason::ProtocolViolation(format!("channel '{}' already in use", channel.label()))
    })?;
    let metadata = source.metadata().clone();
    let mut transfer = Transfer::sending(index, metadata.clone());

    if !channel.is_open() {
        wait_for_open(&mut events).await?;
    }
    channel
        .set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
        .await;

    let header = serde_json::to_string(&metadata)
        .map_err(|e| FailureReason::ProtocolViolation(e.to_string()))?;
    channel.send_text(header).await.map_err(|e| {
        warn!(event = "metadata_send_failure", channel = channel.label(), %e);
        FailureReason::ConnectionInterrupted
    })?;
    debug!(event = "metadata_sent", channel = channel.label(), name = %metadata.name, size = metadata.size);

    let mut reader = source
        .open()
        .await
        .map_err(|e| FailureReason::Persistence(e.to_string()))?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut chunks = 0usize;

    while transfer.transferred_bytes < metadata.size {
        check_not_closed(&mut events)?;
        wait_for_buffer_space(channel.as_ref(), &mut events).await?;

        let want = (metadata.size - transfer.transferred_bytes).min(CHUNK_SIZE as u64) as usize;
        let n = read_chunk(&mut reader, &mut buf[..want]).await?;
        if n == 0 {
            return Err(FailureReason::Persistence(format!(
                "'{}' ended after {} of {} bytes",
                metadata.name, transfer.transferred_bytes, metadata.size
            )));
        }

        channel
            .send_binary(Bytes::copy_from_slice(&buf[..n]))
            .await
            .map_err(|e| {
                warn!(event = "chunk_send_failure", channel = channel.label(), chunk = chunks, %e);
                FailureReason::ConnectionInterrupted
            })?;
        chunks += 1;
        transfer.transferred_bytes += n as u64;
        let _ = progress.send(TransferProgress {
            index,
            transferred_bytes: transfer.transferred_bytes,
            written_bytes: None,
        });
    }

    // The receiver closes the channel once everything is on disk.
    loop {
        match events.recv().await {
            Some(ChannelEvent::Closed) => break,
            Some(_) => {}
            None => {
                warn!(event = "channel_events_ended", channel = channel.label(), index);
                return Err(FailureReason::ConnectionInterrupted);
            }
        }
    }

    info!(
        event = "file_sent",
        index,
        name = %metadata.name,
        bytes = transfer.transferred_bytes,
        chunks,
    );
    Ok(transfer)
}

async fn wait_for_open(events: &mut Events) -> Result<(), FailureReason> {
    loop {
        match events.recv().await {
            Some(ChannelEvent::Open) => return Ok(()),
            Some(ChannelEvent::Closed) | None => return Err(FailureReason::ConnectionInterrupted),
            Some(_) => {}
        }
    }
}

/// Fails if a close already arrived; other pending events are discarded.
fn check_not_closed(events: &mut Events) -> Result<(), FailureReason> {
    while let Ok(event) = events.try_recv() {
        if let ChannelEvent::Closed = event {
            return Err(FailureReason::ConnectionInterrupted);
        }
    }
    Ok(())
}

async fn wait_for_buffer_space(
    channel: &dyn DataChannel,
    events: &mut Events,
) -> Result<(), FailureReason> {
    loop {
        let buffered = channel.buffered_amount().await;
        if buffered <= BUFFERED_AMOUNT_LOW_THRESHOLD {
            return Ok(());
        }
        debug!(event = "send_paused", channel = channel.label(), buffered);
        match events.recv().await {
            Some(ChannelEvent::Closed) | None => return Err(FailureReason::ConnectionInterrupted),
            Some(_) => {}
        }
    }
}

/// Fills `buf` unless the source ends first; returns the bytes read.
async fn read_chunk(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
) -> Result<usize, FailureReason> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| FailureReason::Persistence(e.to_string()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::memory::MemoryChannel;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Open channel whose buffered amount grows with every binary frame
    /// until the test drains it.
    #[derive(Debug)]
    struct ScriptedChannel {
        binary_frames: AtomicUsize,
        buffered: AtomicUsize,
        closed: AtomicBool,
        tx: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
        rx: Mutex<Option<Events>>,
    }

    impl ScriptedChannel {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                binary_frames: AtomicUsize::new(0),
                buffered: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(Some(rx)),
            })
        }

        fn push(&self, event: ChannelEvent) {
            if let Some(tx) = self.tx.lock().unwrap().as_ref() {
                let _ = tx.send(event);
            }
        }

        fn drain(&self) {
            self.buffered.store(0, Ordering::SeqCst);
            self.push(ChannelEvent::BufferedAmountLow);
        }

        fn close_from_remote(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.push(ChannelEvent::Closed);
        }

        /// Ends the event stream without a close event.
        fn end_events(&self) {
            self.tx.lock().unwrap().take();
        }

        fn frames(&self) -> usize {
            self.binary_frames.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataChannel for ScriptedChannel {
        fn label(&self) -> &str {
            "file:0"
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        async fn send_text(&self, _text: String) -> Result<()> {
            Ok(())
        }

        async fn send_binary(&self, data: Bytes) -> Result<()> {
            if !self.is_open() {
                return Err(anyhow!("closed"));
            }
            self.binary_frames.fetch_add(1, Ordering::SeqCst);
            self.buffered.fetch_add(data.len(), Ordering::SeqCst);
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn set_buffered_amount_low_threshold(&self, _threshold: usize) {}

        fn take_events(&self) -> Option<Events> {
            self.rx.lock().unwrap().take()
        }

        async fn close(&self) {
            self.close_from_remote();
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Counts frames on the far end and closes it once `size` bytes arrived.
    async fn drain_remote(remote: Arc<MemoryChannel>, size: u64) -> (usize, u64) {
        let mut events = remote.take_events().unwrap();
        let (mut chunks, mut bytes, mut saw_metadata) = (0usize, 0u64, false);
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Text(_) => saw_metadata = true,
                ChannelEvent::Binary(data) => {
                    chunks += 1;
                    bytes += data.len() as u64;
                }
                ChannelEvent::Closed => break,
                _ => {}
            }
            if saw_metadata && bytes == size {
                remote.close().await;
            }
        }
        (chunks, bytes)
    }

    #[tokio::test]
    async fn chunk_count_matches_file_size() {
        for size in [0u64, 1, 51_200, 51_201, 150_000] {
            let (local, remote) = MemoryChannel::pair("file:0", true);
            let receiver = tokio::spawn(drain_remote(remote, size));
            let source = FileSource::from_bytes("blob.bin", vec![7u8; size as usize]);
            let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

            let transfer = send_file(local, 0, &source, progress_tx).await.unwrap();
            let (chunks, bytes) = receiver.await.unwrap();

            assert_eq!(transfer.transferred_bytes, size);
            assert!(transfer.is_done());
            assert_eq!(chunks as u64, size.div_ceil(CHUNK_SIZE as u64), "size {size}");
            assert_eq!(bytes, size);
        }
    }

    #[tokio::test]
    async fn reading_pauses_until_the_buffer_drains() {
        let channel = ScriptedChannel::new();
        let size = (CHUNK_SIZE * 10) as u64;
        let source = FileSource::from_bytes("big.bin", vec![1u8; size as usize]);
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn({
            let channel = channel.clone();
            async move { send_file(channel, 0, &source, progress_tx).await }
        });

        settle().await;
        // 5 chunks fit under the threshold, the 6th pushes it over.
        assert_eq!(channel.frames(), 6);
        settle().await;
        assert_eq!(channel.frames(), 6);

        channel.drain();
        settle().await;
        assert_eq!(channel.frames(), 10);
        assert!(!task.is_finished());

        channel.close_from_remote();
        let transfer = task.await.unwrap().unwrap();
        assert_eq!(transfer.transferred_bytes, size);

        let mut last = None;
        while let Ok(p) = progress_rx.try_recv() {
            last = Some(p);
        }
        assert_eq!(last.map(|p| p.transferred_bytes), Some(size));
    }

    #[tokio::test]
    async fn close_before_the_last_chunk_is_an_interruption() {
        let channel = ScriptedChannel::new();
        let source = FileSource::from_bytes("big.bin", vec![1u8; CHUNK_SIZE * 10]);
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn({
            let channel = channel.clone();
            async move { send_file(channel, 0, &source, progress_tx).await }
        });
        settle().await;
        channel.close_from_remote();

        assert_eq!(
            task.await.unwrap(),
            Err(FailureReason::ConnectionInterrupted)
        );
    }

    #[tokio::test]
    async fn event_stream_ending_after_the_last_chunk_is_an_interruption() {
        let channel = ScriptedChannel::new();
        let source = FileSource::from_bytes("small.bin", vec![1u8; CHUNK_SIZE * 2]);
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn({
            let channel = channel.clone();
            async move { send_file(channel, 0, &source, progress_tx).await }
        });
        settle().await;
        assert_eq!(channel.frames(), 2);
        channel.end_events();

        assert_eq!(
            task.await.unwrap(),
            Err(FailureReason::ConnectionInterrupted)
        );
    }
}
