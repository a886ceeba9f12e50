//! Dedicated writer task: the single consumer of the outbound message queue.
//!
//! Every producer (calls, heartbeats, client-result responses) enqueues
//! encoded messages through a cloneable [`WriterHandle`]; one task drains the
//! queue in FIFO order and batches ready messages into vectored writes.
//!
//! # Architecture
//!
//! ```text
//! call / call_void ─┐
//! heartbeat loop   ─┼─► mpsc::Sender<OutboundMessage> ─► Writer Task ─► stream
//! client results   ─┘
//! ```
//!
//! When the session is disposed, the task writes whatever is already queued
//! within the backpressure timeout, then shuts the write half down. When the
//! session failed, queued messages are discarded and a blocked write is
//! abandoned.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DisconnectionReason, HubError, Result};
use crate::protocol::Payload;
use crate::transport::{Prefix, PREFIX_SIZE};

/// Default maximum pending messages before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum messages to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A framed message ready to be written to the stream.
#[derive(Debug)]
pub struct OutboundMessage {
    /// Pre-encoded length prefix.
    pub prefix: [u8; PREFIX_SIZE],
    /// Encoded hub message.
    pub payload: Payload,
}

impl OutboundMessage {
    /// Frame an encoded message.
    pub fn new(payload: Payload) -> Result<Self> {
        Ok(Self {
            prefix: Prefix::for_len(payload.len())?.encode(),
            payload,
        })
    }

    /// Total size on the wire (prefix + message).
    #[inline]
    pub fn size(&self) -> usize {
        PREFIX_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Maximum pending messages before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the message queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear, and for the final
    /// flush after dispose.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for enqueueing messages. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundMessage>,
    /// Pending message count (for backpressure).
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
    /// Set once the session is closed; used to report why sends fail.
    closed: watch::Receiver<Option<DisconnectionReason>>,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundMessage>,
        pending: Arc<AtomicUsize>,
        config: &WriterConfig,
        closed: watch::Receiver<Option<DisconnectionReason>>,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending: config.max_pending_frames,
            timeout: config.backpressure_timeout,
            closed,
        }
    }

    /// Enqueue a message, waiting while backpressure is active.
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        if let Some(reason) = self.closed_reason() {
            return Err(HubError::Disconnected(reason));
        }

        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        // Count before sending so the writer never decrements below zero.
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(message).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            self.closed_error()
        })
    }

    /// Enqueue a message without waiting.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, message: OutboundMessage) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(HubError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(message).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => HubError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => self.closed_error(),
            }
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(HubError::BackpressureTimeout);
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Current pending message count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Why the session closed, if it has.
    pub fn closed_reason(&self) -> Option<DisconnectionReason> {
        self.closed.borrow().clone()
    }

    /// The error reported to senders once the queue is gone.
    pub fn closed_error(&self) -> HubError {
        HubError::Disconnected(
            self.closed_reason()
                .unwrap_or_else(|| DisconnectionReason::Faulted("write queue closed".to_string())),
        )
    }
}

/// Spawn the writer task and return a handle for enqueueing messages.
///
/// The task exits when `shutdown` is cancelled or when every handle is
/// dropped. A write blocked on the stream is abandoned at shutdown. What is
/// still queued is flushed only when the session was disposed or dropped its
/// handles, and that flush is bounded by the backpressure timeout.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
    shutdown: CancellationToken,
    closed: watch::Receiver<Option<DisconnectionReason>>,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));
    let flush_timeout = config.backpressure_timeout;
    let handle = WriterHandle::new(tx, pending.clone(), &config, closed.clone());
    let task = tokio::spawn(writer_loop(
        rx,
        writer,
        pending,
        shutdown,
        closed,
        flush_timeout,
    ));
    (handle, task)
}

/// Batch being written and how many of its bytes already reached the stream.
struct InFlight {
    batch: Vec<OutboundMessage>,
    written: usize,
}

impl InFlight {
    async fn write<W>(&mut self, writer: &mut W, pending: &AtomicUsize) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_batch(writer, &self.batch, &mut self.written).await?;
        pending.fetch_sub(self.batch.len(), Ordering::Release);
        self.batch.clear();
        self.written = 0;
        Ok(())
    }
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    closed: watch::Receiver<Option<DisconnectionReason>>,
    flush_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut in_flight = InFlight {
        batch: Vec::with_capacity(MAX_BATCH_SIZE),
        written: 0,
    };

    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(m) => m,
                None => break,
            },
        };

        in_flight.batch.push(first);
        while in_flight.batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(message) => in_flight.batch.push(message),
                Err(_) => break,
            }
        }

        tokio::select! {
            biased;
            result = in_flight.write(&mut writer, &pending) => result?,
            _ = shutdown.cancelled() => break,
        }
    }

    rx.close();
    let failed = matches!(
        *closed.borrow(),
        Some(DisconnectionReason::TimedOut | DisconnectionReason::Faulted(_))
    );
    if failed {
        let dropped = discard(&mut in_flight, &mut rx, &pending);
        tracing::debug!(dropped, "session failed, discarding queued messages");
        return Ok(());
    }

    let flush = async {
        in_flight.write(&mut writer, &pending).await?;
        while let Ok(message) = rx.try_recv() {
            in_flight.batch.push(message);
            if in_flight.batch.len() == MAX_BATCH_SIZE {
                in_flight.write(&mut writer, &pending).await?;
            }
        }
        in_flight.write(&mut writer, &pending).await?;
        tracing::debug!("writer task finished, shutting down write half");
        writer.shutdown().await?;
        Ok::<_, HubError>(())
    };
    let flushed = tokio::time::timeout(flush_timeout, flush).await;
    match flushed {
        Ok(result) => result,
        Err(_) => {
            let dropped = discard(&mut in_flight, &mut rx, &pending);
            tracing::warn!(
                ?flush_timeout,
                dropped,
                "write side did not drain, dropping queued messages"
            );
            Ok(())
        }
    }
}

/// Drop every unwritten message and release its backpressure slot.
fn discard(
    in_flight: &mut InFlight,
    rx: &mut mpsc::Receiver<OutboundMessage>,
    pending: &AtomicUsize,
) -> usize {
    let mut dropped = in_flight.batch.len();
    in_flight.batch.clear();
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    pending.fetch_sub(dropped, Ordering::Release);
    dropped
}

/// Write a batch of messages using scatter/gather I/O (write_vectored),
/// resuming after the `written` bytes already on the stream.
async fn write_batch<W>(
    writer: &mut W,
    batch: &[OutboundMessage],
    written: &mut usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(OutboundMessage::size).sum();

    while *written < total_size {
        let slices = build_remaining_slices(batch, *written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(HubError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        *written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundMessage], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for message in batch {
        for part in [&message.prefix[..], &message.payload[..]] {
            let end = offset + part.len();
            if skip_bytes < end && !part.is_empty() {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}

/// A handle wired to a bare receiver, for exercising producers in tests.
#[cfg(test)]
pub(crate) fn test_handle(
    config: &WriterConfig,
) -> (
    WriterHandle,
    mpsc::Receiver<OutboundMessage>,
    watch::Sender<Option<DisconnectionReason>>,
) {
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let (closed_tx, closed_rx) = watch::channel(None);
    let handle = WriterHandle::new(tx, Arc::new(AtomicUsize::new(0)), config, closed_rx);
    (handle, rx, closed_tx)
}
