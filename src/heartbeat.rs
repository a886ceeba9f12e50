//! Liveness probing in both directions.
//!
//! The client sends a `ClientHeartbeat` every interval carrying a sequence
//! number and a millisecond timestamp relative to the manager's origin. The
//! first unanswered heartbeat arms a timeout timer; a response to the most
//! recent heartbeat disarms it. When the timer fires, the timeout token is
//! cancelled and the session tears itself down.
//!
//! Server heartbeats are answered immediately by echoing their sequence and
//! timestamp.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, Result};
use crate::executor::CallbackExecutor;
use crate::protocol::{
    write_client_heartbeat, write_server_heartbeat_response, PayloadPool, HEARTBEAT_BUFFER_SIZE,
};
use crate::writer::{OutboundMessage, WriterHandle};

/// A server answer to one of our heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHeartbeatEvent {
    /// Sequence number that was answered.
    pub sequence: i16,
    /// Time between sending the heartbeat and receiving the answer.
    pub round_trip_time: Duration,
}

/// A heartbeat initiated by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHeartbeatEvent {
    pub sequence: i16,
    /// Server clock in milliseconds, if it sent one.
    pub server_time_ms: Option<i64>,
    /// Encoded metadata value, or empty.
    pub metadata: Bytes,
}

pub type ClientHeartbeatCallback = Arc<dyn Fn(ClientHeartbeatEvent) + Send + Sync>;
pub type ServerHeartbeatCallback = Arc<dyn Fn(ServerHeartbeatEvent) + Send + Sync>;

/// Optional user callbacks for heartbeat events.
#[derive(Clone, Default)]
pub struct HeartbeatCallbacks {
    pub on_client_heartbeat_response: Option<ClientHeartbeatCallback>,
    pub on_server_heartbeat: Option<ServerHeartbeatCallback>,
}

struct State {
    /// Sequence of the next client heartbeat.
    sequence: i16,
    /// Sequence of the most recent client heartbeat sent.
    last_sent: Option<i16>,
    /// Armed timeout timer.
    timer: Option<JoinHandle<()>>,
    disposed: bool,
}

/// Drives both heartbeat directions for one session.
pub struct HeartbeatManager {
    interval: Option<Duration>,
    timeout: Option<Duration>,
    origin: Instant,
    state: Mutex<State>,
    writer: WriterHandle,
    timed_out: CancellationToken,
    shutdown: CancellationToken,
    callbacks: HeartbeatCallbacks,
    executor: Arc<dyn CallbackExecutor>,
}

impl HeartbeatManager {
    /// Create a manager. A `None` or zero interval disables client heartbeats;
    /// a `None` timeout disables the timer.
    pub fn new(
        interval: Option<Duration>,
        timeout: Option<Duration>,
        writer: WriterHandle,
        shutdown: CancellationToken,
        callbacks: HeartbeatCallbacks,
        executor: Arc<dyn CallbackExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            interval: interval.filter(|d| !d.is_zero()),
            timeout,
            origin: Instant::now(),
            state: Mutex::new(State {
                sequence: 0,
                last_sent: None,
                timer: None,
                disposed: false,
            }),
            writer,
            timed_out: CancellationToken::new(),
            shutdown,
            callbacks,
            executor,
        })
    }

    /// Cancelled when a client heartbeat goes unanswered past the timeout.
    pub fn timeout_token(&self) -> CancellationToken {
        self.timed_out.clone()
    }

    /// Spawn the client heartbeat loop, if client heartbeats are enabled.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.interval?;
        let manager = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match manager.send_client_heartbeat() {
                    Ok(()) => {}
                    Err(HubError::Disconnected(_)) => break,
                    Err(e) => tracing::warn!(error = %e, "failed to send client heartbeat"),
                }
            }
            tracing::debug!("client heartbeat loop stopped");
        }))
    }

    fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    /// Send one client heartbeat and arm the timeout timer if none is running.
    pub fn send_client_heartbeat(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed {
            return Ok(());
        }

        let sequence = state.sequence;
        let mut scratch = [0u8; HEARTBEAT_BUFFER_SIZE];
        let len = write_client_heartbeat(&mut scratch, sequence, self.elapsed_ms())?;
        let payload = PayloadPool::shared().rent_or_create(&scratch[..len]);
        // A full queue still arms the timer: a stalled transport must time out.
        match self.writer.try_send(OutboundMessage::new(payload)?) {
            Ok(()) => tracing::trace!(sequence, "client heartbeat sent"),
            Err(e @ HubError::Disconnected(_)) => return Err(e),
            Err(e) => tracing::warn!(sequence, error = %e, "client heartbeat not queued"),
        }

        state.last_sent = Some(sequence);
        if state.timer.is_none() {
            if let Some(timeout) = self.timeout {
                state.timer = Some(self.arm_timer(timeout));
            }
        }
        state.sequence = sequence.wrapping_add(1);
        Ok(())
    }

    fn arm_timer(&self, timeout: Duration) -> JoinHandle<()> {
        let timed_out = self.timed_out.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!(?timeout, "client heartbeat timed out");
                    timed_out.cancel();
                }
            }
        })
    }

    /// Handle a `ClientHeartbeatResponse`.
    ///
    /// Only an answer to the most recent heartbeat disarms the timer and
    /// reports a round trip; older answers are ignored.
    pub fn on_client_heartbeat_response(&self, sequence: i16, sent_at: Option<i64>) {
        {
            let mut state = self.state.lock();
            if state.last_sent != Some(sequence) {
                tracing::debug!(
                    sequence,
                    last_sent = ?state.last_sent,
                    "stale client heartbeat response"
                );
                return;
            }
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }

        let Some(sent_at) = sent_at else {
            return;
        };
        let round_trip_time =
            Duration::from_millis(u64::try_from(self.elapsed_ms().saturating_sub(sent_at)).unwrap_or(0));
        tracing::trace!(sequence, ?round_trip_time, "client heartbeat answered");

        if let Some(callback) = &self.callbacks.on_client_heartbeat_response {
            let callback = Arc::clone(callback);
            self.executor.execute(Box::new(move || {
                callback(ClientHeartbeatEvent {
                    sequence,
                    round_trip_time,
                })
            }));
        }
    }

    /// Handle a `ServerHeartbeat`: notify, then echo it back.
    pub fn on_server_heartbeat(
        &self,
        sequence: i16,
        server_sent_at: Option<i64>,
        metadata: &[u8],
    ) -> Result<()> {
        if let Some(callback) = &self.callbacks.on_server_heartbeat {
            let callback = Arc::clone(callback);
            let event = ServerHeartbeatEvent {
                sequence,
                server_time_ms: server_sent_at,
                metadata: Bytes::copy_from_slice(metadata),
            };
            self.executor.execute(Box::new(move || callback(event)));
        }

        let mut scratch = [0u8; HEARTBEAT_BUFFER_SIZE];
        let len = write_server_heartbeat_response(&mut scratch, sequence, server_sent_at)?;
        let payload = PayloadPool::shared().rent_or_create(&scratch[..len]);
        self.writer.try_send(OutboundMessage::new(payload)?)?;
        tracing::trace!(sequence, "server heartbeat answered");
        Ok(())
    }

    /// Stop sending heartbeats and disarm the timer.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}
