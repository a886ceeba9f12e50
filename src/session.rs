//! Session builder and runtime loop.
//!
//! The [`HubSessionBuilder`] collects the codec, configuration, heartbeat
//! callbacks and client-result handlers. Connecting spawns:
//! 1. The writer task draining the outbound queue
//! 2. The client heartbeat loop (when an interval is configured)
//! 3. The session task, which runs the read loop and owns teardown
//!
//! The session task ends on the first of: local dispose, heartbeat timeout,
//! end of the inbound stream, a transport or protocol error, or writer
//! failure. Teardown records the [`DisconnectionReason`], fails every pending
//! call with it and stops the writer. A disposed session flushes its queue
//! within the backpressure timeout; a failed one discards it.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use streaminghub_client::HubSession;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:5000").await?;
//!     let (session, mut broadcasts) = HubSession::builder()
//!         .heartbeat_interval(Duration::from_secs(5))
//!         .heartbeat_timeout(Duration::from_secs(15))
//!         .on_client_result(10, |n: i32, _ctx| async move { Ok(n * 2) })
//!         .connect(stream)?;
//!
//!     session.call_void(1, &("lobby",)).await?;
//!     let count: u32 = session.call(2, &()).await?;
//!
//!     while let Some(broadcast) = broadcasts.recv().await {
//!         let text: String = broadcast.decode(session.codec())?;
//!         println!("{}: {text}", broadcast.method_id);
//!     }
//!     Ok(())
//! }
//! ```

use std::any::type_name;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::{HubCodec, MsgPackCodec};
use crate::config::HubConfig;
use crate::correlator::ResponseCorrelator;
use crate::error::{DisconnectionReason, HubError, RemoteError, Result};
use crate::executor::{CallbackExecutor, InlineExecutor};
use crate::handler::{ClientResultContext, ClientResultDispatcher, ClientResultRegistry};
use crate::heartbeat::{
    ClientHeartbeatEvent, HeartbeatCallbacks, HeartbeatManager, ServerHeartbeatEvent,
};
use crate::protocol::{
    decode_server_message, encode_request_fire_and_forget, HubMessage, MessageBody, Payload,
    PayloadPool,
};
use crate::transport::FrameBuffer;
use crate::writer::{spawn_writer_task, OutboundMessage, WriterHandle};

/// Size of the socket read buffer.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Builder for configuring and connecting a hub session.
pub struct HubSessionBuilder<C: HubCodec = MsgPackCodec> {
    codec: C,
    config: HubConfig,
    callbacks: HeartbeatCallbacks,
    executor: Arc<dyn CallbackExecutor>,
    client_results: ClientResultRegistry<C>,
}

impl HubSessionBuilder {
    /// Create a builder using the MessagePack codec.
    pub fn new() -> Self {
        Self::with_codec(MsgPackCodec::default())
    }
}

impl Default for HubSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: HubCodec> HubSessionBuilder<C> {
    /// Create a builder using `codec` for every body.
    pub fn with_codec(codec: C) -> Self {
        Self {
            codec,
            config: HubConfig::default(),
            callbacks: HeartbeatCallbacks::default(),
            executor: Arc::new(InlineExecutor),
            client_results: ClientResultRegistry::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// Send a client heartbeat every `interval`.
    ///
    /// Default: disabled
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = Some(interval);
        self
    }

    /// Disconnect when a client heartbeat is not answered within `timeout`.
    ///
    /// Default: disabled
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.config.heartbeat_timeout = Some(timeout);
        self
    }

    /// Called with the round-trip time of each answered client heartbeat.
    pub fn on_client_heartbeat_response<F>(mut self, callback: F) -> Self
    where
        F: Fn(ClientHeartbeatEvent) + Send + Sync + 'static,
    {
        self.callbacks.on_client_heartbeat_response = Some(Arc::new(callback));
        self
    }

    /// Called for each server heartbeat before it is answered.
    pub fn on_server_heartbeat<F>(mut self, callback: F) -> Self
    where
        F: Fn(ServerHeartbeatEvent) + Send + Sync + 'static,
    {
        self.callbacks.on_server_heartbeat = Some(Arc::new(callback));
        self
    }

    /// Run heartbeat callbacks through `executor` instead of inline.
    pub fn executor<E: CallbackExecutor>(mut self, executor: E) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Register a handler for server-initiated calls to `method_id`.
    ///
    /// The handler receives the decoded arguments and returns the result
    /// sent back to the server.
    pub fn on_client_result<F, T, R, Fut>(mut self, method_id: i32, handler: F) -> Self
    where
        F: Fn(T, ClientResultContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.client_results.register(method_id, handler);
        self
    }

    /// Set the maximum number of concurrently running client-result handlers.
    ///
    /// Requests beyond the limit are answered with `RESOURCE_EXHAUSTED`.
    /// Default: 256
    pub fn max_concurrent_client_results(mut self, limit: usize) -> Self {
        self.config.max_concurrent_client_results = limit;
        self
    }

    /// Set the maximum pending messages for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout. It also bounds the final flush on dispose.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Set the largest inbound message accepted.
    ///
    /// Default: 4 MiB
    pub fn max_message_size(mut self, size: u32) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Start a session over a duplex stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect<S>(self, stream: S) -> Result<(HubSession<C>, Broadcasts)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.connect_split(reader, writer)
    }

    /// Start a session over separate read and write halves.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect_split<R, W>(self, reader: R, writer: W) -> Result<(HubSession<C>, Broadcasts)>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.config.validate()?;
        let config = self.config;

        let shutdown = CancellationToken::new();
        let (closed_tx, closed_rx) = watch::channel(None);
        let (writer, writer_task) = spawn_writer_task(
            writer,
            config.writer.clone(),
            shutdown.clone(),
            closed_rx.clone(),
        );

        let correlator = Arc::new(ResponseCorrelator::new());
        let heartbeat = HeartbeatManager::new(
            config.heartbeat_interval,
            config.heartbeat_timeout,
            writer.clone(),
            shutdown.clone(),
            self.callbacks,
            self.executor,
        );
        let dispatcher = ClientResultDispatcher::new(
            self.client_results,
            self.codec.clone(),
            writer.clone(),
            config.max_concurrent_client_results,
            shutdown.clone(),
        );
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();

        let inbound = Inbound {
            correlator: Arc::clone(&correlator),
            heartbeat: Arc::clone(&heartbeat),
            dispatcher,
            broadcasts: broadcast_tx,
        };
        let heartbeat_task = heartbeat.start();
        let task = tokio::spawn(run_session(
            reader,
            config.max_message_size,
            inbound,
            SessionTasks {
                writer: writer_task,
                heartbeat: heartbeat_task,
            },
            shutdown.clone(),
            heartbeat.timeout_token(),
            closed_tx,
        ));

        tracing::debug!(
            heartbeat_interval = ?config.heartbeat_interval,
            heartbeat_timeout = ?config.heartbeat_timeout,
            "hub session started"
        );

        let session = HubSession {
            codec: self.codec,
            writer,
            correlator,
            closed: closed_rx,
            shutdown,
            task: Mutex::new(Some(task)),
        };
        Ok((session, Broadcasts { rx: broadcast_rx }))
    }
}

/// A connected hub session.
///
/// Dropping the session disposes it in the background.
pub struct HubSession<C: HubCodec = MsgPackCodec> {
    codec: C,
    writer: WriterHandle,
    correlator: Arc<ResponseCorrelator>,
    closed: watch::Receiver<Option<DisconnectionReason>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<DisconnectionReason>>>,
}

impl HubSession {
    /// Create a session builder using the MessagePack codec.
    pub fn builder() -> HubSessionBuilder {
        HubSessionBuilder::new()
    }
}

impl<C: HubCodec> HubSession<C> {
    fn ensure_connected(&self) -> Result<()> {
        match self.disconnection_reason() {
            Some(reason) => Err(HubError::Disconnected(reason)),
            None => Ok(()),
        }
    }

    /// Invoke a server method without waiting for a result.
    pub async fn call_void<A>(&self, method_id: i32, args: &A) -> Result<()>
    where
        A: Serialize + ?Sized,
    {
        self.ensure_connected()?;
        let mut payload = PayloadPool::shared().rent();
        encode_request_fire_and_forget(payload.as_mut_vec(), method_id, args, &self.codec)?;
        self.writer.send(OutboundMessage::new(payload)?).await
    }

    /// Invoke a server method and wait for its result.
    pub async fn call<A, R>(&self, method_id: i32, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .correlator
            .send_and_await(&self.writer, &self.codec, method_id, args, type_name::<R>())
            .await?;
        response.await?.decode(&self.codec)
    }

    /// Like [`call`](Self::call), giving up with [`HubError::Cancelled`] when
    /// `token` fires. A late response is then ignored.
    pub async fn call_with_cancellation<A, R>(
        &self,
        method_id: i32,
        args: &A,
        token: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if token.is_cancelled() {
            return Err(HubError::Cancelled);
        }

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(HubError::Cancelled),
            sent = self.correlator.send_and_await(
                &self.writer,
                &self.codec,
                method_id,
                args,
                type_name::<R>(),
            ) => sent?,
        };
        let body = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(HubError::Cancelled),
            body = response => body?,
        };
        body.decode(&self.codec)
    }

    /// Close the session and wait until teardown has finished.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    tracing::error!(error = %e, "session task failed");
                }
            }
            None => {
                self.wait_for_disconnect().await;
            }
        }
    }

    /// Wait until the session has closed and report why.
    pub async fn wait_for_disconnect(&self) -> DisconnectionReason {
        let mut closed = self.closed.clone();
        let reason = match closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or_else(|| DisconnectionReason::Faulted("session task ended".to_string()))
    }

    /// Why the session closed, or `None` while it is connected.
    pub fn disconnection_reason(&self) -> Option<DisconnectionReason> {
        self.closed.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.closed.borrow().is_none()
    }

    /// Calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.correlator.pending_count()
    }

    /// The codec bodies are encoded with.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Get the current backpressure status.
    pub fn is_backpressure_active(&self) -> bool {
        self.writer.is_backpressure_active()
    }
}

impl<C: HubCodec> Drop for HubSession<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A server broadcast.
#[derive(Debug)]
pub struct Broadcast {
    pub method_id: i32,
    body: MessageBody,
}

impl Broadcast {
    /// The encoded body.
    pub fn body(&self) -> &[u8] {
        self.body.as_bytes()
    }

    /// Decode the body with the session's codec.
    pub fn decode<T: DeserializeOwned, C: HubCodec>(&self, codec: &C) -> Result<T> {
        self.body.decode(codec)
    }
}

/// Stream of server broadcasts, in arrival order.
///
/// Broadcasts arriving after this is dropped are discarded.
pub struct Broadcasts {
    rx: mpsc::UnboundedReceiver<Broadcast>,
}

impl Broadcasts {
    /// Next broadcast, or `None` once the session has closed.
    pub async fn recv(&mut self) -> Option<Broadcast> {
        self.rx.recv().await
    }

    /// Next broadcast if one is already queued.
    pub fn try_recv(&mut self) -> Option<Broadcast> {
        self.rx.try_recv().ok()
    }
}

/// What the read loop does with a message once its borrow of the payload ends.
enum Route {
    Response { message_id: i32, method_id: i32 },
    ResponseError { message_id: i32, error: RemoteError },
    Broadcast { method_id: i32 },
    ClientResult { request_id: Uuid, method_id: i32 },
    Handled,
}

/// Receivers of inbound messages.
struct Inbound<C: HubCodec> {
    correlator: Arc<ResponseCorrelator>,
    heartbeat: Arc<HeartbeatManager>,
    dispatcher: ClientResultDispatcher<C>,
    broadcasts: mpsc::UnboundedSender<Broadcast>,
}

impl<C: HubCodec> Inbound<C> {
    fn route(&self, payload: Payload) -> Result<()> {
        let (route, body_len) = match decode_server_message(&payload)? {
            HubMessage::Response {
                message_id,
                method_id,
                body,
            } => (
                Route::Response {
                    message_id,
                    method_id,
                },
                body.len(),
            ),
            HubMessage::ResponseWithError {
                message_id,
                status_code,
                detail,
                message,
            } => {
                let error = RemoteError {
                    status_code,
                    detail: detail.unwrap_or_default().to_string(),
                    message: message.map(str::to_string),
                };
                (Route::ResponseError { message_id, error }, 0)
            }
            HubMessage::Broadcast { method_id, body } => (Route::Broadcast { method_id }, body.len()),
            HubMessage::ClientResultRequest {
                request_id,
                method_id,
                body,
            } => (
                Route::ClientResult {
                    request_id,
                    method_id,
                },
                body.len(),
            ),
            HubMessage::ClientHeartbeatResponse {
                sequence, sent_at, ..
            } => {
                self.heartbeat.on_client_heartbeat_response(sequence, sent_at);
                (Route::Handled, 0)
            }
            HubMessage::ServerHeartbeat {
                sequence,
                sent_at,
                metadata,
            } => {
                if let Err(e) = self.heartbeat.on_server_heartbeat(sequence, sent_at, metadata) {
                    tracing::warn!(sequence, error = %e, "failed to answer server heartbeat");
                }
                (Route::Handled, 0)
            }
            other => {
                return Err(HubError::Protocol(format!(
                    "unexpected {:?} from server",
                    other.message_type()
                )))
            }
        };

        match route {
            Route::Response {
                message_id,
                method_id,
            } => {
                self.correlator
                    .on_response(message_id, method_id, MessageBody::tail(payload, body_len));
            }
            Route::ResponseError { message_id, error } => {
                self.correlator.on_response_error(message_id, error);
            }
            Route::Broadcast { method_id } => {
                let broadcast = Broadcast {
                    method_id,
                    body: MessageBody::tail(payload, body_len),
                };
                if self.broadcasts.send(broadcast).is_err() {
                    tracing::trace!(method_id, "broadcast dropped, no receiver");
                }
            }
            Route::ClientResult {
                request_id,
                method_id,
            } => {
                tracing::trace!(%request_id, method_id, "client result request");
                self.dispatcher
                    .dispatch(request_id, method_id, MessageBody::tail(payload, body_len));
            }
            Route::Handled => {}
        }
        Ok(())
    }
}

/// Tasks the session task joins during teardown.
struct SessionTasks {
    writer: JoinHandle<Result<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

/// Read frames until the stream ends and route each message.
async fn read_loop<R, C>(mut reader: R, max_message_size: u32, inbound: &Inbound<C>) -> Result<()>
where
    R: AsyncRead + Unpin,
    C: HubCodec,
{
    let mut frames = FrameBuffer::with_max_message_size(max_message_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if !frames.is_empty() {
                return Err(HubError::Protocol(format!(
                    "stream ended inside a message ({} bytes buffered)",
                    frames.len()
                )));
            }
            return Ok(());
        }

        for payload in frames.push(&buf[..n])? {
            inbound.route(payload)?;
        }
    }
}

async fn run_session<R, C>(
    reader: R,
    max_message_size: u32,
    inbound: Inbound<C>,
    mut tasks: SessionTasks,
    shutdown: CancellationToken,
    timed_out: CancellationToken,
    closed: watch::Sender<Option<DisconnectionReason>>,
) -> DisconnectionReason
where
    R: AsyncRead + Unpin + Send + 'static,
    C: HubCodec,
{
    let mut writer_done = false;

    let reason = tokio::select! {
        biased;
        _ = shutdown.cancelled() => DisconnectionReason::Disposed,
        _ = timed_out.cancelled() => DisconnectionReason::TimedOut,
        result = read_loop(reader, max_message_size, &inbound) => match result {
            Ok(()) => DisconnectionReason::CompletedNormally,
            Err(e) => {
                tracing::error!(error = %e, "read loop failed");
                DisconnectionReason::Faulted(e.to_string())
            }
        },
        result = &mut tasks.writer => {
            writer_done = true;
            match result {
                Ok(Ok(())) => DisconnectionReason::Faulted("writer stopped".to_string()),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "writer task failed");
                    DisconnectionReason::Faulted(e.to_string())
                }
                Err(e) => DisconnectionReason::Faulted(e.to_string()),
            }
        },
    };

    tracing::debug!(%reason, "hub session closing");
    inbound.heartbeat.dispose();
    let _ = closed.send(Some(reason.clone()));
    inbound.correlator.fail_all_pending(reason.clone());
    shutdown.cancel();

    if !writer_done {
        match tasks.writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "write side closed with error"),
            Err(e) => tracing::error!(error = %e, "writer task panicked"),
        }
    }
    if let Some(heartbeat) = tasks.heartbeat {
        let _ = heartbeat.await;
    }

    tracing::debug!(%reason, "hub session closed");
    reason
}
