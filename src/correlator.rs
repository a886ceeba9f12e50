//! Matching of asynchronous responses to pending requests.
//!
//! Each request-response call gets a fresh `MessageId` and an entry in the
//! pending table. The read loop resolves entries as `Response` or
//! `ResponseWithError` messages arrive; session teardown fails whatever is
//! left. An entry is removed under the lock before it is resolved, so every
//! call completes exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::codec::HubCodec;
use crate::error::{DisconnectionReason, HubError, RemoteError, Result};
use crate::protocol::{encode_request, MessageBody, PayloadPool};
use crate::writer::{OutboundMessage, WriterHandle};

type Completion = oneshot::Sender<Result<MessageBody>>;

struct PendingCall {
    completion: Completion,
    method_id: i32,
    response_type: &'static str,
}

struct Inner {
    pending: HashMap<i32, PendingCall>,
    next_message_id: i32,
    /// Set by `fail_all_pending`; later registrations fail with it.
    closed: Option<DisconnectionReason>,
}

/// Pending-call table shared by callers and the read loop.
pub struct ResponseCorrelator {
    inner: Mutex<Inner>,
}

impl ResponseCorrelator {
    /// Create an empty correlator. The first `MessageId` is 1.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                next_message_id: 1,
                closed: None,
            }),
        }
    }

    /// Allocate a `MessageId` and register a pending entry for it.
    ///
    /// Ids wrap around `i32` and skip any id that is still pending.
    pub fn register(
        &self,
        method_id: i32,
        response_type: &'static str,
    ) -> Result<(i32, oneshot::Receiver<Result<MessageBody>>)> {
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.closed {
            return Err(HubError::Disconnected(reason.clone()));
        }

        let mut message_id = inner.next_message_id;
        while inner.pending.contains_key(&message_id) {
            message_id = message_id.wrapping_add(1);
        }
        inner.next_message_id = message_id.wrapping_add(1);

        let (completion, rx) = oneshot::channel();
        inner.pending.insert(
            message_id,
            PendingCall {
                completion,
                method_id,
                response_type,
            },
        );
        tracing::trace!(message_id, method_id, response_type, "registered pending call");
        Ok((message_id, rx))
    }

    /// Register, encode and enqueue a `Request`, returning the pending response.
    pub async fn send_and_await<C, A>(
        self: &Arc<Self>,
        writer: &WriterHandle,
        codec: &C,
        method_id: i32,
        args: &A,
        response_type: &'static str,
    ) -> Result<ResponseFuture>
    where
        C: HubCodec,
        A: Serialize + ?Sized,
    {
        let (message_id, rx) = self.register(method_id, response_type)?;
        // Dropping the future on any error below removes the entry again.
        let future = ResponseFuture {
            message_id,
            rx,
            correlator: Arc::clone(self),
            done: false,
        };

        let mut payload = PayloadPool::shared().rent();
        encode_request(payload.as_mut_vec(), message_id, method_id, args, codec)?;
        writer.send(OutboundMessage::new(payload)?).await?;
        Ok(future)
    }

    /// Resolve a pending call with its result body.
    ///
    /// Returns false when no call is pending under `message_id`.
    pub fn on_response(&self, message_id: i32, method_id: i32, body: MessageBody) -> bool {
        let Some(call) = self.inner.lock().pending.remove(&message_id) else {
            tracing::trace!(message_id, method_id, "response for unknown message id dropped");
            return false;
        };
        if call.method_id != method_id {
            tracing::debug!(
                message_id,
                expected = call.method_id,
                received = method_id,
                "response method id does not match request"
            );
        }
        let _ = call.completion.send(Ok(body));
        true
    }

    /// Fail a pending call with the server's error.
    ///
    /// Returns false when no call is pending under `message_id`.
    pub fn on_response_error(&self, message_id: i32, error: RemoteError) -> bool {
        let Some(call) = self.inner.lock().pending.remove(&message_id) else {
            tracing::trace!(message_id, "error response for unknown message id dropped");
            return false;
        };
        tracing::debug!(
            message_id,
            method_id = call.method_id,
            status_code = error.status_code,
            "call failed remotely"
        );
        let _ = call.completion.send(Err(HubError::Remote(error)));
        true
    }

    /// Fail every pending call and refuse new registrations.
    pub fn fail_all_pending(&self, reason: DisconnectionReason) {
        let drained: Vec<PendingCall> = {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.clone());
            }
            inner.pending.drain().map(|(_, call)| call).collect()
        };

        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), %reason, "failing pending calls");
        }
        for call in drained {
            tracing::trace!(
                method_id = call.method_id,
                response_type = call.response_type,
                "pending call failed by disconnect"
            );
            let _ = call
                .completion
                .send(Err(HubError::Disconnected(reason.clone())));
        }
    }

    /// Forget a pending call. Returns false if it already completed.
    pub fn cancel(&self, message_id: i32) -> bool {
        self.inner.lock().pending.remove(&message_id).is_some()
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl Default for ResponseCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

/// The pending response of one request.
///
/// Resolves to the raw result body. Dropping it before completion removes
/// the pending entry, so a late response is ignored.
pub struct ResponseFuture {
    message_id: i32,
    rx: oneshot::Receiver<Result<MessageBody>>,
    correlator: Arc<ResponseCorrelator>,
    done: bool,
}

impl ResponseFuture {
    /// The `MessageId` of the request.
    pub fn message_id(&self) -> i32 {
        self.message_id
    }
}

impl Future for ResponseFuture {
    type Output = Result<MessageBody>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            // Entry was removed without being resolved.
            Poll::Ready(Err(_)) => Err(HubError::Cancelled),
        };
        self.done = true;
        Poll::Ready(result)
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.done && self.correlator.cancel(self.message_id) {
            tracing::trace!(message_id = self.message_id, "pending call cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::protocol::{decode_client_message, HubMessage};
    use crate::writer::{test_handle, WriterConfig};

    fn body(bytes: &[u8]) -> MessageBody {
        MessageBody::tail(PayloadPool::shared().rent_or_create(bytes), bytes.len())
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let correlator = ResponseCorrelator::new();
        let (a, _ra) = correlator.register(1, "()").unwrap();
        let (b, _rb) = correlator.register(1, "()").unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(correlator.pending_count(), 2);
    }

    #[test]
    fn test_id_wraps_and_skips_pending() {
        let correlator = ResponseCorrelator::new();
        let (first, _r1) = correlator.register(1, "()").unwrap();
        assert_eq!(first, 1);

        correlator.inner.lock().next_message_id = i32::MAX;
        let (max, _r2) = correlator.register(1, "()").unwrap();
        let (min, _r3) = correlator.register(1, "()").unwrap();
        assert_eq!(max, i32::MAX);
        assert_eq!(min, i32::MIN);

        // 1 is still pending, so allocation jumps over it.
        correlator.inner.lock().next_message_id = 1;
        let (next, _r4) = correlator.register(1, "()").unwrap();
        assert_eq!(next, 2);
    }

    #[tokio::test]
    async fn test_response_resolves_matching_call() {
        let correlator = Arc::new(ResponseCorrelator::new());
        let (id, rx) = correlator.register(5, "String").unwrap();

        assert!(correlator.on_response(id, 5, body(&[0xa2, b'o', b'k'])));
        let resolved = rx.await.unwrap().unwrap();
        assert_eq!(resolved.as_bytes(), &[0xa2, b'o', b'k']);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_unknown_id_is_ignored() {
        let correlator = ResponseCorrelator::new();
        let (_id, _rx) = correlator.register(5, "()").unwrap();

        assert!(!correlator.on_response(999, 5, body(&[0xc0])));
        assert!(!correlator.on_response_error(999, RemoteError::new(13, "x")));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_second_resolution_is_noop() {
        let correlator = ResponseCorrelator::new();
        let (id, rx) = correlator.register(5, "()").unwrap();

        assert!(correlator.on_response(id, 5, body(&[0x01])));
        assert!(!correlator.on_response_error(id, RemoteError::new(13, "late")));
        assert_eq!(rx.await.unwrap().unwrap().as_bytes(), &[0x01]);
    }

    #[tokio::test]
    async fn test_error_response() {
        let correlator = ResponseCorrelator::new();
        let (id, rx) = correlator.register(5, "()").unwrap();

        let remote = RemoteError {
            status_code: 5,
            detail: "not found".into(),
            message: Some("trace".into()),
        };
        assert!(correlator.on_response_error(id, remote.clone()));
        match rx.await.unwrap() {
            Err(HubError::Remote(e)) => assert_eq!(e, remote),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_all_pending_and_refuse_new() {
        let correlator = ResponseCorrelator::new();
        let receivers: Vec<_> = (0..3)
            .map(|_| correlator.register(1, "()").unwrap().1)
            .collect();

        correlator.fail_all_pending(DisconnectionReason::TimedOut);
        for rx in receivers {
            assert!(matches!(
                rx.await.unwrap(),
                Err(HubError::Disconnected(DisconnectionReason::TimedOut))
            ));
        }

        assert!(matches!(
            correlator.register(1, "()"),
            Err(HubError::Disconnected(DisconnectionReason::TimedOut))
        ));
    }

    #[tokio::test]
    async fn test_send_and_await_enqueues_request() {
        let correlator = Arc::new(ResponseCorrelator::new());
        let (writer, mut rx, _closed) = test_handle(&WriterConfig::default());
        let codec = MsgPackCodec::default();

        let future = correlator
            .send_and_await(&writer, &codec, 42, &("a", 1), "i32")
            .await
            .unwrap();

        let sent = rx.recv().await.unwrap();
        assert_eq!(
            decode_client_message(&sent.payload).unwrap(),
            HubMessage::Request {
                message_id: future.message_id(),
                method_id: 42,
                body: &[0x92, 0xa1, b'a', 0x01],
            }
        );

        correlator.on_response(future.message_id(), 42, body(&[0x07]));
        let resolved = future.await.unwrap();
        let value: i32 = resolved.decode(&codec).unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_dropped_future_removes_entry() {
        let correlator = Arc::new(ResponseCorrelator::new());
        let (writer, _rx, _closed) = test_handle(&WriterConfig::default());

        let future = correlator
            .send_and_await(&writer, &MsgPackCodec::default(), 1, &(), "()")
            .await
            .unwrap();
        let id = future.message_id();
        drop(future);

        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.on_response(id, 1, body(&[0xc0])));
    }

    #[tokio::test]
    async fn test_failed_send_removes_entry() {
        let correlator = Arc::new(ResponseCorrelator::new());
        let (writer, rx, _closed) = test_handle(&WriterConfig::default());
        drop(rx);

        let result = correlator
            .send_and_await(&writer, &MsgPackCodec::default(), 1, &(), "()")
            .await;
        assert!(matches!(result, Err(HubError::Disconnected(_))));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_distinct_ids() {
        let correlator = Arc::new(ResponseCorrelator::new());
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let correlator = Arc::clone(&correlator);
                tokio::spawn(async move { correlator.register(1, "()").unwrap() })
            })
            .collect();

        let mut receivers = Vec::new();
        for handle in handles {
            receivers.push(handle.await.unwrap());
        }

        let mut ids: Vec<i32> = receivers.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 50);

        // Resolve in reverse order; each receiver gets its own body.
        for (id, _) in receivers.iter().rev() {
            correlator.on_response(*id, 1, body(&(*id as i8).to_be_bytes()));
        }
        for (id, rx) in receivers {
            let resolved = rx.await.unwrap().unwrap();
            assert_eq!(resolved.as_bytes(), &(id as i8).to_be_bytes());
        }
    }
}
