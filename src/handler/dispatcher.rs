//! Runs client-result handlers off the read loop.
//!
//! Every `ClientResultRequest` is answered exactly once, with either a
//! `ClientResultResponse` or a `ClientResultResponseError` carrying the same
//! request GUID and method ID. Handler failures never reach the read loop.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ClientResultContext, ClientResultRegistry};
use crate::codec::HubCodec;
use crate::error::{status, HubError, RemoteError, Result};
use crate::protocol::{encode_client_result_response_error, MessageBody, Payload, PayloadPool};
use crate::writer::{OutboundMessage, WriterHandle};

/// Map a handler error onto the error sent back to the server.
///
/// Remote errors keep their status; anything else is `INTERNAL` with the
/// display form as detail and the debug form as message.
pub fn to_remote_error(err: &HubError) -> RemoteError {
    match err {
        HubError::Remote(remote) => remote.clone(),
        other => RemoteError {
            status_code: status::INTERNAL,
            detail: other.to_string(),
            message: Some(format!("{other:?}")),
        },
    }
}

fn encode_error(request_id: Uuid, method_id: i32, error: &RemoteError) -> Result<Payload> {
    let mut payload = PayloadPool::shared().rent();
    encode_client_result_response_error(
        payload.as_mut_vec(),
        request_id,
        method_id,
        error.status_code,
        &error.detail,
        error.message.as_deref(),
    )?;
    Ok(payload)
}

/// Dispatches client-result requests to registered handlers.
pub struct ClientResultDispatcher<C: HubCodec> {
    registry: Arc<ClientResultRegistry<C>>,
    codec: C,
    writer: WriterHandle,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    shutdown: CancellationToken,
}

impl<C: HubCodec> ClientResultDispatcher<C> {
    pub fn new(
        registry: ClientResultRegistry<C>,
        codec: C,
        writer: WriterHandle,
        max_concurrent: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            codec,
            writer,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            shutdown,
        }
    }

    /// Handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    /// Start handling one request. Never blocks and never fails.
    pub fn dispatch(&self, request_id: Uuid, method_id: i32, args: MessageBody) {
        let Some(handler) = self.registry.get(method_id) else {
            tracing::warn!(%request_id, method_id, "no client result handler registered");
            let error = RemoteError::new(
                status::UNIMPLEMENTED,
                format!("client result method {method_id} is not implemented"),
            );
            self.reply_error_now(request_id, method_id, &error);
            return;
        };

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(
                    %request_id,
                    method_id,
                    "client result capacity reached, rejecting request"
                );
                let error = RemoteError::new(
                    status::RESOURCE_EXHAUSTED,
                    "client result handler capacity exhausted",
                );
                self.reply_error_now(request_id, method_id, &error);
                return;
            }
        };

        let ctx = ClientResultContext::new(request_id, method_id, self.shutdown.child_token());
        let codec = self.codec.clone();
        let writer = self.writer.clone();

        tokio::spawn(async move {
            // Permit is held until the reply is queued
            let _permit = permit;

            // Run in a nested task so a panicking handler is observed as a JoinError.
            let outcome =
                tokio::spawn(async move { handler.call(args.as_bytes(), ctx, &codec).await })
                    .await;

            let reply = match outcome {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(e)) => {
                    tracing::debug!(
                        %request_id,
                        method_id,
                        error = %e,
                        "client result handler failed"
                    );
                    encode_error(request_id, method_id, &to_remote_error(&e))
                }
                Err(join) => {
                    let error = if join.is_panic() {
                        tracing::error!(%request_id, method_id, "client result handler panicked");
                        RemoteError::new(status::INTERNAL, "client result handler panicked")
                    } else {
                        RemoteError::new(status::CANCELLED, "client result handler cancelled")
                    };
                    encode_error(request_id, method_id, &error)
                }
            };

            let sent = match reply.and_then(OutboundMessage::new) {
                Ok(message) => writer.send(message).await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => tracing::trace!(%request_id, method_id, "client result sent"),
                Err(HubError::Disconnected(reason)) => tracing::debug!(
                    %request_id,
                    method_id,
                    %reason,
                    "client result dropped, session closed"
                ),
                Err(e) => tracing::warn!(
                    %request_id,
                    method_id,
                    error = %e,
                    "failed to send client result"
                ),
            }
        });
    }

    /// Queue an error reply without waiting for queue space.
    fn reply_error_now(&self, request_id: Uuid, method_id: i32, error: &RemoteError) {
        let queued = encode_error(request_id, method_id, error)
            .and_then(OutboundMessage::new)
            .and_then(|message| self.writer.try_send(message));
        if let Err(e) = queued {
            tracing::warn!(
                %request_id,
                method_id,
                error = %e,
                "failed to queue client result error"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::protocol::{decode_client_message, HubMessage};
    use crate::writer::{test_handle, WriterConfig};
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    fn body(bytes: &[u8]) -> MessageBody {
        MessageBody::tail(PayloadPool::shared().rent_or_create(bytes), bytes.len())
    }

    fn dispatcher(
        registry: ClientResultRegistry<MsgPackCodec>,
        max_concurrent: usize,
    ) -> (
        ClientResultDispatcher<MsgPackCodec>,
        mpsc::Receiver<OutboundMessage>,
    ) {
        let (writer, rx, _closed) = test_handle(&WriterConfig::default());
        let dispatcher = ClientResultDispatcher::new(
            registry,
            MsgPackCodec::default(),
            writer,
            max_concurrent,
            CancellationToken::new(),
        );
        (dispatcher, rx)
    }

    async fn expect_error(rx: &mut mpsc::Receiver<OutboundMessage>) -> (Uuid, i32, String) {
        let sent = rx.recv().await.unwrap();
        match decode_client_message(&sent.payload).unwrap() {
            HubMessage::ClientResultResponseError {
                request_id,
                status_code,
                detail,
                ..
            } => (request_id, status_code, detail.to_string()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_remote_error_keeps_status() {
        let err = HubError::Remote(RemoteError {
            status_code: 5,
            detail: "missing".into(),
            message: Some("m".into()),
        });
        let remote = to_remote_error(&err);
        assert_eq!(remote.status_code, 5);
        assert_eq!(remote.detail, "missing");
        assert_eq!(remote.message.as_deref(), Some("m"));
    }

    #[test]
    fn test_other_error_is_internal() {
        let remote = to_remote_error(&HubError::Protocol("bad".into()));
        assert_eq!(remote.status_code, status::INTERNAL);
        assert_eq!(remote.detail, "Protocol error: bad");
        assert_eq!(remote.message.as_deref(), Some("Protocol(\"bad\")"));
    }

    #[tokio::test]
    async fn test_success_reply() {
        let mut registry = ClientResultRegistry::new();
        registry.register(2, |name: String, _ctx| async move { Ok(format!("hi {name}")) });
        let (dispatcher, mut rx) = dispatcher(registry, 4);

        let id = Uuid::new_v4();
        dispatcher.dispatch(id, 2, body(&[0xa2, b'b', b'o']));

        let sent = rx.recv().await.unwrap();
        match decode_client_message(&sent.payload).unwrap() {
            HubMessage::ClientResultResponse {
                request_id,
                method_id,
                body,
            } => {
                assert_eq!((request_id, method_id), (id, 2));
                let text: String = rmp_serde::from_slice(body).unwrap();
                assert_eq!(text, "hi bo");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unregistered_method_is_unimplemented() {
        let (dispatcher, mut rx) = dispatcher(ClientResultRegistry::new(), 4);
        let id = Uuid::new_v4();
        dispatcher.dispatch(id, 99, body(&[0xc0]));

        let (request_id, status_code, _) = expect_error(&mut rx).await;
        assert_eq!(request_id, id);
        assert_eq!(status_code, status::UNIMPLEMENTED);
    }

    #[tokio::test]
    async fn test_handler_error_reply() {
        let mut registry = ClientResultRegistry::new();
        registry.register(1, |_: (), _ctx| async {
            Err::<(), _>(HubError::remote(7, "denied"))
        });
        registry.register(2, |_: (), _ctx| async {
            Err::<(), _>(HubError::Config("nope".into()))
        });
        let (dispatcher, mut rx) = dispatcher(registry, 4);

        dispatcher.dispatch(Uuid::new_v4(), 1, body(&[0xc0]));
        let (_, status_code, detail) = expect_error(&mut rx).await;
        assert_eq!((status_code, detail.as_str()), (7, "denied"));

        dispatcher.dispatch(Uuid::new_v4(), 2, body(&[0xc0]));
        let (_, status_code, detail) = expect_error(&mut rx).await;
        assert_eq!(status_code, status::INTERNAL);
        assert_eq!(detail, "Configuration error: nope");
    }

    #[tokio::test]
    async fn test_panicking_handler_reply() {
        let mut registry = ClientResultRegistry::new();
        registry.register(1, |_: (), _ctx| async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        let (dispatcher, mut rx) = dispatcher(registry, 4);

        dispatcher.dispatch(Uuid::new_v4(), 1, body(&[0xc0]));
        let (_, status_code, detail) = expect_error(&mut rx).await;
        assert_eq!(status_code, status::INTERNAL);
        assert_eq!(detail, "client result handler panicked");
    }

    #[tokio::test]
    async fn test_bad_args_reply_internal() {
        let mut registry = ClientResultRegistry::new();
        registry.register(1, |n: i32, _ctx| async move { Ok(n) });
        let (dispatcher, mut rx) = dispatcher(registry, 4);

        dispatcher.dispatch(Uuid::new_v4(), 1, body(&[0xa1, b'x']));
        let (_, status_code, _) = expect_error(&mut rx).await;
        assert_eq!(status_code, status::INTERNAL);
    }

    #[tokio::test]
    async fn test_capacity_exhausted() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release = Arc::new(parking_lot::Mutex::new(Some(release_rx)));

        let mut registry = ClientResultRegistry::new();
        registry.register(1, move |_: (), _ctx| {
            let release = release.lock().take();
            async move {
                if let Some(rx) = release {
                    let _ = rx.await;
                }
                Ok(())
            }
        });
        let (dispatcher, mut rx) = dispatcher(registry, 1);

        let blocked = Uuid::new_v4();
        let rejected = Uuid::new_v4();
        dispatcher.dispatch(blocked, 1, body(&[0xc0]));
        assert_eq!(dispatcher.in_flight(), 1);
        dispatcher.dispatch(rejected, 1, body(&[0xc0]));

        let (request_id, status_code, _) = expect_error(&mut rx).await;
        assert_eq!(request_id, rejected);
        assert_eq!(status_code, status::RESOURCE_EXHAUSTED);

        release_tx.send(()).unwrap();
        let sent = rx.recv().await.unwrap();
        assert!(matches!(
            decode_client_message(&sent.payload).unwrap(),
            HubMessage::ClientResultResponse { request_id, .. } if request_id == blocked
        ));
    }

    #[tokio::test]
    async fn test_concurrent_requests_keep_guids_paired() {
        let mut registry = ClientResultRegistry::new();
        registry.register(1, |n: u32, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(u64::from(20 - n))).await;
            Ok(n)
        });
        let (dispatcher, mut rx) = dispatcher(registry, 32);

        let ids: Vec<Uuid> = (0..20u32)
            .map(|n| {
                let id = Uuid::new_v4();
                let args = rmp_serde::to_vec(&n).unwrap();
                dispatcher.dispatch(id, 1, body(&args));
                id
            })
            .collect();

        for _ in 0..20 {
            let sent = rx.recv().await.unwrap();
            match decode_client_message(&sent.payload).unwrap() {
                HubMessage::ClientResultResponse {
                    request_id, body, ..
                } => {
                    let n: u32 = rmp_serde::from_slice(body).unwrap();
                    assert_eq!(ids[n as usize], request_id);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
