//! Client-result handler registry, keyed by method ID.
//!
//! # Example
//!
//! ```ignore
//! use streaminghub_client::codec::MsgPackCodec;
//! use streaminghub_client::handler::ClientResultRegistry;
//!
//! let mut registry = ClientResultRegistry::<MsgPackCodec>::new();
//! registry.register(7, |name: String, _ctx| async move { Ok(format!("hello {name}")) });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::ClientResultContext;
use crate::codec::HubCodec;
use crate::error::Result;
use crate::protocol::{encode_client_result_response, Payload, PayloadPool};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A handler for server-initiated client-result requests.
pub trait ClientResultHandler<C: HubCodec>: Send + Sync + 'static {
    /// Handle a request with its raw argument bytes.
    ///
    /// On success the future yields the complete encoded
    /// `ClientResultResponse` message.
    fn call(&self, args: &[u8], ctx: ClientResultContext, codec: &C)
        -> BoxFuture<'static, Result<Payload>>;
}

/// Wrapper that decodes the arguments and encodes the result around a
/// typed async closure.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(T, ClientResultContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> (Fut, R)>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, ClientResultContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<C, F, T, R, Fut> ClientResultHandler<C> for TypedHandler<F, T, R, Fut>
where
    C: HubCodec,
    F: Fn(T, ClientResultContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(
        &self,
        args: &[u8],
        ctx: ClientResultContext,
        codec: &C,
    ) -> BoxFuture<'static, Result<Payload>> {
        let parsed: T = match codec.decode(args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let request_id = ctx.request_id();
        let method_id = ctx.method_id();
        let fut = (self.handler)(parsed, ctx);
        let codec = codec.clone();

        Box::pin(async move {
            let result = fut.await?;
            let mut payload = PayloadPool::shared().rent();
            encode_client_result_response(
                payload.as_mut_vec(),
                request_id,
                method_id,
                &result,
                &codec,
            )?;
            Ok(payload)
        })
    }
}

/// Registry mapping method IDs to client-result handlers.
pub struct ClientResultRegistry<C: HubCodec> {
    handlers: HashMap<i32, Arc<dyn ClientResultHandler<C>>>,
}

impl<C: HubCodec> ClientResultRegistry<C> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a typed handler for `method_id`, replacing any previous one.
    pub fn register<F, T, R, Fut>(&mut self, method_id: i32, handler: F)
    where
        F: Fn(T, ClientResultContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.register_handler(method_id, TypedHandler::new(handler));
    }

    /// Register a handler implementation for `method_id`.
    pub fn register_handler<H: ClientResultHandler<C>>(&mut self, method_id: i32, handler: H) {
        if self.handlers.insert(method_id, Arc::new(handler)).is_some() {
            tracing::debug!(method_id, "client result handler replaced");
        }
    }

    /// Look up the handler for `method_id`.
    pub fn get(&self, method_id: i32) -> Option<Arc<dyn ClientResultHandler<C>>> {
        self.handlers.get(&method_id).cloned()
    }

    pub fn contains(&self, method_id: i32) -> bool {
        self.handlers.contains_key(&method_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C: HubCodec> Default for ClientResultRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::error::HubError;
    use crate::protocol::{decode_client_message, HubMessage};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn context(method_id: i32) -> ClientResultContext {
        ClientResultContext::new(Uuid::new_v4(), method_id, CancellationToken::new())
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ClientResultRegistry::<MsgPackCodec>::new();
        assert!(registry.is_empty());

        registry.register(7, |_: String, _ctx| async { Ok(()) });
        registry.register(9, |n: i32, _ctx| async move { Ok(n + 1) });

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(7));
        assert!(registry.get(9).is_some());
        assert!(registry.get(8).is_none());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ClientResultRegistry::<MsgPackCodec>::new();
        registry.register(1, |_: (), _ctx| async { Ok(1) });
        registry.register(1, |_: (), _ctx| async { Ok(2) });
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_typed_handler_encodes_response() {
        let codec = MsgPackCodec::default();
        let mut registry = ClientResultRegistry::<MsgPackCodec>::new();
        registry.register(3, |n: i32, _ctx| async move { Ok(n * 2) });

        let ctx = context(3);
        let request_id = ctx.request_id();
        let handler = registry.get(3).unwrap();
        let payload = handler.call(&[0x15], ctx, &codec).await.unwrap();

        assert_eq!(
            decode_client_message(&payload).unwrap(),
            HubMessage::ClientResultResponse {
                request_id,
                method_id: 3,
                body: &[0x2a],
            }
        );
    }

    #[tokio::test]
    async fn test_typed_handler_reports_bad_args() {
        let codec = MsgPackCodec::default();
        let mut registry = ClientResultRegistry::<MsgPackCodec>::new();
        registry.register(3, |n: i32, _ctx| async move { Ok(n) });

        let handler = registry.get(3).unwrap();
        let err = handler.call(&[0xa1, b'x'], context(3), &codec).await.unwrap_err();
        assert!(matches!(err, HubError::MsgPackDecode(_)));
    }
}
