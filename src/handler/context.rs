//! Per-request context handed to client-result handlers.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifies the server request a handler is answering.
///
/// The cancellation token fires when the session shuts down; long-running
/// handlers can select on it to give up early.
#[derive(Debug, Clone)]
pub struct ClientResultContext {
    request_id: Uuid,
    method_id: i32,
    cancellation: CancellationToken,
}

impl ClientResultContext {
    pub fn new(request_id: Uuid, method_id: i32, cancellation: CancellationToken) -> Self {
        Self {
            request_id,
            method_id,
            cancellation,
        }
    }

    /// The server-chosen request GUID.
    #[inline]
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    #[inline]
    pub fn method_id(&self) -> i32 {
        self.method_id
    }

    /// Token cancelled when the session closes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
