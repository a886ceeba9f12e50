//! Where user callbacks run.
//!
//! Heartbeat notifications are handed to a [`CallbackExecutor`] instead of
//! being called directly from the read loop or the heartbeat timer. The
//! default [`InlineExecutor`] runs them on the spot; [`ChannelExecutor`]
//! queues them for a task or thread the application owns (for example a UI
//! loop).

use tokio::sync::mpsc;

/// A deferred user callback.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Runs callbacks on behalf of the session.
pub trait CallbackExecutor: Send + Sync + 'static {
    /// Run or schedule `callback`. Must not block.
    fn execute(&self, callback: Callback);
}

/// Runs each callback immediately on the calling task.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl CallbackExecutor for InlineExecutor {
    fn execute(&self, callback: Callback) {
        callback();
    }
}

/// Queues callbacks for a [`CallbackQueue`] to run.
#[derive(Clone)]
pub struct ChannelExecutor {
    tx: mpsc::UnboundedSender<Callback>,
}

impl ChannelExecutor {
    /// Create an executor and the queue that drains it.
    pub fn new() -> (Self, CallbackQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, CallbackQueue { rx })
    }
}

impl CallbackExecutor for ChannelExecutor {
    fn execute(&self, callback: Callback) {
        if self.tx.send(callback).is_err() {
            tracing::trace!("callback queue dropped, callback discarded");
        }
    }
}

/// Receiving side of a [`ChannelExecutor`].
pub struct CallbackQueue {
    rx: mpsc::UnboundedReceiver<Callback>,
}

impl CallbackQueue {
    /// Run callbacks as they arrive until every executor is dropped.
    pub async fn run(mut self) {
        while let Some(callback) = self.rx.recv().await {
            callback();
        }
    }

    /// Run whatever is queued right now. Returns how many ran.
    pub fn try_run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(callback) = self.rx.try_recv() {
            callback();
            ran += 1;
        }
        ran
    }
}
