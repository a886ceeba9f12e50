//! Client-result handlers: server-initiated calls answered by the client.
//!
//! Provides:
//! - [`ClientResultRegistry`] - maps method IDs to handlers
//! - [`ClientResultContext`] - identifies the request being answered
//! - [`ClientResultDispatcher`] - runs handlers and sends their replies
//!
//! # Example
//!
//! ```ignore
//! use streaminghub_client::HubSession;
//!
//! let (session, broadcasts) = HubSession::builder()
//!     .on_client_result(10, |question: String, ctx| async move {
//!         tracing::info!(request_id = %ctx.request_id(), "answering");
//!         Ok(question.len() as i32)
//!     })
//!     .connect(stream)?;
//! ```

mod context;
mod dispatcher;
mod registry;

pub use context::ClientResultContext;
pub use dispatcher::{to_remote_error, ClientResultDispatcher};
pub use registry::{BoxFuture, ClientResultHandler, ClientResultRegistry, TypedHandler};
