//! # streaminghub-client
//!
//! Client runtime for the StreamingHub duplex RPC protocol.
//!
//! A session runs over any bidirectional byte stream carrying gRPC-style
//! length-prefixed messages. Over that stream the client can:
//!
//! - call server methods, with or without waiting for a result
//! - receive server broadcasts
//! - answer server-initiated calls with registered client-result handlers
//! - exchange heartbeats in both directions and detect a dead server
//!
//! ## Architecture
//!
//! - **Protocol**: MessagePack arrays whose length (and, for shared lengths,
//!   a leading tag) selects the message shape
//! - **Codec**: call bodies are produced by a pluggable [`codec::HubCodec`]
//! - **Runtime**: one read loop, one writer task, one heartbeat loop per session
//!
//! ## Example
//!
//! ```ignore
//! use streaminghub_client::HubSession;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:5000").await?;
//!     let (session, _broadcasts) = HubSession::builder().connect(stream)?;
//!
//!     let sum: i32 = session.call(1, &(2, 3)).await?;
//!     assert_eq!(sum, 5);
//!
//!     session.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod executor;
pub mod handler;
pub mod heartbeat;
pub mod protocol;
pub mod transport;
pub mod writer;

mod session;

pub use config::HubConfig;
pub use error::{DisconnectionReason, HubError, RemoteError};
pub use handler::ClientResultContext;
pub use heartbeat::{ClientHeartbeatEvent, ServerHeartbeatEvent};
pub use session::{Broadcast, Broadcasts, HubSession, HubSessionBuilder};
