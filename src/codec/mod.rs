//! Codec module - serialization of call arguments, results and broadcasts.
//!
//! The hub runtime never looks inside a body: every message shape ends with
//! a single MessagePack value produced by an injected [`HubCodec`]. Two
//! implementations are provided:
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (the default)
//! - [`JsonCodec`] - JSON text tunnelled inside a MessagePack `bin` value
//!
//! # Example
//!
//! ```
//! use streaminghub_client::codec::{HubCodec, MsgPackCodec};
//!
//! let codec = MsgPackCodec::default();
//! let encoded = codec.encode(&"hello").unwrap();
//! let decoded: String = codec.decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod json;
mod msgpack;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

/// Pluggable body serializer.
///
/// `encode_into` must append exactly one MessagePack value to `buf`, because
/// bodies sit as the last element of a MessagePack array on the wire.
pub trait HubCodec: Clone + Send + Sync + 'static {
    /// Append the encoded form of `value` to `buf`.
    fn encode_into<T: Serialize + ?Sized>(&self, value: &T, buf: &mut Vec<u8>) -> Result<()>;

    /// Decode a value from a complete body.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Encode `value` into a fresh vector.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode_into(value, &mut buf)?;
        Ok(buf)
    }
}
