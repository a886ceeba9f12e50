//! JSON codec.
//!
//! The JSON text is wrapped in a MessagePack `bin` value so the enclosing
//! message array stays well-formed for any MessagePack reader.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::HubCodec;
use crate::error::{HubError, Result};

/// JSON body codec, handy for debugging and for servers exchanging JSON documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonCodec;

impl HubCodec for JsonCodec {
    fn encode_into<T: Serialize + ?Sized>(&self, value: &T, buf: &mut Vec<u8>) -> Result<()> {
        let json = serde_json::to_vec(value)?;
        let len = u32::try_from(json.len())
            .map_err(|_| HubError::Protocol(format!("JSON body too large: {} bytes", json.len())))?;
        rmp::encode::write_bin_len(buf, len)?;
        buf.extend_from_slice(&json);
        Ok(())
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let mut rd = bytes;
        let len = rmp::decode::read_bin_len(&mut rd)? as usize;
        let json = rd.get(..len).ok_or_else(|| {
            HubError::Protocol(format!("JSON body truncated: expected {len} bytes, got {}", rd.len()))
        })?;
        Ok(serde_json::from_slice(json)?)
    }
}
