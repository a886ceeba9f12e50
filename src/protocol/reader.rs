//! Borrowing decoder for StreamingHub messages.
//!
//! [`MessageReader`] walks a complete message with `rmp` primitives and
//! never copies: strings, bodies and metadata are slices of the input.
//!
//! # Example
//!
//! ```
//! use streaminghub_client::protocol::{decode_server_message, HubMessage};
//!
//! // [1, 2, "ok"] - a Response to message 1 of method 2
//! let bytes = [0x93, 0x01, 0x02, 0xa2, b'o', b'k'];
//! match decode_server_message(&bytes).unwrap() {
//!     HubMessage::Response { message_id, method_id, body } => {
//!         assert_eq!((message_id, method_id), (1, 2));
//!         assert_eq!(body, &[0xa2, b'o', b'k']);
//!     }
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

use rmp::decode::ValueReadError;
use rmp::Marker;
use uuid::Uuid;

use super::message::{tags, HubMessage, MessageType};
use crate::error::{HubError, Result};

const NIL: u8 = 0xc0;

/// Nesting limit when skipping reserved values.
const MAX_SKIP_DEPTH: usize = 32;

/// Cursor over one complete message.
#[derive(Debug, Clone)]
pub struct MessageReader<'a> {
    rest: &'a [u8],
}

impl<'a> MessageReader<'a> {
    /// Create a reader positioned at the start of a message.
    pub fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }

    /// Bytes not consumed yet.
    #[inline]
    pub fn remaining(&self) -> &'a [u8] {
        self.rest
    }

    /// Read the array header (and tag) of a message sent by the server.
    pub fn read_server_message_type(&mut self) -> Result<MessageType> {
        match self.read_array_len()? {
            2 => Ok(MessageType::Broadcast),
            3 => Ok(MessageType::Response),
            4 => Ok(MessageType::ResponseWithError),
            5 => match self.read_tag()? {
                tags::CLIENT_RESULT => Ok(MessageType::ClientResultRequest),
                tags::CLIENT_HEARTBEAT => Ok(MessageType::ClientHeartbeatResponse),
                tags::SERVER_HEARTBEAT => Ok(MessageType::ServerHeartbeat),
                tag => Err(HubError::Protocol(format!(
                    "unknown server message tag: {tag:#04x}"
                ))),
            },
            len => Err(HubError::Protocol(format!(
                "unknown server message format: array length {len}"
            ))),
        }
    }

    /// Read the array header (and tag) of a message sent by the client.
    pub fn read_client_message_type(&mut self) -> Result<MessageType> {
        match self.read_array_len()? {
            2 => Ok(MessageType::RequestFireAndForget),
            3 => Ok(MessageType::Request),
            4 => match self.read_tag()? {
                tags::CLIENT_RESULT => Ok(MessageType::ClientResultResponse),
                tags::CLIENT_RESULT_ERROR => Ok(MessageType::ClientResultResponseError),
                tags::CLIENT_HEARTBEAT => Ok(MessageType::ClientHeartbeat),
                tags::SERVER_HEARTBEAT => Ok(MessageType::ServerHeartbeatResponse),
                tag => Err(HubError::Protocol(format!(
                    "unknown client message tag: {tag:#04x}"
                ))),
            },
            len => Err(HubError::Protocol(format!(
                "unknown client message format: array length {len}"
            ))),
        }
    }

    /// Read the fields following a header already consumed by one of the
    /// `read_*_message_type` methods.
    pub fn read_fields(mut self, message_type: MessageType) -> Result<HubMessage<'a>> {
        match message_type {
            MessageType::RequestFireAndForget => {
                let method_id = self.read_i32()?;
                Ok(HubMessage::RequestFireAndForget {
                    method_id,
                    body: self.body()?,
                })
            }
            MessageType::Request => {
                let message_id = self.read_i32()?;
                let method_id = self.read_i32()?;
                Ok(HubMessage::Request {
                    message_id,
                    method_id,
                    body: self.body()?,
                })
            }
            MessageType::Response => {
                let message_id = self.read_i32()?;
                let method_id = self.read_i32()?;
                Ok(HubMessage::Response {
                    message_id,
                    method_id,
                    body: self.body()?,
                })
            }
            MessageType::ResponseWithError => Ok(HubMessage::ResponseWithError {
                message_id: self.read_i32()?,
                status_code: self.read_i32()?,
                detail: self.read_opt_str()?,
                message: self.read_opt_str()?,
            }),
            MessageType::Broadcast => {
                let method_id = self.read_i32()?;
                Ok(HubMessage::Broadcast {
                    method_id,
                    body: self.body()?,
                })
            }
            MessageType::ClientResultRequest => {
                // Element 1 is a placeholder.
                self.skip_value(0)?;
                let request_id = self.read_guid()?;
                let method_id = self.read_i32()?;
                Ok(HubMessage::ClientResultRequest {
                    request_id,
                    method_id,
                    body: self.body()?,
                })
            }
            MessageType::ClientResultResponse => {
                let request_id = self.read_guid()?;
                let method_id = self.read_i32()?;
                Ok(HubMessage::ClientResultResponse {
                    request_id,
                    method_id,
                    body: self.body()?,
                })
            }
            MessageType::ClientResultResponseError => {
                let request_id = self.read_guid()?;
                let method_id = self.read_i32()?;
                let len = self.read_array_len()?;
                if len != 3 {
                    return Err(HubError::Protocol(format!(
                        "client result error body has {len} elements, expected 3"
                    )));
                }
                Ok(HubMessage::ClientResultResponseError {
                    request_id,
                    method_id,
                    status_code: self.read_i32()?,
                    detail: self.read_opt_str()?.unwrap_or_default(),
                    message: self.read_opt_str()?,
                })
            }
            MessageType::ServerHeartbeat => {
                let sequence = self.read_i16()?;
                let sent_at = self.read_opt_i64()?;
                self.skip_value(0)?;
                Ok(HubMessage::ServerHeartbeat {
                    sequence,
                    sent_at,
                    metadata: self.rest,
                })
            }
            MessageType::ServerHeartbeatResponse => Ok(HubMessage::ServerHeartbeatResponse {
                sequence: self.read_i16()?,
                sent_at: self.read_opt_i64()?,
            }),
            MessageType::ClientHeartbeat => {
                let sequence = self.read_i16()?;
                let sent_at = self.read_i64()?;
                Ok(HubMessage::ClientHeartbeat {
                    sequence,
                    sent_at,
                    extra: self.rest,
                })
            }
            MessageType::ClientHeartbeatResponse => {
                let sequence = self.read_i16()?;
                let sent_at = self.read_opt_i64()?;
                self.skip_value(0)?;
                Ok(HubMessage::ClientHeartbeatResponse {
                    sequence,
                    sent_at,
                    extra: self.rest,
                })
            }
        }
    }

    fn read_array_len(&mut self) -> Result<u32> {
        Ok(rmp::decode::read_array_len(&mut self.rest)?)
    }

    fn read_tag(&mut self) -> Result<u8> {
        Ok(rmp::decode::read_int(&mut self.rest)?)
    }

    fn read_i16(&mut self) -> Result<i16> {
        Ok(rmp::decode::read_int(&mut self.rest)?)
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(rmp::decode::read_int(&mut self.rest)?)
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(rmp::decode::read_int(&mut self.rest)?)
    }

    fn read_opt_i64(&mut self) -> Result<Option<i64>> {
        if self.eat_nil() {
            return Ok(None);
        }
        self.read_i64().map(Some)
    }

    fn read_opt_str(&mut self) -> Result<Option<&'a str>> {
        if self.eat_nil() {
            return Ok(None);
        }
        self.read_str().map(Some)
    }

    fn read_str(&mut self) -> Result<&'a str> {
        let len = rmp::decode::read_str_len(&mut self.rest)? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map_err(|e| HubError::Protocol(format!("string is not valid UTF-8: {e}")))
    }

    /// GUIDs arrive as their 36-character string form; a raw 16-byte bin is
    /// accepted as well.
    fn read_guid(&mut self) -> Result<Uuid> {
        match self.peek_marker()? {
            Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => {
                let text = self.read_str()?;
                Uuid::parse_str(text)
                    .map_err(|e| HubError::Protocol(format!("invalid GUID {text:?}: {e}")))
            }
            Marker::Bin8 | Marker::Bin16 | Marker::Bin32 => {
                let len = rmp::decode::read_bin_len(&mut self.rest)? as usize;
                let bytes = self.take(len)?;
                Uuid::from_slice(bytes)
                    .map_err(|e| HubError::Protocol(format!("invalid GUID bytes: {e}")))
            }
            marker => Err(HubError::Protocol(format!(
                "expected GUID, found {marker:?}"
            ))),
        }
    }

    /// The trailing body: everything left, which must hold at least one value.
    fn body(&self) -> Result<&'a [u8]> {
        if self.rest.is_empty() {
            return Err(HubError::Protocol("message body is missing".to_string()));
        }
        Ok(self.rest)
    }

    fn eat_nil(&mut self) -> bool {
        match self.rest.split_first() {
            Some((&NIL, tail)) => {
                self.rest = tail;
                true
            }
            _ => false,
        }
    }

    fn peek_marker(&self) -> Result<Marker> {
        self.rest
            .first()
            .map(|&b| Marker::from_u8(b))
            .ok_or_else(|| HubError::Protocol("unexpected end of message".to_string()))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.rest.len() < len {
            return Err(HubError::Protocol(format!(
                "unexpected end of message: need {len} bytes, have {}",
                self.rest.len()
            )));
        }
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Ok(head)
    }

    fn read_be_len(&mut self, width: usize) -> Result<usize> {
        let bytes = self.take(width)?;
        Ok(bytes
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | usize::from(b)))
    }

    /// Skip one value of any kind.
    fn skip_value(&mut self, depth: usize) -> Result<()> {
        if depth > MAX_SKIP_DEPTH {
            return Err(HubError::Protocol("value nested too deeply".to_string()));
        }

        let marker = rmp::decode::read_marker(&mut self.rest).map_err(ValueReadError::from)?;
        let (len, children) = match marker {
            Marker::Null
            | Marker::True
            | Marker::False
            | Marker::FixPos(_)
            | Marker::FixNeg(_) => (0, 0),
            Marker::U8 | Marker::I8 => (1, 0),
            Marker::U16 | Marker::I16 => (2, 0),
            Marker::U32 | Marker::I32 | Marker::F32 => (4, 0),
            Marker::U64 | Marker::I64 | Marker::F64 => (8, 0),
            Marker::FixStr(n) => (usize::from(n), 0),
            Marker::Str8 | Marker::Bin8 => (self.read_be_len(1)?, 0),
            Marker::Str16 | Marker::Bin16 => (self.read_be_len(2)?, 0),
            Marker::Str32 | Marker::Bin32 => (self.read_be_len(4)?, 0),
            Marker::FixExt1 => (2, 0),
            Marker::FixExt2 => (3, 0),
            Marker::FixExt4 => (5, 0),
            Marker::FixExt8 => (9, 0),
            Marker::FixExt16 => (17, 0),
            Marker::Ext8 => (self.read_be_len(1)? + 1, 0),
            Marker::Ext16 => (self.read_be_len(2)? + 1, 0),
            Marker::Ext32 => (self.read_be_len(4)? + 1, 0),
            Marker::FixArray(n) => (0, usize::from(n)),
            Marker::Array16 => (0, self.read_be_len(2)?),
            Marker::Array32 => (0, self.read_be_len(4)?),
            Marker::FixMap(n) => (0, usize::from(n) * 2),
            Marker::Map16 => (0, self.read_be_len(2)? * 2),
            Marker::Map32 => (0, self.read_be_len(4)? * 2),
            Marker::Reserved => {
                return Err(HubError::Protocol("reserved MessagePack marker".to_string()))
            }
        };

        self.take(len)?;
        for _ in 0..children {
            self.skip_value(depth + 1)?;
        }
        Ok(())
    }
}

/// Decode a complete message sent by the server.
pub fn decode_server_message(data: &[u8]) -> Result<HubMessage<'_>> {
    let mut reader = MessageReader::new(data);
    let message_type = reader.read_server_message_type()?;
    reader.read_fields(message_type)
}

/// Decode a complete message sent by the client.
pub fn decode_client_message(data: &[u8]) -> Result<HubMessage<'_>> {
    let mut reader = MessageReader::new(data);
    let message_type = reader.read_client_message_type()?;
    reader.read_fields(message_type)
}
