//! Message shapes of the StreamingHub wire protocol.
//!
//! Every message is a MessagePack array. The array length selects the
//! shape; for lengths shared by several shapes a one-byte tag at element 0
//! disambiguates.
//!
//! ```text
//! Server -> client                         Client -> server
//! 2  Broadcast      [method, body]         2  FireAndForget [method, body]
//! 3  Response       [id, method, body]     3  Request       [id, method, body]
//! 4  ResponseError  [id, status, d, m]     4  tag 0x00 ClientResultResponse
//! 5  tag 0x00 ClientResultRequest             tag 0x01 ClientResultResponseError
//!    tag 0x7e ClientHeartbeatResponse         tag 0x7e ClientHeartbeat
//!    tag 0x7f ServerHeartbeat                 tag 0x7f ServerHeartbeatResponse
//! ```

use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::payload_pool::Payload;
use crate::codec::HubCodec;
use crate::error::Result;

/// Sub-type tags at element 0 of the 4- and 5-element shapes.
pub mod tags {
    /// ClientResultRequest / ClientResultResponse.
    pub const CLIENT_RESULT: u8 = 0x00;
    /// ClientResultResponseError.
    pub const CLIENT_RESULT_ERROR: u8 = 0x01;
    /// ClientHeartbeat / ClientHeartbeatResponse.
    pub const CLIENT_HEARTBEAT: u8 = 0x7e;
    /// ServerHeartbeat / ServerHeartbeatResponse.
    pub const SERVER_HEARTBEAT: u8 = 0x7f;
}

/// Discriminant of a message, as resolved from its array header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// C→S call without a response.
    RequestFireAndForget,
    /// C→S call expecting a response.
    Request,
    /// S→C successful result.
    Response,
    /// S→C failed result.
    ResponseWithError,
    /// S→C unsolicited message.
    Broadcast,
    /// S→C call into a client-side handler.
    ClientResultRequest,
    /// C→S client-side handler result.
    ClientResultResponse,
    /// C→S client-side handler failure.
    ClientResultResponseError,
    /// S→C liveness check.
    ServerHeartbeat,
    /// C→S answer to a server heartbeat.
    ServerHeartbeatResponse,
    /// C→S liveness check.
    ClientHeartbeat,
    /// S→C answer to a client heartbeat.
    ClientHeartbeatResponse,
}

/// A fully decoded message borrowing its strings and bodies from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubMessage<'a> {
    RequestFireAndForget {
        method_id: i32,
        body: &'a [u8],
    },
    Request {
        message_id: i32,
        method_id: i32,
        body: &'a [u8],
    },
    Response {
        message_id: i32,
        method_id: i32,
        body: &'a [u8],
    },
    ResponseWithError {
        message_id: i32,
        status_code: i32,
        detail: Option<&'a str>,
        message: Option<&'a str>,
    },
    Broadcast {
        method_id: i32,
        body: &'a [u8],
    },
    ClientResultRequest {
        request_id: Uuid,
        method_id: i32,
        body: &'a [u8],
    },
    ClientResultResponse {
        request_id: Uuid,
        method_id: i32,
        body: &'a [u8],
    },
    ClientResultResponseError {
        request_id: Uuid,
        method_id: i32,
        status_code: i32,
        detail: &'a str,
        message: Option<&'a str>,
    },
    ServerHeartbeat {
        sequence: i16,
        sent_at: Option<i64>,
        metadata: &'a [u8],
    },
    ServerHeartbeatResponse {
        sequence: i16,
        sent_at: Option<i64>,
    },
    ClientHeartbeat {
        sequence: i16,
        sent_at: i64,
        extra: &'a [u8],
    },
    ClientHeartbeatResponse {
        sequence: i16,
        sent_at: Option<i64>,
        extra: &'a [u8],
    },
}

impl HubMessage<'_> {
    /// The discriminant of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::RequestFireAndForget { .. } => MessageType::RequestFireAndForget,
            Self::Request { .. } => MessageType::Request,
            Self::Response { .. } => MessageType::Response,
            Self::ResponseWithError { .. } => MessageType::ResponseWithError,
            Self::Broadcast { .. } => MessageType::Broadcast,
            Self::ClientResultRequest { .. } => MessageType::ClientResultRequest,
            Self::ClientResultResponse { .. } => MessageType::ClientResultResponse,
            Self::ClientResultResponseError { .. } => MessageType::ClientResultResponseError,
            Self::ServerHeartbeat { .. } => MessageType::ServerHeartbeat,
            Self::ServerHeartbeatResponse { .. } => MessageType::ServerHeartbeatResponse,
            Self::ClientHeartbeat { .. } => MessageType::ClientHeartbeat,
            Self::ClientHeartbeatResponse { .. } => MessageType::ClientHeartbeatResponse,
        }
    }
}

/// The trailing body of an inbound message, kept alive by its pooled payload.
///
/// Bodies are always the last element of a message, so the body is the tail
/// of the payload starting at `start`.
pub struct MessageBody {
    payload: Payload,
    start: usize,
}

impl MessageBody {
    /// Take the last `body_len` bytes of `payload` as the body.
    pub fn tail(payload: Payload, body_len: usize) -> Self {
        let start = payload.len().saturating_sub(body_len);
        Self { payload, start }
    }

    /// The encoded body.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload[self.start..]
    }

    /// Decode the body with the given codec.
    pub fn decode<T: DeserializeOwned, C: HubCodec>(&self, codec: &C) -> Result<T> {
        codec.decode(self.as_bytes())
    }
}

impl std::fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBody")
            .field("len", &self.as_bytes().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PayloadPool;

    #[test]
    fn test_body_tail() {
        let payload = PayloadPool::shared().rent_or_create(&[0x93, 0x01, 0x02, 0xa2, b'o', b'k']);
        let body = MessageBody::tail(payload, 3);
        assert_eq!(body.as_bytes(), &[0xa2, b'o', b'k']);

        let text: String = body.decode(&crate::codec::MsgPackCodec::default()).unwrap();
        assert_eq!(text, "ok");
    }

    #[test]
    fn test_message_type() {
        let msg = HubMessage::ServerHeartbeatResponse {
            sequence: 3,
            sent_at: None,
        };
        assert_eq!(msg.message_type(), MessageType::ServerHeartbeatResponse);
    }
}
