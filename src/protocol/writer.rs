//! Encoders for StreamingHub messages.
//!
//! Each encoder writes the array header and scalar fields in wire order,
//! then lets the injected [`HubCodec`] append the body. Integers use the
//! most compact MessagePack form; GUIDs are written as their 36-character
//! hyphenated string.
//!
//! Heartbeat shapes have a small fixed upper bound, so the client-side
//! heartbeat encoders work on a stack buffer of [`HEARTBEAT_BUFFER_SIZE`]
//! bytes and report how many bytes they used.

use std::io::Write;

use rmp::encode::{write_array_len, write_nil, write_pfix, write_sint, write_str};
use serde::Serialize;
use uuid::Uuid;

use super::message::tags;
use crate::codec::HubCodec;
use crate::error::Result;

/// Stack buffer size for heartbeat messages (worst case is 15 bytes).
pub const HEARTBEAT_BUFFER_SIZE: usize = 32;

fn write_guid<W: Write>(wr: &mut W, id: Uuid) -> Result<()> {
    let mut scratch = Uuid::encode_buffer();
    write_str(wr, id.hyphenated().encode_lower(&mut scratch))?;
    Ok(())
}

fn write_opt_str<W: Write>(wr: &mut W, value: Option<&str>) -> Result<()> {
    match value {
        Some(s) => write_str(wr, s)?,
        None => write_nil(wr)?,
    }
    Ok(())
}

fn write_opt_sint<W: Write>(wr: &mut W, value: Option<i64>) -> Result<()> {
    match value {
        Some(v) => {
            write_sint(wr, v)?;
        }
        None => write_nil(wr)?,
    }
    Ok(())
}

/// Append pre-encoded trailing bytes, or nil when there are none.
fn write_trailing(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        write_nil(buf)?;
    } else {
        buf.extend_from_slice(bytes);
    }
    Ok(())
}

/// `[methodId, args]`
pub fn encode_request_fire_and_forget<C, T>(
    buf: &mut Vec<u8>,
    method_id: i32,
    args: &T,
    codec: &C,
) -> Result<()>
where
    C: HubCodec,
    T: Serialize + ?Sized,
{
    write_array_len(buf, 2)?;
    write_sint(buf, method_id.into())?;
    codec.encode_into(args, buf)
}

/// `[messageId, methodId, args]`
pub fn encode_request<C, T>(
    buf: &mut Vec<u8>,
    message_id: i32,
    method_id: i32,
    args: &T,
    codec: &C,
) -> Result<()>
where
    C: HubCodec,
    T: Serialize + ?Sized,
{
    write_array_len(buf, 3)?;
    write_sint(buf, message_id.into())?;
    write_sint(buf, method_id.into())?;
    codec.encode_into(args, buf)
}

/// `[messageId, methodId, result]`
pub fn encode_response<C, T>(
    buf: &mut Vec<u8>,
    message_id: i32,
    method_id: i32,
    result: &T,
    codec: &C,
) -> Result<()>
where
    C: HubCodec,
    T: Serialize + ?Sized,
{
    write_array_len(buf, 3)?;
    write_sint(buf, message_id.into())?;
    write_sint(buf, method_id.into())?;
    codec.encode_into(result, buf)
}

/// `[messageId, statusCode, detail, message]`
pub fn encode_response_with_error(
    buf: &mut Vec<u8>,
    message_id: i32,
    status_code: i32,
    detail: Option<&str>,
    message: Option<&str>,
) -> Result<()> {
    write_array_len(buf, 4)?;
    write_sint(buf, message_id.into())?;
    write_sint(buf, status_code.into())?;
    write_opt_str(buf, detail)?;
    write_opt_str(buf, message)
}

/// `[methodId, body]`
pub fn encode_broadcast<C, T>(buf: &mut Vec<u8>, method_id: i32, body: &T, codec: &C) -> Result<()>
where
    C: HubCodec,
    T: Serialize + ?Sized,
{
    write_array_len(buf, 2)?;
    write_sint(buf, method_id.into())?;
    codec.encode_into(body, buf)
}

/// `[0x00, nil, requestId, methodId, args]`
pub fn encode_client_result_request<C, T>(
    buf: &mut Vec<u8>,
    request_id: Uuid,
    method_id: i32,
    args: &T,
    codec: &C,
) -> Result<()>
where
    C: HubCodec,
    T: Serialize + ?Sized,
{
    write_array_len(buf, 5)?;
    write_pfix(buf, tags::CLIENT_RESULT)?;
    write_nil(buf)?;
    write_guid(buf, request_id)?;
    write_sint(buf, method_id.into())?;
    codec.encode_into(args, buf)
}

/// `[0x00, requestId, methodId, result]`
pub fn encode_client_result_response<C, T>(
    buf: &mut Vec<u8>,
    request_id: Uuid,
    method_id: i32,
    result: &T,
    codec: &C,
) -> Result<()>
where
    C: HubCodec,
    T: Serialize + ?Sized,
{
    write_array_len(buf, 4)?;
    write_pfix(buf, tags::CLIENT_RESULT)?;
    write_guid(buf, request_id)?;
    write_sint(buf, method_id.into())?;
    codec.encode_into(result, buf)
}

/// `[0x01, requestId, methodId, [statusCode, detail, message]]`
pub fn encode_client_result_response_error(
    buf: &mut Vec<u8>,
    request_id: Uuid,
    method_id: i32,
    status_code: i32,
    detail: &str,
    message: Option<&str>,
) -> Result<()> {
    write_array_len(buf, 4)?;
    write_pfix(buf, tags::CLIENT_RESULT_ERROR)?;
    write_guid(buf, request_id)?;
    write_sint(buf, method_id.into())?;
    write_array_len(buf, 3)?;
    write_sint(buf, status_code.into())?;
    write_str(buf, detail)?;
    write_opt_str(buf, message)
}

/// `[0x7f, sequence, serverSentAt, nil, metadata]`
///
/// `metadata` must be one encoded MessagePack value; empty metadata is sent as nil.
pub fn encode_server_heartbeat(
    buf: &mut Vec<u8>,
    sequence: i16,
    server_sent_at: i64,
    metadata: &[u8],
) -> Result<()> {
    write_array_len(buf, 5)?;
    write_pfix(buf, tags::SERVER_HEARTBEAT)?;
    write_sint(buf, sequence.into())?;
    write_sint(buf, server_sent_at)?;
    write_nil(buf)?;
    write_trailing(buf, metadata)
}

/// `[0x7e, sequence, clientSentAt, nil, nil]`
pub fn encode_client_heartbeat_response(
    buf: &mut Vec<u8>,
    sequence: i16,
    client_sent_at: i64,
) -> Result<()> {
    write_array_len(buf, 5)?;
    write_pfix(buf, tags::CLIENT_HEARTBEAT)?;
    write_sint(buf, sequence.into())?;
    write_sint(buf, client_sent_at)?;
    write_nil(buf)?;
    write_nil(buf)?;
    Ok(())
}

/// `[0x7e, sequence, clientSentAt, nil]` into a stack buffer.
///
/// Returns the number of bytes written.
pub fn write_client_heartbeat(
    out: &mut [u8; HEARTBEAT_BUFFER_SIZE],
    sequence: i16,
    client_sent_at: i64,
) -> Result<usize> {
    let mut cursor: &mut [u8] = &mut out[..];
    write_array_len(&mut cursor, 4)?;
    write_pfix(&mut cursor, tags::CLIENT_HEARTBEAT)?;
    write_sint(&mut cursor, sequence.into())?;
    write_sint(&mut cursor, client_sent_at)?;
    write_nil(&mut cursor)?;
    Ok(HEARTBEAT_BUFFER_SIZE - cursor.len())
}

/// `[0x7f, sequence, serverSentAt, nil]` into a stack buffer, echoing the
/// server's values.
///
/// Returns the number of bytes written.
pub fn write_server_heartbeat_response(
    out: &mut [u8; HEARTBEAT_BUFFER_SIZE],
    sequence: i16,
    server_sent_at: Option<i64>,
) -> Result<usize> {
    let mut cursor: &mut [u8] = &mut out[..];
    write_array_len(&mut cursor, 4)?;
    write_pfix(&mut cursor, tags::SERVER_HEARTBEAT)?;
    write_sint(&mut cursor, sequence.into())?;
    write_opt_sint(&mut cursor, server_sent_at)?;
    write_nil(&mut cursor)?;
    Ok(HEARTBEAT_BUFFER_SIZE - cursor.len())
}
