//! Protocol module - StreamingHub message shapes, codec and payload buffers.
//!
//! This module implements the message layer carried inside each transport frame:
//! - Message shapes and sub-type tags
//! - Borrowing decoder for both directions
//! - Encoders for every shape
//! - Pooled payload buffers backing in-flight messages

mod message;
mod payload_pool;
mod reader;
mod writer;

pub use message::{tags, HubMessage, MessageBody, MessageType};
pub use payload_pool::{Payload, PayloadPool, MAX_POOLED_CAPACITY, PAYLOAD_POOL_SIZE, POISON_BYTE};
pub use reader::{decode_client_message, decode_server_message, MessageReader};
pub use writer::{
    encode_broadcast, encode_client_heartbeat_response, encode_client_result_request,
    encode_client_result_response, encode_client_result_response_error, encode_request,
    encode_request_fire_and_forget, encode_response, encode_response_with_error,
    encode_server_heartbeat, write_client_heartbeat, write_server_heartbeat_response,
    HEARTBEAT_BUFFER_SIZE,
};
