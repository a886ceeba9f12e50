//! gRPC length-prefixed message framing.
//!
//! A duplex gRPC call carries each StreamingHub message as one
//! length-prefixed message:
//! ```text
//! ┌────────────┬──────────────┬─────────────────────┐
//! │ Compressed │ Length       │ Message             │
//! │ 1 byte     │ 4 bytes      │ Length bytes        │
//! │ 0 or 1     │ uint32 BE    │ MessagePack array   │
//! └────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! [`FrameBuffer`] accumulates partial reads and yields every complete
//! message as a pooled [`Payload`].

use bytes::BytesMut;

use crate::error::{HubError, Result};
use crate::protocol::{Payload, PayloadPool};

/// Prefix size in bytes (fixed, exactly 5).
pub const PREFIX_SIZE: usize = 5;

/// Default maximum message size (4 MiB, the gRPC default).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 4 * 1024 * 1024;

/// Decoded message prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    /// Whether the message is compressed. Compression is never negotiated.
    pub compressed: bool,
    /// Message length in bytes.
    pub length: u32,
}

impl Prefix {
    /// Prefix for an uncompressed message.
    pub fn new(length: u32) -> Self {
        Self {
            compressed: false,
            length,
        }
    }

    /// Prefix for a message of `len` bytes, failing when it cannot be framed.
    pub fn for_len(len: usize) -> Result<Self> {
        u32::try_from(len)
            .map(Self::new)
            .map_err(|_| HubError::Protocol(format!("message of {len} bytes cannot be framed")))
    }

    /// Encode to bytes (Big Endian).
    ///
    /// ```
    /// use streaminghub_client::transport::Prefix;
    ///
    /// assert_eq!(Prefix::new(258).encode(), [0, 0, 0, 1, 2]);
    /// ```
    pub fn encode(&self) -> [u8; PREFIX_SIZE] {
        let mut buf = [0u8; PREFIX_SIZE];
        buf[0] = u8::from(self.compressed);
        buf[1..5].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decode from bytes. Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PREFIX_SIZE {
            return None;
        }
        Some(Self {
            compressed: buf[0] != 0,
            length: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
        })
    }

    /// Reject compressed messages and messages larger than `max_message_size`.
    pub fn validate(&self, max_message_size: u32) -> Result<()> {
        if self.compressed {
            return Err(HubError::Protocol(
                "compressed messages are not supported".to_string(),
            ));
        }
        if self.length > max_message_size {
            return Err(HubError::Protocol(format!(
                "Message size {} exceeds maximum {}",
                self.length, max_message_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Need 5 prefix bytes.
    WaitingForPrefix,
    /// Prefix parsed, need `length` message bytes.
    WaitingForMessage { length: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete messages.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_message_size: u32,
    pool: &'static PayloadPool,
}

impl FrameBuffer {
    /// Create a frame buffer with the default max message size.
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a frame buffer with a custom max message size.
    pub fn with_max_message_size(max_message_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForPrefix,
            max_message_size,
            pool: PayloadPool::shared(),
        }
    }

    /// Rent payloads from `pool` instead of the shared pool.
    pub fn with_pool(mut self, pool: &'static PayloadPool) -> Self {
        self.pool = pool;
        self
    }

    /// Push data into the buffer and extract all complete messages.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for compressed or oversized messages.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Payload>> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some(message) = self.try_extract_one()? {
            messages.push(message);
        }
        Ok(messages)
    }

    fn try_extract_one(&mut self) -> Result<Option<Payload>> {
        loop {
            match self.state {
                State::WaitingForPrefix => {
                    let Some(prefix) = Prefix::decode(&self.buffer) else {
                        return Ok(None);
                    };
                    prefix.validate(self.max_message_size)?;

                    let _ = self.buffer.split_to(PREFIX_SIZE);
                    self.state = State::WaitingForMessage {
                        length: prefix.length as usize,
                    };
                }
                State::WaitingForMessage { length } => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }

                    let bytes = self.buffer.split_to(length);
                    self.state = State::WaitingForPrefix;
                    return Ok(Some(self.pool.rent_or_create(&bytes)));
                }
            }
        }
    }

    /// Number of buffered bytes not yet part of a complete message.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is buffered and no message is in progress.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, State::WaitingForPrefix)
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForPrefix;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForPrefix => "WaitingForPrefix",
            State::WaitingForMessage { .. } => "WaitingForMessage",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame a message into prefix + bytes.
pub fn frame_message(message: &[u8]) -> Result<Vec<u8>> {
    let prefix = Prefix::for_len(message.len())?;
    let mut out = Vec::with_capacity(PREFIX_SIZE + message.len());
    out.extend_from_slice(&prefix.encode());
    out.extend_from_slice(message);
    Ok(out)
}
