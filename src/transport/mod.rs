//! Transport module - framing of hub messages on the duplex byte stream.

mod framing;

pub use framing::{frame_message, FrameBuffer, Prefix, DEFAULT_MAX_MESSAGE_SIZE, PREFIX_SIZE};
