//! In-process hub server for driving a real session over `tokio::io::duplex`.

#![allow(dead_code)]

use std::collections::VecDeque;

use streaminghub_client::codec::{HubCodec, MsgPackCodec};
use streaminghub_client::error::Result;
use streaminghub_client::protocol::{decode_client_message, HubMessage, Payload};
use streaminghub_client::transport::{frame_message, FrameBuffer};
use streaminghub_client::{Broadcasts, HubSession, HubSessionBuilder};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const DUPLEX_CAPACITY: usize = 64 * 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server end of a session under test.
pub struct FakeServer {
    stream: DuplexStream,
    frames: FrameBuffer,
    ready: VecDeque<Payload>,
    buf: Vec<u8>,
}

/// Connect a session built by `builder` to a fresh fake server.
pub fn connect<C: HubCodec>(
    builder: HubSessionBuilder<C>,
) -> (HubSession<C>, Broadcasts, FakeServer) {
    init_tracing();
    let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
    let (session, broadcasts) = builder.connect(client).unwrap();
    (session, broadcasts, FakeServer::new(server))
}

/// Connect a default MessagePack session.
pub fn connect_default() -> (HubSession, Broadcasts, FakeServer) {
    connect(HubSession::builder())
}

pub fn codec() -> MsgPackCodec {
    MsgPackCodec::default()
}

impl FakeServer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            frames: FrameBuffer::new(),
            ready: VecDeque::new(),
            buf: vec![0u8; 16 * 1024],
        }
    }

    /// Next message sent by the client, or `None` once it closed its side.
    pub async fn recv(&mut self) -> Option<Payload> {
        loop {
            if let Some(payload) = self.ready.pop_front() {
                return Some(payload);
            }
            let n = self.stream.read(&mut self.buf).await.ok()?;
            if n == 0 {
                return None;
            }
            self.ready.extend(self.frames.push(&self.buf[..n]).unwrap());
        }
    }

    /// Next client message that is not a heartbeat.
    pub async fn recv_call(&mut self) -> Payload {
        loop {
            let payload = self.recv().await.expect("client closed the stream");
            match decode_client_message(&payload).unwrap() {
                HubMessage::ClientHeartbeat { .. } | HubMessage::ServerHeartbeatResponse { .. } => {
                    continue
                }
                _ => return payload,
            }
        }
    }

    /// Frame and send one encoded message.
    pub async fn send(&mut self, message: &[u8]) {
        let bytes = frame_message(message).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Encode a message with `encode`, then frame and send it.
    pub async fn send_with(&mut self, encode: impl FnOnce(&mut Vec<u8>) -> Result<()>) {
        let mut message = Vec::new();
        encode(&mut message).unwrap();
        self.send(&message).await;
    }

    /// The underlying stream, for writing malformed bytes.
    pub fn raw(&mut self) -> &mut DuplexStream {
        &mut self.stream
    }

    /// Close the server's write side.
    pub async fn close(&mut self) {
        self.stream.shutdown().await.unwrap();
    }
}
