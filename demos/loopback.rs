//! Loopback demo: a session talking to a tiny in-process hub server.
//!
//! Run with `RUST_LOG=debug cargo run --example loopback`.

use std::time::Duration;

use streaminghub_client::codec::MsgPackCodec;
use streaminghub_client::protocol::{
    decode_client_message, encode_broadcast, encode_client_heartbeat_response,
    encode_client_result_request, encode_response, HubMessage,
};
use streaminghub_client::transport::{frame_message, FrameBuffer};
use streaminghub_client::HubSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const METHOD_ADD: i32 = 1;
const METHOD_JOIN: i32 = 2;
const METHOD_ASK_NAME: i32 = 10;
const BROADCAST_WELCOME: i32 = 100;

async fn send(stream: &mut DuplexStream, message: Vec<u8>) -> std::io::Result<()> {
    let framed = frame_message(&message).map_err(std::io::Error::other)?;
    stream.write_all(&framed).await
}

/// Answers `add`, greets joiners and asks them for their name.
async fn serve(mut stream: DuplexStream) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let codec = MsgPackCodec::default();
    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            tracing::info!("client closed the stream");
            return Ok(());
        }

        for payload in frames.push(&buf[..n])? {
            let mut reply = Vec::new();
            match decode_client_message(&payload)? {
                HubMessage::Request {
                    message_id,
                    method_id: METHOD_ADD,
                    body,
                } => {
                    let (a, b): (i32, i32) = rmp_serde::from_slice(body)?;
                    encode_response(&mut reply, message_id, METHOD_ADD, &(a + b), &codec)?;
                }
                HubMessage::RequestFireAndForget {
                    method_id: METHOD_JOIN,
                    body,
                } => {
                    let room: String = rmp_serde::from_slice(body)?;
                    let mut welcome = Vec::new();
                    let text = format!("welcome to {room}");
                    encode_broadcast(&mut welcome, BROADCAST_WELCOME, &text, &codec)?;
                    send(&mut stream, welcome).await?;
                    let request_id = Uuid::new_v4();
                    encode_client_result_request(&mut reply, request_id, METHOD_ASK_NAME, &(), &codec)?;
                }
                HubMessage::ClientResultResponse { body, .. } => {
                    let name: String = rmp_serde::from_slice(body)?;
                    tracing::info!(%name, "client introduced itself");
                }
                HubMessage::ClientHeartbeat { sequence, sent_at, .. } => {
                    encode_client_heartbeat_response(&mut reply, sequence, sent_at)?;
                }
                other => tracing::warn!(message_type = ?other.message_type(), "unhandled message"),
            }
            if !reply.is_empty() {
                send(&mut stream, reply).await?;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (client, server) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(serve(server));

    let (session, mut broadcasts) = HubSession::builder()
        .heartbeat_interval(Duration::from_millis(200))
        .heartbeat_timeout(Duration::from_secs(1))
        .on_client_heartbeat_response(|event| {
            tracing::info!(sequence = event.sequence, rtt = ?event.round_trip_time, "heartbeat");
        })
        .on_client_result(METHOD_ASK_NAME, |_: (), ctx| async move {
            tracing::info!(request_id = %ctx.request_id(), "server asked for our name");
            Ok("loopback-demo".to_string())
        })
        .connect(client)?;

    let sum: i32 = session.call(METHOD_ADD, &(2, 40)).await?;
    tracing::info!(sum, "add returned");

    session.call_void(METHOD_JOIN, &"lobby").await?;
    if let Some(broadcast) = broadcasts.recv().await {
        let text: String = broadcast.decode(session.codec())?;
        tracing::info!(method_id = broadcast.method_id, %text, "broadcast");
    }

    tokio::time::sleep(Duration::from_millis(700)).await;
    session.dispose().await;
    tracing::info!(reason = %session.wait_for_disconnect().await, "session closed");

    if let Err(e) = server.await? {
        tracing::error!(error = %e, "server failed");
    }
    Ok(())
}
