//! Request/response and fire-and-forget calls against an in-process server.

mod common;

use std::sync::Arc;

use common::{codec, connect_default};
use serde::{Deserialize, Serialize};
use streaminghub_client::protocol::{
    decode_client_message, encode_response, encode_response_with_error, HubMessage,
};
use streaminghub_client::{DisconnectionReason, HubError, RemoteError};
use tokio_util::sync::CancellationToken;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Greeting {
    name: String,
    times: u32,
}

/// A call is sent as `[messageId, methodId, args]` and resolved by its response.
#[tokio::test]
async fn test_call_round_trip() {
    let (session, _broadcasts, mut server) = connect_default();
    let session = Arc::new(session);

    let caller = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .call::<_, String>(
                    5,
                    &Greeting {
                        name: "ada".into(),
                        times: 2,
                    },
                )
                .await
        })
    };

    let payload = server.recv_call().await;
    let (message_id, args) = match decode_client_message(&payload).unwrap() {
        HubMessage::Request {
            message_id,
            method_id: 5,
            body,
        } => (message_id, rmp_serde::from_slice::<Greeting>(body).unwrap()),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(args.name, "ada");

    let reply = args.name.repeat(args.times as usize);
    server
        .send_with(|buf| encode_response(buf, message_id, 5, &reply, &codec()))
        .await;

    assert_eq!(caller.await.unwrap().unwrap(), "adaada");
    assert_eq!(session.pending_calls(), 0);
}

/// Concurrent calls get distinct ids and each receives its own result,
/// even when the server answers out of order.
#[tokio::test]
async fn test_concurrent_calls_resolve_independently() {
    let (session, _broadcasts, mut server) = connect_default();
    let session = Arc::new(session);

    let callers: Vec<_> = (0..10i32)
        .map(|n| {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call::<_, i32>(1, &n).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..10 {
        let payload = server.recv_call().await;
        match decode_client_message(&payload).unwrap() {
            HubMessage::Request {
                message_id, body, ..
            } => requests.push((message_id, rmp_serde::from_slice::<i32>(body).unwrap())),
            other => panic!("unexpected {other:?}"),
        }
    }

    let mut ids: Vec<i32> = requests.iter().map(|(id, _)| *id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 10);

    for (message_id, n) in requests.iter().rev() {
        server
            .send_with(|buf| encode_response(buf, *message_id, 1, &(n * 10), &codec()))
            .await;
    }

    for (n, caller) in callers.into_iter().enumerate() {
        assert_eq!(caller.await.unwrap().unwrap(), n as i32 * 10);
    }
}

/// An error response fails only the matching call.
#[tokio::test]
async fn test_error_response() {
    let (session, _broadcasts, mut server) = connect_default();
    let session = Arc::new(session);

    let caller = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.call::<_, ()>(3, &()).await })
    };

    let payload = server.recv_call().await;
    let HubMessage::Request { message_id, .. } = decode_client_message(&payload).unwrap() else {
        panic!("expected a request");
    };
    server
        .send_with(|buf| {
            encode_response_with_error(buf, message_id, 5, Some("not found"), Some("at Hub.Find"))
        })
        .await;

    match caller.await.unwrap() {
        Err(HubError::Remote(e)) => assert_eq!(
            e,
            RemoteError {
                status_code: 5,
                detail: "not found".into(),
                message: Some("at Hub.Find".into()),
            }
        ),
        other => panic!("unexpected {other:?}"),
    }
    assert!(session.is_connected());
}

/// Responses for unknown ids are dropped and the session keeps working.
#[tokio::test]
async fn test_stale_response_is_ignored() {
    let (session, _broadcasts, mut server) = connect_default();
    let session = Arc::new(session);

    server
        .send_with(|buf| encode_response(buf, 777, 1, &"stale", &codec()))
        .await;
    server
        .send_with(|buf| encode_response_with_error(buf, 778, 13, None, None))
        .await;

    let caller = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.call::<_, bool>(1, &()).await })
    };
    let payload = server.recv_call().await;
    let HubMessage::Request { message_id, .. } = decode_client_message(&payload).unwrap() else {
        panic!("expected a request");
    };
    server
        .send_with(|buf| encode_response(buf, message_id, 1, &true, &codec()))
        .await;

    assert!(caller.await.unwrap().unwrap());
    assert!(session.is_connected());
}

/// A result that does not decode fails that call only.
#[tokio::test]
async fn test_undecodable_result_is_not_fatal() {
    let (session, _broadcasts, mut server) = connect_default();
    let session = Arc::new(session);

    let caller = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.call::<_, u8>(1, &()).await })
    };
    let payload = server.recv_call().await;
    let HubMessage::Request { message_id, .. } = decode_client_message(&payload).unwrap() else {
        panic!("expected a request");
    };
    server
        .send_with(|buf| encode_response(buf, message_id, 1, &"text", &codec()))
        .await;

    assert!(matches!(
        caller.await.unwrap(),
        Err(HubError::MsgPackDecode(_))
    ));
    assert!(session.is_connected());
}

/// Fire-and-forget calls carry no message id.
#[tokio::test]
async fn test_call_void() {
    let (session, _broadcasts, mut server) = connect_default();

    session.call_void(9, &("join", 1)).await.unwrap();
    session.call_void(9, &("leave", 2)).await.unwrap();

    for expected in [("join", 1), ("leave", 2)] {
        let payload = server.recv_call().await;
        match decode_client_message(&payload).unwrap() {
            HubMessage::RequestFireAndForget { method_id, body } => {
                assert_eq!(method_id, 9);
                let (action, n): (String, i32) = rmp_serde::from_slice(body).unwrap();
                assert_eq!((action.as_str(), n), expected);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(session.pending_calls(), 0);
}

/// Cancelling a call removes it; a later response for it is ignored.
#[tokio::test]
async fn test_call_with_cancellation() {
    let (session, _broadcasts, mut server) = connect_default();
    let session = Arc::new(session);
    let token = CancellationToken::new();

    let caller = {
        let session = Arc::clone(&session);
        let token = token.clone();
        tokio::spawn(async move {
            session
                .call_with_cancellation::<_, i32>(2, &(), &token)
                .await
        })
    };

    let payload = server.recv_call().await;
    let HubMessage::Request { message_id, .. } = decode_client_message(&payload).unwrap() else {
        panic!("expected a request");
    };
    token.cancel();
    assert!(matches!(caller.await.unwrap(), Err(HubError::Cancelled)));
    assert_eq!(session.pending_calls(), 0);

    server
        .send_with(|buf| encode_response(buf, message_id, 2, &1, &codec()))
        .await;
    session.call_void(0, &()).await.unwrap();
    server.recv_call().await;
    assert!(session.is_connected());
}

/// An already-cancelled token fails before anything is sent.
#[tokio::test]
async fn test_cancelled_token_sends_nothing() {
    let (session, _broadcasts, mut server) = connect_default();
    let token = CancellationToken::new();
    token.cancel();

    let result = session
        .call_with_cancellation::<_, i32>(2, &(), &token)
        .await;
    assert!(matches!(result, Err(HubError::Cancelled)));

    session.call_void(1, &()).await.unwrap();
    let payload = server.recv_call().await;
    assert!(matches!(
        decode_client_message(&payload).unwrap(),
        HubMessage::RequestFireAndForget { method_id: 1, .. }
    ));
}

/// Calls on a closed session fail with the disconnection reason.
#[tokio::test]
async fn test_calls_after_server_close() {
    let (session, _broadcasts, mut server) = connect_default();
    server.close().await;

    assert_eq!(
        session.wait_for_disconnect().await,
        DisconnectionReason::CompletedNormally
    );
    assert!(matches!(
        session.call::<_, i32>(1, &()).await,
        Err(HubError::Disconnected(DisconnectionReason::CompletedNormally))
    ));
    assert!(matches!(
        session.call_void(1, &()).await,
        Err(HubError::Disconnected(DisconnectionReason::CompletedNormally))
    ));
}
