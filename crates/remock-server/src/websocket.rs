//! WebSocket accept path: handshake, auth gate, read/write loops.
//!
//! Interceptor clients connect with a WebSocket upgrade on
//! [`WS_PATH`]. The bearer token travels in the upgrade request
//! (`Authorization: Bearer <value>` or a `token` query parameter). The
//! auth gate runs after the protocol upgrade so a rejection can be
//! delivered as a structured `rejected` frame before the close.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::header;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use remock_core::protocol::{ClientMessage, ServerMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;

use crate::errors::AuthError;
use crate::registry::Connection;
use crate::server::{ServerState, SharedState};

/// Reserved path interceptor clients connect to.
pub(crate) const WS_PATH: &str = "/__remock/ws";

/// Answer a WebSocket upgrade request on [`WS_PATH`].
///
/// Returns the `101 Switching Protocols` response and spawns the
/// connection task on the server's task tracker.
pub(crate) fn handle_upgrade(
    state: SharedState,
    mut req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY) else {
        tracing::warn!("upgrade request without Sec-WebSocket-Key");
        let mut response = Response::new(Full::new(Bytes::from("expected websocket upgrade")));
        *response.status_mut() = StatusCode::BAD_REQUEST;
        return response;
    };
    let accept = derive_accept_key(key.as_bytes());
    let token = bearer_token(&req);

    let on_upgrade = hyper::upgrade::on(&mut req);
    let task_state = Arc::clone(&state);
    let _ = state.tracker.spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => serve_socket(task_state, upgraded, token).await,
            Err(e) => tracing::warn!(error = %e, "websocket upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to build upgrade response");
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        })
}

/// Extract the bearer token from an upgrade request: `Authorization:
/// Bearer <value>` wins, then a `token` query parameter.
fn bearer_token<B>(req: &Request<B>) -> Option<String> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_owned());
            }
        }
    }
    req.uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(ToOwned::to_owned)
}

/// Run the auth gate for a fresh socket.
///
/// Without a tokens directory every connection is accepted. With one, a
/// token is required and must verify; the precise rejection cause is
/// logged while the caller only sees the uniform [`AuthError`].
fn authenticate(
    tokens_dir: Option<&Path>,
    token: Option<&str>,
) -> Result<Option<String>, AuthError> {
    let Some(dir) = tokens_dir else {
        return Ok(None);
    };
    let Some(value) = token else {
        return Err(AuthError::NoTokenProvided);
    };
    match remock_tokens::verify(value, dir) {
        Ok(record) => Ok(Some(record.id)),
        Err(invalid) => {
            tracing::warn!(
                reason = invalid.reason().as_str(),
                "interceptor token rejected"
            );
            Err(AuthError::InvalidToken)
        }
    }
}

/// Drive one upgraded socket: authenticate, then either reject or run the
/// connection loops.
async fn serve_socket(state: SharedState, upgraded: Upgraded, token: Option<String>) {
    let io = TokioIo::new(upgraded);
    let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;

    match authenticate(state.config.tokens_dir.as_deref(), token.as_deref()) {
        Ok(token_id) => run_connection(state, ws, token_id).await,
        Err(error) => reject(ws, error).await,
    }
}

/// Send the structured rejection frame, then close.
async fn reject<S>(mut ws: WebSocketStream<S>, error: AuthError)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::warn!(reason = %error, "connection rejected");
    let frame = ServerMessage::Rejected {
        reason: error.reason(),
    };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = ws.send(Message::text(json)).await;
    }
    let _ = ws.close(None).await;
}

/// Register the connection and run its read/write loops until either half
/// ends, then cascade the teardown.
async fn run_connection<S>(state: SharedState, ws: WebSocketStream<S>, token_id: Option<String>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let cancel = state.shutdown.child_token();
    let (connection, mut outbox) =
        state
            .registry
            .register(token_id, cancel.clone(), state.config.max_send_queue);
    tracing::info!(
        connection_id = %connection.id,
        token_id = connection.token_id().unwrap_or("-"),
        "interceptor connected"
    );

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Writer: drains the outbound queue, sends heartbeat pings, closes on
    // cancellation or heartbeat timeout.
    let heartbeat_interval = Duration::from_secs(state.config.heartbeat_interval_secs.max(1));
    let max_missed = (state.config.heartbeat_timeout_secs
        / state.config.heartbeat_interval_secs.max(1))
    .max(1) as u32;
    let writer_conn = Arc::clone(&connection);
    let writer_cancel = cancel.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat_interval);
        ping.tick().await; // consume the immediate first tick
        let mut missed: u32 = 0;
        loop {
            tokio::select! {
                frame = outbox.recv() => match frame {
                    Some(message) => {
                        let json = match serde_json::to_string(&message) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!(error = %e, "failed to serialize frame");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if writer_conn.check_alive() {
                        missed = 0;
                    } else {
                        missed += 1;
                        if missed >= max_missed {
                            tracing::warn!(connection_id = %writer_conn.id, "heartbeat timed out");
                            break;
                        }
                    }
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                () = writer_cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Reader: parses protocol frames and tracks liveness.
    let reader_state = Arc::clone(&state);
    let reader_conn = Arc::clone(&connection);
    let reader_cancel = cancel.clone();
    let mut reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        reader_conn.mark_alive();
                        handle_frame(&reader_state, &reader_conn, text.as_str());
                    }
                    Some(Ok(Message::Pong(_))) => reader_conn.mark_alive(),
                    Some(Ok(Message::Close(_))) | None => break,
                    // Binary frames are not part of the protocol; pings are
                    // answered by tungstenite itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %reader_conn.id, error = %e, "websocket read error");
                        break;
                    }
                },
                () = reader_cancel.cancelled() => break,
            }
        }
    });

    // Either half finishing tears the connection down; wait for the other
    // so the cascade runs after both loops released the socket.
    tokio::select! {
        _ = &mut writer => {
            cancel.cancel();
            let _ = reader.await;
        }
        _ = &mut reader => {
            cancel.cancel();
            let _ = writer.await;
        }
    }

    let _ = state.registry.unregister(&connection.id);
    let commitments_removed = state.commitments.uncommit(&connection.id, None, None);
    let calls_rejected = state.correlator.fail_connection(&connection.id);
    tracing::info!(
        connection_id = %connection.id,
        commitments_removed,
        calls_rejected,
        "interceptor disconnected"
    );
}

/// Handle one inbound protocol frame.
///
/// Frames are validated by serde before any dispatch logic; an invalid
/// frame is logged and ignored. Acks are sent only after the table
/// mutation completes, so a client that awaited its ack can rely on the
/// routing being in place.
fn handle_frame(state: &ServerState, connection: &Connection, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(connection_id = %connection.id, error = %e, "invalid protocol frame");
            return;
        }
    };
    match message {
        ClientMessage::Commit { id, method, url } => {
            state.commitments.commit(&connection.id, &method, &url);
            let _ = connection.send(ServerMessage::Ack { id });
        }
        ClientMessage::Uncommit { id, method, url } => {
            let _ = state
                .commitments
                .uncommit(&connection.id, method.as_deref(), url.as_deref());
            let _ = connection.send(ServerMessage::Ack { id });
        }
        ClientMessage::Reply { id, outcome } => {
            let _ = state.correlator.resolve(&id, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn upgrade_request(uri: &str, auth: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn bearer_token_from_header() {
        let req = upgrade_request("/__remock/ws", Some("Bearer abc123"));
        assert_eq!(bearer_token(&req).as_deref(), Some("abc123"));
    }

    #[test]
    fn bearer_token_from_query() {
        let req = upgrade_request("/__remock/ws?token=def456", None);
        assert_eq!(bearer_token(&req).as_deref(), Some("def456"));
    }

    #[test]
    fn header_wins_over_query() {
        let req = upgrade_request("/__remock/ws?token=query", Some("Bearer header"));
        assert_eq!(bearer_token(&req).as_deref(), Some("header"));
    }

    #[test]
    fn no_token_anywhere() {
        let req = upgrade_request("/__remock/ws", None);
        assert_eq!(bearer_token(&req), None);
        let req = upgrade_request("/__remock/ws?other=1", Some("Basic xyz"));
        assert_eq!(bearer_token(&req), None);
    }

    #[test]
    fn authenticate_open_server_accepts_anything() {
        assert_eq!(authenticate(None, None).unwrap(), None);
        assert_eq!(authenticate(None, Some("whatever")).unwrap(), None);
    }

    #[test]
    fn authenticate_requires_token_when_dir_configured() {
        let dir = TempDir::new().unwrap();
        let err = authenticate(Some(dir.path()), None).unwrap_err();
        assert_eq!(err, AuthError::NoTokenProvided);
    }

    #[test]
    fn authenticate_rejects_bad_token() {
        let dir = TempDir::new().unwrap();
        let err = authenticate(Some(dir.path()), Some("garbage")).unwrap_err();
        assert_eq!(err, AuthError::InvalidToken);
    }

    #[test]
    fn authenticate_accepts_created_token() {
        let dir = TempDir::new().unwrap();
        let created =
            remock_tokens::create(None, remock_tokens::SECRET_BYTES, dir.path()).unwrap();
        let token_id = authenticate(Some(dir.path()), Some(&created.value))
            .unwrap()
            .unwrap();
        assert_eq!(token_id, created.id);
    }

    #[test]
    fn authenticate_rejects_removed_token() {
        let dir = TempDir::new().unwrap();
        let created =
            remock_tokens::create(None, remock_tokens::SECRET_BYTES, dir.path()).unwrap();
        remock_tokens::remove(&created.id, dir.path()).unwrap();
        let err = authenticate(Some(dir.path()), Some(&created.value)).unwrap_err();
        assert_eq!(err, AuthError::InvalidToken);
    }
}
