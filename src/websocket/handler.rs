use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::auth::Claims;
use crate::connection_manager::ConnectionHandle;
use crate::error::AppError;
use crate::hub::{reasons, HubError};
use crate::metrics::WsMessageMetrics;
use crate::ratelimit::{RateLimitResult, RequestIdentity, RuleKind};
use crate::server::AppState;

use super::message::{ClientMessage, ControlMessage};

/// Close code for hub-initiated closes other than shutdown
const CLOSE_CODE_EVICTED: u16 = 4000;
const CLOSE_CODE_GOING_AWAY: u16 = 1001;

/// Upper bound on the closing handshake towards a peer that stopped reading
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub device_id: Option<String>,
}

/// WebSocket upgrade handler.
///
/// The token is validated before the upgrade so that bad credentials get a
/// plain 401. Membership resolution and registration happen after it.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let token = extract_token(&query, &headers).ok_or(HubError::Unauthorized(
        crate::auth::AuthError::MissingToken,
    ))?;

    let claims = state.hub.authenticate(&token).await?;
    tracing::info!(user_id = %claims.sub, "WebSocket upgrade requested");

    let device_id = query.device_id;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, claims, device_id))
        .into_response())
}

/// Extract token from query parameter or Authorization header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(ref token) = query.token {
        return Some(token.clone());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

#[tracing::instrument(
    name = "ws.connection",
    skip(socket, state, claims, device_id),
    fields(user_id = %claims.sub)
)]
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    claims: Claims,
    device_id: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Client going away during setup cancels it
    let setup_cancel = CancellationToken::new();
    let admit = state.hub.admit(&claims, device_id, &setup_cancel);
    tokio::pin!(admit);

    let admitted = loop {
        tokio::select! {
            result = &mut admit => break result,
            incoming = receiver.next(), if !setup_cancel.is_cancelled() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => setup_cancel.cancel(),
                Some(Ok(_)) => {
                    tracing::debug!(user_id = %claims.sub, "Frame received during setup, dropped");
                }
            },
        }
    };

    let handle = match admitted {
        Ok(handle) => handle,
        Err(e) => {
            reject(&mut sender, &e).await;
            return;
        }
    };
    let connection_id = handle.id;

    tracing::info!(
        connection_id = %connection_id,
        user_id = %handle.user_id,
        rooms = handle.room_count(),
        "WebSocket connection established"
    );

    let writer_handle = handle.clone();
    let mut send_task = tokio::spawn(write_loop(sender, writer_handle));

    let reader_state = state.clone();
    let reader_handle = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &reader_state, &reader_handle).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    let closed = handle.cancellation();
    tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
            recv_task.abort();
        }
        _ = closed.cancelled() => {
            tracing::debug!(connection_id = %connection_id, "Connection closed by hub");
            recv_task.abort();
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut send_task).await.is_err() {
                send_task.abort();
            }
        }
        _ = &mut recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
            state.hub.disconnect(connection_id, reasons::CLIENT_CLOSED);
            let _ = (&mut send_task).await;
        }
    }

    // No-op when the hub already closed it
    state.hub.disconnect(connection_id, reasons::CLIENT_CLOSED);
}

/// Drain the connection's outbound queue onto the socket. The queue is the
/// only path to the client; nothing else writes to `sender`.
///
/// Every send races the connection's cancellation, so a peer that stopped
/// reading cannot keep the writer alive after the hub closed it.
async fn write_loop<S>(mut sender: S, handle: Arc<ConnectionHandle>)
where
    S: Sink<Message> + Unpin,
{
    let closed = handle.cancellation();
    while let Some(outbound) = handle.next_outbound().await {
        let text = match outbound.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                continue;
            }
        };

        tokio::select! {
            _ = closed.cancelled() => {
                tracing::debug!(connection_id = %handle.id, "Writer cancelled mid-send");
                return;
            }
            sent = sender.send(Message::Text(text.into())) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        handle.record_write();
    }

    match handle.close_reason() {
        Some(reason) if reason != reasons::CLIENT_CLOSED => {
            let code = if reason == reasons::SERVER_SHUTDOWN {
                CLOSE_CODE_GOING_AWAY
            } else {
                CLOSE_CODE_EVICTED
            };
            send_close(&mut sender, ControlMessage::closing(reason.clone()), code, reason).await;
        }
        _ => {}
    }
}

async fn reject<S>(sender: &mut S, error: &HubError)
where
    S: Sink<Message> + Unpin,
{
    send_close(
        sender,
        ControlMessage::closing(error.close_reason()),
        error.close_code(),
        error.close_reason().to_string(),
    )
    .await;
}

async fn send_close<S>(sender: &mut S, closing: ControlMessage, code: u16, reason: String)
where
    S: Sink<Message> + Unpin,
{
    let handshake = async {
        if let Ok(json) = serde_json::to_string(&closing) {
            let _ = sender.send(Message::Text(json.into())).await;
        }
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
        let _ = sender.close().await;
    };

    if tokio::time::timeout(CLOSE_TIMEOUT, handshake).await.is_err() {
        tracing::debug!(code = code, "Closing handshake timed out");
    }
}

/// Process a received WebSocket message.
/// Returns false if the connection should be closed.
async fn process_message(msg: Message, state: &AppState, handle: &Arc<ConnectionHandle>) -> bool {
    match msg {
        Message::Text(text) => {
            handle.update_activity();
            if !admit_message(state, handle).await {
                return true;
            }

            match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(client_msg) => state.hub.handle_client_message(handle, client_msg),
                Err(e) => {
                    WsMessageMetrics::record_malformed();
                    tracing::warn!(connection_id = %handle.id, error = %e, "Failed to parse client message");
                    handle.send_control(ControlMessage::error("invalid_message", e.to_string()));
                }
            }
            true
        }
        Message::Binary(_) => {
            handle.send_control(ControlMessage::error(
                "unsupported_format",
                "Binary messages are not supported",
            ));
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            handle.update_activity();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            false
        }
    }
}

/// Per-user inbound rate limit. A denied frame is answered with
/// `rate_limited` and otherwise ignored.
async fn admit_message(state: &AppState, handle: &Arc<ConnectionHandle>) -> bool {
    let identity = RequestIdentity::user(handle.user_id.clone());
    let result = state
        .limiter
        .check_cancellable(RuleKind::WsMessage, &identity, &handle.cancellation())
        .await;

    match result {
        RateLimitResult::Denied {
            limit,
            reset_at,
            retry_after,
        } => {
            handle.send_control(ControlMessage::RateLimited {
                retry_after,
                limit,
                reset_at,
            });
            false
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_token_prefers_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));

        let query = WsQuery {
            token: Some("from-query".into()),
            device_id: None,
        };
        assert_eq!(extract_token(&query, &headers).as_deref(), Some("from-query"));

        let query = WsQuery {
            token: None,
            device_id: None,
        };
        assert_eq!(extract_token(&query, &headers).as_deref(), Some("from-header"));
        assert!(extract_token(&query, &HeaderMap::new()).is_none());
    }

    fn stalled_sink() -> impl Sink<Message> + Unpin {
        Box::pin(futures::sink::unfold((), |(), _frame: Message| {
            futures::future::pending::<Result<(), std::convert::Infallible>>()
        }))
    }

    #[tokio::test]
    async fn test_writer_blocked_in_send_exits_when_closed() {
        let handle = Arc::new(ConnectionHandle::new("alice", None, 8));
        handle.send_control(ControlMessage::Pong);

        let writer = tokio::spawn(write_loop(stalled_sink(), handle.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        assert_eq!(handle.writes_completed(), 0);

        handle.close_with_reason(reasons::UNRESPONSIVE);
        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should exit after close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closing_handshake_is_bounded() {
        let mut sink = stalled_sink();
        let handshake = send_close(
            &mut sink,
            ControlMessage::closing("unresponsive"),
            4000,
            "unresponsive".into(),
        );
        tokio::time::timeout(CLOSE_TIMEOUT * 2, handshake)
            .await
            .expect("closing handshake should give up");
    }

    #[test]
    fn test_non_bearer_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        let query = WsQuery {
            token: None,
            device_id: None,
        };
        assert!(extract_token(&query, &headers).is_none());
    }
}
