//! WebSocket relay gateway.
//!
//! One task per connection reads client events and dispatches them; one
//! writer task owns the socket's send half behind an mpsc channel, so every
//! producer (dispatch, open tasks, session drains) shares a single ordered
//! outbound stream. All session events for a connection therefore reach the
//! client in the order they were produced, and `session.closed` can never
//! overtake the data that preceded it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::backend::{self, BackendEvent, SessionKind};
use crate::error::{AuthError, SessionError};
use crate::registry::{CloseClaim, OpenSession, SessionRegistry};
use crate::state::AppState;

const OUTBOUND_CAPACITY: usize = 256;

pub async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let conn = state.registry.register().await;
    info!(%conn, "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Value>(OUTBOUND_CAPACITY);

    // Sole owner of the socket's send half.
    let writer = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let text = event.to_string();
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let message = tokio::select! {
            () = state.shutdown.cancelled() => break,
            message = ws_rx.next() => match message {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    debug!(%conn, error = %e, "websocket read error");
                    break;
                }
                None => break,
            },
        };

        match message {
            Message::Text(text) => {
                let Ok(event) = serde_json::from_str::<Value>(&text) else {
                    send(&out_tx, json!({ "type": "error", "reason": "malformed JSON" })).await;
                    continue;
                };
                dispatch(&state, conn, event, &out_tx).await;
            }
            Message::Close(_) => break,
            // Binary frames are not part of the protocol; pings are answered
            // by the library.
            _ => {}
        }
    }

    state.registry.remove_connection(conn).await;
    // In-flight open tasks may still hold outbound senders; there is nobody
    // left to deliver to, so stop the writer outright.
    writer.abort();
    info!(%conn, "client disconnected");
}

async fn dispatch(state: &AppState, conn: Uuid, event: Value, out_tx: &mpsc::Sender<Value>) {
    let Some(event_type) = event.get("type").and_then(Value::as_str) else {
        send(out_tx, json!({ "type": "error", "reason": "missing event type" })).await;
        return;
    };

    match event_type {
        "ping" => send(out_tx, json!({ "type": "pong" })).await,
        "auth" => handle_auth(state, conn, &event, out_tx).await,
        "session.open" | "session.data" | "session.close" => {
            if state.registry.authenticated_address(conn).await.is_none() {
                session_error(out_tx, event.get("kind"), &SessionError::AuthRequired).await;
                return;
            }
            let kind = match parse_kind(&event) {
                Ok(kind) => kind,
                Err(e) => {
                    session_error(out_tx, event.get("kind"), &e).await;
                    return;
                }
            };
            match event_type {
                "session.open" => handle_open(state, conn, kind, &event, out_tx).await,
                "session.data" => {
                    let payload = event.get("payload").cloned().unwrap_or(Value::Null);
                    if let Err(e) = state.registry.send_payload(conn, kind, payload).await {
                        kind_error(out_tx, kind, &e).await;
                    }
                }
                _ => handle_close(state, conn, kind, out_tx).await,
            }
        }
        other => {
            send(
                out_tx,
                json!({ "type": "error", "reason": format!("unknown event type: {other}") }),
            )
            .await;
        }
    }
}

/// Verify an EIP-191 signature and bind the wallet address to the connection.
async fn handle_auth(state: &AppState, conn: Uuid, event: &Value, out_tx: &mpsc::Sender<Value>) {
    let address = event.get("address").and_then(Value::as_str);
    let message = event.get("message").and_then(Value::as_str);
    let signature = event.get("signature").and_then(Value::as_str);

    let (Some(address), Some(message), Some(signature)) = (address, message, signature) else {
        auth_error(out_tx, &AuthError::MissingParameters).await;
        return;
    };

    if !auth::verify_signature(address, message, signature) {
        // Neither the message nor the signature belongs in the log stream.
        warn!(%conn, "signature verification failed");
        auth_error(out_tx, &AuthError::InvalidSignature).await;
        return;
    }

    if !auth::is_authorized(address, &state.config.auth.authorized_addresses) {
        warn!(%conn, address, "address not in allow-list");
        auth_error(out_tx, &AuthError::Unauthorized).await;
        return;
    }

    state.registry.authenticate(conn, address.to_string()).await;
    info!(%conn, address, "wallet authenticated");
    send(out_tx, json!({ "type": "auth.success", "address": address })).await;
}

async fn handle_open(
    state: &AppState,
    conn: Uuid,
    kind: SessionKind,
    event: &Value,
    out_tx: &mpsc::Sender<Value>,
) {
    if let Err(e) = state.registry.begin_open(conn, kind).await {
        kind_error(out_tx, kind, &e).await;
        return;
    }

    let target = event.get("target").cloned().unwrap_or(json!({}));
    let state = state.clone();
    let out_tx = out_tx.clone();

    // The backend connect can take seconds; run it off the dispatch loop so
    // the client's other sessions stay responsive.
    tokio::spawn(async move {
        match backend::open(kind, target, &state.config).await {
            Ok((backend, events)) => {
                // The drain holds off forwarding until ready has gone out,
                // so no backend data can precede it.
                let (ready_tx, ready_rx) = oneshot::channel();
                let drain = tokio::spawn(drain_task(
                    state.registry.clone(),
                    conn,
                    kind,
                    events,
                    ready_rx,
                    out_tx.clone(),
                ));
                let session = OpenSession { backend, drain };
                match state.registry.complete_open(conn, kind, session).await {
                    Ok(()) => {
                        send(&out_tx, json!({ "type": "session.ready", "kind": kind })).await;
                        let _ = ready_tx.send(());
                    }
                    Err(session) => {
                        // Cancelled by a close mid-connect, or the connection
                        // vanished. Dropping ready_tx makes the drain discard
                        // whatever the backend produced.
                        debug!(%conn, %kind, "discarding backend for cancelled open");
                        session.backend.close();
                    }
                }
            }
            Err(e) => {
                if state.registry.abort_open(conn, kind).await {
                    debug!(%conn, %kind, "open was cancelled, suppressing its failure");
                } else {
                    kind_error(&out_tx, kind, &e).await;
                }
            }
        }
    });
}

async fn handle_close(state: &AppState, conn: Uuid, kind: SessionKind, out_tx: &mpsc::Sender<Value>) {
    match state.registry.begin_close(conn, kind).await {
        Ok(CloseClaim::Open(session)) => {
            // Teardown can take up to the close timeout; run it off the
            // dispatch loop so the connection's other sessions stay live.
            let registry = state.registry.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                session.backend.close();
                let abort = session.drain.abort_handle();
                if tokio::time::timeout(registry.close_timeout(), session.drain)
                    .await
                    .is_err()
                {
                    warn!(%conn, %kind, "backend did not close in time, aborting drain");
                    abort.abort();
                }
                registry.finish_close(conn, kind).await;
                send(&out_tx, json!({ "type": "session.closed", "kind": kind })).await;
            });
        }
        Ok(CloseClaim::Opening) => {
            // Nothing is open yet. The opener sees the claimed slot when its
            // connect resolves and discards the backend silently.
            send(out_tx, json!({ "type": "session.closed", "kind": kind })).await;
        }
        Err(e) => kind_error(out_tx, kind, &e).await,
    }
}

/// Relay one session's backend events to the connection's outbound channel.
/// Runs until the event stream ends; if the backend closed on its own, this
/// task frees the slot and announces the close.
async fn drain_task(
    registry: SessionRegistry,
    conn: Uuid,
    kind: SessionKind,
    mut events: mpsc::Receiver<BackendEvent>,
    ready: oneshot::Receiver<()>,
    out_tx: mpsc::Sender<Value>,
) {
    // If the opener never confirms the session (cancelled mid-connect or the
    // connection vanished), the backend's events are consumed and discarded.
    let forward = ready.await.is_ok();

    while let Some(event) = events.recv().await {
        if !forward {
            if matches!(event, BackendEvent::Closed) {
                break;
            }
            continue;
        }
        let outbound = match event {
            BackendEvent::Data(payload) => {
                json!({ "type": "session.data", "kind": kind, "payload": payload })
            }
            BackendEvent::OpError {
                operation,
                path,
                reason,
            } => json!({
                "type": "session.error",
                "kind": kind,
                "code": "backend",
                "operation": operation,
                "path": path,
                "reason": reason,
            }),
            BackendEvent::Fatal { reason } => json!({
                "type": "session.error",
                "kind": kind,
                "code": "backend",
                "reason": reason,
            }),
            BackendEvent::Closed => break,
        };
        if out_tx.send(outbound).await.is_err() {
            break;
        }
    }

    if forward && registry.clear_open(conn, kind).await {
        send(&out_tx, json!({ "type": "session.closed", "kind": kind })).await;
    }
}

fn parse_kind(event: &Value) -> Result<SessionKind, SessionError> {
    let raw = event.get("kind").cloned().unwrap_or(Value::Null);
    let label = raw.as_str().unwrap_or("").to_string();
    serde_json::from_value(raw).map_err(|_| SessionError::UnknownKind(label))
}

async fn send(out_tx: &mpsc::Sender<Value>, event: Value) {
    if out_tx.send(event).await.is_err() {
        debug!("outbound channel closed, dropping event");
    }
}

async fn auth_error(out_tx: &mpsc::Sender<Value>, error: &AuthError) {
    send(
        out_tx,
        json!({ "type": "auth.error", "code": error.code(), "reason": error.to_string() }),
    )
    .await;
}

/// Session error for an event whose kind may not have parsed.
async fn session_error(out_tx: &mpsc::Sender<Value>, kind: Option<&Value>, error: &SessionError) {
    send(
        out_tx,
        json!({
            "type": "session.error",
            "kind": kind.cloned().unwrap_or(Value::Null),
            "code": error.code(),
            "reason": error.to_string(),
        }),
    )
    .await;
}

async fn kind_error(out_tx: &mpsc::Sender<Value>, kind: SessionKind, error: &SessionError) {
    send(
        out_tx,
        json!({
            "type": "session.error",
            "kind": kind,
            "code": error.code(),
            "reason": error.to_string(),
        }),
    )
    .await;
}
