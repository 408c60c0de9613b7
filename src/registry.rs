//! Connection and session bookkeeping.
//!
//! The registry tracks every live WebSocket connection and, per connection,
//! at most one backend session per kind. Slot transitions are the
//! single-flight guard: an `open` for a kind that is already opening or open
//! is rejected without touching the backend, and a session that is tearing
//! down cannot emit into a successor's stream because its slot is taken
//! before the drain is awaited.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use crate::backend::{BackendSession, SessionKind};
use crate::error::SessionError;

/// A session slot for one (connection, kind) pair.
enum SessionSlot {
    /// A backend connect is in flight.
    Opening,
    Open(OpenSession),
    /// Teardown in progress; the slot is freed by `finish_close`.
    Closing,
}

pub struct OpenSession {
    pub backend: Box<dyn BackendSession>,
    /// The relay task draining backend events to the client.
    pub drain: JoinHandle<()>,
}

/// What `begin_close` claimed.
pub enum CloseClaim {
    /// The session was open; the caller owns its teardown.
    Open(OpenSession),
    /// A backend connect was still in flight. The slot stays `Closing`
    /// until the opener observes the claim and frees it.
    Opening,
}

#[derive(Default)]
struct ConnectionContext {
    address: Option<String>,
    slots: HashMap<SessionKind, SessionSlot>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    connections: Arc<RwLock<HashMap<Uuid, Arc<Mutex<ConnectionContext>>>>>,
    close_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(close_timeout: Duration) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            close_timeout,
        }
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Register a new connection and return its id.
    pub async fn register(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.connections
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(ConnectionContext::default())));
        id
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Record the verified wallet address for a connection.
    pub async fn authenticate(&self, conn: Uuid, address: String) {
        if let Some(ctx) = self.context(conn).await {
            ctx.lock().await.address = Some(address);
        }
    }

    pub async fn authenticated_address(&self, conn: Uuid) -> Option<String> {
        let ctx = self.context(conn).await?;
        let guard = ctx.lock().await;
        guard.address.clone()
    }

    /// Claim the (connection, kind) slot for an open attempt. Rejects if any
    /// session already occupies the slot.
    pub async fn begin_open(&self, conn: Uuid, kind: SessionKind) -> Result<(), SessionError> {
        let ctx = self.context(conn).await.ok_or(SessionError::NotOpen)?;
        let mut guard = ctx.lock().await;
        if guard.slots.contains_key(&kind) {
            return Err(SessionError::AlreadyOpen);
        }
        guard.slots.insert(kind, SessionSlot::Opening);
        Ok(())
    }

    /// Drop an open claim after a failed connect. Returns true if the
    /// attempt had already been cancelled by a close, in which case the
    /// failure must not be reported to the client. Only ever called by the
    /// task that holds the claim, so a `Closing` slot seen here can only be
    /// a cancelled open, never another session's teardown.
    pub async fn abort_open(&self, conn: Uuid, kind: SessionKind) -> bool {
        let Some(ctx) = self.context(conn).await else {
            return false;
        };
        let mut guard = ctx.lock().await;
        match guard.slots.get(&kind) {
            Some(SessionSlot::Opening) => {
                guard.slots.remove(&kind);
                false
            }
            Some(SessionSlot::Closing) => {
                guard.slots.remove(&kind);
                true
            }
            _ => false,
        }
    }

    /// Promote an Opening slot to Open. If the connection disappeared while
    /// the backend was connecting, the session is handed back so the caller
    /// can tear it down.
    pub async fn complete_open(
        &self,
        conn: Uuid,
        kind: SessionKind,
        session: OpenSession,
    ) -> Result<(), OpenSession> {
        let Some(ctx) = self.context(conn).await else {
            return Err(session);
        };
        let mut guard = ctx.lock().await;
        match guard.slots.get(&kind) {
            Some(SessionSlot::Opening) => {
                guard.slots.insert(kind, SessionSlot::Open(session));
                Ok(())
            }
            // A close claimed the slot while the backend was connecting:
            // free it and hand the session back for discard.
            Some(SessionSlot::Closing) => {
                guard.slots.remove(&kind);
                Err(session)
            }
            _ => Err(session),
        }
    }

    /// Forward a client payload to the open backend for this kind.
    pub async fn send_payload(
        &self,
        conn: Uuid,
        kind: SessionKind,
        payload: serde_json::Value,
    ) -> Result<(), SessionError> {
        let ctx = self.context(conn).await.ok_or(SessionError::NotOpen)?;
        let guard = ctx.lock().await;
        match guard.slots.get(&kind) {
            Some(SessionSlot::Open(session)) => session.backend.send(payload),
            _ => Err(SessionError::NotOpen),
        }
    }

    /// Claim a slot for teardown, leaving it in Closing so neither a
    /// concurrent open nor the drain's own cleanup races it. Valid from
    /// `Open`, or from `Opening` to cancel a connect still in flight.
    pub async fn begin_close(
        &self,
        conn: Uuid,
        kind: SessionKind,
    ) -> Result<CloseClaim, SessionError> {
        let ctx = self.context(conn).await.ok_or(SessionError::NotOpen)?;
        let mut guard = ctx.lock().await;
        match guard.slots.get(&kind) {
            Some(SessionSlot::Open(_)) => {
                let Some(SessionSlot::Open(session)) =
                    guard.slots.insert(kind, SessionSlot::Closing)
                else {
                    unreachable!("slot checked above");
                };
                Ok(CloseClaim::Open(session))
            }
            Some(SessionSlot::Opening) => {
                guard.slots.insert(kind, SessionSlot::Closing);
                Ok(CloseClaim::Opening)
            }
            _ => Err(SessionError::NotOpen),
        }
    }

    /// Free a Closing slot once teardown finished.
    pub async fn finish_close(&self, conn: Uuid, kind: SessionKind) {
        if let Some(ctx) = self.context(conn).await {
            let mut guard = ctx.lock().await;
            if matches!(guard.slots.get(&kind), Some(SessionSlot::Closing)) {
                guard.slots.remove(&kind);
            }
        }
    }

    /// Backend-initiated teardown, called from inside the drain task after
    /// the event stream ended. Returns true if this call freed the slot, so
    /// exactly one party announces the close. Never awaits the drain handle,
    /// which would be the caller itself.
    pub async fn clear_open(&self, conn: Uuid, kind: SessionKind) -> bool {
        let Some(ctx) = self.context(conn).await else {
            return false;
        };
        let mut guard = ctx.lock().await;
        match guard.slots.get(&kind) {
            Some(SessionSlot::Open(_)) => {
                if let Some(SessionSlot::Open(session)) = guard.slots.remove(&kind) {
                    session.backend.close();
                }
                true
            }
            _ => false,
        }
    }

    /// Drop a connection and force-close everything it had open.
    pub async fn remove_connection(&self, conn: Uuid) {
        let ctx = self.connections.write().await.remove(&conn);
        let Some(ctx) = ctx else { return };
        let sessions: Vec<(SessionKind, OpenSession)> = {
            let mut guard = ctx.lock().await;
            let kinds: Vec<SessionKind> = guard.slots.keys().copied().collect();
            kinds
                .into_iter()
                .filter_map(|kind| match guard.slots.remove(&kind) {
                    Some(SessionSlot::Open(session)) => Some((kind, session)),
                    _ => None,
                })
                .collect()
        };

        let closes = sessions
            .into_iter()
            .map(|(kind, session)| self.force_close(conn, kind, session));
        futures::future::join_all(closes).await;
    }

    /// Close all sessions on all connections. Used at shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<Uuid> = self.connections.read().await.keys().copied().collect();
        for id in ids {
            self.remove_connection(id).await;
        }
    }

    async fn force_close(&self, conn: Uuid, kind: SessionKind, session: OpenSession) {
        session.backend.close();
        let abort = session.drain.abort_handle();
        if timeout(self.close_timeout, session.drain).await.is_err() {
            warn!(%conn, %kind, "backend did not close in time, aborting drain");
            abort.abort();
        }
    }

    async fn context(&self, conn: Uuid) -> Option<Arc<Mutex<ConnectionContext>>> {
        self.connections.read().await.get(&conn).cloned()
    }
}
