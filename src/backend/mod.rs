//! Backend session adapters.
//!
//! Each session kind (shell, file-transfer, database) is backed by an adapter
//! that owns one exclusive connection to a remote target and exposes the same
//! narrow contract:
//!
//! - [`open`] establishes the backend connection and returns a
//!   [`BackendSession`] handle plus a receiver of [`BackendEvent`]s.
//! - [`BackendSession::send`] enqueues a client payload to the adapter's
//!   worker task. It never waits on backend I/O — slow operations run on the
//!   worker so one session can't stall the connection's dispatch loop.
//! - [`BackendSession::close`] is an idempotent teardown signal.
//!
//! The worker task drains its command queue, talks to the remote target, and
//! pushes results into the event channel in the order they were produced.
//! Dropping the handle closes the command queue, which the worker treats the
//! same as an explicit close.

pub mod database;
pub mod files;
pub mod shell;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::SessionError;

/// The three supported backend operation classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    Shell,
    FileTransfer,
    Database,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::FileTransfer => "file-transfer",
            Self::Database => "database",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events produced by an adapter worker, drained into client events by the
/// gateway's per-session relay task.
#[derive(Debug)]
pub enum BackendEvent {
    /// Backend output or an operation result, relayed as `session.data`.
    Data(Value),
    /// An operation-scoped failure (bad path, rejected query). The session
    /// stays open.
    OpError {
        operation: &'static str,
        path: Option<String>,
        reason: String,
    },
    /// An unrecoverable backend failure. The worker shuts down after this.
    Fatal { reason: String },
    /// The backend closed its side. Terminal.
    Closed,
}

/// Uniform handle over one open backend session. Object-safe on purpose: the
/// registry stores these as trait objects, so a fourth kind only has to
/// implement this trait.
pub trait BackendSession: Send + 'static {
    fn kind(&self) -> SessionKind;

    /// Validate and enqueue a client payload for the worker. Fails fast on a
    /// malformed payload or a saturated queue.
    fn send(&self, payload: Value) -> Result<(), SessionError>;

    /// Request teardown. Idempotent; the worker confirms by emitting
    /// [`BackendEvent::Closed`] and ending the event stream.
    fn close(&self);
}

/// Connection parameters for the SSH-backed kinds (shell, file-transfer).
///
/// `Debug` is implemented by hand so credential material can never leak into
/// logs.
#[derive(Clone, Deserialize)]
pub struct SshTarget {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// PEM/OpenSSH-encoded private key, as the wallet UI sends it.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub cols: Option<u16>,
}

fn default_ssh_port() -> u16 {
    22
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

/// Connection parameters for the database kind.
#[derive(Clone, Deserialize)]
pub struct DbTarget {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    pub database: String,
}

fn default_mysql_port() -> u16 {
    3306
}

impl fmt::Debug for DbTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

/// Capacity of both the command queue and the event channel per session.
pub(crate) const CHANNEL_CAPACITY: usize = 256;

/// Open a backend session of `kind` against `target`.
///
/// Connection failures are terminal for this attempt; the caller may re-issue
/// the open. The returned receiver yields the session's inbound data in FIFO
/// order, terminated by [`BackendEvent::Closed`] (or a fatal error).
pub async fn open(
    kind: SessionKind,
    target: Value,
    config: &Config,
) -> Result<(Box<dyn BackendSession>, mpsc::Receiver<BackendEvent>), SessionError> {
    match kind {
        SessionKind::Shell => {
            let target = parse_target::<SshTarget>(target)?;
            let (session, events) = shell::open(target, config).await?;
            Ok((Box::new(session), events))
        }
        SessionKind::FileTransfer => {
            let target = parse_target::<SshTarget>(target)?;
            let (session, events) = files::open(target, config).await?;
            Ok((Box::new(session), events))
        }
        SessionKind::Database => {
            let target = parse_target::<DbTarget>(target)?;
            let (session, events) = database::open(target, config).await?;
            Ok((Box::new(session), events))
        }
    }
}

fn parse_target<T: serde::de::DeserializeOwned>(target: Value) -> Result<T, SessionError> {
    serde_json::from_value(target)
        .map_err(|e| SessionError::OpenFailed(format!("invalid target: {e}")))
}

/// russh client handler. Host-key verification is the browser user's call in
/// the original product, so the gateway accepts any server key.
struct SshClientHandler;

impl russh::client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Establish and authenticate an SSH connection for the shell and
/// file-transfer adapters.
async fn connect_ssh(
    target: &SshTarget,
    config: &Config,
) -> Result<russh::client::Handle<SshClientHandler>, SessionError> {
    let ssh_config = Arc::new(russh::client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        ..Default::default()
    });

    let handle = tokio::time::timeout(
        Duration::from_secs(config.server.connect_timeout_secs),
        russh::client::connect(
            ssh_config,
            (target.host.as_str(), target.port),
            SshClientHandler,
        ),
    )
    .await
    .map_err(|_| {
        SessionError::OpenFailed(format!(
            "connection to {}:{} timed out",
            target.host, target.port
        ))
    })?
    .map_err(|e| SessionError::OpenFailed(format!("ssh connect failed: {e}")))?;

    let mut handle = handle;
    let auth = if let Some(ref key_data) = target.private_key {
        let key = russh::keys::decode_secret_key(key_data, target.passphrase.as_deref())
            .map_err(|e| SessionError::OpenFailed(format!("invalid private key: {e}")))?;
        let key = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), None);
        handle
            .authenticate_publickey(&target.username, key)
            .await
            .map_err(|e| SessionError::OpenFailed(format!("ssh auth failed: {e}")))?
    } else if let Some(ref password) = target.password {
        handle
            .authenticate_password(&target.username, password)
            .await
            .map_err(|e| SessionError::OpenFailed(format!("ssh auth failed: {e}")))?
    } else {
        return Err(SessionError::OpenFailed(
            "target must supply a password or a private key".to_string(),
        ));
    };

    if !auth.success() {
        return Err(SessionError::OpenFailed(
            "ssh authentication rejected".to_string(),
        ));
    }

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_kind_wire_names() {
        assert_eq!(
            serde_json::from_value::<SessionKind>(json!("shell")).unwrap(),
            SessionKind::Shell
        );
        assert_eq!(
            serde_json::from_value::<SessionKind>(json!("file-transfer")).unwrap(),
            SessionKind::FileTransfer
        );
        assert_eq!(
            serde_json::from_value::<SessionKind>(json!("database")).unwrap(),
            SessionKind::Database
        );
        assert!(serde_json::from_value::<SessionKind>(json!("ftp")).is_err());
    }

    #[test]
    fn ssh_target_debug_redacts_credentials() {
        let target: SshTarget = serde_json::from_value(json!({
            "host": "h", "username": "u",
            "password": "hunter2", "private_key": "-----BEGIN...",
        }))
        .unwrap();
        let rendered = format!("{target:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("BEGIN"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn db_target_debug_redacts_password() {
        let target: DbTarget = serde_json::from_value(json!({
            "host": "db", "user": "root", "password": "s3cret", "database": "app",
        }))
        .unwrap();
        let rendered = format!("{target:?}");
        assert!(!rendered.contains("s3cret"));
        assert_eq!(target.port, 3306);
    }
}
