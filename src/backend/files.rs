//! File-transfer sessions over SFTP.
//!
//! Every request is a tagged operation; every result echoes the operation
//! name and the path it acted on, so the client can correlate concurrent
//! transfers. Operation failures are scoped: a bad path produces a
//! `session.error` and the session stays usable.

use base64::Engine as _;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileType;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{connect_ssh, BackendEvent, BackendSession, SessionKind, SshTarget, CHANNEL_CAPACITY};
use crate::config::Config;
use crate::error::SessionError;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOp {
    List {
        path: String,
    },
    Download {
        path: String,
    },
    Upload {
        path: String,
        /// Base64-encoded file body.
        data: String,
    },
    Remove {
        path: String,
        #[serde(default)]
        is_directory: bool,
    },
    Mkdir {
        path: String,
    },
}

impl FileOp {
    fn name(&self) -> &'static str {
        match self {
            Self::List { .. } => "list",
            Self::Download { .. } => "download",
            Self::Upload { .. } => "upload",
            Self::Remove { .. } => "remove",
            Self::Mkdir { .. } => "mkdir",
        }
    }

    fn path(&self) -> &str {
        match self {
            Self::List { path }
            | Self::Download { path }
            | Self::Upload { path, .. }
            | Self::Remove { path, .. }
            | Self::Mkdir { path } => path,
        }
    }
}

pub struct FileSession {
    cmd_tx: mpsc::Sender<FileOp>,
    cancel: CancellationToken,
}

impl BackendSession for FileSession {
    fn kind(&self) -> SessionKind {
        SessionKind::FileTransfer
    }

    fn send(&self, payload: Value) -> Result<(), SessionError> {
        let op: FileOp = serde_json::from_value(payload)
            .map_err(|e| SessionError::Backend(format!("invalid file operation: {e}")))?;
        self.cmd_tx
            .try_send(op)
            .map_err(|_| SessionError::Backend("file operation queue full".to_string()))
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Connect, start the sftp subsystem, and spawn the operation worker.
pub async fn open(
    target: SshTarget,
    config: &Config,
) -> Result<(FileSession, mpsc::Receiver<BackendEvent>), SessionError> {
    let handle = connect_ssh(&target, config).await?;

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SessionError::OpenFailed(format!("ssh channel failed: {e}")))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| SessionError::OpenFailed(format!("sftp subsystem failed: {e}")))?;
    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| SessionError::OpenFailed(format!("sftp handshake failed: {e}")))?;

    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    tokio::spawn(run_worker(handle, sftp, cmd_rx, event_tx, cancel.clone()));

    Ok((FileSession { cmd_tx, cancel }, event_rx))
}

async fn run_worker(
    handle: russh::client::Handle<super::SshClientHandler>,
    sftp: SftpSession,
    mut cmd_rx: mpsc::Receiver<FileOp>,
    event_tx: mpsc::Sender<BackendEvent>,
    cancel: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            () = cancel.cancelled() => break,
            op = cmd_rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let operation = op.name();
        let path = op.path().to_string();
        let event = match execute(&sftp, op).await {
            Ok(result) => BackendEvent::Data(result),
            Err(reason) => BackendEvent::OpError {
                operation,
                path: Some(path),
                reason,
            },
        };
        if event_tx.send(event).await.is_err() {
            break;
        }
    }

    debug!("file-transfer worker stopping");
    let _ = sftp.close().await;
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;
    let _ = event_tx.send(BackendEvent::Closed).await;
}

async fn execute(sftp: &SftpSession, op: FileOp) -> Result<Value, String> {
    match op {
        FileOp::List { path } => {
            let mut entries = Vec::new();
            let dir = sftp.read_dir(&path).await.map_err(|e| e.to_string())?;
            for entry in dir {
                let meta = entry.metadata();
                entries.push(json!({
                    "name": entry.file_name(),
                    "type": type_name(entry.file_type()),
                    "size": meta.size.unwrap_or(0),
                    "modified": meta.mtime.unwrap_or(0),
                    "permissions": meta.permissions.unwrap_or(0),
                }));
            }
            Ok(json!({ "op": "list", "path": path, "entries": entries }))
        }
        FileOp::Download { path } => {
            let meta = sftp.metadata(&path).await.map_err(|e| e.to_string())?;
            if meta.is_dir() {
                return Err("path is a directory".to_string());
            }
            let mut file = sftp.open(&path).await.map_err(|e| e.to_string())?;
            let mut body = Vec::with_capacity(meta.size.unwrap_or(0) as usize);
            file.read_to_end(&mut body).await.map_err(|e| e.to_string())?;
            let name = path.rsplit('/').next().unwrap_or(&path).to_string();
            Ok(json!({
                "op": "download",
                "path": path,
                "name": name,
                "size": body.len(),
                "data": base64::engine::general_purpose::STANDARD.encode(&body),
            }))
        }
        FileOp::Upload { path, data } => {
            let body = base64::engine::general_purpose::STANDARD
                .decode(data.as_bytes())
                .map_err(|e| format!("invalid base64 body: {e}"))?;
            let mut file = sftp.create(&path).await.map_err(|e| e.to_string())?;
            file.write_all(&body).await.map_err(|e| e.to_string())?;
            file.shutdown().await.map_err(|e| e.to_string())?;
            Ok(json!({ "op": "upload", "path": path, "size": body.len() }))
        }
        FileOp::Remove { path, is_directory } => {
            if is_directory {
                sftp.remove_dir(&path).await.map_err(|e| e.to_string())?;
            } else {
                sftp.remove_file(&path).await.map_err(|e| e.to_string())?;
            }
            Ok(json!({ "op": "remove", "path": path }))
        }
        FileOp::Mkdir { path } => {
            sftp.create_dir(&path).await.map_err(|e| e.to_string())?;
            Ok(json!({ "op": "mkdir", "path": path }))
        }
    }
}

fn type_name(kind: FileType) -> &'static str {
    match kind {
        FileType::Dir => "directory",
        FileType::File => "file",
        FileType::Symlink => "symlink",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_op_wire_shapes() {
        let op: FileOp = serde_json::from_value(json!({"op": "list", "path": "/tmp"})).unwrap();
        assert_eq!(op.name(), "list");
        assert_eq!(op.path(), "/tmp");

        let op: FileOp =
            serde_json::from_value(json!({"op": "remove", "path": "/tmp/x"})).unwrap();
        match op {
            FileOp::Remove { is_directory, .. } => assert!(!is_directory),
            other => panic!("unexpected op: {other:?}"),
        }

        let op: FileOp =
            serde_json::from_value(json!({"op": "upload", "path": "/tmp/a", "data": "aGk="}))
                .unwrap();
        assert_eq!(op.name(), "upload");
    }

    #[test]
    fn file_op_rejects_unknown_op() {
        assert!(serde_json::from_value::<FileOp>(json!({"op": "chmod", "path": "/"})).is_err());
        assert!(serde_json::from_value::<FileOp>(json!({"op": "upload", "path": "/"})).is_err());
    }
}
