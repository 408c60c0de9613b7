//! Interactive shell sessions over SSH.

use russh::ChannelMsg;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{connect_ssh, BackendEvent, BackendSession, SessionKind, SshTarget, CHANNEL_CAPACITY};
use crate::config::Config;
use crate::error::SessionError;

/// Client payload for an open shell: keystrokes and window resizes.
#[derive(Debug, Deserialize)]
struct ShellInput {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    resize: Option<Resize>,
}

#[derive(Debug, Deserialize)]
struct Resize {
    rows: u16,
    cols: u16,
}

enum ShellCommand {
    Write(Vec<u8>),
    Resize { rows: u16, cols: u16 },
}

pub struct ShellSession {
    cmd_tx: mpsc::Sender<ShellCommand>,
    cancel: CancellationToken,
}

impl BackendSession for ShellSession {
    fn kind(&self) -> SessionKind {
        SessionKind::Shell
    }

    fn send(&self, payload: Value) -> Result<(), SessionError> {
        let input: ShellInput = serde_json::from_value(payload)
            .map_err(|e| SessionError::Backend(format!("invalid shell payload: {e}")))?;

        if let Some(data) = input.data {
            self.cmd_tx
                .try_send(ShellCommand::Write(data.into_bytes()))
                .map_err(|_| SessionError::Backend("shell input queue full".to_string()))?;
        }
        if let Some(Resize { rows, cols }) = input.resize {
            self.cmd_tx
                .try_send(ShellCommand::Resize { rows, cols })
                .map_err(|_| SessionError::Backend("shell input queue full".to_string()))?;
        }
        Ok(())
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Connect, request a pty and a shell, and spawn the relay worker.
pub async fn open(
    target: SshTarget,
    config: &Config,
) -> Result<(ShellSession, mpsc::Receiver<BackendEvent>), SessionError> {
    let handle = connect_ssh(&target, config).await?;

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SessionError::OpenFailed(format!("ssh channel failed: {e}")))?;

    let rows = target.rows.unwrap_or(config.server.default_terminal_rows);
    let cols = target.cols.unwrap_or(config.server.default_terminal_cols);
    channel
        .request_pty(false, "xterm-256color", u32::from(cols), u32::from(rows), 0, 0, &[])
        .await
        .map_err(|e| SessionError::OpenFailed(format!("pty request failed: {e}")))?;
    channel
        .request_shell(true)
        .await
        .map_err(|e| SessionError::OpenFailed(format!("shell request failed: {e}")))?;

    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    tokio::spawn(run_worker(handle, channel, cmd_rx, event_tx, cancel.clone()));

    Ok((ShellSession { cmd_tx, cancel }, event_rx))
}

async fn run_worker(
    handle: russh::client::Handle<super::SshClientHandler>,
    mut channel: russh::Channel<russh::client::Msg>,
    mut cmd_rx: mpsc::Receiver<ShellCommand>,
    event_tx: mpsc::Sender<BackendEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(ShellCommand::Write(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        let _ = event_tx
                            .send(BackendEvent::Fatal { reason: format!("shell write failed: {e}") })
                            .await;
                        break;
                    }
                }
                Some(ShellCommand::Resize { rows, cols }) => {
                    if let Err(e) = channel
                        .window_change(u32::from(cols), u32::from(rows), 0, 0)
                        .await
                    {
                        debug!(error = %e, "terminal resize failed");
                    }
                }
                None => break,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { ref data }) => {
                    let text = String::from_utf8_lossy(data).into_owned();
                    if event_tx.send(BackendEvent::Data(json!({ "data": text }))).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                    let text = String::from_utf8_lossy(data).into_owned();
                    if event_tx.send(BackendEvent::Data(json!({ "data": text }))).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(exit_status, "remote shell exited");
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;
    let _ = event_tx.send(BackendEvent::Closed).await;
}
