//! The control socket: out-of-band lifecycle commands from peer tools.
//!
//! A Unix socket inside the VM directory accepts newline-delimited
//! commands (`stop`, `request-stop`, `suspend`), each mapping onto the same
//! lifecycle event as the corresponding signal. Connections are accepted
//! concurrently but served one at a time; socket failures are logged and
//! never tear down the VM.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tartlet_core::error::Result;

use super::lifecycle::{EventSender, LifecycleEvent};

/// A bound control socket server.
///
/// Dropping the guard removes the socket file; the accept task stops when
/// the shutdown token is cancelled.
pub struct ControlSocket {
    path: PathBuf,
}

impl ControlSocket {
    /// Binds the socket at `path` and spawns the serving task.
    pub fn bind(path: &Path, events: EventSender, shutdown: CancellationToken) -> Result<Self> {
        // A previous run that died hard leaves a stale socket file behind.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        debug!(path = %path.display(), "control socket bound");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            // One client at a time; the next accept waits
                            // until this conversation is over.
                            if let Err(err) = serve_connection(stream, &events).await {
                                warn!(error = %err, "control socket connection failed");
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "control socket accept failed");
                        }
                    },
                }
            }
        });

        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve_connection(stream: UnixStream, events: &EventSender) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let command = line.trim();
        match parse_command(command) {
            Some(event) => {
                debug!(command, "control command");
                events.send(event);
                writer.write_all(b"ok\n").await?;
            }
            None => {
                writer
                    .write_all(format!("err unknown command \"{command}\"\n").as_bytes())
                    .await?;
            }
        }
        writer.flush().await?;
    }
    Ok(())
}

fn parse_command(command: &str) -> Option<LifecycleEvent> {
    match command {
        "stop" => Some(LifecycleEvent::Stop),
        "request-stop" => Some(LifecycleEvent::RequestStop),
        "suspend" => Some(LifecycleEvent::Suspend),
        "window-closed" => Some(LifecycleEvent::WindowClosed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lifecycle::event_channel;
    use tokio::io::AsyncReadExt;

    async fn roundtrip(socket: &Path, line: &str) -> String {
        let mut stream = UnixStream::connect(socket).await.unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_commands_map_to_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let (tx, mut rx) = event_channel();
        let shutdown = CancellationToken::new();
        let _socket = ControlSocket::bind(&path, tx, shutdown.clone()).unwrap();

        assert_eq!(roundtrip(&path, "suspend\n").await, "ok\n");
        assert_eq!(rx.recv().await, Some(LifecycleEvent::Suspend));

        assert_eq!(roundtrip(&path, "request-stop\n").await, "ok\n");
        assert_eq!(rx.recv().await, Some(LifecycleEvent::RequestStop));

        assert_eq!(roundtrip(&path, "stop\n").await, "ok\n");
        assert_eq!(rx.recv().await, Some(LifecycleEvent::Stop));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_command_gets_error_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let (tx, mut rx) = event_channel();
        let shutdown = CancellationToken::new();
        let _socket = ControlSocket::bind(&path, tx, shutdown.clone()).unwrap();

        let reply = roundtrip(&path, "reboot\n").await;
        assert!(reply.starts_with("err unknown command"));
        // No event was produced.
        assert!(rx.try_recv().is_err());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_sequential_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let (tx, mut rx) = event_channel();
        let shutdown = CancellationToken::new();
        let _socket = ControlSocket::bind(&path, tx, shutdown.clone()).unwrap();

        for _ in 0..3 {
            assert_eq!(roundtrip(&path, "request-stop\n").await, "ok\n");
            assert_eq!(rx.recv().await, Some(LifecycleEvent::RequestStop));
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_socket_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let (tx, _rx) = event_channel();
        let shutdown = CancellationToken::new();

        let socket = ControlSocket::bind(&path, tx, shutdown.clone()).unwrap();
        assert!(path.exists());
        drop(socket);
        assert!(!path.exists());

        shutdown.cancel();
    }
}
