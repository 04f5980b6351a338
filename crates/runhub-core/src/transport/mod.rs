//! Session-multiplexed command transport.
//!
//! A listener accepts plain or TLS stream connections, gives each one a session
//! identity and a dedicated task, and dispatches NUL-terminated `command:payload`
//! frames to a [`CommandTable`]. Handlers own the connection for the duration of the
//! call, so they can read follow-up bytes (uploads, records) directly.
//!
//! Cancelling a connection's scope interrupts reads from the client only. A handler
//! that is building or launching always runs to its end, so its rollback paths stay
//! reachable.

use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::cancel::Scope;
use crate::errors::HubError;
use crate::wire;

pub mod listener;
pub mod session;
pub mod tls;

pub use listener::{Listener, ListenerHandle};
pub use session::{random_token, SessionId, SessionSummary, SessionTable};

/// Handler invoked before any frame is read, if registered.
pub const AUTH_COMMAND: &str = "auth";
/// Handler invoked after the connection loop ends, if registered.
pub const DISCONNECT_COMMAND: &str = "disconnect";

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin + ?Sized> AsyncStream for T {}

// Handlers hold `&Connection` across awaits, so the reader must be `Sync` as well.
pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared write side of a connection. Whoever holds the lock owns the socket for the
/// duration of one write, so frames are never interleaved.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<tokio::sync::Mutex<BoxedWriter>>,
}

impl FrameWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
        }
    }

    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Writes several frames under one lock acquisition.
    pub async fn send_all(&self, frames: &[Bytes]) -> std::io::Result<()> {
        let mut writer = self.inner.lock().await;
        for frame in frames {
            writer.write_all(frame).await?;
        }
        writer.flush().await
    }

    pub async fn shutdown(&self) {
        let mut writer = self.inner.lock().await;
        if let Err(e) = writer.shutdown().await {
            log::debug!("Shutdown of connection writer failed: {}", e);
        }
    }
}

/// One accepted connection as seen by command handlers.
pub struct Connection {
    session: SessionId,
    peer: SocketAddr,
    reader: BufReader<BoxedReader>,
    writer: FrameWriter,
    scope: Scope,
}

impl Connection {
    pub fn new(
        session: SessionId,
        peer: SocketAddr,
        reader: BoxedReader,
        writer: FrameWriter,
        scope: Scope,
    ) -> Self {
        Self {
            session,
            peer,
            reader: BufReader::new(reader),
            writer,
            scope,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn writer(&self) -> FrameWriter {
        self.writer.clone()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Resolves `read` unless the connection scope is cancelled first.
    async fn interruptible<T>(
        scope: &Scope,
        read: impl Future<Output = std::io::Result<T>>,
    ) -> std::io::Result<T> {
        tokio::select! {
            _ = scope.cancelled() => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "session cancelled",
            )),
            result = read => result,
        }
    }

    pub async fn read_frame(&mut self) -> std::io::Result<Vec<u8>> {
        Self::interruptible(&self.scope, wire::read_frame(&mut self.reader)).await
    }

    pub async fn read_string(&mut self) -> std::io::Result<String> {
        let frame = self.read_frame().await?;
        Ok(String::from_utf8_lossy(&frame).into_owned())
    }

    pub async fn read_u8(&mut self) -> std::io::Result<u8> {
        Self::interruptible(&self.scope, self.reader.read_u8()).await
    }

    /// Reads a 4-byte big-endian length and that many bytes.
    pub async fn read_blob(&mut self) -> std::io::Result<Vec<u8>> {
        Self::interruptible(&self.scope, wire::read_blob(&mut self.reader)).await
    }

    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.send(bytes).await
    }

    pub async fn ok(&self) -> std::io::Result<()> {
        self.send(wire::STATUS_OK).await
    }

    pub async fn error(&self) -> std::io::Result<()> {
        self.send(wire::STATUS_ERR).await
    }
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HubError>> + Send + 'a>>;

pub type Handler<S> =
    Arc<dyn for<'a> Fn(&'a S, &'a mut Connection, Vec<u8>) -> HandlerFuture<'a> + Send + Sync>;

/// Command name to handler mapping for one listener.
pub struct CommandTable<S> {
    handlers: HashMap<String, Handler<S>>,
}

impl<S> Default for CommandTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> CommandTable<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, command: &str, handler: F)
    where
        F: for<'a> Fn(&'a S, &'a mut Connection, Vec<u8>) -> HandlerFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(command.to_string(), Arc::new(handler));
    }

    pub fn with<F>(mut self, command: &str, handler: F) -> Self
    where
        F: for<'a> Fn(&'a S, &'a mut Connection, Vec<u8>) -> HandlerFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        self.register(command, handler);
        self
    }

    pub fn get(&self, command: &str) -> Option<Handler<S>> {
        self.handlers.get(command).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<_> = self.handlers.keys().cloned().collect();
        commands.sort();
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop<'a>(_state: &'a (), _conn: &'a mut Connection, _payload: Vec<u8>) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    #[test]
    fn test_command_table_registration() {
        let table = CommandTable::<()>::new()
            .with("listen", noop)
            .with(AUTH_COMMAND, noop);
        assert_eq!(table.commands(), vec!["auth".to_string(), "listen".to_string()]);
        assert!(table.get("listen").is_some());
        assert!(table.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_frame_writer_send_all_keeps_order() {
        let (client, server) = tokio::io::duplex(64);
        let writer = FrameWriter::new(server);
        writer
            .send_all(&[Bytes::from_static(b"a\0"), Bytes::from_static(b"b\0")])
            .await
            .unwrap();
        drop(writer);
        let mut received = Vec::new();
        let mut client = client;
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"a\0b\0");
    }
}
