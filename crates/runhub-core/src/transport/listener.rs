//! Accept loop and per-connection frame loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use super::session::SessionTable;
use super::{
    AsyncStream, BoxedReader, CommandTable, Connection, FrameWriter, AUTH_COMMAND,
    DISCONNECT_COMMAND,
};
use crate::cancel::Scope;
use crate::errors::{HubError, HubResult};
use crate::wire;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration of one listening endpoint.
pub struct Listener<S> {
    name: &'static str,
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    table: Arc<CommandTable<S>>,
}

impl<S> Listener<S>
where
    S: Send + Sync + 'static,
{
    pub fn new(name: &'static str, addr: SocketAddr, table: CommandTable<S>) -> Self {
        Self {
            name,
            addr,
            tls: None,
            table: Arc::new(table),
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Binds the socket and starts accepting under a child of `parent`.
    pub async fn bind(
        self,
        state: Arc<S>,
        sessions: Arc<SessionTable>,
        parent: &Scope,
    ) -> HubResult<ListenerHandle> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let scope = parent.child();
        log::info!(
            "{} listener bound on {}{}",
            self.name,
            local_addr,
            if self.tls.is_some() { " (tls)" } else { "" }
        );

        let accept_scope = scope.clone();
        let task = tokio::spawn(async move {
            self.accept_loop(listener, state, sessions, accept_scope)
                .await
        });

        Ok(ListenerHandle {
            local_addr,
            scope,
            task,
        })
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        state: Arc<S>,
        sessions: Arc<SessionTable>,
        scope: Scope,
    ) {
        let shared = Arc::new(self);
        loop {
            let accepted = tokio::select! {
                _ = scope.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("{} listener accept failed: {}", shared.name, e);
                    continue;
                }
            };
            let conn_scope = scope.child();
            let shared = Arc::clone(&shared);
            let state = Arc::clone(&state);
            let sessions = Arc::clone(&sessions);
            tokio::spawn(async move {
                shared
                    .serve_stream(stream, peer, state, sessions, conn_scope)
                    .await;
            });
        }
        log::info!("{} listener stopped", shared.name);
        scope.release();
    }

    async fn serve_stream(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        state: Arc<S>,
        sessions: Arc<SessionTable>,
        scope: Scope,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }
        let stream: Box<dyn AsyncStream> = match &self.tls {
            Some(acceptor) => {
                match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => Box::new(tls),
                    Ok(Err(e)) => {
                        log::warn!("TLS handshake with {} failed: {}", peer, e);
                        scope.release();
                        return;
                    }
                    Err(_) => {
                        log::warn!("TLS handshake with {} timed out", peer);
                        scope.release();
                        return;
                    }
                }
            }
            None => Box::new(stream),
        };
        let (reader, writer) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(reader);
        let writer = FrameWriter::new(writer);

        let session = sessions.register(peer, self.name);
        log::info!("{} session {} opened from {}", self.name, session, peer);
        let mut conn = Connection::new(session.clone(), peer, reader, writer.clone(), scope.clone());

        // Reads on `conn` fail once the scope is cancelled, which ends the loop
        // between handlers or inside a handler's read without dropping its future.
        self.run(state.as_ref(), &mut conn).await;
        if scope.is_cancelled() {
            log::debug!("Session {} cancelled", session);
        }

        if let Some(handler) = self.table.get(DISCONNECT_COMMAND) {
            if let Err(e) = handler(state.as_ref(), &mut conn, Vec::new()).await {
                log::warn!("Disconnect handler for {} failed: {}", session, e);
            }
        }
        writer.shutdown().await;
        sessions.remove(&session);
        scope.release();
        log::info!("{} session {} closed", self.name, session);
    }

    async fn run(&self, state: &S, conn: &mut Connection) {
        if let Some(handler) = self.table.get(AUTH_COMMAND) {
            if let Err(e) = handler(state, conn, Vec::new()).await {
                log::warn!("Session {} from {} rejected: {}", conn.session(), conn.peer(), e);
                return;
            }
        }

        loop {
            let frame = match conn.read_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        log::debug!("Read from session {} failed: {}", conn.session(), e);
                    }
                    return;
                }
            };
            let (command, payload) = wire::split_command(&frame);
            let Some(handler) = self.table.get(&command) else {
                log::warn!(
                    "Unknown command {:?} on {} session {}",
                    command,
                    self.name,
                    conn.session()
                );
                continue;
            };
            log::debug!("Session {} -> {}", conn.session(), command);
            match handler(state, conn, payload).await {
                Ok(()) => {}
                Err(e) if e.closes_connection() => {
                    log::debug!("Session {} closing after {}: {}", conn.session(), command, e);
                    return;
                }
                Err(e) => {
                    log::warn!("Command {} on session {} failed: {}", command, conn.session(), e);
                    if matches!(e, HubError::Io(_)) {
                        return;
                    }
                }
            }
        }
    }
}

/// Running listener.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    scope: Scope,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and cancels every connection spawned by this listener.
    pub fn shutdown(&self) {
        self.scope.cancel();
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            log::error!("Listener task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::ScopeTree;
    use crate::transport::HandlerFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct Counters {
        echoes: AtomicUsize,
        disconnects: AtomicUsize,
        slow_finished: AtomicUsize,
    }

    fn echo<'a>(state: &'a Counters, conn: &'a mut Connection, payload: Vec<u8>) -> HandlerFuture<'a> {
        Box::pin(async move {
            state.echoes.fetch_add(1, Ordering::SeqCst);
            let mut reply = payload;
            reply.push(0);
            conn.send(&reply).await?;
            Ok(())
        })
    }

    fn quit<'a>(_state: &'a Counters, _conn: &'a mut Connection, _payload: Vec<u8>) -> HandlerFuture<'a> {
        Box::pin(async { Err(HubError::CloseConnection) })
    }

    fn slow<'a>(state: &'a Counters, _conn: &'a mut Connection, _payload: Vec<u8>) -> HandlerFuture<'a> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            state.slow_finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn gone<'a>(state: &'a Counters, _conn: &'a mut Connection, _payload: Vec<u8>) -> HandlerFuture<'a> {
        Box::pin(async move {
            state.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn table() -> CommandTable<Counters> {
        CommandTable::new()
            .with("echo", echo)
            .with("quit", quit)
            .with("slow", slow)
            .with(DISCONNECT_COMMAND, gone)
    }

    async fn start() -> (ListenerHandle, Arc<Counters>, Arc<SessionTable>) {
        let tree = ScopeTree::new();
        let state = Arc::new(Counters::default());
        let sessions = Arc::new(SessionTable::new());
        let listener = Listener::new("test", "127.0.0.1:0".parse().unwrap(), table());
        let handle = listener
            .bind(Arc::clone(&state), Arc::clone(&sessions), &tree.root())
            .await
            .unwrap();
        (handle, state, sessions)
    }

    #[tokio::test]
    async fn test_dispatch_and_unknown_command() {
        let (handle, state, _sessions) = start().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client.write_all(b"bogus:1\0/echo:hi\0quit\0").await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hi\0");
        assert_eq!(state.echoes.load(Ordering::SeqCst), 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_runs_and_session_is_removed() {
        let (handle, state, sessions) = start().await;
        let client = TcpStream::connect(handle.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sessions.len(), 1);

        drop(client);
        for _ in 0..50 {
            if sessions.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sessions.is_empty());
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connections() {
        let (handle, _state, sessions) = start().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf.is_empty());
        handle.join().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_lets_running_handler_finish() {
        let (handle, state, sessions) = start().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client.write_all(b"slow\0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown();

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.slow_finished.load(Ordering::SeqCst), 1);
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sessions.is_empty());
    }
}
