// server.rs - Threaded listener for peer sessions.
//
// The accept loop polls the listener with a bounded wait so it can notice
// shutdown, and hands each accepted socket to its own thread. A session
// thread detects TLS by peeking at the first byte, runs the identification
// dialog, then serves one request per transaction until the peer leaves,
// goes idle for too long, or the server shuts down.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::NetError;
use crate::handshake::{self, PeerIdentity};
use crate::protocol::ProtocolVersion;
use crate::security::{SecurityProvider, Transport, TLS_HANDSHAKE_BYTE};
use crate::transaction::{self, TransactionStatus, BAD_PREFIX, OK_PREFIX};
use crate::wait::wait_for_incoming;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Accept plaintext (classic) sessions.
    pub allow_classic: bool,
    /// Newest protocol version offered.
    pub latest: ProtocolVersion,
    /// Listener poll interval; bounds shutdown latency.
    pub wait_timeout: Duration,
    /// How long a session may sit between requests.
    pub idle_timeout: Duration,
    /// Sessions beyond this are closed right after accept.
    pub max_connections: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            allow_classic: false,
            latest: ProtocolVersion::LATEST,
            wait_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            max_connections: 50,
        }
    }
}

/// Serves requests on an identified session.
///
/// Returning `NetError::Rejected` sends a `BAD: ` reply and keeps the
/// session open; a transport error ends the session.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, session: &mut Session, request: &str) -> Result<(), NetError>;
}

/// One identified client session, as seen by a `RequestHandler`.
pub struct Session {
    transport: Box<dyn Transport>,
    peer: PeerIdentity,
    remote: SocketAddr,
}

impl Session {
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn send(&mut self, body: &[u8], status: TransactionStatus) -> Result<(), NetError> {
        transaction::send_transaction(&mut self.transport, body, status)
    }

    /// Single `OK: <message>` reply.
    pub fn reply_ok(&mut self, message: &str) -> Result<(), NetError> {
        self.send(format!("{}{}", OK_PREFIX, message).as_bytes(), TransactionStatus::Done)
    }

    /// Single `BAD: <reason>` reply.
    pub fn refuse(&mut self, reason: &str) -> Result<(), NetError> {
        tracing::info!(remote = %self.remote, reason, "refusing request");
        self.send(format!("{}{}", BAD_PREFIX, reason).as_bytes(), TransactionStatus::Done)
    }

    /// Arbitrary data split over `m` transactions ending with `t`.
    pub fn send_chunked(&mut self, data: &[u8]) -> Result<(), NetError> {
        transaction::send_chunked(&mut self.transport, data)
    }
}

/// Stops a running `Server::serve` loop from another thread.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Decrements the active session count when a session thread ends.
struct ActiveSession(Arc<AtomicUsize>);

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Server {
    listener: TcpListener,
    options: ServerOptions,
    security: Arc<dyn SecurityProvider>,
    handler: Arc<dyn RequestHandler>,
    shutdown: ShutdownHandle,
    active: Arc<AtomicUsize>,
}

impl Server {
    pub fn bind(
        addr: impl ToSocketAddrs,
        options: ServerOptions,
        security: Arc<dyn SecurityProvider>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, NetError> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            options,
            security,
            handler,
            shutdown: ShutdownHandle::default(),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept and serve until shut down. Waits for session threads before
    /// returning.
    pub fn serve(&self) -> Result<(), NetError> {
        tracing::info!(addr = %self.local_addr()?, "listening for peers");
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        while !self.shutdown.is_shutdown() {
            if !wait_for_incoming(&self.listener, self.options.wait_timeout)? {
                workers.retain(|w| !w.is_finished());
                continue;
            }
            let (stream, remote) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if self.active.load(Ordering::SeqCst) >= self.options.max_connections {
                tracing::warn!(
                    %remote,
                    max = self.options.max_connections,
                    "too many sessions, closing new connection"
                );
                continue;
            }
            self.active.fetch_add(1, Ordering::SeqCst);
            let active = ActiveSession(self.active.clone());

            let options = self.options.clone();
            let security = self.security.clone();
            let handler = self.handler.clone();
            let shutdown = self.shutdown.clone();
            let spawned = thread::Builder::new()
                .name(format!("session-{}", remote))
                .spawn(move || {
                    let _active = active;
                    match run_session(stream, remote, &options, security.as_ref(), handler.as_ref(), &shutdown) {
                        Ok(()) => tracing::debug!(%remote, "session closed"),
                        Err(e) => tracing::warn!(%remote, error = %e, "session ended with error"),
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => tracing::error!(%remote, error = %e, "could not spawn session thread"),
            }
        }

        tracing::info!(sessions = workers.len(), "shutting down, waiting for sessions");
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("session thread panicked");
            }
        }
        Ok(())
    }
}

fn run_session(
    stream: TcpStream,
    remote: SocketAddr,
    options: &ServerOptions,
    security: &dyn SecurityProvider,
    handler: &dyn RequestHandler,
    shutdown: &ShutdownHandle,
) -> Result<(), NetError> {
    stream.set_read_timeout(Some(options.idle_timeout))?;
    stream.set_write_timeout(Some(options.idle_timeout))?;
    if !wait_for_incoming(&stream, options.idle_timeout)? {
        tracing::debug!(%remote, "client sent nothing, closing");
        return Ok(());
    }

    let mut first = [0u8; 1];
    if stream.peek(&mut first)? == 0 {
        return Ok(());
    }
    let mut transport: Box<dyn Transport> = if first[0] == TLS_HANDSHAKE_BYTE {
        security.secure_server(stream)?
    } else {
        Box::new(stream)
    };

    let peer = handshake::server_identify(transport.as_mut(), options.latest, options.allow_classic)?;
    tracing::info!(
        %remote,
        user = %peer.username,
        protocol = %peer.protocol,
        "peer identified"
    );
    let mut session = Session {
        transport,
        peer,
        remote,
    };

    while !shutdown.is_shutdown() {
        if !session.transport.has_pending_input()
            && !wait_for_incoming(session.transport.socket(), options.idle_timeout)?
        {
            tracing::debug!(%remote, "session idle, closing");
            break;
        }
        let request = match transaction::receive_transaction(&mut session.transport) {
            Ok(tx) => tx.text(),
            Err(NetError::PeerClosed) => break,
            Err(e) => return Err(e),
        };
        let request = request.trim_end_matches('\0').trim();
        tracing::debug!(%remote, request, "request");

        match handler.handle(&mut session, request) {
            Ok(()) => {}
            Err(NetError::Rejected { reply }) => session.refuse(&reply)?,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_refuse_classic() {
        let options = ServerOptions::default();
        assert!(!options.allow_classic);
        assert_eq!(options.latest, ProtocolVersion::LATEST);
    }

    #[test]
    fn shutdown_handles_share_state() {
        let handle = ShutdownHandle::default();
        let other = handle.clone();
        other.shutdown();
        assert!(handle.is_shutdown());
    }
}
