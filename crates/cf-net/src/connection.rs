// connection.rs - One logical link to a peer server.

use std::fmt;
use std::net::{IpAddr, Shutdown};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::NetError;
use crate::protocol::ProtocolVersion;
use crate::security::Transport;
use crate::transaction::{self, Transaction, TransactionStatus};

/// Options a connection was opened with. Two connections are
/// interchangeable only if their flags are equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConnectionFlags {
    /// Version to request; `UNDEFINED` means the latest.
    pub protocol_version: ProtocolVersion,
    /// Accept an unknown server identity on first contact.
    pub trust_server: bool,
    /// Do not record this connection in the peer history.
    pub off_the_record: bool,
}

impl ConnectionFlags {
    pub fn new(protocol_version: ProtocolVersion) -> Self {
        Self {
            protocol_version,
            ..Self::default()
        }
    }

    pub fn with_trust_server(mut self, trust: bool) -> Self {
        self.trust_server = trust;
        self
    }

    /// The version the client will ask for.
    pub fn wanted_version(&self) -> ProtocolVersion {
        if self.protocol_version.is_undefined() {
            ProtocolVersion::LATEST
        } else {
            self.protocol_version
        }
    }
}

/// An established, identified session with a server.
pub struct AgentConnection {
    id: Uuid,
    server: String,
    port: String,
    flags: ConnectionFlags,
    transport: Box<dyn Transport>,
    protocol: ProtocolVersion,
    remote_ip: Option<IpAddr>,
    peer_digest: Option<String>,
    username: String,
    connected_at: DateTime<Utc>,
}

impl AgentConnection {
    /// Wrap a transport on which the identification dialog already
    /// succeeded at `protocol`.
    pub fn new(
        server: impl Into<String>,
        port: impl Into<String>,
        flags: ConnectionFlags,
        transport: Box<dyn Transport>,
        protocol: ProtocolVersion,
        username: impl Into<String>,
    ) -> Self {
        let remote_ip = transport.socket().peer_addr().ok().map(|a| a.ip());
        let peer_digest = transport.peer_key_digest();
        Self {
            id: Uuid::new_v4(),
            server: server.into(),
            port: port.into(),
            flags,
            transport,
            protocol,
            remote_ip,
            peer_digest,
            username: username.into(),
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn flags(&self) -> ConnectionFlags {
        self.flags
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn is_encrypted(&self) -> bool {
        self.transport.is_encrypted()
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_ip
    }

    pub fn peer_key_digest(&self) -> Option<&str> {
        self.peer_digest.as_deref()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn send(&mut self, body: &[u8], status: TransactionStatus) -> Result<(), NetError> {
        transaction::send_transaction(&mut self.transport, body, status)
    }

    pub fn receive(&mut self) -> Result<Transaction, NetError> {
        transaction::receive_transaction(&mut self.transport)
    }

    /// Send a one-transaction request and read the first reply transaction.
    /// A `BAD: ` reply becomes `NetError::Rejected`.
    pub fn request(&mut self, request: &str) -> Result<Transaction, NetError> {
        tracing::debug!(server = %self.server, request, "sending request");
        self.send(request.as_bytes(), TransactionStatus::Done)?;
        let reply = self.receive()?;
        match reply.refusal() {
            Some(reason) => Err(NetError::Rejected { reply: reason }),
            None => Ok(reply),
        }
    }

    pub(crate) fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Shut the socket down. The connection is unusable afterwards.
    pub fn disconnect(&mut self) {
        if let Err(e) = self.transport.socket().shutdown(Shutdown::Both) {
            tracing::debug!(server = %self.server, error = %e, "shutdown failed");
        }
    }
}

impl fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConnection")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("flags", &self.flags)
            .field("protocol", &self.protocol)
            .field("encrypted", &self.is_encrypted())
            .field("remote_ip", &self.remote_ip)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn undefined_flags_want_latest() {
        assert_eq!(
            ConnectionFlags::default().wanted_version(),
            ProtocolVersion::LATEST
        );
        assert_eq!(
            ConnectionFlags::new(ProtocolVersion::CLASSIC).wanted_version(),
            ProtocolVersion::CLASSIC
        );
    }

    #[test]
    fn flags_equality_covers_every_field() {
        let base = ConnectionFlags::new(ProtocolVersion::CLASSIC);
        assert_eq!(base, ConnectionFlags::new(ProtocolVersion::CLASSIC));
        assert_ne!(base, base.with_trust_server(true));
        assert_ne!(base, ConnectionFlags::new(ProtocolVersion::TLS));
    }

    #[test]
    fn request_maps_bad_replies_to_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let mut conn = AgentConnection::new(
            "127.0.0.1",
            "5308",
            ConnectionFlags::new(ProtocolVersion::CLASSIC),
            Box::new(client),
            ProtocolVersion::CLASSIC,
            "root",
        );
        assert_eq!(conn.remote_ip(), Some("127.0.0.1".parse().unwrap()));

        let responder = std::thread::spawn(move || {
            let req = transaction::receive_transaction(&mut server).unwrap();
            assert_eq!(req.body, b"GET /nope");
            transaction::send_transaction(&mut server, b"BAD: no such file", TransactionStatus::Done)
                .unwrap();
        });

        let err = conn.request("GET /nope").unwrap_err();
        assert!(matches!(err, NetError::Rejected { ref reply } if reply == "no such file"));
        assert!(!err.is_transport());
        responder.join().unwrap();
    }
}
