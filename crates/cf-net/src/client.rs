// client.rs - Opening connections and the client side of the request set.
//
// `Connector` dials a server, wraps the socket in TLS when the requested
// version needs it, runs the identification dialog, and returns an
// `AgentConnection`. The request helpers below (`VERSION`, `STAT`, `HASH`,
// `OPENDIR`, `GET`) are what actuators use on a leased connection.

use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{AgentConnection, ConnectionFlags};
use crate::error::NetError;
use crate::handshake;
use crate::security::{SecurityProvider, Transport};
use crate::transaction::{self, OK_PREFIX, TERMINATOR};

pub const DEFAULT_PORT: &str = "5308";

fn default_username() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

/// Something that can open identified connections. The cache calls this
/// when it has no idle connection to hand out.
pub trait Connect: Send + Sync {
    fn connect(
        &self,
        server: &str,
        port: &str,
        flags: ConnectionFlags,
    ) -> Result<AgentConnection, NetError>;
}

/// Dials servers over TCP and identifies to them.
pub struct Connector {
    security: Arc<dyn SecurityProvider>,
    connect_timeout: Duration,
    io_timeout: Duration,
    username: String,
}

impl Connector {
    pub fn new(security: Arc<dyn SecurityProvider>) -> Self {
        Self {
            security,
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(30),
            username: default_username(),
        }
    }

    /// Bound the TCP connect and every subsequent read or write.
    pub fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    fn dial(&self, server: &str, port: &str) -> Result<TcpStream, NetError> {
        let unresolved = || NetError::Resolve {
            server: server.to_string(),
            port: port.to_string(),
        };
        let port_number: u16 = port.parse().map_err(|_| unresolved())?;
        let addrs: Vec<_> = (server, port_number)
            .to_socket_addrs()
            .map_err(|_| unresolved())?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(match last_error {
            Some(source) => NetError::Connect {
                server: server.to_string(),
                port: port.to_string(),
                source,
            },
            None => unresolved(),
        })
    }
}

impl Connect for Connector {
    fn connect(
        &self,
        server: &str,
        port: &str,
        flags: ConnectionFlags,
    ) -> Result<AgentConnection, NetError> {
        let stream = self.dial(server, port)?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        stream.set_nodelay(true)?;

        let wanted = flags.wanted_version();
        let mut transport: Box<dyn Transport> = if wanted.requires_tls() {
            self.security.secure_client(stream, server, flags.trust_server)?
        } else {
            Box::new(stream)
        };

        let negotiated = handshake::client_identify(transport.as_mut(), wanted, &self.username)?;
        tracing::info!(server, port, protocol = %negotiated, "connected");
        Ok(AgentConnection::new(
            server,
            port,
            flags,
            transport,
            negotiated,
            self.username.clone(),
        ))
    }
}

/// Kind of a remote file system object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl FileKind {
    fn code(self) -> char {
        match self {
            FileKind::File => 'f',
            FileKind::Directory => 'd',
            FileKind::Symlink => 'l',
            FileKind::Other => 'o',
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "f" => Some(FileKind::File),
            "d" => Some(FileKind::Directory),
            "l" => Some(FileKind::Symlink),
            "o" => Some(FileKind::Other),
            _ => None,
        }
    }
}

/// Reply to `STAT`: `OK: <kind> <size> <mode octal> <mtime>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    /// Seconds since the epoch.
    pub mtime: i64,
}

impl RemoteStat {
    pub fn to_wire(&self) -> String {
        format!(
            "{}{} {} {:o} {}",
            OK_PREFIX,
            self.kind.code(),
            self.size,
            self.mode,
            self.mtime
        )
    }

    pub fn parse(reply: &str) -> Result<Self, NetError> {
        let bad = || NetError::Protocol {
            reason: format!("malformed STAT reply {:?}", reply),
        };
        let fields: Vec<&str> = reply
            .strip_prefix(OK_PREFIX)
            .ok_or_else(bad)?
            .split_whitespace()
            .collect();
        if fields.len() != 4 {
            return Err(bad());
        }
        Ok(Self {
            kind: FileKind::from_code(fields[0]).ok_or_else(bad)?,
            size: fields[1].parse().map_err(|_| bad())?,
            mode: u32::from_str_radix(fields[2], 8).map_err(|_| bad())?,
            mtime: fields[3].parse().map_err(|_| bad())?,
        })
    }
}

impl fmt::Display for RemoteStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} bytes mode {:o} mtime {}",
            self.kind, self.size, self.mode, self.mtime
        )
    }
}

fn ok_payload(reply: String, request: &str) -> Result<String, NetError> {
    match reply.strip_prefix(OK_PREFIX) {
        Some(payload) => Ok(payload.to_string()),
        None => Err(NetError::Protocol {
            reason: format!("unexpected reply to {}: {:?}", request, reply),
        }),
    }
}

impl AgentConnection {
    /// `VERSION`: the server's program version string.
    pub fn server_version(&mut self) -> Result<String, NetError> {
        let reply = self.request("VERSION")?.text();
        ok_payload(reply, "VERSION")
    }

    /// `STAT <path>`.
    pub fn stat(&mut self, path: &str) -> Result<RemoteStat, NetError> {
        let reply = self.request(&format!("STAT {}", path))?.text();
        RemoteStat::parse(&reply)
    }

    /// `HASH <path>`: hex SHA-256 of the remote file.
    pub fn digest(&mut self, path: &str) -> Result<String, NetError> {
        let reply = self.request(&format!("HASH {}", path))?.text();
        ok_payload(reply, "HASH")
    }

    /// `OPENDIR <path>`: names in a remote directory, NUL separated over as
    /// many transactions as needed, ending with the terminator entry.
    pub fn open_dir(&mut self, path: &str) -> Result<Vec<String>, NetError> {
        let mut tx = self.request(&format!("OPENDIR {}", path))?;
        let mut names = Vec::new();
        loop {
            for name in tx.body.split(|&b| b == 0).filter(|n| !n.is_empty()) {
                let name = String::from_utf8_lossy(name).into_owned();
                if name == TERMINATOR {
                    return Ok(names);
                }
                names.push(name);
            }
            if !tx.more() {
                return Err(NetError::Protocol {
                    reason: "directory listing ended without terminator".to_string(),
                });
            }
            tx = self.receive()?;
        }
    }

    /// `GET <path>`: the whole remote file.
    pub fn get_file(&mut self, path: &str) -> Result<Vec<u8>, NetError> {
        let first = self.request(&format!("GET {}", path))?;
        let more = first.more();
        let mut data = first.body;
        if more {
            data.extend(transaction::receive_chunked(self.transport_mut())?);
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolVersion;
    use crate::security::RustlsSecurity;
    use std::net::TcpListener;

    #[test]
    fn stat_wire_format() {
        let stat = RemoteStat {
            kind: FileKind::File,
            size: 42,
            mode: 0o644,
            mtime: 1_700_000_000,
        };
        let wire = stat.to_wire();
        assert_eq!(wire, "OK: f 42 644 1700000000");
        assert_eq!(RemoteStat::parse(&wire).unwrap(), stat);
        assert!(RemoteStat::parse("OK: q 1 644 0").is_err());
        assert!(RemoteStat::parse("f 1 644 0").is_err());
        assert!(RemoteStat::parse("OK: f 1 999 0").is_err());
    }

    #[test]
    fn unresolvable_port_is_a_resolve_error() {
        let connector = Connector::new(Arc::new(RustlsSecurity::new()));
        assert!(matches!(
            connector.connect("127.0.0.1", "not-a-port", ConnectionFlags::default()),
            Err(NetError::Resolve { .. })
        ));
    }

    #[test]
    fn refused_connection_is_a_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port().to_string()
        };
        let connector = Connector::new(Arc::new(RustlsSecurity::new()))
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(2));
        assert!(matches!(
            connector.connect("127.0.0.1", &port, ConnectionFlags::new(ProtocolVersion::CLASSIC)),
            Err(NetError::Connect { .. })
        ));
    }

    #[test]
    fn tls_without_trust_anchors_fails_before_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let connector = Connector::new(Arc::new(RustlsSecurity::new()));
        // Undefined flags ask for the latest version, which needs TLS.
        assert!(matches!(
            connector.connect("127.0.0.1", &port, ConnectionFlags::default()),
            Err(NetError::Tls(_))
        ));
    }
}
