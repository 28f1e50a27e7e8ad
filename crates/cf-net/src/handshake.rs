// handshake.rs - Version negotiation and identification dialog.
//
//   client: CFE_v<wanted> cf-agent <version>
//   server: CFE_v<latest> cf-serverd <version>      (or a BAD line)
//   client: IDENTITY USERNAME=<user>
//   server: OK WELCOME USERNAME=<user>               (or a BAD line)
//
// Both sides settle on min(local, peer). The result must agree with the
// transport: TLS versions only over TLS, classic only over plaintext. A
// mismatch fails the dialog rather than silently downgrading.

use std::io::{Read, Write};

use crate::error::NetError;
use crate::protocol::{parse_from_wire, ProtocolVersion};
use crate::security::Transport;

const MAX_LINE: usize = 1024;
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What the server learned about the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub protocol: ProtocolVersion,
    pub username: String,
    pub key_digest: Option<String>,
}

fn write_line(transport: &mut dyn Transport, line: &str) -> Result<(), NetError> {
    transport.write_all(line.as_bytes())?;
    transport.write_all(b"\n")?;
    transport.flush()?;
    Ok(())
}

/// Read one `\n`-terminated line byte by byte, so nothing after the line is
/// consumed from the transport.
fn read_line(transport: &mut dyn Transport) -> Result<String, NetError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match transport.read(&mut byte)? {
            0 => return Err(NetError::PeerClosed),
            _ if byte[0] == b'\n' => break,
            _ => {
                line.push(byte[0]);
                if line.len() > MAX_LINE {
                    return Err(NetError::Handshake {
                        reason: "handshake line too long".to_string(),
                    });
                }
            }
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

fn refused_or_unexpected(line: String, expected: &str) -> NetError {
    if line.starts_with("BAD") {
        NetError::Rejected { reply: line }
    } else {
        NetError::Handshake {
            reason: format!("expected {}, got {:?}", expected, line),
        }
    }
}

fn check_transport(negotiated: ProtocolVersion, transport: &dyn Transport) -> Result<(), String> {
    match (negotiated.requires_tls(), transport.is_encrypted()) {
        (true, false) => Err(format!("protocol {} requires TLS", negotiated)),
        (false, true) => Err(format!("protocol {} cannot run inside TLS", negotiated)),
        _ => Ok(()),
    }
}

/// Client side of the dialog. Returns the negotiated version.
pub fn client_identify(
    transport: &mut dyn Transport,
    wanted: ProtocolVersion,
    username: &str,
) -> Result<ProtocolVersion, NetError> {
    write_line(transport, &format!("{} cf-agent {}", wanted.wire_token(), VERSION))?;

    let greeting = read_line(transport)?;
    let peer = parse_from_wire(&greeting);
    if peer.is_undefined() {
        return Err(refused_or_unexpected(greeting, "a protocol version"));
    }

    let negotiated = wanted.negotiate(peer);
    check_transport(negotiated, transport).map_err(|reason| NetError::Handshake {
        reason: format!("server offered {}: {}", peer, reason),
    })?;
    tracing::debug!(%wanted, %peer, %negotiated, "protocol negotiated");

    write_line(transport, &format!("IDENTITY USERNAME={}", username))?;
    let welcome = read_line(transport)?;
    if !welcome.starts_with("OK WELCOME") {
        return Err(refused_or_unexpected(welcome, "OK WELCOME"));
    }
    Ok(negotiated)
}

/// Server side of the dialog.
///
/// `allow_classic` gates plaintext sessions. Every refusal is answered with
/// a `BAD` line before the error is returned.
pub fn server_identify(
    transport: &mut dyn Transport,
    latest: ProtocolVersion,
    allow_classic: bool,
) -> Result<PeerIdentity, NetError> {
    let refuse = |transport: &mut dyn Transport, reason: String| -> NetError {
        if let Err(e) = write_line(transport, &format!("BAD {}", reason)) {
            tracing::debug!(error = %e, "could not send refusal");
        }
        NetError::Handshake { reason }
    };

    let hello = read_line(transport)?;
    let peer = parse_from_wire(&hello);
    if peer.is_undefined() {
        return Err(refuse(transport, format!("unsupported protocol version {:?}", hello)));
    }

    let negotiated = latest.negotiate(peer);
    if let Err(reason) = check_transport(negotiated, transport) {
        return Err(refuse(transport, reason));
    }
    if !negotiated.requires_tls() && !allow_classic {
        return Err(refuse(transport, "classic protocol is not allowed".to_string()));
    }
    write_line(transport, &format!("{} cf-serverd {}", latest.wire_token(), VERSION))?;

    let identity = read_line(transport)?;
    let username = match identity
        .strip_prefix("IDENTITY USERNAME=")
        .map(str::trim)
    {
        Some(name) if !name.is_empty() && !name.contains(char::is_whitespace) => name.to_string(),
        _ => return Err(refuse(transport, format!("malformed identity {:?}", identity))),
    };
    write_line(transport, &format!("OK WELCOME USERNAME={}", username))?;

    Ok(PeerIdentity {
        protocol: negotiated,
        username,
        key_digest: transport.peer_key_digest(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn classic_dialog_succeeds() {
        let (mut client, mut server) = pair();
        let srv = thread::spawn(move || server_identify(&mut server, ProtocolVersion::LATEST, true));

        let negotiated = client_identify(&mut client, ProtocolVersion::CLASSIC, "alice").unwrap();
        assert_eq!(negotiated, ProtocolVersion::CLASSIC);

        let peer = srv.join().unwrap().unwrap();
        assert_eq!(peer.protocol, ProtocolVersion::CLASSIC);
        assert_eq!(peer.username, "alice");
        assert!(peer.key_digest.is_none());
    }

    #[test]
    fn classic_refused_when_not_allowed() {
        let (mut client, mut server) = pair();
        let srv = thread::spawn(move || server_identify(&mut server, ProtocolVersion::LATEST, false));

        let err = client_identify(&mut client, ProtocolVersion::CLASSIC, "alice").unwrap_err();
        assert!(matches!(err, NetError::Rejected { ref reply } if reply.contains("not allowed")));
        assert!(srv.join().unwrap().is_err());
    }

    #[test]
    fn tls_version_over_plaintext_is_refused() {
        let (mut client, mut server) = pair();
        let srv = thread::spawn(move || server_identify(&mut server, ProtocolVersion::LATEST, true));

        write_line(&mut client, "CFE_v2 cf-agent 0.0.0").unwrap();
        let reply = read_line(&mut client).unwrap();
        assert!(reply.starts_with("BAD"));
        assert!(reply.contains("requires TLS"));
        assert!(srv.join().unwrap().is_err());
    }

    #[test]
    fn garbage_hello_is_refused() {
        let (mut client, mut server) = pair();
        let srv = thread::spawn(move || server_identify(&mut server, ProtocolVersion::LATEST, true));

        write_line(&mut client, "HELLO THERE").unwrap();
        assert!(read_line(&mut client).unwrap().starts_with("BAD unsupported protocol"));
        assert!(matches!(srv.join().unwrap(), Err(NetError::Handshake { .. })));
    }

    #[test]
    fn newer_client_downgrades_to_server_latest() {
        let (mut client, mut server) = pair();
        let srv = thread::spawn(move || {
            // A server whose newest version is classic.
            server_identify(&mut server, ProtocolVersion::CLASSIC, true)
        });

        write_line(&mut client, "CFE_v5 cf-agent 9.9.9").unwrap();
        let greeting = read_line(&mut client).unwrap();
        assert_eq!(parse_from_wire(&greeting), ProtocolVersion::CLASSIC);
        write_line(&mut client, "IDENTITY USERNAME=bob").unwrap();
        assert_eq!(read_line(&mut client).unwrap(), "OK WELCOME USERNAME=bob");
        assert_eq!(srv.join().unwrap().unwrap().protocol, ProtocolVersion::CLASSIC);
    }

    #[test]
    fn client_rejects_garbage_greeting() {
        let (mut client, mut server) = pair();
        let srv = thread::spawn(move || {
            let _hello = read_line(&mut server).unwrap();
            write_line(&mut server, "what?").unwrap();
        });
        let err = client_identify(&mut client, ProtocolVersion::CLASSIC, "alice").unwrap_err();
        assert!(matches!(err, NetError::Handshake { .. }));
        srv.join().unwrap();
    }

    #[test]
    fn classic_client_accepts_newer_server() {
        // min(classic, v3) is classic, which matches the plaintext socket.
        let (mut client, mut server) = pair();
        let srv = thread::spawn(move || {
            let _hello = read_line(&mut server).unwrap();
            write_line(&mut server, "CFE_v3 cf-serverd 9.0.0").unwrap();
            let identity = read_line(&mut server).unwrap();
            write_line(&mut server, &format!("OK WELCOME {}", &identity[9..])).unwrap();
        });
        let negotiated = client_identify(&mut client, ProtocolVersion::CLASSIC, "carol").unwrap();
        assert_eq!(negotiated, ProtocolVersion::CLASSIC);
        srv.join().unwrap();
    }

    #[test]
    fn overlong_lines_are_rejected() {
        let (mut client, mut server) = pair();
        let srv = thread::spawn(move || read_line(&mut server));
        client.write_all(&vec![b'a'; MAX_LINE + 10]).unwrap();
        client.write_all(b"\n").unwrap();
        assert!(matches!(srv.join().unwrap(), Err(NetError::Handshake { .. })));
    }
}
