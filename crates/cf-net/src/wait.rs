// wait.rs - Bounded readiness waits on sockets.

use std::os::unix::io::AsRawFd;
use std::time::Duration;

use crate::error::NetError;

/// Wait until `socket` is readable (or, for a listener, has a pending
/// connection), for at most `timeout`.
///
/// Returns `Ok(false)` on timeout and when the wait was interrupted by a
/// signal, so callers can re-check shutdown flags and loop.
pub fn wait_for_incoming<S: AsRawFd + ?Sized>(socket: &S, timeout: Duration) -> Result<bool, NetError> {
    let mut pfd = libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(NetError::Io(err));
    }
    Ok(rc > 0 && pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn listener_times_out_without_clients() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(!wait_for_incoming(&listener, Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn listener_ready_with_pending_client() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        assert!(wait_for_incoming(&listener, Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn stream_ready_when_data_arrives() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        assert!(!wait_for_incoming(&server_side, Duration::from_millis(20)).unwrap());
        client.write_all(b"x").unwrap();
        assert!(wait_for_incoming(&server_side, Duration::from_secs(2)).unwrap());
    }
}
