// transaction.rs - In-band framed request/response transactions.
//
// Every message is an 8-byte header followed by the body:
//
//   "<status> <length>" padded with NUL to 8 bytes
//
// `status` is `t` for the last transaction of a reply and `m` when more
// follow. Bodies are capped at BUFSIZE - header so a whole transaction fits
// one buffer on both ends.

use std::io::{ErrorKind, Read, Write};

use crate::error::NetError;

pub const INBAND_OFFSET: usize = 8;
pub const BUFSIZE: usize = 4096;
pub const MAX_BODY: usize = BUFSIZE - INBAND_OFFSET;

/// Ends multi-transaction listings such as `OPENDIR` replies.
pub const TERMINATOR: &str = "---cfXen/gine/cfXen/gine---";
/// Prefix of every refusal reply.
pub const BAD_PREFIX: &str = "BAD: ";
/// Prefix of every successful single-line reply.
pub const OK_PREFIX: &str = "OK: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Last transaction of a reply (`t`).
    Done,
    /// More transactions follow (`m`).
    More,
}

impl TransactionStatus {
    fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Done => b't',
            TransactionStatus::More => b'm',
        }
    }
}

/// One received transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub status: TransactionStatus,
    pub body: Vec<u8>,
}

impl Transaction {
    pub fn more(&self) -> bool {
        self.status == TransactionStatus::More
    }

    /// Body as text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// `Some(reason)` if this is a `BAD: ` refusal.
    pub fn refusal(&self) -> Option<String> {
        let text = self.text();
        text.strip_prefix(BAD_PREFIX).map(|r| r.to_string())
    }
}

/// Write one framed transaction and flush.
pub fn send_transaction<W>(writer: &mut W, body: &[u8], status: TransactionStatus) -> Result<(), NetError>
where
    W: Write + ?Sized,
{
    if body.len() > MAX_BODY {
        return Err(NetError::BodyTooLarge {
            len: body.len(),
            max: MAX_BODY,
        });
    }

    let mut frame = Vec::with_capacity(INBAND_OFFSET + body.len());
    frame.push(status.as_byte());
    frame.push(b' ');
    frame.extend_from_slice(body.len().to_string().as_bytes());
    frame.resize(INBAND_OFFSET, 0);
    frame.extend_from_slice(body);

    writer.write_all(&frame)?;
    writer.flush()?;
    tracing::trace!(len = body.len(), ?status, "sent transaction");
    Ok(())
}

/// Read one framed transaction.
///
/// End of stream before a header is `PeerClosed`; a header that is not
/// `<char> <decimal>` or announces more than `MAX_BODY` bytes is rejected.
pub fn receive_transaction<R>(reader: &mut R) -> Result<Transaction, NetError>
where
    R: Read + ?Sized,
{
    let mut header = [0u8; INBAND_OFFSET];
    reader.read_exact(&mut header).map_err(eof_is_closed)?;

    let (status, len) = parse_header(&header)?;
    if len > MAX_BODY {
        return Err(NetError::BodyTooLarge {
            len,
            max: MAX_BODY,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(eof_is_closed)?;
    tracing::trace!(len, ?status, "received transaction");
    Ok(Transaction { status, body })
}

fn parse_header(header: &[u8; INBAND_OFFSET]) -> Result<(TransactionStatus, usize), NetError> {
    let bad = || NetError::BadHeader {
        header: String::from_utf8_lossy(header).into_owned(),
    };

    let end = header.iter().position(|&b| b == 0).unwrap_or(INBAND_OFFSET);
    let text = std::str::from_utf8(&header[..end]).map_err(|_| bad())?;
    let (status, len) = text.split_once(' ').ok_or_else(bad)?;

    let status = match status {
        "t" => TransactionStatus::Done,
        "m" => TransactionStatus::More,
        _ => return Err(bad()),
    };
    if len.is_empty() || !len.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let len = len.parse::<usize>().map_err(|_| bad())?;
    Ok((status, len))
}

fn eof_is_closed(e: std::io::Error) -> NetError {
    if e.kind() == ErrorKind::UnexpectedEof {
        NetError::PeerClosed
    } else {
        NetError::Io(e)
    }
}

/// Send `data` as as many `m` transactions as needed, ending with `t`.
/// Empty data is a single empty `t` transaction.
pub fn send_chunked<W>(writer: &mut W, data: &[u8]) -> Result<(), NetError>
where
    W: Write + ?Sized,
{
    if data.is_empty() {
        return send_transaction(writer, &[], TransactionStatus::Done);
    }
    let mut chunks = data.chunks(MAX_BODY).peekable();
    while let Some(chunk) = chunks.next() {
        let status = if chunks.peek().is_some() {
            TransactionStatus::More
        } else {
            TransactionStatus::Done
        };
        send_transaction(writer, chunk, status)?;
    }
    Ok(())
}

/// Collect transactions until a `t` one arrives.
pub fn receive_chunked<R>(reader: &mut R) -> Result<Vec<u8>, NetError>
where
    R: Read + ?Sized,
{
    let mut data = Vec::new();
    loop {
        let tx = receive_transaction(reader)?;
        data.extend_from_slice(&tx.body);
        if !tx.more() {
            return Ok(data);
        }
    }
}
