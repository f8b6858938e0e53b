use std::{future::Future, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::error::{Error, ErrorKind, Result};

pub(crate) const MAGIC_NUM: u32 = u32::from_be_bytes(*b"MRPC");
pub(crate) const MAX_MSG_SIZE: usize = 64 << 20;
const HEADER_SIZE: usize = std::mem::size_of::<u64>();
/// Pause after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) does not spin the accept loop.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// Upper bound on growing the buffer ahead of a frame body; larger bodies
/// grow the buffer as their bytes arrive.
const MAX_RESERVE: usize = 64 << 10;

/// A buffered, length-aware byte stream over one duplex connection.
///
/// Frames on the wire look like this, all integers big-endian:
///
/// ```text
/// | 4 bytes | 4 bytes  | len bytes |
/// | "MRPC"  | len      | body      |
/// ```
///
/// The raw `recv_exact` / `send_all` primitives are also used by the
/// fixed-binary codec, which does its own framing.
#[derive(Debug)]
pub struct Transport<S = TcpStream> {
    stream: S,
    buffer: BytesMut,
}

impl Transport<TcpStream> {
    /// Connects to `host:port`. `host` may be an IPv4 or IPv6 literal or a
    /// name to resolve; the address family follows from the parsed address.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let connect = TcpStream::connect((host, port));
        let stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                Error::new(
                    ErrorKind::Timeout,
                    format!("connect to {host}:{port} timed out"),
                )
            })?
            .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, format!("{host}:{port}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("set nodelay for {host}:{port} failed: {e}");
        }
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Writes every byte of `bytes` and flushes.
    pub async fn send_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpSendMsgFailed, e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| Error::new(ErrorKind::TcpSendMsgFailed, e.to_string()))
    }

    /// Sends `body` as one length-prefixed frame.
    pub async fn send_frame(&mut self, body: &[u8]) -> Result<()> {
        if HEADER_SIZE + body.len() >= MAX_MSG_SIZE {
            return Err(Error::new(
                ErrorKind::TcpParseMsgFailed,
                format!("msg is too long: {}", body.len()),
            ));
        }
        let len = u32::try_from(body.len())?;
        let mut bytes = BytesMut::with_capacity(HEADER_SIZE + body.len());
        bytes.extend_from_slice(&MAGIC_NUM.to_be_bytes());
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(body);
        self.send_all(&bytes).await
    }

    /// Receives one frame body.
    ///
    /// Returns `Ok(None)` if the peer closed the stream cleanly between
    /// frames. A close in the middle of a frame is an `EndOfStream` error.
    pub async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(bytes) = parse_frame(&mut self.buffer)? {
                return Ok(Some(bytes));
            }
            if self.fill_buf().await? == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(Error::new(
                        ErrorKind::EndOfStream,
                        format!("peer closed with {} bytes of a partial frame", self.buffer.len()),
                    ))
                };
            }
        }
    }

    /// Receives exactly `size` bytes, looping on short reads.
    pub async fn recv_exact(&mut self, size: usize) -> Result<Bytes> {
        while self.buffer.len() < size {
            if self.fill_buf().await? == 0 {
                return Err(Error::new(
                    ErrorKind::EndOfStream,
                    format!("wanted {size} bytes, got {}", self.buffer.len()),
                ));
            }
        }
        Ok(self.buffer.split_to(size).freeze())
    }

    /// Waits until at least one byte is readable. Returns `false` on a clean
    /// end of stream with nothing buffered.
    pub async fn has_more(&mut self) -> Result<bool> {
        if !self.buffer.is_empty() {
            return Ok(true);
        }
        Ok(self.fill_buf().await? > 0)
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| Error::new(ErrorKind::TcpSendMsgFailed, e.to_string()))
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        self.stream
            .read_buf(&mut self.buffer)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpRecvMsgFailed, e.to_string()))
    }
}

/// Calls `accept` until it succeeds, sleeping [`ACCEPT_BACKOFF`] after
/// every failure.
pub(crate) async fn accept_with_backoff<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::warn!("accept failed, retry in {ACCEPT_BACKOFF:?}: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

fn parse_frame(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    if buffer.len() < HEADER_SIZE {
        return Ok(None);
    }
    let mut header = &buffer[..HEADER_SIZE];
    let magic_num = header.get_u32();
    if magic_num != MAGIC_NUM {
        return Err(Error::new(
            ErrorKind::TcpParseMsgFailed,
            format!("invalid magic num: {magic_num:08X}"),
        ));
    }

    let len = usize::try_from(header.get_u32())?;
    if HEADER_SIZE + len >= MAX_MSG_SIZE {
        return Err(Error::new(
            ErrorKind::TcpParseMsgFailed,
            format!("msg is too long: {len}"),
        ));
    }

    if buffer.len() < HEADER_SIZE + len {
        buffer.reserve((HEADER_SIZE + len - buffer.len()).min(MAX_RESERVE));
        Ok(None)
    } else {
        buffer.advance(HEADER_SIZE);
        Ok(Some(buffer.split_to(len).freeze()))
    }
}
