use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use derive_more::Debug;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};
use tracing::{debug, instrument, trace};

use crate::error::{BridgeError, Result};

/// Largest payload a single sync `DATA` packet may carry.
pub const SYNC_MAX_CHUNK: usize = 64 * 1024;

/// Byte stream a [`Connection`] can run over.
pub trait Wire: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Wire for T {}

/// Opens raw connections to a bridge server.
#[async_trait]
pub trait Dialer: Send + Sync + std::fmt::Debug {
    async fn dial(&self, address: &str) -> Result<Connection>;
}

/// Default [`Dialer`] using plain TCP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    #[instrument(level = "trace", skip(self), err)]
    async fn dial(&self, address: &str) -> Result<Connection> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| BridgeError::Connect { address: address.to_string(), source })?;
        stream.set_nodelay(true)?;
        Ok(Connection::new(stream, address))
    }
}

/// Identifiers of the sync sub-protocol packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncId {
    Send,
    Recv,
    Stat,
    Data,
    Done,
    Okay,
    Fail,
    Quit,
}

impl SyncId {
    pub fn code(self) -> &'static [u8; 4] {
        match self {
            SyncId::Send => b"SEND",
            SyncId::Recv => b"RECV",
            SyncId::Stat => b"STAT",
            SyncId::Data => b"DATA",
            SyncId::Done => b"DONE",
            SyncId::Okay => b"OKAY",
            SyncId::Fail => b"FAIL",
            SyncId::Quit => b"QUIT",
        }
    }

    pub fn from_code(code: &[u8; 4]) -> Option<Self> {
        Some(match code {
            b"SEND" => SyncId::Send,
            b"RECV" => SyncId::Recv,
            b"STAT" => SyncId::Stat,
            b"DATA" => SyncId::Data,
            b"DONE" => SyncId::Done,
            b"OKAY" => SyncId::Okay,
            b"FAIL" => SyncId::Fail,
            b"QUIT" => SyncId::Quit,
            _ => return None,
        })
    }
}

/// Prefixes `payload` with its length as four uppercase hex digits.
pub fn encode_request(payload: &str) -> Result<String> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        BridgeError::InvalidArgument(format!("request too long ({} bytes)", payload.len()))
    })?;
    Ok(format!("{len:0>4X}{payload}"))
}

fn parse_hex_length(bytes: &[u8; 4]) -> Result<usize> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or_else(|| {
            BridgeError::protocol(format!(
                "invalid length prefix {:?}",
                String::from_utf8_lossy(bytes)
            ))
        })
}

/// A single socket to the bridge server.
///
/// Every logical operation owns its own connection. Closing drops the socket, so it is
/// synchronous and can be repeated safely; reads on a closed connection report EOF and
/// writes fail with [`io::ErrorKind::NotConnected`].
#[derive(Debug)]
pub struct Connection {
    peer: String,
    #[debug(skip)]
    stream: Option<Box<dyn Wire>>,
}

impl Connection {
    pub fn new(stream: impl Wire + 'static, peer: impl Into<String>) -> Self {
        Self { peer: peer.into(), stream: Some(Box::new(stream)) }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            trace!(peer = %self.peer, "Connection closed");
        }
    }

    fn wire(&mut self) -> Result<&mut Box<dyn Wire>> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed").into())
    }

    /// Writes a length-prefixed host request.
    pub async fn send_request(&mut self, request: &str) -> Result<()> {
        let message = encode_request(request)?;
        trace!(request, "Sending request");
        let wire = self.wire()?;
        wire.write_all(message.as_bytes()).await?;
        wire.flush().await?;
        Ok(())
    }

    /// Reads the `OKAY`/`FAIL` status answering `request`.
    pub async fn read_status(&mut self, request: &str) -> Result<()> {
        let mut status = [0u8; 4];
        self.wire()?.read_exact(&mut status).await?;
        match &status {
            b"OKAY" => Ok(()),
            b"FAIL" => {
                let message = self.read_length_prefixed().await?;
                let message = String::from_utf8_lossy(&message).into_owned();
                debug!(request, message, "Request rejected by server");
                Err(BridgeError::Rejected { request: request.to_string(), message })
            }
            other => Err(BridgeError::protocol(format!(
                "unexpected status {:?} for '{request}'",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Sends `request` and waits for the server to accept it.
    pub async fn execute(&mut self, request: &str) -> Result<()> {
        self.send_request(request).await?;
        self.read_status(request).await
    }

    /// Reads one host message: a four hex digit length followed by the payload.
    pub async fn read_length_prefixed(&mut self) -> Result<Vec<u8>> {
        let mut prefix = [0u8; 4];
        let wire = self.wire()?;
        wire.read_exact(&mut prefix).await?;
        let len = parse_hex_length(&prefix)?;
        let mut payload = vec![0u8; len];
        wire.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Reads until the server closes the stream.
    pub async fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        if let Some(wire) = self.stream.as_mut() {
            wire.read_to_end(&mut output).await?;
        }
        Ok(output)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.wire()?.read_exact(buf).await?;
        Ok(())
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.wire()?.write_all(buf).await?;
        Ok(())
    }

    /// Writes a sync packet header (`id` + little-endian length) followed by `payload`.
    pub async fn write_sync_packet(&mut self, id: SyncId, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            BridgeError::InvalidArgument(format!("sync payload too long ({} bytes)", payload.len()))
        })?;
        self.write_sync_header(id, len).await?;
        self.write_all(payload).await
    }

    /// Writes a sync header whose length field carries a plain value (e.g. `DONE` mtime).
    pub async fn write_sync_header(&mut self, id: SyncId, value: u32) -> Result<()> {
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(id.code());
        header[4..].copy_from_slice(&value.to_le_bytes());
        self.write_all(&header).await
    }

    pub async fn read_sync_header(&mut self) -> Result<(SyncId, u32)> {
        let mut header = [0u8; 8];
        self.read_exact(&mut header).await?;
        let mut code = [0u8; 4];
        code.copy_from_slice(&header[..4]);
        let id = SyncId::from_code(&code).ok_or_else(|| {
            BridgeError::protocol(format!(
                "unknown sync packet {:?}",
                String::from_utf8_lossy(&code)
            ))
        })?;
        let value = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        Ok((id, value))
    }

    /// Reads the message of a sync `FAIL` packet whose header has already been consumed.
    pub async fn read_sync_failure(&mut self, request: &str, len: u32) -> Result<BridgeError> {
        let mut message = vec![0u8; len as usize];
        self.read_exact(&mut message).await?;
        Ok(BridgeError::Rejected {
            request: request.to_string(),
            message: String::from_utf8_lossy(&message).into_owned(),
        })
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(wire) => Pin::new(wire).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}
