//! Framed socket transport: buffered TCP connections with primitive reads and message writes.
//! Writes are buffered; callers flush (or use `send`) after each logical message.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use switchyard_core::{encode_message, status, Message, MessageKind, StartStatus, MAX_STRING_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use uuid::Uuid;

use crate::error::{Result, RouterError};

/// Process-unique identity of a connection, used for logs and disconnect cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An established, buffered TCP stream. Dropping it closes the socket.
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    stream: BufStream<TcpStream>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            id: ConnectionId::next(),
            remote,
            stream: BufStream::new(stream),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn read_message(&mut self) -> Result<Message> {
        read_message(self).await
    }

    /// Write one message and flush it.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        write_message(self, msg).await?;
        self.flush().await?;
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Client role: dial `address:port`.
pub async fn connect(address: &str, port: u16) -> Result<Connection> {
    let stream = TcpStream::connect((address, port)).await?;
    Ok(Connection::new(stream)?)
}

/// Server role: accepts connections indefinitely.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(Self {
            inner: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub async fn accept(&self) -> io::Result<Connection> {
        let (stream, _) = self.inner.accept().await?;
        Connection::new(stream)
    }
}

fn read_err(e: io::Error) -> RouterError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        RouterError::ConnectionClosed
    } else {
        RouterError::Io(e)
    }
}

pub async fn read_i16<R: AsyncRead + Unpin>(r: &mut R) -> Result<i16> {
    r.read_i16_le().await.map_err(read_err)
}

pub async fn read_i32<R: AsyncRead + Unpin>(r: &mut R) -> Result<i32> {
    r.read_i32_le().await.map_err(read_err)
}

pub async fn read_guid<R: AsyncRead + Unpin>(r: &mut R) -> Result<Uuid> {
    let mut b = [0u8; 16];
    r.read_exact(&mut b).await.map_err(read_err)?;
    Ok(Uuid::from_bytes_le(b))
}

pub async fn read_bytes<R: AsyncRead + Unpin>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut b = vec![0u8; len];
    r.read_exact(&mut b).await.map_err(read_err)?;
    Ok(b)
}

/// u32 LE byte length followed by UTF-8.
pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let len = r.read_u32_le().await.map_err(read_err)?;
    if len > MAX_STRING_LEN {
        return Err(RouterError::InvalidString(format!(
            "length {} exceeds limit",
            len
        )));
    }
    let bytes = read_bytes(r, len as usize).await?;
    String::from_utf8(bytes).map_err(|e| RouterError::InvalidString(e.to_string()))
}

async fn read_status<R: AsyncRead + Unpin>(r: &mut R) -> Result<StartStatus> {
    let code = read_i32(r).await?;
    if code == status::SUCCESS {
        return Ok(StartStatus::Started);
    }
    let message = read_string(r).await?;
    Ok(StartStatus::Failed { code, message })
}

/// Read exactly one message; never consumes bytes past its end.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message> {
    let raw = read_i16(r).await?;
    let kind = MessageKind::try_from(raw).map_err(RouterError::UnknownMessageKind)?;
    Ok(match kind {
        MessageKind::ServiceProvideServer => Message::ServiceProvideServer {
            url: read_string(r).await?,
        },
        MessageKind::TaskProvideServer => Message::TaskProvideServer {
            url: read_string(r).await?,
        },
        MessageKind::ClientRequestServer => Message::ClientRequestServer {
            url: read_string(r).await?,
        },
        MessageKind::ServiceRequestServer => {
            let url = read_string(r).await?;
            let guid = read_guid(r).await?;
            Message::ServiceRequestServer { url, guid }
        }
        MessageKind::ClientServerStarted => Message::ClientServerStarted {
            status: read_status(r).await?,
        },
        MessageKind::ServerStarted => {
            let guid = read_guid(r).await?;
            let status = read_status(r).await?;
            Message::ServerStarted { guid, status }
        }
    })
}

/// Write one message without flushing.
pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<()> {
    let frame = encode_message(msg)?;
    w.write_all(&frame).await?;
    Ok(())
}
