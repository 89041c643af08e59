//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes over one physical connection,
//! and the `Dialer` that establishes it.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: A Transport knows nothing about frames or streams.
//!   It moves opaque buffers; the connection's frame parser gives them meaning.
//! - **Stream vs Datagram**: Stream transports deliver an unbounded byte
//!   sequence, datagram transports deliver one message per `recv`. The
//!   connection reads and writes them differently, so the kind is explicit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpSocket;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::error::Error;
use crate::error::Result;

/// Largest datagram `UdpTransport` will receive.
const MAX_DATAGRAM_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
    Datagram,
}

/// Network names accepted by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
}

impl Network {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            "udp" => Ok(Self::Udp),
            "udp4" => Ok(Self::Udp4),
            "udp6" => Ok(Self::Udp6),
            "unix" => Ok(Self::Unix),
            other => Err(Error::UnsupportedNetwork(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Udp => "udp",
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
            Self::Unix => "unix",
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Udp | Self::Udp4 | Self::Udp6 => TransportKind::Datagram,
            _ => TransportKind::Stream,
        }
    }

    /// Whether a resolved address belongs to this network's address family.
    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp4 | Self::Udp4 => addr.is_ipv4(),
            Self::Tcp6 | Self::Udp6 => addr.is_ipv6(),
            _ => true,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS material for dialers that support it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub ca_cert_file: String,
    pub cert_file: String,
    pub key_file: String,
    pub server_name: String,
}

/// Everything a dialer needs to open one physical connection.
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub network: Network,
    pub address: String,
    pub local_addr: Option<String>,
    pub timeout: Duration,
    pub tls: Option<TlsOptions>,
}

/// One physical connection.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`); `send`
/// and `recv` are called concurrently from different tasks.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Writes the whole payload (stream) or sends it as one datagram.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Appends received bytes to `buf` and returns how many were added.
    ///
    /// # invariants
    /// - Datagram transports append exactly one datagram per call.
    /// - `Ok(0)` from a stream transport means the peer closed the connection.
    async fn recv(&self, buf: &mut BytesMut) -> Result<usize>;

    async fn close(&self);

    fn local_addr(&self) -> Option<String>;

    fn remote_addr(&self) -> Option<String>;

    fn is_active(&self) -> bool;
}

/// Opens physical connections.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, opts: &DialOptions) -> Result<Arc<dyn Transport>>;
}

/// A stream transport over any pair of async read/write halves.
pub struct StreamTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    local_addr: Option<String>,
    remote_addr: Option<String>,
    active: AtomicBool,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(reader: R, writer: W, local_addr: Option<String>, remote_addr: Option<String>) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local_addr,
            remote_addr,
            active: AtomicBool::new(true),
        }
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(payload).await?;
            writer.flush().await
        };
        written.await.map_err(|e| {
            self.active.store(false, Ordering::Release);
            Error::from(e)
        })
    }

    async fn recv(&self, buf: &mut BytesMut) -> Result<usize> {
        let mut reader = self.reader.lock().await;
        match reader.read_buf(buf).await {
            Ok(0) => {
                self.active.store(false, Ordering::Release);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.active.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    async fn close(&self) {
        self.active.store(false, Ordering::Release);
        let _ = self.writer.lock().await.shutdown().await;
    }

    fn local_addr(&self) -> Option<String> {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// A connected UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: Option<String>,
    remote_addr: Option<String>,
    active: AtomicBool,
}

impl UdpTransport {
    /// Wraps a socket that has already been `connect`ed to its peer.
    pub fn new(socket: UdpSocket) -> Self {
        let local_addr = socket.local_addr().ok().map(|a| a.to_string());
        let remote_addr = socket.peer_addr().ok().map(|a| a.to_string());
        Self {
            socket,
            local_addr,
            remote_addr,
            active: AtomicBool::new(true),
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        self.socket.send(payload).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut BytesMut) -> Result<usize> {
        buf.reserve(MAX_DATAGRAM_LEN);
        let n = self.socket.recv_buf(buf).await?;
        Ok(n)
    }

    async fn close(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn local_addr(&self) -> Option<String> {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Dials plain TCP, UDP and Unix sockets with tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetDialer;

impl NetDialer {
    async fn resolve(network: Network, address: &str) -> Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host(address)
            .await
            .map_err(|e| Error::Dial(format!("resolve {}: {}", address, e)))?;
        addrs
            .find(|addr| network.accepts(addr))
            .ok_or_else(|| Error::Dial(format!("no {} address for {}", network, address)))
    }

    fn parse_local(local_addr: &str) -> Result<SocketAddr> {
        local_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid local address {}: {}", local_addr, e)))
    }

    async fn dial_tcp(opts: &DialOptions) -> Result<Arc<dyn Transport>> {
        let remote = Self::resolve(opts.network, &opts.address).await?;
        let socket = match remote {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        };
        let socket = socket.map_err(|e| Error::Dial(e.to_string()))?;
        if let Some(local) = &opts.local_addr {
            socket
                .bind(Self::parse_local(local)?)
                .map_err(|e| Error::Dial(format!("bind {}: {}", local, e)))?;
        }
        let stream = socket
            .connect(remote)
            .await
            .map_err(|e| Error::Dial(format!("connect {}: {}", remote, e)))?;
        stream.set_nodelay(true).map_err(|e| Error::Dial(e.to_string()))?;

        let local_addr = stream.local_addr().ok().map(|a| a.to_string());
        let remote_addr = stream.peer_addr().ok().map(|a| a.to_string());
        let (reader, writer) = stream.into_split();
        Ok(Arc::new(StreamTransport::new(reader, writer, local_addr, remote_addr)))
    }

    async fn dial_udp(opts: &DialOptions) -> Result<Arc<dyn Transport>> {
        let remote = Self::resolve(opts.network, &opts.address).await?;
        let local = match &opts.local_addr {
            Some(local) => Self::parse_local(local)?,
            None if remote.is_ipv4() => SocketAddr::from(([0, 0, 0, 0], 0)),
            None => SocketAddr::from(([0u16; 8], 0)),
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| Error::Dial(format!("bind {}: {}", local, e)))?;
        socket
            .connect(remote)
            .await
            .map_err(|e| Error::Dial(format!("connect {}: {}", remote, e)))?;
        Ok(Arc::new(UdpTransport::new(socket)))
    }

    #[cfg(unix)]
    async fn dial_unix(opts: &DialOptions) -> Result<Arc<dyn Transport>> {
        let stream = tokio::net::UnixStream::connect(&opts.address)
            .await
            .map_err(|e| Error::Dial(format!("connect {}: {}", opts.address, e)))?;
        let local_addr = stream
            .local_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()));
        let (reader, writer) = stream.into_split();
        let transport = StreamTransport::new(reader, writer, local_addr, Some(opts.address.clone()));
        Ok(Arc::new(transport))
    }

    #[cfg(not(unix))]
    async fn dial_unix(opts: &DialOptions) -> Result<Arc<dyn Transport>> {
        Err(Error::UnsupportedNetwork(opts.network.to_string()))
    }
}

#[async_trait::async_trait]
impl Dialer for NetDialer {
    async fn dial(&self, opts: &DialOptions) -> Result<Arc<dyn Transport>> {
        if opts.tls.is_some() {
            return Err(Error::Config("TLS requires a dialer that supports it".into()));
        }

        let dial = async {
            match opts.network {
                Network::Unix => Self::dial_unix(opts).await,
                network if network.kind() == TransportKind::Datagram => Self::dial_udp(opts).await,
                _ => Self::dial_tcp(opts).await,
            }
        };

        tokio::time::timeout(opts.timeout, dial)
            .await
            .map_err(|_| Error::Dial(format!("dial {} timed out after {:?}", opts.address, opts.timeout)))?
    }
}
