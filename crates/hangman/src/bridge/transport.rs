//! Instance channel transport over Unix domain sockets.
//!
//! Platform-specific addressing:
//! - **Named**: filesystem sockets (macOS, Linux, BSD) at `{dir}/{name}.sock`
//! - **Abstract**: Linux abstract namespace (no filesystem entry, auto-cleanup)
//!
//! Both ends exchange length-delimited text frames (see [`MessageCodec`]).
//! The server side is a [`ChannelListener`] handing out [`ServerChannel`]s;
//! the client side is a [`ClientChannel`]. Both implement [`Duplex`].

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::MessageCodec;

/// Delay between connection attempts while the primary is not yet listening.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

pub type MessageReader = FramedRead<OwnedReadHalf, MessageCodec>;
pub type MessageWriter = FramedWrite<OwnedWriteHalf, MessageCodec>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel closed by peer")]
    Closed,
    #[error("timed out after {0:?} waiting for the primary instance")]
    ConnectTimeout(Duration),
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Map a write-side I/O failure, folding "peer went away" into `NotConnected`.
    fn from_write(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected => Self::NotConnected,
            _ => Self::Io(err),
        }
    }
}

/// Which socket namespace a channel lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Named,
    #[cfg(target_os = "linux")]
    Abstract,
}

impl TransportKind {
    /// Abstract on Linux, named elsewhere.
    pub fn platform_default() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Abstract
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::Named
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Named => "named",
            #[cfg(target_os = "linux")]
            Self::Abstract => "abstract",
        }
    }
}

/// Rendezvous address shared by the primary and its secondaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAddress {
    /// Socket path: `{dir}/{name}.sock`
    Named(PathBuf),
    #[cfg(target_os = "linux")]
    Abstract(String),
}

impl ChannelAddress {
    pub fn new(kind: TransportKind, name: &str, dir: &Path) -> Self {
        match kind {
            TransportKind::Named => Self::Named(dir.join(format!("{name}.sock"))),
            #[cfg(target_os = "linux")]
            TransportKind::Abstract => Self::Abstract(name.to_string()),
        }
    }
}

impl std::fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(path) => write!(f, "{}", path.display()),
            #[cfg(target_os = "linux")]
            Self::Abstract(name) => write!(f, "@{name}"),
        }
    }
}

/// The capability set shared by both channel roles.
#[async_trait]
pub trait Duplex: Send {
    /// Write one message and flush it.
    async fn send(&mut self, message: String) -> Result<(), ChannelError>;

    /// Wait for the next complete message.
    async fn receive(&mut self) -> Result<String, ChannelError>;

    /// Flush pending frames, then shut the connection down. Idempotent.
    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Bound server socket. Accepting is asynchronous; binding returns at once.
pub struct ChannelListener {
    address: ChannelAddress,
    listener: tokio::net::UnixListener,
}

impl ChannelListener {
    pub fn bind(address: ChannelAddress) -> io::Result<Self> {
        let listener = match &address {
            ChannelAddress::Named(path) => {
                use std::os::unix::net::UnixListener as StdUnixListener;

                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                // Only the lock holder binds, so anything here is stale.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }

                let std_listener = StdUnixListener::bind(path)?;
                std_listener.set_nonblocking(true)?;
                tokio::net::UnixListener::from_std(std_listener)?
            }
            #[cfg(target_os = "linux")]
            ChannelAddress::Abstract(name) => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                let std_listener = StdUnixListener::bind_addr(&addr)?;
                std_listener.set_nonblocking(true)?;
                tokio::net::UnixListener::from_std(std_listener)?
            }
        };

        tracing::debug!(address = %address, "Channel listener bound");
        Ok(Self { address, listener })
    }

    pub async fn accept(&self) -> io::Result<ServerChannel> {
        let (stream, _) = self.listener.accept().await?;
        Ok(ServerChannel::new(stream))
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    pub fn cleanup(&self) -> io::Result<()> {
        if let ChannelAddress::Named(path) = &self.address
            && path.exists()
        {
            tracing::debug!(path = %path.display(), "Removing socket file");
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to clean up socket file");
        }
    }
}

/// Framed halves of one connected socket. `None` once closed.
struct FramedHalves {
    reader: MessageReader,
    writer: Option<MessageWriter>,
}

impl FramedHalves {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FramedRead::new(read_half, MessageCodec::new()),
            writer: Some(FramedWrite::new(write_half, MessageCodec::new())),
        }
    }

    async fn send(&mut self, message: String) -> Result<(), ChannelError> {
        let writer = self.writer.as_mut().ok_or(ChannelError::NotConnected)?;
        writer.send(message).await.map_err(ChannelError::from_write)
    }

    async fn receive(&mut self) -> Result<String, ChannelError> {
        match self.reader.next().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => Err(ChannelError::Io(e)),
            None => Err(ChannelError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        close_writer(writer).await
    }
}

/// Flush buffered frames, then shut down the write side so the peer sees EOF
/// only after it has everything.
pub async fn close_writer(mut writer: MessageWriter) -> Result<(), ChannelError> {
    let flushed = writer.flush().await;
    let shutdown = writer.get_mut().shutdown().await;
    match (flushed, shutdown) {
        (Err(e), _) | (Ok(()), Err(e)) if e.kind() != io::ErrorKind::NotConnected => {
            Err(ChannelError::from_write(e))
        }
        _ => Ok(()),
    }
}

/// Server role of an accepted connection.
pub struct ServerChannel {
    halves: FramedHalves,
}

impl ServerChannel {
    fn new(stream: UnixStream) -> Self {
        Self {
            halves: FramedHalves::new(stream),
        }
    }

    /// Split into reader and writer so reads and replies can be driven from
    /// one `select!` loop.
    pub fn into_parts(self) -> Option<(MessageReader, MessageWriter)> {
        let FramedHalves { reader, writer } = self.halves;
        writer.map(|writer| (reader, writer))
    }
}

#[async_trait]
impl Duplex for ServerChannel {
    async fn send(&mut self, message: String) -> Result<(), ChannelError> {
        self.halves.send(message).await
    }

    async fn receive(&mut self) -> Result<String, ChannelError> {
        self.halves.receive().await
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.halves.close().await
    }
}

/// Client role, used by secondary instances.
pub struct ClientChannel {
    halves: FramedHalves,
}

impl ClientChannel {
    /// Connect to the primary, retrying until `timeout` elapses.
    ///
    /// A refused or missing socket means the primary holds the lock but has
    /// not bound yet, so the attempt is repeated rather than failed.
    pub async fn connect(address: &ChannelAddress, timeout: Duration) -> Result<Self, ChannelError> {
        let attempt = async {
            loop {
                match connect_once(address).await {
                    Ok(stream) => return Ok(stream),
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        tracing::trace!(address = %address, error = %e, "Primary not listening yet");
                        tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                    }
                    Err(e) => return Err(ChannelError::Io(e)),
                }
            }
        };

        let stream = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| ChannelError::ConnectTimeout(timeout))??;

        tracing::debug!(address = %address, "Connected to primary");
        Ok(Self {
            halves: FramedHalves::new(stream),
        })
    }
}

async fn connect_once(address: &ChannelAddress) -> io::Result<UnixStream> {
    match address {
        ChannelAddress::Named(path) => UnixStream::connect(path).await,
        #[cfg(target_os = "linux")]
        ChannelAddress::Abstract(name) => {
            use std::os::linux::net::SocketAddrExt;
            use std::os::unix::net::SocketAddr;

            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
            // tokio doesn't support abstract sockets directly
            let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            std_stream.set_nonblocking(true)?;
            UnixStream::from_std(std_stream)
        }
    }
}

#[async_trait]
impl Duplex for ClientChannel {
    async fn send(&mut self, message: String) -> Result<(), ChannelError> {
        self.halves.send(message).await
    }

    /// Replies carry no padding, but trailing NULs from a padded peer are
    /// stripped all the same.
    async fn receive(&mut self) -> Result<String, ChannelError> {
        let message = self.halves.receive().await?;
        Ok(message.trim_end_matches('\0').to_string())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.halves.close().await
    }
}
