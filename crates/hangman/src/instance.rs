//! Single-instance coordination.
//!
//! [`elect`] decides once per launch whether this process is the primary
//! (it won the lock and serves the channel) or a secondary (it forwards its
//! invocation to the primary and exits).

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::{
    ChannelAddress, ChannelError, ChannelListener, ClientChannel, Duplex, Envelope,
    EnvelopeError,
};
use crate::config::{CoordinatorConfig, ReplyMode};
use crate::multiplexer::{Multiplexer, MultiplexerError, ServerEvent};

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: ChannelAddress,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Shutdown(#[from] MultiplexerError),
}

/// Program identity: the executable's file stem. Names both the lock file
/// and the channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessIdentity(String);

impl ProcessIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn current() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        let stem = exe
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("executable path has no usable name: {}", exe.display()),
                )
            })?;
        Ok(Self(stem.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exclusive `flock` held for the primary's lifetime. Released on drop.
pub struct InstanceLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl InstanceLock {
    /// `Ok(None)` when another process holds the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, InstanceError> {
        let lock_err = |source: io::Error| InstanceError::Lock {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(lock_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(lock_err)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                tracing::debug!(path = %path.display(), "Instance lock acquired");
                Ok(Some(Self {
                    _lock: lock,
                    path: path.to_path_buf(),
                }))
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(lock_err(io::Error::from(errno))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "Instance lock released");
    }
}

/// Application logic run by the primary for each forwarded invocation.
#[async_trait]
pub trait InvocationHandler: Send + Sync + 'static {
    /// Handle one invocation; the returned text is the reply.
    async fn handle(&self, envelope: Envelope) -> String;
}

/// Requests that the primary shut down.
#[derive(Debug, Clone, Default)]
pub struct ExitHandle {
    token: CancellationToken,
}

impl ExitHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_exit(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Exit requested");
        }
        self.token.cancel();
    }

    pub fn is_exit_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn exit_requested(&self) {
        self.token.cancelled().await
    }
}

pub enum Role {
    Primary(PrimaryInstance),
    Secondary(SecondaryInstance),
}

/// Take the primary role if the lock is free, otherwise become a secondary.
///
/// Must run inside a Tokio runtime: the primary starts serving immediately.
pub async fn elect(config: &CoordinatorConfig) -> Result<Role, InstanceError> {
    let address = config.channel_address();

    let Some(lock) = InstanceLock::try_acquire(&config.lock_path())? else {
        tracing::debug!(identity = %config.identity, "Primary already running");
        return Ok(Role::Secondary(SecondaryInstance {
            address,
            connect_timeout: config.connect_timeout,
            reply_mode: config.reply_mode,
        }));
    };

    let listener = ChannelListener::bind(address.clone())
        .map_err(|source| InstanceError::Bind { address, source })?;
    let (multiplexer, events) = Multiplexer::start(listener);
    tracing::info!(identity = %config.identity, "Running as primary");

    Ok(Role::Primary(PrimaryInstance {
        lock,
        multiplexer,
        events,
        exit: ExitHandle::new(),
    }))
}

pub struct PrimaryInstance {
    lock: InstanceLock,
    multiplexer: Multiplexer,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    exit: ExitHandle,
}

impl PrimaryInstance {
    pub fn exit_handle(&self) -> ExitHandle {
        self.exit.clone()
    }

    pub fn address(&self) -> &ChannelAddress {
        self.multiplexer.address()
    }

    /// Dispatch forwarded invocations to `handler` until exit is requested,
    /// then stop serving and release the lock.
    pub async fn run<H: InvocationHandler>(self, handler: Arc<H>) -> Result<(), InstanceError> {
        let Self {
            lock,
            multiplexer,
            mut events,
            exit,
        } = self;

        loop {
            let event = tokio::select! {
                _ = exit.exit_requested() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };

            match event {
                ServerEvent::Connected { endpoint } => {
                    tracing::trace!(%endpoint, "Connection opened");
                }
                ServerEvent::Disconnected { endpoint } => {
                    tracing::trace!(%endpoint, "Connection closed");
                }
                ServerEvent::MessageReceived {
                    endpoint,
                    message,
                    reply,
                } => {
                    match Envelope::decode(&message) {
                        Ok(envelope) => {
                            tracing::debug!(%endpoint, args = ?envelope.args, "Invocation received");
                            let text = handler.handle(envelope).await;
                            if let Err(e) = reply.send(text) {
                                tracing::debug!(%endpoint, error = %e, "Caller left before reply");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(%endpoint, error = %e, "Dropping malformed message");
                        }
                    }
                    // Closing without a reply tells the caller nothing is coming.
                    if let Err(e) = reply.finish() {
                        tracing::trace!(%endpoint, error = %e, "Connection already gone");
                    }
                }
            }
        }

        let stopped = multiplexer.stop().await;
        drop(lock);
        stopped?;
        Ok(())
    }
}

pub struct SecondaryInstance {
    address: ChannelAddress,
    connect_timeout: Duration,
    reply_mode: ReplyMode,
}

impl SecondaryInstance {
    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    /// Send `envelope` to the primary. Returns its reply, or `None` when not
    /// awaiting one or when the primary closed without replying.
    pub async fn forward(&self, envelope: &Envelope) -> Result<Option<String>, InstanceError> {
        envelope.validate()?;
        let mut channel = ClientChannel::connect(&self.address, self.connect_timeout).await?;
        channel.send(envelope.encode()).await?;

        let reply = match self.reply_mode {
            ReplyMode::Await => match channel.receive().await {
                Ok(text) => Some(text),
                Err(ChannelError::Closed) => None,
                Err(e) => return Err(e.into()),
            },
            ReplyMode::None => None,
        };

        channel.close().await?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::bridge::TransportKind;

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InvocationHandler for Echo {
        async fn handle(&self, envelope: Envelope) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            format!("{} in {}", envelope.args.join(" "), envelope.working_directory.display())
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> CoordinatorConfig {
        CoordinatorConfig::new(ProcessIdentity::new("instance-test"))
            .with_runtime_dir(dir.path())
            .with_transport(TransportKind::Named)
            .with_connect_timeout(Duration::from_secs(5))
    }

    fn envelope(args: &[&str]) -> Envelope {
        Envelope::new(
            args.iter().map(|a| a.to_string()).collect(),
            "/work",
            BTreeMap::new(),
        )
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool.lock");

        let first = InstanceLock::try_acquire(&path).unwrap().unwrap();
        assert!(InstanceLock::try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(InstanceLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn identity_from_current_executable() {
        let identity = ProcessIdentity::current().unwrap();
        assert!(!identity.as_str().is_empty());
        assert!(!identity.as_str().contains('/'));
    }

    #[tokio::test]
    async fn secondary_forwards_to_primary() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let Role::Primary(primary) = elect(&config).await.unwrap() else {
            panic!("first election should win");
        };
        let Role::Secondary(secondary) = elect(&config).await.unwrap() else {
            panic!("second election should lose");
        };

        let exit = primary.exit_handle();
        let handler = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let server = tokio::spawn(primary.run(Arc::clone(&handler)));

        let reply = secondary.forward(&envelope(&["make", "all"])).await.unwrap();
        assert_eq!(reply.as_deref(), Some("make all in /work"));

        exit.request_exit();
        server.await.unwrap().unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        // Lock and socket are released on exit.
        assert!(!dir.path().join("instance-test.sock").exists());
        assert!(matches!(elect(&config).await.unwrap(), Role::Primary(_)));
    }

    #[tokio::test]
    async fn malformed_message_gets_no_reply() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let Role::Primary(primary) = elect(&config).await.unwrap() else {
            panic!("expected primary");
        };

        let exit = primary.exit_handle();
        let handler = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let server = tokio::spawn(primary.run(Arc::clone(&handler)));

        let mut raw = ClientChannel::connect(&config.channel_address(), Duration::from_secs(5))
            .await
            .unwrap();
        raw.send("echo\0hi\0\0/work".to_string()).await.unwrap();
        assert!(matches!(raw.receive().await, Err(ChannelError::Closed)));
        raw.close().await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        // The primary keeps serving.
        let Role::Secondary(secondary) = elect(&config).await.unwrap() else {
            panic!("expected secondary");
        };
        let reply = secondary.forward(&envelope(&["ls"])).await.unwrap();
        assert_eq!(reply.as_deref(), Some("ls in /work"));

        exit.request_exit();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn empty_argument_is_refused_before_sending() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let Role::Primary(primary) = elect(&config).await.unwrap() else {
            panic!("expected primary");
        };

        let exit = primary.exit_handle();
        let handler = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let server = tokio::spawn(primary.run(Arc::clone(&handler)));

        let Role::Secondary(secondary) = elect(&config).await.unwrap() else {
            panic!("expected secondary");
        };
        let err = secondary
            .forward(&envelope(&["echo", ""]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstanceError::Envelope(EnvelopeError::EmptyArgument { index: 1 })
        ));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        exit.request_exit();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reply_mode_none_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir).with_reply_mode(ReplyMode::None);
        let Role::Primary(primary) = elect(&config).await.unwrap() else {
            panic!("expected primary");
        };

        let exit = primary.exit_handle();
        let handler = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let server = tokio::spawn(primary.run(Arc::clone(&handler)));

        let Role::Secondary(secondary) = elect(&config).await.unwrap() else {
            panic!("expected secondary");
        };
        assert_eq!(secondary.forward(&envelope(&["true"])).await.unwrap(), None);

        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        exit.request_exit();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn forward_times_out_without_primary() {
        let dir = tempfile::tempdir().unwrap();
        let secondary = SecondaryInstance {
            address: test_config(&dir).channel_address(),
            connect_timeout: Duration::from_millis(100),
            reply_mode: ReplyMode::Await,
        };

        let err = secondary.forward(&envelope(&["ls"])).await.unwrap_err();
        assert!(matches!(
            err,
            InstanceError::Channel(ChannelError::ConnectTimeout(_))
        ));
    }

    #[tokio::test]
    async fn exit_handle_is_shared() {
        let a = ExitHandle::new();
        let b = a.clone();

        assert!(!b.is_exit_requested());
        a.request_exit();
        a.request_exit();
        assert!(b.is_exit_requested());
        tokio::time::timeout(Duration::from_secs(1), b.exit_requested())
            .await
            .unwrap();
    }
}
