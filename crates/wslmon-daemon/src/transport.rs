//! Byte-stream transport seams for the bridge.
//!
//! The IPC channel only assumes a bidirectional byte stream; these traits
//! are the boundary behind which the concrete endpoints live. Each side
//! pairs one local stream-socket listener with one pipe-style outbound
//! path, but the bridge itself only sees [`Acceptor`] and [`Connector`].

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

/// Granularity of the non-blocking accept poll.
const ACCEPT_POLL_SLICE: Duration = Duration::from_millis(25);

/// A connected bidirectional byte stream.
///
/// The channel layer loops `read_exact`/`write_all`, so implementations
/// only need ordinary blocking semantics.
pub trait ByteStream: Read + Write + Send {
    /// Returns a handle that can shut this stream down from another
    /// thread, unblocking any read in progress. Streams without shutdown
    /// semantics (plain files) return `None`; their readers must not
    /// block indefinitely.
    fn shutdown_handle(&self) -> Option<Box<dyn StreamShutdown>>;
}

/// Cross-thread shutdown handle for a [`ByteStream`].
pub trait StreamShutdown: Send {
    /// Shuts the stream down in both directions; errors are ignored.
    fn shutdown(&self);
}

/// Server-role endpoint: accepts one peer connection at a time.
pub trait Acceptor: Send + Sync {
    /// Waits up to `timeout` for a peer.
    ///
    /// Returns `Ok(None)` when the timeout elapsed without a connection,
    /// so callers can re-check their stop signal between slices.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when accepting fails outright.
    fn accept(&self, timeout: Duration) -> io::Result<Option<Box<dyn ByteStream>>>;
}

/// Client-role endpoint: connects upward to the peer's listener.
pub trait Connector: Send + Sync {
    /// Opens a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the endpoint is unavailable.
    fn connect(&self) -> io::Result<Box<dyn ByteStream>>;
}

impl ByteStream for UnixStream {
    fn shutdown_handle(&self) -> Option<Box<dyn StreamShutdown>> {
        self.try_clone()
            .ok()
            .map(|clone| Box::new(UnixShutdown(clone)) as Box<dyn StreamShutdown>)
    }
}

struct UnixShutdown(UnixStream);

impl StreamShutdown for UnixShutdown {
    fn shutdown(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

/// Listening Unix stream socket.
///
/// The socket file is unlinked before binding (stale sockets survive
/// crashes) and again on drop; its mode is narrowed to 0660.
pub struct UnixAcceptor {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixAcceptor {
    /// Binds the listener, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when the socket cannot be bound.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        if path.exists() {
            debug!(path = %path.display(), "removing stale bridge socket");
            let _ = fs::remove_file(&path);
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o660))?;
        }
        Ok(Self { listener, path })
    }

    /// Path of the bound socket.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Acceptor for UnixAcceptor {
    fn accept(&self, timeout: Duration) -> io::Result<Option<Box<dyn ByteStream>>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(Some(Box::new(stream)));
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(ACCEPT_POLL_SLICE);
                },
                Err(err) => return Err(err),
            }
        }
    }
}

/// Connects to a Unix stream socket.
pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    /// Creates a connector for the given socket path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for UnixConnector {
    fn connect(&self) -> io::Result<Box<dyn ByteStream>> {
        let stream = UnixStream::connect(&self.path)?;
        Ok(Box::new(stream))
    }
}

/// Opens a filesystem path read/write and treats it as a byte stream.
///
/// This is the pipe-style outbound endpoint: the virtualisation layer
/// projects the peer's named pipe as an openable path.
pub struct PipeConnector {
    path: PathBuf,
}

impl PipeConnector {
    /// Creates a connector for the given pipe path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for PipeConnector {
    fn connect(&self) -> io::Result<Box<dyn ByteStream>> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(Box::new(FileStream(file)))
    }
}

struct FileStream(fs::File);

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl ByteStream for FileStream {
    fn shutdown_handle(&self) -> Option<Box<dyn StreamShutdown>> {
        None
    }
}
