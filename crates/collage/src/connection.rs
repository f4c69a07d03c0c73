//! The bidirectional, ordered byte-stream substrate.
//!
//! The object core is transport-agnostic; this module provides the bundled
//! TCP transport plus an in-process pipe used for a node's connection to
//! itself. A connection splits into a write side, shared and serialised by
//! an async send lock, and a read side owned by exactly one receive task.

use bytes::Bytes;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::buffer::{BufferCache, BufferRef};
use crate::command::{COMMAND_MIN_SIZE, MAX_FRAME_SIZE};
use crate::{Error, Result};

/// Connect retry policy: attempts and per-attempt jitter.
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_JITTER_MS: u64 = 255;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// The write side of a connection, shared by all senders to one peer.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    writer: tokio::sync::Mutex<BoxedWriter>,
    multicast: bool,
    closed: AtomicBool,
    peer: Option<SocketAddr>,
}

impl Connection {
    fn new(writer: BoxedWriter, multicast: bool, peer: Option<SocketAddr>) -> Connection {
        Connection {
            inner: Arc::new(Inner {
                writer: tokio::sync::Mutex::new(writer),
                multicast,
                closed: AtomicBool::new(false),
                peer,
            }),
        }
    }

    /// Acquire the send lock for a multi-frame emission. Frames written
    /// through one guard are contiguous on the wire.
    pub async fn lock_send(&self) -> SendGuard<'_> {
        SendGuard {
            guard: self.inner.writer.lock().await,
            connection: self,
        }
    }

    /// Write a single frame under the send lock.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.lock_send().await.send(frame).await
    }

    /// True when a write on this connection reaches many peers at once.
    pub fn is_multicast(&self) -> bool {
        self.inner.multicast
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Mark the connection closed and shut the write side down, so the
    /// peer's receive loop observes end-of-stream.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let inner = self.inner.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let mut writer = inner.writer.lock().await;
                let _ = writer.shutdown().await;
            });
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// True when both handles refer to the same underlying connection.
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection({:?})", self.inner.peer)
    }
}

/// Holder of a connection's send lock.
pub struct SendGuard<'a> {
    guard: tokio::sync::MutexGuard<'a, BoxedWriter>,
    connection: &'a Connection,
}

impl SendGuard<'_> {
    pub async fn send(&mut self, frame: Bytes) -> Result<()> {
        if self.connection.is_closed() {
            return Err(Error::Closed);
        }
        match self.guard.write_all(&frame).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.connection.close();
                Err(error.into())
            }
        }
    }
}

/// The read side of a connection, owned by its receive task together with
/// the task's buffer cache.
pub struct ConnectionReader {
    reader: BoxedReader,
    cache: BufferCache,
}

impl ConnectionReader {
    fn new(reader: BoxedReader) -> ConnectionReader {
        ConnectionReader {
            reader,
            cache: BufferCache::new(4),
        }
    }

    /// Read the next frame into a cache buffer.
    ///
    /// Frames occupy at least [`COMMAND_MIN_SIZE`] bytes on the wire, so
    /// the first read is of known length; the size field then extends the
    /// read for larger frames. Returns `None` on a clean shutdown at a
    /// frame boundary.
    pub async fn next_frame(&mut self, swap: bool) -> Result<Option<BufferRef>> {
        let mut buffer = self.cache.alloc(COMMAND_MIN_SIZE);
        let data = buffer.as_mut_vec();
        data.resize(COMMAND_MIN_SIZE, 0);

        if let Err(error) = self.reader.read_exact(&mut data[..1]).await {
            return match error.kind() {
                std::io::ErrorKind::UnexpectedEof => Ok(None),
                _ => Err(error.into()),
            };
        }
        self.reader.read_exact(&mut data[1..]).await?;

        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&data[..8]);
        let mut size = u64::from_ne_bytes(size_bytes);
        if swap {
            size = size.swap_bytes();
        }
        if size < 16 || size > MAX_FRAME_SIZE {
            return Err(Error::MalformedFrame("implausible size field"));
        }
        if size as usize > COMMAND_MIN_SIZE {
            let total = size as usize;
            data.resize(total, 0);
            self.reader.read_exact(&mut data[COMMAND_MIN_SIZE..total]).await?;
        }

        Ok(Some(Arc::new(buffer)))
    }

    /// Read one handshake frame, before the peer's byte order is known.
    ///
    /// Handshake frames always fit the minimum frame size, so the size
    /// field only needs to be plausible in one of the two byte orders.
    pub async fn next_handshake_frame(&mut self) -> Result<Option<BufferRef>> {
        let mut buffer = self.cache.alloc(COMMAND_MIN_SIZE);
        let data = buffer.as_mut_vec();
        data.resize(COMMAND_MIN_SIZE, 0);

        if let Err(error) = self.reader.read_exact(&mut data[..1]).await {
            return match error.kind() {
                std::io::ErrorKind::UnexpectedEof => Ok(None),
                _ => Err(error.into()),
            };
        }
        self.reader.read_exact(&mut data[1..]).await?;

        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&data[..8]);
        let native = u64::from_ne_bytes(size_bytes);
        let swapped = native.swap_bytes();
        let plausible = |size: u64| (16..=COMMAND_MIN_SIZE as u64).contains(&size);
        if !plausible(native) && !plausible(swapped) {
            return Err(Error::MalformedFrame("implausible handshake size"));
        }
        Ok(Some(Arc::new(buffer)))
    }

    /// Recycle buffers between event batches.
    pub fn compact(&mut self) {
        self.cache.compact();
    }
}

/// Wrap an established TCP stream into its two connection halves.
pub fn wrap_tcp(stream: TcpStream) -> (Connection, ConnectionReader) {
    let peer = stream.peer_addr().ok();
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    (
        Connection::new(Box::new(write), false, peer),
        ConnectionReader::new(Box::new(read)),
    )
}

/// An in-process pipe: two connected (connection, reader) pairs. Used for a
/// node's connection to itself, so local traffic takes the normal dispatch
/// path.
pub fn pipe() -> ((Connection, ConnectionReader), (Connection, ConnectionReader)) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        (
            Connection::new(Box::new(a_write), false, None),
            ConnectionReader::new(Box::new(a_read)),
        ),
        (
            Connection::new(Box::new(b_write), false, None),
            ConnectionReader::new(Box::new(b_read)),
        ),
    )
}

/// Dial `addr` with the retry policy: a bounded number of attempts with
/// random jitter between them, so simultaneous cluster bring-up does not
/// thundering-herd a listener.
pub async fn connect_tcp(addr: SocketAddr) -> Result<(Connection, ConnectionReader)> {
    let mut last_error = None;

    for attempt in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(wrap_tcp(stream)),
            Err(error) => {
                tracing::debug!(%addr, attempt, %error, "connect attempt failed");
                last_error = Some(error);
            }
        }
        let jitter = rand::thread_rng().gen_range(0..=CONNECT_JITTER_MS);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }
    Err(last_error.map(Error::Io).unwrap_or(Error::Closed))
}
