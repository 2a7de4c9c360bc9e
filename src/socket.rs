//! Buffered, single-owner async TCP socket (C1).
//!
//! A dedicated receive task owns the read half of the connection and feeds
//! bytes into a shared buffer; callers issue typed reads/writes/scans against
//! that buffer through an actor-style lock so no caller ever touches the
//! buffer directly.

use std::io;
use std::pin::Pin;

use async_stream::try_stream;
use futures_core::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{HotlineError, Result};

/// Byte-order used by a typed read/write. Hotline's wire formats are
/// big-endian throughout; `Little` exists for completeness and local testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Default for Endian {
    fn default() -> Self {
        Endian::Big
    }
}

/// Tuning knobs for a [`Socket`]. Defaults match the transfer core
/// spec: 64 KiB receive chunks, an 8 MiB hard cap on unread buffered bytes.
#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    pub receive_chunk: usize,
    pub max_buffer_bytes: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            receive_chunk: 64 * 1024,
            max_buffer_bytes: 8 * 1024 * 1024,
        }
    }
}

/// One chunk of progress from [`Socket::receive_file`] or
/// [`Socket::write_file`]: raw byte counts with no rate estimate attached.
/// The transfer clients (C4-C7) feed these into a [`crate::rate::RateEstimator`]
/// to build the richer [`crate::progress::Progress`] surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub sent: u64,
    pub total: u64,
}

const COMPACT_THRESHOLD: usize = 64 * 1024;

struct RecvState {
    buffer: Vec<u8>,
    head: usize,
    /// Set once the peer has sent EOF; further reads beyond buffered data fail.
    read_eof: bool,
    /// Set once `close()`/`force_close()` ran, or the buffer cap was blown.
    closed: bool,
    /// The error that caused `closed`, if any (other than a plain EOF close).
    error: Option<(io::ErrorKind, String)>,
}

impl RecvState {
    fn unread(&self) -> &[u8] {
        &self.buffer[self.head..]
    }

    fn consume(&mut self, n: usize) {
        self.head += n;
        if self.head > COMPACT_THRESHOLD && self.head > self.buffer.len() / 2 {
            self.buffer.drain(0..self.head);
            self.head = 0;
        }
    }
}

struct Inner {
    write_half: Mutex<Option<OwnedWriteHalf>>,
    state: Mutex<RecvState>,
    notify: Notify,
    cancel: CancellationToken,
    config: SocketConfig,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

/// A single-owner, buffered async TCP connection. See the module docs for
/// the full contract.
#[derive(Clone)]
pub struct Socket {
    inner: std::sync::Arc<Inner>,
}

impl Socket {
    /// Connects to `host:port` and starts the background receive loop.
    pub async fn connect(host: &str, port: u16, config: SocketConfig) -> Result<Self> {
        if port == 0 {
            return Err(HotlineError::InvalidPort(port));
        }
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self::from_stream(stream, config))
    }

    /// Wraps an already-connected stream (used directly by tests with a
    /// loopback listener, and available to callers that manage their own
    /// connection establishment).
    pub fn from_stream(stream: TcpStream, config: SocketConfig) -> Self {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let inner = std::sync::Arc::new(Inner {
            write_half: Mutex::new(Some(write_half)),
            state: Mutex::new(RecvState {
                buffer: Vec::new(),
                head: 0,
                read_eof: false,
                closed: false,
                error: None,
            }),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            config,
            recv_task: Mutex::new(None),
        });

        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            Self::receive_loop(task_inner, read_half).await;
        });

        // `try_lock` is safe here: nothing else can hold this lock yet.
        if let Ok(mut guard) = inner.recv_task.try_lock() {
            *guard = Some(task);
        }

        Socket { inner }
    }

    async fn receive_loop(inner: std::sync::Arc<Inner>, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let mut chunk = vec![0u8; inner.config.receive_chunk];
        loop {
            let read = tokio::select! {
                _ = inner.cancel.cancelled() => break,
                r = read_half.read(&mut chunk) => r,
            };
            match read {
                Ok(0) => {
                    tracing::debug!(target: "socket", "peer sent eof");
                    let mut state = inner.state.lock().await;
                    state.read_eof = true;
                    drop(state);
                    inner.notify.notify_waiters();
                    break;
                }
                Ok(n) => {
                    let mut state = inner.state.lock().await;
                    state.buffer.extend_from_slice(&chunk[..n]);
                    if state.unread().len() > inner.config.max_buffer_bytes {
                        tracing::warn!(target: "socket", max = inner.config.max_buffer_bytes, "buffer cap exceeded, closing");
                        state.closed = true;
                        state.error = Some((io::ErrorKind::Other, "framing exceeded".to_string()));
                        drop(state);
                        inner.notify.notify_waiters();
                        break;
                    }
                    drop(state);
                    inner.notify.notify_waiters();
                }
                Err(e) => {
                    tracing::warn!(target: "socket", error = %e, "receive loop io error");
                    let mut state = inner.state.lock().await;
                    state.closed = true;
                    state.error = Some((e.kind(), e.to_string()));
                    drop(state);
                    inner.notify.notify_waiters();
                    break;
                }
            }
        }
    }

    fn state_error(state: &RecvState, max_buffer_bytes: usize) -> Option<HotlineError> {
        if let Some((kind, msg)) = &state.error {
            if msg == "framing exceeded" {
                return Some(HotlineError::FramingExceeded { max: max_buffer_bytes });
            }
            return Some(HotlineError::Io(io::Error::new(*kind, msg.clone())));
        }
        if state.closed {
            return Some(HotlineError::Closed);
        }
        None
    }

    /// Waits until `check` returns `Some`, re-checking whenever new data
    /// arrives or the socket state changes. `check` is consulted before the
    /// cancellation token on every iteration, so a `close()`/`force_close()`
    /// (which sets `RecvState::closed` before cancelling) is always reported
    /// as `Closed` rather than `Cancelled`.
    async fn wait_until<T>(
        &self,
        mut check: impl FnMut(&mut RecvState) -> Option<Result<T>>,
    ) -> Result<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().await;
                if let Some(result) = check(&mut state) {
                    return result;
                }
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(HotlineError::Cancelled),
                _ = notified => {}
            }
        }
    }

    /// Reads exactly `n` bytes, consuming them from the buffer.
    pub async fn read(&self, n: usize) -> Result<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let max_buffer_bytes = self.inner.config.max_buffer_bytes;
        self.wait_until(move |state| {
            if state.unread().len() >= n {
                let out = state.unread()[..n].to_vec();
                state.consume(n);
                return Some(Ok(out));
            }
            if let Some(err) = Socket::state_error(state, max_buffer_bytes) {
                return Some(Err(err));
            }
            if state.read_eof {
                return Some(Err(HotlineError::InsufficientData {
                    expected: n,
                    got: state.unread().len(),
                }));
            }
            None
        })
        .await
    }

    pub async fn read_u8(&self) -> Result<u8> {
        Ok(self.read(1).await?[0])
    }

    pub async fn read_bool(&self) -> Result<bool> {
        Ok(self.read_u8().await? != 0)
    }

    pub async fn read_u16(&self, endian: Endian) -> Result<u16> {
        let b = self.read(2).await?;
        Ok(match endian {
            Endian::Big => u16::from_be_bytes([b[0], b[1]]),
            Endian::Little => u16::from_le_bytes([b[0], b[1]]),
        })
    }

    pub async fn read_u32(&self, endian: Endian) -> Result<u32> {
        let b = self.read(4).await?;
        let arr = [b[0], b[1], b[2], b[3]];
        Ok(match endian {
            Endian::Big => u32::from_be_bytes(arr),
            Endian::Little => u32::from_le_bytes(arr),
        })
    }

    pub async fn read_u64(&self, endian: Endian) -> Result<u64> {
        let b = self.read(8).await?;
        let arr: [u8; 8] = b.try_into().expect("read(8) returns 8 bytes");
        Ok(match endian {
            Endian::Big => u64::from_be_bytes(arr),
            Endian::Little => u64::from_le_bytes(arr),
        })
    }

    pub async fn read_f32(&self, endian: Endian) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32(endian).await?))
    }

    pub async fn read_f64(&self, endian: Endian) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64(endian).await?))
    }

    /// Reads `n` bytes and interprets them as a string in `encoding`,
    /// falling back to lossy replacement on malformed input rather than
    /// failing the read.
    pub async fn read_string(&self, n: usize, encoding: &'static encoding_rs::Encoding) -> Result<String> {
        let bytes = self.read(n).await?;
        let (decoded, _, _) = encoding.decode(&bytes);
        Ok(decoded.into_owned())
    }

    /// Scans the unread buffer for `delimiter`, consuming through it (or
    /// stopping just before it, per `include_delimiter`). Returns
    /// `FramingExceeded` if `max_bytes` is supplied and exceeded before the
    /// delimiter appears.
    pub async fn read_until(
        &self,
        delimiter: &[u8],
        max_bytes: Option<usize>,
        include_delimiter: bool,
    ) -> Result<Vec<u8>> {
        if delimiter.is_empty() {
            return Err(HotlineError::DecodeFailed("empty delimiter".to_string()));
        }
        let delim = delimiter.to_vec();
        let single_byte = delim.len() == 1;
        let max_buffer_bytes = self.inner.config.max_buffer_bytes;
        self.wait_until(move |state| {
            let unread = state.unread();
            let found = if single_byte {
                unread.iter().position(|b| *b == delim[0])
            } else {
                unread
                    .windows(delim.len())
                    .position(|window| window == delim.as_slice())
            };

            if let Some(pos) = found {
                let end = pos + delim.len();
                let out = if include_delimiter {
                    unread[..end].to_vec()
                } else {
                    unread[..pos].to_vec()
                };
                state.consume(end);
                return Some(Ok(out));
            }

            if let Some(max) = max_bytes {
                if unread.len() >= max {
                    return Some(Err(HotlineError::FramingExceeded { max }));
                }
            }
            if let Some(err) = Socket::state_error(state, max_buffer_bytes) {
                return Some(Err(err));
            }
            if state.read_eof {
                return Some(Err(HotlineError::InsufficientData {
                    expected: end_unknown(),
                    got: unread.len(),
                }));
            }
            None
        })
        .await
    }

    /// Non-blocking peek: returns whatever is currently buffered, up to `n`
    /// bytes, without consuming it. May return fewer than `n` bytes.
    pub async fn peek(&self, n: usize) -> Vec<u8> {
        let state = self.inner.state.lock().await;
        let unread = state.unread();
        unread[..unread.len().min(n)].to_vec()
    }

    /// Blocking peek: waits until `n` bytes are buffered, then returns them
    /// without consuming.
    pub async fn peek_awaiting(&self, n: usize) -> Result<Vec<u8>> {
        let max_buffer_bytes = self.inner.config.max_buffer_bytes;
        self.wait_until(move |state| {
            if state.unread().len() >= n {
                return Some(Ok(state.unread()[..n].to_vec()));
            }
            if let Some(err) = Socket::state_error(state, max_buffer_bytes) {
                return Some(Err(err));
            }
            if state.read_eof {
                return Some(Err(HotlineError::InsufficientData {
                    expected: n,
                    got: state.unread().len(),
                }));
            }
            None
        })
        .await
    }

    /// Discards `n` bytes from the buffer without returning them.
    pub async fn skip(&self, n: usize) -> Result<()> {
        self.read(n).await.map(|_| ())
    }

    /// Discards bytes up to and including the next occurrence of `delimiter`.
    pub async fn skip_until(&self, delimiter: &[u8]) -> Result<()> {
        self.read_until(delimiter, None, true).await.map(|_| ())
    }

    pub async fn write(&self, bytes: &[u8]) -> Result<usize> {
        if self.inner.cancel.is_cancelled() {
            return Err(HotlineError::Cancelled);
        }
        let mut guard = self.inner.write_half.lock().await;
        let write_half = guard.as_mut().ok_or(HotlineError::NotReady)?;
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(HotlineError::Cancelled),
            result = async {
                write_half.write_all(bytes).await?;
                write_half.flush().await
            } => {
                result?;
                Ok(bytes.len())
            }
        }
    }

    pub async fn write_u8(&self, v: u8) -> Result<()> {
        self.write(&[v]).await.map(|_| ())
    }

    pub async fn write_bool(&self, v: bool) -> Result<()> {
        self.write_u8(if v { 1 } else { 0 }).await
    }

    pub async fn write_u16(&self, v: u16, endian: Endian) -> Result<()> {
        let bytes = match endian {
            Endian::Big => v.to_be_bytes(),
            Endian::Little => v.to_le_bytes(),
        };
        self.write(&bytes).await.map(|_| ())
    }

    pub async fn write_u32(&self, v: u32, endian: Endian) -> Result<()> {
        let bytes = match endian {
            Endian::Big => v.to_be_bytes(),
            Endian::Little => v.to_le_bytes(),
        };
        self.write(&bytes).await.map(|_| ())
    }

    pub async fn write_u64(&self, v: u64, endian: Endian) -> Result<()> {
        let bytes = match endian {
            Endian::Big => v.to_be_bytes(),
            Endian::Little => v.to_le_bytes(),
        };
        self.write(&bytes).await.map(|_| ())
    }

    pub async fn write_f32(&self, v: f32, endian: Endian) -> Result<()> {
        self.write_u32(v.to_bits(), endian).await
    }

    pub async fn write_f64(&self, v: f64, endian: Endian) -> Result<()> {
        self.write_u64(v.to_bits(), endian).await
    }

    /// Writes `value` as UTF-8 bytes; `encoding` is accepted for symmetry
    /// with `read_string` but Hotline clients always send UTF-8 on encode.
    pub async fn write_string(&self, value: &str, _encoding: &'static encoding_rs::Encoding) -> Result<()> {
        self.write(value.as_bytes()).await.map(|_| ())
    }

    /// Streams exactly `length` bytes from the socket into `dest`, yielding
    /// one [`ChunkProgress`] per chunk of at most `chunk_size` bytes.
    /// Dropping the returned stream before it finishes stops the transfer;
    /// polling it after cancellation yields `Err(Cancelled)`.
    pub fn receive_file<'a, W>(
        &'a self,
        mut dest: W,
        length: u64,
        chunk_size: usize,
    ) -> Pin<Box<dyn Stream<Item = Result<ChunkProgress>> + Send + 'a>>
    where
        W: AsyncWrite + Unpin + Send + 'a,
    {
        Box::pin(try_stream! {
            let mut sent: u64 = 0;
            if length == 0 {
                yield ChunkProgress { sent: 0, total: 0 };
                return;
            }
            while sent < length {
                let remaining = length - sent;
                let to_read = remaining.min(chunk_size as u64) as usize;
                let bytes = self.read(to_read).await?;
                dest.write_all(&bytes).await.map_err(HotlineError::Io)?;
                sent += bytes.len() as u64;
                yield ChunkProgress { sent, total: length };
            }
            dest.flush().await.map_err(HotlineError::Io)?;
        })
    }

    /// Streams exactly `length` bytes from `src` into the socket, yielding
    /// one [`ChunkProgress`] per chunk of at most `chunk_size` bytes.
    pub fn write_file<'a, R>(
        &'a self,
        mut src: R,
        length: u64,
        chunk_size: usize,
    ) -> Pin<Box<dyn Stream<Item = Result<ChunkProgress>> + Send + 'a>>
    where
        R: AsyncRead + Unpin + Send + 'a,
    {
        Box::pin(try_stream! {
            let mut sent: u64 = 0;
            if length == 0 {
                yield ChunkProgress { sent: 0, total: 0 };
                return;
            }
            let mut buf = vec![0u8; chunk_size];
            while sent < length {
                let remaining = length - sent;
                let to_read = remaining.min(chunk_size as u64) as usize;
                src.read_exact(&mut buf[..to_read]).await.map_err(HotlineError::Io)?;
                self.write(&buf[..to_read]).await?;
                sent += to_read as u64;
                yield ChunkProgress { sent, total: length };
            }
        })
    }

    /// Idempotent graceful shutdown: flushes and shuts down the write half,
    /// then wakes every pending waiter with `Closed`.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
        }
        if let Some(mut write_half) = self.inner.write_half.lock().await.take() {
            let _ = write_half.shutdown().await;
        }
        if let Some(task) = self.inner.recv_task.lock().await.take() {
            task.abort();
        }
        self.inner.cancel.cancel();
        self.inner.notify.notify_waiters();
    }

    /// Idempotent hard shutdown: drops the write half without flushing
    /// (reset semantics) and wakes every pending waiter.
    pub async fn force_close(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.write_half.lock().await.take();
        if let Some(task) = self.inner.recv_task.lock().await.take() {
            task.abort();
        }
        self.inner.cancel.cancel();
        self.inner.notify.notify_waiters();
    }
}

/// `InsufficientData::expected` has no fixed value for a delimiter search;
/// `usize::MAX` signals "unbounded" to readers inspecting the error.
fn end_unknown() -> usize {
    usize::MAX
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, _) = listener.accept().await.unwrap();
        let client_stream = client.await.unwrap();
        (Socket::from_stream(server_stream, SocketConfig::default()), client_stream)
    }

    #[tokio::test]
    async fn read_zero_does_not_suspend() {
        let (socket, _peer) = loopback_pair().await;
        let out = socket.read(0).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn read_exact_round_trip() {
        let (socket, mut peer) = loopback_pair().await;
        peer.write_all(b"hello").await.unwrap();
        let got = socket.read(5).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn read_insufficient_data_on_eof() {
        let (socket, mut peer) = loopback_pair().await;
        peer.write_all(b"ab").await.unwrap();
        peer.shutdown().await.unwrap();
        let err = socket.read(5).await.unwrap_err();
        match err {
            HotlineError::InsufficientData { expected: 5, got: 2 } => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_until_delimiter_leaves_cursor_after_it() {
        let (socket, mut peer) = loopback_pair().await;
        peer.write_all(b"abc\r\ndef").await.unwrap();
        let line = socket.read_until(b"\r\n", None, false).await.unwrap();
        assert_eq!(line, b"abc");
        let rest = socket.read(3).await.unwrap();
        assert_eq!(rest, b"def");
    }

    #[tokio::test]
    async fn buffer_cap_closes_with_framing_exceeded() {
        let config = SocketConfig { receive_chunk: 16, max_buffer_bytes: 8 };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(&[0u8; 64]).await.unwrap();
            s
        });
        let (server_stream, _) = listener.accept().await.unwrap();
        let socket = Socket::from_stream(server_stream, config);
        let _peer = client.await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let err = socket.read(64).await.unwrap_err();
        assert!(matches!(err, HotlineError::FramingExceeded { max: 8 }));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (socket, _peer) = loopback_pair().await;
        socket.close().await;
        socket.close().await;
        let err = socket.read(1).await.unwrap_err();
        assert!(matches!(err, HotlineError::Closed));
    }
}
