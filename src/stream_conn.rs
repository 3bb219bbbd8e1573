//! Connection object over a callback-driven bidirectional stream.
//!
//! The engine reports progress through [`StreamCallback`] on its own
//! thread. `StreamConn` turns that into async `read`/`write` calls:
//!
//! - `ready`, `handshake` and `done` are one-shot signals raised by the
//!   stream-ready, response-headers and terminal callbacks.
//! - Each read or write hands a oneshot sender to the callback side and
//!   waits on it, racing the `done` and `closed` signals.
//! - The terminal transition records the error once, raises `done` and
//!   destroys the native stream. Callbacks arriving after it are ignored.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::engine::{BidirectionalStream, Engine, HeaderMap, StreamCallback};
use crate::error::{Error, Result};
use crate::net_error::NetError;
use crate::signal::Signal;

/// Largest buffer handed to a single native read.
pub const MAX_READ_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Eof,
    Canceled,
    Failed(NetError),
}

impl Terminal {
    fn to_error(self) -> Error {
        match self {
            Terminal::Eof => Error::Eof,
            Terminal::Canceled => Error::Canceled,
            Terminal::Failed(code) => Error::Network(code),
        }
    }
}

#[derive(Default)]
struct State {
    stream: Option<Box<dyn BidirectionalStream>>,
    started: bool,
    terminal: Option<Terminal>,
    headers: Option<HeaderMap>,
    negotiated_protocol: String,
    trailers: Option<HeaderMap>,
    read_tx: Option<oneshot::Sender<(BytesMut, usize)>>,
    write_tx: Option<oneshot::Sender<()>>,
}

/// State shared with the engine through the callback table.
#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    closed: Signal,
    done: Signal,
    ready: Signal,
    handshake: Signal,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves to the terminal state once and destroys the native stream.
    fn close_with(&self, terminal: Terminal) {
        let stream = {
            let mut state = self.lock();
            if self.done.is_set() {
                return;
            }
            state.terminal = Some(terminal);
            state.read_tx = None;
            state.write_tx = None;
            let stream = state.stream.take();
            self.done.set();
            stream
        };
        tracing::trace!(?terminal, "stream terminal");
        if let Some(stream) = stream {
            stream.destroy();
        }
    }

    fn terminal_error(&self) -> Error {
        match self.lock().terminal {
            Some(terminal) => terminal.to_error(),
            None => Error::Closed,
        }
    }

    /// Error for a wait that lost the race to `closed` or `done`.
    fn interrupted(&self) -> Error {
        if self.done.is_set() {
            self.terminal_error()
        } else {
            Error::Closed
        }
    }
}

impl StreamCallback for Shared {
    fn on_stream_ready(&self) {
        if !self.done.is_set() {
            self.ready.set();
        }
    }

    fn on_response_headers_received(&self, headers: HeaderMap, negotiated_protocol: &str) {
        {
            let mut state = self.lock();
            if self.done.is_set() || self.handshake.is_set() {
                return;
            }
            state.headers = Some(headers);
            state.negotiated_protocol = negotiated_protocol.to_string();
        }
        self.ready.set();
        self.handshake.set();
    }

    fn on_read_completed(&self, buffer: BytesMut, bytes_read: usize) {
        if bytes_read == 0 {
            self.close_with(Terminal::Eof);
            return;
        }
        let mut state = self.lock();
        if self.done.is_set() {
            return;
        }
        if let Some(tx) = state.read_tx.take() {
            let _ = tx.send((buffer, bytes_read));
        }
    }

    fn on_write_completed(&self) {
        let mut state = self.lock();
        if self.done.is_set() {
            return;
        }
        if let Some(tx) = state.write_tx.take() {
            let _ = tx.send(());
        }
    }

    fn on_response_trailers_received(&self, trailers: HeaderMap) {
        let mut state = self.lock();
        if !self.done.is_set() {
            state.trailers = Some(trailers);
        }
    }

    fn on_succeeded(&self) {
        self.close_with(Terminal::Eof);
    }

    fn on_failed(&self, error: NetError) {
        self.close_with(Terminal::Failed(error));
    }

    fn on_canceled(&self) {
        self.close_with(Terminal::Canceled);
    }
}

#[derive(Default)]
struct ReadSlot {
    /// Outstanding native read, kept across canceled `read` futures.
    pending: Option<oneshot::Receiver<(BytesMut, usize)>>,
    /// Buffer returned by the last completion, reused for the next read.
    buffer: Option<BytesMut>,
    /// Bytes completed for a caller whose buffer was smaller.
    leftover: BytesMut,
}

#[derive(Default)]
struct WriteSlot {
    pending: Option<oneshot::Receiver<()>>,
}

/// Readable, writable, cancelable connection over one native stream.
///
/// Reads and writes are each single-flight: a second `read` waits until the
/// first one's native completion has been delivered.
pub struct StreamConn {
    shared: Arc<Shared>,
    read_wait_headers: bool,
    write_wait_headers: bool,
    reader: tokio::sync::Mutex<ReadSlot>,
    writer: tokio::sync::Mutex<WriteSlot>,
}

impl StreamConn {
    /// Creates a stream on `engine`.
    ///
    /// With `read_wait_headers` (`write_wait_headers`), reads (writes) wait
    /// for the response headers instead of just stream readiness.
    pub fn new(engine: &dyn Engine, read_wait_headers: bool, write_wait_headers: bool) -> Self {
        let shared = Arc::new(Shared::default());
        let stream = engine.create_stream(shared.clone());
        shared.lock().stream = Some(stream);
        Self {
            shared,
            read_wait_headers,
            write_wait_headers,
            reader: tokio::sync::Mutex::new(ReadSlot::default()),
            writer: tokio::sync::Mutex::new(WriteSlot::default()),
        }
    }

    /// Issues the request that opens the stream.
    pub fn start(
        &self,
        method: &str,
        url: &str,
        headers: &HeaderMap,
        priority: i32,
        end_of_stream: bool,
    ) -> Result<()> {
        let mut state = self.shared.lock();
        if self.shared.closed.is_set() || self.shared.done.is_set() {
            return Err(Error::Closed);
        }
        let stream = state.stream.as_ref().ok_or(Error::Closed)?;
        if !stream.start(method, url, headers, priority, end_of_stream) {
            return Err(Error::Invalid(format!("{} {} rejected by engine", method, url)));
        }
        state.started = true;
        Ok(())
    }

    /// Reads into `buf`. Returns `Ok(0)` at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.read_inner(buf).await {
            Err(Error::Eof) => Ok(0),
            other => other,
        }
    }

    async fn read_inner(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut slot = self.reader.lock().await;

        if !slot.leftover.is_empty() {
            let n = buf.len().min(slot.leftover.len());
            buf[..n].copy_from_slice(&slot.leftover.split_to(n));
            return Ok(n);
        }

        // a completion owed to a canceled read outlives the terminal state
        if let Some(rx) = slot.pending.as_mut() {
            match rx.try_recv() {
                Ok((buffer, bytes_read)) => {
                    slot.pending = None;
                    return Ok(deliver(&mut slot, buf, buffer, bytes_read));
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => slot.pending = None,
            }
        }

        self.check_open(true)?;
        self.wait_gate(self.read_wait_headers).await?;

        if slot.pending.is_none() {
            let mut buffer = slot.buffer.take().unwrap_or_default();
            buffer.clear();
            buffer.resize(buf.len().min(MAX_READ_SIZE), 0);

            let (tx, rx) = oneshot::channel();
            {
                let mut state = self.shared.lock();
                self.check_open(true)?;
                let accepted = match state.stream.as_ref() {
                    Some(stream) => stream.read(buffer),
                    None => return Err(Error::Closed),
                };
                if !accepted {
                    return Err(Error::Invalid("read rejected by engine".to_string()));
                }
                state.read_tx = Some(tx);
            }
            slot.pending = Some(rx);
        }

        let completed = match slot.pending.as_mut() {
            Some(rx) => {
                tokio::select! {
                    biased;
                    result = rx => result.ok(),
                    _ = self.shared.done.wait() => None,
                    _ = self.shared.closed.wait() => None,
                }
            }
            None => None,
        };

        let Some((buffer, bytes_read)) = completed else {
            return Err(self.shared.interrupted());
        };
        slot.pending = None;
        Ok(deliver(&mut slot, buf, buffer, bytes_read))
    }

    /// Writes all of `data`.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.write_bytes(Bytes::copy_from_slice(data)).await
    }

    /// Writes an owned buffer without copying it.
    pub async fn write_bytes(&self, data: Bytes) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut slot = self.writer.lock().await;

        self.check_open(false)?;
        self.wait_gate(self.write_wait_headers).await?;

        // a write whose caller gave up is still owed a completion
        if let Some(rx) = slot.pending.as_mut() {
            let completed = tokio::select! {
                biased;
                result = rx => result.is_ok(),
                _ = self.shared.done.wait() => false,
                _ = self.shared.closed.wait() => false,
            };
            if !completed {
                return Err(self.shared.interrupted());
            }
            slot.pending = None;
        }

        let len = data.len();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            self.check_open(false)?;
            let accepted = match state.stream.as_ref() {
                Some(stream) => stream.write(data, false),
                None => return Err(Error::Closed),
            };
            if !accepted {
                return Err(Error::Invalid("write rejected by engine".to_string()));
            }
            state.write_tx = Some(tx);
        }
        slot.pending = Some(rx);

        let completed = match slot.pending.as_mut() {
            Some(rx) => {
                tokio::select! {
                    biased;
                    result = rx => result.is_ok(),
                    _ = self.shared.done.wait() => false,
                    _ = self.shared.closed.wait() => false,
                }
            }
            None => false,
        };
        if !completed {
            return Err(self.shared.interrupted());
        }
        slot.pending = None;
        Ok(len)
    }

    /// Closes the connection and cancels the native stream.
    ///
    /// The first call succeeds; later calls, and calls after the stream
    /// already ended, return [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let (started, first) = {
            let state = self.shared.lock();
            let first = self.shared.closed.set();
            if !first || self.shared.done.is_set() {
                return Err(Error::Closed);
            }
            if state.started {
                if let Some(stream) = state.stream.as_ref() {
                    stream.cancel();
                }
            }
            (state.started, first)
        };
        // never started streams get no cancel callback
        if first && !started {
            self.shared.close_with(Terminal::Canceled);
        }
        Ok(())
    }

    /// Waits for the response headers.
    pub async fn wait_for_headers(&self) -> Result<HeaderMap> {
        self.wait_for_headers_with(&CancellationToken::new()).await
    }

    /// Waits for the response headers, giving up when `cancel` fires.
    pub async fn wait_for_headers_with(&self, cancel: &CancellationToken) -> Result<HeaderMap> {
        tokio::select! {
            biased;
            _ = self.shared.handshake.wait() => {}
            _ = self.shared.done.wait() => {}
            _ = self.shared.closed.wait() => return Err(Error::Closed),
            _ = cancel.cancelled() => return Err(Error::Canceled),
        }
        let state = self.shared.lock();
        match (&state.headers, state.terminal) {
            (Some(headers), _) => Ok(headers.clone()),
            (None, Some(Terminal::Eof)) => Err(Error::Handshake(
                "stream ended before response headers".to_string(),
            )),
            (None, Some(terminal)) => Err(terminal.to_error()),
            (None, None) => Err(Error::Closed),
        }
    }

    pub fn headers(&self) -> Option<HeaderMap> {
        self.shared.lock().headers.clone()
    }

    pub fn trailers(&self) -> Option<HeaderMap> {
        self.shared.lock().trailers.clone()
    }

    pub fn negotiated_protocol(&self) -> String {
        self.shared.lock().negotiated_protocol.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_set()
    }

    /// True once the native stream reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.shared.done.is_set()
    }

    /// Resolves when the native stream reached a terminal state.
    pub async fn done(&self) {
        self.shared.done.wait().await
    }

    /// Fails with `Closed` if the connection can no longer carry data.
    /// Readers see end of stream as `Eof` instead.
    fn check_open(&self, reading: bool) -> Result<()> {
        if self.shared.closed.is_set() {
            return Err(Error::Closed);
        }
        if self.shared.done.is_set() {
            let eof = self.shared.lock().terminal == Some(Terminal::Eof);
            return Err(if reading && eof { Error::Eof } else { Error::Closed });
        }
        Ok(())
    }

    async fn wait_gate(&self, wait_headers: bool) -> Result<()> {
        let gate = if wait_headers {
            &self.shared.handshake
        } else {
            &self.shared.ready
        };
        if gate.is_set() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = gate.wait() => Ok(()),
            _ = self.shared.done.wait() => Err(self.shared.interrupted()),
            _ = self.shared.closed.wait() => Err(Error::Closed),
        }
    }
}

/// Copies a native completion into `buf`, keeping what does not fit.
fn deliver(slot: &mut ReadSlot, buf: &mut [u8], buffer: BytesMut, bytes_read: usize) -> usize {
    let bytes_read = bytes_read.min(buffer.len());
    let n = bytes_read.min(buf.len());
    buf[..n].copy_from_slice(&buffer[..n]);
    if bytes_read > n {
        slot.leftover.extend_from_slice(&buffer[n..bytes_read]);
    }
    slot.buffer = Some(buffer);
    n
}

impl Drop for StreamConn {
    fn drop(&mut self) {
        if !self.shared.done.is_set() {
            let _ = self.close();
        }
    }
}
