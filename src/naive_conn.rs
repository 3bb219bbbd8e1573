//! Tunneled connection: a [`StreamConn`] carrying padded CONNECT traffic.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::HeaderMap;
use crate::error::{Error, Result};
use crate::padding::PaddingCodec;
use crate::stream_conn::{StreamConn, MAX_READ_SIZE};

type CloseHook = Box<dyn FnOnce() + Send>;

struct ReadState {
    input: BytesMut,
    scratch: Box<[u8]>,
}

/// Connection to a destination through the proxy.
///
/// The first frames in each direction carry random padding. Stream-level
/// failures surface as [`Error::BadStream`].
pub struct NaiveConn {
    conn: Arc<StreamConn>,
    codec: Mutex<PaddingCodec>,
    reader: tokio::sync::Mutex<ReadState>,
    writer: tokio::sync::Mutex<()>,
    on_close: Mutex<Option<CloseHook>>,
}

impl NaiveConn {
    pub fn new(conn: StreamConn) -> Self {
        Self::from_shared(Arc::new(conn))
    }

    pub(crate) fn from_shared(conn: Arc<StreamConn>) -> Self {
        Self {
            conn,
            codec: Mutex::new(PaddingCodec::new()),
            reader: tokio::sync::Mutex::new(ReadState {
                input: BytesMut::new(),
                scratch: vec![0u8; MAX_READ_SIZE].into_boxed_slice(),
            }),
            writer: tokio::sync::Mutex::new(()),
            on_close: Mutex::new(None),
        }
    }

    /// Installs a hook that runs once, on the first close or on drop.
    pub(crate) fn set_on_close(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_close.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    fn codec(&self) -> MutexGuard<'_, PaddingCodec> {
        self.codec.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self) {
        let hook = self.on_close.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Waits for the proxy's response and checks that it accepted the tunnel.
    pub async fn handshake(&self) -> Result<()> {
        self.handshake_with(&CancellationToken::new()).await
    }

    pub async fn handshake_with(&self, cancel: &CancellationToken) -> Result<()> {
        let headers = match self.conn.wait_for_headers_with(cancel).await {
            Ok(headers) => headers,
            Err(e) => {
                warn!(error = %e, "handshake failed");
                return Err(e);
            }
        };
        check_status(&headers).inspect_err(|e| warn!(error = %e, "handshake failed"))?;
        debug!(protocol = %self.conn.negotiated_protocol(), "handshake succeeded");
        Ok(())
    }

    /// Reads tunneled payload. Returns `Ok(0)` at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut guard = self.reader.lock().await;
        let state = &mut *guard;
        loop {
            let n = self.codec().decode(&mut state.input, buf);
            if n > 0 {
                return Ok(n);
            }
            let n = self
                .conn
                .read(&mut state.scratch)
                .await
                .map_err(Error::bad_stream)?;
            if n == 0 {
                if !state.input.is_empty() || self.codec().read_frame_pending() {
                    let err = io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended inside a padding frame");
                    return Err(Error::Io(err).bad_stream());
                }
                return Ok(0);
            }
            state.input.extend_from_slice(&state.scratch[..n]);
        }
    }

    /// Writes all of `data`, padding it while the codec still frames writes.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let _guard = self.writer.lock().await;
        let mut out = BytesMut::with_capacity(data.len() + self.codec().rear_headroom() + 3);
        self.codec().encode(data, &mut out);
        self.conn
            .write_bytes(out.freeze())
            .await
            .map_err(Error::bad_stream)?;
        Ok(data.len())
    }

    /// Writes a buffer whose first `reserved` bytes are headroom.
    ///
    /// With at least [`front_headroom`](Self::front_headroom) bytes reserved
    /// the padding frame is built in place. Returns the payload length.
    pub async fn write_buffer(&self, mut buffer: BytesMut, reserved: usize) -> Result<usize> {
        let payload_len = buffer.len().saturating_sub(reserved);
        if payload_len == 0 {
            return Ok(0);
        }
        let _guard = self.writer.lock().await;
        self.codec().encode_in_place(&mut buffer, reserved);
        self.conn
            .write_bytes(buffer.freeze())
            .await
            .map_err(Error::bad_stream)?;
        Ok(payload_len)
    }

    /// Closes the tunnel. The first call cancels the underlying stream.
    pub fn close(&self) -> Result<()> {
        self.release();
        self.conn.close()
    }

    pub fn front_headroom(&self) -> usize {
        self.codec().front_headroom()
    }

    pub fn rear_headroom(&self) -> usize {
        self.codec().rear_headroom()
    }

    pub fn writer_mtu(&self) -> usize {
        self.codec().writer_mtu()
    }

    pub fn reader_replaceable(&self) -> bool {
        self.codec().reader_replaceable()
    }

    pub fn writer_replaceable(&self) -> bool {
        self.codec().writer_replaceable()
    }

    /// Response headers, once the handshake completed.
    pub fn response_headers(&self) -> Option<HeaderMap> {
        self.conn.headers()
    }

    /// The underlying stream connection.
    pub fn stream(&self) -> &StreamConn {
        &self.conn
    }

    /// Adapts a shared connection to tokio's `AsyncRead`/`AsyncWrite`.
    pub fn into_stream(self: Arc<Self>) -> NaiveStream {
        NaiveStream {
            conn: self,
            read_fut: None,
            pending: BytesMut::new(),
            write_fut: None,
        }
    }
}

impl Drop for NaiveConn {
    fn drop(&mut self) {
        self.release();
    }
}

fn check_status(headers: &HeaderMap) -> Result<()> {
    let status = headers.get(":status").map(String::as_str).unwrap_or_default();
    if status != "200" {
        return Err(Error::Handshake(format!("unexpected response status: {}", status)));
    }
    Ok(())
}

type ReadFuture = Pin<Box<dyn Future<Output = Result<BytesMut>> + Send>>;
type WriteFuture = Pin<Box<dyn Future<Output = Result<usize>> + Send>>;

/// `AsyncRead`/`AsyncWrite` view of a [`NaiveConn`], for use with
/// `tokio::io::copy_bidirectional` and friends.
///
/// Shutdown only flushes: the tunnel has no half-close.
pub struct NaiveStream {
    conn: Arc<NaiveConn>,
    read_fut: Option<ReadFuture>,
    pending: BytesMut,
    write_fut: Option<WriteFuture>,
}

impl NaiveStream {
    pub fn conn(&self) -> &Arc<NaiveConn> {
        &self.conn
    }
}

impl AsyncRead for NaiveStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if !this.pending.is_empty() {
            let n = buf.remaining().min(this.pending.len());
            buf.put_slice(&this.pending.split_to(n));
            return Poll::Ready(Ok(()));
        }

        let size = buf.remaining().min(MAX_READ_SIZE);
        let conn = &this.conn;
        let fut = this.read_fut.get_or_insert_with(|| {
            let conn = conn.clone();
            Box::pin(async move {
                let mut data = BytesMut::zeroed(size);
                let n = conn.read(&mut data).await?;
                data.truncate(n);
                Ok(data)
            })
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.read_fut = None;

        let data = result.map_err(io::Error::from)?;
        let n = buf.remaining().min(data.len());
        buf.put_slice(&data[..n]);
        this.pending.extend_from_slice(&data[n..]);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for NaiveStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let conn = &this.conn;
        let fut = this.write_fut.get_or_insert_with(|| {
            let conn = conn.clone();
            let reserved = conn.front_headroom();
            let mut buffer = BytesMut::with_capacity(reserved + data.len() + conn.rear_headroom());
            buffer.put_bytes(0, reserved);
            buffer.extend_from_slice(data);
            Box::pin(async move { conn.write_buffer(buffer, reserved).await })
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.write_fut = None;
        Poll::Ready(result.map_err(io::Error::from))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(fut) = this.write_fut.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(fut.as_mut().poll(cx));
        this.write_fut = None;
        Poll::Ready(result.map(|_| ()).map_err(io::Error::from))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockEngine, MockStream};
    use crate::padding::{FIRST_PADDINGS, PADDING_HEADER_SIZE};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn open(engine: &MockEngine) -> (Arc<NaiveConn>, Arc<MockStream>) {
        let conn = StreamConn::new(engine, true, false);
        conn.start("CONNECT", "https://proxy.test:443", &HeaderMap::new(), 0, false)
            .unwrap();
        (Arc::new(NaiveConn::new(conn)), engine.last_stream())
    }

    /// Completes native writes as they arrive.
    fn auto_complete_writes(stream: Arc<MockStream>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut completed = 0;
            loop {
                let calls = stream.write_calls.load(Ordering::SeqCst);
                while completed < calls {
                    completed += 1;
                    stream.callback.on_write_completed();
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    }

    /// Feeds `wire` to outstanding reads `chunk` bytes at a time.
    fn feed_reads(stream: Arc<MockStream>, wire: Vec<u8>, chunk: usize) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut offset = 0;
            while offset < wire.len() {
                if stream.outstanding_reads() == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    continue;
                }
                let end = (offset + chunk).min(wire.len());
                stream.complete_read(&wire[offset..end]);
                offset = end;
            }
        })
    }

    #[tokio::test]
    async fn test_handshake_ok() {
        let engine = MockEngine::default();
        let (conn, stream) = open(&engine);
        stream.respond("200");
        conn.handshake().await.unwrap();
        assert_eq!(conn.response_headers().unwrap()[":status"], "200");
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_200() {
        let engine = MockEngine::default();
        let (conn, stream) = open(&engine);
        stream.respond("407");
        let err = conn.handshake().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "handshake failed: unexpected response status: 407"
        );
    }

    #[tokio::test]
    async fn test_write_pads_first_frames() {
        let engine = MockEngine::default();
        let (conn, stream) = open(&engine);
        stream.respond("200");
        let completer = auto_complete_writes(stream.clone());

        for _ in 0..FIRST_PADDINGS {
            assert_eq!(conn.front_headroom(), PADDING_HEADER_SIZE);
            conn.write(b"payload").await.unwrap();
        }
        assert!(conn.writer_replaceable());
        assert_eq!(conn.front_headroom(), 0);
        conn.write(b"plain").await.unwrap();
        completer.abort();

        let writes = stream.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), FIRST_PADDINGS + 1);
        for frame in &writes[..FIRST_PADDINGS] {
            assert_eq!(&frame[..2], &[0, 7]);
            assert_eq!(frame.len(), 3 + 7 + frame[2] as usize);
            assert_eq!(&frame[3..10], b"payload");
        }
        assert_eq!(&writes[FIRST_PADDINGS][..], b"plain");
    }

    #[tokio::test]
    async fn test_write_buffer_in_place() {
        let engine = MockEngine::default();
        let (conn, stream) = open(&engine);
        stream.respond("200");
        let completer = auto_complete_writes(stream.clone());

        let reserved = conn.front_headroom();
        let mut buffer = BytesMut::new();
        buffer.put_bytes(0, reserved);
        buffer.extend_from_slice(b"abc");
        assert_eq!(conn.write_buffer(buffer, reserved).await.unwrap(), 3);
        completer.abort();

        let frame = stream.writes.lock().unwrap()[0].clone();
        assert_eq!(&frame[..3], &[0, 3, frame[2]]);
        assert_eq!(&frame[3..6], b"abc");
    }

    #[tokio::test]
    async fn test_read_strips_padding() {
        let engine = MockEngine::default();
        let (conn, stream) = open(&engine);
        stream.respond("200");

        let mut peer = PaddingCodec::new();
        let mut wire = BytesMut::new();
        let mut expected = Vec::new();
        for i in 0..(FIRST_PADDINGS + 3) {
            let chunk = vec![i as u8; 100 + i];
            peer.encode(&chunk, &mut wire);
            expected.extend_from_slice(&chunk);
        }
        let feeder = feed_reads(stream.clone(), wire.to_vec(), 7);

        let mut received = Vec::new();
        let mut buf = [0u8; 5];
        while received.len() < expected.len() {
            let n = conn.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        feeder.await.unwrap();
        assert_eq!(received, expected);
        assert!(conn.reader_replaceable());
    }

    #[tokio::test]
    async fn test_errors_are_wrapped() {
        let engine = MockEngine::default();
        let (conn, stream) = open(&engine);
        stream.respond("200");
        stream.callback.on_failed(crate::net_error::NetError::CONNECTION_RESET);

        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::BadStream(_)));
        assert!(err.to_string().starts_with("bad h2 stream"));
        let err = conn.write(b"x").await.unwrap_err();
        assert!(matches!(err, Error::BadStream(_)));
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_error() {
        let engine = MockEngine::default();
        let (conn, stream) = open(&engine);
        stream.respond("200");

        let feeder = {
            let stream = stream.clone();
            tokio::spawn(async move {
                while stream.outstanding_reads() == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                stream.complete_read(&[0, 10, 0, b'a']);
                while stream.outstanding_reads() == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                stream.complete_read(b"");
            })
        };
        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 1);
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::BadStream(_)));
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_hook_runs_once() {
        let engine = MockEngine::default();
        let (conn, _stream) = open(&engine);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            conn.set_on_close(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        conn.close().unwrap();
        assert!(conn.close().is_err());
        drop(conn);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_hook_runs_on_drop() {
        let engine = MockEngine::default();
        let (conn, stream) = open(&engine);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            conn.set_on_close(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(conn);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stream.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_stream_adapter() {
        let engine = MockEngine::default();
        let (conn, stream) = open(&engine);
        stream.respond("200");
        let completer = auto_complete_writes(stream.clone());

        let mut peer = PaddingCodec::new();
        let mut wire = BytesMut::new();
        peer.encode(b"hello from the far side", &mut wire);
        let feeder = feed_reads(stream.clone(), wire.to_vec(), 64);

        let mut io = conn.clone().into_stream();
        io.write_all(b"ping").await.unwrap();
        io.flush().await.unwrap();

        let mut buf = [0u8; 23];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from the far side");
        // the padding tail of the frame is never requested
        feeder.abort();
        completer.abort();

        let mut decoder = PaddingCodec::new();
        let mut written = BytesMut::from(&stream.written()[..]);
        let mut out = [0u8; 16];
        let n = decoder.decode(&mut written, &mut out);
        assert_eq!(&out[..n], b"ping");
    }
}
