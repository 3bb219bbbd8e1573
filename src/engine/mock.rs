//! Scripted engine for unit tests: records every stream operation and lets
//! the test fire callbacks by hand.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use super::{BidirectionalStream, Engine, EngineParams, HeaderMap, StreamCallback, TcpDialer, UdpDialer};
use crate::error::Result;

#[derive(Default)]
pub(crate) struct MockEngine {
    pub streams: Mutex<Vec<Arc<MockStream>>>,
    pub shutdowns: AtomicUsize,
    pub destroys: AtomicUsize,
    pub params: Mutex<Option<EngineParams>>,
    pub dialer: Mutex<Option<TcpDialer>>,
    pub udp_dialer: Mutex<Option<UdpDialer>>,
    pub fail_start: AtomicBool,
}

impl MockEngine {
    pub fn stream(&self, index: usize) -> Arc<MockStream> {
        self.streams.lock().unwrap()[index].clone()
    }

    pub fn last_stream(&self) -> Arc<MockStream> {
        self.streams.lock().unwrap().last().cloned().unwrap()
    }
}

pub(crate) struct MockStream {
    pub callback: Arc<dyn StreamCallback>,
    pub start_request: Mutex<Option<(String, String, HeaderMap)>>,
    pub pending_reads: Mutex<Vec<BytesMut>>,
    pub writes: Mutex<Vec<Bytes>>,
    pub read_calls: AtomicUsize,
    pub write_calls: AtomicUsize,
    pub cancels: AtomicUsize,
    pub destroys: AtomicUsize,
    pub reject_start: AtomicBool,
}

impl MockStream {
    /// Completes the oldest outstanding read with `data`.
    pub fn complete_read(&self, data: &[u8]) {
        let mut buffer = self.pending_reads.lock().unwrap().remove(0);
        let n = data.len().min(buffer.len());
        buffer[..n].copy_from_slice(&data[..n]);
        self.callback.on_read_completed(buffer, n);
    }

    pub fn outstanding_reads(&self) -> usize {
        self.pending_reads.lock().unwrap().len()
    }

    pub fn written(&self) -> Vec<u8> {
        self.writes.lock().unwrap().iter().flat_map(|b| b.iter().copied()).collect()
    }

    pub fn respond(&self, status: &str) {
        let mut headers = HeaderMap::new();
        headers.insert(":status".to_string(), status.to_string());
        self.callback.on_stream_ready();
        self.callback.on_response_headers_received(headers, "h2");
    }
}

struct MockStreamHandle(Arc<MockStream>);

impl BidirectionalStream for MockStreamHandle {
    fn start(&self, method: &str, url: &str, headers: &HeaderMap, _priority: i32, _eos: bool) -> bool {
        if self.0.reject_start.load(Ordering::SeqCst) {
            return false;
        }
        *self.0.start_request.lock().unwrap() = Some((method.to_string(), url.to_string(), headers.clone()));
        true
    }

    fn read(&self, buffer: BytesMut) -> bool {
        self.0.read_calls.fetch_add(1, Ordering::SeqCst);
        self.0.pending_reads.lock().unwrap().push(buffer);
        true
    }

    fn write(&self, data: Bytes, _end_of_stream: bool) -> bool {
        self.0.write_calls.fetch_add(1, Ordering::SeqCst);
        self.0.writes.lock().unwrap().push(data);
        true
    }

    fn flush(&self) {}

    fn cancel(&self) {
        self.0.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.0.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

impl Engine for MockEngine {
    fn version(&self) -> String {
        "mock".to_string()
    }

    fn set_trusted_root_certificates(&self, _pem: &str) -> bool {
        true
    }

    fn set_cert_verifier_with_public_key_sha256(&self, hashes: &[Vec<u8>]) -> bool {
        hashes.iter().all(|h| h.len() == 32)
    }

    fn set_dialer(&self, dialer: Option<TcpDialer>) {
        *self.dialer.lock().unwrap() = dialer;
    }

    fn set_udp_dialer(&self, dialer: Option<UdpDialer>) {
        *self.udp_dialer.lock().unwrap() = dialer;
    }

    fn start(&self, params: &EngineParams) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(crate::error::Error::Config("mock start failure".to_string()));
        }
        *self.params.lock().unwrap() = Some(params.clone());
        Ok(())
    }

    fn create_stream(&self, callback: Arc<dyn StreamCallback>) -> Box<dyn BidirectionalStream> {
        let stream = Arc::new(MockStream {
            callback,
            start_request: Mutex::new(None),
            pending_reads: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            read_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
            reject_start: AtomicBool::new(false),
        });
        self.streams.lock().unwrap().push(stream.clone());
        Box::new(MockStreamHandle(stream))
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}
