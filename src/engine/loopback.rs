//! In-process engine that terminates CONNECT requests itself.
//!
//! Instead of talking HTTP/2 to a proxy, each stream resolves and dials the
//! requested authority through the installed dialer callbacks and relays
//! bytes directly, speaking the server side of the padding protocol. It
//! exercises everything above the engine seam: dialer bridging, the DNS
//! server, padding and stream lifecycle.
//!
//! Every stream runs on two engine-owned threads: a control thread that
//! handles commands and fires callbacks, and a reader for the destination.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tracing::{debug, trace, warn};

use super::{
    BidirectionalStream, Engine, EngineParams, HeaderMap, StreamCallback, StreamDispatcher,
    StreamHandle, TcpDialer, UdpDialer,
};
use crate::dialer::split_host_port;
use crate::error::{Error, Result};
use crate::net_error::NetError;
use crate::padding::{generate_padding_header, PaddingCodec};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_SHUT_DOWN: u8 = 2;

const RELAY_BUFFER_SIZE: usize = 32 * 1024;
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Read(BytesMut),
    Write(Bytes),
    Cancel,
    Destroy,
    Downlink(Bytes),
    DownlinkEnd(Option<io::Error>),
}

struct Inner {
    dispatcher: StreamDispatcher,
    state: AtomicU8,
    dialer: RwLock<Option<TcpDialer>>,
    udp_dialer: RwLock<Option<UdpDialer>>,
    params: RwLock<EngineParams>,
    trusted_roots: Mutex<Option<String>>,
    pins: Mutex<Vec<Vec<u8>>>,
    streams: Mutex<HashMap<StreamHandle, Sender<Command>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Engine that answers CONNECT requests in-process.
#[derive(Clone)]
pub struct LoopbackEngine {
    inner: Arc<Inner>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher: StreamDispatcher::new(),
                state: AtomicU8::new(STATE_IDLE),
                dialer: RwLock::new(None),
                udp_dialer: RwLock::new(None),
                params: RwLock::new(EngineParams::new()),
                trusted_roots: Mutex::new(None),
                pins: Mutex::new(Vec::new()),
                streams: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Streams whose callbacks can still be delivered.
    pub fn live_streams(&self) -> usize {
        self.inner.dispatcher.live_streams()
    }

    /// Parameters of the last successful start.
    pub fn params(&self) -> EngineParams {
        self.inner.params.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn public_key_pins(&self) -> Vec<Vec<u8>> {
        self.inner.pins.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Engine for LoopbackEngine {
    fn version(&self) -> String {
        format!("loopback/{}", env!("CARGO_PKG_VERSION"))
    }

    fn set_trusted_root_certificates(&self, pem: &str) -> bool {
        if !pem.contains("-----BEGIN CERTIFICATE-----") {
            return false;
        }
        *self.inner.trusted_roots.lock().unwrap_or_else(|e| e.into_inner()) = Some(pem.to_string());
        true
    }

    fn set_cert_verifier_with_public_key_sha256(&self, hashes: &[Vec<u8>]) -> bool {
        if hashes.is_empty() || hashes.iter().any(|hash| hash.len() != 32) {
            return false;
        }
        *self.inner.pins.lock().unwrap_or_else(|e| e.into_inner()) = hashes.to_vec();
        true
    }

    fn set_dialer(&self, dialer: Option<TcpDialer>) {
        *self.inner.dialer.write().unwrap_or_else(|e| e.into_inner()) = dialer;
    }

    fn set_udp_dialer(&self, dialer: Option<UdpDialer>) {
        *self.inner.udp_dialer.write().unwrap_or_else(|e| e.into_inner()) = dialer;
    }

    fn start(&self, params: &EngineParams) -> Result<()> {
        self.inner
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Invalid("engine already started".to_string()))?;
        *self.inner.params.write().unwrap_or_else(|e| e.into_inner()) = params.clone();
        debug!(options = %params.experimental_options_json(), "loopback engine started");
        Ok(())
    }

    fn create_stream(&self, callback: Arc<dyn StreamCallback>) -> Box<dyn BidirectionalStream> {
        let handle = self.inner.dispatcher.register(callback);
        Box::new(LoopbackStream {
            engine: self.inner.clone(),
            handle,
            commands: Mutex::new(None),
        })
    }

    fn shutdown(&self) {
        self.inner.state.store(STATE_SHUT_DOWN, Ordering::Release);
        let streams: Vec<Sender<Command>> = self
            .inner
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        debug!(streams = streams.len(), "loopback engine shutting down");
        for tx in streams {
            let _ = tx.send(Command::Cancel);
        }
    }

    fn destroy(&self) {
        self.shutdown();
        let workers: Vec<JoinHandle<()>> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("loopback worker panicked");
            }
        }
    }
}

struct LoopbackStream {
    engine: Arc<Inner>,
    handle: StreamHandle,
    commands: Mutex<Option<Sender<Command>>>,
}

impl LoopbackStream {
    fn send(&self, command: Command) -> bool {
        match self.commands.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }
}

impl BidirectionalStream for LoopbackStream {
    fn start(&self, method: &str, url: &str, headers: &HeaderMap, _priority: i32, _end_of_stream: bool) -> bool {
        if self.engine.state.load(Ordering::Acquire) != STATE_RUNNING || method != "CONNECT" {
            return false;
        }
        let mut commands = self.commands.lock().unwrap_or_else(|e| e.into_inner());
        if commands.is_some() {
            return false;
        }
        // only destroy retires an unstarted handle
        self.engine.dispatcher.expect_live(self.handle);
        let Some(authority) = headers.get("-connect-authority").cloned() else {
            return false;
        };

        let (tx, rx) = mpsc::channel();
        self.engine
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.handle, tx.clone());
        *commands = Some(tx.clone());

        trace!(handle = self.handle, url, authority = %authority, "loopback stream start");
        let relay = Relay {
            engine: self.engine.clone(),
            handle: self.handle,
            commands: rx,
            self_tx: Some(tx),
        };
        let spawned = thread::Builder::new()
            .name(format!("loopback-stream-{}", self.handle))
            .spawn(move || relay.run(&authority));
        match spawned {
            Ok(worker) => {
                self.engine.workers.lock().unwrap_or_else(|e| e.into_inner()).push(worker);
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to spawn loopback stream thread");
                *commands = None;
                false
            }
        }
    }

    fn read(&self, buffer: BytesMut) -> bool {
        self.send(Command::Read(buffer))
    }

    fn write(&self, data: Bytes, _end_of_stream: bool) -> bool {
        self.send(Command::Write(data))
    }

    fn flush(&self) {}

    fn cancel(&self) {
        self.send(Command::Cancel);
    }

    fn destroy(&self) {
        self.engine.dispatcher.release(self.handle);
        self.engine
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.handle);
        if let Some(tx) = self.commands.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(Command::Destroy);
        }
    }
}

/// Per-stream worker. Owns the destination socket and the server side of
/// the padding codec.
struct Relay {
    engine: Arc<Inner>,
    handle: StreamHandle,
    commands: Receiver<Command>,
    self_tx: Option<Sender<Command>>,
}

impl Relay {
    fn dispatcher(&self) -> &StreamDispatcher {
        &self.engine.dispatcher
    }

    fn run(mut self, authority: &str) {
        if !self.dispatcher().is_live(self.handle) {
            trace!(handle = self.handle, "stream destroyed before its relay ran");
            self.forget();
            return;
        }
        self.dispatcher().stream_ready(self.handle);

        let socket = match self.connect(authority) {
            Ok(socket) => socket,
            Err(e) => {
                debug!(authority, error = %e.name(), "loopback dial failed");
                let mut headers = HeaderMap::new();
                headers.insert(":status".to_string(), "502".to_string());
                self.dispatcher().response_headers_received(self.handle, headers, "h2");
                self.dispatcher().succeeded(self.handle);
                self.forget();
                return;
            }
        };

        let reader = match socket.try_clone() {
            Ok(reader) => reader,
            Err(e) => {
                self.dispatcher().failed(self.handle, NetError::from_io_error(&e));
                self.forget();
                return;
            }
        };
        let Some(downlink_tx) = self.self_tx.take() else {
            return;
        };
        let downlink = thread::Builder::new()
            .name(format!("loopback-downlink-{}", self.handle))
            .spawn(move || read_downlink(reader, downlink_tx));
        match downlink {
            Ok(worker) => self.engine.workers.lock().unwrap_or_else(|e| e.into_inner()).push(worker),
            Err(e) => {
                self.dispatcher().failed(self.handle, NetError::from_io_error(&e));
                self.forget();
                return;
            }
        }

        let mut headers = HeaderMap::new();
        headers.insert(":status".to_string(), "200".to_string());
        headers.insert("padding".to_string(), generate_padding_header());
        self.dispatcher().response_headers_received(self.handle, headers, "h2");

        self.relay(socket);
        self.forget();
    }

    fn relay(&self, mut socket: File) {
        let mut codec = PaddingCodec::new();
        let mut uplink = BytesMut::new();
        let mut scratch = vec![0u8; RELAY_BUFFER_SIZE];
        let mut downlink = BytesMut::new();
        let mut pending_read: Option<BytesMut> = None;
        let mut downlink_done = false;

        while let Ok(command) = self.commands.recv() {
            match command {
                Command::Read(buffer) => pending_read = Some(buffer),
                Command::Write(data) => {
                    uplink.extend_from_slice(&data);
                    let mut result = Ok(());
                    loop {
                        let n = codec.decode(&mut uplink, &mut scratch);
                        if n == 0 {
                            break;
                        }
                        result = socket.write_all(&scratch[..n]);
                        if result.is_err() {
                            break;
                        }
                    }
                    if let Err(e) = result {
                        self.dispatcher().failed(self.handle, NetError::from_io_error(&e));
                        shutdown_socket(&socket);
                        return;
                    }
                    self.dispatcher().write_completed(self.handle);
                }
                Command::Downlink(data) => codec.encode(&data, &mut downlink),
                Command::DownlinkEnd(None) => downlink_done = true,
                Command::DownlinkEnd(Some(e)) => {
                    self.dispatcher().failed(self.handle, NetError::from_io_error(&e));
                    return;
                }
                Command::Cancel => {
                    shutdown_socket(&socket);
                    self.dispatcher().canceled(self.handle);
                    return;
                }
                Command::Destroy => {
                    shutdown_socket(&socket);
                    return;
                }
            }

            if let Some(mut buffer) = pending_read.take() {
                if !downlink.is_empty() {
                    let n = buffer.len().min(downlink.len());
                    buffer[..n].copy_from_slice(&downlink.split_to(n));
                    self.dispatcher().read_completed(self.handle, buffer, n);
                } else if downlink_done {
                    self.dispatcher().read_completed(self.handle, buffer, 0);
                    self.dispatcher().succeeded(self.handle);
                    shutdown_socket(&socket);
                    return;
                } else {
                    pending_read = Some(buffer);
                }
            }
        }
        shutdown_socket(&socket);
    }

    fn forget(&self) {
        self.engine
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.handle);
    }

    fn connect(&self, authority: &str) -> std::result::Result<File, NetError> {
        let (host, port) = split_host_port(authority).ok_or(NetError::CONNECTION_FAILED)?;
        let ip = self.resolve(&host)?;

        let dialer = self.engine.dialer.read().unwrap_or_else(|e| e.into_inner()).clone();
        let fd: OwnedFd = match dialer {
            Some(dialer) => dialer(&ip.to_string(), port)?,
            None => std::net::TcpStream::connect((ip, port))
                .map_err(|e| NetError::from_io_error(&e))?
                .into(),
        };
        Ok(File::from(fd))
    }

    fn resolve(&self, host: &str) -> std::result::Result<IpAddr, NetError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let params = self.engine.params.read().unwrap_or_else(|e| e.into_inner()).clone();

        if let Some(mapped) = params.host_resolver_rules().and_then(|rules| map_host(rules, host)) {
            trace!(host, mapped = %mapped, "host resolver rule applied");
            if let Ok(ip) = mapped.parse::<IpAddr>() {
                return Ok(ip);
            }
            return self.resolve_name(&params, &mapped);
        }
        self.resolve_name(&params, host)
    }

    fn resolve_name(&self, params: &EngineParams, host: &str) -> std::result::Result<IpAddr, NetError> {
        let Some(nameserver) = params.dns_server_override().into_iter().next() else {
            return (host, 0)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .map(|addr| addr.ip())
                .ok_or(NetError::NAME_NOT_RESOLVED);
        };

        for record_type in [RecordType::A, RecordType::AAAA] {
            let request = build_query(host, record_type)?;
            let mut response = self.query_udp(nameserver, &request)?;
            if response.truncated() {
                trace!(host, "truncated DNS answer, retrying over TCP");
                response = self.query_tcp(nameserver, &request)?;
            }
            if let Some(ip) = first_address(&response) {
                return Ok(ip);
            }
        }
        Err(NetError::NAME_NOT_RESOLVED)
    }

    fn query_udp(&self, nameserver: SocketAddr, request: &[u8]) -> std::result::Result<Message, NetError> {
        let dialer = self
            .engine
            .udp_dialer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(NetError::NAME_NOT_RESOLVED)?;
        let (fd, _) = dialer(&nameserver.ip().to_string(), nameserver.port())?;
        // any connected datagram socket
        let socket = std::net::UdpSocket::from(fd);
        let io_err = |e: io::Error| NetError::from_io_error(&e);
        socket.set_read_timeout(Some(DNS_TIMEOUT)).map_err(io_err)?;
        socket.send(request).map_err(io_err)?;
        let mut buf = [0u8; 65535];
        let n = socket.recv(&mut buf).map_err(io_err)?;
        Message::from_bytes(&buf[..n]).map_err(|_| NetError::NAME_NOT_RESOLVED)
    }

    fn query_tcp(&self, nameserver: SocketAddr, request: &[u8]) -> std::result::Result<Message, NetError> {
        let dialer = self
            .engine
            .dialer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(NetError::NAME_NOT_RESOLVED)?;
        let fd = dialer(&nameserver.ip().to_string(), nameserver.port())?;
        // any connected stream socket
        let mut stream = std::net::TcpStream::from(fd);
        let io_err = |e: io::Error| NetError::from_io_error(&e);
        stream.set_read_timeout(Some(DNS_TIMEOUT)).map_err(io_err)?;
        stream
            .write_all(&(request.len() as u16).to_be_bytes())
            .and_then(|_| stream.write_all(request))
            .map_err(io_err)?;
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).map_err(io_err)?;
        let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut buf).map_err(io_err)?;
        Message::from_bytes(&buf).map_err(|_| NetError::NAME_NOT_RESOLVED)
    }
}

fn read_downlink(mut reader: File, tx: Sender<Command>) {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                let _ = tx.send(Command::DownlinkEnd(None));
                return;
            }
            Ok(n) => {
                if tx.send(Command::Downlink(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(Command::DownlinkEnd(Some(e)));
                return;
            }
        }
    }
}

/// Unblocks the downlink reader. Errors mean the socket is already gone.
fn shutdown_socket(socket: &File) {
    // SAFETY: the descriptor is owned by `socket` and open for this call.
    unsafe {
        libc::shutdown(socket.as_raw_fd(), libc::SHUT_RDWR);
    }
}

/// Applies `MAP pattern replacement` rules. A pattern may start with `*`
/// to match any prefix.
fn map_host(rules: &str, host: &str) -> Option<String> {
    for rule in rules.split(',') {
        let parts: Vec<&str> = rule.split_whitespace().collect();
        let [kind, pattern, replacement] = parts.as_slice() else {
            continue;
        };
        if !kind.eq_ignore_ascii_case("MAP") {
            continue;
        }
        let matched = match pattern.strip_prefix('*') {
            Some(suffix) => host
                .len()
                .checked_sub(suffix.len())
                .and_then(|start| host.get(start..))
                .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix)),
            None => pattern.eq_ignore_ascii_case(host),
        };
        if matched {
            let target = split_host_port(replacement).map(|(h, _)| h).unwrap_or_else(|| replacement.to_string());
            return Some(target);
        }
    }
    None
}

fn build_query(host: &str, record_type: RecordType) -> std::result::Result<Vec<u8>, NetError> {
    let name = Name::from_str(&format!("{}.", host.trim_end_matches('.'))).map_err(|_| NetError::NAME_NOT_RESOLVED)?;
    let mut id = [0u8; 2];
    let _ = getrandom::getrandom(&mut id);
    let mut message = Message::new();
    message
        .set_id(u16::from_be_bytes(id))
        .set_message_type(MessageType::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(name, record_type));
    message.to_bytes().map_err(|_| NetError::NAME_NOT_RESOLVED)
}

fn first_address(response: &Message) -> Option<IpAddr> {
    response.answers().iter().find_map(|record| match record.data() {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    })
}
