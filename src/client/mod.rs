//! Proxy client: opens padded CONNECT tunnels through the engine.
//!
//! A [`NaiveClient`] owns one engine. Starting it installs the dialer
//! bridge, points the engine's DNS at the in-process server and applies the
//! TLS and QUIC settings. Every connection it hands out is tracked so that
//! [`NaiveClient::close`] can tear everything down and wait for it.

mod bridge;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::dialer::{host_port, split_host_port, Dialer, SystemDialer};
use crate::dns::{EchResolver, Resolver, ServerRedirectResolver, INTERNAL_DNS_ADDRESS};
use crate::engine::{Engine, EngineParams, HeaderMap, QuicHint};
use crate::error::{Error, Result};
use crate::naive_conn::NaiveConn;
use crate::padding::generate_padding_header;
use crate::signal::Signal;
use crate::stream_conn::StreamConn;
use crate::tls;

pub(crate) use bridge::Bridge;

const STATE_CREATED: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_CLOSING: u8 = 3;
const STATE_CLOSED: u8 = 4;

/// HTTP/2 receive windows for the proxy session and each tunnel.
const HTTP2_CONNECTION_WINDOW_SIZE: u32 = 128 * 1024 * 1024;
const HTTP2_STREAM_WINDOW_SIZE: u32 = 64 * 1024 * 1024;

/// Engine socket pool limits.
const MAX_SOCKETS_PER_POOL: u32 = 2048;
const MAX_SOCKETS_PER_GROUP: u32 = 2040;

/// Congestion control used by QUIC connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuicCongestionControl {
    #[default]
    Default,
    Bbr,
    #[serde(rename = "bbr2")]
    BbrV2,
    Cubic,
    Reno,
}

impl QuicCongestionControl {
    /// QUIC connection option tag, `None` for the engine default.
    pub fn connection_option(self) -> Option<&'static str> {
        match self {
            QuicCongestionControl::Default => None,
            QuicCongestionControl::Bbr => Some("TBBR"),
            QuicCongestionControl::BbrV2 => Some("B2ON"),
            QuicCongestionControl::Cubic => Some("QBIC"),
            QuicCongestionControl::Reno => Some("RENO"),
        }
    }
}

impl FromStr for QuicCongestionControl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "default" => Ok(QuicCongestionControl::Default),
            "bbr" => Ok(QuicCongestionControl::Bbr),
            "bbr2" | "bbrv2" => Ok(QuicCongestionControl::BbrV2),
            "cubic" => Ok(QuicCongestionControl::Cubic),
            "reno" => Ok(QuicCongestionControl::Reno),
            other => Err(Error::Config(format!("unknown congestion control '{}'", other))),
        }
    }
}

/// Client options.
#[derive(Default, Clone)]
pub struct NaiveClientConfig {
    /// Proxy server as `host:port`. The host may be an IP literal.
    pub server_address: String,
    /// TLS server name. Defaults to the host of `server_address`.
    pub server_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Number of independent connection pools. Values below 1 mean 1.
    pub insecure_concurrency: usize,
    pub extra_headers: HeaderMap,
    /// PEM roots replacing the default trust store.
    pub trusted_root_certificates: Option<String>,
    /// SPKI SHA-256 pins. Take precedence over `trusted_root_certificates`.
    pub certificate_public_key_sha256: Vec<Vec<u8>>,
    /// Extra engine resolver rules, e.g. `MAP proxy.example 192.0.2.1`.
    pub host_resolver_rules: Option<String>,
    /// Resolver behind the engine's DNS. Required.
    pub dns_resolver: Option<Arc<dyn Resolver>>,
    pub ech_enabled: bool,
    pub ech_config_list: Option<Vec<u8>>,
    pub ech_query_server_name: Option<String>,
    pub quic: bool,
    pub quic_congestion_control: QuicCongestionControl,
    /// Outbound dialer. Defaults to [`SystemDialer`].
    pub dialer: Option<Arc<dyn Dialer>>,
}

struct Tracked {
    conn: Weak<StreamConn>,
    _token: TaskTrackerToken,
}

/// Proxy client over one engine.
pub struct NaiveClient {
    engine: Arc<dyn Engine>,
    server_host: String,
    server_port: u16,
    server_name: String,
    server_url: String,
    authorization: Option<String>,
    extra_headers: HeaderMap,
    concurrency: usize,
    trusted_root_certificates: Option<String>,
    certificate_public_key_sha256: Vec<Vec<u8>>,
    host_resolver_rules: Option<String>,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
    ech_enabled: bool,
    ech_config_list: Option<Vec<u8>>,
    ech_query_server_name: Option<String>,
    quic: bool,
    quic_congestion_control: QuicCongestionControl,

    state: AtomicU8,
    started: Signal,
    counter: AtomicU64,
    next_conn_id: AtomicU64,
    conns: Arc<RwLock<HashMap<u64, Tracked>>>,
    active: TaskTracker,
    proxy_tasks: TaskTracker,
    cancel: CancellationToken,
}

impl NaiveClient {
    /// Validates `config` and binds it to `engine`. Nothing is started yet.
    pub fn new(config: NaiveClientConfig, engine: Arc<dyn Engine>) -> Result<Self> {
        if config.server_address.is_empty() {
            return Err(Error::Config("missing server address".to_string()));
        }
        let (server_host, server_port) = split_host_port(&config.server_address).ok_or_else(|| {
            Error::Config(format!("invalid server address '{}'", config.server_address))
        })?;
        let resolver = config
            .dns_resolver
            .ok_or_else(|| Error::Config("missing DNS resolver".to_string()))?;
        let server_name = config
            .server_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| server_host.clone());

        let authorization = config.username.filter(|u| !u.is_empty()).map(|username| {
            let credentials = format!("{}:{}", username, config.password.unwrap_or_default());
            format!("Basic {}", STANDARD.encode(credentials))
        });

        Ok(Self {
            engine,
            server_url: format!("https://{}", host_port(&server_name, server_port)),
            server_host,
            server_port,
            server_name,
            authorization,
            extra_headers: config.extra_headers,
            concurrency: config.insecure_concurrency.max(1),
            trusted_root_certificates: config.trusted_root_certificates,
            certificate_public_key_sha256: config.certificate_public_key_sha256,
            host_resolver_rules: config.host_resolver_rules,
            resolver,
            dialer: config.dialer.unwrap_or_else(|| Arc::new(SystemDialer)),
            ech_enabled: config.ech_enabled,
            ech_config_list: config.ech_config_list,
            ech_query_server_name: config.ech_query_server_name,
            quic: config.quic,
            quic_congestion_control: config.quic_congestion_control,
            state: AtomicU8::new(STATE_CREATED),
            started: Signal::new(),
            counter: AtomicU64::new(0),
            next_conn_id: AtomicU64::new(0),
            conns: Arc::new(RwLock::new(HashMap::new())),
            active: TaskTracker::new(),
            proxy_tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Number of handed-out connections not yet closed or dropped.
    pub fn active_connections(&self) -> usize {
        self.active.len()
    }

    /// Dialer bridges and DNS exchanges still running for the engine.
    pub fn background_tasks(&self) -> usize {
        self.proxy_tasks.len()
    }

    /// Starts the engine. Must be called from within a tokio runtime, which
    /// then serves the engine's dialer callbacks.
    pub fn start(&self) -> Result<()> {
        match self.state.compare_exchange(
            STATE_CREATED,
            STATE_STARTING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_STARTING) => return Err(Error::StartInProgress),
            Err(STATE_RUNNING) => return Err(Error::AlreadyStarted),
            Err(_) => return Err(Error::Closed),
        }

        match self.start_engine() {
            Ok(()) => {
                self.state.store(STATE_RUNNING, Ordering::Release);
                self.started.set();
                info!(server = %self.server_url, version = %self.engine.version(), "client started");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "client start failed");
                self.cancel.cancel();
                self.engine.set_dialer(None);
                self.engine.set_udp_dialer(None);
                self.engine.shutdown();
                self.engine.destroy();
                self.state.store(STATE_CLOSED, Ordering::Release);
                self.started.set();
                Err(e)
            }
        }
    }

    fn start_engine(&self) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|_| Error::Config("client must be started inside a tokio runtime".to_string()))?;

        if !self.certificate_public_key_sha256.is_empty() {
            if !self
                .engine
                .set_cert_verifier_with_public_key_sha256(&self.certificate_public_key_sha256)
            {
                return Err(tls::TlsError::InvalidPin("engine rejected public key pins".to_string()).into());
            }
        } else if let Some(pem) = &self.trusted_root_certificates {
            let count = tls::validate_trusted_roots(pem)?;
            if !self.engine.set_trusted_root_certificates(pem) {
                return Err(tls::TlsError::InvalidCertificate(
                    "engine rejected trusted root certificates".to_string(),
                )
                .into());
            }
            debug!(count, "installed trusted root certificates");
        }

        let bridge = Arc::new(Bridge::new(
            self.dialer.clone(),
            self.wrap_resolver(),
            runtime,
            self.proxy_tasks.clone(),
            self.cancel.clone(),
        ));
        self.engine.set_dialer(Some(bridge.tcp_dialer()));
        self.engine.set_udp_dialer(Some(bridge.udp_dialer()));

        self.engine.start(&self.engine_params()?)
    }

    /// Resolver chain: ECH rewriting, then server redirection, then the
    /// configured resolver.
    fn wrap_resolver(&self) -> Arc<dyn Resolver> {
        let mut resolver = self.resolver.clone();
        if !self.server_host.eq_ignore_ascii_case(&self.server_name) {
            resolver = Arc::new(ServerRedirectResolver::new(
                resolver,
                &self.server_name,
                &self.server_host,
            ));
        }
        if self.ech_enabled {
            resolver = Arc::new(EchResolver::new(
                resolver,
                &self.server_name,
                self.ech_query_server_name.as_deref(),
                self.ech_config_list.clone(),
                self.quic,
            ));
        }
        resolver
    }

    fn engine_params(&self) -> Result<EngineParams> {
        let mut params = EngineParams::new();
        params.enable_http2 = !self.quic;
        params.enable_quic = self.quic;
        if self.quic {
            params.quic_hints.push(QuicHint {
                host: self.server_name.clone(),
                port: self.server_port,
                alternate_port: self.server_port,
            });
            if let Some(option) = self.quic_congestion_control.connection_option() {
                params.set_quic_connection_options(option);
            }
        } else {
            params.set_http2_options(HTTP2_CONNECTION_WINDOW_SIZE, HTTP2_STREAM_WINDOW_SIZE);
        }
        params.set_socket_pool_options(MAX_SOCKETS_PER_POOL, MAX_SOCKETS_PER_GROUP);
        params.set_async_dns(true);
        params.set_dns_server_override(&[INTERNAL_DNS_ADDRESS.to_string()])?;
        if self.ech_enabled {
            params.set_use_dns_https_svcb(true);
        }
        if let Some(rules) = &self.host_resolver_rules {
            params.set_host_resolver_rules(rules);
        }
        Ok(params)
    }

    async fn wait_running(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_RUNNING => return Ok(()),
                STATE_CREATED | STATE_STARTING => {
                    tokio::select! {
                        _ = self.started.wait() => {}
                        _ = cancel.cancelled() => return Err(Error::Canceled),
                    }
                    // started is raised on every exit from starting
                    if self.state.load(Ordering::Acquire) != STATE_RUNNING {
                        return Err(Error::Closed);
                    }
                }
                _ => return Err(Error::Closed),
            }
        }
    }

    fn request_headers(&self, destination: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("-connect-authority".to_string(), destination.to_string());
        headers.insert("Padding".to_string(), generate_padding_header());
        if let Some(authorization) = &self.authorization {
            headers.insert("proxy-authorization".to_string(), authorization.clone());
        }
        for (key, value) in &self.extra_headers {
            headers.insert(key.clone(), value.clone());
        }
        if self.concurrency > 1 {
            let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.concurrency as u64;
            headers.insert(
                "-network-isolation-key".to_string(),
                format!("https://pool-{}:443", index),
            );
        }
        if self.quic {
            headers.insert("-force-quic".to_string(), "true".to_string());
        }
        headers
    }

    /// Opens a tunnel to `destination` (`host:port`) without waiting for the
    /// proxy's answer. Writes may be issued right away.
    pub async fn dial_early(&self, destination: &str) -> Result<NaiveConn> {
        self.dial_early_with(destination, &CancellationToken::new()).await
    }

    pub async fn dial_early_with(&self, destination: &str, cancel: &CancellationToken) -> Result<NaiveConn> {
        self.wait_running(cancel).await?;

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(StreamConn::new(self.engine.as_ref(), true, true));
        {
            let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
            // checked under the lock so teardown either sees this entry or
            // the dial sees the state change
            if self.state.load(Ordering::Acquire) != STATE_RUNNING {
                drop(conns);
                let _ = stream.close();
                return Err(Error::Closed);
            }
            conns.insert(
                id,
                Tracked {
                    conn: Arc::downgrade(&stream),
                    _token: self.active.token(),
                },
            );
        }

        let headers = self.request_headers(destination);
        if let Err(e) = stream.start("CONNECT", &self.server_url, &headers, 0, false) {
            self.untrack(id);
            let _ = stream.close();
            return Err(e);
        }
        debug!(destination, conn_id = id, "tunnel requested");

        let conn = NaiveConn::from_shared(stream);
        let conns = Arc::downgrade(&self.conns);
        conn.set_on_close(move || {
            if let Some(conns) = conns.upgrade() {
                conns.write().unwrap_or_else(|e| e.into_inner()).remove(&id);
            }
        });
        Ok(conn)
    }

    /// Opens a tunnel and waits until the proxy accepted it.
    pub async fn dial(&self, destination: &str) -> Result<NaiveConn> {
        self.dial_context(destination, &CancellationToken::new()).await
    }

    /// Like [`dial`](Self::dial), giving up when `cancel` fires.
    pub async fn dial_context(&self, destination: &str, cancel: &CancellationToken) -> Result<NaiveConn> {
        let conn = self.dial_early_with(destination, cancel).await?;
        if let Err(e) = conn.handshake_with(cancel).await {
            let _ = conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    /// Datagram relaying is not offered by the proxy protocol.
    pub async fn listen_packet(&self, destination: &str) -> Result<NaiveConn> {
        Err(Error::Invalid(format!(
            "UDP relay to {} is not supported over naive tunnels",
            destination
        )))
    }

    fn untrack(&self, id: u64) {
        self.conns.write().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }

    /// Closes every connection, waits for background work and releases the
    /// engine. Only the first call does the work; the others return
    /// [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_CREATED => {
                    if self
                        .state
                        .compare_exchange(STATE_CREATED, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.cancel.cancel();
                        self.started.set();
                        return Ok(());
                    }
                }
                STATE_STARTING => self.started.wait().await,
                STATE_RUNNING => {
                    if self
                        .state
                        .compare_exchange(STATE_RUNNING, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.teardown().await;
                        return Ok(());
                    }
                }
                _ => return Err(Error::Closed),
            }
        }
    }

    async fn teardown(&self) {
        self.cancel.cancel();

        let tracked: Vec<Tracked> = {
            let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
            conns.drain().map(|(_, tracked)| tracked).collect()
        };
        debug!(connections = tracked.len(), "closing tracked connections");
        for entry in &tracked {
            if let Some(conn) = entry.conn.upgrade() {
                let _ = conn.close();
            }
        }
        drop(tracked);

        self.proxy_tasks.close();
        self.proxy_tasks.wait().await;
        self.active.close();
        self.active.wait().await;

        self.engine.set_dialer(None);
        self.engine.set_udp_dialer(None);
        self.engine.shutdown();
        self.engine.destroy();
        self.state.store(STATE_CLOSED, Ordering::Release);
        info!("client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::testing::StaticResolver;
    use crate::engine::mock::MockEngine;
    use std::time::Duration;

    fn config() -> NaiveClientConfig {
        NaiveClientConfig {
            server_address: "192.0.2.10:443".to_string(),
            server_name: Some("proxy.example".to_string()),
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            dns_resolver: Some(Arc::new(StaticResolver::default())),
            ..Default::default()
        }
    }

    fn client_with(config: NaiveClientConfig) -> (NaiveClient, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::default());
        let client = NaiveClient::new(config, engine.clone()).unwrap();
        (client, engine)
    }

    #[test]
    fn test_config_validation() {
        let engine: Arc<dyn Engine> = Arc::new(MockEngine::default());
        let mut missing_resolver = config();
        missing_resolver.dns_resolver = None;
        assert!(matches!(
            NaiveClient::new(missing_resolver, engine.clone()),
            Err(Error::Config(_))
        ));

        let mut bad_address = config();
        bad_address.server_address = "proxy.example".to_string();
        assert!(matches!(NaiveClient::new(bad_address, engine.clone()), Err(Error::Config(_))));

        let mut no_name = config();
        no_name.server_name = None;
        let client = NaiveClient::new(no_name, engine).unwrap();
        assert_eq!(client.server_name(), "192.0.2.10");
        assert_eq!(client.concurrency, 1);
    }

    #[test]
    fn test_congestion_control_tags() {
        assert_eq!("bbr".parse::<QuicCongestionControl>().unwrap().connection_option(), Some("TBBR"));
        assert_eq!("BBR2".parse::<QuicCongestionControl>().unwrap().connection_option(), Some("B2ON"));
        assert_eq!("cubic".parse::<QuicCongestionControl>().unwrap().connection_option(), Some("QBIC"));
        assert_eq!("reno".parse::<QuicCongestionControl>().unwrap().connection_option(), Some("RENO"));
        assert_eq!(QuicCongestionControl::Default.connection_option(), None);
        assert!("vegas".parse::<QuicCongestionControl>().is_err());
    }

    #[tokio::test]
    async fn test_start_configures_engine() {
        let mut config = config();
        config.ech_enabled = true;
        config.quic = true;
        config.quic_congestion_control = QuicCongestionControl::Cubic;
        let (client, engine) = client_with(config);
        client.start().unwrap();

        let params = engine.params.lock().unwrap().clone().unwrap();
        assert_eq!(params.dns_server_override(), vec![INTERNAL_DNS_ADDRESS]);
        assert!(params.use_dns_https_svcb());
        assert!(params.enable_quic);
        assert!(!params.enable_http2);
        assert_eq!(params.quic_hints[0].host, "proxy.example");
        assert_eq!(
            params.experimental_option("QUIC").unwrap()["connection_options"],
            serde_json::json!("QBIC")
        );
        assert!(params.experimental_option("HTTP2Options").is_none());
        assert_eq!(
            params.experimental_option("SocketPoolOptions").unwrap()["max_sockets_per_pool"],
            serde_json::json!(MAX_SOCKETS_PER_POOL)
        );
        assert!(engine.dialer.lock().unwrap().is_some());
        assert!(engine.udp_dialer.lock().unwrap().is_some());

        assert!(matches!(client.start(), Err(Error::AlreadyStarted)));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_sets_http2_windows() {
        let (client, engine) = client_with(config());
        client.start().unwrap();

        let params = engine.params.lock().unwrap().clone().unwrap();
        assert!(params.enable_http2);
        let http2 = params.experimental_option("HTTP2Options").unwrap();
        assert_eq!(http2["connection_window_size"], serde_json::json!(128 * 1024 * 1024));
        assert_eq!(http2["stream_window_size"], serde_json::json!(64 * 1024 * 1024));
        assert_eq!(
            params.experimental_option("SocketPoolOptions").unwrap()["max_sockets_per_group"],
            serde_json::json!(MAX_SOCKETS_PER_GROUP)
        );
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back() {
        let (client, engine) = client_with(config());
        engine.fail_start.store(true, Ordering::SeqCst);
        assert!(client.start().is_err());
        assert_eq!(engine.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(engine.destroys.load(Ordering::SeqCst), 1);
        assert!(matches!(client.start(), Err(Error::Closed)));
        assert!(matches!(client.dial_early("example.com:80").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_bad_pin_fails_start() {
        let mut config = config();
        config.certificate_public_key_sha256 = vec![vec![0u8; 16]];
        let (client, _engine) = client_with(config);
        assert!(matches!(client.start(), Err(Error::Tls(_))));
    }

    #[tokio::test]
    async fn test_connect_request_headers() {
        let mut config = config();
        config.insecure_concurrency = 2;
        config.extra_headers.insert("x-extra".to_string(), "1".to_string());
        let (client, engine) = client_with(config);
        client.start().unwrap();

        let _first = client.dial_early("example.com:80").await.unwrap();
        let _second = client.dial_early("example.com:80").await.unwrap();
        let (method, url, headers) = engine.stream(0).start_request.lock().unwrap().clone().unwrap();
        assert_eq!(method, "CONNECT");
        assert_eq!(url, "https://proxy.example:443");
        assert_eq!(headers["-connect-authority"], "example.com:80");
        assert_eq!(headers["proxy-authorization"], "Basic dXNlcjpwYXNz");
        assert_eq!(headers["x-extra"], "1");
        assert!(!headers["Padding"].is_empty());
        assert!(!headers.contains_key("-force-quic"));

        let (_, _, second) = engine.stream(1).start_request.lock().unwrap().clone().unwrap();
        assert_ne!(headers["-network-isolation-key"], second["-network-isolation-key"]);
        assert_eq!(client.active_connections(), 2);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_waits_for_start() {
        let (client, _engine) = client_with(config());
        let client = Arc::new(client);
        let dialer = client.clone();
        let dial = tokio::spawn(async move { dialer.dial_early("example.com:80").await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dial.is_finished());
        client.start().unwrap();
        dial.await.unwrap().unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_wait_is_cancelable() {
        let (client, _engine) = client_with(config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            client.dial_early_with("example.com:80", &cancel).await,
            Err(Error::Canceled)
        ));
    }

    #[tokio::test]
    async fn test_close_before_start_unblocks_dialers() {
        let (client, engine) = client_with(config());
        let client = Arc::new(client);
        let dialer = client.clone();
        let dial = tokio::spawn(async move { dialer.dial_early("example.com:80").await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await.unwrap();
        assert!(matches!(dial.await.unwrap(), Err(Error::Closed)));
        assert!(matches!(client.start(), Err(Error::Closed)));
        assert_eq!(engine.destroys.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dial_context_rejected_handshake() {
        let (client, engine) = client_with(config());
        client.start().unwrap();
        let client = Arc::new(client);
        let dialer = client.clone();
        let dial = tokio::spawn(async move { dialer.dial("example.com:80").await.map(|_| ()) });
        loop {
            let started = engine
                .streams
                .lock()
                .unwrap()
                .first()
                .is_some_and(|s| s.start_request.lock().unwrap().is_some());
            if started {
                break;
            }
            tokio::task::yield_now().await;
        }
        engine.stream(0).respond("407");
        assert!(matches!(dial.await.unwrap(), Err(Error::Handshake(_))));
        assert_eq!(engine.stream(0).cancels.load(Ordering::SeqCst), 1);
        assert_eq!(client.active_connections(), 0);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_close_releases_tracking() {
        let (client, _engine) = client_with(config());
        client.start().unwrap();
        let conn = client.dial_early("example.com:80").await.unwrap();
        assert_eq!(client.active_connections(), 1);
        conn.close().unwrap();
        assert_eq!(client.active_connections(), 0);
        drop(conn);
        assert_eq!(client.active_connections(), 0);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_close_tears_down_once() {
        let (client, engine) = client_with(config());
        client.start().unwrap();
        let conn = client.dial_early("example.com:80").await.unwrap();
        let client = Arc::new(client);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move { client.close().await }));
        }
        let mut succeeded = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(e) => assert!(matches!(e, Error::Closed)),
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(engine.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(engine.destroys.load(Ordering::SeqCst), 1);
        assert!(engine.dialer.lock().unwrap().is_none());
        assert!(conn.stream().is_closed());
        assert!(matches!(client.dial_early("example.com:80").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_listen_packet_unsupported() {
        let (client, _engine) = client_with(config());
        assert!(matches!(client.listen_packet("example.com:53").await, Err(Error::Invalid(_))));
    }
}
