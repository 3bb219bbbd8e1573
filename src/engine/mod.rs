//! Interface to the bidirectional-stream engine.
//!
//! The engine owns the HTTP/2 and QUIC machinery. This crate only talks to
//! it through the narrow surface below: start and stop the engine, install
//! dialer callbacks, and create streams whose progress is reported back
//! through a [`StreamCallback`].
//!
//! Callbacks run on a thread owned by the engine. They must never block.

pub mod loopback;
#[cfg(test)]
pub(crate) mod mock;
pub mod registry;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::net_error::NetError;

pub use loopback::LoopbackEngine;
pub use registry::{HandleTable, StreamDispatcher, StreamHandle};

/// Request or response header block.
pub type HeaderMap = BTreeMap<String, String>;

/// TCP dialer callback: returns a connected stream socket for `address:port`.
pub type TcpDialer = Arc<dyn Fn(&str, u16) -> std::result::Result<OwnedFd, NetError> + Send + Sync>;

/// UDP dialer callback: returns a connected datagram socket and the local
/// address it is bound to.
pub type UdpDialer =
    Arc<dyn Fn(&str, u16) -> std::result::Result<(OwnedFd, SocketAddr), NetError> + Send + Sync>;

/// Notifications for a single bidirectional stream.
pub trait StreamCallback: Send + Sync {
    fn on_stream_ready(&self);
    fn on_response_headers_received(&self, headers: HeaderMap, negotiated_protocol: &str);
    /// `buffer` is the buffer handed to [`BidirectionalStream::read`]; the
    /// first `bytes_read` bytes are valid. Zero means end of stream.
    fn on_read_completed(&self, buffer: BytesMut, bytes_read: usize);
    fn on_write_completed(&self);
    fn on_response_trailers_received(&self, trailers: HeaderMap);
    fn on_succeeded(&self);
    fn on_failed(&self, error: NetError);
    fn on_canceled(&self);
}

/// A single request/response exchange supporting concurrent read and write.
///
/// At most one read and one write may be outstanding at a time; the next
/// one may only be issued after the previous completion callback fired.
/// Operations return `false` when the engine rejects the call.
pub trait BidirectionalStream: Send + Sync {
    fn start(
        &self,
        method: &str,
        url: &str,
        headers: &HeaderMap,
        priority: i32,
        end_of_stream: bool,
    ) -> bool;
    /// Reads into `buffer[..buffer.len()]`.
    fn read(&self, buffer: BytesMut) -> bool;
    fn write(&self, data: Bytes, end_of_stream: bool) -> bool;
    fn flush(&self);
    fn cancel(&self);
    /// Releases the native stream. No callback is delivered afterwards.
    fn destroy(&self);
}

/// Engine lifecycle and configuration.
pub trait Engine: Send + Sync {
    fn version(&self) -> String;
    /// Replaces the default trust store with the given PEM roots.
    fn set_trusted_root_certificates(&self, pem: &str) -> bool;
    /// Pins server certificates to SPKI SHA-256 hashes.
    fn set_cert_verifier_with_public_key_sha256(&self, hashes: &[Vec<u8>]) -> bool;
    /// Installs or, with `None`, removes the TCP dialer.
    fn set_dialer(&self, dialer: Option<TcpDialer>);
    /// Installs or, with `None`, removes the UDP dialer.
    fn set_udp_dialer(&self, dialer: Option<UdpDialer>);
    fn start(&self, params: &EngineParams) -> Result<()>;
    fn create_stream(&self, callback: Arc<dyn StreamCallback>) -> Box<dyn BidirectionalStream>;
    fn shutdown(&self);
    fn destroy(&self);
}

/// Alternate-protocol hint for a host that is known to speak QUIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicHint {
    pub host: String,
    pub port: u16,
    pub alternate_port: u16,
}

/// Parameters applied when the engine starts.
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub enable_http2: bool,
    pub enable_quic: bool,
    pub quic_hints: Vec<QuicHint>,
    pub user_agent: Option<String>,
    experimental_options: Map<String, Value>,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            enable_http2: true,
            enable_quic: false,
            quic_hints: Vec::new(),
            user_agent: None,
            experimental_options: Map::new(),
        }
    }
}

impl EngineParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one experimental option. `None` removes the key.
    pub fn set_experimental_option(&mut self, key: &str, value: Option<Value>) {
        match value {
            Some(value) => {
                self.experimental_options.insert(key.to_string(), value);
            }
            None => {
                self.experimental_options.remove(key);
            }
        }
    }

    pub fn experimental_option(&self, key: &str) -> Option<&Value> {
        self.experimental_options.get(key)
    }

    /// The merged options as the JSON blob handed to the engine.
    pub fn experimental_options_json(&self) -> String {
        Value::Object(self.experimental_options.clone()).to_string()
    }

    /// Replaces all experimental options with a JSON object.
    pub fn set_experimental_options_json(&mut self, options: &str) -> Result<()> {
        let options = options.trim();
        if options.is_empty() {
            self.experimental_options.clear();
            return Ok(());
        }
        match serde_json::from_str::<Value>(options) {
            Ok(Value::Object(map)) => {
                self.experimental_options = map;
                Ok(())
            }
            Ok(_) => Err(Error::Config(
                "experimental options must be a JSON object".to_string(),
            )),
            Err(e) => Err(Error::Config(format!("invalid experimental options: {}", e))),
        }
    }

    pub fn set_async_dns(&mut self, enable: bool) {
        let value = enable.then(|| json!({ "enable": true }));
        self.set_experimental_option("AsyncDNS", value);
    }

    /// Points the built-in DNS client exclusively at `nameservers`.
    ///
    /// Entries must be IP socket addresses. An empty list removes the override.
    pub fn set_dns_server_override(&mut self, nameservers: &[String]) -> Result<()> {
        if nameservers.is_empty() {
            self.set_experimental_option("DnsServerOverride", None);
            return Ok(());
        }
        for nameserver in nameservers {
            nameserver.parse::<SocketAddr>().map_err(|_| {
                Error::Config(format!("nameserver must be ip:port, got '{}'", nameserver))
            })?;
        }
        self.set_experimental_option(
            "DnsServerOverride",
            Some(json!({ "nameservers": nameservers })),
        );
        Ok(())
    }

    /// Sets resolver rules such as `MAP host 1.2.3.4, EXCLUDE other`.
    pub fn set_host_resolver_rules(&mut self, rules: &str) {
        let value = (!rules.is_empty()).then(|| json!({ "host_resolver_rules": rules }));
        self.set_experimental_option("HostResolverRules", value);
    }

    /// Enables HTTPS (SVCB) record lookups, needed for ECH.
    pub fn set_use_dns_https_svcb(&mut self, enable: bool) {
        self.set_experimental_option("UseDnsHttpsSvcb", Some(json!({ "enable": enable })));
    }

    pub fn set_socket_pool_options(&mut self, max_sockets_per_pool: u32, max_sockets_per_group: u32) {
        self.set_experimental_option(
            "SocketPoolOptions",
            Some(json!({
                "max_sockets_per_pool": max_sockets_per_pool,
                "max_sockets_per_group": max_sockets_per_group,
            })),
        );
    }

    pub fn set_http2_options(&mut self, connection_window_size: u32, stream_window_size: u32) {
        self.set_experimental_option(
            "HTTP2Options",
            Some(json!({
                "connection_window_size": connection_window_size,
                "stream_window_size": stream_window_size,
            })),
        );
    }

    /// Sets QUIC connection option tags, e.g. a congestion control tag.
    pub fn set_quic_connection_options(&mut self, options: &str) {
        let value = (!options.is_empty()).then(|| json!({ "connection_options": options }));
        self.set_experimental_option("QUIC", value);
    }

    /// Nameservers from `DnsServerOverride`, if set.
    pub fn dns_server_override(&self) -> Vec<SocketAddr> {
        self.experimental_options
            .get("DnsServerOverride")
            .and_then(|v| v.get("nameservers"))
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rules from `HostResolverRules`, if set.
    pub fn host_resolver_rules(&self) -> Option<&str> {
        self.experimental_options
            .get("HostResolverRules")
            .and_then(|v| v.get("host_resolver_rules"))
            .and_then(Value::as_str)
    }

    pub fn use_dns_https_svcb(&self) -> bool {
        self.experimental_options
            .get("UseDnsHttpsSvcb")
            .and_then(|v| v.get("enable"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experimental_option_merge_and_delete() {
        let mut params = EngineParams::new();
        params.set_async_dns(true);
        params.set_host_resolver_rules("MAP example.com 1.2.3.4");
        let parsed: Value = serde_json::from_str(&params.experimental_options_json()).unwrap();
        assert_eq!(parsed["AsyncDNS"]["enable"], json!(true));
        assert_eq!(
            parsed["HostResolverRules"]["host_resolver_rules"],
            json!("MAP example.com 1.2.3.4")
        );

        params.set_async_dns(false);
        params.set_host_resolver_rules("");
        assert_eq!(params.experimental_options_json(), "{}");
    }

    #[test]
    fn test_dns_server_override_validation() {
        let mut params = EngineParams::new();
        assert!(params
            .set_dns_server_override(&["not-an-ip:53".to_string()])
            .is_err());

        params
            .set_dns_server_override(&["127.0.0.1:53".to_string(), "[::1]:5353".to_string()])
            .unwrap();
        assert_eq!(params.dns_server_override().len(), 2);

        params.set_dns_server_override(&[]).unwrap();
        assert!(params.dns_server_override().is_empty());
        assert!(params.experimental_option("DnsServerOverride").is_none());
    }

    #[test]
    fn test_set_experimental_options_json() {
        let mut params = EngineParams::new();
        params
            .set_experimental_options_json(r#"{"UseDnsHttpsSvcb":{"enable":true}}"#)
            .unwrap();
        assert!(params.use_dns_https_svcb());

        assert!(params.set_experimental_options_json("[1,2]").is_err());
        assert!(params.set_experimental_options_json("{").is_err());

        params.set_experimental_options_json("  ").unwrap();
        assert_eq!(params.experimental_options_json(), "{}");
    }

    #[test]
    fn test_pool_http2_quic_options() {
        let mut params = EngineParams::new();
        params.set_socket_pool_options(256, 64);
        params.set_http2_options(1 << 24, 1 << 23);
        params.set_quic_connection_options("TBBR");
        assert_eq!(
            params.experimental_option("SocketPoolOptions").unwrap()["max_sockets_per_group"],
            json!(64)
        );
        assert_eq!(
            params.experimental_option("HTTP2Options").unwrap()["stream_window_size"],
            json!(1 << 23)
        );
        assert_eq!(
            params.experimental_option("QUIC").unwrap()["connection_options"],
            json!("TBBR")
        );
    }
}
