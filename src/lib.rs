//! naive-tunnel - Padded CONNECT tunnels through an HTTP/2 or QUIC proxy.
//!
//! This crate drives a bidirectional-stream engine to open authenticated
//! CONNECT tunnels, applies the naive padding protocol to the first frames
//! of every tunnel, and serves the engine's DNS and outbound sockets from
//! in-process components.

pub mod cli;
pub mod client;
pub mod common;
pub mod dialer;
pub mod dns;
pub mod engine;
pub mod error;
pub mod forward;
pub mod naive_conn;
pub mod nc;
pub mod net_error;
pub mod padding;
pub mod signal;
pub mod stream_conn;
pub mod tls;

pub use cli::{default_config_path, BuildInfo, Cli, ClientArgs, Command, NcArgs, ProxyArgs};
pub use client::{NaiveClient, NaiveClientConfig, QuicCongestionControl};
pub use common::{
    build_client_config, dial_with_timeout, format_duration, load_config, parse_extra_headers, relay,
    FileConfig, ProxyUrl,
};
pub use dialer::{AsyncStream, Connection, Dialer, PacketConn, PacketConnection, SystemDialer};
pub use dns::{Resolver, UpstreamResolver, INTERNAL_DNS_ADDRESS};
pub use engine::{
    BidirectionalStream, Engine, EngineParams, HeaderMap, LoopbackEngine, StreamCallback,
};
pub use error::{Error, ExitCode, Result};
pub use forward::run_client;
pub use naive_conn::{NaiveConn, NaiveStream};
pub use nc::run_nc;
pub use net_error::NetError;
pub use padding::{generate_padding_header, PaddingCodec};
pub use signal::Signal;
pub use stream_conn::StreamConn;
pub use tls::{
    compute_public_key_pin, format_public_key_pin, load_trusted_roots, parse_public_key_pin,
    validate_trusted_roots, TlsError, TlsResult,
};
