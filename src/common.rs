//! Common types and functions shared by the client and nc subcommands.
//!
//! Turns command-line flags and the optional JSON configuration file into a
//! [`NaiveClientConfig`], and carries the helpers both runners use to dial
//! and relay.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::cli::{default_config_path, ProxyArgs, DEFAULT_INSECURE_CONCURRENCY};
use crate::client::{NaiveClient, NaiveClientConfig, QuicCongestionControl};
use crate::dialer::{host_port, SystemDialer};
use crate::dns::UpstreamResolver;
use crate::engine::{Engine, HeaderMap, LoopbackEngine};
use crate::error::{Error, Result};
use crate::naive_conn::NaiveConn;
use crate::net_error::NetError;
use crate::tls;

/// Port used when the proxy URL has none.
pub const DEFAULT_PROXY_PORT: u16 = 443;

/// A parsed `--proxy` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyUrl {
    pub quic: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyUrl {
    /// Parses `<https|quic>://[<user>:<pass>@]<hostname>[:<port>]`.
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("proxy URL '{}' has no scheme", s)))?;
        let quic = match scheme.to_ascii_lowercase().as_str() {
            "https" => false,
            "quic" => true,
            other => {
                return Err(Error::Config(format!(
                    "unsupported proxy scheme '{}', expected https or quic",
                    other
                )))
            }
        };

        let authority = rest.trim_end_matches('/');
        if authority.contains('/') {
            return Err(Error::Config(format!("proxy URL '{}' must not have a path", s)));
        }
        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, authority),
        };
        let (username, password) = match userinfo {
            Some(userinfo) => match userinfo.split_once(':') {
                Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
                None => (Some(userinfo.to_string()), None),
            },
            None => (None, None),
        };

        let (host, port) = split_authority(hostport)
            .ok_or_else(|| Error::Config(format!("invalid proxy host in '{}'", s)))?;

        Ok(Self {
            quic,
            host,
            port,
            username,
            password,
        })
    }

    /// `host:port` of the proxy server.
    pub fn server_address(&self) -> String {
        host_port(&self.host, self.port)
    }
}

/// Splits `host[:port]`, defaulting the port.
fn split_authority(hostport: &str) -> Option<(String, u16)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => DEFAULT_PROXY_PORT,
            None => return None,
        };
        return (!host.is_empty()).then(|| (host.to_string(), port));
    }
    let (host, port) = match hostport.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (hostport, DEFAULT_PROXY_PORT),
    };
    if host.is_empty() || host.contains(':') {
        return None;
    }
    Some((host.to_string(), port))
}

/// Parses extra headers given as CRLF-separated `name=value` entries.
pub fn parse_extra_headers(s: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for entry in s.split("\r\n").filter(|entry| !entry.is_empty()) {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("invalid extra header '{}'", entry)))?;
        if name.is_empty() {
            return Err(Error::Config(format!("empty header name in '{}'", entry)));
        }
        headers.insert(name.to_string(), value.to_string());
    }
    Ok(headers)
}

/// JSON configuration file. Every field is optional; flags take precedence.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub target: Option<String>,
    pub proxy: Option<String>,
    pub server_address: Option<String>,
    pub insecure_concurrency: Option<usize>,
    pub extra_headers: Option<String>,
    pub host_resolver_rules: Option<String>,
    pub trusted_root: Option<PathBuf>,
    #[serde(default)]
    pub public_key_pins: Vec<String>,
    #[serde(default)]
    pub ech: bool,
    pub ech_config: Option<String>,
    pub ech_query_server_name: Option<String>,
    pub quic_congestion_control: Option<QuicCongestionControl>,
}

/// Loads a configuration file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read config file {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse config file {}: {}", path.display(), e)))
}

/// Loads `path` if given, else the default configuration file if present.
pub fn load_config_or_default(path: Option<&Path>) -> Result<(FileConfig, Option<PathBuf>)> {
    if let Some(path) = path {
        return Ok((load_config(path)?, Some(path.to_path_buf())));
    }
    let default = default_config_path();
    if default.exists() {
        tracing::debug!(path = %default.display(), "using default config file");
        return Ok((load_config(&default)?, Some(default)));
    }
    Ok((FileConfig::default(), None))
}

/// Builds the client configuration from flags layered over `file`.
pub fn build_client_config(args: &ProxyArgs, file: &FileConfig) -> Result<NaiveClientConfig> {
    let proxy = args
        .proxy
        .as_deref()
        .or(file.proxy.as_deref())
        .ok_or_else(|| Error::Config("--proxy is required".to_string()))?;
    let proxy = ProxyUrl::parse(proxy)?;

    let server_address = args
        .server_address
        .clone()
        .or_else(|| file.server_address.clone())
        .unwrap_or_else(|| proxy.server_address());

    let extra_headers = match args.extra_headers.as_deref().or(file.extra_headers.as_deref()) {
        Some(s) => parse_extra_headers(s)?,
        None => HeaderMap::new(),
    };

    let trusted_root_certificates = match args.trusted_root.as_deref().or(file.trusted_root.as_deref()) {
        Some(path) => Some(tls::load_trusted_roots(path)?),
        None => None,
    };

    let pins = if args.public_key_pins.is_empty() {
        &file.public_key_pins
    } else {
        &args.public_key_pins
    };
    let certificate_public_key_sha256 = pins
        .iter()
        .map(|pin| tls::parse_public_key_pin(pin).map(|pin| pin.to_vec()))
        .collect::<tls::TlsResult<Vec<_>>>()?;

    let ech_config_list = match args.ech_config.as_deref().or(file.ech_config.as_deref()) {
        Some(encoded) => Some(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| Error::Config(format!("invalid ECH config: {}", e)))?,
        ),
        None => None,
    };

    let quic_congestion_control = match args.quic_congestion_control.as_deref() {
        Some(name) => name.parse()?,
        None => file.quic_congestion_control.unwrap_or_default(),
    };

    Ok(NaiveClientConfig {
        server_address,
        server_name: Some(proxy.host.clone()),
        username: proxy.username.clone(),
        password: proxy.password.clone(),
        insecure_concurrency: args
            .insecure_concurrency
            .or(file.insecure_concurrency)
            .unwrap_or(DEFAULT_INSECURE_CONCURRENCY),
        extra_headers,
        trusted_root_certificates,
        certificate_public_key_sha256,
        host_resolver_rules: args
            .host_resolver_rules
            .clone()
            .or_else(|| file.host_resolver_rules.clone()),
        dns_resolver: Some(Arc::new(UpstreamResolver::new())),
        ech_enabled: args.ech || file.ech || ech_config_list.is_some(),
        ech_config_list,
        ech_query_server_name: args
            .ech_query_server_name
            .clone()
            .or_else(|| file.ech_query_server_name.clone()),
        quic: proxy.quic,
        quic_congestion_control,
        dialer: Some(Arc::new(SystemDialer)),
    })
}

/// Picks the engine the runners drive.
///
/// The only engine linked into this binary is [`LoopbackEngine`], which
/// dials destinations itself. Running on it needs an explicit `--direct`.
pub fn select_engine(args: &ProxyArgs) -> Result<Arc<dyn Engine>> {
    if !args.direct {
        return Err(Error::Config(
            "no proxy engine is linked into this build; pass --direct to dial destinations without the proxy"
                .to_string(),
        ));
    }
    tracing::warn!("--direct: connections bypass the proxy and go straight to their destinations");
    Ok(Arc::new(LoopbackEngine::default()))
}

/// Dials `destination`, giving up after `timeout`.
pub async fn dial_with_timeout(
    client: &NaiveClient,
    destination: &str,
    timeout: Duration,
) -> Result<NaiveConn> {
    let cancel = CancellationToken::new();
    let timer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    };
    let result = client.dial_context(destination, &cancel).await;
    timer.abort();
    match result {
        Err(Error::Canceled) if cancel.is_cancelled() => {
            Err(Error::Network(NetError::CONNECTION_TIMED_OUT))
        }
        other => other,
    }
}

/// Copies bytes both ways between `local` and an established tunnel until
/// either side finishes. Returns `(uplink, downlink)` byte counts.
pub async fn relay<S>(local: &mut S, conn: NaiveConn) -> Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let conn = Arc::new(conn);
    let mut remote = conn.clone().into_stream();
    let result = tokio::io::copy_bidirectional(local, &mut remote).await;
    let _ = conn.close();
    match result {
        Ok(counts) => Ok(counts),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok((0, 0)),
        Err(e) => Err(e.into()),
    }
}

/// Formats a duration in a human-readable format similar to Go's duration format.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let nanos = d.subsec_nanos();

    if secs == 0 && nanos == 0 {
        return "0s".to_string();
    }

    let mut result = String::new();

    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs_remainder = secs % 60;

    if hours > 0 {
        result.push_str(&format!("{}h", hours));
    }
    if mins > 0 {
        result.push_str(&format!("{}m", mins));
    }
    if secs_remainder > 0 {
        result.push_str(&format!("{}s", secs_remainder));
    } else if hours == 0 && mins == 0 {
        let ms = nanos / 1_000_000;
        if ms > 0 {
            result.push_str(&format!("{}ms", ms));
        }
    }

    if result.is_empty() {
        "0s".to_string()
    } else {
        result
    }
}
