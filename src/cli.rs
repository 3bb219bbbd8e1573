//! CLI definitions for naive-tunnel.

use clap::{builder::PossibleValuesParser, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of connection pools.
pub const DEFAULT_INSECURE_CONCURRENCY: usize = 1;

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Padded CONNECT tunnels through an HTTP/2 or QUIC proxy.
#[derive(Debug, Parser)]
#[command(name = "naive-tunnel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Forward a local TCP listener to a fixed destination
    Client(ClientArgs),

    /// stdin/stdout tunnel (for SSH ProxyCommand)
    Nc(NcArgs),

    /// Show version information
    Version,
}

/// Proxy options shared by the client and nc subcommands.
#[derive(Debug, Clone, Default, Args)]
pub struct ProxyArgs {
    /// Proxy URL: <https|quic>://[<user>:<pass>@]<hostname>[:<port>]
    #[arg(long)]
    pub proxy: Option<String>,

    /// Connect to this host:port instead of the proxy URL's host
    #[arg(long)]
    pub server_address: Option<String>,

    /// Use N independent connection pools (insecure, for throughput testing)
    #[arg(long)]
    pub insecure_concurrency: Option<usize>,

    /// Extra request headers as name=value, split by CRLF
    #[arg(long)]
    pub extra_headers: Option<String>,

    /// Engine host resolver rules (e.g. "MAP proxy.example 192.0.2.1")
    #[arg(long)]
    pub host_resolver_rules: Option<String>,

    /// PEM file replacing the default trusted roots
    #[arg(long)]
    pub trusted_root: Option<PathBuf>,

    /// Server public key pin (sha256/<base64> or SHA-256 hex), repeatable
    #[arg(long = "public-key-pin")]
    pub public_key_pins: Vec<String>,

    /// Look up ECH configs through DNS HTTPS records
    #[arg(long, default_value_t = false)]
    pub ech: bool,

    /// Fixed ECH config list (base64), implies --ech
    #[arg(long)]
    pub ech_config: Option<String>,

    /// Name to query for the server's HTTPS record
    #[arg(long)]
    pub ech_query_server_name: Option<String>,

    /// QUIC congestion control
    #[arg(long, value_parser = PossibleValuesParser::new(["default", "bbr", "bbr2", "cubic", "reno"]))]
    pub quic_congestion_control: Option<String>,

    /// Time allowed for the proxy to accept a tunnel
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub handshake_timeout: Duration,

    /// Run on the in-process engine, which dials destinations directly and
    /// never contacts the proxy
    #[arg(long, default_value_t = false)]
    pub direct: bool,
}

/// Arguments for the client subcommand.
#[derive(Debug, Parser)]
pub struct ClientArgs {
    /// JSON configuration file (defaults to the per-user location if present)
    pub config: Option<PathBuf>,

    /// Local TCP listen address (e.g., 127.0.0.1:2222)
    #[arg(long)]
    pub listen: Option<String>,

    /// Destination every accepted connection is tunneled to (host:port)
    #[arg(long)]
    pub target: Option<String>,

    #[command(flatten)]
    pub proxy: ProxyArgs,
}

/// Arguments for the nc subcommand.
#[derive(Debug, Parser)]
pub struct NcArgs {
    /// Destination host:port
    pub destination: String,

    #[command(flatten)]
    pub proxy: ProxyArgs,
}

/// Returns the default configuration file path.
///
/// - root (UID=0): `/etc/naive-tunnel/config.json`
/// - others: `~/.naive-tunnel/config.json`
pub fn default_config_path() -> PathBuf {
    let dir = if is_root() {
        PathBuf::from("/etc/naive-tunnel")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".naive-tunnel")
    };
    dir.join("config.json")
}

/// Check if running as root.
fn is_root() -> bool {
    #[cfg(unix)]
    {
        // SAFETY: getuid() has no preconditions and always succeeds.
        unsafe { libc::getuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Build information for version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("NAIVE_TUNNEL_COMMIT").unwrap_or("unknown"),
            built: option_env!("NAIVE_TUNNEL_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self, engine_version: &str) -> String {
        format!(
            "naive-tunnel version {}\n  commit: {}\n  built:  {}\n  engine: {}",
            self.version, self.commit, self.built, engine_version
        )
    }
}
