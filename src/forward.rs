//! Local TCP listener that forwards every accepted connection through a
//! naive tunnel to one fixed target.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cli::ClientArgs;
use crate::client::NaiveClient;
use crate::common::{
    build_client_config, dial_with_timeout, format_duration, load_config_or_default, relay, select_engine,
};
use crate::dialer::split_host_port;
use crate::error::{Error, Result};

/// Runs the client subcommand until SIGINT.
pub async fn run_client(args: &ClientArgs) -> Result<()> {
    let (file, config_path) = load_config_or_default(args.config.as_deref())?;
    if let Some(path) = &config_path {
        tracing::info!(path = %path.display(), "loaded config file");
    }

    let listen = args
        .listen
        .clone()
        .or_else(|| file.listen.clone())
        .ok_or_else(|| Error::Config("--listen is required".to_string()))?;
    let target = args
        .target
        .clone()
        .or_else(|| file.target.clone())
        .ok_or_else(|| Error::Config("--target is required".to_string()))?;
    if split_host_port(&target).is_none() {
        return Err(Error::Config(format!("target must be host:port, got '{}'", target)));
    }

    let config = build_client_config(&args.proxy, &file)?;
    let engine = select_engine(&args.proxy)?;
    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|e| Error::Config(format!("failed to listen on {}: {}", listen, e)))?;

    let client = Arc::new(NaiveClient::new(config, engine)?);
    client.start()?;

    tracing::info!(
        listen = %listener.local_addr()?,
        target = %target,
        server = %client.server_name(),
        handshake_timeout = %format_duration(args.proxy.handshake_timeout),
        "client listening"
    );

    let shutdown = CancellationToken::new();
    let signal = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received SIGINT, initiating graceful shutdown...");
            }
            shutdown.cancel();
        })
    };

    let result = serve(
        listener,
        client.clone(),
        target,
        args.proxy.handshake_timeout,
        shutdown,
    )
    .await;
    signal.abort();
    result
}

/// Accepts connections on `listener` and tunnels each one to `target` until
/// `shutdown` fires, then closes `client` and waits for every relay.
pub async fn serve(
    listener: TcpListener,
    client: Arc<NaiveClient>,
    target: String,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let tracker = TaskTracker::new();
    let target: Arc<str> = target.into();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        let client = client.clone();
                        let target = target.clone();
                        tracker.spawn(async move {
                            if let Err(e) = forward(stream, &client, &target, handshake_timeout).await {
                                tracing::warn!(%peer, target = %target, error = %e, "forwarding failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    drop(listener);
    // closing the client ends every tunnel, which ends the relays
    let closed = client.close().await;
    tracker.close();
    tracker.wait().await;
    tracing::info!("client shutdown complete");
    match closed {
        Ok(()) | Err(Error::Closed) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn forward(
    mut stream: TcpStream,
    client: &NaiveClient,
    target: &str,
    handshake_timeout: Duration,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let conn = dial_with_timeout(client, target, handshake_timeout).await?;
    let (up, down) = relay(&mut stream, conn).await?;
    tracing::debug!(target, up, down, "connection finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::ProxyArgs;

    #[tokio::test]
    async fn test_run_client_requires_target() {
        let args = ClientArgs {
            config: Some(std::path::PathBuf::from("/nonexistent/naive-tunnel.json")),
            listen: Some("127.0.0.1:0".to_string()),
            target: None,
            proxy: ProxyArgs::default(),
        };
        assert!(matches!(run_client(&args).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_run_client_rejects_bad_target() {
        let path = std::env::temp_dir().join(format!("naive-tunnel-forward-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"proxy": "https://proxy.example"}"#).unwrap();
        let args = ClientArgs {
            config: Some(path.clone()),
            listen: Some("127.0.0.1:0".to_string()),
            target: Some("no-port".to_string()),
            proxy: ProxyArgs::default(),
        };
        let result = run_client(&args).await;
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_run_client_refuses_without_direct() {
        let path = std::env::temp_dir().join(format!("naive-tunnel-direct-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"proxy": "https://proxy.example", "target": "example.com:22"}"#).unwrap();
        let args = ClientArgs {
            config: Some(path.clone()),
            listen: Some("127.0.0.1:0".to_string()),
            target: None,
            proxy: ProxyArgs::default(),
        };
        let result = run_client(&args).await;
        std::fs::remove_file(&path).unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("--direct"));
    }
}
