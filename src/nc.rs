//! stdin/stdout tunnel for SSH ProxyCommand.

use crate::cli::NcArgs;
use crate::client::NaiveClient;
use crate::common::{build_client_config, dial_with_timeout, relay, select_engine, FileConfig};
use crate::dialer::split_host_port;
use crate::error::{Error, Result};

/// Tunnels stdin/stdout to `args.destination` and returns once either side
/// finishes.
pub async fn run_nc(args: &NcArgs) -> Result<()> {
    if split_host_port(&args.destination).is_none() {
        return Err(Error::Config(format!(
            "destination must be host:port, got '{}'",
            args.destination
        )));
    }

    let config = build_client_config(&args.proxy, &FileConfig::default())?;
    let client = NaiveClient::new(config, select_engine(&args.proxy)?)?;
    client.start()?;

    let result = tunnel_stdio(&client, args).await;
    let _ = client.close().await;
    result
}

async fn tunnel_stdio(client: &NaiveClient, args: &NcArgs) -> Result<()> {
    let conn = dial_with_timeout(client, &args.destination, args.proxy.handshake_timeout).await?;
    tracing::debug!(destination = %args.destination, "tunnel established");

    let mut stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    let (up, down) = relay(&mut stdio, conn).await?;
    tracing::debug!(up, down, "nc relay finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::ProxyArgs;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_nc_rejects_bad_destination() {
        let args = NcArgs {
            destination: "example.com".to_string(),
            proxy: ProxyArgs {
                proxy: Some("https://proxy.example".to_string()),
                handshake_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        };
        assert!(matches!(run_nc(&args).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_run_nc_requires_proxy() {
        let args = NcArgs {
            destination: "example.com:22".to_string(),
            proxy: ProxyArgs::default(),
        };
        let err = run_nc(&args).await.unwrap_err();
        assert_eq!(err.exit_code(), crate::error::ExitCode::ConfigInvalid);
    }

    #[tokio::test]
    async fn test_run_nc_refuses_without_direct() {
        let args = NcArgs {
            destination: "example.com:22".to_string(),
            proxy: ProxyArgs {
                proxy: Some("https://proxy.example".to_string()),
                handshake_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        };
        let err = run_nc(&args).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("--direct"));
    }
}
