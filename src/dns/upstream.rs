//! Base resolver backed by the system's DNS configuration.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_resolver::name_server::TokioConnectionProvider;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{reply_to, Resolver};
use crate::error::{Error, Result};

type TokioResolver = hickory_resolver::Resolver<TokioConnectionProvider>;

/// Forwards queries to the nameservers of the host system.
///
/// The underlying resolver is created on first use and reused afterwards.
pub struct UpstreamResolver {
    resolver: Mutex<Option<TokioResolver>>,
}

impl UpstreamResolver {
    pub fn new() -> Self {
        Self {
            resolver: Mutex::new(None),
        }
    }

    async fn with_resolver<T>(&self, f: impl FnOnce(&TokioResolver) -> T) -> Result<T> {
        let mut guard = self.resolver.lock().await;
        if guard.is_none() {
            let resolver = TokioResolver::builder_tokio()
                .map_err(|e| Error::Dns(format!("failed to create DNS resolver: {}", e)))?
                .build();
            *guard = Some(resolver);
        }
        match guard.as_ref() {
            Some(resolver) => Ok(f(resolver)),
            None => Err(Error::Dns("DNS resolver unavailable".to_string())),
        }
    }

    /// Resolves `host` to a socket address. IP literals are returned as is.
    pub async fn resolve_host(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let lookup = self.with_resolver(|r| r.clone()).await?;
        let response = lookup
            .lookup_ip(host)
            .await
            .map_err(|e| Error::Dns(format!("failed to resolve '{}': {}", host, e)))?;

        response
            .iter()
            .next()
            .map(|ip| SocketAddr::new(ip, port))
            .ok_or_else(|| Error::Dns(format!("no addresses found for '{}'", host)))
    }
}

impl Default for UpstreamResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for UpstreamResolver {
    async fn resolve(&self, request: &Message) -> Option<Message> {
        let query = request.queries().first()?.clone();
        let resolver = match self.with_resolver(|r| r.clone()).await {
            Ok(resolver) => resolver,
            Err(e) => {
                debug!(error = %e, "upstream resolver unavailable");
                return None;
            }
        };

        let mut response = reply_to(request);
        match resolver.lookup(query.name().clone(), query.query_type()).await {
            Ok(lookup) => {
                trace!(name = %query.name(), records = lookup.records().len(), "upstream answer");
                response.add_answers(lookup.records().iter().cloned());
            }
            Err(e) if e.is_nx_domain() => {
                response.set_response_code(ResponseCode::NXDomain);
            }
            Err(e) if e.is_no_records_found() => {}
            Err(e) => {
                debug!(name = %query.name(), error = %e, "upstream lookup failed");
                return None;
            }
        }
        Some(response)
    }
}
