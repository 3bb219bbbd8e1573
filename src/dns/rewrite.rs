//! Resolver wrappers that steer the engine's lookups of the proxy server.
//!
//! A and AAAA queries for the server name resolve to the configured server
//! address ([`ServerRedirectResolver`]). HTTPS queries for the server name
//! get the ECH config injected and IP hints removed ([`EchResolver`]).

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::svcb::{Alpn, EchConfigList, SvcParamKey, SvcParamValue, SVCB};
use hickory_proto::rr::rdata::{A, AAAA, HTTPS};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tracing::debug;

use super::{reply_to, Resolver};

/// TTL of synthesized records.
pub const SYNTHETIC_TTL: u32 = 300;

fn trim_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// Splits `_port._https.host` into `("_port", "host")`.
fn split_service_name(name: &str) -> Option<(&str, &str)> {
    if !name.starts_with('_') {
        return None;
    }
    name.split_once("._https.")
}

fn fqdn(name: &str) -> String {
    format!("{}.", trim_dot(name))
}

fn parse_name(name: &str) -> Option<Name> {
    Name::from_str(&fqdn(name)).ok()
}

/// True if `query_name` is `server_name` or `_port._https.server_name`.
pub fn matches_server_name(query_name: &str, server_name: &str) -> bool {
    let query_name = trim_dot(query_name);
    let server_name = trim_dot(server_name);
    if query_name.eq_ignore_ascii_case(server_name) {
        return true;
    }
    match split_service_name(query_name) {
        Some((_, host)) => host.eq_ignore_ascii_case(server_name),
        None => false,
    }
}

/// Rewrites `from` to `to` in an HTTPS query name, keeping any
/// `_port._https.` prefix. Always returns a fully qualified name.
pub fn rewrite_https_query_name(query_name: &str, from: &str, to: &str) -> String {
    let query_name = trim_dot(query_name);
    let from = trim_dot(from);
    let to = trim_dot(to);

    if let Some((prefix, host)) = split_service_name(query_name) {
        if host.eq_ignore_ascii_case(from) {
            return format!("{}._https.{}.", prefix, to);
        }
    }
    if query_name.eq_ignore_ascii_case(from) {
        return format!("{}.", to);
    }
    format!("{}.", query_name)
}

/// Port of a `_port._https.host` name.
pub fn parse_https_service_port(query_name: &str) -> Option<u16> {
    let (prefix, _) = split_service_name(trim_dot(query_name))?;
    match prefix[1..].parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

fn https_parts(record: &Record) -> Option<&SVCB> {
    match record.data() {
        RData::HTTPS(HTTPS(svcb)) => Some(svcb),
        _ => None,
    }
}

/// Rebuilds every HTTPS answer with `edit` applied to its target and params.
fn edit_https_answers<F>(response: &mut Message, mut edit: F)
where
    F: FnMut(&mut Record, &mut Name, &mut Vec<(SvcParamKey, SvcParamValue)>),
{
    let answers = response.take_answers();
    let answers = answers
        .into_iter()
        .map(|mut record| {
            let Some(svcb) = https_parts(&record).cloned() else {
                return record;
            };
            let mut target = svcb.target_name().clone();
            let mut params = svcb.svc_params().to_vec();
            edit(&mut record, &mut target, &mut params);
            let rdata = RData::HTTPS(HTTPS(SVCB::new(svcb.svc_priority(), target, params)));
            let mut rebuilt = Record::from_rdata(record.name().clone(), record.ttl(), rdata);
            rebuilt.set_dns_class(record.dns_class());
            rebuilt
        })
        .collect();
    response.insert_answers(answers);
}

/// Renames HTTPS answers (owner and target) from `from` back to `to`.
pub fn rewrite_https_answer_names(response: &mut Message, from: &str, to: &str) {
    let from = trim_dot(from).to_string();
    let to = trim_dot(to).to_string();
    edit_https_answers(response, |record, target, _| {
        let owner = record.name().to_ascii();
        let owner = trim_dot(&owner);
        let renamed = if owner.eq_ignore_ascii_case(&from) {
            parse_name(&to)
        } else {
            match split_service_name(owner) {
                Some((prefix, host)) if host.eq_ignore_ascii_case(&from) => {
                    parse_name(&format!("{}._https.{}", prefix, to))
                }
                _ => None,
            }
        };
        if let Some(name) = renamed {
            record.set_name(name);
        }

        let target_name = target.to_ascii();
        if trim_dot(&target_name).eq_ignore_ascii_case(&from) {
            if let Some(name) = parse_name(&to) {
                *target = name;
            }
        }
    });
}

fn set_param(params: &mut Vec<(SvcParamKey, SvcParamValue)>, key: SvcParamKey, value: SvcParamValue) {
    match params.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = value,
        None => params.push((key, value)),
    }
}

/// Puts `ech_config` into the HTTPS answers of `response`, or synthesizes
/// one when there is none.
///
/// Existing records get their ECH param replaced (and their port, for
/// `_port._https.` queries). A synthesized record has priority 1, targets
/// the host part of the query name and carries port, `alpn` and ECH.
pub fn inject_ech_config(
    request: &Message,
    response: Option<Message>,
    ech_config: &[u8],
    alpn: &[&str],
) -> Message {
    let mut response = response.unwrap_or_else(|| reply_to(request));
    let query = request.queries().first();
    let query_name = query.map(|q| q.name().to_ascii()).unwrap_or_default();
    let service_port = parse_https_service_port(&query_name);

    let ech = SvcParamValue::EchConfigList(EchConfigList(ech_config.to_vec()));
    let mut has_https = false;
    edit_https_answers(&mut response, |_, _, params| {
        has_https = true;
        set_param(params, SvcParamKey::EchConfigList, ech.clone());
        if let Some(port) = service_port {
            set_param(params, SvcParamKey::Port, SvcParamValue::Port(port));
        }
    });

    if let (false, Some(query)) = (has_https, query) {
        let target = split_service_name(trim_dot(&query_name))
            .and_then(|(_, host)| parse_name(host))
            .unwrap_or_else(|| query.name().clone());

        let mut params = Vec::new();
        if let Some(port) = service_port {
            params.push((SvcParamKey::Port, SvcParamValue::Port(port)));
        }
        params.push((
            SvcParamKey::Alpn,
            SvcParamValue::Alpn(Alpn(alpn.iter().map(|s| s.to_string()).collect())),
        ));
        params.push((SvcParamKey::EchConfigList, ech));

        response.add_answer(Record::from_rdata(
            query.name().clone(),
            SYNTHETIC_TTL,
            RData::HTTPS(HTTPS(SVCB::new(1, target, params))),
        ));
    }
    response
}

/// Drops `ipv4hint` and `ipv6hint` from every HTTPS answer.
pub fn filter_ip_hints(response: &mut Message) {
    edit_https_answers(response, |_, _, params| {
        params.retain(|(key, _)| !matches!(key, SvcParamKey::Ipv4Hint | SvcParamKey::Ipv6Hint));
    });
}

/// Renames answers owned by `from` to `to`.
pub fn rewrite_address_answer_names(response: &mut Message, from: &str, to: &str) {
    let Some(to) = parse_name(to) else { return };
    let from = trim_dot(from).to_string();
    let answers = response.take_answers();
    let answers = answers
        .into_iter()
        .map(|mut record| {
            if trim_dot(&record.name().to_ascii()).eq_ignore_ascii_case(&from) {
                record.set_name(to.clone());
            }
            record
        })
        .collect();
    response.insert_answers(answers);
}

/// Answers an A/AAAA query directly from `address`.
///
/// A query of the other family gets an empty successful reply.
pub fn synthesize_address_response(request: &Message, address: IpAddr) -> Message {
    let mut response = reply_to(request);
    let Some(query) = request.queries().first() else {
        return response;
    };
    let rdata = match (query.query_type(), address) {
        (RecordType::A, IpAddr::V4(v4)) => RData::A(A(v4)),
        (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(AAAA(v6)),
        _ => return response,
    };
    response.add_answer(Record::from_rdata(query.name().clone(), SYNTHETIC_TTL, rdata));
    response
}

/// Where the server name really lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ServerTarget {
    Ip(IpAddr),
    Domain(String),
}

/// Resolves the server name to the configured server address.
pub struct ServerRedirectResolver<R: ?Sized> {
    server_name: String,
    target: ServerTarget,
    inner: Arc<R>,
}

impl<R: Resolver + ?Sized> ServerRedirectResolver<R> {
    /// `server_address` is the host part of the server address, either an
    /// IP literal or a domain.
    pub fn new(inner: Arc<R>, server_name: &str, server_address: &str) -> Self {
        let host = server_address.trim_start_matches('[').trim_end_matches(']');
        let target = match host.parse::<IpAddr>() {
            Ok(ip) => ServerTarget::Ip(ip),
            Err(_) => ServerTarget::Domain(trim_dot(host).to_string()),
        };
        Self {
            server_name: trim_dot(server_name).to_string(),
            target,
            inner,
        }
    }
}

#[async_trait]
impl<R: Resolver + ?Sized> Resolver for ServerRedirectResolver<R> {
    async fn resolve(&self, request: &Message) -> Option<Message> {
        let Some(query) = request.queries().first() else {
            return self.inner.resolve(request).await;
        };
        if !matches!(query.query_type(), RecordType::A | RecordType::AAAA)
            || !trim_dot(&query.name().to_ascii()).eq_ignore_ascii_case(&self.server_name)
        {
            return self.inner.resolve(request).await;
        }

        let domain = match &self.target {
            ServerTarget::Ip(ip) => return Some(synthesize_address_response(request, *ip)),
            ServerTarget::Domain(domain) => domain,
        };
        let name = parse_name(domain)?;
        let mut redirected = request.clone();
        let mut queries = redirected.take_queries();
        queries[0].set_name(name);
        redirected.add_queries(queries);

        debug!(server_name = %self.server_name, target = %domain, "redirecting server lookup");
        let mut response = self.inner.resolve(&redirected).await?;
        response.take_queries();
        response.add_queries(request.queries().iter().cloned());
        rewrite_address_answer_names(&mut response, domain, &self.server_name);
        Some(response)
    }
}

/// Serves HTTPS records with ECH for the server name.
pub struct EchResolver<R: ?Sized> {
    server_name: String,
    query_server_name: String,
    ech_config: Option<Vec<u8>>,
    quic: bool,
    inner: Arc<R>,
}

impl<R: Resolver + ?Sized> EchResolver<R> {
    /// With a fixed `ech_config` HTTPS queries are answered locally.
    /// Otherwise they are forwarded under `query_server_name` (defaulting to
    /// the server name) and the answer is mapped back.
    pub fn new(
        inner: Arc<R>,
        server_name: &str,
        query_server_name: Option<&str>,
        ech_config: Option<Vec<u8>>,
        quic: bool,
    ) -> Self {
        let server_name = trim_dot(server_name).to_string();
        let query_server_name = query_server_name
            .filter(|name| !name.is_empty())
            .map(|name| trim_dot(name).to_string())
            .unwrap_or_else(|| server_name.clone());
        Self {
            server_name,
            query_server_name,
            ech_config: ech_config.filter(|config| !config.is_empty()),
            quic,
            inner,
        }
    }

    fn alpn(&self) -> &'static [&'static str] {
        if self.quic {
            &["h3"]
        } else {
            &["h2"]
        }
    }
}

#[async_trait]
impl<R: Resolver + ?Sized> Resolver for EchResolver<R> {
    async fn resolve(&self, request: &Message) -> Option<Message> {
        let Some(query) = request.queries().first() else {
            return self.inner.resolve(request).await;
        };
        let query_name = query.name().to_ascii();
        if query.query_type() != RecordType::HTTPS || !matches_server_name(&query_name, &self.server_name) {
            return self.inner.resolve(request).await;
        }

        if let Some(ech_config) = &self.ech_config {
            debug!(len = ech_config.len(), "ech config injected");
            return Some(inject_ech_config(request, None, ech_config, self.alpn()));
        }

        let mut response = if self.query_server_name.eq_ignore_ascii_case(&self.server_name) {
            self.inner.resolve(request).await?
        } else {
            let renamed =
                rewrite_https_query_name(&query_name, &self.server_name, &self.query_server_name);
            let mut redirected = request.clone();
            let mut queries = redirected.take_queries();
            queries[0].set_name(parse_name(&renamed)?);
            redirected.add_queries(queries);

            let mut response = self.inner.resolve(&redirected).await?;
            response.take_queries();
            response.add_queries(request.queries().iter().cloned());
            rewrite_https_answer_names(&mut response, &self.query_server_name, &self.server_name);
            response
        };
        filter_ip_hints(&mut response);
        Some(response)
    }
}
