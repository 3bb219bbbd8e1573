//! In-process DNS server handed to the engine as its nameserver.
//!
//! The engine is told to use [`INTERNAL_DNS_ADDRESS`]; dials to it are
//! answered with one end of a socket pair whose other end is served here.
//! Queries go to a caller-supplied [`Resolver`], optionally wrapped by the
//! rewriting layers in [`rewrite`].

pub mod rewrite;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixDatagram;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub use rewrite::{EchResolver, ServerRedirectResolver};
pub use upstream::UpstreamResolver;

/// Address the engine is pointed at for DNS. Never dialed for real.
pub const INTERNAL_DNS_ADDRESS: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(198, 18, 0, 53)), 53);

/// Largest UDP response the engine accepts without EDNS0.
pub const UDP_MAX_SIZE: usize = 512;

/// Idle limit for reading the next query.
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Limit for writing one response.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns a DNS request into a response.
///
/// Returning `None` makes the server answer `SERVFAIL`. The server fixes up
/// the id, the response flag and a missing question section.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, request: &Message) -> Option<Message>;
}

#[async_trait]
impl<R: Resolver + ?Sized> Resolver for Arc<R> {
    async fn resolve(&self, request: &Message) -> Option<Message> {
        (**self).resolve(request).await
    }
}

/// Empty reply to `request`: same id, opcode, recursion-desired and question.
pub fn reply_to(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    response.add_queries(request.queries().iter().cloned());
    response
}

/// Makes a resolver result a valid reply to `request`.
pub fn normalize_response(request: &Message, response: Option<Message>) -> Message {
    let Some(mut response) = response else {
        let mut fallback = reply_to(request);
        fallback.set_response_code(ResponseCode::ServFail);
        return fallback;
    };
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response);
    if response.queries().is_empty() {
        response.add_queries(request.queries().iter().cloned());
    }
    response
}

/// Answerless reply with TC set, telling the client to retry over TCP.
pub fn truncated_response(request: &Message, rcode: ResponseCode) -> Message {
    let mut response = reply_to(request);
    response.set_truncated(true).set_response_code(rcode);
    response
}

async fn answer<R: Resolver + ?Sized>(resolver: &R, request: &Message) -> Message {
    normalize_response(request, resolver.resolve(request).await)
}

fn pack(message: &Message) -> Option<Vec<u8>> {
    match message.to_bytes() {
        Ok(packed) => Some(packed),
        Err(e) => {
            debug!(error = %e, "failed to pack DNS response");
            None
        }
    }
}

/// Serves DNS over a connected datagram socket until `cancel` fires or the
/// peer goes quiet for [`READ_TIMEOUT`].
///
/// Malformed datagrams are dropped. Responses larger than [`UDP_MAX_SIZE`]
/// are replaced with a truncated reply.
pub async fn serve_packet<R: Resolver + ?Sized>(
    socket: UnixDatagram,
    resolver: &R,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut buf = [0u8; UDP_MAX_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(READ_TIMEOUT, socket.recv(&mut buf)) => match result {
                Ok(read) => read?,
                Err(_) => return Err(std::io::ErrorKind::TimedOut.into()),
            },
        };

        let Ok(request) = Message::from_bytes(&buf[..n]) else {
            trace!(len = n, "dropping malformed DNS datagram");
            continue;
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            response = answer(resolver, &request) => response,
        };
        let Some(mut packed) = pack(&response) else { continue };
        if packed.len() > UDP_MAX_SIZE {
            let truncated = truncated_response(&request, response.response_code());
            let Some(truncated) = pack(&truncated) else { continue };
            packed = truncated;
        }

        let _ = tokio::time::timeout(WRITE_TIMEOUT, socket.send(&packed)).await;
    }
}

/// Serves length-prefixed DNS over a stream until EOF, a zero-length query,
/// `cancel` or an I/O error.
pub async fn serve_stream<S, R>(
    mut stream: S,
    resolver: &R,
    cancel: CancellationToken,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Resolver + ?Sized,
{
    loop {
        let query = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(READ_TIMEOUT, read_query(&mut stream)) => match result {
                Ok(query) => query?,
                Err(_) => return Err(std::io::ErrorKind::TimedOut.into()),
            },
        };
        let Some(query) = query else { return Ok(()) };

        let Ok(request) = Message::from_bytes(&query) else {
            trace!(len = query.len(), "dropping malformed DNS query");
            continue;
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            response = answer(resolver, &request) => response,
        };
        let Some(packed) = pack(&response) else { continue };
        if packed.len() > u16::MAX as usize {
            continue;
        }

        let write = async {
            stream.write_all(&(packed.len() as u16).to_be_bytes()).await?;
            stream.write_all(&packed).await?;
            stream.flush().await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, write).await {
            Ok(result) => result?,
            Err(_) => return Err(std::io::ErrorKind::TimedOut.into()),
        }
    }
}

/// Reads one length-prefixed query. `None` means a clean end.
async fn read_query<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 2];
    match stream.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u16::from_be_bytes(len) as usize;
    if len == 0 {
        return Ok(None);
    }
    let mut query = vec![0u8; len];
    stream.read_exact(&mut query).await?;
    Ok(Some(query))
}
