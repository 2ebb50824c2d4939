//! One accepted connection: one request, one response, then teardown.

use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace};

use crate::config::ServerConfig;
use crate::context::Context;
use crate::http::{ParseError, Request, RequestHead, Response, StatusCode};
use crate::router::Router;

/// Per-connection limits, copied out of [`ServerConfig`] once.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub close_delay: Duration,
    pub header_timeout: Duration,
    pub max_header_line: usize,
    pub async_timeout: Duration,
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            close_delay: config.close_delay(),
            header_timeout: config.header_timeout(),
            max_header_line: config.max_header_line,
            async_timeout: config.async_timeout(),
        }
    }
}

/// Serves one accepted TCP connection, performing the TLS handshake first when configured.
pub(crate) async fn process(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    router: Arc<Router>,
    settings: Arc<ConnectionSettings>,
) {
    // A second handle on the socket: the stream itself is split and possibly
    // wrapped in TLS by the time the read side has to be shut down.
    let control = match socket2::SockRef::from(&stream).try_clone() {
        Ok(socket) => Some(socket),
        Err(e) => {
            debug!(peer = %peer, error = %e, "cannot duplicate socket handle; skipping half-close");
            None
        }
    };

    match tls {
        None => serve(stream, peer, false, control, &router, &settings).await,
        Some(acceptor) => match timeout(settings.header_timeout, acceptor.accept(stream)).await {
            Ok(Ok(stream)) => serve(stream, peer, true, control, &router, &settings).await,
            Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
            Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
        },
    }
}

async fn serve<S>(
    stream: S,
    peer: SocketAddr,
    secure: bool,
    control: Option<socket2::Socket>,
    router: &Router,
    settings: &ConnectionSettings,
) where
    S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    let started = Instant::now();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let parsed = match timeout(
        settings.header_timeout,
        RequestHead::read_from(&mut reader, settings.max_header_line),
    )
    .await
    {
        Ok(Ok(head)) => Ok(head),
        Ok(Err(ParseError::LineTooLong { limit })) => {
            debug!(peer = %peer, limit, "request line too long");
            Err(StatusCode::RequestHeaderFieldsTooLarge)
        }
        Ok(Err(ParseError::InvalidHeader { line })) => {
            debug!(peer = %peer, %line, "malformed header");
            Err(StatusCode::BadRequest)
        }
        Ok(Err(ParseError::Io(e))) => {
            debug!(peer = %peer, error = %e, "read failed before the request head was complete");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "timed out waiting for the request head");
            Err(StatusCode::RequestTimeout)
        }
    };

    let response = match parsed {
        Ok(head) => {
            let response = Response::new(&head.protocol, Box::new(write_half));
            let request = Request::new(head, Some(Box::new(reader))).with_peer(peer, secure);
            let mut ctx = Context::new(request, response);
            router.serve(&mut ctx, settings.async_timeout).await;
            let (request, response) = ctx.into_parts();
            debug!(
                peer = %peer,
                method = request.method().map(|m| m.as_str()).unwrap_or("-"),
                uri = request.request_uri(),
                status = response.status(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "request served"
            );
            response
        }
        Err(status) => {
            let mut response = Response::new("HTTP/1.1", Box::new(write_half));
            response.set_status(status.as_u16());
            response.write_headers();
            response
        }
    };

    teardown(response, control, settings.close_delay).await;
}

// Flush, half-close the read side, give the peer a moment to start reading,
// then close. Closing with unread input still queued makes some stacks send
// RST, which can destroy the response before the client has read it.
async fn teardown(mut response: Response, control: Option<socket2::Socket>, close_delay: Duration) {
    if let Err(e) = response.flush().await {
        debug!(error = %e, "write failed; abandoning connection");
        let _ = response.close().await;
        return;
    }
    if let Some(socket) = &control {
        if let Err(e) = socket.shutdown(Shutdown::Read) {
            trace!(error = %e, "read-side shutdown failed");
        }
    }
    if !close_delay.is_zero() {
        tokio::time::sleep(close_delay).await;
    }
    if let Err(e) = response.close().await {
        trace!(error = %e, "close failed");
    }
}
