//! Request-line and header parsing, plus the per-exchange request state.
//!
//! The parser reads the socket one byte at a time into a line buffer, drops
//! `\r`, and ends a line on `\n`. It stops at the first empty line so the body
//! stays unread on the stream for whichever servlet wants it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Headers, Method};
use crate::security::Principal;

/// Default upper bound for a single request or header line.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024;

/// The still-unread remainder of the connection, handed to servlets as the body.
pub type BodyStream = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Errors produced while reading a request head.
///
/// A garbled request line is not an error: it yields a [`RequestHead`] without
/// a method, which the router answers with `400`.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("request line or header exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("malformed header line: {line:?}")]
    InvalidHeader { line: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Request line plus headers, exactly as read off the wire.
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    /// `None` when the request line was empty or unparseable.
    pub method: Option<Method>,
    /// Raw request target: path, matrix parameters and query.
    pub target: String,
    pub protocol: String,
    pub headers: Headers,
}

impl RequestHead {
    /// Reads a request line and headers from `reader`.
    ///
    /// Parsing ends at the first zero-length line or at end of input. Bytes
    /// after the blank line are left in `reader`.
    ///
    /// # Errors
    ///
    /// - [`ParseError::LineTooLong`]: a line exceeded `max_line` bytes.
    /// - [`ParseError::InvalidHeader`]: a header line had no `name:` part.
    /// - [`ParseError::Io`]: the underlying read failed.
    ///
    /// # Examples
    ///
    /// ```
    /// # tokio_test_block_on(async {
    /// use servlette::http::RequestHead;
    ///
    /// let mut raw: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\nbody";
    /// let head = RequestHead::read_from(&mut raw, 8192).await.unwrap();
    /// assert_eq!(head.target, "/index.html");
    /// assert_eq!(raw, b"body");
    /// # });
    /// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
    /// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
    /// # }
    /// ```
    pub async fn read_from<R>(reader: &mut R, max_line: usize) -> Result<Self, ParseError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut head = RequestHead::default();
        let mut line = Vec::with_capacity(128);

        if !read_line(reader, &mut line, max_line).await? {
            return Ok(head);
        }

        match parse_request_line(&line) {
            Some((method, target, protocol)) => {
                head.method = Some(method);
                head.target = target;
                head.protocol = protocol;
            }
            // Nothing after a garbled request line is trustworthy.
            None => return Ok(head),
        }

        while read_line(reader, &mut line, max_line).await? {
            if line.is_empty() {
                break;
            }
            let text = String::from_utf8_lossy(&line);
            let (name, value) = text
                .split_once(':')
                .map(|(n, v)| (n.trim(), v.trim()))
                .filter(|(n, _)| is_token(n))
                .ok_or_else(|| ParseError::InvalidHeader {
                    line: text.to_string(),
                })?;
            head.headers.append(name, value);
        }

        Ok(head)
    }
}

// Fills `line` with the next line, minus `\r` and the terminating `\n`.
// Returns `false` when the input ended before any byte of a new line.
async fn read_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max_line: usize,
) -> Result<bool, ParseError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    line.clear();
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(!line.is_empty()),
            Err(e) => return Err(e.into()),
        };
        match byte {
            b'\n' => return Ok(true),
            b'\r' => {}
            other => {
                if line.len() >= max_line {
                    return Err(ParseError::LineTooLong { limit: max_line });
                }
                line.push(other);
            }
        }
    }
}

fn parse_request_line(line: &[u8]) -> Option<(Method, String, String)> {
    let text = std::str::from_utf8(line).ok()?;
    let mut parts = text.split_whitespace();
    let (method, target, protocol) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || !is_token(method) || !protocol.starts_with("HTTP/") {
        return None;
    }
    let method = method.parse().ok()?;
    Some((method, target.to_owned(), protocol.to_owned()))
}

// RFC 9110 `token`: one or more tchar.
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

/// Where the requested session id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIdSource {
    Cookie,
    Url,
}

/// Path components that forward/include dispatch rewrites and later restores.
#[derive(Debug, Clone)]
pub(crate) struct PathState {
    pub request_uri: String,
    pub query: Option<String>,
    pub servlet_path: String,
    pub path_info: Option<String>,
}

/// One inbound request together with the routing state accumulated for it.
///
/// Built by the connection processor from a parsed [`RequestHead`]; the
/// router fills in the context path, servlet path and session id as it
/// resolves the target.
pub struct Request {
    head: RequestHead,
    body: Option<BodyStream>,
    peer_addr: Option<SocketAddr>,
    secure: bool,
    request_uri: String,
    query: Option<String>,
    context_path: String,
    servlet_path: String,
    path_info: Option<String>,
    requested_session: Option<(String, SessionIdSource)>,
    attributes: HashMap<String, Value>,
    principal: Option<Principal>,
}

impl Request {
    /// Creates a request from a parsed head and the unread body stream.
    pub fn new(head: RequestHead, body: Option<BodyStream>) -> Self {
        let (path, query) = match head.target.split_once('?') {
            Some((p, q)) => (p.to_owned(), Some(q.to_owned())),
            None => (head.target.clone(), None),
        };
        Self {
            head,
            body,
            peer_addr: None,
            secure: false,
            request_uri: path,
            query,
            context_path: String::new(),
            servlet_path: String::new(),
            path_info: None,
            requested_session: None,
            attributes: HashMap::new(),
            principal: None,
        }
    }

    /// Records the remote address and whether the connection is TLS.
    #[must_use]
    pub fn with_peer(mut self, peer_addr: SocketAddr, secure: bool) -> Self {
        self.peer_addr = Some(peer_addr);
        self.secure = secure;
        self
    }

    /// Returns the HTTP method, or `None` if the request line was unparseable.
    pub fn method(&self) -> Option<&Method> {
        self.head.method.as_ref()
    }

    /// Returns the raw request target as it appeared on the request line.
    pub fn target(&self) -> &str {
        &self.head.target
    }

    /// Returns the protocol token, e.g. `HTTP/1.1`.
    pub fn protocol(&self) -> &str {
        &self.head.protocol
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    /// Mutable header access for filters that rewrite the incoming request.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.head.headers
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Returns the request path without the query string.
    ///
    /// After routing, matrix parameters have been removed.
    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    /// Query string without the `?`.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    pub fn servlet_path(&self) -> &str {
        &self.servlet_path
    }

    pub fn path_info(&self) -> Option<&str> {
        self.path_info.as_deref()
    }

    /// Returns the request path relative to the context path.
    ///
    /// An empty result means the context root itself.
    pub fn context_relative_path(&self) -> &str {
        self.request_uri
            .strip_prefix(self.context_path.as_str())
            .unwrap_or(&self.request_uri)
    }

    pub(crate) fn set_request_uri(&mut self, uri: impl Into<String>) {
        self.request_uri = uri.into();
    }

    pub(crate) fn set_context_path(&mut self, context_path: impl Into<String>) {
        self.context_path = context_path.into();
    }

    pub(crate) fn set_servlet_paths(&mut self, servlet_path: String, path_info: Option<String>) {
        self.servlet_path = servlet_path;
        self.path_info = path_info;
    }

    pub(crate) fn path_state(&self) -> PathState {
        PathState {
            request_uri: self.request_uri.clone(),
            query: self.query.clone(),
            servlet_path: self.servlet_path.clone(),
            path_info: self.path_info.clone(),
        }
    }

    pub(crate) fn restore_path_state(&mut self, state: PathState) {
        self.request_uri = state.request_uri;
        self.query = state.query;
        self.servlet_path = state.servlet_path;
        self.path_info = state.path_info;
    }

    pub(crate) fn set_query(&mut self, query: Option<String>) {
        self.query = query;
    }

    /// Returns the session id the client asked for, if any.
    pub fn requested_session_id(&self) -> Option<&str> {
        self.requested_session.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn requested_session_id_source(&self) -> Option<SessionIdSource> {
        self.requested_session.as_ref().map(|(_, source)| *source)
    }

    pub fn is_requested_session_id_from_cookie(&self) -> bool {
        self.requested_session_id_source() == Some(SessionIdSource::Cookie)
    }

    pub fn is_requested_session_id_from_url(&self) -> bool {
        self.requested_session_id_source() == Some(SessionIdSource::Url)
    }

    pub(crate) fn set_requested_session_id(&mut self, id: String, source: SessionIdSource) {
        self.requested_session = Some((id, source));
    }

    /// Returns a request attribute.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Returns the authenticated principal, if a security hook set one.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn set_principal(&mut self, principal: Principal) {
        self.principal = Some(principal);
    }

    /// Returns `true` if the authenticated principal holds `role`.
    pub fn is_user_in_role(&self, role: &str) -> bool {
        self.principal.as_ref().is_some_and(|p| p.has_role(role))
    }

    /// Declared body length; `None` when absent or not a number.
    pub fn content_length(&self) -> Option<usize> {
        self.headers().get("content-length")?.trim().parse().ok()
    }

    /// Returns the unread body stream.
    ///
    /// The stream is the connection itself; nothing has been buffered beyond
    /// the header block.
    pub fn body_mut(&mut self) -> Option<&mut BodyStream> {
        self.body.as_mut()
    }

    /// Reads exactly `Content-Length` bytes of body.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::InvalidData`] if the declared length exceeds
    /// `limit`, or the read error if the peer closes early.
    pub async fn read_body(&mut self, limit: usize) -> io::Result<Bytes> {
        let length = self.content_length().unwrap_or(0);
        if length > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("request body of {length} bytes exceeds {limit}"),
            ));
        }
        let Some(body) = self.body.as_mut() else {
            return Ok(Bytes::new());
        };
        let mut buf = vec![0u8; length];
        body.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.head.method)
            .field("target", &self.head.target)
            .field("context_path", &self.context_path)
            .field("servlet_path", &self.servlet_path)
            .field("path_info", &self.path_info)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(raw: &[u8]) -> Result<RequestHead, ParseError> {
        let mut reader = raw;
        RequestHead::read_from(&mut reader, DEFAULT_MAX_LINE_LENGTH).await
    }

    #[tokio::test]
    async fn parse_simple_get() {
        let head = parse(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        assert_eq!(head.method, Some(Method::Get));
        assert_eq!(head.target, "/");
        assert_eq!(head.protocol, "HTTP/1.1");
        assert_eq!(head.headers.get("host"), Some("localhost"));
    }

    #[tokio::test]
    async fn bare_lf_line_endings_are_accepted() {
        let head = parse(b"POST /a HTTP/1.0\nX-One: 1\n\n").await.unwrap();
        assert_eq!(head.method, Some(Method::Post));
        assert_eq!(head.headers.get("x-one"), Some("1"));
    }

    #[tokio::test]
    async fn repeated_headers_accumulate() {
        let head = parse(b"GET / HTTP/1.1\r\nAccept: a\r\naccept: b\r\n\r\n").await.unwrap();
        assert_eq!(head.headers.joined("ACCEPT").as_deref(), Some("a,b"));
    }

    #[tokio::test]
    async fn body_is_left_on_the_stream() {
        let mut reader: &[u8] = b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let head = RequestHead::read_from(&mut reader, 1024).await.unwrap();
        assert_eq!(head.headers.get("content-length"), Some("5"));
        assert_eq!(reader, b"hello");
    }

    #[tokio::test]
    async fn empty_input_has_no_method() {
        let head = parse(b"").await.unwrap();
        assert!(head.method.is_none());
    }

    #[tokio::test]
    async fn garbled_request_line_has_no_method() {
        let garbled: [&[u8]; 4] = [
            b"\x16\x03\x01\x02\x00\r\n\r\n",
            b"hello\r\n\r\n",
            b"GET /\r\n\r\n",
            b"GET / FTP/1\r\n\r\n",
        ];
        for raw in garbled {
            let head = parse(raw).await.unwrap();
            assert!(head.method.is_none(), "{raw:?}");
        }
    }

    #[tokio::test]
    async fn header_without_colon_is_rejected() {
        let err = parse(b"GET / HTTP/1.1\r\nnot a header\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidHeader { .. }));
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat_n(b'a', 64));
        raw.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        let mut reader = raw.as_slice();
        let err = RequestHead::read_from(&mut reader, 32).await.unwrap_err();
        assert!(matches!(err, ParseError::LineTooLong { limit: 32 }));
    }

    #[tokio::test]
    async fn request_splits_query_from_path() {
        let head = parse(b"GET /search?q=rust&page=2 HTTP/1.1\r\n\r\n").await.unwrap();
        let req = Request::new(head, None);
        assert_eq!(req.request_uri(), "/search");
        assert_eq!(req.query_string(), Some("q=rust&page=2"));
    }

    #[tokio::test]
    async fn read_body_honours_content_length() {
        let mut reader: &'static [u8] = b"PUT /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcdef";
        let head = RequestHead::read_from(&mut reader, 1024).await.unwrap();
        let mut req = Request::new(head, Some(Box::new(reader)));
        assert_eq!(&req.read_body(16).await.unwrap()[..], b"abc");
    }

    #[tokio::test]
    async fn read_body_rejects_oversized_declaration() {
        let head = parse(b"PUT /x HTTP/1.1\r\nContent-Length: 99\r\n\r\n").await.unwrap();
        let mut req = Request::new(head, Some(Box::new(&b""[..])));
        let err = req.read_body(10).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
