//! Response writer.
//!
//! Status and headers are plain in-memory state until [`Response::write_status_line`]
//! and [`Response::write_headers`] serialize them. From then on header changes
//! are ignored: the head has already gone (or is about to go) out on the wire.
//!
//! State progression: `New → HeadersWritten → Committed → Closed`.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::{Headers, StatusCode};

/// Write half of the connection.
pub type ResponseSink = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Lifecycle of a [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResponseState {
    /// Status and headers may still change.
    New,
    /// The head is serialized; header mutations are no longer observable.
    HeadersWritten,
    /// Bytes have reached the socket.
    Committed,
    /// The socket is closed.
    Closed,
}

/// An HTTP/1.x response bound to the write half of one connection.
///
/// Body bytes written with [`write`](Self::write) are buffered until
/// [`flush`](Self::flush) or [`close`](Self::close); until then the buffer can
/// still be discarded, which is what forward and error dispatch rely on.
///
/// # Examples
///
/// ```
/// use servlette::http::{Response, ResponseState};
///
/// let mut response = Response::detached("HTTP/1.1");
/// response.set_status(201);
/// response.add_header("X-Request-Id", "abc-123");
/// response.write_status_line();
/// response.write_headers();
/// response.add_header("X-Late", "ignored");
///
/// assert_eq!(response.state(), ResponseState::HeadersWritten);
/// let head = String::from_utf8(response.pending_head().to_vec()).unwrap();
/// assert!(head.starts_with("HTTP/1.1 201 Created\r\n"));
/// assert!(!head.contains("X-Late"));
/// ```
pub struct Response {
    protocol: String,
    status: u16,
    reason: Option<String>,
    headers: Headers,
    state: ResponseState,
    head: BytesMut,
    body: BytesMut,
    body_written: usize,
    sink: Option<ResponseSink>,
    locked: bool,
}

impl Response {
    /// Creates a `200` response that writes to `sink`.
    ///
    /// `protocol` is echoed on the status line; anything that is not an
    /// `HTTP/` token falls back to `HTTP/1.1`.
    pub fn new(protocol: &str, sink: ResponseSink) -> Self {
        let mut response = Self::detached(protocol);
        response.sink = Some(sink);
        response
    }

    /// Creates a response with nowhere to flush to.
    ///
    /// Everything written stays in the pending buffers, which makes this the
    /// natural shape for routing tests.
    pub fn detached(protocol: &str) -> Self {
        let protocol = if protocol.starts_with("HTTP/") {
            protocol.to_owned()
        } else {
            "HTTP/1.1".to_owned()
        };
        Self {
            protocol,
            status: StatusCode::Ok.as_u16(),
            reason: None,
            headers: Headers::new(),
            state: ResponseState::New,
            head: BytesMut::new(),
            body: BytesMut::new(),
            body_written: 0,
            sink: None,
            locked: false,
        }
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// Returns `true` once any byte has reached the socket.
    pub fn is_committed(&self) -> bool {
        self.state >= ResponseState::Committed
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Sets the status code and clears any custom reason phrase.
    pub fn set_status(&mut self, code: u16) {
        if self.head_is_mutable("status") {
            self.status = code;
            self.reason = None;
        }
    }

    /// Sets the status code with an explicit reason phrase.
    pub fn set_status_with_reason(&mut self, code: u16, reason: impl Into<String>) {
        if self.head_is_mutable("status") {
            self.status = code;
            self.reason = Some(reason.into());
        }
    }

    /// Appends a header value. Values for one name are comma-joined on the wire.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.head_is_mutable("header") {
            self.headers.append(name, value);
        }
    }

    /// Replaces all values of a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.head_is_mutable("header") {
            self.headers.set(name, value);
        }
    }

    // Status and headers are frozen once the head is serialized or while an
    // include is running.
    fn head_is_mutable(&self, what: &'static str) -> bool {
        let mutable = self.state == ResponseState::New && !self.locked;
        if !mutable {
            trace!(
                what,
                state = ?self.state,
                locked = self.locked,
                "ignoring response head mutation"
            );
        }
        mutable
    }

    /// Freezes status and headers (used for the duration of an include).
    pub(crate) fn set_locked(&mut self, locked: bool) -> bool {
        std::mem::replace(&mut self.locked, locked)
    }

    /// Returns `true` while an include is running.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Serializes `<protocol> <code> [reason]` into the pending head.
    ///
    /// Does nothing if the head was already written.
    pub fn write_status_line(&mut self) {
        if self.state != ResponseState::New || !self.head.is_empty() {
            return;
        }
        let reason = self
            .reason
            .clone()
            .or_else(|| StatusCode::from_u16(self.status).map(|s| s.canonical_reason().to_owned()));
        let line = match reason {
            Some(reason) => format!("{} {} {}\r\n", self.protocol, self.status, reason),
            None => format!("{} {}\r\n", self.protocol, self.status),
        };
        self.head.put(line.as_bytes());
    }

    /// Serializes every header as `<name>: <comma-joined values>` plus the blank line.
    ///
    /// `Connection: close` is added when absent: one request per connection.
    pub fn write_headers(&mut self) {
        if self.state != ResponseState::New {
            return;
        }
        self.write_status_line();
        if !self.headers.contains("connection") {
            self.headers.append("Connection", "close");
        }
        self.head.put(self.headers.to_string().as_bytes());
        self.head.put(&b"\r\n"[..]);
        self.state = ResponseState::HeadersWritten;
    }

    /// Buffers body bytes, serializing the head first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`std::io::ErrorKind::BrokenPipe`] once the response is closed.
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if self.state == ResponseState::Closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "response already closed",
            ));
        }
        self.write_headers();
        self.body.put(data);
        self.body_written += data.len();
        Ok(())
    }

    /// Buffers a UTF-8 string as body bytes.
    pub fn write_str(&mut self, data: &str) -> std::io::Result<()> {
        self.write(data.as_bytes())
    }

    /// Serialized head that has not reached the socket yet.
    pub fn pending_head(&self) -> &[u8] {
        &self.head
    }

    /// Body bytes that have not reached the socket yet.
    pub fn pending_body(&self) -> &[u8] {
        &self.body
    }

    /// Total body bytes written through [`write`](Self::write) since the last reset.
    pub fn body_written(&self) -> usize {
        self.body_written
    }

    /// Discards buffered head and body so a new target can start over.
    ///
    /// Status and headers set so far are kept.
    ///
    /// # Errors
    ///
    /// Fails once any byte has been committed to the socket. While the head is
    /// locked by an include this does nothing, leaving the includer's output
    /// in place.
    pub fn reset_buffer(&mut self) -> Result<(), ResponseCommitted> {
        if self.is_committed() {
            return Err(ResponseCommitted);
        }
        if self.locked {
            trace!(body_written = self.body_written, "ignoring buffer reset during include");
            return Ok(());
        }
        self.head.clear();
        self.body.clear();
        self.body_written = 0;
        self.state = ResponseState::New;
        Ok(())
    }

    /// Writes the pending head and body to the socket.
    ///
    /// A detached response keeps its buffers and stays uncommitted.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        if self.state == ResponseState::Closed {
            return Ok(());
        }
        self.write_headers();
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        sink.write_all(&self.head).await?;
        sink.write_all(&self.body).await?;
        sink.flush().await?;
        self.head.clear();
        self.body.clear();
        self.state = ResponseState::Committed;
        Ok(())
    }

    /// Commits the head and returns the live socket stream for the body.
    ///
    /// # Errors
    ///
    /// Fails with [`std::io::ErrorKind::NotConnected`] on a detached or closed response.
    pub async fn output_stream(&mut self) -> std::io::Result<&mut ResponseSink> {
        self.flush().await?;
        match self.sink.as_mut() {
            Some(sink) if self.state == ResponseState::Committed => Ok(sink),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "response has no open stream",
            )),
        }
    }

    /// Flushes and shuts the socket down.
    pub async fn close(&mut self) -> std::io::Result<()> {
        if self.state == ResponseState::Closed {
            return Ok(());
        }
        let flushed = self.flush().await;
        let shutdown = match self.sink.as_mut() {
            Some(sink) => sink.shutdown().await,
            None => Ok(()),
        };
        self.sink = None;
        self.state = ResponseState::Closed;
        flushed.and(shutdown)
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("state", &self.state)
            .field("headers", &self.headers)
            .field("body_written", &self.body_written)
            .finish_non_exhaustive()
    }
}

/// Returned by [`Response::reset_buffer`] once bytes are on the wire.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("response already committed")]
pub struct ResponseCommitted;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn wire(mut response: Response, mut peer: tokio::io::DuplexStream) -> String {
        response.close().await.unwrap();
        let mut out = String::new();
        peer.read_to_string(&mut out).await.unwrap();
        out
    }

    fn connected() -> (Response, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        (Response::new("HTTP/1.1", Box::new(ours)), theirs)
    }

    #[tokio::test]
    async fn repeated_header_values_are_comma_joined() {
        let (mut response, peer) = connected();
        response.add_header("name", "1234");
        response.add_header("name", "2345");
        let text = wire(response, peer).await;
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines.contains(&"name: 1234,2345"), "{text}");
    }

    #[tokio::test]
    async fn headers_after_write_headers_never_reach_the_wire() {
        let (mut response, peer) = connected();
        response.add_header("H", "a");
        response.add_header("H", "b");
        response.write_status_line();
        response.write_headers();
        response.add_header("Late", "1");
        response.set_header("H", "replaced");
        response.set_status(500);
        let text = wire(response, peer).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.lines().any(|l| l == "H: a,b"));
        assert!(!text.contains("Late"));
        assert!(!text.contains("replaced"));
    }

    #[tokio::test]
    async fn unknown_status_has_no_reason() {
        let mut response = Response::detached("HTTP/1.0");
        response.set_status(299);
        response.write_status_line();
        assert_eq!(response.pending_head(), b"HTTP/1.0 299\r\n");
    }

    #[tokio::test]
    async fn explicit_reason_wins() {
        let mut response = Response::detached("garbage");
        response.set_status_with_reason(200, "Fine");
        response.write_status_line();
        assert_eq!(response.pending_head(), b"HTTP/1.1 200 Fine\r\n");
    }

    #[tokio::test]
    async fn body_follows_blank_line() {
        let (mut response, peer) = connected();
        response.write_str("hello").unwrap();
        let text = wire(response, peer).await;
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn reset_discards_uncommitted_bytes() {
        let mut response = Response::detached("HTTP/1.1");
        response.write_str("draft").unwrap();
        response.reset_buffer().unwrap();
        assert_eq!(response.state(), ResponseState::New);
        assert!(response.pending_body().is_empty());
        response.set_status(404);
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn reset_after_commit_fails() {
        let (mut response, _peer) = connected();
        response.write_str("sent").unwrap();
        response.flush().await.unwrap();
        assert!(response.is_committed());
        assert!(response.reset_buffer().is_err());
    }

    #[tokio::test]
    async fn reset_is_ignored_while_locked() {
        let mut response = Response::detached("HTTP/1.1");
        response.set_status(201);
        response.write_str("[").unwrap();
        response.set_locked(true);
        response.reset_buffer().unwrap();
        assert_eq!(response.pending_body(), b"[");
        assert_eq!(response.status(), 201);
    }

    #[tokio::test]
    async fn locked_head_ignores_mutations() {
        let mut response = Response::detached("HTTP/1.1");
        response.set_locked(true);
        response.set_status(500);
        response.add_header("X", "1");
        response.set_locked(false);
        assert_eq!(response.status(), 200);
        assert!(!response.headers().contains("x"));
    }

    #[tokio::test]
    async fn output_stream_commits_head_first() {
        let (mut response, peer) = connected();
        response.set_header("Content-Type", "text/plain");
        response
            .output_stream()
            .await
            .unwrap()
            .write_all(b"raw")
            .await
            .unwrap();
        let text = wire(response, peer).await;
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.ends_with("\r\n\r\nraw"));
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let (mut response, _peer) = connected();
        response.close().await.unwrap();
        assert!(response.write(b"x").is_err());
    }
}
