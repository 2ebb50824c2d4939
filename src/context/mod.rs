//! Per-request context: the request/response pair plus everything resolved for it.
//!
//! A [`Context`] is what filters and servlets operate on. Besides the
//! request and response it carries the owning application, the current
//! dispatcher type, the session bound to this exchange, a pending async
//! completion, and a type-erased extension map for hooks that need to hand
//! state to downstream code.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::application::Application;
use crate::filter::{DispatcherType, dispatch};
use crate::http::{Request, RequestHead, Response};
use crate::servlet::{ServletError, ServletResult};
use crate::session::{SessionHandle, tracking};

/// One value per type, for filters and hooks that hand state to code
/// further down the chain without a shared type between them.
///
/// ```
/// use servlette::context::Extensions;
///
/// struct RequestId(u64);
///
/// let mut ext = Extensions::new();
/// ext.insert(RequestId(7));
/// assert_eq!(ext.get::<RequestId>().map(|id| id.0), Some(7));
/// ```
#[derive(Default)]
pub struct Extensions {
    by_type: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, handing back whatever value of `T` it displaced.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        let previous = self.by_type.insert(TypeId::of::<T>(), Box::new(value))?;
        previous.downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.by_type.get(&TypeId::of::<T>())?.downcast_ref::<T>()
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.by_type.get_mut(&TypeId::of::<T>())?.downcast_mut::<T>()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        let stored = self.by_type.remove(&TypeId::of::<T>())?;
        stored.downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// What a deferred (async) request asks the connection to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncAction {
    /// Finish the response as it stands.
    Complete,
    /// Re-dispatch to a context-relative path with `ASYNC` semantics.
    Dispatch(String),
}

/// Message sent from an [`AsyncContext`] back to the waiting connection.
#[derive(Debug)]
pub(crate) struct AsyncOutcome {
    pub action: AsyncAction,
    pub attributes: Vec<(String, Value)>,
}

/// Handle returned by [`Context::start_async`].
///
/// Work done off the request task hands its results back as request
/// attributes, which are set on the request before the dispatch runs.
/// Dropping the handle without calling a method counts as abandoning the
/// request; the connection then answers with `500`.
#[derive(Debug)]
pub struct AsyncContext {
    tx: oneshot::Sender<AsyncOutcome>,
    attributes: Vec<(String, Value)>,
}

impl AsyncContext {
    /// Queues a request attribute for the continuation.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.push((name.into(), value.into()));
    }

    /// Completes the response.
    pub fn complete(self) {
        self.finish(AsyncAction::Complete);
    }

    /// Dispatches to `path` (context-relative) on the original connection.
    pub fn dispatch(self, path: impl Into<String>) {
        self.finish(AsyncAction::Dispatch(path.into()));
    }

    fn finish(self, action: AsyncAction) {
        let outcome = AsyncOutcome {
            action,
            attributes: self.attributes,
        };
        if self.tx.send(outcome).is_err() {
            trace!("async continuation arrived after the request was abandoned");
        }
    }
}

/// The request/response exchange handed to filters and servlets.
pub struct Context {
    request: Request,
    response: Response,
    application: Option<Arc<Application>>,
    dispatcher_type: DispatcherType,
    servlet_name: Option<String>,
    session_id: Option<String>,
    pending_async: Option<oneshot::Receiver<AsyncOutcome>>,
    extensions: Extensions,
}

impl Context {
    /// Create a new context from a request and the response bound to its connection
    pub fn new(request: Request, response: Response) -> Self {
        Self {
            request,
            response,
            application: None,
            dispatcher_type: DispatcherType::Request,
            servlet_name: None,
            session_id: None,
            pending_async: None,
            extensions: Extensions::new(),
        }
    }

    /// Builds a context from a bare request line with a detached response.
    ///
    /// Handy for driving filters and servlets without a socket.
    ///
    /// # Examples
    ///
    /// ```
    /// use servlette::context::Context;
    ///
    /// let ctx = Context::detached("GET /context/snoop HTTP/1.1");
    /// assert_eq!(ctx.request().request_uri(), "/context/snoop");
    /// ```
    pub fn detached(request_line: &str) -> Self {
        let mut parts = request_line.split_whitespace();
        let head = RequestHead {
            method: parts.next().and_then(|m| m.parse().ok()),
            target: parts.next().unwrap_or("/").to_owned(),
            protocol: parts.next().unwrap_or("HTTP/1.1").to_owned(),
            headers: Default::default(),
        };
        let response = Response::detached(&head.protocol);
        Self::new(Request::new(head, None), response)
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Returns the application this request was routed to.
    pub fn application(&self) -> Option<&Arc<Application>> {
        self.application.as_ref()
    }

    pub(crate) fn set_application(&mut self, application: Arc<Application>) {
        self.application = Some(application);
    }

    pub fn dispatcher_type(&self) -> DispatcherType {
        self.dispatcher_type
    }

    pub(crate) fn set_dispatcher_type(
        &mut self,
        dispatcher_type: DispatcherType,
    ) -> DispatcherType {
        std::mem::replace(&mut self.dispatcher_type, dispatcher_type)
    }

    /// Name of the servlet currently being dispatched to.
    pub fn servlet_name(&self) -> Option<&str> {
        self.servlet_name.as_deref()
    }

    pub(crate) fn set_servlet_name(&mut self, name: Option<String>) -> Option<String> {
        std::mem::replace(&mut self.servlet_name, name)
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Splits the context back into its request and response.
    pub fn into_parts(self) -> (Request, Response) {
        (self.request, self.response)
    }

    /// Sends a `302` pointing at `location`.
    ///
    /// Ignored inside an include, where the head belongs to the includer.
    pub fn send_redirect(&mut self, location: &str) -> ServletResult {
        if self.response.is_committed() {
            return Err(ServletError::IllegalState("response already committed"));
        }
        if self.response.is_locked() {
            debug!(location, "ignoring redirect from an included resource");
            return Ok(());
        }
        self.response.reset_buffer()?;
        self.response.set_status(302);
        self.response.set_header("Location", location);
        Ok(())
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// Forwards to a context-relative `path`, discarding any uncommitted output.
    ///
    /// # Errors
    ///
    /// [`ServletError::IllegalState`] if the response is already committed,
    /// or whatever the forward target returns.
    pub async fn forward(&mut self, path: &str) -> ServletResult {
        dispatch::forward(self, path).await
    }

    /// Runs the target at `path` inline; it may only append body bytes.
    pub async fn include(&mut self, path: &str) -> ServletResult {
        dispatch::include(self, path).await
    }

    /// Puts the request into async mode.
    ///
    /// The connection stays open after the current dispatch returns, until the
    /// returned handle completes or dispatches (or the async timeout elapses).
    ///
    /// # Errors
    ///
    /// [`ServletError::IllegalState`] if async mode was already started.
    pub fn start_async(&mut self) -> Result<AsyncContext, ServletError> {
        if self.pending_async.is_some() {
            return Err(ServletError::IllegalState("async already started"));
        }
        let (tx, rx) = oneshot::channel();
        self.pending_async = Some(rx);
        Ok(AsyncContext {
            tx,
            attributes: Vec::new(),
        })
    }

    pub fn is_async_started(&self) -> bool {
        self.pending_async.is_some()
    }

    pub(crate) fn take_async(&mut self) -> Option<oneshot::Receiver<AsyncOutcome>> {
        self.pending_async.take()
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    /// Returns the session for this exchange, creating one when `create` is set.
    ///
    /// A session already bound to this exchange wins, then the requested
    /// session id. Creating a session emits the session cookie when cookie
    /// tracking is enabled and the head is still mutable.
    pub fn session(&mut self, create: bool) -> Option<SessionHandle> {
        let app = self.application.clone()?;
        let sessions = app.sessions();

        if let Some(id) = self.session_id.as_deref() {
            if let Some(handle) = sessions.find(id) {
                return Some(handle);
            }
            self.session_id = None;
        }

        if let Some(id) = self.request.requested_session_id() {
            if let Some(handle) = sessions.find(id) {
                self.session_id = Some(handle.id().to_owned());
                return Some(handle);
            }
        }

        if !create {
            return None;
        }
        let handle = sessions.create();
        trace!(context = app.context_path(), "session created");
        self.session_id = Some(handle.id().to_owned());
        self.add_session_cookie(&app, handle.id());
        Some(handle)
    }

    /// Issues a new id for the current session, keeping its attributes.
    ///
    /// The old id stops resolving immediately.
    ///
    /// # Errors
    ///
    /// [`ServletError::IllegalState`] when there is no valid session.
    pub fn change_session_id(&mut self) -> Result<String, ServletError> {
        let current = self
            .session(false)
            .ok_or(ServletError::IllegalState("no session to change"))?;
        let app = self
            .application
            .clone()
            .ok_or(ServletError::IllegalState("no application"))?;
        let new_id = app
            .sessions()
            .change_session_id(current.id())
            .ok_or(ServletError::IllegalState("session invalidated concurrently"))?;
        self.session_id = Some(new_id.clone());
        self.add_session_cookie(&app, &new_id);
        Ok(new_id)
    }

    /// Returns `true` if the requested session id names a live session.
    pub fn is_requested_session_id_valid(&self) -> bool {
        match (&self.application, self.request.requested_session_id()) {
            (Some(app), Some(id)) => app.sessions().contains(id),
            _ => false,
        }
    }

    fn add_session_cookie(&mut self, app: &Application, id: &str) {
        let config = app.sessions().config();
        if config.tracks_cookies() {
            let value = config
                .cookie
                .header_value(id, app.context_path(), self.request.is_secure());
            self.response.add_header("Set-Cookie", value);
        }
    }

    /// Appends the session id to `url` when cookie tracking is not available
    /// for this exchange; otherwise returns `url` unchanged.
    ///
    /// Absolute URLs are never rewritten.
    pub fn encode_url(&mut self, url: &str) -> String {
        let Some(app) = self.application.clone() else {
            return url.to_owned();
        };
        let config = app.sessions().config();
        let cookies_work =
            config.tracks_cookies() && self.request.is_requested_session_id_from_cookie();
        if cookies_work || !config.tracks_url() || !tracking::is_relative(url) {
            return url.to_owned();
        }
        match self.session(false) {
            Some(session) => tracking::encode_url(url, &config.url_parameter, session.id()),
            None => url.to_owned(),
        }
    }

    /// Same policy as [`encode_url`](Self::encode_url), for `Location` targets.
    pub fn encode_redirect_url(&mut self, url: &str) -> String {
        self.encode_url(url)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("request", &self.request)
            .field("response", &self.response)
            .field("dispatcher_type", &self.dispatcher_type)
            .field("servlet_name", &self.servlet_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::Application;
    use crate::http::SessionIdSource;
    use crate::servlet::servlet_fn;
    use crate::session::{SessionConfig, TrackingMode};

    fn app(config: SessionConfig) -> Arc<Application> {
        let app = Application::builder("/ctx")
            .servlet("noop", servlet_fn(|_| Ok(())), &["/"])
            .session_config(config)
            .build()
            .unwrap();
        Arc::new(app)
    }

    fn ctx_in(app: &Arc<Application>) -> Context {
        let mut ctx = Context::detached("GET /ctx/page HTTP/1.1");
        ctx.set_application(Arc::clone(app));
        ctx
    }

    #[test]
    fn extensions_round_trip_by_type() {
        let mut ext = Extensions::new();
        assert!(ext.insert(7u32).is_none());
        assert_eq!(ext.insert(8u32), Some(7));
        *ext.get_mut::<u32>().unwrap() += 1;
        assert_eq!(ext.get::<u32>(), Some(&9));
        assert_eq!(ext.remove::<u32>(), Some(9));
        assert!(ext.get::<u32>().is_none());
    }

    #[test]
    fn session_without_create_is_none() {
        let app = app(SessionConfig::default());
        let mut ctx = ctx_in(&app);
        assert!(ctx.session(false).is_none());
    }

    #[test]
    fn creating_a_session_sets_the_cookie() {
        let app = app(SessionConfig::default());
        let mut ctx = ctx_in(&app);
        let session = ctx.session(true).unwrap();
        let cookie = ctx.response().headers().get("set-cookie").unwrap();
        assert!(cookie.starts_with(&format!("JSESSIONID={}", session.id())));
        assert!(cookie.contains("Path=/ctx"));
        // Same session on the next call.
        assert_eq!(ctx.session(true).unwrap().id(), session.id());
    }

    #[test]
    fn requested_session_id_is_honoured() {
        let app = app(SessionConfig::default());
        let existing = app.sessions().create();
        let mut ctx = ctx_in(&app);
        ctx.request_mut()
            .set_requested_session_id(existing.id().to_owned(), SessionIdSource::Cookie);
        assert!(ctx.is_requested_session_id_valid());
        assert_eq!(ctx.session(false).unwrap().id(), existing.id());
    }

    #[test]
    fn change_session_id_rotates_and_reissues_cookie() {
        let app = app(SessionConfig::default());
        let mut ctx = ctx_in(&app);
        let old = ctx.session(true).unwrap();
        old.set_attribute("user", "alice");
        let new_id = ctx.change_session_id().unwrap();
        assert_ne!(new_id, old.id());
        assert!(app.sessions().find(old.id()).is_none());
        let current = ctx.session(false).unwrap();
        assert_eq!(current.id(), new_id);
        assert_eq!(current.attribute("user"), Some("alice".into()));
        assert_eq!(ctx.response().headers().get_all("set-cookie").count(), 2);
    }

    #[test]
    fn encode_url_appends_id_when_cookie_not_proven() {
        let app = app(SessionConfig::default());
        let mut ctx = ctx_in(&app);
        let id = ctx.session(true).unwrap().id().to_owned();
        assert_eq!(ctx.encode_url("/ctx/next?x=1"), format!("/ctx/next;jsessionid={id}?x=1"));
        assert_eq!(ctx.encode_url("http://elsewhere/x"), "http://elsewhere/x");
    }

    #[test]
    fn encode_url_unchanged_when_cookie_tracking_works() {
        let app = app(SessionConfig::default());
        let existing = app.sessions().create();
        let mut ctx = ctx_in(&app);
        ctx.request_mut()
            .set_requested_session_id(existing.id().to_owned(), SessionIdSource::Cookie);
        assert_eq!(ctx.encode_redirect_url("/ctx/next"), "/ctx/next");
    }

    #[test]
    fn encode_url_unchanged_without_url_tracking() {
        let config = SessionConfig {
            tracking_modes: vec![TrackingMode::Cookie],
            ..SessionConfig::default()
        };
        let app = app(config);
        let mut ctx = ctx_in(&app);
        ctx.session(true).unwrap();
        assert_eq!(ctx.encode_url("/ctx/next"), "/ctx/next");
    }

    #[test]
    fn start_async_twice_is_illegal() {
        let mut ctx = Context::detached("GET / HTTP/1.1");
        let handle = ctx.start_async().unwrap();
        assert!(ctx.is_async_started());
        assert!(matches!(ctx.start_async(), Err(ServletError::IllegalState(_))));
        handle.complete();
    }

    #[test]
    fn redirect_sets_location() {
        let mut ctx = Context::detached("GET / HTTP/1.1");
        ctx.response_mut().write_str("draft").unwrap();
        ctx.send_redirect("/login").unwrap();
        assert_eq!(ctx.response().status(), 302);
        assert_eq!(ctx.response().headers().get("location"), Some("/login"));
        assert!(ctx.response().pending_body().is_empty());
    }
}
