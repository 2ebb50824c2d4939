//! Request routing: from a parsed request to an application, then to a servlet.
//!
//! Routing runs in two stages:
//!
//! 1. [`ApplicationRegistry::find`] picks the application whose context path
//!    is the longest matching prefix of the request path.
//! 2. The application's [`UrlMapper`](mapping::UrlMapper) picks one servlet by
//!    exact → longest prefix → extension → default precedence.
//!
//! Between the two the router strips matrix parameters, resolves the
//! requested session id (cookie over URL) and consults the application's
//! security hook. Requests that never reach an application (malformed, no
//! matching context, application unavailable) are answered here without
//! running any application code.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::context::{AsyncAction, Context};
use crate::filter::DispatcherType;
use crate::filter::dispatch::{self, handle_error, write_default_error};
use crate::http::{SessionIdSource, StatusCode};
use crate::security::SecurityDecision;
use crate::servlet::ServletError;
use crate::session::tracking::{cookie_value, strip_path_parameters};

pub mod mapping;
mod registry;

pub use registry::{ApplicationRegistry, RegistryError};

/// Routes requests across every deployed application.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<ApplicationRegistry>,
}

impl Router {
    pub fn new(registry: Arc<ApplicationRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ApplicationRegistry> {
        &self.registry
    }

    /// Routes the request and then follows any async continuation until the
    /// exchange is complete or `async_timeout` elapses.
    pub async fn serve(&self, ctx: &mut Context, async_timeout: Duration) {
        self.route(ctx).await;

        while let Some(pending) = ctx.take_async() {
            match tokio::time::timeout(async_timeout, pending).await {
                Ok(Ok(outcome)) => {
                    for (name, value) in outcome.attributes {
                        ctx.request_mut().set_attribute(name, value);
                    }
                    match outcome.action {
                        AsyncAction::Complete => debug!("async request completed"),
                        AsyncAction::Dispatch(path) => {
                            if let Err(e) = dispatch::dispatch_async(ctx, &path).await {
                                handle_error(ctx, e).await;
                            }
                        }
                    }
                }
                Ok(Err(_)) => {
                    warn!(
                        uri = ctx.request().request_uri(),
                        "async context dropped without completing"
                    );
                    let abandoned =
                        ServletError::status_with_message(500, "async request abandoned");
                    handle_error(ctx, abandoned).await;
                }
                Err(_) => {
                    warn!(
                        uri = ctx.request().request_uri(),
                        timeout_ms = async_timeout.as_millis() as u64,
                        "async request timed out"
                    );
                    let timed_out =
                        ServletError::status_with_message(500, "async request timed out");
                    handle_error(ctx, timed_out).await;
                }
            }
        }
    }

    /// Routes one request through its application with `REQUEST` semantics.
    ///
    /// Never fails: every outcome, including protocol and routing errors,
    /// ends up written to the response.
    pub async fn route(&self, ctx: &mut Context) {
        if ctx.request().method().is_none() {
            debug!(target = ctx.request().target(), "malformed request line");
            let response = ctx.response_mut();
            response.set_status(StatusCode::BadRequest.as_u16());
            response.write_headers();
            return;
        }

        let (path, params) = strip_path_parameters(ctx.request().request_uri());
        ctx.request_mut().set_request_uri(path.clone());

        let Some(app) = self.registry.find(&path) else {
            debug!(%path, "no application for path");
            write_default_error(ctx.response_mut(), StatusCode::NotFound.as_u16());
            return;
        };
        ctx.set_application(Arc::clone(&app));
        ctx.request_mut().set_context_path(app.context_path());

        if !app.is_available() {
            debug!(context = %app.display_name(), state = %app.state(), "application unavailable");
            write_default_error(ctx.response_mut(), StatusCode::ServiceUnavailable.as_u16());
            return;
        }

        if ctx.request().requested_session_id().is_none() {
            let config = app.sessions().config();
            let from_cookie = config
                .tracks_cookies()
                .then(|| cookie_value(ctx.request().headers(), &config.cookie.name))
                .flatten()
                .map(|id| (id.to_owned(), SessionIdSource::Cookie));
            let from_url = || {
                config
                    .tracks_url()
                    .then(|| params.iter().find(|(name, _)| *name == config.url_parameter))
                    .flatten()
                    .map(|(_, id)| (id.clone(), SessionIdSource::Url))
            };
            if let Some((id, source)) = from_cookie.or_else(from_url) {
                ctx.request_mut().set_requested_session_id(id, source);
            }
        }

        let security = app.security().cloned();
        if let Some(hook) = &security {
            if let SecurityDecision::Deny { status, challenge } = hook.check(ctx) {
                debug!(status, %path, "request denied by security hook");
                if let Some(challenge) = challenge {
                    ctx.response_mut().set_header("WWW-Authenticate", challenge);
                }
                write_default_error(ctx.response_mut(), status);
                return;
            }
        }

        let relative = ctx.request().context_relative_path().to_owned();
        let result = match app.map(&relative) {
            Some(target) => {
                ctx.request_mut()
                    .set_servlet_paths(target.servlet_path.clone(), target.path_info.clone());
                dispatch::invoke(ctx, &app, &target, DispatcherType::Request).await
            }
            None => Err(ServletError::status_with_message(
                StatusCode::NotFound.as_u16(),
                format!("no servlet mapped for {relative}"),
            )),
        };
        if let Err(e) = result {
            handle_error(ctx, e).await;
        }

        if let Some(hook) = &security {
            hook.after(ctx);
        }
    }
}
