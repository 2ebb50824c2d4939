//! Dispatch engine: runs a resolved target through its filter chain with
//! `REQUEST`, `FORWARD`, `INCLUDE`, `ASYNC` or `ERROR` semantics.
//!
//! Forward and include rewrite the request's path state for the duration of
//! the nested dispatch and restore it afterwards, exposing the original (for
//! forward) or the target (for include) paths through request attributes.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::{DispatcherType, FilterChain};
use crate::application::Application;
use crate::context::Context;
use crate::http::{Request, Response, StatusCode};
use crate::router::mapping::MappingMatch;
use crate::servlet::{BoxFuture, ServletError, ServletResult};

pub const FORWARD_REQUEST_URI: &str = "forward.request_uri";
pub const FORWARD_CONTEXT_PATH: &str = "forward.context_path";
pub const FORWARD_SERVLET_PATH: &str = "forward.servlet_path";
pub const FORWARD_PATH_INFO: &str = "forward.path_info";
pub const FORWARD_QUERY_STRING: &str = "forward.query_string";

pub const INCLUDE_REQUEST_URI: &str = "include.request_uri";
pub const INCLUDE_CONTEXT_PATH: &str = "include.context_path";
pub const INCLUDE_SERVLET_PATH: &str = "include.servlet_path";
pub const INCLUDE_PATH_INFO: &str = "include.path_info";
pub const INCLUDE_QUERY_STRING: &str = "include.query_string";

pub const ERROR_STATUS_CODE: &str = "error.status_code";
pub const ERROR_EXCEPTION_TYPE: &str = "error.exception_type";
pub const ERROR_MESSAGE: &str = "error.message";
pub const ERROR_REQUEST_URI: &str = "error.request_uri";
pub const ERROR_SERVLET_NAME: &str = "error.servlet_name";

const INCLUDE_ATTRIBUTES: [&str; 5] = [
    INCLUDE_REQUEST_URI,
    INCLUDE_CONTEXT_PATH,
    INCLUDE_SERVLET_PATH,
    INCLUDE_PATH_INFO,
    INCLUDE_QUERY_STRING,
];

/// Runs the filter chain for `target` and then its servlet.
///
/// The context's dispatcher type and servlet name reflect `target` while the
/// chain runs and are restored afterwards.
pub(crate) async fn invoke(
    ctx: &mut Context,
    app: &Application,
    target: &MappingMatch,
    dispatcher: DispatcherType,
) -> ServletResult {
    let servlet = app
        .servlet(&target.servlet_name)
        .cloned()
        .ok_or_else(|| ServletError::status(StatusCode::NotFound.as_u16()))?;
    let path = format!(
        "{}{}",
        target.servlet_path,
        target.path_info.as_deref().unwrap_or_default()
    );
    let chain = FilterChain::build(app.filters(), &path, &target.servlet_name, dispatcher, servlet);
    debug!(
        servlet = %target.servlet_name,
        %dispatcher,
        filters = chain.remaining(),
        "dispatching"
    );

    let previous_type = ctx.set_dispatcher_type(dispatcher);
    let previous_name = ctx.set_servlet_name(Some(target.servlet_name.clone()));
    let result = chain.do_filter(ctx).await;
    ctx.set_dispatcher_type(previous_type);
    ctx.set_servlet_name(previous_name);
    result
}

fn bound_application(ctx: &Context) -> Result<Arc<Application>, ServletError> {
    ctx.application()
        .cloned()
        .ok_or(ServletError::IllegalState("no application bound to this request"))
}

fn split_query(path: &str) -> (&str, Option<String>) {
    match path.split_once('?') {
        Some((path, query)) => (path, Some(query.to_owned())),
        None => (path, None),
    }
}

fn resolve(app: &Application, path: &str) -> Result<MappingMatch, ServletError> {
    app.map(path).ok_or_else(|| {
        let not_found = StatusCode::NotFound.as_u16();
        ServletError::status_with_message(not_found, format!("no mapping for {path}"))
    })
}

fn set_optional(request: &mut Request, name: &str, value: Option<&str>) {
    match value {
        Some(value) => request.set_attribute(name, value),
        None => {
            request.remove_attribute(name);
        }
    }
}

// Points the request's path state at `target`, reached via the context-relative `path`.
fn retarget(
    request: &mut Request,
    app: &Application,
    path: &str,
    query: Option<String>,
    target: &MappingMatch,
) {
    request.set_request_uri(format!("{}{}", app.context_path(), path));
    if query.is_some() {
        request.set_query(query);
    }
    request.set_servlet_paths(target.servlet_path.clone(), target.path_info.clone());
}

/// Server-side forward to a context-relative `path`.
///
/// Uncommitted output is discarded. The `forward.*` attributes describe the
/// request as it was before the first forward in a chain of forwards.
pub(crate) fn forward<'a>(ctx: &'a mut Context, path: &'a str) -> BoxFuture<'a, ServletResult> {
    Box::pin(async move {
        if ctx.response().is_locked() {
            return Err(ServletError::IllegalState("forward from within an include"));
        }
        ctx.response_mut().reset_buffer()?;
        let app = bound_application(ctx)?;
        let (path, query) = split_query(path);
        let target = resolve(&app, path)?;

        let saved = ctx.request().path_state();
        let first_forward = ctx.request().attribute(FORWARD_REQUEST_URI).is_none();
        let request = ctx.request_mut();
        if first_forward {
            request.set_attribute(FORWARD_REQUEST_URI, saved.request_uri.as_str());
            request.set_attribute(FORWARD_CONTEXT_PATH, app.context_path());
            request.set_attribute(FORWARD_SERVLET_PATH, saved.servlet_path.as_str());
            set_optional(request, FORWARD_PATH_INFO, saved.path_info.as_deref());
            set_optional(request, FORWARD_QUERY_STRING, saved.query.as_deref());
        }
        retarget(request, &app, path, query, &target);

        let result = invoke(ctx, &app, &target, DispatcherType::Forward).await;

        let request = ctx.request_mut();
        request.restore_path_state(saved);
        if first_forward {
            for name in [
                FORWARD_REQUEST_URI,
                FORWARD_CONTEXT_PATH,
                FORWARD_SERVLET_PATH,
                FORWARD_PATH_INFO,
                FORWARD_QUERY_STRING,
            ] {
                request.remove_attribute(name);
            }
        }
        result
    })
}

/// Server-side include of a context-relative `path`.
///
/// The included target sees the includer's paths; its own are exposed through
/// the `include.*` attributes. Status and headers are frozen while it runs.
pub(crate) fn include<'a>(ctx: &'a mut Context, path: &'a str) -> BoxFuture<'a, ServletResult> {
    Box::pin(async move {
        let app = bound_application(ctx)?;
        let (path, query) = split_query(path);
        let target = resolve(&app, path)?;

        let request = ctx.request_mut();
        let saved: Vec<(&str, Option<Value>)> = INCLUDE_ATTRIBUTES
            .iter()
            .map(|name| (*name, request.attribute(name).cloned()))
            .collect();
        request.set_attribute(INCLUDE_REQUEST_URI, format!("{}{}", app.context_path(), path));
        request.set_attribute(INCLUDE_CONTEXT_PATH, app.context_path());
        request.set_attribute(INCLUDE_SERVLET_PATH, target.servlet_path.as_str());
        set_optional(request, INCLUDE_PATH_INFO, target.path_info.as_deref());
        set_optional(request, INCLUDE_QUERY_STRING, query.as_deref());

        let was_locked = ctx.response_mut().set_locked(true);
        let result = invoke(ctx, &app, &target, DispatcherType::Include).await;
        ctx.response_mut().set_locked(was_locked);

        let request = ctx.request_mut();
        for (name, value) in saved {
            match value {
                Some(value) => request.set_attribute(name, value),
                None => {
                    request.remove_attribute(name);
                }
            }
        }
        result
    })
}

/// Continues a deferred request at a context-relative `path` with `ASYNC` semantics.
pub(crate) async fn dispatch_async(ctx: &mut Context, path: &str) -> ServletResult {
    let app = bound_application(ctx)?;
    ctx.response_mut().reset_buffer()?;
    let (path, query) = split_query(path);
    let target = resolve(&app, path)?;
    retarget(ctx.request_mut(), &app, path, query, &target);
    invoke(ctx, &app, &target, DispatcherType::Async).await
}

/// Turns a chain failure into a response.
///
/// Looks up the application's error page by error type, then status code,
/// and dispatches to it with `ERROR` semantics. If there is no page, or the
/// page itself fails, a minimal `text/plain` body is written instead. Once
/// bytes are on the wire nothing can be changed and the error is only logged.
pub(crate) fn handle_error<'a>(ctx: &'a mut Context, error: ServletError) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        let status = error.status_code();
        if ctx.response().is_committed() {
            warn!(status, error = %error, "request failed after the response was committed");
            return;
        }
        if status >= 500 {
            warn!(status, error = %error, uri = ctx.request().request_uri(), "request failed");
        } else {
            debug!(status, error = %error, "request failed");
        }

        ctx.take_async();
        ctx.response_mut().set_locked(false);
        let _ = ctx.response_mut().reset_buffer();
        ctx.response_mut().set_status(status);

        let page = match ctx.application() {
            Some(app) if ctx.dispatcher_type() != DispatcherType::Error => app
                .error_pages()
                .find(error.kind(), status)
                .map(str::to_owned)
                .map(|page| (Arc::clone(app), page)),
            _ => None,
        };

        if let Some((app, page)) = page {
            let (path, query) = split_query(&page);
            match app.map(path) {
                Some(target) => {
                    let dispatched =
                        dispatch_error_page(ctx, &app, path, query, &target, &error).await;
                    match dispatched {
                        Ok(()) => return,
                        Err(nested) => {
                            warn!(page = %page, error = %nested, "error page failed");
                            if ctx.response().is_committed() {
                                return;
                            }
                        }
                    }
                }
                None => warn!(page = %page, "error page is not mapped to a servlet"),
            }
        }

        write_default_error(ctx.response_mut(), status);
    })
}

async fn dispatch_error_page(
    ctx: &mut Context,
    app: &Application,
    path: &str,
    query: Option<String>,
    target: &MappingMatch,
    error: &ServletError,
) -> ServletResult {
    let saved = ctx.request().path_state();
    let servlet_name = ctx.servlet_name().map(str::to_owned);
    let request = ctx.request_mut();
    request.set_attribute(ERROR_STATUS_CODE, error.status_code());
    set_optional(request, ERROR_EXCEPTION_TYPE, error.kind());
    set_optional(request, ERROR_MESSAGE, error.message().as_deref());
    request.set_attribute(ERROR_REQUEST_URI, saved.request_uri.as_str());
    set_optional(request, ERROR_SERVLET_NAME, servlet_name.as_deref());
    retarget(request, app, path, query, target);

    let result = invoke(ctx, app, target, DispatcherType::Error).await;
    ctx.request_mut().restore_path_state(saved);
    result
}

/// Writes the container's own minimal error body: `<code> <reason>`.
pub(crate) fn write_default_error(response: &mut Response, status: u16) {
    let reason = StatusCode::from_u16(status)
        .map(StatusCode::canonical_reason)
        .unwrap_or("Error");
    response.set_status(status);
    response.set_header("Content-Type", "text/plain; charset=utf-8");
    if let Err(e) = response.write_str(&format!("{status} {reason}")) {
        debug!(error = %e, "could not write default error body");
    }
}
