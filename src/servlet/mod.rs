//! Servlets: the terminal handlers that a filter chain ends in.
//!
//! A servlet receives the per-request [`Context`] by mutable reference and
//! writes its answer into the response. Failures are returned as
//! [`ServletError`] and routed through the application's error pages.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::context::Context;
use crate::http::response::ResponseCommitted;

/// Boxed future borrowed for the duration of one dispatch.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of a servlet or filter invocation.
pub type ServletResult = Result<(), ServletError>;

/// Failure raised by a filter or servlet.
///
/// `Failure` carries a type tag so error pages can be selected by error type;
/// `Status` is the equivalent of asking the container to send an error code.
#[derive(Debug, Error)]
pub enum ServletError {
    #[error("{code}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Status { code: u16, message: Option<String> },

    #[error("{kind}: {message}")]
    Failure { kind: String, message: String },

    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServletError {
    /// Error that should be answered with `code` (and its error page, if any).
    pub fn status(code: u16) -> Self {
        Self::Status { code, message: None }
    }

    pub fn status_with_message(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: Some(message.into()),
        }
    }

    /// Wraps any error, tagging it with its Rust type name.
    ///
    /// # Examples
    ///
    /// ```
    /// use servlette::servlet::ServletError;
    ///
    /// let err = ServletError::failure("x".parse::<u32>().unwrap_err());
    /// assert_eq!(err.kind(), Some(std::any::type_name::<std::num::ParseIntError>()));
    /// ```
    pub fn failure<E>(error: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self::Failure {
            kind: std::any::type_name::<E>().to_owned(),
            message: error.to_string(),
        }
    }

    /// Failure with an explicit type tag.
    pub fn tagged(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Type tag used for error-page lookup.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Status { .. } => None,
            Self::Failure { kind, .. } => Some(kind),
            Self::IllegalState(_) => Some("IllegalState"),
            Self::Io(_) => Some(std::any::type_name::<std::io::Error>()),
        }
    }

    /// Status code this error maps to when no error page overrides it.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Status { code, .. } => *code,
            _ => 500,
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            Self::Status { message, .. } => message.clone(),
            Self::Failure { message, .. } => Some(message.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl From<ResponseCommitted> for ServletError {
    fn from(_: ResponseCommitted) -> Self {
        Self::IllegalState("response already committed")
    }
}

/// Per-servlet settings handed to [`Servlet::init`].
#[derive(Debug, Clone)]
pub struct ServletConfig {
    pub name: String,
    pub context_path: String,
}

/// A request handler registered with an [`Application`](crate::application::Application).
///
/// # Examples
///
/// ```rust,no_run
/// use servlette::context::Context;
/// use servlette::servlet::{BoxFuture, Servlet, ServletResult};
///
/// struct Hello;
///
/// impl Servlet for Hello {
///     fn service<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ServletResult> {
///         Box::pin(async move {
///             ctx.response_mut().write_str("hello")?;
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait Servlet: Send + Sync {
    /// Called once when the owning application is initialized.
    fn init(&self, _config: &ServletConfig) -> ServletResult {
        Ok(())
    }

    /// Handles one dispatch of a request.
    fn service<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ServletResult>;

    /// Called once when the owning application is destroyed.
    fn destroy(&self) {}
}

/// Adapts a synchronous closure into a [`Servlet`].
pub struct ServletFn<F>(F);

/// Wraps `f` as a servlet.
///
/// # Examples
///
/// ```
/// use servlette::servlet::servlet_fn;
///
/// let servlet = servlet_fn(|ctx| {
///     ctx.response_mut().set_status(204);
///     Ok(())
/// });
/// # let _ = servlet;
/// ```
pub fn servlet_fn<F>(f: F) -> ServletFn<F>
where
    F: Fn(&mut Context) -> ServletResult + Send + Sync + 'static,
{
    ServletFn(f)
}

impl<F> Servlet for ServletFn<F>
where
    F: Fn(&mut Context) -> ServletResult + Send + Sync + 'static,
{
    fn service<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ServletResult> {
        let result = (self.0)(ctx);
        Box::pin(std::future::ready(result))
    }
}
