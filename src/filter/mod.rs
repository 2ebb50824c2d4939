//! Filter chains: ordered interceptors in front of a servlet.
//!
//! A chain is assembled per dispatch from the filters whose mappings match
//! the target (by URL pattern or servlet name) *and* the current
//! [`DispatcherType`]. Each filter decides whether to continue by calling
//! [`FilterChain::do_filter`]; not calling it ends the dispatch right there.
//!
//! ## Core types
//!
//! - [`Filter`]: trait implemented by all filters.
//! - [`FilterChain`]: cursor into the remaining filters plus the terminal servlet.
//! - [`FilterMapping`]: which targets and dispatcher types a filter applies to.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::router::mapping::{MappingError, UrlPattern};
use crate::servlet::{BoxFuture, Servlet, ServletResult};

pub mod dispatch;

pub use dispatch::{
    ERROR_EXCEPTION_TYPE, ERROR_MESSAGE, ERROR_REQUEST_URI, ERROR_SERVLET_NAME,
    ERROR_STATUS_CODE, FORWARD_CONTEXT_PATH, FORWARD_PATH_INFO, FORWARD_QUERY_STRING,
    FORWARD_REQUEST_URI, FORWARD_SERVLET_PATH, INCLUDE_CONTEXT_PATH, INCLUDE_PATH_INFO,
    INCLUDE_QUERY_STRING, INCLUDE_REQUEST_URI, INCLUDE_SERVLET_PATH,
};

/// Why a request is being routed to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatcherType {
    Request,
    Forward,
    Include,
    Async,
    Error,
}

impl fmt::Display for DispatcherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request => "REQUEST",
            Self::Forward => "FORWARD",
            Self::Include => "INCLUDE",
            Self::Async => "ASYNC",
            Self::Error => "ERROR",
        })
    }
}

/// Per-filter settings handed to [`Filter::init`].
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub name: String,
    pub context_path: String,
}

/// An interceptor that runs before (and around) a servlet.
///
/// Implementors may:
///
/// - **Pass through**: call `chain.do_filter(ctx).await`.
/// - **Short-circuit**: write a response and return without calling `chain`.
/// - **Decorate**: do work before and after the downstream call.
///
/// # Examples
///
/// ```rust,no_run
/// use servlette::context::Context;
/// use servlette::filter::{Filter, FilterChain};
/// use servlette::servlet::{BoxFuture, ServletResult};
///
/// struct PassThrough;
///
/// impl Filter for PassThrough {
///     fn do_filter<'a>(
///         &'a self,
///         ctx: &'a mut Context,
///         chain: FilterChain,
///     ) -> BoxFuture<'a, ServletResult> {
///         Box::pin(async move { chain.do_filter(ctx).await })
///     }
/// }
/// ```
pub trait Filter: Send + Sync {
    /// Called once when the owning application is initialized.
    fn init(&self, _config: &FilterConfig) -> ServletResult {
        Ok(())
    }

    /// Handles the request and optionally delegates to the rest of the chain.
    fn do_filter<'a>(
        &'a self,
        ctx: &'a mut Context,
        chain: FilterChain,
    ) -> BoxFuture<'a, ServletResult>;

    /// Called once when the owning application is destroyed.
    fn destroy(&self) {}
}

/// What a filter mapping selects on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterTarget {
    Url(UrlPattern),
    Servlet(String),
}

/// One mapping of a filter to targets and dispatcher types.
///
/// A mapping with no explicit dispatcher types applies to `REQUEST` only.
///
/// # Examples
///
/// ```
/// use servlette::filter::{DispatcherType, FilterMapping};
///
/// let mapping = FilterMapping::url("/*")
///     .unwrap()
///     .dispatcher(DispatcherType::Forward)
///     .dispatcher(DispatcherType::Request);
/// assert!(mapping.applies_to(DispatcherType::Forward));
/// assert!(!mapping.applies_to(DispatcherType::Include));
/// ```
#[derive(Debug, Clone)]
pub struct FilterMapping {
    target: FilterTarget,
    dispatchers: HashSet<DispatcherType>,
}

impl FilterMapping {
    /// Maps by URL pattern.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::InvalidPattern`] for an unparseable pattern.
    pub fn url(pattern: &str) -> Result<Self, MappingError> {
        Ok(Self {
            target: FilterTarget::Url(UrlPattern::parse(pattern)?),
            dispatchers: HashSet::new(),
        })
    }

    /// Maps by servlet name.
    pub fn servlet(name: impl Into<String>) -> Self {
        Self {
            target: FilterTarget::Servlet(name.into()),
            dispatchers: HashSet::new(),
        }
    }

    /// Adds a dispatcher type this mapping applies to.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: DispatcherType) -> Self {
        self.dispatchers.insert(dispatcher);
        self
    }

    pub fn target(&self) -> &FilterTarget {
        &self.target
    }

    pub fn applies_to(&self, dispatcher: DispatcherType) -> bool {
        if self.dispatchers.is_empty() {
            dispatcher == DispatcherType::Request
        } else {
            self.dispatchers.contains(&dispatcher)
        }
    }

    /// Returns `true` if this mapping selects the given path/servlet for `dispatcher`.
    pub fn matches(&self, path: &str, servlet_name: &str, dispatcher: DispatcherType) -> bool {
        if !self.applies_to(dispatcher) {
            return false;
        }
        match &self.target {
            FilterTarget::Url(pattern) => pattern.matches(path),
            FilterTarget::Servlet(name) => name == "*" || name == servlet_name,
        }
    }
}

/// A registered filter with its mappings, in declaration order.
#[derive(Clone)]
pub struct FilterRegistration {
    pub name: String,
    pub filter: Arc<dyn Filter>,
    pub mappings: Vec<FilterMapping>,
}

impl FilterRegistration {
    fn selects(&self, path: &str, servlet_name: &str, dispatcher: DispatcherType) -> bool {
        self.mappings
            .iter()
            .any(|m| m.matches(path, servlet_name, dispatcher))
    }
}

/// A cursor into the remaining filters of one dispatch, ending in the servlet.
///
/// `FilterChain` is consumed by [`do_filter`](Self::do_filter), so a filter
/// can advance it at most once.
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
    servlet: Arc<dyn Servlet>,
    position: usize,
}

impl FilterChain {
    /// Creates a chain over `filters` ending in `servlet`.
    pub fn new(filters: Vec<Arc<dyn Filter>>, servlet: Arc<dyn Servlet>) -> Self {
        Self {
            filters,
            servlet,
            position: 0,
        }
    }

    /// Builds the chain for one dispatch: every registration with a mapping that
    /// matches `path`/`servlet_name` for `dispatcher`, in declaration order.
    pub fn build(
        registrations: &[FilterRegistration],
        path: &str,
        servlet_name: &str,
        dispatcher: DispatcherType,
        servlet: Arc<dyn Servlet>,
    ) -> Self {
        let filters = registrations
            .iter()
            .filter(|r| r.selects(path, servlet_name, dispatcher))
            .map(|r| Arc::clone(&r.filter))
            .collect();
        Self::new(filters, servlet)
    }

    /// Number of filters left before the servlet.
    pub fn remaining(&self) -> usize {
        self.filters.len() - self.position
    }

    /// Invokes the next filter, or the servlet once the filters are exhausted.
    pub fn do_filter<'a>(mut self, ctx: &'a mut Context) -> BoxFuture<'a, ServletResult> {
        Box::pin(async move {
            let next = self.filters.get(self.position).cloned();
            match next {
                Some(filter) => {
                    self.position += 1;
                    filter.do_filter(ctx, self).await
                }
                None => self.servlet.service(ctx).await,
            }
        })
    }
}
